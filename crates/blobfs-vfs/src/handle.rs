//! Open handles on mutable files.
//!
//! A handle starts `Clean`, pointing at the committed digest, and serves
//! reads straight from the store. The first mutation materializes the
//! content into a private overlay (`Dirty`). Flush and release commit the
//! overlay: store it as a new blob, then point the file's entry in its
//! root at that blob. A failed commit leaves the handle `Dirty` with its
//! overlay intact.

use blobfs_cas::Digest;
use blobfs_config::{log_vfs_debug, log_vfs_warn};

use crate::clock::unix_secs;
use crate::context::FsContext;
use crate::error::{Result, VfsError};
use crate::stats::{MUTABLE_FILE_COMMIT, MUTABLE_FILE_COMMIT_FAILED, MUTABLE_FILE_OPEN_RO};
use crate::tree::{FileMeta, TreeEntry};
use crate::views::Activity;

/// Upper bound on a single read, whatever the caller asks for.
pub const MAX_READ: usize = 1 << 20;

/// Largest size a mutable file may grow to. Overlays live in memory.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags {
        read: true,
        write: false,
        append: false,
        truncate: false,
    };

    /// Decode `open(2)` flags.
    pub fn from_bits(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }
}

#[derive(Debug)]
pub enum HandleState {
    Clean { digest: Digest, size: u64 },
    Dirty { overlay: Vec<u8> },
    /// Overlay handed to the store; transient while a commit runs.
    Committing { size: u64 },
    Released,
}

impl HandleState {
    pub fn name(&self) -> &'static str {
        match self {
            HandleState::Clean { .. } => "clean",
            HandleState::Dirty { .. } => "dirty",
            HandleState::Committing { .. } => "committing",
            HandleState::Released => "released",
        }
    }
}

#[derive(Debug)]
pub struct MutableHandle {
    fh: u64,
    root: String,
    path: Vec<String>,
    flags: OpenFlags,
    state: HandleState,
    /// Set after the first fast-path read, and once the handle has been
    /// written: only never-written handles count as read-only opens.
    fast_read_counted: bool,
    /// Release was requested but its commit failed.
    release_pending: bool,
}

impl MutableHandle {
    pub(crate) fn open(
        fh: u64,
        root: String,
        path: Vec<String>,
        meta: FileMeta,
        flags: OpenFlags,
    ) -> Self {
        let truncated = flags.write && flags.truncate;
        let state = if truncated {
            HandleState::Dirty {
                overlay: Vec::new(),
            }
        } else {
            HandleState::Clean {
                digest: meta.digest,
                size: meta.size,
            }
        };
        Self {
            fh,
            root,
            path,
            flags,
            state,
            fast_read_counted: truncated,
            release_pending: false,
        }
    }

    pub fn state(&self) -> &HandleState {
        &self.state
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub(crate) fn release_pending(&self) -> bool {
        self.release_pending
    }

    pub(crate) fn mark_release_pending(&mut self) {
        self.release_pending = true;
    }

    /// Point the handle at a renamed location.
    pub(crate) fn relocate(&mut self, root: &str, path: Vec<String>) {
        self.root = root.to_string();
        self.path = path;
    }

    fn display_path(&self) -> String {
        format!("{}/{}", self.root, self.path.join("/"))
    }

    pub fn size(&self) -> u64 {
        match &self.state {
            HandleState::Clean { size, .. } | HandleState::Committing { size } => *size,
            HandleState::Dirty { overlay } => overlay.len() as u64,
            HandleState::Released => 0,
        }
    }

    pub(crate) fn read(&mut self, ctx: &FsContext, offset: u64, size: u32) -> Result<Vec<u8>> {
        match &self.state {
            HandleState::Clean {
                digest,
                size: total,
            } => {
                if !self.fast_read_counted {
                    self.fast_read_counted = true;
                    ctx.stats.increment(MUTABLE_FILE_OPEN_RO);
                }
                let want = clamp_read(*total, offset, size);
                let mut buf = vec![0u8; want];
                if want > 0 {
                    let n = ctx.store.read_at(digest, offset, &mut buf)?;
                    buf.truncate(n);
                }
                Ok(buf)
            }
            HandleState::Dirty { overlay } => {
                let want = clamp_read(overlay.len() as u64, offset, size);
                if want == 0 {
                    return Ok(Vec::new());
                }
                let start = offset as usize;
                Ok(overlay[start..start + want].to_vec())
            }
            HandleState::Committing { .. } | HandleState::Released => {
                Err(VfsError::BadHandle(self.fh))
            }
        }
    }

    /// Move to `Dirty`, copying committed content into the overlay unless
    /// `keep` is zero.
    fn materialize(&mut self, ctx: &FsContext, keep: u64) -> Result<&mut Vec<u8>> {
        if let HandleState::Clean { digest, size } = &self.state {
            let mut overlay = if keep == 0 || *size == 0 {
                Vec::new()
            } else {
                ctx.store.get(digest)?
            };
            overlay.truncate(keep.min(*size) as usize);
            self.fast_read_counted = true;
            log_vfs_debug!(
                "Handle dirty",
                path = self.display_path().as_str(),
                base = tracing::field::display(digest)
            );
            self.state = HandleState::Dirty { overlay };
        }
        match &mut self.state {
            HandleState::Dirty { overlay } => Ok(overlay),
            _ => Err(VfsError::BadHandle(self.fh)),
        }
    }

    pub(crate) fn write(&mut self, ctx: &FsContext, offset: u64, data: &[u8]) -> Result<u32> {
        if !self.flags.write {
            return Err(VfsError::BadHandle(self.fh));
        }
        let append = self.flags.append;
        let start = if append { self.size() } else { offset };
        if !fits(start, data.len() as u64) {
            return Err(VfsError::FileTooLarge(self.display_path()));
        }
        let overlay = self.materialize(ctx, u64::MAX)?;
        let start = if append {
            overlay.len()
        } else {
            start as usize
        };
        let end = start + data.len();
        if overlay.len() < end {
            overlay.resize(end, 0);
        }
        overlay[start..end].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    pub(crate) fn truncate(&mut self, ctx: &FsContext, size: u64) -> Result<()> {
        if !fits(size, 0) {
            return Err(VfsError::FileTooLarge(self.display_path()));
        }
        let overlay = self.materialize(ctx, size)?;
        overlay.resize(size as usize, 0);
        Ok(())
    }

    /// Commit a dirty overlay; no-op when clean.
    pub(crate) fn commit(&mut self, ctx: &FsContext) -> Result<()> {
        let overlay = match std::mem::replace(&mut self.state, HandleState::Released) {
            HandleState::Dirty { overlay } => overlay,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let size = overlay.len() as u64;
        self.state = HandleState::Committing { size };

        match self.publish(ctx, &overlay) {
            Ok(digest) => {
                ctx.stats.increment(MUTABLE_FILE_COMMIT);
                self.state = HandleState::Clean { digest, size };
                Ok(())
            }
            Err(e) => {
                ctx.stats.increment(MUTABLE_FILE_COMMIT_FAILED);
                log_vfs_warn!(
                    "Commit failed, keeping overlay",
                    path = self.display_path().as_str(),
                    error = tracing::field::display(&e)
                );
                self.state = HandleState::Dirty { overlay };
                Err(VfsError::CommitFailed {
                    path: self.display_path(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn publish(&self, ctx: &FsContext, content: &[u8]) -> Result<Digest> {
        let digest = ctx.store.put(content)?;
        let now = ctx.now();
        let meta = FileMeta {
            digest,
            size: content.len() as u64,
            mtime: unix_secs(now),
        };

        let Some((name, parent)) = self.path.split_last() else {
            return Err(VfsError::IsADirectory(self.root.clone()));
        };
        let Some(root) = ctx.roots.get(&self.root) else {
            log_vfs_debug!("Commit target root is gone", path = self.display_path().as_str());
            return Ok(digest);
        };
        let linked = root.apply(ctx.store.as_ref(), now, |tree| {
            let dir = tree.dir_mut(parent)?;
            match dir.get(name) {
                Some(TreeEntry::File(_)) => {
                    dir.insert(name.clone(), TreeEntry::File(meta));
                    Ok(())
                }
                Some(TreeEntry::Dir(_)) => Err(VfsError::IsADirectory(name.clone())),
                None => Err(VfsError::NotFound(name.clone())),
            }
        });
        let applied = match linked {
            Ok(((), applied)) => applied,
            // Removed while open: the blob is stored but stays unlinked.
            Err(e) if e.is_not_found() || matches!(e, VfsError::NotADirectory(_)) => {
                log_vfs_debug!("Commit target was removed", path = self.display_path().as_str());
                return Ok(digest);
            }
            Err(e) => return Err(e),
        };
        ctx.roots.persist_or_revert(&root, applied)?;

        ctx.activity.record(Activity {
            root: self.root.clone(),
            path: self.path.join("/"),
            digest,
            size: meta.size,
            time: now,
        });
        Ok(digest)
    }

    /// Commit if needed, then release. On failure the handle stays `Dirty`.
    pub(crate) fn release(&mut self, ctx: &FsContext) -> Result<()> {
        self.commit(ctx)?;
        self.state = HandleState::Released;
        Ok(())
    }

    /// Drop any uncommitted overlay.
    pub(crate) fn abandon(&mut self) {
        if let HandleState::Dirty { overlay } = &self.state {
            log_vfs_warn!(
                "Abandoning uncommitted data",
                path = self.display_path().as_str(),
                bytes = overlay.len()
            );
        }
        self.state = HandleState::Released;
    }
}

/// Whether `len` bytes at `start` stay within [`MAX_FILE_SIZE`].
fn fits(start: u64, len: u64) -> bool {
    start.checked_add(len).is_some_and(|end| end <= MAX_FILE_SIZE)
}

/// Bytes to read at `offset` from content of length `total`.
pub(crate) fn clamp_read(total: u64, offset: u64, size: u32) -> usize {
    if offset >= total {
        return 0;
    }
    ((total - offset).min(size as u64) as usize).min(MAX_READ)
}
