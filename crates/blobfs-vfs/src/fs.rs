//! Path-based filesystem operations.
//!
//! [`BlobFs`] is what a protocol adapter drives: every operation takes
//! mount-relative paths or file handles and answers with [`VfsError`]s
//! that map onto errno values. It is safe to call from many threads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use blobfs_cas::{BlobStore, Digest};
use blobfs_config::{log_vfs_debug, log_vfs_error, log_vfs_info, Config};
use dashmap::DashMap;
use tracing::instrument;

use crate::context::{FsContext, FsOptions};
use crate::error::{Result, VfsError};
use crate::handle::{clamp_read, MutableHandle, OpenFlags};
use crate::node::{self, split_path, Attr, Node, ROOTS_DIR};
use crate::root::{Root, RootRegistry};
use crate::stats::{
    StatsRegistry, MUTABLE_FILE_OPEN, MUTABLE_FILE_OPEN_RW, ROOT_CREATED, ROOT_REMOVED,
};
use crate::synth::{self, Listing};
use crate::tree::{validate_name, DirNode, FileMeta, TreeEntry};
use crate::views::ActivityLog;
use crate::welcome::WELCOME_TEXT;

enum Handle {
    Mutable(Mutex<MutableHandle>),
    Blob { digest: Digest, size: u64 },
    Welcome,
    Stat(String),
}

/// Where a path sits relative to the roots container.
enum Place {
    /// `roots/<name>`
    Root(String),
    /// `roots/<name>/<path...>` with a non-empty path.
    InRoot(String, Vec<String>),
    Elsewhere,
}

fn place(parts: &[String]) -> Place {
    match parts {
        [dir, name] if dir == ROOTS_DIR => Place::Root(name.clone()),
        [dir, name, rest @ ..] if dir == ROOTS_DIR => Place::InRoot(name.clone(), rest.to_vec()),
        _ => Place::Elsewhere,
    }
}

pub struct BlobFs {
    ctx: FsContext,
    handles: DashMap<u64, Arc<Handle>>,
    next_fh: AtomicU64,
    /// Held for writing by renames, for reading while a path is turned
    /// into a new handle.
    rename_lock: RwLock<()>,
}

impl BlobFs {
    pub fn new(store: Arc<dyn BlobStore>, options: FsOptions) -> Result<Self> {
        let roots = match options.roots_head {
            Some(head) => RootRegistry::open(Arc::clone(&store), head)?,
            None => RootRegistry::in_memory(Arc::clone(&store)),
        };
        let started = options.clock.now();
        Ok(Self {
            ctx: FsContext {
                store,
                roots,
                stats: Arc::new(StatsRegistry::new(options.stats_enabled)),
                activity: ActivityLog::new(options.activity_capacity),
                recent: options.recent,
                dates: options.dates,
                tags: options.tags,
                clock: options.clock,
                started,
            },
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            rename_lock: RwLock::new(()),
        })
    }

    pub fn from_config(store: Arc<dyn BlobStore>, config: &Config) -> Result<Self> {
        Self::new(store, FsOptions::from_config(config))
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.ctx.stats
    }

    pub fn roots_head(&self) -> Option<PathBuf> {
        self.ctx.roots.head_path().map(PathBuf::from)
    }

    /// Current digest of a root's top directory.
    pub fn root_digest(&self, name: &str) -> Option<Digest> {
        self.ctx.roots.get(name).map(|r| r.digest())
    }

    pub fn resolve(&self, path: &str) -> Result<Node> {
        node::resolve(&self.ctx, &split_path(path))
    }

    pub fn getattr(&self, path: &str) -> Result<Attr> {
        node::attr(&self.ctx, &self.resolve(path)?)
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<Listing>> {
        synth::list(&self.ctx, &self.resolve(path)?)
    }

    fn insert_handle(&self, make: impl FnOnce(u64) -> Handle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, Arc::new(make(fh)));
        fh
    }

    fn handle(&self, fh: u64) -> Result<Arc<Handle>> {
        self.handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or(VfsError::BadHandle(fh))
    }

    fn lock(handle: &Mutex<MutableHandle>) -> MutexGuard<'_, MutableHandle> {
        handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn no_renames(&self) -> RwLockReadGuard<'_, ()> {
        self.rename_lock.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Open `path` with `open(2)` flags, returning a file handle.
    #[instrument(skip(self), level = "debug")]
    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let flags = OpenFlags::from_bits(flags);
        let _paths = self.no_renames();
        let node = self.resolve(path)?;
        if node.is_dir() {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        if flags.write && !matches!(node, Node::MutableFile { .. }) {
            return Err(VfsError::ReadOnly(path.to_string()));
        }
        let fh = match node {
            Node::MutableFile { root, path, meta } => {
                self.ctx.stats.increment(MUTABLE_FILE_OPEN);
                if flags.write {
                    self.ctx.stats.increment(MUTABLE_FILE_OPEN_RW);
                }
                self.insert_handle(|fh| {
                    Handle::Mutable(Mutex::new(MutableHandle::open(fh, root, path, meta, flags)))
                })
            }
            Node::ImmutableFile { digest, size, .. } => {
                self.insert_handle(|_| Handle::Blob { digest, size })
            }
            Node::Welcome => self.insert_handle(|_| Handle::Welcome),
            Node::StatFile(name) => self.insert_handle(|_| Handle::Stat(name)),
            _ => return Err(VfsError::IsADirectory(path.to_string())),
        };
        log_vfs_debug!("Opened", path = path, fh = fh);
        Ok(fh)
    }

    /// Create an empty file inside a root and open it for writing.
    #[instrument(skip(self), level = "debug")]
    pub fn create(&self, path: &str, flags: i32) -> Result<(u64, Attr)> {
        let parts = split_path(path);
        let (root_name, inner) = match place(&parts) {
            Place::InRoot(root, inner) => (root, inner),
            Place::Root(_) => return Err(VfsError::ReadOnly(path.to_string())),
            Place::Elsewhere => return Err(self.refusal(&parts)),
        };
        let Some((name, parent)) = inner.split_last() else {
            return Err(VfsError::InvalidName(path.to_string()));
        };
        validate_name(name)?;
        let _paths = self.no_renames();
        let root = self.root(&root_name)?;

        let now = self.ctx.now();
        let meta = FileMeta {
            digest: self.ctx.store.put(b"")?,
            size: 0,
            mtime: crate::clock::unix_secs(now),
        };
        let ((), applied) = root.apply(self.ctx.store.as_ref(), now, |tree| {
            let dir = tree.dir_mut(parent)?;
            if dir.get(name).is_some() {
                return Err(VfsError::AlreadyExists(name.clone()));
            }
            dir.insert(name.clone(), TreeEntry::File(meta));
            Ok(())
        })?;
        self.ctx.roots.persist_or_revert(&root, applied)?;

        let mut flags = OpenFlags::from_bits(flags);
        flags.write = true;
        self.ctx.stats.increment(MUTABLE_FILE_OPEN);
        self.ctx.stats.increment(MUTABLE_FILE_OPEN_RW);
        let fh = self.insert_handle(|fh| {
            Handle::Mutable(Mutex::new(MutableHandle::open(
                fh,
                root_name.clone(),
                inner.clone(),
                meta,
                flags,
            )))
        });
        log_vfs_debug!("Created", path = path, fh = fh);
        Ok((fh, node::attr(&self.ctx, &self.resolve(path)?)?))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handle(fh)?;
        match handle.as_ref() {
            Handle::Mutable(h) => {
                let mut h = Self::lock(h);
                h.read(&self.ctx, offset, size)
            }
            Handle::Blob { digest, size: total } => {
                let want = clamp_read(*total, offset, size);
                let mut buf = vec![0u8; want];
                if want > 0 {
                    let n = self.ctx.store.read_at(digest, offset, &mut buf)?;
                    buf.truncate(n);
                }
                Ok(buf)
            }
            Handle::Welcome => Ok(slice(WELCOME_TEXT.as_bytes(), offset, size)),
            // Rendered on every read so the value is never stale.
            Handle::Stat(name) => {
                let text = self.ctx.stats.render(name).unwrap_or_default();
                Ok(slice(text.as_bytes(), offset, size))
            }
        }
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let handle = self.handle(fh)?;
        let written = match handle.as_ref() {
            Handle::Mutable(h) => Self::lock(h).write(&self.ctx, offset, data),
            _ => Err(VfsError::BadHandle(fh)),
        };
        written
    }

    /// Commit a dirty handle without releasing it.
    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handle(fh)?;
        let committed = match handle.as_ref() {
            Handle::Mutable(h) => Self::lock(h).commit(&self.ctx),
            _ => Ok(()),
        };
        committed
    }

    /// Commit if needed and forget the handle.
    ///
    /// If the commit fails the handle is kept, still dirty, and the error
    /// is returned; [`BlobFs::retry_pending`] retries it later and
    /// [`BlobFs::abandon`] drops it.
    #[instrument(skip(self), level = "debug")]
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handle(fh)?;
        if let Handle::Mutable(h) = handle.as_ref() {
            let mut h = Self::lock(h);
            if let Err(e) = h.release(&self.ctx) {
                h.mark_release_pending();
                return Err(e);
            }
        }
        self.handles.remove(&fh);
        Ok(())
    }

    /// Drop a handle and any uncommitted data it holds.
    pub fn abandon(&self, fh: u64) -> Result<()> {
        let (_, handle) = self.handles.remove(&fh).ok_or(VfsError::BadHandle(fh))?;
        if let Handle::Mutable(h) = handle.as_ref() {
            Self::lock(h).abandon();
        }
        Ok(())
    }

    /// Open mutable handles, copied out so no map shard stays locked
    /// while a handle lock is taken.
    fn mutable_handles(&self) -> Vec<(u64, Arc<Handle>)> {
        let mut open: Vec<_> = self
            .handles
            .iter()
            .filter(|e| matches!(e.value().as_ref(), Handle::Mutable(_)))
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        open.sort_by_key(|(fh, _)| *fh);
        open
    }

    /// Retry releases whose commit failed. Returns how many remain.
    pub fn retry_pending(&self) -> usize {
        let pending: Vec<u64> = self
            .mutable_handles()
            .into_iter()
            .filter(|(_, handle)| match handle.as_ref() {
                Handle::Mutable(h) => Self::lock(h).release_pending(),
                _ => false,
            })
            .map(|(fh, _)| fh)
            .collect();
        let mut remaining = 0;
        for fh in pending {
            if self.release(fh).is_err() {
                remaining += 1;
            }
        }
        remaining
    }

    /// Commit every dirty handle, open or pending. Returns the failures.
    pub fn flush_all(&self) -> Vec<(u64, VfsError)> {
        let fhs: Vec<u64> = self.handles.iter().map(|e| *e.key()).collect();
        let mut failures = Vec::new();
        for fh in fhs {
            if let Err(e) = self.flush(fh) {
                log_vfs_error!("Flush failed", fh = fh, error = tracing::field::display(&e));
                failures.push((fh, e));
            }
        }
        failures
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Set the size of a mutable file, through `fh` when given.
    #[instrument(skip(self), level = "debug")]
    pub fn truncate(&self, path: &str, fh: Option<u64>, size: u64) -> Result<Attr> {
        if let Some(fh) = fh {
            let handle = self.handle(fh)?;
            if let Handle::Mutable(h) = handle.as_ref() {
                let mut h = Self::lock(h);
                if !h.flags().write {
                    return Err(VfsError::BadHandle(fh));
                }
                h.truncate(&self.ctx, size)?;
                let mut attr = self.getattr(path)?;
                attr.size = h.size();
                return Ok(attr);
            }
        }
        let _paths = self.no_renames();
        let (root, inner, meta) = match self.resolve(path)? {
            Node::MutableFile { root, path, meta } => (root, path, meta),
            n if n.is_dir() => return Err(VfsError::IsADirectory(path.to_string())),
            _ => return Err(VfsError::ReadOnly(path.to_string())),
        };
        let mut flags = OpenFlags::READ_ONLY;
        flags.write = true;
        let mut h = MutableHandle::open(0, root, inner, meta, flags);
        h.truncate(&self.ctx, size)?;
        h.release(&self.ctx)?;
        self.getattr(path)
    }

    /// Create a root (`roots/<name>`) or a directory inside one.
    #[instrument(skip(self), level = "debug")]
    pub fn mkdir(&self, path: &str) -> Result<Attr> {
        let parts = split_path(path);
        match place(&parts) {
            Place::Root(name) => {
                self.ctx.roots.create(&name, self.ctx.now())?;
                self.ctx.stats.increment(ROOT_CREATED);
            }
            Place::InRoot(root_name, inner) => {
                let Some((name, parent)) = inner.split_last() else {
                    return Err(VfsError::InvalidName(path.to_string()));
                };
                validate_name(name)?;
                let root = self.root(&root_name)?;
                let now = self.ctx.now();
                let empty = Arc::new(DirNode::empty(
                    self.ctx.store.as_ref(),
                    crate::clock::unix_secs(now),
                )?);
                let ((), applied) = root.apply(self.ctx.store.as_ref(), now, |tree| {
                    let dir = tree.dir_mut(parent)?;
                    if dir.get(name).is_some() {
                        return Err(VfsError::AlreadyExists(name.clone()));
                    }
                    dir.insert(name.clone(), TreeEntry::Dir(Arc::clone(&empty)));
                    Ok(())
                })?;
                self.ctx.roots.persist_or_revert(&root, applied)?;
            }
            Place::Elsewhere => return Err(self.refusal(&parts)),
        }
        log_vfs_info!("Directory created", path = path);
        self.getattr(path)
    }

    /// Remove an empty root or an empty directory inside one.
    #[instrument(skip(self), level = "debug")]
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let parts = split_path(path);
        match place(&parts) {
            Place::Root(name) => {
                self.ctx.roots.remove(&name)?;
                self.ctx.stats.increment(ROOT_REMOVED);
                Ok(())
            }
            Place::InRoot(root_name, inner) => {
                self.remove_entry(&root_name, &inner, |name, entry| match entry {
                    TreeEntry::Dir(dir) if dir.is_empty() => Ok(()),
                    TreeEntry::Dir(_) => Err(VfsError::NotEmpty(name.to_string())),
                    TreeEntry::File(_) => Err(VfsError::NotADirectory(name.to_string())),
                })
            }
            Place::Elsewhere => Err(self.refusal(&parts)),
        }
    }

    /// Remove a file inside a root.
    #[instrument(skip(self), level = "debug")]
    pub fn unlink(&self, path: &str) -> Result<()> {
        let parts = split_path(path);
        match place(&parts) {
            Place::Root(name) => {
                self.root(&name)?;
                Err(VfsError::IsADirectory(path.to_string()))
            }
            Place::InRoot(root_name, inner) => {
                self.remove_entry(&root_name, &inner, |name, entry| match entry {
                    TreeEntry::File(_) => Ok(()),
                    TreeEntry::Dir(_) => Err(VfsError::IsADirectory(name.to_string())),
                })
            }
            Place::Elsewhere => Err(self.refusal(&parts)),
        }
    }

    fn remove_entry<F>(&self, root_name: &str, inner: &[String], check: F) -> Result<()>
    where
        F: Fn(&str, &TreeEntry) -> Result<()>,
    {
        let Some((name, parent)) = inner.split_last() else {
            return Err(VfsError::InvalidName(root_name.to_string()));
        };
        let root = self.root(root_name)?;
        let ((), applied) = root.apply(self.ctx.store.as_ref(), self.ctx.now(), |tree| {
            let dir = tree.dir_mut(parent)?;
            let entry = dir
                .get(name)
                .ok_or_else(|| VfsError::NotFound(name.clone()))?;
            check(name, entry)?;
            dir.remove(name);
            Ok(())
        })?;
        self.ctx.roots.persist_or_revert(&root, applied)?;
        log_vfs_debug!("Removed", root = root_name, path = inner.join("/").as_str());
        Ok(())
    }

    /// Rename within one root, or rename a root itself.
    ///
    /// Open handles below the source stay locked until they point at the
    /// destination, so no commit can run against the old path.
    #[instrument(skip(self), level = "debug")]
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = split_path(from);
        let dst = split_path(to);
        let _renaming = self.rename_lock.write().unwrap_or_else(|e| e.into_inner());
        match (place(&src), place(&dst)) {
            (Place::Root(a), Place::Root(b)) => {
                let open = self.mutable_handles();
                let mut held = Self::lock_below(&open, &a, &[]);
                self.ctx.roots.rename(&a, &b)?;
                relocate(&mut held, &[], &b, &[]);
                Ok(())
            }
            (Place::InRoot(ra, pa), Place::InRoot(rb, pb)) if ra == rb => {
                let open = self.mutable_handles();
                let mut held = Self::lock_below(&open, &ra, &pa);
                self.rename_in_root(&ra, &pa, &pb)?;
                relocate(&mut held, &pa, &rb, &pb);
                Ok(())
            }
            (_, Place::Elsewhere) => Err(self.refusal(&dst)),
            _ => {
                // Moving across roots needs a copy; EXDEV makes callers do one.
                self.resolve(from)?;
                Err(VfsError::CrossRoot {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }

    fn rename_in_root(&self, root_name: &str, from: &[String], to: &[String]) -> Result<()> {
        let (Some((src_name, src_parent)), Some((dst_name, dst_parent))) =
            (from.split_last(), to.split_last())
        else {
            return Err(VfsError::InvalidName(root_name.to_string()));
        };
        validate_name(dst_name)?;
        if from == to {
            return self.root(root_name)?.snapshot().find(from).map(|_| ());
        }
        let root = self.root(root_name)?;
        let ((), applied) = root.apply(self.ctx.store.as_ref(), self.ctx.now(), |tree| {
            let entry = tree
                .dir(src_parent)?
                .get(src_name)
                .cloned()
                .ok_or_else(|| VfsError::NotFound(src_name.clone()))?;
            if matches!(entry, TreeEntry::Dir(_)) && to.starts_with(from) {
                return Err(VfsError::InvalidName(to.join("/")));
            }
            match (&entry, tree.dir(dst_parent)?.get(dst_name)) {
                (TreeEntry::Dir(_), Some(TreeEntry::File(_))) => {
                    return Err(VfsError::NotADirectory(dst_name.clone()))
                }
                (TreeEntry::File(_), Some(TreeEntry::Dir(_))) => {
                    return Err(VfsError::IsADirectory(dst_name.clone()))
                }
                (TreeEntry::Dir(_), Some(TreeEntry::Dir(d))) if !d.is_empty() => {
                    return Err(VfsError::NotEmpty(dst_name.clone()))
                }
                _ => {}
            }
            tree.dir_mut(src_parent)?.remove(src_name);
            tree.dir_mut(dst_parent)?.insert(dst_name.clone(), entry);
            Ok(())
        })?;
        self.ctx.roots.persist_or_revert(&root, applied)?;
        log_vfs_debug!(
            "Renamed",
            root = root_name,
            from = from.join("/").as_str(),
            to = to.join("/").as_str()
        );
        Ok(())
    }

    /// Lock the handles open at or below `path` in `root`. Locks are taken
    /// in fh order.
    fn lock_below<'a>(
        open: &'a [(u64, Arc<Handle>)],
        root: &str,
        path: &[String],
    ) -> Vec<MutexGuard<'a, MutableHandle>> {
        open.iter()
            .filter_map(|(_, handle)| match handle.as_ref() {
                Handle::Mutable(h) => {
                    let guard = Self::lock(h);
                    (guard.root() == root && guard.path().starts_with(path)).then_some(guard)
                }
                _ => None,
            })
            .collect()
    }

    fn root(&self, name: &str) -> Result<Arc<Root>> {
        self.ctx
            .roots
            .get(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    /// Error for a mutation outside any root: the target's own resolution
    /// error if its parent is missing, read-only otherwise.
    fn refusal(&self, parts: &[String]) -> VfsError {
        let parent = &parts[..parts.len().saturating_sub(1)];
        match node::resolve(&self.ctx, parent) {
            Err(e) => e,
            Ok(n) if !n.is_dir() => VfsError::NotADirectory(parent.join("/")),
            Ok(_) => VfsError::ReadOnly(parts.join("/")),
        }
    }
}

/// Repoint locked handles below `from` so later commits land at `to`.
fn relocate(held: &mut [MutexGuard<'_, MutableHandle>], from: &[String], to_root: &str, to: &[String]) {
    for h in held.iter_mut() {
        let mut moved = to.to_vec();
        moved.extend_from_slice(&h.path()[from.len()..]);
        h.relocate(to_root, moved);
    }
}

fn slice(data: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let want = clamp_read(data.len() as u64, offset, size);
    if want == 0 {
        return Vec::new();
    }
    let start = offset as usize;
    data[start..start + want].to_vec()
}
