//! In-memory directory tree of a mutable root.
//!
//! Nodes are shared through `Arc` and copied on write with
//! [`Arc::make_mut`], so an edit clones only the directories on the path it
//! touches. Edited directories are flagged dirty; [`DirNode::seal`] writes
//! exactly those back to the store, children first, and refreshes their
//! digests.

use std::collections::BTreeMap;
use std::sync::Arc;

use blobfs_cas::{BlobStore, Digest};

use crate::error::{Result, VfsError};
use crate::schema::{DirectoryRecord, EntryKind, EntryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub digest: Digest,
    pub size: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone)]
pub enum TreeEntry {
    File(FileMeta),
    Dir(Arc<DirNode>),
}

impl TreeEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            TreeEntry::File(_) => EntryKind::File,
            TreeEntry::Dir(_) => EntryKind::Dir,
        }
    }
}

/// Borrowed result of a path lookup.
#[derive(Debug, Clone, Copy)]
pub enum Found<'a> {
    Dir(&'a DirNode),
    File(&'a FileMeta),
}

#[derive(Debug, Clone)]
pub struct DirNode {
    digest: Digest,
    mtime: u64,
    entries: BTreeMap<String, TreeEntry>,
    dirty: bool,
}

impl DirNode {
    /// An empty directory, already written to the store.
    pub fn empty(store: &dyn BlobStore, mtime: u64) -> Result<Self> {
        let mut node = Self {
            digest: Digest::of(b""),
            mtime,
            entries: BTreeMap::new(),
            dirty: true,
        };
        node.seal(store, mtime)?;
        Ok(node)
    }

    /// Load a directory and everything below it.
    ///
    /// A blob that does not decode as a directory is reported as corrupt
    /// rather than treated as empty.
    pub fn load(store: &dyn BlobStore, digest: &Digest, mtime: u64) -> Result<Self> {
        let bytes = store.get(digest)?;
        let record = DirectoryRecord::decode_strict(&bytes, digest)?;
        let mut entries = BTreeMap::new();
        for (name, rec) in record.entries {
            let entry = match rec.kind {
                EntryKind::File => TreeEntry::File(FileMeta {
                    digest: rec.digest,
                    size: rec.size,
                    mtime: rec.mtime,
                }),
                EntryKind::Dir => {
                    TreeEntry::Dir(Arc::new(DirNode::load(store, &rec.digest, rec.mtime)?))
                }
            };
            entries.insert(name, entry);
        }
        Ok(Self {
            digest: *digest,
            mtime,
            entries,
            dirty: false,
        })
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn entries(&self) -> &BTreeMap<String, TreeEntry> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    /// Resolve `path` below this directory. The empty path is `self`.
    pub fn find(&self, path: &[String]) -> Result<Found<'_>> {
        let Some((first, rest)) = path.split_first() else {
            return Ok(Found::Dir(self));
        };
        match self.entries.get(first) {
            None => Err(VfsError::NotFound(first.clone())),
            Some(TreeEntry::Dir(dir)) => dir.find(rest),
            Some(TreeEntry::File(meta)) if rest.is_empty() => Ok(Found::File(meta)),
            Some(TreeEntry::File(_)) => Err(VfsError::NotADirectory(first.clone())),
        }
    }

    pub fn dir(&self, path: &[String]) -> Result<&DirNode> {
        match self.find(path)? {
            Found::Dir(dir) => Ok(dir),
            Found::File(_) => Err(VfsError::NotADirectory(path.join("/"))),
        }
    }

    /// Mutable access to the directory at `path`, marking every directory
    /// on the way dirty.
    pub fn dir_mut(&mut self, path: &[String]) -> Result<&mut DirNode> {
        self.dirty = true;
        let Some((first, rest)) = path.split_first() else {
            return Ok(self);
        };
        match self.entries.get_mut(first) {
            None => Err(VfsError::NotFound(first.clone())),
            Some(TreeEntry::File(_)) => Err(VfsError::NotADirectory(first.clone())),
            Some(TreeEntry::Dir(dir)) => Arc::make_mut(dir).dir_mut(rest),
        }
    }

    pub fn insert(&mut self, name: String, entry: TreeEntry) -> Option<TreeEntry> {
        self.dirty = true;
        self.entries.insert(name, entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        let removed = self.entries.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Write every dirty directory to the store and return this node's digest.
    pub fn seal(&mut self, store: &dyn BlobStore, now: u64) -> Result<Digest> {
        if !self.dirty {
            return Ok(self.digest);
        }
        let mut record = DirectoryRecord::default();
        for (name, entry) in self.entries.iter_mut() {
            let rec = match entry {
                TreeEntry::File(meta) => EntryRecord {
                    kind: EntryKind::File,
                    digest: meta.digest,
                    size: meta.size,
                    mtime: meta.mtime,
                },
                TreeEntry::Dir(dir) => {
                    if dir.dirty {
                        Arc::make_mut(dir).seal(store, now)?;
                    }
                    EntryRecord {
                        kind: EntryKind::Dir,
                        digest: dir.digest,
                        size: 0,
                        mtime: dir.mtime,
                    }
                }
            };
            record.entries.insert(name.clone(), rec);
        }
        self.digest = store.put(&record.encode()?)?;
        self.mtime = now;
        self.dirty = false;
        Ok(self.digest)
    }
}

/// Reject names that cannot be a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(VfsError::InvalidName(name.to_string()));
    }
    Ok(())
}
