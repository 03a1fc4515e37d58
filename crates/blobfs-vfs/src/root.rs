//! Mutable roots and the registry that names them.
//!
//! A [`Root`] maps its name to the digest of its current top directory.
//! Edits follow an optimistic protocol: snapshot the tree and its
//! generation under the lock, apply the edit and write the changed
//! directory blobs with no lock held, then swap the new tree in only if
//! the generation is unchanged. A lost race retries from a fresh snapshot,
//! so the last swap wins and no blob I/O ever happens under the lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;

use blobfs_cas::{BlobStore, Digest};
use blobfs_config::{log_vfs_debug, log_vfs_info, log_vfs_warn};

use crate::clock::unix_secs;
use crate::error::{Result, VfsError};
use crate::schema::RootIndex;
use crate::tree::{validate_name, DirNode};

#[derive(Debug)]
struct RootState {
    name: String,
    tree: Arc<DirNode>,
    generation: u64,
    /// Set once the root is no longer registered; edits are refused.
    detached: bool,
}

#[derive(Debug)]
pub struct Root {
    state: Mutex<RootState>,
}

/// A published edit, kept so it can be undone if persisting it fails.
#[derive(Debug)]
pub struct Applied {
    previous: Arc<DirNode>,
    generation: u64,
}

impl Root {
    pub fn new(name: impl Into<String>, tree: DirNode) -> Self {
        Self {
            state: Mutex::new(RootState {
                name: name.into(),
                tree: Arc::new(tree),
                generation: 0,
                detached: false,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RootState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current tree. Later edits never change a returned snapshot.
    pub fn snapshot(&self) -> Arc<DirNode> {
        Arc::clone(&self.lock().tree)
    }

    pub fn digest(&self) -> Digest {
        self.lock().tree.digest()
    }

    /// Number of edits applied so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_detached(&self) -> bool {
        self.lock().detached
    }

    fn set_detached(&self, detached: bool) {
        self.lock().detached = detached;
    }

    /// Detach the root if its tree is empty, atomically with respect to
    /// edits. Returns whether it was detached.
    fn detach_if_empty(&self) -> bool {
        let mut state = self.lock();
        if !state.tree.is_empty() {
            return false;
        }
        state.detached = true;
        true
    }

    /// Apply `edit` to the tree and publish the result, returning what
    /// [`Root::revert`] needs to undo it.
    ///
    /// `edit` may run more than once when a concurrent edit wins the race,
    /// always against the latest tree. If it errors, or writing the new
    /// directory blobs fails, the published tree is left as it was. A root
    /// that has been removed or replaced refuses the edit with `NotFound`.
    pub fn apply<T, F>(
        &self,
        store: &dyn BlobStore,
        now: SystemTime,
        mut edit: F,
    ) -> Result<(T, Applied)>
    where
        F: FnMut(&mut DirNode) -> Result<T>,
    {
        let now = unix_secs(now);
        loop {
            let (mut tree, generation) = {
                let state = self.lock();
                if state.detached {
                    return Err(VfsError::NotFound(state.name.clone()));
                }
                (Arc::clone(&state.tree), state.generation)
            };

            let out = edit(Arc::make_mut(&mut tree))?;
            Arc::make_mut(&mut tree).seal(store, now)?;

            let mut state = self.lock();
            if state.detached {
                return Err(VfsError::NotFound(state.name.clone()));
            }
            if state.generation == generation {
                let previous = std::mem::replace(&mut state.tree, tree);
                state.generation += 1;
                let applied = Applied {
                    previous,
                    generation: state.generation,
                };
                return Ok((out, applied));
            }
            let name = state.name.clone();
            drop(state);
            log_vfs_debug!("Root edit raced, retrying", root = name.as_str());
        }
    }

    /// Undo `applied` unless another edit has been published since.
    /// Returns whether the tree was restored.
    pub fn revert(&self, applied: Applied) -> bool {
        let mut state = self.lock();
        if state.generation != applied.generation {
            return false;
        }
        state.tree = applied.previous;
        state.generation += 1;
        true
    }
}

/// Name → root mapping, optionally persisted through a head file.
///
/// The head file holds the digest of a [`RootIndex`] blob on one line and
/// is replaced atomically on every persist.
pub struct RootRegistry {
    store: Arc<dyn BlobStore>,
    head: Option<PathBuf>,
    roots: RwLock<BTreeMap<String, Arc<Root>>>,
    persist_lock: Mutex<()>,
}

impl RootRegistry {
    /// Registry with no roots and no persistence.
    pub fn in_memory(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            head: None,
            roots: RwLock::new(BTreeMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Registry persisted at `head`, loading the roots it names if it exists.
    pub fn open(store: Arc<dyn BlobStore>, head: PathBuf) -> Result<Self> {
        let mut roots = BTreeMap::new();
        if head.exists() {
            let text = fs::read_to_string(&head)?;
            let line = text.trim();
            let digest = Digest::parse_ref(line).ok_or_else(|| VfsError::Corrupt {
                what: head.display().to_string(),
                reason: format!("bad head digest {:?}", line),
            })?;
            let index = RootIndex::decode(&store.get(&digest)?, &digest)?;
            for (name, root_digest) in index.roots {
                let tree = DirNode::load(store.as_ref(), &root_digest, 0)?;
                roots.insert(name.clone(), Arc::new(Root::new(name, tree)));
            }
            log_vfs_info!(
                "Loaded roots",
                count = roots.len(),
                head = tracing::field::display(head.display())
            );
        }
        Ok(Self {
            store,
            head: Some(head),
            roots: RwLock::new(roots),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn head_path(&self) -> Option<&Path> {
        self.head.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Root>> {
        self.read().get(name).cloned()
    }

    /// Root names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Root>>> {
        self.roots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Root>>> {
        self.roots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an empty root.
    pub fn create(&self, name: &str, now: SystemTime) -> Result<Arc<Root>> {
        validate_name(name)?;
        if self.read().contains_key(name) {
            return Err(VfsError::AlreadyExists(name.to_string()));
        }
        let tree = DirNode::empty(self.store.as_ref(), unix_secs(now))?;
        let root = Arc::new(Root::new(name, tree));
        {
            let mut roots = self.write();
            if roots.contains_key(name) {
                return Err(VfsError::AlreadyExists(name.to_string()));
            }
            roots.insert(name.to_string(), Arc::clone(&root));
        }
        if let Err(e) = self.persist() {
            self.write().remove(name);
            root.set_detached(true);
            return Err(e);
        }
        log_vfs_info!("Root created", root = name);
        Ok(root)
    }

    /// Remove an empty root.
    pub fn remove(&self, name: &str) -> Result<()> {
        let removed = {
            let mut roots = self.write();
            let root = roots
                .get(name)
                .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
            if !root.detach_if_empty() {
                return Err(VfsError::NotEmpty(name.to_string()));
            }
            roots.remove(name)
        };
        if let Err(e) = self.persist() {
            if let Some(root) = removed {
                root.set_detached(false);
                self.write().insert(name.to_string(), root);
            }
            return Err(e);
        }
        log_vfs_info!("Root removed", root = name);
        Ok(())
    }

    /// Rename a root. An existing empty target is replaced.
    ///
    /// The same [`Root`] moves to the new name, so edits already holding
    /// it keep landing in the live tree.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_name(to)?;
        if from == to {
            return self.get(from).map(|_| ()).ok_or_else(|| VfsError::NotFound(from.into()));
        }
        let (source, replaced) = {
            let mut roots = self.write();
            if !roots.contains_key(from) {
                return Err(VfsError::NotFound(from.to_string()));
            }
            if let Some(existing) = roots.get(to) {
                if !existing.detach_if_empty() {
                    return Err(VfsError::NotEmpty(to.to_string()));
                }
            }
            let source = roots
                .remove(from)
                .ok_or_else(|| VfsError::NotFound(from.to_string()))?;
            let replaced = roots.insert(to.to_string(), Arc::clone(&source));
            source.lock().name = to.to_string();
            (source, replaced)
        };
        if let Err(e) = self.persist() {
            let mut roots = self.write();
            roots.remove(to);
            if let Some(replaced) = replaced {
                replaced.set_detached(false);
                roots.insert(to.to_string(), replaced);
            }
            source.lock().name = from.to_string();
            roots.insert(from.to_string(), source);
            return Err(e);
        }
        log_vfs_info!("Root renamed", from = from, to = to);
        Ok(())
    }

    /// Persist after `applied` was published to `root`, undoing the edit
    /// if persisting fails. The persist error is returned either way.
    pub fn persist_or_revert(&self, root: &Root, applied: Applied) -> Result<()> {
        let Err(e) = self.persist() else {
            return Ok(());
        };
        let name = root.name();
        if root.revert(applied) {
            log_vfs_warn!(
                "Persisting roots failed, edit undone",
                root = name.as_str(),
                error = tracing::field::display(&e)
            );
        } else {
            log_vfs_warn!(
                "Persisting roots failed after a later edit; change kept in memory",
                root = name.as_str(),
                error = tracing::field::display(&e)
            );
        }
        Err(e)
    }

    /// Write the current name → digest mapping and move the head file to it.
    ///
    /// Returns the index digest, or `None` for an in-memory registry.
    pub fn persist(&self) -> Result<Option<Digest>> {
        let Some(head) = &self.head else {
            return Ok(None);
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let index = RootIndex {
            roots: self
                .read()
                .iter()
                .map(|(name, root)| (name.clone(), root.digest()))
                .collect(),
        };
        let digest = self.store.put(&index.encode()?)?;
        write_head(head, &digest)?;
        log_vfs_debug!("Roots persisted", index = tracing::field::display(&digest));
        Ok(Some(digest))
    }
}

fn write_head(head: &Path, digest: &Digest) -> Result<()> {
    if let Some(parent) = head.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = head.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, format!("{}\n", digest))?;
    fs::rename(&tmp, head)?;
    Ok(())
}
