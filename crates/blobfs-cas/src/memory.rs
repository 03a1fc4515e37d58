//! In-memory blob store.
//!
//! Used by tests across the workspace and for throwaway mounts. Puts and
//! gets can be made to fail on demand to exercise the engine's
//! store-unavailable paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::{copy_range, BlobStore, CasError, Digest, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Digest, Vec<u8>>>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with [`CasError::Unavailable`].
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `get`/`read_at` fail with [`CasError::Unavailable`].
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Number of whole-blob `get` calls served so far.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read_blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_blobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Digest, Vec<u8>>> {
        // A panicked writer cannot leave a half-inserted blob behind.
        self.blobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn check_gets(&self) -> Result<()> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(CasError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.check_gets()?;
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.read_blobs()
            .get(digest)
            .cloned()
            .ok_or(CasError::NotFound { digest: *digest })
    }

    fn put(&self, data: &[u8]) -> Result<Digest> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(CasError::Unavailable("writes disabled".to_string()));
        }
        let digest = Digest::of(data);
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(digest)
            .or_insert_with(|| data.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(digest)
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.read_blobs().contains_key(digest)
    }

    fn read_at(&self, digest: &Digest, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_gets()?;
        let blobs = self.read_blobs();
        let data = blobs
            .get(digest)
            .ok_or(CasError::NotFound { digest: *digest })?;
        Ok(copy_range(data, offset, buf))
    }

    fn size(&self, digest: &Digest) -> Result<u64> {
        self.read_blobs()
            .get(digest)
            .map(|d| d.len() as u64)
            .ok_or(CasError::NotFound { digest: *digest })
    }
}
