//! # blobfs-cas
//!
//! Content-Addressable Storage (CAS) for blobfs.
//!
//! Blobs are immutable byte sequences identified by their SHA-1 [`Digest`].
//! The filesystem engine only talks to the [`BlobStore`] trait; two
//! implementations ship here:
//!
//! - [`CasStore`]: local disk, 3-level fan-out layout
//! - [`MemoryStore`]: in-process, with fault injection for tests
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! └── sha1/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...efgh
//! ```

mod digest;
mod memory;

pub use digest::{Digest, ParseDigestError, DIGEST_HEX_LEN, DIGEST_PREFIX};
pub use memory::MemoryStore;

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

/// SHA-1 hash type (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Errors that can occur during CAS operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {digest}")]
    NotFound { digest: Digest },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Digest, actual: Digest },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl CasError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Content-addressed get/put of immutable blobs.
///
/// Implementations must be idempotent: `put` of identical bytes returns the
/// same digest. Calls may block on I/O.
pub trait BlobStore: Send + Sync {
    /// Fetch a whole blob.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Store `data`, returning its digest.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Whether the blob is present.
    fn contains(&self, digest: &Digest) -> bool;

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read; 0 at or past the end of the blob.
    fn read_at(&self, digest: &Digest, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.get(digest)?;
        Ok(copy_range(&data, offset, buf))
    }

    /// Size of the blob in bytes.
    fn size(&self, digest: &Digest) -> Result<u64> {
        Ok(self.get(digest)?.len() as u64)
    }
}

/// Copy `data[offset..]` into `buf`, returning the count copied.
pub(crate) fn copy_range(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// Content-Addressable Storage store on local disk.
///
/// Stores blobs indexed by their SHA-1 hash with a 2-char prefix fan-out.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    /// Create a new CAS store at the given root directory.
    ///
    /// The directory will be created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the path where a blob with the given digest would be stored.
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        let l1 = &hex[..2];
        let l2 = &hex[2..4];
        self.root.join("sha1").join(l1).join(l2).join(&hex)
    }

    fn open_blob(&self, digest: &Digest) -> Result<File> {
        match File::open(self.blob_path(digest)) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CasError::NotFound { digest: *digest })
            }
            Err(e) => Err(CasError::Io(e)),
        }
    }

    /// Store bytes in the CAS, returning the content digest.
    ///
    /// If the content already exists, this is a no-op (deduplication).
    /// Thread-safe: each writer uses a unique temp file name.
    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub fn store(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically using temp file + rename
        let temp_name = format!(
            "{}.{}.{:?}.tmp",
            digest.to_hex(),
            std::process::id(),
            std::thread::current().id()
        );
        let temp_path = path.with_file_name(&temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            // Another writer won the race with the same content.
            if path.exists() {
                return Ok(digest);
            }
            return Err(CasError::Io(e));
        }

        Ok(digest)
    }

    /// Store a file in the CAS by reading from the filesystem.
    pub fn store_file<P: AsRef<Path>>(&self, path: P) -> Result<Digest> {
        let data = fs::read(path)?;
        self.store(&data)
    }

    /// Retrieve bytes from the CAS by digest, verifying integrity.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut file = self.open_blob(digest)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let actual = Digest::of(&data);
        if actual != *digest {
            return Err(CasError::HashMismatch {
                expected: *digest,
                actual,
            });
        }

        Ok(data)
    }

    /// Check if a blob exists in the CAS.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Get the root path of the CAS.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for CasStore {
    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.load(digest)
    }

    fn put(&self, data: &[u8]) -> Result<Digest> {
        self.store(data)
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.exists(digest)
    }

    /// Ranged read straight from the blob file, never loading it whole.
    #[instrument(skip(self, buf), fields(len = buf.len()), level = "trace")]
    fn read_at(&self, digest: &Digest, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.open_blob(digest)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CasError::Io(e)),
            }
        }
        Ok(filled)
    }

    fn size(&self, digest: &Digest) -> Result<u64> {
        Ok(self.open_blob(digest)?.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let data = b"Hello, blobfs!";
        let digest = cas.put(data).unwrap();

        let retrieved = cas.get(&digest).unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn test_deduplication() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let d1 = cas.put(b"Duplicate content").unwrap();
        let d2 = cas.put(b"Duplicate content").unwrap();
        assert_eq!(d1, d2);
        assert!(cas.contains(&d1));
        assert!(cas.blob_path(&d1).starts_with(cas.root().join("sha1")));
    }

    #[test]
    fn test_not_found() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let missing = Digest::of(b"never stored");
        assert!(matches!(cas.get(&missing), Err(CasError::NotFound { .. })));
        let mut buf = [0u8; 4];
        assert!(cas.read_at(&missing, 0, &mut buf).unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_blob() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let digest = cas.put(b"").unwrap();
        assert!(cas.get(&digest).unwrap().is_empty());
        assert_eq!(cas.size(&digest).unwrap(), 0);
    }

    #[test]
    fn test_read_at_ranges() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();
        let digest = cas.put(b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(cas.read_at(&digest, 3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        assert_eq!(cas.read_at(&digest, 8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        assert_eq!(cas.read_at(&digest, 10, &mut buf).unwrap(), 0);
        assert_eq!(cas.read_at(&digest, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();
        let digest = cas.put(b"original").unwrap();

        fs::write(cas.blob_path(&digest), b"tampered").unwrap();
        assert!(matches!(
            cas.get(&digest),
            Err(CasError::HashMismatch { .. })
        ));
    }
}
