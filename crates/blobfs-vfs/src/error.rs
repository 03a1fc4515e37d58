//! Error taxonomy of the filesystem engine.

use blobfs_cas::CasError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("read-only: {0}")]
    ReadOnly(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("rename across roots: {from} -> {to}")]
    CrossRoot { from: String, to: String },

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] CasError),

    #[error("commit failed for {path}: {source}")]
    CommitFailed {
        path: String,
        #[source]
        source: Box<VfsError>,
    },

    #[error("corrupt object {what}: {reason}")]
    Corrupt { what: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CasError> for VfsError {
    fn from(e: CasError) -> Self {
        match e {
            CasError::NotFound { digest } => VfsError::NotFound(digest.to_string()),
            CasError::HashMismatch { expected, actual } => VfsError::Corrupt {
                what: expected.to_string(),
                reason: format!("content hashes to {}", actual),
            },
            other => VfsError::StoreUnavailable(other),
        }
    }
}

impl VfsError {
    /// POSIX errno the protocol adapter should answer with.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::NotADirectory(_) => libc::ENOTDIR,
            VfsError::IsADirectory(_) => libc::EISDIR,
            VfsError::AlreadyExists(_) => libc::EEXIST,
            VfsError::NotEmpty(_) => libc::ENOTEMPTY,
            VfsError::ReadOnly(_) => libc::EROFS,
            VfsError::InvalidName(_) => libc::EINVAL,
            VfsError::CrossRoot { .. } => libc::EXDEV,
            VfsError::FileTooLarge(_) => libc::EFBIG,
            VfsError::BadHandle(_) => libc::EBADF,
            VfsError::StoreUnavailable(_)
            | VfsError::CommitFailed { .. }
            | VfsError::Corrupt { .. }
            | VfsError::Io(_) => libc::EIO,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }

    /// Wrong-type errors (`ENOTDIR`/`EISDIR`), as opposed to a missing entry.
    pub fn is_wrong_type(&self) -> bool {
        matches!(self, VfsError::NotADirectory(_) | VfsError::IsADirectory(_))
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use blobfs_cas::Digest;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(VfsError::NotADirectory("x".into()).errno(), libc::ENOTDIR);
        assert_eq!(
            VfsError::CrossRoot {
                from: "a".into(),
                to: "b".into()
            }
            .errno(),
            libc::EXDEV
        );
        assert_eq!(VfsError::FileTooLarge("x".into()).errno(), libc::EFBIG);
    }

    #[test]
    fn test_store_errors_convert() {
        let missing: VfsError = CasError::NotFound {
            digest: Digest::of(b"gone"),
        }
        .into();
        assert!(missing.is_not_found());

        let down: VfsError = CasError::Unavailable("offline".into()).into();
        assert!(matches!(down, VfsError::StoreUnavailable(_)));
        assert_eq!(down.errno(), libc::EIO);
    }
}
