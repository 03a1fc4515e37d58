//! # blobfs-fuse
//!
//! Kernel-facing side of blobfs.
//!
//! - [`FuseAdapter`] maps FUSE requests onto a [`blobfs_vfs::BlobFs`]
//!   (Linux, feature `fuse`).
//! - [`MountManager`] owns a mount point through its lifecycle, with
//!   bounded waits and a forced unmount path.
//! - [`probe`] reads the mount table to decide whether a mount is live.

mod adapter;
pub mod inode;
pub mod lifecycle;
pub mod probe;

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub use adapter::FuseAdapter;
pub use adapter::FuseBackend;
pub use inode::InodeTable;
pub use lifecycle::{
    force_unmount, wait_for, MountBackend, MountError, MountManager, MountState, MountTimeouts,
    UnmountOutcome,
};
