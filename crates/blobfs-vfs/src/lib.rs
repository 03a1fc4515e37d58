//! # blobfs-vfs
//!
//! The filesystem engine behind a blobfs mount, independent of the kernel
//! protocol: node resolution, mutable roots with copy-on-write directory
//! trees, open-file handles with a read-only fast path, synthetic
//! directory views, and operation counters.

pub mod clock;
mod context;
pub mod error;
mod fs;
pub mod handle;
pub mod node;
pub mod root;
pub mod schema;
pub mod stats;
pub mod synth;
pub mod tree;
pub mod views;
mod welcome;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{FsOptions, ROOTS_HEAD_FILE};
pub use error::{Result, VfsError};
pub use fs::BlobFs;
pub use handle::{HandleState, OpenFlags};
pub use node::{Attr, Node};
pub use schema::EntryKind;
pub use stats::StatsRegistry;
pub use synth::Listing;
pub use welcome::WELCOME_TEXT;
