//! State shared by the resolver, the synthesizer and open handles.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use blobfs_cas::BlobStore;
use blobfs_config::path::expand_tilde;
use blobfs_config::Config;

use crate::clock::{Clock, SystemClock};
use crate::root::RootRegistry;
use crate::stats::StatsRegistry;
use crate::views::{ActivityLog, DailyBuckets, DatePolicy, RecentPolicy, RecentWindow};

/// File name of the roots head pointer inside the state directory.
pub const ROOTS_HEAD_FILE: &str = "roots.head";

/// Construction options for [`crate::BlobFs`].
pub struct FsOptions {
    pub stats_enabled: bool,
    /// Roots head file; `None` keeps roots in memory only.
    pub roots_head: Option<PathBuf>,
    pub activity_capacity: usize,
    pub recent: Box<dyn RecentPolicy>,
    pub dates: Box<dyn DatePolicy>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            stats_enabled: false,
            roots_head: None,
            activity_capacity: 1024,
            recent: Box::new(RecentWindow { limit: 50 }),
            dates: Box::new(DailyBuckets),
            tags: BTreeMap::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl FsOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stats_enabled: config.stats.enabled,
            roots_head: Some(expand_tilde(&config.storage.state_dir).join(ROOTS_HEAD_FILE)),
            activity_capacity: config.views.activity_capacity,
            recent: Box::new(RecentWindow {
                limit: config.views.recent_limit,
            }),
            dates: Box::new(DailyBuckets),
            tags: config.tags.clone(),
            clock: Arc::new(SystemClock),
        }
    }
}

pub(crate) struct FsContext {
    pub store: Arc<dyn BlobStore>,
    pub roots: RootRegistry,
    pub stats: Arc<StatsRegistry>,
    pub activity: ActivityLog,
    pub recent: Box<dyn RecentPolicy>,
    pub dates: Box<dyn DatePolicy>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub clock: Arc<dyn Clock>,
    /// Mount time; the mtime of synthetic directories.
    pub started: SystemTime,
}

impl FsContext {
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }
}
