//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary blob store roots
//! - Temporary state directories (roots head file)
//! - A scratch mount point
//!
//! # Usage
//!
//! ```ignore
//! use blobfs_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! let config = env.config();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated blob store root
    pub store_root: PathBuf,
    /// Isolated state directory
    pub state_dir: PathBuf,
    /// Scratch mount point directory
    pub mount_point: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let store_root = root.join("store");
        let state_dir = root.join("state");
        let mount_point = root.join(format!("mnt-{}", test_id));

        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&state_dir)?;
        std::fs::create_dir_all(&mount_point)?;

        Ok(Self {
            _temp_dir: temp_dir,
            store_root,
            state_dir,
            mount_point,
            test_id,
        })
    }

    /// Config pointing at this environment, with stats tracking on and
    /// short lifecycle timeouts.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.store_root = self.store_root.clone();
        cfg.storage.state_dir = self.state_dir.clone();
        cfg.stats.enabled = true;
        cfg.mount.mount_timeout_ms = 2_000;
        cfg.mount.unmount_timeout_ms = 2_000;
        cfg.mount.poll_interval_ms = 10;
        cfg
    }

    /// Path of the roots head file inside the state dir.
    pub fn roots_head(&self) -> PathBuf {
        self.state_dir.join("roots.head")
    }

    /// Create a scratch file outside the store with content
    pub fn create_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self._temp_dir.path().join("files").join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.store_root.exists());
        assert!(env.state_dir.exists());
        assert!(env.mount_point.exists());
    }

    #[test]
    fn test_environment_has_unique_mount_point() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.mount_point, env2.mount_point);
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_config_points_into_environment() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.storage.store_root, env.store_root);
        assert!(cfg.stats.enabled);
        assert!(env.roots_head().starts_with(&env.state_dir));
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("notes/a.txt", b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }
}
