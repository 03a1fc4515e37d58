//! Named operation counters exposed under the stats directory.
//!
//! The registry is owned by the filesystem instance and passed to whoever
//! increments, so independent mounts in one process never share counts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Opens of mutable files, any mode.
pub const MUTABLE_FILE_OPEN: &str = "mutable_file_open";
/// Reads served by the read-only fast path (first read on a Clean handle).
pub const MUTABLE_FILE_OPEN_RO: &str = "mutable_file_open_ro";
/// Opens of mutable files requesting write access.
pub const MUTABLE_FILE_OPEN_RW: &str = "mutable_file_open_rw";
pub const MUTABLE_FILE_COMMIT: &str = "mutable_file_commit";
pub const MUTABLE_FILE_COMMIT_FAILED: &str = "mutable_file_commit_failed";
pub const ROOT_CREATED: &str = "root_created";
pub const ROOT_REMOVED: &str = "root_removed";

const BUILTIN: &[&str] = &[
    MUTABLE_FILE_OPEN,
    MUTABLE_FILE_OPEN_RO,
    MUTABLE_FILE_OPEN_RW,
    MUTABLE_FILE_COMMIT,
    MUTABLE_FILE_COMMIT_FAILED,
    ROOT_CREATED,
    ROOT_REMOVED,
];

#[derive(Debug)]
pub struct StatsRegistry {
    enabled: bool,
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
}

impl StatsRegistry {
    /// Registry with the built-in counters at zero.
    ///
    /// When `enabled` is false the counters still count, but the stats
    /// directory is not exposed.
    pub fn new(enabled: bool) -> Self {
        let counters = BUILTIN
            .iter()
            .map(|name| (name.to_string(), Arc::new(AtomicU64::new(0))))
            .collect();
        Self {
            enabled,
            counters: RwLock::new(counters),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Add one to `name`, registering it on first use. Never fails.
    pub fn increment(&self, name: &str) {
        let existing = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        let counter = match existing {
            Some(counter) => counter,
            None => {
                let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
                counters.entry(name.to_string()).or_default().clone()
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value, `None` for a name never registered.
    pub fn snapshot(&self, name: &str) -> Option<u64> {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Registered counter names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// File content for a counter: decimal value and a newline.
    pub fn render(&self, name: &str) -> Option<String> {
        self.snapshot(name).map(|v| format!("{}\n", v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_counters_start_at_zero() {
        let stats = StatsRegistry::new(true);
        assert_eq!(stats.snapshot(MUTABLE_FILE_OPEN_RO), Some(0));
        assert_eq!(stats.names().len(), BUILTIN.len());
        assert_eq!(stats.snapshot("nope"), None);
    }

    #[test]
    fn test_increment_registers_unknown_names() {
        let stats = StatsRegistry::new(false);
        stats.increment("custom");
        stats.increment("custom");
        assert_eq!(stats.snapshot("custom"), Some(2));
        assert!(stats.names().contains(&"custom".to_string()));
        assert!(!stats.enabled());
    }

    #[test]
    fn test_render_format() {
        let stats = StatsRegistry::new(true);
        stats.increment(ROOT_CREATED);
        assert_eq!(stats.render(ROOT_CREATED).unwrap(), "1\n");
        assert!(stats.render("missing").is_none());
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(StatsRegistry::new(true));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.increment(MUTABLE_FILE_COMMIT);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot(MUTABLE_FILE_COMMIT), Some(8000));
    }
}
