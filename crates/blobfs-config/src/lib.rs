//! # blobfs-config
//!
//! Configuration management for blobfs.
//!
//! Loads configuration from:
//! 1. `~/.blobfs/config.toml` (global)
//! 2. `.blobfs/config.toml` (project-local, merged over global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable that opts into filesystem stats tracking.
pub const ENV_TRACK_FS_STATS: &str = "BLOBFS_TRACK_FS_STATS";
/// Environment variable overriding the blob store root.
pub const ENV_STORE: &str = "BLOBFS_STORE";
/// Environment variable overriding the state directory (roots head file).
pub const ENV_STATE_DIR: &str = "BLOBFS_STATE_DIR";
/// Environment variable overriding the log level.
pub const ENV_LOG: &str = "BLOBFS_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub mount: MountConfig,
    pub stats: StatsConfig,
    pub views: ViewsConfig,
    pub log: LogConfig,
    /// Tag name -> root names shown under `tag/<name>/`.
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                merge_tables(&mut table, read_table(&global_path)?);
            }
        }

        let project_path = Path::new(".blobfs/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            merge_tables(&mut table, read_table(project_path)?);
        }

        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a single file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::Value::Table(read_table(path)?).try_into()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: ~/.blobfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".blobfs/config.toml"))
    }

    /// Apply environment variable overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (keeps tests off the real env).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_STORE) {
            self.storage.store_root = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_STATE_DIR) {
            self.storage.state_dir = PathBuf::from(path);
        }
        if let Some(flag) = lookup(ENV_TRACK_FS_STATS) {
            self.stats.enabled = parse_bool_flag(&flag);
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// Recursively merge `overlay` into `base`; overlay scalars and arrays win.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Interpret `1/true/yes/on` (any case) as enabled.
pub fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob store root directory
    pub store_root: PathBuf,
    /// Directory holding the roots head pointer
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("~/.blobfs/store"),
            state_dir: PathBuf::from("~/.blobfs/state"),
        }
    }
}

/// Mount lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name reported to the kernel (`fuse.<fs_name>` in mountinfo)
    pub fs_name: String,
    /// How long mount waits for the mount point to become backed
    pub mount_timeout_ms: u64,
    /// How long unmount waits for a graceful adapter exit
    pub unmount_timeout_ms: u64,
    /// Poll interval for mount table probes
    pub poll_interval_ms: u64,
    /// Pass `allow_other` to the kernel
    pub allow_other: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "blobfs".to_string(),
            mount_timeout_ms: 5_000,
            unmount_timeout_ms: 5_000,
            poll_interval_ms: 100,
            allow_other: false,
        }
    }
}

impl MountConfig {
    pub fn mount_timeout(&self) -> Duration {
        Duration::from_millis(self.mount_timeout_ms)
    }

    pub fn unmount_timeout(&self) -> Duration {
        Duration::from_millis(self.unmount_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Stats tracking (off unless opted in)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
}

/// Synthetic view policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewsConfig {
    /// Maximum number of entries in `recent/`
    pub recent_limit: usize,
    /// Maximum number of activity events remembered for `recent/` and `date/`
    pub activity_capacity: usize,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            recent_limit: 50,
            activity_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error | warn | info | debug | trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.stats.enabled);
        assert_eq!(config.mount.fs_name, "blobfs");
        assert_eq!(config.mount.mount_timeout(), Duration::from_secs(5));
        assert!(config.tags.is_empty());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[mount]"));
        assert!(toml_str.contains("fs_name = \"blobfs\""));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_STORE, "/srv/blobs"),
            (ENV_TRACK_FS_STATS, "1"),
            (ENV_LOG, "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage.store_root, PathBuf::from("/srv/blobs"));
        assert!(config.stats.enabled);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_parse_bool_flag() {
        assert!(parse_bool_flag("1"));
        assert!(parse_bool_flag("TRUE"));
        assert!(parse_bool_flag(" on "));
        assert!(!parse_bool_flag("0"));
        assert!(!parse_bool_flag(""));
        assert!(!parse_bool_flag("nope"));
    }

    #[test]
    fn test_merge_tables_overlay_wins() {
        let mut base: toml::Table = toml::from_str(
            r#"
[mount]
fs_name = "base"
mount_timeout_ms = 100
"#,
        )
        .unwrap();
        let overlay: toml::Table = toml::from_str(
            r#"
[mount]
mount_timeout_ms = 900
"#,
        )
        .unwrap();
        merge_tables(&mut base, overlay);
        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.mount.fs_name, "base");
        assert_eq!(config.mount.mount_timeout_ms, 900);
    }
}
