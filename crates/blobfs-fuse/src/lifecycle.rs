//! Mount lifecycle: `Unmounted → Mounting → Mounted → Unmounting → Unmounted`.
//!
//! [`MountManager`] drives a [`MountBackend`] and never trusts it blindly:
//! a mount only counts once the mount table shows it, and an unmount only
//! counts once the mount table stops showing it. When a graceful stop is
//! too slow the mount point is force-unmounted and the adapter killed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use blobfs_config::{log_mount_debug, log_mount_error, log_mount_info, log_mount_warn, MountConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError};

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("already mounted at {}", .0.display())]
    AlreadyMounted(PathBuf),

    #[error("nothing is mounted")]
    NotMounted,

    #[error("mount point is not a directory: {}", .0.display())]
    InvalidMountpoint(PathBuf),

    #[error("mount at {} not visible after {timeout:?}", .path.display())]
    MountTimeout { path: PathBuf, timeout: Duration },

    #[error("{} still mounted after forced unmount ({timeout:?})", .path.display())]
    UnmountTimeout { path: PathBuf, timeout: Duration },

    #[error("forced unmount of {} failed: {reason}", .path.display())]
    ForceUnmount { path: PathBuf, reason: String },

    #[error("FUSE support is not available: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MountError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

/// How an unmount completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    Graceful,
    Forced,
}

/// The adapter side of a mount.
pub trait MountBackend {
    /// Start serving at `mount_point`. The mount may become visible later.
    fn start(&mut self, mount_point: &Path) -> Result<()>;

    /// Ask the adapter to stop. The receiver yields once it has exited.
    fn stop(&mut self) -> Receiver<()>;

    /// Whether the mount table shows `mount_point` backed by this filesystem.
    fn is_mounted(&self, mount_point: &Path) -> bool;

    fn force_unmount(&mut self, mount_point: &Path) -> Result<()>;

    /// Abandon the adapter without waiting for it.
    fn kill(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct MountTimeouts {
    pub mount: Duration,
    pub unmount: Duration,
    pub poll: Duration,
}

impl From<&MountConfig> for MountTimeouts {
    fn from(config: &MountConfig) -> Self {
        Self {
            mount: config.mount_timeout(),
            unmount: config.unmount_timeout(),
            poll: config.poll_interval(),
        }
    }
}

/// Poll `cond` every `interval` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, interval: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

pub struct MountManager<B: MountBackend> {
    backend: B,
    timeouts: MountTimeouts,
    state: MountState,
    mount_point: Option<PathBuf>,
}

impl<B: MountBackend> MountManager<B> {
    pub fn new(backend: B, timeouts: MountTimeouts) -> Self {
        Self {
            backend,
            timeouts,
            state: MountState::Unmounted,
            mount_point: None,
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start the adapter at `path` and wait for the mount to appear.
    pub fn mount(&mut self, path: &Path) -> Result<()> {
        if self.state != MountState::Unmounted {
            let current = self.mount_point.clone().unwrap_or_default();
            return Err(MountError::AlreadyMounted(current));
        }
        if !path.is_dir() {
            return Err(MountError::InvalidMountpoint(path.to_path_buf()));
        }
        // Resolved before mounting; the probe compares against the kernel's path.
        let mount_point = std::fs::canonicalize(path)?;

        self.state = MountState::Mounting;
        log_mount_info!("Mounting", mountpoint = tracing::field::display(mount_point.display()));
        if let Err(e) = self.backend.start(&mount_point) {
            self.state = MountState::Unmounted;
            return Err(e);
        }

        let backend = &self.backend;
        if wait_for(self.timeouts.mount, self.timeouts.poll, || {
            backend.is_mounted(&mount_point)
        }) {
            self.state = MountState::Mounted;
            self.mount_point = Some(mount_point);
            log_mount_info!("Mounted");
            return Ok(());
        }

        log_mount_error!(
            "Mount did not appear",
            mountpoint = tracing::field::display(mount_point.display()),
            timeout_ms = self.timeouts.mount.as_millis() as u64
        );
        if let Err(e) = self.backend.force_unmount(&mount_point) {
            log_mount_debug!("Cleanup unmount failed", error = tracing::field::display(&e));
        }
        self.backend.kill();
        self.state = MountState::Unmounted;
        Err(MountError::MountTimeout {
            path: mount_point,
            timeout: self.timeouts.mount,
        })
    }

    /// Stop the adapter and wait for the mount to disappear, forcing it
    /// when the graceful stop takes longer than the unmount timeout.
    ///
    /// After [`MountError::UnmountTimeout`] the manager stays in
    /// `Unmounting` and `unmount` may be called again.
    pub fn unmount(&mut self) -> Result<UnmountOutcome> {
        let mount_point = match (self.state, &self.mount_point) {
            (MountState::Mounted | MountState::Unmounting, Some(mp)) => mp.clone(),
            _ => return Err(MountError::NotMounted),
        };
        self.state = MountState::Unmounting;
        log_mount_info!("Unmounting", mountpoint = tracing::field::display(mount_point.display()));

        let started = Instant::now();
        let exited = self.backend.stop();
        let stopped = !matches!(
            exited.recv_timeout(self.timeouts.unmount),
            Err(RecvTimeoutError::Timeout)
        );
        if stopped {
            let remaining = self.timeouts.unmount.saturating_sub(started.elapsed());
            let backend = &self.backend;
            if wait_for(remaining, self.timeouts.poll, || {
                !backend.is_mounted(&mount_point)
            }) {
                self.finish_unmount();
                log_mount_info!("Unmounted");
                return Ok(UnmountOutcome::Graceful);
            }
        }

        log_mount_warn!(
            "Graceful unmount too slow, forcing",
            mountpoint = tracing::field::display(mount_point.display())
        );
        for attempt in 1..=2u32 {
            if let Err(e) = self.backend.force_unmount(&mount_point) {
                log_mount_warn!(
                    "Forced unmount failed",
                    attempt = attempt,
                    error = tracing::field::display(&e)
                );
            }
            if attempt == 1 {
                self.backend.kill();
            }
            let backend = &self.backend;
            if wait_for(self.timeouts.unmount, self.timeouts.poll, || {
                !backend.is_mounted(&mount_point)
            }) {
                self.finish_unmount();
                log_mount_info!("Unmounted (forced)", attempt = attempt);
                return Ok(UnmountOutcome::Forced);
            }
        }

        log_mount_error!(
            "Mount point still backed after forced unmount",
            mountpoint = tracing::field::display(mount_point.display())
        );
        Err(MountError::UnmountTimeout {
            path: mount_point,
            timeout: self.timeouts.unmount,
        })
    }

    fn finish_unmount(&mut self) {
        self.state = MountState::Unmounted;
        self.mount_point = None;
    }
}

impl<B: MountBackend> Drop for MountManager<B> {
    fn drop(&mut self) {
        if matches!(self.state, MountState::Mounted | MountState::Unmounting) {
            if let Err(e) = self.unmount() {
                log_mount_error!("Unmount on drop failed", error = tracing::field::display(&e));
            }
        }
    }
}

/// Detach `mount_point` even while requests are in flight.
///
/// Tries `umount2(MNT_FORCE | MNT_DETACH)` first, which needs privileges,
/// then `fusermount -u -z`.
pub fn force_unmount(mount_point: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::mount::{umount2, MntFlags};
        match umount2(mount_point, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
            Ok(()) => return Ok(()),
            Err(e) => log_mount_debug!(
                "umount2 failed, falling back to fusermount",
                error = tracing::field::display(e)
            ),
        }
    }

    let output = Command::new("fusermount")
        .arg("-u")
        .arg("-z")
        .arg(mount_point)
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(MountError::ForceUnmount {
            path: mount_point.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_immediate() {
        let start = Instant::now();
        assert!(wait_for(Duration::from_secs(5), Duration::from_secs(1), || true));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_for_times_out() {
        let start = Instant::now();
        assert!(!wait_for(
            Duration::from_millis(50),
            Duration::from_millis(10),
            || false
        ));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_for_eventually() {
        let mut calls = 0;
        assert!(wait_for(
            Duration::from_secs(5),
            Duration::from_millis(1),
            || {
                calls += 1;
                calls == 3
            }
        ));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_timeouts_from_config() {
        let config = MountConfig {
            mount_timeout_ms: 250,
            unmount_timeout_ms: 750,
            poll_interval_ms: 0,
            ..MountConfig::default()
        };
        let t = MountTimeouts::from(&config);
        assert_eq!(t.mount, Duration::from_millis(250));
        assert_eq!(t.unmount, Duration::from_millis(750));
        assert_eq!(t.poll, Duration::from_millis(1));
    }
}
