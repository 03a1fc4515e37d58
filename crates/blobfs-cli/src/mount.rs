use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use blobfs_config::{log_cli_info, Config};
use blobfs_fuse::{FuseBackend, MountManager, MountTimeouts, UnmountOutcome};
use blobfs_vfs::BlobFs;
use clap::Args;

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Mount point directory
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Expose the stats directory (same as BLOBFS_TRACK_FS_STATS=1)
    #[arg(long)]
    stats: bool,
}

/// Execute the mount command
pub fn run(args: MountArgs, config: &Config) -> Result<()> {
    let mut config = config.clone();
    if args.stats {
        config.stats.enabled = true;
    }

    let mountpoint = &args.mountpoint;
    if !mountpoint.exists() {
        std::fs::create_dir_all(mountpoint)
            .with_context(|| format!("Failed to create mountpoint: {}", mountpoint.display()))?;
    }

    let store = Arc::new(super::open_store(&config)?);
    let fs = Arc::new(BlobFs::from_config(store, &config).context("Failed to load roots")?);

    tracing::info!("Mounting blobfs...");
    tracing::info!("  Store:      {}", config.storage.store_root.display());
    if let Some(head) = fs.roots_head() {
        tracing::info!("  Roots head: {}", head.display());
    }
    tracing::info!("  Mountpoint: {}", mountpoint.display());
    tracing::info!("  Stats:      {}", config.stats.enabled);

    let backend = FuseBackend::new(Arc::clone(&fs), config.mount.clone());
    let mut manager = MountManager::new(backend, MountTimeouts::from(&config.mount));
    manager
        .mount(mountpoint)
        .with_context(|| format!("Failed to mount at {}", mountpoint.display()))?;

    println!("Mounted at {}. Type q to unmount.", mountpoint.display());
    wait_for_quit(io::stdin().lock())?;

    let outcome = manager.unmount().context("Failed to unmount")?;
    if outcome == UnmountOutcome::Forced {
        tracing::warn!("Unmount was forced; in-flight requests were dropped");
    }

    // Anything the kernel never released gets one last commit attempt.
    let failures = fs.flush_all();
    if !failures.is_empty() {
        anyhow::bail!("{} open file(s) could not be committed", failures.len());
    }
    log_cli_info!("Unmounted", open_handles = fs.open_handles());
    Ok(())
}

/// Block until a `q` line or end of input.
fn wait_for_quit(input: impl BufRead) -> io::Result<()> {
    for line in input.lines() {
        if line?.trim() == "q" {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_wait_for_quit_stops_at_q() {
        let mut input = Cursor::new(b"status\n q \nafter\n".to_vec());
        wait_for_quit(&mut input).unwrap();
        let mut rest = String::new();
        input.read_line(&mut rest).unwrap();
        assert_eq!(rest, "after\n");
    }

    #[test]
    fn test_wait_for_quit_returns_on_eof() {
        wait_for_quit(Cursor::new(Vec::new())).unwrap();
        wait_for_quit(Cursor::new(b"no quit here".to_vec())).unwrap();
    }
}
