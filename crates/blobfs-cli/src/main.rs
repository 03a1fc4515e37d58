//! # blobfs CLI
//!
//! Mount a blob store as a filesystem, and move single blobs in and out of it.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blobfs_cas::{CasStore, Digest};
use blobfs_config::logging::{init_logging, LogLevel};
use blobfs_config::path::expand_tilde;
use blobfs_config::{log_cli_info, Config};
use clap::{Parser, Subcommand};

mod mount;

/// blobfs - content-addressed blob store as a mountable filesystem
#[derive(Parser)]
#[command(name = "blobfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Blob store root directory (overrides config and BLOBFS_STORE)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Read configuration from this file instead of the standard locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the filesystem; type `q` or close stdin to unmount
    Mount(mount::MountArgs),

    /// Store a file as a blob and print its digest
    Put {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Write a blob to stdout, or to a file
    Get {
        #[arg(value_name = "DIGEST")]
        digest: String,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect or create configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file locations
    Path,
    /// Write a default project config to .blobfs/config.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(store) = &cli.store {
        config.storage.store_root = store.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }

    let level = config.log.level.parse::<LogLevel>().unwrap_or(LogLevel::Info);
    init_logging(level);

    match cli.command {
        Commands::Mount(args) => mount::run(args, &config),
        Commands::Put { file } => put(&config, &file),
        Commands::Get { digest, output } => get(&config, &digest, output.as_deref()),
        Commands::Config { command } => run_config(&config, command),
    }
}

fn open_store(config: &Config) -> Result<CasStore> {
    let root = expand_tilde(&config.storage.store_root);
    CasStore::new(&root).with_context(|| format!("Failed to open blob store: {}", root.display()))
}

fn put(config: &Config, file: &Path) -> Result<()> {
    let store = open_store(config)?;
    let digest = store
        .store_file(file)
        .with_context(|| format!("Failed to store {}", file.display()))?;
    log_cli_info!("Stored blob", file = tracing::field::display(file.display()));
    println!("{}", digest);
    Ok(())
}

fn get(config: &Config, digest: &str, output: Option<&Path>) -> Result<()> {
    let digest: Digest = digest
        .parse()
        .with_context(|| format!("Not a digest: {}", digest))?;
    let store = open_store(config)?;
    let data = store
        .load(&digest)
        .with_context(|| format!("Failed to read blob {}", digest))?;
    match output {
        Some(path) => std::fs::write(path, &data)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => std::io::stdout().lock().write_all(&data)?,
    }
    Ok(())
}

fn run_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("Global:  {}", path.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: .blobfs/config.toml");
        }
        ConfigCommands::Init { force } => {
            let path = Path::new(".blobfs/config.toml");
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            std::fs::create_dir_all(".blobfs")?;
            std::fs::write(path, Config::default_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
