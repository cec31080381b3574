use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::fuse::mount::MountSettings;
use crate::path::PathResolver;
use crate::writeback::WorkerSettings;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cachefs",
    version,
    about = "Caching overlay filesystem with asynchronous write-back to a slow source tree"
)]
pub struct Args {
    /// Source directory (the slow, authoritative tree)
    #[arg(long)]
    pub src: PathBuf,

    /// Cache directory (the fast, writable tree)
    #[arg(long)]
    pub dst: PathBuf,

    /// Path to mount point
    #[arg(long)]
    pub mountpoint: PathBuf,

    /// Replicate cache mutations back to the source
    #[arg(short = 'w', long)]
    pub writeback: bool,

    /// Attempts per write-back job before giving up
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Replication jobs allowed to run at once
    #[arg(long, default_value_t = 10)]
    pub concurrent: usize,

    /// Debug logging; implies --log
    #[arg(short, long)]
    pub debug: bool,

    /// Comma separated mount options (allow_other, ro, default_permissions, fsname=NAME)
    #[arg(short = 'o')]
    pub options: Option<String>,

    /// Log every replication job at info level
    #[arg(long)]
    pub log: bool,

    /// Seconds to wait between write-back attempts
    #[arg(long, default_value_t = 0)]
    pub retry_delay: u64,

    /// Seconds to wait before the worker starts replicating
    #[arg(long, default_value_t = 0)]
    pub start_delay: u64,

    /// Capacity of the job channel; enqueues beyond it are dropped
    #[arg(long, default_value_t = 64)]
    pub queue_depth: usize,

    /// Jobs the worker may hold back while saturated
    #[arg(long, default_value_t = 1024)]
    pub backlog: usize,

    /// Seconds to wait for running jobs at shutdown
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Mount through fusermount3 instead of mounting directly
    #[arg(long)]
    pub unprivileged: bool,
}

/// What the overlay needs to know.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub source_root: PathBuf,
    pub cache_root: PathBuf,
    pub write_back: bool,
    pub max_attempts: u32,
}

impl OverlayConfig {
    pub fn resolver(&self) -> PathResolver {
        PathResolver::new(&self.source_root, &self.cache_root)
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub overlay: OverlayConfig,
    pub mountpoint: PathBuf,
    pub queue_depth: usize,
    pub worker: WorkerSettings,
    pub mount: MountSettings,
    pub debug: bool,
}

impl Config {
    /// Check the directories and derive settings. The cache root is created
    /// when missing.
    pub fn from_args(args: Args) -> Result<Self> {
        let source_root = existing_dir(&args.src, "source")?;
        fs::create_dir_all(&args.dst)
            .with_context(|| format!("failed to create cache dir {}", args.dst.display()))?;
        let cache_root = existing_dir(&args.dst, "cache")?;
        let mountpoint = existing_dir(&args.mountpoint, "mount point")?;
        if cache_root.starts_with(&source_root) || source_root.starts_with(&cache_root) {
            bail!(
                "source {} and cache {} must not be nested",
                source_root.display(),
                cache_root.display()
            );
        }

        let mut mount = MountSettings {
            unprivileged: args.unprivileged,
            ..MountSettings::default()
        };
        if let Some(raw) = &args.options {
            mount.apply_options(raw);
        }

        Ok(Self {
            overlay: OverlayConfig {
                source_root,
                cache_root,
                write_back: args.writeback,
                max_attempts: args.retries.max(1),
            },
            mountpoint,
            queue_depth: args.queue_depth.max(1),
            worker: WorkerSettings {
                retry_delay: Duration::from_secs(args.retry_delay),
                start_delay: Duration::from_secs(args.start_delay),
                max_concurrent: args.concurrent.max(1),
                diagnostics: args.log || args.debug,
                backlog: args.backlog,
                shutdown_grace: Duration::from_secs(args.shutdown_timeout),
            },
            mount,
            debug: args.debug,
        })
    }
}

fn existing_dir(p: &Path, what: &str) -> Result<PathBuf> {
    let canonical = fs::canonicalize(p)
        .with_context(|| format!("{what} dir {} does not exist", p.display()))?;
    if !canonical.is_dir() {
        bail!("{what} {} is not a directory", p.display());
    }
    Ok(canonical)
}
