// Copyright (C) 2024 rk8s authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use cachefs::CacheFs;
use cachefs::config::{Args, Config};
use cachefs::fuse::CacheFuse;
use cachefs::fuse::mount::mount;
use cachefs::writeback::{JobQueue, spawn_worker};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let cfg = Config::from_args(args).context("invalid configuration")?;
    let resolver = cfg.overlay.resolver();

    let (queue, worker) = if cfg.overlay.write_back {
        let (tx, rx) = mpsc::channel(cfg.queue_depth);
        let worker = spawn_worker(rx, cfg.worker.clone());
        let queue = JobQueue::new(tx, resolver.clone(), cfg.overlay.max_attempts);
        (queue, Some(worker))
    } else {
        (JobQueue::disabled(resolver.clone()), None)
    };
    let fs = CacheFuse::new(CacheFs::new(resolver, queue));

    let mut mount_handle = match mount(fs, &cfg.mountpoint, &cfg.mount).await {
        Ok(handle) => handle,
        Err(e) => {
            if let Some(worker) = worker {
                worker.shutdown().await;
            }
            return Err(e)
                .with_context(|| format!("failed to mount {}", cfg.mountpoint.display()));
        }
    };
    info!(
        "mounted {} (source {}, cache {}, write-back {})",
        cfg.mountpoint.display(),
        cfg.overlay.source_root.display(),
        cfg.overlay.cache_root.display(),
        if cfg.overlay.write_back { "on" } else { "off" },
    );

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut dump = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    let session_ended = loop {
        tokio::select! {
            res = &mut mount_handle => {
                if let Err(e) = res {
                    error!("fuse session failed: {e}");
                }
                break true;
            }
            _ = tokio::signal::ctrl_c() => break false,
            _ = terminate.recv() => break false,
            _ = dump.recv() => match &worker {
                Some(worker) => {
                    if !worker.request_dump() {
                        warn!("replication worker busy, snapshot request dropped");
                    }
                }
                None => println!("{{}}"),
            },
        }
    };

    if !session_ended {
        info!("unmounting {}", cfg.mountpoint.display());
        if let Err(e) = mount_handle.unmount().await {
            error!("unmount failed: {e}");
        }
    }

    if let Some(worker) = worker {
        let stats = worker.shutdown().await;
        info!(
            "replication worker stopped: {}",
            serde_json::to_string(&stats).unwrap_or_default()
        );
    }
    Ok(())
}
