use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;

use super::{Admission, Job, JobKind, JobOutcome, RunningSet};
use crate::loader::copy_tree;

// Per-job progress goes to `info` only when diagnostics are on.
macro_rules! diag {
    ($on:expr, $($arg:tt)+) => {
        if $on {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Pause between two write-back attempts of the same job.
    pub retry_delay: Duration,
    /// Pause before the worker starts draining the queue.
    pub start_delay: Duration,
    /// Concurrency ceiling; zero is treated as one.
    pub max_concurrent: usize,
    pub diagnostics: bool,
    /// Capacity of the deferred-job backlog. Zero drops every job that
    /// cannot run immediately.
    pub backlog: usize,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            max_concurrent: 10,
            diagnostics: false,
            backlog: 1024,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Counters returned when the worker stops.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub failed: u64,
    pub deferred: u64,
    pub coalesced: u64,
    pub dropped: u64,
    /// Jobs left in the backlog or queue at shutdown.
    pub abandoned: u64,
    /// In-flight jobs cut off when the shutdown grace period ran out.
    pub aborted: u64,
}

struct DumpRequest {
    reply: Option<oneshot::Sender<String>>,
}

/// Control surface of a running replication worker.
pub struct WorkerHandle {
    dumps: mpsc::Sender<DumpRequest>,
    cancel: CancellationToken,
    running: Arc<RunningSet>,
    join: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Ask the worker to print its RunningSet to stdout. Never blocks.
    pub fn request_dump(&self) -> bool {
        self.dumps.try_send(DumpRequest { reply: None }).is_ok()
    }

    /// Like [`request_dump`](Self::request_dump), but also returns the JSON.
    pub async fn snapshot(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.dumps.send(DumpRequest { reply: Some(tx) }).await.ok()?;
        rx.await.ok()
    }

    pub fn running(&self) -> &Arc<RunningSet> {
        &self.running
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the worker and wait for its loop to exit.
    pub async fn shutdown(self) -> WorkerStats {
        self.cancel.cancel();
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("replication worker terminated abnormally: {e}");
                WorkerStats::default()
            }
        }
    }
}

/// Start the replication worker on the current tokio runtime.
pub fn spawn_worker(jobs: mpsc::Receiver<Job>, settings: WorkerSettings) -> WorkerHandle {
    let (dump_tx, dump_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let running = Arc::new(RunningSet::new(settings.max_concurrent));
    let worker = Worker {
        jobs,
        jobs_open: true,
        dumps: dump_rx,
        cancel: cancel.clone(),
        running: running.clone(),
        backlog: VecDeque::new(),
        tasks: JoinSet::new(),
        stats: WorkerStats::default(),
        settings,
    };
    let join = tokio::spawn(worker.run());
    WorkerHandle {
        dumps: dump_tx,
        cancel,
        running,
        join,
    }
}

struct Worker {
    jobs: mpsc::Receiver<Job>,
    jobs_open: bool,
    dumps: mpsc::Receiver<DumpRequest>,
    cancel: CancellationToken,
    running: Arc<RunningSet>,
    backlog: VecDeque<Job>,
    tasks: JoinSet<JobOutcome>,
    stats: WorkerStats,
    settings: WorkerSettings,
}

/// Frees the RunningSet slot when the job task ends, aborted or not.
struct Slot {
    running: Arc<RunningSet>,
    content: PathBuf,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.running.finish(&self.content);
    }
}

impl Worker {
    async fn run(mut self) -> WorkerStats {
        if !self.settings.start_delay.is_zero() {
            tokio::select! {
                _ = sleep(self.settings.start_delay) => {}
                _ = self.cancel.cancelled() => return self.stop().await,
            }
        }
        info!(
            "replication worker started (max {} concurrent jobs)",
            self.running.ceiling()
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.record(joined);
                    self.pump_backlog();
                }
                Some(req) = self.dumps.recv() => self.dump(req),
                job = self.jobs.recv(), if self.jobs_open => match job {
                    Some(job) => self.on_job(job),
                    None => {
                        debug!("replication queue closed");
                        self.jobs_open = false;
                    }
                },
                else => break,
            }
            if !self.jobs_open && self.tasks.is_empty() && self.backlog.is_empty() {
                break;
            }
        }
        self.stop().await
    }

    fn on_job(&mut self, job: Job) {
        match self.running.try_admit(&job) {
            Admission::Admitted => self.dispatch(job),
            refused => self.defer(job, refused),
        }
    }

    /// Spawn a job that has already been admitted to the RunningSet.
    fn dispatch(&mut self, job: Job) {
        let slot = Slot {
            running: self.running.clone(),
            content: job.content.clone(),
        };
        let retry_delay = self.settings.retry_delay;
        let diagnostics = self.settings.diagnostics;
        self.stats.dispatched += 1;
        self.tasks.spawn(async move {
            let _slot = slot;
            run_job(&job, retry_delay, diagnostics).await
        });
    }

    fn defer(&mut self, job: Job, reason: Admission) {
        if self.backlog.contains(&job) {
            self.stats.coalesced += 1;
            debug!("coalesced pending {job}");
            return;
        }
        if self.backlog.len() >= self.settings.backlog {
            self.stats.dropped += 1;
            warn!(
                "replication backlog full ({} jobs), dropping {job}",
                self.backlog.len()
            );
            return;
        }
        diag!(self.settings.diagnostics, "deferring {job} ({reason:?})");
        self.stats.deferred += 1;
        self.backlog.push_back(job);
    }

    /// Dispatch backlog jobs, oldest first, while the RunningSet admits them.
    fn pump_backlog(&mut self) {
        let mut i = 0;
        while i < self.backlog.len() && !self.running.is_full() {
            if self.running.try_admit(&self.backlog[i]) == Admission::Admitted {
                if let Some(job) = self.backlog.remove(i) {
                    self.dispatch(job);
                }
            } else {
                i += 1;
            }
        }
    }

    fn record(&mut self, joined: Result<JobOutcome, JoinError>) {
        match joined {
            Ok(JobOutcome::Succeeded { .. }) => self.stats.succeeded += 1,
            Ok(JobOutcome::Exhausted { .. }) => self.stats.exhausted += 1,
            Ok(JobOutcome::Failed { .. }) => self.stats.failed += 1,
            Err(e) if e.is_cancelled() => self.stats.aborted += 1,
            Err(e) => {
                self.stats.failed += 1;
                error!("replication task panicked: {e}");
            }
        }
    }

    fn dump(&mut self, req: DumpRequest) {
        let snapshot = self.running.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                println!("{json}");
                if let Some(reply) = req.reply {
                    let _ = reply.send(json);
                }
            }
            Err(e) => error!("failed to serialize replication state: {e}"),
        }
    }

    /// Stop accepting work, give in-flight jobs the grace period, then abort
    /// whatever is left. Backlogged and queued jobs are abandoned.
    async fn stop(mut self) -> WorkerStats {
        self.jobs.close();
        let mut abandoned = self.backlog.len() as u64;
        self.backlog.clear();
        while self.jobs.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!("abandoning {abandoned} pending replication jobs");
        }
        self.stats.abandoned += abandoned;

        if !self.tasks.is_empty() {
            info!(
                "waiting up to {:?} for {} replication jobs",
                self.settings.shutdown_grace,
                self.tasks.len()
            );
        }
        let deadline = Instant::now() + self.settings.shutdown_grace;
        while !self.tasks.is_empty() {
            match timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.record(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!("aborting {} replication jobs", self.tasks.len());
                    self.tasks.abort_all();
                    while let Some(joined) = self.tasks.join_next().await {
                        self.record(joined);
                    }
                }
            }
        }
        info!("replication worker stopped: {:?}", self.stats);
        self.stats
    }
}

/// Execute one job to completion.
pub async fn run_job(job: &Job, retry_delay: Duration, diagnostics: bool) -> JobOutcome {
    match job.kind {
        JobKind::WriteBack => write_back(job, retry_delay, diagnostics).await,
        JobKind::DeleteBack => delete_back(job, diagnostics).await,
    }
}

async fn write_back(job: &Job, retry_delay: Duration, diagnostics: bool) -> JobOutcome {
    let max_attempts = job.max_attempts.max(1);
    diag!(diagnostics, "attempting write-back of {}", job.content.display());

    let mut attempts = 0;
    loop {
        attempts += 1;
        match copy_to_source(&job.content, &job.target).await {
            Ok(()) => {
                diag!(diagnostics, "wrote back {} after {attempts} attempt(s)", job.target.display());
                return JobOutcome::Succeeded { attempts };
            }
            Err(e) if attempts >= max_attempts => {
                diag!(
                    diagnostics,
                    "giving up write-back of {} after {attempts} attempt(s): {e}",
                    job.target.display()
                );
                return JobOutcome::Exhausted {
                    attempts,
                    last_error: e.to_string(),
                };
            }
            Err(e) => {
                debug!(
                    "write-back attempt {attempts}/{max_attempts} of {} failed: {e}",
                    job.target.display()
                );
                if !retry_delay.is_zero() {
                    sleep(retry_delay).await;
                }
            }
        }
    }
}

async fn copy_to_source(content: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let meta = tokio::fs::metadata(content).await?;
    if meta.is_dir() {
        let (from, to) = (content.to_path_buf(), target.to_path_buf());
        return tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(io::Error::other)?;
    }

    let mut src = tokio::fs::File::open(content).await?;
    let mut dst = tokio::fs::File::create(target).await?;
    tokio::io::copy(&mut src, &mut dst).await?;
    dst.flush().await?;
    tokio::fs::set_permissions(target, meta.permissions()).await
}

async fn delete_back(job: &Job, diagnostics: bool) -> JobOutcome {
    diag!(diagnostics, "attempting delete of {} on source", job.target.display());
    let res = match tokio::fs::symlink_metadata(&job.target).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&job.target).await,
        Ok(_) => tokio::fs::remove_file(&job.target).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => {
            diag!(diagnostics, "deleted {} on source", job.target.display());
            JobOutcome::Succeeded { attempts: 1 }
        }
        Err(e) => {
            diag!(diagnostics, "failed to delete {} on source: {e}", job.target.display());
            JobOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}
