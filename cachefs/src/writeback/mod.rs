//! Asynchronous, best-effort replication of cache-tree mutations back to
//! the source tree.
//!
//! - `queue`: the non-blocking producer side used by overlay operations.
//! - `running`: admission control over in-flight jobs (the RunningSet).
//! - `worker`: the single coordinator that dispatches, retries and reports.

pub mod queue;
pub mod running;
pub mod worker;

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

pub use queue::JobQueue;
pub use running::{Admission, RunningSet};
pub use worker::{WorkerHandle, WorkerSettings, WorkerStats, spawn_worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobKind {
    /// Copy the cache content over the source target.
    WriteBack,
    /// Remove the source target.
    DeleteBack,
}

/// One replication request. Built inside a mutating overlay operation and
/// consumed at most once by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub kind: JobKind,
    /// Location in the source tree to update.
    pub target: PathBuf,
    /// Location in the cache tree holding the current content. Also the
    /// de-duplication key of the RunningSet.
    pub content: PathBuf,
    pub max_attempts: u32,
}

impl Job {
    pub fn write_back(target: PathBuf, content: PathBuf, max_attempts: u32) -> Self {
        Self {
            kind: JobKind::WriteBack,
            target,
            content,
            max_attempts,
        }
    }

    pub fn delete_back(target: PathBuf, content: PathBuf, max_attempts: u32) -> Self {
        Self {
            kind: JobKind::DeleteBack,
            target,
            content,
            max_attempts,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.target.display())
    }
}

/// Final state of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { attempts: u32 },
    /// Write-back gave up after `attempts` tries.
    Exhausted { attempts: u32, last_error: String },
    /// Delete-back failed; it is never retried.
    Failed { error: String },
}
