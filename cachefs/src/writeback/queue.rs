use tokio::sync::mpsc::{self, error::TrySendError};

use super::Job;
use crate::path::{self, PathResolver};

/// Producer side of the replication channel.
///
/// Enqueuing never blocks: when the channel is full or the worker is gone
/// the job is dropped, since replication is best-effort.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: Option<mpsc::Sender<Job>>,
    resolver: PathResolver,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(tx: mpsc::Sender<Job>, resolver: PathResolver, max_attempts: u32) -> Self {
        Self {
            tx: Some(tx),
            resolver,
            max_attempts,
        }
    }

    /// A queue that silently discards everything (write-back disabled).
    pub fn disabled(resolver: PathResolver) -> Self {
        Self {
            tx: None,
            resolver,
            max_attempts: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn write_back(&self, rel: &str) -> bool {
        let job = Job::write_back(
            self.resolver.source_path(rel),
            self.resolver.cache_path(rel),
            self.max_attempts,
        );
        self.submit(rel, job)
    }

    pub fn delete_back(&self, rel: &str) -> bool {
        let job = Job::delete_back(
            self.resolver.source_path(rel),
            self.resolver.cache_path(rel),
            self.max_attempts,
        );
        self.submit(rel, job)
    }

    fn submit(&self, rel: &str, job: Job) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if path::touches_tombstone(rel) {
            return false;
        }
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                debug!("replication queue full, dropping {job}");
                false
            }
            Err(TrySendError::Closed(job)) => {
                debug!("replication worker gone, dropping {job}");
                false
            }
        }
    }
}
