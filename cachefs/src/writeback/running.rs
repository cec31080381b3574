use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::Job;

/// Result of asking the RunningSet to admit a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The concurrency ceiling is reached.
    AtCapacity,
    /// A job for the same content path is already running.
    Busy,
}

/// In-flight replication jobs keyed by content path, bounded by a ceiling.
#[derive(Debug)]
pub struct RunningSet {
    ceiling: usize,
    jobs: Mutex<HashMap<PathBuf, Job>>,
}

impl RunningSet {
    /// A ceiling of zero is raised to one.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<PathBuf, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Record `job` as running if the ceiling allows and nothing else is
    /// running for its content path.
    pub fn try_admit(&self, job: &Job) -> Admission {
        let mut jobs = self.jobs();
        if jobs.len() >= self.ceiling {
            return Admission::AtCapacity;
        }
        if jobs.contains_key(&job.content) {
            return Admission::Busy;
        }
        jobs.insert(job.content.clone(), job.clone());
        Admission::Admitted
    }

    pub fn finish(&self, content: &Path) -> Option<Job> {
        self.jobs().remove(content)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs().len() >= self.ceiling
    }

    /// Copy of the running jobs, ordered by content path.
    pub fn snapshot(&self) -> BTreeMap<String, Job> {
        self.jobs()
            .iter()
            .map(|(k, v)| (k.display().to_string(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(content: &str) -> Job {
        Job::write_back(
            PathBuf::from(format!("/src{content}")),
            PathBuf::from(format!("/cache{content}")),
            1,
        )
    }

    #[test]
    fn test_admit_until_ceiling() {
        let set = RunningSet::new(2);
        assert_eq!(set.try_admit(&job("/a")), Admission::Admitted);
        assert_eq!(set.try_admit(&job("/b")), Admission::Admitted);
        assert!(set.is_full());
        assert_eq!(set.try_admit(&job("/c")), Admission::AtCapacity);

        assert!(set.finish(Path::new("/cache/a")).is_some());
        assert_eq!(set.try_admit(&job("/c")), Admission::Admitted);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_same_content_is_busy() {
        let set = RunningSet::new(4);
        assert_eq!(set.try_admit(&job("/a")), Admission::Admitted);
        assert_eq!(set.try_admit(&job("/a")), Admission::Busy);
        set.finish(Path::new("/cache/a"));
        assert!(set.is_empty());
        assert_eq!(set.try_admit(&job("/a")), Admission::Admitted);
    }

    #[test]
    fn test_zero_ceiling_is_one() {
        let set = RunningSet::new(0);
        assert_eq!(set.ceiling(), 1);
        assert_eq!(set.try_admit(&job("/a")), Admission::Admitted);
        assert_eq!(set.try_admit(&job("/b")), Admission::AtCapacity);
    }

    #[test]
    fn test_snapshot_serializes() {
        let set = RunningSet::new(4);
        set.try_admit(&job("/b"));
        set.try_admit(&job("/a"));
        let snap = set.snapshot();
        let keys: Vec<_> = snap.keys().cloned().collect();
        assert_eq!(keys, vec!["/cache/a".to_string(), "/cache/b".to_string()]);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["/cache/a"]["kind"], "WriteBack");
        assert_eq!(json["/cache/a"]["target"], "/src/a");
    }
}
