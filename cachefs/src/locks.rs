use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_STRIPES: usize = 64;

/// Striped mutexes keyed by relative path. Two mutations of the same path
/// never run at once; unrelated paths only contend on a hash collision.
#[derive(Debug)]
pub struct PathLocks {
    stripes: Vec<Mutex<()>>,
}

pub struct PathGuard<'a> {
    _first: MutexGuard<'a, ()>,
    _second: Option<MutexGuard<'a, ()>>,
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }
}

impl PathLocks {
    pub fn with_stripes(n: usize) -> Self {
        let n = n.max(1);
        Self {
            stripes: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, rel: &str) -> usize {
        let mut h = DefaultHasher::new();
        rel.hash(&mut h);
        (h.finish() as usize) % self.stripes.len()
    }

    fn acquire(&self, idx: usize) -> MutexGuard<'_, ()> {
        self.stripes[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock(&self, rel: &str) -> PathGuard<'_> {
        PathGuard {
            _first: self.acquire(self.stripe(rel)),
            _second: None,
        }
    }

    /// Lock two paths, always in stripe order so concurrent renames in
    /// opposite directions cannot deadlock.
    pub fn lock_pair(&self, a: &str, b: &str) -> PathGuard<'_> {
        let (x, y) = (self.stripe(a), self.stripe(b));
        if x == y {
            return PathGuard {
                _first: self.acquire(x),
                _second: None,
            };
        }
        let (lo, hi) = if x < y { (x, y) } else { (y, x) };
        let first = self.acquire(lo);
        let second = self.acquire(hi);
        PathGuard {
            _first: first,
            _second: Some(second),
        }
    }
}
