use std::collections::HashMap;

use crate::path;

pub const ROOT_INO: u64 = 1;

/// Bidirectional inode number <-> relative path table.
///
/// Numbers are handed out on first use and never reused while the session
/// lives. Entries the kernel has looked up are dropped again once it
/// forgets every reference. Nothing here touches the disk.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    lookups: HashMap<u64, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
            lookups: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, "/".to_string());
        table.inos.insert("/".to_string(), ROOT_INO);
        table
    }
}

impl InodeTable {
    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Inode for `rel`, allocating one if it has none yet.
    pub fn ino_of(&mut self, rel: &str) -> u64 {
        let rel = path::normalize(rel);
        if let Some(ino) = self.inos.get(&rel) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, rel.clone());
        self.inos.insert(rel, ino);
        ino
    }

    /// Inode for `rel` with its kernel lookup count bumped. Use for every
    /// reply that hands the kernel an entry it will later forget.
    pub fn lookup(&mut self, rel: &str) -> u64 {
        let ino = self.ino_of(rel);
        *self.lookups.entry(ino).or_default() += 1;
        ino
    }

    /// Drop `n` kernel references to `ino`. The entry goes once none are
    /// left; the root is never forgotten.
    pub fn forget(&mut self, ino: u64, n: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(count) = self.lookups.get_mut(&ino) else {
            return;
        };
        *count = count.saturating_sub(n);
        if *count > 0 {
            return;
        }
        self.lookups.remove(&ino);
        if let Some(p) = self.paths.remove(&ino) {
            self.inos.remove(&p);
        }
    }

    /// Drop `rel` and everything below it.
    pub fn remove(&mut self, rel: &str) {
        let rel = path::normalize(rel);
        let prefix = format!("{rel}/");
        let gone: Vec<String> = self
            .inos
            .keys()
            .filter(|p| **p == rel || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in gone {
            if let Some(ino) = self.inos.remove(&p) {
                self.paths.remove(&ino);
                self.lookups.remove(&ino);
            }
        }
    }

    /// Re-key `old` and its descendants under `new`, keeping their
    /// numbers. Whatever was known at `new` is forgotten first.
    pub fn rename(&mut self, old: &str, new: &str) {
        let (old, new) = (path::normalize(old), path::normalize(new));
        self.remove(&new);

        let prefix = format!("{old}/");
        let moved: Vec<(String, u64)> = self
            .inos
            .iter()
            .filter(|(p, _)| **p == old || p.starts_with(&prefix))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (p, ino) in moved {
            self.inos.remove(&p);
            let renamed = format!("{new}{}", &p[old.len()..]);
            self.paths.insert(ino, renamed.clone());
            self.inos.insert(renamed, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
