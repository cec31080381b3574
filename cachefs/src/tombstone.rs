use std::fs::{self, OpenOptions};
use std::io;

use crate::path::{self, PathResolver};

/// Records logical deletions as marker files at the top of the cache root.
///
/// A path is deleted iff its marker exists as a regular file, whatever the
/// source or cache trees physically hold.
#[derive(Debug, Clone)]
pub struct TombstoneStore {
    resolver: PathResolver,
}

impl TombstoneStore {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Any stat error reads as "not deleted".
    pub fn is_deleted(&self, rel: &str) -> bool {
        fs::metadata(self.resolver.tombstone_path(rel))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// True if `rel` or one of its ancestors carries a tombstone.
    pub fn is_masked(&self, rel: &str) -> bool {
        let mut cur = Some(path::normalize(rel));
        while let Some(p) = cur {
            if p == "/" {
                return false;
            }
            if self.is_deleted(&p) {
                return true;
            }
            cur = path::parent(&p);
        }
        false
    }

    pub fn mark_deleted(&self, rel: &str) -> io::Result<()> {
        let marker = self.resolver.tombstone_path(rel);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&marker)?;
        debug!("tombstone set for {rel} at {}", marker.display());
        Ok(())
    }

    pub fn clear(&self, rel: &str) {
        let marker = self.resolver.tombstone_path(rel);
        match fs::remove_file(&marker) {
            Ok(()) => debug!("tombstone cleared for {rel}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to clear tombstone {}: {e}", marker.display()),
        }
    }

    /// Clear every tombstone strictly below `rel`. Used when a new subtree
    /// takes over a name whose old descendants were deleted.
    pub fn clear_under(&self, rel: &str) -> io::Result<()> {
        let prefix = format!("{}/", path::normalize(rel));
        for entry in fs::read_dir(self.resolver.cache_root())? {
            let name = entry?.file_name();
            let Some(target) = path::unescape(&name.to_string_lossy()) else {
                continue;
            };
            if target.starts_with(&prefix) {
                self.clear(&target);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, tempfile::TempDir, TombstoneStore) {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let store = TombstoneStore::new(PathResolver::new(src.path(), cache.path()));
        (src, cache, store)
    }

    #[test]
    fn test_mark_and_clear() {
        let (_src, cache, store) = store();
        assert!(!store.is_deleted("/a/b.txt"));

        store.mark_deleted("/a/b.txt").unwrap();
        assert!(store.is_deleted("/a/b.txt"));
        assert!(cache.path().join(".__cachefs_rm__a----b.txt").is_file());

        // idempotent
        store.mark_deleted("/a/b.txt").unwrap();
        assert!(store.is_deleted("/a/b.txt"));

        store.clear("/a/b.txt");
        assert!(!store.is_deleted("/a/b.txt"));
        // clearing an absent marker is silent
        store.clear("/a/b.txt");
    }

    #[test]
    fn test_ancestor_masks_children() {
        let (_src, _cache, store) = store();
        store.mark_deleted("/dir").unwrap();
        assert!(store.is_masked("/dir/child"));
        assert!(store.is_masked("/dir"));
        assert!(!store.is_masked("/dirx/child"));
        assert!(!store.is_masked("/"));
    }

    #[test]
    fn test_clear_under_keeps_siblings() {
        let (_src, _cache, store) = store();
        store.mark_deleted("/d/x").unwrap();
        store.mark_deleted("/d/e/y").unwrap();
        store.mark_deleted("/d").unwrap();
        store.mark_deleted("/dd/z").unwrap();

        store.clear_under("/d").unwrap();
        assert!(!store.is_deleted("/d/x"));
        assert!(!store.is_deleted("/d/e/y"));
        assert!(store.is_deleted("/d"));
        assert!(store.is_deleted("/dd/z"));
    }

    #[test]
    fn test_directory_at_marker_path_is_not_a_tombstone() {
        let (_src, cache, store) = store();
        std::fs::create_dir(cache.path().join(crate::path::escape("/odd"))).unwrap();
        assert!(!store.is_deleted("/odd"));
    }
}
