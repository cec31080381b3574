use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, symlink};
use std::path::Path;

use walkdir::WalkDir;

use crate::path::{self, PathResolver};
use crate::tombstone::TombstoneStore;

const PARENT_DIR_MODE: u32 = 0o755;

/// Materialises source entries under the cache root on first access.
///
/// Copies never bring back an entry that carries a tombstone: the cache
/// tree holds no deleted paths.
#[derive(Debug, Clone)]
pub struct CacheLoader {
    resolver: PathResolver,
    tombstones: TombstoneStore,
}

impl CacheLoader {
    pub fn new(resolver: PathResolver, tombstones: TombstoneStore) -> Self {
        Self {
            resolver,
            tombstones,
        }
    }

    /// Make sure `rel` exists under the cache root, copying it from the
    /// source tree if it does not. A directory is copied with its whole
    /// subtree. Fails with `NotFound` when neither tree has the entry.
    pub fn ensure_cached(&self, rel: &str) -> io::Result<()> {
        let cached = self.resolver.cache_path(rel);
        if fs::symlink_metadata(&cached).is_ok() {
            return Ok(());
        }

        let source = self.resolver.source_path(rel);
        let meta = fs::metadata(&source)?;
        if meta.is_dir() {
            debug!("caching directory {rel}");
            create_parents(&cached)?;
            fs::set_permissions(&cached, meta.permissions())?;
            self.complete_dir(rel)
        } else {
            debug!("caching file {rel} ({} bytes)", meta.len());
            if let Some(parent) = cached.parent() {
                create_parents(parent)?;
            }
            fs::copy(&source, &cached)?;
            Ok(())
        }
    }

    /// Copy every source entry below `rel` that the cache does not have
    /// yet, so the cached directory holds the full merged subtree. Deleted
    /// entries are skipped along with everything under them.
    pub fn complete_dir(&self, rel: &str) -> io::Result<()> {
        let source = self.resolver.source_path(rel);
        if !fs::metadata(&source).map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(());
        }

        let mut walker = WalkDir::new(&source)
            .follow_links(false)
            .min_depth(1)
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(io::Error::from)?;
            let sub = entry
                .path()
                .strip_prefix(&source)
                .map_err(|e| io::Error::other(e.to_string()))?;
            let child = path::join(rel, &sub.to_string_lossy());
            let file_type = entry.file_type();
            if self.tombstones.is_deleted(&child) {
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let cached = self.resolver.cache_path(&child);
            if fs::symlink_metadata(&cached).is_ok() {
                continue;
            }
            if file_type.is_dir() {
                create_parents(&cached)?;
                let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode();
                fs::set_permissions(&cached, fs::Permissions::from_mode(mode))?;
            } else if file_type.is_symlink() {
                symlink(fs::read_link(entry.path())?, &cached)?;
            } else {
                fs::copy(entry.path(), &cached)?;
            }
        }
        Ok(())
    }
}

/// `mkdir -p` with the mode used for implicitly created parents.
pub fn create_parents(dir: &Path) -> io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(PARENT_DIR_MODE)
        .create(dir)
}

/// Recursively copy `from` onto `to`, keeping permission bits. Existing
/// files under `to` are overwritten.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let dest = if rel.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_parents(&dest)?;
            let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode();
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&dest).is_ok() {
                fs::remove_file(&dest)?;
            }
            symlink(target, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                create_parents(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
