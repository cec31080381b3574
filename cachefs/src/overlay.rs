// Copyright (C) 2024 rk8s authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Path-based overlay of a writable cache tree on top of a slow source
//! tree.
//!
//! Reads fall through to the source until an entry is first opened, at
//! which point it is copied into the cache and served from there. Every
//! mutation lands in the cache synchronously and is then offered to the
//! write-back queue. Deletions are recorded as tombstones so they hide the
//! source entry immediately, whether or not replication ever succeeds.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::statvfs::{Statvfs, statvfs};
use nix::sys::time::TimeSpec;

use crate::error::{CacheFsError, Result};
use crate::loader::{self, CacheLoader};
use crate::locks::PathLocks;
use crate::path::{self, PathResolver};
use crate::tombstone::TombstoneStore;
use crate::writeback::JobQueue;

/// Open flags passed through to the cache file besides the access mode.
const PASSTHROUGH_FLAGS: i32 = libc::O_SYNC | libc::O_DSYNC;

/// One merged directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: fs::FileType,
}

pub struct CacheFs {
    resolver: PathResolver,
    tombstones: TombstoneStore,
    loader: CacheLoader,
    queue: JobQueue,
    locks: PathLocks,
    handles: Mutex<HashMap<u64, Arc<File>>>,
    next_fh: AtomicU64,
}

impl CacheFs {
    pub fn new(resolver: PathResolver, queue: JobQueue) -> Self {
        let tombstones = TombstoneStore::new(resolver.clone());
        let loader = CacheLoader::new(resolver.clone(), tombstones.clone());
        Self {
            resolver,
            tombstones,
            loader,
            queue,
            locks: PathLocks::default(),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn tombstones(&self) -> &TombstoneStore {
        &self.tombstones
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Arc<File>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(fh, Arc::new(file));
        fh
    }

    fn handle(&self, fh: u64) -> Result<Arc<File>> {
        self.handles()
            .get(&fh)
            .cloned()
            .ok_or(CacheFsError::BadHandle(fh))
    }

    /// Deleted paths, paths under a deleted directory and the marker files
    /// themselves are all invisible.
    fn hidden(&self, rel: &str) -> bool {
        path::touches_tombstone(rel) || self.tombstones.is_masked(rel)
    }

    fn check_visible(&self, rel: &str) -> Result<()> {
        if self.hidden(rel) {
            return Err(CacheFsError::NotFound);
        }
        Ok(())
    }

    /// New entries need a parent that is itself visible.
    fn check_parent(&self, rel: &str) -> Result<()> {
        match path::parent(rel) {
            Some(parent) if parent != "/" => self.check_visible(&parent),
            _ => Ok(()),
        }
    }

    pub fn getattr(&self, rel: &str) -> Result<fs::Metadata> {
        let rel = path::normalize(rel);
        self.check_visible(&rel)?;
        if let Ok(meta) = fs::symlink_metadata(self.resolver.cache_path(&rel)) {
            return Ok(meta);
        }
        fs::symlink_metadata(self.resolver.source_path(&rel)).map_err(CacheFsError::from_lookup)
    }

    pub fn readlink(&self, rel: &str) -> Result<PathBuf> {
        let rel = path::normalize(rel);
        self.check_visible(&rel)?;
        fs::read_link(self.resolver.cache_path(&rel))
            .or_else(|_| fs::read_link(self.resolver.source_path(&rel)))
            .map_err(CacheFsError::from_lookup)
    }

    /// Statistics of the filesystem holding the source entry, or the source
    /// root when the entry exists only in the cache.
    pub fn statfs(&self, rel: &str) -> Result<Statvfs> {
        let rel = path::normalize(rel);
        statvfs(&self.resolver.source_path(&rel))
            .or_else(|_| statvfs(self.resolver.source_root()))
            .map_err(|e| {
                warn!("statfs on source {}: {e}", self.resolver.source_root().display());
                CacheFsError::NotSupported
            })
    }

    /// Merged listing of `rel`. A cache entry shadows a source entry of the
    /// same name and deleted children are left out. When the cache holds
    /// `rel` its type wins, so a cached directory never reports the source
    /// side as ENOTDIR.
    pub fn readdir(&self, rel: &str) -> Result<Vec<DirEntry>> {
        let rel = path::normalize(rel);
        self.check_visible(&rel)?;

        let cache_kind = fs::symlink_metadata(self.resolver.cache_path(&rel)).map(|m| m.file_type());
        let (source, cache) = match cache_kind {
            Ok(kind) if kind.is_dir() => {
                let source = list_dir(&self.resolver.source_path(&rel)).unwrap_or_else(|e| {
                    debug!("source listing of {rel} unavailable: {e}");
                    None
                });
                (source, list_dir(&self.resolver.cache_path(&rel))?)
            }
            Ok(_) => return Err(CacheFsError::Errno(libc::ENOTDIR)),
            Err(_) => match list_dir(&self.resolver.source_path(&rel)) {
                Ok(source) => (source, None),
                Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => return Err(e.into()),
                Err(e) => {
                    debug!("source listing of {rel} unavailable: {e}");
                    (None, None)
                }
            },
        };
        if source.is_none() && cache.is_none() {
            return Err(CacheFsError::NotFound);
        }

        let mut merged = BTreeMap::new();
        for (name, kind) in source.into_iter().chain(cache).flatten() {
            merged.insert(name, kind);
        }
        Ok(merged
            .into_iter()
            .filter(|(name, _)| {
                !path::is_tombstone_name(name) && !self.tombstones.is_deleted(&path::join(&rel, name))
            })
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Copy `rel` into the cache if needed and open the cache copy.
    pub fn open(&self, rel: &str, flags: i32) -> Result<u64> {
        let rel = path::normalize(rel);
        let _guard = self.locks.lock(&rel);
        self.check_visible(&rel)?;
        self.loader
            .ensure_cached(&rel)
            .map_err(CacheFsError::from_lookup)?;

        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let file = open_options(flags).open(self.resolver.cache_path(&rel))?;
        if writable && flags & libc::O_TRUNC != 0 {
            self.queue.write_back(&rel);
        }
        Ok(self.register(file))
    }

    /// Close `fh`. A close error is reported unless a read or write on the
    /// same handle still holds the file.
    pub fn release(&self, fh: u64) -> Result<()> {
        let file = self
            .handles()
            .remove(&fh)
            .ok_or(CacheFsError::BadHandle(fh))?;
        if let Ok(file) = Arc::try_unwrap(file) {
            nix::unistd::close(file.into_raw_fd())?;
        }
        Ok(())
    }

    /// Positioned read that only comes up short at end of file.
    pub fn read(&self, fh: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.handle(fh)?;
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    pub fn write(&self, rel: &str, fh: u64, data: &[u8], offset: u64) -> Result<usize> {
        let file = self.handle(fh)?;
        file.write_all_at(data, offset)?;
        self.queue.write_back(&path::normalize(rel));
        Ok(data.len())
    }

    /// Truncate through the open handle when there is one, otherwise by
    /// path on the cache copy.
    pub fn truncate(&self, rel: &str, size: u64, fh: Option<u64>) -> Result<()> {
        let rel = path::normalize(rel);
        let via_handle = fh
            .and_then(|fh| self.handle(fh).ok())
            .map(|file| file.set_len(size));
        match via_handle {
            Some(Ok(())) => {}
            _ => {
                let _guard = self.locks.lock(&rel);
                self.check_visible(&rel)?;
                self.loader
                    .ensure_cached(&rel)
                    .map_err(CacheFsError::from_lookup)?;
                OpenOptions::new()
                    .write(true)
                    .open(self.resolver.cache_path(&rel))?
                    .set_len(size)?;
            }
        }
        self.queue.write_back(&rel);
        Ok(())
    }

    /// Create a brand-new file in the cache. Nothing is read from the
    /// source.
    pub fn create(&self, rel: &str, flags: i32, mode: u32) -> Result<u64> {
        let rel = path::normalize(rel);
        let _guard = self.locks.lock(&rel);
        if path::touches_tombstone(&rel) {
            return Err(CacheFsError::PermissionDenied);
        }
        self.check_parent(&rel)?;

        let cached = self.resolver.cache_path(&rel);
        if let Some(parent) = cached.parent() {
            loader::create_parents(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.read(flags & libc::O_ACCMODE != libc::O_WRONLY)
            .write(true)
            .mode(mode & 0o7777)
            .custom_flags(flags & PASSTHROUGH_FLAGS);
        if flags & libc::O_EXCL != 0 {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(flags & libc::O_TRUNC != 0);
        }
        let file = opts.open(&cached)?;

        self.tombstones.clear(&rel);
        self.hide_source_only(&rel)?;
        self.queue.write_back(&rel);
        Ok(self.register(file))
    }

    /// Create the directory chain in the cache. Nothing is enqueued for the
    /// directory itself: a later file write-back recreates the parents on the
    /// source side. Reusing a deleted name starts out empty.
    pub fn mkdir(&self, rel: &str, mode: u32) -> Result<()> {
        let rel = path::normalize(rel);
        let _guard = self.locks.lock(&rel);
        if path::touches_tombstone(&rel) {
            return Err(CacheFsError::PermissionDenied);
        }
        self.check_parent(&rel)?;
        if self.getattr(&rel).is_ok() {
            return Err(CacheFsError::Errno(libc::EEXIST));
        }
        DirBuilder::new()
            .recursive(true)
            .mode(mode & 0o7777)
            .create(self.resolver.cache_path(&rel))?;
        self.tombstones.clear(&rel);
        self.hide_source_only(&rel)?;
        Ok(())
    }

    /// Synchronous passthrough to whichever tree holds the entry, cache
    /// first.
    pub fn chmod(&self, rel: &str, mode: u32) -> Result<()> {
        let rel = path::normalize(rel);
        let _guard = self.locks.lock(&rel);
        self.check_visible(&rel)?;
        let perms = fs::Permissions::from_mode(mode & 0o7777);
        if fs::set_permissions(self.resolver.cache_path(&rel), perms.clone()).is_ok() {
            return Ok(());
        }
        fs::set_permissions(self.resolver.source_path(&rel), perms).map_err(|e| {
            debug!("chmod {rel} failed on both trees: {e}");
            CacheFsError::PermissionDenied
        })
    }

    /// Remove whatever `rel` is.
    pub fn rm(&self, rel: &str) -> Result<()> {
        if self.getattr(rel)?.is_dir() {
            self.rmdir(rel)
        } else {
            self.unlink(rel)
        }
    }

    /// Recursive: the whole cached subtree goes and the tombstone masks
    /// whatever the source still holds.
    pub fn rmdir(&self, rel: &str) -> Result<()> {
        let rel = path::normalize(rel);
        if rel == "/" {
            return Err(CacheFsError::Errno(libc::EBUSY));
        }
        let _guard = self.locks.lock(&rel);
        if !self.getattr(&rel)?.is_dir() {
            return Err(CacheFsError::Errno(libc::ENOTDIR));
        }

        match fs::remove_dir_all(self.resolver.cache_path(&rel)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.tombstones.mark_deleted(&rel)?;
        self.queue.delete_back(&rel);
        Ok(())
    }

    /// Fails with not-found before any tombstone is written when `rel` is
    /// not visible, so removing a missing name leaves no marker behind.
    pub fn unlink(&self, rel: &str) -> Result<()> {
        let rel = path::normalize(rel);
        let _guard = self.locks.lock(&rel);
        if self.getattr(&rel)?.is_dir() {
            return Err(CacheFsError::Errno(libc::EISDIR));
        }

        self.tombstones.mark_deleted(&rel)?;
        match fs::remove_file(self.resolver.cache_path(&rel)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.queue.delete_back(&rel);
        Ok(())
    }

    /// Move an entry inside the cache tree. A directory is completed from
    /// the source first so children it only had there survive the move.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old, new) = (path::normalize(old), path::normalize(new));
        if old == "/" || new == "/" {
            return Err(CacheFsError::Errno(libc::EBUSY));
        }
        if path::touches_tombstone(&new) {
            return Err(CacheFsError::PermissionDenied);
        }
        if old == new {
            return self.getattr(&old).map(|_| ());
        }
        let _guard = self.locks.lock_pair(&old, &new);
        self.check_visible(&old)?;
        self.check_parent(&new)?;

        self.loader
            .ensure_cached(&old)
            .map_err(CacheFsError::from_lookup)?;
        let from = self.resolver.cache_path(&old);
        let is_dir = fs::symlink_metadata(&from)?.is_dir();
        if is_dir {
            self.loader.complete_dir(&old)?;
        }

        let to = self.resolver.cache_path(&new);
        if let Some(parent) = to.parent() {
            loader::create_parents(parent)?;
        }
        fs::rename(&from, &to)?;

        self.tombstones.mark_deleted(&old)?;
        self.tombstones.clear(&new);
        if is_dir {
            self.tombstones.clear_under(&new)?;
        }
        self.hide_source_only(&new)?;
        self.queue.write_back(&new);
        self.queue.delete_back(&old);
        Ok(())
    }

    /// Timestamps are applied to the cache copy only.
    pub fn utimens(
        &self,
        rel: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let rel = path::normalize(rel);
        let _guard = self.locks.lock(&rel);
        self.check_visible(&rel)?;
        self.loader
            .ensure_cached(&rel)
            .map_err(CacheFsError::from_lookup)?;

        utimensat(
            None,
            &self.resolver.cache_path(&rel),
            &time_spec(atime)?,
            &time_spec(mtime)?,
            UtimensatFlags::NoFollowSymlink,
        )?;
        Ok(())
    }

    /// Tombstone every source entry below `rel` that the cache copy does
    /// not hold, so a name taken over after a deletion shows only what the
    /// cache put there. Directories present on both sides are walked.
    fn hide_source_only(&self, rel: &str) -> Result<()> {
        let Ok(Some(source)) = list_dir(&self.resolver.source_path(rel)) else {
            return Ok(());
        };
        let cached: HashMap<String, fs::FileType> = list_dir(&self.resolver.cache_path(rel))
            .ok()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .collect();
        for (name, kind) in source {
            let child = path::join(rel, &name);
            if !cached.contains_key(&name) {
                self.tombstones.mark_deleted(&child)?;
                self.queue.delete_back(&child);
            } else if kind.is_dir() {
                self.hide_source_only(&child)?;
            }
        }
        Ok(())
    }
}

/// `None` leaves the timestamp as it is.
fn time_spec(t: Option<SystemTime>) -> Result<TimeSpec> {
    match t {
        None => Ok(TimeSpec::UTIME_OMIT),
        Some(t) => t
            .duration_since(UNIX_EPOCH)
            .map(TimeSpec::from)
            .map_err(|_| CacheFsError::Errno(libc::EINVAL)),
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let accmode = flags & libc::O_ACCMODE;
    let writable = accmode != libc::O_RDONLY;
    let mut opts = OpenOptions::new();
    opts.read(accmode != libc::O_WRONLY)
        .write(writable)
        .append(flags & libc::O_APPEND != 0)
        .truncate(writable && flags & libc::O_TRUNC != 0)
        .custom_flags(flags & PASSTHROUGH_FLAGS);
    opts
}

/// `Ok(None)` when the directory does not exist.
fn list_dir(dir: &Path) -> io::Result<Option<Vec<(String, fs::FileType)>>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry?;
        out.push((
            entry.file_name().to_string_lossy().into_owned(),
            entry.file_type()?,
        ));
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writeback::{Job, JobKind};
    use tokio::sync::mpsc;

    struct Env {
        src: tempfile::TempDir,
        cache: tempfile::TempDir,
        fs: CacheFs,
        jobs: mpsc::Receiver<Job>,
    }

    fn env() -> Env {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(src.path(), cache.path());
        let (tx, jobs) = mpsc::channel(64);
        let fs = CacheFs::new(resolver.clone(), JobQueue::new(tx, resolver, 3));
        Env {
            src,
            cache,
            fs,
            jobs,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Job>) -> Vec<Job> {
        let mut out = Vec::new();
        while let Ok(job) = rx.try_recv() {
            out.push(job);
        }
        out
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_getattr_prefers_cache() {
        let env = env();
        fs::write(env.src.path().join("f"), b"source").unwrap();
        assert_eq!(env.fs.getattr("/f").unwrap().len(), 6);

        fs::write(env.cache.path().join("f"), b"cached copy").unwrap();
        assert_eq!(env.fs.getattr("/f").unwrap().len(), 11);
        assert!(matches!(env.fs.getattr("/missing"), Err(CacheFsError::NotFound)));
    }

    #[test]
    fn test_markers_are_invisible() {
        let env = env();
        fs::write(env.src.path().join("f"), b"x").unwrap();
        env.fs.unlink("/f").unwrap();

        let marker = format!("/{}", path::escape("/f"));
        assert!(matches!(env.fs.getattr(&marker), Err(CacheFsError::NotFound)));
        assert!(names(&env.fs.readdir("/").unwrap()).is_empty());
    }

    #[test]
    fn test_readdir_merges_with_cache_precedence() {
        let env = env();
        fs::create_dir(env.src.path().join("d")).unwrap();
        fs::write(env.src.path().join("d/both"), b"s").unwrap();
        fs::write(env.src.path().join("d/src_only"), b"s").unwrap();
        fs::create_dir_all(env.cache.path().join("d/both")).unwrap();
        fs::write(env.cache.path().join("d/cache_only"), b"c").unwrap();

        let entries = env.fs.readdir("/d").unwrap();
        assert_eq!(names(&entries), vec!["both", "cache_only", "src_only"]);
        assert!(entries[0].kind.is_dir());
    }

    #[test]
    fn test_readdir_hides_nested_deletions() {
        let mut env = env();
        fs::create_dir_all(env.src.path().join("a/b")).unwrap();
        fs::write(env.src.path().join("a/b/c"), b"c").unwrap();
        fs::write(env.src.path().join("a/b/keep"), b"k").unwrap();

        env.fs.unlink("/a/b/c").unwrap();
        assert_eq!(names(&env.fs.readdir("/a/b").unwrap()), vec!["keep"]);

        env.fs.rmdir("/a/b").unwrap();
        assert!(env.fs.readdir("/a").unwrap().is_empty());
        assert!(matches!(env.fs.getattr("/a/b/keep"), Err(CacheFsError::NotFound)));
        assert!(matches!(env.fs.readdir("/a/b"), Err(CacheFsError::NotFound)));

        let kinds: Vec<_> = drain(&mut env.jobs).iter().map(|j| j.kind).collect();
        assert_eq!(kinds, vec![JobKind::DeleteBack, JobKind::DeleteBack]);
    }

    #[test]
    fn test_readdir_of_cache_only_dir() {
        let env = env();
        env.fs.mkdir("/fresh", 0o755).unwrap();
        assert!(env.fs.readdir("/fresh").unwrap().is_empty());
        assert!(matches!(env.fs.readdir("/nowhere"), Err(CacheFsError::NotFound)));
    }

    #[test]
    fn test_readdir_of_file_is_not_a_directory() {
        let env = env();
        fs::write(env.src.path().join("f"), b"x").unwrap();
        let err = env.fs.readdir("/f").unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_open_copies_then_reads() {
        let env = env();
        fs::create_dir(env.src.path().join("a")).unwrap();
        fs::write(env.src.path().join("a/b.txt"), b"hello world").unwrap();

        let fh = env.fs.open("/a/b.txt", libc::O_RDONLY).unwrap();
        assert!(env.cache.path().join("a/b.txt").exists());

        let mut buf = [0u8; 5];
        assert_eq!(env.fs.read(fh, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        let mut tail = [0u8; 16];
        assert_eq!(env.fs.read(fh, &mut tail, 6).unwrap(), 5);
        env.fs.release(fh).unwrap();
    }

    #[test]
    fn test_write_is_visible_and_enqueued() {
        let mut env = env();
        fs::write(env.src.path().join("f"), b"aaaa").unwrap();
        let fh = env.fs.open("/f", libc::O_RDWR).unwrap();
        assert_eq!(env.fs.write("/f", fh, b"bb", 1).unwrap(), 2);

        let mut buf = [0u8; 4];
        env.fs.read(fh, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"abba");
        // The source is untouched until the worker replicates.
        assert_eq!(fs::read(env.src.path().join("f")).unwrap(), b"aaaa");

        let jobs = drain(&mut env.jobs);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::WriteBack);
        assert_eq!(jobs[0].target, env.src.path().join("f"));
        env.fs.release(fh).unwrap();
    }

    #[test]
    fn test_open_with_trunc_enqueues() {
        let mut env = env();
        fs::write(env.src.path().join("f"), b"data").unwrap();
        let fh = env.fs.open("/f", libc::O_WRONLY | libc::O_TRUNC).unwrap();
        assert_eq!(env.fs.getattr("/f").unwrap().len(), 0);
        assert_eq!(drain(&mut env.jobs).len(), 1);
        env.fs.release(fh).unwrap();
    }

    #[test]
    fn test_unknown_handles() {
        let env = env();
        assert!(matches!(env.fs.release(42), Err(CacheFsError::BadHandle(42))));
        let mut buf = [0u8; 1];
        assert_eq!(env.fs.read(42, &mut buf, 0).unwrap_err().errno(), libc::EBADF);
        assert_eq!(env.fs.write("/f", 42, b"x", 0).unwrap_err().errno(), libc::EBADF);
    }

    #[test]
    fn test_truncate_falls_back_to_path() {
        let mut env = env();
        fs::write(env.src.path().join("f"), b"0123456789").unwrap();
        env.fs.truncate("/f", 4, Some(999)).unwrap();
        assert_eq!(fs::read(env.cache.path().join("f")).unwrap(), b"0123");
        assert_eq!(drain(&mut env.jobs).len(), 1);

        let fh = env.fs.open("/f", libc::O_RDWR).unwrap();
        env.fs.truncate("/f", 2, Some(fh)).unwrap();
        assert_eq!(env.fs.getattr("/f").unwrap().len(), 2);
        env.fs.release(fh).unwrap();
    }

    #[test]
    fn test_create_under_source_only_parent() {
        let mut env = env();
        fs::create_dir(env.src.path().join("dir")).unwrap();
        let fh = env.fs.create("/dir/new.txt", libc::O_RDWR, 0o640).unwrap();
        env.fs.write("/dir/new.txt", fh, b"fresh", 0).unwrap();
        env.fs.release(fh).unwrap();

        let meta = env.fs.getattr("/dir/new.txt").unwrap();
        assert_eq!(meta.len(), 5);
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert!(!env.src.path().join("dir/new.txt").exists());
        assert_eq!(drain(&mut env.jobs).len(), 2);
    }

    #[test]
    fn test_create_exclusive_and_resurrect() {
        let env = env();
        fs::write(env.src.path().join("f"), b"old").unwrap();
        env.fs.open("/f", libc::O_RDONLY).and_then(|fh| env.fs.release(fh)).unwrap();
        let err = env
            .fs
            .create("/f", libc::O_RDWR | libc::O_EXCL, 0o644)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);

        env.fs.unlink("/f").unwrap();
        let fh = env.fs.create("/f", libc::O_RDWR | libc::O_EXCL, 0o644).unwrap();
        env.fs.release(fh).unwrap();
        assert!(!env.fs.tombstones().is_deleted("/f"));
        assert_eq!(env.fs.getattr("/f").unwrap().len(), 0);
    }

    #[test]
    fn test_create_in_deleted_dir_fails() {
        let env = env();
        fs::create_dir(env.src.path().join("d")).unwrap();
        env.fs.rmdir("/d").unwrap();
        assert!(matches!(
            env.fs.create("/d/x", libc::O_RDWR, 0o644),
            Err(CacheFsError::NotFound)
        ));
        assert!(matches!(
            env.fs.create(&format!("/{}", path::escape("/y")), libc::O_RDWR, 0o644),
            Err(CacheFsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_mkdir_is_not_replicated() {
        let mut env = env();
        env.fs.mkdir("/a/b", 0o750).unwrap();
        assert!(env.fs.getattr("/a/b").unwrap().is_dir());
        assert!(drain(&mut env.jobs).is_empty());
        assert_eq!(env.fs.mkdir("/a/b", 0o750).unwrap_err().errno(), libc::EEXIST);
    }

    #[test]
    fn test_chmod_falls_back_to_source() {
        let env = env();
        fs::write(env.src.path().join("f"), b"x").unwrap();
        env.fs.chmod("/f", 0o600).unwrap();
        let mode = fs::metadata(env.src.path().join("f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!env.cache.path().join("f").exists());

        assert!(matches!(
            env.fs.chmod("/nope", 0o600),
            Err(CacheFsError::PermissionDenied)
        ));
    }

    #[test]
    fn test_rm_dispatches() {
        let env = env();
        fs::create_dir(env.src.path().join("d")).unwrap();
        fs::write(env.src.path().join("f"), b"x").unwrap();
        env.fs.rm("/d").unwrap();
        env.fs.rm("/f").unwrap();
        assert!(env.fs.tombstones().is_deleted("/d"));
        assert!(env.fs.tombstones().is_deleted("/f"));
        assert!(matches!(env.fs.rm("/f"), Err(CacheFsError::NotFound)));
        assert_eq!(env.fs.rmdir("/").unwrap_err().errno(), libc::EBUSY);
    }

    #[test]
    fn test_unlink_hides_source_file() {
        let mut env = env();
        fs::write(env.src.path().join("f"), b"x").unwrap();
        env.fs.unlink("/f").unwrap();
        assert!(matches!(env.fs.getattr("/f"), Err(CacheFsError::NotFound)));
        assert!(matches!(env.fs.open("/f", libc::O_RDONLY), Err(CacheFsError::NotFound)));
        assert!(env.src.path().join("f").exists());

        let jobs = drain(&mut env.jobs);
        assert_eq!(jobs[0].kind, JobKind::DeleteBack);
        assert_eq!(jobs[0].target, env.src.path().join("f"));
    }

    #[test]
    fn test_rename_partially_cached_directory() {
        let mut env = env();
        fs::create_dir(env.src.path().join("d")).unwrap();
        fs::write(env.src.path().join("d/cached"), b"1").unwrap();
        fs::write(env.src.path().join("d/uncached"), b"2").unwrap();
        fs::write(env.src.path().join("d/deleted"), b"3").unwrap();
        let fh = env.fs.open("/d/cached", libc::O_RDONLY).unwrap();
        env.fs.release(fh).unwrap();
        env.fs.unlink("/d/deleted").unwrap();
        drain(&mut env.jobs);

        env.fs.rename("/d", "/moved/e").unwrap();
        assert!(matches!(env.fs.getattr("/d"), Err(CacheFsError::NotFound)));
        assert_eq!(
            names(&env.fs.readdir("/moved/e").unwrap()),
            vec!["cached", "uncached"]
        );

        let jobs = drain(&mut env.jobs);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].kind, JobKind::WriteBack);
        assert_eq!(jobs[0].content, env.cache.path().join("moved/e"));
        assert_eq!(jobs[1].kind, JobKind::DeleteBack);
        assert_eq!(jobs[1].target, env.src.path().join("d"));
    }

    #[test]
    fn test_rename_onto_deleted_name() {
        let env = env();
        fs::write(env.src.path().join("a"), b"A").unwrap();
        fs::write(env.src.path().join("b"), b"B").unwrap();
        env.fs.unlink("/b").unwrap();

        env.fs.rename("/a", "/b").unwrap();
        let fh = env.fs.open("/b", libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 1];
        env.fs.read(fh, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"A");
        env.fs.release(fh).unwrap();
        assert!(matches!(env.fs.getattr("/a"), Err(CacheFsError::NotFound)));
    }

    #[test]
    fn test_utimens_sets_cache_times() {
        let env = env();
        fs::write(env.src.path().join("f"), b"x").unwrap();
        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        env.fs.utimens("/f", None, Some(when)).unwrap();

        assert_eq!(env.fs.getattr("/f").unwrap().modified().unwrap(), when);
        let src_mtime = fs::metadata(env.src.path().join("f")).unwrap().modified().unwrap();
        assert_ne!(src_mtime, when);
    }

    #[test]
    fn test_statfs_reports_source() {
        let env = env();
        let st = env.fs.statfs("/only/in/cache").unwrap();
        assert!(st.block_size() > 0);
    }

    #[test]
    fn test_statfs_without_source_is_not_supported() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let src = root.path().join("gone");
        fs::create_dir(&src).unwrap();
        let resolver = PathResolver::new(&src, cache.path());
        let overlay = CacheFs::new(resolver.clone(), JobQueue::disabled(resolver));
        fs::remove_dir(&src).unwrap();

        let err = overlay.statfs("/").unwrap_err();
        assert!(matches!(err, CacheFsError::NotSupported));
        assert_eq!(err.errno(), libc::ENOSYS);
    }

    #[test]
    fn test_mkdir_over_deleted_dir_starts_empty() {
        let mut env = env();
        fs::create_dir_all(env.src.path().join("d/sub")).unwrap();
        fs::write(env.src.path().join("d/old"), b"x").unwrap();
        fs::write(env.src.path().join("d/sub/deep"), b"y").unwrap();
        env.fs.rmdir("/d").unwrap();
        drain(&mut env.jobs);

        env.fs.mkdir("/d", 0o755).unwrap();
        assert!(env.fs.readdir("/d").unwrap().is_empty());
        assert!(matches!(env.fs.getattr("/d/old"), Err(CacheFsError::NotFound)));
        assert!(matches!(env.fs.getattr("/d/sub/deep"), Err(CacheFsError::NotFound)));

        // New content under the reused name is visible as usual.
        let fh = env.fs.create("/d/new", libc::O_RDWR, 0o644).unwrap();
        env.fs.release(fh).unwrap();
        assert_eq!(names(&env.fs.readdir("/d").unwrap()), vec!["new"]);

        let targets: Vec<_> = drain(&mut env.jobs)
            .into_iter()
            .filter(|j| j.kind == JobKind::DeleteBack)
            .map(|j| j.target)
            .collect();
        assert!(targets.contains(&env.src.path().join("d/old")));
        assert!(targets.contains(&env.src.path().join("d/sub")));
    }

    #[test]
    fn test_mkdir_over_deleted_dir_without_writeback() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("d")).unwrap();
        fs::write(src.path().join("d/old"), b"x").unwrap();
        let resolver = PathResolver::new(src.path(), cache.path());
        let overlay = CacheFs::new(resolver.clone(), JobQueue::disabled(resolver));

        overlay.rmdir("/d").unwrap();
        overlay.mkdir("/d", 0o755).unwrap();
        assert!(overlay.readdir("/d").unwrap().is_empty());
        assert!(matches!(overlay.open("/d/old", libc::O_RDONLY), Err(CacheFsError::NotFound)));
        assert!(src.path().join("d/old").exists());
    }

    #[test]
    fn test_rename_dir_onto_deleted_dir() {
        let env = env();
        fs::create_dir_all(env.src.path().join("a/x")).unwrap();
        fs::write(env.src.path().join("a/mine"), b"1").unwrap();
        fs::write(env.src.path().join("a/x/own"), b"2").unwrap();
        fs::create_dir_all(env.src.path().join("b/x")).unwrap();
        fs::write(env.src.path().join("b/ghost"), b"3").unwrap();
        fs::write(env.src.path().join("b/x/deep"), b"4").unwrap();
        env.fs.rmdir("/b").unwrap();

        env.fs.rename("/a", "/b").unwrap();
        assert_eq!(names(&env.fs.readdir("/b").unwrap()), vec!["mine", "x"]);
        assert_eq!(names(&env.fs.readdir("/b/x").unwrap()), vec!["own"]);
        assert!(matches!(env.fs.getattr("/b/ghost"), Err(CacheFsError::NotFound)));
        assert!(matches!(env.fs.getattr("/b/x/deep"), Err(CacheFsError::NotFound)));
        assert!(matches!(env.fs.getattr("/a"), Err(CacheFsError::NotFound)));
    }

    #[test]
    fn test_cached_dir_shadows_source_file() {
        let env = env();
        fs::write(env.src.path().join("f"), b"file").unwrap();
        fs::create_dir(env.src.path().join("a")).unwrap();
        fs::write(env.src.path().join("a/inside"), b"x").unwrap();
        env.fs.unlink("/f").unwrap();

        env.fs.rename("/a", "/f").unwrap();
        assert!(env.fs.getattr("/f").unwrap().is_dir());
        assert_eq!(names(&env.fs.readdir("/f").unwrap()), vec!["inside"]);
    }

    #[test]
    fn test_cached_file_shadows_source_dir() {
        let env = env();
        fs::create_dir(env.src.path().join("g")).unwrap();
        fs::write(env.src.path().join("g/child"), b"x").unwrap();
        env.fs.rmdir("/g").unwrap();

        let fh = env.fs.create("/g", libc::O_RDWR, 0o644).unwrap();
        env.fs.release(fh).unwrap();
        assert!(env.fs.getattr("/g").unwrap().is_file());
        assert_eq!(env.fs.readdir("/g").unwrap_err().errno(), libc::ENOTDIR);
        assert!(matches!(env.fs.getattr("/g/child"), Err(CacheFsError::NotFound)));
    }

    #[test]
    fn test_utimens_on_unreadable_file() {
        let env = env();
        let cached = env.cache.path().join("locked");
        fs::write(&cached, b"x").unwrap();
        fs::set_permissions(&cached, fs::Permissions::from_mode(0o200)).unwrap();

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(2_000_000);
        env.fs.utimens("/locked", Some(when), Some(when)).unwrap();
        let meta = env.fs.getattr("/locked").unwrap();
        assert_eq!(meta.modified().unwrap(), when);
        assert_eq!(meta.accessed().unwrap(), when);
    }

    #[test]
    fn test_utimens_does_not_follow_symlinks() {
        let env = env();
        let target = env.cache.path().join("target");
        fs::write(&target, b"x").unwrap();
        let before = fs::metadata(&target).unwrap().modified().unwrap();
        std::os::unix::fs::symlink(&target, env.cache.path().join("link")).unwrap();

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(3_000_000);
        env.fs.utimens("/link", None, Some(when)).unwrap();
        assert_eq!(env.fs.getattr("/link").unwrap().modified().unwrap(), when);
        assert_eq!(fs::metadata(&target).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_unlink_missing_leaves_no_marker() {
        let env = env();
        assert!(matches!(env.fs.unlink("/absent"), Err(CacheFsError::NotFound)));
        assert!(!env.fs.tombstones().is_deleted("/absent"));
    }

    #[test]
    fn test_disabled_queue_still_mutates_cache() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(src.path(), cache.path());
        let fs = CacheFs::new(resolver.clone(), JobQueue::disabled(resolver));
        let fh = fs.create("/x", libc::O_WRONLY, 0o644).unwrap();
        fs.write("/x", fh, b"data", 0).unwrap();
        fs.release(fh).unwrap();
        assert_eq!(std::fs::read(cache.path().join("x")).unwrap(), b"data");
        assert!(!src.path().join("x").exists());
    }
}
