// Copyright (C) 2024 rk8s authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! FUSE front end for [`CacheFs`].
//!
//! The overlay speaks relative paths; the kernel speaks inode numbers. This
//! module keeps the mapping between the two and copies host metadata into
//! FUSE replies.
//!
//! - `inode`: the inode <-> path table.
//! - `mount`: mount option parsing and session start-up.

pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{FileType, SetAttr, Timestamp};

use crate::overlay::CacheFs;
use crate::path;
use inode::{InodeTable, ROOT_INO};

const MAX_WRITE: NonZeroU32 = NonZeroU32::new(1024 * 1024).unwrap();
const TTL: Duration = Duration::from_secs(1);

/// rfuse3 driver over a [`CacheFs`].
pub struct CacheFuse {
    fs: CacheFs,
    inodes: Mutex<InodeTable>,
}

impl CacheFuse {
    pub fn new(fs: CacheFs) -> Self {
        Self {
            fs,
            inodes: Mutex::new(InodeTable::default()),
        }
    }

    fn inodes(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes()
            .path_of(ino)
            .map(str::to_string)
            .ok_or_else(|| libc::ENOENT.into())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let parent = self.path_of(parent)?;
        Ok(path::join(&parent, &name.to_string_lossy()))
    }

    /// Stat `rel` and hand back its attributes under our inode number.
    fn stat(&self, rel: &str) -> FuseResult<FileAttr> {
        let meta = self.fs.getattr(rel)?;
        let ino = self.inodes().ino_of(rel);
        Ok(to_attr(ino, &meta))
    }

    /// Like [`Self::stat`], but the kernel now holds a reference it will
    /// `forget` later.
    fn counted_stat(&self, rel: &str) -> FuseResult<FileAttr> {
        let meta = self.fs.getattr(rel)?;
        let ino = self.inodes().lookup(rel);
        Ok(to_attr(ino, &meta))
    }

    fn entry(&self, rel: &str) -> FuseResult<ReplyEntry> {
        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.counted_stat(rel)?,
            generation: 0,
        })
    }

    /// Merged listing with `.` and `..` prepended, as `(ino, kind, name)`.
    fn list(&self, ino: u64) -> FuseResult<Vec<(u64, FileType, String)>> {
        let rel = self.path_of(ino)?;
        let entries = self.fs.readdir(&rel)?;
        let parent_ino = match path::parent(&rel) {
            Some(parent) => self.inodes().ino_of(&parent),
            None => ROOT_INO,
        };

        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push((ino, FileType::Directory, ".".to_string()));
        all.push((parent_ino, FileType::Directory, "..".to_string()));
        let mut inodes = self.inodes();
        for e in entries {
            let child = inodes.ino_of(&path::join(&rel, &e.name));
            all.push((child, to_kind(e.kind), e.name));
        }
        Ok(all)
    }
}

impl Filesystem for CacheFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!(
            "serving {} over {}",
            self.fs.resolver().cache_root().display(),
            self.fs.resolver().source_root().display()
        );
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        debug!("session destroyed, {} inodes known", self.inodes().len());
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let rel = self.child_path(parent, name)?;
        self.entry(&rel)
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes().forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        let mut table = self.inodes();
        for &(inode, nlookup) in inodes {
            table.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let rel = self.path_of(ino)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.stat(&rel)?,
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let rel = self.path_of(ino)?;
        if let Some(size) = set_attr.size {
            self.fs.truncate(&rel, size, fh)?;
        }
        if let Some(mode) = set_attr.mode {
            self.fs.chmod(&rel, mode)?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.fs.utimens(
                &rel,
                set_attr.atime.map(from_timestamp),
                set_attr.mtime.map(from_timestamp),
            )?;
        }
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.stat(&rel)?,
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let rel = self.path_of(ino)?;
        let target = self.fs.readlink(&rel)?;
        Ok(ReplyData {
            data: Bytes::copy_from_slice(target.as_os_str().as_bytes()),
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let rel = self.child_path(parent, name)?;
        self.fs.mkdir(&rel, mode & !umask)?;
        self.entry(&rel)
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let rel = self.child_path(parent, name)?;
        self.fs.unlink(&rel)?;
        self.inodes().remove(&rel);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let rel = self.child_path(parent, name)?;
        self.fs.rmdir(&rel)?;
        self.inodes().remove(&rel);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        self.fs.rename(&old, &new)?;
        self.inodes().rename(&old, &new);
        Ok(())
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let rel = self.path_of(ino)?;
        let fh = self.fs.open(&rel, flags as i32)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let mut buf = vec![0u8; size as usize];
        let n = self.fs.read(fh, &mut buf, offset)?;
        buf.truncate(n);
        Ok(ReplyData {
            data: Bytes::from(buf),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let rel = self.path_of(ino)?;
        let written = self.fs.write(&rel, fh, data, offset)?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn statfs(&self, _req: Request, ino: u64) -> FuseResult<ReplyStatFs> {
        let rel = self.path_of(ino).unwrap_or_else(|_| "/".to_string());
        let st = self.fs.statfs(&rel)?;
        Ok(ReplyStatFs {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.fs.release(fh)?;
        Ok(())
    }

    // Writes go straight to the cache file, there is nothing buffered here.
    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let rel = self.path_of(ino)?;
        if !self.fs.getattr(&rel)?.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let start = offset.max(0) as usize;
        let entries: Vec<_> = self
            .list(ino)?
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, (inode, kind, name))| {
                Ok(DirectoryEntry {
                    inode,
                    kind,
                    name: OsString::from(name),
                    offset: i as i64 + 1,
                })
            })
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let dir = self.path_of(ino)?;
        let mut entries = Vec::new();
        for (i, (inode, kind, name)) in self.list(ino)?.into_iter().enumerate().skip(offset as usize) {
            let rel = match name.as_str() {
                "." => dir.clone(),
                ".." => path::parent(&dir).unwrap_or_else(|| "/".to_string()),
                _ => path::join(&dir, &name),
            };
            // The entry may vanish between listing and stat.
            let Ok(meta) = self.fs.getattr(&rel) else {
                continue;
            };
            // The kernel takes a reference to every entry but `.` and `..`.
            if name != "." && name != ".." {
                self.inodes().lookup(&rel);
            }
            entries.push(Ok(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind,
                name: OsString::from(name),
                offset: i as i64 + 1,
                attr: to_attr(inode, &meta),
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let rel = self.child_path(parent, name)?;
        let fh = self.fs.create(&rel, flags as i32, mode)?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: self.counted_stat(&rel)?,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_kind(t: fs::FileType) -> FileType {
    if t.is_dir() {
        FileType::Directory
    } else if t.is_symlink() {
        FileType::Symlink
    } else if t.is_block_device() {
        FileType::BlockDevice
    } else if t.is_char_device() {
        FileType::CharDevice
    } else if t.is_fifo() {
        FileType::NamedPipe
    } else if t.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn timestamp(sec: i64, nsec: i64) -> Timestamp {
    let t = if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    };
    Timestamp::from(t)
}

fn from_timestamp(t: Timestamp) -> SystemTime {
    if t.sec >= 0 {
        UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(t.sec.unsigned_abs())
    }
}

/// Host metadata as FUSE attributes, reported under inode `ino`.
fn to_attr(ino: u64, meta: &Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        #[cfg(target_os = "macos")]
        crtime: timestamp(meta.ctime(), meta.ctime_nsec()),
        kind: to_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: meta.blksize() as u32,
    }
}
