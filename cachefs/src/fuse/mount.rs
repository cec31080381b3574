//! Mount helpers for starting a FUSE session.
//!
//! Thin wrappers over the rfuse3 raw `Session` API. Unprivileged mounts go
//! through fusermount3, which must be in PATH.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use super::CacheFuse;

/// Mount-time knobs, mostly taken from `-o`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSettings {
    pub fs_name: String,
    pub allow_other: bool,
    pub read_only: bool,
    pub default_permissions: bool,
    pub unprivileged: bool,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            fs_name: "cachefs".to_string(),
            allow_other: false,
            read_only: false,
            default_permissions: false,
            unprivileged: false,
        }
    }
}

impl MountSettings {
    /// Apply a comma separated `-o` string. Unknown options are skipped.
    pub fn apply_options(&mut self, raw: &str) {
        for opt in raw.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match opt {
                "allow_other" => self.allow_other = true,
                "ro" => self.read_only = true,
                "rw" => self.read_only = false,
                "default_permissions" => self.default_permissions = true,
                _ => match opt.strip_prefix("fsname=") {
                    Some(name) if !name.is_empty() => self.fs_name = name.to_string(),
                    _ => warn!("ignoring unsupported mount option {opt:?}"),
                },
            }
        }
    }

    fn mount_options(&self) -> MountOptions {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        let mut mo = MountOptions::default();
        mo.fs_name(&self.fs_name)
            .uid(uid)
            .gid(gid)
            .force_readdir_plus(true)
            .allow_other(self.allow_other)
            .read_only(self.read_only)
            .default_permissions(self.default_permissions);
        mo
    }
}

/// Mount `fs` at `mount_point`. The returned handle resolves when the
/// session ends and can be used to unmount.
#[cfg(target_os = "linux")]
pub async fn mount(
    fs: CacheFuse,
    mount_point: impl AsRef<Path>,
    settings: &MountSettings,
) -> std::io::Result<MountHandle> {
    let session = Session::new(settings.mount_options());
    let mount_point = mount_point.as_ref();
    if settings.unprivileged {
        info!("mounting {} (unprivileged)", mount_point.display());
        session.mount_with_unprivileged(fs, mount_point).await
    } else {
        info!("mounting {}", mount_point.display());
        session.mount(fs, mount_point).await
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn mount(
    _fs: CacheFuse,
    _mount_point: impl AsRef<Path>,
    _settings: &MountSettings,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
