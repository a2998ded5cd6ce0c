//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. Unprivileged mounts go through fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};
use tracing::info;

use super::MongoFuse;
use crate::store::DocumentStore;

/// Mount options for MongoFS: files appear owned by the mounting user.
fn default_mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mut mo = MountOptions::default();
    // no allow_other; the mountpoint must be empty
    mo.fs_name("mongofs").uid(uid).gid(gid);
    mo
}

/// Mount on an empty directory without root, via fusermount3.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<S>(
    fs: MongoFuse<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle>
where
    S: DocumentStore + 'static,
{
    info!(mountpoint = %mount_point.as_ref().display(), "mounting (unprivileged)");
    Session::new(default_mount_options())
        .mount_with_unprivileged(fs, mount_point.as_ref())
        .await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<S>(
    _fs: MongoFuse<S>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle>
where
    S: DocumentStore + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

/// Mount directly through /dev/fuse; needs CAP_SYS_ADMIN.
pub async fn mount_privileged<S>(
    fs: MongoFuse<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle>
where
    S: DocumentStore + 'static,
{
    info!(mountpoint = %mount_point.as_ref().display(), "mounting (privileged)");
    Session::new(default_mount_options())
        .mount(fs, mount_point.as_ref())
        .await
}

/// Mount with the mode selected on the command line.
pub async fn mount<S>(
    fs: MongoFuse<S>,
    mount_point: impl AsRef<Path>,
    privileged: bool,
) -> std::io::Result<MountHandle>
where
    S: DocumentStore + 'static,
{
    if privileged {
        mount_privileged(fs, mount_point).await
    } else {
        mount_unprivileged(fs, mount_point).await
    }
}
