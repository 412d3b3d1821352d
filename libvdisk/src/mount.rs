//! Host mount capability.
//!
//! [`HostMounter`] abstracts the three syscalls the plugin needs so that
//! tests can substitute an in-memory double.  [`SystemMounter`] is the real
//! implementation on top of `mount(2)` / `umount(2)`.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::debug;

/// Mount options understood by [`SystemMounter`] as flags rather than
/// filesystem data.
const BIND: &str = "bind";
const READ_ONLY: &str = "ro";

/// Host mount / unmount operations.
#[async_trait]
pub trait HostMounter: Send + Sync {
    /// Return `Ok(true)` when `path` is most likely *not* a mount point.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] when `path` does not exist;
    /// callers treat that as "not mounted".
    async fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool>;

    /// Mount `source` at `target`.
    ///
    /// `options` uses `mount(8)` spelling; `"bind"` and `"ro"` map to flags,
    /// everything else is passed to the filesystem as data.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> io::Result<()>;

    /// Unmount `target`.
    async fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// Return `true` if `path` is listed as a mount point in `mounts`, which has
/// the `/proc/self/mounts` format:
/// `<device> <mountpoint> <fstype> <options> <dump> <pass>`.
///
/// Mount points with whitespace appear octal-escaped (`\040`), so they are
/// unescaped before comparison.
pub fn is_listed_mountpoint(mounts: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mp| unescape_mount_field(mp) == wanted)
}

fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let octal = tail
            .get(..3)
            .filter(|o| o.bytes().all(|b| matches!(b, b'0'..=b'7')))
            .and_then(|o| u8::from_str_radix(o, 8).ok());
        match octal {
            Some(byte) => {
                out.push(byte as char);
                rest = &tail[3..];
            }
            None => {
                out.push('\\');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Real mounter backed by `mount(2)`, `umount(2)` and `/proc/self/mounts`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

#[async_trait]
impl HostMounter for SystemMounter {
    async fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::metadata(path).await?;
        let mounts = tokio::fs::read_to_string("/proc/self/mounts").await?;
        Ok(!is_listed_mountpoint(&mounts, path))
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> io::Result<()> {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for opt in options {
            match opt.as_str() {
                BIND => flags |= MsFlags::MS_BIND,
                READ_ONLY => flags |= MsFlags::MS_RDONLY,
                other => data.push(other),
            }
        }
        let data = data.join(",");
        let data = (!data.is_empty()).then_some(data.as_str());

        debug!(source = %source.display(), target = %target.display(), ?flags, "mount");
        nix::mount::mount(Some(source), target, fs_type, flags, data)?;

        // The kernel ignores MS_RDONLY on the initial bind; a remount is
        // required to enforce it.
        if flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> io::Result<()> {
        debug!(target = %target.display(), "umount");
        nix::mount::umount(target)?;
        Ok(())
    }
}
