//! Thin wrappers around the mount syscalls used by the runtime driver

use std::io;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use tracing::debug;

fn to_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Bind-mount `source` onto `target`, optionally read-only.
///
/// Read-only bind mounts need a second remount pass; a plain bind mount
/// ignores `MS_RDONLY`.
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
    debug!(
        "bind mount {} -> {} (ro: {})",
        source.display(),
        target.display(),
        read_only
    );

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(to_io)?;

    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(to_io)?;
    }

    Ok(())
}

/// Mount a tmpfs of `size` bytes at `target`
pub fn tmpfs_mount(target: &Path, size: usize) -> io::Result<()> {
    debug!("tmpfs mount at {} (size: {})", target.display(), size);

    let data = format!("size={}", size);
    mount(
        None::<&str>,
        target,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(to_io)
}

/// Detach a mount point
pub fn unmount(target: &Path) -> io::Result<()> {
    umount2(target, MntFlags::MNT_DETACH).map_err(to_io)
}

/// Create a device node mirroring the host device at `host_device`.
///
/// The node kind, permissions and device number are read from the host.
pub fn make_device_node(host_device: &Path, target: &Path) -> io::Result<()> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let meta = std::fs::metadata(host_device)?;
    let file_type = meta.file_type();

    let kind = if file_type.is_char_device() {
        SFlag::S_IFCHR
    } else if file_type.is_block_device() {
        SFlag::S_IFBLK
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a device node", host_device.display()),
        ));
    };

    let mode = Mode::from_bits_truncate(meta.mode());
    mknod(target, kind, mode, meta.rdev()).map_err(to_io)
}
