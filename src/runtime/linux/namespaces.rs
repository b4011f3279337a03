//! Namespace entry helpers

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::path::Path;

use nix::sched::{setns, unshare, CloneFlags};

/// Namespace kinds a job joins when attaching to a container. Order
/// matters: the mount namespace must be joined last so the other
/// `/proc/<pid>/ns` files stay reachable.
const JOIN_ORDER: [&str; 4] = ["uts", "ipc", "net", "mnt"];

fn to_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Clone flags for the init process of a container
pub fn init_unshare_flags(isolate_network: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC;
    if isolate_network {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

/// Unshare into fresh namespaces; used from the init pre-exec hook.
pub fn unshare_namespaces(flags: CloneFlags) -> io::Result<()> {
    unshare(flags).map_err(to_io)
}

/// Open the namespace files of a running process.
///
/// Namespaces the kernel or process does not expose (e.g. `net` when the
/// container shares the host network) are skipped.
pub fn open_namespace_files(pid: i32) -> io::Result<Vec<File>> {
    let mut files = Vec::new();

    for kind in JOIN_ORDER {
        let path = format!("/proc/{}/ns/{}", pid, kind);
        match File::open(Path::new(&path)) {
            Ok(file) => files.push(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    if files.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no namespace files for pid {}", pid),
        ));
    }

    Ok(files)
}

/// Join the namespaces behind the given files, in open order.
pub fn join_namespaces(files: &[File]) -> io::Result<()> {
    for file in files {
        setns(file.as_fd(), CloneFlags::empty()).map_err(to_io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_flags_without_network() {
        let flags = init_unshare_flags(false);
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_init_flags_with_network() {
        let flags = init_unshare_flags(true);
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_open_own_namespace_files() {
        let files = open_namespace_files(std::process::id() as i32).unwrap();
        assert!(!files.is_empty());
    }

    #[test]
    fn test_open_namespace_files_unknown_pid() {
        assert!(open_namespace_files(999_999_999).is_err());
    }
}
