//! File system helpers.

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{format_err, Error};
use nix::sys::stat::{lstat, utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;

/// Copy a regular file and carry the access/modification timestamps over
/// to the copy.
pub fn copy_preserving_times(src: &Path, dst: &Path) -> Result<(), Error> {
    let stat = lstat(src).map_err(|err| format_err!("unable to stat {:?} - {}", src, err))?;

    std::fs::copy(src, dst)
        .map_err(|err| format_err!("unable to copy {:?} to {:?} - {}", src, dst, err))?;

    let atime = TimeSpec::new(stat.st_atime, stat.st_atime_nsec);
    let mtime = TimeSpec::new(stat.st_mtime, stat.st_mtime_nsec);
    utimensat(
        None::<RawFd>,
        dst,
        &atime,
        &mtime,
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|err| format_err!("unable to set timestamps on {:?} - {}", dst, err))?;

    Ok(())
}

/// Check whether a process with the given pid is still alive.
pub fn process_is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_is_alive(std::process::id() as i32));
    }

    #[test]
    fn copy_keeps_mtime() {
        let dir = std::env::temp_dir().join(format!("dcfh-fs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("src.txt");
        let dst = dir.join("dst.txt");
        std::fs::write(&src, b"payload").unwrap();

        copy_preserving_times(&src, &dst).unwrap();

        let a = lstat(&src).unwrap();
        let b = lstat(&dst).unwrap();
        assert_eq!(a.st_mtime, b.st_mtime);
        assert_eq!(a.st_mtime_nsec, b.st_mtime_nsec);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
