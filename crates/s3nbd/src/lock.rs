//! Open-file-description (OFD) byte-range locks.
//!
//! OFD locks attach to the open file description rather than the process,
//! so two handles on the same file within one process still conflict. That
//! lets cache I/O, population and eviction coordinate through the
//! filesystem without any in-process lock table.

#![allow(unsafe_code)] // raw fcntl, no nix wrapper covers OFD locks

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// Lock flavor for [`lock_range`] and [`try_lock_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared (read) lock. Multiple holders allowed.
    Shared,
    /// Exclusive (write) lock. Sole holder.
    Exclusive,
}

impl LockKind {
    fn as_flock_type(self) -> libc::c_short {
        match self {
            LockKind::Shared => libc::F_RDLCK as libc::c_short,
            LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

fn flock(kind: libc::c_short, start: u64, len: u64) -> libc::flock {
    // len == 0 means "to end of file" in fcntl semantics
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

fn fcntl_lock(file: &File, cmd: libc::c_int, fl: &libc::flock) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, fl) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Acquire a lock on `[start, start+len)`, blocking until granted.
/// `len == 0` locks to end of file.
pub fn lock_range(file: &File, kind: LockKind, start: u64, len: u64) -> io::Result<()> {
    let fl = flock(kind.as_flock_type(), start, len);
    loop {
        match fcntl_lock(file, libc::F_OFD_SETLKW, &fl) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Try to acquire a lock without blocking. Returns `Ok(false)` if another
/// description holds a conflicting lock.
pub fn try_lock_range(file: &File, kind: LockKind, start: u64, len: u64) -> io::Result<bool> {
    let fl = flock(kind.as_flock_type(), start, len);
    match fcntl_lock(file, libc::F_OFD_SETLK, &fl) {
        Ok(()) => Ok(true),
        Err(e)
            if e.raw_os_error() == Some(libc::EAGAIN)
                || e.raw_os_error() == Some(libc::EACCES) =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Release any lock held by this file description on `[start, start+len)`.
pub fn unlock_range(file: &File, start: u64, len: u64) -> io::Result<()> {
    let fl = flock(libc::F_UNLCK as libc::c_short, start, len);
    fcntl_lock(file, libc::F_OFD_SETLK, &fl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open_pair() -> (tempfile::TempDir, File, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let a = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let b = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (dir, a, b)
    }

    #[test]
    fn exclusive_conflicts_across_descriptions() {
        let (_dir, a, b) = open_pair();
        lock_range(&a, LockKind::Exclusive, 0, 100).unwrap();
        assert!(!try_lock_range(&b, LockKind::Exclusive, 0, 100).unwrap());
        assert!(!try_lock_range(&b, LockKind::Shared, 50, 10).unwrap());
        unlock_range(&a, 0, 100).unwrap();
        assert!(try_lock_range(&b, LockKind::Exclusive, 0, 100).unwrap());
    }

    #[test]
    fn shared_locks_coexist() {
        let (_dir, a, b) = open_pair();
        lock_range(&a, LockKind::Shared, 0, 0).unwrap();
        assert!(try_lock_range(&b, LockKind::Shared, 0, 0).unwrap());
        assert!(!try_lock_range(&b, LockKind::Exclusive, 0, 0).unwrap());
    }

    #[test]
    fn disjoint_ranges_do_not_conflict() {
        let (_dir, a, b) = open_pair();
        lock_range(&a, LockKind::Exclusive, 0, 100).unwrap();
        assert!(try_lock_range(&b, LockKind::Exclusive, 100, 100).unwrap());
    }
}
