//! Advisory byte-range locks.
//!
//! On Linux these are open-file-description locks (`F_OFD_SETLK*`): two
//! independent `open()`s of the same file conflict with each other even
//! inside one process, and the lock goes away with the file description.
//! Elsewhere we fall back to classic POSIX record locks, which only conflict
//! across processes.
//!
//! The locks are co-operative. Nothing stops a writer that skips locking
//! from touching the bytes.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};

#[cfg(target_os = "linux")]
const SETLK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const SETLKW: libc::c_int = libc::F_OFD_SETLKW;
#[cfg(not(target_os = "linux"))]
const SETLK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const SETLKW: libc::c_int = libc::F_SETLKW;

/// Shared or exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Whether acquiring waits for a conflicting holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Blocking,
    /// Fail with [`io::ErrorKind::WouldBlock`] if the range is held.
    NonBlocking,
}

/// A held byte-range lock. Released on drop, on every exit path.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ScopedLock<'a> {
    fd: BorrowedFd<'a>,
    kind: LockKind,
    start: u64,
    len: u64,
}

impl<'a> ScopedLock<'a> {
    /// Lock `len` bytes starting at `start`. `len == 0` means "to end of
    /// file, including future growth".
    pub fn acquire(
        fd: BorrowedFd<'a>,
        start: u64,
        len: u64,
        kind: LockKind,
        mode: LockMode,
    ) -> io::Result<Self> {
        let l_type = match kind {
            LockKind::Read => libc::F_RDLCK,
            LockKind::Write => libc::F_WRLCK,
        };
        let cmd = match mode {
            LockMode::Blocking => SETLKW,
            LockMode::NonBlocking => SETLK,
        };

        loop {
            match fcntl_lock(fd, cmd, l_type as libc::c_short, start, len) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if mode == LockMode::NonBlocking && is_contended(&e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("byte range {start}+{len} is locked"),
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            fd,
            kind,
            start,
            len,
        })
    }

    /// Lock the whole file.
    pub fn whole_file(fd: BorrowedFd<'a>, kind: LockKind, mode: LockMode) -> io::Result<Self> {
        Self::acquire(fd, 0, 0, kind, mode)
    }

    #[inline]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = fcntl_lock(
            self.fd,
            SETLK,
            libc::F_UNLCK as libc::c_short,
            self.start,
            self.len,
        ) {
            tracing::warn!(
                start = self.start,
                len = self.len,
                error = %e,
                "failed to release byte-range lock"
            );
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EACCES))
}

fn fcntl_lock(
    fd: BorrowedFd<'_>,
    cmd: libc::c_int,
    l_type: libc::c_short,
    start: u64,
    len: u64,
) -> io::Result<()> {
    // SAFETY: flock is plain data; zeroed is a valid starting point and
    // l_pid must be 0 for OFD locks.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;

    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), cmd, &mut fl as *mut libc::flock) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsFd;

    fn open_twice() -> (tempfile::TempDir, File, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, [0u8; 256]).unwrap();
        let a = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let b = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (dir, a, b)
    }

    #[test]
    fn write_lock_excludes_other_description() {
        let (_dir, a, b) = open_twice();
        let held = ScopedLock::acquire(a.as_fd(), 16, 32, LockKind::Write, LockMode::Blocking)
            .unwrap();

        let err = ScopedLock::acquire(b.as_fd(), 16, 32, LockKind::Write, LockMode::NonBlocking)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        drop(held);
        let _again =
            ScopedLock::acquire(b.as_fd(), 16, 32, LockKind::Write, LockMode::NonBlocking)
                .unwrap();
    }

    #[test]
    fn disjoint_ranges_do_not_conflict() {
        let (_dir, a, b) = open_twice();
        let _first =
            ScopedLock::acquire(a.as_fd(), 0, 16, LockKind::Write, LockMode::Blocking).unwrap();
        let _second =
            ScopedLock::acquire(b.as_fd(), 16, 16, LockKind::Write, LockMode::NonBlocking)
                .unwrap();
    }

    #[test]
    fn readers_share_writers_wait() {
        let (_dir, a, b) = open_twice();
        let _r1 = ScopedLock::whole_file(a.as_fd(), LockKind::Read, LockMode::Blocking).unwrap();
        let _r2 =
            ScopedLock::whole_file(b.as_fd(), LockKind::Read, LockMode::NonBlocking).unwrap();

        let c = OpenOptions::new()
            .read(true)
            .write(true)
            .open(_dir.path().join("locked"))
            .unwrap();
        let err = ScopedLock::whole_file(c.as_fd(), LockKind::Write, LockMode::NonBlocking)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn blocking_waiter_proceeds_after_release() {
        let (_dir, a, b) = open_twice();
        let held =
            ScopedLock::acquire(a.as_fd(), 0, 8, LockKind::Write, LockMode::Blocking).unwrap();

        let waiter = std::thread::spawn(move || {
            let started = std::time::Instant::now();
            let _lock =
                ScopedLock::acquire(b.as_fd(), 0, 8, LockKind::Write, LockMode::Blocking).unwrap();
            started.elapsed()
        });

        std::thread::sleep(std::time::Duration::from_millis(100));
        drop(held);

        let waited = waiter.join().unwrap();
        assert!(waited >= std::time::Duration::from_millis(50));
    }
}
