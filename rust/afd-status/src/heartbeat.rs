//! Supervisor liveness.
//!
//! The supervisor maps a small region and keeps incrementing a counter in
//! it. Anyone can tell whether it is alive by watching that counter change
//! over a window; a single read says nothing.
//!
//! Region layout, `N` supervised processes:
//!
//! ```text
//! ┌──────────────────────┬──────────────┬─────────┬───────────────┐
//! │ pid: [i32; N + 1]    │ counter: u32 │ pad: u8 │ shutdown: u8  │
//! └──────────────────────┴──────────────┴─────────┴───────────────┘
//! ```
//!
//! Slot 0 is the supervisor itself.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use afd_primitives::{FileCleanup, MmapRegion};

use crate::config::HeartbeatConfig;
use crate::error::{Op, Result, StatusError};
use crate::wait::poll_until;

const PID_SIZE: usize = size_of::<i32>();
/// Counter, pad byte and shutdown flag behind the PID table.
const TRAILER_SIZE: usize = 6;

/// Byte size of a heartbeat region for `no_of_processes` workers.
#[inline]
pub const fn heartbeat_size(no_of_processes: usize) -> usize {
    (no_of_processes + 1) * PID_SIZE + TRAILER_SIZE
}

/// A mapped heartbeat region.
pub struct HeartbeatRegion {
    mmap: MmapRegion,
    slots: usize,
}

impl HeartbeatRegion {
    /// Create (or recreate) the region with a zeroed PID table and counter.
    pub fn create(path: &Path, no_of_processes: usize) -> Result<Self> {
        let mmap = MmapRegion::create(path, heartbeat_size(no_of_processes), FileCleanup::Manual)
            .map_err(|e| StatusError::io(Op::CreateRegion, path, e))?;
        debug!(path = %path.display(), no_of_processes, "created heartbeat region");
        Ok(Self {
            mmap,
            slots: no_of_processes + 1,
        })
    }

    /// Map an existing region. The PID table length follows from the file
    /// size.
    pub fn attach(path: &Path) -> Result<Self> {
        let mmap = MmapRegion::attach(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StatusError::NotFound {
                path: path.to_path_buf(),
            },
            _ => StatusError::io(Op::Heartbeat, path, e),
        })?;

        let len = mmap.len();
        if len < heartbeat_size(0) || (len - TRAILER_SIZE) % PID_SIZE != 0 {
            let processes = (len.saturating_sub(TRAILER_SIZE) / PID_SIZE).saturating_sub(1);
            return Err(StatusError::SizeMismatch {
                path: path.to_path_buf(),
                expected: heartbeat_size(processes) as u64,
                actual: len as u64,
            });
        }

        Ok(Self {
            slots: (len - TRAILER_SIZE) / PID_SIZE,
            mmap,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.mmap.path()
    }

    /// Entries in the PID table (supervised processes plus one).
    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    fn pid_cell(&self, index: usize) -> &AtomicI32 {
        // SAFETY: callers check index < slots; the mapping outlives self.
        unsafe { &*self.mmap.region().ptr_at::<AtomicI32>(index * PID_SIZE) }
    }

    fn counter_cell(&self) -> &AtomicU32 {
        unsafe { &*self.mmap.region().ptr_at::<AtomicU32>(self.slots * PID_SIZE) }
    }

    fn shutdown_cell(&self) -> &AtomicU8 {
        unsafe { &*self.mmap.region().ptr_at::<AtomicU8>(self.slots * PID_SIZE + 5) }
    }

    pub fn pid(&self, index: usize) -> Option<i32> {
        (index < self.slots).then(|| self.pid_cell(index).load(Ordering::Acquire))
    }

    pub fn pids(&self) -> Vec<i32> {
        (0..self.slots)
            .map(|i| self.pid_cell(i).load(Ordering::Acquire))
            .collect()
    }

    pub fn set_pid(&self, index: usize, pid: i32) -> Result<()> {
        if index >= self.slots {
            return Err(StatusError::RecordOutOfRange {
                index,
                capacity: self.slots,
            });
        }
        self.pid_cell(index).store(pid, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter_cell().load(Ordering::Acquire)
    }

    /// Advance the counter; returns the new value. Wraps.
    #[inline]
    pub fn beat(&self) -> u32 {
        self.counter_cell()
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_cell().store(1, Ordering::Release);
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_cell().load(Ordering::Acquire) != 0
    }

    /// Unmap and delete the backing file. Failures are logged only.
    pub fn remove(self) {
        let mut mmap = self.mmap;
        match mmap.unlink() {
            Ok(()) => debug!(path = %mmap.path().display(), "removed heartbeat region"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %mmap.path().display(),
                error = %e,
                "cannot remove heartbeat region"
            ),
        }
    }
}

/// What a liveness check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The counter moved within the window.
    Active,
    /// The counter stood still for the whole window.
    Inactive,
    /// No heartbeat region exists.
    Missing,
}

/// What to do about the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    AlreadyRunning,
    /// No live supervisor; leftovers were cleaned up and a new one may
    /// start.
    Start,
}

/// Watches a heartbeat region from outside the supervisor.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    path: PathBuf,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(path: impl Into<PathBuf>, config: HeartbeatConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the counter changes within `wait`. Errors mapping the region
    /// are logged and count as inactive.
    pub fn is_active(&self, wait: Duration) -> bool {
        match self.check(wait, false) {
            Ok(liveness) => liveness == Liveness::Active,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read heartbeat region");
                false
            }
        }
    }

    /// Watch the counter for up to `wait`. With `cleanup`, an inactive
    /// supervisor's recorded processes are terminated and the region file
    /// removed.
    pub fn check(&self, wait: Duration, cleanup: bool) -> Result<Liveness> {
        let region = match HeartbeatRegion::attach(&self.path) {
            Ok(region) => region,
            Err(StatusError::NotFound { .. }) => return Ok(Liveness::Missing),
            Err(e) => return Err(e),
        };

        let initial = region.counter();
        let moved = poll_until(self.config.poll_interval, wait, || {
            (region.counter() != initial).then_some(())
        });
        if moved.is_ok() {
            trace!(path = %self.path.display(), "supervisor heartbeat is moving");
            return Ok(Liveness::Active);
        }

        info!(
            path = %self.path.display(),
            counter = initial,
            ?wait,
            "supervisor heartbeat is frozen"
        );
        if cleanup {
            terminate_recorded(&region.pids(), &self.config);
            region.remove();
        }
        Ok(Liveness::Inactive)
    }

    /// Decide whether a supervisor needs starting, cleaning up after a dead
    /// one first.
    pub fn decide(&self, wait: Duration) -> Result<SupervisorAction> {
        match self.check(wait, true)? {
            Liveness::Active => Ok(SupervisorAction::AlreadyRunning),
            Liveness::Inactive | Liveness::Missing => Ok(SupervisorAction::Start),
        }
    }
}

/// SIGTERM every recorded process, give them `term_grace`, then SIGKILL
/// whatever is still around after `kill_grace`.
fn terminate_recorded(pids: &[i32], config: &HeartbeatConfig) {
    let own = std::process::id() as i32;
    let targets: Vec<i32> = pids
        .iter()
        .copied()
        .filter(|&pid| pid > 0 && pid != own)
        .collect();
    if targets.is_empty() {
        return;
    }

    for &pid in &targets {
        send_signal(pid, libc::SIGTERM);
    }
    std::thread::sleep(config.term_grace);

    let survivors: Vec<i32> = targets.into_iter().filter(|&pid| is_alive(pid)).collect();
    if survivors.is_empty() {
        return;
    }

    let _ = poll_until(config.poll_interval, config.kill_grace, || {
        (!survivors.iter().any(|&pid| is_alive(pid))).then_some(())
    });
    for pid in survivors.into_iter().filter(|&pid| is_alive(pid)) {
        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        send_signal(pid, libc::SIGKILL);
    }
}

fn send_signal(pid: i32, signal: libc::c_int) {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signal, error = %err, "failed to signal process");
        }
    } else {
        debug!(pid, signal, "signalled process");
    }
}

fn is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
