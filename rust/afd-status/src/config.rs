//! Runtime configuration: where the work directory lives and how long the
//! bounded polls wait.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layout::{AreaKind, AreaPaths};

/// Environment variable naming the AFD work directory.
pub const WORK_DIR_ENV: &str = "AFD_WORK_DIR";

/// Sub-directory holding ID files, regions and FIFOs.
pub const FIFO_DIR: &str = "fifodir";

/// Heartbeat/PID region file name inside [`FIFO_DIR`].
pub const HEARTBEAT_FILE: &str = "afd_active";

/// Tuning for the burst-continuation slot poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstConfig {
    /// How often the requester re-reads the job status slot.
    pub poll_interval: Duration,
    /// Total time to wait for the worker to fill the slot.
    pub max_wait: Duration,
    /// Upper bound on re-requests when a continued job turns out empty.
    pub max_iterations: u32,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(20),
            max_iterations: 16,
        }
    }
}

/// Tuning for the supervisor liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub poll_interval: Duration,
    /// Pause after SIGTERM before looking for survivors.
    pub term_grace: Duration,
    /// How long survivors get before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            term_grace: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Process-wide AFD settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfdConfig {
    pub work_dir: PathBuf,
    pub burst: BurstConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for AfdConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let work_dir = match home {
            Some(home) => home.join("afd"),
            None => PathBuf::from("/tmp/afd"),
        };
        Self::with_work_dir(work_dir)
    }
}

impl AfdConfig {
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            burst: BurstConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Defaults, with the work directory taken from `AFD_WORK_DIR` if set.
    pub fn from_env() -> Self {
        match std::env::var_os(WORK_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::with_work_dir(dir),
            _ => Self::default(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.work_dir.join(FIFO_DIR)
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.work_dir.join("messages")
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.work_dir.join("files").join("outgoing")
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.fifo_dir().join(HEARTBEAT_FILE)
    }

    /// Paths of the ID file and versioned regions for one area.
    pub fn area_paths(&self, kind: AreaKind) -> AreaPaths {
        AreaPaths::new(self.fifo_dir(), kind)
    }

    /// Create the directories the areas and job store live in.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.fifo_dir())?;
        std::fs::create_dir_all(self.messages_dir())?;
        std::fs::create_dir_all(self.outgoing_dir())
    }
}
