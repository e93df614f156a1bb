//! Error type shared by every status-area operation.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// The operation that was in progress when an I/O error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreateRegion,
    OpenRegion,
    ReadIdFile,
    WriteIdFile,
    LockIdFile,
    LockRecord,
    Heartbeat,
    ControlChannel,
    JobStore,
    Cleanup,
    ReadConfig,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::CreateRegion => "create region",
            Op::OpenRegion => "open region",
            Op::ReadIdFile => "read id file",
            Op::WriteIdFile => "write id file",
            Op::LockIdFile => "lock id file",
            Op::LockRecord => "lock record",
            Op::Heartbeat => "heartbeat",
            Op::ControlChannel => "control channel",
            Op::JobStore => "job store",
            Op::Cleanup => "cleanup",
            Op::ReadConfig => "read config",
        };
        f.write_str(name)
    }
}

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The process cannot continue safely and should exit.
    Fatal,
    /// Log and carry on with documented defaults.
    RecoverableLocal,
    /// A bounded retry ran out; give up on this attempt only.
    RecoverableRetry,
    /// A peer broke the protocol; abort the specific operation.
    ProtocolViolation,
}

/// Errors from status areas, the migrator, the attach guard, burst
/// continuation and the heartbeat monitor.
#[derive(Debug)]
pub enum StatusError {
    Io {
        op: Op,
        path: PathBuf,
        source: io::Error,
    },
    /// The region file does not exist.
    NotFound { path: PathBuf },
    /// The file length disagrees with `header + count * record_size`; the
    /// region was written with a different record layout.
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    BadHeader {
        path: PathBuf,
        reason: &'static str,
    },
    /// The region has been superseded.
    Stale { path: PathBuf },
    RecordOutOfRange { index: usize, capacity: usize },
    InvalidConfig {
        file: PathBuf,
        line: usize,
        reason: String,
    },
    /// The attached region went stale but no newer region could be mapped.
    ReattachFailed {
        version_id: Option<i32>,
        source: Box<StatusError>,
    },
    Protocol(String),
    JobNotFound { job_id: u32 },
}

impl StatusError {
    pub(crate) fn io(op: Op, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StatusError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Map this error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            StatusError::Io { op, .. } => match op {
                Op::CreateRegion
                | Op::WriteIdFile
                | Op::ReadIdFile
                | Op::LockIdFile
                | Op::ReadConfig => ErrorClass::Fatal,
                Op::ControlChannel => ErrorClass::RecoverableRetry,
                Op::OpenRegion
                | Op::LockRecord
                | Op::Heartbeat
                | Op::JobStore
                | Op::Cleanup => ErrorClass::RecoverableLocal,
            },
            StatusError::NotFound { .. }
            | StatusError::SizeMismatch { .. }
            | StatusError::BadHeader { .. }
            | StatusError::Stale { .. } => ErrorClass::RecoverableLocal,
            StatusError::InvalidConfig { .. } | StatusError::ReattachFailed { .. } => {
                ErrorClass::Fatal
            }
            StatusError::RecordOutOfRange { .. }
            | StatusError::Protocol(_)
            | StatusError::JobNotFound { .. } => ErrorClass::ProtocolViolation,
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::Io { op, path, source } => {
                write!(f, "{op} failed for {}: {source}", path.display())
            }
            StatusError::NotFound { path } => write!(f, "{} does not exist", path.display()),
            StatusError::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "{} is {actual} bytes, expected {expected} (record layout skew)",
                path.display()
            ),
            StatusError::BadHeader { path, reason } => {
                write!(f, "bad header in {}: {reason}", path.display())
            }
            StatusError::Stale { path } => write!(f, "{} is stale", path.display()),
            StatusError::RecordOutOfRange { index, capacity } => {
                write!(f, "record {index} out of range (capacity {capacity})")
            }
            StatusError::InvalidConfig { file, line, reason } => {
                write!(f, "{}:{line}: {reason}", file.display())
            }
            StatusError::ReattachFailed { version_id, source } => match version_id {
                Some(v) => write!(f, "cannot reattach to region version {v}: {source}"),
                None => write!(f, "cannot reattach, no current region version: {source}"),
            },
            StatusError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            StatusError::JobNotFound { job_id } => write!(f, "job #{job_id:x} not found"),
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Io { source, .. } => Some(source),
            StatusError::ReattachFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

pub type Result<T, E = StatusError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_failures_are_fatal() {
        let err = StatusError::io(
            Op::CreateRegion,
            "/nowhere/fsa_status.0",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("create region failed for /nowhere/fsa_status.0"));
    }

    #[test]
    fn old_region_problems_are_local() {
        let err = StatusError::SizeMismatch {
            path: "fsa_status.3".into(),
            expected: 16,
            actual: 17,
        };
        assert_eq!(err.class(), ErrorClass::RecoverableLocal);
    }

    #[test]
    fn broken_control_channel_is_retryable() {
        let err = StatusError::io(
            Op::ControlChannel,
            "sf_burst.fifo",
            io::Error::from(io::ErrorKind::BrokenPipe),
        );
        assert_eq!(err.class(), ErrorClass::RecoverableRetry);
    }

    #[test]
    fn reattach_failure_is_fatal_and_keeps_source() {
        let err = StatusError::ReattachFailed {
            version_id: Some(4),
            source: Box::new(StatusError::NotFound {
                path: "mon_status.4".into(),
            }),
        };
        assert!(err.is_fatal());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            err.to_string(),
            "cannot reattach to region version 4: mon_status.4 does not exist"
        );
    }
}
