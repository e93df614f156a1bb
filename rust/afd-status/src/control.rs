//! Control channel from the dispatcher to its transfer workers.
//!
//! Tokens are raw native-endian `i32`s. A negative value `-pid` asks worker
//! `pid` to continue its burst; a positive `pid` reports that the worker
//! finished. Replies never travel back on this channel; the dispatcher
//! watches the worker's job status slot instead.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{Op, Result, StatusError};
use crate::wait::Deadline;

const TOKEN_SIZE: usize = size_of::<i32>();

/// A decoded control token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Worker `pid` should pick up the next queued job for its host.
    ContinueBurst { pid: i32 },
    /// Worker `pid` is done with its job.
    Finished { pid: i32 },
}

impl ControlToken {
    pub fn pid(self) -> i32 {
        match self {
            ControlToken::ContinueBurst { pid } | ControlToken::Finished { pid } => pid,
        }
    }

    /// Encode for the wire. Only meaningful for a positive pid; [`ControlTx::send`]
    /// refuses anything else.
    pub fn to_raw(self) -> i32 {
        match self {
            ControlToken::ContinueBurst { pid } => pid.wrapping_neg(),
            ControlToken::Finished { pid } => pid,
        }
    }

    /// Decode a raw token. `0` and `i32::MIN` carry no pid and are protocol
    /// violations.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 | i32::MIN => Err(StatusError::Protocol(format!(
                "malformed control token {raw}"
            ))),
            n if n < 0 => Ok(ControlToken::ContinueBurst { pid: -n }),
            n => Ok(ControlToken::Finished { pid: n }),
        }
    }
}

/// Create a named pipe at `path` (mode 0600). An existing FIFO is reused;
/// any other existing file is an error.
pub fn make_fifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        StatusError::io(
            Op::ControlChannel,
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"),
        )
    })?;

    // SAFETY: c_path is a valid NUL-terminated string.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } == 0 {
        debug!(path = %path.display(), "created control fifo");
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::AlreadyExists {
        let meta =
            std::fs::metadata(path).map_err(|e| StatusError::io(Op::ControlChannel, path, e))?;
        if meta.file_type().is_fifo() {
            return Ok(());
        }
        return Err(StatusError::io(
            Op::ControlChannel,
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a fifo"),
        ));
    }
    Err(StatusError::io(Op::ControlChannel, path, err))
}

/// Label used in errors from in-process channels.
const IN_PROCESS: &str = "<in-process>";

/// Sending end.
pub enum ControlTx {
    Fifo { file: File, path: PathBuf },
    InProcess(mpsc::Sender<i32>),
}

/// Receiving end.
pub struct ControlRx {
    source: RxSource,
    /// Bytes of a token not yet complete.
    pending: Vec<u8>,
}

enum RxSource {
    Fifo { file: File, path: PathBuf },
    InProcess(mpsc::Receiver<i32>),
}

/// An in-process channel pair, for workers running as threads.
pub fn channel() -> (ControlTx, ControlRx) {
    let (tx, rx) = mpsc::channel();
    (
        ControlTx::InProcess(tx),
        ControlRx {
            source: RxSource::InProcess(rx),
            pending: Vec::new(),
        },
    )
}

impl ControlTx {
    /// Open the write end of the FIFO at `path`. Fails with an I/O error
    /// (`ENXIO`) if no worker has the read end open.
    pub fn open_fifo(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| StatusError::io(Op::ControlChannel, path, e))?;
        Ok(ControlTx::Fifo {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Write one token. Tokens are smaller than `PIPE_BUF`, so each write is
    /// atomic with respect to other writers.
    pub fn send(&mut self, token: ControlToken) -> Result<()> {
        if token.pid() <= 0 {
            return Err(StatusError::Protocol(format!(
                "control token {token:?} needs a positive pid"
            )));
        }
        let raw = token.to_raw();
        match self {
            ControlTx::Fifo { file, path } => file
                .write_all(&raw.to_ne_bytes())
                .map_err(|e| StatusError::io(Op::ControlChannel, &*path, e)),
            ControlTx::InProcess(tx) => tx.send(raw).map_err(|_| {
                StatusError::io(
                    Op::ControlChannel,
                    IN_PROCESS,
                    io::Error::from(io::ErrorKind::BrokenPipe),
                )
            }),
        }?;
        trace!(raw, "sent control token");
        Ok(())
    }

    /// Send raw bytes as-is. Lets tests and diagnostics inject malformed
    /// input.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            ControlTx::Fifo { file, path } => file
                .write_all(bytes)
                .map_err(|e| StatusError::io(Op::ControlChannel, &*path, e)),
            ControlTx::InProcess(_) => Err(StatusError::io(
                Op::ControlChannel,
                IN_PROCESS,
                io::Error::new(io::ErrorKind::Unsupported, "raw bytes need a fifo"),
            )),
        }
    }
}

impl ControlRx {
    /// Open the read end of the FIFO at `path`.
    ///
    /// Opened read-write so the open does not wait for a writer and the
    /// reader never sees end-of-file between dispatchers.
    pub fn open_fifo(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StatusError::io(Op::ControlChannel, path, e))?;
        Ok(Self {
            source: RxSource::Fifo {
                file,
                path: path.to_path_buf(),
            },
            pending: Vec::new(),
        })
    }

    /// Wait up to `timeout` for the next well-formed token.
    ///
    /// Malformed tokens are logged and skipped. Trailing bytes that never
    /// complete a token by the time the wait ends are logged and discarded.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<ControlToken>> {
        let deadline = Deadline::after(timeout);

        loop {
            while self.pending.len() >= TOKEN_SIZE {
                let mut raw = [0u8; TOKEN_SIZE];
                raw.copy_from_slice(&self.pending[..TOKEN_SIZE]);
                self.pending.drain(..TOKEN_SIZE);
                match ControlToken::from_raw(i32::from_ne_bytes(raw)) {
                    Ok(token) => return Ok(Some(token)),
                    Err(e) => warn!(error = %e, "dropping control token"),
                }
            }

            let remaining = deadline.remaining();
            if remaining.is_zero() || !self.fill(remaining)? {
                if !self.pending.is_empty() {
                    warn!(
                        bytes = self.pending.len(),
                        "dropping incomplete control token"
                    );
                    self.pending.clear();
                }
                return Ok(None);
            }
        }
    }

    /// Read whatever arrives within `timeout` into `pending`. Returns false
    /// on timeout.
    fn fill(&mut self, timeout: Duration) -> Result<bool> {
        match &mut self.source {
            RxSource::InProcess(rx) => match rx.recv_timeout(timeout) {
                Ok(raw) => {
                    self.pending.extend_from_slice(&raw.to_ne_bytes());
                    Ok(true)
                }
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(false),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(StatusError::io(
                    Op::ControlChannel,
                    IN_PROCESS,
                    io::Error::from(io::ErrorKind::BrokenPipe),
                )),
            },
            RxSource::Fifo { file, path } => {
                let readable = wait_readable(file, timeout)
                    .map_err(|e| StatusError::io(Op::ControlChannel, &*path, e))?;
                if !readable {
                    return Ok(false);
                }
                let mut buf = [0u8; 64];
                let n = loop {
                    match file.read(&mut buf) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(StatusError::io(Op::ControlChannel, &*path, e)),
                    }
                };
                self.pending.extend_from_slice(&buf[..n]);
                Ok(n > 0)
            }
        }
    }
}

fn wait_readable(file: &File, timeout: Duration) -> io::Result<bool> {
    let deadline = Deadline::after(timeout);
    loop {
        let remaining = deadline.remaining();
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            0 => return Ok(false),
            _ => return Ok(true),
        }
    }
}
