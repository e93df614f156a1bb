//! Job descriptors and where they are loaded from.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::AfdConfig;
use crate::error::{Op, Result, StatusError};

/// Lowest priority; what a descriptor without a `priority` line gets.
pub const DEFAULT_PRIORITY: u8 = 9;

/// Everything a worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: u32,
    /// Destination host alias.
    pub host: String,
    pub protocol: String,
    /// Remote directory or URL path.
    pub target: String,
    pub priority: u8,
}

/// Persistent job storage, as seen by the burst dispatcher.
pub trait JobStore {
    /// Build the full descriptor of `job_id` from storage.
    fn load_job(&self, job_id: u32) -> Result<JobDescriptor>;

    /// Number of files still queued under `unique_name`.
    fn pending_files(&self, unique_name: &str) -> Result<usize>;
}

/// Job storage on disk: one descriptor file per job in the messages
/// directory, queued files under `files/outgoing/<unique_name>`.
#[derive(Debug, Clone)]
pub struct MessageDir {
    messages: PathBuf,
    outgoing: PathBuf,
}

impl MessageDir {
    pub fn new(messages: impl Into<PathBuf>, outgoing: impl Into<PathBuf>) -> Self {
        Self {
            messages: messages.into(),
            outgoing: outgoing.into(),
        }
    }

    pub fn from_config(config: &AfdConfig) -> Self {
        Self::new(config.messages_dir(), config.outgoing_dir())
    }

    /// Descriptor files are named by the job id in lowercase hex.
    pub fn message_path(&self, job_id: u32) -> PathBuf {
        self.messages.join(format!("{job_id:x}"))
    }
}

impl JobStore for MessageDir {
    fn load_job(&self, job_id: u32) -> Result<JobDescriptor> {
        let path = self.message_path(job_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StatusError::JobNotFound { job_id });
            }
            Err(e) => return Err(StatusError::io(Op::JobStore, &path, e)),
        };
        parse_descriptor(job_id, &path, &text)
    }

    fn pending_files(&self, unique_name: &str) -> Result<usize> {
        if unique_name.is_empty()
            || unique_name.contains('/')
            || unique_name == "."
            || unique_name == ".."
        {
            return Err(StatusError::Protocol(format!(
                "invalid unique name `{unique_name}`"
            )));
        }

        let dir = self.outgoing.join(unique_name);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StatusError::io(Op::JobStore, &dir, e)),
        };

        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StatusError::io(Op::JobStore, &dir, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| StatusError::io(Op::JobStore, entry.path(), e))?;
            if file_type.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn parse_descriptor(job_id: u32, path: &Path, text: &str) -> Result<JobDescriptor> {
    let mut host = None;
    let mut protocol = String::new();
    let mut target = String::new();
    let mut priority = DEFAULT_PRIORITY;

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let value = value.trim();
        match key {
            "host" => host = Some(value.to_string()),
            "protocol" => protocol = value.to_string(),
            "target" => target = value.to_string(),
            "priority" => {
                priority = value.parse().map_err(|_| {
                    StatusError::Protocol(format!(
                        "{}: invalid priority `{value}`",
                        path.display()
                    ))
                })?;
            }
            other => trace!(job_id, key = other, "ignoring unknown descriptor key"),
        }
    }

    let host = host.filter(|h| !h.is_empty()).ok_or_else(|| {
        StatusError::Protocol(format!("{}: descriptor names no host", path.display()))
    })?;

    Ok(JobDescriptor {
        job_id,
        host,
        protocol,
        target,
        priority,
    })
}
