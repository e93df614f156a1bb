//! FSA: the file transfer status area. One [`HostStatus`] per destination
//! host.

use std::borrow::Cow;
use std::io;
use std::path::Path;

use crate::entity_config::{field_or, load_entities, parse_entities};
use crate::error::{Op, Result, StatusError};
use crate::layout::AreaKind;
use crate::record::{
    JobStatusSlot, MAX_ALIAS_LENGTH, StatusRecord, name_bytes, name_str, put_name,
};

/// Job status slots per host; the hard upper bound on parallel transfers.
pub const MAX_NO_PARALLEL_JOBS: usize = 5;

/// Entries in the error-history ring buffer.
pub const ERROR_HISTORY_LENGTH: usize = 5;

pub const MAX_REAL_HOSTNAME_LENGTH: usize = 40;

pub const DEFAULT_ALLOWED_TRANSFERS: i32 = 2;
pub const DEFAULT_MAX_ERRORS: i32 = 10;
pub const DEFAULT_RETRY_INTERVAL: i32 = 120;

// host_status bits
pub const HOST_DISABLED: u32 = 1 << 0;
pub const PAUSE_QUEUE: u32 = 1 << 1;
pub const STOP_TRANSFER: u32 = 1 << 2;
pub const ERROR_ACKNOWLEDGED: u32 = 1 << 3;
pub const ERROR_OFFLINE: u32 = 1 << 4;

/// Configuration of one destination host (one HOST_CONFIG line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub alias: String,
    pub real_hostname: String,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub disabled: bool,
}

impl HostConfig {
    /// A host with default limits whose real hostname equals its alias.
    pub fn new(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            real_hostname: alias.clone(),
            alias,
            allowed_transfers: DEFAULT_ALLOWED_TRANSFERS,
            max_errors: DEFAULT_MAX_ERRORS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            disabled: false,
        }
    }

    /// `alias:real_hostname:allowed_transfers:max_errors:retry_interval[:disabled]`
    fn from_fields(fields: &[&str]) -> Result<Self, String> {
        let alias = fields.first().copied().unwrap_or_default();
        let mut host = HostConfig::new(alias);
        if let Some(real) = fields.get(1).filter(|r| !r.is_empty()) {
            if real.len() >= MAX_REAL_HOSTNAME_LENGTH {
                return Err(format!("real hostname `{real}` too long"));
            }
            host.real_hostname = real.to_string();
        }
        host.allowed_transfers =
            field_or(fields, 2, "allowed_transfers", DEFAULT_ALLOWED_TRANSFERS)?;
        if !(1..=MAX_NO_PARALLEL_JOBS as i32).contains(&host.allowed_transfers) {
            return Err(format!(
                "allowed_transfers must be 1..={MAX_NO_PARALLEL_JOBS}, got {}",
                host.allowed_transfers
            ));
        }
        host.max_errors = field_or(fields, 3, "max_errors", DEFAULT_MAX_ERRORS)?;
        host.retry_interval = field_or(fields, 4, "retry_interval", DEFAULT_RETRY_INTERVAL)?;
        host.disabled = field_or(fields, 5, "disabled", 0u8)? != 0;
        Ok(host)
    }

    pub fn parse(file: &Path, text: &str) -> Result<Vec<Self>> {
        parse_entities(file, text, Self::from_fields, |h| h.alias.as_str())
    }

    pub fn load(path: &Path) -> Result<Vec<Self>> {
        load_entities(path, Self::from_fields, |h| h.alias.as_str())
    }
}

/// Transfer status of one destination host.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStatus {
    pub host_alias: [u8; MAX_ALIAS_LENGTH],
    pub real_hostname: [u8; MAX_REAL_HOSTNAME_LENGTH],
    pub host_status: u32,
    pub allowed_transfers: i32,
    pub active_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub error_counter: i32,
    pub total_errors: u32,
    pub jobs_queued: u32,
    pub file_counter_done: u32,
    pub connections: u32,
    pub bytes_send: u64,
    pub total_file_size: u64,
    pub total_file_counter: u32,
    /// Most recent error code first.
    pub error_history: [u8; ERROR_HISTORY_LENGTH],
    pub _pad: [u8; 7],
    pub last_connection: i64,
    pub last_retry_time: i64,
    pub job_status: [JobStatusSlot; MAX_NO_PARALLEL_JOBS],
}

const _: () = assert!(core::mem::size_of::<HostStatus>() == 560);

// SAFETY: repr(C), integers and byte arrays only, size 560, align 8.
unsafe impl StatusRecord for HostStatus {
    const KIND: AreaKind = AreaKind::Fsa;
    type Config = HostConfig;

    fn key(&self) -> &[u8] {
        name_bytes(&self.host_alias)
    }

    fn config_key(config: &HostConfig) -> &str {
        &config.alias
    }

    /// Zeroed counters, disconnected slots, limits from the configuration.
    fn fresh(config: &HostConfig) -> Self {
        let mut host = Self {
            host_alias: [0; MAX_ALIAS_LENGTH],
            real_hostname: [0; MAX_REAL_HOSTNAME_LENGTH],
            host_status: 0,
            allowed_transfers: config.allowed_transfers,
            active_transfers: 0,
            max_errors: config.max_errors,
            retry_interval: config.retry_interval,
            error_counter: 0,
            total_errors: 0,
            jobs_queued: 0,
            file_counter_done: 0,
            connections: 0,
            bytes_send: 0,
            total_file_size: 0,
            total_file_counter: 0,
            error_history: [0; ERROR_HISTORY_LENGTH],
            _pad: [0; 7],
            last_connection: 0,
            last_retry_time: 0,
            job_status: [JobStatusSlot::EMPTY; MAX_NO_PARALLEL_JOBS],
        };
        put_name(&mut host.host_alias, &config.alias);
        put_name(&mut host.real_hostname, &config.real_hostname);
        if config.disabled {
            host.host_status |= HOST_DISABLED;
        }
        host
    }

    fn carry_forward(&mut self, old: &Self) {
        // The disabled bit belongs to the configuration.
        self.host_status = (old.host_status & !HOST_DISABLED) | (self.host_status & HOST_DISABLED);
        self.active_transfers = old.active_transfers;
        self.error_counter = old.error_counter;
        self.total_errors = old.total_errors;
        self.jobs_queued = old.jobs_queued;
        self.file_counter_done = old.file_counter_done;
        self.connections = old.connections;
        self.bytes_send = old.bytes_send;
        self.total_file_size = old.total_file_size;
        self.total_file_counter = old.total_file_counter;
        self.error_history = old.error_history;
        self.last_connection = old.last_connection;
        self.last_retry_time = old.last_retry_time;
        self.job_status = old.job_status;
    }
}

impl HostStatus {
    pub fn alias(&self) -> Cow<'_, str> {
        name_str(&self.host_alias)
    }

    pub fn real_hostname(&self) -> Cow<'_, str> {
        name_str(&self.real_hostname)
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.host_status & flag != 0
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.has_flag(HOST_DISABLED)
    }

    /// Record a failed attempt: bump the counters and push `code` onto the
    /// front of the error history.
    pub fn push_error(&mut self, code: u8) {
        self.error_counter = self.error_counter.wrapping_add(1);
        self.total_errors = self.total_errors.wrapping_add(1);
        self.error_history.copy_within(0..ERROR_HISTORY_LENGTH - 1, 1);
        self.error_history[0] = code;
    }

    /// More work is queued than the host's transfer slots can take.
    #[inline]
    pub fn wants_burst(&self) -> bool {
        self.jobs_queued > 0 && self.active_transfers >= self.allowed_transfers
    }
}

/// Remove the paused-queue directory of a host that was dropped from the
/// configuration while disabled.
///
/// Returns `Ok(true)` if a directory was removed. Enabled hosts keep their
/// queue; a missing directory is not an error.
pub fn cleanup_orphan_host(outgoing_dir: &Path, orphan: &HostStatus) -> Result<bool> {
    if !orphan.is_disabled() {
        return Ok(false);
    }
    let alias = orphan.alias();
    if alias.is_empty() || alias.contains('/') || alias == "." || alias == ".." {
        warn!(alias = %alias, "refusing to clean up queue for suspicious alias");
        return Ok(false);
    }

    let queue = outgoing_dir.join(alias.as_ref());
    match std::fs::remove_dir_all(&queue) {
        Ok(()) => {
            info!(host = %alias, path = %queue.display(), "removed paused queue of deleted host");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(
                host = %alias,
                path = %queue.display(),
                error = %e,
                "failed to remove paused queue"
            );
            Err(StatusError::io(Op::Cleanup, queue, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_matches_config() {
        let mut config = HostConfig::new("wmo-gts");
        config.real_hostname = "gts.example.org".into();
        config.allowed_transfers = 3;
        let host = HostStatus::fresh(&config);

        assert_eq!(host.key(), b"wmo-gts");
        assert_eq!(host.real_hostname(), "gts.example.org");
        assert_eq!(host.allowed_transfers, 3);
        assert_eq!(host.error_counter, 0);
        assert!(!host.is_disabled());
        assert!(host.job_status.iter().all(|s| *s == JobStatusSlot::EMPTY));
    }

    #[test]
    fn carry_forward_keeps_runtime_state_not_limits() {
        let mut old = HostStatus::fresh(&HostConfig::new("h"));
        old.error_counter = 5;
        old.host_status |= ERROR_OFFLINE;
        old.push_error(17);
        old.job_status[1].fill(9, "u", 42);

        let mut config = HostConfig::new("h");
        config.allowed_transfers = 4;
        config.disabled = true;
        let mut new = HostStatus::fresh(&config);
        new.carry_forward(&old);

        assert_eq!(new.error_counter, 6);
        assert_eq!(new.error_history[0], 17);
        assert!(new.has_flag(ERROR_OFFLINE));
        assert!(new.is_disabled());
        assert_eq!(new.allowed_transfers, 4);
        assert_eq!(new.job_status[1].job_id, 9);
    }

    #[test]
    fn error_history_is_a_ring() {
        let mut host = HostStatus::fresh(&HostConfig::new("h"));
        for code in 1..=7u8 {
            host.push_error(code);
        }
        assert_eq!(host.error_history, [7, 6, 5, 4, 3]);
        assert_eq!(host.total_errors, 7);
    }

    #[test]
    fn error_counters_wrap_instead_of_overflowing() {
        let mut host = HostStatus::fresh(&HostConfig::new("h"));
        host.error_counter = i32::MAX;
        host.total_errors = u32::MAX;
        host.push_error(1);
        assert_eq!(host.error_counter, i32::MIN);
        assert_eq!(host.total_errors, 0);
    }

    #[test]
    fn burst_wanted_only_when_slots_full() {
        let mut host = HostStatus::fresh(&HostConfig::new("h"));
        host.jobs_queued = 3;
        host.active_transfers = 1;
        assert!(!host.wants_burst());
        host.active_transfers = 2;
        assert!(host.wants_burst());
        host.jobs_queued = 0;
        assert!(!host.wants_burst());
    }

    #[test]
    fn parse_host_config() {
        let text = "\
# alias:real:allowed:max_errors:retry:disabled
dwd:ftp.dwd.de:3:20:60
local
off:::::1
";
        let hosts = HostConfig::parse(Path::new("HOST_CONFIG"), text).unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].real_hostname, "ftp.dwd.de");
        assert_eq!(hosts[0].allowed_transfers, 3);
        assert_eq!(hosts[0].retry_interval, 60);
        assert_eq!(hosts[1], HostConfig::new("local"));
        assert!(hosts[2].disabled);
    }

    #[test]
    fn parse_rejects_too_many_transfers() {
        let err = HostConfig::parse(Path::new("HOST_CONFIG"), "a:b:9\n").unwrap_err();
        assert!(err.to_string().contains("allowed_transfers"));
    }

    #[test]
    fn orphan_cleanup_only_for_disabled_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("gone");
        std::fs::create_dir_all(queue.join("msg_1")).unwrap();

        let mut orphan = HostStatus::fresh(&HostConfig::new("gone"));
        assert!(!cleanup_orphan_host(dir.path(), &orphan).unwrap());
        assert!(queue.exists());

        orphan.host_status |= HOST_DISABLED;
        assert!(cleanup_orphan_host(dir.path(), &orphan).unwrap());
        assert!(!queue.exists());

        // second time: nothing left
        assert!(!cleanup_orphan_host(dir.path(), &orphan).unwrap());
    }
}
