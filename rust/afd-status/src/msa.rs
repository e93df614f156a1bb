//! MSA: the monitor status area. One [`MonitorStatus`] per monitored AFD
//! instance.

use std::borrow::Cow;
use std::path::Path;

use crate::entity_config::{field_or, load_entities, parse_entities};
use crate::error::Result;
use crate::layout::AreaKind;
use crate::record::{
    ConnectStatus, MAX_ALIAS_LENGTH, StatusRecord, name_bytes, name_str, put_name,
};

pub const MAX_MON_HOSTNAME_LENGTH: usize = 40;

/// Slots in the transfer-rate history.
pub const STORAGE_TIME: usize = 8;

/// Log-history rows: receive, system, transfer.
pub const NO_OF_LOG_HISTORY: usize = 3;

/// Marks per log-history row.
pub const MAX_LOG_HISTORY: usize = 48;

pub const DEFAULT_AFD_PORT: i32 = 4444;
pub const DEFAULT_POLL_INTERVAL: i32 = 5;

/// Which log-history row a mark goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogHistory {
    Receive = 0,
    System = 1,
    Transfer = 2,
}

/// Configuration of one monitored AFD (one MON_CONFIG line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub alias: String,
    pub hostname: String,
    pub port: i32,
    pub poll_interval: i32,
}

impl MonitorConfig {
    pub fn new(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            hostname: alias.clone(),
            alias,
            port: DEFAULT_AFD_PORT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// `alias:hostname:port:poll_interval`
    fn from_fields(fields: &[&str]) -> Result<Self, String> {
        let mut mon = MonitorConfig::new(fields.first().copied().unwrap_or_default());
        if let Some(host) = fields.get(1).filter(|h| !h.is_empty()) {
            if host.len() >= MAX_MON_HOSTNAME_LENGTH {
                return Err(format!("hostname `{host}` too long"));
            }
            mon.hostname = host.to_string();
        }
        mon.port = field_or(fields, 2, "port", DEFAULT_AFD_PORT)?;
        mon.poll_interval = field_or(fields, 3, "poll_interval", DEFAULT_POLL_INTERVAL)?;
        if mon.poll_interval <= 0 {
            return Err("poll_interval must be positive".into());
        }
        Ok(mon)
    }

    pub fn parse(file: &Path, text: &str) -> Result<Vec<Self>> {
        parse_entities(file, text, Self::from_fields, |m| m.alias.as_str())
    }

    pub fn load(path: &Path) -> Result<Vec<Self>> {
        load_entities(path, Self::from_fields, |m| m.alias.as_str())
    }
}

/// Status of one monitored AFD instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    pub afd_alias: [u8; MAX_ALIAS_LENGTH],
    pub hostname: [u8; MAX_MON_HOSTNAME_LENGTH],
    pub port: i32,
    pub poll_interval: i32,
    pub connect_status: u8,
    pub special_flag: u8,
    pub _pad: [u8; 2],
    pub error_counter: u32,
    pub host_error_counter: i32,
    pub no_of_hosts: i32,
    pub jobs_in_queue: i32,
    pub danger_no_of_jobs: i32,
    pub files_to_send: u32,
    pub _pad2: [u8; 4],
    pub bytes_to_send: u64,
    pub transfer_rate: u64,
    /// Highest transfer rate per period, most recent first.
    pub top_tr: [u32; STORAGE_TIME],
    pub log_history: [[u8; MAX_LOG_HISTORY]; NO_OF_LOG_HISTORY],
    pub last_data_time: i64,
}

const _: () = assert!(core::mem::size_of::<MonitorStatus>() == 312);

// SAFETY: repr(C), integers and byte arrays only, size 312, align 8.
unsafe impl StatusRecord for MonitorStatus {
    const KIND: AreaKind = AreaKind::Msa;
    type Config = MonitorConfig;

    fn key(&self) -> &[u8] {
        name_bytes(&self.afd_alias)
    }

    fn config_key(config: &MonitorConfig) -> &str {
        &config.alias
    }

    fn fresh(config: &MonitorConfig) -> Self {
        let mut mon = Self {
            afd_alias: [0; MAX_ALIAS_LENGTH],
            hostname: [0; MAX_MON_HOSTNAME_LENGTH],
            port: config.port,
            poll_interval: config.poll_interval,
            connect_status: ConnectStatus::Disconnected as u8,
            special_flag: 0,
            _pad: [0; 2],
            error_counter: 0,
            host_error_counter: 0,
            no_of_hosts: 0,
            jobs_in_queue: 0,
            danger_no_of_jobs: 0,
            files_to_send: 0,
            _pad2: [0; 4],
            bytes_to_send: 0,
            transfer_rate: 0,
            top_tr: [0; STORAGE_TIME],
            log_history: [[0; MAX_LOG_HISTORY]; NO_OF_LOG_HISTORY],
            last_data_time: 0,
        };
        put_name(&mut mon.afd_alias, &config.alias);
        put_name(&mut mon.hostname, &config.hostname);
        mon
    }

    fn carry_forward(&mut self, old: &Self) {
        self.connect_status = old.connect_status;
        self.special_flag = old.special_flag;
        self.error_counter = old.error_counter;
        self.host_error_counter = old.host_error_counter;
        self.no_of_hosts = old.no_of_hosts;
        self.jobs_in_queue = old.jobs_in_queue;
        self.danger_no_of_jobs = old.danger_no_of_jobs;
        self.files_to_send = old.files_to_send;
        self.bytes_to_send = old.bytes_to_send;
        self.transfer_rate = old.transfer_rate;
        self.top_tr = old.top_tr;
        self.log_history = old.log_history;
        self.last_data_time = old.last_data_time;
    }
}

impl MonitorStatus {
    pub fn alias(&self) -> Cow<'_, str> {
        name_str(&self.afd_alias)
    }

    #[inline]
    pub fn connect_status(&self) -> ConnectStatus {
        ConnectStatus::from_u8(self.connect_status)
    }

    /// Append a severity mark to a log-history row; the oldest mark falls
    /// off the front.
    pub fn push_log_mark(&mut self, row: LogHistory, mark: u8) {
        let row = &mut self.log_history[row as usize];
        row.copy_within(1.., 0);
        row[MAX_LOG_HISTORY - 1] = mark;
    }

    /// Start a new transfer-rate period.
    pub fn push_top_tr(&mut self, rate: u32) {
        self.top_tr.copy_within(0..STORAGE_TIME - 1, 1);
        self.top_tr[0] = rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_monitor_is_disconnected() {
        let mon = MonitorStatus::fresh(&MonitorConfig::new("afd-01"));
        assert_eq!(mon.alias(), "afd-01");
        assert_eq!(mon.connect_status(), ConnectStatus::Disconnected);
        assert_eq!(mon.port, DEFAULT_AFD_PORT);
    }

    #[test]
    fn log_history_shifts_left() {
        let mut mon = MonitorStatus::fresh(&MonitorConfig::new("m"));
        mon.push_log_mark(LogHistory::System, b'I');
        mon.push_log_mark(LogHistory::System, b'E');
        let row = &mon.log_history[LogHistory::System as usize];
        assert_eq!(&row[MAX_LOG_HISTORY - 2..], b"IE");
        assert!(mon.log_history[LogHistory::Receive as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn carry_forward_keeps_history_takes_new_endpoint() {
        let mut old = MonitorStatus::fresh(&MonitorConfig::new("m"));
        old.connect_status = ConnectStatus::Active as u8;
        old.push_top_tr(100);
        old.push_log_mark(LogHistory::Transfer, b'W');

        let mut config = MonitorConfig::new("m");
        config.port = 5555;
        let mut new = MonitorStatus::fresh(&config);
        new.carry_forward(&old);

        assert_eq!(new.port, 5555);
        assert_eq!(new.connect_status(), ConnectStatus::Active);
        assert_eq!(new.top_tr[0], 100);
        assert_eq!(new.log_history, old.log_history);
    }

    #[test]
    fn parse_monitor_config() {
        let mons =
            MonitorConfig::parse(Path::new("MON_CONFIG"), "a:host-a:4445:10\nb\n").unwrap();
        assert_eq!(mons[0].hostname, "host-a");
        assert_eq!(mons[0].port, 4445);
        assert_eq!(mons[0].poll_interval, 10);
        assert_eq!(mons[1], MonitorConfig::new("b"));

        assert!(MonitorConfig::parse(Path::new("MON_CONFIG"), "a:h:1:0\n").is_err());
    }
}
