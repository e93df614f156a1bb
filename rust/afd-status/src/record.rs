//! The record contract every area type implements, plus the pieces records
//! share: fixed-width names and the per-transfer job status slot.

use std::borrow::Cow;

use crate::layout::AreaKind;

/// Width of alias/key fields, including the terminating NUL.
pub const MAX_ALIAS_LENGTH: usize = 32;

/// Width of a job's unique message name, including the terminating NUL.
pub const MAX_MSG_NAME_LENGTH: usize = 48;

/// A fixed-size, plain-data record stored in a status area.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, made only of integers and byte arrays
/// (so every bit pattern read from a file is a valid value), have alignment
/// of at most 8 and a size that is a multiple of 8.
pub unsafe trait StatusRecord: Copy + Send + Sync + 'static {
    /// The area this record type lives in.
    const KIND: AreaKind;

    /// Per-entity configuration the record is built from.
    type Config;

    /// The record's key: alias bytes up to the first NUL.
    fn key(&self) -> &[u8];

    /// The key a configured entity will have once it has a record.
    fn config_key(config: &Self::Config) -> &str;

    /// The documented default record for a newly configured entity.
    fn fresh(config: &Self::Config) -> Self;

    /// Copy runtime state (counters, flags, history) from `old`, the same
    /// entity's record in the predecessor region. Fields derived from
    /// configuration keep the values `fresh` gave them.
    fn carry_forward(&mut self, old: &Self);
}

/// Copy `name` into a fixed-width, NUL-terminated field, truncating to
/// `N - 1` bytes.
pub fn put_name<const N: usize>(dst: &mut [u8; N], name: &str) {
    *dst = [0u8; N];
    let len = name.len().min(N.saturating_sub(1));
    dst[..len].copy_from_slice(&name.as_bytes()[..len]);
}

/// Bytes of a fixed-width name up to its first NUL.
#[inline]
pub fn name_bytes(src: &[u8]) -> &[u8] {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    &src[..end]
}

/// A fixed-width name as text, lossily decoded.
#[inline]
pub fn name_str(src: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(name_bytes(src))
}

/// Connection state a worker reports for its slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Disconnected = 0,
    Connecting = 1,
    Active = 2,
    /// Connected and waiting for a burst continuation.
    Burst = 3,
    Error = 4,
}

impl ConnectStatus {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectStatus::Connecting,
            2 => ConnectStatus::Active,
            3 => ConnectStatus::Burst,
            4 => ConnectStatus::Error,
            _ => ConnectStatus::Disconnected,
        }
    }
}

/// Per-transfer slot inside a host record.
///
/// `unique_name` doubles as a rendezvous flag: an empty name means the
/// worker has not (yet) announced which job it is working on.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatusSlot {
    pub unique_name: [u8; MAX_MSG_NAME_LENGTH],
    pub job_id: u32,
    pub proc_id: i32,
    pub connect_status: u8,
    pub error_file: u8,
    pub _pad: [u8; 6],
    pub file_size_done: u64,
    pub no_of_files: u32,
    pub no_of_files_done: u32,
}

const _: () = assert!(core::mem::size_of::<JobStatusSlot>() == 80);

impl JobStatusSlot {
    pub const EMPTY: Self = Self {
        unique_name: [0u8; MAX_MSG_NAME_LENGTH],
        job_id: 0,
        proc_id: 0,
        connect_status: ConnectStatus::Disconnected as u8,
        error_file: 0,
        _pad: [0u8; 6],
        file_size_done: 0,
        no_of_files: 0,
        no_of_files_done: 0,
    };

    /// True once a worker has written a unique name.
    #[inline]
    pub fn is_filled(&self) -> bool {
        self.unique_name[0] != 0
    }

    /// Reset the rendezvous flag only; the rest of the slot is left alone.
    #[inline]
    pub fn clear_unique_name(&mut self) {
        self.unique_name[0] = 0;
    }

    pub fn unique_name(&self) -> Cow<'_, str> {
        name_str(&self.unique_name)
    }

    #[inline]
    pub fn connect_status(&self) -> ConnectStatus {
        ConnectStatus::from_u8(self.connect_status)
    }

    /// Announce the job this slot's worker is now processing.
    pub fn fill(&mut self, job_id: u32, unique_name: &str, proc_id: i32) {
        put_name(&mut self.unique_name, unique_name);
        self.job_id = job_id;
        self.proc_id = proc_id;
        self.error_file = 0;
        self.file_size_done = 0;
        self.no_of_files_done = 0;
    }
}

impl Default for JobStatusSlot {
    fn default() -> Self {
        Self::EMPTY
    }
}
