//! FRA: the file retrieve area. One [`DirectoryStatus`] per monitored
//! source directory.

use std::borrow::Cow;
use std::path::Path;

use crate::entity_config::{check_alias, field_or, load_entities, parse_entities};
use crate::error::Result;
use crate::layout::AreaKind;
use crate::record::{MAX_ALIAS_LENGTH, StatusRecord, name_bytes, name_str, put_name};

pub const DEFAULT_MAX_PROCESS: i32 = 10;

// dir_flag bits
pub const DIR_DISABLED: u32 = 1 << 0;
pub const DIR_ERROR_SET: u32 = 1 << 1;
pub const DIR_STOPPED: u32 = 1 << 2;

/// Configuration of one source directory (one DIR_CONFIG line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirConfig {
    pub alias: String,
    /// Remote host the directory is fetched from; empty for local dirs.
    pub host_alias: String,
    pub dir_id: u32,
    pub max_process: i32,
}

impl DirConfig {
    pub fn new(alias: impl Into<String>, dir_id: u32) -> Self {
        Self {
            alias: alias.into(),
            host_alias: String::new(),
            dir_id,
            max_process: DEFAULT_MAX_PROCESS,
        }
    }

    /// `alias:host_alias:dir_id(hex):max_process`
    fn from_fields(fields: &[&str]) -> Result<Self, String> {
        let alias = fields.first().copied().unwrap_or_default();
        let dir_id = match fields.get(2) {
            Some(id) if !id.is_empty() => u32::from_str_radix(id, 16)
                .map_err(|_| format!("invalid dir_id `{id}`"))?,
            _ => return Err("missing dir_id".into()),
        };
        let mut dir = DirConfig::new(alias, dir_id);
        if let Some(host) = fields.get(1).filter(|h| !h.is_empty()) {
            check_alias(host)?;
            dir.host_alias = host.to_string();
        }
        dir.max_process = field_or(fields, 3, "max_process", DEFAULT_MAX_PROCESS)?;
        Ok(dir)
    }

    pub fn parse(file: &Path, text: &str) -> Result<Vec<Self>> {
        parse_entities(file, text, Self::from_fields, |d| d.alias.as_str())
    }

    pub fn load(path: &Path) -> Result<Vec<Self>> {
        load_entities(path, Self::from_fields, |d| d.alias.as_str())
    }
}

/// Retrieve status of one source directory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryStatus {
    pub dir_alias: [u8; MAX_ALIAS_LENGTH],
    pub host_alias: [u8; MAX_ALIAS_LENGTH],
    pub dir_id: u32,
    pub max_process: i32,
    pub dir_flag: u32,
    pub error_counter: i32,
    pub files_in_dir: u32,
    pub files_received: u32,
    pub bytes_in_dir: u64,
    pub bytes_received: u64,
    pub last_retrieval: i64,
    pub queued: u8,
    pub _pad: [u8; 7],
}

const _: () = assert!(core::mem::size_of::<DirectoryStatus>() == 120);

// SAFETY: repr(C), integers and byte arrays only, size 120, align 8.
unsafe impl StatusRecord for DirectoryStatus {
    const KIND: AreaKind = AreaKind::Fra;
    type Config = DirConfig;

    fn key(&self) -> &[u8] {
        name_bytes(&self.dir_alias)
    }

    fn config_key(config: &DirConfig) -> &str {
        &config.alias
    }

    fn fresh(config: &DirConfig) -> Self {
        let mut dir = Self {
            dir_alias: [0; MAX_ALIAS_LENGTH],
            host_alias: [0; MAX_ALIAS_LENGTH],
            dir_id: config.dir_id,
            max_process: config.max_process,
            dir_flag: 0,
            error_counter: 0,
            files_in_dir: 0,
            files_received: 0,
            bytes_in_dir: 0,
            bytes_received: 0,
            last_retrieval: 0,
            queued: 0,
            _pad: [0; 7],
        };
        put_name(&mut dir.dir_alias, &config.alias);
        put_name(&mut dir.host_alias, &config.host_alias);
        dir
    }

    fn carry_forward(&mut self, old: &Self) {
        self.dir_flag = old.dir_flag;
        self.error_counter = old.error_counter;
        self.files_in_dir = old.files_in_dir;
        self.files_received = old.files_received;
        self.bytes_in_dir = old.bytes_in_dir;
        self.bytes_received = old.bytes_received;
        self.last_retrieval = old.last_retrieval;
        self.queued = old.queued;
    }
}

impl DirectoryStatus {
    pub fn alias(&self) -> Cow<'_, str> {
        name_str(&self.dir_alias)
    }

    pub fn host_alias(&self) -> Cow<'_, str> {
        name_str(&self.host_alias)
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.dir_flag & DIR_DISABLED != 0
    }
}
