//! On-disk layout of a status area.
//!
//! ```text
//! offset 0   ┌──────────────────────────────────────────────┐
//!            │ AreaHeader (16 bytes)                        │
//!            │   record_count: i32  (or STALE)              │
//!            │   kind, layout_version, features, pad: u8    │
//!            │   version_id: i32                            │
//!            │   record_size: u32                           │
//! offset 16  ├──────────────────────────────────────────────┤
//!            │ record[0]                                    │
//!            │ record[1]                                    │
//!            │ ...                                          │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! The file length is always exactly `AREA_HEADER_SIZE + count * record_size`;
//! a mismatch means the file was written with a different record layout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

/// Size of the header in front of the record array. Records start here.
pub const AREA_HEADER_SIZE: usize = 16;

/// Value written over `record_count` once a successor region is published.
pub const STALE: i32 = -1;

/// Bumped whenever any record layout changes.
pub const LAYOUT_VERSION: u8 = 1;

/// Which of the three areas a region holds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaKind {
    /// File transfer status area, one record per destination host.
    Fsa = 1,
    /// Monitor status area, one record per monitored AFD instance.
    Msa = 2,
    /// File retrieve area, one record per source directory.
    Fra = 3,
}

impl AreaKind {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(AreaKind::Fsa),
            2 => Some(AreaKind::Msa),
            3 => Some(AreaKind::Fra),
            _ => None,
        }
    }

    /// Region file prefix; the version id is appended as `.<version_id>`.
    pub fn region_base(self) -> &'static str {
        match self {
            AreaKind::Fsa => "fsa_status",
            AreaKind::Msa => "mon_status",
            AreaKind::Fra => "fra_status",
        }
    }

    /// Name of the file holding the current version id.
    pub fn id_file_name(self) -> &'static str {
        match self {
            AreaKind::Fsa => "fsa.id",
            AreaKind::Msa => "msa.id",
            AreaKind::Fra => "fra.id",
        }
    }
}

impl std::fmt::Display for AreaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AreaKind::Fsa => "FSA",
            AreaKind::Msa => "MSA",
            AreaKind::Fra => "FRA",
        })
    }
}

/// Where one area's ID file and versioned regions live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaPaths {
    dir: PathBuf,
    kind: AreaKind,
}

impl AreaPaths {
    pub fn new(dir: impl Into<PathBuf>, kind: AreaKind) -> Self {
        Self {
            dir: dir.into(),
            kind,
        }
    }

    #[inline]
    pub fn kind(&self) -> AreaKind {
        self.kind
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn id_path(&self) -> PathBuf {
        self.dir.join(self.kind.id_file_name())
    }

    pub fn region_path(&self, version_id: i32) -> PathBuf {
        self.dir.join(format!("{}.{version_id}", self.kind.region_base()))
    }
}

/// Byte size of a region holding `count` records of `record_size` bytes.
#[inline]
pub const fn area_size(record_size: usize, count: usize) -> usize {
    AREA_HEADER_SIZE + count * record_size
}

/// Byte offset of record `index`.
#[inline]
pub const fn record_offset(record_size: usize, index: usize) -> usize {
    AREA_HEADER_SIZE + index * record_size
}

/// What the first header word currently says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Active { record_count: usize },
    Stale,
    /// Negative but not the STALE sentinel.
    Corrupt(i32),
}

/// The header at offset 0 of every status area.
///
/// Only `record_count` changes after creation (once, to [`STALE`]); the other
/// fields are written by the creator before the region is published.
#[repr(C)]
pub struct AreaHeader {
    record_count: AtomicI32,
    pub kind: u8,
    pub layout_version: u8,
    pub features: u8,
    _pad: u8,
    pub version_id: i32,
    pub record_size: u32,
}

const _: () = assert!(core::mem::size_of::<AreaHeader>() == AREA_HEADER_SIZE);

impl AreaHeader {
    pub fn new(kind: AreaKind, record_count: usize, version_id: i32, record_size: usize) -> Self {
        Self {
            record_count: AtomicI32::new(record_count as i32),
            kind: kind as u8,
            layout_version: LAYOUT_VERSION,
            features: 0,
            _pad: 0,
            version_id,
            record_size: record_size as u32,
        }
    }

    /// Decode the first header word.
    #[inline]
    pub fn status(&self) -> HeaderStatus {
        match self.record_count.load(Ordering::Acquire) {
            STALE => HeaderStatus::Stale,
            n if n < 0 => HeaderStatus::Corrupt(n),
            n => HeaderStatus::Active {
                record_count: n as usize,
            },
        }
    }

    /// Overwrite the record count with [`STALE`]. Returns true if this call
    /// did the transition; later calls leave the header untouched.
    #[inline]
    pub fn mark_stale(&self) -> bool {
        self.record_count.swap(STALE, Ordering::AcqRel) != STALE
    }

    /// Check the immutable fields against what the caller expects to find.
    pub fn validate(&self, kind: AreaKind, record_size: usize) -> Result<(), &'static str> {
        if AreaKind::from_u8(self.kind) != Some(kind) {
            return Err("region belongs to a different area");
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err("unsupported layout version");
        }
        if self.record_size as usize != record_size {
            return Err("record size differs from this build");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_primitives::HeapRegion;

    fn make_header(count: usize) -> (HeapRegion, *mut AreaHeader) {
        let heap = HeapRegion::new_zeroed(AREA_HEADER_SIZE);
        let hdr = heap.region().ptr_at::<AreaHeader>(0);
        unsafe { hdr.write(AreaHeader::new(AreaKind::Fsa, count, 7, 64)) };
        (heap, hdr)
    }

    #[test]
    fn fresh_header_is_active() {
        let (_heap, hdr) = make_header(3);
        let hdr = unsafe { &*hdr };
        assert_eq!(hdr.status(), HeaderStatus::Active { record_count: 3 });
        assert_eq!(hdr.version_id, 7);
        hdr.validate(AreaKind::Fsa, 64).unwrap();
    }

    #[test]
    fn mark_stale_is_idempotent() {
        let (_heap, hdr) = make_header(3);
        let hdr = unsafe { &*hdr };
        assert!(hdr.mark_stale());
        assert_eq!(hdr.status(), HeaderStatus::Stale);
        assert!(!hdr.mark_stale());
        assert_eq!(hdr.status(), HeaderStatus::Stale);
    }

    #[test]
    fn zero_records_is_still_active() {
        let (_heap, hdr) = make_header(0);
        assert_eq!(
            unsafe { &*hdr }.status(),
            HeaderStatus::Active { record_count: 0 }
        );
    }

    #[test]
    fn validate_rejects_foreign_kind_and_size() {
        let (_heap, hdr) = make_header(1);
        let hdr = unsafe { &*hdr };
        assert!(hdr.validate(AreaKind::Msa, 64).is_err());
        assert!(hdr.validate(AreaKind::Fsa, 72).is_err());
    }

    #[test]
    fn sizes_and_offsets() {
        assert_eq!(area_size(64, 0), 16);
        assert_eq!(area_size(64, 3), 16 + 192);
        assert_eq!(record_offset(64, 2), 16 + 128);
    }

    #[test]
    fn region_names_carry_version_suffix() {
        let paths = AreaPaths::new("/work/fifodir", AreaKind::Fra);
        assert_eq!(paths.id_path(), Path::new("/work/fifodir/fra.id"));
        assert_eq!(paths.region_path(12), Path::new("/work/fifodir/fra_status.12"));
    }
}
