//! A mapped status area: header view plus an indexable record view over the
//! same file-backed mapping.

use std::io;
use std::marker::PhantomData;
use std::mem::{offset_of, size_of};
use std::os::unix::io::AsFd;
use std::path::Path;

use afd_primitives::{FileCleanup, LockKind, LockMode, MmapRegion, ScopedLock};

use crate::error::{Op, Result, StatusError};
use crate::fsa::{HostStatus, MAX_NO_PARALLEL_JOBS};
use crate::layout::{
    AREA_HEADER_SIZE, AreaHeader, AreaKind, AreaPaths, HeaderStatus, area_size, record_offset,
};
use crate::record::{JobStatusSlot, StatusRecord};

/// One versioned status area mapped read-write.
///
/// Record locks are byte-range locks on this mapping's own open file. Two
/// `StatusArea`s (in one process or in two) exclude each other; threads
/// sharing a single `StatusArea` do not.
pub struct StatusArea<R: StatusRecord> {
    mmap: MmapRegion,
    capacity: usize,
    version_id: i32,
    _record: PhantomData<R>,
}

impl<R: StatusRecord> StatusArea<R> {
    /// Create region `version_id` in `dir` with room for `capacity` records.
    ///
    /// The records start zeroed; the header says `capacity` and is already
    /// active. The region is not current until someone writes its id into
    /// the ID file.
    pub fn create(dir: &Path, capacity: usize, version_id: i32) -> Result<Self> {
        let path = AreaPaths::new(dir, R::KIND).region_path(version_id);
        let size = area_size(size_of::<R>(), capacity);

        let mmap = MmapRegion::create(&path, size, FileCleanup::Manual).map_err(|e| {
            error!(
                area = %R::KIND,
                path = %path.display(),
                error = %e,
                "cannot create status area"
            );
            StatusError::io(Op::CreateRegion, &path, e)
        })?;

        let header = AreaHeader::new(R::KIND, capacity, version_id, size_of::<R>());
        // SAFETY: fresh mapping of at least AREA_HEADER_SIZE bytes that no
        // one else knows about yet.
        unsafe { mmap.region().ptr_at::<AreaHeader>(0).write(header) };

        debug!(area = %R::KIND, version_id, capacity, "created status area");
        Ok(Self {
            mmap,
            capacity,
            version_id,
            _record: PhantomData,
        })
    }

    /// Map existing region `version_id` from `dir`.
    ///
    /// Fails with `NotFound` if the file is absent, `Stale` if it has been
    /// superseded, `BadHeader` if it belongs to another area or build, and
    /// `SizeMismatch` if its length disagrees with the recorded count.
    pub fn open_existing(dir: &Path, version_id: i32) -> Result<Self> {
        let path = AreaPaths::new(dir, R::KIND).region_path(version_id);

        let mmap = match MmapRegion::attach(&path) {
            Ok(mmap) => mmap,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StatusError::NotFound { path });
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(StatusError::SizeMismatch {
                    path,
                    expected: AREA_HEADER_SIZE as u64,
                    actual: 0,
                });
            }
            Err(e) => return Err(StatusError::io(Op::OpenRegion, &path, e)),
        };

        if mmap.len() < AREA_HEADER_SIZE {
            return Err(StatusError::SizeMismatch {
                path,
                expected: AREA_HEADER_SIZE as u64,
                actual: mmap.len() as u64,
            });
        }

        // SAFETY: at least AREA_HEADER_SIZE bytes are mapped and AreaHeader
        // is valid for every bit pattern.
        let header = unsafe { &*mmap.region().ptr_at::<AreaHeader>(0) };
        let capacity = match header.status() {
            HeaderStatus::Active { record_count } => record_count,
            HeaderStatus::Stale => return Err(StatusError::Stale { path }),
            HeaderStatus::Corrupt(_) => {
                return Err(StatusError::BadHeader {
                    path,
                    reason: "negative record count",
                });
            }
        };
        if let Err(reason) = header.validate(R::KIND, size_of::<R>()) {
            return Err(StatusError::BadHeader { path, reason });
        }
        if header.version_id != version_id {
            return Err(StatusError::BadHeader {
                path,
                reason: "version id does not match file name",
            });
        }

        let expected = area_size(size_of::<R>(), capacity);
        if mmap.len() != expected {
            return Err(StatusError::SizeMismatch {
                path,
                expected: expected as u64,
                actual: mmap.len() as u64,
            });
        }

        Ok(Self {
            mmap,
            capacity,
            version_id,
            _record: PhantomData,
        })
    }

    fn header(&self) -> &AreaHeader {
        // SAFETY: both constructors checked the mapping holds a header; it
        // lives as long as self.
        unsafe { &*self.mmap.region().ptr_at::<AreaHeader>(0) }
    }

    #[inline]
    pub fn kind(&self) -> AreaKind {
        R::KIND
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn version_id(&self) -> i32 {
        self.version_id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.mmap.path()
    }

    /// Current header state, straight from shared memory.
    #[inline]
    pub fn header_status(&self) -> HeaderStatus {
        self.header().status()
    }

    /// Publish that a successor exists. Idempotent; returns true only for the
    /// call that made the transition.
    pub fn mark_stale(&self) -> bool {
        let changed = self.header().mark_stale();
        if changed {
            info!(area = %R::KIND, version_id = self.version_id, "marked status area stale");
        }
        changed
    }

    /// Non-blocking header read. A corrupt header is logged and reported as
    /// not stale, so consumers are not evicted on a bad read.
    pub fn is_stale(&self) -> bool {
        match self.header().status() {
            HeaderStatus::Stale => true,
            HeaderStatus::Active { .. } => false,
            HeaderStatus::Corrupt(word) => {
                warn!(
                    area = %R::KIND,
                    path = %self.path().display(),
                    word,
                    "corrupt status area header, assuming not stale"
                );
                false
            }
        }
    }

    fn check_index(&self, index: usize) -> Result<usize> {
        if index >= self.capacity {
            return Err(StatusError::RecordOutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok(record_offset(size_of::<R>(), index))
    }

    fn lock_range(&self, index: usize, mode: LockMode) -> Result<ScopedLock<'_>> {
        let offset = self.check_index(index)?;
        ScopedLock::acquire(
            self.mmap.as_fd(),
            offset as u64,
            size_of::<R>() as u64,
            LockKind::Write,
            mode,
        )
        .map_err(|e| StatusError::io(Op::LockRecord, self.path(), e))
    }

    /// Take the advisory write lock over record `index`'s bytes, waiting for
    /// any other holder.
    pub fn lock_record(&self, index: usize) -> Result<ScopedLock<'_>> {
        self.lock_range(index, LockMode::Blocking)
    }

    /// Like [`lock_record`](Self::lock_record) but fails with a
    /// `WouldBlock` I/O error if someone else holds it.
    pub fn try_lock_record(&self, index: usize) -> Result<ScopedLock<'_>> {
        self.lock_range(index, LockMode::NonBlocking)
    }

    /// Volatile snapshot of record `index`. May be torn if a writer is
    /// mid-update; take the record lock for a consistent read.
    pub fn record(&self, index: usize) -> Result<R> {
        let offset = self.check_index(index)?;
        // SAFETY: in bounds, aligned (records are multiples of 8 after a
        // 16-byte header) and R is valid for any bit pattern.
        Ok(unsafe { self.mmap.region().read_volatile::<R>(offset) })
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<R> {
        let region = self.mmap.region();
        (0..self.capacity)
            .map(|i| unsafe { region.read_volatile::<R>(record_offset(size_of::<R>(), i)) })
            .collect()
    }

    /// Index of the first record whose key is `key`.
    pub fn find(&self, key: &str) -> Option<usize> {
        (0..self.capacity).find(|&i| {
            self.record(i)
                .is_ok_and(|record| record.key() == key.as_bytes())
        })
    }

    /// Mutate record `index` in place while holding its lock.
    pub fn update<T>(&self, index: usize, f: impl FnOnce(&mut R) -> T) -> Result<T> {
        let _lock = self.lock_record(index)?;
        let offset = record_offset(size_of::<R>(), index);
        let region = self.mmap.region();
        // SAFETY: index was checked by lock_record; we hold the record lock.
        let mut record = unsafe { region.read_volatile::<R>(offset) };
        let out = f(&mut record);
        unsafe { region.write_volatile::<R>(offset, record) };
        Ok(out)
    }

    /// Write a record without locking. Only for regions that are not yet
    /// published.
    pub(crate) fn write_unlocked(&self, index: usize, record: R) -> Result<()> {
        let offset = self.check_index(index)?;
        // SAFETY: in bounds; the caller owns the unpublished region.
        unsafe { self.mmap.region().write_volatile::<R>(offset, record) };
        Ok(())
    }

    /// Unmap. With `remove`, also delete the backing name; other processes'
    /// mappings of the same file stay valid. Failures are logged only.
    pub fn unmap_and_release(self, remove: bool) {
        let mut mmap = self.mmap;
        if remove {
            match mmap.unlink() {
                Ok(()) => debug!(path = %mmap.path().display(), "removed retired status area"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %mmap.path().display(),
                    error = %e,
                    "cannot remove retired status area"
                ),
            }
        }
    }
}

impl StatusArea<HostStatus> {
    /// Volatile read of one job status slot, without copying the whole host
    /// record. Not locked: a concurrent fill may be seen half written.
    pub fn job_slot(&self, host: usize, slot: usize) -> Result<JobStatusSlot> {
        let offset = self.slot_offset(host, slot)?;
        // SAFETY: in bounds and 8-aligned inside a repr(C) record.
        Ok(unsafe { self.mmap.region().read_volatile::<JobStatusSlot>(offset) })
    }

    /// Read one job status slot while holding the host's record lock, so a
    /// writer using [`update`](Self::update) is seen entirely or not at all.
    pub fn locked_job_slot(&self, host: usize, slot: usize) -> Result<JobStatusSlot> {
        let offset = self.slot_offset(host, slot)?;
        let _lock = self.lock_record(host)?;
        // SAFETY: as in job_slot; the record lock excludes writers.
        Ok(unsafe { self.mmap.region().read_volatile::<JobStatusSlot>(offset) })
    }

    fn slot_offset(&self, host: usize, slot: usize) -> Result<usize> {
        let base = self.check_index(host)?;
        if slot >= MAX_NO_PARALLEL_JOBS {
            return Err(StatusError::RecordOutOfRange {
                index: slot,
                capacity: MAX_NO_PARALLEL_JOBS,
            });
        }
        Ok(base + offset_of!(HostStatus, job_status) + slot * size_of::<JobStatusSlot>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsa::HostConfig;
    use crate::msa::MonitorStatus;

    #[test]
    fn create_then_open_sees_same_records() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 2, 0).unwrap();
        area.write_unlocked(1, HostStatus::fresh(&HostConfig::new("beta")))
            .unwrap();

        let other = StatusArea::<HostStatus>::open_existing(dir.path(), 0).unwrap();
        assert_eq!(other.capacity(), 2);
        assert_eq!(other.find("beta"), Some(1));
        assert_eq!(other.find("gamma"), None);
        assert_eq!(other.record(1).unwrap().alias(), "beta");
    }

    #[test]
    fn out_of_range_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 1, 0).unwrap();
        assert!(matches!(
            area.record(1),
            Err(StatusError::RecordOutOfRange { index: 1, capacity: 1 })
        ));
        assert!(matches!(
            area.job_slot(0, MAX_NO_PARALLEL_JOBS),
            Err(StatusError::RecordOutOfRange { .. })
        ));
    }

    #[test]
    fn zero_capacity_is_a_valid_area() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 0, 4).unwrap();
        assert_eq!(area.header_status(), HeaderStatus::Active { record_count: 0 });
        assert!(area.records().is_empty());

        let again = StatusArea::<HostStatus>::open_existing(dir.path(), 4).unwrap();
        assert_eq!(again.capacity(), 0);
    }

    #[test]
    fn missing_region_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StatusArea::<HostStatus>::open_existing(dir.path(), 9),
            Err(StatusError::NotFound { .. })
        ));
    }

    #[test]
    fn truncated_region_is_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 2, 0).unwrap();
        let path = area.path().to_path_buf();
        drop(area);

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(area_size(size_of::<HostStatus>(), 1) as u64).unwrap();

        assert!(matches!(
            StatusArea::<HostStatus>::open_existing(dir.path(), 0),
            Err(StatusError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn stale_region_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<MonitorStatus>::create(dir.path(), 1, 3).unwrap();
        assert!(!area.is_stale());
        assert!(area.mark_stale());
        assert!(area.is_stale());
        assert!(!area.mark_stale());
        assert!(area.is_stale());

        assert!(matches!(
            StatusArea::<MonitorStatus>::open_existing(dir.path(), 3),
            Err(StatusError::Stale { .. })
        ));
    }

    #[test]
    fn corrupt_header_reads_as_not_stale() {
        use std::os::unix::fs::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 1, 0).unwrap();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(area.path())
            .unwrap();
        file.write_all_at(&(-7i32).to_ne_bytes(), 0).unwrap();

        assert_eq!(area.header_status(), HeaderStatus::Corrupt(-7));
        assert!(!area.is_stale());
        assert!(matches!(
            StatusArea::<HostStatus>::open_existing(dir.path(), 0),
            Err(StatusError::BadHeader { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn update_holds_the_record_lock() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 2, 0).unwrap();
        let other = StatusArea::<HostStatus>::open_existing(dir.path(), 0).unwrap();

        let contended = area
            .update(0, |_| other.try_lock_record(0).is_err())
            .unwrap();
        assert!(contended);
        // neighbouring record is a different byte range
        let neighbour_free = area
            .update(0, |_| other.try_lock_record(1).is_ok())
            .unwrap();
        assert!(neighbour_free);
        // released again afterwards
        let _lock = other.try_lock_record(0).unwrap();
    }

    #[test]
    fn job_slot_reads_inside_host_record() {
        let dir = tempfile::tempdir().unwrap();
        let area = StatusArea::<HostStatus>::create(dir.path(), 1, 0).unwrap();
        area.update(0, |host| host.job_status[2].fill(0xabc, "1_2_3", 77))
            .unwrap();

        let slot = area.job_slot(0, 2).unwrap();
        assert!(slot.is_filled());
        assert_eq!(slot.job_id, 0xabc);
        assert!(!area.job_slot(0, 1).unwrap().is_filled());
    }

    #[test]
    fn release_with_remove_keeps_other_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let owner = StatusArea::<HostStatus>::create(dir.path(), 1, 0).unwrap();
        let reader = StatusArea::<HostStatus>::open_existing(dir.path(), 0).unwrap();
        let path = owner.path().to_path_buf();

        owner.mark_stale();
        owner.unmap_and_release(true);
        assert!(!path.exists());
        assert!(reader.is_stale());
        assert_eq!(reader.records().len(), 1);
    }
}
