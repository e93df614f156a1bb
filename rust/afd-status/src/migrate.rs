//! Building a new status area from configuration and retiring the old one.
//!
//! The sequence, all under the ID file's write lock:
//!
//! 1. read the current version id
//! 2. map the old region if it is usable (missing, stale, corrupt or
//!    size-skewed predecessors are logged and ignored)
//! 3. mark the old region stale
//! 4. create `old + 1` (or `0`) sized for the new configuration
//! 5. carry runtime state forward by key, each old record claimed at most
//!    once; unmatched entities get their default record
//! 6. collect unclaimed old records as orphans for the caller
//! 7. unlink the old region (best-effort)
//! 8. write the new version id
//!
//! The new region is unpublished until step 8, so filling it needs no
//! record locks.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::area::StatusArea;
use crate::error::Result;
use crate::id_file::IdFile;
use crate::layout::AreaPaths;
use crate::record::StatusRecord;

/// Result of one migration.
pub struct Migration<R: StatusRecord> {
    /// The new, now current, region.
    pub area: StatusArea<R>,
    /// Version of the region that was retired, if one was usable.
    pub previous_version: Option<i32>,
    /// Entities whose state came from the old region.
    pub carried: usize,
    /// Entities that started from their default record.
    pub fresh: usize,
    /// Old records no longer configured, in old-region order. Each appears
    /// exactly once.
    pub orphans: Vec<R>,
}

/// Creates and rotates the regions of one area kind.
pub struct StatusAreaMigrator<R: StatusRecord> {
    dir: PathBuf,
    _record: PhantomData<R>,
}

impl<R: StatusRecord> StatusAreaMigrator<R> {
    /// Migrator for the area of kind `R::KIND` living in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _record: PhantomData,
        }
    }

    /// Publish a region holding one record per entry of `configs`.
    ///
    /// Errors creating the new region or writing the ID file are fatal
    /// class; a bad predecessor never is.
    pub fn migrate(&self, configs: &[R::Config]) -> Result<Migration<R>> {
        let paths = AreaPaths::new(&self.dir, R::KIND);
        let id_file = IdFile::open(&paths.id_path())?;
        let _lock = id_file.lock_exclusive()?;

        let stored_version = id_file.read_version()?;
        let old = stored_version.and_then(|version| self.usable_predecessor(version));
        let previous_version = old.as_ref().map(StatusArea::version_id);

        if let Some(old) = &old {
            old.mark_stale();
        }

        let version_id = stored_version
            .and_then(|v| v.checked_add(1))
            .unwrap_or(0);
        let area = StatusArea::<R>::create(&self.dir, configs.len(), version_id)?;

        let old_records = old.as_ref().map(StatusArea::records).unwrap_or_default();
        let mut unclaimed: HashMap<&[u8], VecDeque<usize>> = HashMap::new();
        for (idx, record) in old_records.iter().enumerate() {
            unclaimed.entry(record.key()).or_default().push_back(idx);
        }

        let mut claimed = vec![false; old_records.len()];
        let mut carried = 0;
        for (idx, config) in configs.iter().enumerate() {
            let key = R::config_key(config);
            let mut record = R::fresh(config);
            let previous = unclaimed
                .get_mut(key.as_bytes())
                .and_then(VecDeque::pop_front);
            if let Some(old_idx) = previous {
                record.carry_forward(&old_records[old_idx]);
                claimed[old_idx] = true;
                carried += 1;
                trace!(area = %R::KIND, key, old_idx, idx, "carried record forward");
            }
            area.write_unlocked(idx, record)?;
        }

        let orphans: Vec<R> = old_records
            .iter()
            .zip(&claimed)
            .filter(|(record, claimed)| !**claimed && !record.key().is_empty())
            .map(|(record, _)| *record)
            .collect();

        if let Some(old) = old {
            old.unmap_and_release(true);
        } else if let Some(version) = stored_version {
            // an unusable predecessor file may still be lying around
            remove_leftover(&paths.region_path(version));
        }

        id_file.write_version(version_id)?;

        let fresh = configs.len() - carried;
        info!(
            area = %R::KIND,
            version_id,
            previous = ?previous_version,
            carried,
            fresh,
            orphans = orphans.len(),
            "published status area"
        );

        Ok(Migration {
            area,
            previous_version,
            carried,
            fresh,
            orphans,
        })
    }

    fn usable_predecessor(&self, version: i32) -> Option<StatusArea<R>> {
        match StatusArea::<R>::open_existing(&self.dir, version) {
            Ok(area) => Some(area),
            Err(e) => {
                warn!(
                    area = %R::KIND,
                    version,
                    error = %e,
                    "no usable previous status area, starting fresh"
                );
                None
            }
        }
    }
}

fn remove_leftover(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed unusable status area"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove unusable status area"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fra::{DirConfig, DirectoryStatus};
    use crate::fsa::{HostConfig, HostStatus};

    fn hosts(aliases: &[&str]) -> Vec<HostConfig> {
        aliases.iter().map(|a| HostConfig::new(*a)).collect()
    }

    #[test]
    fn first_migration_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = StatusAreaMigrator::<HostStatus>::new(dir.path());
        let m = migrator.migrate(&hosts(&["a", "b"])).unwrap();

        assert_eq!(m.area.version_id(), 0);
        assert_eq!(m.previous_version, None);
        assert_eq!((m.carried, m.fresh), (0, 2));
        assert!(m.orphans.is_empty());

        let id = IdFile::open_existing(&dir.path().join("fsa.id")).unwrap();
        assert_eq!(id.read_version().unwrap(), Some(0));
    }

    #[test]
    fn duplicate_old_keys_are_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = StatusAreaMigrator::<DirectoryStatus>::new(dir.path());
        let first = migrator
            .migrate(&[DirConfig::new("in", 1), DirConfig::new("out", 2)])
            .unwrap();

        // Force a key collision in the live region.
        first
            .area
            .update(1, |d| {
                d.dir_alias = DirectoryStatus::fresh(&DirConfig::new("in", 9)).dir_alias;
                d.files_received = 2;
            })
            .unwrap();
        first.area.update(0, |d| d.files_received = 1).unwrap();
        drop(first);

        let second = migrator.migrate(&[DirConfig::new("in", 1)]).unwrap();
        assert_eq!(second.carried, 1);
        assert_eq!(second.area.record(0).unwrap().files_received, 1);
        assert_eq!(second.orphans.len(), 1);
        assert_eq!(second.orphans[0].files_received, 2);
    }

    #[test]
    fn corrupt_predecessor_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = StatusAreaMigrator::<HostStatus>::new(dir.path());
        let first = migrator.migrate(&hosts(&["a"])).unwrap();
        let path = first.area.path().to_path_buf();
        drop(first);

        std::fs::write(&path, b"garbage").unwrap();

        let second = migrator.migrate(&hosts(&["a"])).unwrap();
        assert_eq!(second.previous_version, None);
        assert_eq!(second.area.version_id(), 1);
        assert_eq!(second.carried, 0);
        assert!(!path.exists());
    }

    #[test]
    fn already_stale_predecessor_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = StatusAreaMigrator::<HostStatus>::new(dir.path());
        let first = migrator.migrate(&hosts(&["a", "b"])).unwrap();
        first.area.update(0, |h| h.error_counter = 3).unwrap();
        let path = first.area.path().to_path_buf();
        // a migration that died after marking but before publishing
        first.area.mark_stale();
        drop(first);

        let second = migrator.migrate(&hosts(&["a"])).unwrap();
        assert_eq!(second.previous_version, None);
        assert_eq!(second.area.version_id(), 1);
        assert_eq!((second.carried, second.fresh), (0, 1));
        assert!(second.orphans.is_empty());
        assert_eq!(second.area.record(0).unwrap().error_counter, 0);
        assert!(!path.exists());
    }
}
