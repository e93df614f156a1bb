//! Consumer side of region rotation.
//!
//! Each long-lived process owns an [`AttachedRegion`] and calls
//! [`check`](AttachedRegion::check) once per work-loop iteration. While the
//! region is current that is a single atomic load.

use std::path::{Path, PathBuf};

use crate::area::StatusArea;
use crate::error::{Result, StatusError};
use crate::id_file::IdFile;
use crate::layout::AreaPaths;
use crate::record::StatusRecord;

/// What [`AttachedRegion::check`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    Unchanged,
    /// The region was replaced; cached indices and lengths must be
    /// refreshed.
    Rotated { version_id: i32, capacity: usize },
}

/// The status area this process currently works against.
pub struct AttachedRegion<R: StatusRecord> {
    paths: AreaPaths,
    area: StatusArea<R>,
}

impl<R: StatusRecord> AttachedRegion<R> {
    /// Map whichever region the ID file in `dir` names.
    pub fn attach(dir: &Path) -> Result<Self> {
        let paths = AreaPaths::new(dir, R::KIND);
        let area = open_current(&paths, &mut None)?;
        debug!(
            area = %R::KIND,
            version_id = area.version_id(),
            capacity = area.capacity(),
            "attached to status area"
        );
        Ok(Self { paths, area })
    }

    /// Reattach if the mapped region has gone stale.
    ///
    /// The current version is looked up afresh, so several rotations since
    /// the last call collapse into one `Rotated`. Failing to map the current
    /// region is a `ReattachFailed` error, which is fatal class.
    pub fn check(&mut self) -> Result<AttachStatus> {
        if !self.area.is_stale() {
            return Ok(AttachStatus::Unchanged);
        }

        let stale_version = self.area.version_id();
        let mut current = None;
        let area = open_current(&self.paths, &mut current).map_err(|e| {
            error!(
                area = %R::KIND,
                stale_version,
                error = %e,
                "cannot reattach to current status area"
            );
            StatusError::ReattachFailed {
                version_id: current,
                source: Box::new(e),
            }
        })?;

        let old = std::mem::replace(&mut self.area, area);
        old.unmap_and_release(false);

        let version_id = self.area.version_id();
        let capacity = self.area.capacity();
        info!(
            area = %R::KIND,
            from = stale_version,
            to = version_id,
            capacity,
            "reattached to rotated status area"
        );
        Ok(AttachStatus::Rotated {
            version_id,
            capacity,
        })
    }

    #[inline]
    pub fn area(&self) -> &StatusArea<R> {
        &self.area
    }
}

/// Read the ID file under a shared lock and map the region it names. The
/// lock is held across the open so a concurrent migration cannot retire the
/// region in between. `seen` receives the version id once it is known.
fn open_current<R: StatusRecord>(
    paths: &AreaPaths,
    seen: &mut Option<i32>,
) -> Result<StatusArea<R>> {
    let id_path: PathBuf = paths.id_path();
    let id_file = IdFile::open_existing(&id_path)?;
    let _lock = id_file.lock_shared()?;

    let Some(version_id) = id_file.read_version()? else {
        return Err(StatusError::NotFound { path: id_path });
    };
    *seen = Some(version_id);

    StatusArea::open_existing(paths.dir(), version_id)
}
