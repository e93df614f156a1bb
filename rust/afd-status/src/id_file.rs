//! The ID file: a single native-endian `i32` naming the current region.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};

use afd_primitives::{LockKind, LockMode, ScopedLock};

use crate::error::{Op, Result, StatusError};

/// An open ID file.
pub struct IdFile {
    file: File,
    path: PathBuf,
}

impl IdFile {
    /// Open the ID file, creating it empty (mode 0600) if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(|e| StatusError::io(Op::ReadIdFile, path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an ID file that must already exist.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StatusError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => StatusError::io(Op::ReadIdFile, path, e),
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, kind: LockKind) -> Result<ScopedLock<'_>> {
        ScopedLock::whole_file(self.file.as_fd(), kind, LockMode::Blocking)
            .map_err(|e| StatusError::io(Op::LockIdFile, &self.path, e))
    }

    /// Block until we hold the write lock. Held for the whole of a
    /// migration.
    pub fn lock_exclusive(&self) -> Result<ScopedLock<'_>> {
        self.lock(LockKind::Write)
    }

    /// Block until we hold a read lock; waits out a migration in progress.
    pub fn lock_shared(&self) -> Result<ScopedLock<'_>> {
        self.lock(LockKind::Read)
    }

    /// The stored version id, or `None` for a new (empty) file.
    pub fn read_version(&self) -> Result<Option<i32>> {
        let mut buf = [0u8; 4];
        match self.file.read_exact_at(&mut buf, 0) {
            Ok(()) => Ok(Some(i32::from_ne_bytes(buf))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(StatusError::io(Op::ReadIdFile, &self.path, e)),
        }
    }

    /// Overwrite the stored version id and flush it to disk.
    pub fn write_version(&self, version_id: i32) -> Result<()> {
        let write = || -> io::Result<()> {
            self.file.write_all_at(&version_id.to_ne_bytes(), 0)?;
            self.file.set_len(4)?;
            self.file.sync_data()
        };
        write().map_err(|e| {
            error!(path = %self.path.display(), version_id, error = %e, "cannot write id file");
            StatusError::io(Op::WriteIdFile, &self.path, e)
        })
    }
}
