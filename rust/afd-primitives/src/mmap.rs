//! File-backed memory-mapped regions for cross-process shared memory.
//!
//! An `MmapRegion` maps a file with `MAP_SHARED`. The mapping keeps the inode
//! alive, so the backing name can be unlinked while other processes still
//! have it mapped: their view stays valid memory until they unmap.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use crate::Region;

/// What happens to the backing file when the creating region is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCleanup {
    /// Leave the file in place; someone else decides when it goes away.
    Manual,
    /// Remove the file when this region is dropped.
    OnDrop,
}

/// File-backed memory-mapped region for cross-process shared memory.
pub struct MmapRegion {
    /// Pointer to the mapped memory
    ptr: *mut u8,
    /// Length of the mapping in bytes
    len: usize,
    /// The underlying file, kept open for byte-range locks
    file: File,
    /// Path the region was created at or attached from
    path: PathBuf,
    /// Whether dropping this region removes the file
    owns_file: bool,
}

impl MmapRegion {
    /// Create a new file-backed region of exactly `size` zeroed bytes.
    ///
    /// The file is created (or truncated) with permissions 0600, sized with
    /// `ftruncate` and mapped read-write.
    pub fn create(path: &Path, size: usize, cleanup: FileCleanup) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        let ptr = map_shared(&file, size)?;

        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: cleanup == FileCleanup::OnDrop,
        })
    }

    /// Attach to an existing file-backed region.
    ///
    /// The current file size determines the mapping size. Attached regions
    /// never remove the file on drop.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;

        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region file is empty",
            ));
        }

        let ptr = map_shared(&file, size)?;

        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    /// Get a `Region` view of this mapping.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: mmap never returns null on success, and the mapping lives
        // as long as self.
        match unsafe { Region::from_raw(self.ptr, self.len) } {
            Some(region) => region,
            None => unreachable!("mmap returned a null mapping"),
        }
    }

    /// Get the size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (zero bytes).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the path the region was created at or attached from.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing name now. The mapping (ours and everyone else's)
    /// remains valid until unmapped.
    pub fn unlink(&mut self) -> io::Result<()> {
        self.owns_file = false;
        std::fs::remove_file(&self.path)
    }
}

impl AsFd for MmapRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

fn map_shared(file: &File, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::warn!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "munmap failed"
            );
        }

        if self.owns_file
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove region file");
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of MmapRegion and may be
// touched from any thread; cross-thread discipline is the caller's business,
// same as cross-process.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}
