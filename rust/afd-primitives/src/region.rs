use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// A contiguous block of memory addressed by byte offset.
///
/// `Region` is a plain view: it does not own the memory and may be copied
/// freely. Whoever created it (an [`MmapRegion`](crate::MmapRegion) or a
/// [`HeapRegion`]) keeps the memory alive.
///
/// # Safety
///
/// The creator must ensure:
/// - `base` is valid for `len` bytes and aligned for every type read from it
/// - the memory outlives every copy of this `Region`
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// Returns `None` if `base` is null.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for `len` bytes
    /// - `base` must be aligned for all contained types (8 bytes suffices for
    ///   status areas)
    /// - the memory must remain valid for the lifetime of this Region
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, len })
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if a `T` fits at `off` and `off` is aligned for it.
    #[inline]
    pub fn fits<T>(&self, off: usize) -> bool {
        off.checked_add(size_of::<T>())
            .is_some_and(|end| end <= self.len)
            && off.is_multiple_of(align_of::<T>())
    }

    /// Returns a pointer to a `T` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if the `T` does not fit at `off` or `off` is misaligned.
    #[inline]
    pub fn ptr_at<T>(&self, off: usize) -> *mut T {
        assert!(
            self.fits::<T>(off),
            "offset {off} does not fit a {}-byte value (len={})",
            size_of::<T>(),
            self.len
        );
        unsafe { self.as_ptr().add(off) as *mut T }
    }

    /// Returns a reference to a `T` at the given byte offset.
    ///
    /// # Safety
    ///
    /// Every bit pattern must be a valid `T`, and nothing may hold a `&mut`
    /// to the same bytes. Fields that other processes write concurrently must
    /// be atomics.
    #[inline]
    pub unsafe fn get<T>(&self, off: usize) -> &T {
        unsafe { &*self.ptr_at::<T>(off) }
    }

    /// Copy a `T` out of the region with a volatile read.
    ///
    /// Used for snapshots of records that other processes may be writing;
    /// the copy can be torn unless the writer holds the record lock.
    ///
    /// # Safety
    ///
    /// Every bit pattern must be a valid `T`.
    #[inline]
    pub unsafe fn read_volatile<T: Copy>(&self, off: usize) -> T {
        unsafe { std::ptr::read_volatile(self.ptr_at::<T>(off)) }
    }

    /// Write a `T` into the region with a volatile store.
    ///
    /// # Safety
    ///
    /// The caller must hold whatever lock guards these bytes, or own the
    /// region exclusively (e.g. a freshly created, unpublished area).
    #[inline]
    pub unsafe fn write_volatile<T: Copy>(&self, off: usize, value: T) {
        unsafe { std::ptr::write_volatile(self.ptr_at::<T>(off), value) }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Heap-backed region for tests or in-process usage.
pub struct HeapRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate a zeroed heap region aligned to 64 bytes.
    ///
    /// # Panics
    ///
    /// Panics if the allocator fails.
    pub fn new_zeroed(size: usize) -> Self {
        let layout = match Layout::from_size_align(size.max(1), 64) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid heap region layout for {size} bytes: {e}"),
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self {
            base,
            len: size,
            layout,
        }
    }

    /// Returns a Region view of this allocation.
    #[inline]
    pub fn region(&self) -> Region {
        Region {
            base: self.base,
            len: self.len,
        }
    }

    /// Returns the allocation size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the allocation is zero-length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}
