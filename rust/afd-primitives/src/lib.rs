//! Building blocks for AFD's shared status areas.
//!
//! - [`Region`]: an offset-addressed view over a block of raw memory.
//! - [`HeapRegion`]: zeroed heap backing, for tests and in-process use.
//! - [`MmapRegion`]: a file-backed `MAP_SHARED` mapping that stays valid after
//!   its backing name is unlinked.
//! - [`ScopedLock`]: an advisory byte-range lock on an open file, released
//!   when the guard drops.

pub mod lock;
pub mod mmap;
pub mod region;

pub use lock::{LockKind, LockMode, ScopedLock};
pub use mmap::{FileCleanup, MmapRegion};
pub use region::{HeapRegion, Region};
