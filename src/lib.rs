//! # segalloc - A Segregated Free List Memory Allocator
//!
//! General purpose dynamic storage allocator over a single contiguous,
//! monotonically growing byte region. Freed memory is recycled through ten
//! segregated free lists; adjacent free blocks are merged eagerly through
//! boundary tags, so no two free blocks ever touch.
//!
//! ## Heap layout
//!
//! ```text
//!             +-----------+
//!    base ->  |  padding  |  4 bytes, aligns everything after it
//!             +-----------+
//!             | prologue  |  permanently allocated block whose payload
//!             |           |  hosts the ten free list sentinels
//!             +-----------+
//!             |  block    |  allocated: header + payload
//!             +-----------+
//!             |  block    |  free: header + links + footer,
//!             |           |  indexed by one of the ten size classes
//!             +-----------+
//!             |   ...     |
//!             +-----------+
//!             | epilogue  |  zero sized, allocated, terminates walks
//!             +-----------+  <- grows this way on demand
//! ```
//!
//! Every block size is a multiple of 8 and carries its allocation state in
//! the low bits of a 4-byte header. Allocated blocks skip the footer: a bit
//! in the successor's header remembers their state instead, so the usable
//! payload starts 4 bytes after the block address and runs to the next
//! header. The price of a free block staying findable is 16 bytes minimum.
//!
//! ## Placement policy
//!
//! Small size classes are served first-fit: the classes are narrow, so the
//! first block that fits wastes little, and small requests are the hot
//! path. From 128 bytes up the candidate classes are scanned for the
//! tightest block, trading a longer search for less stranded memory.
//!
//! ## Crate structure
//!
//! ```text
//!   segalloc
//!   ├── tag        - boundary tag codec and raw word access
//!   ├── block      - block navigation over boundary tags
//!   ├── region     - region sources (sbrk, fixed arena) and growth
//!   ├── freelist   - size classes and sentinel-anchored lists
//!   ├── heap       - fit, place, coalesce, extend; the allocator core
//!   ├── checker    - structural invariant verification
//!   └── allocator  - public facade, locking, GlobalAlloc
//! ```
//!
//! The heap's own metadata stores no native pointers: free list links are
//! 32-bit offsets from the heap base, which caps the heap at 4 GiB and
//! keeps the minimum block at 16 bytes on 64 bit targets.

use std::{error, fmt, ptr::NonNull};

mod allocator;
mod block;
mod checker;
mod freelist;
mod heap;
mod region;
mod tag;

/// Nullable pointer, the crate-internal spelling for addresses that may be
/// absent. Forces the null case to be handled at every use.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// The backing region refused to grow. Returned by explicit initialization;
/// allocation paths report the same condition as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("backing region cannot grow any further")
    }
}

impl error::Error for OutOfMemory {}

pub use allocator::Segalloc;
pub use region::{FixedArena, RegionSource};

#[cfg(unix)]
pub use region::Sbrk;
