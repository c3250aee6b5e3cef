//! The heap's backing storage. The allocator itself never talks to the
//! operating system, it only asks a [`RegionSource`] for more contiguous
//! bytes and never gives them back. Two sources are provided: [`Sbrk`] moves
//! the program break the way classic `malloc` implementations do, and
//! [`FixedArena`] carves a preallocated buffer, which makes tests
//! deterministic and keeps the crate usable on platforms without a program
//! break.

use std::ptr::NonNull;

use crate::{tag::WSIZE, Pointer};

/// A monotonically growable, contiguous byte region.
///
/// Implementations must guarantee that the first segment is 8-aligned and
/// that every later segment starts exactly where the previous one ended, so
/// the allocator can treat the whole region as one linear address range.
/// Nothing is ever returned to the source; the region only grows.
pub trait RegionSource {
    /// Grows the region by `bytes` and returns the base address of the new
    /// segment, or `None` if the region cannot grow any further.
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>>;
}

/// Grows the region by moving the Unix program break with `sbrk(2)`.
///
/// `sbrk(0)` reports the current break and `sbrk(n)` moves it up by `n`
/// bytes, returning the old break, which is exactly the base of the fresh
/// segment. The break is not guaranteed to start 8-aligned, so the first
/// thing every call does is pad it up to the next multiple of 8 (a no-op
/// once aligned).
///
/// The contiguity guarantee of [`RegionSource`] holds as long as nothing
/// else in the process moves the break. Mixing this source with another
/// `sbrk`/`brk` user corrupts the heap, same as it would in C.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct Sbrk {
    _priv: (),
}

#[cfg(unix)]
impl Sbrk {
    pub const fn new() -> Self {
        Self { _priv: () }
    }
}

#[cfg(unix)]
impl RegionSource for Sbrk {
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        const FAILED: *mut libc::c_void = usize::MAX as *mut libc::c_void;

        unsafe {
            let brk = libc::sbrk(0);
            if brk == FAILED {
                return None;
            }

            let misalignment = brk as usize % 8;
            if misalignment != 0 {
                let padding = 8 - misalignment;
                if libc::sbrk(padding as libc::intptr_t) == FAILED {
                    return None;
                }
            }

            let segment = libc::sbrk(bytes as libc::intptr_t);
            if segment == FAILED {
                None
            } else {
                NonNull::new(segment.cast::<u8>())
            }
        }
    }
}

/// Grows the region inside a buffer allocated up front. Once the buffer is
/// used up, [`RegionSource::extend`] fails and the allocator reports
/// out-of-memory, which makes exhaustion behavior testable without touching
/// the real program break.
pub struct FixedArena {
    /// Owns the backing memory. Only its length is ever read through this
    /// field; all payload access goes through `base`.
    storage: Box<[u64]>,
    /// Cached `storage` base address. `u64` elements make it 8-aligned.
    base: *mut u8,
    /// Bytes handed out so far.
    brk: usize,
}

impl FixedArena {
    /// Builds an arena that can hand out at most `capacity` bytes, rounded
    /// up to a multiple of 8.
    pub fn with_capacity(capacity: usize) -> Self {
        let words = capacity.div_ceil(8);
        let mut storage = vec![0u64; words].into_boxed_slice();
        let base = storage.as_mut_ptr().cast::<u8>();

        Self { storage, base, brk: 0 }
    }

    /// Total bytes this arena can hand out.
    pub fn capacity(&self) -> usize {
        self.storage.len() * 8
    }
}

impl RegionSource for FixedArena {
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes > self.capacity() - self.brk {
            return None;
        }

        let segment = unsafe { self.base.add(self.brk) };
        self.brk += bytes;

        NonNull::new(segment)
    }
}

/// Thin bridge between the allocator and its [`RegionSource`]. Tracks the
/// live `[low, high)` range and enforces the allocator's growth granularity:
/// extensions happen in whole words, rounded up to an even count so block
/// sizes stay multiples of 8.
pub(crate) struct Region<S: RegionSource> {
    source: S,
    low: Pointer<u8>,
    high: Pointer<u8>,
}

impl<S: RegionSource> Region<S> {
    pub const fn new(source: S) -> Self {
        Self { source, low: None, high: None }
    }

    /// First byte of the region. `None` until the first extension.
    pub fn low(&self) -> Pointer<u8> {
        self.low
    }

    /// One past the last byte of the region. `None` until the first
    /// extension.
    pub fn high(&self) -> Pointer<u8> {
        self.high
    }

    /// Grows the region by `words` 4-byte words (rounded up to an even
    /// count) and returns the base of the new segment.
    pub fn extend_words(&mut self, words: usize) -> Pointer<u8> {
        let words = (words + 1) & !1;
        let bytes = words * WSIZE;

        let segment = self.source.extend(bytes)?;
        debug_assert_eq!(segment.as_ptr() as usize % 8, 0);
        if let Some(high) = self.high {
            debug_assert_eq!(segment.as_ptr(), high.as_ptr());
        }

        if self.low.is_none() {
            self.low = Some(segment);
        }
        self.high = NonNull::new(segment.as_ptr().wrapping_add(bytes));

        Some(segment)
    }
}
