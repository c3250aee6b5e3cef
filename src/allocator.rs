//! Public face of the crate. [`Segalloc`] wraps the single-threaded
//! [`Heap`] in a [`Mutex`] so it can satisfy [`GlobalAlloc`] and be shared
//! across threads. One global lock is plenty here; the interesting
//! concurrency story for an allocator is per-thread caching, and this crate
//! deliberately does not tell it.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{checker, heap::Heap, region::RegionSource, tag::DSIZE, OutOfMemory};

#[cfg(unix)]
use crate::region::Sbrk;

/// A segregated free list allocator over a growable contiguous region.
///
/// # Examples
///
/// ## Standalone, arena backed
///
/// ```rust
/// use segalloc::{FixedArena, Segalloc};
///
/// let allocator = Segalloc::with_source(FixedArena::with_capacity(64 * 1024));
///
/// let address = allocator.allocate(128).unwrap();
/// unsafe {
///     address.as_ptr().write_bytes(7, 128);
///     assert_eq!(address.as_ptr().read(), 7);
///     allocator.release(Some(address));
/// }
///
/// assert_eq!(allocator.check_heap(false), 0);
/// ```
///
/// ## Global allocator
///
/// ```rust,no_run
/// use segalloc::{Sbrk, Segalloc};
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc<Sbrk> = Segalloc::new();
///
/// fn main() {
///     let greeting = String::from("allocated off the program break");
///     assert!(greeting.capacity() > 0);
/// }
/// ```
///
/// Payloads are always 8-aligned and never more: `GlobalAlloc` requests
/// with stricter alignment are refused with a null return.
pub struct Segalloc<S: RegionSource> {
    heap: Mutex<Heap<S>>,
}

#[cfg(unix)]
impl Segalloc<Sbrk> {
    /// An allocator backed by the Unix program break.
    pub const fn new() -> Self {
        Self::with_source(Sbrk::new())
    }
}

#[cfg(unix)]
impl Default for Segalloc<Sbrk> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RegionSource> Segalloc<S> {
    /// An allocator drawing memory from the given source.
    pub const fn with_source(source: S) -> Self {
        Self {
            heap: Mutex::new(Heap::new(source)),
        }
    }

    /// Prepares the heap up front. Optional: the first allocation does this
    /// on its own. Fails if the region source cannot provide the initial
    /// memory.
    pub fn init(&self) -> Result<(), OutOfMemory> {
        match self.heap.lock() {
            Ok(mut heap) => heap.init(),
            Err(_) => Err(OutOfMemory),
        }
    }

    /// Reserves `size` bytes and returns the 8-aligned payload address, or
    /// `None` for a zero-sized request or when memory is exhausted.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate(size) },
            Err(_) => None,
        }
    }

    /// Returns an allocation to the heap. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `pointer` must be `None` or an address obtained from this allocator
    /// that has not been released since.
    pub unsafe fn release(&self, pointer: Option<NonNull<u8>>) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.release(pointer);
        }
    }

    /// Reallocates to `size` bytes, preserving the payload prefix that fits.
    /// On failure the original allocation stays valid and `None` is
    /// returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Segalloc::release`].
    pub unsafe fn resize(&self, pointer: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        match self.heap.lock() {
            Ok(mut heap) => heap.resize(pointer, size),
            Err(_) => None,
        }
    }

    /// Allocates `count * element_size` bytes, zeroed. Fails on overflow of
    /// the multiplication.
    pub fn zero_allocate(&self, count: usize, element_size: usize) -> Option<NonNull<u8>> {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.zero_allocate(count, element_size) },
            Err(_) => None,
        }
    }

    /// Runs the consistency checker and returns the number of violations,
    /// reporting each one through [`log::error!`]. With `verbose` set, every
    /// block is reported through [`log::debug!`] along the way.
    pub fn check_heap(&self, verbose: bool) -> usize {
        match self.heap.lock() {
            Ok(heap) => checker::check(&heap, verbose),
            Err(_) => 0,
        }
    }

    /// First byte of the heap region, once initialized.
    pub fn low(&self) -> Option<NonNull<u8>> {
        self.heap.lock().ok().and_then(|heap| heap.low())
    }

    /// One past the last byte of the heap region, once initialized.
    pub fn high(&self) -> Option<NonNull<u8>> {
        self.heap.lock().ok().and_then(|heap| heap.high())
    }
}

// The heap holds raw pointers, which kills the auto impl. All access goes
// through the mutex, so sharing the wrapper is sound.
unsafe impl<S: RegionSource> Sync for Segalloc<S> {}

unsafe impl<S: RegionSource> GlobalAlloc for Segalloc<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > DSIZE {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(NonNull::new(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > DSIZE {
            return ptr::null_mut();
        }

        match self.resize(NonNull::new(ptr), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > DSIZE {
            return ptr::null_mut();
        }

        match self.zero_allocate(layout.size(), 1) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::region::FixedArena;

    fn arena_allocator(capacity: usize) -> Segalloc<FixedArena> {
        Segalloc::with_source(FixedArena::with_capacity(capacity))
    }

    #[test]
    fn facade_round_trip() {
        let allocator = arena_allocator(16 * 1024);

        let address = allocator.allocate(100).unwrap();
        unsafe {
            address.as_ptr().write_bytes(0x42, 100);
            assert_eq!(address.as_ptr().add(99).read(), 0x42);
            allocator.release(Some(address));
        }

        assert_eq!(allocator.check_heap(false), 0);
    }

    #[test]
    fn init_reports_exhaustion() {
        // Too small for even the initial layout.
        let allocator = arena_allocator(64);
        assert_eq!(allocator.init(), Err(OutOfMemory));
        assert_eq!(allocator.allocate(8), None);
    }

    #[test]
    fn global_alloc_respects_the_alignment_limit() {
        let allocator = arena_allocator(16 * 1024);

        unsafe {
            let fine = Layout::from_size_align(64, 8).unwrap();
            let address = allocator.alloc(fine);
            assert!(!address.is_null());
            assert_eq!(address as usize % 8, 0);
            allocator.dealloc(address, fine);

            let too_strict = Layout::from_size_align(64, 16).unwrap();
            assert!(allocator.alloc(too_strict).is_null());
            assert!(allocator.alloc_zeroed(too_strict).is_null());
        }

        assert_eq!(allocator.check_heap(false), 0);
    }

    #[test]
    fn global_alloc_realloc_preserves_contents() {
        let allocator = arena_allocator(16 * 1024);

        unsafe {
            let layout = Layout::from_size_align(32, 8).unwrap();
            let old = allocator.alloc(layout);
            for i in 0..32 {
                old.add(i).write(i as u8);
            }

            let new = allocator.realloc(old, layout, 128);
            assert!(!new.is_null());
            for i in 0..32 {
                assert_eq!(new.add(i).read(), i as u8);
            }

            allocator.dealloc(new, Layout::from_size_align(128, 8).unwrap());
        }

        assert_eq!(allocator.check_heap(false), 0);
    }

    #[test]
    fn global_alloc_zeroed() {
        let allocator = arena_allocator(16 * 1024);

        unsafe {
            let layout = Layout::from_size_align(256, 8).unwrap();
            let address = allocator.alloc_zeroed(layout);
            assert!(!address.is_null());
            for i in 0..256 {
                assert_eq!(address.add(i).read(), 0);
            }
            allocator.dealloc(address, layout);
        }

        assert_eq!(allocator.check_heap(false), 0);
    }

    #[test]
    fn concurrent_use_through_the_lock() {
        let allocator = arena_allocator(256 * 1024);
        let threads: usize = 4;

        thread::scope(|scope| {
            for t in 0..threads {
                let allocator = &allocator;
                scope.spawn(move || {
                    for round in 0..50 {
                        let size = 16 + (t * 13 + round * 7) % 200;
                        let address = allocator.allocate(size).unwrap();

                        unsafe {
                            address.as_ptr().write_bytes(t as u8 + 1, size);
                            for i in 0..size {
                                assert_eq!(address.as_ptr().add(i).read(), t as u8 + 1);
                            }
                            allocator.release(Some(address));
                        }
                    }
                });
            }
        });

        assert_eq!(allocator.check_heap(false), 0);
    }

    #[test]
    fn heap_span_is_reported() {
        let allocator = arena_allocator(16 * 1024);
        assert!(allocator.low().is_none());

        allocator.init().unwrap();
        let low = allocator.low().unwrap().as_ptr() as usize;
        let high = allocator.high().unwrap().as_ptr() as usize;
        assert!(high - low >= 4096);
    }
}
