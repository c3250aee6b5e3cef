//! The heap proper: one growable region carrying a prologue (which hosts the
//! free list sentinels), a run of blocks, and a zero-sized epilogue marker at
//! the end. This module owns every allocation policy decision; the modules it
//! sits on only know how to encode tags, follow links and grow the region.
//!
//! ```text
//!          +---------+----------+-----------------------------+----------+
//!  region  | padding | prologue | block | block | ... | block | epilogue |
//!          +---------+----------+-----------------------------+----------+
//!          ^         ^ hosts the ten sentinels                ^ size 0,
//!          base        (see crate::freelist)                    allocated
//! ```
//!
//! `allocate` follows fit, place, return; a miss grows the region and tries
//! the fit again. `release` stamps free tags and hands the block to the
//! coalescer, which merges it with whichever lexical neighbors are free and
//! reindexes the result. The `prev_alloc` header bit spares allocated blocks
//! their footer: only free blocks pay the closing word.

use std::ptr::{self, NonNull};

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    freelist::{class_of, FreeIndex, BIG_CLASS, NUM_CLASSES},
    region::{Region, RegionSource},
    tag::{self, Tag, DSIZE, WSIZE},
    OutOfMemory, Pointer,
};

/// Bytes the region grows by on an allocation miss, unless the request
/// itself is larger. Tunable; values between 256 and 4096 trade syscall
/// frequency against tail waste.
pub(crate) const CHUNK: usize = 1 << 9;

/// Bytes of the first free block carved out at initialization.
pub(crate) const INIT: usize = 1 << 12;

/// Requests at or below this many bytes round up to [`MIN_BLOCK_SIZE`].
const MIN_PAYLOAD: usize = 12;

/// Prologue block size: header, ten 8-byte sentinels, footer.
pub(crate) const PROLOGUE_SIZE: usize = (2 * NUM_CLASSES + 2) * WSIZE;

/// Words of the initial layout: padding, prologue, epilogue.
const SETUP_WORDS: usize = 2 * NUM_CLASSES + 4;

/// Largest encodable block size; the tag stores sizes in 32 bits.
const MAX_BLOCK_SIZE: usize = (u32::MAX & !0x7) as usize;

/// Rounds a request up to a legal block size: 4 bytes of header, then up to
/// a multiple of 8, floored at the minimum block. Fails if the result cannot
/// be represented in a tag.
fn adjusted_size(request: usize) -> Option<usize> {
    if request <= MIN_PAYLOAD {
        return Some(MIN_BLOCK_SIZE);
    }

    let adjusted = request.checked_add(WSIZE + DSIZE - 1)? & !(DSIZE - 1);
    (adjusted <= MAX_BLOCK_SIZE).then_some(adjusted)
}

/// The allocator state machine. Everything except the region source handle
/// lives on the heap itself, so this struct is two pointers and the source.
///
/// Not thread safe; the public wrapper in [`crate::allocator`] adds the lock.
pub(crate) struct Heap<S: RegionSource> {
    region: Region<S>,
    /// Heap base, set once by [`Heap::init`]. `None` means uninitialized.
    base: Pointer<u8>,
}

impl<S: RegionSource> Heap<S> {
    pub const fn new(source: S) -> Self {
        Self {
            region: Region::new(source),
            base: None,
        }
    }

    /// First byte of the heap region, if initialized.
    pub fn low(&self) -> Pointer<u8> {
        self.region.low()
    }

    /// One past the last byte of the heap region, if initialized.
    pub fn high(&self) -> Pointer<u8> {
        self.region.high()
    }

    pub fn base(&self) -> Pointer<u8> {
        self.base
    }

    /// Lays out padding word, prologue with self-looped sentinels, epilogue,
    /// then grows the heap by its initial chunk. Idempotent; calling it on a
    /// live heap does nothing.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.base.is_some() {
            return Ok(());
        }

        let start = self.region.extend_words(SETUP_WORDS).ok_or(OutOfMemory)?;

        unsafe {
            // The padding word shifts the prologue payload to an 8-aligned
            // address, which in turn aligns every payload after it.
            tag::put(start.as_ptr(), 0);

            let prologue = Block::from_payload(NonNull::new_unchecked(start.as_ptr().add(DSIZE)));
            prologue.write_allocated(PROLOGUE_SIZE, true);
            FreeIndex::new(start).init_sentinels();

            // The prologue is the one allocated block that keeps a footer,
            // so the walk downward from its successor stays well defined.
            let footer = Tag { size: PROLOGUE_SIZE, alloc: true, prev_alloc: true };
            tag::put(prologue.footer(), footer.pack());

            let epilogue = prologue.next();
            epilogue.write_allocated(0, true);

            self.base = Some(start);

            self.extend(INIT / WSIZE).ok_or(OutOfMemory)?;
        }

        log::debug!("heap initialized with a {INIT} byte free block");

        Ok(())
    }

    /// Reserves `size` bytes and returns the payload address, or `None` when
    /// the request is zero, unrepresentable, or the region cannot grow.
    /// Initializes the heap on first use.
    ///
    /// # Safety
    ///
    /// The returned memory is exclusively the caller's until released, but
    /// writing past `size` bytes tramples the next block's metadata, same
    /// contract as any manual allocator.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if self.base.is_none() {
            self.init().ok()?;
        }

        if size == 0 {
            return None;
        }

        let asize = adjusted_size(size)?;

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => {
                self.extend(asize.max(CHUNK) / WSIZE)?;
                self.find_fit(asize)?
            }
        };

        self.place(block, asize);

        Some(block.payload())
    }

    /// Returns a block to the free pool, merging it with free neighbors.
    /// `None` is a silent no-op.
    ///
    /// # Safety
    ///
    /// `pointer` must be `None` or an address previously returned by
    /// [`Heap::allocate`] or [`Heap::resize`] that has not been released
    /// since. Anything else is undefined behavior; the checker exists to
    /// hunt down the aftermath.
    pub unsafe fn release(&mut self, pointer: Pointer<u8>) {
        let Some(address) = pointer else {
            return;
        };

        let block = Block::from_payload(address);
        let size = block.size();
        let prev_alloc = block.prev_alloc();

        block.write_free(size, prev_alloc);
        self.coalesce(block);
    }

    /// Moves an allocation to a block that fits `size` bytes, preserving the
    /// common prefix of the payload. Degenerates to [`Heap::release`] when
    /// `size` is zero and to [`Heap::allocate`] when `pointer` is `None`.
    /// If no new block can be found, the original allocation is untouched
    /// and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same pointer contract as [`Heap::release`].
    pub unsafe fn resize(&mut self, pointer: Pointer<u8>, size: usize) -> Pointer<u8> {
        if size == 0 {
            self.release(pointer);
            return None;
        }

        let Some(old) = pointer else {
            return self.allocate(size);
        };

        let new = self.allocate(size)?;

        let old_payload = Block::from_payload(old).size() - WSIZE;
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), size.min(old_payload));

        self.release(Some(old));

        Some(new)
    }

    /// Allocates room for `count` elements of `element_size` bytes each and
    /// zeroes all of it. Fails on multiplication overflow instead of quietly
    /// allocating a truncated size.
    ///
    /// # Safety
    ///
    /// See [`Heap::allocate`].
    pub unsafe fn zero_allocate(&mut self, count: usize, element_size: usize) -> Pointer<u8> {
        let bytes = count.checked_mul(element_size)?;
        let address = self.allocate(bytes)?;

        address.as_ptr().write_bytes(0, bytes);

        Some(address)
    }

    /// View over the in-heap free list sentinels. Only meaningful once the
    /// heap is initialized.
    pub(crate) unsafe fn index(&self) -> FreeIndex {
        FreeIndex::new(self.base.unwrap_unchecked())
    }

    /// Picks a free block able to hold `asize` bytes. Small classes use
    /// first-fit because small requests dominate and the class granularity
    /// already bounds the waste. From [`BIG_CLASS`] up the whole candidate
    /// range is scanned for the tightest fit, since a sloppy pick there
    /// strands much more memory. Ties go to the first block scanned.
    unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        let index = self.index();
        let first_class = class_of(asize);

        if first_class >= BIG_CLASS {
            let mut best: Option<Block> = None;
            let mut best_size = usize::MAX;

            for class in first_class..NUM_CLASSES {
                let sentinel = index.sentinel(class);
                let mut node = index.next_of(sentinel);
                while node != sentinel {
                    let size = node.size();
                    if size >= asize && size < best_size {
                        best = Some(node);
                        best_size = size;
                    }
                    node = index.next_of(node);
                }
            }

            best
        } else {
            for class in first_class..NUM_CLASSES {
                let sentinel = index.sentinel(class);
                let mut node = index.next_of(sentinel);
                while node != sentinel {
                    if node.size() >= asize {
                        return Some(node);
                    }
                    node = index.next_of(node);
                }
            }

            None
        }
    }

    /// Installs an allocation of `asize` bytes into free `block`, splitting
    /// off the tail as a new free block when it is big enough to stand on
    /// its own.
    unsafe fn place(&mut self, block: Block, asize: usize) {
        let index = self.index();
        let size = block.size();
        let prev_alloc = block.prev_alloc();

        index.remove(block);

        if size - asize >= MIN_BLOCK_SIZE {
            block.write_allocated(asize, prev_alloc);

            let rest = block.next();
            rest.write_free(size - asize, true);
            index.insert(rest, class_of(size - asize));
            // The block after `rest` already has its prev bit clear, the
            // split does not change what precedes it.
        } else {
            block.write_allocated(size, prev_alloc);
            block.next().set_prev_alloc(true);
        }
    }

    /// Merges a just-freed `block` (tags already written, not yet on any
    /// list) with its free lexical neighbors and indexes the result.
    /// Returns the surviving block, whose address moves backwards when the
    /// predecessor is absorbed.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let index = self.index();
        let next = block.next();
        let prev_is_free = !block.prev_alloc();
        let next_is_free = !next.is_alloc();

        match (prev_is_free, next_is_free) {
            // Both neighbors allocated: just index the block and tell the
            // successor its predecessor is now free.
            (false, false) => {
                index.insert(block, class_of(block.size()));
                next.set_prev_alloc(false);
                block
            }

            // Absorb the successor. Whatever follows it was already marked
            // prev-free, so only the tags and the index need rewriting.
            (false, true) => {
                let merged = block.size() + next.size();
                index.remove(next);
                block.write_free(merged, true);
                index.insert(block, class_of(merged));
                block
            }

            // Absorbed by the predecessor, found through the footer below
            // this block's header.
            (true, false) => {
                let prev = block.prev();
                let merged = prev.size() + block.size();
                let prev_alloc = prev.prev_alloc();

                index.remove(prev);
                prev.write_free(merged, prev_alloc);
                next.set_prev_alloc(false);
                index.insert(prev, class_of(merged));
                prev
            }

            // All three merge into the predecessor.
            (true, true) => {
                let prev = block.prev();
                let merged = prev.size() + block.size() + next.size();
                let prev_alloc = prev.prev_alloc();

                index.remove(prev);
                index.remove(next);
                prev.write_free(merged, prev_alloc);
                index.insert(prev, class_of(merged));
                prev
            }
        }
    }

    /// Grows the region by `words` (at least, the bridge rounds up) and
    /// turns the fresh segment into a free block whose header lands on the
    /// old epilogue. The block inherits the old epilogue's prev bit, gets a
    /// new epilogue after it and goes through the coalescer, so a free block
    /// that was trailing the heap fuses with the new memory.
    unsafe fn extend(&mut self, words: usize) -> Option<Block> {
        let old_high = self.region.high()?;
        let segment = self.region.extend_words(words)?;
        debug_assert_eq!(segment.as_ptr(), old_high.as_ptr());

        let bytes = self.region.high()?.as_ptr() as usize - old_high.as_ptr() as usize;

        let block = Block::from_payload(old_high);
        let prev_alloc = block.prev_alloc();
        block.write_free(bytes, prev_alloc);

        // The block before the new epilogue is free by construction, its
        // prev bit starts clear.
        let epilogue = block.next();
        epilogue.write_allocated(0, false);

        log::debug!("extended heap by {bytes} bytes");

        Some(self.coalesce(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{checker, region::FixedArena};

    fn arena_heap(capacity: usize) -> Heap<FixedArena> {
        let mut heap = Heap::new(FixedArena::with_capacity(capacity));
        heap.init().unwrap();
        heap
    }

    unsafe fn block(pointer: Pointer<u8>) -> Block {
        Block::from_payload(pointer.unwrap())
    }

    #[test]
    fn adjusted_sizes() {
        assert_eq!(adjusted_size(1), Some(16));
        assert_eq!(adjusted_size(12), Some(16));
        assert_eq!(adjusted_size(13), Some(24));
        assert_eq!(adjusted_size(24), Some(32));
        assert_eq!(adjusted_size(28), Some(32));
        assert_eq!(adjusted_size(4096), Some(4104));
        assert_eq!(adjusted_size(usize::MAX - 2), None);
    }

    #[test]
    fn first_allocation_is_aligned_and_usable() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let address = heap.allocate(1).unwrap();
            assert_eq!(address.as_ptr() as usize % 8, 0);

            let low = heap.low().unwrap().as_ptr() as usize;
            let high = heap.high().unwrap().as_ptr() as usize;
            assert!(low < address.as_ptr() as usize);
            assert!((address.as_ptr() as usize) < high);

            address.as_ptr().write(0x5A);
            assert_eq!(address.as_ptr().read(), 0x5A);

            // The smallest request still gets a minimum block.
            assert_eq!(block(Some(address)).size(), MIN_BLOCK_SIZE);
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn small_allocation_splits_the_initial_block() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let first = heap.allocate(24);
            let placed = block(first);
            assert_eq!(placed.size(), 32);
            assert!(placed.is_alloc());

            // The rest of the initial chunk trails as one free block, then
            // the epilogue.
            let rest = placed.next();
            assert!(!rest.is_alloc());
            assert_eq!(rest.size(), INIT - 32);
            assert!(rest.prev_alloc());

            let epilogue = rest.next();
            assert_eq!(epilogue.size(), 0);
            assert!(epilogue.is_alloc());
            assert!(!epilogue.prev_alloc());

            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn adjacent_releases_coalesce_into_one() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let a = heap.allocate(28);
            let b = heap.allocate(28);
            let c = heap.allocate(28);
            // Wall so the trailing free region does not join the party.
            let wall = heap.allocate(28);

            heap.release(a);
            assert_eq!(checker::check(&heap, false), 0);
            heap.release(c);
            assert_eq!(checker::check(&heap, false), 0);
            heap.release(b);
            assert_eq!(checker::check(&heap, false), 0);

            // One free block spanning all three, starting where `a` did.
            let merged = block(a);
            assert!(!merged.is_alloc());
            assert_eq!(merged.size(), 96);

            // An exact-size request reuses it whole.
            let reuse = heap.allocate(90);
            assert_eq!(reuse, a);
            assert_eq!(block(reuse).size(), 96);

            heap.release(reuse);
            heap.release(wall);
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn first_fit_returns_most_recently_freed() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let a = heap.allocate(20);
            let _w1 = heap.allocate(8);
            let b = heap.allocate(20);
            let _w2 = heap.allocate(8);
            let c = heap.allocate(20);
            let _w3 = heap.allocate(8);

            heap.release(a);
            heap.release(b);
            heap.release(c);

            // All three land in class 1; insertion is LIFO, so the scan
            // meets them newest first.
            let reuse = heap.allocate(20);
            assert_eq!(reuse, c);

            let reuse2 = heap.allocate(20);
            assert_eq!(reuse2, b);

            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn best_fit_picks_tightest_block_in_class() {
        let mut heap = arena_heap(64 * 1024);

        unsafe {
            let big = heap.allocate(8188);
            let _w1 = heap.allocate(8);
            let snug = heap.allocate(4100);
            let _w2 = heap.allocate(8);
            assert_eq!(block(big).size(), 8192);
            assert_eq!(block(snug).size(), 4104);

            heap.release(snug);
            // Released last, so the scan meets `big` first. Best-fit must
            // still pick the tighter 4104 block behind it.
            heap.release(big);

            let reuse = heap.allocate(4096);
            assert_eq!(reuse, snug);
            assert_eq!(block(reuse).size(), 4104);

            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn resize_preserves_payload_prefix() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let old = heap.allocate(16).unwrap();
            let message = b"ABCDEFGHIJKLMNOP";
            ptr::copy_nonoverlapping(message.as_ptr(), old.as_ptr(), 16);

            let new = heap.resize(Some(old), 64).unwrap();
            let mut copied = [0u8; 16];
            ptr::copy_nonoverlapping(new.as_ptr(), copied.as_mut_ptr(), 16);
            assert_eq!(&copied, message);

            // The old block was released and is reusable.
            assert_ne!(new, old);
            assert_eq!(checker::check(&heap, false), 0);

            // Shrinking keeps the prefix that still fits.
            let small = heap.resize(Some(new), 4).unwrap();
            assert_eq!(small.as_ptr().read(), b'A');
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn resize_degenerate_forms() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            // Null pointer acts like allocate.
            let fresh = heap.resize(None, 32);
            assert!(fresh.is_some());

            // Zero size acts like release.
            assert_eq!(heap.resize(fresh, 0), None);
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn miss_extends_and_fuses_with_trailing_free_block() {
        let mut heap = arena_heap(32 * 1024);

        unsafe {
            let first = heap.allocate(2044);
            assert_eq!(block(first).size(), 2048);
            let trailing = block(first).next();
            assert!(!trailing.is_alloc());
            assert_eq!(trailing.size(), INIT - 2048);

            let low = heap.low().unwrap().as_ptr() as usize;
            let high_before = heap.high().unwrap().as_ptr() as usize;

            // Doesn't fit in the trailing 2048 bytes, so the region grows
            // and the new memory fuses with them.
            let second = heap.allocate(4092);
            assert_eq!(block(second).size(), 4096);
            assert_eq!(second.unwrap(), trailing.payload());

            let high_after = heap.high().unwrap().as_ptr() as usize;
            assert!(high_after - high_before >= CHUNK);
            assert_eq!(high_after - low, SETUP_WORDS * WSIZE + INIT + 4096);

            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn exhaustion_returns_null_and_heap_survives() {
        // Room for the setup, the initial chunk and not much else.
        let mut heap = arena_heap(8192);

        unsafe {
            assert_eq!(heap.allocate(8000), None);
            assert_eq!(checker::check(&heap, false), 0);

            // The initial chunk is still whole and usable.
            let fallback = heap.allocate(2000);
            assert!(fallback.is_some());
            assert_eq!(checker::check(&heap, false), 0);

            heap.release(fallback);
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn zero_allocate_zeroes_recycled_memory() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let dirty = heap.allocate(32).unwrap();
            dirty.as_ptr().write_bytes(0xFF, 32);
            heap.release(Some(dirty));

            let clean = heap.zero_allocate(8, 4).unwrap();
            for i in 0..32 {
                assert_eq!(clean.as_ptr().add(i).read(), 0, "byte {i}");
            }

            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn zero_allocate_overflow_fails() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            assert_eq!(heap.zero_allocate(usize::MAX, 2), None);
            assert_eq!(heap.zero_allocate(usize::MAX / 2 + 1, 2), None);
            assert_eq!(heap.zero_allocate(0, 8), None);
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn degenerate_requests() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            assert_eq!(heap.allocate(0), None);
            heap.release(None);
            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn live_allocations_are_disjoint() {
        let mut heap = arena_heap(16 * 1024);

        unsafe {
            let sizes = [1usize, 13, 24, 100, 500];
            let live: Vec<(usize, usize)> = sizes
                .iter()
                .map(|&size| {
                    let address = heap.allocate(size).unwrap().as_ptr() as usize;
                    assert_eq!(address % 8, 0);
                    (address, size)
                })
                .collect();

            for (i, &(a, sa)) in live.iter().enumerate() {
                for &(b, sb) in &live[i + 1..] {
                    assert!(a + sa <= b || b + sb <= a, "ranges overlap");
                }
            }

            assert_eq!(checker::check(&heap, false), 0);
        }
    }

    #[test]
    fn mixed_workload_stays_consistent() {
        let mut heap = arena_heap(128 * 1024);

        unsafe {
            let mut live = Vec::new();

            for round in 0..6 {
                for size in [8, 24, 100, 513, 2048, 4000] {
                    live.push(heap.allocate(size + round));
                }
                assert_eq!(checker::check(&heap, false), 0);

                // Release every other allocation to shake out merges.
                let mut keep = Vec::new();
                for (i, pointer) in live.drain(..).enumerate() {
                    if i % 2 == 0 {
                        heap.release(pointer);
                    } else {
                        keep.push(pointer);
                    }
                }
                live = keep;
                assert_eq!(checker::check(&heap, false), 0);
            }

            for pointer in live {
                heap.release(pointer);
            }
            assert_eq!(checker::check(&heap, false), 0);
        }
    }
}
