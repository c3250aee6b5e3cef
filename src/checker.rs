//! Heap consistency checker. Walks the block run by boundary tags and every
//! free list by links, cross-checking the two views against each other.
//! Violations are reported through [`log::error!`] and counted; a healthy
//! heap comes back as zero. The walk bails out early when metadata is too
//! damaged to navigate safely, so a corrupted heap produces errors instead
//! of reads outside the region.

use std::ptr::NonNull;

use crate::{
    block::{Block, MIN_BLOCK_SIZE},
    freelist::{class_of, NUM_CLASSES},
    heap::{Heap, PROLOGUE_SIZE},
    region::RegionSource,
    tag::{self, DSIZE, WSIZE},
};

/// Verifies every structural invariant of the heap and returns the number
/// of violations found. With `verbose` set, each visited block is also
/// reported through [`log::debug!`].
pub(crate) fn check<S: RegionSource>(heap: &Heap<S>, verbose: bool) -> usize {
    let (Some(base), Some(high)) = (heap.base(), heap.high()) else {
        // Nothing exists before initialization, so nothing can be wrong.
        return 0;
    };

    let base_addr = base.as_ptr() as usize;
    let high_addr = high.as_ptr() as usize;
    let in_heap = |addr: usize| base_addr < addr && addr < high_addr;

    let mut errors = 0usize;

    macro_rules! fail {
        ($($arg:tt)*) => {{
            log::error!($($arg)*);
            errors += 1;
        }};
    }

    unsafe {
        if tag::get(base.as_ptr()) != 0 {
            fail!("padding word at {:p} is not zero", base.as_ptr());
        }

        let prologue = Block::from_payload(NonNull::new_unchecked(base.as_ptr().add(DSIZE)));
        let prologue_tag = prologue.tag();
        if prologue_tag.size != PROLOGUE_SIZE || !prologue_tag.alloc || !prologue_tag.prev_alloc {
            fail!(
                "bad prologue at {:p}: size {}, alloc {}, prev_alloc {}",
                prologue.addr(),
                prologue_tag.size,
                prologue_tag.alloc,
                prologue_tag.prev_alloc
            );
        }

        // Lexical walk from the first real block to the epilogue.
        let mut free_in_walk = 0usize;
        let mut prev_was_alloc = true;
        let mut prev_was_free = false;
        let mut block = prologue.next();

        loop {
            let addr = block.addr() as usize;

            if addr % DSIZE != 0 {
                fail!("block {:p} is not 8-aligned, walk aborted", block.addr());
                break;
            }
            // The epilogue's block address sits exactly at the region end,
            // its header one word below. Anything past that is unreadable.
            if !(base_addr < addr && addr <= high_addr) {
                fail!("block {:p} lies outside the heap, walk aborted", block.addr());
                break;
            }

            let decoded = block.tag();

            if decoded.size == 0 {
                // Epilogue. It terminates the walk and must sit exactly at
                // the end of the region.
                if verbose {
                    log::debug!("{:p}: epilogue", block.addr());
                }
                if !decoded.alloc {
                    fail!("epilogue at {:p} is not allocated", block.addr());
                }
                if decoded.prev_alloc != prev_was_alloc {
                    fail!("epilogue prev_alloc bit disagrees with the last block");
                }
                if block.header() as usize != high_addr - WSIZE {
                    fail!(
                        "epilogue at {:p} is not at the region end {:#x}",
                        block.addr(),
                        high_addr
                    );
                }
                break;
            }

            if decoded.size < MIN_BLOCK_SIZE || decoded.size % DSIZE != 0 {
                fail!(
                    "block {:p} has illegal size {}, walk aborted",
                    block.addr(),
                    decoded.size
                );
                break;
            }
            if addr + decoded.size > high_addr {
                fail!("block {:p} overruns the heap end, walk aborted", block.addr());
                break;
            }

            // Size is sane from here on, so the footer is readable.
            if verbose {
                if decoded.alloc {
                    log::debug!(
                        "{:p}: allocated, size {}, prev_alloc {}",
                        block.addr(),
                        decoded.size,
                        decoded.prev_alloc
                    );
                } else {
                    log::debug!(
                        "{:p}: free, size {}, prev_alloc {}, footer size {}",
                        block.addr(),
                        decoded.size,
                        decoded.prev_alloc,
                        block.footer_tag().size
                    );
                }
            }

            if decoded.prev_alloc != prev_was_alloc {
                fail!(
                    "prev_alloc bit of {:p} disagrees with its predecessor",
                    block.addr()
                );
            }

            if !decoded.alloc {
                free_in_walk += 1;

                let footer = block.footer_tag();
                if footer.size != decoded.size || footer.alloc {
                    fail!(
                        "free block {:p} header (size {}) does not match footer (size {}, alloc {})",
                        block.addr(),
                        decoded.size,
                        footer.size,
                        footer.alloc
                    );
                }

                if prev_was_free {
                    fail!("adjacent free blocks at {:p}", block.addr());
                }
            }

            prev_was_free = !decoded.alloc;
            prev_was_alloc = decoded.alloc;
            block = block.next();
        }

        // Free list side: every class list must be a sound circular list of
        // free blocks of the right size, and the total node count must match
        // what the walk saw.
        let index = heap.index();
        let mut free_in_lists = 0usize;

        for class in 0..NUM_CLASSES {
            let sentinel = index.sentinel(class);

            // Tortoise and hare. A healthy list brings the hare back to the
            // sentinel; a corrupted one traps it in a loop with the tortoise.
            let mut tortoise = sentinel;
            let mut hare = sentinel;
            let mut broken = false;

            loop {
                hare = index.next_of(hare);
                if hare == sentinel {
                    break;
                }
                if !in_heap(hare.addr() as usize) {
                    fail!("class {class} list escapes the heap at {:p}", hare.addr());
                    broken = true;
                    break;
                }

                hare = index.next_of(hare);
                if hare == sentinel {
                    break;
                }
                if !in_heap(hare.addr() as usize) {
                    fail!("class {class} list escapes the heap at {:p}", hare.addr());
                    broken = true;
                    break;
                }

                tortoise = index.next_of(tortoise);
                if hare == tortoise {
                    fail!("class {class} list cycles without reaching its sentinel");
                    broken = true;
                    break;
                }
            }

            if broken {
                // The list cannot be traversed meaningfully.
                continue;
            }

            let mut node = index.next_of(sentinel);
            while node != sentinel {
                free_in_lists += 1;

                let next = index.next_of(node);
                let prev = index.prev_of(node);

                if !in_heap(prev.addr() as usize) {
                    fail!("prev link of {:p} escapes the heap", node.addr());
                }
                if index.prev_of(next) != node {
                    fail!("links around {:p} do not invert", node.addr());
                }

                if node.is_alloc() {
                    fail!("allocated block {:p} sits on class {class} list", node.addr());
                }

                let size = node.size();
                if class_of(size) != class {
                    fail!(
                        "block {:p} of size {size} filed in class {class}, belongs in {}",
                        node.addr(),
                        class_of(size)
                    );
                }

                node = next;
            }
        }

        if free_in_walk != free_in_lists {
            fail!(
                "heap walk found {free_in_walk} free blocks but the class lists hold {free_in_lists}"
            );
        }
    }

    errors
}
