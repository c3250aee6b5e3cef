//! Drives the allocator against a fixed arena and runs the consistency
//! checker after every phase. No program break involved, so this works the
//! same on every platform.

use segalloc::{FixedArena, Segalloc};

fn main() {
    let allocator = Segalloc::with_source(FixedArena::with_capacity(64 * 1024));
    allocator.init().expect("arena large enough for the initial layout");

    let low = allocator.low().unwrap();
    let high = allocator.high().unwrap();
    println!(
        "heap spans {:p}..{:p} ({} bytes)",
        low,
        high,
        high.as_ptr() as usize - low.as_ptr() as usize
    );

    // A spread of sizes across several size classes.
    let mut live = Vec::new();
    for size in [1, 24, 100, 600, 2048, 5000] {
        let address = allocator.allocate(size).expect("arena has room");
        unsafe { address.as_ptr().write_bytes(0xAA, size) };
        live.push((address, size));
    }
    println!("allocated {} blocks, checker: {} errors", live.len(), allocator.check_heap(false));

    // Release every other block, then the rest, exercising all coalesce
    // shapes.
    for (i, &(address, _)) in live.iter().enumerate() {
        if i % 2 == 0 {
            unsafe { allocator.release(Some(address)) };
        }
    }
    println!("released half, checker: {} errors", allocator.check_heap(false));

    for (i, &(address, _)) in live.iter().enumerate() {
        if i % 2 == 1 {
            unsafe { allocator.release(Some(address)) };
        }
    }
    println!("released all, checker: {} errors", allocator.check_heap(false));

    let zeroed = allocator.zero_allocate(128, 8).expect("arena has room");
    let all_zero = (0..1024).all(|i| unsafe { zeroed.as_ptr().add(i).read() } == 0);
    println!("zero_allocate handed out {} memory", if all_zero { "clean" } else { "DIRTY" });

    let grown = allocator.high().unwrap().as_ptr() as usize - low.as_ptr() as usize;
    println!("final heap size: {grown} bytes, checker: {} errors", allocator.check_heap(true));
}
