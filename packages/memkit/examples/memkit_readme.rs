//! Example that demonstrates the usage shown in the crate documentation.
//!
//! Builds a small symbol table in an arena, keeps fixed-size nodes in a pool and checks the
//! whole thing for leaks with the debug allocator.

use std::ptr::NonNull;

use memkit::{Arena, DebugAllocator, Pool, TracingSink, ViolationPolicy};

#[derive(Clone, Copy)]
struct Node {
    value: u64,
    next: Option<NonNull<Node>>,
}

fn main() {
    println!("=== memkit README Example ===");

    // Arena: copy strings in, throw them all away at once.
    let mut arena = Arena::new();

    let names = ["alpha", "beta", "gamma"];
    let mut copies = Vec::new();

    for name in names {
        let ptr = arena.alloc(name.len()).expect("system allocator has memory");

        // SAFETY: The arena just handed us name.len() bytes that do not overlap the source.
        unsafe { ptr.copy_from_nonoverlapping(NonNull::from(name.as_bytes()).cast(), name.len()) };

        copies.push((ptr, name.len()));
    }

    for (ptr, len) in &copies {
        // SAFETY: We wrote len valid UTF-8 bytes at ptr above and the arena was not reset since.
        let text = unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr.as_ptr(), *len)) };
        println!("arena copy: {text}");
    }

    println!(
        "arena holds {} bytes in {} block(s)",
        arena.total_allocated(),
        arena.block_count()
    );
    arena.reset();

    // Pool: a linked list of fixed-size nodes.
    let mut pool = Pool::builder().layout_of::<Node>().items_per_block(8).build();

    let mut head: Option<NonNull<Node>> = None;
    let mut items = Vec::new();

    for value in 1..=20 {
        let item = pool.alloc().expect("system allocator has memory");
        let node = item.ptr().cast::<Node>();

        // SAFETY: The item is sized and aligned for a Node and belongs to us until recycled.
        unsafe { node.write(Node { value, next: head }) };

        head = Some(node);
        items.push(item);
    }

    let mut sum = 0;
    let mut cursor = head;
    while let Some(node) = cursor {
        // SAFETY: Every node in the list was initialized above and is still allocated.
        let node = unsafe { node.read() };
        sum += node.value;
        cursor = node.next;
    }

    println!("pool list sum: {sum} across {} page(s)", pool.page_count());
    assert_eq!(sum, 210);

    for item in items {
        // SAFETY: Every item came from this pool and is recycled exactly once.
        unsafe { pool.recycle(item) };
    }

    // Debug allocator: report what was not freed.
    let debug = DebugAllocator::builder()
        .sink(TracingSink::default())
        .violation_policy(ViolationPolicy::ReturnError)
        .build();

    let kept = debug.malloc(48).unwrap().expect("system allocator has memory");
    let released = debug.calloc(4, 16).unwrap().expect("system allocator has memory");
    debug.free(released).unwrap();

    let report = debug.leak_report();
    println!(
        "debug allocator: {} live allocation(s), {} byte(s)",
        report.count(),
        report.total_bytes()
    );

    debug.free(kept).unwrap();
    assert_eq!(debug.print_leaks(), 0);

    println!("README example completed successfully!");
}
