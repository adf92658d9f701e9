//! Integration tests for `Arena`, exercising it through the public API with both the system
//! allocator and a custom backing allocator.
#![cfg(feature = "arena")]
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr::NonNull;
use std::slice;

use memkit::{Arena, BackingAllocator, DEFAULT_BLOCK_SIZE, MAX_ALIGN};

/// Counts calls and can be told to refuse every request.
#[derive(Debug, Default)]
struct CountingBacking {
    allocations: Cell<usize>,
    releases: Cell<usize>,
    refuse: Cell<bool>,
}

unsafe impl BackingAllocator for CountingBacking {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.refuse.get() {
            return None;
        }

        self.allocations.set(self.allocations.get() + 1);
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if self.refuse.get() {
            return None;
        }

        NonNull::new(unsafe { System.realloc(ptr.as_ptr(), layout, new_size) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.releases.set(self.releases.get() + 1);
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

fn fill(ptr: NonNull<u8>, len: usize, value: u8) {
    unsafe { ptr.write_bytes(value, len) };
}

fn all_equal(ptr: NonNull<u8>, len: usize, value: u8) -> bool {
    unsafe { slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == value)
}

#[test]
fn allocations_do_not_clobber_each_other() {
    let mut arena = Arena::new();
    let mut live = Vec::new();

    for (i, size) in [1_usize, 17, 300, 4000, 5, 12_000, 64, 9].into_iter().enumerate() {
        let value = u8::try_from(i + 1).unwrap();
        let ptr = arena.alloc(size).unwrap();

        assert_eq!(ptr.as_ptr().addr() % MAX_ALIGN, 0);
        fill(ptr, size, value);
        live.push((ptr, size, value));
    }

    for (ptr, size, value) in live {
        assert!(all_equal(ptr, size, value));
    }
}

#[test]
fn reset_reuses_blocks_without_new_backing_requests() {
    let mut arena = Arena::with_backing(CountingBacking::default());

    _ = arena.alloc(3000).unwrap();
    _ = arena.alloc(3000).unwrap();
    assert_eq!(arena.block_count(), 2);
    assert_eq!(arena.backing().allocations.get(), 2);

    for _ in 0..10 {
        arena.reset();
        _ = arena.alloc(3000).unwrap();
        _ = arena.alloc(3000).unwrap();
    }

    assert_eq!(arena.block_count(), 2);
    assert_eq!(arena.backing().allocations.get(), 2);
    assert_eq!(arena.total_allocated(), 6000);
}

#[test]
fn free_then_alloc_starts_over_with_default_block() {
    let mut arena = Arena::with_backing(CountingBacking::default());

    _ = arena.alloc(100_000).unwrap();
    _ = arena.alloc(100_000).unwrap();
    arena.free();

    assert_eq!(arena.block_count(), 0);
    assert_eq!(arena.backing().releases.get(), 2);

    _ = arena.alloc(1).unwrap();
    assert_eq!(arena.capacity(), DEFAULT_BLOCK_SIZE);
}

#[test]
fn refused_growth_leaves_state_unchanged() {
    let mut arena = Arena::with_backing(CountingBacking::default());

    let kept = arena.alloc(4000).unwrap();
    fill(kept, 4000, 7);

    let blocks = arena.block_count();
    let capacity = arena.capacity();
    let total = arena.total_allocated();

    arena.backing().refuse.set(true);
    assert!(arena.alloc(1000).is_none());
    assert!(arena.alloc_zero(1000).is_none());
    assert!(unsafe { arena.realloc(Some(kept), 4000, 9000) }.is_none());

    assert_eq!(arena.block_count(), blocks);
    assert_eq!(arena.capacity(), capacity);
    assert_eq!(arena.total_allocated(), total);
    assert!(all_equal(kept, 4000, 7));
}

#[test]
fn realloc_grows_most_recent_allocation_in_place() {
    let mut arena = Arena::new();

    let ptr = arena.alloc(10).unwrap();
    fill(ptr, 10, 3);

    let mut current = ptr;
    for size in [20, 40, 80, 160] {
        current = unsafe { arena.realloc(Some(current), size / 2, size) }.unwrap();
        assert_eq!(current, ptr);
    }

    assert!(all_equal(ptr, 10, 3));
}

#[test]
fn scoped_frames_nest() {
    let mut arena = Arena::new();
    _ = arena.alloc(64).unwrap();

    arena.scoped(|outer| {
        _ = outer.alloc(128).unwrap();
        assert_eq!(outer.total_allocated(), 192);

        outer.scoped(|inner| {
            _ = inner.alloc(256).unwrap();
        });

        // The inner frame resets the whole arena, not just its own allocations.
        assert_eq!(outer.total_allocated(), 0);
    });

    assert_eq!(arena.total_allocated(), 0);
}

#[test]
fn arena_can_move_between_threads() {
    let mut arena = Arena::new();
    _ = arena.alloc(32).unwrap();

    let arena = std::thread::spawn(move || {
        let mut arena = arena;
        _ = arena.alloc(32).unwrap();
        arena
    })
    .join()
    .unwrap();

    assert_eq!(arena.total_allocated(), 64);
}
