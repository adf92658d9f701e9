//! Integration tests for `Pool`, exercising it through the public API.
#![cfg(feature = "pool")]
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::collections::HashSet;
use std::ptr::NonNull;

use memkit::{BackingAllocator, Pool, PoolItem};

/// Grants a fixed number of allocations or resizes, then refuses.
#[derive(Debug)]
struct Budget {
    remaining: Cell<usize>,
    outstanding: Cell<usize>,
}

impl Budget {
    fn new(requests: usize) -> Self {
        Self {
            remaining: Cell::new(requests),
            outstanding: Cell::new(0),
        }
    }
}

unsafe impl BackingAllocator for Budget {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let remaining = self.remaining.get().checked_sub(1)?;
        self.remaining.set(remaining);
        self.outstanding.set(self.outstanding.get() + 1);

        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let remaining = self.remaining.get().checked_sub(1)?;
        self.remaining.set(remaining);

        NonNull::new(unsafe { System.realloc(ptr.as_ptr(), layout, new_size) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.outstanding.set(self.outstanding.get() - 1);
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

#[test]
fn alloc_recycle_alloc_returns_same_address() {
    let mut pool = Pool::new(48, 16);

    let item = pool.alloc().unwrap();
    let address = item.ptr();

    unsafe { pool.recycle(item) };

    assert_eq!(pool.alloc().unwrap().ptr(), address);
}

#[test]
fn k_pages_for_k_times_count_allocations() {
    for k in 1..=5 {
        let mut pool = Pool::new(8, 12);

        for _ in 0..k * pool.count_per_block() {
            _ = pool.alloc().unwrap();
        }

        assert_eq!(pool.page_count(), k);
    }
}

#[test]
fn items_hold_independent_values() {
    let mut pool = Pool::builder().layout_of::<[u64; 3]>().items_per_block(4).build();

    let items: Vec<PoolItem> = (0..10).map(|_| pool.alloc().unwrap()).collect();

    for (i, item) in items.iter().enumerate() {
        let value = u64::try_from(i).unwrap();
        unsafe { item.ptr().cast::<[u64; 3]>().write([value, value * 2, value * 3]) };
    }

    for (i, item) in items.iter().enumerate() {
        let value = u64::try_from(i).unwrap();
        let stored = unsafe { item.ptr().cast::<[u64; 3]>().read() };
        assert_eq!(stored, [value, value * 2, value * 3]);
    }
}

#[test]
fn churn_never_hands_out_a_live_item() {
    let mut pool = Pool::new(16, 8);
    let mut live: Vec<PoolItem> = Vec::new();
    let mut addresses = HashSet::new();

    for round in 0..200_usize {
        if round % 3 == 2 {
            if let Some(item) = live.pop() {
                assert!(addresses.remove(&item.ptr().as_ptr().addr()));
                unsafe { pool.recycle(item) };
            }
        } else {
            let item = pool.alloc().unwrap();
            assert!(addresses.insert(item.ptr().as_ptr().addr()));
            live.push(item);
        }
    }

    assert_eq!(pool.capacity(), pool.page_count() * pool.count_per_block());
    assert!(live.len() <= pool.capacity());
}

#[test]
fn exhaustion_returns_none_and_recovers_after_recycle() {
    let mut pool = Pool::builder()
        .item_size(32)
        .items_per_block(2)
        // The page table, the side table and one page.
        .backing(Budget::new(3))
        .build();

    let a = pool.alloc().unwrap();
    let _b = pool.alloc().unwrap();

    assert!(pool.alloc().is_none());
    assert_eq!(pool.page_count(), 1);
    assert_eq!(pool.backing().outstanding.get(), 3);

    unsafe { pool.recycle(a) };
    assert_eq!(pool.alloc(), Some(a));
}

#[test]
fn drop_returns_every_page() {
    let budget = Budget::new(usize::MAX);

    {
        let mut pool = Pool::builder()
            .item_size(1)
            .items_per_block(3)
            .backing(&budget)
            .build();

        for _ in 0..10 {
            _ = pool.alloc().unwrap();
        }

        assert_eq!(pool.page_count(), 4);
    }

    assert_eq!(budget.outstanding.get(), 0);
}
