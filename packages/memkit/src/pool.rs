use std::alloc::Layout;
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;

use crate::{BackingAllocator, PoolBuilder, SystemBacking};

mod table;

use table::Table;

/// Number of entries the page table reserves when the first page is created. The table doubles
/// whenever it runs out of room after that.
const INITIAL_PAGE_TABLE_CAPACITY: usize = 8;

/// A fixed-size item allocator with O(1) allocation and recycling.
///
/// Items are slots of [`item_size()`](Self::item_size) bytes carved out of pages, each page
/// holding [`count_per_block()`](Self::count_per_block) slots in one backing allocation. Free
/// slots are chained through a side table of indexes rather than through the slot memory, so the
/// full item is available to the caller and the pool never reads or writes item contents.
///
/// Pages are obtained one at a time when the free list runs dry and are only returned to the
/// backing allocator when the whole pool is torn down via [`free()`](Self::free) or by dropping
/// the pool. The page table and the free list side table live in memory from the same backing
/// allocator and grow geometrically.
///
/// # Examples
///
/// ```rust
/// use memkit::Pool;
///
/// let mut pool = Pool::new(48, 128);
///
/// let a = pool.alloc().unwrap();
/// let b = pool.alloc().unwrap();
/// assert_ne!(a.ptr(), b.ptr());
/// assert_eq!(pool.page_count(), 1);
///
/// // SAFETY: Both items came from this pool and each is recycled exactly once.
/// unsafe {
///     pool.recycle(a);
///     pool.recycle(b);
/// }
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) if its backing allocator is, but it is not thread-safe
/// ([`Sync`]). Concurrent use requires external synchronization.
pub struct Pool<B: BackingAllocator = SystemBacking> {
    /// Slot stride in bytes. A multiple of both the pointer width and the item alignment.
    item_size: NonZero<usize>,

    count_per_block: NonZero<usize>,

    /// Layout of every page, covering `count_per_block` slots.
    page_layout: Layout,

    /// Index of the first free slot, or `None` if every slot is taken.
    free_head: Option<usize>,

    /// For every slot, the index of the free slot after it. Only meaningful for free slots.
    next_free: Table<Option<usize>>,

    /// Base pointer of every page, in creation order. Slot `i` lives in page
    /// `i / count_per_block`.
    blocks: Table<NonNull<u8>>,

    backing: B,
}

/// A slot handed out by [`Pool::alloc()`].
///
/// The handle is a plain value: copying it does not duplicate the slot and dropping it does not
/// recycle the slot. Pass it to [`Pool::recycle()`] to give the slot back.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PoolItem {
    index: usize,
    ptr: NonNull<u8>,
}

impl PoolItem {
    /// Pointer to the first byte of the slot.
    ///
    /// The slot is [`Pool::item_size()`] bytes long and is aligned to at least the pointer width.
    /// Its contents are uninitialized when the item is handed out.
    #[must_use]
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Position of the slot within its pool, counting across pages.
    #[must_use]
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Pool<SystemBacking> {
    /// Creates a pool of `item_size`-byte items backed by the system allocator.
    ///
    /// `item_size` is rounded up to a multiple of the pointer width, with a minimum of one
    /// pointer width. `items_per_block` slots are allocated at a time, or
    /// [`DEFAULT_ITEMS_PER_BLOCK`][crate::DEFAULT_ITEMS_PER_BLOCK] if zero is given.
    ///
    /// No memory is obtained until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if a page of the resulting size cannot be described by a [`Layout`].
    #[must_use]
    pub fn new(item_size: usize, items_per_block: usize) -> Self {
        Self::builder()
            .item_size(item_size)
            .items_per_block(items_per_block)
            .build()
    }

    /// Creates a builder for configuring and constructing a [`Pool`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use memkit::Pool;
    ///
    /// let pool = Pool::builder().layout_of::<u128>().items_per_block(16).build();
    ///
    /// assert_eq!(pool.item_size(), 16);
    /// assert_eq!(pool.count_per_block(), 16);
    /// ```
    #[inline]
    pub fn builder() -> PoolBuilder<SystemBacking> {
        PoolBuilder::new()
    }
}

impl<B: BackingAllocator> Pool<B> {
    /// `slot_layout` must already be padded to a multiple of its alignment and of the pointer
    /// width.
    ///
    /// # Panics
    ///
    /// Panics if the page size overflows.
    #[must_use]
    pub(crate) fn new_inner(slot_layout: Layout, count_per_block: NonZero<usize>, backing: B) -> Self {
        let item_size = NonZero::new(slot_layout.size())
            .expect("slot layout is never zero-sized because it is at least one pointer wide");

        let page_size = item_size
            .get()
            .checked_mul(count_per_block.get())
            .expect("pool page size cannot overflow for reasonable item sizes and counts");

        let page_layout = Layout::from_size_align(page_size, slot_layout.align())
            .expect("pool page layout cannot fail for reasonable item sizes and counts");

        Self {
            item_size,
            count_per_block,
            page_layout,
            free_head: None,
            next_free: Table::new(0),
            blocks: Table::new(INITIAL_PAGE_TABLE_CAPACITY),
            backing,
        }
    }

    /// Takes a slot from the free list, creating a new page first if the free list is empty.
    ///
    /// Returns `None` if a page is needed and the backing allocator is exhausted. The pool is
    /// unchanged in that case.
    #[must_use]
    pub fn alloc(&mut self) -> Option<PoolItem> {
        if self.free_head.is_none() {
            self.grow()?;
        }

        let index = self.free_head?;

        self.free_head = self
            .next_free
            .get(index)
            .expect("free list only links slots that have a side table entry");

        Some(PoolItem {
            index,
            ptr: self.slot_ptr(index),
        })
    }

    /// Returns a slot to the free list. The slot is handed out again by the next
    /// [`alloc()`](Self::alloc).
    ///
    /// No validation is performed: the pool does not check that the item came from it or that
    /// the item is not already free.
    ///
    /// # Safety
    ///
    /// * `item` must have been returned by [`alloc()`](Self::alloc) on this pool since the pool
    ///   was created or last torn down.
    /// * `item` must not have been recycled since it was returned.
    ///
    /// The memory of the slot must not be accessed after it is recycled.
    pub unsafe fn recycle(&mut self, item: PoolItem) {
        debug_assert!(
            item.index < self.next_free.len(),
            "recycled item {} does not belong to a pool with {} slots",
            item.index,
            self.next_free.len()
        );
        debug_assert_eq!(item.ptr, self.slot_ptr(item.index));

        if self.next_free.set(item.index, self.free_head) {
            self.free_head = Some(item.index);
        }
    }

    /// Returns every page to the backing allocator, invalidating every item.
    ///
    /// The pool is left in the same state as a newly created one and can be used again.
    /// Dropping the pool has the same effect.
    pub fn free(&mut self) {
        for page in self.blocks.iter() {
            // SAFETY: Every page was allocated by our backing allocator with page_layout and
            // is released exactly once because the table is emptied right below.
            unsafe {
                self.backing.release(page, self.page_layout);
            }
        }

        // The tables start over empty, so the next page gets the initial table capacity.
        self.blocks.release(&self.backing);
        self.next_free.release(&self.backing);
        self.free_head = None;
    }

    /// Size of every item in bytes, after rounding.
    #[must_use]
    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size.get()
    }

    /// Number of items in every page.
    #[must_use]
    #[inline]
    pub fn count_per_block(&self) -> usize {
        self.count_per_block.get()
    }

    /// Number of pages currently owned by the pool.
    #[must_use]
    #[inline]
    pub fn page_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of items the current pages can hold, whether allocated or free.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.next_free.len()
    }

    /// The backing allocator this pool obtains its pages from.
    #[must_use]
    #[inline]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Adds one page and links all of its slots, in address order, in front of the free list.
    ///
    /// Both tables are grown before the page is requested. A table that grew but is not filled
    /// is simply spare capacity, so there is nothing to undo on any failure path.
    fn grow(&mut self) -> Option<()> {
        let count = self.count_per_block.get();

        let base = self.next_free.len();
        let end = base.checked_add(count)?;

        self.blocks.reserve(1, &self.backing)?;
        self.next_free.reserve(count, &self.backing)?;

        // SAFETY: The page layout covers at least one slot, which is at least one pointer wide.
        let page = unsafe { self.backing.allocate(self.page_layout) }?;

        self.blocks.push(page);

        // Cannot overflow because base + count was checked above.
        let last = end.wrapping_sub(1);
        let previous_head = self.free_head;

        for index in base..end {
            let next = if index == last {
                previous_head
            } else {
                // Cannot overflow because index < last.
                Some(index.wrapping_add(1))
            };

            self.next_free.push(next);
        }

        self.free_head = Some(base);

        Some(())
    }

    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        let page = index / self.count_per_block;
        let slot = index % self.count_per_block;

        let base = self
            .blocks
            .get(page)
            .expect("slot index always refers to an existing page");

        // Cannot overflow because the product is less than the page size.
        let offset = slot.wrapping_mul(self.item_size.get());

        // SAFETY: slot < count_per_block, so the offset stays inside the page allocation.
        unsafe { base.add(offset) }
    }
}

impl<B: BackingAllocator> Drop for Pool<B> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<B: BackingAllocator> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("item_size", &self.item_size)
            .field("count_per_block", &self.count_per_block)
            .field("page_count", &self.blocks.len())
            .field("free_head", &self.free_head)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

// SAFETY: The pool exclusively owns its pages and keeps no thread-local state, so moving it to
// another thread is sound as long as the backing allocator can move along with it.
unsafe impl<B: BackingAllocator + Send> Send for Pool<B> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::collections::HashSet;
    use std::mem;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::DEFAULT_ITEMS_PER_BLOCK;
    use crate::backing::LimitedBacking;

    assert_impl_all!(Pool: Send, fmt::Debug);
    assert_not_impl_any!(Pool: Sync);
    assert_impl_all!(PoolItem: Copy, Eq, std::hash::Hash);

    const WORD: usize = mem::size_of::<usize>();

    fn limited_pool(item_size: usize, items_per_block: usize) -> Pool<LimitedBacking> {
        Pool::builder()
            .item_size(item_size)
            .items_per_block(items_per_block)
            .backing(LimitedBacking::default())
            .build()
    }

    #[test]
    fn item_size_is_rounded_to_pointer_width() {
        assert_eq!(Pool::new(0, 4).item_size(), WORD);
        assert_eq!(Pool::new(1, 4).item_size(), WORD);
        assert_eq!(Pool::new(WORD, 4).item_size(), WORD);
        assert_eq!(Pool::new(WORD + 1, 4).item_size(), WORD * 2);
        assert_eq!(Pool::new(100, 4).item_size() % WORD, 0);
    }

    #[test]
    fn zero_items_per_block_uses_default() {
        let pool = Pool::new(16, 0);
        assert_eq!(pool.count_per_block(), DEFAULT_ITEMS_PER_BLOCK);
    }

    #[test]
    fn new_pool_owns_nothing() {
        let pool = limited_pool(32, 8);

        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.backing().outstanding(), 0);
    }

    #[test]
    fn recycled_item_is_reused_first() {
        let mut pool = Pool::new(24, 8);

        let first = pool.alloc().unwrap();
        let second = pool.alloc().unwrap();

        unsafe { pool.recycle(first) };

        let third = pool.alloc().unwrap();
        assert_eq!(third, first);
        assert_ne!(third, second);
    }

    #[test]
    fn recycling_order_is_lifo() {
        let mut pool = Pool::new(8, 8);

        let items: Vec<PoolItem> = (0..5).map(|_| pool.alloc().unwrap()).collect();

        for item in &items {
            unsafe { pool.recycle(*item) };
        }

        for expected in items.iter().rev() {
            assert_eq!(pool.alloc().unwrap(), *expected);
        }
    }

    #[test]
    fn fresh_page_is_handed_out_in_address_order() {
        let mut pool = Pool::new(40, 6);

        let addresses: Vec<usize> = (0..6)
            .map(|_| pool.alloc().unwrap().ptr().as_ptr().addr())
            .collect();

        for pair in addresses.windows(2) {
            assert_eq!(pair[1] - pair[0], pool.item_size());
        }
    }

    #[test]
    fn pages_are_created_one_at_a_time() {
        let mut pool = Pool::new(16, 10);

        for pages in 1..=4 {
            for _ in 0..10 {
                _ = pool.alloc().unwrap();
            }

            assert_eq!(pool.page_count(), pages);
            assert_eq!(pool.capacity(), pages * 10);
        }

        _ = pool.alloc().unwrap();
        assert_eq!(pool.page_count(), 5);
    }

    #[test]
    fn items_are_distinct_and_aligned() {
        let mut pool = Pool::new(20, 7);
        let mut seen = HashSet::new();

        for _ in 0..50 {
            let item = pool.alloc().unwrap();
            let address = item.ptr().as_ptr().addr();

            assert_eq!(address % WORD, 0);
            assert!(seen.insert(address));

            // The whole item belongs to the caller.
            unsafe {
                item.ptr().write_bytes(0xEE, pool.item_size());
            }
        }

        // Overwriting items did not disturb the free list.
        let items: Vec<PoolItem> = (0..20).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(items.len(), 20);
    }

    #[test]
    fn layout_alignment_is_honored() {
        #[repr(align(64))]
        #[allow(dead_code, reason = "only the layout matters")]
        struct CacheLine([u8; 64]);

        let mut pool = Pool::builder().layout_of::<CacheLine>().items_per_block(3).build();

        assert_eq!(pool.item_size(), 64);

        for _ in 0..10 {
            let item = pool.alloc().unwrap();
            assert_eq!(item.ptr().as_ptr().addr() % 64, 0);
        }
    }

    #[test]
    fn page_table_grows_geometrically() {
        let mut pool = Pool::new(8, 1);

        _ = pool.alloc().unwrap();
        assert_eq!(pool.blocks.capacity(), INITIAL_PAGE_TABLE_CAPACITY);

        for _ in 1..INITIAL_PAGE_TABLE_CAPACITY {
            _ = pool.alloc().unwrap();
        }
        assert_eq!(pool.blocks.capacity(), INITIAL_PAGE_TABLE_CAPACITY);

        _ = pool.alloc().unwrap();
        assert_eq!(pool.blocks.capacity(), INITIAL_PAGE_TABLE_CAPACITY * 2);
    }

    #[test]
    fn side_table_grows_geometrically() {
        let mut pool = Pool::new(8, 1);

        for allocated in 1..=100_usize {
            _ = pool.alloc().unwrap();

            assert_eq!(pool.capacity(), allocated);
            assert_eq!(pool.next_free.capacity(), allocated.next_power_of_two());
        }
    }

    #[test]
    fn side_table_reserves_whole_pages() {
        let mut pool = Pool::new(8, 3);

        _ = pool.alloc().unwrap();
        assert_eq!(pool.next_free.capacity(), 3);

        for _ in 0..3 {
            _ = pool.alloc().unwrap();
        }
        assert_eq!(pool.next_free.capacity(), 6);

        for _ in 0..3 {
            _ = pool.alloc().unwrap();
        }
        assert_eq!(pool.next_free.capacity(), 12);
    }

    #[test]
    fn exhausted_backing_returns_none_without_leaking() {
        let mut pool = limited_pool(16, 4);
        pool.backing().fail_after(0);

        assert!(pool.alloc().is_none());
        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.backing().outstanding(), 0);
    }

    #[test]
    fn exhaustion_after_first_page_keeps_pool_usable() {
        let mut pool = limited_pool(16, 4);
        // The page table, the side table and the first page.
        pool.backing().fail_after(3);

        let items: Vec<PoolItem> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.page_count(), 1);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.backing().outstanding(), 3);

        unsafe { pool.recycle(items[2]) };
        assert_eq!(pool.alloc(), Some(items[2]));
    }

    #[test]
    fn page_table_growth_failure_aborts_page_allocation() {
        let mut pool = limited_pool(8, 1);

        for _ in 0..INITIAL_PAGE_TABLE_CAPACITY {
            _ = pool.alloc().unwrap();
        }
        let outstanding = pool.backing().outstanding();

        pool.backing().fail_after(0);
        assert!(pool.alloc().is_none());
        assert_eq!(pool.page_count(), INITIAL_PAGE_TABLE_CAPACITY);
        assert_eq!(pool.capacity(), INITIAL_PAGE_TABLE_CAPACITY);
        assert_eq!(pool.backing().outstanding(), outstanding);

        pool.backing().unlimited();
        _ = pool.alloc().unwrap();
        assert_eq!(pool.page_count(), INITIAL_PAGE_TABLE_CAPACITY + 1);
        assert_eq!(pool.backing().outstanding(), outstanding + 1);
    }

    #[test]
    fn side_table_failure_aborts_page_allocation() {
        let backing = LimitedBacking::default();

        {
            let mut pool = Pool::builder()
                .item_size(16)
                .items_per_block(4)
                .backing(&backing)
                .build();

            // Only the page table gets memory.
            backing.fail_after(1);
            assert!(pool.alloc().is_none());
            assert_eq!(pool.page_count(), 0);
            assert_eq!(pool.capacity(), 0);
            assert_eq!(backing.outstanding(), 1);

            backing.unlimited();
            let item = pool.alloc().unwrap();
            assert_eq!(item.index(), 0);
            assert_eq!(backing.outstanding(), 3);
        }

        assert_eq!(backing.outstanding(), 0);
    }

    #[test]
    fn free_releases_pages_and_resets_state() {
        let mut pool = limited_pool(16, 4);

        for _ in 0..9 {
            _ = pool.alloc().unwrap();
        }

        // Three pages plus the page table and the side table.
        assert_eq!(pool.backing().outstanding(), 5);

        pool.free();

        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.backing().outstanding(), 0);

        let item = pool.alloc().unwrap();
        assert_eq!(item.index(), 0);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn drop_releases_pages() {
        let backing = LimitedBacking::default();

        {
            let mut pool = Pool::builder()
                .item_size(8)
                .items_per_block(2)
                .backing(&backing)
                .build();

            for _ in 0..5 {
                _ = pool.alloc().unwrap();
            }
            assert_eq!(backing.outstanding(), 5);
        }

        assert_eq!(backing.outstanding(), 0);
    }
}
