use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::{fmt, iter, mem};

use crate::{ArenaBuilder, BackingAllocator, MAX_ALIGN, SystemBacking};

/// Header at the start of every block. The data area follows at [`DATA_OFFSET`].
#[derive(Debug)]
struct BlockHeader {
    /// The block after this one in the chain. Blocks after the current head are empty and are
    /// only there to be reused after a reset.
    next: Option<NonNull<BlockHeader>>,

    /// Size of the data area in bytes.
    capacity: usize,

    /// Bytes of the data area consumed so far, including alignment padding.
    used: usize,
}

/// Distance from the start of a block allocation to its data area. Keeping the data area aligned
/// to `MAX_ALIGN` means the first allocation in a block never needs padding for common alignments.
const DATA_OFFSET: usize = mem::size_of::<BlockHeader>().next_multiple_of(MAX_ALIGN);

const _: () = assert!(MAX_ALIGN >= mem::align_of::<BlockHeader>());

/// Layout of the backing allocation for a block with `capacity` bytes of data.
///
/// Returns `None` if the size calculation overflows.
fn block_layout(capacity: usize) -> Option<Layout> {
    Layout::from_size_align(DATA_OFFSET.checked_add(capacity)?, MAX_ALIGN).ok()
}

/// Pointer to the first byte of the data area of `block`.
///
/// # Safety
///
/// `block` must point to a live block allocated with [`block_layout()`].
unsafe fn data_ptr(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: The allocation extends DATA_OFFSET + capacity bytes past the header pointer.
    unsafe { block.cast::<u8>().add(DATA_OFFSET) }
}

/// Carves `size` bytes aligned to `align` out of the unused tail of `block`.
///
/// Returns `None` without modifying the block if the request does not fit.
///
/// # Safety
///
/// `block` must point to a live block allocated with [`block_layout()`], with no other
/// references to its header in existence.
unsafe fn bump(mut block: NonNull<BlockHeader>, size: usize, align: usize) -> Option<NonNull<u8>> {
    // SAFETY: Forwarding the liveness and exclusivity requirements to the caller.
    let header = unsafe { block.as_mut() };

    // SAFETY: used <= capacity, so the cursor is at most one past the end of the data area.
    let cursor = unsafe { data_ptr(block).add(header.used) };
    let padding = cursor.align_offset(align);

    let needed = size.checked_add(padding)?;

    // Cannot underflow because used <= capacity is an invariant of every block.
    if needed > header.capacity.wrapping_sub(header.used) {
        return None;
    }

    // Cannot overflow because the sum is bounded by the capacity checked above.
    header.used = header.used.wrapping_add(needed);

    // SAFETY: The padded start plus size fits in the data area, as checked above.
    Some(unsafe { cursor.add(padding) })
}

/// A bump-pointer region allocator over a chain of growing memory blocks.
///
/// Allocation advances a cursor through the current block. When the current block is exhausted,
/// the arena moves on to the next block in the chain (left over from an earlier
/// [`reset()`](Self::reset)) or obtains a new block of twice the size from its backing allocator.
/// Individual allocations are never reclaimed. Memory is returned in bulk, either to the arena
/// itself via [`reset()`](Self::reset) or to the backing allocator via [`free()`](Self::free) or by
/// dropping the arena.
///
/// Every allocating method returns `None` when the backing allocator is exhausted, leaving the
/// arena exactly as it was before the call.
///
/// # Examples
///
/// ```rust
/// use memkit::Arena;
///
/// let mut arena = Arena::new();
///
/// let header = arena.alloc_align(24, 8).unwrap();
/// let body = arena.alloc_zero(1000).unwrap();
///
/// assert_eq!(header.as_ptr().align_offset(8), 0);
/// // SAFETY: alloc_zero() returned 1000 initialized bytes.
/// assert_eq!(unsafe { body.as_ptr().read() }, 0);
///
/// // Everything allocated so far is now invalid, the blocks are kept for reuse.
/// arena.reset();
/// assert_eq!(arena.total_allocated(), 0);
/// ```
///
/// # Thread safety
///
/// The arena is thread-mobile ([`Send`]) if its backing allocator is, but it is not thread-safe
/// ([`Sync`]). Concurrent use requires external synchronization.
pub struct Arena<B: BackingAllocator = SystemBacking> {
    /// Start of the block chain, used for reset and teardown.
    first: Option<NonNull<BlockHeader>>,

    /// The block allocations are currently carved from. Always reachable from `first`.
    head: Option<NonNull<BlockHeader>>,

    /// Sum of requested sizes since the last reset, excluding padding. Diagnostic only.
    total_alloc: usize,

    /// Capacity of the first block obtained from the backing allocator.
    default_block_size: NonZero<usize>,

    backing: B,
}

impl Arena<SystemBacking> {
    /// Creates an empty arena backed by the system allocator.
    ///
    /// No memory is obtained until the first allocation.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring and constructing an [`Arena`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use memkit::{Arena, GlobalBacking};
    ///
    /// let arena = Arena::builder()
    ///     .backing(GlobalBacking::system())
    ///     .default_block_size(NonZero::new(64 * 1024).unwrap())
    ///     .build();
    ///
    /// assert_eq!(arena.block_count(), 0);
    /// ```
    #[inline]
    pub fn builder() -> ArenaBuilder<SystemBacking> {
        ArenaBuilder::new()
    }
}

impl Default for Arena<SystemBacking> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BackingAllocator> Arena<B> {
    /// Creates an empty arena that obtains its blocks from `backing`.
    #[must_use]
    pub fn with_backing(backing: B) -> Self {
        Self::new_inner(backing, crate::arena_builder::default_block_size())
    }

    #[must_use]
    pub(crate) fn new_inner(backing: B, default_block_size: NonZero<usize>) -> Self {
        Self {
            first: None,
            head: None,
            total_alloc: 0,
            default_block_size,
            backing,
        }
    }

    /// Allocates `size` bytes aligned to [`MAX_ALIGN`].
    ///
    /// Returns `None` if `size` is zero or if the backing allocator is exhausted.
    #[must_use]
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_align(size, MAX_ALIGN)
    }

    /// Allocates `size` bytes aligned to [`MAX_ALIGN`] and fills them with zeroes.
    ///
    /// Returns `None` if `size` is zero or if the backing allocator is exhausted.
    #[must_use]
    pub fn alloc_zero(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc_align(size, MAX_ALIGN)?;

        // SAFETY: We just carved `size` bytes starting at `ptr` out of a block we own.
        unsafe {
            ptr.write_bytes(0, size);
        }

        Some(ptr)
    }

    /// Allocates memory that fits `layout`.
    ///
    /// Returns `None` if the layout is zero-sized or if the backing allocator is exhausted.
    #[must_use]
    #[inline]
    pub fn alloc_layout(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.alloc_align(layout.size(), layout.align())
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// The request is served from the first of these that can satisfy it:
    ///
    /// 1. The unused tail of the current block.
    /// 2. The next block in the chain, if one is retained from before a [`reset()`](Self::reset).
    /// 3. A new block of twice the current block's capacity (or the default block size for the
    ///    first block), enlarged if the request itself needs more. The new block is inserted right
    ///    after the current block, keeping any retained blocks for later reuse.
    ///
    /// Returns `None` if `size` is zero or if the backing allocator is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    pub fn alloc_align(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(
            align.is_power_of_two(),
            "arena alignment must be a power of two, got {align}"
        );

        if size == 0 {
            return None;
        }

        let ptr = self
            .bump_head(size, align)
            .or_else(|| self.advance_to_next(size, align))
            .or_else(|| self.grow(size, align))?;

        self.total_alloc = self.total_alloc.saturating_add(size);

        Some(ptr)
    }

    /// Resizes an allocation previously obtained from this arena.
    ///
    /// * If `old_ptr` is `None`, this is equivalent to [`alloc(new_size)`](Self::alloc).
    /// * If `new_size` is zero, returns `None` and leaves the old allocation as it is.
    /// * If `new_size <= old_size`, returns `old_ptr` unchanged.
    /// * If the old allocation is the most recent one in the current block and the block has room,
    ///   it is extended in place and `old_ptr` is returned.
    /// * Otherwise new space is allocated and the first `old_size` bytes are copied into it. The
    ///   old space is not reclaimed until the arena is reset or freed.
    ///
    /// Returns `None` if new space is needed and the backing allocator is exhausted. The old
    /// allocation remains valid in that case.
    ///
    /// # Safety
    ///
    /// If `old_ptr` is `Some`, it must have been returned by this arena since the last reset
    /// and `old_size` bytes starting at it must still belong to that allocation.
    #[must_use]
    pub unsafe fn realloc(
        &mut self,
        old_ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(old_ptr) = old_ptr else {
            return self.alloc(new_size);
        };

        if new_size == 0 {
            return None;
        }

        if new_size <= old_size {
            return Some(old_ptr);
        }

        // Cannot underflow because we returned above if new_size <= old_size.
        let extra = new_size.wrapping_sub(old_size);

        if let Some(mut head) = self.head {
            // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
            let header = unsafe { head.as_mut() };

            // SAFETY: used <= capacity, so this is at most one past the end of the data area.
            let write_position = unsafe { data_ptr(head).add(header.used) };

            let is_tail_allocation = old_ptr.as_ptr().wrapping_add(old_size) == write_position.as_ptr();

            // Cannot underflow because used <= capacity.
            if is_tail_allocation && extra <= header.capacity.wrapping_sub(header.used) {
                // Cannot overflow because the sum is bounded by the capacity checked above.
                header.used = header.used.wrapping_add(extra);
                self.total_alloc = self.total_alloc.saturating_add(extra);
                return Some(old_ptr);
            }
        }

        let new_ptr = self.alloc(new_size)?;

        // SAFETY: The caller guarantees old_size readable bytes at old_ptr. The new allocation is
        // fresh space of at least new_size > old_size bytes, so the two cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        }

        Some(new_ptr)
    }

    /// Invalidates every allocation while keeping all blocks for reuse.
    ///
    /// After a reset, new allocations are carved from the retained blocks in chain order before
    /// any new block is obtained from the backing allocator.
    pub fn reset(&mut self) {
        let mut cursor = self.first;

        while let Some(mut block) = cursor {
            // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
            let header = unsafe { block.as_mut() };
            header.used = 0;
            cursor = header.next;
        }

        self.head = self.first;
        self.total_alloc = 0;
    }

    /// Returns every block to the backing allocator, invalidating every allocation.
    ///
    /// The arena is left in the same state as a newly created one and can be used again.
    /// Dropping the arena has the same effect.
    pub fn free(&mut self) {
        let mut cursor = self.first.take();
        self.head = None;
        self.total_alloc = 0;

        while let Some(block) = cursor {
            let (next, capacity) = {
                // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
                let header = unsafe { block.as_ref() };
                (header.next, header.capacity)
            };

            let layout = block_layout(capacity)
                .expect("block layout was valid when the block was allocated, so it is still valid");

            // SAFETY: The block was allocated by our backing allocator with this exact layout and
            // nothing refers to it any more because we detached the whole chain above.
            unsafe {
                self.backing.release(block.cast(), layout);
            }

            cursor = next;
        }
    }

    /// Runs `f` with this arena and resets the arena afterwards, even if `f` panics.
    ///
    /// Allocations made inside `f` must not be used after `scoped()` returns.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use memkit::Arena;
    ///
    /// let mut arena = Arena::new();
    ///
    /// let checksum = arena.scoped(|frame| {
    ///     let scratch = frame.alloc_zero(256).unwrap();
    ///     // SAFETY: alloc_zero() returned 256 initialized bytes.
    ///     unsafe { scratch.as_ptr().read() }
    /// });
    ///
    /// assert_eq!(checksum, 0);
    /// assert_eq!(arena.total_allocated(), 0);
    /// ```
    pub fn scoped<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let mut guard = scopeguard::guard(self, |arena| arena.reset());
        f(&mut **guard)
    }

    /// Sum of the sizes requested since the last reset, excluding alignment padding.
    #[must_use]
    #[inline]
    pub fn total_allocated(&self) -> usize {
        self.total_alloc
    }

    /// Number of blocks currently owned by the arena.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    /// Total data capacity of all blocks currently owned by the arena, in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks().map(|header| header.capacity).sum()
    }

    /// The backing allocator this arena obtains its blocks from.
    #[must_use]
    #[inline]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    fn blocks(&self) -> impl Iterator<Item = &BlockHeader> {
        let mut cursor = self.first;

        iter::from_fn(move || {
            let block = cursor?;

            // SAFETY: Every block in the chain is live and owned by us. The returned reference
            // is bound to &self, which prevents mutation while it exists.
            let header = unsafe { block.as_ref() };
            cursor = header.next;
            Some(header)
        })
    }

    fn bump_head(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let head = self.head?;

        // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
        unsafe { bump(head, size, align) }
    }

    fn advance_to_next(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
        let next = unsafe { self.head?.as_ref() }.next?;

        debug_assert_eq!(
            // SAFETY: Every block in the chain is live and owned by us.
            unsafe { next.as_ref() }.used,
            0,
            "blocks after the head must be empty"
        );

        // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
        let ptr = unsafe { bump(next, size, align) }?;
        self.head = Some(next);
        Some(ptr)
    }

    fn grow(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let doubled = match self.head {
            // SAFETY: Every block in the chain is live and owned by us.
            Some(head) => unsafe { head.as_ref() }.capacity.checked_mul(2)?,
            None => self.default_block_size.get(),
        };

        let capacity = doubled.max(size.checked_add(align)?);
        let layout = block_layout(capacity)?;

        // SAFETY: The layout includes the block header, so it is never zero-sized.
        let block = unsafe { self.backing.allocate(layout) }?.cast::<BlockHeader>();

        let next = match self.head {
            // SAFETY: Every block in the chain is live and owned by us.
            Some(head) => unsafe { head.as_ref() }.next,
            None => None,
        };

        // SAFETY: The allocation is fresh, sized and aligned for the header by block_layout().
        unsafe {
            block.write(BlockHeader {
                next,
                capacity,
                used: 0,
            });
        }

        match self.head {
            // SAFETY: Every block in the chain is live and owned by us. We hold &mut self.
            Some(mut head) => unsafe { head.as_mut() }.next = Some(block),
            None => self.first = Some(block),
        }

        self.head = Some(block);

        // SAFETY: The block was just initialized and we hold the only pointer to its header.
        let ptr = unsafe { bump(block, size, align) }
            .expect("a new block is always large enough for the request it was created for");

        Some(ptr)
    }
}

impl<B: BackingAllocator> Drop for Arena<B> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<B: BackingAllocator> fmt::Debug for Arena<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("block_count", &self.block_count())
            .field("capacity", &self.capacity())
            .field("total_alloc", &self.total_alloc)
            .field("default_block_size", &self.default_block_size)
            .field("backing", &self.backing)
            .finish()
    }
}

// SAFETY: The arena exclusively owns every block in its chain and hands out no references tied
// to thread-local state, so moving it to another thread is sound as long as the backing
// allocator can move along with it.
unsafe impl<B: BackingAllocator + Send> Send for Arena<B> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::DEFAULT_BLOCK_SIZE;
    use crate::backing::LimitedBacking;

    assert_impl_all!(Arena: Send, fmt::Debug);
    assert_not_impl_any!(Arena: Sync);

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr().addr()
    }

    #[test]
    fn data_offset_matches_layout_extension() {
        let header = Layout::new::<BlockHeader>().align_to(MAX_ALIGN).unwrap();
        let data = Layout::from_size_align(DEFAULT_BLOCK_SIZE, MAX_ALIGN).unwrap();
        let (_, offset) = header.extend(data).unwrap();

        assert_eq!(offset, DATA_OFFSET);
    }

    #[test]
    fn new_arena_is_empty() {
        let arena = Arena::new();

        assert_eq!(arena.block_count(), 0);
        assert_eq!(arena.capacity(), 0);
        assert_eq!(arena.total_allocated(), 0);
    }

    #[test]
    fn zero_size_yields_nothing() {
        let mut arena = Arena::new();

        assert!(arena.alloc(0).is_none());
        assert!(arena.alloc_align(0, 64).is_none());
        assert!(arena.alloc_zero(0).is_none());
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_alignment_panics() {
        let mut arena = Arena::new();
        _ = arena.alloc_align(8, 12);
    }

    #[test]
    fn first_block_has_default_size() {
        let mut arena = Arena::new();

        _ = arena.alloc(1).unwrap();

        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.capacity(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut arena = Arena::new();
        let mut ranges = Vec::new();

        let requests = [
            (1, 1),
            (3, 2),
            (7, 8),
            (100, 16),
            (5, 64),
            (1000, 4),
            (4000, 128),
            (33, 32),
            (9000, 8),
            (1, 4096),
        ];

        for (size, align) in requests {
            let ptr = arena.alloc_align(size, align).unwrap();
            assert_eq!(addr(ptr) % align, 0, "{size} bytes at align {align}");

            unsafe {
                ptr.write_bytes(0xCD, size);
            }

            ranges.push((addr(ptr), addr(ptr) + size));
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "ranges {pair:?} overlap");
        }

        let requested: usize = requests.iter().map(|(size, _)| size).sum();
        assert_eq!(arena.total_allocated(), requested);
    }

    #[test]
    fn allocations_stay_within_blocks() {
        let mut arena = Arena::new();
        let mut pointers = Vec::new();

        for size in [10, 2000, 3000, 50, 7000, 1] {
            pointers.push((arena.alloc(size).unwrap(), size));
        }

        let blocks: Vec<(usize, usize)> = arena
            .blocks()
            .map(|header| {
                let start = std::ptr::from_ref(header).addr() + DATA_OFFSET;
                (start, start + header.capacity)
            })
            .collect();

        for (ptr, size) in pointers {
            let start = addr(ptr);
            assert!(
                blocks
                    .iter()
                    .any(|&(lo, hi)| start >= lo && start + size <= hi),
                "allocation of {size} bytes at {start:#x} is outside every block"
            );
        }
    }

    #[test]
    fn growth_doubles_block_capacity() {
        let mut arena = Arena::new();

        _ = arena.alloc(DEFAULT_BLOCK_SIZE - MAX_ALIGN).unwrap();
        _ = arena.alloc(MAX_ALIGN * 2).unwrap();

        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.capacity(), DEFAULT_BLOCK_SIZE * 3);
    }

    #[test]
    fn oversized_request_gets_dedicated_capacity() {
        let mut arena = Arena::new();

        let huge = DEFAULT_BLOCK_SIZE * 10;
        let ptr = arena.alloc_align(huge, 256).unwrap();

        assert_eq!(addr(ptr) % 256, 0);
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.capacity(), huge + 256);
    }

    #[test]
    fn reset_reuses_retained_blocks() {
        let mut arena = Arena::new();

        _ = arena.alloc(3000).unwrap();
        _ = arena.alloc(3000).unwrap();
        _ = arena.alloc(7000).unwrap();
        assert_eq!(arena.block_count(), 3);
        let capacity = arena.capacity();

        arena.reset();
        assert_eq!(arena.total_allocated(), 0);

        _ = arena.alloc(3000).unwrap();
        _ = arena.alloc(3000).unwrap();
        _ = arena.alloc(7000).unwrap();

        assert_eq!(arena.block_count(), 3);
        assert_eq!(arena.capacity(), capacity);
        assert_eq!(arena.total_allocated(), 13000);
    }

    #[test]
    fn growth_after_reset_keeps_retained_blocks() {
        let mut arena = Arena::new();

        _ = arena.alloc(3000).unwrap();
        _ = arena.alloc(3000).unwrap();
        assert_eq!(arena.block_count(), 2);

        arena.reset();

        // Too big for either retained block, so a new block is spliced in after the first one.
        _ = arena.alloc(20_000).unwrap();
        assert_eq!(arena.block_count(), 3);

        let capacities: Vec<usize> = arena.blocks().map(|header| header.capacity).collect();
        assert_eq!(
            capacities,
            vec![DEFAULT_BLOCK_SIZE, 20_000 + MAX_ALIGN, DEFAULT_BLOCK_SIZE * 2]
        );
    }

    #[test]
    fn free_returns_to_initial_state() {
        let mut arena = Arena::with_backing(LimitedBacking::default());

        _ = arena.alloc(5000).unwrap();
        _ = arena.alloc(50_000).unwrap();
        assert_eq!(arena.backing().outstanding(), 2);

        arena.free();

        assert_eq!(arena.block_count(), 0);
        assert_eq!(arena.total_allocated(), 0);
        assert_eq!(arena.backing().outstanding(), 0);

        _ = arena.alloc(8).unwrap();
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.capacity(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn failed_growth_leaves_arena_unchanged() {
        let mut arena = Arena::with_backing(LimitedBacking::default());

        _ = arena.alloc(4000).unwrap();
        let capacity = arena.capacity();
        let total = arena.total_allocated();

        arena.backing().fail_after(0);

        assert!(arena.alloc(500).is_none());
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.capacity(), capacity);
        assert_eq!(arena.total_allocated(), total);

        // Requests that still fit the current block keep working.
        assert!(arena.alloc(16).is_some());

        arena.backing().unlimited();
        assert!(arena.alloc(500).is_some());
        assert_eq!(arena.block_count(), 2);
    }

    #[test]
    fn first_allocation_failure_keeps_arena_empty() {
        let mut arena = Arena::with_backing(LimitedBacking::default());
        arena.backing().fail_after(0);

        assert!(arena.alloc(1).is_none());
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    fn alloc_zero_clears_reused_memory() {
        let mut arena = Arena::new();

        let dirty = arena.alloc(512).unwrap();
        unsafe {
            dirty.write_bytes(0xFF, 512);
        }

        arena.reset();

        let clean = arena.alloc_zero(512).unwrap();
        assert_eq!(addr(clean), addr(dirty));

        let bytes = unsafe { std::slice::from_raw_parts(clean.as_ptr(), 512) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_layout_respects_layout() {
        let mut arena = Arena::new();

        _ = arena.alloc_align(1, 1).unwrap();
        let ptr = arena.alloc_layout(Layout::new::<u128>()).unwrap();

        assert_eq!(addr(ptr) % std::mem::align_of::<u128>(), 0);
    }

    #[test]
    fn realloc_without_pointer_allocates() {
        let mut arena = Arena::new();

        let ptr = unsafe { arena.realloc(None, 0, 32) };

        assert!(ptr.is_some());
        assert_eq!(arena.total_allocated(), 32);
    }

    #[test]
    fn realloc_to_zero_yields_nothing() {
        let mut arena = Arena::new();
        let ptr = arena.alloc(32).unwrap();

        assert!(unsafe { arena.realloc(Some(ptr), 32, 0) }.is_none());
    }

    #[test]
    fn realloc_shrink_keeps_pointer() {
        let mut arena = Arena::new();
        let ptr = arena.alloc(64).unwrap();

        assert_eq!(unsafe { arena.realloc(Some(ptr), 64, 64) }, Some(ptr));
        assert_eq!(unsafe { arena.realloc(Some(ptr), 64, 10) }, Some(ptr));
        assert_eq!(arena.total_allocated(), 64);
    }

    #[test]
    fn realloc_extends_tail_allocation_in_place() {
        let mut arena = Arena::new();

        _ = arena.alloc(16).unwrap();
        let tail = arena.alloc(32).unwrap();

        let grown = unsafe { arena.realloc(Some(tail), 32, 100) }.unwrap();

        assert_eq!(grown, tail);
        assert_eq!(arena.total_allocated(), 16 + 100);

        // The next allocation starts after the extended region.
        let next = arena.alloc_align(1, 1).unwrap();
        assert_eq!(addr(next), addr(tail) + 100);
    }

    #[test]
    fn realloc_copies_non_tail_allocation() {
        let mut arena = Arena::new();

        let first = arena.alloc(8).unwrap();
        unsafe {
            first.as_ptr().copy_from_nonoverlapping([1_u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), 8);
        }
        _ = arena.alloc(8).unwrap();

        let moved = unsafe { arena.realloc(Some(first), 8, 64) }.unwrap();

        assert_ne!(moved, first);
        let bytes = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 8) };
        assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn realloc_moves_to_new_block_when_current_is_full() {
        let mut arena = Arena::new();

        let tail = arena.alloc(DEFAULT_BLOCK_SIZE - 64).unwrap();
        unsafe {
            tail.write_bytes(0x5A, DEFAULT_BLOCK_SIZE - 64);
        }

        let moved =
            unsafe { arena.realloc(Some(tail), DEFAULT_BLOCK_SIZE - 64, DEFAULT_BLOCK_SIZE + 1) }
                .unwrap();

        assert_ne!(moved, tail);
        assert_eq!(arena.block_count(), 2);
        assert_eq!(unsafe { moved.as_ptr().add(DEFAULT_BLOCK_SIZE - 65).read() }, 0x5A);
    }

    #[test]
    fn scoped_resets_after_closure() {
        let mut arena = Arena::new();

        let used_inside = arena.scoped(|inner| {
            _ = inner.alloc(100).unwrap();
            inner.total_allocated()
        });

        assert_eq!(used_inside, 100);
        assert_eq!(arena.total_allocated(), 0);
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn scoped_resets_on_panic() {
        let mut arena = Arena::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            arena.scoped(|inner| {
                _ = inner.alloc(100).unwrap();
                panic!("boom");
            });
        }));

        assert!(result.is_err());
        assert_eq!(arena.total_allocated(), 0);
    }

    #[test]
    fn drop_releases_all_blocks() {
        let backing = LimitedBacking::default();

        {
            let mut arena = Arena::with_backing(&backing);
            _ = arena.alloc(10).unwrap();
            _ = arena.alloc(10_000).unwrap();
            assert_eq!(backing.outstanding(), 2);
        }

        assert_eq!(backing.outstanding(), 0);
    }
}
