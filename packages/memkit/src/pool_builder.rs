use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::num::NonZero;

use crate::{BackingAllocator, DEFAULT_ITEMS_PER_BLOCK, Pool, SystemBacking};

/// Builder for creating an instance of [`Pool`].
///
/// [`Pool`] requires the item size to be specified at construction time. Use either
/// `.item_size()` to provide a size in bytes or `.layout_of::<T>()` to size and align the items
/// for a specific type. The item size is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use memkit::Pool;
///
/// let pool = Pool::builder().item_size(40).items_per_block(32).build();
///
/// assert_eq!(pool.item_size() % size_of::<usize>(), 0);
/// assert_eq!(pool.count_per_block(), 32);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) if the backing allocator is, but it is not
/// thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct PoolBuilder<B: BackingAllocator = SystemBacking> {
    item_layout: Option<Layout>,
    items_per_block: usize,
    backing: B,

    _not_sync: PhantomData<Cell<()>>,
}

impl PoolBuilder<SystemBacking> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            item_layout: None,
            items_per_block: DEFAULT_ITEMS_PER_BLOCK,
            backing: SystemBacking::system(),
            _not_sync: PhantomData,
        }
    }
}

impl<B: BackingAllocator> PoolBuilder<B> {
    /// Sets the size of every item in bytes.
    ///
    /// The size is rounded up to a multiple of the pointer width, with a minimum of one pointer
    /// width, and items are aligned to the pointer width.
    #[inline]
    pub fn item_size(mut self, size: usize) -> Self {
        self.item_layout = Some(
            Layout::from_size_align(size, mem::align_of::<usize>())
                .expect("pool item size must not exceed isize::MAX when rounded up"),
        );
        self
    }

    /// Sizes and aligns items to hold a value of type `T`.
    ///
    /// # Examples
    ///
    /// ```
    /// use memkit::Pool;
    ///
    /// let mut pool = Pool::builder().layout_of::<u128>().build();
    ///
    /// let item = pool.alloc().unwrap();
    /// // SAFETY: The item is sized and aligned for a u128 and belongs to us until recycled.
    /// unsafe { item.ptr().cast::<u128>().write(42) };
    /// ```
    #[inline]
    pub fn layout_of<T>(mut self) -> Self {
        self.item_layout = Some(Layout::new::<T>());
        self
    }

    /// Sets the number of items obtained from the backing allocator at a time. Zero selects
    /// [`DEFAULT_ITEMS_PER_BLOCK`].
    #[inline]
    pub fn items_per_block(mut self, count: usize) -> Self {
        self.items_per_block = count;
        self
    }

    /// Sets the allocator the pool obtains its pages from.
    #[inline]
    pub fn backing<B2: BackingAllocator>(self, backing: B2) -> PoolBuilder<B2> {
        PoolBuilder {
            item_layout: self.item_layout,
            items_per_block: self.items_per_block,
            backing,
            _not_sync: PhantomData,
        }
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no item size has been set using either [`item_size`](Self::item_size) or
    /// [`layout_of`](Self::layout_of), or if a page of the resulting size cannot be described by
    /// a [`Layout`].
    #[must_use]
    #[inline]
    pub fn build(self) -> Pool<B> {
        let item_layout = self.item_layout.expect(
            "item size must be set using .item_size() or .layout_of::<T>() before calling .build()",
        );

        let count_per_block = NonZero::new(self.items_per_block)
            .or(NonZero::new(DEFAULT_ITEMS_PER_BLOCK))
            .expect("default items per block is non-zero");

        Pool::new_inner(slot_layout(item_layout), count_per_block, self.backing)
    }
}

/// Widens `item_layout` to at least one pointer in size and alignment and pads it to a multiple
/// of its alignment, so that consecutive slots are all aligned.
fn slot_layout(item_layout: Layout) -> Layout {
    let size = item_layout.size().max(mem::size_of::<usize>());
    let align = item_layout.align().max(mem::align_of::<usize>());

    Layout::from_size_align(size, align)
        .expect("widening a valid layout to pointer size cannot fail for reasonable item sizes")
        .pad_to_align()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(PoolBuilder: Sync);

    const WORD: usize = mem::size_of::<usize>();

    #[test]
    fn builder_new_creates_default_state() {
        let builder = PoolBuilder::new();
        assert!(builder.item_layout.is_none());
        assert_eq!(builder.items_per_block, DEFAULT_ITEMS_PER_BLOCK);
    }

    #[test]
    fn item_size_sets_pointer_aligned_layout() {
        let builder = PoolBuilder::new().item_size(3);
        assert_eq!(
            builder.item_layout,
            Some(Layout::from_size_align(3, mem::align_of::<usize>()).unwrap())
        );
    }

    #[test]
    fn layout_of_sets_layout_correctly() {
        let builder = PoolBuilder::new().layout_of::<[u16; 5]>();
        assert_eq!(builder.item_layout, Some(Layout::new::<[u16; 5]>()));
    }

    #[test]
    fn slot_layout_rounds_small_items_up_to_pointer() {
        let slot = slot_layout(Layout::new::<u8>());
        assert_eq!(slot.size(), WORD);
        assert_eq!(slot.align(), mem::align_of::<usize>());

        let slot = slot_layout(Layout::new::<()>());
        assert_eq!(slot.size(), WORD);
    }

    #[test]
    fn slot_layout_pads_to_alignment() {
        let slot = slot_layout(Layout::from_size_align(WORD + 1, 32).unwrap());
        assert_eq!(slot.size(), 32);
        assert_eq!(slot.align(), 32);
    }

    #[test]
    #[should_panic]
    fn build_without_item_size_panics() {
        let _pool = PoolBuilder::new().build();
    }

    #[test]
    fn zero_items_per_block_selects_default() {
        let pool = PoolBuilder::new().item_size(8).items_per_block(0).build();
        assert_eq!(pool.count_per_block(), DEFAULT_ITEMS_PER_BLOCK);
    }
}
