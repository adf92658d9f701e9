//! The seam through which every allocator in this crate obtains raw memory.

use std::alloc::{GlobalAlloc, Layout, System};
use std::any::type_name;
#[cfg(test)]
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

/// A source of raw memory blocks for the allocators in this crate.
///
/// Every request the arena, the pool and the debug allocator make for raw memory goes through
/// the three operations of this trait. The allocator to use is chosen when each component is
/// built, so different components (or different instances of the same component) can draw from
/// different sources.
///
/// Exhaustion is reported by returning `None`. Implementations must not panic on exhaustion.
///
/// # Safety
///
/// Implementations must uphold the same contract as [`GlobalAlloc`]: a block returned for a
/// layout must be valid for reads and writes of `layout.size()` bytes, must satisfy
/// `layout.align()` and must remain valid until it is resized or released through the same
/// allocator.
pub unsafe trait BackingAllocator: fmt::Debug {
    /// Obtains a block of memory satisfying `layout`, or `None` if memory is exhausted.
    ///
    /// # Safety
    ///
    /// `layout` must have a non-zero size.
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Resizes a block to `new_size` bytes, preserving the contents up to the smaller of the two
    /// sizes. Returns `None` if memory is exhausted, in which case the original block is left
    /// untouched and remains valid.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block currently allocated via this allocator.
    /// * `layout` must be the layout that block was allocated or last resized with.
    /// * `new_size` must be non-zero and, rounded up to `layout.align()`, must not overflow `isize`.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block currently allocated via this allocator.
    /// * `layout` must be the layout that block was allocated or last resized with.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Adapts any [`GlobalAlloc`] implementation into a [`BackingAllocator`].
///
/// # Examples
///
/// ```rust
/// use memkit::{Arena, GlobalBacking};
///
/// let mut arena = Arena::with_backing(GlobalBacking::system());
/// assert!(arena.alloc(64).is_some());
/// ```
#[derive(Clone, Copy, Default)]
pub struct GlobalBacking<A: GlobalAlloc> {
    inner: A,
}

/// The default backing allocator: the platform's general-purpose allocator.
pub type SystemBacking = GlobalBacking<System>;

impl GlobalBacking<System> {
    /// Creates a backing allocator that forwards to the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A: GlobalAlloc> GlobalBacking<A> {
    /// Creates a backing allocator that forwards to `allocator`.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

impl<A: GlobalAlloc> fmt::Debug for GlobalBacking<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("inner", &type_name::<A>())
            .finish()
    }
}

// SAFETY: We forward every call to a GlobalAlloc, which upholds the same contract. Null results
// are translated into None and never handed out.
unsafe impl<A: GlobalAlloc> BackingAllocator for GlobalBacking<A> {
    #[inline]
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding the non-zero size requirement to the caller.
        NonNull::new(unsafe { self.inner.alloc(layout) })
    }

    #[inline]
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding the block ownership and size requirements to the caller.
        NonNull::new(unsafe { self.inner.realloc(ptr.as_ptr(), layout, new_size) })
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding the block ownership requirements to the caller.
        unsafe { self.inner.dealloc(ptr.as_ptr(), layout) }
    }
}

// SAFETY: We forward every call to the referenced allocator, which upholds the contract.
unsafe impl<B: BackingAllocator + ?Sized> BackingAllocator for &B {
    #[inline]
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).allocate(layout) }
    }

    #[inline]
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).resize(ptr, layout, new_size) }
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { (**self).release(ptr, layout) }
    }
}

/// A system-backed allocator with an adjustable allocation budget, used to exercise the
/// exhaustion paths of the allocators. It also counts blocks that have not been released.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct LimitedBacking {
    /// How many more allocations or resizes may succeed. `None` means unlimited.
    remaining: Cell<Option<usize>>,

    /// Blocks handed out and not yet released.
    outstanding: Cell<usize>,
}

#[cfg(test)]
impl LimitedBacking {
    /// Allows `count` more successful allocations or resizes, then fails every request.
    pub(crate) fn fail_after(&self, count: usize) {
        self.remaining.set(Some(count));
    }

    pub(crate) fn unlimited(&self) {
        self.remaining.set(None);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    fn take_budget(&self) -> bool {
        match self.remaining.get() {
            None => true,
            Some(0) => false,
            Some(n) => {
                self.remaining.set(Some(n - 1));
                true
            }
        }
    }
}

#[cfg(test)]
// SAFETY: Every successful request is forwarded to the system allocator.
unsafe impl BackingAllocator for LimitedBacking {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if !self.take_budget() {
            return None;
        }

        // SAFETY: Forwarding safety requirements to the caller.
        let ptr = NonNull::new(unsafe { System.alloc(layout) })?;
        self.outstanding.set(self.outstanding.get() + 1);
        Some(ptr)
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if !self.take_budget() {
            return None;
        }

        // SAFETY: Forwarding safety requirements to the caller.
        NonNull::new(unsafe { System.realloc(ptr.as_ptr(), layout, new_size) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.outstanding.set(self.outstanding.get() - 1);

        // SAFETY: Forwarding safety requirements to the caller.
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SystemBacking: Send, Sync, Copy, fmt::Debug, Default);

    #[test]
    fn system_backing_round_trip() {
        let backing = GlobalBacking::system();
        let layout = Layout::from_size_align(64, 16).unwrap();

        let ptr = unsafe { backing.allocate(layout) }.unwrap();
        assert_eq!(ptr.as_ptr().align_offset(16), 0);

        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 64);
        }

        let grown = unsafe { backing.resize(ptr, layout, 128) }.unwrap();
        let grown_layout = Layout::from_size_align(128, 16).unwrap();

        // The first 64 bytes survive the resize.
        for offset in 0..64 {
            assert_eq!(unsafe { grown.as_ptr().add(offset).read() }, 0xAB);
        }

        unsafe { backing.release(grown, grown_layout) };
    }

    #[test]
    fn limited_backing_fails_when_budget_exhausted() {
        let backing = LimitedBacking::default();
        let layout = Layout::new::<u64>();

        backing.fail_after(1);

        let first = unsafe { backing.allocate(layout) }.unwrap();
        assert!(unsafe { backing.allocate(layout) }.is_none());
        assert_eq!(backing.outstanding(), 1);

        unsafe { backing.release(first, layout) };
        assert_eq!(backing.outstanding(), 0);

        backing.unlimited();
        let again = unsafe { backing.allocate(layout) }.unwrap();
        unsafe { backing.release(again, layout) };
    }

    #[test]
    fn debug_output_names_the_wrapped_allocator() {
        let rendered = format!("{:?}", GlobalBacking::system());
        assert!(rendered.contains("System"));
    }
}
