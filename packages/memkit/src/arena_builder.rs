use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{Arena, BackingAllocator, DEFAULT_BLOCK_SIZE, SystemBacking};

pub(crate) const fn default_block_size() -> NonZero<usize> {
    match NonZero::new(DEFAULT_BLOCK_SIZE) {
        Some(size) => size,
        None => panic!("default block size must be non-zero"),
    }
}

/// Builder for creating an instance of [`Arena`].
///
/// All settings are optional. By default the arena draws from the system allocator and its first
/// block holds [`DEFAULT_BLOCK_SIZE`] bytes of data.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use memkit::Arena;
///
/// let mut arena = Arena::builder()
///     .default_block_size(NonZero::new(256).unwrap())
///     .build();
///
/// _ = arena.alloc(10).unwrap();
/// assert_eq!(arena.capacity(), 256);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) if the backing allocator is, but it is not
/// thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct ArenaBuilder<B: BackingAllocator = SystemBacking> {
    backing: B,
    default_block_size: NonZero<usize>,

    _not_sync: PhantomData<Cell<()>>,
}

impl ArenaBuilder<SystemBacking> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            backing: SystemBacking::system(),
            default_block_size: default_block_size(),
            _not_sync: PhantomData,
        }
    }
}

impl<B: BackingAllocator> ArenaBuilder<B> {
    /// Sets the allocator the arena obtains its blocks from.
    #[inline]
    pub fn backing<B2: BackingAllocator>(self, backing: B2) -> ArenaBuilder<B2> {
        ArenaBuilder {
            backing,
            default_block_size: self.default_block_size,
            _not_sync: PhantomData,
        }
    }

    /// Sets the data capacity of the first block. Every later block doubles the capacity of the
    /// block before it, or is sized to fit the request that created it if that is larger.
    #[inline]
    pub fn default_block_size(mut self, size: NonZero<usize>) -> Self {
        self.default_block_size = size;
        self
    }

    /// Builds the arena with the specified configuration.
    ///
    /// No memory is obtained until the first allocation.
    #[must_use]
    #[inline]
    pub fn build(self) -> Arena<B> {
        Arena::new_inner(self.backing, self.default_block_size)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::backing::LimitedBacking;

    assert_impl_all!(ArenaBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(ArenaBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = ArenaBuilder::new();
        assert_eq!(builder.default_block_size.get(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn default_block_size_is_applied() {
        let mut arena = ArenaBuilder::new()
            .default_block_size(NonZero::new(100).unwrap())
            .build();

        _ = arena.alloc(1).unwrap();
        _ = arena.alloc(99).unwrap();

        // 1 byte at offset 0, then 99 bytes aligned to 16 no longer fit in 100.
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.capacity(), 100 + 200);
    }

    #[test]
    fn backing_replaces_allocator_and_keeps_settings() {
        let mut arena = ArenaBuilder::new()
            .default_block_size(NonZero::new(512).unwrap())
            .backing(LimitedBacking::default())
            .build();

        assert_eq!(arena.backing().outstanding(), 0);

        _ = arena.alloc(1).unwrap();

        assert_eq!(arena.capacity(), 512);
        assert_eq!(arena.backing().outstanding(), 1);
    }
}
