/// Largest alignment guaranteed by [`Arena::alloc()`][crate::Arena::alloc] and by payloads
/// handed out by the debug allocator.
pub const MAX_ALIGN: usize = 16;

/// Capacity of the first block an arena obtains from its backing allocator, unless configured
/// otherwise. Every following block doubles the capacity of the block before it.
#[cfg(feature = "arena")]
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Number of items in each pool page when the caller does not specify a usable value.
#[cfg(feature = "pool")]
pub const DEFAULT_ITEMS_PER_BLOCK: usize = 64;

/// Number of sentinel bytes appended after every debug allocation payload.
#[cfg(feature = "debug")]
pub const GUARD_SIZE: usize = 16;

/// Sentinel value written into every byte of the guard region.
#[cfg(feature = "debug")]
pub const GUARD_BYTE: u8 = 0xBB;

/// Number of released addresses a debug allocator registry remembers for telling a double free
/// apart from a free of an unknown pointer.
#[cfg(feature = "debug")]
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 4096;
