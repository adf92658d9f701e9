#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Three independent raw-memory allocators with explicit growth strategies and fail-fast
//! instrumentation.
//!
//! * [`Arena`] hands out bump-pointer allocations from a chain of growing blocks and reclaims
//!   them all at once, either by resetting the arena for reuse or by releasing its blocks.
//! * [`Pool`] hands out fixed-size slots from paged blocks in O(1), recycling them through an
//!   index-based free list.
//! * [`DebugAllocator`] wraps a backing allocator and tracks every live allocation with its call
//!   site, detecting leaks, buffer overruns, double frees and frees of unknown pointers.
//!
//! Each component sits behind its own cargo feature (`arena`, `pool`, `debug`), all enabled by
//! default. Components never call each other. All of them obtain raw memory through the
//! [`BackingAllocator`] trait, which is injected at construction and defaults to the system
//! allocator.
//!
//! # Resource exhaustion
//!
//! Every allocating operation returns `None` when the backing allocator cannot satisfy a request.
//! The allocator state is left exactly as it was before the call.
//!
//! # Examples
//!
//! ## Arena
//!
//! ```rust
//! use memkit::Arena;
//!
//! let mut arena = Arena::new();
//!
//! let name = arena.alloc(32).unwrap();
//! let table = arena.alloc_zero(4096).unwrap();
//! assert_ne!(name, table);
//!
//! // Dropping the arena returns every block to the system allocator.
//! ```
//!
//! ## Pool
//!
//! ```rust
//! use memkit::Pool;
//!
//! let mut pool = Pool::builder().layout_of::<[u64; 4]>().build();
//!
//! let item = pool.alloc().unwrap();
//! let address = item.ptr();
//!
//! // SAFETY: The item came from this pool and is recycled only once.
//! unsafe { pool.recycle(item) };
//!
//! // The most recently recycled slot is handed out first.
//! assert_eq!(pool.alloc().unwrap().ptr(), address);
//! ```
//!
//! ## Debug allocator
//!
//! ```rust
//! use memkit::{DebugAllocator, ViolationPolicy};
//!
//! let debug = DebugAllocator::builder()
//!     .violation_policy(ViolationPolicy::ReturnError)
//!     .build();
//!
//! let kept = debug.malloc(10).unwrap().unwrap();
//! let dropped = debug.malloc(20).unwrap().unwrap();
//! debug.free(dropped).unwrap();
//!
//! let report = debug.leak_report();
//! assert_eq!(report.count(), 1);
//! assert_eq!(report.total_bytes(), 10);
//!
//! debug.free(kept).unwrap();
//! assert_eq!(debug.print_leaks(), 0);
//! ```

mod backing;
mod constants;

#[cfg(feature = "arena")]
mod arena;
#[cfg(feature = "arena")]
mod arena_builder;
#[cfg(feature = "debug")]
mod debug;
#[cfg(feature = "pool")]
mod pool;
#[cfg(feature = "pool")]
mod pool_builder;

#[cfg(feature = "arena")]
pub use arena::Arena;
#[cfg(feature = "arena")]
pub use arena_builder::ArenaBuilder;
pub use backing::*;
pub use constants::*;
#[cfg(feature = "debug")]
pub use debug::*;
#[cfg(feature = "pool")]
pub use pool::*;
#[cfg(feature = "pool")]
pub use pool_builder::PoolBuilder;
