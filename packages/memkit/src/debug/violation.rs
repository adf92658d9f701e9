use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Misuse of a [`DebugAllocator`][crate::DebugAllocator] detected while validating a pointer.
///
/// Every violation is reported to the allocator's diagnostic sink before the allocator's
/// [`ViolationPolicy`] decides what happens next.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum ContractViolation {
    /// The pointer was handed out by the allocator but has already been released.
    #[error("double free: {operation} of {address:#x}, allocated at {site} and already released")]
    AlreadyFreed {
        /// Address of the payload passed to the allocator.
        address: usize,

        /// Where the released allocation was originally made.
        site: &'static Location<'static>,

        /// The operation that received the pointer.
        operation: Operation,
    },

    /// The pointer was never handed out by the allocator.
    #[error("invalid free: {operation} of {address:#x}, which this allocator never handed out")]
    Untracked {
        /// Address of the payload passed to the allocator.
        address: usize,

        /// The operation that received the pointer.
        operation: Operation,
    },

    /// The guard bytes after the payload were overwritten.
    #[error(
        "buffer overflow: guard after the {size}-byte allocation at {address:#x} from {site} was overwritten"
    )]
    BufferOverflow {
        /// Address of the payload.
        address: usize,

        /// Size of the payload in bytes, as requested by the caller.
        size: usize,

        /// Where the allocation was made.
        site: &'static Location<'static>,
    },

    /// The bookkeeping header in front of a live payload does not carry the live tag.
    #[error("corrupted header: allocation at {address:#x} carries tag {magic:#010x}")]
    CorruptedHeader {
        /// Address of the payload.
        address: usize,

        /// The tag found in the header.
        magic: u32,
    },

    /// An earlier violation poisoned the allocator under [`ViolationPolicy::ReturnError`].
    #[error("allocator is poisoned by an earlier contract violation")]
    Poisoned,
}

/// The allocator operation that received an invalid pointer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Operation {
    /// [`DebugAllocator::free()`][crate::DebugAllocator::free].
    Free,

    /// [`DebugAllocator::realloc()`][crate::DebugAllocator::realloc].
    Realloc,

    /// [`DebugAllocator::validate()`][crate::DebugAllocator::validate].
    Validate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Realloc => "realloc",
            Self::Validate => "validate",
        })
    }
}

/// Determines what a [`DebugAllocator`][crate::DebugAllocator] does after it detects a
/// [`ContractViolation`] and reports it.
///
/// By default, the process is aborted.
///
/// # Examples
///
/// ```
/// use memkit::{ContractViolation, DebugAllocator, ViolationPolicy};
///
/// let debug = DebugAllocator::builder()
///     .violation_policy(ViolationPolicy::ReturnError)
///     .build();
///
/// let ptr = debug.malloc(8).unwrap().unwrap();
/// debug.free(ptr).unwrap();
///
/// assert!(matches!(
///     debug.free(ptr),
///     Err(ContractViolation::AlreadyFreed { .. })
/// ));
/// assert!(debug.is_poisoned());
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ViolationPolicy {
    /// The process is aborted right after the violation is reported. This is the default.
    #[default]
    Abort,

    /// The violation is returned to the caller as an error and the allocator is poisoned: every
    /// later operation fails with [`ContractViolation::Poisoned`].
    ///
    /// Memory is not released by a poisoned allocator, so this is mostly useful for tests that
    /// need to observe violations without terminating the process.
    ReturnError,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ContractViolation: Send, Sync, Copy, fmt::Debug, std::error::Error);
    assert_impl_all!(ViolationPolicy: Send, Sync, Copy, Default);

    #[test]
    fn default_policy_aborts() {
        assert_eq!(ViolationPolicy::default(), ViolationPolicy::Abort);
    }

    #[test]
    fn double_free_message_names_original_site() {
        let site = Location::caller();
        let violation = ContractViolation::AlreadyFreed {
            address: 0x1000,
            site,
            operation: Operation::Free,
        };

        let message = violation.to_string();
        assert!(message.starts_with("double free: free of 0x1000"));
        assert!(message.contains(site.file()));
    }

    #[test]
    fn invalid_free_message_names_operation() {
        let violation = ContractViolation::Untracked {
            address: 0xABC0,
            operation: Operation::Realloc,
        };

        assert_eq!(
            violation.to_string(),
            "invalid free: realloc of 0xabc0, which this allocator never handed out"
        );
    }

    #[test]
    fn corrupted_header_message_shows_tag() {
        let violation = ContractViolation::CorruptedHeader {
            address: 0x10,
            magic: 0xDEAD_DEAD,
        };

        assert!(violation.to_string().contains("0xdeaddead"));
    }
}
