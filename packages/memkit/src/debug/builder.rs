use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::RawMutex;

use crate::{
    BackingAllocator, DebugAllocator, DiagnosticSink, NoLock, Registry, StderrSink, SystemBacking,
    ViolationPolicy,
};

/// Builder for creating an instance of [`DebugAllocator`].
///
/// All settings are optional. By default the allocator draws from the system allocator, tracks
/// its allocations in a registry of its own that is not thread-safe, writes diagnostics to
/// standard error and aborts the process on the first contract violation.
///
/// # Examples
///
/// ```
/// use memkit::{DebugAllocator, TracingSink, ViolationPolicy};
///
/// let debug = DebugAllocator::builder()
///     .synchronized()
///     .sink(TracingSink::default())
///     .violation_policy(ViolationPolicy::ReturnError)
///     .build();
///
/// let ptr = debug.calloc(4, 8).unwrap().unwrap();
/// debug.free(ptr).unwrap();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) if the backing allocator and the registry are, but
/// it is not thread-safe ([`Sync`]).
#[must_use]
pub struct DebugAllocatorBuilder<B: BackingAllocator = SystemBacking, R: RawMutex = NoLock> {
    backing: B,
    registry: Option<Arc<Registry<R>>>,
    sink: Arc<dyn DiagnosticSink>,
    violation_policy: ViolationPolicy,

    _not_sync: PhantomData<Cell<()>>,
}

impl DebugAllocatorBuilder<SystemBacking, NoLock> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            backing: SystemBacking::system(),
            registry: None,
            sink: Arc::new(StderrSink),
            violation_policy: ViolationPolicy::default(),
            _not_sync: PhantomData,
        }
    }
}

impl<B: BackingAllocator, R: RawMutex> DebugAllocatorBuilder<B, R> {
    /// Sets the allocator the debug allocator obtains its memory from.
    #[inline]
    pub fn backing<B2: BackingAllocator>(self, backing: B2) -> DebugAllocatorBuilder<B2, R> {
        DebugAllocatorBuilder {
            backing,
            registry: self.registry,
            sink: self.sink,
            violation_policy: self.violation_policy,
            _not_sync: PhantomData,
        }
    }

    /// Tracks allocations in `registry`, which may be shared with other debug allocators to
    /// produce a combined leak report.
    ///
    /// Every pointer must still be released through the allocator that handed it out.
    #[inline]
    pub fn registry<R2: RawMutex>(
        self,
        registry: Arc<Registry<R2>>,
    ) -> DebugAllocatorBuilder<B, R2> {
        DebugAllocatorBuilder {
            backing: self.backing,
            registry: Some(registry),
            sink: self.sink,
            violation_policy: self.violation_policy,
            _not_sync: PhantomData,
        }
    }

    /// Tracks allocations in a new registry guarded by a [`parking_lot::RawMutex`], making the
    /// allocator thread-safe. Replaces any registry set before.
    #[inline]
    pub fn synchronized(self) -> DebugAllocatorBuilder<B, parking_lot::RawMutex> {
        self.registry(Arc::new(Registry::new()))
    }

    /// Sets where diagnostics are delivered.
    #[inline]
    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Sets what happens after a contract violation is detected and reported.
    #[inline]
    pub fn violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = policy;
        self
    }

    /// Builds the debug allocator with the specified configuration.
    #[must_use]
    #[inline]
    pub fn build(self) -> DebugAllocator<B, R> {
        DebugAllocator::new_inner(
            self.backing,
            self.registry.unwrap_or_default(),
            self.sink,
            self.violation_policy,
        )
    }
}

impl<B: BackingAllocator, R: RawMutex> fmt::Debug for DebugAllocatorBuilder<B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugAllocatorBuilder")
            .field("backing", &self.backing)
            .field("registry", &self.registry)
            .field("violation_policy", &self.violation_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::TracingSink;

    assert_impl_all!(DebugAllocatorBuilder: fmt::Debug);
    assert_impl_all!(DebugAllocatorBuilder<SystemBacking, parking_lot::RawMutex>: Send);
    assert_not_impl_any!(DebugAllocatorBuilder<SystemBacking, parking_lot::RawMutex>: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = DebugAllocatorBuilder::new();

        assert!(builder.registry.is_none());
        assert_eq!(builder.violation_policy, ViolationPolicy::Abort);
    }

    #[test]
    fn shared_registry_is_used() {
        let registry = Arc::new(Registry::<NoLock>::new());

        let debug = DebugAllocatorBuilder::new()
            .registry(Arc::clone(&registry))
            .build();

        assert!(Arc::ptr_eq(debug.registry(), &registry));
    }

    #[test]
    fn settings_survive_type_changes() {
        let debug = DebugAllocatorBuilder::new()
            .violation_policy(ViolationPolicy::ReturnError)
            .sink(TracingSink)
            .synchronized()
            .backing(SystemBacking::system())
            .build();

        assert_eq!(debug.violation_policy(), ViolationPolicy::ReturnError);
    }
}
