//! Leak-tracking, overflow-detecting allocator wrapper.

mod atexit;
mod builder;
mod diagnostic;
mod record;
mod registry;
mod violation;

use std::fmt;
use std::panic::Location;
use std::process;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::RawMutex;
use record::{Record, record_layout};

pub use builder::*;
pub use diagnostic::*;
pub use registry::{LeakRecord, LeakReport, NoLock, Registry};
pub use violation::*;

use crate::{BackingAllocator, SystemBacking};

/// Wraps a backing allocator with leak tracking, overflow detection and misuse detection.
///
/// Every allocation is prefixed with a bookkeeping header recording its size and call site and
/// is followed by [`GUARD_SIZE`][crate::GUARD_SIZE] guard bytes. Live allocations are linked into
/// a [`Registry`], which can report them as leaks at any time, including automatically at
/// process exit via [`register_atexit()`](Self::register_atexit).
///
/// Releasing or resizing a pointer validates it first. Pointers the allocator never handed out,
/// pointers that were already released, damaged headers and overwritten guard bytes are reported
/// as a [`ContractViolation`] to the diagnostic sink, after which the [`ViolationPolicy`] decides
/// whether the process is aborted (the default) or the violation is returned as an error.
///
/// Payloads are aligned to [`MAX_ALIGN`][crate::MAX_ALIGN].
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
/// let ptr = debug.malloc(64).unwrap().unwrap();
///
/// // Write one byte past the end of the allocation.
/// // SAFETY: The guard bytes are part of the allocation, we are only simulating a bug.
/// unsafe { ptr.add(64).write(0) };
///
/// assert!(matches!(
///     debug.validate(ptr),
///     Err(ContractViolation::BufferOverflow { size: 64, .. })
/// ));
/// ```
///
/// # Thread safety
///
/// With the default [`NoLock`] registry the allocator is confined to the thread that created
/// it. Build it with [`DebugAllocatorBuilder::synchronized()`] or with a registry guarded by
/// [`parking_lot::RawMutex`] to share it between threads.
pub struct DebugAllocator<B: BackingAllocator = SystemBacking, R: RawMutex = NoLock> {
    backing: B,
    registry: Arc<Registry<R>>,
    sink: Arc<dyn DiagnosticSink>,
    violation_policy: ViolationPolicy,

    /// Set by the first violation under `ViolationPolicy::ReturnError`.
    poisoned: AtomicBool,
}

/// Outcome of an allocating operation: `Ok(None)` means nothing was allocated, either because
/// the request was empty or because memory is exhausted.
pub type AllocResult = Result<Option<NonNull<u8>>, ContractViolation>;

impl DebugAllocator<SystemBacking, NoLock> {
    /// Creates a builder for configuring and constructing a [`DebugAllocator`].
    #[inline]
    pub fn builder() -> DebugAllocatorBuilder<SystemBacking, NoLock> {
        DebugAllocatorBuilder::new()
    }
}

impl<B: BackingAllocator, R: RawMutex> DebugAllocator<B, R> {
    #[must_use]
    pub(crate) fn new_inner(
        backing: B,
        registry: Arc<Registry<R>>,
        sink: Arc<dyn DiagnosticSink>,
        violation_policy: ViolationPolicy,
    ) -> Self {
        Self {
            backing,
            registry,
            sink,
            violation_policy,
            poisoned: AtomicBool::new(false),
        }
    }

    /// Allocates `size` bytes, recording the caller as the allocation site.
    ///
    /// Returns `Ok(None)` if `size` is zero, without creating a record, or if memory is
    /// exhausted, after reporting [`Diagnostic::OutOfMemory`].
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::Poisoned`] if the allocator is poisoned.
    #[track_caller]
    #[inline]
    pub fn malloc(&self, size: usize) -> AllocResult {
        self.malloc_at(size, Location::caller())
    }

    /// Like [`malloc()`](Self::malloc) but with an explicit allocation site.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::Poisoned`] if the allocator is poisoned.
    pub fn malloc_at(&self, size: usize, site: &'static Location<'static>) -> AllocResult {
        self.ensure_healthy()?;

        if size == 0 {
            return Ok(None);
        }

        Ok(self.allocate(size, site).map(Record::payload))
    }

    /// Allocates zeroed space for `count` elements of `size` bytes each, recording the caller as
    /// the allocation site.
    ///
    /// A total size that overflows `usize` is treated as memory exhaustion.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::Poisoned`] if the allocator is poisoned.
    #[track_caller]
    #[inline]
    pub fn calloc(&self, count: usize, size: usize) -> AllocResult {
        self.calloc_at(count, size, Location::caller())
    }

    /// Like [`calloc()`](Self::calloc) but with an explicit allocation site.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation::Poisoned`] if the allocator is poisoned.
    pub fn calloc_at(
        &self,
        count: usize,
        size: usize,
        site: &'static Location<'static>,
    ) -> AllocResult {
        self.ensure_healthy()?;

        let Some(total) = count.checked_mul(size) else {
            self.report_out_of_memory(usize::MAX, site);
            return Ok(None);
        };

        if total == 0 {
            return Ok(None);
        }

        let Some(record) = self.allocate(total, site) else {
            return Ok(None);
        };

        let payload = record.payload();

        // SAFETY: The record owns `total` payload bytes.
        unsafe {
            payload.write_bytes(0, total);
        }

        Ok(Some(payload))
    }

    /// Resizes an allocation, recording the caller as the new allocation site.
    ///
    /// * If `ptr` is `None`, this is equivalent to [`malloc(size)`](Self::malloc).
    /// * If `size` is zero, the allocation is released as by [`free()`](Self::free) and
    ///   `Ok(None)` is returned.
    /// * Otherwise `ptr` is validated as by [`free()`](Self::free) and the allocation is resized,
    ///   preserving its contents up to the smaller of the two sizes. The returned pointer may
    ///   differ from `ptr`, in which case `ptr` counts as released.
    ///
    /// If memory is exhausted, [`Diagnostic::OutOfMemory`] is reported and `Ok(None)` is
    /// returned. The original allocation stays valid and tracked in that case.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractViolation`] if `ptr` fails validation and the violation policy is
    /// [`ViolationPolicy::ReturnError`], or [`ContractViolation::Poisoned`] if the allocator is
    /// poisoned.
    #[track_caller]
    #[inline]
    pub fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> AllocResult {
        self.realloc_at(ptr, size, Location::caller())
    }

    /// Like [`realloc()`](Self::realloc) but with an explicit allocation site.
    ///
    /// # Errors
    ///
    /// See [`realloc()`](Self::realloc).
    pub fn realloc_at(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        site: &'static Location<'static>,
    ) -> AllocResult {
        let Some(ptr) = ptr else {
            return self.malloc_at(size, site);
        };

        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        self.ensure_healthy()?;

        let record = self
            .registry
            .detach(ptr)
            .map_err(|violation| self.violate(violation))?;

        let old_layout = record.layout();
        let old_address = record.address();
        let old_site = record.site();

        let resized = record_layout(size).and_then(|new_layout| {
            // SAFETY: The record was allocated by our backing allocator with old_layout and we
            // hold it exclusively because it is detached from the registry. The new size is
            // non-zero because it includes the header.
            unsafe {
                self.backing
                    .resize(record.base(), old_layout, new_layout.size())
            }
        });

        let Some(base) = resized else {
            self.registry.reattach(record, None);
            self.report_out_of_memory(size, site);
            return Ok(None);
        };

        // SAFETY: The resize preserved the header, which is smaller than the new allocation.
        let record = unsafe { Record::from_base(base) };
        record.restamp(size, site);

        let moved_from = (record.address() != old_address).then_some((old_address, old_site));
        self.registry.reattach(record, moved_from);

        Ok(Some(record.payload()))
    }

    /// Validates `ptr` and releases its allocation.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractViolation`] if `ptr` fails validation and the violation policy is
    /// [`ViolationPolicy::ReturnError`], or [`ContractViolation::Poisoned`] if the allocator is
    /// poisoned. Nothing is released in either case.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), ContractViolation> {
        self.ensure_healthy()?;

        let record = self
            .registry
            .release(ptr)
            .map_err(|violation| self.violate(violation))?;

        let layout = record.layout();

        // SAFETY: The record was allocated by our backing allocator with this layout and has
        // just been retired from the registry, so nothing refers to it any more.
        unsafe {
            self.backing.release(record.base(), layout);
        }

        Ok(())
    }

    /// Checks that `ptr` is a live allocation of this allocator's registry with an intact header
    /// and guard, without changing anything.
    ///
    /// Unlike [`free()`](Self::free), a failed check is neither reported to the diagnostic sink
    /// nor subject to the violation policy.
    ///
    /// # Errors
    ///
    /// Returns the [`ContractViolation`] that `free()` would detect.
    pub fn validate(&self, ptr: NonNull<u8>) -> Result<(), ContractViolation> {
        self.registry.validate(ptr, Operation::Validate)
    }

    /// Reports every live allocation in the registry to the diagnostic sink, followed by a
    /// summary if there were any, and returns their number.
    pub fn print_leaks(&self) -> usize {
        report_leaks(&self.registry, &*self.sink)
    }

    /// Captures the live allocations in the registry without reporting them.
    #[must_use]
    pub fn leak_report(&self) -> LeakReport {
        self.registry.leak_report()
    }

    /// Whether an earlier violation poisoned the allocator.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// The registry tracking this allocator's live allocations.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry<R>> {
        &self.registry
    }

    /// The configured violation policy.
    #[must_use]
    pub fn violation_policy(&self) -> ViolationPolicy {
        self.violation_policy
    }

    fn ensure_healthy(&self) -> Result<(), ContractViolation> {
        if self.is_poisoned() {
            Err(ContractViolation::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Reports the violation and applies the violation policy.
    fn violate(&self, violation: ContractViolation) -> ContractViolation {
        self.sink.emit(&Diagnostic::Violation(violation));

        match self.violation_policy {
            ViolationPolicy::Abort => process::abort(),
            ViolationPolicy::ReturnError => {
                self.poisoned.store(true, Ordering::Release);
                violation
            }
        }
    }

    fn report_out_of_memory(&self, size: usize, site: &'static Location<'static>) {
        self.sink.emit(&Diagnostic::OutOfMemory { size, site });
    }

    /// Obtains, stamps and links a record with a payload of `size` bytes.
    fn allocate(&self, size: usize, site: &'static Location<'static>) -> Option<Record> {
        // SAFETY: Record layouts include the header, so they are never zero-sized.
        let base = record_layout(size).and_then(|layout| unsafe { self.backing.allocate(layout) });

        let Some(base) = base else {
            self.report_out_of_memory(size, site);
            return None;
        };

        // SAFETY: The allocation is fresh and was made with record_layout(size).
        let record = unsafe { Record::init(base, size, site) };
        self.registry.link(record);

        Some(record)
    }
}

impl<B: BackingAllocator, R: RawMutex + Send + Sync + 'static> DebugAllocator<B, R> {
    /// Reports leaks as by [`print_leaks()`](Self::print_leaks) when the process exits normally.
    ///
    /// The report covers the registry and uses the diagnostic sink of this allocator as they are
    /// at exit time, even if the allocator itself has been dropped by then.
    ///
    /// Returns `false` without scheduling anything if a report for the same registry and sink is
    /// already scheduled, such as when this method is called a second time.
    ///
    /// The registry and the sink are kept alive until the process exits, along with every
    /// allocation still linked into the registry at that point.
    pub fn register_atexit(&self) -> bool {
        let registry = Arc::clone(&self.registry);
        let sink = Arc::clone(&self.sink);

        // The hook keeps both alive, so their addresses identify them for the rest of the
        // process.
        let key = (
            Arc::as_ptr(&registry).addr(),
            Arc::as_ptr(&sink).cast::<()>().addr(),
        );

        atexit::at_exit(key, move || {
            report_leaks(&registry, &*sink);
        })
    }
}

fn report_leaks<R: RawMutex>(registry: &Registry<R>, sink: &dyn DiagnosticSink) -> usize {
    let report = registry.leak_report();

    for leak in report.leaks() {
        sink.emit(&Diagnostic::Leak {
            address: leak.address(),
            size: leak.size(),
            site: leak.site(),
        });
    }

    if !report.is_empty() {
        sink.emit(&Diagnostic::LeakSummary {
            count: report.count(),
            total_bytes: report.total_bytes(),
        });
    }

    report.count()
}

impl<B: BackingAllocator, R: RawMutex> fmt::Debug for DebugAllocator<B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugAllocator")
            .field("backing", &self.backing)
            .field("registry", &self.registry)
            .field("violation_policy", &self.violation_policy)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::{mem, slice, thread};

    use mockall::predicate::eq;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::backing::LimitedBacking;

    assert_impl_all!(DebugAllocator: fmt::Debug);
    assert_not_impl_any!(DebugAllocator: Send, Sync);
    assert_impl_all!(DebugAllocator<SystemBacking, parking_lot::RawMutex>: Send, Sync);

    /// Keeps every diagnostic for later inspection.
    #[derive(Debug, Default)]
    struct Recorder {
        diagnostics: Mutex<Vec<Diagnostic>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Diagnostic> {
            mem::take(&mut *self.diagnostics.lock().unwrap())
        }
    }

    impl DiagnosticSink for Recorder {
        fn emit(&self, diagnostic: &Diagnostic) {
            self.diagnostics.lock().unwrap().push(*diagnostic);
        }
    }

    fn recording() -> (DebugAllocator, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());

        let debug = DebugAllocator::builder()
            .sink(Arc::clone(&recorder))
            .violation_policy(ViolationPolicy::ReturnError)
            .build();

        (debug, recorder)
    }

    /// Blocks given up by a resize, waiting to be handed out again.
    #[derive(Default)]
    struct Parked(RefCell<Vec<(NonNull<u8>, Layout)>>);

    impl Drop for Parked {
        fn drop(&mut self) {
            for (ptr, layout) in self.0.get_mut().drain(..) {
                unsafe { System.dealloc(ptr.as_ptr(), layout) };
            }
        }
    }

    /// Always moves resized blocks and hands the old block to the next allocation of the same
    /// layout, from this backing or any backing sharing its parked blocks. Runs a hook after the
    /// move, before `resize()` returns.
    #[derive(Default)]
    struct RecyclingBacking {
        parked: Rc<Parked>,
        during_resize: RefCell<Option<Box<dyn FnOnce()>>>,
    }

    impl RecyclingBacking {
        fn sharing(&self) -> Self {
            Self {
                parked: Rc::clone(&self.parked),
                during_resize: RefCell::default(),
            }
        }
    }

    impl fmt::Debug for RecyclingBacking {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecyclingBacking").finish_non_exhaustive()
        }
    }

    unsafe impl BackingAllocator for RecyclingBacking {
        unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            let mut parked = self.parked.0.borrow_mut();

            if let Some(index) = parked.iter().position(|&(_, l)| l == layout) {
                return Some(parked.swap_remove(index).0);
            }

            NonNull::new(unsafe { System.alloc(layout) })
        }

        unsafe fn resize(
            &self,
            ptr: NonNull<u8>,
            layout: Layout,
            new_size: usize,
        ) -> Option<NonNull<u8>> {
            let new_layout = Layout::from_size_align(new_size, layout.align()).ok()?;
            let moved = NonNull::new(unsafe { System.alloc(new_layout) })?;

            unsafe { moved.copy_from_nonoverlapping(ptr, layout.size().min(new_size)) };
            self.parked.0.borrow_mut().push((ptr, layout));

            let hook = self.during_resize.borrow_mut().take();
            if let Some(hook) = hook {
                hook();
            }

            Some(moved)
        }

        unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
            unsafe { System.dealloc(ptr.as_ptr(), layout) };
        }
    }

    fn limited() -> (DebugAllocator<LimitedBacking>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());

        let debug = DebugAllocator::builder()
            .backing(LimitedBacking::default())
            .sink(Arc::clone(&recorder))
            .violation_policy(ViolationPolicy::ReturnError)
            .build();

        (debug, recorder)
    }

    #[test]
    fn malloc_then_free_leaves_no_records() {
        let (debug, recorder) = recording();

        let ptr = debug.malloc(64).unwrap().unwrap();
        assert_eq!(debug.registry().len(), 1);
        assert_eq!(ptr.as_ptr().align_offset(crate::MAX_ALIGN), 0);

        debug.free(ptr).unwrap();

        assert!(debug.registry().is_empty());
        assert_eq!(debug.print_leaks(), 0);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn zero_size_allocates_nothing() {
        let (debug, _) = recording();

        assert_eq!(debug.malloc(0).unwrap(), None);
        assert_eq!(debug.calloc(0, 8).unwrap(), None);
        assert_eq!(debug.calloc(8, 0).unwrap(), None);
        assert!(debug.registry().is_empty());
    }

    #[test]
    fn leaks_are_counted_and_summed() {
        let (debug, recorder) = recording();

        for size in [10, 20, 30] {
            _ = debug.malloc(size).unwrap().unwrap();
        }

        assert_eq!(debug.print_leaks(), 3);

        let diagnostics = recorder.take();
        assert_eq!(diagnostics.len(), 4);

        let sizes: Vec<usize> = diagnostics[..3]
            .iter()
            .map(|d| match d {
                Diagnostic::Leak { size, .. } => *size,
                other => panic!("expected a leak, got {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![30, 20, 10]);

        assert_eq!(
            diagnostics[3],
            Diagnostic::LeakSummary {
                count: 3,
                total_bytes: 60
            }
        );
    }

    #[test]
    fn leak_records_caller_location() {
        let (debug, _) = recording();

        let line = line!() + 1;
        let ptr = debug.malloc(8).unwrap().unwrap();

        let report = debug.leak_report();
        let site = report.leaks()[0].site();
        assert_eq!(site.file(), file!());
        assert_eq!(site.line(), line);

        debug.free(ptr).unwrap();
    }

    #[test]
    fn explicit_site_is_recorded() {
        let (debug, _) = recording();
        let site = Location::caller();

        let ptr = debug.malloc_at(8, site).unwrap().unwrap();
        assert_eq!(debug.leak_report().leaks()[0].site(), site);

        debug.free(ptr).unwrap();
    }

    #[test]
    fn overrun_fails_validation() {
        let (debug, recorder) = recording();

        let ptr = debug.malloc(64).unwrap().unwrap();
        unsafe { ptr.add(64).write(b'x') };

        let violation = debug.validate(ptr).unwrap_err();
        assert!(matches!(
            violation,
            ContractViolation::BufferOverflow { size: 64, .. }
        ));

        // Validation alone neither reports nor poisons.
        assert!(recorder.take().is_empty());
        assert!(!debug.is_poisoned());
    }

    #[test]
    fn overrun_detected_on_free() {
        let (debug, recorder) = recording();

        let ptr = debug.malloc(16).unwrap().unwrap();
        unsafe { ptr.add(17).write(0) };

        let violation = debug.free(ptr).unwrap_err();
        assert!(matches!(violation, ContractViolation::BufferOverflow { .. }));
        assert_eq!(recorder.take(), vec![Diagnostic::Violation(violation)]);

        // Nothing was released.
        assert_eq!(debug.registry().len(), 1);
    }

    #[test]
    fn double_free_and_invalid_free_are_distinct() {
        let (first, _) = recording();
        let ptr = first.malloc(8).unwrap().unwrap();
        first.free(ptr).unwrap();

        let double = first.free(ptr).unwrap_err();
        assert!(matches!(
            double,
            ContractViolation::AlreadyFreed {
                operation: Operation::Free,
                ..
            }
        ));

        let (second, _) = recording();
        let mut local = 0_u64;
        let invalid = second.free(NonNull::from(&mut local).cast()).unwrap_err();
        assert!(matches!(invalid, ContractViolation::Untracked { .. }));
    }

    #[test]
    fn violation_poisons_allocator() {
        let (debug, _) = recording();
        let mut local = 0_u64;

        _ = debug.free(NonNull::from(&mut local).cast()).unwrap_err();

        assert!(debug.is_poisoned());
        assert_eq!(debug.malloc(8), Err(ContractViolation::Poisoned));
        assert_eq!(debug.calloc(1, 8), Err(ContractViolation::Poisoned));
        assert_eq!(debug.realloc(None, 8), Err(ContractViolation::Poisoned));
    }

    #[test]
    fn calloc_zero_fills() {
        let (debug, _) = recording();

        // Leave some garbage behind for the allocator to potentially reuse.
        let dirty = debug.malloc(256).unwrap().unwrap();
        unsafe { dirty.write_bytes(0xAA, 256) };
        debug.free(dirty).unwrap();

        let ptr = debug.calloc(32, 8).unwrap().unwrap();
        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert_eq!(debug.leak_report().total_bytes(), 256);
        debug.free(ptr).unwrap();
    }

    #[test]
    fn calloc_overflow_is_out_of_memory() {
        let (debug, recorder) = recording();

        assert_eq!(debug.calloc(usize::MAX, 2).unwrap(), None);
        assert!(matches!(
            recorder.take()[..],
            [Diagnostic::OutOfMemory { .. }]
        ));
        assert!(!debug.is_poisoned());
    }

    #[test]
    fn realloc_without_pointer_allocates() {
        let (debug, _) = recording();

        let ptr = debug.realloc(None, 12).unwrap().unwrap();
        assert_eq!(debug.leak_report().total_bytes(), 12);

        debug.free(ptr).unwrap();
    }

    #[test]
    fn realloc_to_zero_frees() {
        let (debug, _) = recording();

        let ptr = debug.malloc(12).unwrap().unwrap();
        assert_eq!(debug.realloc(Some(ptr), 0).unwrap(), None);

        assert!(debug.registry().is_empty());
        assert!(matches!(
            debug.validate(ptr),
            Err(ContractViolation::AlreadyFreed { .. })
        ));
    }

    #[test]
    fn realloc_preserves_contents_and_restamps() {
        let (debug, _) = recording();

        let ptr = debug.malloc(8).unwrap().unwrap();
        unsafe { ptr.as_ptr().copy_from_nonoverlapping(b"abcdefgh".as_ptr(), 8) };

        let grown = debug.realloc(Some(ptr), 4096).unwrap().unwrap();

        let bytes = unsafe { slice::from_raw_parts(grown.as_ptr(), 8) };
        assert_eq!(bytes, b"abcdefgh");

        let report = debug.leak_report();
        assert_eq!(report.count(), 1);
        assert_eq!(report.total_bytes(), 4096);
        debug.validate(grown).unwrap();

        if grown != ptr {
            assert!(matches!(
                debug.validate(ptr),
                Err(ContractViolation::AlreadyFreed { .. })
            ));
        }

        let shrunk = debug.realloc(Some(grown), 4).unwrap().unwrap();
        debug.validate(shrunk).unwrap();
        assert_eq!(debug.leak_report().total_bytes(), 4);

        debug.free(shrunk).unwrap();
    }

    #[test]
    fn realloc_failure_keeps_original() {
        let (debug, recorder) = limited();

        let ptr = debug.malloc(32).unwrap().unwrap();
        unsafe { ptr.write_bytes(0x42, 32) };

        debug.backing.fail_after(0);

        assert_eq!(debug.realloc(Some(ptr), 1 << 20).unwrap(), None);
        assert!(matches!(
            recorder.take()[..],
            [Diagnostic::OutOfMemory { size: 1_048_576, .. }]
        ));

        debug.validate(ptr).unwrap();
        let report = debug.leak_report();
        assert_eq!(report.count(), 1);
        assert_eq!(report.total_bytes(), 32);
        assert_eq!(unsafe { ptr.add(31).read() }, 0x42);

        debug.free(ptr).unwrap();
        assert_eq!(debug.backing.outstanding(), 0);
    }

    #[test]
    fn realloc_of_released_pointer_is_double_free() {
        let (debug, _) = recording();

        let ptr = debug.malloc(8).unwrap().unwrap();
        debug.free(ptr).unwrap();

        assert!(matches!(
            debug.realloc(Some(ptr), 16),
            Err(ContractViolation::AlreadyFreed {
                operation: Operation::Realloc,
                ..
            })
        ));
    }

    #[test]
    fn exhaustion_reports_out_of_memory_at_call_site() {
        let expected_line = Arc::new(AtomicU32::new(0));
        let mut sink = MockDiagnosticSink::new();

        let line = Arc::clone(&expected_line);
        sink.expect_emit()
            .withf(move |d| {
                matches!(
                    d,
                    Diagnostic::OutOfMemory { size: 100, site }
                        if site.line() == line.load(Ordering::Relaxed) && site.file() == file!()
                )
            })
            .times(1)
            .return_const(());

        let debug = DebugAllocator::builder()
            .backing(LimitedBacking::default())
            .sink(sink)
            .build();
        debug.backing.fail_after(0);

        expected_line.store(line!() + 1, Ordering::Relaxed);
        assert_eq!(debug.malloc(100).unwrap(), None);

        assert!(debug.registry().is_empty());
        assert!(!debug.is_poisoned());
    }

    #[test]
    fn print_leaks_reports_each_leak_then_summary() {
        let mut sink = MockDiagnosticSink::new();
        let mut sequence = mockall::Sequence::new();

        sink.expect_emit()
            .withf(|d| matches!(d, Diagnostic::Leak { size: 5, .. }))
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(());
        sink.expect_emit()
            .with(eq(Diagnostic::LeakSummary {
                count: 1,
                total_bytes: 5,
            }))
            .times(1)
            .in_sequence(&mut sequence)
            .return_const(());

        let debug = DebugAllocator::builder().sink(sink).build();
        _ = debug.malloc(5).unwrap().unwrap();

        assert_eq!(debug.print_leaks(), 1);
    }

    #[test]
    fn shared_registry_collects_from_all_threads() {
        let debug = Arc::new(
            DebugAllocator::builder()
                .synchronized()
                .violation_policy(ViolationPolicy::ReturnError)
                .build(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let debug = Arc::clone(&debug);
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for size in 1..=50 {
                        let ptr = debug.malloc(size).unwrap().unwrap();
                        if size % 2 == 0 {
                            debug.free(ptr).unwrap();
                        } else {
                            kept.push(ptr.as_ptr().addr());
                        }
                    }
                    kept
                })
            })
            .collect();

        let mut kept = 0;
        for handle in handles {
            kept += handle.join().unwrap().len();
        }

        assert_eq!(debug.registry().len(), kept);
        assert_eq!(debug.leak_report().total_bytes(), 4 * (1..=50).step_by(2).sum::<usize>());
    }

    #[test]
    fn realloc_keeps_old_address_live_when_reused_during_resize() {
        let registry = Arc::new(Registry::<NoLock>::new());
        let backing = RecyclingBacking::default();

        let other = Rc::new(
            DebugAllocator::builder()
                .backing(backing.sharing())
                .registry(Arc::clone(&registry))
                .violation_policy(ViolationPolicy::ReturnError)
                .build(),
        );

        let reused = Rc::new(Cell::new(None));
        {
            let other = Rc::clone(&other);
            let reused = Rc::clone(&reused);

            *backing.during_resize.borrow_mut() = Some(Box::new(move || {
                reused.set(other.malloc(16).unwrap());
            }));
        }

        let debug = DebugAllocator::builder()
            .backing(backing)
            .registry(Arc::clone(&registry))
            .violation_policy(ViolationPolicy::ReturnError)
            .build();

        let old = debug.malloc(16).unwrap().unwrap();
        let moved = debug.realloc(Some(old), 64).unwrap().unwrap();

        // The other allocator received the old block while the resize was in progress.
        assert_ne!(moved, old);
        assert_eq!(reused.get(), Some(old));
        assert_eq!(registry.len(), 2);

        other.free(old).unwrap();
        debug.free(moved).unwrap();

        assert!(registry.is_empty());
        assert!(!other.is_poisoned());
    }

    #[test]
    fn register_atexit_accepts_synchronized_allocator() {
        let debug = DebugAllocator::builder().synchronized().build();

        // Nothing is live at exit, so the report is empty.
        assert!(debug.register_atexit());
    }

    #[test]
    fn register_atexit_schedules_each_registry_and_sink_once() {
        let registry = Arc::new(Registry::<parking_lot::RawMutex>::new());

        let first = DebugAllocator::builder()
            .registry(Arc::clone(&registry))
            .build();

        assert!(first.register_atexit());
        assert!(!first.register_atexit());

        // Another allocator on the same registry reports through its own sink.
        let second = DebugAllocator::builder()
            .registry(Arc::clone(&registry))
            .build();

        assert!(second.register_atexit());
        assert!(!second.register_atexit());
    }
}
