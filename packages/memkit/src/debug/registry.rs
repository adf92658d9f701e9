use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;

use foldhash::{HashMap, HashMapExt};
use parking_lot::lock_api::{GuardNoSend, Mutex, RawMutex};

use crate::debug::record::{MAGIC_ALIVE, Record};
use crate::{ContractViolation, DEFAULT_TOMBSTONE_CAPACITY, Operation};

/// The set of live allocations of one or more [`DebugAllocator`][crate::DebugAllocator]s.
///
/// Live allocations are kept in a list, newest first, threaded through the bookkeeping headers
/// of the allocations themselves. Next to the list, the registry remembers every address it has
/// handed out, including released ones together with their original allocation site. This lets
/// the debug allocator tell a double free apart from a pointer it never handed out without
/// reading released memory.
///
/// At most a fixed number of released addresses are remembered
/// ([`DEFAULT_TOMBSTONE_CAPACITY`] unless set with
/// [`with_tombstone_capacity()`](Self::with_tombstone_capacity)). The oldest ones are forgotten
/// first, and an address is also forgotten when the backing allocator hands it out again. A
/// double free of a forgotten address is reported as [`ContractViolation::Untracked`] instead
/// of [`ContractViolation::AlreadyFreed`].
///
/// All access to the registry happens under a lock of type `R`:
///
/// * [`NoLock`] (the default) performs no synchronization. The registry can be moved between
///   threads but not shared between them, and reentrant use is detected and reported as a panic.
/// * [`parking_lot::RawMutex`] provides real mutual exclusion, allowing the registry and the
///   allocators using it to be shared between threads.
///
/// # Examples
///
/// Sharing one registry between two allocators:
///
/// ```
/// use std::sync::Arc;
///
/// use memkit::{DebugAllocator, Registry};
///
/// let registry = Arc::new(Registry::<parking_lot::RawMutex>::new());
///
/// let first = DebugAllocator::builder().registry(Arc::clone(&registry)).build();
/// let second = DebugAllocator::builder().registry(Arc::clone(&registry)).build();
///
/// let a = first.malloc(16).unwrap().unwrap();
/// let b = second.malloc(32).unwrap().unwrap();
///
/// assert_eq!(registry.len(), 2);
/// assert_eq!(registry.leak_report().total_bytes(), 48);
/// # first.free(a).unwrap();
/// # second.free(b).unwrap();
/// ```
pub struct Registry<R: RawMutex = NoLock> {
    state: Mutex<R, RegistryState>,
}

#[derive(Debug)]
struct RegistryState {
    /// Newest live record.
    head: Option<Record>,

    /// Number of live records.
    len: usize,

    /// Payload address of every live record and of recently released ones.
    addresses: HashMap<usize, AddressState>,

    /// Released addresses with their tombstone sequence number, oldest first. Entries whose
    /// address has since been reused are skipped on eviction.
    released: VecDeque<(usize, u64)>,

    /// Sequence number of the next tombstone.
    next_sequence: u64,

    tombstone_capacity: usize,
}

// SAFETY: The records are raw handles to allocations owned by the debug allocators using this
// registry. Their headers are only touched while the registry lock is held (or before a record
// is published), so the state can move between threads with the lock that guards it.
unsafe impl Send for RegistryState {}

#[derive(Clone, Copy, Debug)]
enum AddressState {
    Live,

    Released {
        /// Where the released allocation was made.
        site: &'static Location<'static>,

        /// Matches the entry in the eviction queue that belongs to this tombstone.
        sequence: u64,
    },
}

impl<R: RawMutex> Registry<R> {
    /// Creates an empty registry that remembers up to [`DEFAULT_TOMBSTONE_CAPACITY`] released
    /// addresses.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tombstone_capacity(DEFAULT_TOMBSTONE_CAPACITY)
    }

    /// Creates an empty registry that remembers up to `capacity` released addresses for double
    /// free detection. With a capacity of zero every double free is reported as
    /// [`ContractViolation::Untracked`].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use memkit::{ContractViolation, DebugAllocator, NoLock, Registry, ViolationPolicy};
    ///
    /// let registry = Arc::new(Registry::<NoLock>::with_tombstone_capacity(1));
    /// let debug = DebugAllocator::builder()
    ///     .registry(registry)
    ///     .violation_policy(ViolationPolicy::ReturnError)
    ///     .build();
    ///
    /// let first = debug.malloc(8).unwrap().unwrap();
    /// let second = debug.malloc(8).unwrap().unwrap();
    /// debug.free(first).unwrap();
    /// debug.free(second).unwrap();
    ///
    /// // Only the most recent release is still remembered.
    /// assert!(matches!(
    ///     debug.validate(second),
    ///     Err(ContractViolation::AlreadyFreed { .. })
    /// ));
    /// assert!(matches!(
    ///     debug.validate(first),
    ///     Err(ContractViolation::Untracked { .. })
    /// ));
    /// ```
    #[must_use]
    pub fn with_tombstone_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                head: None,
                len: 0,
                addresses: HashMap::new(),
                released: VecDeque::new(),
                next_sequence: 0,
                tombstone_capacity: capacity,
            }),
        }
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Whether there are no live allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Captures every live allocation, newest first, in a single pass under the lock.
    #[must_use]
    pub fn leak_report(&self) -> LeakReport {
        let state = self.state.lock();

        let mut leaks = Vec::with_capacity(state.len);
        let mut total_bytes: usize = 0;
        let mut cursor = state.head;

        while let Some(record) = cursor {
            leaks.push(LeakRecord {
                address: record.address(),
                size: record.size(),
                site: record.site(),
            });

            total_bytes = total_bytes.saturating_add(record.size());
            cursor = record.next();
        }

        LeakReport { total_bytes, leaks }
    }

    /// Publishes a freshly initialized record as live.
    pub(crate) fn link(&self, record: Record) {
        let mut state = self.state.lock();
        state.link(record);
    }

    /// Checks that `ptr` is the payload of a live, intact record without changing anything.
    pub(crate) fn validate(
        &self,
        ptr: NonNull<u8>,
        operation: Operation,
    ) -> Result<(), ContractViolation> {
        let state = self.state.lock();
        state.check(ptr, operation).map(|_| ())
    }

    /// Validates `ptr` and retires its record: the header is tagged as freed, the record is
    /// unlinked and the address is remembered as released.
    ///
    /// The caller is responsible for returning the memory to the backing allocator.
    pub(crate) fn release(&self, ptr: NonNull<u8>) -> Result<Record, ContractViolation> {
        let mut state = self.state.lock();

        let record = state.check(ptr, Operation::Free)?;
        record.mark_freed();
        state.unlink(record);
        state.tombstone(record.address(), record.site());

        Ok(record)
    }

    /// Validates `ptr` and unlinks its record so the allocation can be resized. The address is
    /// forgotten until [`reattach()`](Self::reattach) publishes the record again.
    pub(crate) fn detach(&self, ptr: NonNull<u8>) -> Result<Record, ContractViolation> {
        let mut state = self.state.lock();

        let record = state.check(ptr, Operation::Realloc)?;
        state.unlink(record);
        state.addresses.remove(&record.address());

        Ok(record)
    }

    /// Publishes a record after a resize attempt. If the allocation moved, the old payload
    /// address is remembered as released, attributed to `old_site`, unless the address was
    /// handed out again while the record was detached.
    pub(crate) fn reattach(
        &self,
        record: Record,
        moved_from: Option<(usize, &'static Location<'static>)>,
    ) {
        let mut state = self.state.lock();

        let stale = moved_from.filter(|&(address, _)| !state.addresses.contains_key(&address));

        if let Some((address, site)) = stale {
            state.tombstone(address, site);
        }

        state.link(record);
    }
}

impl RegistryState {
    fn check(&self, ptr: NonNull<u8>, operation: Operation) -> Result<Record, ContractViolation> {
        let address = ptr.as_ptr().addr();

        match self.addresses.get(&address) {
            None => Err(ContractViolation::Untracked { address, operation }),
            Some(&AddressState::Released { site, .. }) => Err(ContractViolation::AlreadyFreed {
                address,
                site,
                operation,
            }),
            Some(AddressState::Live) => {
                // SAFETY: Live addresses are payloads of linked records, which are only unlinked
                // (and then released) under the lock we are holding.
                let record = unsafe { Record::from_payload(ptr) };

                let magic = record.magic();
                if magic != MAGIC_ALIVE {
                    return Err(ContractViolation::CorruptedHeader { address, magic });
                }

                if !record.guard_intact() {
                    return Err(ContractViolation::BufferOverflow {
                        address,
                        size: record.size(),
                        site: record.site(),
                    });
                }

                Ok(record)
            }
        }
    }

    fn link(&mut self, record: Record) {
        record.set_prev(None);
        record.set_next(self.head);

        if let Some(head) = self.head {
            head.set_prev(Some(record));
        }

        self.head = Some(record);

        // Cannot overflow because every record occupies at least one byte of memory.
        self.len = self.len.wrapping_add(1);

        self.addresses.insert(record.address(), AddressState::Live);
    }

    /// Remembers `address` as released, forgetting the oldest tombstones beyond capacity.
    fn tombstone(&mut self, address: usize, site: &'static Location<'static>) {
        if self.tombstone_capacity == 0 {
            self.addresses.remove(&address);
            return;
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.addresses
            .insert(address, AddressState::Released { site, sequence });
        self.released.push_back((address, sequence));

        while self.released.len() > self.tombstone_capacity {
            let Some((evicted, evicted_sequence)) = self.released.pop_front() else {
                break;
            };

            let still_current = matches!(
                self.addresses.get(&evicted),
                Some(&AddressState::Released { sequence, .. }) if sequence == evicted_sequence
            );

            if still_current {
                self.addresses.remove(&evicted);
            }
        }
    }

    fn unlink(&mut self, record: Record) {
        let prev = record.prev();
        let next = record.next();

        match prev {
            Some(prev) => prev.set_next(next),
            None => self.head = next,
        }

        if let Some(next) = next {
            next.set_prev(prev);
        }

        record.set_prev(None);
        record.set_next(None);

        // Cannot underflow because the record was linked, so it was counted.
        self.len = self.len.wrapping_sub(1);
    }
}

impl<R: RawMutex> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex> fmt::Debug for Registry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Registry");

        match self.state.try_lock() {
            Some(state) => debug.field("len", &state.len),
            None => debug.field("len", &"<locked>"),
        };

        debug.finish()
    }
}

/// The live allocations of a [`Registry`] at one point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeakReport {
    total_bytes: usize,
    leaks: Vec<LeakRecord>,
}

impl LeakReport {
    /// Number of live allocations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.leaks.len()
    }

    /// Sum of the requested sizes of all live allocations.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Whether there were no live allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// The live allocations, newest first.
    #[must_use]
    pub fn leaks(&self) -> &[LeakRecord] {
        &self.leaks
    }
}

/// One live allocation in a [`LeakReport`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeakRecord {
    address: usize,
    size: usize,
    site: &'static Location<'static>,
}

impl LeakRecord {
    /// Address of the payload.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Size of the payload in bytes, as requested by the caller.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Where the allocation was made.
    #[must_use]
    pub fn site(&self) -> &'static Location<'static> {
        self.site
    }
}

/// A registry lock that performs no synchronization.
///
/// A registry using this lock is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]), so the
/// type system rules out concurrent access. Attempting to lock it while it is already locked
/// (which can only happen through reentrancy) panics.
#[derive(Debug)]
pub struct NoLock {
    held: Cell<bool>,
}

// SAFETY: Mutual exclusion is provided by the type system: NoLock is not Sync, so it can only be
// used from one thread at a time, and reentrant locking panics instead of granting a second lock.
unsafe impl RawMutex for NoLock {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "the lock_api contract requires a constant initializer"
    )]
    const INIT: Self = Self {
        held: Cell::new(false),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        assert!(
            !self.held.replace(true),
            "debug allocator registry was locked reentrantly"
        );
    }

    fn try_lock(&self) -> bool {
        !self.held.replace(true)
    }

    unsafe fn unlock(&self) {
        self.held.set(false);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::{GlobalAlloc, Layout, System};

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::debug::record::{MAGIC_FREED, record_layout};

    assert_impl_all!(Registry: Send, fmt::Debug, Default);
    assert_not_impl_any!(Registry: Sync);
    assert_impl_all!(Registry<parking_lot::RawMutex>: Send, Sync);
    assert_impl_all!(LeakReport: Send, Sync, Clone);

    /// Allocates records from the system allocator and releases them when dropped.
    struct Records {
        allocations: Vec<(NonNull<u8>, Layout)>,
    }

    impl Records {
        fn new() -> Self {
            Self {
                allocations: Vec::new(),
            }
        }

        fn create(&mut self, size: usize) -> Record {
            let layout = record_layout(size).unwrap();
            let base = NonNull::new(unsafe { System.alloc(layout) }).unwrap();
            self.allocations.push((base, layout));

            unsafe { Record::init(base, size, Location::caller()) }
        }
    }

    impl Drop for Records {
        fn drop(&mut self) {
            for (base, layout) in self.allocations.drain(..) {
                unsafe { System.dealloc(base.as_ptr(), layout) };
            }
        }
    }

    #[test]
    fn new_registry_is_empty() {
        let registry = Registry::<NoLock>::new();

        assert!(registry.is_empty());
        assert!(registry.leak_report().is_empty());
    }

    #[test]
    fn report_lists_newest_first() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let a = records.create(10);
        let b = records.create(20);
        let c = records.create(30);
        registry.link(a);
        registry.link(b);
        registry.link(c);

        let report = registry.leak_report();
        assert_eq!(report.count(), 3);
        assert_eq!(report.total_bytes(), 60);

        let sizes: Vec<usize> = report.leaks().iter().map(LeakRecord::size).collect();
        assert_eq!(sizes, vec![30, 20, 10]);
        assert_eq!(report.leaks()[0].address(), c.address());
    }

    #[test]
    fn release_unlinks_from_any_position() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let a = records.create(1);
        let b = records.create(2);
        let c = records.create(3);
        registry.link(a);
        registry.link(b);
        registry.link(c);

        // Middle, then tail, then head.
        registry.release(b.payload()).unwrap();
        assert_eq!(registry.len(), 2);
        registry.release(a.payload()).unwrap();
        assert_eq!(registry.leak_report().leaks()[0].size(), 3);
        registry.release(c.payload()).unwrap();

        assert!(registry.is_empty());
        assert_eq!(a.magic(), MAGIC_FREED);
    }

    #[test]
    fn released_address_is_double_free() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let a = records.create(8);
        registry.link(a);
        registry.release(a.payload()).unwrap();

        let violation = registry.release(a.payload()).unwrap_err();
        assert!(matches!(
            violation,
            ContractViolation::AlreadyFreed {
                operation: Operation::Free,
                ..
            }
        ));
    }

    #[test]
    fn unknown_address_is_untracked() {
        let registry = Registry::<NoLock>::new();
        let mut local = 0_u64;

        let violation = registry
            .validate(NonNull::from(&mut local).cast(), Operation::Validate)
            .unwrap_err();

        assert!(matches!(
            violation,
            ContractViolation::Untracked {
                operation: Operation::Validate,
                ..
            }
        ));
    }

    #[test]
    fn damaged_guard_is_buffer_overflow() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let a = records.create(16);
        registry.link(a);

        unsafe { a.payload().add(16).write(0) };

        let violation = registry.validate(a.payload(), Operation::Validate).unwrap_err();
        assert!(matches!(
            violation,
            ContractViolation::BufferOverflow { size: 16, .. }
        ));

        // Validation does not change anything.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn damaged_tag_is_corrupted_header() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let a = records.create(16);
        registry.link(a);
        a.mark_freed();

        let violation = registry.validate(a.payload(), Operation::Validate).unwrap_err();
        assert_eq!(
            violation,
            ContractViolation::CorruptedHeader {
                address: a.address(),
                magic: MAGIC_FREED,
            }
        );
    }

    #[test]
    fn detach_and_reattach_at_new_address() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let old = records.create(8);
        registry.link(old);

        let detached = registry.detach(old.payload()).unwrap();
        assert!(registry.is_empty());

        let moved = records.create(64);
        registry.reattach(moved, Some((detached.address(), detached.site())));

        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.validate(old.payload(), Operation::Free),
            Err(ContractViolation::AlreadyFreed { .. })
        ));
        registry.validate(moved.payload(), Operation::Free).unwrap();
    }

    #[test]
    fn address_reuse_clears_tombstone() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let a = records.create(8);
        registry.link(a);
        registry.release(a.payload()).unwrap();

        // The backing allocator handed out the same address again.
        a.restamp(8, Location::caller());
        registry.link(a);

        registry.validate(a.payload(), Operation::Free).unwrap();
    }

    #[test]
    fn reattach_keeps_address_reused_while_detached() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let old = records.create(8);
        registry.link(old);

        let detached = registry.detach(old.payload()).unwrap();
        let old_site = detached.site();

        // While the record is detached the resize releases the old block and another caller
        // receives the same address from the backing allocator.
        let reused = old;
        reused.restamp(8, Location::caller());
        registry.link(reused);

        let moved = records.create(64);
        registry.reattach(moved, Some((detached.address(), old_site)));

        assert_eq!(registry.len(), 2);
        registry.validate(reused.payload(), Operation::Free).unwrap();
        registry.release(reused.payload()).unwrap();
        registry.release(moved.payload()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn reattach_keeps_newer_tombstone() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        let old = records.create(8);
        registry.link(old);
        let detached = registry.detach(old.payload()).unwrap();

        // The address was reused and released again before the resize finished.
        let reused = old;
        reused.restamp(8, Location::caller());
        registry.link(reused);
        registry.release(reused.payload()).unwrap();

        let moved = records.create(64);
        registry.reattach(moved, Some((detached.address(), detached.site())));

        let violation = registry.validate(old.payload(), Operation::Free).unwrap_err();
        let ContractViolation::AlreadyFreed { site, .. } = violation else {
            panic!("expected a double free, got {violation:?}");
        };
        assert_eq!(site, reused.site());
    }

    #[test]
    fn oldest_tombstones_are_forgotten_beyond_capacity() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::with_tombstone_capacity(4);

        let all: Vec<Record> = (0..10).map(|_| records.create(8)).collect();

        for record in &all {
            registry.link(*record);
        }

        for record in &all {
            registry.release(record.payload()).unwrap();
        }

        assert_eq!(registry.state.lock().addresses.len(), 4);

        for record in &all[..6] {
            assert!(matches!(
                registry.validate(record.payload(), Operation::Free),
                Err(ContractViolation::Untracked { .. })
            ));
        }

        for record in &all[6..] {
            assert!(matches!(
                registry.validate(record.payload(), Operation::Free),
                Err(ContractViolation::AlreadyFreed { .. })
            ));
        }
    }

    #[test]
    fn address_index_stays_bounded_over_many_releases() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::new();

        for _ in 0..DEFAULT_TOMBSTONE_CAPACITY * 2 + 100 {
            let record = records.create(1);
            registry.link(record);
            registry.release(record.payload()).unwrap();
        }

        assert!(registry.is_empty());
        assert!(registry.state.lock().addresses.len() <= DEFAULT_TOMBSTONE_CAPACITY);
    }

    #[test]
    fn zero_tombstone_capacity_reports_untracked() {
        let mut records = Records::new();
        let registry = Registry::<NoLock>::with_tombstone_capacity(0);

        let a = records.create(8);
        registry.link(a);
        registry.release(a.payload()).unwrap();

        assert!(matches!(
            registry.validate(a.payload(), Operation::Free),
            Err(ContractViolation::Untracked { .. })
        ));
        assert!(registry.state.lock().addresses.is_empty());
    }

    #[test]
    fn no_lock_try_lock_fails_while_held() {
        let lock = NoLock::INIT;

        assert!(lock.try_lock());
        assert!(!lock.try_lock());

        unsafe { lock.unlock() };
        assert!(lock.try_lock());
    }

    #[test]
    #[should_panic]
    fn no_lock_detects_reentrancy() {
        let lock = NoLock::INIT;

        lock.lock();
        lock.lock();
    }

    #[test]
    fn debug_output_does_not_block_while_locked() {
        let registry = Registry::<NoLock>::new();
        let _guard = registry.state.lock();

        assert!(format!("{registry:?}").contains("<locked>"));
    }
}
