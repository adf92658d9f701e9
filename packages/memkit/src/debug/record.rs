use std::alloc::Layout;
use std::mem;
use std::panic::Location;
use std::ptr::NonNull;

use crate::{GUARD_BYTE, GUARD_SIZE, MAX_ALIGN};

pub(crate) const MAGIC_ALIVE: u32 = 0x1122_3344;
pub(crate) const MAGIC_FREED: u32 = 0xDEAD_DEAD;

/// Bookkeeping stored in front of every debug allocation payload.
#[derive(Debug)]
#[repr(C)]
struct Header {
    /// Newer neighbor in the registry list.
    prev: Option<Record>,

    /// Older neighbor in the registry list.
    next: Option<Record>,

    site: &'static Location<'static>,

    /// Payload size requested by the caller.
    size: usize,

    magic: u32,
}

/// Distance from the start of a record allocation to its payload. Keeps payloads aligned to
/// `MAX_ALIGN`.
pub(crate) const PAYLOAD_OFFSET: usize = mem::size_of::<Header>().next_multiple_of(MAX_ALIGN);

const _: () = assert!(MAX_ALIGN >= mem::align_of::<Header>());

/// Layout of a record allocation holding a payload of `size` bytes: header, payload, guard.
///
/// Returns `None` if the size calculation overflows.
pub(crate) fn record_layout(size: usize) -> Option<Layout> {
    let total = PAYLOAD_OFFSET.checked_add(size)?.checked_add(GUARD_SIZE)?;
    Layout::from_size_align(total, MAX_ALIGN).ok()
}

/// Handle to one debug allocation: header, payload and guard in a single backing allocation.
///
/// A `Record` is only constructed for an allocation whose header has been initialized and it
/// must not be used after the allocation is released back to the backing allocator. Every
/// method relies on this.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Record(NonNull<Header>);

impl Record {
    /// Stamps a new header into `base`, writes the guard after the payload and returns the record.
    ///
    /// # Safety
    ///
    /// `base` must point to a live allocation made with `record_layout(size)`, not referenced
    /// by any other record.
    pub(crate) unsafe fn init(
        base: NonNull<u8>,
        size: usize,
        site: &'static Location<'static>,
    ) -> Self {
        let header = base.cast::<Header>();

        // SAFETY: The allocation is large enough and aligned for a header, per record_layout().
        unsafe {
            header.write(Header {
                prev: None,
                next: None,
                site,
                size,
                magic: MAGIC_ALIVE,
            });
        }

        let record = Self(header);
        record.write_guard();
        record
    }

    /// Recovers the record that owns `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`payload()`](Self::payload) of a record whose
    /// allocation is still live.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // SAFETY: The payload sits PAYLOAD_OFFSET bytes into the same allocation as the header.
        Self(unsafe { payload.sub(PAYLOAD_OFFSET) }.cast())
    }

    /// Recovers the record whose allocation starts at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a live allocation holding an initialized header, such as one
    /// returned by resizing the allocation of another record.
    pub(crate) unsafe fn from_base(base: NonNull<u8>) -> Self {
        Self(base.cast())
    }

    pub(crate) fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    pub(crate) fn payload(self) -> NonNull<u8> {
        // SAFETY: The allocation extends at least PAYLOAD_OFFSET bytes past the header.
        unsafe { self.base().add(PAYLOAD_OFFSET) }
    }

    pub(crate) fn address(self) -> usize {
        self.payload().as_ptr().addr()
    }

    /// The layout the record's allocation currently has.
    pub(crate) fn layout(self) -> Layout {
        record_layout(self.size())
            .expect("layout was valid when the record was created, so it is still valid")
    }

    pub(crate) fn size(self) -> usize {
        self.header().size
    }

    pub(crate) fn site(self) -> &'static Location<'static> {
        self.header().site
    }

    pub(crate) fn magic(self) -> u32 {
        self.header().magic
    }

    pub(crate) fn next(self) -> Option<Self> {
        self.header().next
    }

    pub(crate) fn prev(self) -> Option<Self> {
        self.header().prev
    }

    pub(crate) fn set_next(self, next: Option<Self>) {
        self.header_mut().next = next;
    }

    pub(crate) fn set_prev(self, prev: Option<Self>) {
        self.header_mut().prev = prev;
    }

    pub(crate) fn mark_freed(self) {
        self.header_mut().magic = MAGIC_FREED;
    }

    /// Updates the header after the allocation was resized and writes a fresh guard.
    pub(crate) fn restamp(self, size: usize, site: &'static Location<'static>) {
        let header = self.header_mut();
        header.size = size;
        header.site = site;
        header.magic = MAGIC_ALIVE;

        self.write_guard();
    }

    fn guard(self) -> NonNull<u8> {
        // SAFETY: The guard starts right after the payload, inside the record allocation.
        unsafe { self.payload().add(self.size()) }
    }

    pub(crate) fn write_guard(self) {
        // SAFETY: GUARD_SIZE bytes after the payload belong to the record allocation.
        unsafe {
            self.guard().write_bytes(GUARD_BYTE, GUARD_SIZE);
        }
    }

    pub(crate) fn guard_intact(self) -> bool {
        // SAFETY: GUARD_SIZE bytes after the payload belong to the record allocation and were
        // initialized by write_guard(). Callers may have scribbled over them, which is exactly
        // what we are checking for, but they remain initialized bytes.
        let guard = unsafe { NonNull::slice_from_raw_parts(self.guard(), GUARD_SIZE).as_ref() };

        guard.iter().all(|&byte| byte == GUARD_BYTE)
    }

    fn header(&self) -> &Header {
        // SAFETY: Records only exist for live, initialized allocations.
        unsafe { self.0.as_ref() }
    }

    #[expect(
        clippy::mut_from_ref,
        reason = "the header is owned by the allocation, not by this handle"
    )]
    fn header_mut(&self) -> &mut Header {
        let mut header = self.0;
        // SAFETY: Records only exist for live, initialized allocations. Mutation only happens
        // while the registry lock is held or before the record is published, so no other
        // reference to the header exists at the same time.
        unsafe { header.as_mut() }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::{GlobalAlloc, System};

    use super::*;

    fn with_record(size: usize, f: impl FnOnce(Record)) {
        let layout = record_layout(size).unwrap();
        let base = NonNull::new(unsafe { System.alloc(layout) }).unwrap();

        let record = unsafe { Record::init(base, size, Location::caller()) };
        f(record);

        unsafe { System.dealloc(base.as_ptr(), layout) };
    }

    #[test]
    fn payload_offset_matches_layout_extension() {
        let header = Layout::new::<Header>().align_to(MAX_ALIGN).unwrap();
        let payload = Layout::from_size_align(64, MAX_ALIGN).unwrap();
        let (_, offset) = header.extend(payload).unwrap();

        assert_eq!(offset, PAYLOAD_OFFSET);
    }

    #[test]
    fn layout_covers_header_payload_and_guard() {
        let layout = record_layout(10).unwrap();

        assert_eq!(layout.size(), PAYLOAD_OFFSET + 10 + GUARD_SIZE);
        assert_eq!(layout.align(), MAX_ALIGN);
        assert!(record_layout(usize::MAX).is_none());
    }

    #[test]
    fn init_stamps_header_and_guard() {
        with_record(24, |record| {
            assert_eq!(record.size(), 24);
            assert_eq!(record.magic(), MAGIC_ALIVE);
            assert_eq!(record.site().file(), file!());
            assert!(record.guard_intact());
            assert_eq!(record.payload().as_ptr().align_offset(MAX_ALIGN), 0);
            assert_eq!(unsafe { Record::from_payload(record.payload()) }, record);
        });
    }

    #[test]
    fn guard_detects_single_byte_overrun() {
        with_record(64, |record| {
            unsafe { record.payload().add(64).write(0) };
            assert!(!record.guard_intact());
        });
    }

    #[test]
    fn guard_ignores_writes_inside_payload() {
        with_record(64, |record| {
            unsafe { record.payload().write_bytes(0xFF, 64) };
            assert!(record.guard_intact());
        });
    }

    #[test]
    fn restamp_moves_guard() {
        with_record(32, |record| {
            record.restamp(16, Location::caller());

            assert_eq!(record.size(), 16);
            assert!(record.guard_intact());
        });
    }

    #[test]
    fn mark_freed_changes_tag() {
        with_record(8, |record| {
            record.mark_freed();
            assert_eq!(record.magic(), MAGIC_FREED);
        });
    }
}
