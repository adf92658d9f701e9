use std::alloc::Layout;
use std::ptr::NonNull;
use std::{fmt, iter, mem};

use crate::BackingAllocator;

/// A growable array of plain values stored in memory obtained from a [`BackingAllocator`].
///
/// The table does not hold on to the backing allocator. Every operation that obtains or returns
/// memory takes it as an argument, and the owner must call [`release()`](Self::release) with the
/// same allocator before dropping the table.
pub(crate) struct Table<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,

    /// Capacity of the first allocation, unless more is needed right away.
    initial_capacity: usize,
}

impl<T: Copy> Table<T> {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        assert!(mem::size_of::<T>() > 0, "table elements must not be zero-sized");

        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
            initial_capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }

        // SAFETY: Elements below len are initialized and inside the allocation.
        Some(unsafe { self.ptr.add(index).read() })
    }

    /// Overwrites an existing element. Returns `false` if `index` is out of bounds.
    pub(crate) fn set(&mut self, index: usize, value: T) -> bool {
        if index >= self.len {
            return false;
        }

        // SAFETY: Elements below len are inside the allocation, which we own exclusively.
        unsafe {
            self.ptr.add(index).write(value);
        }

        true
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let mut index = 0;

        iter::from_fn(move || {
            let value = self.get(index)?;

            // Cannot overflow because index < len.
            index = index.wrapping_add(1);
            Some(value)
        })
    }

    /// Ensures room for `additional` more elements without further allocation.
    ///
    /// Capacity at least doubles whenever it has to grow. Returns `None` if the backing
    /// allocator is exhausted or the size overflows, in which case the table is unchanged.
    pub(crate) fn reserve<B: BackingAllocator>(
        &mut self,
        additional: usize,
        backing: &B,
    ) -> Option<()> {
        let required = self.len.checked_add(additional)?;

        if required <= self.capacity {
            return Some(());
        }

        let target = required
            .max(self.capacity.saturating_mul(2))
            .max(self.initial_capacity);
        let new_layout = Layout::array::<T>(target).ok()?;

        let ptr = if self.capacity == 0 {
            // SAFETY: target >= required > 0 and elements are not zero-sized.
            unsafe { backing.allocate(new_layout) }?
        } else {
            // SAFETY: The current allocation was made by this backing allocator with exactly
            // this layout, and the new size is larger and valid because new_layout exists.
            unsafe { backing.resize(self.ptr.cast(), self.layout(), new_layout.size()) }?
        };

        self.ptr = ptr.cast();
        self.capacity = target;

        Some(())
    }

    /// Appends an element.
    ///
    /// # Panics
    ///
    /// Panics if there is no spare capacity. Call [`reserve()`](Self::reserve) first.
    pub(crate) fn push(&mut self, value: T) {
        assert!(
            self.len < self.capacity,
            "table push without reserved capacity ({} of {})",
            self.len,
            self.capacity
        );

        // SAFETY: len < capacity, so the slot is inside the allocation, which we own exclusively.
        unsafe {
            self.ptr.add(self.len).write(value);
        }

        // Cannot overflow because len < capacity.
        self.len = self.len.wrapping_add(1);
    }

    /// Returns the memory to `backing`, leaving an empty table that can be used again.
    pub(crate) fn release<B: BackingAllocator>(&mut self, backing: &B) {
        if self.capacity != 0 {
            // SAFETY: The allocation was made by this backing allocator with this layout and is
            // forgotten right below.
            unsafe {
                backing.release(self.ptr.cast(), self.layout());
            }
        }

        self.ptr = NonNull::dangling();
        self.len = 0;
        self.capacity = 0;
    }

    fn layout(&self) -> Layout {
        Layout::array::<T>(self.capacity)
            .expect("table layout was valid when the table grew to this capacity")
    }
}

impl<T: Copy> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::backing::LimitedBacking;

    #[test]
    fn new_table_owns_nothing() {
        let table = Table::<usize>::new(8);

        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.get(0), None);
    }

    #[test]
    fn first_growth_uses_initial_capacity() {
        let backing = LimitedBacking::default();
        let mut table = Table::<u32>::new(8);

        table.reserve(1, &backing).unwrap();
        assert_eq!(table.capacity(), 8);

        table.reserve(20, &backing).unwrap();
        assert_eq!(table.capacity(), 20);

        table.release(&backing);
        assert_eq!(backing.outstanding(), 0);
    }

    #[test]
    fn growth_doubles_and_keeps_contents() {
        let backing = LimitedBacking::default();
        let mut table = Table::<usize>::new(0);
        let mut capacities = Vec::new();

        for value in 0..100 {
            table.reserve(1, &backing).unwrap();
            table.push(value);

            if capacities.last() != Some(&table.capacity()) {
                capacities.push(table.capacity());
            }
        }

        assert_eq!(capacities, vec![1, 2, 4, 8, 16, 32, 64, 128]);
        assert!(table.iter().eq(0..100));
        assert_eq!(backing.outstanding(), 1);

        table.release(&backing);
        assert_eq!(backing.outstanding(), 0);
    }

    #[test]
    fn failed_growth_leaves_table_unchanged() {
        let backing = LimitedBacking::default();
        let mut table = Table::<u64>::new(2);

        table.reserve(2, &backing).unwrap();
        table.push(7);
        table.push(9);

        backing.fail_after(0);
        assert!(table.reserve(1, &backing).is_none());

        assert_eq!(table.capacity(), 2);
        assert!(table.iter().eq([7, 9]));

        table.release(&backing);
    }

    #[test]
    fn set_overwrites_in_bounds_only() {
        let backing = LimitedBacking::default();
        let mut table = Table::<u8>::new(4);

        table.reserve(1, &backing).unwrap();
        table.push(1);

        assert!(table.set(0, 5));
        assert!(!table.set(1, 5));
        assert_eq!(table.get(0), Some(5));

        table.release(&backing);
    }

    #[test]
    #[should_panic]
    fn push_without_capacity_panics() {
        let mut table = Table::<u8>::new(4);
        table.push(1);
    }
}
