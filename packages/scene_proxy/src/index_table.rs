use std::ptr::NonNull;

#[cfg(debug_assertions)]
use bitvec::vec::BitVec;
use tracing::debug;

/// The table never grows by fewer slots than this at a time.
const MIN_GROWTH: usize = 64;

/// The table never grows by more slots than this at a time.
const MAX_GROWTH: usize = 1024;

/// Dense table of slot pointers addressed by small integer indices.
///
/// Indices are handed out from a free-index stack. When the stack runs dry, the table grows by
/// `clamp(next_power_of_two(len), 64, 1024)` vacant slots whose indices are pushed onto the
/// stack from high to low, so the lowest new index is handed out first. A freed index goes to
/// the top of the stack and is the next one handed out.
///
/// The table never dereferences the pointers it stores.
#[derive(Debug)]
pub(crate) struct IndexTable<T> {
    slots: Vec<Option<NonNull<T>>>,
    free: Vec<u32>,

    /// One bit per slot, set while the index is on the free stack.
    #[cfg(debug_assertions)]
    free_marks: BitVec,
}

impl<T> IndexTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            #[cfg(debug_assertions)]
            free_marks: BitVec::new(),
        }
    }

    /// Reserves an index. The slot at the index is vacant until [`occupy()`](Self::occupy).
    ///
    /// # Panics
    ///
    /// Panics if the table would need more than `u32::MAX` slots.
    pub(crate) fn alloc_index(&mut self) -> u32 {
        if self.free.is_empty() {
            self.grow();
        }

        let index = self
            .free
            .pop()
            .expect("free-index stack cannot be empty right after growing");

        #[cfg(debug_assertions)]
        self.free_marks.set(index as usize, false);

        index
    }

    /// Returns an index to the free-index stack. The slot must have been vacated already.
    pub(crate) fn free_index(&mut self, index: u32) {
        debug_assert!(
            self.get(index).is_none(),
            "index {index} returned to the free stack while its slot is still occupied"
        );

        #[cfg(debug_assertions)]
        {
            let slot = index as usize;

            assert!(
                slot < self.free_marks.len(),
                "index {index} out of range in table of {} slots",
                self.free_marks.len()
            );
            assert!(
                self.free_marks.get(slot).is_some_and(|free| !*free),
                "index {index} returned to the free stack twice"
            );

            self.free_marks.set(slot, true);
        }

        self.free.push(index);
    }

    /// Stores a pointer in a reserved, vacant slot.
    pub(crate) fn occupy(&mut self, index: u32, ptr: NonNull<T>) {
        let slot = self.slot_mut(index);

        debug_assert!(slot.is_none(), "slot {index} occupied twice");

        *slot = Some(ptr);
    }

    /// Removes and returns the pointer stored in a slot, leaving the slot vacant.
    ///
    /// The index stays reserved until it is passed to [`free_index()`](Self::free_index).
    pub(crate) fn vacate(&mut self, index: u32) -> Option<NonNull<T>> {
        self.slot_mut(index).take()
    }

    /// The pointer stored in a slot, or `None` if the slot is vacant or out of range.
    pub(crate) fn get(&self, index: u32) -> Option<NonNull<T>> {
        self.slots.get(index as usize).copied().flatten()
    }

    /// Indices and pointers of all occupied slots.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (u32, NonNull<T>)> + '_ {
        self.slots
            .iter()
            .zip(0_u32..)
            .filter_map(|(slot, index)| slot.map(|ptr| (index, ptr)))
    }

    /// Forgets all slots and indices.
    ///
    /// Any previously issued index may be issued again afterwards.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();

        #[cfg(debug_assertions)]
        self.free_marks.clear();
    }

    /// Number of slots, occupied or not.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn slot_mut(&mut self, index: u32) -> &mut Option<NonNull<T>> {
        let len = self.slots.len();

        self.slots
            .get_mut(index as usize)
            .unwrap_or_else(|| panic!("index {index} out of range in table of {len} slots"))
    }

    fn grow(&mut self) {
        let first_index = self.slots.len();
        let growth = growth_for(first_index);

        // Cannot overflow because the vector already holds first_index elements.
        let new_len = first_index.wrapping_add(growth);

        let (Ok(first), Ok(end)) = (u32::try_from(first_index), u32::try_from(new_len)) else {
            panic!("proxy index space exhausted at {first_index} slots");
        };

        self.slots.resize(new_len, None);
        self.free.reserve(growth);
        self.free.extend((first..end).rev());

        #[cfg(debug_assertions)]
        self.free_marks.resize(new_len, true);

        debug!(first_index, new_len, "added proxy index slots");
    }
}

/// Number of slots to add to a table that currently has `len` slots.
fn growth_for(len: usize) -> usize {
    len.checked_next_power_of_two()
        .unwrap_or(usize::MAX)
        .clamp(MIN_GROWTH, MAX_GROWTH)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn dangling() -> NonNull<u64> {
        NonNull::dangling()
    }

    #[test]
    fn first_growth_hands_out_lowest_index_first() {
        let mut table = IndexTable::<u64>::new();

        assert_eq!(table.alloc_index(), 0);
        assert_eq!(table.alloc_index(), 1);
        assert_eq!(table.alloc_index(), 2);
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn freed_index_is_reused_next() {
        let mut table = IndexTable::<u64>::new();

        for _ in 0..4 {
            _ = table.alloc_index();
        }

        table.free_index(3);
        assert_eq!(table.alloc_index(), 3);

        table.free_index(1);
        assert_eq!(table.alloc_index(), 1);
        assert_eq!(table.alloc_index(), 4);
    }

    #[test]
    fn growth_preserves_issued_indices() {
        let mut table = IndexTable::<u64>::new();
        let ptr = dangling();

        for _ in 0..64 {
            let index = table.alloc_index();
            table.occupy(index, ptr);
        }

        assert_eq!(table.len(), 64);

        let index = table.alloc_index();
        assert_eq!(index, 64);
        assert_eq!(table.len(), 128);

        for index in 0..64 {
            assert_eq!(table.get(index), Some(ptr));
        }

        assert_eq!(table.get(64), None);
        assert_eq!(table.occupied().count(), 64);
    }

    #[test]
    fn growth_is_bounded() {
        assert_eq!(growth_for(0), 64);
        assert_eq!(growth_for(64), 64);
        assert_eq!(growth_for(128), 128);
        assert_eq!(growth_for(600), 1024);
        assert_eq!(growth_for(4096), 1024);
    }

    #[test]
    fn vacate_and_clear() {
        let mut table = IndexTable::<u64>::new();
        let ptr = dangling();

        let index = table.alloc_index();
        table.occupy(index, ptr);
        assert_eq!(table.vacate(index), Some(ptr));
        assert_eq!(table.vacate(index), None);
        table.free_index(index);

        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.get(index), None);
        assert_eq!(table.alloc_index(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn double_free_index_panics_in_debug() {
        let mut table = IndexTable::<u64>::new();

        let index = table.alloc_index();
        table.free_index(index);
        table.free_index(index);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn never_issued_free_index_panics_in_debug() {
        let mut table = IndexTable::<u64>::new();

        // Index 5 is within the grown table but still sits on the free stack.
        _ = table.alloc_index();
        table.free_index(5);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn free_marks_follow_the_free_stack() {
        let mut table = IndexTable::<u64>::new();

        let first = table.alloc_index();
        let second = table.alloc_index();
        assert_eq!(table.free_marks.len(), 64);
        assert_eq!(table.free_marks.count_ones(), 62);

        table.free_index(first);
        table.free_index(second);
        assert_eq!(table.free_marks.count_ones(), 64);

        // Re-issued indices can be freed again.
        assert_eq!(table.alloc_index(), second);
        table.free_index(second);

        table.clear();
        assert!(table.free_marks.is_empty());
    }

    #[test]
    fn out_of_range_is_vacant() {
        let table = IndexTable::<u64>::new();

        assert_eq!(table.get(1000), None);
    }
}
