use std::alloc::{Layout, alloc, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;

use bitvec::vec::BitVec;

/// Number of elements tracked by one word of a block's free mask.
pub(crate) const MASK_WORD_BITS: usize = u64::BITS as usize;

/// Number of free-mask words needed to track `element_count` elements.
#[must_use]
pub(crate) fn mask_words_for(element_count: usize) -> usize {
    element_count.div_ceil(MASK_WORD_BITS)
}

/// Which of the two pool-level block lists a block is currently linked into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BlockList {
    /// The block has at least one free element.
    HasSpace,

    /// Every element in the block is allocated.
    Full,
}

/// A contiguous memory region holding a fixed number of equally-sized elements.
///
/// The block does not know what is stored in its elements. It only tracks which elements are
/// free via a bitmask (one bit per element, set means free) and hands out the lowest free
/// element on request.
///
/// Each block is also a node in one of two intrusive doubly-linked lists owned by the pool.
/// The links are block indices into the pool's block vector rather than pointers.
#[derive(Debug)]
pub(crate) struct Block {
    /// Start of the element array. Aligned to the pool's item alignment.
    first_element_ptr: NonNull<u8>,

    /// The layout used to allocate the element array, required for deallocation.
    array_layout: Layout,

    /// Distance in bytes between consecutive elements.
    stride: NonZero<usize>,

    /// One bit per element; a set bit means the element is free.
    free_mask: BitVec<u64>,

    /// Number of set bits in `free_mask`, cached so list migration decisions are O(1).
    free_count: usize,

    /// The list this block is currently a member of.
    list: BlockList,

    /// Previous block in the same list, if any.
    prev: Option<usize>,

    /// Next block in the same list, if any.
    next: Option<usize>,
}

impl Block {
    /// Allocates a new block with room for `capacity` elements of the given stride and alignment.
    ///
    /// Returns `None` if the memory for the block could not be obtained.
    ///
    /// The new block is not linked into any list yet; the caller must do that.
    #[must_use]
    pub(crate) fn new(
        stride: NonZero<usize>,
        align: usize,
        capacity: NonZero<usize>,
    ) -> Option<Self> {
        let total_size = stride.get().checked_mul(capacity.get())?;
        let array_layout = Layout::from_size_align(total_size, align).ok()?;

        // SAFETY: The layout has a non-zero size because both stride and capacity are non-zero.
        let first_element_ptr = NonNull::new(unsafe { alloc(array_layout) })?;

        Some(Self {
            first_element_ptr,
            array_layout,
            stride,
            free_mask: BitVec::repeat(true, capacity.get()),
            free_count: capacity.get(),
            list: BlockList::HasSpace,
            prev: None,
            next: None,
        })
    }

    /// The number of elements this block can hold.
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.free_mask.len()
    }

    /// The number of allocated elements in this block.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        // Cannot underflow because free_count never exceeds capacity.
        self.capacity().wrapping_sub(self.free_count)
    }

    #[must_use]
    pub(crate) fn free_count(&self) -> usize {
        self.free_count
    }

    #[must_use]
    pub(crate) fn is_full(&self) -> bool {
        self.free_count == 0
    }

    /// Number of 64-bit words in this block's free mask.
    #[must_use]
    pub(crate) fn mask_words(&self) -> usize {
        self.free_mask.as_raw_slice().len()
    }

    #[must_use]
    pub(crate) fn list(&self) -> BlockList {
        self.list
    }

    #[must_use]
    pub(crate) fn prev(&self) -> Option<usize> {
        self.prev
    }

    #[must_use]
    pub(crate) fn next(&self) -> Option<usize> {
        self.next
    }

    pub(crate) fn set_links(&mut self, list: BlockList, prev: Option<usize>, next: Option<usize>) {
        self.list = list;
        self.prev = prev;
        self.next = next;
    }

    pub(crate) fn set_prev(&mut self, prev: Option<usize>) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: Option<usize>) {
        self.next = next;
    }

    /// Marks the lowest-index free element as allocated and returns a pointer to it.
    ///
    /// Returns `None` if the block is full.
    #[must_use]
    pub(crate) fn take_first_free(&mut self) -> Option<NonNull<u8>> {
        let index = self.free_mask.first_one()?;

        let was_free = self.free_mask.replace(index, false);
        debug_assert!(was_free, "first_one() returned element {index} which was not free");

        // Cannot underflow because we just found a free element.
        self.free_count = self.free_count.wrapping_sub(1);

        Some(self.element_ptr(index))
    }

    /// Marks the element at `index` as free again.
    ///
    /// Returns `false` if the element was already free, in which case nothing is changed.
    #[must_use]
    pub(crate) fn release(&mut self, index: usize) -> bool {
        let was_free = self.free_mask.replace(index, true);

        if was_free {
            return false;
        }

        // Cannot overflow because the element was allocated, so free_count < capacity.
        self.free_count = self.free_count.wrapping_add(1);
        true
    }

    /// Whether the element at `index` is currently allocated.
    #[must_use]
    pub(crate) fn is_allocated(&self, index: usize) -> bool {
        self.free_mask.get(index).is_some_and(|is_free| !*is_free)
    }

    /// Returns the index of the element that starts at `ptr`, if `ptr` points into this block.
    ///
    /// A pointer inside the block that does not point to the start of an element is not
    /// considered to belong to the block.
    #[must_use]
    pub(crate) fn element_index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let start = self.first_element_ptr.as_ptr().addr();
        let offset = ptr.as_ptr().addr().checked_sub(start)?;

        if offset >= self.array_layout.size() {
            return None;
        }

        #[expect(
            clippy::integer_division,
            reason = "we verify that there is no remainder right below"
        )]
        let index = offset / self.stride.get();

        // Cannot overflow because index * stride <= offset.
        if index.wrapping_mul(self.stride.get()) != offset {
            return None;
        }

        Some(index)
    }

    #[must_use]
    fn element_ptr(&self, index: usize) -> NonNull<u8> {
        assert!(
            index < self.capacity(),
            "element {index} out of bounds in block of capacity {}",
            self.capacity()
        );

        // Cannot overflow because the offset is within the allocation we made in new().
        let offset = index.wrapping_mul(self.stride.get());

        // SAFETY: The offset is within the element array allocated in new(), as guaranteed by
        // the bounds check above.
        unsafe { self.first_element_ptr.byte_add(offset) }
    }

    /// Verifies that the cached free count agrees with the free mask.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self) {
        let observed_free = self.free_mask.count_ones();

        assert_eq!(
            observed_free, self.free_count,
            "block free count {} does not match the {observed_free} set bits in its free mask",
            self.free_count
        );

        assert_eq!(
            self.list == BlockList::Full,
            self.is_full(),
            "block with {} free elements is linked into the {:?} list",
            self.free_count,
            self.list
        );
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: We allocated this memory in new() with exactly this layout and have not
        // deallocated it before.
        unsafe {
            dealloc(self.first_element_ptr.as_ptr(), self.array_layout);
        }
    }
}

// SAFETY: The block exclusively owns its element array. It never shares the pointer with
// anything that is tied to a particular thread; any pointers handed out to callers are governed
// by the pool's unsafe API contract.
unsafe impl Send for Block {}
