use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use new_zealand::nz;
use tracing::debug;

use crate::{Block, BlockList, BlockPoolBuilder, DropPolicy, mask_words_for};

/// No block is ever created with fewer elements than this, so that block management overhead
/// stays small relative to the payload.
pub(crate) const MIN_BLOCK_CAPACITY: NonZero<usize> = nz!(64);

/// No block is ever created with more elements than this. Beyond this point, growing the pool
/// means adding more blocks of this size instead of ever-larger blocks.
pub(crate) const MAX_BLOCK_CAPACITY: NonZero<usize> = nz!(1024);

/// A pool of fixed-layout memory elements, organized in growable blocks.
///
/// The pool hands out raw, uninitialized element memory via [`alloc()`](Self::alloc) and takes
/// it back via [`free()`](Self::free). It never constructs, moves or drops the values stored in
/// the elements - that is the job of the caller (or of the typed helpers
/// [`insert()`](Self::insert) and [`remove()`](Self::remove)).
///
/// # Memory layout
///
/// Memory is obtained in blocks. Each block holds a fixed number of elements and a bitmask
/// that records which elements are free. Blocks are added lazily when no existing block has a
/// free element; the size of a new block is the next power of two of the current capacity,
/// clamped to `[64, 1024]` elements.
///
/// Every block is linked into one of two lists: blocks that still have free elements and blocks
/// that are full. Allocation always takes the lowest free element of the first block in the
/// "has space" list. Blocks are only released when the pool itself is dropped.
///
/// # Stable addresses
///
/// An element never moves while it is allocated, so pointers returned by the pool remain valid
/// until the element is freed or the pool is dropped.
///
/// # Examples
///
/// ```
/// use block_pool::BlockPool;
///
/// let mut pool = BlockPool::builder().layout_of::<[u64; 4]>().build();
///
/// let a = pool.alloc().unwrap();
/// let b = pool.alloc().unwrap();
/// assert_ne!(a, b);
/// assert_eq!(pool.len(), 2);
///
/// // SAFETY: Both elements came from this pool and are not used after being freed.
/// unsafe {
///     pool.free(a);
///     pool.free(b);
/// }
///
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). Callers that share a
/// pool between threads must serialize access externally, e.g. with a mutex.
#[derive(Debug)]
pub struct BlockPool {
    /// The layout of a single element, as requested by the pool's creator.
    item_layout: Layout,

    /// Distance between consecutive elements in a block. Never smaller than the alignment.
    stride: NonZero<usize>,

    drop_policy: DropPolicy,

    /// If set, the total capacity of the pool may never exceed this many elements.
    capacity_limit: Option<NonZero<usize>>,

    /// Number of free-mask words in the header of the largest block this pool can create.
    /// Calculated once when the pool is created.
    header_mask_words: usize,

    /// All blocks ever created by this pool. Blocks are never removed before the pool is dropped,
    /// so indexes into this vector are stable and are used as the links of the block lists.
    blocks: Vec<Block>,

    /// First block of the list of blocks with at least one free element.
    has_space_head: Option<usize>,

    /// First block of the list of blocks with no free elements.
    full_head: Option<usize>,

    /// Number of currently allocated elements across all blocks.
    length: usize,

    /// Total number of elements across all blocks.
    capacity: usize,
}

impl BlockPool {
    /// Creates a builder for configuring and constructing a [`BlockPool`].
    ///
    /// You must specify an element memory layout using either `.layout()` or
    /// `.layout_of::<T>()` before calling `.build()`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::builder().layout_of::<u128>().build();
    ///
    /// assert_eq!(pool.len(), 0);
    /// assert_eq!(pool.capacity(), 0);
    /// ```
    #[inline]
    pub fn builder() -> BlockPoolBuilder {
        BlockPoolBuilder::new()
    }

    /// # Panics
    ///
    /// Panics if the layout has zero size.
    #[must_use]
    pub(crate) fn new_inner(
        item_layout: Layout,
        drop_policy: DropPolicy,
        capacity_limit: Option<NonZero<usize>>,
    ) -> Self {
        assert!(
            item_layout.size() > 0,
            "BlockPool must have non-zero element size"
        );

        // pad_to_align() makes the size a multiple of the alignment, so consecutive elements
        // are all correctly aligned and the stride is never smaller than the alignment.
        let stride = NonZero::new(item_layout.pad_to_align().size())
            .expect("padded size of a non-zero-sized layout is non-zero");

        let largest_block = capacity_limit.map_or(MAX_BLOCK_CAPACITY, |limit| {
            limit.min(MAX_BLOCK_CAPACITY)
        });

        Self {
            item_layout,
            stride,
            drop_policy,
            capacity_limit,
            header_mask_words: mask_words_for(largest_block.get()),
            blocks: Vec::new(),
            has_space_head: None,
            full_head: None,
            length: 0,
            capacity: 0,
        }
    }

    /// The memory layout of the elements in this pool.
    #[must_use]
    #[inline]
    pub fn item_layout(&self) -> Layout {
        self.item_layout
    }

    /// Distance in bytes between consecutive elements of a block.
    ///
    /// This is the element size rounded up to the element alignment.
    #[must_use]
    #[inline]
    pub fn element_stride(&self) -> usize {
        self.stride.get()
    }

    /// The cap on total capacity set via
    /// [`BlockPoolBuilder::capacity_limit()`], if any.
    #[must_use]
    #[inline]
    pub fn capacity_limit(&self) -> Option<NonZero<usize>> {
        self.capacity_limit
    }

    /// Number of free-mask words in the header of the largest block this pool can create.
    #[must_use]
    #[inline]
    pub fn header_mask_words(&self) -> usize {
        self.header_mask_words
    }

    /// The number of currently allocated elements.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    #[inline]
    pub fn len(&self) -> usize {
        debug_assert_eq!(
            self.length,
            self.blocks.iter().map(Block::len).sum::<usize>()
        );

        self.length
    }

    /// Whether the pool has no allocated elements.
    ///
    /// An empty pool may still be holding blocks of memory.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The number of elements the pool can hand out without adding a block.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of blocks the pool has allocated so far.
    #[must_use]
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Allocates one element and returns a pointer to its (uninitialized) memory.
    ///
    /// The pointer is aligned to the alignment of the pool's item layout and remains valid until
    /// it is passed to [`free()`](Self::free) or the pool is dropped.
    ///
    /// If no block has a free element, a new block is added first. Returns `None` if that new
    /// block cannot be obtained, either because the system is out of memory or because the
    /// pool's capacity limit has been reached. The caller decides whether that is fatal.
    #[must_use]
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let block_index = match self.has_space_head {
            Some(index) => index,
            None => self.add_block()?,
        };

        let block = self.block_mut(block_index);

        let ptr = block
            .take_first_free()
            .expect("every block in the has-space list has at least one free element");

        if block.is_full() {
            self.move_block(block_index, BlockList::Full);
        }

        // Cannot overflow because that would imply more elements than virtual memory.
        self.length = self.length.wrapping_add(1);

        debug_assert_eq!(
            ptr.as_ptr().align_offset(self.item_layout.align()),
            0,
            "element pointer {ptr:?} is not aligned to {}",
            self.item_layout.align()
        );

        #[cfg(debug_assertions)]
        self.integrity_check();

        Some(ptr)
    }

    /// Returns an element to the pool, making its memory available for future allocations.
    ///
    /// The owning block is found by a linear scan over all blocks. This is fine as long as the
    /// number of blocks stays small compared to the number of elements, which the block growth
    /// rule ensures for all but enormous pools.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `ptr` was not allocated from this pool or if the element has
    /// already been freed. Release builds ignore such calls.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` is not used after this call and that any value stored
    /// in the element has already been dropped or moved out (or does not need dropping).
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let Some((block_index, element_index)) = self.locate(ptr) else {
            if cfg!(debug_assertions) {
                panic!("attempted to free {ptr:?} which does not belong to any block of this pool");
            }

            return;
        };

        let block = self.block_mut(block_index);
        let was_full = block.is_full();

        if !block.release(element_index) {
            if cfg!(debug_assertions) {
                panic!("double free of element {element_index} in block {block_index} ({ptr:?})");
            }

            return;
        }

        if was_full {
            self.move_block(block_index, BlockList::HasSpace);
        }

        // Cannot underflow because we just released an allocated element.
        self.length = self.length.wrapping_sub(1);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Allocates an element and moves `value` into it.
    ///
    /// Returns `None` (dropping `value`) if no element could be allocated.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the layout of `T` does not match the pool's item layout.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the layout of `T` matches the pool's item layout and that the
    /// value is eventually taken back out via [`remove()`](Self::remove) (or is fine to leak).
    #[must_use]
    pub unsafe fn insert<T>(&mut self, value: T) -> Option<NonNull<T>> {
        debug_assert_eq!(
            Layout::new::<T>(),
            self.item_layout,
            "T layout does not match pool's item layout"
        );

        let ptr = self.alloc()?.cast::<T>();

        // SAFETY: The element was just allocated for us, is properly aligned for the pool's
        // layout (which the caller guarantees matches T) and nobody else references it.
        unsafe {
            ptr.write(value);
        }

        Some(ptr)
    }

    /// Moves the value out of an element and frees the element.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `ptr` was not allocated from this pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by [`insert()`](Self::insert) on this pool
    /// with the same `T`, has not been removed or freed since, and is not used after this call.
    #[must_use]
    pub unsafe fn remove<T>(&mut self, ptr: NonNull<T>) -> T {
        debug_assert!(
            self.is_allocated(ptr.cast()),
            "attempted to remove {ptr:?} which is not an allocated element of this pool"
        );

        // SAFETY: The caller guarantees the element holds an initialized T.
        let value = unsafe { ptr.read() };

        // SAFETY: We moved the value out above, so the element no longer holds anything
        // that needs dropping. The caller guarantees the pointer is not used again.
        unsafe {
            self.free(ptr.cast());
        }

        value
    }

    /// Whether `ptr` points to a currently allocated element of this pool.
    #[must_use]
    pub fn is_allocated(&self, ptr: NonNull<u8>) -> bool {
        self.locate(ptr)
            .is_some_and(|(block_index, element_index)| {
                self.block(block_index).is_allocated(element_index)
            })
    }

    /// Adds a new block to the "has space" list and returns its index.
    fn add_block(&mut self) -> Option<usize> {
        let mut block_capacity = next_block_capacity(self.capacity);

        if let Some(limit) = self.capacity_limit {
            block_capacity = block_capacity.min(limit.get().saturating_sub(self.capacity));
        }

        let Some(block_capacity) = NonZero::new(block_capacity) else {
            debug!(
                capacity = self.capacity,
                "block pool has reached its capacity limit"
            );
            return None;
        };

        let Some(block) = Block::new(self.stride, self.item_layout.align(), block_capacity) else {
            debug!(
                block_capacity = block_capacity.get(),
                element_stride = self.stride.get(),
                "failed to allocate memory for a new block"
            );
            return None;
        };

        let block_index = self.blocks.len();
        self.blocks.push(block);

        // Cannot overflow because that would imply more elements than virtual memory.
        self.capacity = self.capacity.wrapping_add(block_capacity.get());

        self.link_front(block_index, BlockList::HasSpace);

        debug!(
            block_index,
            block_capacity = block_capacity.get(),
            total_capacity = self.capacity,
            "added block to pool"
        );

        Some(block_index)
    }

    /// Finds the block and element index that `ptr` refers to by scanning both block lists.
    fn locate(&self, ptr: NonNull<u8>) -> Option<(usize, usize)> {
        [self.full_head, self.has_space_head]
            .into_iter()
            .find_map(|head| self.locate_in_list(head, ptr))
    }

    fn locate_in_list(&self, head: Option<usize>, ptr: NonNull<u8>) -> Option<(usize, usize)> {
        let mut cursor = head;

        while let Some(block_index) = cursor {
            let block = self.block(block_index);

            if let Some(element_index) = block.element_index_of(ptr) {
                return Some((block_index, element_index));
            }

            cursor = block.next();
        }

        None
    }

    fn head(&self, list: BlockList) -> Option<usize> {
        match list {
            BlockList::HasSpace => self.has_space_head,
            BlockList::Full => self.full_head,
        }
    }

    fn set_head(&mut self, list: BlockList, head: Option<usize>) {
        match list {
            BlockList::HasSpace => self.has_space_head = head,
            BlockList::Full => self.full_head = head,
        }
    }

    fn link_front(&mut self, block_index: usize, list: BlockList) {
        let old_head = self.head(list);

        if let Some(old_head) = old_head {
            self.block_mut(old_head).set_prev(Some(block_index));
        }

        self.block_mut(block_index).set_links(list, None, old_head);
        self.set_head(list, Some(block_index));
    }

    fn unlink(&mut self, block_index: usize) {
        let block = self.block(block_index);
        let (list, prev, next) = (block.list(), block.prev(), block.next());

        match prev {
            Some(prev) => self.block_mut(prev).set_next(next),
            None => self.set_head(list, next),
        }

        if let Some(next) = next {
            self.block_mut(next).set_prev(prev);
        }
    }

    fn move_block(&mut self, block_index: usize, to: BlockList) {
        self.unlink(block_index);
        self.link_front(block_index, to);
    }

    fn block(&self, block_index: usize) -> &Block {
        self.blocks
            .get(block_index)
            .expect("block list links always refer to existing blocks")
    }

    fn block_mut(&mut self, block_index: usize) -> &mut Block {
        self.blocks
            .get_mut(block_index)
            .expect("block list links always refer to existing blocks")
    }

    /// Verifies the bookkeeping of the pool: every block is in exactly the list that matches
    /// its fill state, the lists are consistently linked and the cached totals are accurate.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self) {
        let mut visited_blocks: usize = 0;

        for list in [BlockList::HasSpace, BlockList::Full] {
            let mut prev = None;
            let mut cursor = self.head(list);

            while let Some(block_index) = cursor {
                let block = self.block(block_index);
                block.integrity_check();

                assert!(
                    block.mask_words() <= self.header_mask_words,
                    "block {block_index} has a larger free mask than any block of this pool may have"
                );
                assert_eq!(
                    block.len().wrapping_add(block.free_count()),
                    block.capacity(),
                    "block {block_index} miscounts its elements"
                );

                assert_eq!(
                    block.list(),
                    list,
                    "block {block_index} is reachable from the {list:?} list but thinks it is in {:?}",
                    block.list()
                );
                assert_eq!(
                    block.prev(),
                    prev,
                    "block {block_index} has a broken back link"
                );

                visited_blocks = visited_blocks.wrapping_add(1);
                assert!(
                    visited_blocks <= self.blocks.len(),
                    "block lists contain a cycle"
                );

                prev = Some(block_index);
                cursor = block.next();
            }
        }

        assert_eq!(
            visited_blocks,
            self.blocks.len(),
            "some blocks are not linked into any list"
        );

        let observed_length: usize = self.blocks.iter().map(Block::len).sum();
        assert_eq!(
            observed_length, self.length,
            "pool length {} does not match the {observed_length} allocated elements in its blocks",
            self.length
        );

        let observed_capacity: usize = self.blocks.iter().map(Block::capacity).sum();
        assert_eq!(
            observed_capacity, self.capacity,
            "pool capacity {} does not match the total block capacity {observed_capacity}",
            self.capacity
        );
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let allocated = self.length;

        // Release the memory first. If we are going to panic below, there is little good to
        // expect for the app itself but there is no reason to leak on top of that.
        self.blocks.clear();

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustBeEmpty) {
            assert!(
                allocated == 0,
                "dropped a BlockPool with {allocated} allocated elements - this is forbidden by DropPolicy::MustBeEmpty"
            );
        }
    }
}

/// Number of elements in the next block, given the current capacity of the pool.
#[must_use]
fn next_block_capacity(current_capacity: usize) -> usize {
    current_capacity
        .checked_next_power_of_two()
        .unwrap_or(usize::MAX)
        .clamp(MIN_BLOCK_CAPACITY.get(), MAX_BLOCK_CAPACITY.get())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::collections::HashSet;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockPool: Send, std::fmt::Debug);
    assert_not_impl_any!(BlockPool: Sync);

    #[repr(C, align(256))]
    struct Aligned256 {
        data: [u8; 16],
    }

    fn pool_of_32_byte_elements() -> BlockPool {
        BlockPool::builder()
            .layout(Layout::from_size_align(32, 8).unwrap())
            .build()
    }

    #[test]
    fn basic_pool_lifecycle() {
        let mut pool = pool_of_32_byte_elements();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.len(), 2);
        assert_ne!(a, b);

        unsafe {
            pool.free(a);
            pool.free(b);
        }

        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn aligned_element_pool() {
        let mut pool = BlockPool::builder().layout_of::<Aligned256>().build();

        let ptr = pool.alloc().unwrap();
        assert_eq!(ptr.as_ptr().addr() % 256, 0);
        assert_eq!(pool.element_stride(), 256);

        unsafe { pool.free(ptr) };
    }

    #[test]
    fn stride_is_at_least_alignment() {
        let pool = BlockPool::builder()
            .layout(Layout::from_size_align(8, 64).unwrap())
            .build();

        assert_eq!(pool.element_stride(), 64);
    }

    #[test]
    fn empty_pool_has_no_blocks() {
        let pool = pool_of_32_byte_elements();

        assert_eq!(pool.block_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.header_mask_words(), 16);
    }

    #[test]
    fn blocks_grow_geometrically_within_bounds() {
        assert_eq!(next_block_capacity(0), 64);
        assert_eq!(next_block_capacity(64), 64);
        assert_eq!(next_block_capacity(128), 128);
        assert_eq!(next_block_capacity(300), 512);
        assert_eq!(next_block_capacity(1024), 1024);
        assert_eq!(next_block_capacity(5000), 1024);
        assert_eq!(next_block_capacity(usize::MAX), 1024);
    }

    #[test]
    fn growth_adds_blocks_on_demand() {
        let mut pool = pool_of_32_byte_elements();
        let mut elements = Vec::new();

        for _ in 0..64 {
            elements.push(pool.alloc().unwrap());
        }

        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.capacity(), 64);

        elements.push(pool.alloc().unwrap());
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.capacity(), 128);

        for _ in 0..64 {
            elements.push(pool.alloc().unwrap());
        }

        assert_eq!(pool.block_count(), 3);
        assert_eq!(pool.capacity(), 256);

        for element in elements {
            unsafe { pool.free(element) };
        }

        // Blocks are retained until the pool is dropped.
        assert_eq!(pool.block_count(), 3);
        assert!(pool.is_empty());
    }

    #[test]
    fn freed_element_in_full_block_is_reused_first() {
        let mut pool = pool_of_32_byte_elements();

        let first_block: Vec<_> = (0..64).map(|_| pool.alloc().unwrap()).collect();
        let in_second_block = pool.alloc().unwrap();

        let victim = first_block[10];
        unsafe { pool.free(victim) };

        // The formerly full block moved to the front of the has-space list.
        let reused = pool.alloc().unwrap();
        assert_eq!(reused, victim);

        for element in first_block {
            unsafe { pool.free(element) };
        }
        unsafe { pool.free(in_second_block) };
    }

    #[test]
    fn live_elements_are_distinct() {
        let mut pool = pool_of_32_byte_elements();

        let elements: Vec<_> = (0..300).map(|_| pool.alloc().unwrap()).collect();
        let unique: HashSet<_> = elements.iter().copied().collect();
        assert_eq!(unique.len(), elements.len());

        for element in elements {
            unsafe { pool.free(element) };
        }
    }

    #[test]
    fn capacity_limit_exhausts_pool() {
        let mut pool = BlockPool::builder()
            .layout_of::<u64>()
            .capacity_limit(NonZero::new(3).unwrap())
            .build();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.capacity(), 3);

        unsafe { pool.free(b) };
        let d = pool.alloc().unwrap();
        assert_eq!(d, b);

        unsafe {
            pool.free(a);
            pool.free(c);
            pool.free(d);
        }
    }

    #[test]
    fn insert_and_remove_round_trip_values() {
        let mut pool = BlockPool::builder().layout_of::<String>().build();

        let hello = unsafe { pool.insert("hello".to_string()) }.unwrap();
        let world = unsafe { pool.insert("world".to_string()) }.unwrap();

        assert!(pool.is_allocated(hello.cast()));
        assert_eq!(unsafe { hello.as_ref() }, "hello");

        let hello_value = unsafe { pool.remove(hello) };
        assert_eq!(hello_value, "hello");
        assert!(!pool.is_allocated(hello.cast()));

        let world_value = unsafe { pool.remove(world) };
        assert_eq!(world_value, "world");
        assert!(pool.is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn double_free_panics_in_debug() {
        let mut pool = pool_of_32_byte_elements();
        let _keep_block_in_list = pool.alloc().unwrap();
        let a = pool.alloc().unwrap();

        unsafe {
            pool.free(a);
            pool.free(a);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn foreign_pointer_panics_in_debug() {
        let mut pool = pool_of_32_byte_elements();
        let mut other = pool_of_32_byte_elements();

        let foreign = other.alloc().unwrap();
        unsafe { pool.free(foreign) };
    }

    #[test]
    #[should_panic]
    fn drop_with_allocated_elements_panics() {
        let mut pool = pool_of_32_byte_elements();
        let _leaked = pool.alloc().unwrap();
    }

    #[test]
    fn drop_with_allocated_elements_allowed_by_policy() {
        let mut pool = BlockPool::builder()
            .layout_of::<u64>()
            .drop_policy(DropPolicy::MayReleaseOccupied)
            .build();

        let _leaked = pool.alloc().unwrap();
        drop(pool);
    }
}
