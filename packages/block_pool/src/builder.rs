use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{BlockPool, DropPolicy};

/// Configures and creates a [`BlockPool`].
///
/// Every element of a pool shares one layout, given either directly via `.layout()` or taken
/// from a type via `.layout_of::<T>()`. Setting a layout is required; the drop policy and the
/// capacity limit have defaults.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use block_pool::BlockPool;
///
/// let pool = BlockPool::builder()
///     .layout(Layout::from_size_align(32, 8).unwrap())
///     .build();
///
/// assert_eq!(pool.item_layout().size(), 32);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct BlockPoolBuilder {
    item_layout: Option<Layout>,
    drop_policy: DropPolicy,
    capacity_limit: Option<NonZero<usize>>,

    _not_sync: PhantomData<Cell<()>>,
}

impl BlockPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            item_layout: None,
            drop_policy: DropPolicy::default(),
            capacity_limit: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets the memory layout of the elements handed out by the pool.
    ///
    /// # Panics
    ///
    /// Panics if the layout has zero size.
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "BlockPool must have non-zero element size");
        self.item_layout = Some(layout);
        self
    }

    /// Sets the memory layout of the elements handed out by the pool to that of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[inline]
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the [drop policy][DropPolicy] for the pool.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Caps the total number of elements the pool may ever have room for.
    ///
    /// Once the cap is reached, [`BlockPool::alloc()`] returns `None` until an element is freed,
    /// exactly as if the system allocator had refused to provide another block.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::builder()
    ///     .layout_of::<u64>()
    ///     .capacity_limit(NonZero::new(1).unwrap())
    ///     .build();
    ///
    /// let first = pool.alloc().unwrap();
    /// assert!(pool.alloc().is_none());
    ///
    /// // SAFETY: The element came from this pool and is not used after this.
    /// unsafe { pool.free(first) };
    /// ```
    #[inline]
    pub fn capacity_limit(mut self, limit: NonZero<usize>) -> Self {
        self.capacity_limit = Some(limit);
        self
    }

    /// Creates the pool. No memory is allocated until the first element is requested.
    ///
    /// # Panics
    ///
    /// Panics if neither [`layout`](Self::layout) nor [`layout_of`](Self::layout_of) was called.
    #[must_use]
    #[inline]
    pub fn build(self) -> BlockPool {
        let layout = self
            .item_layout
            .expect("BlockPool needs an element layout: call .layout() or .layout_of::<T>() first");

        BlockPool::new_inner(layout, self.drop_policy, self.capacity_limit)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockPoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(BlockPoolBuilder: Sync);

    #[test]
    fn fresh_builder_has_defaults() {
        let builder = BlockPoolBuilder::new();
        assert!(builder.item_layout.is_none());
        assert!(builder.capacity_limit.is_none());
        assert_eq!(builder.drop_policy, DropPolicy::MustBeEmpty);
    }

    #[test]
    fn layout_of_uses_type_layout() {
        let builder = BlockPoolBuilder::new().layout_of::<[u64; 4]>();
        assert_eq!(builder.item_layout, Some(Layout::new::<[u64; 4]>()));
    }

    #[test]
    #[should_panic]
    fn layout_of_zero_sized_type_panics() {
        let _builder = BlockPoolBuilder::new().layout_of::<()>();
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _pool = BlockPoolBuilder::new().build();
    }

    #[test]
    fn settings_reach_the_pool() {
        let pool = BlockPoolBuilder::new()
            .layout_of::<u32>()
            .drop_policy(DropPolicy::MayReleaseOccupied)
            .capacity_limit(NonZero::new(10).unwrap())
            .build();

        assert_eq!(pool.item_layout(), Layout::new::<u32>());
        assert_eq!(pool.capacity_limit(), NonZero::new(10));
    }
}
