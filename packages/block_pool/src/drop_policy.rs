/// Determines what happens when a [`BlockPool`][crate::BlockPool] is dropped while some of its
/// elements are still allocated.
///
/// The pool never constructs or destroys values on its own, so there is nothing to "drop" in
/// the elements themselves - the only question is whether releasing the memory of live elements
/// is a legitimate thing to happen.
///
/// # Examples
///
/// ```
/// use block_pool::{BlockPool, DropPolicy};
///
/// let pool = BlockPool::builder()
///     .layout_of::<u64>()
///     .drop_policy(DropPolicy::MayReleaseOccupied)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool panics if any element is still allocated when the pool is dropped. This is the
    /// default, as an allocated element at teardown means its owner lost track of it.
    #[default]
    MustBeEmpty,

    /// The pool releases the memory of any still-allocated elements without complaint.
    ///
    /// No destructors are executed for the values in those elements.
    MayReleaseOccupied,
}
