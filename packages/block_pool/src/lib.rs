//! A fixed-layout element pool that grows in blocks and tracks free elements with bitmasks.
//!
//! This crate provides [`BlockPool`], an allocator of raw memory elements that all share one
//! [`std::alloc::Layout`] chosen when the pool is created. It is intended as the storage layer
//! for higher-level containers that need stable element addresses and cheap reuse of freed
//! elements, without paying for a general-purpose allocator call per element.
//!
//! # Key Features
//!
//! - **Fixed element layout**: Every element has the same size and alignment.
//! - **Stable addresses**: An element never moves while it is allocated.
//! - **Block growth**: Memory is requested in blocks of 64 to 1024 elements, sized by the next
//!   power of two of the current capacity.
//! - **First-fit reuse**: Allocation hands out the lowest free element of the first block that
//!   has space, found with a word-at-a-time bitmask scan.
//! - **Capacity limits**: An optional cap on total capacity makes exhaustion observable as a
//!   `None` from [`BlockPool::alloc()`].
//! - **Drop policies**: Configure whether dropping a pool with live elements is an error.
//! - **Thread mobility**: The pool can be moved between threads but not shared without
//!   external synchronization.
//!
//! # Examples
//!
//! ## Raw elements
//!
//! ```rust
//! use std::alloc::Layout;
//!
//! use block_pool::BlockPool;
//!
//! let mut pool = BlockPool::builder()
//!     .layout(Layout::from_size_align(48, 16).unwrap())
//!     .build();
//!
//! let element = pool.alloc().unwrap();
//! assert_eq!(element.as_ptr().addr() % 16, 0);
//!
//! // SAFETY: The element came from this pool and is not used after being freed.
//! unsafe { pool.free(element) };
//! ```
//!
//! ## Typed values
//!
//! ```rust
//! use block_pool::BlockPool;
//!
//! let mut pool = BlockPool::builder().layout_of::<String>().build();
//!
//! // SAFETY: String matches the layout used to create the pool.
//! let greeting = unsafe { pool.insert("Hello".to_string()) }.unwrap();
//!
//! // SAFETY: The value was inserted as a String above and has not been removed yet.
//! let value = unsafe { pool.remove(greeting) };
//! assert_eq!(value, "Hello");
//! ```
//!
//! # Debug checks
//!
//! Debug builds verify the pool's bookkeeping after every mutation and panic on double frees
//! and on pointers that do not belong to the pool. Release builds silently ignore such calls.

mod block;
mod builder;
mod drop_policy;
mod pool;

pub(crate) use block::*;
pub use builder::*;
pub use drop_policy::*;
pub use pool::BlockPool;
