//! Keeps a runtime visual object for every node of a content tree, rebuilding the objects in
//! the background as the content changes.
//!
//! The host owns the content tree and tells a [`ProxyEngine`] which nodes exist and what
//! changed about them. For every node the engine maintains a proxy: a small record living in a
//! generation-checked slot, which owns the node's current runtime object and keeps it attached
//! to the [`World`].
//!
//! # Change handling
//!
//! - **Transform and selection changes** are pushed straight to the attached runtime object.
//! - **Content changes** capture a snapshot of the node and hand it to a [`Compiler`] on a
//!   [`TaskSpawner`]. The new runtime object replaces the old one once compiled.
//! - **Visibility changes** detach the runtime object of a hidden node and compile a fresh one
//!   when the node is shown again.
//!
//! # Stale results
//!
//! Every compile carries a ticket naming the slot, the generation of the proxy in that slot
//! and the version of the proxy at the time the compile was started. The ticket is checked
//! before compiling and again before the result is installed. If the proxy was updated again,
//! removed or replaced by a different proxy reusing the slot, the result is dropped and
//! counted in [`EngineStats`]. This is the normal outcome of racing updates, not an error.
//!
//! # Apply modes
//!
//! In [`ApplyMode::Immediate`] the compile task installs its result itself. In
//! [`ApplyMode::Deferred`] results are queued and installed by
//! [`ProxyEngine::update_all_proxies()`], which lets the host choose the point in its frame at
//! which runtime objects change.
//!
//! # Storage
//!
//! Proxy records are stored in a [`block_pool::BlockPool`], so their memory is reused as
//! proxies come and go, and an optional capacity limit turns exhaustion into a
//! [`CreateProxyError::NoSlotAvailable`] instead of unbounded growth.

mod compiler;
mod content;
mod engine;
mod error;
mod geometry;
mod index_table;
mod pipeline;
mod record;
mod selectable;
mod spawner;
mod stats;
mod table;
mod worker_pool;
mod world;

pub use compiler::*;
pub use content::*;
pub use engine::{ApplyMode, ProxyEngine, ProxyEngineBuilder};
pub(crate) use engine::{EngineState, Shared};
pub use error::*;
pub use geometry::*;
pub(crate) use index_table::*;
pub(crate) use pipeline::*;
pub use record::ProxyHandle;
pub(crate) use record::{CompileTicket, ProxyRecord, SelectionState};
pub use selectable::*;
pub use spawner::*;
pub use stats::EngineStats;
pub(crate) use stats::StatsCounters;
pub(crate) use table::*;
pub use worker_pool::{Scheduler, WorkerPool, WorkerPoolBuilder};
pub use world::{RuntimeObject, World};
pub(crate) use world::WorldGate;
