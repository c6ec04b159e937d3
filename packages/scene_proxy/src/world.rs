use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{Bounds, ComponentId, Placement, SelectableId};

/// The visual representation of a content node, produced by a [`Compiler`][crate::Compiler].
///
/// A runtime object is exclusively owned by its proxy. The [`World`] only ever sees it by
/// reference, between an [`attach()`](World::attach) and the matching
/// [`detach()`](World::detach).
pub trait RuntimeObject: Send + 'static {
    /// Moves the object. Called for transform-only updates without recompiling the object.
    fn set_placement(&mut self, placement: &Placement);

    /// The components of the object, identified the same way as the components of the
    /// content node the object was compiled from.
    fn components(&self) -> Vec<ComponentId>;

    /// Binds the identity that picking should report for the given component.
    fn bind_selectable(&mut self, component: ComponentId, selectable: SelectableId);

    /// Updates the selection highlight. Every component is highlighted if `highlight_all` is
    /// set, otherwise only the components listed in `selected`.
    fn apply_selection(&mut self, highlight_all: bool, selected: &[ComponentId]);

    /// World-space bounds of the whole object, if it has any extent.
    fn bounds(&self) -> Option<Bounds>;

    /// World-space bounds of one component, if the component exists and has any extent.
    fn component_bounds(&self, component: ComponentId) -> Option<Bounds>;
}

/// The scene that renders attached runtime objects.
///
/// Attach and detach calls are always made in a consistent order: for any object, `detach()`
/// is called exactly once after each `attach()`, and calls for all proxies of one engine are
/// serialized, so implementations do not need to guard against reentrancy.
pub trait World: Send + Sync + 'static {
    /// The type of object rendered by this world.
    type Object: RuntimeObject;

    /// Starts rendering the object.
    fn attach(&self, object: &Self::Object);

    /// Stops rendering the object.
    fn detach(&self, object: &Self::Object);
}

/// Serializes attach/detach calls into the world.
///
/// This is the second of the two lock domains of the engine. It is only ever acquired while
/// already holding the proxy-table lock, never the other way around.
pub(crate) struct WorldGate<W> {
    world: Arc<W>,
    order: Mutex<()>,
}

impl<W: World> WorldGate<W> {
    pub(crate) fn new(world: Arc<W>) -> Self {
        Self {
            world,
            order: Mutex::new(()),
        }
    }

    pub(crate) fn world(&self) -> &Arc<W> {
        &self.world
    }

    /// Acquires the world-attach lock for a sequence of attach/detach calls.
    pub(crate) fn enter(&self) -> WorldSession<'_, W> {
        WorldSession {
            world: &self.world,
            _order: self.order.lock(),
        }
    }
}

impl<W> fmt::Debug for WorldGate<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldGate")
            .field("locked", &self.order.is_locked())
            .finish_non_exhaustive()
    }
}

/// A held world-attach lock. Attach and detach calls can only be made through this.
pub(crate) struct WorldSession<'a, W> {
    world: &'a W,
    _order: MutexGuard<'a, ()>,
}

impl<W: World> WorldSession<'_, W> {
    pub(crate) fn attach(&self, object: &W::Object) {
        self.world.attach(object);
    }

    pub(crate) fn detach(&self, object: &W::Object) {
        self.world.detach(object);
    }
}
