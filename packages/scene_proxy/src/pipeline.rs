use std::mem;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::{
    ApplyMode, CompileTicket, Compiler, ProxyRecord, RuntimeObject, SelectableId, Shared, World,
    WorldGate,
};

/// One asynchronous compile attempt for one proxy.
///
/// The task holds no reference to the proxy itself, only the ticket identifying the proxy and
/// the compile attempt. The ticket is validated twice: before compiling, so that work which is
/// already known to be unwanted is skipped, and again before applying, because the proxy may
/// have been updated, removed or recycled while the compile was running. A stale ticket at
/// either point is the normal outcome of a race and the task simply ends.
pub(crate) struct CompileTask<W: World, C: Compiler> {
    pub(crate) engine: Weak<Shared<W>>,
    pub(crate) compiler: Arc<C>,
    pub(crate) snapshot: C::Snapshot,
    pub(crate) ticket: CompileTicket,
}

impl<W, C> CompileTask<W, C>
where
    W: World,
    C: Compiler<Object = W::Object>,
{
    pub(crate) fn run(self) {
        if !self.pre_check() {
            return;
        }

        let Self {
            engine,
            compiler,
            snapshot,
            ticket,
        } = self;

        // No engine lock is held here. This is the only step that may block.
        let result = compiler.compile(snapshot);

        let Some(shared) = engine.upgrade() else {
            trace!(
                index = ticket.handle.index(),
                "engine dropped during compile, discarding result"
            );
            return;
        };

        match result {
            Ok(object) => shared.apply(ticket, object),
            Err(error) => {
                debug!(
                    index = ticket.handle.index(),
                    generation = ticket.handle.generation(),
                    version = ticket.version,
                    %error,
                    "compile failed, proxy keeps its current representation"
                );
                shared.stats.failed();
            }
        }
    }

    fn pre_check(&self) -> bool {
        let Some(shared) = self.engine.upgrade() else {
            trace!(
                index = self.ticket.handle.index(),
                "engine dropped before compile, discarding task"
            );
            return false;
        };

        let current = shared.state.lock().table.is_current(&self.ticket);

        if !current {
            trace!(
                index = self.ticket.handle.index(),
                generation = self.ticket.handle.generation(),
                version = self.ticket.version,
                "ticket stale before compile, discarding task"
            );
            shared.stats.discarded_before_compile();
        }

        current
    }
}

impl<W: World> Shared<W> {
    /// Post-check and apply step of a compile task.
    fn apply(&self, ticket: CompileTicket, object: W::Object) {
        let retired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(record) = state.table.current_mut(&ticket) else {
                trace!(
                    index = ticket.handle.index(),
                    generation = ticket.handle.generation(),
                    version = ticket.version,
                    "ticket stale after compile, discarding result"
                );
                self.stats.discarded_after_compile();
                return;
            };

            debug_assert!(
                record.visible,
                "hidden proxies never hold a current compile ticket"
            );

            if self.mode == ApplyMode::Deferred {
                state.reattach.push(PendingReattach { ticket, object });
                trace!(
                    index = ticket.handle.index(),
                    "compile result queued for reattach"
                );
                return;
            }

            let retired = install(&self.world, record, object);
            self.stats.applied();
            retired
        };

        // The replaced object is released after both locks have been let go.
        drop(retired);
    }

    /// Installs every queued compile result whose ticket is still current.
    pub(crate) fn reattach_pending(&self) {
        let retired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let pending = mem::take(&mut state.reattach);
            let mut retired = Vec::with_capacity(pending.len());

            for PendingReattach { ticket, object } in pending {
                let Some(record) = state.table.current_mut(&ticket) else {
                    trace!(
                        index = ticket.handle.index(),
                        generation = ticket.handle.generation(),
                        version = ticket.version,
                        "ticket stale at reattach, discarding result"
                    );
                    self.stats.discarded_after_compile();
                    retired.push(object);
                    continue;
                };

                retired.extend(install(&self.world, record, object));
                self.stats.applied();
            }

            retired
        };

        drop(retired);
    }
}

/// A compile result that passed the post-check and waits for the owner thread to install it.
#[derive(Debug)]
pub(crate) struct PendingReattach<O> {
    ticket: CompileTicket,
    object: O,
}

/// Makes `object` the runtime object of `record`, swapping it into the world in place of the
/// previous object (if any), which is returned to the caller for release.
///
/// Must be called with the proxy-table lock held. Takes the world-attach lock.
pub(crate) fn install<W: World>(
    world: &WorldGate<W>,
    record: &mut ProxyRecord<W::Object>,
    mut object: W::Object,
) -> Option<W::Object> {
    object.set_placement(&record.placement);

    for component in object.components() {
        object.bind_selectable(component, SelectableId::component(record.node, component));
    }

    object.apply_selection(record.selection.highlight_all, &record.selection.components);

    let session = world.enter();

    let previous = record.object.take();

    if let Some(previous) = &previous {
        session.detach(previous);
    }

    session.attach(record.object.insert(object));

    previous
}
