use std::fmt;
use std::mem;
use std::num::NonZero;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    Bounds, CompileTask, CompileTicket, Compiler, ComponentId, ContentNode, CreateProxyError,
    DirtyFlags, EngineStats, NodeId, NodeRegistry, PendingReattach, ProxyHandle, ProxyRecord,
    ProxyTable, Resolved, RuntimeObject, SelectableId, SelectionState, StatsCounters, TaskSpawner,
    WorkerPool, World, WorldGate, resolve_selectable,
};

/// Determines who installs a successfully compiled runtime object on its proxy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ApplyMode {
    /// The compile task installs the object itself, right after compiling it.
    #[default]
    Immediate,

    /// The compile task only queues the object. It is installed by the next call to
    /// [`ProxyEngine::update_all_proxies()`], typically made once per frame by the thread that
    /// owns the content tree.
    Deferred,
}

/// The state guarded by the proxy-table lock.
#[derive(Debug)]
pub(crate) struct EngineState<O> {
    pub(crate) table: ProxyTable<O>,
    pub(crate) reattach: Vec<PendingReattach<O>>,
}

/// The part of the engine that compile tasks can reach.
///
/// Tasks only hold a weak reference to this, so dropping the engine makes every outstanding task
/// stale.
pub(crate) struct Shared<W: World> {
    /// The proxy-table lock. Always acquired before the world-attach lock in `world`.
    pub(crate) state: Mutex<EngineState<W::Object>>,
    pub(crate) world: WorldGate<W>,
    pub(crate) mode: ApplyMode,
    pub(crate) stats: StatsCounters,
}

/// A compile that has been given a ticket but not yet handed to the spawner.
struct PendingCompile<S> {
    ticket: CompileTicket,
    snapshot: S,
}

/// Keeps a runtime object for every content node in sync with the node.
///
/// The host reports content changes through [`create_proxy()`](Self::create_proxy),
/// [`update_proxy()`](Self::update_proxy) and [`remove_proxy()`](Self::remove_proxy). Cheap
/// changes (placement, selection) are pushed to the attached runtime object directly. Content
/// changes start an asynchronous compile of a new runtime object, which replaces the old one
/// once it is ready. If the proxy has been changed again or removed in the meantime, the result
/// is silently discarded.
///
/// # Locking
///
/// The engine has two locks: the proxy-table lock guarding all proxy bookkeeping and the
/// world-attach lock serializing calls into the [`World`]. When both are needed, the proxy-table
/// lock is acquired first. Neither lock is held while compiling or while spawning tasks.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use scene_proxy::{
///     Bounds, CompileError, Compiler, ComponentId, ComponentInfo, ContentNode, DirtyFlags,
///     InlineSpawner, NodeId, Placement, ProxyEngine, RuntimeObject, SelectableId, World,
/// };
///
/// struct Marker(Placement);
///
/// impl RuntimeObject for Marker {
///     fn set_placement(&mut self, placement: &Placement) {
///         self.0 = *placement;
///     }
///     fn components(&self) -> Vec<ComponentId> {
///         Vec::new()
///     }
///     fn bind_selectable(&mut self, _: ComponentId, _: SelectableId) {}
///     fn apply_selection(&mut self, _: bool, _: &[ComponentId]) {}
///     fn bounds(&self) -> Option<Bounds> {
///         let [x, y, z] = self.0.translation;
///         Some(Bounds::new([x, y, z], [x, y, z]))
///     }
///     fn component_bounds(&self, _: ComponentId) -> Option<Bounds> {
///         None
///     }
/// }
///
/// struct Scene;
///
/// impl World for Scene {
///     type Object = Marker;
///     fn attach(&self, _: &Marker) {}
///     fn detach(&self, _: &Marker) {}
/// }
///
/// struct MarkerCompiler;
///
/// impl Compiler for MarkerCompiler {
///     type Snapshot = ();
///     type Object = Marker;
///     fn compile(&self, _: ()) -> Result<Marker, CompileError> {
///         Ok(Marker(Placement::IDENTITY))
///     }
/// }
///
/// struct Node(Placement);
///
/// impl ContentNode for Node {
///     type Snapshot = ();
///     fn id(&self) -> NodeId {
///         NodeId::new(1)
///     }
///     fn placement(&self) -> Placement {
///         self.0
///     }
///     fn compile_snapshot(&self) -> Option<()> {
///         Some(())
///     }
///     fn is_visible(&self) -> bool {
///         true
///     }
///     fn is_selected(&self) -> bool {
///         false
///     }
///     fn parent(&self) -> Option<&Self> {
///         None
///     }
///     fn components(&self) -> Vec<ComponentInfo> {
///         Vec::new()
///     }
/// }
///
/// let engine = ProxyEngine::builder(Arc::new(Scene), MarkerCompiler)
///     .spawner(Arc::new(InlineSpawner::default()))
///     .build();
///
/// let mut node = Node(Placement::IDENTITY);
/// engine.create_proxy(&node).unwrap();
/// assert!(engine.has_object(NodeId::new(1)));
///
/// node.0 = Placement::from_translation([5.0, 0.0, 0.0]);
/// let mut flags = DirtyFlags::TRANSFORM;
/// engine.update_proxy(&node, &mut flags);
/// assert!(flags.is_empty());
///
/// let bounds = engine.proxy_bounds(NodeId::new(1)).unwrap();
/// assert_eq!(bounds.min(), [5.0, 0.0, 0.0]);
/// ```
pub struct ProxyEngine<W, C>
where
    W: World,
    C: Compiler<Object = W::Object>,
{
    shared: Arc<Shared<W>>,
    compiler: Arc<C>,

    // Must be dropped last. An owned worker pool joins its workers here.
    spawner: Arc<dyn TaskSpawner>,
}

impl<W, C> ProxyEngine<W, C>
where
    W: World,
    C: Compiler<Object = W::Object>,
{
    /// Creates a builder for an engine that mirrors content into `world`, compiling runtime
    /// objects with `compiler`.
    pub fn builder(world: Arc<W>, compiler: C) -> ProxyEngineBuilder<W, C> {
        ProxyEngineBuilder::new(world, compiler)
    }

    /// Creates a proxy for a content node and starts compiling its runtime object.
    ///
    /// No compile is started if the node is not visible or has nothing to compile.
    ///
    /// # Errors
    ///
    /// Returns [`CreateProxyError::AlreadyExists`] if the node already has a proxy and
    /// [`CreateProxyError::NoSlotAvailable`] if proxy storage is exhausted. In both cases
    /// nothing is created.
    pub fn create_proxy<N>(&self, node: &N) -> Result<ProxyHandle, CreateProxyError>
    where
        N: ContentNode<Snapshot = C::Snapshot>,
    {
        let id = node.id();

        let (handle, compile) = {
            let mut state = self.shared.state.lock();

            let record = match state.table.insert(
                id,
                node.placement(),
                node.is_visible(),
                SelectionState::of(node),
            ) {
                Ok(record) => record,
                Err(error) => {
                    debug!(node = %id, %error, "proxy not created");
                    return Err(error);
                }
            };

            let compile = if record.visible {
                self.prepare_compile(record, node)
            } else {
                None
            };

            (record.handle(), compile)
        };

        trace!(
            node = %id,
            index = handle.index(),
            generation = handle.generation(),
            "created proxy"
        );

        if let Some(compile) = compile {
            self.spawn_compile(compile);
        }

        Ok(handle)
    }

    /// Removes the proxy of a node, detaching and releasing its runtime object.
    ///
    /// Compiles still in flight for the proxy will discard their results. Returns `false` if
    /// the node had no proxy.
    pub fn remove_proxy(&self, node: NodeId) -> bool {
        let record = {
            let mut state = self.shared.state.lock();

            let Some(record) = state.table.remove(node) else {
                return false;
            };

            if let Some(object) = &record.object {
                self.shared.world.enter().detach(object);
            }

            record
        };

        trace!(
            node = %node,
            index = record.index,
            generation = record.generation,
            "removed proxy"
        );

        true
    }

    /// Brings the proxy of a node up to date with the changes described by `flags`.
    ///
    /// Changes are serviced in the order visibility, transform, content, selection, and each
    /// serviced flag is removed from `flags`. Flags of a node without a proxy are left as
    /// they are.
    ///
    /// Only a content change (or a hidden node becoming visible) starts a new compile. A
    /// transform or selection change is pushed directly to the attached runtime object.
    pub fn update_proxy<N>(&self, node: &N, flags: &mut DirtyFlags)
    where
        N: ContentNode<Snapshot = C::Snapshot>,
    {
        let id = node.id();

        let (compile, retired) = {
            let mut state = self.shared.state.lock();

            let Some(record) = state.table.find_mut(id) else {
                debug!(node = %id, "ignoring update for node without proxy");
                return;
            };

            let mut compile = None;
            let mut retired = None;

            if flags.contains(DirtyFlags::VISIBILITY) {
                (compile, retired) = self.update_visibility(record, node);
                flags.remove(DirtyFlags::VISIBILITY);
            }

            if flags.contains(DirtyFlags::TRANSFORM) {
                record.placement = node.placement();

                if let Some(object) = &mut record.object {
                    object.set_placement(&record.placement);
                }

                flags.remove(DirtyFlags::TRANSFORM);
            }

            if flags.contains(DirtyFlags::CONTENT) {
                // Becoming visible has already started a compile of the current content.
                if record.visible && compile.is_none() {
                    compile = self.prepare_compile(record, node);
                }

                flags.remove(DirtyFlags::CONTENT);
            }

            if flags.contains(DirtyFlags::SELECTION) {
                update_selection(record, node);
                flags.remove(DirtyFlags::SELECTION);
            }

            (compile, retired)
        };

        drop(retired);

        if let Some(compile) = compile {
            self.spawn_compile(compile);
        }
    }

    /// Removes every proxy, detaching and releasing all runtime objects.
    ///
    /// All proxy storage is returned to empty. Compiles still in flight will discard their
    /// results.
    pub fn clear_all_proxies(&self) {
        let (records, pending) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;

            let records = state.table.drain();
            let pending = mem::take(&mut state.reattach);

            let session = self.shared.world.enter();

            for object in records.iter().filter_map(|record| record.object.as_ref()) {
                session.detach(object);
            }

            (records, pending)
        };

        if !records.is_empty() {
            debug!(
                proxies = records.len(),
                discarded_results = pending.len(),
                "cleared all proxies"
            );
        }
    }

    /// Installs compile results queued in [`ApplyMode::Deferred`].
    ///
    /// Results that have gone stale since they were queued are discarded. Does nothing in
    /// [`ApplyMode::Immediate`].
    pub fn update_all_proxies(&self) {
        self.shared.reattach_pending();
    }

    /// World-space bounds of the runtime object of a node.
    ///
    /// Returns `None` if the node has no proxy, no runtime object is attached, or the object
    /// has no extent.
    #[must_use]
    pub fn proxy_bounds(&self, node: NodeId) -> Option<Bounds> {
        self.with_object(node, |object| object.bounds())
            .flatten()
            .filter(|bounds| !bounds.is_empty())
    }

    /// World-space bounds of one component of the runtime object of a node.
    ///
    /// Returns `None` under the same conditions as [`proxy_bounds()`](Self::proxy_bounds) and
    /// if the runtime object has no such component.
    #[must_use]
    pub fn component_bounds(&self, node: NodeId, component: ComponentId) -> Option<Bounds> {
        self.with_object(node, |object| object.component_bounds(component))
            .flatten()
            .filter(|bounds| !bounds.is_empty())
    }

    /// Translates a picking result back into the content tree.
    ///
    /// See [`resolve_selectable()`][crate::resolve_selectable]. Takes no engine locks.
    pub fn resolve_selectable<R: NodeRegistry>(
        &self,
        registry: &R,
        selectable: SelectableId,
    ) -> Option<Resolved<R::Handle>> {
        resolve_selectable(registry, selectable)
    }

    /// Number of live proxies.
    #[must_use]
    pub fn proxy_count(&self) -> usize {
        self.shared.state.lock().table.len()
    }

    /// The handle of the proxy of a node.
    #[must_use]
    pub fn proxy_handle(&self, node: NodeId) -> Option<ProxyHandle> {
        self.shared
            .state
            .lock()
            .table
            .find(node)
            .map(ProxyRecord::handle)
    }

    /// The current version of the proxy of a node: the number of compiles started for it,
    /// plus the number of times it was hidden.
    #[must_use]
    pub fn proxy_version(&self, node: NodeId) -> Option<u32> {
        self.shared
            .state
            .lock()
            .table
            .find(node)
            .map(ProxyRecord::version)
    }

    /// Whether the proxy of a node has a runtime object attached.
    #[must_use]
    pub fn has_object(&self, node: NodeId) -> bool {
        self.with_object(node, |_| ()).is_some()
    }

    /// Calls `f` with the runtime object of a node, if one is attached.
    ///
    /// `f` runs with the proxy-table lock held and must not call back into the engine.
    pub fn with_object<R>(&self, node: NodeId, f: impl FnOnce(&W::Object) -> R) -> Option<R> {
        let state = self.shared.state.lock();
        let object = state.table.find(node)?.object.as_ref()?;

        Some(f(object))
    }

    /// Number of compile results waiting for [`update_all_proxies()`](Self::update_all_proxies).
    #[must_use]
    pub fn pending_reattach_count(&self) -> usize {
        self.shared.state.lock().reattach.len()
    }

    /// Counters describing what happened to the compiles started by this engine.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.shared.stats.snapshot()
    }

    /// The world runtime objects are attached to.
    #[must_use]
    pub fn world(&self) -> &Arc<W> {
        self.shared.world.world()
    }

    /// How compile results are installed.
    #[must_use]
    pub fn apply_mode(&self) -> ApplyMode {
        self.shared.mode
    }

    fn update_visibility<N>(
        &self,
        record: &mut ProxyRecord<W::Object>,
        node: &N,
    ) -> (Option<PendingCompile<C::Snapshot>>, Option<W::Object>)
    where
        N: ContentNode<Snapshot = C::Snapshot>,
    {
        let visible = node.is_visible();

        if record.visible == visible {
            return (None, None);
        }

        record.visible = visible;

        if visible {
            return (self.prepare_compile(record, node), None);
        }

        // Any compile still in flight was started for a visible proxy and must not apply.
        record.bump_version();

        let retired = record.object.take();

        if let Some(object) = &retired {
            self.shared.world.enter().detach(object);
        }

        (None, retired)
    }

    /// Issues a new ticket for the proxy and captures the node's content for compilation.
    ///
    /// Must be called with the proxy-table lock held. The returned compile must be spawned
    /// after the lock is released.
    fn prepare_compile<N>(
        &self,
        record: &ProxyRecord<W::Object>,
        node: &N,
    ) -> Option<PendingCompile<C::Snapshot>>
    where
        N: ContentNode<Snapshot = C::Snapshot>,
    {
        let snapshot = node.compile_snapshot()?;
        let ticket = record.issue_ticket();

        self.shared.stats.compile_started();

        trace!(
            node = %record.node,
            index = ticket.handle.index(),
            generation = ticket.handle.generation(),
            version = ticket.version,
            "starting compile"
        );

        Some(PendingCompile { ticket, snapshot })
    }

    fn spawn_compile(&self, compile: PendingCompile<C::Snapshot>) {
        let task = CompileTask {
            engine: Arc::downgrade(&self.shared),
            compiler: Arc::clone(&self.compiler),
            snapshot: compile.snapshot,
            ticket: compile.ticket,
        };

        self.spawner.spawn(Box::new(move || task.run()));
    }
}

/// Recomputes the selection state of a proxy, pushing it to the runtime object if it changed.
fn update_selection<O: RuntimeObject, N: ContentNode>(record: &mut ProxyRecord<O>, node: &N) {
    let selection = SelectionState::of(node);

    if selection == record.selection {
        return;
    }

    record.selection = selection;

    if let Some(object) = &mut record.object {
        object.apply_selection(record.selection.highlight_all, &record.selection.components);
    }
}

impl<W, C> Drop for ProxyEngine<W, C>
where
    W: World,
    C: Compiler<Object = W::Object>,
{
    fn drop(&mut self) {
        self.clear_all_proxies();
    }
}

impl<W, C> fmt::Debug for ProxyEngine<W, C>
where
    W: World,
    C: Compiler<Object = W::Object>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("mode", &self.shared.mode)
            .field("proxy_count", &self.proxy_count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`ProxyEngine`].
///
/// The world and the compiler are mandatory and are passed to
/// [`ProxyEngine::builder()`]. Everything else is optional.
#[must_use]
pub struct ProxyEngineBuilder<W, C> {
    world: Arc<W>,
    compiler: C,
    spawner: Option<Arc<dyn TaskSpawner>>,
    apply_mode: ApplyMode,
    capacity_limit: Option<NonZero<usize>>,
}

impl<W, C> ProxyEngineBuilder<W, C>
where
    W: World,
    C: Compiler<Object = W::Object>,
{
    fn new(world: Arc<W>, compiler: C) -> Self {
        Self {
            world,
            compiler,
            spawner: None,
            apply_mode: ApplyMode::default(),
            capacity_limit: None,
        }
    }

    /// Sets where compile tasks run.
    ///
    /// By default, the engine creates its own [`WorkerPool`] with default settings.
    pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Sets how compile results are installed. Default is [`ApplyMode::Immediate`].
    pub fn apply_mode(mut self, mode: ApplyMode) -> Self {
        self.apply_mode = mode;
        self
    }

    /// Caps the number of proxies that can exist at the same time.
    ///
    /// Once the cap is reached, [`ProxyEngine::create_proxy()`] fails with
    /// [`CreateProxyError::NoSlotAvailable`] until a proxy is removed.
    pub fn capacity_limit(mut self, limit: NonZero<usize>) -> Self {
        self.capacity_limit = Some(limit);
        self
    }

    /// Builds the engine with the configured settings.
    #[must_use]
    pub fn build(self) -> ProxyEngine<W, C> {
        let spawner: Arc<dyn TaskSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(WorkerPool::new()),
        };

        ProxyEngine {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    table: ProxyTable::new(self.capacity_limit),
                    reattach: Vec::new(),
                }),
                world: WorldGate::new(self.world),
                mode: self.apply_mode,
                stats: StatsCounters::default(),
            }),
            compiler: Arc::new(self.compiler),
            spawner,
        }
    }
}

impl<W, C> fmt::Debug for ProxyEngineBuilder<W, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEngineBuilder")
            .field("has_spawner", &self.spawner.is_some())
            .field("apply_mode", &self.apply_mode)
            .field("capacity_limit", &self.capacity_limit)
            .finish_non_exhaustive()
    }
}
