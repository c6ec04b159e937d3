//! Races between content updates and in-flight compiles, driven step by step from the test.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use scene_proxy::{
    ApplyMode, Bounds, CompileError, Compiler, ComponentId, ComponentInfo, ContentNode,
    DirtyFlags, NodeId, NodeRegistry, Placement, ProxyEngine, Resolved, RuntimeObject,
    SelectableId, Task, TaskSpawner, WorkerPool, World,
};

#[derive(Debug)]
struct TestObject {
    content: u32,
    placement: Placement,
    transform_pushes: usize,
}

impl RuntimeObject for TestObject {
    fn set_placement(&mut self, placement: &Placement) {
        self.placement = *placement;
        self.transform_pushes = self.transform_pushes.wrapping_add(1);
    }

    fn components(&self) -> Vec<ComponentId> {
        vec![ComponentId::new(1)]
    }

    fn bind_selectable(&mut self, _component: ComponentId, _selectable: SelectableId) {}

    fn apply_selection(&mut self, _highlight_all: bool, _selected: &[ComponentId]) {}

    fn bounds(&self) -> Option<Bounds> {
        let [x, y, z] = self.placement.translation;
        Some(Bounds::new([x, y, z], [x, y, z]))
    }

    fn component_bounds(&self, _component: ComponentId) -> Option<Bounds> {
        None
    }
}

/// Tracks attached objects by content, failing loudly on unbalanced detach calls.
#[derive(Debug, Default)]
struct FakeWorld {
    attached: Mutex<Vec<u32>>,
}

impl FakeWorld {
    fn attached(&self) -> Vec<u32> {
        let mut attached = self.attached.lock().clone();
        attached.sort_unstable();
        attached
    }
}

impl World for FakeWorld {
    type Object = TestObject;

    fn attach(&self, object: &TestObject) {
        self.attached.lock().push(object.content);
    }

    fn detach(&self, object: &TestObject) {
        let mut attached = self.attached.lock();
        let position = attached
            .iter()
            .position(|content| *content == object.content)
            .expect("detached an object that was never attached");
        attached.swap_remove(position);
    }
}

/// One release channel per content value, so held compiles can be finished in any order.
#[derive(Clone, Debug, Default)]
struct Releases {
    channels: Arc<Mutex<HashMap<u32, (Sender<()>, Receiver<()>)>>>,
}

impl Releases {
    fn channel(&self, content: u32) -> (Sender<()>, Receiver<()>) {
        self.channels
            .lock()
            .entry(content)
            .or_insert_with(channel::unbounded)
            .clone()
    }
}

/// Lets the test hold a compile between its pre-check and its post-check.
#[derive(Debug)]
struct Gate {
    entered: Sender<u32>,
    releases: Releases,
}

#[derive(Debug, Default)]
struct TestCompiler {
    gate: Option<Gate>,
}

impl Compiler for TestCompiler {
    type Snapshot = u32;
    type Object = TestObject;

    fn compile(&self, content: u32) -> Result<TestObject, CompileError> {
        if let Some(gate) = &self.gate {
            let (_, release) = gate.releases.channel(content);

            gate.entered.send(content).unwrap();
            release.recv().unwrap();
        }

        if content == u32::MAX {
            return Err(CompileError::Failed("unsupported content".to_string()));
        }

        Ok(TestObject {
            content,
            placement: Placement::IDENTITY,
            transform_pushes: 0,
        })
    }
}

/// Queues tasks until the test decides to run them.
#[derive(Default)]
struct QueueSpawner {
    tasks: Mutex<VecDeque<Task>>,
}

impl QueueSpawner {
    fn pop(&self) -> Task {
        self.tasks.lock().pop_front().expect("no task was spawned")
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TaskSpawner for QueueSpawner {
    fn spawn(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}

/// Runs tasks on a worker pool and keeps track of how many have not finished yet.
#[derive(Debug)]
struct TrackingSpawner {
    pool: WorkerPool,
    outstanding: Arc<AtomicUsize>,
}

impl TrackingSpawner {
    fn new() -> Self {
        Self {
            pool: WorkerPool::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn wait_idle(&self) {
        while self.outstanding.load(Ordering::Acquire) != 0 {
            thread::yield_now();
        }
    }
}

impl TaskSpawner for TrackingSpawner {
    fn spawn(&self, task: Task) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let outstanding = Arc::clone(&self.outstanding);

        self.pool.spawn(Box::new(move || {
            task();
            outstanding.fetch_sub(1, Ordering::AcqRel);
        }));
    }
}

#[derive(Debug)]
struct TestNode {
    id: NodeId,
    placement: Placement,
    content: Option<u32>,
    visible: bool,
}

impl TestNode {
    fn new(id: u64, content: Option<u32>) -> Self {
        Self {
            id: NodeId::new(id),
            placement: Placement::IDENTITY,
            content,
            visible: true,
        }
    }
}

impl ContentNode for TestNode {
    type Snapshot = u32;

    fn id(&self) -> NodeId {
        self.id
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn compile_snapshot(&self) -> Option<u32> {
        self.content
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn is_selected(&self) -> bool {
        false
    }

    fn parent(&self) -> Option<&Self> {
        None
    }

    fn components(&self) -> Vec<ComponentInfo> {
        vec![ComponentInfo::new(ComponentId::new(1), false)]
    }
}

type TestEngine = ProxyEngine<FakeWorld, TestCompiler>;

struct Harness {
    engine: TestEngine,
    spawner: Arc<QueueSpawner>,
    entered: Receiver<u32>,
    releases: Releases,
}

/// A compile held inside the compiler on its own thread.
struct InFlight {
    content: u32,
    handle: thread::JoinHandle<()>,
}

impl Harness {
    fn new(mode: ApplyMode) -> Self {
        let (entered_tx, entered) = channel::unbounded();
        let releases = Releases::default();

        let compiler = TestCompiler {
            gate: Some(Gate {
                entered: entered_tx,
                releases: releases.clone(),
            }),
        };

        let spawner = Arc::new(QueueSpawner::default());

        let engine = ProxyEngine::builder(Arc::new(FakeWorld::default()), compiler)
            .spawner(Arc::clone(&spawner) as Arc<dyn TaskSpawner>)
            .apply_mode(mode)
            .build();

        Self {
            engine,
            spawner,
            entered,
            releases,
        }
    }

    /// Starts the next queued task on its own thread and waits until it is compiling.
    fn start_next(&self) -> InFlight {
        let task = self.spawner.pop();
        let handle = thread::spawn(task);

        let content = self.entered.recv().unwrap();
        InFlight { content, handle }
    }

    /// Lets a held compile return and waits for its result to be handled.
    fn finish(&self, in_flight: InFlight) {
        let (release, _) = self.releases.channel(in_flight.content);

        release.send(()).unwrap();
        in_flight.handle.join().unwrap();
    }

    /// Runs the next queued task to completion.
    fn run_next(&self) {
        self.finish(self.start_next());
    }

    /// Runs the next queued task, which is expected to be discarded before compiling.
    fn discard_next(&self) {
        (self.spawner.pop())();

        assert!(self.entered.try_recv().is_err());
    }

    fn content_of(&self, node: NodeId) -> Option<u32> {
        self.engine.with_object(node, |object| object.content)
    }
}

fn update(engine: &TestEngine, node: &TestNode, flags: DirtyFlags) {
    let mut flags = flags;
    engine.update_proxy(node, &mut flags);
    assert!(flags.is_empty());
}

#[cfg_attr(miri, ignore)]
#[test]
fn result_for_recycled_slot_is_discarded() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut a = TestNode::new(10, None);
    let a_handle = engine.create_proxy(&a).unwrap();
    assert_eq!(a_handle.index(), 0);
    assert_eq!(a_handle.generation(), 1);
    assert_eq!(engine.proxy_version(a.id), Some(0));

    a.content = Some(1);
    update(engine, &a, DirtyFlags::CONTENT);
    assert_eq!(engine.proxy_version(a.id), Some(1));

    let in_flight = harness.start_next();

    assert!(engine.remove_proxy(a.id));
    let b = TestNode::new(11, None);
    let b_handle = engine.create_proxy(&b).unwrap();

    // Same slot, next generation, fresh version.
    assert_eq!(b_handle.index(), 0);
    assert_eq!(b_handle.generation(), 2);
    assert_eq!(engine.proxy_version(b.id), Some(0));

    harness.finish(in_flight);

    assert!(!engine.has_object(b.id));
    assert!(engine.world().attached().is_empty());

    let stats = engine.stats();
    assert_eq!(stats.discarded_after_compile, 1);
    assert_eq!(stats.applied, 0);
}

#[cfg_attr(miri, ignore)]
#[test]
fn superseded_task_skips_compile() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();

    node.content = Some(2);
    update(engine, &node, DirtyFlags::CONTENT);
    assert_eq!(harness.spawner.len(), 2);

    // The compile started by create_proxy() is already stale when it runs.
    harness.discard_next();
    assert_eq!(engine.stats().discarded_before_compile, 1);

    harness.run_next();

    assert_eq!(harness.content_of(node.id), Some(2));
    assert_eq!(engine.stats().applied, 1);
}

#[cfg_attr(miri, ignore)]
#[test]
fn superseded_compile_does_not_overwrite_newer_content() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();

    let first = harness.start_next();

    node.content = Some(2);
    update(engine, &node, DirtyFlags::CONTENT);

    // The first compile finishes after the second was requested.
    harness.finish(first);
    assert!(!engine.has_object(node.id));

    harness.run_next();

    assert_eq!(harness.content_of(node.id), Some(2));
    assert_eq!(engine.world().attached(), vec![2]);

    let stats = engine.stats();
    assert_eq!(stats.compiles_started, 2);
    assert_eq!(stats.discarded_after_compile, 1);
    assert_eq!(stats.applied, 1);
}

#[cfg_attr(miri, ignore)]
#[test]
fn late_superseded_result_leaves_newer_object_in_place() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();

    let first = harness.start_next();

    node.content = Some(2);
    update(engine, &node, DirtyFlags::CONTENT);

    // The second compile overtakes the first one and is installed.
    harness.run_next();
    assert_eq!(harness.content_of(node.id), Some(2));

    harness.finish(first);

    assert_eq!(harness.content_of(node.id), Some(2));
    assert_eq!(engine.world().attached(), vec![2]);

    let stats = engine.stats();
    assert_eq!(stats.compiles_started, 2);
    assert_eq!(stats.discarded_after_compile, 1);
    assert_eq!(stats.applied, 1);
}

#[cfg_attr(miri, ignore)]
#[test]
fn newer_result_replaces_older_one_in_world() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();
    harness.run_next();
    assert_eq!(engine.world().attached(), vec![1]);

    node.content = Some(2);
    update(engine, &node, DirtyFlags::CONTENT);
    harness.run_next();

    assert_eq!(engine.world().attached(), vec![2]);
}

#[cfg_attr(miri, ignore)]
#[test]
fn transform_update_bypasses_compilation() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();
    harness.run_next();

    let pushes_at_install = engine
        .with_object(node.id, |object| object.transform_pushes)
        .unwrap();

    node.placement = Placement::from_translation([3.0, 2.0, 1.0]);
    update(engine, &node, DirtyFlags::TRANSFORM);

    assert_eq!(harness.spawner.len(), 0);
    assert_eq!(
        engine.with_object(node.id, |object| object.transform_pushes),
        Some(pushes_at_install.wrapping_add(1))
    );
    assert_eq!(
        engine.proxy_bounds(node.id),
        Some(Bounds::new([3.0, 2.0, 1.0], [3.0, 2.0, 1.0]))
    );
}

#[cfg_attr(miri, ignore)]
#[test]
fn transform_during_compile_is_applied_to_new_object() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();

    let compiling = harness.start_next();

    node.placement = Placement::from_translation([7.0, 0.0, 0.0]);
    update(engine, &node, DirtyFlags::TRANSFORM);

    harness.finish(compiling);

    assert_eq!(
        engine.proxy_bounds(node.id),
        Some(Bounds::new([7.0, 0.0, 0.0], [7.0, 0.0, 0.0]))
    );
}

#[cfg_attr(miri, ignore)]
#[test]
fn hiding_during_compile_discards_result() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let mut node = TestNode::new(1, Some(1));
    engine.create_proxy(&node).unwrap();

    let compiling = harness.start_next();

    node.visible = false;
    update(engine, &node, DirtyFlags::VISIBILITY);

    harness.finish(compiling);

    assert!(!engine.has_object(node.id));
    assert!(engine.world().attached().is_empty());
    assert_eq!(engine.stats().discarded_after_compile, 1);

    node.visible = true;
    update(engine, &node, DirtyFlags::VISIBILITY);
    harness.run_next();

    assert_eq!(harness.content_of(node.id), Some(1));
}

#[cfg_attr(miri, ignore)]
#[test]
fn deferred_results_are_installed_by_owner() {
    let harness = Harness::new(ApplyMode::Deferred);
    let engine = &harness.engine;

    let node = TestNode::new(1, Some(5));
    engine.create_proxy(&node).unwrap();

    let compiling = harness.start_next();
    harness.finish(compiling);

    assert!(!engine.has_object(node.id));
    assert_eq!(engine.pending_reattach_count(), 1);
    assert!(engine.world().attached().is_empty());

    engine.update_all_proxies();

    assert_eq!(harness.content_of(node.id), Some(5));
    assert_eq!(engine.world().attached(), vec![5]);
    assert_eq!(engine.pending_reattach_count(), 0);
}

#[cfg_attr(miri, ignore)]
#[test]
fn deferred_result_of_removed_proxy_is_discarded() {
    let harness = Harness::new(ApplyMode::Deferred);
    let engine = &harness.engine;

    let node = TestNode::new(1, Some(5));
    engine.create_proxy(&node).unwrap();
    harness.run_next();

    engine.remove_proxy(node.id);
    engine.update_all_proxies();

    assert!(engine.world().attached().is_empty());
    assert_eq!(engine.stats().discarded_after_compile, 1);
    assert_eq!(engine.stats().applied, 0);
}

#[cfg_attr(miri, ignore)]
#[test]
fn failed_compile_is_counted() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let node = TestNode::new(1, Some(u32::MAX));
    engine.create_proxy(&node).unwrap();
    harness.run_next();

    assert!(!engine.has_object(node.id));
    assert_eq!(engine.stats().failed, 1);
}

#[cfg_attr(miri, ignore)]
#[test]
fn tasks_outliving_engine_do_nothing() {
    let harness = Harness::new(ApplyMode::Immediate);
    let world = Arc::clone(harness.engine.world());

    harness
        .engine
        .create_proxy(&TestNode::new(1, Some(1)))
        .unwrap();

    let Harness {
        engine,
        spawner,
        entered,
        ..
    } = harness;

    drop(engine);

    (spawner.pop())();

    assert!(entered.try_recv().is_err());
    assert!(world.attached().is_empty());
}

#[cfg_attr(miri, ignore)]
#[test]
fn clear_all_discards_in_flight_compiles() {
    let harness = Harness::new(ApplyMode::Immediate);
    let engine = &harness.engine;

    let first = TestNode::new(1, Some(1));
    let second = TestNode::new(2, Some(2));
    engine.create_proxy(&first).unwrap();
    engine.create_proxy(&second).unwrap();

    harness.run_next();
    let compiling = harness.start_next();

    engine.clear_all_proxies();
    assert!(engine.world().attached().is_empty());

    harness.finish(compiling);

    assert_eq!(engine.proxy_count(), 0);
    assert!(engine.world().attached().is_empty());
    assert_eq!(engine.stats().discarded_after_compile, 1);
}

struct Registry {
    nodes: HashMap<NodeId, Arc<TestNode>>,
}

impl NodeRegistry for Registry {
    type Node = TestNode;
    type Handle = Arc<TestNode>;

    fn find_node(&self, id: NodeId) -> Option<Arc<TestNode>> {
        self.nodes.get(&id).cloned()
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn picking_result_resolves_to_content() {
    let harness = Harness::new(ApplyMode::Immediate);
    let node = Arc::new(TestNode::new(1, Some(1)));

    let registry = Registry {
        nodes: HashMap::from([(node.id, Arc::clone(&node))]),
    };

    let resolved = harness
        .engine
        .resolve_selectable(&registry, SelectableId::component(node.id, ComponentId::new(1)))
        .unwrap();
    assert!(matches!(
        resolved,
        Resolved::Component { ref node, component } if node.id == NodeId::new(1) && component == ComponentId::new(1)
    ));

    let fallback = harness
        .engine
        .resolve_selectable(&registry, SelectableId::component(node.id, ComponentId::new(9)))
        .unwrap();
    assert!(matches!(fallback, Resolved::Node(_)));
    assert_eq!(fallback.node().id, node.id);

    assert!(
        harness
            .engine
            .resolve_selectable(&registry, SelectableId::node(NodeId::new(2)))
            .is_none()
    );
}

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_updates_converge_to_latest_content() {
    const NODES: u64 = 8;
    const UPDATES: u32 = 50;

    let spawner = Arc::new(TrackingSpawner::new());

    let engine = Arc::new(
        ProxyEngine::builder(Arc::new(FakeWorld::default()), TestCompiler::default())
            .spawner(Arc::clone(&spawner) as Arc<dyn TaskSpawner>)
            .build(),
    );

    let threads: Vec<_> = (0..NODES)
        .map(|id| {
            let engine = Arc::clone(&engine);

            thread::spawn(move || {
                let mut node = TestNode::new(id, Some(0));
                engine.create_proxy(&node).unwrap();

                for content in 1..=UPDATES {
                    node.content = Some(content);
                    update(&engine, &node, DirtyFlags::CONTENT | DirtyFlags::TRANSFORM);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    spawner.wait_idle();

    for id in 0..NODES {
        assert_eq!(
            engine.with_object(NodeId::new(id), |object| object.content),
            Some(UPDATES)
        );
    }

    let attached = engine.world().attached();
    assert_eq!(attached.len(), 8);
    assert!(attached.iter().all(|content| *content == UPDATES));

    let stats = engine.stats();
    assert_eq!(
        stats.compiles_started,
        NODES.wrapping_mul(u64::from(UPDATES.wrapping_add(1)))
    );

    let outcomes: u64 = [
        stats.applied,
        stats.discarded_before_compile,
        stats.discarded_after_compile,
        stats.failed,
    ]
    .iter()
    .sum();
    assert_eq!(outcomes, stats.compiles_started);
}
