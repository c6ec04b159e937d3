//! Demonstrates keeping runtime objects in sync with a small content tree.
//!
//! The example uses a background `WorkerPool` for compilation and `ApplyMode::Deferred`, so
//! compiled objects only show up in the world when the "frame loop" calls
//! `update_all_proxies()`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use scene_proxy::{
    ApplyMode, Bounds, CompileError, Compiler, ComponentId, ComponentInfo, ContentNode,
    DirtyFlags, NodeId, Placement, ProxyEngine, RuntimeObject, SelectableId, World,
};

/// A runtime object that is just a labeled unit cube.
struct Cube {
    label: String,
    placement: Placement,
}

impl RuntimeObject for Cube {
    fn set_placement(&mut self, placement: &Placement) {
        self.placement = *placement;
    }

    fn components(&self) -> Vec<ComponentId> {
        Vec::new()
    }

    fn bind_selectable(&mut self, _component: ComponentId, _selectable: SelectableId) {}

    fn apply_selection(&mut self, _highlight_all: bool, _selected: &[ComponentId]) {}

    fn bounds(&self) -> Option<Bounds> {
        let [x, y, z] = self.placement.translation;
        Some(Bounds::new([x, y, z], [x + 1.0, y + 1.0, z + 1.0]))
    }

    fn component_bounds(&self, _component: ComponentId) -> Option<Bounds> {
        None
    }
}

#[derive(Default)]
struct PrintingWorld {
    visible: Mutex<Vec<String>>,
}

impl World for PrintingWorld {
    type Object = Cube;

    fn attach(&self, object: &Cube) {
        println!("  world: attach {}", object.label);
        self.visible.lock().push(object.label.clone());
    }

    fn detach(&self, object: &Cube) {
        println!("  world: detach {}", object.label);
        self.visible.lock().retain(|label| *label != object.label);
    }
}

struct CubeCompiler;

impl Compiler for CubeCompiler {
    type Snapshot = String;
    type Object = Cube;

    fn compile(&self, label: String) -> Result<Cube, CompileError> {
        // Stand-in for loading resources.
        thread::sleep(Duration::from_millis(10));

        Ok(Cube {
            label,
            placement: Placement::IDENTITY,
        })
    }
}

struct SceneNode {
    id: NodeId,
    label: String,
    placement: Placement,
}

impl SceneNode {
    fn new(id: u64) -> Self {
        Self {
            id: NodeId::new(id),
            label: format!("cube-{id}"),
            placement: Placement::IDENTITY,
        }
    }
}

impl ContentNode for SceneNode {
    type Snapshot = String;

    fn id(&self) -> NodeId {
        self.id
    }

    fn placement(&self) -> Placement {
        self.placement
    }

    fn compile_snapshot(&self) -> Option<String> {
        Some(self.label.clone())
    }

    fn is_visible(&self) -> bool {
        true
    }

    fn is_selected(&self) -> bool {
        false
    }

    fn parent(&self) -> Option<&Self> {
        None
    }

    fn components(&self) -> Vec<ComponentInfo> {
        Vec::new()
    }
}

/// Runs "frames" until every queued compile result has been installed.
fn run_frames(engine: &ProxyEngine<PrintingWorld, CubeCompiler>, expected_applied: u64) {
    while engine.stats().applied < expected_applied {
        thread::sleep(Duration::from_millis(5));
        engine.update_all_proxies();
    }
}

fn main() {
    println!("=== Proxy Engine Example ===");

    let engine = ProxyEngine::builder(Arc::new(PrintingWorld::default()), CubeCompiler)
        .apply_mode(ApplyMode::Deferred)
        .build();

    let mut first = SceneNode::new(1);
    let second = SceneNode::new(2);
    let third = SceneNode::new(3);

    println!();
    println!("Creating proxies:");
    for node in [&first, &second, &third] {
        let handle = engine.create_proxy(node).expect("node has no proxy yet");
        println!("  {} -> {handle:?}", node.id);
    }

    run_frames(&engine, 3);
    println!("World now shows {:?}", engine.world().visible.lock());

    println!();
    println!("Moving and relabeling {}:", first.id);
    first.placement = Placement::from_translation([10.0, 0.0, 0.0]);
    first.label = "cube-1-renamed".to_string();

    let mut flags = DirtyFlags::TRANSFORM | DirtyFlags::CONTENT;
    engine.update_proxy(&first, &mut flags);

    run_frames(&engine, 4);
    println!(
        "  bounds of {}: {:?}",
        first.id,
        engine.proxy_bounds(first.id)
    );

    println!();
    println!("Removing {}:", third.id);
    engine.remove_proxy(third.id);

    println!();
    println!("Final stats: {:?}", engine.stats());

    println!();
    println!("Clearing all proxies:");
    engine.clear_all_proxies();
}
