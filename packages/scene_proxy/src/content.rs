use std::fmt;

use bitflags::bitflags;

use crate::Placement;

/// Identity of a content node, stable for the lifetime of the node.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(u64);

impl NodeId {
    /// Wraps a raw node identity.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw node identity.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a sub-object (component) of a content node or runtime object.
///
/// A content node and the runtime object compiled from it use the same component identities,
/// which is what allows picking results and selection state to be translated between them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ComponentId(u32);

impl ComponentId {
    /// Wraps a raw component identity.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw component identity.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// A component of a content node, as reported by [`ContentNode::components()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct ComponentInfo {
    /// Identity of the component.
    pub id: ComponentId,

    /// Whether the component itself is selected in the editor.
    pub selected: bool,
}

impl ComponentInfo {
    /// Describes a component.
    #[must_use]
    pub const fn new(id: ComponentId, selected: bool) -> Self {
        Self { id, selected }
    }
}

/// A node of the content tree that is mirrored by a proxy.
///
/// Content nodes are cheap to mutate and are owned by the host. The engine only reads from
/// them while servicing a [`ProxyEngine`][crate::ProxyEngine] call and never keeps references
/// to them afterwards - anything it needs later is captured by value.
pub trait ContentNode {
    /// Self-contained description of the node's content, consumed by a
    /// [`Compiler`][crate::Compiler] on a background thread.
    type Snapshot: Send + 'static;

    /// Identity of the node.
    fn id(&self) -> NodeId;

    /// The node's current world-space placement.
    fn placement(&self) -> Placement;

    /// Captures the data required to compile a runtime object for this node.
    ///
    /// Returns `None` if the node has nothing to compile, in which case no compile task is
    /// scheduled and any existing runtime object is left as it is.
    fn compile_snapshot(&self) -> Option<Self::Snapshot>;

    /// Whether the node should currently have a visual representation.
    fn is_visible(&self) -> bool;

    /// Whether the node itself is selected. Selection of ancestors is taken into account
    /// separately by walking [`parent()`](Self::parent).
    fn is_selected(&self) -> bool;

    /// The parent of the node, if it has one.
    fn parent(&self) -> Option<&Self>;

    /// The components of the node.
    fn components(&self) -> Vec<ComponentInfo>;
}

bitflags! {
    /// Describes which aspects of a content node have changed since its proxy was last updated.
    ///
    /// [`ProxyEngine::update_proxy()`][crate::ProxyEngine::update_proxy] removes each flag from
    /// the set as it services it. Bits not defined here are left untouched.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct DirtyFlags: u32 {
        /// The node moved. The new placement is pushed directly to the runtime object.
        const TRANSFORM = 1 << 0;

        /// The content changed. A new runtime object is compiled in the background.
        const CONTENT = 1 << 1;

        /// The selection state of the node, one of its ancestors or one of its components
        /// changed.
        const SELECTION = 1 << 2;

        /// The node was shown or hidden.
        const VISIBILITY = 1 << 3;
    }
}
