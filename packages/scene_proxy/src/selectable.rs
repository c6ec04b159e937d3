use std::ops::Deref;

use crate::{ComponentId, ContentNode, NodeId};

/// The identity that picking reports for a rendered runtime object.
///
/// The engine binds one of these to every component of a runtime object when the object is
/// installed, so a hit-test result can be traced back to the content that produced it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SelectableId {
    node: NodeId,
    component: Option<ComponentId>,
}

impl SelectableId {
    /// Identifies a content node as a whole.
    #[must_use]
    pub const fn node(node: NodeId) -> Self {
        Self {
            node,
            component: None,
        }
    }

    /// Identifies one component of a content node.
    #[must_use]
    pub const fn component(node: NodeId, component: ComponentId) -> Self {
        Self {
            node,
            component: Some(component),
        }
    }

    /// The content node this identity was minted for.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node
    }

    /// The component this identity was minted for, if it refers to a specific one.
    #[must_use]
    pub const fn component_id(&self) -> Option<ComponentId> {
        self.component
    }
}

/// Finds content nodes by identity. Implemented by the host's object registry.
pub trait NodeRegistry {
    /// The content node type in the registry.
    type Node: ContentNode;

    /// How the registry hands out nodes, e.g. `Arc<Self::Node>` or `&Self::Node`.
    type Handle: Deref<Target = Self::Node>;

    /// Looks up a node, returning `None` if no node with this identity exists (anymore).
    fn find_node(&self, id: NodeId) -> Option<Self::Handle>;
}

/// What a [`SelectableId`] refers to in the content tree.
#[derive(Debug)]
#[non_exhaustive]
pub enum Resolved<H> {
    /// The content node as a whole.
    Node(H),

    /// One component of the content node.
    Component {
        /// The node owning the component.
        node: H,

        /// The component.
        component: ComponentId,
    },
}

impl<H> Resolved<H> {
    /// The content node, regardless of whether a specific component was resolved.
    #[must_use]
    pub fn node(&self) -> &H {
        match self {
            Self::Node(node) | Self::Component { node, .. } => node,
        }
    }
}

/// Translates a picking result back into the content tree.
///
/// If the identity refers to a component that the node no longer has, the node itself is
/// returned. Returns `None` if the node no longer exists.
///
/// This reads from the registry only and takes no engine locks.
pub fn resolve_selectable<R: NodeRegistry>(
    registry: &R,
    selectable: SelectableId,
) -> Option<Resolved<R::Handle>> {
    let node = registry.find_node(selectable.node_id())?;

    let Some(component) = selectable.component_id() else {
        return Some(Resolved::Node(node));
    };

    if node.components().iter().any(|info| info.id == component) {
        Some(Resolved::Component { node, component })
    } else {
        Some(Resolved::Node(node))
    }
}
