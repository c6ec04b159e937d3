use std::sync::atomic::{AtomicU32, Ordering};

use crate::{ComponentId, ContentNode, NodeId, Placement};

/// Identifies one logical proxy for its entire lifetime.
///
/// The index alone is not enough because indices are reused once a proxy is removed. The
/// generation distinguishes successive occupants of the same index: once a slot is recycled,
/// every handle carrying the old generation is permanently invalid.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ProxyHandle {
    index: u32,
    generation: u32,
}

impl ProxyHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The slot index of the proxy.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// The generation stamped on the proxy when it was created.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Everything a compile task needs to decide whether its result is still wanted.
///
/// A result may only be applied if the slot is still occupied by the same logical proxy
/// (generation) and no newer compile has been started for it since (version).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CompileTicket {
    pub(crate) handle: ProxyHandle,
    pub(crate) version: u32,
}

/// Selection highlight state derived from a content node and its ancestors.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SelectionState {
    /// The node or one of its ancestors is selected, so the whole object is highlighted.
    pub(crate) highlight_all: bool,

    /// Individually selected components. Only collected if `highlight_all` is not set.
    pub(crate) components: Vec<ComponentId>,
}

impl SelectionState {
    pub(crate) fn of<N: ContentNode>(node: &N) -> Self {
        let highlight_all = is_selected_in_hierarchy(node);

        let components = if highlight_all {
            Vec::new()
        } else {
            node.components()
                .into_iter()
                .filter(|info| info.selected)
                .map(|info| info.id)
                .collect()
        };

        Self {
            highlight_all,
            components,
        }
    }
}

fn is_selected_in_hierarchy<N: ContentNode>(node: &N) -> bool {
    let mut current = Some(node);

    while let Some(node) = current {
        if node.is_selected() {
            return true;
        }

        current = node.parent();
    }

    false
}

/// Bookkeeping for one proxy. Lives in an element of the proxy table's block pool.
#[derive(Debug)]
pub(crate) struct ProxyRecord<O> {
    /// Own slot index, for consistency checks against the index table.
    pub(crate) index: u32,

    pub(crate) generation: u32,

    pub(crate) node: NodeId,

    /// Last placement received from the content node.
    pub(crate) placement: Placement,

    /// Incremented whenever a compile is started (and when the proxy is hidden), so that
    /// results of older compiles can be recognized and discarded.
    ///
    /// Only modified with the proxy-table lock held, so relaxed ordering is enough.
    version: AtomicU32,

    /// The attached runtime object, if any.
    pub(crate) object: Option<O>,

    pub(crate) visible: bool,

    pub(crate) selection: SelectionState,
}

impl<O> ProxyRecord<O> {
    pub(crate) fn new(
        handle: ProxyHandle,
        node: NodeId,
        placement: Placement,
        visible: bool,
        selection: SelectionState,
    ) -> Self {
        Self {
            index: handle.index(),
            generation: handle.generation(),
            node,
            placement,
            version: AtomicU32::new(0),
            object: None,
            visible,
            selection,
        }
    }

    pub(crate) fn handle(&self) -> ProxyHandle {
        ProxyHandle::new(self.index, self.generation)
    }

    pub(crate) fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Increments the version and returns the new value.
    pub(crate) fn bump_version(&self) -> u32 {
        // fetch_add wraps on overflow, which is fine: only equality is ever compared.
        self.version.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Starts a new compile attempt: bumps the version and captures the ticket that the
    /// compile result must present to be applied.
    pub(crate) fn issue_ticket(&self) -> CompileTicket {
        CompileTicket {
            handle: self.handle(),
            version: self.bump_version(),
        }
    }

    pub(crate) fn matches(&self, ticket: &CompileTicket) -> bool {
        self.generation == ticket.handle.generation() && self.version() == ticket.version
    }
}
