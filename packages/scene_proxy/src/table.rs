use std::num::NonZero;
use std::ptr::NonNull;

use block_pool::BlockPool;
use foldhash::{HashMap, HashMapExt};

use crate::{
    CompileTicket, CreateProxyError, IndexTable, NodeId, Placement, ProxyHandle, ProxyRecord,
    SelectionState,
};

/// Storage for proxy records: the records themselves live in a [`BlockPool`], addressed through
/// an [`IndexTable`] and looked up by content node through a map.
///
/// Callers never see pointers into the pool. Records are reached either by node identity or by
/// a [`ProxyHandle`]/[`CompileTicket`], both of which are validated against the record's
/// generation.
///
/// Not thread-safe. The engine keeps the table behind the proxy-table lock.
#[derive(Debug)]
pub(crate) struct ProxyTable<O> {
    pool: BlockPool,
    slots: IndexTable<ProxyRecord<O>>,
    by_node: HashMap<NodeId, u32>,

    /// Generation of the most recently created proxy. Zero is never issued.
    generation_counter: u32,
}

impl<O> ProxyTable<O> {
    pub(crate) fn new(capacity_limit: Option<NonZero<usize>>) -> Self {
        let mut builder = BlockPool::builder().layout_of::<ProxyRecord<O>>();

        if let Some(limit) = capacity_limit {
            builder = builder.capacity_limit(limit);
        }

        Self {
            pool: builder.build(),
            slots: IndexTable::new(),
            by_node: HashMap::new(),
            generation_counter: 0,
        }
    }

    /// Creates a record for a node that does not have one yet.
    pub(crate) fn insert(
        &mut self,
        node: NodeId,
        placement: Placement,
        visible: bool,
        selection: SelectionState,
    ) -> Result<&mut ProxyRecord<O>, CreateProxyError> {
        if self.by_node.contains_key(&node) {
            return Err(CreateProxyError::AlreadyExists(node));
        }

        let index = self.slots.alloc_index();
        let generation = next_generation(self.generation_counter);

        let record = ProxyRecord::new(
            ProxyHandle::new(index, generation),
            node,
            placement,
            visible,
            selection,
        );

        // SAFETY: The pool was created with the layout of ProxyRecord<O>. Every record is taken
        // back out via remove() in remove() or drain().
        let Some(ptr) = (unsafe { self.pool.insert(record) }) else {
            self.slots.free_index(index);
            return Err(CreateProxyError::NoSlotAvailable);
        };

        self.generation_counter = generation;
        self.slots.occupy(index, ptr);
        self.by_node.insert(node, index);

        Ok(self
            .record_mut(index)
            .expect("we just placed the record in this slot"))
    }

    /// Removes the record of a node and hands it to the caller, who is responsible for
    /// detaching its runtime object.
    ///
    /// The slot index becomes available for reuse. The generation is left alone; the next
    /// occupant of the slot draws a new one.
    pub(crate) fn remove(&mut self, node: NodeId) -> Option<ProxyRecord<O>> {
        let index = self.by_node.remove(&node)?;

        let ptr = self
            .slots
            .vacate(index)
            .expect("node map and index table must agree on occupied slots");

        self.slots.free_index(index);

        // SAFETY: Every pointer in the index table came from pool.insert() with a ProxyRecord<O>
        // and we just removed the only way to reach it.
        let record = unsafe { self.pool.remove(ptr) };

        debug_assert_eq!(record.index, index);
        debug_assert_eq!(record.node, node);

        Some(record)
    }

    /// Removes every record, returning them to the caller. The table, the free-index stack
    /// and the pool are all empty afterwards.
    pub(crate) fn drain(&mut self) -> Vec<ProxyRecord<O>> {
        let pointers: Vec<NonNull<ProxyRecord<O>>> =
            self.slots.occupied().map(|(_, ptr)| ptr).collect();

        let records = pointers
            .into_iter()
            // SAFETY: Every pointer in the index table came from pool.insert() with a
            // ProxyRecord<O> and is forgotten by the clear() calls below.
            .map(|ptr| unsafe { self.pool.remove(ptr) })
            .collect();

        self.slots.clear();
        self.by_node.clear();

        debug_assert!(self.pool.is_empty());

        records
    }

    pub(crate) fn find(&self, node: NodeId) -> Option<&ProxyRecord<O>> {
        let index = *self.by_node.get(&node)?;
        self.record(index)
    }

    pub(crate) fn find_mut(&mut self, node: NodeId) -> Option<&mut ProxyRecord<O>> {
        let index = *self.by_node.get(&node)?;
        self.record_mut(index)
    }

    /// The record identified by `ticket`, if the slot is still occupied by the same logical
    /// proxy and no newer compile has been started for it.
    pub(crate) fn current_mut(&mut self, ticket: &CompileTicket) -> Option<&mut ProxyRecord<O>> {
        self.record_mut(ticket.handle.index())
            .filter(|record| record.matches(ticket))
    }

    pub(crate) fn is_current(&self, ticket: &CompileTicket) -> bool {
        self.record(ticket.handle.index())
            .is_some_and(|record| record.matches(ticket))
    }

    pub(crate) fn len(&self) -> usize {
        self.by_node.len()
    }

    fn record(&self, index: u32) -> Option<&ProxyRecord<O>> {
        let ptr = self.slots.get(index)?;

        // SAFETY: Pointers in the index table refer to live records in our pool. The returned
        // reference borrows self, so the record cannot be removed while it is in use.
        let record = unsafe { ptr.as_ref() };

        debug_assert_eq!(record.index, index, "record in slot {index} has a foreign index");

        Some(record)
    }

    fn record_mut(&mut self, index: u32) -> Option<&mut ProxyRecord<O>> {
        let mut ptr = self.slots.get(index)?;

        // SAFETY: Pointers in the index table refer to live records in our pool and each
        // record is referenced by exactly one slot. The returned reference borrows self
        // exclusively, so no other reference to the record can exist while it is in use.
        let record = unsafe { ptr.as_mut() };

        debug_assert_eq!(record.index, index, "record in slot {index} has a foreign index");

        Some(record)
    }
}

impl<O> Drop for ProxyTable<O> {
    fn drop(&mut self) {
        // Records own their runtime objects, which must be dropped before the pool asserts
        // that it is empty.
        drop(self.drain());
    }
}

// SAFETY: The table exclusively owns every record it points to; the raw pointers in the index
// table never escape. Moving the table to another thread moves the records with it, which is
// fine as long as the runtime objects themselves can move.
unsafe impl<O: Send> Send for ProxyTable<O> {}

/// The generation following `current`, skipping zero when the counter wraps around.
fn next_generation(current: u32) -> u32 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}
