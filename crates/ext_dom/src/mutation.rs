//! Native mutation observer registry.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tokio::sync::Notify;
use tracing::trace;

use crate::{DomError, NodeId};

/// Handle to a native observer created with [`crate::Document::create_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// `MutationObserverInit`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub attributes: bool,
    /// Only these attribute names produce records. Implies `attributes`.
    pub attribute_filter: Option<Vec<String>>,
    pub subtree: bool,
}

impl ObserveOptions {
    pub(crate) fn validate(&self) -> Result<(), DomError> {
        if !self.child_list && !self.attributes && self.attribute_filter.is_none() {
            return Err(DomError::invalid_observe_options(
                "one of childList, attributes or attributeFilter must be set",
            ));
        }
        Ok(())
    }

    fn accepts(&self, kind: &MutationKind) -> bool {
        match kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::Attributes { name } => match &self.attribute_filter {
                Some(filter) => filter.iter().any(|f| f == name),
                None => self.attributes,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes { name: String },
}

/// `MutationRecord`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct ObserverEntry {
    registration: Option<(NodeId, ObserveOptions)>,
    pending: Vec<MutationRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_id: u64,
    observers: HashMap<ObserverId, ObserverEntry>,
    signal: Rc<Notify>,
}

impl Registry {
    pub(crate) fn signal(&self) -> Rc<Notify> {
        self.signal.clone()
    }

    pub(crate) fn create(&mut self) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.insert(id, ObserverEntry::default());
        trace!(observer = %id, "dom.observer.create");
        id
    }

    pub(crate) fn observe(
        &mut self,
        id: ObserverId,
        target: NodeId,
        options: ObserveOptions,
    ) -> Result<(), DomError> {
        let entry = self
            .observers
            .get_mut(&id)
            .ok_or_else(|| DomError::observer_not_found(id))?;
        entry.registration = Some((target, options));
        trace!(observer = %id, target = %target, "dom.observer.observe");
        Ok(())
    }

    pub(crate) fn disconnect(&mut self, id: ObserverId) {
        if let Some(entry) = self.observers.get_mut(&id) {
            entry.registration = None;
            entry.pending.clear();
            trace!(observer = %id, "dom.observer.disconnect");
        }
    }

    pub(crate) fn take_records(&mut self, id: ObserverId) -> Vec<MutationRecord> {
        self.observers
            .get_mut(&id)
            .map(|entry| std::mem::take(&mut entry.pending))
            .unwrap_or_default()
    }

    pub(crate) fn is_observing(&self, id: ObserverId) -> bool {
        self.observers
            .get(&id)
            .is_some_and(|entry| entry.registration.is_some())
    }

    pub(crate) fn active_count(&self) -> usize {
        self.observers
            .values()
            .filter(|entry| entry.registration.is_some())
            .count()
    }

    pub(crate) fn created_count(&self) -> usize {
        self.observers.len()
    }

    /// Queue `record` on every observer whose registration covers it.
    /// `in_scope(observed, subtree, target)` decides tree reachability.
    pub(crate) fn queue(
        &mut self,
        record: MutationRecord,
        in_scope: impl Fn(NodeId, bool, NodeId) -> bool,
    ) {
        let mut queued = false;
        for entry in self.observers.values_mut() {
            let Some((observed, options)) = &entry.registration else {
                continue;
            };
            if options.accepts(&record.kind) && in_scope(*observed, options.subtree, record.target) {
                entry.pending.push(record.clone());
                queued = true;
            }
        }
        if queued {
            self.signal.notify_one();
        }
    }
}
