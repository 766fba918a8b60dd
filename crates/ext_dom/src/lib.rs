//! runtime:dom - In-memory host document for dimmer content scripts
//!
//! Models the parts of a browser document the content script reads and writes:
//! an element tree, attributes, inline and stylesheet declarations, a hit-test
//! probe and the native mutation observer registry. Every other crate in the
//! workspace goes through [`Document`] instead of talking to a browser directly.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tokio::sync::Notify;
use tracing::trace;

mod fixture;
mod mutation;

pub use fixture::{NodeSpec, PageSpec};
pub use mutation::{MutationKind, MutationRecord, ObserveOptions, ObserverId};

use mutation::Registry;

/// Shared handle used by everything that outlives a single call (timers, observers).
pub type SharedDocument = Rc<RefCell<Document>>;

// ============================================================================
// Error Types (9000+ range)
// ============================================================================

/// Error codes for document operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DomErrorCode {
    /// Node id does not belong to this document
    NodeNotFound = 9000,
    /// Tree operation would produce an invalid hierarchy
    HierarchyRequest = 9001,
    /// Observer id is unknown
    ObserverNotFound = 9002,
    /// Observer options select nothing
    InvalidObserveOptions = 9003,
    /// Page fixture could not be built
    InvalidFixture = 9004,
}

/// Custom error type for document operations
#[derive(Debug, thiserror::Error)]
pub enum DomError {
    #[error("[{code}] Node not found: {node}")]
    NodeNotFound { code: u32, node: NodeId },

    #[error("[{code}] Hierarchy request error: {message}")]
    HierarchyRequest { code: u32, message: String },

    #[error("[{code}] Observer not found: {observer}")]
    ObserverNotFound { code: u32, observer: u64 },

    #[error("[{code}] Invalid observe options: {message}")]
    InvalidObserveOptions { code: u32, message: String },

    #[error("[{code}] Invalid fixture: {message}")]
    InvalidFixture { code: u32, message: String },
}

impl DomError {
    pub fn node_not_found(node: NodeId) -> Self {
        Self::NodeNotFound {
            code: DomErrorCode::NodeNotFound as u32,
            node,
        }
    }

    pub fn hierarchy_request(message: impl Into<String>) -> Self {
        Self::HierarchyRequest {
            code: DomErrorCode::HierarchyRequest as u32,
            message: message.into(),
        }
    }

    pub fn observer_not_found(observer: ObserverId) -> Self {
        Self::ObserverNotFound {
            code: DomErrorCode::ObserverNotFound as u32,
            observer: observer.0,
        }
    }

    pub fn invalid_observe_options(message: impl Into<String>) -> Self {
        Self::InvalidObserveOptions {
            code: DomErrorCode::InvalidObserveOptions as u32,
            message: message.into(),
        }
    }

    pub fn invalid_fixture(message: impl Into<String>) -> Self {
        Self::InvalidFixture {
            code: DomErrorCode::InvalidFixture as u32,
            message: message.into(),
        }
    }
}

// ============================================================================
// Node Types
// ============================================================================

/// Index of a node inside its owning [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element namespace. Only affects how `nodeName` is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Html,
    Svg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element { tag: String, namespace: Namespace },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: BTreeMap<String, String>,
    inline_style: BTreeMap<String, String>,
    sheet_style: BTreeMap<String, String>,
}

impl NodeData {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            attributes: BTreeMap::new(),
            inline_style: BTreeMap::new(),
            sheet_style: BTreeMap::new(),
        }
    }

    fn is_element(&self) -> bool {
        matches!(self.kind, NodeKind::Element { .. })
    }
}

/// Value reported by `getComputedStyle` when nothing sets the property.
fn initial_value(property: &str) -> &'static str {
    match property {
        "filter" | "-webkit-filter" => "none",
        "background-color" => "rgba(0, 0, 0, 0)",
        "transition" => "all 0s ease 0s",
        _ => "",
    }
}

/// True when `ancestor` is `node` or one of its ancestors.
fn is_inclusive_ancestor(nodes: &[NodeData], ancestor: NodeId, node: NodeId) -> bool {
    let mut current = Some(node);
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        current = nodes.get(id.0).and_then(|n| n.parent);
    }
    false
}

// ============================================================================
// Document
// ============================================================================

/// A single page: `#document > html > (head, body)` plus whatever the page adds.
pub struct Document {
    host: String,
    nodes: Vec<NodeData>,
    root: NodeId,
    document_element: NodeId,
    head: NodeId,
    body: NodeId,
    hidden: bool,
    prefers_dark: bool,
    registry: Registry,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("host", &self.host)
            .field("nodes", &self.nodes.len())
            .field("hidden", &self.hidden)
            .finish()
    }
}

impl Document {
    /// Create an empty page served from `host`.
    pub fn new(host: impl Into<String>) -> Self {
        let mut nodes = vec![NodeData::new(NodeKind::Document)];
        let mut push_child = |parent: usize, tag: &str| {
            let id = nodes.len();
            let mut data = NodeData::new(NodeKind::Element {
                tag: tag.to_string(),
                namespace: Namespace::Html,
            });
            data.parent = Some(NodeId(parent));
            nodes.push(data);
            nodes[parent].children.push(NodeId(id));
            id
        };
        let html = push_child(0, "html");
        let head = push_child(html, "head");
        let body = push_child(html, "body");

        Self {
            host: host.into(),
            nodes,
            root: NodeId(0),
            document_element: NodeId(html),
            head: NodeId(head),
            body: NodeId(body),
            hidden: false,
            prefers_dark: false,
            registry: Registry::default(),
        }
    }

    /// Wrap the document for shared single-threaded ownership.
    pub fn into_shared(self) -> SharedDocument {
        Rc::new(RefCell::new(self))
    }

    /// Host portion of the page URL.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn document_element(&self) -> NodeId {
        self.document_element
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node.0 < self.nodes.len()
    }

    fn data(&self, node: NodeId) -> Result<&NodeData, DomError> {
        self.nodes
            .get(node.0)
            .ok_or_else(|| DomError::node_not_found(node))
    }

    fn data_mut(&mut self, node: NodeId) -> Result<&mut NodeData, DomError> {
        self.nodes
            .get_mut(node.0)
            .ok_or_else(|| DomError::node_not_found(node))
    }

    fn element_mut(&mut self, node: NodeId) -> Result<&mut NodeData, DomError> {
        let data = self.data_mut(node)?;
        if !data.is_element() {
            return Err(DomError::hierarchy_request(format!("{node} is not an element")));
        }
        Ok(data)
    }

    pub fn kind(&self, node: NodeId) -> Option<&NodeKind> {
        self.nodes.get(node.0).map(|n| &n.kind)
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.nodes.get(node.0).is_some_and(NodeData::is_element)
    }

    /// `Node.nodeName`: upper-cased for HTML elements, verbatim for SVG.
    pub fn node_name(&self, node: NodeId) -> Option<String> {
        self.kind(node).map(|kind| match kind {
            NodeKind::Document => "#document".to_string(),
            NodeKind::Text(_) => "#text".to_string(),
            NodeKind::Element {
                tag,
                namespace: Namespace::Html,
            } => tag.to_ascii_uppercase(),
            NodeKind::Element {
                tag,
                namespace: Namespace::Svg,
            } => tag.clone(),
        })
    }

    /// Lower-cased local name for elements.
    pub fn tag_name(&self, node: NodeId) -> Option<String> {
        match self.kind(node) {
            Some(NodeKind::Element { tag, .. }) => Some(tag.to_ascii_lowercase()),
            _ => None,
        }
    }

    pub fn namespace(&self, node: NodeId) -> Option<Namespace> {
        match self.kind(node) {
            Some(NodeKind::Element { namespace, .. }) => Some(*namespace),
            _ => None,
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    /// Direct children, empty for unknown nodes.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// True when `node` is reachable from the document root.
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.contains(node) && is_inclusive_ancestor(&self.nodes, self.root, node)
    }

    // ------------------------------------------------------------------------
    // Tree construction
    // ------------------------------------------------------------------------

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.create_element_ns(Namespace::Html, tag)
    }

    pub fn create_element_ns(&mut self, namespace: Namespace, tag: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData::new(NodeKind::Element {
            tag: tag.to_string(),
            namespace,
        }));
        id
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData::new(NodeKind::Text(text.to_string())));
        id
    }

    /// Append `child` to `parent`, moving it out of its previous parent first.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        if matches!(self.data(parent)?.kind, NodeKind::Text(_)) {
            return Err(DomError::hierarchy_request("text nodes cannot have children"));
        }
        if child == self.root {
            return Err(DomError::hierarchy_request("the document node cannot be moved"));
        }
        self.data(child)?;
        if is_inclusive_ancestor(&self.nodes, child, parent) {
            return Err(DomError::hierarchy_request(format!(
                "{child} is an ancestor of {parent}"
            )));
        }

        if let Some(old_parent) = self.data(child)?.parent {
            self.remove_child(old_parent, child)?;
        }

        self.data_mut(parent)?.children.push(child);
        self.data_mut(child)?.parent = Some(parent);
        trace!(parent = %parent, child = %child, "dom.append_child");

        self.queue_record(MutationRecord {
            kind: MutationKind::ChildList,
            target: parent,
            added_nodes: vec![child],
            removed_nodes: Vec::new(),
        });
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let position = self
            .data(parent)?
            .children
            .iter()
            .position(|c| *c == child)
            .ok_or_else(|| DomError::hierarchy_request(format!("{child} is not a child of {parent}")))?;

        self.data_mut(parent)?.children.remove(position);
        self.data_mut(child)?.parent = None;
        trace!(parent = %parent, child = %child, "dom.remove_child");

        self.queue_record(MutationRecord {
            kind: MutationKind::ChildList,
            target: parent,
            added_nodes: Vec::new(),
            removed_nodes: vec![child],
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Attributes and text
    // ------------------------------------------------------------------------

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes
            .get(node.0)
            .and_then(|n| n.attributes.get(name))
            .map(String::as_str)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        self.element_mut(node)?
            .attributes
            .insert(name.to_string(), value.to_string());
        self.queue_attribute_record(node, name);
        Ok(())
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<bool, DomError> {
        let removed = self.element_mut(node)?.attributes.remove(name).is_some();
        if removed {
            self.queue_attribute_record(node, name);
        }
        Ok(removed)
    }

    /// Concatenated text of every descendant text node.
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        for id in std::iter::once(node).chain(self.descendants(node)) {
            if let Some(NodeKind::Text(text)) = self.kind(id) {
                out.push_str(text);
            }
        }
        out
    }

    /// Replace all children of `node` with a single text node.
    pub fn set_text_content(&mut self, node: NodeId, text: &str) -> Result<(), DomError> {
        let old_children = std::mem::take(&mut self.element_mut(node)?.children);
        for child in &old_children {
            self.data_mut(*child)?.parent = None;
        }
        let text_node = self.create_text(text);
        self.data_mut(node)?.children.push(text_node);
        self.data_mut(text_node)?.parent = Some(node);

        self.queue_record(MutationRecord {
            kind: MutationKind::ChildList,
            target: node,
            added_nodes: vec![text_node],
            removed_nodes: old_children,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Styles
    // ------------------------------------------------------------------------

    /// Inline declaration (`element.style[property]`), empty when unset.
    pub fn inline_style(&self, node: NodeId, property: &str) -> &str {
        self.nodes
            .get(node.0)
            .and_then(|n| n.inline_style.get(property))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Write an inline declaration; an empty value removes it.
    pub fn set_inline_style(&mut self, node: NodeId, property: &str, value: &str) -> Result<(), DomError> {
        let data = self.element_mut(node)?;
        if value.is_empty() {
            data.inline_style.remove(property);
        } else {
            data.inline_style
                .insert(property.to_string(), value.to_string());
        }
        self.queue_attribute_record(node, "style");
        Ok(())
    }

    /// Declaration contributed by a stylesheet rule matching this element.
    pub fn set_sheet_style(&mut self, node: NodeId, property: &str, value: &str) -> Result<(), DomError> {
        self.element_mut(node)?
            .sheet_style
            .insert(property.to_string(), value.to_string());
        Ok(())
    }

    /// `getComputedStyle(node)[property]`: inline wins over stylesheet, then the initial value.
    pub fn computed_style(&self, node: NodeId, property: &str) -> String {
        let Some(data) = self.nodes.get(node.0) else {
            return String::new();
        };
        data.inline_style
            .get(property)
            .filter(|v| !v.is_empty())
            .or_else(|| data.sheet_style.get(property))
            .cloned()
            .unwrap_or_else(|| initial_value(property).to_string())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Descendants of `node` in document order, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    /// Elements under `scope` whose local name matches `tag` (ASCII case-insensitive).
    pub fn elements_by_tag(&self, scope: NodeId, tag: &str) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|id| match self.kind(*id) {
                Some(NodeKind::Element { tag: t, .. }) => t.eq_ignore_ascii_case(tag),
                _ => false,
            })
            .collect()
    }

    /// First connected node, in document order, accepted by `predicate`.
    pub fn find(&self, predicate: impl Fn(&Document, NodeId) -> bool) -> Option<NodeId> {
        self.descendants(self.root)
            .into_iter()
            .find(|id| predicate(self, *id))
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.find(|doc, node| doc.attribute(node, "id") == Some(id))
    }

    /// `document.querySelector('meta[name="..."]')`
    pub fn find_meta(&self, name: &str) -> Option<NodeId> {
        self.find(|doc, node| {
            doc.tag_name(node).as_deref() == Some("meta") && doc.attribute(node, "name") == Some(name)
        })
    }

    // ------------------------------------------------------------------------
    // Rendering state
    // ------------------------------------------------------------------------

    /// Hit-test probe. A hidden or unrendered page resolves nothing.
    pub fn element_from_point(&self, x: f64, y: f64) -> Option<NodeId> {
        if self.hidden || x < 0.0 || y < 0.0 {
            return None;
        }
        Some(self.body)
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// `matchMedia('(prefers-color-scheme: dark)').matches`
    pub fn prefers_dark_color_scheme(&self) -> bool {
        self.prefers_dark
    }

    pub fn set_prefers_dark_color_scheme(&mut self, dark: bool) {
        self.prefers_dark = dark;
    }

    // ------------------------------------------------------------------------
    // Native mutation observers
    // ------------------------------------------------------------------------

    /// Signal notified whenever a record is queued for any observer.
    pub fn mutation_signal(&self) -> Rc<Notify> {
        self.registry.signal()
    }

    /// `new MutationObserver(..)`: allocate an observer that watches nothing yet.
    pub fn create_observer(&mut self) -> ObserverId {
        self.registry.create()
    }

    /// `observer.observe(target, options)`; re-observing replaces the options.
    pub fn observe(&mut self, observer: ObserverId, target: NodeId, options: ObserveOptions) -> Result<(), DomError> {
        self.data(target)?;
        options.validate()?;
        self.registry.observe(observer, target, options)
    }

    /// `observer.disconnect()`: stop watching and drop queued records.
    pub fn disconnect_observer(&mut self, observer: ObserverId) {
        self.registry.disconnect(observer);
    }

    /// `observer.takeRecords()`
    pub fn take_records(&mut self, observer: ObserverId) -> Vec<MutationRecord> {
        self.registry.take_records(observer)
    }

    pub fn is_observing(&self, observer: ObserverId) -> bool {
        self.registry.is_observing(observer)
    }

    /// Number of observers currently attached to a target.
    pub fn active_observer_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Number of observers ever created on this document.
    pub fn created_observer_count(&self) -> usize {
        self.registry.created_count()
    }

    fn queue_attribute_record(&mut self, node: NodeId, name: &str) {
        self.queue_record(MutationRecord {
            kind: MutationKind::Attributes {
                name: name.to_string(),
            },
            target: node,
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
        });
    }

    fn queue_record(&mut self, record: MutationRecord) {
        let nodes = &self.nodes;
        self.registry.queue(record, |observed, subtree, target| {
            observed == target || (subtree && is_inclusive_ancestor(nodes, observed, target))
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
