use ext_dom::{Document, DomError, MutationRecord, NodeId, ObserveOptions, ObserverId, SharedDocument};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace};

/// Attributes that change which image an element renders.
pub const ATTRIBUTE_FILTER: [&str; 4] = ["currentSrc", "sizes", "src", "srcset"];

pub type ImageCallback = Box<dyn FnMut(&mut Document, NodeId)>;

/// `<img>`, `<video>` and SVG `<svg>`.
///
/// An SVG `<image>` is covered by the filter on its `<svg>`.
pub fn is_image_like(doc: &Document, node: NodeId) -> bool {
    matches!(doc.node_name(node).as_deref(), Some("IMG" | "VIDEO" | "svg"))
}

/// Image-like nodes under `root` (inclusive) in document order, without
/// descending into a match.
pub fn outermost_image_like(doc: &Document, root: NodeId) -> Vec<NodeId> {
    let mut found = Vec::new();
    walk_outermost(doc, root, &mut HashSet::new(), &mut found);
    found
}

/// Image-like nodes reachable from a batch of records, each reported once.
///
/// Per record the target's children, the added nodes and the target itself are
/// walked; the walk stops at the first image-like node on every branch.
pub fn collect_image_like(doc: &Document, records: &[MutationRecord]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for record in records {
        let roots = doc
            .children(record.target)
            .iter()
            .chain(record.added_nodes.iter())
            .chain(std::iter::once(&record.target));

        for root in roots {
            walk_outermost(doc, *root, &mut seen, &mut found);
        }
    }
    found
}

fn walk_outermost(doc: &Document, root: NodeId, seen: &mut HashSet<NodeId>, found: &mut Vec<NodeId>) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if is_image_like(doc, node) {
            found.push(node);
            continue;
        }
        stack.extend(doc.children(node).iter().rev().copied());
    }
}

/// Wraps one native mutation observer and feeds image-like nodes to a callback.
pub struct Observer {
    document: SharedDocument,
    target: NodeId,
    native: Option<ObserverId>,
    attached: bool,
    callback: Option<ImageCallback>,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("target", &self.target)
            .field("native", &self.native)
            .field("attached", &self.attached)
            .finish()
    }
}

impl Observer {
    pub fn new(document: SharedDocument, target: NodeId) -> Self {
        Self {
            document,
            target,
            native: None,
            attached: false,
            callback: None,
        }
    }

    pub fn options() -> ObserveOptions {
        ObserveOptions {
            child_list: true,
            attributes: true,
            attribute_filter: Some(ATTRIBUTE_FILTER.iter().map(|a| a.to_string()).collect()),
            subtree: true,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Start observing, or just swap the callback when already attached.
    pub fn observe(&mut self, callback: ImageCallback) -> Result<(), DomError> {
        self.callback = Some(callback);
        if self.attached {
            trace!("observer.observe callback replaced");
            return Ok(());
        }

        let mut doc = self.document.borrow_mut();
        let native = match self.native {
            Some(native) => native,
            None => {
                let native = doc.create_observer();
                self.native = Some(native);
                native
            }
        };
        doc.observe(native, self.target, Self::options())?;
        self.attached = true;
        debug!(observer = %native, "observer.attach");
        Ok(())
    }

    /// Stop observing. Safe to call when never attached.
    pub fn disconnect(&mut self) {
        if let Some(native) = self.native {
            self.document.borrow_mut().disconnect_observer(native);
            if self.attached {
                debug!(observer = %native, "observer.detach");
            }
        }
        self.attached = false;
    }

    /// Drain the native queue and run the callback. Returns the number of callbacks made.
    pub fn deliver(&mut self) -> usize {
        let Some(native) = self.native.filter(|_| self.attached) else {
            return 0;
        };
        let records = self.document.borrow_mut().take_records(native);
        if records.is_empty() {
            return 0;
        }
        self.handle_records(&records)
    }

    /// Run the callback for every image-like node in `records`.
    pub fn handle_records(&mut self, records: &[MutationRecord]) -> usize {
        let Some(callback) = self.callback.as_mut() else {
            return 0;
        };
        let matches = collect_image_like(&self.document.borrow(), records);
        if matches.is_empty() {
            return 0;
        }

        let mut doc = self.document.borrow_mut();
        for node in &matches {
            callback(&mut *doc, *node);
        }
        trace!(records = records.len(), images = matches.len(), "observer.deliver");
        matches.len()
    }
}
