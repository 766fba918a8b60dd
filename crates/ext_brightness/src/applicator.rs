use ext_dom::{Document, NodeId};
use tracing::{trace, warn};

use crate::BrightnessValue;

/// Inline properties written for every dimmed element.
pub const FILTER_PROPERTIES: [&str; 2] = ["filter", "-webkit-filter"];

/// Whether an element whose current filter is `current` may be set to `target`.
///
/// Empty filters (and the computed `none`) are free to take. A filter already
/// holding `target`, an `invert(..)` from a dark-mode tool, or any filter that
/// is not a brightness filter is left alone.
pub fn should_update(current: &str, target: &str) -> bool {
    let current = current.trim();
    if current.is_empty() || current == "none" {
        return true;
    }
    if current.contains(target) || current.contains("invert") {
        return false;
    }
    current.contains("brightness(")
}

/// Writes `filter: brightness(<value>%)` to image-like elements.
#[derive(Debug, Clone, PartialEq)]
pub struct BrightnessApplicator {
    value: BrightnessValue,
    filter: String,
}

impl BrightnessApplicator {
    pub fn new(value: BrightnessValue) -> Self {
        Self {
            value,
            filter: value.filter(),
        }
    }

    pub fn value(&self) -> BrightnessValue {
        self.value
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Apply to one element. Returns true if anything was written.
    ///
    /// The inline filter is checked first; only when it is empty does the
    /// computed filter (stylesheet rules) get a say.
    pub fn apply(&self, doc: &mut Document, node: NodeId) -> bool {
        let inline = doc.inline_style(node, "filter");
        let allowed = if inline.is_empty() {
            should_update(&doc.computed_style(node, "filter"), &self.filter)
        } else {
            should_update(inline, &self.filter)
        };
        if !allowed {
            trace!(node = %node, filter = %self.filter, "brightness.skip");
            return false;
        }

        for property in FILTER_PROPERTIES {
            if let Err(err) = doc.set_inline_style(node, property, &self.filter) {
                warn!(node = %node, error = %err, "brightness.apply failed");
                return false;
            }
        }
        trace!(node = %node, filter = %self.filter, "brightness.apply");
        true
    }

    /// Turn the applicator into a per-element callback.
    pub fn into_callback(self) -> impl FnMut(&mut Document, NodeId) + 'static {
        move |doc, node| {
            self.apply(doc, node);
        }
    }
}

/// `apply(value) -> (element) => void`
pub fn apply_brightness(value: BrightnessValue) -> impl FnMut(&mut Document, NodeId) + 'static {
    BrightnessApplicator::new(value).into_callback()
}
