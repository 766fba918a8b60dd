use ext_dom::{NodeId, SharedDocument};
use ext_timers::{TimerId, Timers};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// Duration of the background-color transition applied on every change.
pub const TRANSITION_DURATION: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrightnessState {
    Enabled,
    Disabled,
}

/// An element whose background follows the brightness value.
#[derive(Debug)]
struct TrackedElement {
    node: NodeId,
    /// Inline `background-color` before we touched it.
    init_background: String,
    /// Inline `transition` before we touched it.
    init_transition: String,
    /// Pending transition reset.
    timer: Option<TimerId>,
}

/// Owns the page background colour.
///
/// Starts [`BrightnessState::Disabled`]; nothing is written until
/// [`enable`](Self::enable) has been called and the page is rendered.
/// Tracked elements are `<body>` and every `<main>` present at construction.
#[derive(Debug)]
pub struct DocumentBrightness {
    document: SharedDocument,
    timers: Timers,
    refs: Vec<TrackedElement>,
    state: BrightnessState,
    transition_duration: Duration,
}

impl DocumentBrightness {
    pub fn new(document: SharedDocument, timers: Timers) -> Self {
        Self::with_transition(document, timers, TRANSITION_DURATION)
    }

    pub fn with_transition(document: SharedDocument, timers: Timers, transition_duration: Duration) -> Self {
        let refs = {
            let doc = document.borrow();
            let body = doc.body();
            std::iter::once(body)
                .chain(doc.elements_by_tag(body, "main"))
                .map(|node| TrackedElement {
                    node,
                    init_background: doc.inline_style(node, "background-color").to_string(),
                    init_transition: doc.inline_style(node, "transition").to_string(),
                    timer: None,
                })
                .collect()
        };

        Self {
            document,
            timers,
            refs,
            state: BrightnessState::Disabled,
            transition_duration,
        }
    }

    pub fn state(&self) -> BrightnessState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.state == BrightnessState::Disabled
    }

    /// Elements whose background is managed, `<body>` first.
    pub fn tracked(&self) -> Vec<NodeId> {
        self.refs.iter().map(|r| r.node).collect()
    }

    pub fn transition_animation(&self) -> String {
        format!(
            "background-color {}ms linear",
            self.transition_duration.as_millis()
        )
    }

    /// Allow background writes. Returns true on a DISABLED -> ENABLED transition.
    pub fn enable(&mut self) -> bool {
        if self.state == BrightnessState::Enabled {
            return false;
        }
        debug!("document_brightness.enable");
        self.state = BrightnessState::Enabled;
        true
    }

    /// Restore original backgrounds and stop writing.
    ///
    /// Returns true on an ENABLED -> DISABLED transition; a repeated call writes nothing.
    pub fn disable(&mut self) -> bool {
        if self.state == BrightnessState::Disabled {
            return false;
        }
        debug!("document_brightness.disable");
        self.restore_default_colors();
        self.state = BrightnessState::Disabled;
        true
    }

    /// Set the background colour. Rejected while disabled or while the page is not rendered.
    pub fn set(&mut self, color: &str) -> bool {
        if self.is_disabled() || !self.is_document_visible() {
            debug!(color, state = ?self.state, "document_brightness.set rejected");
            return false;
        }
        for index in 0..self.refs.len() {
            self.update(index, color.to_string());
        }
        true
    }

    fn is_document_visible(&self) -> bool {
        self.document.borrow().element_from_point(0.0, 0.0).is_some()
    }

    fn restore_default_colors(&mut self) {
        for index in 0..self.refs.len() {
            let color = self.refs[index].init_background.clone();
            self.update(index, color);
        }
    }

    /// Transition one element to `color`, then put its transition back.
    fn update(&mut self, index: usize, color: String) {
        let animation = self.transition_animation();
        let element = &mut self.refs[index];
        if let Some(timer_id) = element.timer.take() {
            self.timers.clear_timeout(timer_id);
        }

        let node = element.node;
        {
            let mut doc = self.document.borrow_mut();
            let written = doc
                .set_inline_style(node, "transition", &animation)
                .and_then(|_| doc.set_inline_style(node, "background-color", &color));
            if let Err(err) = written {
                warn!(node = %node, error = %err, "document_brightness.update failed");
                return;
            }
        }

        let document = Rc::clone(&self.document);
        let init_transition = element.init_transition.clone();
        element.timer = Some(self.timers.set_timeout(self.transition_duration, move || {
            if let Err(err) = document
                .borrow_mut()
                .set_inline_style(node, "transition", &init_transition)
            {
                warn!(node = %node, error = %err, "document_brightness.reset_transition failed");
            }
        }));
    }
}
