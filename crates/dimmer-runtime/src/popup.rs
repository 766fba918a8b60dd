//! Popup controller: the slider, its read-outs and the per-origin save.

use ext_brightness::{rgb_color, Brightness, BrightnessValue};
use ext_dom::{Document, DomError, NodeId, NodeSpec, PageSpec, SharedDocument};
use ext_ipc::{Message, Port, PortEvent, PortReceiver, PortSender};
use ext_log::{relay_console, report_runtime_error};
use ext_storage::{OriginState, StorageArea, StorageError};
use ext_timers::{Debouncer, Timers};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::config::Manifest;
use crate::RuntimeError;

pub const SLIDER_ID: &str = "slider";
pub const NUMBER_VALUE_ID: &str = "numberValue";
pub const RGB_VALUE_ID: &str = "rgbValue";
pub const TOGGLE_ID: &str = "toggle";

/// Element ids the popup binds to. The toggle is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupControls {
    pub slider: NodeId,
    pub number_value: NodeId,
    pub rgb_value: NodeId,
    pub toggle: Option<NodeId>,
}

impl PopupControls {
    pub fn find(doc: &Document) -> Option<Self> {
        Some(Self {
            slider: doc.get_element_by_id(SLIDER_ID)?,
            number_value: doc.get_element_by_id(NUMBER_VALUE_ID)?,
            rgb_value: doc.get_element_by_id(RGB_VALUE_ID)?,
            toggle: doc.get_element_by_id(TOGGLE_ID),
        })
    }
}

/// The stock popup page: range slider, value read-outs and the enable toggle.
pub fn popup_page() -> PageSpec {
    let input = |id: &str, kind: &str| {
        NodeSpec::element("input")
            .with_attribute("id", id)
            .with_attribute("type", kind)
    };
    let span = |id: &str| NodeSpec::element("span").with_attribute("id", id);

    PageSpec {
        host: "popup".to_string(),
        body: vec![
            input(SLIDER_ID, "range")
                .with_attribute("min", "0")
                .with_attribute("max", "100")
                .with_attribute("step", "0.1")
                .with_attribute("value", "100"),
            span(NUMBER_VALUE_ID),
            span(RGB_VALUE_ID),
            input(TOGGLE_ID, "checkbox"),
        ],
        ..Default::default()
    }
}

pub fn default_document() -> Result<SharedDocument, DomError> {
    Ok(Document::from_page(&popup_page())?.into_shared())
}

/// Write `state` for `origin`, dropping the entry once it is back at full brightness.
pub async fn save_origin(
    storage: &dyn StorageArea,
    origin: &str,
    state: OriginState,
) -> Result<(), StorageError> {
    if state.value.is_identity() {
        debug!(origin, "popup.save prune");
        storage.remove(origin).await?;
    } else {
        debug!(origin, value = %state.value, disabled = state.disabled, "popup.save");
        storage
            .set(BTreeMap::from([(origin.to_string(), state)]))
            .await?;
    }
    Ok(())
}

/// Popup side of one connection to a tab.
///
/// Created by [`Popup::connect`], which immediately asks the tab for its
/// origin. Controls are bound once the first reply arrives, see
/// [`pump`](Self::pump).
pub struct Popup {
    document: SharedDocument,
    port: Rc<RefCell<PortSender>>,
    receiver: PortReceiver,
    storage: Rc<dyn StorageArea>,
    debug: bool,
    origin: Option<String>,
    state: Rc<RefCell<OriginState>>,
    controls: Option<PopupControls>,
    slider_debounce: Debouncer,
    storage_debounce: Debouncer,
    closed: bool,
}

impl std::fmt::Debug for Popup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Popup")
            .field("origin", &self.origin)
            .field("state", &self.state.borrow())
            .field("mounted", &self.controls.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Popup {
    pub fn connect(
        document: SharedDocument,
        port: Port,
        storage: Rc<dyn StorageArea>,
        manifest: &Manifest,
        timers: Timers,
    ) -> Result<Self, RuntimeError> {
        let (sender, receiver) = port.split();
        sender.post_message(&Message::GetUrlRequest)?;
        debug!(name = %sender.name(), "popup.connect");

        Ok(Self {
            slider_debounce: Debouncer::new(timers.clone(), manifest.popup.slider_debounce()?),
            storage_debounce: Debouncer::new(timers, manifest.popup.storage_debounce()?),
            document,
            port: Rc::new(RefCell::new(sender)),
            receiver,
            storage,
            debug: manifest.app.debug,
            origin: None,
            state: Rc::new(RefCell::new(OriginState::default())),
            controls: None,
            closed: false,
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.controls.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn state(&self) -> OriginState {
        *self.state.borrow()
    }

    pub fn controls(&self) -> Option<PopupControls> {
        self.controls
    }

    fn read(
        &self,
        pick: impl Fn(&PopupControls) -> Option<NodeId>,
        read: impl Fn(&Document, NodeId) -> String,
    ) -> Option<String> {
        let node = pick(self.controls.as_ref()?)?;
        let doc = self.document.borrow();
        Some(read(&*doc, node))
    }

    /// Current `value` attribute of the slider.
    pub fn slider_value(&self) -> Option<String> {
        self.read(
            |c| Some(c.slider),
            |doc, n| doc.attribute(n, "value").unwrap_or_default().to_string(),
        )
    }

    /// Text of the `numberValue` read-out.
    pub fn displayed_value(&self) -> Option<String> {
        self.read(|c| Some(c.number_value), Document::text_content)
    }

    /// Text of the `rgbValue` read-out.
    pub fn rgb_display(&self) -> Option<String> {
        self.read(|c| Some(c.rgb_value), Document::text_content)
    }

    pub fn toggle_checked(&self) -> Option<bool> {
        self.read(
            |c| c.toggle,
            |doc, n| doc.attribute(n, "checked").unwrap_or_default().to_string(),
        )
        .map(|checked| !checked.is_empty())
    }

    /// Wait for and handle one port event. Returns false once the port is closed.
    pub async fn pump(&mut self) -> Result<bool, RuntimeError> {
        if self.closed {
            return Ok(false);
        }
        match self.receiver.recv().await {
            Some(PortEvent::Message(value)) => {
                self.on_message(value).await?;
                Ok(true)
            }
            Some(PortEvent::Disconnected) | None => {
                debug!("popup.disconnected");
                self.close().await;
                Ok(false)
            }
        }
    }

    async fn on_message(&mut self, value: Value) -> Result<(), RuntimeError> {
        let message = Message::decode(value);
        if self.is_mounted() {
            match message {
                Ok(Message::LoggerRequest(payload)) if self.debug => relay_console("content", &payload),
                Ok(other) => debug!(message = other.message_type(), "popup.message ignored"),
                Err(err) => warn!(error = %err, "popup.message"),
            }
            return Ok(());
        }

        match message {
            Ok(Message::GetUrlResponse(origin)) => self.load(origin).await,
            Ok(other) => debug!(message = other.message_type(), "popup.mount without origin"),
            Err(err) => warn!(error = %err, "popup.mount without origin"),
        }
        self.mount()?;
        Ok(())
    }

    async fn load(&mut self, origin: String) {
        let state = match self.storage.get(&origin).await {
            Ok(state) => state,
            Err(err) => {
                report_runtime_error("storage.get", &err);
                OriginState::default()
            }
        };
        debug!(origin = %origin, value = %state.value, disabled = state.disabled, "popup.load");
        *self.state.borrow_mut() = state;
        self.origin = Some(origin);
    }

    /// Bind the controls and show the loaded state. Missing controls leave the popup unmounted.
    fn mount(&mut self) -> Result<(), DomError> {
        let Some(controls) = PopupControls::find(&self.document.borrow()) else {
            debug!("popup.mount aborted, controls missing");
            return Ok(());
        };
        self.controls = Some(controls);

        let state = self.state();
        {
            let mut doc = self.document.borrow_mut();
            doc.set_attribute(controls.slider, "value", &state.value.to_string())?;
            if let Some(toggle) = controls.toggle {
                if state.disabled {
                    doc.remove_attribute(toggle, "checked")?;
                } else {
                    doc.set_attribute(toggle, "checked", "checked")?;
                }
            }
        }
        self.render(state.value)
    }

    fn render(&self, value: BrightnessValue) -> Result<(), DomError> {
        let Some(controls) = self.controls else {
            return Ok(());
        };
        let mut doc = self.document.borrow_mut();
        doc.set_text_content(controls.number_value, &value.to_display_string())?;
        doc.set_text_content(controls.rgb_value, &rgb_color(value))
    }

    /// Slider `input` event.
    pub fn on_slider_input(&mut self, raw: f64) -> Result<(), RuntimeError> {
        let Some(controls) = self.controls else {
            return Ok(());
        };
        let value = BrightnessValue::new(raw);
        self.document
            .borrow_mut()
            .set_attribute(controls.slider, "value", &value.to_string())?;
        self.render(value)?;
        self.state.borrow_mut().value = value;

        let port = Rc::clone(&self.port);
        self.slider_debounce.schedule(move || {
            let message = Message::SetBrightness(Brightness::from_value(value));
            if let Err(err) = port.borrow().post_message(&message) {
                report_runtime_error("port.post_message", &err);
            }
        });

        if let Some(origin) = self.origin.clone() {
            let storage = Rc::clone(&self.storage);
            let state = Rc::clone(&self.state);
            self.storage_debounce.schedule(move || {
                let state = *state.borrow();
                tokio::task::spawn_local(async move {
                    if let Err(err) = save_origin(storage.as_ref(), &origin, state).await {
                        report_runtime_error("storage.set", &err);
                    }
                });
            });
        }
        Ok(())
    }

    /// Toggle `change` event: flip `disabled` and write it straight away.
    pub async fn on_toggle(&mut self) -> Result<(), RuntimeError> {
        let Some(controls) = self.controls else {
            return Ok(());
        };
        let disabled = {
            let mut state = self.state.borrow_mut();
            state.disabled = !state.disabled;
            state.disabled
        };
        if let Some(toggle) = controls.toggle {
            let mut doc = self.document.borrow_mut();
            if disabled {
                doc.remove_attribute(toggle, "checked")?;
            } else {
                doc.set_attribute(toggle, "checked", "checked")?;
            }
        }
        self.storage_debounce.cancel();
        self.save().await;
        Ok(())
    }

    /// Relay console arguments to the tab when debug is on.
    pub fn log(&self, args: Value) {
        if !self.debug {
            return;
        }
        if let Err(err) = self.port.borrow().post_message(&Message::LoggerRequest(args)) {
            report_runtime_error("port.post_message", &err);
        }
    }

    async fn save(&self) {
        let Some(origin) = self.origin.as_deref() else {
            return;
        };
        if let Err(err) = save_origin(self.storage.as_ref(), origin, self.state()).await {
            report_runtime_error("storage.set", &err);
        }
    }

    /// Drop an unsent slider message, write any pending save, then disconnect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.slider_debounce.cancel();
        if self.storage_debounce.cancel() {
            self.save().await;
        }
        self.port.borrow_mut().disconnect();
        debug!(origin = ?self.origin, "popup.close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_ipc::MessageSender;
    use ext_storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    const APP_NAME: &str = "chrome-dimmer";

    struct Harness {
        popup: Popup,
        tab: Port,
        storage: Rc<MemoryStorage>,
    }

    fn open(entries: &[(&str, OriginState)], debug: bool) -> Harness {
        let storage = Rc::new(MemoryStorage::with_entries(
            entries.iter().map(|(k, v)| (k.to_string(), *v)),
        ));
        let mut manifest = Manifest::new(APP_NAME, "abcdefghijklmnop");
        manifest.app.debug = debug;
        let (popup_end, tab) = Port::pair(APP_NAME, MessageSender::extension("abcdefghijklmnop"));
        let popup = Popup::connect(
            default_document().unwrap(),
            popup_end,
            storage.clone(),
            &manifest,
            Timers::new(),
        )
        .unwrap();
        Harness { popup, tab, storage }
    }

    async fn next_message(tab: &mut Port) -> Message {
        match tab.receiver.recv().await {
            Some(PortEvent::Message(value)) => Message::decode(value).unwrap(),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    async fn mount_for(h: &mut Harness, origin: &str) {
        assert_eq!(next_message(&mut h.tab).await, Message::GetUrlRequest);
        h.tab
            .sender
            .post_message(&Message::GetUrlResponse(origin.to_string()))
            .unwrap();
        assert!(h.popup.pump().await.unwrap());
        assert!(h.popup.is_mounted());
    }

    fn state(disabled: bool, value: f64) -> OriginState {
        OriginState {
            disabled,
            value: BrightnessValue::new(value),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_shows_stored_state() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[("example.com", state(false, 40.0))], false);
                mount_for(&mut h, "example.com").await;

                assert_eq!(h.popup.origin(), Some("example.com"));
                assert_eq!(h.popup.slider_value().as_deref(), Some("40"));
                assert_eq!(h.popup.displayed_value().as_deref(), Some("40.0"));
                assert_eq!(h.popup.rgb_display().as_deref(), Some("rgb(102,102,102)"));
                assert_eq!(h.popup.toggle_checked(), Some(true));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_without_origin_uses_defaults() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[], false);
                h.tab
                    .sender
                    .post_message(&Message::LoggerRequest(json!(["hello"])))
                    .unwrap();
                assert!(h.popup.pump().await.unwrap());

                assert!(h.popup.is_mounted());
                assert_eq!(h.popup.origin(), None);
                assert_eq!(h.popup.displayed_value().as_deref(), Some("100.0"));
                assert_eq!(h.popup.toggle_checked(), Some(false));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_controls_abort_mount() {
        LocalSet::new()
            .run_until(async {
                let storage: Rc<dyn StorageArea> = Rc::new(MemoryStorage::new());
                let (popup_end, mut tab) = Port::pair(APP_NAME, MessageSender::extension("id"));
                let mut popup = Popup::connect(
                    Document::new("popup").into_shared(),
                    popup_end,
                    storage,
                    &Manifest::new(APP_NAME, "id"),
                    Timers::new(),
                )
                .unwrap();
                tab.sender
                    .post_message(&Message::GetUrlResponse("example.com".into()))
                    .unwrap();

                assert!(popup.pump().await.unwrap());
                assert!(!popup.is_mounted());
                assert!(popup.on_slider_input(30.0).is_ok());
                assert_eq!(popup.displayed_value(), None);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slider_burst_sends_one_message_and_one_write() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[("example.com", state(false, 100.0))], false);
                mount_for(&mut h, "example.com").await;
                let mut changes = h.storage.subscribe();

                for value in [90.0, 80.0, 70.0, 60.0, 50.0, 40.0, 30.0] {
                    h.popup.on_slider_input(value).unwrap();
                    sleep(Duration::from_millis(5)).await;
                }
                assert_eq!(h.popup.displayed_value().as_deref(), Some("30.0"));
                assert_eq!(h.popup.rgb_display().as_deref(), Some("rgb(77,77,77)"));

                sleep(Duration::from_millis(600)).await;
                assert_eq!(
                    next_message(&mut h.tab).await,
                    Message::SetBrightness(Brightness::from_value(BrightnessValue::new(30.0)))
                );
                assert!(h.tab.receiver.try_recv().unwrap().is_none());

                let batch = changes.recv().await.unwrap();
                assert_eq!(batch["example.com"].new_value, Some(state(false, 30.0)));
                assert!(changes.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_brightness_prunes_origin() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[("example.com", state(false, 40.0))], false);
                mount_for(&mut h, "example.com").await;

                h.popup.on_slider_input(100.0).unwrap();
                sleep(Duration::from_millis(600)).await;
                assert!(h.storage.get_all().await.unwrap().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_writes_immediately() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[("example.com", state(false, 40.0))], false);
                mount_for(&mut h, "example.com").await;

                h.popup.on_toggle().await.unwrap();
                assert_eq!(h.popup.toggle_checked(), Some(false));
                assert_eq!(h.storage.get("example.com").await.unwrap(), state(true, 40.0));

                h.popup.on_toggle().await.unwrap();
                assert_eq!(h.storage.get("example.com").await.unwrap(), state(false, 40.0));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_save_and_drops_message() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[("example.com", state(false, 40.0))], false);
                mount_for(&mut h, "example.com").await;

                h.popup.on_slider_input(25.0).unwrap();
                h.popup.close().await;
                assert!(h.popup.is_closed());
                assert_eq!(h.storage.get("example.com").await.unwrap(), state(false, 25.0));

                sleep(Duration::from_millis(600)).await;
                assert_eq!(h.tab.receiver.recv().await, Some(PortEvent::Disconnected));
                assert!(!h.popup.pump().await.unwrap());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tab_disconnect_closes_popup() {
        LocalSet::new()
            .run_until(async {
                let mut h = open(&[], false);
                h.tab.sender.disconnect();
                assert!(!h.popup.pump().await.unwrap());
                assert!(h.popup.is_closed());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_only_in_debug() {
        LocalSet::new()
            .run_until(async {
                let mut quiet = open(&[], false);
                quiet.popup.log(json!(["ignored"]));
                assert_eq!(next_message(&mut quiet.tab).await, Message::GetUrlRequest);
                assert!(quiet.tab.receiver.try_recv().unwrap().is_none());

                let mut verbose = open(&[], true);
                verbose.popup.log(json!(["slider", 30]));
                assert_eq!(next_message(&mut verbose.tab).await, Message::GetUrlRequest);
                assert_eq!(
                    next_message(&mut verbose.tab).await,
                    Message::LoggerRequest(json!(["slider", 30]))
                );
            })
            .await;
    }
}
