//! The page-side runtime: one instance per injected content script.

use ext_brightness::{
    Brightness, BrightnessApplicator, BrightnessState, DarkModeDetector, DocumentBrightness,
};
use ext_dom::SharedDocument;
use ext_ipc::{
    ConnectionChecker, ExtensionIdentityChecker, Port, PortEvent, PortSession, SessionHandler,
    SessionId,
};
use ext_log::{relay_console, report_runtime_error};
use ext_observer::{outermost_image_like, ImageObserver, InstanceClaim, InstanceMarker};
use ext_storage::{OriginState, StorageArea, StorageChanges};
use ext_timers::Timers;
use serde_json::Value;
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Manifest;
use crate::RuntimeError;

/// Owns brightness for one document.
///
/// Constructed once per injection. A [`ContentScript`] whose marker claim is
/// foreign still answers the popup but never writes brightness or observes
/// the page.
pub struct ContentScript {
    document: SharedDocument,
    origin: String,
    claim: InstanceClaim,
    controller: DocumentBrightness,
    images: ImageObserver,
    dark_mode: DarkModeDetector,
    storage: Rc<dyn StorageArea>,
    checker: Box<dyn ConnectionChecker>,
    debug: bool,
    sessions: HashMap<SessionId, PortSession>,
}

impl std::fmt::Debug for ContentScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentScript")
            .field("origin", &self.origin)
            .field("claim", &self.claim)
            .field("controller", &self.controller.state())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl ContentScript {
    pub fn new(
        document: SharedDocument,
        manifest: &Manifest,
        storage: Rc<dyn StorageArea>,
        timers: Timers,
    ) -> Result<Self, RuntimeError> {
        let marker = InstanceMarker::new(&manifest.app.name);
        Self::with_marker(document, manifest, storage, timers, &marker)
    }

    pub fn with_marker(
        document: SharedDocument,
        manifest: &Manifest,
        storage: Rc<dyn StorageArea>,
        timers: Timers,
        marker: &InstanceMarker,
    ) -> Result<Self, RuntimeError> {
        let claim = marker.acquire(&mut document.borrow_mut())?;
        let origin = document.borrow().host().to_string();
        info!(origin = %origin, status = ?claim.status, "content_script.start");

        Ok(Self {
            controller: DocumentBrightness::with_transition(
                document.clone(),
                timers,
                manifest.transition_duration(),
            ),
            images: ImageObserver::new(document.clone(), &claim),
            dark_mode: manifest.dark_mode.detector(),
            checker: Box::new(ExtensionIdentityChecker::new(
                &manifest.app.extension_id,
                &manifest.app.name,
            )),
            debug: manifest.app.debug,
            sessions: HashMap::new(),
            document,
            origin,
            claim,
            storage,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn claim(&self) -> &InstanceClaim {
        &self.claim
    }

    pub fn brightness_state(&self) -> BrightnessState {
        self.controller.state()
    }

    pub fn is_observing(&self) -> bool {
        self.images.is_watching()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn is_dark(&self) -> bool {
        self.dark_mode.is_dark(&self.document.borrow())
    }

    /// Load the origin's stored state, apply it, then start observing.
    pub async fn init(&mut self) -> Result<(), RuntimeError> {
        let state = match self.storage.get(&self.origin).await {
            Ok(state) => state,
            Err(err) => {
                report_runtime_error("storage.get", &err);
                OriginState::default()
            }
        };
        debug!(origin = %self.origin, disabled = state.disabled, value = %state.value, "content_script.init");

        if self.claim.is_authoritative() && !state.disabled && !self.is_dark() {
            self.controller.enable();
        }
        self.set_brightness(&Brightness::from_value(state.value));
        self.images.set_brightness(state.value).watch()?;

        if self.debug {
            self.log_storage().await;
        }
        Ok(())
    }

    /// Apply `brightness` to the background and to every outermost image-like
    /// element in document order. Returns the number of images written.
    pub fn set_brightness(&mut self, brightness: &Brightness) -> usize {
        if !self.claim.is_authoritative() {
            return 0;
        }

        self.controller.set(&brightness.rgb_val);

        let applicator = BrightnessApplicator::new(brightness.number_val);
        let applied = {
            let mut doc = self.document.borrow_mut();
            let root = doc.root();
            outermost_image_like(&doc, root)
                .into_iter()
                .filter(|node| applicator.apply(&mut doc, *node))
                .count()
        };
        self.images.set_brightness(brightness.number_val);
        debug!(value = %brightness.number_val, images = applied, "content_script.set_brightness");
        applied
    }

    /// React to another context changing this origin's `disabled` flag.
    ///
    /// A removed entry reads as [`OriginState::default`], like any origin
    /// without one.
    pub fn on_storage_change(&mut self, changes: &StorageChanges) {
        let Some(change) = changes.get(&self.origin) else {
            return;
        };
        let new_value = change.new_value.unwrap_or_default();
        if change.old_value.map(|old| old.disabled) == Some(new_value.disabled) {
            return;
        }
        if !self.claim.is_authoritative() {
            return;
        }

        if new_value.disabled {
            self.controller.disable();
        } else if !self.is_dark() {
            self.controller.enable();
        }
        self.set_brightness(&Brightness::from_value(new_value.value));
    }

    /// Validate an inbound port and start its session.
    ///
    /// Returns the session id when the connection was accepted; events for it
    /// are forwarded into `events`.
    pub fn on_connect(
        &mut self,
        port: Port,
        events: &mpsc::UnboundedSender<(SessionId, PortEvent)>,
    ) -> Option<SessionId> {
        let (sender, mut receiver) = port.split();
        let mut session = PortSession::new();
        if let Err(err) = session.connect(sender, self.checker.as_ref()) {
            debug!(error = %err, "content_script.connect rejected");
            return None;
        }

        if self.is_dark() {
            debug!("document is in dark mode");
            self.controller.disable();
        }

        let id = session.id();
        let events = events.clone();
        tokio::task::spawn_local(async move {
            while let Some(event) = receiver.recv().await {
                if events.send((id, event)).is_err() {
                    break;
                }
            }
        });
        self.sessions.insert(id, session);
        Some(id)
    }

    /// Dispatch one event to its session. Closed sessions are dropped.
    pub fn on_port_event(&mut self, id: SessionId, event: PortEvent) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        if let Err(err) = session.dispatch(self, event) {
            warn!(session = %id, error = %err, "content_script.dispatch");
        }
        if session.is_active() {
            self.sessions.insert(id, session);
        }
    }

    /// Deliver queued mutations to the image observer.
    pub fn on_mutations(&mut self) -> usize {
        self.images.deliver()
    }

    async fn log_storage(&self) {
        match self.storage.get_all().await {
            Ok(entries) => match serde_json::to_value(&entries) {
                Ok(value) => relay_console("storage", &value),
                Err(err) => report_runtime_error("storage.dump", &err),
            },
            Err(err) => report_runtime_error("storage.get_all", &err),
        }
    }

    /// Event loop: connections, port messages, storage changes and mutations.
    ///
    /// Returns once `connections` is closed and every session has ended.
    pub async fn run(mut self, mut connections: mpsc::UnboundedReceiver<Port>) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(SessionId, PortEvent)>();
        let mut storage_changes = self.storage.subscribe();
        let mutations = self.document.borrow().mutation_signal();
        let mut accepting = true;

        while accepting || !self.sessions.is_empty() {
            tokio::select! {
                biased;

                Some((id, event)) = events_rx.recv() => {
                    self.on_port_event(id, event);
                }
                port = connections.recv(), if accepting => match port {
                    Some(port) => {
                        self.on_connect(port, &events_tx);
                    }
                    None => accepting = false,
                },
                Some(changes) = storage_changes.recv() => {
                    self.on_storage_change(&changes);
                }
                _ = mutations.notified() => {
                    self.on_mutations();
                }
            }
        }
        debug!(origin = %self.origin, "content_script.stop");
        self
    }
}

impl SessionHandler for ContentScript {
    fn on_set_brightness(&mut self, brightness: Brightness) {
        self.images.unwatch();
        self.set_brightness(&brightness);
    }

    fn origin(&self) -> String {
        self.origin.clone()
    }

    fn on_log(&mut self, payload: Value) {
        if self.debug {
            relay_console("popup", &payload);
        }
    }

    fn on_close(&mut self) {
        if let Err(err) = self.images.watch() {
            report_runtime_error("observer.watch", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_brightness::BrightnessValue;
    use ext_dom::{Document, NodeSpec};
    use ext_ipc::{Message, MessageSender};
    use ext_observer::{is_image_like, InstanceStatus, InstanceToken};
    use ext_log::CONSOLE_TARGET;
    use ext_storage::{MemoryStorage, StorageChange};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::task::LocalSet;
    use tracing_subscriber::EnvFilter;

    const EXTENSION_ID: &str = "abcdefghijklmnop";
    const APP_NAME: &str = "chrome-dimmer";

    fn manifest() -> Manifest {
        Manifest::new(APP_NAME, EXTENSION_ID)
    }

    fn page() -> SharedDocument {
        let mut doc = Document::new("example.com");
        let body = doc.body();
        doc.append_spec(body, &NodeSpec::element("img")).unwrap();
        doc.append_spec(
            body,
            &NodeSpec::element("div").with_child(NodeSpec::element("video")),
        )
        .unwrap();
        doc.into_shared()
    }

    fn stored(disabled: bool, value: f64) -> Rc<dyn StorageArea> {
        Rc::new(MemoryStorage::with_entries([(
            "example.com".to_string(),
            OriginState {
                disabled,
                value: BrightnessValue::new(value),
            },
        )]))
    }

    fn filters(document: &SharedDocument) -> Vec<String> {
        let doc = document.borrow();
        doc.descendants(doc.root())
            .into_iter()
            .filter(|n| is_image_like(&doc, *n))
            .map(|n| doc.inline_style(n, "filter").to_string())
            .collect()
    }

    fn body_background(document: &SharedDocument) -> String {
        let doc = document.borrow();
        doc.inline_style(doc.body(), "background-color").to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_applies_stored_state() {
        LocalSet::new()
            .run_until(async {
                let document = page();
                let mut script =
                    ContentScript::new(document.clone(), &manifest(), stored(false, 40.0), Timers::new())
                        .unwrap();
                script.init().await.unwrap();

                assert_eq!(script.claim().status, InstanceStatus::New);
                assert_eq!(script.brightness_state(), BrightnessState::Enabled);
                assert!(script.is_observing());
                assert_eq!(filters(&document), vec!["brightness(40%)"; 2]);
                assert_eq!(body_background(&document), "rgb(102,102,102)");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_disabled_origin_keeps_background() {
        LocalSet::new()
            .run_until(async {
                let document = page();
                let mut script =
                    ContentScript::new(document.clone(), &manifest(), stored(true, 40.0), Timers::new())
                        .unwrap();
                script.init().await.unwrap();

                assert_eq!(script.brightness_state(), BrightnessState::Disabled);
                assert_eq!(filters(&document), vec!["brightness(40%)"; 2]);
                assert_eq!(body_background(&document), "");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dark_page_stays_disabled() {
        LocalSet::new()
            .run_until(async {
                let document = page();
                {
                    let mut doc = document.borrow_mut();
                    let html = doc.document_element();
                    doc.set_attribute(html, "data-color-mode", "dark").unwrap();
                }
                let mut script =
                    ContentScript::new(document.clone(), &manifest(), stored(false, 40.0), Timers::new())
                        .unwrap();
                script.init().await.unwrap();

                assert_eq!(script.brightness_state(), BrightnessState::Disabled);
                assert_eq!(body_background(&document), "");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_instance_writes_nothing() {
        LocalSet::new()
            .run_until(async {
                let document = page();
                let owner = InstanceMarker::with_token(APP_NAME, InstanceToken::from_bytes([1; 16]));
                let intruder = InstanceMarker::with_token(APP_NAME, InstanceToken::from_bytes([2; 16]));
                let _first = ContentScript::with_marker(
                    document.clone(),
                    &manifest(),
                    stored(false, 40.0),
                    Timers::new(),
                    &owner,
                )
                .unwrap();
                let mut second = ContentScript::with_marker(
                    document.clone(),
                    &manifest(),
                    stored(false, 40.0),
                    Timers::new(),
                    &intruder,
                )
                .unwrap();

                second.init().await.unwrap();
                assert_eq!(second.claim().status, InstanceStatus::ExistingForeign);
                assert!(!second.is_observing());
                assert_eq!(second.brightness_state(), BrightnessState::Disabled);
                assert_eq!(filters(&document), vec![""; 2]);
                assert_eq!(body_background(&document), "");
                assert_eq!(document.borrow().created_observer_count(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_change_toggles_background() {
        LocalSet::new()
            .run_until(async {
                let document = page();
                let mut script =
                    ContentScript::new(document.clone(), &manifest(), stored(true, 40.0), Timers::new())
                        .unwrap();
                script.init().await.unwrap();

                let change = |old: Option<(bool, f64)>, new: Option<(bool, f64)>| {
                    let to_state = |(disabled, value): (bool, f64)| OriginState {
                        disabled,
                        value: BrightnessValue::new(value),
                    };
                    StorageChanges::from([(
                        "example.com".to_string(),
                        StorageChange {
                            new_value: new.map(to_state),
                            old_value: old.map(to_state),
                        },
                    )])
                };

                // value-only changes are left to SET_BRIGHTNESS
                script.on_storage_change(&change(Some((true, 40.0)), Some((true, 20.0))));
                assert_eq!(filters(&document), vec!["brightness(40%)"; 2]);

                script.on_storage_change(&change(Some((true, 40.0)), Some((false, 20.0))));
                assert_eq!(script.brightness_state(), BrightnessState::Enabled);
                assert_eq!(filters(&document), vec!["brightness(20%)"; 2]);
                assert_eq!(body_background(&document), "rgb(51,51,51)");

                script.on_storage_change(&change(Some((false, 20.0)), Some((true, 20.0))));
                assert_eq!(script.brightness_state(), BrightnessState::Disabled);
                assert_eq!(body_background(&document), "");

                script.on_storage_change(&change(Some((true, 20.0)), Some((false, 60.0))));
                assert_eq!(script.brightness_state(), BrightnessState::Enabled);

                // a removed entry is the default: disabled at full brightness
                script.on_storage_change(&change(Some((false, 60.0)), None));
                assert_eq!(script.brightness_state(), BrightnessState::Disabled);
                assert_eq!(filters(&document), vec!["brightness(100%)"; 2]);
                assert_eq!(body_background(&document), "");

                // removing an entry that was already disabled changes nothing
                script.on_storage_change(&change(Some((true, 60.0)), None));
                assert_eq!(script.brightness_state(), BrightnessState::Disabled);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle_pauses_observer() {
        LocalSet::new()
            .run_until(async {
                let document = page();
                let mut script =
                    ContentScript::new(document.clone(), &manifest(), stored(false, 40.0), Timers::new())
                        .unwrap();
                script.init().await.unwrap();
                let (events_tx, _events_rx) = mpsc::unbounded_channel();

                let (popup, content) = Port::pair(APP_NAME, MessageSender::extension(EXTENSION_ID));
                let id = script.on_connect(content, &events_tx).unwrap();
                assert_eq!(script.active_sessions(), 1);

                let message = Message::SetBrightness(Brightness::from_value(BrightnessValue::new(70.0)));
                script.on_port_event(id, PortEvent::Message(message.encode().unwrap()));
                assert!(!script.is_observing());
                assert_eq!(filters(&document), vec!["brightness(70%)"; 2]);

                script.on_port_event(id, PortEvent::Disconnected);
                assert!(script.is_observing());
                assert_eq!(script.active_sessions(), 0);

                // the re-armed observer uses the latest value
                let img = {
                    let mut doc = document.borrow_mut();
                    let body = doc.body();
                    doc.append_spec(body, &NodeSpec::element("img")).unwrap()
                };
                // the body's children are walked again: img, video and the new img
                assert_eq!(script.on_mutations(), 3);
                assert_eq!(document.borrow().inline_style(img, "filter"), "brightness(70%)");
                drop(popup);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrusted_connection_is_ignored() {
        LocalSet::new()
            .run_until(async {
                let mut script =
                    ContentScript::new(page(), &manifest(), stored(false, 40.0), Timers::new()).unwrap();
                let (events_tx, _events_rx) = mpsc::unbounded_channel();

                let (mut popup, content) = Port::pair("other-app", MessageSender::extension(EXTENSION_ID));
                assert!(script.on_connect(content, &events_tx).is_none());
                assert_eq!(script.active_sessions(), 0);
                assert_eq!(popup.receiver.recv().await, Some(PortEvent::Disconnected));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_answers_url_request_and_stops() {
        LocalSet::new()
            .run_until(async {
                let mut script =
                    ContentScript::new(page(), &manifest(), stored(false, 40.0), Timers::new()).unwrap();
                script.init().await.unwrap();
                let (connections_tx, connections_rx) = mpsc::unbounded_channel();
                let handle = tokio::task::spawn_local(script.run(connections_rx));

                let (mut popup, content) = Port::pair(APP_NAME, MessageSender::extension(EXTENSION_ID));
                connections_tx.send(content).unwrap();
                popup.sender.post_message(&Message::GetUrlRequest).unwrap();

                let Some(PortEvent::Message(reply)) = popup.receiver.recv().await else {
                    panic!("expected GET_URL_RESPONSE");
                };
                assert_eq!(reply, json!({"type": "GET_URL_RESPONSE", "payload": "example.com"}));

                drop(connections_tx);
                popup.sender.disconnect();
                let script = handle.await.unwrap();
                assert_eq!(script.active_sessions(), 0);
                assert!(script.is_observing());
            })
            .await;
    }

    /// Formatted lines on the console relay target.
    #[derive(Clone, Default)]
    struct Console(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Console {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Console {
        fn capture(&self) -> tracing::subscriber::DefaultGuard {
            let out = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || out.clone())
                .with_ansi(false)
                .with_env_filter(EnvFilter::new(format!("{CONSOLE_TARGET}=info")))
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    async fn debug_script(debug: bool) -> ContentScript {
        let mut manifest = manifest();
        manifest.app.debug = debug;
        let storage = stored(false, 40.0);
        storage
            .set(BTreeMap::from([(
                "other.org".to_string(),
                OriginState::default(),
            )]))
            .await
            .unwrap();
        let mut script = ContentScript::new(page(), &manifest, storage, Timers::new()).unwrap();
        script.init().await.unwrap();
        script
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_relays_console_lines() {
        LocalSet::new()
            .run_until(async {
                let console = Console::default();
                let _guard = console.capture();

                let mut script = debug_script(true).await;
                let dump = console.lines();
                assert_eq!(dump.len(), 1);
                assert!(dump[0].contains(CONSOLE_TARGET));
                assert!(dump[0].contains("example.com"));
                assert!(dump[0].contains("other.org"));

                script.on_log(json!(["slider", 40]));
                let lines = console.lines();
                assert_eq!(lines.len(), 2);
                assert!(lines[1].contains("slider 40"));
                assert!(lines[1].contains("popup"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_lines_dropped_without_debug() {
        LocalSet::new()
            .run_until(async {
                let console = Console::default();
                let _guard = console.capture();

                let mut script = debug_script(false).await;
                script.on_log(json!(["slider", 40]));

                assert!(console.lines().is_empty());
            })
            .await;
    }
}
