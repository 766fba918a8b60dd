//! Popup <-> content script messaging.
//!
//! A [`Port`] is one end of a connection opened by the popup. The content
//! script wraps every inbound port in a [`PortSession`], which validates the
//! sender and then dispatches decoded [`Message`]s to a [`SessionHandler`].

use ext_brightness::Brightness;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

// ============================================================================
// Error Types (7000+ range)
// ============================================================================

/// Error codes for IPC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpcErrorCode {
    /// Channel send error
    ChannelSend = 7000,
    /// Channel receive error
    ChannelRecv = 7001,
    /// Sender or channel name rejected by the connection checker
    UntrustedConnection = 7002,
    /// Message `type` not recognised
    UnknownMessage = 7003,
    /// Known `type` with a malformed payload
    InvalidPayload = 7004,
}

/// Custom error type for IPC operations
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("[{code}] Channel send error: {message}")]
    ChannelSend { code: u32, message: String },

    #[error("[{code}] Channel receive error: {message}")]
    ChannelRecv { code: u32, message: String },

    #[error("[{code}] Untrusted connection: {message}")]
    UntrustedConnection { code: u32, message: String },

    #[error("[{code}] Unknown message type: {message_type}")]
    UnknownMessage { code: u32, message_type: String },

    #[error("[{code}] Invalid payload for {message_type}: {message}")]
    InvalidPayload {
        code: u32,
        message_type: String,
        message: String,
    },
}

impl IpcError {
    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: IpcErrorCode::ChannelSend as u32,
            message: message.into(),
        }
    }

    pub fn channel_recv(message: impl Into<String>) -> Self {
        Self::ChannelRecv {
            code: IpcErrorCode::ChannelRecv as u32,
            message: message.into(),
        }
    }

    pub fn untrusted_connection(message: impl Into<String>) -> Self {
        Self::UntrustedConnection {
            code: IpcErrorCode::UntrustedConnection as u32,
            message: message.into(),
        }
    }

    pub fn unknown_message(message_type: impl Into<String>) -> Self {
        Self::UnknownMessage {
            code: IpcErrorCode::UnknownMessage as u32,
            message_type: message_type.into(),
        }
    }

    pub fn invalid_payload(message_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            code: IpcErrorCode::InvalidPayload as u32,
            message_type: message_type.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

pub const SET_BRIGHTNESS: &str = "SET_BRIGHTNESS";
pub const GET_URL_REQUEST: &str = "GET_URL_REQUEST";
pub const GET_URL_RESPONSE: &str = "GET_URL_RESPONSE";
pub const LOGGER_REQUEST: &str = "LOGGER_REQUEST";

/// Wire message: `{"type": "...", "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    #[serde(rename = "SET_BRIGHTNESS")]
    SetBrightness(Brightness),
    #[serde(rename = "GET_URL_REQUEST")]
    GetUrlRequest,
    /// The page origin (host).
    #[serde(rename = "GET_URL_RESPONSE")]
    GetUrlResponse(String),
    /// Console arguments relayed for debugging.
    #[serde(rename = "LOGGER_REQUEST")]
    LoggerRequest(Value),
}

impl Message {
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::SetBrightness(_) => SET_BRIGHTNESS,
            Message::GetUrlRequest => GET_URL_REQUEST,
            Message::GetUrlResponse(_) => GET_URL_RESPONSE,
            Message::LoggerRequest(_) => LOGGER_REQUEST,
        }
    }

    /// Decode a raw port message.
    ///
    /// A missing or unrecognised `type` is [`IpcError::UnknownMessage`]; a
    /// recognised `type` with a bad payload is [`IpcError::InvalidPayload`].
    pub fn decode(value: Value) -> Result<Self, IpcError> {
        let message_type = match value.get("type").and_then(Value::as_str) {
            Some(t @ (SET_BRIGHTNESS | GET_URL_REQUEST | GET_URL_RESPONSE | LOGGER_REQUEST)) => {
                t.to_string()
            }
            Some(other) => return Err(IpcError::unknown_message(other)),
            None => return Err(IpcError::unknown_message("<missing>")),
        };
        serde_json::from_value(value)
            .map_err(|e| IpcError::invalid_payload(message_type, e.to_string()))
    }

    pub fn encode(&self) -> Result<Value, IpcError> {
        serde_json::to_value(self).map_err(|e| IpcError::channel_send(e.to_string()))
    }
}

/// Identity of the party that opened a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    /// Extension id of the sender.
    pub id: Option<String>,
    pub url: Option<String>,
}

impl MessageSender {
    pub fn extension(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            url: None,
        }
    }
}

/// Delivered to the receiving end of a port.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Message(Value),
    Disconnected,
}

// ============================================================================
// Ports
// ============================================================================

/// Sending half of a port, with the connection metadata.
#[derive(Debug)]
pub struct PortSender {
    name: String,
    sender: MessageSender,
    tx: Option<mpsc::UnboundedSender<PortEvent>>,
}

impl PortSender {
    /// Channel name the port was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who opened the connection.
    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn post_message(&self, message: &Message) -> Result<(), IpcError> {
        self.post_value(message.encode()?)
    }

    pub fn post_value(&self, value: Value) -> Result<(), IpcError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| IpcError::channel_send("port is disconnected"))?;
        tx.send(PortEvent::Message(value))
            .map_err(|e| IpcError::channel_send(e.to_string()))
    }

    /// Close this end; the peer receives [`PortEvent::Disconnected`]. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(PortEvent::Disconnected);
            tracing::debug!(name = %self.name, "port.disconnect");
        }
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<PortEvent>,
    done: bool,
}

impl PortReceiver {
    /// Next event. A dropped peer reads as one [`PortEvent::Disconnected`], then `None`.
    pub async fn recv(&mut self) -> Option<PortEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or(PortEvent::Disconnected);
        if event == PortEvent::Disconnected {
            self.done = true;
        }
        Some(event)
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Option<PortEvent>, IpcError> {
        if self.done {
            return Err(IpcError::channel_recv("port is disconnected"));
        }
        match self.rx.try_recv() {
            Ok(event) => {
                if event == PortEvent::Disconnected {
                    self.done = true;
                }
                Ok(Some(event))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.done = true;
                Ok(Some(PortEvent::Disconnected))
            }
        }
    }
}

/// One end of a popup <-> content script connection.
#[derive(Debug)]
pub struct Port {
    pub sender: PortSender,
    pub receiver: PortReceiver,
}

impl Port {
    /// `runtime.connect({name})`: returns `(opener, accepted)`.
    ///
    /// The accepted end carries `sender` as the opener's identity.
    pub fn pair(name: impl Into<String>, sender: MessageSender) -> (Port, Port) {
        let name = name.into();
        let (to_accepted_tx, to_accepted_rx) = mpsc::unbounded_channel();
        let (to_opener_tx, to_opener_rx) = mpsc::unbounded_channel();

        let opener = Port {
            sender: PortSender {
                name: name.clone(),
                sender: MessageSender::default(),
                tx: Some(to_accepted_tx),
            },
            receiver: PortReceiver {
                rx: to_opener_rx,
                done: false,
            },
        };
        let accepted = Port {
            sender: PortSender {
                name,
                sender,
                tx: Some(to_opener_tx),
            },
            receiver: PortReceiver {
                rx: to_accepted_rx,
                done: false,
            },
        };
        (opener, accepted)
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

// ============================================================================
// Connection Checker
// ============================================================================

/// Decides whether an inbound connection may open a session.
pub trait ConnectionChecker {
    fn check_connection(&self, name: &str, sender: &MessageSender) -> Result<(), String>;
}

/// Accepts only this extension connecting on the application's channel.
#[derive(Debug, Clone)]
pub struct ExtensionIdentityChecker {
    pub extension_id: String,
    pub app_name: String,
}

impl ExtensionIdentityChecker {
    pub fn new(extension_id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            app_name: app_name.into(),
        }
    }
}

impl ConnectionChecker for ExtensionIdentityChecker {
    fn check_connection(&self, name: &str, sender: &MessageSender) -> Result<(), String> {
        if sender.id.as_deref() != Some(self.extension_id.as_str()) {
            return Err(format!("unknown sender {:?}", sender.id));
        }
        if name != self.app_name {
            return Err(format!("unknown channel {name:?}"));
        }
        Ok(())
    }
}

// ============================================================================
// Sessions
// ============================================================================

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConnect,
    Validating,
    Active,
    Closed,
}

/// Content-script side effects of an active session.
pub trait SessionHandler {
    /// `SET_BRIGHTNESS`
    fn on_set_brightness(&mut self, brightness: Brightness);

    /// Origin sent back for `GET_URL_REQUEST`.
    fn origin(&self) -> String;

    /// `LOGGER_REQUEST`
    fn on_log(&mut self, payload: Value);

    /// Entered CLOSED from ACTIVE. Called at most once per session.
    fn on_close(&mut self);
}

/// Protocol state for one inbound port.
#[derive(Debug)]
pub struct PortSession {
    id: SessionId,
    state: SessionState,
    port: Option<PortSender>,
}

impl Default for PortSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PortSession {
    pub fn new() -> Self {
        Self {
            id: SessionId::next(),
            state: SessionState::AwaitingConnect,
            port: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Validate the connection. A rejected port is disconnected right away.
    pub fn connect(
        &mut self,
        mut port: PortSender,
        checker: &dyn ConnectionChecker,
    ) -> Result<(), IpcError> {
        if self.state != SessionState::AwaitingConnect {
            port.disconnect();
            return Err(IpcError::untrusted_connection(format!(
                "{} already received a connection",
                self.id
            )));
        }

        self.state = SessionState::Validating;
        match checker.check_connection(port.name(), port.sender()) {
            Ok(()) => {
                tracing::debug!(session = %self.id, name = %port.name(), "session.active");
                self.port = Some(port);
                self.state = SessionState::Active;
                Ok(())
            }
            Err(reason) => {
                tracing::debug!(session = %self.id, reason = %reason, "unknown connect request");
                port.disconnect();
                self.state = SessionState::Closed;
                Err(IpcError::untrusted_connection(reason))
            }
        }
    }

    /// Handle one inbound event. Events outside ACTIVE are dropped.
    pub fn dispatch<H>(&mut self, handler: &mut H, event: PortEvent) -> Result<(), IpcError>
    where
        H: SessionHandler + ?Sized,
    {
        if self.state != SessionState::Active {
            tracing::trace!(session = %self.id, state = ?self.state, "session.dispatch ignored");
            return Ok(());
        }

        let value = match event {
            PortEvent::Disconnected => {
                self.close(handler);
                return Ok(());
            }
            PortEvent::Message(value) => value,
        };

        let result = match Message::decode(value) {
            Ok(Message::SetBrightness(brightness)) => {
                tracing::debug!(session = %self.id, value = %brightness.number_val, "session.set_brightness");
                handler.on_set_brightness(brightness);
                Ok(())
            }
            Ok(Message::GetUrlRequest) => {
                let origin = handler.origin();
                tracing::debug!(session = %self.id, origin = %origin, "url requested");
                return self.post(&Message::GetUrlResponse(origin));
            }
            Ok(Message::LoggerRequest(payload)) => {
                handler.on_log(payload);
                Ok(())
            }
            // only ever sent by the content script
            Ok(Message::GetUrlResponse(_)) => Err(IpcError::unknown_message(GET_URL_RESPONSE)),
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            tracing::warn!(session = %self.id, error = %err, "session.dispatch closing");
            self.close(handler);
        }
        result
    }

    pub fn post(&self, message: &Message) -> Result<(), IpcError> {
        match &self.port {
            Some(port) => port.post_message(message),
            None => Err(IpcError::channel_send(format!("{} has no port", self.id))),
        }
    }

    /// Move to CLOSED and disconnect. Only the first call from ACTIVE reaches the handler.
    pub fn close<H>(&mut self, handler: &mut H)
    where
        H: SessionHandler + ?Sized,
    {
        let was_active = self.state == SessionState::Active;
        self.state = SessionState::Closed;
        if let Some(mut port) = self.port.take() {
            port.disconnect();
        }
        if was_active {
            tracing::debug!(session = %self.id, "session.closed");
            handler.on_close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
