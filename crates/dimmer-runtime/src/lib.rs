//! Dimmer runtime: wires the page-side content script and the popup
//! controller together over a port and a storage area.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────┐   Port (SET_BRIGHTNESS,   ┌────────────────────┐
//! │    Popup     │◄─────────────────────────►│   ContentScript    │
//! │ (popup.rs)   │   GET_URL_*, LOGGER_*)    │ (content_script.rs)│
//! └──────┬───────┘                           └───┬──────────┬─────┘
//!        │ set / remove                 onChanged│          │ writes
//!  ┌─────▼────────────────────────────────────────▼┐   ┌────▼─────┐
//!  │            StorageArea (ext_storage)          │   │ Document │
//!  └───────────────────────────────────────────────┘   └──────────┘
//! ```
//!
//! Everything runs on one thread: callers drive these types from a
//! current-thread runtime inside a [`tokio::task::LocalSet`].

pub mod config;
pub mod content_script;
pub mod popup;

pub use config::Manifest;
pub use content_script::ContentScript;
pub use popup::{Popup, PopupControls};

use ext_dom::DomError;
use ext_ipc::IpcError;
use ext_storage::StorageError;
use ext_timers::TimerError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Dom(#[from] DomError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}
