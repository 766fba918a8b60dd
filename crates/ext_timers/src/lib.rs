//! runtime:timers extension - setTimeout/clearTimeout and debouncing for dimmer scripts
//!
//! Timers run as local tasks on the current-thread tokio runtime, so every call
//! must happen inside a [`tokio::task::LocalSet`]. Callbacks are plain `FnOnce`
//! closures executed on the same thread that scheduled them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use serde::{Deserialize, Serialize};

static TIMER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Error Types
// ============================================================================

/// Custom error type for timer operations
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("Timer error: {0}")]
    Generic(String),

    #[error("Invalid debounce options: {0}")]
    InvalidOptions(String),
}

impl TimerError {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Self::InvalidOptions(msg.into())
    }
}

// ============================================================================
// State Types
// ============================================================================

/// Identifier returned by [`Timers::set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timer info kept while a timer is pending
#[derive(Debug)]
struct TimerInfo {
    cancel_tx: mpsc::Sender<()>,
}

/// State for managing timers
#[derive(Debug, Default)]
struct TimerState {
    timers: HashMap<TimerId, TimerInfo>,
}

// ============================================================================
// Timers
// ============================================================================

/// Handle to the timer table. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct Timers {
    state: Rc<RefCell<TimerState>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once after `delay` unless cleared first.
    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        let timer_id = TimerId(TIMER_ID_COUNTER.fetch_add(1, Ordering::SeqCst));
        debug!(timer_id = timer_id.0, delay_ms = delay.as_millis() as u64, "timer.create");

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        self.state
            .borrow_mut()
            .timers
            .insert(timer_id, TimerInfo { cancel_tx });

        let state = Rc::clone(&self.state);
        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    // A clear racing the deadline wins: only fire if still registered.
                    let registered = state.borrow_mut().timers.remove(&timer_id).is_some();
                    if registered {
                        debug!(timer_id = timer_id.0, "timer.fired");
                        callback();
                    }
                }
                _ = cancel_rx.recv() => {
                    debug!(timer_id = timer_id.0, "timer.cancelled");
                }
            }
        });

        timer_id
    }

    /// Cancel a pending timer. Returns false if it already fired or never existed.
    pub fn clear_timeout(&self, timer_id: TimerId) -> bool {
        let removed = self.state.borrow_mut().timers.remove(&timer_id);
        match removed {
            Some(info) => {
                debug!(timer_id = timer_id.0, "timer.clear");
                // Send cancel signal (ignore if the task already finished)
                let _ = info.cancel_tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Check if a timer is still pending
    pub fn exists(&self, timer_id: TimerId) -> bool {
        self.state.borrow().timers.contains_key(&timer_id)
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        self.state.borrow().timers.len()
    }
}

// ============================================================================
// Debouncing
// ============================================================================

/// Options for [`Debouncer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOptions {
    /// Quiet period before the call runs.
    pub timeout_ms: u64,
    /// After this many coalesced calls the next one runs without waiting.
    pub max_calls: Option<u32>,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 20,
            max_calls: None,
        }
    }
}

impl DebounceOptions {
    pub fn new(timeout_ms: u64, max_calls: Option<u32>) -> Result<Self, TimerError> {
        if max_calls == Some(0) {
            return Err(TimerError::invalid_options("max_calls must be at least 1"));
        }
        Ok(Self {
            timeout_ms,
            max_calls,
        })
    }

    fn delay_for(&self, calls: u32) -> Duration {
        match self.max_calls {
            Some(max) if calls > max => Duration::ZERO,
            _ => Duration::from_millis(self.timeout_ms),
        }
    }
}

type PendingCall = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

/// Collapses rapid calls into the last one, bounded by a maximum call count.
///
/// Every [`schedule`](Debouncer::schedule) replaces the pending closure and
/// restarts the quiet period. Once more than `max_calls` calls have been
/// coalesced the pending closure runs on the next tick instead, so continuous
/// input still produces periodic executions.
pub struct Debouncer {
    timers: Timers,
    options: DebounceOptions,
    timer: Option<TimerId>,
    calls: Rc<Cell<u32>>,
    pending: PendingCall,
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("options", &self.options)
            .field("timer", &self.timer)
            .field("calls", &self.calls.get())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Debouncer {
    pub fn new(timers: Timers, options: DebounceOptions) -> Self {
        Self {
            timers,
            options,
            timer: None,
            calls: Rc::new(Cell::new(0)),
            pending: Rc::new(RefCell::new(None)),
        }
    }

    pub fn options(&self) -> DebounceOptions {
        self.options
    }

    pub fn schedule(&mut self, call: impl FnOnce() + 'static) {
        if let Some(timer_id) = self.timer.take() {
            self.timers.clear_timeout(timer_id);
        }

        let calls = self.calls.get() + 1;
        self.calls.set(calls);
        let delay = self.options.delay_for(calls);

        *self.pending.borrow_mut() = Some(Box::new(call));

        let pending = Rc::clone(&self.pending);
        let counter = Rc::clone(&self.calls);
        self.timer = Some(self.timers.set_timeout(delay, move || {
            counter.set(0);
            let call = pending.borrow_mut().take();
            if let Some(call) = call {
                call();
            }
        }));
    }

    /// Drop the pending call. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        if let Some(timer_id) = self.timer.take() {
            self.timers.clear_timeout(timer_id);
        }
        self.calls.set(0);
        self.pending.borrow_mut().take().is_some()
    }

    /// Run the pending call now. Returns true if one was pending.
    pub fn flush(&mut self) -> bool {
        if let Some(timer_id) = self.timer.take() {
            self.timers.clear_timeout(timer_id);
        }
        self.calls.set(0);
        let call = self.pending.borrow_mut().take();
        match call {
            Some(call) => {
                call();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================
