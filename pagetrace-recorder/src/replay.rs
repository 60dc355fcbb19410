//! Session replay engine seam
//!
//! The replay engine (rrweb in a browser) is an external component: it is started
//! with a set of options and an emission callback, and hands back a handle that
//! stops it.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::ReplayEvent;
use crate::{RecorderError, Result};

/// Callback the engine invokes for every event it produces.
pub type EmitFn = Arc<dyn Fn(ReplayEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskInputOptions {
    pub password: bool,
}

/// Options handed to the engine when recording starts (rrweb `record()` options).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOptions {
    pub mask_input_options: MaskInputOptions,

    /// Take a full snapshot after this many milliseconds
    #[serde(rename = "checkoutEveryNms")]
    pub checkout_every_nms: u64,

    /// Take a full snapshot after this many events
    pub checkout_every_nth: u32,

    pub record_shadow_dom: bool,
}

/// Stops a running engine.
pub trait StopHandle: Send {
    fn stop(self: Box<Self>);
}

impl<F: FnOnce() + Send> StopHandle for F {
    fn stop(self: Box<Self>) {
        (*self)()
    }
}

/// A session replay recorder.
pub trait ReplayEngine: Send + Sync {
    fn record(&self, options: RecordOptions, emit: EmitFn) -> Result<Box<dyn StopHandle>>;
}

#[derive(Default)]
struct ManualState {
    emit: Option<EmitFn>,
    options: Option<RecordOptions>,
    starts: usize,
    fail_next: Option<String>,
}

/// Engine whose events are pushed in by the host, e.g. forwarded from a real
/// replay library running elsewhere.
///
/// Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct ManualReplayEngine {
    state: Arc<Mutex<ManualState>>,
}

impl ManualReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an event through the emission callback. Returns `false` when not recording.
    pub fn emit(&self, event: ReplayEvent) -> bool {
        // The callback must run without the lock held.
        let emit = self.state.lock().ok().and_then(|s| s.emit.clone());
        match emit {
            Some(emit) => {
                emit(event);
                true
            }
            None => false,
        }
    }

    /// Emit on a callback captured earlier, bypassing the stopped check. Models an engine
    /// that keeps producing events after it was asked to stop.
    pub fn emission_callback(&self) -> Option<EmitFn> {
        self.state.lock().ok().and_then(|s| s.emit.clone())
    }

    pub fn is_recording(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.emit.is_some())
            .unwrap_or(false)
    }

    /// How many times recording was started.
    pub fn start_count(&self) -> usize {
        self.state.lock().map(|s| s.starts).unwrap_or(0)
    }

    pub fn last_options(&self) -> Option<RecordOptions> {
        self.state.lock().ok().and_then(|s| s.options)
    }

    /// Make the next `record` call fail with `reason`.
    pub fn fail_next_start(&self, reason: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = Some(reason.into());
        }
    }
}

impl ReplayEngine for ManualReplayEngine {
    fn record(&self, options: RecordOptions, emit: EmitFn) -> Result<Box<dyn StopHandle>> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| RecorderError::State(format!("Failed to lock engine state: {e}")))?;
        if let Some(reason) = state.fail_next.take() {
            return Err(RecorderError::Engine(reason));
        }
        if state.emit.is_some() {
            return Err(RecorderError::Engine("already recording".to_string()));
        }
        state.emit = Some(emit);
        state.options = Some(options);
        state.starts += 1;
        debug!(starts = state.starts, "manual replay engine started");

        let shared = Arc::clone(&self.state);
        Ok(Box::new(move || {
            if let Ok(mut state) = shared.lock() {
                state.emit = None;
            }
        }))
    }
}
