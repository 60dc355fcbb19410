use crate::{
    InboundMessage, MessageChannel, OutboundMessage, RecordOptions, RecorderError, ReplayEngine,
    ReplayEvent, Result, StopHandle,
};
use crate::replay::{EmitFn, MaskInputOptions};
use pagetrace::Dom;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub mod capture;
pub mod scroll;
pub mod shadow;

use self::capture::CaptureHandlers;
use self::scroll::ScrollSmoother;
use self::shadow::ShadowInstrumenter;

/// Which node a captured action is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetResolution {
    /// The head of `composedPath()`: the real element, even inside a shadow tree
    #[default]
    ComposedPath,
    /// `event.target` as the listener sees it, i.e. retargeted to the shadow host
    EventTarget,
}

/// Configuration for the page recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Quiet period after the last scroll before it is emitted (milliseconds)
    pub scroll_quiet_period_ms: u64,

    /// Full snapshot checkpoint interval (milliseconds)
    pub checkout_every_ms: u64,

    /// Full snapshot checkpoint interval (events)
    pub checkout_every_events: u32,

    /// Ask the replay engine to mask password fields. Action events always mask them.
    pub mask_passwords: bool,

    /// Whether the replay engine records inside shadow trees
    pub record_shadow_dom: bool,

    /// Maximum number of characters of click text to keep
    pub max_click_text_chars: usize,

    pub target_resolution: TargetResolution,

    /// Watch for shadow roots added after recording starts
    pub observe_shadow_roots: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            scroll_quiet_period_ms: 150,
            checkout_every_ms: 10_000, // full snapshot every 10s
            checkout_every_events: 200,
            mask_passwords: true,
            record_shadow_dom: true,
            max_click_text_chars: 200,
            target_resolution: TargetResolution::ComposedPath,
            observe_shadow_roots: true,
        }
    }
}

impl RecorderConfig {
    /// A configuration for pages without web components: no shadow DOM recording or
    /// observation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pagetrace_recorder::RecorderConfig;
    ///
    /// let config = RecorderConfig::light_dom_only();
    /// assert!(!config.observe_shadow_roots);
    /// ```
    pub fn light_dom_only() -> Self {
        Self {
            record_shadow_dom: false,
            observe_shadow_roots: false,
            ..Self::default()
        }
    }

    /// Parse a configuration; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn scroll_quiet_period(&self) -> Duration {
        Duration::from_millis(self.scroll_quiet_period_ms)
    }

    /// Options handed to the replay engine when recording starts
    pub fn record_options(&self) -> RecordOptions {
        RecordOptions {
            mask_input_options: MaskInputOptions {
                password: self.mask_passwords,
            },
            checkout_every_nms: self.checkout_every_ms,
            checkout_every_nth: self.checkout_every_events,
            record_shadow_dom: self.record_shadow_dom,
        }
    }
}

struct ActiveSession {
    id: Uuid,
    started_at: u64,
    stop_handle: Box<dyn StopHandle>,
    scroll: Arc<ScrollSmoother>,
}

enum SessionState {
    Stopped,
    Recording(ActiveSession),
}

/// Records user actions and replay events on one page.
///
/// The recorder is either stopped or recording. While recording, the replay engine's
/// events flow to the channel (scrolls debounced) alongside the actions captured by
/// the listeners it attaches to the document and its shadow roots.
pub struct PageRecorder {
    config: RecorderConfig,
    engine: Arc<dyn ReplayEngine>,
    channel: Arc<dyn MessageChannel>,
    active: Arc<AtomicBool>,
    instrumenter: Arc<ShadowInstrumenter>,
    state: SessionState,
}

impl PageRecorder {
    pub fn new(
        config: RecorderConfig,
        engine: Arc<dyn ReplayEngine>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(false));
        let handlers = Arc::new(CaptureHandlers::new(
            &config,
            Arc::clone(&active),
            Arc::clone(&channel),
        ));
        let instrumenter = ShadowInstrumenter::new(handlers, config.observe_shadow_roots);
        Self {
            config,
            engine,
            channel,
            active,
            instrumenter,
            state: SessionState::Stopped,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, SessionState::Recording(_))
    }

    /// Id of the current session, if recording
    pub fn session_id(&self) -> Option<Uuid> {
        match &self.state {
            SessionState::Recording(session) => Some(session.id),
            SessionState::Stopped => None,
        }
    }

    /// Number of roots (document and shadow roots) carrying capture listeners
    pub fn instrumented_roots(&self) -> usize {
        self.instrumenter.instrumented_roots()
    }

    /// Start recording. No-op if already recording.
    ///
    /// Must be called from within a tokio runtime, which drives the scroll debounce timer.
    pub fn start(&mut self, dom: &mut Dom) -> Result<()> {
        if self.is_recording() {
            debug!("Recorder already running, ignoring start");
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| RecorderError::NoRuntime)?;

        let id = Uuid::new_v4();
        let scroll = Arc::new(ScrollSmoother::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.active),
            runtime,
            self.config.scroll_quiet_period(),
        ));

        self.active.store(true, Ordering::SeqCst);
        let emit = self.emit_callback(Arc::clone(&scroll));
        let stop_handle = match self.engine.record(self.config.record_options(), emit) {
            Ok(handle) => handle,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let document = dom.document();
        if let Err(e) = self.instrumenter.instrument(dom, document) {
            self.active.store(false, Ordering::SeqCst);
            scroll.shutdown();
            stop_handle.stop();
            return Err(e);
        }

        info!(
            session = %id,
            url = dom.document_url(),
            roots = self.instrumenter.instrumented_roots(),
            "Recording started"
        );
        self.state = SessionState::Recording(ActiveSession {
            id,
            started_at: epoch_millis(),
            stop_handle,
            scroll,
        });
        Ok(())
    }

    /// Stop recording. No-op if already stopped.
    ///
    /// Listeners stay attached but go inert; a later `start` reuses them.
    pub fn stop(&mut self) {
        let SessionState::Recording(session) =
            std::mem::replace(&mut self.state, SessionState::Stopped)
        else {
            debug!("Recorder not running, ignoring stop");
            return;
        };

        // Cleared first so anything the engine emits from here on is dropped.
        self.active.store(false, Ordering::SeqCst);
        session.scroll.shutdown();
        session.stop_handle.stop();

        info!(
            session = %session.id,
            duration_ms = epoch_millis().saturating_sub(session.started_at),
            "Recording stopped"
        );
    }

    /// Stop and remove every listener and observer from the page.
    pub fn detach(&mut self, dom: &mut Dom) -> Result<usize> {
        self.stop();
        self.instrumenter.detach(dom)
    }

    /// Bring the recorder to the requested state. No-op if already there.
    pub fn set_recording(&mut self, dom: &mut Dom, enabled: bool) -> Result<()> {
        match (enabled, self.is_recording()) {
            (true, false) => self.start(dom),
            (false, true) => {
                self.stop();
                Ok(())
            }
            _ => {
                trace!(enabled, "Recording status unchanged");
                Ok(())
            }
        }
    }

    pub fn handle_message(&mut self, dom: &mut Dom, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::SetRecordingStatus(enabled) => self.set_recording(dom, enabled),
        }
    }

    /// Handle a raw JSON message from the background context. Returns whether it was
    /// addressed to the recorder.
    pub fn handle_raw_message(&mut self, dom: &mut Dom, raw: &str) -> Result<bool> {
        match InboundMessage::parse(raw)? {
            Some(message) => {
                self.handle_message(dom, message)?;
                Ok(true)
            }
            None => {
                debug!("Ignoring message not addressed to the recorder");
                Ok(false)
            }
        }
    }

    /// Page load: ask the background whether recording is enabled and start if so.
    /// Returns whether the recorder is recording afterwards.
    pub async fn bootstrap(&mut self, dom: &mut Dom) -> Result<bool> {
        match self.channel.request_recording_status().await {
            Ok(response) => {
                debug!(
                    enabled = response.is_recording_enabled,
                    "Received recording status"
                );
                self.set_recording(dom, response.is_recording_enabled)?;
            }
            Err(e) => warn!("Failed to get recording status, staying stopped: {}", e),
        }
        Ok(self.is_recording())
    }

    /// Page teardown
    pub fn teardown(&mut self) {
        self.stop();
    }

    fn emit_callback(&self, scroll: Arc<ScrollSmoother>) -> EmitFn {
        let active = Arc::clone(&self.active);
        let channel = Arc::clone(&self.channel);
        Arc::new(move |event: ReplayEvent| {
            if !active.load(Ordering::SeqCst) {
                trace!("Recorder inactive, dropping replay event");
                return;
            }
            if event.is_scroll() {
                scroll.push(event);
                return;
            }
            if let Err(e) = channel.send(OutboundMessage::RrwebEvent(event)) {
                warn!("Failed to send replay event: {}", e);
            }
        })
    }
}

impl Drop for PageRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
