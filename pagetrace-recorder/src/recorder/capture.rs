use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pagetrace::locator::UNKNOWN_TAG;
use pagetrace::{DispatchedEvent, Dom, ElementLocator, EventType, NodeId, PageId};
use tracing::{debug, trace, warn};

use super::{RecorderConfig, TargetResolution};
use crate::channel::MessageChannel;
use crate::events::{
    ActionContext, CapturedActionEvent, ClickEvent, InputEvent, KeyEvent, OutboundMessage,
    SelectEvent, PASSWORD_MASK,
};
use crate::Result;

/// Keys recorded verbatim on keydown.
pub const CONTROL_KEYS: &[&str] = &[
    "Enter",
    "Tab",
    "Escape",
    "ArrowUp",
    "ArrowDown",
    "ArrowLeft",
    "ArrowRight",
    "Home",
    "End",
    "PageUp",
    "PageDown",
    "Backspace",
    "Delete",
];

/// Map a keydown to the name worth recording, or `None` to drop it.
///
/// Keys in [`CONTROL_KEYS`] pass through. Ctrl or Cmd with a single alphanumeric
/// becomes `CmdOrCtrl+<UPPER>`.
pub fn normalize_key(key: &str, ctrl: bool, meta: bool) -> Option<String> {
    if CONTROL_KEYS.contains(&key) {
        return Some(key.to_string());
    }
    if !(ctrl || meta) {
        return None;
    }
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() => {
            Some(format!("CmdOrCtrl+{}", c.to_ascii_uppercase()))
        }
        _ => None,
    }
}

/// Capture-phase handlers turning DOM events into [`CapturedActionEvent`]s.
///
/// One instance is shared by every listener of a recorder, on the document and on
/// each shadow root. Password values are always masked.
pub struct CaptureHandlers {
    active: Arc<AtomicBool>,
    channel: Arc<dyn MessageChannel>,
    // Listeners left behind on a page the recorder moved away from stay inert.
    page: Mutex<Option<PageId>>,
    max_click_text_chars: usize,
    target_resolution: TargetResolution,
    // Composed events reach the document and every enclosing shadow root. The
    // outermost listener runs first in the capture phase and claims the dispatch.
    last_dispatch: AtomicU64,
}

impl CaptureHandlers {
    pub fn new(
        config: &RecorderConfig,
        active: Arc<AtomicBool>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            active,
            channel,
            page: Mutex::new(None),
            max_click_text_chars: config.max_click_text_chars,
            target_resolution: config.target_resolution,
            last_dispatch: AtomicU64::new(0),
        }
    }

    /// Only events dispatched on `page` are captured from now on.
    pub fn bind_page(&self, page: PageId) {
        match self.page.lock() {
            Ok(mut bound) => {
                if *bound != Some(page) {
                    // Dispatch ids are numbered per page.
                    self.last_dispatch.store(0, Ordering::SeqCst);
                }
                *bound = Some(page);
            }
            Err(e) => warn!(%page, "Failed to bind capture handlers: {}", e),
        }
    }

    pub fn is_bound_to(&self, page: PageId) -> bool {
        self.page
            .lock()
            .map(|bound| *bound == Some(page))
            .unwrap_or(false)
    }

    /// Listener entry point. Never fails: anything that goes wrong drops the event.
    pub fn handle(&self, event: &DispatchedEvent<'_>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let page = event.dom().page_id();
        if !self.is_bound_to(page) {
            trace!(%page, "event from a page that is not being recorded");
            return;
        }
        if !matches!(
            event.event_type(),
            EventType::Click | EventType::Input | EventType::Change | EventType::KeyDown
        ) {
            return;
        }
        let dispatch_id = event.dispatch_id();
        if self.last_dispatch.swap(dispatch_id, Ordering::SeqCst) == dispatch_id {
            trace!(dispatch_id, "already captured by an outer listener");
            return;
        }

        let target = self.resolve_target(event);
        match self.capture(event, target) {
            Ok(Some(action)) => self.send(action),
            Ok(None) => trace!(%target, event = %event.event_type(), "nothing to record"),
            Err(e) => debug!(%target, event = %event.event_type(), "Dropping event: {}", e),
        }
    }

    /// The node the user actually interacted with.
    pub fn resolve_target(&self, event: &DispatchedEvent<'_>) -> NodeId {
        match self.target_resolution {
            TargetResolution::ComposedPath => event
                .composed_path()
                .first()
                .copied()
                .unwrap_or_else(|| event.target()),
            TargetResolution::EventTarget => event.target(),
        }
    }

    fn capture(
        &self,
        event: &DispatchedEvent<'_>,
        target: NodeId,
    ) -> Result<Option<CapturedActionEvent>> {
        let dom = event.dom();
        let timestamp = event.time_stamp();
        match event.event_type() {
            EventType::Click => self.click(dom, target, timestamp).map(Some),
            EventType::Input => self.input(dom, target, timestamp),
            EventType::Change => self.select_change(dom, target, timestamp),
            EventType::KeyDown => {
                let Some(key) = event
                    .key()
                    .and_then(|k| normalize_key(k, event.ctrl_key(), event.meta_key()))
                else {
                    return Ok(None);
                };
                let context = action_context(dom, target, timestamp)?;
                Ok(Some(CapturedActionEvent::KeyPress(KeyEvent { context, key })))
            }
            _ => Ok(None),
        }
    }

    fn click(&self, dom: &Dom, target: NodeId, timestamp: u64) -> Result<CapturedActionEvent> {
        let context = action_context(dom, target, timestamp)?;
        let text = truncate_chars(dom.text_content(target).trim(), self.max_click_text_chars);
        Ok(CapturedActionEvent::Click(ClickEvent { context, text }))
    }

    fn input(
        &self,
        dom: &Dom,
        target: NodeId,
        timestamp: u64,
    ) -> Result<Option<CapturedActionEvent>> {
        if !dom.has_value_property(target) {
            return Ok(None);
        }
        let is_password = dom
            .attribute(target, "type")
            .is_some_and(|t| t.eq_ignore_ascii_case("password"));
        let value = if is_password {
            PASSWORD_MASK.to_string()
        } else {
            dom.value(target).unwrap_or_default()
        };
        let context = action_context(dom, target, timestamp)?;
        Ok(Some(CapturedActionEvent::Input(InputEvent { context, value })))
    }

    fn select_change(
        &self,
        dom: &Dom,
        target: NodeId,
        timestamp: u64,
    ) -> Result<Option<CapturedActionEvent>> {
        if !dom.tag_name(target)?.eq_ignore_ascii_case("select") {
            return Ok(None);
        }
        let value = dom.value(target).unwrap_or_default();
        let text = dom
            .selected_option(target)
            .map(|option| dom.option_text(option))
            .unwrap_or_default();
        let context = action_context(dom, target, timestamp)?;
        Ok(Some(CapturedActionEvent::SelectChange(SelectEvent {
            context,
            value,
            text,
        })))
    }

    fn send(&self, action: CapturedActionEvent) {
        // Stop may have landed while the payload was being built.
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        debug!(
            kind = action.label(),
            timestamp = action.timestamp(),
            xpath = %action.context().locator.xpath,
            "Captured action"
        );
        if let Err(e) = self.channel.send(action.into()) {
            warn!("Failed to send captured action: {}", e);
        }
    }
}

fn action_context(dom: &Dom, element: NodeId, timestamp: u64) -> Result<ActionContext> {
    let (locator, degradation) = ElementLocator::compute(dom, element)?;
    if let Some(degradation) = degradation {
        debug!(%element, ?degradation, "Using degraded locator");
    }
    let tag = dom.tag_name(element)?.trim();
    let element_tag = if tag.is_empty() {
        UNKNOWN_TAG.to_ascii_uppercase()
    } else {
        tag.to_ascii_uppercase()
    };
    Ok(ActionContext {
        timestamp,
        page_url: dom.document_url().to_string(),
        frame_url: dom.frame_url().to_string(),
        locator,
        element_tag,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
