use pagetrace::ElementLocator;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Replacement value sent instead of the contents of password fields.
pub const PASSWORD_MASK: &str = "********";

/// rrweb `EventType.IncrementalSnapshot`
const INCREMENTAL_SNAPSHOT: i64 = 3;

/// rrweb `IncrementalSource.Scroll`
const SCROLL_SOURCE: i64 = 3;

/// Fields shared by every captured action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    /// Milliseconds since epoch at which the DOM event fired
    pub timestamp: u64,

    /// URL of the top-level page
    pub page_url: String,

    /// URL of the frame the element lives in
    pub frame_url: String,

    /// XPath and CSS selector of the element
    #[serde(flatten)]
    pub locator: ElementLocator,

    /// Upper-case tag name, as `element.tagName` reports it
    pub element_tag: String,
}

/// A click on an element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickEvent {
    #[serde(flatten)]
    pub context: ActionContext,

    /// Trimmed text content of the clicked element, bounded in length
    pub text: String,
}

/// Text typed into an input or textarea
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    #[serde(flatten)]
    pub context: ActionContext,

    /// Current value of the field; [`PASSWORD_MASK`] for password fields
    pub value: String,
}

/// A new option picked in a `<select>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectEvent {
    #[serde(flatten)]
    pub context: ActionContext,

    /// The select's value
    pub value: String,

    /// Display text of the selected option
    pub text: String,
}

/// A navigational key or a Ctrl/Cmd shortcut
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    #[serde(flatten)]
    pub context: ActionContext,

    /// `Enter`, `ArrowDown`, ... or a normalized `CmdOrCtrl+<KEY>` combination
    pub key: String,
}

/// A user action captured from the page, tagged with the element's locators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturedActionEvent {
    Click(ClickEvent),
    Input(InputEvent),
    SelectChange(SelectEvent),
    KeyPress(KeyEvent),
}

impl CapturedActionEvent {
    pub fn context(&self) -> &ActionContext {
        match self {
            CapturedActionEvent::Click(e) => &e.context,
            CapturedActionEvent::Input(e) => &e.context,
            CapturedActionEvent::SelectChange(e) => &e.context,
            CapturedActionEvent::KeyPress(e) => &e.context,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.context().timestamp
    }

    /// Short human-readable label for logs
    pub fn label(&self) -> &'static str {
        match self {
            CapturedActionEvent::Click(_) => "CLICK",
            CapturedActionEvent::Input(_) => "TYPE",
            CapturedActionEvent::SelectChange(_) => "SELECT",
            CapturedActionEvent::KeyPress(_) => "KEY",
        }
    }
}

/// An event emitted by the replay engine. Opaque to the recorder except for scroll detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplayEvent(Value);

impl ReplayEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// An rrweb incremental scroll snapshot for node `id`.
    pub fn scroll(id: u64, x: f64, y: f64, timestamp: u64) -> Self {
        Self(serde_json::json!({
            "type": INCREMENTAL_SNAPSHOT,
            "data": { "source": SCROLL_SOURCE, "id": id, "x": x, "y": y },
            "timestamp": timestamp,
        }))
    }

    /// The rrweb event type number
    pub fn event_type(&self) -> Option<i64> {
        self.0.get("type").and_then(Value::as_i64)
    }

    pub fn is_scroll(&self) -> bool {
        self.event_type() == Some(INCREMENTAL_SNAPSHOT)
            && self
                .0
                .get("data")
                .and_then(|d| d.get("source"))
                .and_then(Value::as_i64)
                == Some(SCROLL_SOURCE)
    }

    /// `(x, y)` of a scroll event
    pub fn scroll_position(&self) -> Option<(f64, f64)> {
        if !self.is_scroll() {
            return None;
        }
        let data = self.0.get("data")?;
        let x = data.get("x").and_then(Value::as_f64).unwrap_or(0.0);
        let y = data.get("y").and_then(Value::as_f64)?;
        Some((x, y))
    }

    /// Round scroll coordinates to whole pixels. No-op for other events.
    pub fn round_scroll_coordinates(&mut self) {
        if !self.is_scroll() {
            return;
        }
        if let Some(data) = self.0.get_mut("data").and_then(Value::as_object_mut) {
            for axis in ["x", "y"] {
                if let Some(v) = data.get(axis).and_then(Value::as_f64) {
                    data.insert(axis.to_string(), Value::from(v.round() as i64));
                }
            }
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Messages sent from the page to the extension's background context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    RrwebEvent(ReplayEvent),
    CustomClickEvent(ClickEvent),
    CustomInputEvent(InputEvent),
    CustomSelectEvent(SelectEvent),
    CustomKeyEvent(KeyEvent),
    RequestRecordingStatus,
}

impl OutboundMessage {
    /// The wire `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::RrwebEvent(_) => "RRWEB_EVENT",
            OutboundMessage::CustomClickEvent(_) => "CUSTOM_CLICK_EVENT",
            OutboundMessage::CustomInputEvent(_) => "CUSTOM_INPUT_EVENT",
            OutboundMessage::CustomSelectEvent(_) => "CUSTOM_SELECT_EVENT",
            OutboundMessage::CustomKeyEvent(_) => "CUSTOM_KEY_EVENT",
            OutboundMessage::RequestRecordingStatus => "REQUEST_RECORDING_STATUS",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<CapturedActionEvent> for OutboundMessage {
    fn from(event: CapturedActionEvent) -> Self {
        match event {
            CapturedActionEvent::Click(e) => OutboundMessage::CustomClickEvent(e),
            CapturedActionEvent::Input(e) => OutboundMessage::CustomInputEvent(e),
            CapturedActionEvent::SelectChange(e) => OutboundMessage::CustomSelectEvent(e),
            CapturedActionEvent::KeyPress(e) => OutboundMessage::CustomKeyEvent(e),
        }
    }
}

/// Messages the page accepts from the background context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
    SetRecordingStatus(bool),
}

impl InboundMessage {
    /// Parse a raw message. Messages of other types are not for us and yield `None`.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(raw)?;
        match value.get("type").and_then(Value::as_str) {
            Some("SET_RECORDING_STATUS") => Ok(Some(serde_json::from_value(value)?)),
            _ => Ok(None),
        }
    }
}

/// Reply to [`OutboundMessage::RequestRecordingStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatusResponse {
    pub is_recording_enabled: bool,
}
