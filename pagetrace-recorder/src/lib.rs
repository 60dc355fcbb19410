//! Page recorder crate
//!
//! This crate records what a user does on a web page: clicks, typing, select
//! changes and navigation keys are captured from the document and every shadow
//! root, tagged with a stable XPath and CSS selector, and sent over a message
//! channel next to the session replay engine's own event stream.

pub mod channel;
pub mod error;
pub mod events;
pub mod recorder;
pub mod replay;

pub use channel::{LocalChannel, MessageChannel};
pub use error::*;
pub use events::{
    ActionContext, CapturedActionEvent, ClickEvent, InboundMessage, InputEvent, KeyEvent,
    OutboundMessage, RecordingStatusResponse, ReplayEvent, SelectEvent, PASSWORD_MASK,
};
pub use recorder::capture::{normalize_key, CONTROL_KEYS};
pub use recorder::*;
pub use replay::{
    EmitFn, ManualReplayEngine, MaskInputOptions, RecordOptions, ReplayEngine, StopHandle,
};
