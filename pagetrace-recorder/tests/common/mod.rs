#![allow(dead_code)]

use std::sync::Arc;

use pagetrace::Dom;
use pagetrace_recorder::{
    LocalChannel, ManualReplayEngine, OutboundMessage, PageRecorder, RecorderConfig,
};
use tokio::sync::broadcast;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_test_writer()
        .try_init();
}

/// A page, a recorder wired to a manual engine and an in-process channel, and a
/// subscription to everything the recorder sends.
pub struct Harness {
    pub dom: Dom,
    pub recorder: PageRecorder,
    pub engine: Arc<ManualReplayEngine>,
    pub channel: Arc<LocalChannel>,
    pub rx: broadcast::Receiver<OutboundMessage>,
}

impl Harness {
    pub fn new(dom: Dom) -> Self {
        Self::with_config(dom, RecorderConfig::default())
    }

    pub fn with_config(dom: Dom, config: RecorderConfig) -> Self {
        Self::with_channel(dom, config, LocalChannel::default())
    }

    pub fn with_channel(dom: Dom, config: RecorderConfig, channel: LocalChannel) -> Self {
        init_tracing();
        let engine = Arc::new(ManualReplayEngine::new());
        let channel = Arc::new(channel);
        let rx = channel.subscribe();
        let recorder = PageRecorder::new(config, engine.clone(), channel.clone());
        Self {
            dom,
            recorder,
            engine,
            channel,
            rx,
        }
    }

    pub fn start(&mut self) {
        self.recorder.start(&mut self.dom).expect("start recording");
    }

    /// Everything sent since the last drain
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}
