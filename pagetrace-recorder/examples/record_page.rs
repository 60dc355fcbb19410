use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pagetrace::{Dom, EventInit, EventType};
use pagetrace_recorder::{
    LocalChannel, ManualReplayEngine, PageRecorder, RecorderConfig, ReplayEvent,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // A checkout page with a web component holding the card form.
    let mut dom = Dom::new("https://shop.example.com/checkout");
    let body = dom.body();
    let email = dom.append_element(body, "input", &[("type", "email"), ("name", "email")])?;
    let card = dom.append_element(body, "x-card-form", &[])?;
    let card_root = dom.attach_shadow(card)?;
    let pin = dom.append_element(card_root, "input", &[("type", "password"), ("name", "pin")])?;
    let pay = dom.append_element(card_root, "button", &[("class", "btn pay")])?;
    dom.append_text(pay, "Pay now")?;

    let engine = Arc::new(ManualReplayEngine::new());
    let channel = Arc::new(LocalChannel::with_recording_enabled(true));
    let mut messages = channel.message_stream();

    let printer = tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            match message.to_json() {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to serialize message: {e}"),
            }
        }
    });

    let mut recorder = PageRecorder::new(RecorderConfig::default(), engine.clone(), channel.clone());
    let recording = recorder.bootstrap(&mut dom).await?;
    info!(recording, session = ?recorder.session_id(), "Page loaded");

    dom.set_value(email, "ada@example.com")?;
    dom.dispatch_event(email, EventType::Input, EventInit::default())?;
    dom.dispatch_event(email, EventType::KeyDown, EventInit::key("Tab"))?;
    dom.set_value(pin, "4242")?;
    dom.dispatch_event(pin, EventType::Input, EventInit::default())?;

    for y in [120.0, 260.5, 410.0] {
        engine.emit(ReplayEvent::scroll(1, 0.0, y, 0));
    }
    tokio::time::sleep(recorder.config().scroll_quiet_period() + Duration::from_millis(50)).await;

    dom.dispatch_event(pay, EventType::Click, EventInit::default())?;

    recorder.handle_raw_message(&mut dom, r#"{"type":"SET_RECORDING_STATUS","payload":false}"#)?;
    info!(sent = channel.sent_count(), "Recording finished");

    drop(recorder);
    drop(channel);
    // Give the printer a moment to drain before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    Ok(())
}
