mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use pagetrace::{DispatchedEvent, Dom, EventInit, EventType, NodeId};
use pagetrace_recorder::recorder::shadow::CAPTURED_EVENTS;
use pagetrace_recorder::{
    LocalChannel, OutboundMessage, RecorderConfig, RecorderError, ReplayEvent,
};
use serde_json::json;
use tokio_stream::StreamExt;

fn page() -> (Dom, NodeId) {
    let mut dom = Dom::new("https://example.com/");
    let body = dom.body();
    let button = dom.append_element(body, "button", &[("id", "save")]).unwrap();
    dom.append_text(button, "Save").unwrap();
    (dom, button)
}

fn click(h: &Harness, target: NodeId) {
    h.dom
        .dispatch_event(target, EventType::Click, EventInit::default())
        .unwrap();
}

fn scroll_y(message: &OutboundMessage) -> Option<f64> {
    match message {
        OutboundMessage::RrwebEvent(event) => event.scroll_position().map(|(_, y)| y),
        _ => None,
    }
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let (dom, button) = page();
    let mut h = Harness::new(dom);

    h.recorder.stop();
    assert!(!h.recorder.is_recording());

    h.start();
    let session = h.recorder.session_id();
    assert!(session.is_some());
    h.start();
    assert_eq!(h.engine.start_count(), 1);
    assert_eq!(h.recorder.session_id(), session);
    assert_eq!(h.dom.total_listener_count(), CAPTURED_EVENTS.len());

    click(&h, button);
    assert_eq!(h.drain().len(), 1, "one listener set, one event");

    h.recorder.stop();
    h.recorder.stop();
    assert!(!h.engine.is_recording());
    assert_eq!(h.recorder.session_id(), None);

    // Restarting reuses the listeners already on the page.
    h.start();
    assert_eq!(h.engine.start_count(), 2);
    assert_eq!(h.dom.total_listener_count(), CAPTURED_EVENTS.len());
    assert_ne!(h.recorder.session_id(), session);
    click(&h, button);
    assert_eq!(h.drain().len(), 1);
}

#[tokio::test]
async fn test_restart_on_another_page_instruments_it() {
    let (dom, old_button) = page();
    let mut h = Harness::new(dom);
    h.start();
    h.recorder.stop();

    let (mut next, button) = page();
    h.recorder.start(&mut next).unwrap();
    assert_eq!(next.total_listener_count(), CAPTURED_EVENTS.len());
    assert_eq!(h.recorder.instrumented_roots(), 1);

    next.dispatch_event(button, EventType::Click, EventInit::default()).unwrap();
    match h.drain().as_slice() {
        [OutboundMessage::CustomClickEvent(e)] => assert_eq!(e.text, "Save"),
        other => panic!("unexpected {other:?}"),
    }

    // Listeners left on the first page no longer capture.
    click(&h, old_button);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_detach_leaves_other_pages_alone() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);
    h.start();

    let (mut other, _) = page();
    let document = other.document();
    for _ in 0..CAPTURED_EVENTS.len() {
        other
            .add_event_listener(
                document,
                EventType::Click,
                true,
                Arc::new(|_: &DispatchedEvent<'_>| {}),
            )
            .unwrap();
    }

    assert_eq!(h.recorder.detach(&mut other).unwrap(), 0);
    assert_eq!(other.total_listener_count(), CAPTURED_EVENTS.len());

    // The recorded page still holds the recorder's listeners.
    assert_eq!(h.dom.total_listener_count(), CAPTURED_EVENTS.len());
    assert_eq!(
        h.recorder.detach(&mut h.dom).unwrap(),
        CAPTURED_EVENTS.len()
    );
}

#[tokio::test]
async fn test_stop_suppresses_late_emissions_and_actions() {
    let (dom, button) = page();
    let mut h = Harness::new(dom);
    h.start();

    let emit = h.engine.emission_callback().unwrap();
    h.recorder.stop();

    emit(ReplayEvent::new(json!({"type": 3, "data": {"source": 2}})));
    click(&h, button);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_engine_start_failure_leaves_recorder_stopped() {
    let (dom, button) = page();
    let mut h = Harness::new(dom);
    h.engine.fail_next_start("engine unavailable");

    let result = h.recorder.start(&mut h.dom);
    assert!(matches!(result, Err(RecorderError::Engine(_))));
    assert!(!h.recorder.is_recording());
    click(&h, button);
    assert!(h.drain().is_empty());

    h.start();
    assert!(h.recorder.is_recording());
}

#[tokio::test]
async fn test_record_options_follow_config() {
    let (dom, _) = page();
    let config = RecorderConfig {
        checkout_every_ms: 5_000,
        checkout_every_events: 50,
        ..Default::default()
    };
    let mut h = Harness::with_config(dom, config);
    h.start();

    let options = h.engine.last_options().unwrap();
    assert!(options.mask_input_options.password);
    assert_eq!(options.checkout_every_nms, 5_000);
    assert_eq!(options.checkout_every_nth, 50);
    assert!(options.record_shadow_dom);
}

#[tokio::test]
async fn test_non_scroll_replay_events_pass_through() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);
    h.start();

    let snapshot = json!({"type": 2, "data": {"node": {}}, "timestamp": 1});
    assert!(h.engine.emit(ReplayEvent::new(snapshot.clone())));
    match h.drain().as_slice() {
        [OutboundMessage::RrwebEvent(event)] => assert_eq!(event.as_value(), &snapshot),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_scrolls_in_one_direction_coalesce() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);
    h.start();

    h.engine.emit(ReplayEvent::scroll(1, 0.0, 120.2, 1));
    h.engine.emit(ReplayEvent::scroll(1, 0.0, 340.7, 2));
    assert!(h.drain().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let ys: Vec<f64> = h.drain().iter().filter_map(scroll_y).collect();
    assert_eq!(ys, vec![341.0]);
}

#[tokio::test(start_paused = true)]
async fn test_scroll_reversal_flushes_immediately() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);
    h.start();

    h.engine.emit(ReplayEvent::scroll(1, 0.0, 100.0, 1));
    h.engine.emit(ReplayEvent::scroll(1, 0.0, 500.0, 2));
    h.engine.emit(ReplayEvent::scroll(1, 0.0, 420.0, 3));

    let ys: Vec<f64> = h.drain().iter().filter_map(scroll_y).collect();
    assert_eq!(ys, vec![500.0]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let ys: Vec<f64> = h.drain().iter().filter_map(scroll_y).collect();
    assert_eq!(ys, vec![420.0]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_buffered_scroll() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);
    h.start();

    h.engine.emit(ReplayEvent::scroll(1, 0.0, 100.0, 1));
    h.recorder.stop();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_set_recording_status_messages() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);

    let handled = h
        .recorder
        .handle_raw_message(&mut h.dom, r#"{"type":"SET_RECORDING_STATUS","payload":true}"#)
        .unwrap();
    assert!(handled);
    assert!(h.recorder.is_recording());

    h.recorder
        .handle_raw_message(&mut h.dom, r#"{"type":"SET_RECORDING_STATUS","payload":true}"#)
        .unwrap();
    assert_eq!(h.engine.start_count(), 1);

    let ignored = h
        .recorder
        .handle_raw_message(&mut h.dom, r#"{"type":"PING","payload":1}"#)
        .unwrap();
    assert!(!ignored);
    assert!(h.recorder.is_recording());

    assert!(matches!(
        h.recorder.handle_raw_message(&mut h.dom, "{not json"),
        Err(RecorderError::Serialization(_))
    ));

    h.recorder
        .handle_raw_message(&mut h.dom, r#"{"type":"SET_RECORDING_STATUS","payload":false}"#)
        .unwrap();
    assert!(!h.recorder.is_recording());
}

#[tokio::test]
async fn test_bootstrap_starts_when_enabled() {
    let (dom, button) = page();
    let mut h = Harness::with_channel(
        dom,
        RecorderConfig::default(),
        LocalChannel::with_recording_enabled(true),
    );

    assert!(h.recorder.bootstrap(&mut h.dom).await.unwrap());
    click(&h, button);

    let kinds: Vec<&str> = h.drain().iter().map(OutboundMessage::kind).collect();
    assert_eq!(kinds, vec!["REQUEST_RECORDING_STATUS", "CUSTOM_CLICK_EVENT"]);
}

#[tokio::test]
async fn test_bootstrap_stays_stopped() {
    let (dom, _) = page();
    let mut h = Harness::with_channel(
        dom,
        RecorderConfig::default(),
        LocalChannel::with_recording_enabled(false),
    );
    assert!(!h.recorder.bootstrap(&mut h.dom).await.unwrap());
    assert_eq!(h.engine.start_count(), 0);

    // No authority answering: logged, not fatal.
    h.channel.set_recording_enabled(None);
    assert!(!h.recorder.bootstrap(&mut h.dom).await.unwrap());
}

#[tokio::test]
async fn test_teardown_and_drop_stop_the_engine() {
    let (dom, _) = page();
    let mut h = Harness::new(dom);
    h.start();
    h.recorder.teardown();
    assert!(!h.engine.is_recording());

    h.start();
    let engine = h.engine.clone();
    drop(h);
    assert!(!engine.is_recording());
}

#[tokio::test]
async fn test_message_stream_yields_sent_messages() {
    let (dom, button) = page();
    let mut h = Harness::new(dom);
    let mut stream = h.channel.message_stream();
    h.start();
    click(&h, button);

    let message = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    match message {
        OutboundMessage::CustomClickEvent(e) => {
            assert_eq!(e.context.locator.xpath, "id(\"save\")");
            assert_eq!(e.text, "Save");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.channel.sent_count(), 1);
}
