mod common;

use common::Harness;
use pagetrace::{Dom, EventInit, EventType, NodeId};
use pagetrace_recorder::recorder::shadow::CAPTURED_EVENTS;
use pagetrace_recorder::{OutboundMessage, RecorderConfig, TargetResolution};

/// `<body><x-search>#shadow-root<input name="q"><button>Go</button></x-search></body>`
fn search_widget_page() -> (Dom, NodeId, NodeId, NodeId) {
    let mut dom = Dom::new("https://app.example.com/");
    let body = dom.body();
    let host = dom.append_element(body, "x-search", &[]).unwrap();
    let root = dom.attach_shadow(host).unwrap();
    let input = dom
        .append_element(root, "input", &[("name", "q"), ("type", "search")])
        .unwrap();
    let button = dom.append_element(root, "button", &[]).unwrap();
    dom.append_text(button, "Go").unwrap();
    (dom, host, input, button)
}

fn clicks(messages: Vec<OutboundMessage>) -> Vec<(String, String)> {
    messages
        .into_iter()
        .map(|m| match m {
            OutboundMessage::CustomClickEvent(e) => (e.context.locator.xpath, e.context.element_tag),
            other => panic!("unexpected {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn test_existing_shadow_roots_are_instrumented() {
    let (dom, ..) = search_widget_page();
    let mut h = Harness::new(dom);
    h.start();

    assert_eq!(h.recorder.instrumented_roots(), 2);
    assert_eq!(h.dom.total_listener_count(), 2 * CAPTURED_EVENTS.len());
    assert_eq!(h.dom.observer_count(), 2);
}

#[tokio::test]
async fn test_composed_click_is_captured_once_with_real_target() {
    let (dom, _, _, button) = search_widget_page();
    let mut h = Harness::new(dom);
    h.start();

    h.dom
        .dispatch_event(button, EventType::Click, EventInit::default())
        .unwrap();
    assert_eq!(
        clicks(h.drain()),
        vec![(
            "body/x-search[1]/#shadow-root/button[1]".to_string(),
            "BUTTON".to_string()
        )]
    );
}

#[tokio::test]
async fn test_event_target_resolution_reports_host() {
    let (dom, _, _, button) = search_widget_page();
    let config = RecorderConfig {
        target_resolution: TargetResolution::EventTarget,
        ..Default::default()
    };
    let mut h = Harness::with_config(dom, config);
    h.start();

    h.dom
        .dispatch_event(button, EventType::Click, EventInit::default())
        .unwrap();
    assert_eq!(
        clicks(h.drain()),
        vec![("body/x-search[1]".to_string(), "X-SEARCH".to_string())]
    );
}

#[tokio::test]
async fn test_non_composed_change_inside_shadow_root() {
    let mut dom = Dom::new("https://app.example.com/");
    let body = dom.body();
    let host = dom.append_element(body, "x-picker", &[]).unwrap();
    let root = dom.attach_shadow(host).unwrap();
    let select = dom.append_element(root, "select", &[]).unwrap();
    for label in ["Small", "Large"] {
        let option = dom.append_element(select, "option", &[]).unwrap();
        dom.append_text(option, label).unwrap();
    }

    let mut h = Harness::new(dom);
    h.start();
    h.dom.select_option(select, 1).unwrap();
    h.dom
        .dispatch_event(select, EventType::Change, EventInit::default())
        .unwrap();

    match h.drain().as_slice() {
        [OutboundMessage::CustomSelectEvent(e)] => {
            assert_eq!(e.value, "Large");
            assert_eq!(e.text, "Large");
            assert_eq!(
                e.context.locator.xpath,
                "body/x-picker[1]/#shadow-root/select[1]"
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_nested_shadow_roots() {
    let mut dom = Dom::new("https://app.example.com/");
    let body = dom.body();
    let outer = dom.append_element(body, "x-app", &[]).unwrap();
    let outer_root = dom.attach_shadow(outer).unwrap();
    let inner = dom.append_element(outer_root, "x-card", &[]).unwrap();
    let inner_root = dom.attach_shadow(inner).unwrap();
    let link = dom
        .append_element(inner_root, "a", &[("href", "/docs")])
        .unwrap();

    let mut h = Harness::new(dom);
    h.start();
    assert_eq!(h.recorder.instrumented_roots(), 3);

    h.dom
        .dispatch_event(link, EventType::Click, EventInit::default())
        .unwrap();
    assert_eq!(
        clicks(h.drain()),
        vec![(
            "body/x-app[1]/#shadow-root/x-card[1]/#shadow-root/a[1]".to_string(),
            "A".to_string()
        )]
    );
}

#[tokio::test]
async fn test_late_shadow_host_is_instrumented_after_mutation_delivery() {
    let mut h = Harness::new(Dom::new("https://app.example.com/"));
    h.start();
    assert_eq!(h.recorder.instrumented_roots(), 1);

    // A wrapper carrying a shadow host below it, inserted after start.
    let wrapper = h.dom.create_element("section");
    let host = h.dom.append_element(wrapper, "x-late", &[]).unwrap();
    let root = h.dom.attach_shadow(host).unwrap();
    let select = h.dom.append_element(root, "select", &[]).unwrap();
    let option = h.dom.append_element(select, "option", &[("value", "1")]).unwrap();
    h.dom.append_text(option, "One").unwrap();
    let body = h.dom.body();
    h.dom.append_child(body, wrapper).unwrap();

    // Non-composed events inside the late root are invisible until the observer runs.
    h.dom
        .dispatch_event(select, EventType::Change, EventInit::default())
        .unwrap();
    assert!(h.drain().is_empty());

    assert!(h.dom.deliver_mutations() > 0);
    assert_eq!(h.recorder.instrumented_roots(), 2);

    h.dom
        .dispatch_event(select, EventType::Change, EventInit::default())
        .unwrap();
    assert_eq!(h.drain().len(), 1);
}

#[tokio::test]
async fn test_reinserting_a_host_does_not_duplicate_listeners() {
    let (dom, host, _, button) = search_widget_page();
    let mut h = Harness::new(dom);
    h.start();
    let listeners = h.dom.total_listener_count();

    let body = h.dom.body();
    for _ in 0..3 {
        h.dom.remove_child(body, host).unwrap();
        h.dom.append_child(body, host).unwrap();
        h.dom.deliver_mutations();
    }
    assert_eq!(h.dom.total_listener_count(), listeners);
    assert_eq!(h.recorder.instrumented_roots(), 2);

    h.dom
        .dispatch_event(button, EventType::Click, EventInit::default())
        .unwrap();
    assert_eq!(clicks(h.drain()).len(), 1);
}

#[tokio::test]
async fn test_light_dom_only_skips_observers() {
    let (dom, ..) = search_widget_page();
    let mut h = Harness::with_config(dom, RecorderConfig::light_dom_only());
    h.start();

    assert_eq!(h.dom.observer_count(), 0);
    assert!(!h.engine.last_options().unwrap().record_shadow_dom);
    // Existing shadow roots are still instrumented at start.
    assert_eq!(h.recorder.instrumented_roots(), 2);
}

#[tokio::test]
async fn test_detach_removes_everything() {
    let (dom, _, input, _) = search_widget_page();
    let mut h = Harness::new(dom);
    h.start();

    let removed = h.recorder.detach(&mut h.dom).unwrap();
    assert_eq!(removed, 2 * CAPTURED_EVENTS.len());
    assert_eq!(h.dom.total_listener_count(), 0);
    assert_eq!(h.dom.observer_count(), 0);
    assert!(!h.recorder.is_recording());

    h.dom.set_value(input, "rust").unwrap();
    h.dom
        .dispatch_event(input, EventType::Input, EventInit::default())
        .unwrap();
    assert!(h.drain().is_empty());
}
