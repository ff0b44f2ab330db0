//! Receive-path guarantees observed through a whole transport: loop
//! suppression and resilience to malformed wire payloads.

use siteplex_e2e::attach_node;
use siteplex_messaging::testing::{LoopbackBus, RecordingHandler, StaticSite};
use siteplex_messaging::{Event, EventKind, Receiver};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_sender_does_not_process_its_own_events() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let a_recorder = Arc::new(RecordingHandler::new());
    let b_recorder = Arc::new(RecordingHandler::new());
    a.receiver
        .register_handler(EventKind::StopSite, a_recorder.clone());
    b.receiver
        .register_handler(EventKind::StopSite, b_recorder.clone());
    a.start();
    b.start();

    a.sender.send(Event::stop_site("foo", None)).await;

    assert!(b_recorder.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(b_recorder.events()[0].origin_node_id(), "node-a");
    // the loopback bus echoed the event back to the sender, who dropped it
    assert_eq!(a_recorder.count(), 0);
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_the_receive_loop() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let recorder = Arc::new(RecordingHandler::new());
    b.receiver
        .register_handler(EventKind::StopSite, recorder.clone());
    a.start();
    b.start();

    bus.inject(b"not an event".to_vec());
    a.sender.send(Event::stop_site("foo", None)).await;

    assert!(recorder.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn test_registered_handler_replaces_default_effect() {
    let bus = LoopbackBus::new();
    let a = attach_node(&bus, "node-a");
    let b = attach_node(&bus, "node-b");
    let recorder = Arc::new(RecordingHandler::new());
    b.receiver
        .register_handler(EventKind::SiteDeleted, recorder.clone());
    b.sites.put(Arc::new(StaticSite::new(
        "foo",
        siteplex_messaging::cluster::SiteState::Started,
    )));
    a.start();
    b.start();

    a.sender.send(Event::site_deleted("foo")).await;

    assert!(recorder.wait_for(1, Duration::from_secs(2)).await);
    // the recording handler displaced the built-in deletion effect, so the
    // site registry is untouched
    assert!(b.sites.get("foo").is_some());
}
