//! Connection sharing, grace-period teardown and reconnects, exercised
//! against the in-memory relay network.

use std::sync::Once;
use std::time::Duration;

use enostr::test_utils::{MockBehavior, MockTransport, NoteBuilder};
use enostr::{
    close_reason, Filter, RelayConfig, RelayNotification, RelayRegistry, RelayStatus, RelayUrl,
    SubId,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::{self, UnboundedReceiver};

const RELAY: &str = "wss://relay.test";

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("enostr=debug")
            .try_init();
    });
}

fn registry(transport: &MockTransport) -> RelayRegistry {
    init_tracing();
    RelayRegistry::new(transport.clone(), RelayConfig::default())
}

async fn next(rx: &mut UnboundedReceiver<RelayNotification>) -> RelayNotification {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("notification in time")
        .expect("channel open")
}

/// Let spawned tasks run without moving the clock
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn one_connection_per_normalized_url() {
    let transport = MockTransport::new();
    let registry = registry(&transport);

    let a = registry.acquire(&RelayUrl::new("wss://relay.test/"));
    let b = registry.acquire(&RelayUrl::new("wss://RELAY.test"));
    settle().await;

    assert_eq!(a.url(), b.url());
    assert_eq!(transport.connects(RELAY), 1);
    assert_eq!(registry.ref_count(&RelayUrl::new(RELAY)), 2);
    assert_eq!(a.status(), RelayStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn released_relay_survives_its_grace_period() {
    let transport = MockTransport::new();
    let registry = registry(&transport);
    let url = RelayUrl::new(RELAY);

    let handle = registry.acquire(&url);
    settle().await;
    handle.release();
    assert_eq!(registry.ref_count(&url), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let again = registry.acquire(&url);
    settle().await;
    assert_eq!(transport.connects(RELAY), 1);

    // the first release's teardown must not close the reacquired relay
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(registry.urls(), vec![url.clone()]);

    drop(again);
    tokio::time::sleep(registry.config().grace_period() + Duration::from_millis(1)).await;
    settle().await;

    assert!(registry.urls().is_empty());
    assert_eq!(registry.status(&url), None);
    assert_eq!(transport.live_connections(RELAY), 0);
}

#[tokio::test(start_paused = true)]
async fn stored_notes_arrive_before_eose() {
    let transport = MockTransport::new();
    let old = NoteBuilder::new(1, 1).created_at(10).build();
    let new = NoteBuilder::new(1, 1).created_at(20).build();
    let reaction = NoteBuilder::new(7, 1).created_at(30).build();
    transport.seed(RELAY, [old.clone(), new.clone(), reaction]);

    let registry = registry(&transport);
    let handle = registry.acquire(&RelayUrl::new(RELAY));
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe(SubId::new("test"), vec![Filter::new().kinds([1])], tx);

    let mut ids = vec![];
    for _ in 0..2 {
        match next(&mut rx).await {
            RelayNotification::Event { relay, note } => {
                assert_eq!(relay, RelayUrl::new(RELAY));
                ids.push(note.id);
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }
    assert_eq!(ids, vec![new.id, old.id]);
    assert!(matches!(next(&mut rx).await, RelayNotification::Eose { .. }));

    let live = NoteBuilder::new(1, 2).created_at(40).build();
    transport.publish(RELAY, live.clone());
    match next(&mut rx).await {
        RelayNotification::Event { note, .. } => assert_eq!(note.id, live.id),
        other => panic!("expected the live event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn search_results_are_not_refiltered_by_content() {
    let transport = MockTransport::new();
    let stored = NoteBuilder::new(1, 1).created_at(10).content("rocks").build();
    transport.seed(RELAY, [stored.clone()]);

    let registry = registry(&transport);
    let handle = registry.acquire(&RelayUrl::new(RELAY));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let search = Filter::new().kinds([1]).search("nostr language:en");
    handle.subscribe(SubId::new("search"), vec![search], tx);

    match next(&mut rx).await {
        RelayNotification::Event { note, .. } => assert_eq!(note.id, stored.id),
        other => panic!("expected the stored result, got {other:?}"),
    }
    assert!(matches!(next(&mut rx).await, RelayNotification::Eose { .. }));

    let live = NoteBuilder::new(1, 2).created_at(20).content("rocks").build();
    transport.publish(RELAY, live.clone());
    match next(&mut rx).await {
        RelayNotification::Event { note, .. } => assert_eq!(note.id, live.id),
        other => panic!("expected the live result, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn subscriptions_are_resent_after_reconnect() {
    let transport = MockTransport::new();
    let note = NoteBuilder::new(1, 1).created_at(10).build();
    transport.seed(RELAY, [note.clone()]);

    let registry = registry(&transport);
    let handle = registry.acquire(&RelayUrl::new(RELAY));
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe(SubId::new("resend"), vec![Filter::new().kinds([1])], tx);

    assert!(matches!(next(&mut rx).await, RelayNotification::Event { .. }));
    assert!(matches!(next(&mut rx).await, RelayNotification::Eose { .. }));

    transport.disconnect(RELAY);
    match next(&mut rx).await {
        RelayNotification::Disconnected { reason, .. } => {
            assert_eq!(reason, close_reason::CONNECTION_CLOSED)
        }
        other => panic!("expected a disconnect, got {other:?}"),
    }
    assert_eq!(handle.status(), RelayStatus::Disconnected);

    // replayed once the backoff elapses
    match next(&mut rx).await {
        RelayNotification::Event { note: replayed, .. } => assert_eq!(replayed.id, note.id),
        other => panic!("expected the replayed event, got {other:?}"),
    }
    assert!(matches!(next(&mut rx).await, RelayNotification::Eose { .. }));
    assert_eq!(transport.connects(RELAY), 2);
    assert_eq!(handle.status(), RelayStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_sends_close() {
    let transport = MockTransport::new();
    let registry = registry(&transport);
    let handle = registry.acquire(&RelayUrl::new(RELAY));

    let sub_id = SubId::new("closing");
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe(sub_id.clone(), vec![Filter::new().kinds([1])], tx);
    assert!(matches!(next(&mut rx).await, RelayNotification::Eose { .. }));
    assert_eq!(transport.live_subscriptions(RELAY), 1);

    handle.unsubscribe(sub_id);
    settle().await;
    assert_eq!(transport.live_subscriptions(RELAY), 0);
}

#[tokio::test(start_paused = true)]
async fn relay_closed_subscription_is_reported() {
    let transport = MockTransport::new();
    let registry = registry(&transport);
    let handle = registry.acquire(&RelayUrl::new(RELAY));

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe(SubId::new("auth"), vec![Filter::new().kinds([4])], tx);
    assert!(matches!(next(&mut rx).await, RelayNotification::Eose { .. }));

    transport.close_subscriptions(RELAY, "auth-required: dms are private");
    match next(&mut rx).await {
        RelayNotification::Closed { reason, .. } => {
            assert_eq!(reason, "auth-required: dms are private")
        }
        other => panic!("expected CLOSED, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn refused_connection_is_retried_with_backoff() {
    let transport = MockTransport::new();
    transport.set_behavior(RELAY, MockBehavior::Refuse);
    let registry = registry(&transport);
    let handle = registry.acquire(&RelayUrl::new(RELAY));

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.subscribe(SubId::new("refused"), vec![Filter::new().kinds([1])], tx);

    match next(&mut rx).await {
        RelayNotification::Disconnected { reason, .. } => {
            assert!(reason.starts_with(close_reason::CONNECTION_ERRORED))
        }
        other => panic!("expected a disconnect, got {other:?}"),
    }

    // 5s, then 7.5s
    tokio::time::sleep(Duration::from_millis(12_600)).await;
    settle().await;
    assert_eq!(transport.connects(RELAY), 3);

    transport.set_behavior(RELAY, MockBehavior::Normal);
    loop {
        if let RelayNotification::Eose { .. } = next(&mut rx).await {
            break;
        }
    }
    assert_eq!(handle.status(), RelayStatus::Connected);
}
