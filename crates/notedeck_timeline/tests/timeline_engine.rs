//! Whole timelines against the in-memory relay network: merging, live
//! routing, pagination and teardown.

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use enostr::test_utils::{MockBehavior, MockTransport, NoteBuilder};
use enostr::{Filter, Note, NoteId, RelayUrl};
use notedeck_timeline::{
    Deletions, Error, Muted, SubRequest, SubscribeOptions, TimelineConfig, TimelineEngine,
    TimelineHandle, TimelineKey, TimelineListener, VisibilityContext,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

const A: &str = "wss://a.test";
const B: &str = "wss://b.test";

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("notedeck_timeline=debug,enostr=info")
            .try_init();
    });
}

#[derive(Debug, Clone, PartialEq)]
enum Update {
    Events(Vec<NoteId>, bool),
    New(NoteId),
    Close(RelayUrl, String),
    ScrollToTop,
    Shown(usize),
}

struct Recorder(UnboundedSender<Update>);

impl TimelineListener for Recorder {
    fn on_events(&mut self, notes: &[Arc<Note>], all_settled: bool) {
        let ids = notes.iter().map(|note| note.id).collect();
        let _ = self.0.send(Update::Events(ids, all_settled));
    }

    fn on_new(&mut self, note: &Arc<Note>) {
        let _ = self.0.send(Update::New(note.id));
    }

    fn on_close(&mut self, relay: &RelayUrl, reason: &str) {
        let _ = self.0.send(Update::Close(relay.clone(), reason.to_owned()));
    }

    fn scroll_to_top(&mut self) {
        let _ = self.0.send(Update::ScrollToTop);
    }
}

fn engine(transport: &MockTransport) -> TimelineEngine {
    init_tracing();
    TimelineEngine::with_transport(transport.clone(), TimelineConfig::default())
}

fn text_notes(relays: &[&str]) -> Vec<SubRequest> {
    vec![SubRequest::new(
        relays.iter().copied(),
        Filter::new().kinds([1]),
    )]
}

fn open(
    engine: &TimelineEngine,
    requests: Vec<SubRequest>,
    options: SubscribeOptions,
) -> (TimelineHandle, UnboundedReceiver<Update>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = engine.subscribe_timeline(requests, Recorder(tx), options);
    (handle, rx)
}

async fn next(rx: &mut UnboundedReceiver<Update>) -> Update {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("update in time")
        .expect("listener alive")
}

async fn settled(rx: &mut UnboundedReceiver<Update>) -> Vec<NoteId> {
    loop {
        if let Update::Events(ids, true) = next(rx).await {
            return ids;
        }
    }
}

/// Let spawned tasks run without moving the clock
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn note(author: u8, created_at: u64) -> Note {
    NoteBuilder::new(1, author).created_at(created_at).build()
}

#[tokio::test(start_paused = true)]
async fn overlapping_relays_merge_into_one_sorted_view() {
    let transport = MockTransport::new();
    let engine = engine(&transport);

    let e1 = note(1, 100);
    let e2 = note(2, 200);
    let e3 = note(3, 150);
    transport.seed(A, [e1.clone(), e2.clone()]);
    transport.seed(B, [e2.clone(), e1.clone(), e3.clone()]);

    let (handle, mut rx) = open(&engine, text_notes(&[A, B]), SubscribeOptions::default());
    let ids = settled(&mut rx).await;
    assert_eq!(ids, vec![e2.id, e3.id, e1.id]);

    let deletions = Deletions::new();
    let muted = Muted::default();
    let ctx = VisibilityContext::new(&deletions, &muted);
    let visible: Vec<NoteId> = engine
        .visible_notes(handle.key(), &ctx)
        .expect("open timeline")
        .iter()
        .map(|note| note.id)
        .collect();
    assert_eq!(visible, vec![e2.id, e3.id, e1.id]);
}

#[tokio::test(start_paused = true)]
async fn newest_profile_wins_whichever_relay_answers_first() {
    let transport = MockTransport::new();
    let engine = engine(&transport);

    let newer = NoteBuilder::new(0, 7).created_at(100).content("new").build();
    let older = NoteBuilder::new(0, 7).created_at(50).content("old").build();
    transport.seed(A, [newer.clone()]);
    transport.seed(B, [older.clone()]);

    let requests = vec![SubRequest::new(
        [A, B],
        Filter::new().kinds([0]).authors([NoteBuilder::pubkey(7)]),
    )];
    let (handle, mut rx) = open(&engine, requests, SubscribeOptions::default());
    assert_eq!(settled(&mut rx).await, vec![newer.id]);

    let resident = engine
        .with_timeline(handle.key(), |timeline| {
            timeline
                .store()
                .get(&older.dedup_key())
                .map(|note| note.id)
        })
        .expect("open timeline");
    assert_eq!(resident, Some(newer.id));
}

#[tokio::test(start_paused = true)]
async fn own_notes_skip_the_pending_buffer() {
    let transport = MockTransport::new();
    let engine = engine(&transport);
    engine.set_identity(Some(NoteBuilder::pubkey(1)));

    let old = note(3, 100);
    transport.seed(A, [old.clone()]);

    let (handle, mut rx) = open(&engine, text_notes(&[A]), SubscribeOptions::default());
    let key = handle.key();
    assert_eq!(settled(&mut rx).await, vec![old.id]);

    let mine = note(1, 200);
    transport.publish(A, mine.clone());
    assert_eq!(next(&mut rx).await, Update::New(mine.id));
    assert_eq!(engine.pending_count(key).expect("open"), 0);
    let main = engine
        .with_timeline(key, |t| t.notes().iter().map(|n| n.id).collect::<Vec<_>>())
        .expect("open");
    assert_eq!(main, vec![mine.id, old.id]);

    let theirs = note(2, 300);
    transport.publish(A, theirs.clone());
    assert_eq!(next(&mut rx).await, Update::New(theirs.id));
    assert_eq!(engine.pending_count(key).expect("open"), 1);
    let main = engine
        .with_timeline(key, |t| t.notes().len())
        .expect("open");
    assert_eq!(main, 2);

    // replays of a resident note are not news
    transport.publish(A, mine.clone());
    settle().await;
    assert!(rx.try_recv().is_err());

    assert_eq!(engine.show_new(key).expect("open"), 1);
    assert_eq!(next(&mut rx).await, Update::ScrollToTop);
    assert_eq!(engine.pending_count(key).expect("open"), 0);
    let main = engine
        .with_timeline(key, |t| t.notes().iter().map(|n| n.id).collect::<Vec<_>>())
        .expect("open");
    assert_eq!(main, vec![theirs.id, mine.id, old.id]);
}

#[tokio::test(start_paused = true)]
async fn pagination_runs_dry_and_stays_dry() {
    let transport = MockTransport::new();
    let engine = engine(&transport);

    let notes: Vec<Note> = (1..=5).map(|i| note(i, u64::from(i) * 100)).collect();
    transport.seed(A, notes.clone());

    let (handle, mut rx) = open(
        &engine,
        text_notes(&[A]),
        SubscribeOptions::default().limit(2),
    );
    let key = handle.key();
    assert_eq!(settled(&mut rx).await, vec![notes[4].id, notes[3].id]);

    let mut pages = vec![];
    loop {
        let before = engine
            .next_until(key)
            .expect("open")
            .expect("timeline has notes");
        let page = engine
            .load_more_timeline(key, before, 2)
            .await
            .expect("open");
        if page.is_empty() {
            break;
        }
        pages.push(page.iter().map(|n| n.created_at).collect::<Vec<_>>());
    }

    assert_eq!(pages, vec![vec![300, 200], vec![100]]);
    assert!(!engine.has_more(key).expect("open"));

    let again = engine.load_more_timeline(key, 200, 50).await.expect("open");
    assert!(again.is_empty());
    assert!(!engine.has_more(key).expect("open"));
    assert_eq!(engine.with_timeline(key, |t| t.notes().len()).expect("open"), 5);
}

#[tokio::test(start_paused = true)]
async fn empty_relay_exhausts_on_the_first_page() {
    let transport = MockTransport::new();
    let engine = engine(&transport);
    transport.seed(A, [note(1, 300)]);

    let (handle, mut rx) = open(&engine, text_notes(&[A]), SubscribeOptions::default());
    let key = handle.key();
    settled(&mut rx).await;

    assert!(engine.load_more_timeline(key, 200, 50).await.expect("open").is_empty());
    assert!(!engine.has_more(key).expect("open"));
    assert!(engine.load_more_timeline(key, 200, 50).await.expect("open").is_empty());
    assert!(!engine.has_more(key).expect("open"));
}

#[tokio::test(start_paused = true)]
async fn closed_timelines_go_quiet() {
    let transport = MockTransport::new();
    let engine = engine(&transport);

    let (first, mut first_rx) = open(&engine, text_notes(&[A]), SubscribeOptions::default());
    let (second, mut second_rx) = open(&engine, text_notes(&[A]), SubscribeOptions::default());
    settled(&mut first_rx).await;
    settled(&mut second_rx).await;
    assert_eq!(engine.active_timelines(), 2);

    let key = first.key();
    first.close();
    first.close();
    assert!(first.is_closed());
    assert_eq!(engine.active_timelines(), 1);

    let live = note(2, 500);
    transport.publish(A, live.clone());
    assert_eq!(next(&mut second_rx).await, Update::New(live.id));

    settle().await;
    assert_eq!(first_rx.try_recv(), Err(TryRecvError::Disconnected));
    assert!(matches!(
        engine.pending_count(key),
        Err(Error::UnknownSession(k)) if k == key
    ));

    drop(second);
    settle().await;
    assert_eq!(engine.active_timelines(), 0);
    assert_eq!(transport.live_subscriptions(A), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_sessions_are_an_error() {
    let transport = MockTransport::new();
    let engine = engine(&transport);
    let key = TimelineKey::new(u64::MAX);

    let result = engine.load_more_timeline(key, 100, 10).await;
    assert!(matches!(result, Err(Error::UnknownSession(k)) if k == key));
    assert!(engine.show_new(key).is_err());
    assert!(engine.has_more(key).is_err());
}

#[tokio::test(start_paused = true)]
async fn load_more_in_flight_at_close_is_discarded() {
    let transport = MockTransport::new();
    let engine = engine(&transport);
    transport.set_behavior(A, MockBehavior::Silent);
    transport.seed(A, [note(1, 100), note(2, 50)]);

    let (handle, mut rx) = open(
        &engine,
        text_notes(&[A]),
        SubscribeOptions::default().limit(1),
    );
    let key = handle.key();
    assert_eq!(settled(&mut rx).await.len(), 1);

    let loader = engine.clone();
    let in_flight = tokio::spawn(async move { loader.load_more_timeline(key, 99, 10).await });
    settle().await;
    handle.close();

    let page = in_flight.await.expect("task ran").expect("session was open");
    assert!(page.is_empty());
    assert!(engine.with_timeline(key, |t| t.notes().len()).is_err());
}

#[tokio::test(start_paused = true)]
async fn only_meaningful_close_reasons_reach_the_listener() {
    let transport = MockTransport::new();
    let engine = engine(&transport);

    let (_handle, mut rx) = open(&engine, text_notes(&[A, B]), SubscribeOptions::default());
    settled(&mut rx).await;

    transport.close_subscriptions(B, "closed by caller");
    settle().await;
    assert!(rx.try_recv().is_err());

    transport.close_subscriptions(A, "auth-required: members only");
    assert_eq!(
        next(&mut rx).await,
        Update::Close(RelayUrl::new(A), "auth-required: members only".to_owned())
    );
}

#[tokio::test(start_paused = true)]
async fn unreachable_relay_retries_quietly() {
    let transport = MockTransport::new();
    transport.set_behavior(B, MockBehavior::Refuse);
    let engine = engine(&transport);
    let stored = note(1, 100);
    transport.seed(A, [stored.clone()]);

    let (_handle, mut rx) = open(&engine, text_notes(&[A, B]), SubscribeOptions::default());
    loop {
        match next(&mut rx).await {
            Update::Close(relay, reason) => panic!("{relay:?} surfaced {reason:?}"),
            Update::Events(ids, true) => {
                assert_eq!(ids, vec![stored.id]);
                break;
            }
            _ => {}
        }
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert!(transport.connects(B) > 3);
    while let Ok(update) = rx.try_recv() {
        assert!(!matches!(update, Update::Close(..)), "{update:?}");
    }
}

/// Shows pending notes as soon as they arrive, from inside the callback
struct AutoShow {
    engine: TimelineEngine,
    key: Arc<Mutex<Option<TimelineKey>>>,
    updates: UnboundedSender<Update>,
}

impl TimelineListener for AutoShow {
    fn on_events(&mut self, notes: &[Arc<Note>], all_settled: bool) {
        let ids = notes.iter().map(|note| note.id).collect();
        let _ = self.updates.send(Update::Events(ids, all_settled));
    }

    fn on_new(&mut self, _note: &Arc<Note>) {
        let key = *self.key.lock().expect("key slot");
        if let Some(key) = key {
            let shown = self.engine.show_new(key).expect("open");
            let _ = self.updates.send(Update::Shown(shown));
        }
    }

    fn scroll_to_top(&mut self) {
        let _ = self.updates.send(Update::ScrollToTop);
    }
}

#[tokio::test(start_paused = true)]
async fn listeners_can_call_back_into_the_engine() {
    let transport = MockTransport::new();
    let engine = engine(&transport);
    let old = note(1, 100);
    transport.seed(A, [old.clone()]);

    let slot = Arc::new(Mutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = AutoShow {
        engine: engine.clone(),
        key: slot.clone(),
        updates: tx,
    };
    let handle = engine.subscribe_timeline(text_notes(&[A]), listener, SubscribeOptions::default());
    let key = handle.key();
    *slot.lock().expect("key slot") = Some(key);
    assert_eq!(settled(&mut rx).await, vec![old.id]);

    let live = note(2, 200);
    transport.publish(A, live.clone());
    assert_eq!(next(&mut rx).await, Update::Shown(1));
    assert_eq!(next(&mut rx).await, Update::ScrollToTop);

    assert_eq!(engine.pending_count(key).expect("open"), 0);
    let main = engine
        .with_timeline(key, |t| t.notes().iter().map(|n| n.id).collect::<Vec<_>>())
        .expect("open");
    assert_eq!(main, vec![live.id, old.id]);
}

#[tokio::test(start_paused = true)]
async fn unsorted_timelines_keep_relay_order() {
    let transport = MockTransport::new();
    let engine = engine(&transport);

    let low = note(1, 100);
    let high = note(2, 200);
    transport.seed(A, [low.clone(), high.clone()]);

    let (handle, mut rx) = open(
        &engine,
        text_notes(&[A]),
        SubscribeOptions::default().need_sort(false),
    );
    let ids = settled(&mut rx).await;
    assert_eq!(ids.len(), 2);

    let first = note(3, 50);
    engine.set_identity(Some(NoteBuilder::pubkey(3)));
    transport.publish(A, first.clone());
    assert_eq!(next(&mut rx).await, Update::New(first.id));

    let main = engine
        .with_timeline(handle.key(), |t| {
            t.notes().iter().map(|n| n.id).collect::<Vec<_>>()
        })
        .expect("open");
    assert_eq!(main[0], first.id);
    assert_eq!(&main[1..], ids.as_slice());
}
