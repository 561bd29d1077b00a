//! Test helpers: a note builder and an in-memory relay network.
//!
//! [`MockTransport`] plugs into [`crate::RelayRegistry`] in place of real
//! websockets. Every url is a relay that answers `REQ`s from its stored
//! notes, followed by `EOSE`, and pushes published notes to live
//! subscriptions.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use super::transport::{Transport, WsFrame, WsOut, WsPipe};
use super::RelayUrl;
use crate::{Error, Filter, Note, NoteId, Pubkey, Result};

/// Builds unsigned notes with predictable ids and authors.
#[derive(Debug, Clone)]
pub struct NoteBuilder {
    kind: u64,
    author: u8,
    id: Option<[u8; 32]>,
    created_at: u64,
    tags: Vec<Vec<String>>,
    content: String,
}

impl NoteBuilder {
    /// `author_seed` becomes every byte of the author's pubkey
    pub fn new(kind: u64, author_seed: u8) -> Self {
        Self {
            kind,
            author: author_seed,
            id: None,
            created_at: 1_000,
            tags: vec![],
            content: String::new(),
        }
    }

    /// Force the id to `[seed; 32]`. Without this the id is derived from
    /// the note's fields.
    pub fn id(mut self, seed: u8) -> Self {
        self.id = Some([seed; 32]);
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn tag(mut self, tag: &[&str]) -> Self {
        self.tags.push(tag.iter().map(|s| (*s).to_owned()).collect());
        self
    }

    pub fn content(mut self, content: &str) -> Self {
        self.content = content.to_owned();
        self
    }

    pub fn pubkey(author_seed: u8) -> Pubkey {
        Pubkey::new([author_seed; 32])
    }

    pub fn build(self) -> Note {
        let id = self.id.unwrap_or_else(|| self.derived_id());
        Note {
            id: NoteId::new(id),
            pubkey: Self::pubkey(self.author),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: "00".repeat(64),
        }
    }

    fn derived_id(&self) -> [u8; 32] {
        let mut id = [0u8; 32];
        for (salt, chunk) in id.chunks_mut(8).enumerate() {
            let mut hasher = DefaultHasher::new();
            salt.hash(&mut hasher);
            self.kind.hash(&mut hasher);
            self.author.hash(&mut hasher);
            self.created_at.hash(&mut hasher);
            self.tags.hash(&mut hasher);
            self.content.hash(&mut hasher);
            chunk.copy_from_slice(&hasher.finish().to_be_bytes());
        }
        id
    }
}

/// How a mock relay treats incoming connections
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum MockBehavior {
    #[default]
    Normal,
    /// fail every connection attempt
    Refuse,
    /// accept subscriptions and send stored notes, but never `EOSE`
    Silent,
}

struct MockSub {
    id: String,
    filters: Vec<Filter>,
}

struct MockConn {
    id: u64,
    frames: UnboundedSender<WsFrame>,
    subs: Vec<MockSub>,
}

#[derive(Default)]
struct MockRelay {
    behavior: MockBehavior,
    notes: Vec<Note>,
    conns: Vec<MockConn>,
    connects: usize,
}

#[derive(Default)]
struct MockState {
    relays: HashMap<RelayUrl, MockRelay>,
    next_conn: u64,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, url: &str, behavior: MockBehavior) {
        self.state()
            .relays
            .entry(RelayUrl::new(url))
            .or_default()
            .behavior = behavior;
    }

    /// Store notes without announcing them to live subscriptions
    pub fn seed(&self, url: &str, notes: impl IntoIterator<Item = Note>) {
        self.state()
            .relays
            .entry(RelayUrl::new(url))
            .or_default()
            .notes
            .extend(notes);
    }

    /// Store a note and send it to every live subscription it matches
    pub fn publish(&self, url: &str, note: Note) {
        let mut state = self.state();
        let relay = state.relays.entry(RelayUrl::new(url)).or_default();

        for conn in &relay.conns {
            for sub in &conn.subs {
                if sub.filters.iter().any(|f| f.matches(&note)) {
                    let _ = conn.frames.send(event_frame(&sub.id, &note));
                }
            }
        }

        relay.notes.push(note);
    }

    /// Drop every live connection to `url`, as if the socket died
    pub fn disconnect(&self, url: &str) {
        let mut state = self.state();
        if let Some(relay) = state.relays.get_mut(&RelayUrl::new(url)) {
            for conn in relay.conns.drain(..) {
                let _ = conn.frames.send(WsFrame::Closed);
            }
        }
    }

    /// Have the relay end every live subscription with `CLOSED`
    pub fn close_subscriptions(&self, url: &str, reason: &str) {
        let mut state = self.state();
        if let Some(relay) = state.relays.get_mut(&RelayUrl::new(url)) {
            for conn in &mut relay.conns {
                for sub in conn.subs.drain(..) {
                    let frame = json!(["CLOSED", sub.id, reason]).to_string();
                    let _ = conn.frames.send(WsFrame::Text(frame));
                }
            }
        }
    }

    /// How many times anyone tried to connect to `url`
    pub fn connects(&self, url: &str) -> usize {
        self.state()
            .relays
            .get(&RelayUrl::new(url))
            .map(|relay| relay.connects)
            .unwrap_or(0)
    }

    pub fn live_connections(&self, url: &str) -> usize {
        self.state()
            .relays
            .get(&RelayUrl::new(url))
            .map(|relay| relay.conns.len())
            .unwrap_or(0)
    }

    /// Subscriptions the relay currently considers open
    pub fn live_subscriptions(&self, url: &str) -> usize {
        self.state()
            .relays
            .get(&RelayUrl::new(url))
            .map(|relay| relay.conns.iter().map(|conn| conn.subs.len()).sum())
            .unwrap_or(0)
    }

    fn handle_client_text(&self, url: &RelayUrl, conn_id: u64, text: &str) {
        let Ok(msg) = serde_json::from_str::<Vec<Value>>(text) else {
            debug!("mock relay {} got garbage: {}", url, text);
            return;
        };

        let mut state = self.state();
        let Some(relay) = state.relays.get_mut(url) else {
            return;
        };
        let behavior = relay.behavior;
        let MockRelay { notes, conns, .. } = relay;
        let Some(conn) = conns.iter_mut().find(|conn| conn.id == conn_id) else {
            return;
        };

        let sub_id = msg
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match msg.first().and_then(Value::as_str) {
            Some("REQ") => {
                let filters: Vec<Filter> = msg
                    .iter()
                    .skip(2)
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect();

                for note in stored_matches(notes, &filters) {
                    let _ = conn.frames.send(event_frame(&sub_id, note));
                }

                if behavior != MockBehavior::Silent {
                    let eose = json!(["EOSE", sub_id]).to_string();
                    let _ = conn.frames.send(WsFrame::Text(eose));
                }

                conn.subs.retain(|sub| sub.id != sub_id);
                conn.subs.push(MockSub {
                    id: sub_id,
                    filters,
                });
            }
            Some("CLOSE") => conn.subs.retain(|sub| sub.id != sub_id),
            _ => debug!("mock relay {} ignoring {}", url, text),
        }
    }

    fn connection_dropped(&self, url: &RelayUrl, conn_id: u64) {
        if let Some(relay) = self.state().relays.get_mut(url) {
            relay.conns.retain(|conn| conn.id != conn_id);
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: &RelayUrl) -> Result<WsPipe> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let conn_id = {
            let mut state = self.state();
            state.next_conn += 1;
            let conn_id = state.next_conn;

            let relay = state.relays.entry(url.clone()).or_default();
            relay.connects += 1;
            if relay.behavior == MockBehavior::Refuse {
                return Err(Error::Websocket("connection refused".to_owned()));
            }

            let _ = frame_tx.send(WsFrame::Opened);
            relay.conns.push(MockConn {
                id: conn_id,
                frames: frame_tx,
                subs: vec![],
            });
            conn_id
        };

        let transport = self.clone();
        let url = url.clone();
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    WsOut::Text(text) => transport.handle_client_text(&url, conn_id, &text),
                    WsOut::Ping => {}
                }
            }
            transport.connection_dropped(&url, conn_id);
        });

        Ok(WsPipe {
            sender: out_tx,
            receiver: frame_rx,
        })
    }
}

fn event_frame(sub_id: &str, note: &Note) -> WsFrame {
    WsFrame::Text(json!(["EVENT", sub_id, note]).to_string())
}

/// Newest first, each filter capped at its own limit
fn stored_matches<'a>(notes: &'a [Note], filters: &[Filter]) -> Vec<&'a Note> {
    let mut sorted: Vec<&Note> = notes.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

    let mut out: Vec<&Note> = vec![];
    for filter in filters {
        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        for note in sorted
            .iter()
            .copied()
            .filter(|note| filter.matches(note))
            .take(limit)
        {
            if !out.iter().any(|n| n.id == note.id) {
                out.push(note);
            }
        }
    }

    out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    out
}
