//! One user level request fanned out over many relays.
//!
//! A [`Subscription`] sends a single `REQ` per relay, tracks which relays
//! have finished sending stored notes, and turns everything that comes back
//! into one stream of [`SubscriptionEvent`]s: cumulative snapshots until the
//! request settles, then live notes one at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use enostr::{
    DedupKey, Filter, Note, RelayHandle, RelayNotification, RelayRegistry, RelayUrl, SubId,
};
use hashbrown::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Close reason reported for relays that never sent EOSE in time
pub const EOSE_TIMEOUT: &str = "eose timeout";

const DEFAULT_EOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The same filter sent to a group of relays
#[derive(Debug, Clone, PartialEq)]
pub struct SubRequest {
    pub relays: Vec<RelayUrl>,
    pub filter: Filter,
}

impl SubRequest {
    pub fn new<I, U>(relays: I, filter: Filter) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<RelayUrl>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            filter,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Sort snapshots newest first. Turn off for relays that return their
    /// own ranking.
    pub need_sort: bool,
    /// per relay EOSE ceiling, five seconds when unset
    pub eose_timeout: Option<Duration>,
    /// overrides every filter's `limit`
    pub limit: Option<u64>,
    /// only shows up in logs
    pub description: &'static str,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            need_sort: true,
            eose_timeout: None,
            limit: None,
            description: "subscription",
        }
    }
}

impl SubscribeOptions {
    pub fn need_sort(mut self, need_sort: bool) -> Self {
        self.need_sort = need_sort;
        self
    }

    pub fn eose_timeout(mut self, timeout: Duration) -> Self {
        self.eose_timeout = Some(timeout);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }
}

#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// Everything received so far, deduplicated. `all_settled` is true on
    /// exactly one of these, the last one.
    Events {
        notes: Vec<Arc<Note>>,
        all_settled: bool,
    },
    /// a note that arrived after settlement
    New(Arc<Note>),
    /// a relay stopped serving this request, for now or for good
    Closed { relay: RelayUrl, reason: String },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EoseState {
    Pending,
    Sent,
    TimedOut,
    /// closed or disconnected before EOSE
    Closed,
}

/// Closes the request when dropped
pub struct Subscription {
    sub_id: SubId,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
}

/// The receiving half of a [`Subscription`]. Yields nothing once the
/// subscription is closed.
pub struct SubscriptionEvents {
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    closed: Arc<AtomicBool>,
}

impl SubscriptionEvents {
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let event = self.rx.recv().await?;

        if self.closed.load(Ordering::Acquire) {
            None
        } else {
            Some(event)
        }
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Subscription {
    /// Send the request to every relay. Must be called from within a tokio
    /// runtime.
    pub fn open(
        registry: &RelayRegistry,
        requests: Vec<SubRequest>,
        options: SubscribeOptions,
    ) -> (Subscription, SubscriptionEvents) {
        let sub_id = SubId::new(options.description);
        let closed = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let subscription = Subscription {
            sub_id: sub_id.clone(),
            closed: closed.clone(),
            close_tx,
        };
        let events = SubscriptionEvents {
            rx: events_rx,
            closed,
        };

        let groups = group_by_relay(requests, options.limit);
        if groups.is_empty() {
            debug!("{} has nothing to ask for, settling empty", sub_id);
            let _ = events_tx.send(SubscriptionEvent::Events {
                notes: vec![],
                all_settled: true,
            });
            return (subscription, events);
        }

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let mut eose = HashMap::new();
        let handles: Vec<RelayHandle> = groups
            .into_iter()
            .map(|(url, filters)| {
                let handle = registry.acquire(&url);
                handle.subscribe(sub_id.clone(), filters, notify_tx.clone());
                eose.insert(url, EoseState::Pending);
                handle
            })
            .collect();

        debug!("{} opened on {} relays", sub_id, handles.len());

        let task = SubscriptionTask {
            sub_id,
            handles,
            eose,
            notes: vec![],
            index: HashMap::new(),
            dirty: false,
            settled: false,
            need_sort: options.need_sort,
            deadline: Instant::now() + options.eose_timeout.unwrap_or(DEFAULT_EOSE_TIMEOUT),
            events: events_tx,
        };
        tokio::spawn(task.run(notify_rx, close_rx));

        (subscription, events)
    }

    /// Open, wait for settlement and return the final snapshot
    pub async fn fetch(
        registry: &RelayRegistry,
        requests: Vec<SubRequest>,
        options: SubscribeOptions,
    ) -> Vec<Arc<Note>> {
        let (subscription, mut events) = Subscription::open(registry, requests, options);

        let mut latest = vec![];
        while let Some(event) = events.recv().await {
            if let SubscriptionEvent::Events { notes, all_settled } = event {
                latest = notes;
                if all_settled {
                    break;
                }
            }
        }

        subscription.close();
        latest
    }

    pub fn sub_id(&self) -> &SubId {
        &self.sub_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivering events and unsubscribe from every relay. Safe to
    /// call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing {}", self.sub_id);
        let _ = self.close_tx.send(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// One `REQ` per relay, with every filter meant for it. Filters that can't
/// match anything are left out.
fn group_by_relay(
    requests: Vec<SubRequest>,
    limit: Option<u64>,
) -> BTreeMap<RelayUrl, Vec<Filter>> {
    let mut groups: BTreeMap<RelayUrl, Vec<Filter>> = BTreeMap::new();

    for request in requests {
        if request.filter.has_empty_kinds() {
            debug!("skipping request with an empty kind set");
            continue;
        }

        let mut filter = request.filter;
        if limit.is_some() {
            filter.limit = limit;
        }

        for relay in request.relays {
            let filters = groups.entry(relay).or_default();
            if !filters.contains(&filter) {
                filters.push(filter.clone());
            }
        }
    }

    groups
}

struct SubscriptionTask {
    sub_id: SubId,
    handles: Vec<RelayHandle>,
    eose: HashMap<RelayUrl, EoseState>,
    /// arrival order, one per dedup key
    notes: Vec<Arc<Note>>,
    index: HashMap<DedupKey, usize>,
    /// notes changed since the last snapshot
    dirty: bool,
    settled: bool,
    need_sort: bool,
    deadline: Instant,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl SubscriptionTask {
    async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<RelayNotification>,
        mut close_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = close_rx.changed() => break,

                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        debug!("{}: every relay let go", self.sub_id);
                        break;
                    };
                    self.handle(notification);
                    // coalesce bursts into one snapshot
                    while let Ok(notification) = notifications.try_recv() {
                        self.handle(notification);
                    }
                }

                _ = sleep_until(self.deadline), if !self.settled => self.timed_out(),
            }

            if !self.flush() {
                debug!("{}: nobody is listening", self.sub_id);
                break;
            }
        }

        for handle in &self.handles {
            handle.unsubscribe(self.sub_id.clone());
        }
        trace!("{} released {} relays", self.sub_id, self.handles.len());
    }

    fn handle(&mut self, notification: RelayNotification) {
        match notification {
            RelayNotification::Event { note, .. } => self.on_note(note),

            RelayNotification::Eose { relay } => {
                if let Some(state) = self.eose.get_mut(&relay) {
                    if *state == EoseState::Pending {
                        trace!("{}: EOSE from {}", self.sub_id, relay);
                        *state = EoseState::Sent;
                    }
                }
            }

            RelayNotification::Closed { relay, reason }
            | RelayNotification::Disconnected { relay, reason } => {
                if let Some(state) = self.eose.get_mut(&relay) {
                    if *state == EoseState::Pending {
                        debug!("{}: {} gone before EOSE: {}", self.sub_id, relay, reason);
                        *state = EoseState::Closed;
                    }
                }
                self.send(SubscriptionEvent::Closed { relay, reason });
            }
        }
    }

    fn on_note(&mut self, note: Arc<Note>) {
        let key = note.dedup_key();
        match self.index.get(&key) {
            Some(&pos) => {
                if !note.supersedes(&self.notes[pos]) {
                    return;
                }
                self.notes[pos] = note.clone();
            }
            None => {
                self.index.insert(key, self.notes.len());
                self.notes.push(note.clone());
            }
        }

        if self.settled {
            self.send(SubscriptionEvent::New(note));
        } else {
            self.dirty = true;
        }
    }

    fn timed_out(&mut self) {
        let mut late = vec![];
        for (relay, state) in self.eose.iter_mut() {
            if *state == EoseState::Pending {
                *state = EoseState::TimedOut;
                late.push(relay.clone());
            }
        }

        for relay in late {
            debug!("{}: no EOSE from {} in time", self.sub_id, relay);
            self.send(SubscriptionEvent::Closed {
                relay,
                reason: EOSE_TIMEOUT.to_owned(),
            });
        }
    }

    /// Emit a snapshot if anything changed before settlement. Returns false
    /// once the receiver is gone.
    fn flush(&mut self) -> bool {
        if self.settled {
            return !self.events.is_closed();
        }

        let all_settled = self.eose.values().all(|state| *state != EoseState::Pending);
        if !self.dirty && !all_settled {
            return true;
        }

        self.dirty = false;
        self.settled = all_settled;
        if all_settled {
            debug!("{} settled with {} notes", self.sub_id, self.notes.len());
        }

        let notes = self.snapshot();
        self.send(SubscriptionEvent::Events { notes, all_settled })
    }

    fn snapshot(&self) -> Vec<Arc<Note>> {
        let mut notes = self.notes.clone();
        if self.need_sort {
            notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        notes
    }

    fn send(&self, event: SubscriptionEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
