//! Live timelines on top of [`Subscription`]s.
//!
//! Each call to [`TimelineEngine::subscribe_timeline`] starts a session: a
//! [`Timeline`] fed by one subscription, and a listener that is told about
//! every change. The session lives until its [`TimelineHandle`] is closed or
//! dropped; after that the listener never hears from it again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use enostr::{Note, Pubkey, RelayRegistry, RelayUrl, Transport, WebsocketTransport};
use hashbrown::HashMap;
use tracing::{debug, info, trace, warn};

use crate::subscription::{
    SubRequest, SubscribeOptions, Subscription, SubscriptionEvent, SubscriptionEvents,
};
use crate::{
    CloseReporter, Disposition, Error, Result, Timeline, TimelineConfig, TimelineKey,
    VisibilityContext,
};

/// Receives the updates of one timeline. Called from the engine's tasks,
/// never after the timeline is closed.
pub trait TimelineListener: Send + 'static {
    /// The main view was replaced by a new snapshot
    fn on_events(&mut self, notes: &[Arc<Note>], all_settled: bool);

    /// A live note landed in the main view or the pending buffer. The
    /// timeline is already updated when this is called.
    fn on_new(&mut self, note: &Arc<Note>);

    /// A relay closed the request for a reason worth showing
    fn on_close(&mut self, _relay: &RelayUrl, _reason: &str) {}

    /// Pending notes were merged in by [`TimelineEngine::show_new`]
    fn scroll_to_top(&mut self) {}
}

type Sessions = Mutex<HashMap<TimelineKey, Arc<Session>>>;

type Deferred = Box<dyn FnOnce(&mut dyn TimelineListener) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The listener of one session. Callbacks never overlap. A callback that
/// calls back into the engine gets the nested notifications queued and
/// delivered once it returns.
struct ListenerSlot {
    listener: Mutex<Option<Box<dyn TimelineListener>>>,
    /// the thread currently inside a callback
    busy: Mutex<Option<ThreadId>>,
    deferred: Mutex<VecDeque<Deferred>>,
    closed: AtomicBool,
}

impl ListenerSlot {
    fn new(listener: Box<dyn TimelineListener>) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            busy: Mutex::new(None),
            deferred: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn in_callback(&self) -> bool {
        *lock(&self.busy) == Some(thread::current().id())
    }

    fn notify(&self, f: impl FnOnce(&mut dyn TimelineListener) + Send + 'static) {
        if self.in_callback() {
            lock(&self.deferred).push_back(Box::new(f));
            return;
        }

        let mut slot = lock(&self.listener);
        let Some(listener) = slot.as_mut() else {
            return;
        };

        *lock(&self.busy) = Some(thread::current().id());
        f(listener.as_mut());
        while !self.closed.load(Ordering::Acquire) {
            let Some(next) = lock(&self.deferred).pop_front() else {
                break;
            };
            next(listener.as_mut());
        }
        *lock(&self.busy) = None;

        // closed from inside the callback
        if self.closed.load(Ordering::Acquire) {
            slot.take();
            lock(&self.deferred).clear();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.in_callback() {
            return;
        }

        // waits for a callback in progress, if any
        lock(&self.listener).take();
        lock(&self.deferred).clear();
    }
}

struct Session {
    key: TimelineKey,
    requests: Vec<SubRequest>,
    need_sort: bool,
    timeline: Mutex<Timeline>,
    listener: ListenerSlot,
    subscription: Subscription,
}

impl Session {
    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        lock(&self.timeline)
    }

    fn notify(&self, f: impl FnOnce(&mut dyn TimelineListener) + Send + 'static) {
        self.listener.notify(f);
    }

    fn close(&self) {
        self.subscription.close();
        self.listener.close();
        self.timeline().close();
    }
}

/// Owns the relay registry and every open timeline. Cheap to clone.
#[derive(Clone)]
pub struct TimelineEngine {
    registry: RelayRegistry,
    config: TimelineConfig,
    identity: Arc<RwLock<Option<Pubkey>>>,
    reporter: CloseReporter,
    sessions: Arc<Sessions>,
}

impl TimelineEngine {
    pub fn new(registry: RelayRegistry, config: TimelineConfig) -> Self {
        Self {
            registry,
            config,
            identity: Arc::new(RwLock::new(None)),
            reporter: CloseReporter::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_transport(transport: impl Transport, config: TimelineConfig) -> Self {
        let registry = RelayRegistry::new(transport, config.relay.clone());
        Self::new(registry, config)
    }

    /// An engine that talks to real relays
    pub fn with_websockets(config: TimelineConfig) -> Self {
        Self::with_transport(WebsocketTransport::new(), config)
    }

    pub fn close_reporter(mut self, reporter: CloseReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// The account whose own live notes skip the pending buffer
    pub fn set_identity(&self, pubkey: Option<Pubkey>) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = pubkey;
    }

    pub fn identity(&self) -> Option<Pubkey> {
        *self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_timelines(&self) -> usize {
        self.sessions().len()
    }

    /// Open a live timeline. Must be called from within a tokio runtime.
    ///
    /// `options.limit` falls back to [`TimelineConfig::remote_limit`] and
    /// `options.eose_timeout` to [`TimelineConfig::eose_timeout`].
    pub fn subscribe_timeline(
        &self,
        requests: Vec<SubRequest>,
        listener: impl TimelineListener,
        options: SubscribeOptions,
    ) -> TimelineHandle {
        let key = TimelineKey::next();
        let options = SubscribeOptions {
            limit: Some(options.limit.unwrap_or(self.config.remote_limit)),
            eose_timeout: Some(options.eose_timeout.unwrap_or(self.config.eose_timeout())),
            ..options
        };

        let (subscription, events) =
            Subscription::open(&self.registry, requests.clone(), options.clone());

        let session = Arc::new(Session {
            key,
            requests,
            need_sort: options.need_sort,
            timeline: Mutex::new(Timeline::new(key, options.need_sort)),
            listener: ListenerSlot::new(Box::new(listener)),
            subscription,
        });

        self.sessions().insert(key, session.clone());
        info!(
            "{} opened as {} ({})",
            key,
            session.subscription.sub_id(),
            options.description
        );

        tokio::spawn(pump(
            session.clone(),
            events,
            self.identity.clone(),
            self.reporter.clone(),
        ));

        TimelineHandle {
            key,
            session,
            sessions: Arc::downgrade(&self.sessions),
        }
    }

    /// Fetch the page of notes older than `before` and add it to the
    /// timeline. Returns only the notes that were new to it, newest first.
    ///
    /// Does nothing once the timeline is closed or has run out of history.
    pub async fn load_more_timeline(
        &self,
        key: TimelineKey,
        before: u64,
        limit: u64,
    ) -> Result<Vec<Arc<Note>>> {
        let session = self.session(key)?;
        {
            let timeline = session.timeline();
            if timeline.is_closed() || !timeline.has_more() {
                trace!("{} has nothing more to load", key);
                return Ok(vec![]);
            }
        }

        let requests = session
            .requests
            .iter()
            .cloned()
            .map(|mut request| {
                request.filter = request.filter.until(before).limit(limit);
                request
            })
            .collect();
        let options = SubscribeOptions::default()
            .need_sort(session.need_sort)
            .eose_timeout(self.config.load_more_timeout())
            .description("load more");

        let page = Subscription::fetch(&self.registry, requests, options).await;

        let mut timeline = session.timeline();
        if timeline.is_closed() {
            debug!("{} closed while loading more, dropping the page", key);
            return Ok(vec![]);
        }

        let fetched = page.len();
        let added = timeline.admit_page(page, before);
        debug!(
            "{} loaded {} older notes ({} fetched), has_more {}",
            key,
            added.len(),
            fetched,
            timeline.has_more()
        );
        Ok(added)
    }

    pub fn pending_count(&self, key: TimelineKey) -> Result<usize> {
        Ok(self.session(key)?.timeline().pending_count())
    }

    /// Merge the pending buffer into the main view. Returns how many notes
    /// moved.
    pub fn show_new(&self, key: TimelineKey) -> Result<usize> {
        let session = self.session(key)?;
        let shown = session.timeline().show_new();
        session.notify(|listener| listener.scroll_to_top());
        Ok(shown)
    }

    pub fn visible_notes(
        &self,
        key: TimelineKey,
        ctx: &VisibilityContext<'_>,
    ) -> Result<Vec<Arc<Note>>> {
        Ok(self.session(key)?.timeline().visible_notes(ctx))
    }

    pub fn visible_pending(
        &self,
        key: TimelineKey,
        ctx: &VisibilityContext<'_>,
    ) -> Result<Vec<Arc<Note>>> {
        Ok(self.session(key)?.timeline().visible_pending(ctx))
    }

    pub fn has_more(&self, key: TimelineKey) -> Result<bool> {
        Ok(self.session(key)?.timeline().has_more())
    }

    /// The `before` to pass to the next [`Self::load_more_timeline`]
    pub fn next_until(&self, key: TimelineKey) -> Result<Option<u64>> {
        Ok(self.session(key)?.timeline().next_until())
    }

    pub fn with_timeline<R>(&self, key: TimelineKey, f: impl FnOnce(&Timeline) -> R) -> Result<R> {
        let session = self.session(key)?;
        let timeline = session.timeline();
        Ok(f(&timeline))
    }

    fn session(&self, key: TimelineKey) -> Result<Arc<Session>> {
        self.sessions()
            .get(&key)
            .cloned()
            .ok_or(Error::UnknownSession(key))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<TimelineKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a timeline open. Closes it when dropped.
pub struct TimelineHandle {
    key: TimelineKey,
    session: Arc<Session>,
    sessions: Weak<Sessions>,
}

impl TimelineHandle {
    pub fn key(&self) -> TimelineKey {
        self.key
    }

    pub fn is_closed(&self) -> bool {
        self.session.timeline().is_closed()
    }

    /// Unsubscribe everywhere and silence the listener. Safe to call more
    /// than once.
    pub fn close(&self) {
        self.session.close();
        if let Some(sessions) = self.sessions.upgrade() {
            let removed = sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.key);
            if removed.is_some() {
                info!("{} closed", self.key);
            }
        }
    }
}

impl Drop for TimelineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(
    session: Arc<Session>,
    mut events: SubscriptionEvents,
    identity: Arc<RwLock<Option<Pubkey>>>,
    reporter: CloseReporter,
) {
    while let Some(event) = events.recv().await {
        match event {
            SubscriptionEvent::Events { notes, all_settled } => {
                let view = {
                    let mut timeline = session.timeline();
                    timeline.on_events(&notes, all_settled);
                    timeline.notes().to_vec()
                };
                trace!(
                    "{} snapshot of {} notes, settled {}",
                    session.key,
                    view.len(),
                    all_settled
                );
                session.notify(move |listener| listener.on_events(&view, all_settled));
            }

            SubscriptionEvent::New(note) => {
                let local = *identity.read().unwrap_or_else(PoisonError::into_inner);
                let disposition = session.timeline().on_new(note.clone(), local.as_ref());
                trace!("{} live note {}: {:?}", session.key, note.id.hex(), disposition);
                if disposition != Disposition::Discard {
                    session.notify(move |listener| listener.on_new(&note));
                }
            }

            SubscriptionEvent::Closed { relay, reason } => {
                if reporter.should_surface(&relay, &reason) {
                    warn!("{} closed by {}: {}", session.key, relay, reason);
                    session.notify(move |listener| listener.on_close(&relay, &reason));
                }
            }
        }
    }

    debug!("{} stopped", session.key);
}
