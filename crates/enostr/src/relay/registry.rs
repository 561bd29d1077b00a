use hashbrown::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use super::connection::{ConnCommand, RelayConnection, RelayNotification};
use super::transport::Transport;
use super::{AtomicRelayStatus, RelayConfig, RelayStatus, RelayUrl};
use crate::{Filter, SubId};

struct RelayEntry {
    url: RelayUrl,
    refs: AtomicUsize,
    /// bumped on every acquire, so a pending teardown can tell that the
    /// relay was picked up again in the meantime
    generation: AtomicU64,
    status: Arc<AtomicRelayStatus>,
    commands: UnboundedSender<ConnCommand>,
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    relays: Mutex<HashMap<RelayUrl, Arc<RelayEntry>>>,
}

impl RegistryInner {
    fn relays(&self) -> MutexGuard<'_, HashMap<RelayUrl, Arc<RelayEntry>>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the connection if nobody re-acquired it since `generation`
    fn teardown_if_idle(&self, url: &RelayUrl, generation: u64) {
        let mut relays = self.relays();
        let Some(entry) = relays.get(url) else {
            return;
        };

        if entry.refs.load(Ordering::Acquire) != 0
            || entry.generation.load(Ordering::Acquire) != generation
        {
            trace!("{} was reacquired during its grace period", url);
            return;
        }

        debug!("tearing down idle relay {}", url);
        if let Some(entry) = relays.remove(url) {
            let _ = entry.commands.send(ConnCommand::Shutdown);
        }
    }
}

/// Every relay connection in the process, shared by url. Connections are
/// reference counted through [`RelayHandle`]s and torn down a grace period
/// after the last handle goes away.
#[derive(Clone)]
pub struct RelayRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for RelayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRegistry")
            .field("relays", &self.urls())
            .finish()
    }
}

impl RelayRegistry {
    pub fn new(transport: impl Transport, config: RelayConfig) -> Self {
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: RelayConfig) -> Self {
        RelayRegistry {
            inner: Arc::new(RegistryInner {
                transport,
                config,
                relays: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Get a handle on the connection to `url`, opening it if needed. Must
    /// be called from within a tokio runtime.
    pub fn acquire(&self, url: &RelayUrl) -> RelayHandle {
        let mut relays = self.inner.relays();

        let reusable = relays
            .get(url)
            .filter(|entry| !entry.commands.is_closed())
            .cloned();

        let entry = match reusable {
            Some(entry) => entry,
            None => {
                debug!("opening relay {}", url);
                let status = Arc::new(AtomicRelayStatus::new(RelayStatus::Connecting));
                let commands = RelayConnection::spawn(
                    url.clone(),
                    self.inner.transport.clone(),
                    self.inner.config.clone(),
                    status.clone(),
                );
                let entry = Arc::new(RelayEntry {
                    url: url.clone(),
                    refs: AtomicUsize::new(0),
                    generation: AtomicU64::new(0),
                    status,
                    commands,
                });
                relays.insert(url.clone(), entry.clone());
                entry
            }
        };

        entry.refs.fetch_add(1, Ordering::AcqRel);
        entry.generation.fetch_add(1, Ordering::AcqRel);

        RelayHandle {
            entry,
            registry: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    pub fn status(&self, url: &RelayUrl) -> Option<RelayStatus> {
        self.inner.relays().get(url).map(|entry| entry.status.get())
    }

    /// Live handles on `url`. Zero while a connection sits in its grace
    /// period.
    pub fn ref_count(&self, url: &RelayUrl) -> usize {
        self.inner
            .relays()
            .get(url)
            .map(|entry| entry.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Relays with an open connection, including ones in their grace period
    pub fn urls(&self) -> Vec<RelayUrl> {
        let mut urls: Vec<RelayUrl> = self.inner.relays().keys().cloned().collect();
        urls.sort();
        urls
    }
}

/// A counted reference to one relay connection. Dropping it releases the
/// reference.
pub struct RelayHandle {
    entry: Arc<RelayEntry>,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("url", &self.entry.url)
            .field("status", &self.entry.status.get())
            .finish()
    }
}

impl RelayHandle {
    pub fn url(&self) -> &RelayUrl {
        &self.entry.url
    }

    pub fn status(&self) -> RelayStatus {
        self.entry.status.get()
    }

    /// Send a `REQ` now, or as soon as the relay is connected. It is resent
    /// after every reconnect until [`RelayHandle::unsubscribe`].
    pub fn subscribe(
        &self,
        sub_id: SubId,
        filters: Vec<Filter>,
        listener: UnboundedSender<RelayNotification>,
    ) {
        let _ = self.entry.commands.send(ConnCommand::Subscribe {
            sub_id,
            filters,
            listener,
        });
    }

    pub fn unsubscribe(&self, sub_id: SubId) {
        let _ = self.entry.commands.send(ConnCommand::Unsubscribe { sub_id });
    }

    pub fn release(mut self) {
        self.release_ref();
    }

    fn release_ref(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let previous = self.entry.refs.fetch_sub(1, Ordering::AcqRel);
        if previous != 1 {
            return;
        }

        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let url = self.entry.url.clone();
        let generation = self.entry.generation.load(Ordering::Acquire);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let grace = registry.config.grace_period();
                trace!("{} unreferenced, closing in {:?}", url, grace);
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    registry.teardown_if_idle(&url, generation);
                });
            }
            Err(_) => registry.teardown_if_idle(&url, generation),
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.release_ref();
    }
}
