use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use super::transport::{Transport, WsFrame, WsOut, WsPipe};
use super::{close_reason, AtomicRelayStatus, RelayConfig, RelayStatus, RelayUrl};
use crate::{ClientMessage, Filter, Note, RelayMessage, SubId};

/// What a relay connection reports back to the owner of a subscription
#[derive(Debug, Clone)]
pub enum RelayNotification {
    /// a note that matched the subscription's filters
    Event { relay: RelayUrl, note: Arc<Note> },
    /// the relay finished sending stored notes
    Eose { relay: RelayUrl },
    /// the relay ended the subscription; it will not be resent
    Closed { relay: RelayUrl, reason: String },
    /// the socket went away. The subscription stays registered and is
    /// resent once the connection comes back.
    Disconnected { relay: RelayUrl, reason: String },
}

impl RelayNotification {
    pub fn relay(&self) -> &RelayUrl {
        match self {
            RelayNotification::Event { relay, .. }
            | RelayNotification::Eose { relay }
            | RelayNotification::Closed { relay, .. }
            | RelayNotification::Disconnected { relay, .. } => relay,
        }
    }
}

pub(crate) enum ConnCommand {
    Subscribe {
        sub_id: SubId,
        filters: Vec<Filter>,
        listener: UnboundedSender<RelayNotification>,
    },
    Unsubscribe {
        sub_id: SubId,
    },
    Shutdown,
}

struct ActiveSub {
    sub_id: SubId,
    filters: Vec<Filter>,
    listener: UnboundedSender<RelayNotification>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Phase {
    Connecting,
    Connected,
    /// waiting out a reconnect delay
    Backoff,
}

/// Owns one physical relay connection. Runs as its own task and is only
/// ever talked to through [`ConnCommand`]s.
pub(crate) struct RelayConnection {
    url: RelayUrl,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
    status: Arc<AtomicRelayStatus>,
    subs: HashMap<String, ActiveSub>,
    pipe: Option<WsPipe>,
    phase: Phase,
    retry_after: Duration,
    timer: Option<Instant>,
}

impl RelayConnection {
    /// Spawn the connection task. Must be called from within a tokio
    /// runtime.
    pub fn spawn(
        url: RelayUrl,
        transport: Arc<dyn Transport>,
        config: RelayConfig,
        status: Arc<AtomicRelayStatus>,
    ) -> UnboundedSender<ConnCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = RelayConnection {
            url,
            transport,
            retry_after: config.reconnect.initial(),
            config,
            status,
            subs: HashMap::new(),
            pipe: None,
            phase: Phase::Connecting,
            timer: None,
        };

        tokio::spawn(conn.run(rx));
        tx
    }

    async fn run(mut self, mut commands: UnboundedReceiver<ConnCommand>) {
        self.connect();

        loop {
            let timer = self.timer;

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ConnCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },

                frame = next_frame(&mut self.pipe) => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => self.disconnected(close_reason::CONNECTION_CLOSED.to_owned()),
                },

                _ = wait_for(timer) => self.handle_timer(),
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, cmd: ConnCommand) {
        match cmd {
            ConnCommand::Subscribe {
                sub_id,
                filters,
                listener,
            } => {
                debug!("{} subscribing {} to {}", self.url, sub_id, sub_id.description());
                if self.phase == Phase::Connected {
                    self.send(&ClientMessage::req(&sub_id, filters.clone()));
                }
                self.subs.insert(
                    sub_id.as_str().to_owned(),
                    ActiveSub {
                        sub_id,
                        filters,
                        listener,
                    },
                );
            }

            ConnCommand::Unsubscribe { sub_id } => {
                if self.subs.remove(sub_id.as_str()).is_some() && self.phase == Phase::Connected
                {
                    self.send(&ClientMessage::close(&sub_id));
                }
            }

            ConnCommand::Shutdown => {}
        }
    }

    fn handle_frame(&mut self, frame: WsFrame) {
        match frame {
            WsFrame::Opened => {
                info!("connected to {}", self.url);
                self.phase = Phase::Connected;
                self.status.set(RelayStatus::Connected);
                self.retry_after = self.config.reconnect.initial();
                self.timer = Some(Instant::now() + self.config.ping_rate());

                let reqs: Vec<ClientMessage> = self
                    .subs
                    .values()
                    .map(|sub| ClientMessage::req(&sub.sub_id, sub.filters.clone()))
                    .collect();
                for req in &reqs {
                    self.send(req);
                }
            }

            WsFrame::Text(text) => self.handle_text(&text),

            WsFrame::Closed => self.disconnected(close_reason::CONNECTION_CLOSED.to_owned()),

            WsFrame::Error(err) => {
                error!("websocket error on {}: {}", self.url, err);
                self.disconnected(format!("{}: {err}", close_reason::CONNECTION_ERRORED));
            }
        }
    }

    #[profiling::function]
    fn handle_text(&mut self, text: &str) {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(err) => {
                error!("error parsing relay message from {}: {err}", self.url);
                return;
            }
        };

        match msg {
            RelayMessage::Event(subid, raw) => {
                let Some(sub) = self.subs.get(subid) else {
                    trace!("{} sent an event for unknown sub {}", self.url, subid);
                    return;
                };

                let note = match Note::from_event_message(raw) {
                    Ok(note) => note,
                    Err(err) => {
                        error!("undecodable event from {}: {err}", self.url);
                        return;
                    }
                };

                if !sub.filters.iter().any(|filter| filter.matches(&note)) {
                    debug!(
                        "dropping {:?} from {}: does not match {}",
                        note.id, self.url, sub.sub_id
                    );
                    return;
                }

                let notification = RelayNotification::Event {
                    relay: self.url.clone(),
                    note: Arc::new(note),
                };
                self.notify(subid.to_owned(), notification);
            }

            RelayMessage::Eose(subid) => {
                if self.subs.contains_key(subid) {
                    let notification = RelayNotification::Eose {
                        relay: self.url.clone(),
                    };
                    self.notify(subid.to_owned(), notification);
                }
            }

            RelayMessage::Closed(subid, reason) => {
                if let Some(sub) = self.subs.remove(subid) {
                    debug!("{} closed {}: {}", self.url, sub.sub_id, reason);
                    let _ = sub.listener.send(RelayNotification::Closed {
                        relay: self.url.clone(),
                        reason,
                    });
                }
            }

            RelayMessage::Notice(notice) => warn!("NOTICE from {}: {}", self.url, notice),

            RelayMessage::OK(result) => debug!("OK from {}: {:?}", self.url, result),
        }
    }

    fn handle_timer(&mut self) {
        self.timer = None;
        match self.phase {
            Phase::Backoff => self.connect(),
            Phase::Connected => {
                trace!("pinging {}", self.url);
                if let Some(pipe) = &self.pipe {
                    let _ = pipe.sender.send(WsOut::Ping);
                }
                self.timer = Some(Instant::now() + self.config.ping_rate());
            }
            Phase::Connecting => {}
        }
    }

    fn connect(&mut self) {
        debug!("connecting to {}", self.url);
        self.phase = Phase::Connecting;
        self.status.set(RelayStatus::Connecting);

        match self.transport.connect(&self.url) {
            Ok(pipe) => self.pipe = Some(pipe),
            Err(err) => {
                error!("could not connect to {}: {err}", self.url);
                self.disconnected(format!("{}: {err}", close_reason::CONNECTION_ERRORED));
            }
        }
    }

    /// Tell every listener, then schedule the next attempt
    fn disconnected(&mut self, reason: String) {
        self.pipe = None;
        self.phase = Phase::Backoff;
        self.status.set(RelayStatus::Disconnected);

        let retry_after = self.retry_after;
        self.timer = Some(Instant::now() + retry_after);
        self.retry_after = self.config.reconnect.next(retry_after);

        info!(
            "{} disconnected ({}), retrying in {:?}",
            self.url, reason, retry_after
        );

        let url = &self.url;
        self.subs.retain(|_, sub| {
            sub.listener
                .send(RelayNotification::Disconnected {
                    relay: url.clone(),
                    reason: reason.clone(),
                })
                .is_ok()
        });
    }

    /// Deliver to one subscription. A listener that went away without
    /// unsubscribing gets its subscription closed on the relay.
    fn notify(&mut self, subid: String, notification: RelayNotification) {
        let Some(sub) = self.subs.get(&subid) else {
            return;
        };

        if sub.listener.send(notification).is_ok() {
            return;
        }

        if let Some(sub) = self.subs.remove(&subid) {
            debug!("listener for {} on {} is gone", sub.sub_id, self.url);
            if self.phase == Phase::Connected {
                self.send(&ClientMessage::close(&sub.sub_id));
            }
        }
    }

    fn send(&self, msg: &ClientMessage) {
        let Some(pipe) = &self.pipe else {
            return;
        };

        match msg.to_json() {
            Ok(json) => {
                debug!("sending {} to {}", json, self.url);
                let _ = pipe.sender.send(WsOut::Text(json));
            }
            Err(e) => error!("error serializing client message: {e}"),
        }
    }

    fn shutdown(&mut self) {
        info!("closing connection to {}", self.url);
        for (_, sub) in self.subs.drain() {
            let _ = sub.listener.send(RelayNotification::Closed {
                relay: self.url.clone(),
                reason: close_reason::CLOSED_BY_CALLER.to_owned(),
            });
        }
        self.pipe = None;
        self.status.set(RelayStatus::Disconnected);
    }
}

async fn next_frame(pipe: &mut Option<WsPipe>) -> Option<WsFrame> {
    match pipe {
        Some(pipe) => pipe.receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
