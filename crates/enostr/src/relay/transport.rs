use std::sync::Arc;

use ewebsock::{Options, WsEvent, WsMessage};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::{Error, RelayUrl, Result};

/// What the socket hands to a connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Opened,
    Text(String),
    Closed,
    Error(String),
}

/// What a connection task hands to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOut {
    Text(String),
    Ping,
}

/// Both halves of one physical connection. Dropping `sender` closes the
/// socket; `receiver` yields `None` once the socket is gone.
pub struct WsPipe {
    pub sender: mpsc::UnboundedSender<WsOut>,
    pub receiver: mpsc::UnboundedReceiver<WsFrame>,
}

/// Opens physical relay connections. `connect` must return immediately;
/// [`WsFrame::Opened`] arrives on the pipe once the handshake completes.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: &RelayUrl) -> Result<WsPipe>;
}

/// The production transport, backed by ewebsock.
#[derive(Debug, Default, Clone)]
pub struct WebsocketTransport {}

impl WebsocketTransport {
    pub fn new() -> Self {
        Self {}
    }
}

impl Transport for WebsocketTransport {
    /// Must be called from within a tokio runtime.
    fn connect(&self, url: &RelayUrl) -> Result<WsPipe> {
        let notify = Arc::new(Notify::new());
        let wakeup = notify.clone();
        let (mut sender, receiver) =
            ewebsock::connect_with_wakeup(url.as_str(), Options::default(), move || {
                wakeup.notify_one()
            })
            .map_err(Error::Websocket)?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsOut>();
        let url = url.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {
                        while let Some(event) = receiver.try_recv() {
                            let frame = match event {
                                WsEvent::Opened => WsFrame::Opened,
                                WsEvent::Closed => WsFrame::Closed,
                                WsEvent::Error(err) => WsFrame::Error(err),
                                WsEvent::Message(WsMessage::Text(text)) => WsFrame::Text(text),
                                WsEvent::Message(WsMessage::Ping(bs)) => {
                                    trace!("pong {}", url);
                                    sender.send(WsMessage::Pong(bs));
                                    continue;
                                }
                                WsEvent::Message(other) => {
                                    trace!("ignoring non-text message from {}: {:?}", url, other);
                                    continue;
                                }
                            };

                            let terminal = matches!(frame, WsFrame::Closed | WsFrame::Error(_));
                            if frame_tx.send(frame).is_err() || terminal {
                                debug!("websocket bridge for {} finished", url);
                                return;
                            }
                        }
                    }

                    out = out_rx.recv() => match out {
                        Some(WsOut::Text(text)) => sender.send(WsMessage::Text(text)),
                        Some(WsOut::Ping) => sender.send(WsMessage::Ping(vec![])),
                        None => {
                            debug!("closing websocket to {}", url);
                            sender.close();
                            return;
                        }
                    },
                }
            }
        });

        Ok(WsPipe {
            sender: out_tx,
            receiver: frame_rx,
        })
    }
}
