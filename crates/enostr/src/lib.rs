mod client;
mod error;
mod filter;
mod kind;
mod note;
mod pubkey;
mod relay;
mod subid;

pub use client::ClientMessage;
pub use error::Error;
pub use ewebsock;
pub use filter::Filter;
pub use kind::{DedupKey, NoteKind, Replaceability};
pub use note::{Note, NoteId};
pub use pubkey::Pubkey;
pub use relay::connection::RelayNotification;
pub use relay::message::RelayMessage;
pub use relay::registry::{RelayHandle, RelayRegistry};
pub use relay::transport::{Transport, WebsocketTransport, WsFrame, WsOut, WsPipe};
pub use relay::{close_reason, ReconnectPolicy, RelayConfig, RelayStatus, RelayUrl};
pub use subid::SubId;

#[cfg(any(test, feature = "test-utils"))]
pub use relay::test_utils;

pub type Result<T> = std::result::Result<T, error::Error>;
