mod close_reason;
mod config;
mod deletions;
mod engine;
mod error;
mod muted;
mod store;
pub mod subscription;
pub mod timeline;
mod trust;
mod visibility;

pub use close_reason::{classify_close, CloseReporter, CloseSeverity};
pub use config::TimelineConfig;
pub use deletions::Deletions;
pub use engine::{TimelineEngine, TimelineHandle, TimelineListener};
pub use error::Error;
pub use muted::Muted;
pub use store::{Admission, NoteStore};
pub use subscription::{
    SubRequest, SubscribeOptions, Subscription, SubscriptionEvent, SubscriptionEvents,
};
pub use timeline::{Disposition, PendingBuffer, Timeline, TimelineKey};
pub use trust::{TrustAll, TrustPredicate, WebOfTrust, WebOfTrustConfig};
pub use visibility::{visible, DisplayKey, VisibilityContext};

pub type Result<T> = std::result::Result<T, error::Error>;
