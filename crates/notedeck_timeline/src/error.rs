use crate::TimelineKey;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The timeline was never created or has been closed. Always a caller
    /// bug.
    #[error("unknown timeline session: {0}")]
    UnknownSession(TimelineKey),

    #[error("relay error: {0}")]
    Relay(#[from] enostr::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("generic error: {0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}
