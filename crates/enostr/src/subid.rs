use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// The id we send to relays in `REQ`/`CLOSE`. Ids are random uuids so
/// relays can't correlate our subscriptions; the description only ever
/// shows up in our own logs.
#[derive(Debug, Clone)]
pub struct SubId {
    description: &'static str,
    id: String,
}

impl PartialEq for SubId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubId {}

impl Hash for SubId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SubId {
    pub fn new(description: &'static str) -> Self {
        Self {
            description,
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &'static str {
        self.description
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // uuids are ascii, so slicing on a byte index is fine
        let short = &self.id[..self.id.len().min(8)];
        write!(f, "SubId('{}', {}...)", self.description, short)
    }
}
