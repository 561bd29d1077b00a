use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Note, NoteId, Pubkey};

/// A relay query. Serializes to the NIP-01 filter object, with tag
/// constraints flattened into `#<letter>` keys.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Default)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<NoteId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<Pubkey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Filter {
    pub fn new() -> Filter {
        Filter::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = NoteId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = Pubkey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u64>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Constrain tag `name` (a single letter, eg. `'t'`) to one of `values`
    pub fn tags(mut self, values: impl IntoIterator<Item = String>, name: char) -> Self {
        self.tags
            .insert(format!("#{name}"), values.into_iter().collect());
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// A filter with an explicitly empty kind set can never match anything
    pub fn has_empty_kinds(&self) -> bool {
        self.kinds.as_ref().is_some_and(Vec::is_empty)
    }

    pub fn json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Into::into)
    }

    /// Evaluate the filter locally. `limit` does not apply to single notes.
    /// `search` is relay-defined (NIP-50 extensions, stemming, ranking) and
    /// is never checked here.
    pub fn matches(&self, note: &Note) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&note.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(&note.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&note.kind) {
                return false;
            }
        }

        if self.since.is_some_and(|since| note.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| note.created_at > until) {
            return false;
        }

        for (key, values) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };

            let found = note
                .tag_values(name)
                .any(|value| values.iter().any(|v| v == value));
            if !found {
                return false;
            }
        }

        true
    }
}
