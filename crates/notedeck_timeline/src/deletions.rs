use enostr::{Note, NoteId, NoteKind, Pubkey};
use hashbrown::HashMap;

/// NIP-09 tombstones. A deletion only counts when it was published by the
/// author of the deleted note.
#[derive(Debug, Default, Clone)]
pub struct Deletions {
    /// deleted note id -> who asked for the deletion
    ids: HashMap<NoteId, Pubkey>,
    /// `kind:pubkey:d` -> newest deletion request timestamp
    addresses: HashMap<String, u64>,
}

impl Deletions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_notes<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        let mut deletions = Self::new();
        for note in notes {
            deletions.insert(note);
        }
        deletions
    }

    /// Record the tombstones carried by a kind 5 note. Other kinds are
    /// ignored.
    pub fn insert(&mut self, note: &Note) {
        if note.note_kind() != NoteKind::Deletion {
            return;
        }

        for id in note.tag_values("e") {
            if let Ok(id) = NoteId::from_hex(id) {
                self.ids.insert(id, note.pubkey);
            }
        }

        let author = note.pubkey.hex();
        for address in note.tag_values("a") {
            // an author can only delete their own addressable notes
            if address.split(':').nth(1) != Some(author.as_str()) {
                continue;
            }
            let newest = self.addresses.entry(address.to_owned()).or_insert(0);
            *newest = (*newest).max(note.created_at);
        }
    }

    pub fn is_deleted(&self, note: &Note) -> bool {
        if self.ids.get(&note.id) == Some(&note.pubkey) {
            return true;
        }

        if self.addresses.is_empty() {
            return false;
        }

        let Some(d) = note.d_tag() else {
            return false;
        };
        let address = format!("{}:{}:{}", note.kind, note.pubkey.hex(), d);
        self.addresses
            .get(&address)
            .is_some_and(|deleted_at| note.created_at <= *deleted_at)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.addresses.is_empty()
    }
}
