use enostr::{Note, NoteId, NoteKind, Pubkey};
use std::collections::BTreeSet;

#[derive(Clone, Default)]
pub struct Muted {
    pub pubkeys: BTreeSet<Pubkey>,
    /// lower-cased, without the leading `#`
    pub hashtags: BTreeSet<String>,
    pub threads: BTreeSet<NoteId>,
}

impl std::fmt::Debug for Muted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muted")
            .field(
                "pubkeys",
                &self.pubkeys.iter().map(|pk| hex::encode(pk.bytes())).collect::<Vec<_>>(),
            )
            .field("hashtags", &self.hashtags)
            .field(
                "threads",
                &self.threads.iter().map(|id| hex::encode(id.bytes())).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Muted {
    /// Read a kind 10000 mute list. Anything else yields an empty set.
    pub fn from_mute_list(note: &Note) -> Self {
        let mut muted = Muted::default();
        if note.note_kind() != NoteKind::MuteList {
            return muted;
        }

        muted.pubkeys = note.referenced_pubkeys().collect();
        muted.hashtags = note.hashtags().collect();
        muted.threads = note
            .tag_values("e")
            .filter_map(|id| NoteId::from_hex(id).ok())
            .collect();
        muted
    }

    pub fn is_empty(&self) -> bool {
        self.pubkeys.is_empty() && self.hashtags.is_empty() && self.threads.is_empty()
    }

    /// Directly muted: by author, hashtag or thread
    pub fn is_muted(&self, note: &Note) -> bool {
        if self.pubkeys.contains(&note.pubkey) {
            return true;
        }

        if !self.hashtags.is_empty() && note.hashtags().any(|t| self.hashtags.contains(&t)) {
            return true;
        }

        if !self.threads.is_empty() {
            let thread = note.thread_root().unwrap_or(note.id);
            if self.threads.contains(&thread) {
                return true;
            }
        }

        false
    }

    /// Does the note tag any muted pubkey?
    pub fn mentions_any(&self, note: &Note) -> bool {
        if self.pubkeys.is_empty() {
            return false;
        }

        note.referenced_pubkeys().any(|pk| self.pubkeys.contains(&pk))
    }
}
