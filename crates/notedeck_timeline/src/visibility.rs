use std::sync::Arc;

use enostr::{DedupKey, Note, NoteId, Pubkey};
use hashbrown::HashSet;

use crate::{Deletions, Muted, TrustAll, TrustPredicate};

static TRUST_ALL: TrustAll = TrustAll;

/// Everything [`visible`] looks at. Borrowing the same context for a whole
/// render gives the same verdict for the same note every time.
#[derive(Clone, Copy)]
pub struct VisibilityContext<'a> {
    pub deletions: &'a Deletions,
    pub hide_replies: bool,
    pub trust: &'a dyn TrustPredicate,
    pub muted: &'a Muted,
    pub hide_mentions_of_muted: bool,
}

impl<'a> VisibilityContext<'a> {
    /// Show replies, trust everyone, hide only direct mutes
    pub fn new(deletions: &'a Deletions, muted: &'a Muted) -> Self {
        Self {
            deletions,
            hide_replies: false,
            trust: &TRUST_ALL,
            muted,
            hide_mentions_of_muted: false,
        }
    }

    pub fn hide_replies(mut self, hide: bool) -> Self {
        self.hide_replies = hide;
        self
    }

    pub fn trust(mut self, trust: &'a dyn TrustPredicate) -> Self {
        self.trust = trust;
        self
    }

    pub fn hide_mentions_of_muted(mut self, hide: bool) -> Self {
        self.hide_mentions_of_muted = hide;
        self
    }
}

/// Cheapest and most decisive checks first. Never looks at anything but
/// the note and the context.
pub fn visible(note: &Note, ctx: &VisibilityContext<'_>) -> bool {
    if ctx.deletions.is_deleted(note) {
        return false;
    }

    if ctx.hide_replies && note.is_reply() {
        return false;
    }

    if !ctx.trust.is_trusted(&note.pubkey) {
        return false;
    }

    if ctx.muted.is_muted(note) {
        return false;
    }

    if ctx.hide_mentions_of_muted && ctx.muted.mentions_any(note) {
        return false;
    }

    true
}

/// What a rendered row is keyed on. Replaceable and addressable notes
/// collapse to their coordinate, everything else to its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisplayKey {
    Id(NoteId),
    Address { kind: u64, pubkey: Pubkey, d: String },
}

impl DisplayKey {
    pub fn of(note: &Note) -> Self {
        match note.dedup_key() {
            DedupKey::Id(id) => DisplayKey::Id(id),
            DedupKey::Replaceable { kind, pubkey } => DisplayKey::Address {
                kind,
                pubkey,
                d: String::new(),
            },
            DedupKey::Addressable { kind, pubkey, d } => DisplayKey::Address { kind, pubkey, d },
        }
    }
}

/// Filter `notes` for display, keeping the first note per [`DisplayKey`]
#[profiling::function]
pub(crate) fn materialize<'n>(
    notes: impl IntoIterator<Item = &'n Arc<Note>>,
    ctx: &VisibilityContext<'_>,
) -> Vec<Arc<Note>> {
    let mut seen: HashSet<DisplayKey> = HashSet::new();
    notes
        .into_iter()
        .filter(|note| visible(note, ctx))
        .filter(|note| seen.insert(DisplayKey::of(note)))
        .cloned()
        .collect()
}
