use std::fmt;

use crate::{NoteId, Pubkey};

/// Event kinds the client knows by name. Anything else lands in
/// [`NoteKind::Other`] and is classified purely by its numeric range.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum NoteKind {
    Metadata,
    Text,
    Contacts,
    Deletion,
    Repost,
    Reaction,
    GenericRepost,
    Comment,
    MuteList,
    RelayList,
    LongForm,
    FollowSet,
    Other(u64),
}

/// How relays (and we) treat multiple versions of the same logical item
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Replaceability {
    /// every event is its own item
    Regular,
    /// only the newest event per (kind, author) matters
    Replaceable,
    /// not stored by relays, deduplicated by id like regular events
    Ephemeral,
    /// only the newest event per (kind, author, d-tag) matters
    Addressable,
}

impl NoteKind {
    pub fn from_u64(kind: u64) -> Self {
        match kind {
            0 => NoteKind::Metadata,
            1 => NoteKind::Text,
            3 => NoteKind::Contacts,
            5 => NoteKind::Deletion,
            6 => NoteKind::Repost,
            7 => NoteKind::Reaction,
            16 => NoteKind::GenericRepost,
            1111 => NoteKind::Comment,
            10000 => NoteKind::MuteList,
            10002 => NoteKind::RelayList,
            30023 => NoteKind::LongForm,
            30000 => NoteKind::FollowSet,
            other => NoteKind::Other(other),
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self {
            NoteKind::Metadata => 0,
            NoteKind::Text => 1,
            NoteKind::Contacts => 3,
            NoteKind::Deletion => 5,
            NoteKind::Repost => 6,
            NoteKind::Reaction => 7,
            NoteKind::GenericRepost => 16,
            NoteKind::Comment => 1111,
            NoteKind::MuteList => 10000,
            NoteKind::RelayList => 10002,
            NoteKind::LongForm => 30023,
            NoteKind::FollowSet => 30000,
            NoteKind::Other(kind) => *kind,
        }
    }

    pub fn replaceability(&self) -> Replaceability {
        match self {
            NoteKind::Metadata | NoteKind::Contacts | NoteKind::MuteList | NoteKind::RelayList => {
                Replaceability::Replaceable
            }
            NoteKind::LongForm | NoteKind::FollowSet => Replaceability::Addressable,
            NoteKind::Text
            | NoteKind::Deletion
            | NoteKind::Repost
            | NoteKind::Reaction
            | NoteKind::GenericRepost
            | NoteKind::Comment => Replaceability::Regular,
            NoteKind::Other(kind) => match kind {
                10_000..=19_999 => Replaceability::Replaceable,
                20_000..=29_999 => Replaceability::Ephemeral,
                30_000..=39_999 => Replaceability::Addressable,
                _ => Replaceability::Regular,
            },
        }
    }
}

impl From<u64> for NoteKind {
    fn from(kind: u64) -> Self {
        NoteKind::from_u64(kind)
    }
}

/// The identity used to decide whether two events are the same logical item.
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum DedupKey {
    Id(NoteId),
    Replaceable {
        kind: u64,
        pubkey: Pubkey,
    },
    Addressable {
        kind: u64,
        pubkey: Pubkey,
        d: String,
    },
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupKey::Id(id) => write!(f, "Id({id:?})"),
            DedupKey::Replaceable { kind, pubkey } => write!(f, "{kind}:{pubkey}"),
            DedupKey::Addressable { kind, pubkey, d } => write!(f, "{kind}:{pubkey}:{d}"),
        }
    }
}
