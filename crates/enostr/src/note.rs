use crate::{DedupKey, Error, NoteKind, Pubkey, Replaceability};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NoteId([u8; 32]);

impl fmt::Debug for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

static HRP_NOTE: bech32::Hrp = bech32::Hrp::parse_unchecked("note");

impl NoteId {
    pub fn new(bytes: [u8; 32]) -> Self {
        NoteId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        Ok(NoteId(hex::decode(hex_str)?.as_slice().try_into()?))
    }

    pub fn to_bech(&self) -> Option<String> {
        bech32::encode::<bech32::Bech32>(HRP_NOTE, &self.0).ok()
    }
}

/// A signed nostr event as delivered by a relay. Notes are never mutated
/// after decoding; the engine passes them around behind an `Arc`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Note {
    /// 32-bytes sha256 of the the serialized event data
    pub id: NoteId,
    /// 32-bytes hex-encoded public key of the event creator
    pub pubkey: Pubkey,
    /// unix timestamp in seconds
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// 64-bytes signature of the sha256 hash of the serialized event data, which is the same as the "id" field
    pub sig: String,
}

impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.0.hash(state);
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Note {}

impl Note {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }

    /// Decode the note out of a full `["EVENT", <subid>, <note>]` relay
    /// message.
    pub fn from_event_message(msg: &str) -> Result<Self, Error> {
        let (_tag, _subid, note): (String, String, Note) = serde_json::from_str(msg)?;
        Ok(note)
    }

    pub fn note_kind(&self) -> NoteKind {
        NoteKind::from_u64(self.kind)
    }

    /// Derive the deduplication identity of this note. Replaceable kinds
    /// collapse per author, addressable kinds per author and `d` tag, and
    /// everything else is identified by its id.
    pub fn dedup_key(&self) -> DedupKey {
        match self.note_kind().replaceability() {
            Replaceability::Replaceable => DedupKey::Replaceable {
                kind: self.kind,
                pubkey: self.pubkey,
            },
            Replaceability::Addressable => DedupKey::Addressable {
                kind: self.kind,
                pubkey: self.pubkey,
                d: self.d_tag().unwrap_or_default().to_owned(),
            },
            Replaceability::Regular | Replaceability::Ephemeral => DedupKey::Id(self.id),
        }
    }

    /// Does this note win against `other` when both share a dedup key?
    /// Newer `created_at` wins, and on an exact tie the smaller id wins so
    /// that independent observers converge on the same version.
    pub fn supersedes(&self, other: &Note) -> bool {
        match self.created_at.cmp(&other.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id < other.id,
        }
    }

    /// Values at index 1 of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| {
            if tag.first().map(String::as_str) == Some(name) {
                tag.get(1).map(String::as_str)
            } else {
                None
            }
        })
    }

    pub fn d_tag(&self) -> Option<&str> {
        self.tag_values("d").next()
    }

    /// Pubkeys referenced through `p` tags. Malformed entries are skipped.
    pub fn referenced_pubkeys(&self) -> impl Iterator<Item = Pubkey> + '_ {
        self.tag_values("p")
            .filter_map(|hex| Pubkey::from_hex(hex).ok())
    }

    /// Lower-cased `t` tags
    pub fn hashtags(&self) -> impl Iterator<Item = String> + '_ {
        self.tag_values("t").map(str::to_lowercase)
    }

    /// The thread root this note belongs to, if it is part of a thread
    pub fn thread_root(&self) -> Option<NoteId> {
        let marked_root = self.tags.iter().find_map(|tag| {
            let is_root = tag.first().map(String::as_str) == Some("e")
                && tag.get(3).map(String::as_str) == Some("root");
            if is_root {
                tag.get(1)
            } else {
                None
            }
        });

        let root = marked_root.or_else(|| {
            // deprecated positional scheme: the first e tag is the root
            self.tags
                .iter()
                .find(|tag| tag.first().map(String::as_str) == Some("e") && tag.len() < 4)
                .and_then(|tag| tag.get(1))
        })?;

        NoteId::from_hex(root).ok()
    }

    /// Whether this is a reply to another note. Comments are always
    /// replies; text notes are replies when they carry an `e` tag that is
    /// not a mention.
    pub fn is_reply(&self) -> bool {
        match self.note_kind() {
            NoteKind::Comment => true,
            NoteKind::Text => self.tags.iter().any(|tag| {
                tag.first().map(String::as_str) == Some("e")
                    && tag.get(3).map(String::as_str) != Some("mention")
            }),
            _ => false,
        }
    }
}

impl std::str::FromStr for Note {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Note::from_json(s)
    }
}

impl Serialize for NoteId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NoteId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
