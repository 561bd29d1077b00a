use std::sync::Arc;

use enostr::{DedupKey, Note};
use hashbrown::HashMap;

/// What happened when a note was offered to a [`NoteStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// first note for its dedup key
    Inserted,
    /// superseded the returned, previously resident note
    Replaced(Arc<Note>),
    /// an equal or newer version is already resident
    Rejected,
}

/// The canonical set of notes for one timeline: at most one resident note
/// per [`DedupKey`], the newest one.
#[derive(Debug, Default, Clone)]
pub struct NoteStore {
    notes: HashMap<DedupKey, Arc<Note>>,
}

impl NoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DedupKey) -> Option<&Arc<Note>> {
        self.notes.get(key)
    }

    /// The resident note sharing `note`'s dedup key
    pub fn resident(&self, note: &Note) -> Option<&Arc<Note>> {
        self.notes.get(&note.dedup_key())
    }

    /// Whether `note` itself is the resident version of its key
    pub fn is_resident(&self, note: &Note) -> bool {
        self.resident(note).is_some_and(|r| r.id == note.id)
    }

    /// Would [`NoteStore::admit`] accept this note?
    pub fn accepts(&self, note: &Note) -> bool {
        self.resident(note)
            .map_or(true, |resident| note.supersedes(resident))
    }

    pub fn admit(&mut self, note: Arc<Note>) -> Admission {
        let key = note.dedup_key();
        match self.notes.get_mut(&key) {
            None => {
                self.notes.insert(key, note);
                Admission::Inserted
            }
            Some(resident) if note.supersedes(resident) => {
                Admission::Replaced(std::mem::replace(resident, note))
            }
            Some(_) => Admission::Rejected,
        }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Note>> {
        self.notes.values()
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enostr::test_utils::NoteBuilder;
    use pretty_assertions::assert_eq;

    fn profile(id: u8, created_at: u64) -> Arc<Note> {
        Arc::new(NoteBuilder::new(0, 1).id(id).created_at(created_at).build())
    }

    #[test]
    fn newest_replaceable_wins_in_either_order() {
        let newer = profile(1, 100);
        let older = profile(2, 50);

        for order in [[newer.clone(), older.clone()], [older.clone(), newer.clone()]] {
            let mut store = NoteStore::new();
            for note in order {
                store.admit(note);
            }

            assert_eq!(store.len(), 1);
            assert_eq!(store.resident(&older).map(|n| n.id), Some(newer.id));
        }
    }

    #[test]
    fn ties_converge_on_smaller_id() {
        let small = profile(3, 100);
        let big = profile(9, 100);

        let mut a = NoteStore::new();
        a.admit(small.clone());
        assert_eq!(a.admit(big.clone()), Admission::Rejected);

        let mut b = NoteStore::new();
        b.admit(big.clone());
        assert_eq!(b.admit(small.clone()), Admission::Replaced(big.clone()));

        assert!(a.is_resident(&small));
        assert!(b.is_resident(&small));
    }

    #[test]
    fn same_note_twice_is_rejected() {
        let mut store = NoteStore::new();
        let note = Arc::new(NoteBuilder::new(1, 1).build());

        assert_eq!(store.admit(note.clone()), Admission::Inserted);
        assert!(!store.accepts(&note));
        assert_eq!(store.admit(note), Admission::Rejected);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn addressable_notes_collapse_per_d_tag() {
        let mut store = NoteStore::new();
        let v1 = NoteBuilder::new(30023, 1).tag(&["d", "post"]).created_at(10).build();
        let v2 = NoteBuilder::new(30023, 1).tag(&["d", "post"]).created_at(20).build();
        let other = NoteBuilder::new(30023, 1).tag(&["d", "other"]).created_at(5).build();

        store.admit(Arc::new(v2.clone()));
        store.admit(Arc::new(v1.clone()));
        store.admit(Arc::new(other));

        assert_eq!(store.len(), 2);
        assert!(store.is_resident(&v2));
        assert!(!store.is_resident(&v1));
    }
}
