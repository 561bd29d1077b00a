use std::sync::Arc;

use enostr::{Note, Pubkey};

use crate::NoteStore;

/// Where a note that arrives after settlement goes
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Disposition {
    /// an equal or newer version is already showing
    Discard,
    /// our own note: straight into the main view
    Admit,
    /// held back until the user asks for new notes
    Buffer,
}

pub fn classify(main: &NoteStore, note: &Note, local: Option<&Pubkey>) -> Disposition {
    if !main.accepts(note) {
        return Disposition::Discard;
    }

    if local == Some(&note.pubkey) {
        Disposition::Admit
    } else {
        Disposition::Buffer
    }
}

/// Notes that arrived after settlement and haven't been revealed yet,
/// newest first.
#[derive(Debug, Default, Clone)]
pub struct PendingBuffer {
    notes: Vec<Arc<Note>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when an equal or newer version is already buffered. An
    /// older buffered version is replaced.
    pub fn insert(&mut self, note: Arc<Note>) -> bool {
        let key = note.dedup_key();
        if let Some(pos) = self.notes.iter().position(|n| n.dedup_key() == key) {
            if !note.supersedes(&self.notes[pos]) {
                return false;
            }
            self.notes.remove(pos);
        }

        // after any equal timestamps, so ties keep arrival order
        let pos = self
            .notes
            .iter()
            .position(|n| n.created_at < note.created_at)
            .unwrap_or(self.notes.len());
        self.notes.insert(pos, note);
        true
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn notes(&self) -> &[Arc<Note>] {
        &self.notes
    }

    pub fn take(&mut self) -> Vec<Arc<Note>> {
        std::mem::take(&mut self.notes)
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}
