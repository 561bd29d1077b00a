use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use enostr::{Note, Pubkey};
use hashbrown::HashSet;
use tracing::{debug, trace};

use crate::visibility::materialize;
use crate::{Admission, Deletions, NoteStore, VisibilityContext};

mod pending;

pub use pending::{classify, Disposition, PendingBuffer};

static NEXT_TIMELINE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle on one aggregation session
#[derive(Debug, Hash, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimelineKey(u64);

impl TimelineKey {
    pub fn new(id: u64) -> Self {
        TimelineKey(id)
    }

    /// A key no other timeline in this process has used
    pub fn next() -> Self {
        TimelineKey(NEXT_TIMELINE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimelineKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TimelineKey({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MergeKind {
    /// everything landed after the existing notes
    Appended,
    /// some incoming notes went between existing ones
    Spliced,
}

/// Merge two lists that are each already ordered by `goes_first`. Existing
/// entries win ties.
pub fn merge_sorted_by<T: Clone>(
    existing: &[T],
    incoming: &[T],
    goes_first: impl Fn(&T, &T) -> bool,
) -> (Vec<T>, MergeKind) {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut i = 0;
    let mut j = 0;
    let mut result = MergeKind::Appended;

    while i < existing.len() && j < incoming.len() {
        if goes_first(&incoming[j], &existing[i]) {
            // an incoming note ahead of an existing one is a splice
            result = MergeKind::Spliced;
            merged.push(incoming[j].clone());
            j += 1;
        } else {
            merged.push(existing[i].clone());
            i += 1;
        }
    }

    merged.extend_from_slice(&existing[i..]);
    merged.extend_from_slice(&incoming[j..]);

    (merged, result)
}

fn newer(a: &Arc<Note>, b: &Arc<Note>) -> bool {
    a.created_at > b.created_at
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Placement {
    Top,
    Bottom,
}

/// The state of one timeline: the canonical store, the ordered main view
/// and the notes waiting to be revealed. Pure state; the engine serializes
/// every mutation.
#[derive(Debug)]
pub struct Timeline {
    key: TimelineKey,
    store: NoteStore,
    /// exactly the store's notes, in display order
    notes: Vec<Arc<Note>>,
    pending: PendingBuffer,
    deletions: Deletions,
    need_sort: bool,
    has_more: bool,
    settled: bool,
    closed: bool,
}

impl Timeline {
    pub fn new(key: TimelineKey, need_sort: bool) -> Self {
        Self {
            key,
            store: NoteStore::new(),
            notes: vec![],
            pending: PendingBuffer::new(),
            deletions: Deletions::new(),
            need_sort,
            has_more: true,
            settled: false,
            closed: false,
        }
    }

    pub fn key(&self) -> TimelineKey {
        self.key
    }

    /// Replace the main view wholesale with a subscription snapshot
    #[profiling::function]
    pub fn on_events(&mut self, snapshot: &[Arc<Note>], all_settled: bool) {
        if self.closed {
            return;
        }

        self.store.clear();
        self.deletions = Deletions::new();
        for note in snapshot {
            self.store.admit(note.clone());
        }

        // the same note can show up twice in a sloppy snapshot
        let mut seen = HashSet::new();
        let mut notes: Vec<Arc<Note>> = snapshot
            .iter()
            .filter(|note| self.store.is_resident(note) && seen.insert(note.id))
            .cloned()
            .collect();
        if self.need_sort {
            notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }

        for note in &notes {
            self.deletions.insert(note);
        }
        self.notes = notes;

        if all_settled {
            self.settled = true;
            if self.notes.is_empty() {
                self.has_more = false;
            }
        }

        trace!(
            "{}: snapshot of {} notes, settled {}",
            self.key,
            self.notes.len(),
            all_settled
        );
    }

    /// Route a note that arrived after settlement
    pub fn on_new(&mut self, note: Arc<Note>, local: Option<&Pubkey>) -> Disposition {
        if self.closed {
            return Disposition::Discard;
        }

        match classify(&self.store, &note, local) {
            Disposition::Discard => Disposition::Discard,
            Disposition::Admit => {
                self.insert_main(note, Placement::Top);
                Disposition::Admit
            }
            Disposition::Buffer => {
                if self.pending.insert(note) {
                    Disposition::Buffer
                } else {
                    Disposition::Discard
                }
            }
        }
    }

    /// Reveal every pending note. Returns how many made it into the main
    /// view.
    pub fn show_new(&mut self) -> usize {
        let pending = self.pending.take();
        // oldest first so unsorted timelines end up newest on top
        pending
            .into_iter()
            .rev()
            .filter(|note| self.insert_main(note.clone(), Placement::Top))
            .count()
    }

    /// Add a page of older notes. Only notes whose dedup key is new are
    /// returned; newer versions of resident notes are updated in place. An
    /// empty result means there is nothing older to fetch.
    #[profiling::function]
    pub fn admit_page(&mut self, page: Vec<Arc<Note>>, until: u64) -> Vec<Arc<Note>> {
        if self.closed {
            return vec![];
        }

        let mut fresh: Vec<Arc<Note>> = vec![];
        for note in page {
            if note.created_at > until {
                debug!(
                    "{}: relay ignored until={}, dropping {:?}",
                    self.key, until, note.id
                );
                continue;
            }

            match self.store.resident(&note).cloned() {
                None => {
                    self.store.admit(note.clone());
                    self.deletions.insert(&note);
                    fresh.push(note);
                }
                Some(resident) if note.supersedes(&resident) => {
                    if let Some(slot) = fresh.iter_mut().find(|n| n.id == resident.id) {
                        self.store.admit(note.clone());
                        self.deletions.insert(&note);
                        *slot = note;
                    } else {
                        self.insert_main(note, Placement::Bottom);
                    }
                }
                Some(_) => {}
            }
        }

        if fresh.is_empty() {
            debug!("{}: no more notes before {}", self.key, until);
            self.has_more = false;
            return fresh;
        }

        if self.need_sort {
            fresh.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let (merged, kind) = merge_sorted_by(&self.notes, &fresh, newer);
            if kind == MergeKind::Spliced {
                debug!("{}: page spliced into the main view", self.key);
            }
            self.notes = merged;
        } else {
            self.notes.extend(fresh.iter().cloned());
        }

        fresh
    }

    /// Admit into the store and place into the main view. Returns false if
    /// the store already had an equal or newer version.
    fn insert_main(&mut self, note: Arc<Note>, placement: Placement) -> bool {
        let replaced_at = match self.store.admit(note.clone()) {
            Admission::Rejected => return false,
            Admission::Inserted => None,
            Admission::Replaced(old) => {
                let pos = self.notes.iter().position(|n| n.id == old.id);
                if let Some(pos) = pos {
                    self.notes.remove(pos);
                }
                pos
            }
        };

        self.deletions.insert(&note);

        let pos = if self.need_sort {
            self.notes
                .iter()
                .position(|n| n.created_at < note.created_at)
                .unwrap_or(self.notes.len())
        } else {
            match (replaced_at, placement) {
                (Some(pos), _) => pos,
                (None, Placement::Top) => 0,
                (None, Placement::Bottom) => self.notes.len(),
            }
        };
        self.notes.insert(pos, note);
        true
    }

    /// Smallest `created_at` in the main view
    pub fn cursor(&self) -> Option<u64> {
        self.notes.iter().map(|n| n.created_at).min()
    }

    /// The `until` for the next page: one second below the cursor
    pub fn next_until(&self) -> Option<u64> {
        self.cursor().map(|cursor| cursor.saturating_sub(1))
    }

    pub fn notes(&self) -> &[Arc<Note>] {
        &self.notes
    }

    pub fn pending(&self) -> &[Arc<Note>] {
        self.pending.notes()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn store(&self) -> &NoteStore {
        &self.store
    }

    /// Tombstones found among the resident notes
    pub fn deletions(&self) -> &Deletions {
        &self.deletions
    }

    pub fn visible_notes(&self, ctx: &VisibilityContext<'_>) -> Vec<Arc<Note>> {
        materialize(&self.notes, ctx)
    }

    pub fn visible_pending(&self, ctx: &VisibilityContext<'_>) -> Vec<Arc<Note>> {
        materialize(self.pending.notes(), ctx)
    }

    pub fn need_sort(&self) -> bool {
        self.need_sort
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop accepting mutations
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}
