//! Change tracker for the SQLite persistence context.
//!
//! # Invariants
//! - At most one entry exists per `(table, key)` pair; the index always
//!   agrees with the entries.
//! - Entries awaiting a generated key carry `key = None` and are never
//!   matched by key lookups.
//! - While a journal is open, the first mutation of an entry records its
//!   prior form; rolling the journal back restores exactly those forms.
//! - `reject()` is never journaled, so a rejected edit stays rejected after
//!   a rollback.

use crate::model::entity::EntityState;
use rusqlite::types::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

/// Handle to one tracked entry, stable for the entry lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static mapping shared by every entry of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableMap {
    pub table: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub(crate) struct TrackedEntry {
    pub map: TableMap,
    pub key: Option<Value>,
    pub state: EntityState,
    pub current: Vec<Value>,
    pub original: Vec<Value>,
}

impl TrackedEntry {
    fn slot(&self) -> Option<(&'static str, IndexKey)> {
        self.key
            .as_ref()
            .map(|key| (self.map.table, IndexKey::from(key)))
    }

    fn revert(&mut self) {
        self.current = self.original.clone();
        self.state = EntityState::Unchanged;
    }
}

/// Hashable form of a key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Null,
    Integer(i64),
    Real(u64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Integer(value) => Self::Integer(*value),
            Value::Real(value) => Self::Real(value.to_bits()),
            Value::Text(value) => Self::Text(value.clone()),
            Value::Blob(bytes) => Self::Blob(bytes.clone()),
        }
    }
}

type Journal = BTreeMap<EntryId, Option<TrackedEntry>>;

#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    entries: BTreeMap<EntryId, TrackedEntry>,
    index: HashMap<(&'static str, IndexKey), EntryId>,
    journal: Option<Journal>,
    next_id: u64,
}

impl ChangeTracker {
    pub fn find(&self, table: &'static str, key: &Value) -> Option<EntryId> {
        self.index.get(&(table, IndexKey::from(key))).copied()
    }

    pub fn get(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    /// Tracks a new entry. An older entry holding the same key is evicted.
    pub fn insert(&mut self, entry: TrackedEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.remember(id);
        self.entries.insert(id, entry);
        self.link(id);
        id
    }

    pub fn set_current(&mut self, id: EntryId, values: Vec<Value>) {
        self.remember(id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.current = values;
        }
    }

    /// Assigns `state`; `Unchanged` also makes the current values original.
    pub fn set_state(&mut self, id: EntryId, state: EntityState) {
        self.remember(id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = state;
            if state == EntityState::Unchanged {
                entry.original = entry.current.clone();
            }
        }
    }

    pub fn remove(&mut self, id: EntryId) -> Option<TrackedEntry> {
        self.remember(id);
        self.unlink(id);
        self.entries.remove(&id)
    }

    /// Promotes unchanged entries whose values drifted to `Modified`.
    pub fn detect_changes(&mut self) -> usize {
        let drifted = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.state == EntityState::Unchanged && entry.current != entry.original
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in &drifted {
            self.remember(*id);
            if let Some(entry) = self.entries.get_mut(id) {
                entry.state = EntityState::Modified;
            }
        }
        drifted.len()
    }

    /// Entries with flush work, in tracking order.
    pub fn pending(&self) -> impl Iterator<Item = (EntryId, &TrackedEntry)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state.is_pending())
            .map(|(id, entry)| (*id, entry))
    }

    /// Applies a successful flush: inserted and updated rows become the new
    /// originals, deleted rows leave the tracker.
    pub fn accept_changes(&mut self, generated_keys: Vec<(EntryId, Value)>) {
        for (id, key) in generated_keys {
            self.remember(id);
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.key = Some(key);
            }
            self.link(id);
        }

        let flushed = self
            .pending()
            .map(|(id, entry)| (id, entry.state))
            .collect::<Vec<_>>();
        for (id, state) in flushed {
            if state == EntityState::Deleted {
                self.remove(id);
            } else {
                self.set_state(id, EntityState::Unchanged);
            }
        }
    }

    /// Drops the pending work of an entry whose write the store refused.
    /// An insert is forgotten; an update or delete falls back to the
    /// original values.
    pub fn reject(&mut self, id: EntryId) {
        let Some(state) = self.entries.get(&id).map(|entry| entry.state) else {
            return;
        };
        if state == EntityState::Added {
            self.unlink(id);
            self.entries.remove(&id);
        } else if let Some(entry) = self.entries.get_mut(&id) {
            entry.revert();
        }

        if let Some(prior) = self.journal.as_mut().and_then(|journal| journal.get_mut(&id)) {
            let prior_added =
                matches!(prior, Some(entry) if entry.state == EntityState::Added);
            if prior_added {
                *prior = None;
            } else if let Some(entry) = prior.as_mut() {
                entry.revert();
            }
        }
    }

    pub fn purge_detached(&mut self) {
        let detached = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == EntityState::Detached)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in detached {
            self.remove(id);
        }
    }

    /// Starts recording prior entry forms for a transaction.
    pub fn begin_journal(&mut self) {
        self.journal = Some(Journal::new());
    }

    /// Keeps every change made since `begin_journal()`.
    pub fn commit_journal(&mut self) {
        self.journal = None;
    }

    /// Restores every entry touched since `begin_journal()`.
    pub fn rollback_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for id in journal.keys() {
            self.unlink(*id);
            self.entries.remove(id);
        }
        for (id, prior) in journal {
            if let Some(entry) = prior {
                self.entries.insert(id, entry);
                self.link(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn remember(&mut self, id: EntryId) {
        if let Some(journal) = self.journal.as_mut() {
            let entries = &self.entries;
            journal
                .entry(id)
                .or_insert_with(|| entries.get(&id).cloned());
        }
    }

    fn link(&mut self, id: EntryId) {
        let Some(slot) = self.entries.get(&id).and_then(TrackedEntry::slot) else {
            return;
        };
        if let Some(stale) = self.index.insert(slot, id) {
            if stale != id {
                self.remember(stale);
                self.entries.remove(&stale);
            }
        }
    }

    fn unlink(&mut self, id: EntryId) {
        let Some(slot) = self.entries.get(&id).and_then(TrackedEntry::slot) else {
            return;
        };
        if self.index.get(&slot) == Some(&id) {
            self.index.remove(&slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeTracker, TableMap, TrackedEntry};
    use crate::model::entity::EntityState;
    use rusqlite::types::Value;

    const MAP: TableMap = TableMap {
        table: "currencies",
        key_column: "id",
        columns: &["code"],
    };

    fn entry(key: Option<i64>, state: EntityState, code: &str) -> TrackedEntry {
        let values = vec![Value::Text(code.to_string())];
        TrackedEntry {
            map: MAP,
            key: key.map(Value::Integer),
            state,
            current: values.clone(),
            original: values,
        }
    }

    fn code(tracker: &ChangeTracker, id: super::EntryId) -> Value {
        tracker.get(id).unwrap().current[0].clone()
    }

    #[test]
    fn find_matches_table_and_key_only() {
        let mut tracker = ChangeTracker::default();
        let id = tracker.insert(entry(Some(7), EntityState::Unchanged, "EUR"));
        tracker.insert(entry(None, EntityState::Added, "USD"));

        assert_eq!(tracker.find("currencies", &Value::Integer(7)), Some(id));
        assert_eq!(tracker.find("countries", &Value::Integer(7)), None);
        assert_eq!(tracker.find("currencies", &Value::Integer(8)), None);
    }

    #[test]
    fn detect_changes_promotes_drifted_unchanged_entries() {
        let mut tracker = ChangeTracker::default();
        let drifted = tracker.insert(entry(Some(1), EntityState::Unchanged, "EUR"));
        let clean = tracker.insert(entry(Some(2), EntityState::Unchanged, "USD"));
        tracker.set_current(drifted, vec![Value::Text("GBP".to_string())]);

        assert_eq!(tracker.detect_changes(), 1);
        assert_eq!(tracker.get(drifted).unwrap().state, EntityState::Modified);
        assert_eq!(tracker.get(clean).unwrap().state, EntityState::Unchanged);
    }

    #[test]
    fn accept_changes_resets_originals_and_drops_deleted() {
        let mut tracker = ChangeTracker::default();
        let added = tracker.insert(entry(None, EntityState::Added, "EUR"));
        let deleted = tracker.insert(entry(Some(5), EntityState::Deleted, "USD"));

        tracker.accept_changes(vec![(added, Value::Integer(11))]);

        let accepted = tracker.get(added).unwrap();
        assert_eq!(accepted.state, EntityState::Unchanged);
        assert_eq!(accepted.key, Some(Value::Integer(11)));
        assert!(tracker.get(deleted).is_none());
        assert_eq!(tracker.find("currencies", &Value::Integer(11)), Some(added));
        assert_eq!(tracker.find("currencies", &Value::Integer(5)), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn generated_key_evicts_a_stale_entry_with_the_same_key() {
        let mut tracker = ChangeTracker::default();
        let stale = tracker.insert(entry(Some(1), EntityState::Unchanged, "EUR"));
        let added = tracker.insert(entry(None, EntityState::Added, "GBP"));

        tracker.accept_changes(vec![(added, Value::Integer(1))]);

        assert!(tracker.get(stale).is_none());
        assert_eq!(tracker.find("currencies", &Value::Integer(1)), Some(added));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn rollback_restores_entries_touched_since_the_journal_opened() {
        let mut tracker = ChangeTracker::default();
        let euro = tracker.insert(entry(Some(1), EntityState::Unchanged, "EUR"));

        tracker.begin_journal();
        tracker.set_current(euro, vec![Value::Text("X".to_string())]);
        tracker.set_state(euro, EntityState::Modified);
        let added = tracker.insert(entry(None, EntityState::Added, "GBP"));
        tracker.accept_changes(vec![(added, Value::Integer(2))]);
        tracker.rollback_journal();

        let restored = tracker.get(euro).unwrap();
        assert_eq!(restored.state, EntityState::Unchanged);
        assert_eq!(code(&tracker, euro), Value::Text("EUR".to_string()));
        assert!(tracker.get(added).is_none());
        assert_eq!(tracker.find("currencies", &Value::Integer(2)), None);
        assert_eq!(tracker.find("currencies", &Value::Integer(1)), Some(euro));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn commit_keeps_changes_made_under_the_journal() {
        let mut tracker = ChangeTracker::default();
        tracker.begin_journal();
        let added = tracker.insert(entry(None, EntityState::Added, "GBP"));
        tracker.accept_changes(vec![(added, Value::Integer(3))]);
        tracker.commit_journal();
        tracker.rollback_journal();

        assert_eq!(tracker.find("currencies", &Value::Integer(3)), Some(added));
    }

    #[test]
    fn rejected_edit_survives_a_rollback() {
        let mut tracker = ChangeTracker::default();
        let usd = tracker.insert(entry(Some(2), EntityState::Unchanged, "USD"));
        tracker.set_current(usd, vec![Value::Text("EUR".to_string())]);
        tracker.detect_changes();

        tracker.begin_journal();
        tracker.set_state(usd, EntityState::Modified);
        tracker.reject(usd);
        tracker.rollback_journal();

        let rejected = tracker.get(usd).unwrap();
        assert_eq!(rejected.state, EntityState::Unchanged);
        assert_eq!(code(&tracker, usd), Value::Text("USD".to_string()));
        assert_eq!(tracker.pending().count(), 0);
    }

    #[test]
    fn rejected_insert_is_forgotten() {
        let mut tracker = ChangeTracker::default();
        let added = tracker.insert(entry(Some(9), EntityState::Added, "EUR"));

        tracker.reject(added);

        assert!(tracker.get(added).is_none());
        assert_eq!(tracker.find("currencies", &Value::Integer(9)), None);
    }
}
