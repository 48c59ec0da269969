//! Persistence context: change tracking, flush and transaction scopes.
//!
//! # Responsibility
//! - Define the capability repositories consume (`PersistenceContext`).
//! - Provide the SQLite-backed implementation (`SqliteContext`).
//!
//! # Invariants
//! - One context wraps exactly one connection and is not shared between
//!   concurrent callers (all mutating calls take `&mut self`).
//! - Entity state only reaches the store through `save_changes()`.
//! - Predicates are never translated to SQL; reads return table snapshots
//!   or key-equality lookups.

use crate::db::DbError;
use crate::model::entity::{Entity, EntityState};
use rusqlite::types::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

mod sqlite;
mod tracker;
mod transaction;

pub use sqlite::SqliteContext;
pub use tracker::EntryId;
pub use transaction::{ScopeRole, ScopeTicket, TransactionMode, TransactionOptions};

pub type ContextResult<T> = Result<T, ContextError>;

/// Errors raised by the persistence context.
#[derive(Debug)]
pub enum ContextError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Update or delete did not find the row it was tracking.
    ConcurrencyConflict { table: &'static str, key: String },
    /// A joined scope was abandoned, so the owner rolled back.
    TransactionAborted,
    /// The owner completed after its deadline and rolled back.
    TransactionTimeout { elapsed: Duration, timeout: Duration },
    /// A scope was completed or abandoned out of LIFO order.
    ScopeOrder { expected_depth: u32, actual_depth: u32 },
    /// A scope was completed or abandoned with no transaction open.
    NoActiveScope,
    /// Entry handle does not belong to this context (or was detached).
    UnknownEntry(EntryId),
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::ConcurrencyConflict { table, key } => write!(
                f,
                "row `{key}` in `{table}` was not affected; it was removed or never stored"
            ),
            Self::TransactionAborted => {
                write!(f, "transaction aborted because a joined scope was abandoned")
            }
            Self::TransactionTimeout { elapsed, timeout } => write!(
                f,
                "transaction exceeded its timeout of {}ms after {}ms",
                timeout.as_millis(),
                elapsed.as_millis()
            ),
            Self::ScopeOrder {
                expected_depth,
                actual_depth,
            } => write!(
                f,
                "scope at depth {actual_depth} released while depth {expected_depth} is innermost"
            ),
            Self::NoActiveScope => write!(f, "no transaction scope is open"),
            Self::UnknownEntry(id) => write!(f, "entry {id} is not tracked by this context"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::ConcurrencyConflict { .. } => None,
            Self::TransactionAborted => None,
            Self::TransactionTimeout { .. } => None,
            Self::ScopeOrder { .. } => None,
            Self::NoActiveScope => None,
            Self::UnknownEntry(_) => None,
        }
    }
}

impl From<DbError> for ContextError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for ContextError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Whether a read registers its rows with the change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTracking {
    Tracked,
    /// Reflects persisted state only; the tracker is left untouched.
    NoTracking,
}

/// Change-tracking session consumed by repositories.
pub trait PersistenceContext {
    /// Reconciles unflushed edits of tracked entities. Returns the number of
    /// entries promoted to `Modified`.
    fn detect_changes(&mut self) -> usize;

    /// Finds the tracked entry for `entity` (refreshing its current values)
    /// or creates a `Detached` entry for it.
    fn entry<E: Entity>(&mut self, entity: &E) -> ContextResult<EntryId>;

    /// Registers `entity` for insertion.
    fn add<E: Entity>(&mut self, entity: &E) -> ContextResult<EntryId> {
        let id = self.entry(entity)?;
        self.set_state(id, EntityState::Added)?;
        Ok(id)
    }

    fn set_state(&mut self, entry: EntryId, state: EntityState) -> ContextResult<()>;

    /// Current state of an entry; `Detached` once it left the tracker.
    fn entry_state(&self, entry: EntryId) -> EntityState;

    /// Key of a tracked entry, including keys generated by the last flush.
    fn entry_key(&self, entry: EntryId) -> Option<Value>;

    /// Flushes every pending entry. Returns the number of affected rows.
    fn save_changes(&mut self) -> ContextResult<usize>;

    /// Reads every row of `E`'s table, ordered by key.
    fn query<E: Entity>(&mut self, tracking: QueryTracking) -> ContextResult<Vec<E>>;

    /// Reads the rows whose key column equals `key`. More than one row only
    /// comes back when the store does not enforce key uniqueness.
    fn query_by_key<E: Entity>(
        &mut self,
        key: &E::Key,
        tracking: QueryTracking,
    ) -> ContextResult<Vec<E>>;

    /// Joins the open transaction or starts a new one.
    fn begin_scope(&mut self, options: &TransactionOptions) -> ContextResult<ScopeTicket>;

    /// Leaves a joined scope, or commits when the ticket owns the transaction.
    fn complete_scope(&mut self, ticket: ScopeTicket) -> ContextResult<()>;

    /// Dooms a joined scope, or rolls back when the ticket owns the transaction.
    fn abandon_scope(&mut self, ticket: ScopeTicket) -> ContextResult<()>;
}
