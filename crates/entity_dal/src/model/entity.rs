//! Entity mapping contracts.
//!
//! # Responsibility
//! - Describe how a Rust record maps onto one relational table.
//! - Describe the glossary capability set (key, code, active flag).
//! - Define the persistence intent attached to an entity before commit.
//!
//! # Invariants
//! - `to_values()` is ordered exactly like `COLUMNS`.
//! - `COLUMNS` never contains `KEY_COLUMN`.
//! - A generated key is only requested when `KEY_GENERATED` is set and the
//!   entity still carries `Key::default()`.

use rusqlite::types::{FromSql, ToSql, Value};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Intent attached to a tracked entity before the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Not tracked by the context.
    Detached,
    /// Tracked and identical to the persisted row.
    Unchanged,
    /// Will be inserted on the next flush.
    Added,
    /// Will be updated on the next flush.
    Modified,
    /// Will be deleted on the next flush.
    Deleted,
}

impl EntityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Unchanged => "unchanged",
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }

    /// Returns whether a flush has work to do for this state.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }
}

/// A persistable record mapped onto one table with a single key column.
pub trait Entity: Sized {
    type Key: Clone + PartialEq + Debug + Default + ToSql + FromSql;

    const TABLE: &'static str;
    const KEY_COLUMN: &'static str;
    /// Non-key columns, in the order produced by `to_values()`.
    const COLUMNS: &'static [&'static str];
    /// Key is assigned by the store (`INTEGER PRIMARY KEY` rowid alias).
    const KEY_GENERATED: bool = false;

    fn key(&self) -> Self::Key;
    fn set_key(&mut self, key: Self::Key);
    fn to_values(&self) -> Vec<Value>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Entity with a business code and an active flag.
pub trait Glossary: Entity {
    fn code(&self) -> &str;
    fn is_active(&self) -> bool;
    fn set_active(&mut self, active: bool);
}

/// Converts a key into an owned SQL value.
pub fn key_value<K: ToSql>(key: &K) -> rusqlite::Result<Value> {
    Ok(match key.to_sql()? {
        rusqlite::types::ToSqlOutput::Borrowed(value) => value.into(),
        rusqlite::types::ToSqlOutput::Owned(value) => value,
        other => {
            return Err(rusqlite::Error::ToSqlConversionFailure(
                format!("unsupported key representation: {other:?}").into(),
            ))
        }
    })
}

/// Converts an owned SQL value back into a typed key.
pub fn key_from_value<K: FromSql>(value: &Value) -> rusqlite::Result<K> {
    K::column_result(value.into()).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, value.data_type(), Box::new(err))
    })
}

/// Key value the store should see for an entity, or `None` when the store
/// must generate it.
pub fn stored_key<E: Entity>(entity: &E) -> rusqlite::Result<Option<Value>> {
    let key = entity.key();
    if E::KEY_GENERATED && key == E::Key::default() {
        return Ok(None);
    }
    key_value(&key).map(Some)
}
