//! SQLite implementation of the persistence context.
//!
//! # Responsibility
//! - Track entity entries and flush them as INSERT/UPDATE/DELETE statements.
//! - Map explicit transaction scopes onto `BEGIN`/`COMMIT`/`ROLLBACK`.
//!
//! # Invariants
//! - Every flush runs inside a savepoint: it joins an open transaction or
//!   commits on its own, and a failed flush leaves no partial rows behind.
//! - Tracker state is only accepted after the savepoint is released, and
//!   stays provisional until the owning transaction commits; any rollback
//!   restores the tracker to the state it had at `BEGIN`.
//! - The entry whose statement the store refused loses its pending work.
//! - Tracked reads never overwrite an entry that is already tracked.

use super::tracker::{ChangeTracker, EntryId, TableMap, TrackedEntry};
use super::transaction::{ScopeAction, ScopeStack, ScopeTicket, TransactionOptions};
use super::{ContextError, ContextResult, PersistenceContext, QueryTracking};
use crate::db::{open_db, ConnectionTarget, Migration};
use crate::model::entity::{key_value, stored_key, Entity, EntityState};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::time::Instant;

/// Persistence context over one SQLite connection.
pub struct SqliteContext {
    conn: Connection,
    tracker: ChangeTracker,
    scopes: ScopeStack,
}

impl SqliteContext {
    /// Wraps an already bootstrapped connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            tracker: ChangeTracker::default(),
            scopes: ScopeStack::default(),
        }
    }

    /// Opens a context from a connection string and applies `migrations`.
    pub fn open(connection: &str, migrations: &[Migration]) -> ContextResult<Self> {
        let target = ConnectionTarget::parse(connection)?;
        Ok(Self::new(open_db(&target, migrations)?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Number of entries currently held by the change tracker.
    pub fn tracked_len(&self) -> usize {
        self.tracker.len()
    }

    /// Starts tracking `entity` as unchanged, or refreshes the current values
    /// of an already tracked entry so `detect_changes()` can pick them up.
    pub fn attach<E: Entity>(&mut self, entity: &E) -> ContextResult<EntryId> {
        let id = self.entry(entity)?;
        if self.entry_state(id) == EntityState::Detached {
            self.set_state(id, EntityState::Unchanged)?;
        }
        Ok(id)
    }

    /// Closes the connection. An open transaction is rolled back by SQLite.
    pub fn close(self) -> ContextResult<()> {
        if self.scopes.is_open() {
            warn!("event=context_close module=context status=rollback reason=open_scope");
        }
        self.conn
            .close()
            .map_err(|(_, err)| ContextError::from(err))
    }

    fn load<E: Entity>(
        &mut self,
        filter: Option<Value>,
        tracking: QueryTracking,
    ) -> ContextResult<Vec<E>> {
        let mut select_columns = vec![quote_ident(E::KEY_COLUMN)];
        select_columns.extend(E::COLUMNS.iter().map(|column| quote_ident(column)));
        let key_column = quote_ident(E::KEY_COLUMN);
        let condition = if filter.is_some() {
            format!(" WHERE {key_column} = ?1")
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT {} FROM {}{condition} ORDER BY {key_column} ASC;",
            select_columns.join(", "),
            quote_ident(E::TABLE),
        );

        let entities = {
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(filter.iter()))?;
            let mut entities = Vec::new();
            while let Some(row) = rows.next()? {
                entities.push(E::from_row(row)?);
            }
            entities
        };

        if tracking == QueryTracking::Tracked {
            for entity in &entities {
                self.track_loaded(entity)?;
            }
        }
        Ok(entities)
    }

    fn track_loaded<E: Entity>(&mut self, entity: &E) -> ContextResult<()> {
        let key = key_value(&entity.key())?;
        if self.tracker.find(E::TABLE, &key).is_some() {
            return Ok(());
        }

        let values = entity.to_values();
        self.tracker.insert(TrackedEntry {
            map: table_map::<E>(),
            key: Some(key),
            state: EntityState::Unchanged,
            current: values.clone(),
            original: values,
        });
        Ok(())
    }

    fn apply_exit(&mut self, action: ScopeAction) -> ContextResult<()> {
        match action {
            ScopeAction::Begin(_) | ScopeAction::Join | ScopeAction::Leave => Ok(()),
            ScopeAction::Commit => {
                if let Err(err) = self.conn.execute_batch("COMMIT;") {
                    self.roll_back();
                    return Err(err.into());
                }
                self.tracker.commit_journal();
                debug!("event=tx_commit module=context status=ok");
                Ok(())
            }
            ScopeAction::RollbackAbandoned => {
                self.tracker.rollback_journal();
                if !self.conn.is_autocommit() {
                    self.conn.execute_batch("ROLLBACK;")?;
                }
                debug!("event=tx_rollback module=context status=ok reason=abandoned");
                Ok(())
            }
            ScopeAction::RollbackAborted => {
                self.roll_back();
                Err(ContextError::TransactionAborted)
            }
            ScopeAction::RollbackTimedOut { elapsed, timeout } => {
                self.roll_back();
                Err(ContextError::TransactionTimeout { elapsed, timeout })
            }
        }
    }

    /// Rolls back the store and the tracker; store errors are only logged.
    fn roll_back(&mut self) {
        self.tracker.rollback_journal();
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK;") {
            warn!("event=tx_rollback module=context status=error error={err}");
        }
    }
}

impl PersistenceContext for SqliteContext {
    fn detect_changes(&mut self) -> usize {
        self.tracker.detect_changes()
    }

    fn entry<E: Entity>(&mut self, entity: &E) -> ContextResult<EntryId> {
        let key = stored_key(entity)?;
        let values = entity.to_values();

        if let Some(id) = key.as_ref().and_then(|key| self.tracker.find(E::TABLE, key)) {
            self.tracker.set_current(id, values);
            return Ok(id);
        }

        Ok(self.tracker.insert(TrackedEntry {
            map: table_map::<E>(),
            key,
            state: EntityState::Detached,
            current: values.clone(),
            original: values,
        }))
    }

    fn set_state(&mut self, entry: EntryId, state: EntityState) -> ContextResult<()> {
        let previous = self
            .tracker
            .get(entry)
            .map(|tracked| tracked.state)
            .ok_or(ContextError::UnknownEntry(entry))?;

        match (previous, state) {
            (_, EntityState::Detached) | (EntityState::Added, EntityState::Deleted) => {
                self.tracker.remove(entry);
            }
            (_, next) => self.tracker.set_state(entry, next),
        }
        Ok(())
    }

    fn entry_state(&self, entry: EntryId) -> EntityState {
        self.tracker
            .get(entry)
            .map_or(EntityState::Detached, |tracked| tracked.state)
    }

    fn entry_key(&self, entry: EntryId) -> Option<Value> {
        self.tracker
            .get(entry)
            .and_then(|tracked| tracked.key.clone())
    }

    fn save_changes(&mut self) -> ContextResult<usize> {
        self.tracker.purge_detached();
        match flush(&mut self.conn, &self.tracker) {
            Ok(Flushed {
                affected,
                generated_keys,
            }) => {
                self.tracker.accept_changes(generated_keys);
                debug!("event=save_changes module=context status=ok affected={affected}");
                Ok(affected)
            }
            Err(FlushFailure { entry, error }) => {
                if let Some(id) = entry {
                    self.tracker.reject(id);
                    debug!("event=save_changes module=context status=rejected entry={id}");
                }
                Err(error)
            }
        }
    }

    fn query<E: Entity>(&mut self, tracking: QueryTracking) -> ContextResult<Vec<E>> {
        self.load(None, tracking)
    }

    fn query_by_key<E: Entity>(
        &mut self,
        key: &E::Key,
        tracking: QueryTracking,
    ) -> ContextResult<Vec<E>> {
        self.load(Some(key_value(key)?), tracking)
    }

    fn begin_scope(&mut self, options: &TransactionOptions) -> ContextResult<ScopeTicket> {
        let (ticket, action) = self.scopes.enter(options, Instant::now());
        if let ScopeAction::Begin(mode) = action {
            if let Err(err) = self.conn.execute_batch(mode.begin_sql()) {
                let _ = self.scopes.abandon(ticket);
                return Err(err.into());
            }
            self.tracker.begin_journal();
            debug!(
                "event=tx_begin module=context status=ok mode={} timeout_ms={}",
                mode.as_str(),
                options.timeout_ms
            );
        }
        Ok(ticket)
    }

    fn complete_scope(&mut self, ticket: ScopeTicket) -> ContextResult<()> {
        let action = self.scopes.complete(ticket, Instant::now())?;
        self.apply_exit(action)
    }

    fn abandon_scope(&mut self, ticket: ScopeTicket) -> ContextResult<()> {
        let action = self.scopes.abandon(ticket)?;
        self.apply_exit(action)
    }
}

struct Flushed {
    affected: usize,
    generated_keys: Vec<(EntryId, Value)>,
}

/// Flush error, with the entry whose statement failed when there is one.
struct FlushFailure {
    entry: Option<EntryId>,
    error: ContextError,
}

impl FlushFailure {
    fn at(entry: EntryId, error: impl Into<ContextError>) -> Self {
        Self {
            entry: Some(entry),
            error: error.into(),
        }
    }
}

impl From<rusqlite::Error> for FlushFailure {
    fn from(value: rusqlite::Error) -> Self {
        Self {
            entry: None,
            error: value.into(),
        }
    }
}

fn flush(conn: &mut Connection, tracker: &ChangeTracker) -> Result<Flushed, FlushFailure> {
    let savepoint = conn.savepoint()?;
    let mut affected = 0;
    let mut generated_keys = Vec::new();

    for (id, entry) in tracker.pending() {
        let fail = |error: ContextError| FlushFailure::at(id, error);
        match entry.state {
            EntityState::Added => {
                let (sql, values) = insert_statement(entry);
                affected += savepoint
                    .execute(&sql, params_from_iter(values.iter()))
                    .map_err(|err| fail(err.into()))?;
                if entry.key.is_none() {
                    generated_keys.push((id, Value::Integer(savepoint.last_insert_rowid())));
                }
            }
            EntityState::Modified => {
                let key = require_key(entry).map_err(fail)?;
                let (sql, values) = update_statement(entry, key);
                let changed = savepoint
                    .execute(&sql, params_from_iter(values.iter()))
                    .map_err(|err| fail(err.into()))?;
                if changed == 0 {
                    return Err(fail(conflict(entry)));
                }
                affected += changed;
            }
            EntityState::Deleted => {
                let key = require_key(entry).map_err(fail)?;
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?1;",
                    quote_ident(entry.map.table),
                    quote_ident(entry.map.key_column)
                );
                let changed = savepoint
                    .execute(&sql, [key])
                    .map_err(|err| fail(err.into()))?;
                if changed == 0 {
                    return Err(fail(conflict(entry)));
                }
                affected += changed;
            }
            EntityState::Unchanged | EntityState::Detached => {}
        }
    }

    savepoint.commit()?;
    Ok(Flushed {
        affected,
        generated_keys,
    })
}

fn table_map<E: Entity>() -> TableMap {
    TableMap {
        table: E::TABLE,
        key_column: E::KEY_COLUMN,
        columns: E::COLUMNS,
    }
}

fn insert_statement(entry: &TrackedEntry) -> (String, Vec<Value>) {
    let table = quote_ident(entry.map.table);
    let mut columns = Vec::with_capacity(entry.map.columns.len() + 1);
    let mut values = Vec::with_capacity(entry.current.len() + 1);

    if let Some(key) = entry.key.as_ref() {
        columns.push(quote_ident(entry.map.key_column));
        values.push(key.clone());
    }
    columns.extend(entry.map.columns.iter().map(|column| quote_ident(column)));
    values.extend(entry.current.iter().cloned());

    if columns.is_empty() {
        return (format!("INSERT INTO {table} DEFAULT VALUES;"), values);
    }

    let placeholders = (1..=columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    (
        format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders});",
            columns.join(", ")
        ),
        values,
    )
}

fn update_statement(entry: &TrackedEntry, key: &Value) -> (String, Vec<Value>) {
    let table = quote_ident(entry.map.table);
    let key_column = quote_ident(entry.map.key_column);

    if entry.map.columns.is_empty() {
        return (
            format!("UPDATE {table} SET {key_column} = {key_column} WHERE {key_column} = ?1;"),
            vec![key.clone()],
        );
    }

    let assignments = entry
        .map
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{} = ?{}", quote_ident(column), index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let mut values = entry.current.clone();
    values.push(key.clone());
    (
        format!(
            "UPDATE {table} SET {assignments} WHERE {key_column} = ?{};",
            values.len()
        ),
        values,
    )
}

fn require_key(entry: &TrackedEntry) -> ContextResult<&Value> {
    entry.key.as_ref().ok_or_else(|| conflict(entry))
}

fn conflict(entry: &TrackedEntry) -> ContextError {
    ContextError::ConcurrencyConflict {
        table: entry.map.table,
        key: entry
            .key
            .as_ref()
            .map_or_else(|| "<unassigned>".to_string(), describe_value),
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Integer(value) => value.to_string(),
        Value::Real(value) => value.to_string(),
        Value::Text(value) => value.clone(),
        Value::Blob(bytes) => format!("blob[{}]", bytes.len()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
