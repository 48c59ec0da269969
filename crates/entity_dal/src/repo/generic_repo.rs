//! Generic repository over any mapped entity type.
//!
//! # Responsibility
//! - Translate an (entity, desired state) pair into one durable write.
//! - Provide CRUD, predicate upsert and predicate delete operations.
//! - Wrap writes in transaction scopes and bracket them with logging.
//!
//! # Invariants
//! - Every write goes through `save_changes()`: detect changes, open a scope,
//!   stage, assign state, flush, complete.
//! - Upsert existence is decided from an untracked snapshot, never from the
//!   change tracker.
//! - `delete_by_key` on a missing key is a silent no-op.
//! - `delete_set` commits per row and is not atomic across the set.
//! - Errors are logged and returned unchanged; nothing is retried.

use crate::config::RepositoryConfig;
use crate::context::{
    ContextError, PersistenceContext, QueryTracking, SqliteContext, TransactionOptions,
};
use crate::db::Migration;
use crate::model::entity::{key_from_value, Entity, EntityState};
use crate::repo::op_log::OpLog;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error taxonomy.
#[derive(Debug)]
pub enum RepoError {
    /// A key lookup that a dependent operation relies on found nothing.
    NotFound { entity: &'static str, key: String },
    /// A predicate lookup expecting exactly one row found none.
    NoMatch { entity: &'static str },
    /// A lookup expecting exactly one row found several.
    AmbiguousResult {
        entity: &'static str,
        matches: usize,
    },
    /// A per-row batch failed after `committed` rows were already deleted.
    PartialBatch {
        entity: &'static str,
        committed: usize,
        remaining: usize,
        source: Box<RepoError>,
    },
    /// Store, constraint, connectivity or transaction failure.
    Persistence(ContextError),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, key } => write!(f, "{entity} not found: {key}"),
            Self::NoMatch { entity } => write!(f, "no {entity} row matches the predicate"),
            Self::AmbiguousResult { entity, matches } => write!(
                f,
                "expected a single {entity} row, found {matches} matches"
            ),
            Self::PartialBatch {
                entity,
                committed,
                remaining,
                source,
            } => write!(
                f,
                "batch delete on {entity} stopped after {committed} committed rows with {remaining} left: {source}"
            ),
            Self::Persistence(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound { .. } => None,
            Self::NoMatch { .. } => None,
            Self::AmbiguousResult { .. } => None,
            Self::PartialBatch { source, .. } => Some(source.as_ref()),
            Self::Persistence(err) => Some(err),
        }
    }
}

impl From<ContextError> for RepoError {
    fn from(value: ContextError) -> Self {
        Self::Persistence(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.into())
    }
}

impl From<crate::db::DbError> for RepoError {
    fn from(value: crate::db::DbError) -> Self {
        Self::Persistence(value.into())
    }
}

/// Single choke-point for entity state transitions against one context.
///
/// Not meant to be shared between concurrent callers; every operation takes
/// `&mut self`.
pub struct GenericRepository<C: PersistenceContext = SqliteContext> {
    ctx: C,
    log: OpLog,
    write_options: TransactionOptions,
    upsert_options: TransactionOptions,
}

impl<C: PersistenceContext> GenericRepository<C> {
    /// Creates a repository logging through the `log` facade.
    pub fn new(ctx: C) -> Self {
        Self::with_log(ctx, OpLog::facade())
    }

    pub fn with_log(ctx: C, log: OpLog) -> Self {
        Self {
            ctx,
            log,
            write_options: TransactionOptions::long_running(),
            upsert_options: TransactionOptions::default(),
        }
    }

    /// Overrides the scope options of the write primitive and of upserts.
    pub fn with_transaction_options(
        mut self,
        write_options: TransactionOptions,
        upsert_options: TransactionOptions,
    ) -> Self {
        self.write_options = write_options;
        self.upsert_options = upsert_options;
        self
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    /// Replaces the context; the previous one is dropped.
    pub fn set_context(&mut self, ctx: C) {
        self.ctx = ctx;
    }

    pub fn into_context(self) -> C {
        self.ctx
    }

    pub fn log(&self) -> &OpLog {
        &self.log
    }

    /// Inserts `entity` and returns it, carrying the store-generated key
    /// when one was assigned.
    pub fn add<E: Entity>(&mut self, mut entity: E) -> RepoResult<E> {
        if let Some(key) = self.save_changes(&entity, EntityState::Added)? {
            entity.set_key(key);
        }
        Ok(entity)
    }

    pub fn update<E: Entity>(&mut self, entity: &E) -> RepoResult<()> {
        self.save_changes(entity, EntityState::Modified)?;
        Ok(())
    }

    pub fn delete<E: Entity>(&mut self, entity: &E) -> RepoResult<()> {
        self.save_changes(entity, EntityState::Deleted)?;
        Ok(())
    }

    /// Deletes the row with `key`. A missing key returns `Ok(())` without
    /// touching the store.
    pub fn delete_by_key<E: Entity>(&mut self, key: &E::Key) -> RepoResult<()> {
        match self.get_by_id::<E>(key)? {
            Some(entity) => self.delete(&entity),
            None => {
                self.log.debug(format_args!(
                    "event=repo_op module=repo op=delete_by_key entity={} status=skipped reason=not_found key={:?}",
                    E::TABLE,
                    key
                ));
                Ok(())
            }
        }
    }

    /// Tracked lookup by key. Returns `Ok(None)` for zero matches and
    /// `AmbiguousResult` when the key is not unique in the store.
    pub fn get_by_id<E: Entity>(&mut self, key: &E::Key) -> RepoResult<Option<E>> {
        let matches = self.ctx.query_by_key::<E>(key, QueryTracking::Tracked)?;
        single_or_none::<E>(matches)
    }

    /// Inserts `entity` when no persisted row satisfies `exists`, otherwise
    /// updates it.
    ///
    /// When the match carries a different key than `entity` (for example a
    /// natural-key upsert of a fresh instance), the matched row's key is
    /// adopted so the existing row is the one updated.
    pub fn add_or_update<E, P>(&mut self, entity: E, exists: P) -> RepoResult<E>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        let span = self.log.span("add_or_update", E::TABLE);
        let options = self.upsert_options;
        let result = self.in_scope(options, |repo| {
            let matches = repo
                .ctx
                .query::<E>(QueryTracking::NoTracking)?
                .into_iter()
                .filter(|row| exists(row))
                .map(|row| row.key())
                .collect::<Vec<_>>();

            if matches.is_empty() {
                return repo.add(entity);
            }

            let mut entity = entity;
            let own_key = entity.key();
            if !matches.contains(&own_key) {
                if matches.len() > 1 {
                    return Err(RepoError::AmbiguousResult {
                        entity: E::TABLE,
                        matches: matches.len(),
                    });
                }
                entity.set_key(matches[0].clone());
            }
            repo.update(&entity)?;
            Ok(entity)
        });
        span.observe(result)
    }

    pub fn exists<E, P>(&mut self, predicate: P) -> RepoResult<bool>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        Ok(self
            .ctx
            .query::<E>(QueryTracking::Tracked)?
            .iter()
            .any(|entity| predicate(entity)))
    }

    /// Deletes every row matching `predicate` at call time, one committed
    /// write per row. Returns the number of deleted rows.
    ///
    /// Not atomic: when a deletion fails after earlier ones committed, those
    /// stay deleted and `PartialBatch` reports how far the batch got.
    pub fn delete_set<E, P>(&mut self, predicate: P) -> RepoResult<usize>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        let span = self.log.span("delete_set", E::TABLE);
        let result = self.delete_snapshot(predicate);
        span.observe(result)
    }

    /// Deletes the single row matching `predicate`; fails when zero or
    /// several rows match. Intended for composite-key lookups.
    pub fn delete_single<E, P>(&mut self, predicate: P) -> RepoResult<()>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        let span = self.log.span("delete_single", E::TABLE);
        let result = self.find_single(predicate).and_then(|entity| self.delete(&entity));
        span.observe(result)
    }

    /// Write primitive. Returns the entity key when `state` is `Added`.
    fn save_changes<E: Entity>(
        &mut self,
        entity: &E,
        state: EntityState,
    ) -> RepoResult<Option<E::Key>> {
        let span = self.log.span("save_changes", E::TABLE);
        let result = self.write_state(entity, state);
        span.observe(result)
    }

    fn write_state<E: Entity>(
        &mut self,
        entity: &E,
        state: EntityState,
    ) -> RepoResult<Option<E::Key>> {
        self.ctx.detect_changes();

        let options = self.write_options;
        self.in_scope(options, |repo| {
            let ctx = &mut repo.ctx;
            let entry = if matches!(state, EntityState::Added | EntityState::Detached) {
                ctx.add(entity)?
            } else {
                ctx.entry(entity)?
            };
            let flushed = ctx
                .set_state(entry, state)
                .and_then(|()| ctx.save_changes());
            if let Err(err) = flushed {
                // The refused entry was already reset by the context; the
                // caller's entry must not be replayed either.
                let _ = ctx.set_state(entry, EntityState::Detached);
                return Err(err.into());
            }

            if state != EntityState::Added {
                return Ok(None);
            }
            let key = match ctx.entry_key(entry) {
                Some(value) => key_from_value::<E::Key>(&value)?,
                None => entity.key(),
            };
            Ok(Some(key))
        })
    }

    /// Runs `body` inside a scope that is completed on success and abandoned
    /// on failure. The body's error wins over a release error.
    fn in_scope<T>(
        &mut self,
        options: TransactionOptions,
        body: impl FnOnce(&mut Self) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let ticket = self.ctx.begin_scope(&options)?;
        match body(self) {
            Ok(value) => {
                self.ctx.complete_scope(ticket)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(release_err) = self.ctx.abandon_scope(ticket) {
                    self.log.warn(format_args!(
                        "event=tx_release module=repo status=error error={release_err}"
                    ));
                }
                Err(err)
            }
        }
    }

    fn delete_snapshot<E, P>(&mut self, predicate: P) -> RepoResult<usize>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        let snapshot = self
            .ctx
            .query::<E>(QueryTracking::Tracked)?
            .into_iter()
            .filter(|entity| predicate(entity))
            .collect::<Vec<_>>();
        let total = snapshot.len();

        for (committed, entity) in snapshot.iter().enumerate() {
            if let Err(err) = self.delete(entity) {
                if committed == 0 {
                    return Err(err);
                }
                return Err(RepoError::PartialBatch {
                    entity: E::TABLE,
                    committed,
                    remaining: total - committed,
                    source: Box::new(err),
                });
            }
        }
        Ok(total)
    }

    fn find_single<E, P>(&mut self, predicate: P) -> RepoResult<E>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        let matches = self
            .ctx
            .query::<E>(QueryTracking::Tracked)?
            .into_iter()
            .filter(|entity| predicate(entity))
            .collect::<Vec<_>>();
        single_or_none::<E>(matches)?.ok_or(RepoError::NoMatch { entity: E::TABLE })
    }
}

impl GenericRepository<SqliteContext> {
    /// Opens a SQLite context from `connection` and applies `migrations`.
    pub fn connect(connection: &str, migrations: &[Migration]) -> RepoResult<Self> {
        Ok(Self::new(SqliteContext::open(connection, migrations)?))
    }

    /// Builds a repository from host configuration.
    pub fn from_config(
        config: &RepositoryConfig,
        migrations: &[Migration],
        log: OpLog,
    ) -> RepoResult<Self> {
        let ctx = SqliteContext::open(&config.connection, migrations)?;
        Ok(Self::with_log(ctx, log)
            .with_transaction_options(config.write_transaction, config.upsert_transaction))
    }

    /// Switches to a new connection; the previous context is closed first.
    pub fn set_connection(&mut self, connection: &str, migrations: &[Migration]) -> RepoResult<()> {
        let next = SqliteContext::open(connection, migrations)?;
        let previous = std::mem::replace(&mut self.ctx, next);
        previous.close()?;
        Ok(())
    }

    /// Disposes the owned context.
    pub fn close(self) -> RepoResult<()> {
        self.ctx.close()?;
        Ok(())
    }
}

fn single_or_none<E: Entity>(mut matches: Vec<E>) -> RepoResult<Option<E>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        count => Err(RepoError::AmbiguousResult {
            entity: E::TABLE,
            matches: count,
        }),
    }
}
