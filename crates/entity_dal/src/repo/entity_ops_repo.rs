//! Identity and activation operations for glossary entities.
//!
//! # Responsibility
//! - Upsert by business code (`save`) or by key (`save_by_id`).
//! - Toggle the active flag as a specialized update.
//! - Resolve entities by key before acting on them.
//!
//! # Invariants
//! - Operations acting on a key that does not resolve fail with `NotFound`;
//!   they never proceed with an absent entity.
//! - Activation changes one field only; it never inserts or deletes rows.

use crate::context::{PersistenceContext, SqliteContext};
use crate::model::entity::{Entity, Glossary};
use crate::repo::generic_repo::{GenericRepository, RepoError, RepoResult};
use crate::repo::op_log::OpLog;
use std::marker::PhantomData;

/// Keyed read/write contract for one entity type.
pub trait EntityOperations<E: Entity> {
    fn get_by_id(&mut self, key: &E::Key) -> RepoResult<Option<E>>;
    /// Upsert keyed by business code.
    fn save(&mut self, entity: E) -> RepoResult<E>;
    /// Upsert keyed by entity key.
    fn save_by_id(&mut self, entity: E) -> RepoResult<E>;
    fn delete_by_id(&mut self, key: &E::Key) -> RepoResult<()>;
    fn delete(&mut self, entity: &E) -> RepoResult<()>;
}

/// Activation contract for entities carrying an active flag.
pub trait ActivatableEntity<E: Entity> {
    fn deactivate_by_id(&mut self, key: &E::Key) -> RepoResult<E>;
    fn deactivate(&mut self, entity: &mut E) -> RepoResult<()>;
    fn activate_by_id(&mut self, key: &E::Key) -> RepoResult<E>;
    fn activate(&mut self, entity: &mut E) -> RepoResult<()>;
}

/// Repository for one glossary entity type, built on `GenericRepository`.
pub struct EntityOperationsRepository<E, C: PersistenceContext = SqliteContext> {
    base: GenericRepository<C>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Glossary, C: PersistenceContext> EntityOperationsRepository<E, C> {
    pub fn new(ctx: C) -> Self {
        Self::from_base(GenericRepository::new(ctx))
    }

    pub fn with_log(ctx: C, log: OpLog) -> Self {
        Self::from_base(GenericRepository::with_log(ctx, log))
    }

    pub fn from_base(base: GenericRepository<C>) -> Self {
        Self {
            base,
            _entity: PhantomData,
        }
    }

    /// Generic operations (predicate upsert, set deletes, ...) on the same
    /// context.
    pub fn base(&mut self) -> &mut GenericRepository<C> {
        &mut self.base
    }

    pub fn into_base(self) -> GenericRepository<C> {
        self.base
    }

    fn require<F>(&mut self, key: &E::Key, op: &'static str, act: F) -> RepoResult<E>
    where
        F: FnOnce(&mut Self, &mut E) -> RepoResult<()>,
    {
        let span = self.base.log().span(op, E::TABLE);
        let result = self.resolve(key).and_then(|mut entity| {
            act(self, &mut entity)?;
            Ok(entity)
        });
        span.observe(result)
    }

    fn resolve(&mut self, key: &E::Key) -> RepoResult<E> {
        self.base
            .get_by_id::<E>(key)?
            .ok_or_else(|| RepoError::NotFound {
                entity: E::TABLE,
                key: format!("{key:?}"),
            })
    }

    fn set_active(&mut self, entity: &mut E, active: bool) -> RepoResult<()> {
        entity.set_active(active);
        self.base.update(entity)
    }
}

impl<E: Glossary, C: PersistenceContext> EntityOperations<E> for EntityOperationsRepository<E, C> {
    fn get_by_id(&mut self, key: &E::Key) -> RepoResult<Option<E>> {
        let span = self.base.log().span("get_by_id", E::TABLE);
        let result = self.base.get_by_id::<E>(key);
        span.observe(result)
    }

    fn save(&mut self, entity: E) -> RepoResult<E> {
        let span = self.base.log().span("save", E::TABLE);
        let code = entity.code().to_string();
        let result = self
            .base
            .add_or_update(entity, move |row: &E| row.code() == code);
        span.observe(result)
    }

    fn save_by_id(&mut self, entity: E) -> RepoResult<E> {
        let span = self.base.log().span("save_by_id", E::TABLE);
        let key = entity.key();
        let result = self
            .base
            .add_or_update(entity, move |row: &E| row.key() == key);
        span.observe(result)
    }

    fn delete_by_id(&mut self, key: &E::Key) -> RepoResult<()> {
        self.require(key, "delete_by_id", |repo, entity| repo.base.delete(entity))
            .map(|_| ())
    }

    fn delete(&mut self, entity: &E) -> RepoResult<()> {
        let span = self.base.log().span("delete", E::TABLE);
        let result = self.base.delete(entity);
        span.observe(result)
    }
}

impl<E: Glossary, C: PersistenceContext> ActivatableEntity<E> for EntityOperationsRepository<E, C> {
    fn deactivate_by_id(&mut self, key: &E::Key) -> RepoResult<E> {
        self.require(key, "deactivate_by_id", |repo, entity| {
            repo.set_active(entity, false)
        })
    }

    fn deactivate(&mut self, entity: &mut E) -> RepoResult<()> {
        self.set_active(entity, false)
    }

    fn activate_by_id(&mut self, key: &E::Key) -> RepoResult<E> {
        self.require(key, "activate_by_id", |repo, entity| {
            repo.set_active(entity, true)
        })
    }

    fn activate(&mut self, entity: &mut E) -> RepoResult<()> {
        self.set_active(entity, true)
    }
}
