//! Generic persistence layer over SQLite.
//!
//! Repositories translate entity-state intent (added, modified, deleted)
//! into committed writes through a change-tracking persistence context, with
//! explicit transaction scopes and predicate-driven upserts.

pub mod config;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;

pub use config::RepositoryConfig;
pub use context::{
    ContextError, ContextResult, EntryId, PersistenceContext, QueryTracking, ScopeRole,
    ScopeTicket, SqliteContext, TransactionMode, TransactionOptions,
};
pub use db::{ConnectionTarget, DbError, DbResult, Migration};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig, LoggingError};
pub use model::entity::{Entity, EntityState, Glossary};
pub use repo::entity_ops_repo::{ActivatableEntity, EntityOperations, EntityOperationsRepository};
pub use repo::generic_repo::{GenericRepository, RepoError, RepoResult};
pub use repo::op_log::{OpLog, OpSpan};
