//! Repository layer over the persistence context.
//!
//! # Responsibility
//! - `GenericRepository`: state transitions, upserts and predicate deletes
//!   for any mapped entity.
//! - `EntityOperationsRepository`: key/code identity and activation for
//!   glossary entities.
//!
//! # Invariants
//! - Repositories never swallow errors; failures are logged then returned.
//! - Repository APIs return semantic errors (`NotFound`, `AmbiguousResult`)
//!   in addition to persistence errors.

pub mod entity_ops_repo;
pub mod generic_repo;
pub mod op_log;
