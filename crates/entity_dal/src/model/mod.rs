//! Entity mapping model.
//!
//! # Responsibility
//! - Define the contracts a record implements to be persisted.
//!
//! # Invariants
//! - Every entity is identified by exactly one key column.
//! - Glossary entities additionally expose a business code and active flag.

pub mod entity;
