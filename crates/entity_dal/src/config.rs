//! Host-facing repository configuration.
//!
//! A host either hands a pre-built context to a repository or describes the
//! connection with this structure (typically deserialized from its own
//! settings file).

use crate::context::TransactionOptions;
use serde::{Deserialize, Serialize};

pub const MEMORY_CONNECTION: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// `:memory:`, `file:<path>` or a bare path.
    pub connection: String,
    /// Scope options of the per-write transaction.
    pub write_transaction: TransactionOptions,
    /// Scope options of the upsert transaction that wraps the inner write.
    pub upsert_transaction: TransactionOptions,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            connection: MEMORY_CONNECTION.to_string(),
            write_transaction: TransactionOptions::long_running(),
            upsert_transaction: TransactionOptions::default(),
        }
    }
}
