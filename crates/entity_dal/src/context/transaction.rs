//! Explicit transaction scopes with join-or-start semantics.
//!
//! # Responsibility
//! - Decide whether a new scope starts a transaction or joins the open one.
//! - Decide how a scope exit resolves (leave, commit or roll back).
//!
//! # Invariants
//! - Only the owning (outermost) scope issues `BEGIN`/`COMMIT`/`ROLLBACK`.
//! - A participant that abandons its scope dooms the whole transaction.
//! - Scopes exit in LIFO order.
//! - The owner's deadline is fixed when the transaction starts; joined
//!   scopes never extend it.

use super::{ContextError, ContextResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const DEFAULT_SCOPE_TIMEOUT_MS: u64 = 60 * 1000;
const LONG_RUNNING_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// SQLite locking behavior used when a scope starts a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionMode {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED;",
            Self::Immediate => "BEGIN IMMEDIATE;",
            Self::Exclusive => "BEGIN EXCLUSIVE;",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Immediate => "immediate",
            Self::Exclusive => "exclusive",
        }
    }
}

/// Parameters of one transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub mode: TransactionMode,
    pub timeout_ms: u64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            mode: TransactionMode::Deferred,
            timeout_ms: DEFAULT_SCOPE_TIMEOUT_MS,
        }
    }
}

impl TransactionOptions {
    /// Options used by the write primitive: tolerate slow commits.
    pub fn long_running() -> Self {
        Self {
            mode: TransactionMode::Deferred,
            timeout_ms: LONG_RUNNING_TIMEOUT_MS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Role a scope plays in the transaction it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRole {
    /// Started the transaction and decides its outcome.
    Owner,
    /// Joined an already open transaction.
    Participant,
}

/// Handle returned by `begin_scope`; must be handed back exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a scope must be completed or abandoned"]
pub struct ScopeTicket {
    depth: u32,
    role: ScopeRole,
}

impl ScopeTicket {
    pub fn role(&self) -> ScopeRole {
        self.role
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

/// What the connection must do when a scope is entered or left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeAction {
    Begin(TransactionMode),
    Join,
    Leave,
    Commit,
    RollbackAbandoned,
    RollbackAborted,
    RollbackTimedOut { elapsed: Duration, timeout: Duration },
}

#[derive(Debug)]
struct OpenTransaction {
    depth: u32,
    doomed: bool,
    started_at: Instant,
    timeout: Duration,
}

/// Join-or-start bookkeeping for one connection.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    open: Option<OpenTransaction>,
}

impl ScopeStack {
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn enter(&mut self, options: &TransactionOptions, now: Instant) -> (ScopeTicket, ScopeAction) {
        match self.open.as_mut() {
            Some(open) => {
                open.depth += 1;
                let ticket = ScopeTicket {
                    depth: open.depth,
                    role: ScopeRole::Participant,
                };
                (ticket, ScopeAction::Join)
            }
            None => {
                self.open = Some(OpenTransaction {
                    depth: 1,
                    doomed: false,
                    started_at: now,
                    timeout: options.timeout(),
                });
                let ticket = ScopeTicket {
                    depth: 1,
                    role: ScopeRole::Owner,
                };
                (ticket, ScopeAction::Begin(options.mode))
            }
        }
    }

    pub fn complete(&mut self, ticket: ScopeTicket, now: Instant) -> ContextResult<ScopeAction> {
        let open = self.check_top(&ticket)?;
        match ticket.role {
            ScopeRole::Participant => {
                open.depth -= 1;
                Ok(ScopeAction::Leave)
            }
            ScopeRole::Owner => {
                let finished = self.open.take().ok_or(ContextError::NoActiveScope)?;
                let elapsed = now.saturating_duration_since(finished.started_at);
                if finished.doomed {
                    Ok(ScopeAction::RollbackAborted)
                } else if elapsed > finished.timeout {
                    Ok(ScopeAction::RollbackTimedOut {
                        elapsed,
                        timeout: finished.timeout,
                    })
                } else {
                    Ok(ScopeAction::Commit)
                }
            }
        }
    }

    pub fn abandon(&mut self, ticket: ScopeTicket) -> ContextResult<ScopeAction> {
        let open = self.check_top(&ticket)?;
        match ticket.role {
            ScopeRole::Participant => {
                open.depth -= 1;
                open.doomed = true;
                Ok(ScopeAction::Leave)
            }
            ScopeRole::Owner => {
                self.open = None;
                Ok(ScopeAction::RollbackAbandoned)
            }
        }
    }

    fn check_top(&mut self, ticket: &ScopeTicket) -> ContextResult<&mut OpenTransaction> {
        let open = self.open.as_mut().ok_or(ContextError::NoActiveScope)?;
        if open.depth != ticket.depth {
            return Err(ContextError::ScopeOrder {
                expected_depth: open.depth,
                actual_depth: ticket.depth,
            });
        }
        Ok(open)
    }
}
