// SPDX-License-Identifier: MIT OR Apache-2.0

//! The engine's error taxonomy.

use tg_approval::ApprovalError;
use tg_budget::BudgetError;
use tg_core::{ApprovalDenied, PolicyError};
use tg_ledger::LedgerError;

/// The decision entry could not be written to the tamper-evident ledger.
///
/// This is the only failure that can occur after policy but before
/// execution without a prior durable deny record; execution is blocked
/// unconditionally when it happens.
#[derive(Debug, thiserror::Error)]
#[error("failed to write decision evidence: {source}")]
pub struct AuditLogError {
    /// The underlying ledger failure.
    #[source]
    pub source: LedgerError,
}

/// Everything a guarded call can fail with.
///
/// Every variant except [`GuardError::Execution`] means the guarded
/// callable was never invoked.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The policy raised or returned an invalid result (deny recorded).
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The normal "not authorized" outcome (deny recorded).
    #[error(transparent)]
    Denied(#[from] ApprovalDenied),

    /// The approver raised or timed out (deny recorded).
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Budget check failed or the manager was unavailable (deny
    /// recorded).
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// The decision write failed; execution was blocked.
    #[error(transparent)]
    AuditLog(#[from] AuditLogError),

    /// The guarded callable itself failed after an allow decision was
    /// durably recorded. The original error is preserved.
    #[error("guarded callable failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GuardError {
    /// Downcast helper for the preserved execution error.
    #[must_use]
    pub fn execution_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Execution(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}
