// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Two-phase budget accounting for guarded calls.
//!
//! Spending is tracked as named counters (`agent:<id>`, `tool:<action>`)
//! with fixed-point thresholds. A call first **checks**, tentatively
//! reserving its projected cost, and after execution **commits** the
//! actual cost. Both phases are idempotent: a repeated check with the
//! same `request_id` returns the original reservation, and a repeated
//! commit with the same `(request_id, commit_id)` is a no-op, so retries
//! and restarts never double-charge.

mod memory;
mod sqlite;

pub use memory::MemoryBudget;
pub use sqlite::SqliteBudget;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which counter family a limit or violation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// Per-agent spending counter.
    Agent,
    /// Per-tool spending counter.
    Tool,
}

/// Thresholds applied to the counters. `None` means unlimited.
#[derive(Debug, Clone, Default)]
pub struct BudgetLimits {
    /// Cap per `agent:<id>` counter.
    pub per_agent: Option<Decimal>,
    /// Cap per `tool:<action>` counter.
    pub per_tool: Option<Decimal>,
    /// Optional rolling window; counters reset when it elapses.
    pub window: Option<Duration>,
}

/// One call's charge, as presented to `check`.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// The invocation being charged.
    pub request_id: String,
    /// Calling agent identity.
    pub agent_id: String,
    /// Guarded callable identity.
    pub action: String,
    /// Cost reserved before execution.
    pub projected_cost: Decimal,
    /// ISO currency tag (informational; counters are per-ledger single
    /// currency).
    pub currency: String,
}

/// A successful reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    /// Reservation identifier, stable across idempotent re-checks.
    pub check_id: String,
    /// The invocation charged.
    pub request_id: String,
    /// The tightest limit that applied, if any.
    pub limit: Option<Decimal>,
    /// The reserved amount.
    pub projected_cost: Decimal,
    /// Currency tag.
    pub currency: String,
    /// Whether the reservation succeeded (always `true` on the Ok path;
    /// kept for the wire shape).
    pub succeeded: bool,
    /// When the reservation was made.
    pub checked_at: DateTime<Utc>,
}

/// One call's settlement, as presented to `commit`.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// The reservation being settled.
    pub check_id: String,
    /// The invocation charged.
    pub request_id: String,
    /// Idempotency key for this settlement.
    pub commit_id: String,
    /// The cost actually incurred.
    pub actual_cost: Decimal,
    /// Currency tag.
    pub currency: String,
}

/// A finalized settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCommit {
    /// The settled reservation.
    pub check_id: String,
    /// Idempotency key of the settlement.
    pub commit_id: String,
    /// The invocation charged.
    pub request_id: String,
    /// The cost actually incurred.
    pub actual_cost: Decimal,
    /// Currency tag.
    pub currency: String,
    /// When the settlement was recorded.
    pub committed_at: DateTime<Utc>,
}

/// Errors from budget accounting. Every variant fails the call closed.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// The projected post-check total crosses a configured limit.
    #[error("budget exceeded on {counter}: {attempted} over limit {limit}")]
    Exceeded {
        /// Which counter family tripped.
        scope: BudgetScope,
        /// The counter name (`agent:<id>` or `tool:<action>`).
        counter: String,
        /// The configured cap.
        limit: Decimal,
        /// The total the reservation would have reached.
        attempted: Decimal,
    },

    /// `commit` referenced a reservation that does not exist.
    #[error("unknown budget check '{check_id}'")]
    UnknownCheck {
        /// The unresolvable reservation id.
        check_id: String,
    },

    /// A reservation was already settled under a different idempotency
    /// key.
    #[error("check '{check_id}' already committed as '{existing}', got '{commit_id}'")]
    CommitConflict {
        /// The reservation in question.
        check_id: String,
        /// The idempotency key of the prior settlement.
        existing: String,
        /// The conflicting key presented now.
        commit_id: String,
    },

    /// The backing store failed; the manager is unavailable.
    #[error("budget store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// The check-then-commit contract.
///
/// Implementations own their synchronization; the engine calls them from
/// concurrent invocation state machines.
pub trait BudgetManager: Send + Sync {
    /// Reserve `projected_cost`, failing closed on any crossed limit.
    ///
    /// Idempotent on `request_id`: a repeat returns the original
    /// [`BudgetCheck`] and leaves counters untouched.
    ///
    /// # Errors
    ///
    /// [`BudgetError::Exceeded`] when a counter would cross its cap, or
    /// [`BudgetError::Store`] when the manager is unavailable.
    fn check(&self, req: &ChargeRequest) -> Result<BudgetCheck, BudgetError>;

    /// Settle a reservation with the actual cost.
    ///
    /// Idempotent on `(request_id, commit_id)`; a replay with a
    /// different `commit_id` against the same check fails.
    ///
    /// # Errors
    ///
    /// [`BudgetError::UnknownCheck`], [`BudgetError::CommitConflict`],
    /// or [`BudgetError::Store`].
    fn commit(&self, req: &CommitRequest) -> Result<BudgetCommit, BudgetError>;

    /// Release reservations older than `ttl` that were never committed,
    /// returning how many were swept.
    ///
    /// # Errors
    ///
    /// [`BudgetError::Store`] when the manager is unavailable.
    fn sweep_stale(&self, ttl: Duration) -> Result<usize, BudgetError>;
}

/// Counter name for an agent.
#[must_use]
pub fn agent_counter(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

/// Counter name for a tool.
#[must_use]
pub fn tool_counter(action: &str) -> String {
    format!("tool:{action}")
}
