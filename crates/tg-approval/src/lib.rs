// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Approval contract and pending-approval stores.
//!
//! An approver resolves a `REQUIRE_APPROVAL` policy verdict into a
//! grant or refusal, always bound to one specific decision via the
//! `{request_id, policy_hash, decision_hash}` triple. The store keeps
//! pending state durable (or at least shared) so approvals can survive
//! restarts and cross process boundaries; records move
//! pending → approved | denied | expired, and expired means denied.

mod memory;
mod sqlite;

pub use memory::MemoryApprovalStore;
pub use sqlite::SqliteApprovalStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tg_core::{Binding, CallContext, PolicyDecision};

/// Wall-clock grace when two processes share one store; expiry observed
/// within this window still counts as expired, never as granted.
pub const EXPIRY_SKEW: Duration = Duration::seconds(2);

/// Lifecycle state of an approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    /// Dispatched, awaiting resolution.
    Pending,
    /// Granted by an approver.
    Approved,
    /// Refused by an approver.
    Denied,
    /// TTL elapsed before resolution; treated as denied.
    Expired,
}

impl ApprovalState {
    /// Stable lowercase form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }
}

/// A durable approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Record identifier.
    pub approval_id: String,
    /// Current lifecycle state.
    pub state: ApprovalState,
    /// When the approval was dispatched.
    pub created_at: DateTime<Utc>,
    /// When it was resolved, if it was.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Wall-clock expiry, if one was set.
    pub expires_at: Option<DateTime<Utc>>,
    /// The decision this approval is bound to.
    pub binding: Binding,
    /// Whether the call was granted.
    pub approved: bool,
    /// Who resolved it, when known.
    pub approver_id: Option<String>,
}

impl ApprovalRecord {
    /// Start a pending record for a binding, expiring after `ttl`.
    #[must_use]
    pub fn pending(approval_id: String, binding: Binding, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        Self {
            approval_id,
            state: ApprovalState::Pending,
            created_at,
            resolved_at: None,
            expires_at: ttl.map(|t| created_at + t),
            binding,
            approved: false,
            approver_id: None,
        }
    }

    /// Whether the record's expiry has passed (with [`EXPIRY_SKEW`]).
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at + EXPIRY_SKEW)
    }
}

/// What an approver returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Whether the call may proceed.
    pub approved: bool,
    /// Identity of the approver, when known.
    pub approver_id: Option<String>,
    /// Echo of the binding the approver examined. The engine rejects
    /// any response whose binding differs from the decision's.
    pub binding: Binding,
}

impl ApprovalResponse {
    /// A grant for the given binding.
    #[must_use]
    pub fn granted(binding: Binding, approver_id: Option<String>) -> Self {
        Self {
            approved: true,
            approver_id,
            binding,
        }
    }

    /// A refusal for the given binding.
    #[must_use]
    pub fn denied(binding: Binding, approver_id: Option<String>) -> Self {
        Self {
            approved: false,
            approver_id,
            binding,
        }
    }
}

/// Errors from approvers and approval stores.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// The approver raised or misbehaved.
    #[error("approval process failed: {message}")]
    Failed {
        /// What went wrong.
        message: String,
    },

    /// The approver did not answer within the configured timeout.
    #[error("approval timed out after {seconds}s")]
    Timeout {
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// A record was not in the state the transition requires
    /// (approvals are single-use).
    #[error("approval '{approval_id}' is {state}, expected pending")]
    InvalidState {
        /// The record in question.
        approval_id: String,
        /// Its actual state.
        state: &'static str,
    },

    /// The requested record does not exist.
    #[error("unknown approval '{approval_id}'")]
    Unknown {
        /// The unresolvable record id.
        approval_id: String,
    },

    /// The backing store failed.
    #[error("approval store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// An external approval authority.
///
/// Implementations range from terminal prompts to ticketing systems;
/// the engine only requires this capability and a bounded response
/// time (it enforces its own timeout around the call).
#[async_trait]
pub trait Approver: Send + Sync {
    /// Resolve an approval request for one bound decision.
    ///
    /// # Errors
    ///
    /// Any error (or timeout at the engine) denies the call with
    /// `APPROVAL_PROCESS_FAILED`.
    async fn approve(
        &self,
        ctx: &CallContext,
        decision: &PolicyDecision,
        binding: &Binding,
    ) -> Result<ApprovalResponse, ApprovalError>;
}

/// Durable (or shared) pending-approval state.
pub trait ApprovalStore: Send + Sync {
    /// Persist a freshly dispatched pending record.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Store`] on persistence failure.
    fn put_pending(&self, record: ApprovalRecord) -> Result<(), ApprovalError>;

    /// Atomically transition a pending record to approved/denied.
    ///
    /// A record past its expiry transitions to expired instead and is
    /// returned as such; resolving a non-pending record is an error
    /// (approvals are single-use).
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Unknown`], [`ApprovalError::InvalidState`], or
    /// [`ApprovalError::Store`].
    fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
        approver_id: Option<&str>,
    ) -> Result<ApprovalRecord, ApprovalError>;

    /// Fetch a record by id.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Store`] on read failure.
    fn get(&self, approval_id: &str) -> Result<Option<ApprovalRecord>, ApprovalError>;

    /// Fetch the record bound to a request, if any.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Store`] on read failure.
    fn get_by_request(&self, request_id: &str) -> Result<Option<ApprovalRecord>, ApprovalError>;

    /// Transition every overdue pending record to expired, returning
    /// how many moved.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Store`] on persistence failure.
    fn sweep_expired(&self) -> Result<usize, ApprovalError>;
}

/// Test/demo approver with a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticApprover {
    approve: bool,
    approver_id: Option<String>,
}

impl StaticApprover {
    /// An approver that grants everything.
    #[must_use]
    pub fn granting(approver_id: impl Into<String>) -> Self {
        Self {
            approve: true,
            approver_id: Some(approver_id.into()),
        }
    }

    /// An approver that refuses everything.
    #[must_use]
    pub fn denying() -> Self {
        Self {
            approve: false,
            approver_id: None,
        }
    }
}

#[async_trait]
impl Approver for StaticApprover {
    async fn approve(
        &self,
        _ctx: &CallContext,
        _decision: &PolicyDecision,
        binding: &Binding,
    ) -> Result<ApprovalResponse, ApprovalError> {
        Ok(ApprovalResponse {
            approved: self.approve,
            approver_id: self.approver_id.clone(),
            binding: binding.clone(),
        })
    }
}

/// Environment toggle honored by [`EnvAutoApprover::from_default_env`].
/// Demos only; never wire this into production engines.
pub const AUTO_APPROVE_ENV: &str = "TOOLGATE_AUTO_APPROVE";

/// Demo-only approver driven by an environment toggle, read once at
/// construction (environment lookup stays at the outer boundary).
#[derive(Debug, Clone)]
pub struct EnvAutoApprover {
    enabled: bool,
}

impl EnvAutoApprover {
    /// Read the toggle from the named environment variable.
    #[must_use]
    pub fn from_env(var: &str) -> Self {
        let enabled = std::env::var(var)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self { enabled }
    }

    /// Read the standard [`AUTO_APPROVE_ENV`] toggle.
    #[must_use]
    pub fn from_default_env() -> Self {
        Self::from_env(AUTO_APPROVE_ENV)
    }
}

#[async_trait]
impl Approver for EnvAutoApprover {
    async fn approve(
        &self,
        _ctx: &CallContext,
        _decision: &PolicyDecision,
        binding: &Binding,
    ) -> Result<ApprovalResponse, ApprovalError> {
        if self.enabled {
            Ok(ApprovalResponse::granted(
                binding.clone(),
                Some("auto-approve".to_string()),
            ))
        } else {
            Ok(ApprovalResponse::denied(binding.clone(), None))
        }
    }
}
