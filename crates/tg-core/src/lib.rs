// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! tg-core
//!
//! The stable contract for Toolgate: the call context a policy sees, the
//! policy decision it returns, the fixed reason-code taxonomy, and the
//! decision/outcome records that land in the evidence ledger.
//!
//! If you only take one dependency, take this one.

/// Typed errors shared across the pipeline.
pub mod error;
/// Decision-hash and policy-hash construction.
pub mod hash;
/// Stable reason-code taxonomy.
pub mod reason;
/// Decision, outcome, and ledger-entry records.
pub mod record;

pub use error::{ApprovalDenied, PolicyError};
pub use hash::{decision_hash, decision_payload, policy_hash};
pub use reason::ReasonCode;
pub use record::{
    ApprovalBlock, Binding, DecisionBlock, Effect, EventKind, LedgerEntry, OutcomeBlock,
    OutcomeStatus, Parameters,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record schema version carried by every ledger entry and pinned inside
/// the decision-hash payload.
pub const SCHEMA_VERSION: &str = "2.0";

/// Chain-format version carried by every ledger entry.
pub const LEDGER_VERSION: &str = "1.0";

/// Principal recorded when the caller supplies no `agent_id`.
pub const UNKNOWN_PRINCIPAL: &str = "unknown";

/// Metadata key carrying the calling agent's identity.
pub const AGENT_ID_KEY: &str = "agent_id";

/// Immutable snapshot of one pending invocation.
///
/// Constructed once per guarded call, after redaction; the policy, the
/// approver display and the ledger all observe this and nothing earlier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContext {
    /// Fully-qualified identity of the guarded callable.
    pub action: String,
    /// Positional arguments, already redacted.
    pub args: Vec<Value>,
    /// Keyword arguments, already redacted. Keys are unique.
    pub kwargs: BTreeMap<String, Value>,
    /// Extensible metadata (carries `agent_id`, correlation ids).
    pub metadata: BTreeMap<String, Value>,
}

impl CallContext {
    /// Build a context, applying redaction to every tree exactly once.
    #[must_use]
    pub fn redacted(
        action: impl Into<String>,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        metadata: &BTreeMap<String, Value>,
    ) -> Self {
        Self {
            action: action.into(),
            args: tg_redact::redact_args(args),
            kwargs: tg_redact::redact_map(kwargs),
            metadata: tg_redact::redact_map(metadata),
        }
    }

    /// The calling agent's identity, or [`UNKNOWN_PRINCIPAL`].
    #[must_use]
    pub fn agent_id(&self) -> &str {
        self.metadata
            .get(AGENT_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_PRINCIPAL)
    }

    /// The redacted parameters block written to evidence records.
    #[must_use]
    pub fn parameters(&self) -> Parameters {
        Parameters {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

/// A policy's verdict for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum PolicyDecision {
    /// Proceed without further ceremony.
    Allow {
        /// Human-readable reason.
        reason: String,
        /// Stable taxonomy tag.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_code: Option<ReasonCode>,
    },
    /// Refuse; the callable is never invoked.
    Deny {
        /// Human-readable reason.
        reason: String,
        /// Stable taxonomy tag.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_code: Option<ReasonCode>,
    },
    /// Proceed only with an explicit approval bound to this decision.
    RequireApproval {
        /// Human-readable reason.
        reason: String,
        /// Stable taxonomy tag.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_code: Option<ReasonCode>,
    },
}

impl PolicyDecision {
    /// Shorthand constructor.
    pub fn allow(reason: impl Into<String>, reason_code: Option<ReasonCode>) -> Self {
        Self::Allow {
            reason: reason.into(),
            reason_code,
        }
    }

    /// Shorthand constructor.
    pub fn deny(reason: impl Into<String>, reason_code: Option<ReasonCode>) -> Self {
        Self::Deny {
            reason: reason.into(),
            reason_code,
        }
    }

    /// Shorthand constructor.
    pub fn require_approval(reason: impl Into<String>, reason_code: Option<ReasonCode>) -> Self {
        Self::RequireApproval {
            reason: reason.into(),
            reason_code,
        }
    }

    /// The human-readable reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Allow { reason, .. }
            | Self::Deny { reason, .. }
            | Self::RequireApproval { reason, .. } => reason,
        }
    }

    /// The taxonomy tag, if the policy attached one.
    #[must_use]
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Self::Allow { reason_code, .. }
            | Self::Deny { reason_code, .. }
            | Self::RequireApproval { reason_code, .. } => *reason_code,
        }
    }
}

/// The policy contract: a pure decision function over a call context.
///
/// Implementations are arbitrary code; the engine depends only on this
/// capability, injected at construction. `evaluate` must be side-effect
/// free; engines call it concurrently.
pub trait Policy: Send + Sync {
    /// Stable identifier mixed into `policy_hash` (conventionally the
    /// fully-qualified type name).
    fn policy_id(&self) -> String;

    /// Optional digest of the policy's source, mixed into `policy_hash`
    /// when present.
    fn source_digest(&self) -> Option<String> {
        None
    }

    /// Decide whether the invocation may proceed.
    ///
    /// # Errors
    ///
    /// Any error here denies the call with `POLICY_EVALUATION_FAILED`.
    fn evaluate(&self, ctx: &CallContext) -> Result<PolicyDecision, PolicyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_redacts_on_construction() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("api_key".to_string(), json!("sk-abcdefghijklmnopqrstuvwx"));
        kwargs.insert("amount".to_string(), json!(10));
        let ctx = CallContext::redacted("billing.refund", &[], &kwargs, &BTreeMap::new());
        assert_eq!(ctx.kwargs["api_key"], json!(tg_redact::REDACTED));
        assert_eq!(ctx.kwargs["amount"], json!(10));
    }

    #[test]
    fn agent_id_defaults_to_unknown() {
        let ctx = CallContext::redacted("a.b", &[], &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(ctx.agent_id(), UNKNOWN_PRINCIPAL);

        let mut meta = BTreeMap::new();
        meta.insert(AGENT_ID_KEY.to_string(), json!("agent-7"));
        let ctx = CallContext::redacted("a.b", &[], &BTreeMap::new(), &meta);
        assert_eq!(ctx.agent_id(), "agent-7");
    }

    #[test]
    fn decision_accessors() {
        let d = PolicyDecision::deny("blocked", Some(ReasonCode::PolicyDenyHighRisk));
        assert_eq!(d.reason(), "blocked");
        assert_eq!(d.reason_code(), Some(ReasonCode::PolicyDenyHighRisk));
    }
}
