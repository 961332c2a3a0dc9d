// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evidence records: the decision and outcome entries the ledger chains.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reason::ReasonCode;
use crate::{LEDGER_VERSION, SCHEMA_VERSION};

/// Whether the call was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// The callable may run.
    Allow,
    /// The callable is blocked.
    Deny,
}

/// How the guarded callable ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// The callable returned normally.
    Success,
    /// The callable raised.
    Error,
}

/// Discriminant for the two entry kinds in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Pre-execution authorization evidence.
    Decision,
    /// Post-execution result evidence.
    Outcome,
}

/// Redacted invocation parameters as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Positional arguments, redacted.
    pub args: Vec<Value>,
    /// Keyword arguments, redacted.
    pub kwargs: BTreeMap<String, Value>,
}

/// The triple that makes an approval specific to exactly one decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// The invocation being approved.
    pub request_id: String,
    /// Hash of the evaluating policy's identity.
    pub policy_hash: String,
    /// Hash of the decision payload being approved.
    pub decision_hash: String,
}

/// The authorization block of a decision entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBlock {
    /// allow or deny.
    pub effect: Effect,
    /// Human-readable reason from the policy (or the failure path).
    pub reason: String,
    /// Stable taxonomy tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    /// Stable identifier of the policy that decided.
    pub policy_id: String,
    /// Hash of the policy identity.
    pub policy_hash: String,
    /// Hash of the canonical decision payload; the identifier approvals
    /// bind to and outcomes reference.
    pub decision_hash: String,
}

/// The result block of an outcome entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeBlock {
    /// success or error.
    pub status: OutcomeStatus,
    /// Type name of the error, when status is error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Error message, truncated to 200 characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Back-reference to the authorizing decision entry.
    pub decision_hash: String,
}

/// Embedded record of the approval that authorized a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalBlock {
    /// Identifier of the approval record.
    pub approval_id: String,
    /// Whether the approver granted the call.
    pub approved: bool,
    /// Who resolved the approval, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    /// The decision this approval is bound to.
    pub binding: Binding,
}

/// One chained entry in the evidence ledger.
///
/// `prev_entry_hash`, `entry_hash` and `entry_signature` are always
/// serialized (as `null` when absent): the entry hash is computed over
/// the canonical form with the last two set to `null`, so their presence
/// is part of the hashed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Record schema version.
    pub schema_version: String,
    /// Chain format version.
    pub ledger_version: String,
    /// Unique id of the logical invocation (random 128-bit, uuid form).
    pub request_id: String,
    /// When this entry was created (UTC, microsecond precision).
    #[serde(with = "tg_canon::timestamp")]
    pub created_at: DateTime<Utc>,
    /// decision or outcome.
    pub event: EventKind,
    /// Fully-qualified callable identity.
    pub action: String,
    /// Calling agent, or `"unknown"`.
    pub agent_id: String,
    /// Present on decision entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionBlock>,
    /// Present on outcome entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeBlock>,
    /// Present when an approval authorized the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalBlock>,
    /// Redacted invocation parameters.
    pub parameters: Parameters,
    /// Redacted caller metadata.
    pub metadata: BTreeMap<String, Value>,
    /// `entry_hash` of the predecessor; `null` only for entry 0.
    pub prev_entry_hash: Option<String>,
    /// SHA-256 of this entry's canonical form (hash fields nulled).
    pub entry_hash: Option<String>,
    /// Ed25519 signature over the raw `entry_hash` bytes, hex.
    pub entry_signature: Option<String>,
}

impl LedgerEntry {
    /// Start a decision entry; chain fields stay unset until append.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn decision(
        request_id: String,
        created_at: DateTime<Utc>,
        action: String,
        agent_id: String,
        decision: DecisionBlock,
        approval: Option<ApprovalBlock>,
        parameters: Parameters,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            ledger_version: LEDGER_VERSION.to_string(),
            request_id,
            created_at,
            event: EventKind::Decision,
            action,
            agent_id,
            decision: Some(decision),
            outcome: None,
            approval,
            parameters,
            metadata,
            prev_entry_hash: None,
            entry_hash: None,
            entry_signature: None,
        }
    }

    /// Start an outcome entry; chain fields stay unset until append.
    #[must_use]
    pub fn outcome(
        request_id: String,
        created_at: DateTime<Utc>,
        action: String,
        agent_id: String,
        outcome: OutcomeBlock,
        parameters: Parameters,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            ledger_version: LEDGER_VERSION.to_string(),
            request_id,
            created_at,
            event: EventKind::Outcome,
            action,
            agent_id,
            decision: None,
            outcome: Some(outcome),
            approval: None,
            parameters,
            metadata,
            prev_entry_hash: None,
            entry_hash: None,
            entry_signature: None,
        }
    }

    /// A copy with `entry_hash` and `entry_signature` nulled: the shape
    /// the entry hash is computed over.
    #[must_use]
    pub fn hashable(&self) -> Self {
        let mut copy = self.clone();
        copy.entry_hash = None;
        copy.entry_signature = None;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_decision() -> LedgerEntry {
        LedgerEntry::decision(
            "req-1".into(),
            Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap(),
            "billing.refund".into(),
            "agent-1".into(),
            DecisionBlock {
                effect: Effect::Allow,
                reason: "within limit".into(),
                reason_code: Some(ReasonCode::PolicyAllowLowRisk),
                policy_id: "refund_policy".into(),
                policy_hash: "p".repeat(64),
                decision_hash: "d".repeat(64),
            },
            None,
            Parameters::default(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn chain_fields_serialize_as_null_when_unset() {
        let entry = sample_decision();
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["prev_entry_hash"].is_null());
        assert!(json["entry_hash"].is_null());
        assert!(json["entry_signature"].is_null());
    }

    #[test]
    fn effect_and_event_serialize_lowercase() {
        let entry = sample_decision();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "decision");
        assert_eq!(json["decision"]["effect"], "allow");
    }

    #[test]
    fn timestamps_serialize_canonically() {
        let entry = sample_decision();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["created_at"], "2026-08-01T09:30:00.000000Z");
    }

    #[test]
    fn hashable_nulls_only_hash_and_signature() {
        let mut entry = sample_decision();
        entry.prev_entry_hash = Some("x".repeat(64));
        entry.entry_hash = Some("y".repeat(64));
        entry.entry_signature = Some("z".repeat(128));
        let hashable = entry.hashable();
        assert_eq!(hashable.prev_entry_hash, entry.prev_entry_hash);
        assert!(hashable.entry_hash.is_none());
        assert!(hashable.entry_signature.is_none());
    }

    #[test]
    fn roundtrip() {
        let entry = sample_decision();
        let json = serde_json::to_string(&entry).unwrap();
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
