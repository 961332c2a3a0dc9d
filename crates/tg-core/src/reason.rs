// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fixed reason-code taxonomy recorded in decision evidence.
//!
//! Codes serialize verbatim to their `SCREAMING_SNAKE_CASE` form and are
//! guaranteed stable across releases; post-hoc search tooling keys on
//! them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, machine-readable tag explaining a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Policy allowed a low-risk call.
    PolicyAllowLowRisk,
    /// Policy denied a high-risk call.
    PolicyDenyHighRisk,
    /// Policy routed a high-value call to approval.
    PolicyRequireApprovalHighValue,
    /// The policy raised or returned an invalid result.
    PolicyEvaluationFailed,
    /// The per-agent budget counter crossed its threshold.
    BudgetExceededAgentRate,
    /// The per-tool budget counter crossed its threshold.
    BudgetExceededToolRate,
    /// The budget manager itself failed.
    BudgetEvaluationFailed,
    /// An approver explicitly declined the call.
    ApprovalDenied,
    /// The approval process failed: approver error, timeout, or a
    /// binding that does not match the decision.
    ApprovalProcessFailed,
    /// The decision entry could not be written to the evidence ledger.
    LedgerWriteFailedDecision,
}

impl ReasonCode {
    /// All codes, for exhaustive iteration in tests and tooling.
    pub const ALL: &'static [ReasonCode] = &[
        Self::PolicyAllowLowRisk,
        Self::PolicyDenyHighRisk,
        Self::PolicyRequireApprovalHighValue,
        Self::PolicyEvaluationFailed,
        Self::BudgetExceededAgentRate,
        Self::BudgetExceededToolRate,
        Self::BudgetEvaluationFailed,
        Self::ApprovalDenied,
        Self::ApprovalProcessFailed,
        Self::LedgerWriteFailedDecision,
    ];

    /// Stable string form, exactly as serialized.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyAllowLowRisk => "POLICY_ALLOW_LOW_RISK",
            Self::PolicyDenyHighRisk => "POLICY_DENY_HIGH_RISK",
            Self::PolicyRequireApprovalHighValue => "POLICY_REQUIRE_APPROVAL_HIGH_VALUE",
            Self::PolicyEvaluationFailed => "POLICY_EVALUATION_FAILED",
            Self::BudgetExceededAgentRate => "BUDGET_EXCEEDED_AGENT_RATE",
            Self::BudgetExceededToolRate => "BUDGET_EXCEEDED_TOOL_RATE",
            Self::BudgetEvaluationFailed => "BUDGET_EVALUATION_FAILED",
            Self::ApprovalDenied => "APPROVAL_DENIED",
            Self::ApprovalProcessFailed => "APPROVAL_PROCESS_FAILED",
            Self::LedgerWriteFailedDecision => "LEDGER_WRITE_FAILED_DECISION",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
