// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core error types shared across the pipeline.

use crate::reason::ReasonCode;

/// The policy raised, or returned something unusable.
///
/// Always fails closed: the engine records a deny with
/// `POLICY_EVALUATION_FAILED` and the callable never runs.
#[derive(Debug, thiserror::Error)]
#[error("policy evaluation failed: {message}")]
pub struct PolicyError {
    /// What went wrong.
    pub message: String,
}

impl PolicyError {
    /// Build from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The normal "not authorized" outcome.
///
/// Raised only after the deny decision is durably recorded; carries the
/// reason the caller is allowed to see.
#[derive(Debug, Clone, thiserror::Error)]
#[error("call denied: {reason}")]
pub struct ApprovalDenied {
    /// Human-readable reason.
    pub reason: String,
    /// Stable taxonomy tag.
    pub reason_code: Option<ReasonCode>,
}

impl ApprovalDenied {
    /// Build a denial with its taxonomy tag.
    pub fn new(reason: impl Into<String>, reason_code: Option<ReasonCode>) -> Self {
        Self {
            reason: reason.into(),
            reason_code,
        }
    }
}
