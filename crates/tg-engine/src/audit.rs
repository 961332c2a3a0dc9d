// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operational (non-chained) audit sink.
//!
//! A convenience mirror of pipeline activity for dashboards and log
//! pipelines. The tamper-evident record is the ledger; sink failures
//! are swallowed and must never block a call.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tg_core::{Effect, LedgerEntry, OutcomeStatus, ReasonCode};

/// One operational audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// `decision` or `outcome`.
    pub kind: String,
    /// The invocation this event belongs to.
    pub request_id: String,
    /// Guarded callable identity.
    pub action: String,
    /// Calling agent.
    pub agent_id: String,
    /// allow/deny for decisions, success/error for outcomes.
    pub status: String,
    /// Taxonomy tag, when one applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    /// Event time.
    #[serde(with = "tg_canon::timestamp")]
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Mirror a decision ledger entry.
    #[must_use]
    pub fn from_decision(entry: &LedgerEntry) -> Self {
        let (status, reason_code) = entry.decision.as_ref().map_or_else(
            || ("unknown".to_string(), None),
            |d| {
                (
                    match d.effect {
                        Effect::Allow => "allow".to_string(),
                        Effect::Deny => "deny".to_string(),
                    },
                    d.reason_code,
                )
            },
        );
        Self {
            kind: "decision".to_string(),
            request_id: entry.request_id.clone(),
            action: entry.action.clone(),
            agent_id: entry.agent_id.clone(),
            status,
            reason_code,
            at: entry.created_at,
        }
    }

    /// Mirror an outcome ledger entry.
    #[must_use]
    pub fn from_outcome(entry: &LedgerEntry) -> Self {
        let status = entry.outcome.as_ref().map_or("unknown", |o| match o.status {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
        });
        Self {
            kind: "outcome".to_string(),
            request_id: entry.request_id.clone(),
            action: entry.action.clone(),
            agent_id: entry.agent_id.clone(),
            status: status.to_string(),
            reason_code: None,
            at: entry.created_at,
        }
    }
}

/// Best-effort operational logging; never fails the pipeline.
pub trait AuditSink: Send + Sync {
    /// Record one event. Implementations swallow their own failures.
    fn record(&self, event: &AuditEvent);
}

/// Sink that emits structured `tracing` events.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        info!(
            target: "toolgate.audit",
            kind = %event.kind,
            request_id = %event.request_id,
            action = %event.action,
            agent_id = %event.agent_id,
            status = %event.status,
            reason_code = event.reason_code.map(|c| c.as_str()),
            "audit event"
        );
    }
}

/// Sink that appends JSON lines to a plain file (no chaining).
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    /// Create a sink appending to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) {
        let attempt = (|| -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let line = serde_json::to_string(event)?;
            writeln!(file, "{line}")
        })();
        if let Err(e) = attempt {
            warn!(target: "toolgate.audit", error = %e, "operational audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path);
        sink.record(&AuditEvent {
            kind: "decision".into(),
            request_id: "r1".into(),
            action: "a.b".into(),
            agent_id: "agent-1".into(),
            status: "allow".into(),
            reason_code: Some(ReasonCode::PolicyAllowLowRisk),
            at: Utc::now(),
        });
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("POLICY_ALLOW_LOW_RISK"));
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn jsonl_sink_swallows_write_failures() {
        let sink = JsonlAuditSink::new("/nonexistent-dir/audit.jsonl");
        // Must not panic.
        sink.record(&AuditEvent {
            kind: "outcome".into(),
            request_id: "r1".into(),
            action: "a.b".into(),
            agent_id: "agent-1".into(),
            status: "success".into(),
            reason_code: None,
            at: Utc::now(),
        });
    }
}
