// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receipt extraction: a portable proof that one decision is anchored in
//! the chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tg_core::{EventKind, LedgerEntry};

use crate::LedgerError;

/// A standalone proof for one decision entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// Zero-based position of the entry in its ledger.
    pub ledger_position: usize,
    /// Record schema version of the entry.
    pub schema_version: String,
    /// Chain format version of the entry.
    pub ledger_version: String,
    /// The invocation the decision authorized.
    pub request_id: String,
    /// When the decision was made.
    #[serde(with = "tg_canon::timestamp")]
    pub created_at: DateTime<Utc>,
    /// The deciding policy's stable identifier.
    pub policy_id: String,
    /// Hash of the policy identity.
    pub policy_hash: String,
    /// The decision hash approvals bind to.
    pub decision_hash: String,
    /// The chain link for this entry.
    pub entry_hash: String,
    /// Ed25519 signature over the entry hash, when the ledger signs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_signature: Option<String>,
}

impl Receipt {
    /// Extract a receipt from a decision entry at a known position.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidEntry`] for outcome entries or entries whose
    /// chain fields were never filled.
    pub fn from_entry(ledger_position: usize, entry: &LedgerEntry) -> Result<Self, LedgerError> {
        if entry.event != EventKind::Decision {
            return Err(LedgerError::InvalidEntry {
                reason: "receipts are extracted from decision entries only".to_string(),
            });
        }
        let decision = entry
            .decision
            .as_ref()
            .ok_or_else(|| LedgerError::InvalidEntry {
                reason: "decision entry lacks a decision block".to_string(),
            })?;
        let entry_hash = entry
            .entry_hash
            .clone()
            .ok_or_else(|| LedgerError::InvalidEntry {
                reason: "entry has not been appended (no entry_hash)".to_string(),
            })?;
        Ok(Self {
            ledger_position,
            schema_version: entry.schema_version.clone(),
            ledger_version: entry.ledger_version.clone(),
            request_id: entry.request_id.clone(),
            created_at: entry.created_at,
            policy_id: decision.policy_id.clone(),
            policy_hash: decision.policy_hash.clone(),
            decision_hash: decision.decision_hash.clone(),
            entry_hash,
            entry_signature: entry.entry_signature.clone(),
        })
    }
}
