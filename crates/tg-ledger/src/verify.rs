// SPDX-License-Identifier: MIT OR Apache-2.0

//! Offline replay verification of an evidence chain.
//!
//! The verifier re-derives every hash from the stored canonical text and
//! walks the chain in order. It never consults the writer: a report is
//! producible from the ledger file or table alone, plus an optional
//! public key for signature checks.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tg_core::{EventKind, LEDGER_VERSION, LedgerEntry, SCHEMA_VERSION};

use crate::sign::verify_entry_hash;

/// The enumerable verification failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// `prev_entry_hash` does not match the predecessor's `entry_hash`.
    ChainBreak,
    /// A recomputed hash disagrees with the stored one.
    Tamper,
    /// Unsupported `schema_version` / `ledger_version`.
    Version,
    /// An outcome references a decision hash never seen before it.
    OrphanOutcome,
    /// An outcome's decision hash belongs to a different `request_id`.
    BoundMismatch,
    /// An entry signature fails Ed25519 verification.
    Signature,
    /// The stored text is not byte-exact canonical form (including a
    /// truncated trailing line).
    CanonicalForm,
}

impl FailureKind {
    /// Stable kebab-case form, exactly as serialized.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChainBreak => "chain-break",
            Self::Tamper => "tamper",
            Self::Version => "version",
            Self::OrphanOutcome => "orphan-outcome",
            Self::BoundMismatch => "bound-mismatch",
            Self::Signature => "signature",
            Self::CanonicalForm => "canonical-form",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First offending position and what was wrong there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyFailure {
    /// Zero-based entry position.
    pub position: usize,
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub detail: String,
}

/// Machine-readable verification report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    /// `true` only when every check passed.
    pub ok: bool,
    /// Number of complete entries examined.
    pub entries: usize,
    /// The first failure, if any. Verification stops at the first one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<VerifyFailure>,
    /// How many entry signatures were actually checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures_checked: Option<usize>,
}

/// Verification inputs beyond the stored entries themselves.
#[derive(Default)]
pub struct VerifyOptions {
    /// Check `entry_signature` fields against this key when present.
    /// Without a key, unsigned and signed entries both pass silently.
    pub public_key: Option<VerifyingKey>,
}

/// Raw stored entry text plus whether it was newline-terminated
/// (file backend) or row-complete (relational backend).
pub(crate) struct StoredLine {
    pub text: String,
    pub complete: bool,
}

/// Walk stored canonical lines in order, re-deriving every hash.
pub(crate) fn verify_lines(lines: &[StoredLine], options: &VerifyOptions) -> VerifyReport {
    let mut prev: Option<String> = None;
    let mut seen_decisions: HashMap<String, String> = HashMap::new();
    let mut signatures_checked = 0usize;
    let mut entries = 0usize;
    let mut first_failure: Option<VerifyFailure> = None;

    for (position, line) in lines.iter().enumerate() {
        if let Err((kind, detail)) = check_line(
            position,
            line,
            &mut prev,
            &mut seen_decisions,
            &mut signatures_checked,
            &mut entries,
            options,
        ) {
            first_failure = Some(VerifyFailure {
                position,
                kind,
                detail,
            });
            break;
        }
    }

    VerifyReport {
        ok: first_failure.is_none(),
        entries,
        first_failure,
        signatures_checked: options.public_key.as_ref().map(|_| signatures_checked),
    }
}

type CheckFailure = (FailureKind, String);

fn check_line(
    _position: usize,
    line: &StoredLine,
    prev: &mut Option<String>,
    seen_decisions: &mut HashMap<String, String>,
    signatures_checked: &mut usize,
    entries: &mut usize,
    options: &VerifyOptions,
) -> Result<(), CheckFailure> {
    if !line.complete {
        return Err((
            FailureKind::CanonicalForm,
            "truncated trailing line".to_string(),
        ));
    }

    // Byte-exact canonical form: parse, re-encode, compare.
    let canon = tg_canon::parse(&line.text)
        .map_err(|e| (FailureKind::CanonicalForm, format!("unparseable entry: {e}")))?;
    let reencoded = tg_canon::encode(&canon).map_err(|e| {
        (
            FailureKind::CanonicalForm,
            format!("entry cannot be re-encoded: {e}"),
        )
    })?;
    if reencoded != line.text.as_bytes() {
        return Err((
            FailureKind::CanonicalForm,
            "entry text is not in canonical form".to_string(),
        ));
    }

    let entry: LedgerEntry = serde_json::from_str(&line.text).map_err(|e| {
        (
            FailureKind::CanonicalForm,
            format!("entry does not match the record schema: {e}"),
        )
    })?;
    *entries += 1;

    if entry.schema_version != SCHEMA_VERSION || entry.ledger_version != LEDGER_VERSION {
        return Err((
            FailureKind::Version,
            format!(
                "unsupported versions schema={} ledger={}",
                entry.schema_version, entry.ledger_version
            ),
        ));
    }

    if entry.prev_entry_hash != *prev {
        return Err((
            FailureKind::ChainBreak,
            format!(
                "prev_entry_hash {:?} does not match predecessor {:?}",
                entry.prev_entry_hash, prev
            ),
        ));
    }

    let recomputed = crate::compute_entry_hash(&entry).map_err(|e| {
        (
            FailureKind::CanonicalForm,
            format!("entry hash cannot be recomputed: {e}"),
        )
    })?;
    let stored_hash = entry
        .entry_hash
        .clone()
        .ok_or_else(|| (FailureKind::Tamper, "entry_hash is null".to_string()))?;
    if recomputed != stored_hash {
        return Err((
            FailureKind::Tamper,
            format!("entry_hash mismatch: stored {stored_hash}, recomputed {recomputed}"),
        ));
    }

    if let Some(public_key) = options.public_key.as_ref()
        && let Some(signature) = entry.entry_signature.as_deref()
    {
        *signatures_checked += 1;
        if !verify_entry_hash(public_key, &stored_hash, signature) {
            return Err((
                FailureKind::Signature,
                "entry signature does not verify".to_string(),
            ));
        }
    }

    match entry.event {
        EventKind::Decision => {
            let decision = entry.decision.as_ref().ok_or_else(|| {
                (
                    FailureKind::CanonicalForm,
                    "decision entry lacks a decision block".to_string(),
                )
            })?;
            let derived = tg_core::decision_hash(
                &entry.request_id,
                entry.created_at,
                &decision.policy_hash,
                &entry.action,
                &entry.parameters,
                &entry.agent_id,
            )
            .map_err(|e| {
                (
                    FailureKind::CanonicalForm,
                    format!("decision payload cannot be hashed: {e}"),
                )
            })?;
            if derived != decision.decision_hash {
                return Err((
                    FailureKind::Tamper,
                    format!(
                        "decision_hash mismatch: stored {}, recomputed {derived}",
                        decision.decision_hash
                    ),
                ));
            }
            seen_decisions.insert(decision.decision_hash.clone(), entry.request_id.clone());
        }
        EventKind::Outcome => {
            let outcome = entry.outcome.as_ref().ok_or_else(|| {
                (
                    FailureKind::CanonicalForm,
                    "outcome entry lacks an outcome block".to_string(),
                )
            })?;
            match seen_decisions.get(&outcome.decision_hash) {
                None => {
                    return Err((
                        FailureKind::OrphanOutcome,
                        format!(
                            "outcome references unseen decision_hash {}",
                            outcome.decision_hash
                        ),
                    ));
                }
                Some(request_id) if *request_id != entry.request_id => {
                    return Err((
                        FailureKind::BoundMismatch,
                        format!(
                            "outcome request_id {} does not match decision request_id {request_id}",
                            entry.request_id
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    *prev = Some(stored_hash);
    Ok(())
}
