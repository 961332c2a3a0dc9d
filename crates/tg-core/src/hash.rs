// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decision-hash and policy-hash construction.
//!
//! The decision hash is the stable identifier approvals bind to and
//! outcome entries reference. It covers exactly eight canonical fields;
//! reason text and effect are deliberately outside it, so re-wording a
//! reason does not detach approvals.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use tg_canon::{CanonError, hash_json};

use crate::record::Parameters;

/// Version pinned inside every decision payload.
pub const DECISION_PAYLOAD_VERSION: &str = "2.0";

/// Hash a policy's stable identity.
///
/// With only an identifier, this is the hash of the canonical string.
/// When the policy also exposes a source digest, the two are hashed as a
/// canonical map `{"policy_id": .., "source_digest": ..}` so neither
/// input can be confused for the other.
#[must_use]
pub fn policy_hash(policy_id: &str, source_digest: Option<&str>) -> String {
    let payload = match source_digest {
        Some(digest) => json!({"policy_id": policy_id, "source_digest": digest}),
        None => Value::String(policy_id.to_string()),
    };
    // Two distinct literal keys and string values: canonicalization of
    // this payload cannot fail.
    hash_json(&payload).expect("policy identity payload is canonical")
}

/// Build the canonical decision payload.
///
/// Field set and shape are part of the ledger format:
///
/// ```json
/// { "version": "2.0",
///   "request_id": "...",
///   "decision_at": "YYYY-MM-DDTHH:MM:SS.ssssssZ",
///   "policy_hash": "...",
///   "intent": "<action>",
///   "resource": {"type": "function", "name": "<action>"},
///   "parameters": {"args": [...], "kwargs": {...}},
///   "actor": {"principal": "<agent or unknown>", "source": "sdk"} }
/// ```
#[must_use]
pub fn decision_payload(
    request_id: &str,
    decision_at: DateTime<Utc>,
    policy_hash: &str,
    action: &str,
    parameters: &Parameters,
    agent_id: &str,
) -> Value {
    json!({
        "version": DECISION_PAYLOAD_VERSION,
        "request_id": request_id,
        "decision_at": tg_canon::timestamp::format(decision_at),
        "policy_hash": policy_hash,
        "intent": action,
        "resource": {"type": "function", "name": action},
        "parameters": {"args": parameters.args, "kwargs": parameters.kwargs},
        "actor": {"principal": agent_id, "source": "sdk"},
    })
}

/// Hash the canonical decision payload.
///
/// # Errors
///
/// [`CanonError`] when the redacted parameters carry values outside the
/// canonical universe (e.g. binary floats); surfaced, never coerced.
pub fn decision_hash(
    request_id: &str,
    decision_at: DateTime<Utc>,
    policy_hash: &str,
    action: &str,
    parameters: &Parameters,
    agent_id: &str,
) -> Result<String, CanonError> {
    hash_json(&decision_payload(
        request_id,
        decision_at,
        policy_hash,
        action,
        parameters,
        agent_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params() -> Parameters {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("user".to_string(), json!("u1"));
        kwargs.insert("amount".to_string(), json!(10));
        Parameters {
            args: vec![],
            kwargs,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn stable_for_identical_inputs() {
        let a = decision_hash("r1", at(), "ph", "refund", &params(), "agent-1").unwrap();
        let b = decision_hash("r1", at(), "ph", "refund", &params(), "agent-1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn every_canonical_field_is_significant() {
        let base = decision_hash("r1", at(), "ph", "refund", &params(), "agent-1").unwrap();

        assert_ne!(
            base,
            decision_hash("r2", at(), "ph", "refund", &params(), "agent-1").unwrap()
        );
        let later = at() + chrono::Duration::microseconds(1);
        assert_ne!(
            base,
            decision_hash("r1", later, "ph", "refund", &params(), "agent-1").unwrap()
        );
        assert_ne!(
            base,
            decision_hash("r1", at(), "ph2", "refund", &params(), "agent-1").unwrap()
        );
        assert_ne!(
            base,
            decision_hash("r1", at(), "ph", "payout", &params(), "agent-1").unwrap()
        );
        let mut other = params();
        other.kwargs.insert("amount".to_string(), json!(11));
        assert_ne!(
            base,
            decision_hash("r1", at(), "ph", "refund", &other, "agent-1").unwrap()
        );
        assert_ne!(
            base,
            decision_hash("r1", at(), "ph", "refund", &params(), "agent-2").unwrap()
        );
    }

    #[test]
    fn policy_hash_plain_vs_digest_forms_differ() {
        let plain = policy_hash("refund_policy", None);
        let mixed = policy_hash("refund_policy", Some("abc123"));
        assert_ne!(plain, mixed);
        assert_eq!(plain.len(), 64);
        assert_eq!(mixed.len(), 64);
    }

    #[test]
    fn payload_shape_is_pinned() {
        let payload = decision_payload("r1", at(), "ph", "refund", &params(), "agent-1");
        assert_eq!(payload["version"], "2.0");
        assert_eq!(payload["intent"], "refund");
        assert_eq!(payload["resource"]["type"], "function");
        assert_eq!(payload["resource"]["name"], "refund");
        assert_eq!(payload["actor"]["principal"], "agent-1");
        assert_eq!(payload["actor"]["source"], "sdk");
        assert_eq!(payload["decision_at"], "2026-08-01T09:30:00.000000Z");
    }
}
