// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Canonical encoding and hashing for Toolgate evidence.
//!
//! Every hash in the evidence pipeline (`policy_hash`, `decision_hash`,
//! `entry_hash`) is SHA-256 over the byte-exact canonical form produced
//! here. The encoding is deterministic: NFC-normalized, lexicographically
//! sorted object keys, no whitespace, exact decimal numbers, fixed-width
//! Zulu timestamps. Changing any rule in this crate is a breaking
//! ledger-format change; the golden vectors in the test module are the
//! compatibility contract.

mod encode;
mod value;

pub use encode::{encode, parse};
pub use value::{CanonValue, to_canon};

use sha2::{Digest, Sha256};

pub mod timestamp;

/// Errors from canonicalization.
#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    /// A number literal is not representable in the canonical universe
    /// (exponent form, non-decimal float, or out-of-range magnitude).
    #[error("number '{literal}' has no canonical form: {reason}")]
    InvalidNumber {
        /// The offending literal as it appeared in the input.
        literal: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Two object keys collide after NFC normalization.
    #[error("duplicate object key after NFC normalization: '{key}'")]
    DuplicateKey {
        /// The normalized key that appeared more than once.
        key: String,
    },

    /// The input is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Compute the lowercase-hex SHA-256 of a value's canonical bytes.
///
/// # Errors
///
/// Returns [`CanonError`] if the value cannot be canonically encoded
/// (duplicate keys after normalization).
///
/// # Examples
///
/// ```
/// use tg_canon::{hash, CanonValue};
///
/// let h = hash(&CanonValue::Null).unwrap();
/// assert_eq!(h.len(), 64);
/// ```
pub fn hash(value: &CanonValue) -> Result<String, CanonError> {
    let bytes = encode(value)?;
    Ok(sha256_hex(&bytes))
}

/// Canonicalize an arbitrary JSON value and hash it.
///
/// Convenience over [`to_canon`] + [`hash`].
///
/// # Errors
///
/// Returns [`CanonError`] if the value carries a non-canonical number or
/// colliding keys.
pub fn hash_json(value: &serde_json::Value) -> Result<String, CanonError> {
    hash(&to_canon(value)?)
}

/// Canonicalize any serializable value and hash it.
///
/// # Errors
///
/// Returns [`CanonError`] if serialization fails or the serialized form
/// cannot be canonicalized.
pub fn hash_serializable<T: serde::Serialize>(value: &T) -> Result<String, CanonError> {
    let json = serde_json::to_value(value)?;
    hash_json(&json)
}

/// Lowercase-hex SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests;
