// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Tamper-evident evidence ledgers.
//!
//! Both backends implement the same append contract: the caller hands in
//! an entry without chain fields; the backend links it to the previous
//! entry, computes `entry_hash` over the canonical form (hash and
//! signature fields nulled), optionally signs the hash, and writes it
//! durably under an exclusive per-ledger writer lock. A crash mid-append
//! leaves the store with the entry either fully present and chained or
//! absent.
//!
//! Verification is a pure offline replay: it re-derives every hash,
//! walks the chain, checks decision/outcome bindings, and (given a
//! public key) validates signatures.

mod file;
mod receipt;
mod sign;
mod sqlite;
/// Offline chain verification.
pub mod verify;

pub use file::FileLedger;
pub use receipt::Receipt;
pub use sign::{
    generate_signing_key, load_signing_key, load_verifying_key, sign_entry_hash,
    verify_entry_hash, write_keypair_pem,
};
pub use sqlite::{Durability, SqliteLedger};
pub use verify::{FailureKind, VerifyFailure, VerifyOptions, VerifyReport};

use tg_core::LedgerEntry;

/// Errors from ledger backends.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Filesystem failure (open, lock, write, fsync).
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),

    /// The entry could not be canonically encoded.
    #[error("ledger canonicalization error: {0}")]
    Canon(#[from] tg_canon::CanonError),

    /// A stored row or line could not be decoded.
    #[error("malformed ledger entry at position {position}: {reason}")]
    Malformed {
        /// Zero-based entry position.
        position: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// SQLite failure.
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Signing-key material could not be loaded or used.
    #[error("signing error: {reason}")]
    Signing {
        /// What went wrong.
        reason: String,
    },

    /// The entry is not usable for the requested operation.
    #[error("invalid entry: {reason}")]
    InvalidEntry {
        /// Why the entry was rejected.
        reason: String,
    },
}

/// Append-only evidence store with hash chaining.
///
/// Implementations own their synchronization and are safe to share
/// across concurrent invocation state machines.
pub trait EvidenceLedger: Send + Sync {
    /// Chain, hash, optionally sign, and durably append an entry.
    ///
    /// The input must have `prev_entry_hash`, `entry_hash` and
    /// `entry_signature` unset; the returned entry has them filled.
    ///
    /// # Errors
    ///
    /// Any failure leaves the store unchanged and visible entries intact.
    fn append(&self, entry: LedgerEntry) -> Result<LedgerEntry, LedgerError>;

    /// All complete entries, in chain order.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or an entry cannot be decoded.
    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Run offline verification over the whole store.
    ///
    /// # Errors
    ///
    /// Fails only when the store itself cannot be read; verification
    /// findings are reported in the [`VerifyReport`], not as errors.
    fn verify(&self, options: &VerifyOptions) -> Result<VerifyReport, LedgerError>;
}

/// Canonical line form of a full entry (chain fields included).
pub(crate) fn entry_to_line(entry: &LedgerEntry) -> Result<String, LedgerError> {
    let value = serde_json::to_value(entry)
        .map_err(tg_canon::CanonError::Json)
        .map_err(LedgerError::Canon)?;
    let canon = tg_canon::to_canon(&value)?;
    let bytes = tg_canon::encode(&canon)?;
    Ok(String::from_utf8(bytes).expect("canonical bytes are UTF-8"))
}

/// Hash an entry's canonical form with hash/signature fields nulled.
pub(crate) fn compute_entry_hash(entry: &LedgerEntry) -> Result<String, LedgerError> {
    let value = serde_json::to_value(entry.hashable())
        .map_err(tg_canon::CanonError::Json)
        .map_err(LedgerError::Canon)?;
    Ok(tg_canon::hash_json(&value)?)
}
