// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedded relational ledger on SQLite in WAL mode.
//!
//! One table keyed by monotonic position; the canonical body line is the
//! source of truth and the hash columns are denormalized copies for
//! index scans. WAL keeps readers from blocking the single writer, which
//! makes this the backend for multi-process single-host deployments.

use std::path::Path;
use std::sync::Mutex;

use ed25519_dalek::SigningKey;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use tg_core::LedgerEntry;

use crate::verify::{StoredLine, VerifyFailure, VerifyOptions, VerifyReport, verify_lines};
use crate::{EvidenceLedger, FailureKind, LedgerError, compute_entry_hash, entry_to_line, sign};

/// Per-transaction durability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// `synchronous=FULL`: every commit reaches stable storage.
    #[default]
    Full,
    /// `synchronous=NORMAL`: opt-in relaxed mode; a power loss may drop
    /// the most recent commits but never corrupts the chain.
    Relaxed,
}

/// SQLite-backed evidence ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
    signer: Option<SigningKey>,
}

impl SqliteLedger {
    /// Open (or create) an unsigned ledger database.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Sqlite`] if the database cannot be opened or
    /// migrated.
    pub fn open(path: impl AsRef<Path>, durability: Durability) -> Result<Self, LedgerError> {
        Self::open_inner(Connection::open(path)?, durability, None)
    }

    /// Open (or create) a signed ledger database.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Sqlite`] if the database cannot be opened or
    /// migrated.
    pub fn open_signed(
        path: impl AsRef<Path>,
        durability: Durability,
        signer: SigningKey,
    ) -> Result<Self, LedgerError> {
        Self::open_inner(Connection::open(path)?, durability, Some(signer))
    }

    /// In-memory ledger for tests.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Sqlite`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::open_inner(Connection::open_in_memory()?, Durability::Full, None)
    }

    fn open_inner(
        conn: Connection,
        durability: Durability,
        signer: Option<SigningKey>,
    ) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let sync = match durability {
            Durability::Full => "FULL",
            Durability::Relaxed => "NORMAL",
        };
        conn.pragma_update(None, "synchronous", sync)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                position        INTEGER PRIMARY KEY,
                request_id      TEXT NOT NULL,
                event           TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                entry_hash      TEXT NOT NULL,
                prev_entry_hash TEXT,
                body            TEXT NOT NULL,
                entry_signature TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_request ON ledger_entries (request_id);
            CREATE INDEX IF NOT EXISTS idx_ledger_hash ON ledger_entries (entry_hash);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            signer,
        })
    }

    fn rows(&self) -> Result<Vec<(String, Option<String>, Option<String>, String)>, LedgerError> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT body, entry_hash, prev_entry_hash, event
             FROM ledger_entries ORDER BY position",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl EvidenceLedger for SqliteLedger {
    fn append(&self, mut entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        let mut conn = self.conn.lock().expect("ledger connection poisoned");
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let tail: Option<(i64, String)> = tx
            .query_row(
                "SELECT position, entry_hash FROM ledger_entries
                 ORDER BY position DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (position, prev_hash) = match tail {
            Some((pos, hash)) => (pos + 1, Some(hash)),
            None => (0, None),
        };

        entry.prev_entry_hash = prev_hash;
        let hash = compute_entry_hash(&entry)?;
        if let Some(signer) = self.signer.as_ref() {
            entry.entry_signature = Some(sign::sign_entry_hash(signer, &hash)?);
        }
        entry.entry_hash = Some(hash.clone());

        let body = entry_to_line(&entry)?;
        tx.execute(
            "INSERT INTO ledger_entries
             (position, request_id, event, created_at, entry_hash, prev_entry_hash, body, entry_signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                position,
                entry.request_id,
                match entry.event {
                    tg_core::EventKind::Decision => "decision",
                    tg_core::EventKind::Outcome => "outcome",
                },
                tg_canon::timestamp::format(entry.created_at),
                hash,
                entry.prev_entry_hash,
                body,
                entry.entry_signature,
            ],
        )?;
        tx.commit()?;
        debug!(target: "toolgate.ledger", position, request_id = %entry.request_id, "appended entry");
        Ok(entry)
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.rows()?
            .into_iter()
            .enumerate()
            .map(|(position, (body, ..))| {
                serde_json::from_str(&body).map_err(|e| LedgerError::Malformed {
                    position,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn verify(&self, options: &VerifyOptions) -> Result<VerifyReport, LedgerError> {
        let rows = self.rows()?;

        // The denormalized columns must agree with the canonical body;
        // a divergence is tampering even when the body itself verifies.
        for (position, (body, column_hash, column_prev, _)) in rows.iter().enumerate() {
            if let Ok(entry) = serde_json::from_str::<LedgerEntry>(body)
                && (entry.entry_hash != *column_hash || entry.prev_entry_hash != *column_prev)
            {
                return Ok(VerifyReport {
                    ok: false,
                    entries: position,
                    first_failure: Some(VerifyFailure {
                        position,
                        kind: FailureKind::Tamper,
                        detail: "hash columns disagree with canonical body".to_string(),
                    }),
                    signatures_checked: options.public_key.as_ref().map(|_| 0),
                });
            }
        }

        let lines: Vec<StoredLine> = rows
            .into_iter()
            .map(|(body, ..)| StoredLine {
                text: body,
                complete: true,
            })
            .collect();
        Ok(verify_lines(&lines, options))
    }
}
