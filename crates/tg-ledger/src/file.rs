// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-oriented file ledger: one canonical-JSON entry per LF-terminated
//! line, appended under an exclusive advisory lock and fsynced.
//!
//! Intended for a single writer per host; multi-process writers should
//! use [`crate::SqliteLedger`]. Readers tolerate a concurrent append by
//! treating an unterminated trailing line as absent.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use fs2::FileExt;
use tracing::debug;

use tg_core::LedgerEntry;

use crate::verify::{StoredLine, VerifyOptions, VerifyReport, verify_lines};
use crate::{EvidenceLedger, LedgerError, compute_entry_hash, entry_to_line, sign};

/// File-backed evidence ledger.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    signer: Option<SigningKey>,
}

impl FileLedger {
    /// Open (or lazily create) an unsigned ledger at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            signer: None,
        }
    }

    /// Open (or lazily create) a ledger whose entries are signed.
    #[must_use]
    pub fn with_signer(path: impl Into<PathBuf>, signer: SigningKey) -> Self {
        Self {
            path: path.into(),
            signer: Some(signer),
        }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Split file content into stored lines, flagging an unterminated
    /// trailing fragment as incomplete.
    fn stored_lines(content: &str) -> Vec<StoredLine> {
        let mut lines: Vec<StoredLine> = Vec::new();
        let mut rest = content;
        while let Some(idx) = rest.find('\n') {
            lines.push(StoredLine {
                text: rest[..idx].to_string(),
                complete: true,
            });
            rest = &rest[idx + 1..];
        }
        if !rest.is_empty() {
            lines.push(StoredLine {
                text: rest.to_string(),
                complete: false,
            });
        }
        lines
    }

    fn read_content(&self) -> Result<String, LedgerError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The `entry_hash` of the last complete entry, if any.
    fn last_entry_hash(content: &str) -> Result<Option<String>, LedgerError> {
        let lines = Self::stored_lines(content);
        let Some(last) = lines.iter().rev().find(|l| l.complete) else {
            return Ok(None);
        };
        let position = lines.iter().filter(|l| l.complete).count() - 1;
        let entry: LedgerEntry =
            serde_json::from_str(&last.text).map_err(|e| LedgerError::Malformed {
                position,
                reason: e.to_string(),
            })?;
        entry.entry_hash.map(Some).ok_or(LedgerError::Malformed {
            position,
            reason: "last entry has no entry_hash".to_string(),
        })
    }
}

impl EvidenceLedger for FileLedger {
    fn append(&self, mut entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| {
            let mut content = String::new();
            file.read_to_string(&mut content)?;

            // A torn tail from an earlier crash is invisible to readers;
            // drop it here so the chain stays line-aligned.
            let valid_len = content.rfind('\n').map_or(0, |i| i + 1);
            if valid_len < content.len() {
                file.set_len(valid_len as u64)?;
            }

            entry.prev_entry_hash = Self::last_entry_hash(&content)?;
            let hash = compute_entry_hash(&entry)?;
            if let Some(signer) = self.signer.as_ref() {
                entry.entry_signature = Some(sign::sign_entry_hash(signer, &hash)?);
            }
            entry.entry_hash = Some(hash);

            let mut line = entry_to_line(&entry)?;
            line.push('\n');
            // One write for the whole line: a failure before this point
            // leaves the file untouched, a torn write leaves an
            // unterminated fragment that readers skip.
            file.seek(SeekFrom::Start(valid_len as u64))?;
            file.write_all(line.as_bytes())?;
            file.sync_all()?;
            debug!(target: "toolgate.ledger", path = %self.path.display(), request_id = %entry.request_id, "appended entry");
            Ok(entry)
        })();
        let _ = FileExt::unlock(&file);
        result
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let content = self.read_content()?;
        Self::stored_lines(&content)
            .iter()
            .filter(|l| l.complete)
            .enumerate()
            .map(|(position, line)| {
                serde_json::from_str(&line.text).map_err(|e| LedgerError::Malformed {
                    position,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn verify(&self, options: &VerifyOptions) -> Result<VerifyReport, LedgerError> {
        let content = self.read_content()?;
        Ok(verify_lines(&Self::stored_lines(&content), options))
    }
}
