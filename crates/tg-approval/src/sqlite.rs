// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite approval store for approvals that survive restarts or cross
//! processes on one host.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use tg_core::Binding;

use crate::{ApprovalError, ApprovalRecord, ApprovalState, ApprovalStore};

/// Approval store backed by an embedded SQLite database in WAL mode.
pub struct SqliteApprovalStore {
    conn: Mutex<Connection>,
}

impl SqliteApprovalStore {
    /// Open (or create) the approval database.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Store`] if the database cannot be opened or
    /// migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ApprovalError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// In-memory variant for tests.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::Store`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, ApprovalError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ApprovalError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS approvals (
                approval_id   TEXT PRIMARY KEY,
                state         TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                resolved_at   TEXT,
                expires_at    TEXT,
                request_id    TEXT NOT NULL,
                policy_hash   TEXT NOT NULL,
                decision_hash TEXT NOT NULL,
                approved      INTEGER NOT NULL,
                approver_id   TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_approvals_request ON approvals (request_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRecord> {
        let state: String = row.get(1)?;
        Ok(ApprovalRecord {
            approval_id: row.get(0)?,
            state: match state.as_str() {
                "approved" => ApprovalState::Approved,
                "denied" => ApprovalState::Denied,
                "expired" => ApprovalState::Expired,
                _ => ApprovalState::Pending,
            },
            created_at: parse_ts(&row.get::<_, String>(2)?),
            resolved_at: row.get::<_, Option<String>>(3)?.map(|t| parse_ts(&t)),
            expires_at: row.get::<_, Option<String>>(4)?.map(|t| parse_ts(&t)),
            binding: Binding {
                request_id: row.get(5)?,
                policy_hash: row.get(6)?,
                decision_hash: row.get(7)?,
            },
            approved: row.get::<_, i64>(8)? != 0,
            approver_id: row.get(9)?,
        })
    }
}

const SELECT_COLUMNS: &str = "approval_id, state, created_at, resolved_at, expires_at, \
                              request_id, policy_hash, decision_hash, approved, approver_id";

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

impl ApprovalStore for SqliteApprovalStore {
    fn put_pending(&self, record: ApprovalRecord) -> Result<(), ApprovalError> {
        let conn = self.conn.lock().expect("approval connection poisoned");
        conn.execute(
            "INSERT INTO approvals
             (approval_id, state, created_at, resolved_at, expires_at,
              request_id, policy_hash, decision_hash, approved, approver_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.approval_id,
                record.state.as_str(),
                fmt_ts(record.created_at),
                record.resolved_at.map(fmt_ts),
                record.expires_at.map(fmt_ts),
                record.binding.request_id,
                record.binding.policy_hash,
                record.binding.decision_hash,
                i64::from(record.approved),
                record.approver_id,
            ],
        )?;
        debug!(target: "toolgate.approval", approval_id = %record.approval_id, "pending approval stored");
        Ok(())
    }

    fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
        approver_id: Option<&str>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let mut conn = self.conn.lock().expect("approval connection poisoned");
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let record = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM approvals WHERE approval_id = ?1"),
                [approval_id],
                Self::row_to_record,
            )
            .optional()?
            .ok_or_else(|| ApprovalError::Unknown {
                approval_id: approval_id.to_string(),
            })?;
        if record.state != ApprovalState::Pending {
            return Err(ApprovalError::InvalidState {
                approval_id: approval_id.to_string(),
                state: record.state.as_str(),
            });
        }

        let now = Utc::now();
        let (state, approved, approver_id) = if record.is_expired(now) {
            (ApprovalState::Expired, false, None)
        } else if approved {
            (ApprovalState::Approved, true, approver_id)
        } else {
            (ApprovalState::Denied, false, approver_id)
        };
        tx.execute(
            "UPDATE approvals
             SET state = ?1, approved = ?2, approver_id = ?3, resolved_at = ?4
             WHERE approval_id = ?5",
            params![
                state.as_str(),
                i64::from(approved),
                approver_id,
                fmt_ts(now),
                approval_id,
            ],
        )?;
        tx.commit()?;

        let mut resolved = record;
        resolved.state = state;
        resolved.approved = approved;
        resolved.approver_id = approver_id.map(str::to_string);
        resolved.resolved_at = Some(now);
        Ok(resolved)
    }

    fn get(&self, approval_id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let conn = self.conn.lock().expect("approval connection poisoned");
        Ok(conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM approvals WHERE approval_id = ?1"),
                [approval_id],
                Self::row_to_record,
            )
            .optional()?)
    }

    fn get_by_request(&self, request_id: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let conn = self.conn.lock().expect("approval connection poisoned");
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM approvals
                     WHERE request_id = ?1 ORDER BY created_at DESC LIMIT 1"
                ),
                [request_id],
                Self::row_to_record,
            )
            .optional()?)
    }

    fn sweep_expired(&self) -> Result<usize, ApprovalError> {
        let conn = self.conn.lock().expect("approval connection poisoned");
        let now = Utc::now();
        let cutoff = now - crate::EXPIRY_SKEW;
        let moved = conn.execute(
            "UPDATE approvals
             SET state = 'expired', approved = 0, resolved_at = ?1
             WHERE state = 'pending' AND expires_at IS NOT NULL AND expires_at < ?2",
            params![fmt_ts(now), fmt_ts(cutoff)],
        )?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn binding(request_id: &str) -> Binding {
        Binding {
            request_id: request_id.to_string(),
            policy_hash: "p".repeat(64),
            decision_hash: "d".repeat(64),
        }
    }

    #[test]
    fn resolve_roundtrip() {
        let store = SqliteApprovalStore::open_in_memory().unwrap();
        store
            .put_pending(ApprovalRecord::pending("a1".into(), binding("r1"), None))
            .unwrap();
        let resolved = store.resolve("a1", true, Some("ops-1")).unwrap();
        assert_eq!(resolved.state, ApprovalState::Approved);

        let fetched = store.get("a1").unwrap().unwrap();
        assert_eq!(fetched.state, ApprovalState::Approved);
        assert_eq!(fetched.approver_id.as_deref(), Some("ops-1"));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.db");
        {
            let store = SqliteApprovalStore::open(&path).unwrap();
            store
                .put_pending(ApprovalRecord::pending(
                    "a1".into(),
                    binding("r1"),
                    Some(Duration::minutes(5)),
                ))
                .unwrap();
        }
        let store = SqliteApprovalStore::open(&path).unwrap();
        let record = store.get_by_request("r1").unwrap().unwrap();
        assert_eq!(record.state, ApprovalState::Pending);
        assert!(record.expires_at.is_some());
    }

    #[test]
    fn expired_resolution_is_denied() {
        let store = SqliteApprovalStore::open_in_memory().unwrap();
        let mut record = ApprovalRecord::pending("a1".into(), binding("r1"), None);
        record.expires_at = Some(Utc::now() - Duration::seconds(10));
        store.put_pending(record).unwrap();

        let resolved = store.resolve("a1", true, Some("ops-1")).unwrap();
        assert_eq!(resolved.state, ApprovalState::Expired);
        assert!(!resolved.approved);
        assert!(resolved.approver_id.is_none());
    }

    #[test]
    fn single_use() {
        let store = SqliteApprovalStore::open_in_memory().unwrap();
        store
            .put_pending(ApprovalRecord::pending("a1".into(), binding("r1"), None))
            .unwrap();
        store.resolve("a1", false, None).unwrap();
        assert!(matches!(
            store.resolve("a1", true, None).unwrap_err(),
            ApprovalError::InvalidState { .. }
        ));
    }

    #[test]
    fn sweep_expires_overdue() {
        let store = SqliteApprovalStore::open_in_memory().unwrap();
        let mut overdue = ApprovalRecord::pending("a1".into(), binding("r1"), None);
        overdue.expires_at = Some(Utc::now() - Duration::seconds(10));
        store.put_pending(overdue).unwrap();

        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert_eq!(
            store.get("a1").unwrap().unwrap().state,
            ApprovalState::Expired
        );
    }
}
