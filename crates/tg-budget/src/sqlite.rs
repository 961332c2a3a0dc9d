// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-persistent budget manager.
//!
//! Counters, reservations, and settlements all live in one database, so
//! process restarts and retried calls observe prior reservations instead
//! of double-charging.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::{
    BudgetCheck, BudgetCommit, BudgetError, BudgetLimits, BudgetManager, BudgetScope,
    ChargeRequest, CommitRequest, agent_counter, tool_counter,
};

/// Budget manager backed by an embedded SQLite database in WAL mode.
pub struct SqliteBudget {
    conn: Mutex<Connection>,
    limits: BudgetLimits,
}

impl SqliteBudget {
    /// Open (or create) the budget database.
    ///
    /// # Errors
    ///
    /// [`BudgetError::Store`] if the database cannot be opened or
    /// migrated.
    pub fn open(path: impl AsRef<Path>, limits: BudgetLimits) -> Result<Self, BudgetError> {
        Self::with_connection(Connection::open(path)?, limits)
    }

    /// In-memory variant for tests.
    ///
    /// # Errors
    ///
    /// [`BudgetError::Store`] if the schema cannot be created.
    pub fn open_in_memory(limits: BudgetLimits) -> Result<Self, BudgetError> {
        Self::with_connection(Connection::open_in_memory()?, limits)
    }

    fn with_connection(conn: Connection, limits: BudgetLimits) -> Result<Self, BudgetError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS budget_counters (
                name         TEXT PRIMARY KEY,
                total        TEXT NOT NULL,
                window_start TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS budget_checks (
                request_id    TEXT PRIMARY KEY,
                check_id      TEXT NOT NULL UNIQUE,
                agent_counter TEXT NOT NULL,
                tool_counter  TEXT NOT NULL,
                projected     TEXT NOT NULL,
                currency      TEXT NOT NULL,
                max_limit     TEXT,
                checked_at    TEXT NOT NULL,
                committed_as  TEXT
            );
            CREATE TABLE IF NOT EXISTS budget_commits (
                request_id   TEXT NOT NULL,
                commit_id    TEXT NOT NULL,
                check_id     TEXT NOT NULL,
                actual       TEXT NOT NULL,
                currency     TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (request_id, commit_id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            limits,
        })
    }

    /// Current total of a counter, for tests and introspection.
    ///
    /// # Errors
    ///
    /// [`BudgetError::Store`] on query failure.
    pub fn counter_total(&self, name: &str) -> Result<Decimal, BudgetError> {
        let conn = self.conn.lock().expect("budget connection poisoned");
        let total: Option<String> = conn
            .query_row(
                "SELECT total FROM budget_counters WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(total.map_or(Decimal::ZERO, |t| parse_decimal(&t)))
    }

    fn counter_state(
        tx: &rusqlite::Transaction<'_>,
        name: &str,
    ) -> Result<Option<(Decimal, DateTime<Utc>)>, BudgetError> {
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT total, window_start FROM budget_counters WHERE name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(total, start)| (parse_decimal(&total), parse_ts(&start))))
    }

    fn effective_total(
        &self,
        state: Option<(Decimal, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Decimal {
        match (state, self.limits.window) {
            (Some((_, start)), Some(window)) if now - start > window => Decimal::ZERO,
            (Some((total, _)), _) => total,
            (None, _) => Decimal::ZERO,
        }
    }

    fn charge(
        &self,
        tx: &rusqlite::Transaction<'_>,
        name: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError> {
        let state = Self::counter_state(tx, name)?;
        let (total, window_start) = match (state, self.limits.window) {
            (Some((_, start)), Some(window)) if now - start > window => (Decimal::ZERO, now),
            (Some((total, start)), _) => (total, start),
            (None, _) => (Decimal::ZERO, now),
        };
        tx.execute(
            "INSERT INTO budget_counters (name, total, window_start)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET total = ?2, window_start = ?3",
            params![name, (total + amount).to_string(), fmt_ts(window_start)],
        )?;
        Ok(())
    }
}

fn parse_decimal(text: &str) -> Decimal {
    Decimal::from_str(text).unwrap_or(Decimal::ZERO)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

impl BudgetManager for SqliteBudget {
    fn check(&self, req: &ChargeRequest) -> Result<BudgetCheck, BudgetError> {
        let mut conn = self.conn.lock().expect("budget connection poisoned");
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let existing: Option<(String, Option<String>, String, String, String)> = tx
            .query_row(
                "SELECT check_id, max_limit, projected, currency, checked_at
                 FROM budget_checks WHERE request_id = ?1",
                [&req.request_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        if let Some((check_id, max_limit, projected, currency, checked_at)) = existing {
            tx.commit()?;
            return Ok(BudgetCheck {
                check_id,
                request_id: req.request_id.clone(),
                limit: max_limit.as_deref().map(parse_decimal),
                projected_cost: parse_decimal(&projected),
                currency,
                succeeded: true,
                checked_at: parse_ts(&checked_at),
            });
        }

        let now = Utc::now();
        let agent_name = agent_counter(&req.agent_id);
        let tool_name = tool_counter(&req.action);

        let mut tightest: Option<Decimal> = None;
        let scoped = [
            (BudgetScope::Agent, &agent_name, self.limits.per_agent),
            (BudgetScope::Tool, &tool_name, self.limits.per_tool),
        ];
        for (scope, name, limit) in scoped {
            let Some(limit) = limit else { continue };
            let current = self.effective_total(Self::counter_state(&tx, name)?, now);
            let projected = current + req.projected_cost;
            if projected > limit {
                return Err(BudgetError::Exceeded {
                    scope,
                    counter: name.clone(),
                    limit,
                    attempted: projected,
                });
            }
            tightest = Some(tightest.map_or(limit, |t: Decimal| t.min(limit)));
        }

        self.charge(&tx, &agent_name, req.projected_cost, now)?;
        self.charge(&tx, &tool_name, req.projected_cost, now)?;

        let check = BudgetCheck {
            check_id: Uuid::new_v4().to_string(),
            request_id: req.request_id.clone(),
            limit: tightest,
            projected_cost: req.projected_cost,
            currency: req.currency.clone(),
            succeeded: true,
            checked_at: now,
        };
        tx.execute(
            "INSERT INTO budget_checks
             (request_id, check_id, agent_counter, tool_counter, projected, currency, max_limit, checked_at, committed_as)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
            params![
                check.request_id,
                check.check_id,
                agent_name,
                tool_name,
                check.projected_cost.to_string(),
                check.currency,
                check.limit.map(|l| l.to_string()),
                fmt_ts(now),
            ],
        )?;
        tx.commit()?;
        debug!(target: "toolgate.budget", request_id = %req.request_id, "reserved budget");
        Ok(check)
    }

    fn commit(&self, req: &CommitRequest) -> Result<BudgetCommit, BudgetError> {
        let mut conn = self.conn.lock().expect("budget connection poisoned");
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let replay: Option<(String, String, String)> = tx
            .query_row(
                "SELECT check_id, actual, committed_at FROM budget_commits
                 WHERE request_id = ?1 AND commit_id = ?2",
                params![req.request_id, req.commit_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((check_id, actual, committed_at)) = replay {
            tx.commit()?;
            return Ok(BudgetCommit {
                check_id,
                commit_id: req.commit_id.clone(),
                request_id: req.request_id.clone(),
                actual_cost: parse_decimal(&actual),
                currency: req.currency.clone(),
                committed_at: parse_ts(&committed_at),
            });
        }

        let stored: Option<(String, String, String, String, Option<String>)> = tx
            .query_row(
                "SELECT request_id, agent_counter, tool_counter, projected, committed_as
                 FROM budget_checks WHERE check_id = ?1",
                [&req.check_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((request_id, agent_name, tool_name, projected, committed_as)) = stored else {
            return Err(BudgetError::UnknownCheck {
                check_id: req.check_id.clone(),
            });
        };
        if let Some(existing) = committed_as {
            return Err(BudgetError::CommitConflict {
                check_id: req.check_id.clone(),
                existing,
                commit_id: req.commit_id.clone(),
            });
        }

        let now = Utc::now();
        let delta = req.actual_cost - parse_decimal(&projected);
        self.charge(&tx, &agent_name, delta, now)?;
        self.charge(&tx, &tool_name, delta, now)?;

        tx.execute(
            "UPDATE budget_checks SET committed_as = ?1 WHERE check_id = ?2",
            params![req.commit_id, req.check_id],
        )?;
        tx.execute(
            "INSERT INTO budget_commits
             (request_id, commit_id, check_id, actual, currency, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request_id,
                req.commit_id,
                req.check_id,
                req.actual_cost.to_string(),
                req.currency,
                fmt_ts(now),
            ],
        )?;
        tx.commit()?;
        Ok(BudgetCommit {
            check_id: req.check_id.clone(),
            commit_id: req.commit_id.clone(),
            request_id,
            actual_cost: req.actual_cost,
            currency: req.currency.clone(),
            committed_at: now,
        })
    }

    fn sweep_stale(&self, ttl: Duration) -> Result<usize, BudgetError> {
        let mut conn = self.conn.lock().expect("budget connection poisoned");
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let cutoff = now - ttl;

        let stale: Vec<(String, String, String, String)> = tx
            .prepare(
                "SELECT request_id, agent_counter, tool_counter, projected
                 FROM budget_checks
                 WHERE committed_as IS NULL AND checked_at < ?1",
            )?
            .query_map([fmt_ts(cutoff)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (request_id, agent_name, tool_name, projected) in &stale {
            let refund = -parse_decimal(projected);
            self.charge(&tx, agent_name, refund, now)?;
            self.charge(&tx, tool_name, refund, now)?;
            tx.execute(
                "DELETE FROM budget_checks WHERE request_id = ?1",
                [request_id],
            )?;
        }
        tx.commit()?;
        Ok(stale.len())
    }
}
