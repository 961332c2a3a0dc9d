// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory budget manager: the full contract, no durability.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    BudgetCheck, BudgetCommit, BudgetError, BudgetLimits, BudgetManager, BudgetScope,
    ChargeRequest, CommitRequest, agent_counter, tool_counter,
};

#[derive(Debug, Clone)]
struct Counter {
    total: Decimal,
    window_start: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredCheck {
    check: BudgetCheck,
    agent_counter: String,
    tool_counter: String,
    committed_as: Option<String>,
}

#[derive(Default)]
struct State {
    counters: HashMap<String, Counter>,
    checks: HashMap<String, StoredCheck>,
    by_check_id: HashMap<String, String>,
    commits: HashMap<(String, String), BudgetCommit>,
}

/// Mutex-guarded budget manager with no persistence.
pub struct MemoryBudget {
    limits: BudgetLimits,
    state: Mutex<State>,
}

impl MemoryBudget {
    /// Create a manager with the given limits and zeroed counters.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::default()),
        }
    }

    /// Current total of a counter, for tests and introspection.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> Decimal {
        self.state
            .lock()
            .expect("budget state poisoned")
            .counters
            .get(name)
            .map_or(Decimal::ZERO, |c| c.total)
    }

    fn effective_total(&self, counter: Option<&Counter>, now: DateTime<Utc>) -> Decimal {
        match (counter, self.limits.window) {
            (Some(c), Some(window)) if now - c.window_start > window => Decimal::ZERO,
            (Some(c), _) => c.total,
            (None, _) => Decimal::ZERO,
        }
    }

    fn charge(
        counters: &mut HashMap<String, Counter>,
        name: &str,
        amount: Decimal,
        now: DateTime<Utc>,
        window: Option<Duration>,
    ) {
        let reset = window
            .zip(counters.get(name))
            .is_some_and(|(w, c)| now - c.window_start > w);
        let entry = counters.entry(name.to_string()).or_insert(Counter {
            total: Decimal::ZERO,
            window_start: now,
        });
        if reset {
            entry.total = Decimal::ZERO;
            entry.window_start = now;
        }
        entry.total += amount;
    }
}

impl BudgetManager for MemoryBudget {
    fn check(&self, req: &ChargeRequest) -> Result<BudgetCheck, BudgetError> {
        let mut state = self.state.lock().expect("budget state poisoned");
        if let Some(existing) = state.checks.get(&req.request_id) {
            return Ok(existing.check.clone());
        }

        let now = Utc::now();
        let agent_name = agent_counter(&req.agent_id);
        let tool_name = tool_counter(&req.action);

        let scoped = [
            (BudgetScope::Agent, &agent_name, self.limits.per_agent),
            (BudgetScope::Tool, &tool_name, self.limits.per_tool),
        ];
        let mut tightest: Option<Decimal> = None;
        for (scope, name, limit) in scoped {
            let Some(limit) = limit else { continue };
            let projected = self.effective_total(state.counters.get(name.as_str()), now)
                + req.projected_cost;
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

        Self::charge(
            &mut state.counters,
            &agent_name,
            req.projected_cost,
            now,
            self.limits.window,
        );
        Self::charge(
            &mut state.counters,
            &tool_name,
            req.projected_cost,
            now,
            self.limits.window,
        );

        let check = BudgetCheck {
            check_id: Uuid::new_v4().to_string(),
            request_id: req.request_id.clone(),
            limit: tightest,
            projected_cost: req.projected_cost,
            currency: req.currency.clone(),
            succeeded: true,
            checked_at: now,
        };
        state
            .by_check_id
            .insert(check.check_id.clone(), req.request_id.clone());
        state.checks.insert(
            req.request_id.clone(),
            StoredCheck {
                check: check.clone(),
                agent_counter: agent_name,
                tool_counter: tool_name,
                committed_as: None,
            },
        );
        Ok(check)
    }

    fn commit(&self, req: &CommitRequest) -> Result<BudgetCommit, BudgetError> {
        let mut state = self.state.lock().expect("budget state poisoned");

        let key = (req.request_id.clone(), req.commit_id.clone());
        if let Some(existing) = state.commits.get(&key) {
            return Ok(existing.clone());
        }

        let request_id = state
            .by_check_id
            .get(&req.check_id)
            .cloned()
            .ok_or_else(|| BudgetError::UnknownCheck {
                check_id: req.check_id.clone(),
            })?;
        let stored = state
            .checks
            .get(&request_id)
            .cloned()
            .ok_or_else(|| BudgetError::UnknownCheck {
                check_id: req.check_id.clone(),
            })?;
        if let Some(existing) = stored.committed_as.as_ref() {
            return Err(BudgetError::CommitConflict {
                check_id: req.check_id.clone(),
                existing: existing.clone(),
                commit_id: req.commit_id.clone(),
            });
        }

        // Settle the difference between reserved and actual.
        let delta = req.actual_cost - stored.check.projected_cost;
        let now = Utc::now();
        Self::charge(
            &mut state.counters,
            &stored.agent_counter,
            delta,
            now,
            self.limits.window,
        );
        Self::charge(
            &mut state.counters,
            &stored.tool_counter,
            delta,
            now,
            self.limits.window,
        );

        let commit = BudgetCommit {
            check_id: req.check_id.clone(),
            commit_id: req.commit_id.clone(),
            request_id: request_id.clone(),
            actual_cost: req.actual_cost,
            currency: req.currency.clone(),
            committed_at: now,
        };
        state.commits.insert(key, commit.clone());
        if let Some(stored) = state.checks.get_mut(&request_id) {
            stored.committed_as = Some(req.commit_id.clone());
        }
        Ok(commit)
    }

    fn sweep_stale(&self, ttl: Duration) -> Result<usize, BudgetError> {
        let mut state = self.state.lock().expect("budget state poisoned");
        let now = Utc::now();
        let stale: Vec<String> = state
            .checks
            .iter()
            .filter(|(_, stored)| {
                stored.committed_as.is_none() && now - stored.check.checked_at > ttl
            })
            .map(|(request_id, _)| request_id.clone())
            .collect();

        for request_id in &stale {
            if let Some(stored) = state.checks.remove(request_id) {
                let refund = -stored.check.projected_cost;
                Self::charge(
                    &mut state.counters,
                    &stored.agent_counter,
                    refund,
                    now,
                    self.limits.window,
                );
                Self::charge(
                    &mut state.counters,
                    &stored.tool_counter,
                    refund,
                    now,
                    self.limits.window,
                );
                state.by_check_id.remove(&stored.check.check_id);
            }
        }
        Ok(stale.len())
    }
}
