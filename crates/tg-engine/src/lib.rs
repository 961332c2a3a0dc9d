// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The guarded-call engine.
//!
//! One state machine per invocation, fail-closed at every edge:
//!
//! ```text
//! BUILD_CONTEXT → EVAL_POLICY → [REQUEST_APPROVAL] → [BUDGET]
//!     → WRITE_DECISION → EXECUTE → WRITE_OUTCOME
//! ```
//!
//! The decision entry is written (and fsynced) before the callable
//! runs, so anything able to observe the guarded side effect is
//! guaranteed an immutable, chained record of its authorization.
//! Outcome logging is best-effort: the authoritative audit fact is the
//! decision, and a logging failure after execution never displaces the
//! callable's own result.
//!
//! Collaborators (policy, ledger, approver, approval store, budget,
//! audit sink) are injected at construction; the engine depends only on
//! their capabilities.

mod audit;
mod error;

pub use audit::{AuditEvent, AuditSink, JsonlAuditSink, TracingAuditSink};
pub use error::{AuditLogError, GuardError};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use tg_approval::{ApprovalError, ApprovalRecord, ApprovalResponse, ApprovalStore, Approver};
use tg_budget::{BudgetManager, BudgetScope, ChargeRequest, CommitRequest};
use tg_core::{
    ApprovalBlock, ApprovalDenied, Binding, CallContext, DecisionBlock, Effect, LedgerEntry,
    OutcomeBlock, OutcomeStatus, Parameters, Policy, PolicyDecision, ReasonCode,
};
use tg_ledger::{EvidenceLedger, LedgerError};

/// Maximum length of an error message persisted in an outcome entry.
const OUTCOME_ERROR_MAX_CHARS: usize = 200;

/// Default time an approver has to answer.
const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// One guarded invocation, as handed to [`Engine::guard`].
#[derive(Clone)]
pub struct CallRequest {
    /// Fully-qualified identity of the guarded callable.
    pub action: String,
    /// Positional arguments (pre-redaction; the engine redacts).
    pub args: Vec<Value>,
    /// Keyword arguments (pre-redaction).
    pub kwargs: BTreeMap<String, Value>,
    /// Caller metadata (`agent_id`, correlation ids, ...).
    pub metadata: BTreeMap<String, Value>,
    /// Per-call policy override.
    pub policy: Option<Arc<dyn Policy>>,
    /// Projected cost to reserve against the budget manager.
    pub budget_cost: Option<Decimal>,
    /// Currency tag for budget accounting.
    pub currency: String,
}

impl CallRequest {
    /// Start a request for the named callable.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            metadata: BTreeMap::new(),
            policy: None,
            budget_cost: None,
            currency: "USD".to_string(),
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    /// Set a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Set a metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Shorthand for the `agent_id` metadata entry.
    #[must_use]
    pub fn agent(self, agent_id: impl Into<String>) -> Self {
        self.meta(tg_core::AGENT_ID_KEY, Value::String(agent_id.into()))
    }

    /// Override the engine policy for this call.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Reserve this projected cost before execution.
    #[must_use]
    pub fn budget_cost(mut self, cost: Decimal) -> Self {
        self.budget_cost = Some(cost);
        self
    }

    /// Pin the invocation id (tests and idempotent retries).
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata.insert(
            REQUEST_ID_KEY.to_string(),
            Value::String(request_id.into()),
        );
        self
    }
}

/// Metadata key a caller may use to pin the `request_id` (idempotent
/// retries); absent, the engine assigns a random one.
pub const REQUEST_ID_KEY: &str = "request_id";

/// Builder for [`Engine`].
pub struct EngineBuilder {
    policy: Arc<dyn Policy>,
    ledger: Arc<dyn EvidenceLedger>,
    approver: Option<Arc<dyn Approver>>,
    approval_store: Option<Arc<dyn ApprovalStore>>,
    budget: Option<Arc<dyn BudgetManager>>,
    audit: Arc<dyn AuditSink>,
    approval_timeout: Duration,
}

impl EngineBuilder {
    /// Begin with the two mandatory collaborators.
    #[must_use]
    pub fn new(policy: Arc<dyn Policy>, ledger: Arc<dyn EvidenceLedger>) -> Self {
        Self {
            policy,
            ledger,
            approver: None,
            approval_store: None,
            budget: None,
            audit: Arc::new(TracingAuditSink),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }

    /// Attach an approver for `REQUIRE_APPROVAL` verdicts.
    #[must_use]
    pub fn approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Attach a durable approval store.
    #[must_use]
    pub fn approval_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.approval_store = Some(store);
        self
    }

    /// Attach a budget manager.
    #[must_use]
    pub fn budget(mut self, budget: Arc<dyn BudgetManager>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Replace the operational audit sink.
    #[must_use]
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Bound the approver's response time.
    #[must_use]
    pub fn approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            policy: self.policy,
            ledger: self.ledger,
            approver: self.approver,
            approval_store: self.approval_store,
            budget: self.budget,
            audit: self.audit,
            approval_timeout: self.approval_timeout,
        }
    }
}

/// The authorization boundary. Cheap to share; every invocation runs
/// its own state machine.
pub struct Engine {
    policy: Arc<dyn Policy>,
    ledger: Arc<dyn EvidenceLedger>,
    approver: Option<Arc<dyn Approver>>,
    approval_store: Option<Arc<dyn ApprovalStore>>,
    budget: Option<Arc<dyn BudgetManager>>,
    audit: Arc<dyn AuditSink>,
    approval_timeout: Duration,
}

enum ApprovalOutcome {
    Granted(ApprovalBlock),
    Refused(ApprovalBlock),
    BindingMismatch,
    Failed(ApprovalError),
}

struct PendingCommit {
    check_id: String,
    commit_id: String,
    actual_cost: Decimal,
    currency: String,
}

struct OutcomeWriter {
    ledger: Arc<dyn EvidenceLedger>,
    budget: Option<Arc<dyn BudgetManager>>,
    audit: Arc<dyn AuditSink>,
    request_id: String,
    action: String,
    agent_id: String,
    decision_hash: String,
    parameters: Parameters,
    metadata: BTreeMap<String, Value>,
    commit: Option<PendingCommit>,
}

impl OutcomeWriter {
    /// Best-effort: outcome append, then budget commit. Failures are
    /// logged and swallowed; the callable's result stands.
    fn write(self, status: OutcomeStatus, error_type: Option<&str>, error: Option<String>) {
        let entry = LedgerEntry::outcome(
            self.request_id.clone(),
            Utc::now(),
            self.action,
            self.agent_id,
            OutcomeBlock {
                status,
                error_type: error_type.map(str::to_string),
                error: error.map(|e| truncate_chars(&e, OUTCOME_ERROR_MAX_CHARS)),
                decision_hash: self.decision_hash,
            },
            self.parameters,
            self.metadata,
        );
        match self.ledger.append(entry) {
            Ok(stored) => self.audit.record(&AuditEvent::from_outcome(&stored)),
            Err(e) => {
                warn!(target: "toolgate.engine", request_id = %self.request_id, error = %e, "outcome write failed");
            }
        }

        if let (Some(budget), Some(pending)) = (self.budget, self.commit) {
            let request = CommitRequest {
                check_id: pending.check_id,
                request_id: self.request_id.clone(),
                commit_id: pending.commit_id,
                actual_cost: pending.actual_cost,
                currency: pending.currency,
            };
            if let Err(e) = budget.commit(&request) {
                warn!(target: "toolgate.engine", request_id = %self.request_id, error = %e, "budget commit failed");
            }
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder(policy: Arc<dyn Policy>, ledger: Arc<dyn EvidenceLedger>) -> EngineBuilder {
        EngineBuilder::new(policy, ledger)
    }

    /// Run one guarded invocation.
    ///
    /// `op` receives nothing from the engine and is invoked with its
    /// captured (original, non-redacted) inputs only after an allow
    /// decision is durably recorded. Once that record is written,
    /// execution and outcome logging run to completion on a detached
    /// task, so cancelling the returned future cannot skip the outcome
    /// attempt.
    ///
    /// # Errors
    ///
    /// See [`GuardError`]; every variant except `Execution` means the
    /// callable never ran.
    pub async fn guard<T, E, F, Fut>(&self, call: CallRequest, op: F) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        // BUILD_CONTEXT: redact, then snapshot.
        let request_id = call
            .metadata
            .get(REQUEST_ID_KEY)
            .and_then(Value::as_str)
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let ctx = CallContext::redacted(&call.action, &call.args, &call.kwargs, &call.metadata);

        let policy = call
            .policy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.policy));
        let policy_id = policy.policy_id();
        let policy_hash = tg_core::policy_hash(&policy_id, policy.source_digest().as_deref());

        let decided_at = Utc::now();
        let parameters = ctx.parameters();
        let decision_hash = match tg_core::decision_hash(
            &request_id,
            decided_at,
            &policy_hash,
            &ctx.action,
            &parameters,
            ctx.agent_id(),
        ) {
            Ok(hash) => hash,
            // Parameters outside the canonical universe cannot be
            // evidenced; the same refusal would hit the ledger append.
            Err(e) => {
                return Err(GuardError::AuditLog(AuditLogError {
                    source: LedgerError::Canon(e),
                }));
            }
        };

        // EVAL_POLICY.
        let verdict = match policy.evaluate(&ctx) {
            Ok(verdict) => verdict,
            Err(policy_error) => {
                self.write_decision(
                    &ctx,
                    &request_id,
                    decided_at,
                    Effect::Deny,
                    policy_error.message.clone(),
                    Some(ReasonCode::PolicyEvaluationFailed),
                    &policy_id,
                    &policy_hash,
                    &decision_hash,
                    None,
                )?;
                return Err(GuardError::Policy(policy_error));
            }
        };

        // Branch on the verdict; REQUEST_APPROVAL only when required.
        let approval = match &verdict {
            PolicyDecision::Deny {
                reason,
                reason_code,
            } => {
                self.write_decision(
                    &ctx,
                    &request_id,
                    decided_at,
                    Effect::Deny,
                    reason.clone(),
                    *reason_code,
                    &policy_id,
                    &policy_hash,
                    &decision_hash,
                    None,
                )?;
                return Err(GuardError::Denied(ApprovalDenied::new(
                    reason.clone(),
                    *reason_code,
                )));
            }
            PolicyDecision::Allow { .. } => None,
            PolicyDecision::RequireApproval { .. } => {
                let binding = Binding {
                    request_id: request_id.clone(),
                    policy_hash: policy_hash.clone(),
                    decision_hash: decision_hash.clone(),
                };
                match self.request_approval(&ctx, &verdict, &binding).await {
                    ApprovalOutcome::Granted(block) => Some(block),
                    ApprovalOutcome::Refused(block) => {
                        let denied = ApprovalDenied::new(
                            "approval denied",
                            Some(ReasonCode::ApprovalDenied),
                        );
                        self.write_decision(
                            &ctx,
                            &request_id,
                            decided_at,
                            Effect::Deny,
                            denied.reason.clone(),
                            Some(ReasonCode::ApprovalDenied),
                            &policy_id,
                            &policy_hash,
                            &decision_hash,
                            Some(block),
                        )?;
                        return Err(GuardError::Denied(denied));
                    }
                    ApprovalOutcome::BindingMismatch => {
                        let denied = ApprovalDenied::new(
                            "approval binding does not match this decision",
                            Some(ReasonCode::ApprovalProcessFailed),
                        );
                        self.write_decision(
                            &ctx,
                            &request_id,
                            decided_at,
                            Effect::Deny,
                            denied.reason.clone(),
                            Some(ReasonCode::ApprovalProcessFailed),
                            &policy_id,
                            &policy_hash,
                            &decision_hash,
                            None,
                        )?;
                        return Err(GuardError::Denied(denied));
                    }
                    ApprovalOutcome::Failed(approval_error) => {
                        self.write_decision(
                            &ctx,
                            &request_id,
                            decided_at,
                            Effect::Deny,
                            approval_error.to_string(),
                            Some(ReasonCode::ApprovalProcessFailed),
                            &policy_id,
                            &policy_hash,
                            &decision_hash,
                            None,
                        )?;
                        return Err(GuardError::Approval(approval_error));
                    }
                }
            }
        };

        // BUDGET: check-then-(later)-commit.
        let mut pending_commit = None;
        if let (Some(budget), Some(cost)) = (self.budget.as_ref(), call.budget_cost) {
            let charge = ChargeRequest {
                request_id: request_id.clone(),
                agent_id: ctx.agent_id().to_string(),
                action: ctx.action.clone(),
                projected_cost: cost,
                currency: call.currency.clone(),
            };
            match budget.check(&charge) {
                Ok(check) => {
                    pending_commit = Some(PendingCommit {
                        check_id: check.check_id,
                        commit_id: format!("{request_id}-outcome"),
                        actual_cost: cost,
                        currency: call.currency.clone(),
                    });
                }
                Err(budget_error) => {
                    let code = match &budget_error {
                        tg_budget::BudgetError::Exceeded {
                            scope: BudgetScope::Agent,
                            ..
                        } => ReasonCode::BudgetExceededAgentRate,
                        tg_budget::BudgetError::Exceeded {
                            scope: BudgetScope::Tool,
                            ..
                        } => ReasonCode::BudgetExceededToolRate,
                        _ => ReasonCode::BudgetEvaluationFailed,
                    };
                    self.write_decision(
                        &ctx,
                        &request_id,
                        decided_at,
                        Effect::Deny,
                        budget_error.to_string(),
                        Some(code),
                        &policy_id,
                        &policy_hash,
                        &decision_hash,
                        approval,
                    )?;
                    return Err(GuardError::Budget(budget_error));
                }
            }
        }

        // WRITE_DECISION: the last step before execution.
        self.write_decision(
            &ctx,
            &request_id,
            decided_at,
            Effect::Allow,
            verdict.reason().to_string(),
            verdict.reason_code(),
            &policy_id,
            &policy_hash,
            &decision_hash,
            approval,
        )?;

        // EXECUTE with the original (non-redacted) inputs, then
        // WRITE_OUTCOME, detached so caller cancellation cannot skip
        // the outcome attempt once the decision is durable.
        let writer = OutcomeWriter {
            ledger: Arc::clone(&self.ledger),
            budget: self.budget.clone(),
            audit: Arc::clone(&self.audit),
            request_id,
            action: ctx.action.clone(),
            agent_id: ctx.agent_id().to_string(),
            decision_hash,
            parameters,
            metadata: ctx.metadata.clone(),
            commit: pending_commit,
        };
        let error_type = std::any::type_name::<E>();
        let handle = tokio::spawn(async move {
            let result = op().await;
            match &result {
                Ok(_) => writer.write(OutcomeStatus::Success, None, None),
                Err(e) => writer.write(OutcomeStatus::Error, Some(error_type), Some(e.to_string())),
            }
            result
        });
        match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GuardError::Execution(Box::new(e))),
            Err(join_error) => Err(GuardError::Execution(Box::new(join_error))),
        }
    }

    /// Dispatch an approval request and validate the returned binding.
    async fn request_approval(
        &self,
        ctx: &CallContext,
        verdict: &PolicyDecision,
        binding: &Binding,
    ) -> ApprovalOutcome {
        let Some(approver) = self.approver.as_ref() else {
            return ApprovalOutcome::Failed(ApprovalError::Failed {
                message: "policy requires approval but no approver is configured".to_string(),
            });
        };

        let approval_id = Uuid::new_v4().to_string();
        if let Some(store) = self.approval_store.as_ref() {
            let ttl = chrono::Duration::from_std(self.approval_timeout).ok();
            let record = ApprovalRecord::pending(approval_id.clone(), binding.clone(), ttl);
            if let Err(e) = store.put_pending(record) {
                return ApprovalOutcome::Failed(e);
            }
        }

        let response: Result<ApprovalResponse, ApprovalError> =
            match tokio::time::timeout(self.approval_timeout, approver.approve(ctx, verdict, binding))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ApprovalError::Timeout {
                    seconds: self.approval_timeout.as_secs(),
                }),
            };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if let Some(store) = self.approval_store.as_ref()
                    && let Err(store_error) = store.resolve(&approval_id, false, None)
                {
                    warn!(target: "toolgate.engine", error = %store_error, "failed to mark approval denied");
                }
                return ApprovalOutcome::Failed(e);
            }
        };

        // A response is valid only for exactly this decision.
        if response.binding != *binding {
            if let Some(store) = self.approval_store.as_ref()
                && let Err(store_error) = store.resolve(&approval_id, false, None)
            {
                warn!(target: "toolgate.engine", error = %store_error, "failed to mark approval denied");
            }
            return ApprovalOutcome::BindingMismatch;
        }

        let mut approved = response.approved;
        let mut approver_id = response.approver_id.clone();
        if let Some(store) = self.approval_store.as_ref() {
            match store.resolve(&approval_id, response.approved, response.approver_id.as_deref()) {
                // The store's verdict is authoritative: an expired
                // record is a denial no matter what the approver said.
                Ok(record) => {
                    approved = record.approved;
                    approver_id = record.approver_id;
                }
                Err(e) => return ApprovalOutcome::Failed(e),
            }
        }

        let block = ApprovalBlock {
            approval_id,
            approved,
            approver_id,
            binding: binding.clone(),
        };
        if approved {
            ApprovalOutcome::Granted(block)
        } else {
            ApprovalOutcome::Refused(block)
        }
    }

    /// Append a decision entry; failure blocks execution.
    #[allow(clippy::too_many_arguments)]
    fn write_decision(
        &self,
        ctx: &CallContext,
        request_id: &str,
        decided_at: DateTime<Utc>,
        effect: Effect,
        reason: String,
        reason_code: Option<ReasonCode>,
        policy_id: &str,
        policy_hash: &str,
        decision_hash: &str,
        approval: Option<ApprovalBlock>,
    ) -> Result<LedgerEntry, AuditLogError> {
        let entry = LedgerEntry::decision(
            request_id.to_string(),
            decided_at,
            ctx.action.clone(),
            ctx.agent_id().to_string(),
            DecisionBlock {
                effect,
                reason,
                reason_code,
                policy_id: policy_id.to_string(),
                policy_hash: policy_hash.to_string(),
                decision_hash: decision_hash.to_string(),
            },
            approval,
            ctx.parameters(),
            ctx.metadata.clone(),
        );
        match self.ledger.append(entry) {
            Ok(stored) => {
                self.audit.record(&AuditEvent::from_decision(&stored));
                Ok(stored)
            }
            Err(source) => {
                warn!(target: "toolgate.engine", request_id, error = %source, "decision write failed; blocking execution");
                Err(AuditLogError { source })
            }
        }
    }
}

/// Blocking adapter over the cooperative core.
///
/// Runs the same state machine on a private worker runtime; there is no
/// second implementation to drift.
pub struct BlockingEngine {
    engine: Arc<Engine>,
    runtime: tokio::runtime::Runtime,
}

impl BlockingEngine {
    /// Wrap an engine with a private single-worker runtime.
    ///
    /// # Errors
    ///
    /// Returns the io error from runtime construction.
    pub fn new(engine: Engine) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(Self {
            engine: Arc::new(engine),
            runtime,
        })
    }

    /// Shared-engine variant.
    ///
    /// # Errors
    ///
    /// Returns the io error from runtime construction.
    pub fn from_arc(engine: Arc<Engine>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(Self { engine, runtime })
    }

    /// Blocking counterpart of [`Engine::guard`].
    ///
    /// # Errors
    ///
    /// Same contract as [`Engine::guard`].
    pub fn guard<T, E, F>(&self, call: CallRequest, op: F) -> Result<T, GuardError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.runtime
            .block_on(self.engine.guard(call, move || async move { op() }))
    }

    /// The wrapped engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}
