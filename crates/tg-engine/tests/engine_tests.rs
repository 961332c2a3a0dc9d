// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fail-closed behavior of the guarded-call state machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

use tg_approval::{
    ApprovalError, ApprovalResponse, Approver, MemoryApprovalStore, StaticApprover,
};
use tg_budget::{BudgetLimits, MemoryBudget, agent_counter};
use tg_core::{Binding, CallContext, LedgerEntry, Policy, PolicyDecision, PolicyError, ReasonCode};
use tg_engine::{BlockingEngine, CallRequest, Engine, GuardError};
use tg_ledger::{EvidenceLedger, FileLedger, LedgerError, VerifyOptions};

struct FixedPolicy {
    verdict: PolicyDecision,
}

impl FixedPolicy {
    fn allow() -> Self {
        Self {
            verdict: PolicyDecision::allow("within limit", Some(ReasonCode::PolicyAllowLowRisk)),
        }
    }

    fn deny() -> Self {
        Self {
            verdict: PolicyDecision::deny("blocked", Some(ReasonCode::PolicyDenyHighRisk)),
        }
    }

    fn require_approval() -> Self {
        Self {
            verdict: PolicyDecision::require_approval(
                "high value transfer",
                Some(ReasonCode::PolicyRequireApprovalHighValue),
            ),
        }
    }
}

impl Policy for FixedPolicy {
    fn policy_id(&self) -> String {
        "fixed_policy".to_string()
    }

    fn evaluate(&self, _ctx: &CallContext) -> Result<PolicyDecision, PolicyError> {
        Ok(self.verdict.clone())
    }
}

struct BrokenPolicy;

impl Policy for BrokenPolicy {
    fn policy_id(&self) -> String {
        "broken_policy".to_string()
    }

    fn evaluate(&self, _ctx: &CallContext) -> Result<PolicyDecision, PolicyError> {
        Err(PolicyError::new("policy panicked"))
    }
}

/// Ledger that rejects every append.
struct FailingLedger;

impl EvidenceLedger for FailingLedger {
    fn append(&self, _entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        Err(LedgerError::InvalidEntry {
            reason: "injected failure".to_string(),
        })
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(Vec::new())
    }

    fn verify(
        &self,
        _options: &VerifyOptions,
    ) -> Result<tg_ledger::VerifyReport, LedgerError> {
        unimplemented!("not used in tests")
    }
}

/// Ledger that starts failing after N successful appends.
struct FlakyLedger {
    inner: FileLedger,
    allowed: AtomicUsize,
}

impl FlakyLedger {
    fn new(inner: FileLedger, allowed: usize) -> Self {
        Self {
            inner,
            allowed: AtomicUsize::new(allowed),
        }
    }
}

impl EvidenceLedger for FlakyLedger {
    fn append(&self, entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        if self.allowed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(LedgerError::InvalidEntry {
                reason: "injected outcome failure".to_string(),
            });
        }
        self.inner.append(entry)
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.inner.entries()
    }

    fn verify(
        &self,
        options: &VerifyOptions,
    ) -> Result<tg_ledger::VerifyReport, LedgerError> {
        self.inner.verify(options)
    }
}

/// Approver whose response binding points at a different decision.
struct SwappedBindingApprover;

#[async_trait]
impl Approver for SwappedBindingApprover {
    async fn approve(
        &self,
        _ctx: &CallContext,
        _decision: &PolicyDecision,
        binding: &Binding,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let mut swapped = binding.clone();
        let mut hash = swapped.decision_hash.into_bytes();
        hash[0] = if hash[0] == b'0' { b'1' } else { b'0' };
        swapped.decision_hash = String::from_utf8(hash).unwrap();
        Ok(ApprovalResponse::granted(swapped, Some("ops-1".to_string())))
    }
}

/// Approver that never answers in time.
struct SlowApprover;

#[async_trait]
impl Approver for SlowApprover {
    async fn approve(
        &self,
        _ctx: &CallContext,
        _decision: &PolicyDecision,
        binding: &Binding,
    ) -> Result<ApprovalResponse, ApprovalError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ApprovalResponse::granted(binding.clone(), None))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    ledger: Arc<FileLedger>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(FileLedger::new(dir.path().join("evidence.jsonl")));
    Fixture { _dir: dir, ledger }
}

fn engine(policy: impl Policy + 'static, ledger: Arc<dyn EvidenceLedger>) -> Engine {
    Engine::builder(Arc::new(policy), ledger).build()
}

fn refund_call() -> CallRequest {
    CallRequest::new("billing.refund")
        .kwarg("user", json!("u1"))
        .kwarg("amount", json!(10))
        .agent("agent-1")
}

#[tokio::test]
async fn allow_path_executes_and_chains_evidence() {
    let fx = fixture();
    let engine = engine(FixedPolicy::allow(), fx.ledger.clone());

    let result = engine
        .guard(refund_call(), || async { Ok::<_, std::io::Error>(10) })
        .await
        .unwrap();
    assert_eq!(result, 10);

    let entries = fx.ledger.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].request_id, entries[1].request_id);
    let decision = entries[0].decision.as_ref().unwrap();
    assert_eq!(decision.reason, "within limit");
    assert_eq!(decision.reason_code, Some(ReasonCode::PolicyAllowLowRisk));
    assert_eq!(
        entries[1].outcome.as_ref().unwrap().decision_hash,
        decision.decision_hash
    );
    assert!(fx.ledger.verify(&VerifyOptions::default()).unwrap().ok);
}

#[tokio::test]
async fn redaction_reaches_the_ledger_but_not_the_callable_inputs() {
    let fx = fixture();
    let engine = engine(FixedPolicy::allow(), fx.ledger.clone());

    let secret = "sk-abcdefghijklmnopqrstuvwx".to_string();
    let captured = secret.clone();
    engine
        .guard(
            refund_call().kwarg("api_key", json!(secret)),
            move || async move {
                // The callable still sees its captured original.
                assert!(captured.starts_with("sk-"));
                Ok::<_, std::io::Error>(())
            },
        )
        .await
        .unwrap();

    let entries = fx.ledger.entries().unwrap();
    assert_eq!(
        entries[0].parameters.kwargs["api_key"],
        json!(tg_redact::REDACTED)
    );
}

#[tokio::test]
async fn deny_path_never_invokes_and_records_one_entry() {
    let fx = fixture();
    let engine = engine(FixedPolicy::deny(), fx.ledger.clone());
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let err = engine
        .guard(CallRequest::new("infra.delete_prod").agent("agent-1"), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    match err {
        GuardError::Denied(denied) => assert_eq!(denied.reason, "blocked"),
        other => panic!("expected Denied, got {other:?}"),
    }
    let entries = fx.ledger.entries().unwrap();
    assert_eq!(entries.len(), 1);
    let decision = entries[0].decision.as_ref().unwrap();
    assert_eq!(decision.effect, tg_core::Effect::Deny);
    assert_eq!(decision.reason_code, Some(ReasonCode::PolicyDenyHighRisk));
}

#[tokio::test]
async fn policy_failure_denies_with_evaluation_failed() {
    let fx = fixture();
    let engine = engine(BrokenPolicy, fx.ledger.clone());
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let err = engine
        .guard(refund_call(), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    assert!(matches!(err, GuardError::Policy(_)));
    let entries = fx.ledger.entries().unwrap();
    assert_eq!(
        entries[0].decision.as_ref().unwrap().reason_code,
        Some(ReasonCode::PolicyEvaluationFailed)
    );
}

#[tokio::test]
async fn approval_granted_embeds_matching_binding() {
    let fx = fixture();
    let store = Arc::new(MemoryApprovalStore::new());
    let engine = Engine::builder(Arc::new(FixedPolicy::require_approval()), fx.ledger.clone())
        .approver(Arc::new(StaticApprover::granting("ops-1")))
        .approval_store(store)
        .build();

    let result = engine
        .guard(
            refund_call().kwarg("amount", json!(1500)),
            || async { Ok::<_, std::io::Error>("done") },
        )
        .await
        .unwrap();
    assert_eq!(result, "done");

    let entries = fx.ledger.entries().unwrap();
    assert_eq!(entries.len(), 2);
    let decision_entry = &entries[0];
    let approval = decision_entry.approval.as_ref().unwrap();
    assert!(approval.approved);
    assert_eq!(approval.approver_id.as_deref(), Some("ops-1"));
    assert_eq!(approval.binding.request_id, decision_entry.request_id);
    assert_eq!(
        approval.binding.decision_hash,
        decision_entry.decision.as_ref().unwrap().decision_hash
    );
}

#[tokio::test]
async fn approval_refused_denies_with_approval_denied() {
    let fx = fixture();
    let engine = Engine::builder(Arc::new(FixedPolicy::require_approval()), fx.ledger.clone())
        .approver(Arc::new(StaticApprover::denying()))
        .build();
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let err = engine
        .guard(refund_call(), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    assert!(matches!(err, GuardError::Denied(_)));
    let entries = fx.ledger.entries().unwrap();
    let decision = entries[0].decision.as_ref().unwrap();
    assert_eq!(decision.reason_code, Some(ReasonCode::ApprovalDenied));
    assert!(!entries[0].approval.as_ref().unwrap().approved);
}

#[tokio::test]
async fn binding_mismatch_denies_with_process_failed() {
    let fx = fixture();
    let engine = Engine::builder(Arc::new(FixedPolicy::require_approval()), fx.ledger.clone())
        .approver(Arc::new(SwappedBindingApprover))
        .build();
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let err = engine
        .guard(refund_call(), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    match err {
        GuardError::Denied(denied) => {
            assert_eq!(denied.reason_code, Some(ReasonCode::ApprovalProcessFailed));
        }
        other => panic!("expected Denied, got {other:?}"),
    }
    let entries = fx.ledger.entries().unwrap();
    assert_eq!(
        entries[0].decision.as_ref().unwrap().reason_code,
        Some(ReasonCode::ApprovalProcessFailed)
    );
}

#[tokio::test]
async fn approver_timeout_denies_with_process_failed() {
    let fx = fixture();
    let engine = Engine::builder(Arc::new(FixedPolicy::require_approval()), fx.ledger.clone())
        .approver(Arc::new(SlowApprover))
        .approval_timeout(Duration::from_millis(50))
        .build();

    let err = engine
        .guard(refund_call(), || async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GuardError::Approval(ApprovalError::Timeout { .. })
    ));
    let entries = fx.ledger.entries().unwrap();
    assert_eq!(
        entries[0].decision.as_ref().unwrap().reason_code,
        Some(ReasonCode::ApprovalProcessFailed)
    );
}

#[tokio::test]
async fn missing_approver_fails_the_approval_process() {
    let fx = fixture();
    let engine = engine(FixedPolicy::require_approval(), fx.ledger.clone());

    let err = engine
        .guard(refund_call(), || async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Approval(_)));
}

#[tokio::test]
async fn decision_write_failure_blocks_execution() {
    let engine = engine(FixedPolicy::allow(), Arc::new(FailingLedger));
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();

    let err = engine
        .guard(refund_call(), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    assert!(matches!(err, GuardError::AuditLog(_)));
}

#[tokio::test]
async fn budget_exceeded_denies_before_decision() {
    let fx = fixture();
    let budget = Arc::new(MemoryBudget::new(BudgetLimits {
        per_agent: Some(Decimal::from(6)),
        per_tool: None,
        window: None,
    }));
    let engine = Engine::builder(Arc::new(FixedPolicy::allow()), fx.ledger.clone())
        .budget(budget)
        .build();

    engine
        .guard(refund_call().budget_cost(Decimal::from(5)), || async {
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let err = engine
        .guard(
            refund_call().budget_cost(Decimal::from(5)),
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            },
        )
        .await
        .unwrap_err();

    assert!(!called.load(Ordering::SeqCst));
    assert!(matches!(err, GuardError::Budget(_)));
    let entries = fx.ledger.entries().unwrap();
    let last = entries.last().unwrap();
    assert_eq!(
        last.decision.as_ref().unwrap().reason_code,
        Some(ReasonCode::BudgetExceededAgentRate)
    );
}

#[tokio::test]
async fn budget_check_is_idempotent_for_a_pinned_request_id() {
    let fx = fixture();
    let budget = Arc::new(MemoryBudget::new(BudgetLimits {
        per_agent: Some(Decimal::from(6)),
        per_tool: None,
        window: None,
    }));
    let engine = Engine::builder(Arc::new(FixedPolicy::allow()), fx.ledger.clone())
        .budget(budget.clone())
        .build();

    for _ in 0..2 {
        engine
            .guard(
                refund_call()
                    .request_id("pinned-request")
                    .budget_cost(Decimal::from(5)),
                || async { Ok::<_, std::io::Error>(()) },
            )
            .await
            .unwrap();
    }
    assert_eq!(
        budget.counter_total(&agent_counter("agent-1")),
        Decimal::from(5)
    );
}

#[tokio::test]
async fn execution_error_is_preserved_and_outcome_recorded() {
    let fx = fixture();
    let engine = engine(FixedPolicy::allow(), fx.ledger.clone());

    let err = engine
        .guard(refund_call(), || async {
            Err::<(), _>(std::io::Error::other("downstream exploded"))
        })
        .await
        .unwrap_err();

    match &err {
        GuardError::Execution(inner) => {
            assert!(inner.to_string().contains("downstream exploded"));
        }
        other => panic!("expected Execution, got {other:?}"),
    }

    let entries = fx.ledger.entries().unwrap();
    assert_eq!(entries.len(), 2);
    let outcome = entries[1].outcome.as_ref().unwrap();
    assert_eq!(outcome.status, tg_core::OutcomeStatus::Error);
    assert_eq!(outcome.error.as_deref(), Some("downstream exploded"));
    assert!(fx.ledger.verify(&VerifyOptions::default()).unwrap().ok);
}

#[tokio::test]
async fn long_execution_errors_are_truncated() {
    let fx = fixture();
    let engine = engine(FixedPolicy::allow(), fx.ledger.clone());
    let message = "x".repeat(500);

    let _ = engine
        .guard(refund_call(), move || async move {
            Err::<(), _>(std::io::Error::other(message))
        })
        .await
        .unwrap_err();

    let entries = fx.ledger.entries().unwrap();
    let outcome = entries[1].outcome.as_ref().unwrap();
    assert_eq!(outcome.error.as_ref().unwrap().chars().count(), 200);
}

#[tokio::test]
async fn outcome_write_failure_does_not_mask_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyLedger::new(
        FileLedger::new(dir.path().join("evidence.jsonl")),
        1, // decision succeeds, outcome fails
    ));
    let engine = engine(FixedPolicy::allow(), flaky.clone());

    let result = engine
        .guard(refund_call(), || async { Ok::<_, std::io::Error>(41) })
        .await
        .unwrap();
    assert_eq!(result, 41);
    assert_eq!(flaky.entries().unwrap().len(), 1);
}

#[test]
fn blocking_engine_runs_the_same_machine() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(FileLedger::new(dir.path().join("evidence.jsonl")));
    let engine = Engine::builder(Arc::new(FixedPolicy::allow()), ledger.clone()).build();
    let blocking = BlockingEngine::new(engine).unwrap();

    let result = blocking
        .guard(refund_call(), || Ok::<_, std::io::Error>(7))
        .unwrap();
    assert_eq!(result, 7);
    assert_eq!(ledger.entries().unwrap().len(), 2);
}
