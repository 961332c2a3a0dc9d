// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Toolgate: a fail-closed authorization boundary for agent tool calls.
//!
//! Every guarded invocation runs policy → (approval) → budget →
//! durable decision evidence → execute → best-effort outcome, backed by
//! a hash-chained, optionally Ed25519-signed ledger. This facade
//! re-exports the public surface of the member crates; depend on the
//! individual `tg-*` crates instead when you want a narrower footprint.

pub use tg_approval::{
    ApprovalError, ApprovalRecord, ApprovalResponse, ApprovalState, ApprovalStore, Approver,
    EnvAutoApprover, MemoryApprovalStore, SqliteApprovalStore, StaticApprover,
};
pub use tg_budget::{
    BudgetCheck, BudgetCommit, BudgetError, BudgetLimits, BudgetManager, BudgetScope,
    ChargeRequest, CommitRequest, MemoryBudget, SqliteBudget,
};
pub use tg_canon::{CanonError, CanonValue};
pub use tg_core::{
    ApprovalBlock, ApprovalDenied, Binding, CallContext, DecisionBlock, Effect, EventKind,
    LedgerEntry, OutcomeBlock, OutcomeStatus, Parameters, Policy, PolicyDecision, PolicyError,
    ReasonCode,
};
pub use tg_engine::{
    AuditEvent, AuditLogError, AuditSink, BlockingEngine, CallRequest, Engine, EngineBuilder,
    GuardError, JsonlAuditSink, TracingAuditSink,
};
pub use tg_ledger::{
    Durability, EvidenceLedger, FailureKind, FileLedger, LedgerError, Receipt, SqliteLedger,
    VerifyOptions, VerifyReport,
};
pub use tg_redact::{
    KEY_DENYLIST, REDACTED, is_sensitive_key, is_sensitive_value, redact_args, redact_map,
    redact_value,
};
