// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! `tg`: operator CLI for Toolgate evidence ledgers.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tg_core::{EventKind, LedgerEntry};
use tg_ledger::{
    Durability, EvidenceLedger, FileLedger, Receipt, SqliteLedger, VerifyOptions,
    generate_signing_key, load_verifying_key, write_keypair_pem,
};

/// Environment override for the ledger location.
const ENV_LEDGER_PATH: &str = "TOOLGATE_LEDGER_PATH";
/// Environment override for the verification public key.
const ENV_PUBLIC_KEY: &str = "TOOLGATE_PUBLIC_KEY";

/// Exit code for a failed verification.
const EXIT_VERIFY_FAILED: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "tg", version, about = "Toolgate evidence ledger tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Pick by file extension (`.db` / `.sqlite` → sqlite).
    Auto,
    /// Line-oriented JSONL file.
    File,
    /// Embedded SQLite database.
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventFilter {
    Decision,
    Outcome,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify a ledger's hash chain, bindings, and signatures.
    Verify {
        /// Ledger path (or set TOOLGATE_LEDGER_PATH).
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Backend selection.
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,

        /// SPKI PEM public key (or set TOOLGATE_PUBLIC_KEY).
        #[arg(long)]
        public_key: Option<PathBuf>,

        /// Print the machine-readable report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Export entries, optionally filtered.
    Export {
        /// Ledger path (or set TOOLGATE_LEDGER_PATH).
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Backend selection.
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,

        /// Only entries for this action.
        #[arg(long)]
        action: Option<String>,

        /// Only entries for this agent.
        #[arg(long)]
        agent: Option<String>,

        /// Only decision or outcome entries.
        #[arg(long, value_enum)]
        event: Option<EventFilter>,

        /// Only entries for this request id.
        #[arg(long)]
        request_id: Option<String>,

        /// Only entries created at or after this RFC 3339 instant.
        #[arg(long)]
        since: Option<String>,

        /// Only entries created at or before this RFC 3339 instant.
        #[arg(long)]
        until: Option<String>,

        /// Substring search over reasons and parameters.
        #[arg(long)]
        contains: Option<String>,
    },

    /// Extract a portable receipt for one decision entry.
    Receipt {
        /// Ledger path (or set TOOLGATE_LEDGER_PATH).
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Backend selection.
        #[arg(long, value_enum, default_value_t = Backend::Auto)]
        backend: Backend,

        /// Entry position (mutually exclusive with --request-id).
        #[arg(long)]
        position: Option<usize>,

        /// Decision entry for this request id.
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Generate an Ed25519 signing keypair as PEM files.
    Keygen {
        /// Directory to write the keypair into.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// File stem for the keypair.
        #[arg(long, default_value = "toolgate-signing")]
        stem: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn run(command: Commands) -> Result<i32> {
    match command {
        Commands::Verify {
            ledger,
            backend,
            public_key,
            json,
        } => {
            let ledger = open_ledger(resolve_ledger_path(ledger)?, backend)?;
            let public_key = public_key
                .or_else(|| std::env::var(ENV_PUBLIC_KEY).ok().map(PathBuf::from))
                .map(|path| load_verifying_key(&path))
                .transpose()
                .context("load public key")?;
            let report = ledger.verify(&VerifyOptions { public_key })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.ok {
                println!("ok: {} entries verified", report.entries);
                if let Some(checked) = report.signatures_checked {
                    println!("signatures checked: {checked}");
                }
            } else if let Some(failure) = &report.first_failure {
                println!(
                    "FAILED at position {}: {} ({})",
                    failure.position, failure.kind, failure.detail
                );
            }
            Ok(if report.ok { 0 } else { EXIT_VERIFY_FAILED })
        }

        Commands::Export {
            ledger,
            backend,
            action,
            agent,
            event,
            request_id,
            since,
            until,
            contains,
        } => {
            let ledger = open_ledger(resolve_ledger_path(ledger)?, backend)?;
            let since = since.as_deref().map(parse_instant).transpose()?;
            let until = until.as_deref().map(parse_instant).transpose()?;
            let filter = ExportFilter {
                action,
                agent,
                event: event.map(|e| match e {
                    EventFilter::Decision => EventKind::Decision,
                    EventFilter::Outcome => EventKind::Outcome,
                }),
                request_id,
                since,
                until,
                contains,
            };
            for entry in ledger.entries()?.iter().filter(|e| filter.matches(e)) {
                println!("{}", serde_json::to_string(entry)?);
            }
            Ok(0)
        }

        Commands::Receipt {
            ledger,
            backend,
            position,
            request_id,
        } => {
            let ledger = open_ledger(resolve_ledger_path(ledger)?, backend)?;
            let entries = ledger.entries()?;
            let (position, entry) = match (position, request_id) {
                (Some(position), None) => {
                    let entry = entries
                        .get(position)
                        .with_context(|| format!("no entry at position {position}"))?;
                    (position, entry)
                }
                (None, Some(request_id)) => entries
                    .iter()
                    .enumerate()
                    .find(|(_, e)| {
                        e.request_id == request_id && e.event == EventKind::Decision
                    })
                    .with_context(|| format!("no decision entry for request {request_id}"))?,
                _ => bail!("pass exactly one of --position or --request-id"),
            };
            let receipt = Receipt::from_entry(position, entry)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(0)
        }

        Commands::Keygen { out_dir, stem } => {
            let key = generate_signing_key();
            let (private_path, public_path) = write_keypair_pem(&key, &out_dir, &stem)?;
            println!("private key: {}", private_path.display());
            println!("public key:  {}", public_path.display());
            Ok(0)
        }
    }
}

fn resolve_ledger_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    flag.or_else(|| std::env::var(ENV_LEDGER_PATH).ok().map(PathBuf::from))
        .context("no ledger path: pass --ledger or set TOOLGATE_LEDGER_PATH")
}

fn open_ledger(path: PathBuf, backend: Backend) -> Result<Box<dyn EvidenceLedger>> {
    let use_sqlite = match backend {
        Backend::Sqlite => true,
        Backend::File => false,
        Backend::Auto => matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("db" | "sqlite" | "sqlite3")
        ),
    };
    if use_sqlite {
        Ok(Box::new(
            SqliteLedger::open(&path, Durability::Full)
                .with_context(|| format!("open sqlite ledger {}", path.display()))?,
        ))
    } else {
        Ok(Box::new(FileLedger::new(path)))
    }
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    tg_canon::timestamp::parse(text).with_context(|| format!("invalid timestamp '{text}'"))
}

struct ExportFilter {
    action: Option<String>,
    agent: Option<String>,
    event: Option<EventKind>,
    request_id: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    contains: Option<String>,
}

impl ExportFilter {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(action) = &self.action
            && entry.action != *action
        {
            return false;
        }
        if let Some(agent) = &self.agent
            && entry.agent_id != *agent
        {
            return false;
        }
        if let Some(event) = self.event
            && entry.event != event
        {
            return false;
        }
        if let Some(request_id) = &self.request_id
            && entry.request_id != *request_id
        {
            return false;
        }
        if let Some(since) = self.since
            && entry.created_at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && entry.created_at > until
        {
            return false;
        }
        if let Some(needle) = &self.contains {
            let reason_hit = entry
                .decision
                .as_ref()
                .is_some_and(|d| d.reason.contains(needle));
            let params_hit = serde_json::to_string(&entry.parameters)
                .map(|s| s.contains(needle))
                .unwrap_or(false);
            if !reason_hit && !params_hit {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tg_core::{DecisionBlock, Effect, Parameters};

    fn entry(action: &str, agent: &str, reason: &str) -> LedgerEntry {
        LedgerEntry::decision(
            "r1".into(),
            Utc::now(),
            action.into(),
            agent.into(),
            DecisionBlock {
                effect: Effect::Allow,
                reason: reason.into(),
                reason_code: None,
                policy_id: "p".into(),
                policy_hash: "ph".into(),
                decision_hash: "dh".into(),
            },
            None,
            Parameters::default(),
            BTreeMap::new(),
        )
    }

    fn empty_filter() -> ExportFilter {
        ExportFilter {
            action: None,
            agent: None,
            event: None,
            request_id: None,
            since: None,
            until: None,
            contains: None,
        }
    }

    #[test]
    fn filter_by_action_and_agent() {
        let e = entry("billing.refund", "agent-1", "ok");
        let mut filter = empty_filter();
        assert!(filter.matches(&e));

        filter.action = Some("billing.refund".into());
        filter.agent = Some("agent-1".into());
        assert!(filter.matches(&e));

        filter.agent = Some("agent-2".into());
        assert!(!filter.matches(&e));
    }

    #[test]
    fn filter_by_contains_searches_reason() {
        let e = entry("a.b", "agent-1", "within limit");
        let mut filter = empty_filter();
        filter.contains = Some("within".into());
        assert!(filter.matches(&e));
        filter.contains = Some("absent".into());
        assert!(!filter.matches(&e));
    }

    #[test]
    fn filter_by_event_kind() {
        let e = entry("a.b", "agent-1", "ok");
        let mut filter = empty_filter();
        filter.event = Some(EventKind::Outcome);
        assert!(!filter.matches(&e));
        filter.event = Some(EventKind::Decision);
        assert!(filter.matches(&e));
    }

    #[test]
    fn backend_auto_detects_sqlite_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("evidence.db");
        let jsonl = dir.path().join("evidence.jsonl");
        assert!(open_ledger(db, Backend::Auto).is_ok());
        assert!(open_ledger(jsonl, Backend::Auto).is_ok());
    }
}
