//! # Stage: Rule Version Ledger
//!
//! ## Responsibility
//! Git-like versioning for coaching rules.  `promote(label)` freezes every
//! tuning proposal on record into one immutable [`RuleVersion`] stored under
//! `rules/version_{ts}_{seq}_{label}`.  `rollback(label)` records intent
//! only: it appends `{ts}\tROLLBACK\t{label}` to `rules/rollback.log` and
//! touches nothing else.  Reverting live rules is an operator step.
//!
//! ## Guarantees
//! - Versions are never mutated or deleted; each promotion writes a new record
//! - Proposal order inside a version is timestamp ascending
//! - Rollback is audit-only
//!
//! ## NOT Responsible For
//! - Resolving which proposals a label refers to on rollback
//! - Pruning proposals (dangling history is tolerated)

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::tuner::{load_proposals, TuningProposal};
use crate::error::{Result, TunerError};
use crate::store::{sanitize_segment, JsonStore, KeyClock, KvStore, Stamp};

/// Key prefix of persisted rule versions.
pub const VERSION_PREFIX: &str = "rules/version_";
/// Append-only rollback intent log.
pub const ROLLBACK_LOG: &str = "rules/rollback.log";

/// A labelled, immutable bundle of every proposal known at promotion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleVersion {
    pub label: String,
    #[serde(default)]
    pub created_at: u64,
    pub proposals: Vec<TuningProposal>,
}

/// Where a promotion was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub key: String,
    pub location: String,
    pub proposals: usize,
}

/// One parsed line of the rollback log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackEntry {
    pub timestamp: u64,
    pub label: String,
}

pub struct RuleLedger {
    store: Arc<dyn KvStore>,
    clock: Arc<KeyClock>,
}

impl RuleLedger {
    pub fn open(store: Arc<dyn KvStore>, clock: Arc<KeyClock>) -> Result<Self> {
        if let Some(last) = store.keys(VERSION_PREFIX)?.last() {
            let name = last.rsplit('/').next().unwrap_or(last);
            if let Some(stamp) = Stamp::parse_from_name(name, "version_") {
                clock.observe(stamp);
            }
        }
        Ok(Self { store, clock })
    }

    /// Snapshot all proposals into a new version.
    pub fn promote(&self, label: &str) -> Result<Promotion> {
        let proposals = load_proposals(self.store.as_ref())?;
        if proposals.is_empty() {
            return Err(TunerError::invalid_state("No tuning proposals to version"));
        }
        let stamp = self.clock.next();
        let key = format!("{VERSION_PREFIX}{}_{}", stamp.key_part(), sanitize_segment(label));
        let version = RuleVersion { label: label.to_string(), created_at: stamp.ts, proposals };
        self.store.put_json(&key, &version)?;
        let promotion = Promotion {
            location: self.store.location(&key),
            proposals: version.proposals.len(),
            key,
        };
        tracing::info!(
            target: "self_tune::ledger",
            label = %label,
            key = %promotion.key,
            proposals = promotion.proposals,
            "rule version promoted"
        );
        Ok(promotion)
    }

    /// Record a rollback intent for `label`.
    pub fn rollback(&self, label: &str) -> Result<RollbackEntry> {
        let entry = RollbackEntry { timestamp: self.clock.next().ts, label: label.to_string() };
        let line = format!("{}\tROLLBACK\t{}", entry.timestamp, single_line(label));
        self.store.append_line(ROLLBACK_LOG, &line)?;
        tracing::warn!(
            target: "self_tune::ledger",
            label = %label,
            "rollback intent recorded; live rules are unchanged"
        );
        Ok(entry)
    }

    /// Every stored version, oldest first.
    pub fn versions(&self) -> Result<Vec<RuleVersion>> {
        Ok(self
            .store
            .scan_json::<RuleVersion>(VERSION_PREFIX)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Parsed rollback log, oldest first.  Malformed lines are skipped.
    pub fn rollback_history(&self) -> Result<Vec<RollbackEntry>> {
        let log = self.store.read_log(ROLLBACK_LOG)?;
        Ok(log
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\t');
                let timestamp = parts.next()?.parse().ok()?;
                if parts.next()? != "ROLLBACK" {
                    return None;
                }
                Some(RollbackEntry { timestamp, label: parts.next()?.to_string() })
            })
            .collect())
    }
}

/// Keep the tab-separated log one record per line.
fn single_line(label: &str) -> String {
    label.replace(['\n', '\r'], " ")
}
