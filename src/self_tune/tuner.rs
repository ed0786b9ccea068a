//! # Stage: Auto-Tuner
//!
//! ## Responsibility
//! Reads a bounded window of recent telemetry, computes depth and knee-wobble
//! means, and emits a [`TuningProposal`]: zero or more named adjustments to
//! the movement-coaching rules, each with a human-readable justification.
//! Every proposal is persisted under `rules/tune_{ts}_{seq}`.
//!
//! Rules (independent, both may fire):
//! - `avg_depth < depth_min`  → `hips_drop`      (scale_up by `adjust_pct`)
//! - `avg_wobble > wobble_max` → `tempo_slowdown` (scale_up by `adjust_pct`)
//!
//! With no wobble samples `avg_wobble` is the 999.0 sentinel, which exceeds
//! any sane `wobble_max`, so `tempo_slowdown` fires on "no data".  The note
//! for that case says so explicitly.
//!
//! ## Guarantees
//! - `stats` is always populated; `recommended` may be empty
//! - Proposals are immutable once written
//!
//! ## NOT Responsible For
//! - Applying adjustments to live coaching rules
//! - Versioning proposals (see [`super::ledger`])

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::stats::{display_threshold, WindowStats};
use crate::store::{JsonStore, KeyClock, KvStore, Stamp};
use crate::telemetry::TelemetryStore;

/// Key prefix of persisted proposals.
pub const PROPOSAL_PREFIX: &str = "rules/tune_";
/// Records read when the caller does not pass a window.
pub const DEFAULT_WINDOW: usize = 50;

pub const ADJ_HIPS_DROP: &str = "hips_drop";
pub const ADJ_TEMPO_SLOWDOWN: &str = "tempo_slowdown";

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Thresholds and step size for one tuning run.  Unknown keys are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningPolicy {
    /// Magnitude of any recommended scale adjustment.
    pub adjust_pct: f64,
    /// Average depth below this is too shallow.
    pub depth_min: f64,
    /// Average lateral knee wobble (degrees) above this is excessive.
    pub wobble_max: f64,
}

impl Default for TuningPolicy {
    fn default() -> Self {
        Self { adjust_pct: 0.1, depth_min: 0.8, wobble_max: 3.0 }
    }
}

// ---------------------------------------------------------------------------
// Proposal types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustOp {
    ScaleUp,
}

/// One recommended rule adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub op: AdjustOp,
    pub by: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProposalStats {
    pub avg_depth: f64,
    pub avg_wobble: f64,
    #[serde(default)]
    pub depth_samples: usize,
    #[serde(default)]
    pub wobble_samples: usize,
}

/// A persisted tuning decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningProposal {
    #[serde(rename = "move")]
    pub movement: String,
    /// Unix seconds at which the proposal was made.
    pub timestamp: u64,
    pub stats: ProposalStats,
    pub recommended: BTreeMap<String, Adjustment>,
    pub notes: Vec<String>,
}

impl TuningProposal {
    pub fn recommends(&self, adjustment: &str) -> bool {
        self.recommended.contains_key(adjustment)
    }
}

/// Apply `policy` to `stats`.  Pure; no I/O.
pub fn evaluate(
    movement: &str,
    stats: &WindowStats,
    policy: &TuningPolicy,
    timestamp: u64,
) -> TuningProposal {
    let avg_depth = stats.avg_depth();
    let avg_wobble = stats.avg_wobble();
    let mut recommended = BTreeMap::new();
    let mut notes = Vec::new();

    if avg_depth < policy.depth_min {
        recommended.insert(
            ADJ_HIPS_DROP.to_string(),
            Adjustment { op: AdjustOp::ScaleUp, by: policy.adjust_pct, reason: "avg_depth low".into() },
        );
        notes.push(format!(
            "Depth {avg_depth:.2} < min {}",
            display_threshold(policy.depth_min)
        ));
    }

    if avg_wobble > policy.wobble_max {
        recommended.insert(
            ADJ_TEMPO_SLOWDOWN.to_string(),
            Adjustment {
                op: AdjustOp::ScaleUp,
                by: policy.adjust_pct,
                reason: "knee wobble high".into(),
            },
        );
        let mut note = format!(
            "Wobble {avg_wobble:.2} > max {}",
            display_threshold(policy.wobble_max)
        );
        if stats.wobble.is_no_data() {
            note.push_str(" (no wobble samples in window)");
        }
        notes.push(note);
    }

    TuningProposal {
        movement: movement.to_string(),
        timestamp,
        stats: ProposalStats {
            avg_depth,
            avg_wobble,
            depth_samples: stats.depth.samples(),
            wobble_samples: stats.wobble.samples(),
        },
        recommended,
        notes,
    }
}

// ---------------------------------------------------------------------------
// AutoTuner
// ---------------------------------------------------------------------------

pub struct AutoTuner {
    store: Arc<dyn KvStore>,
    clock: Arc<KeyClock>,
    telemetry: Arc<TelemetryStore>,
}

impl AutoTuner {
    pub fn open(
        store: Arc<dyn KvStore>,
        clock: Arc<KeyClock>,
        telemetry: Arc<TelemetryStore>,
    ) -> Result<Self> {
        if let Some(last) = store.keys(PROPOSAL_PREFIX)?.last() {
            let name = last.rsplit('/').next().unwrap_or(last);
            if let Some(stamp) = Stamp::parse_from_name(name, "tune_") {
                clock.observe(stamp);
            }
        }
        Ok(Self { store, clock, telemetry })
    }

    /// Evaluate the last `window` records and persist the resulting proposal.
    pub fn propose(&self, movement: &str, window: usize, policy: &TuningPolicy) -> Result<TuningProposal> {
        if window == 0 {
            return Err(TunerError::invalid_state("window must be positive"));
        }
        let records = self.telemetry.recent(window)?;
        if records.is_empty() {
            return Err(TunerError::invalid_state("No telemetry"));
        }
        let stats = WindowStats::from_records(&records);
        let stamp = self.clock.next();
        let proposal = evaluate(movement, &stats, policy, stamp.ts);
        let key = format!("{PROPOSAL_PREFIX}{}", stamp.key_part());
        self.store.put_json(&key, &proposal)?;
        tracing::info!(
            target: "self_tune::tuner",
            key = %key,
            movement = %movement,
            records = stats.records,
            avg_depth = proposal.stats.avg_depth,
            avg_wobble = proposal.stats.avg_wobble,
            recommended = ?proposal.recommended.keys().collect::<Vec<_>>(),
            "tuning proposal persisted"
        );
        Ok(proposal)
    }

    /// Every persisted proposal, timestamp ascending (ties in key order).
    pub fn proposals(&self) -> Result<Vec<TuningProposal>> {
        load_proposals(self.store.as_ref())
    }
}

/// Load all proposals from `store` in deterministic order.
pub fn load_proposals(store: &dyn KvStore) -> Result<Vec<TuningProposal>> {
    let mut keyed: Vec<(String, TuningProposal)> = store.scan_json(PROPOSAL_PREFIX)?;
    keyed.sort_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));
    Ok(keyed.into_iter().map(|(_, p)| p).collect())
}
