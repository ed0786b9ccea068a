//! # Stage: Regression Gate Runner
//!
//! ## Responsibility
//! Evaluates caller-supplied acceptance gates against the most recent
//! [`REGRESS_WINDOW`] telemetry records and reports a per-gate verdict plus
//! an overall verdict.  Every run is persisted under `tests/regress_{ts}_{seq}`.
//!
//! The window size is fixed so that runs stay comparable with each other.
//!
//! ## Guarantees
//! - No short-circuit: every gate is evaluated and reported
//! - `pass == notes.is_empty()` for every [`GateResult`]
//! - `overall` is the logical AND of all gate results

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::stats::{display_threshold, WindowStats};
use crate::store::{JsonStore, KeyClock, KvStore, Stamp};
use crate::telemetry::TelemetryStore;

/// Key prefix of persisted regression reports.
pub const REGRESS_PREFIX: &str = "tests/regress_";
/// Number of recent telemetry records every gate run reads.
pub const REGRESS_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// Gate types
// ---------------------------------------------------------------------------

/// A named acceptance criterion.  A gate with no thresholds always passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressGate {
    pub name: String,
    #[serde(default)]
    pub min_depth: Option<f64>,
    #[serde(default)]
    pub max_wobble: Option<f64>,
}

/// Outcome of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub pass: bool,
    pub notes: Vec<String>,
}

impl GateResult {
    fn from_notes(name: &str, notes: Vec<String>) -> Self {
        Self { name: name.to_string(), pass: notes.is_empty(), notes }
    }
}

/// Full result of one gate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressReport {
    pub overall: bool,
    pub results: Vec<GateResult>,
    #[serde(default)]
    pub timestamp: u64,
}

impl RegressReport {
    pub fn failed(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| !r.pass)
    }
}

/// Evaluate one gate against window statistics.  Pure; no I/O.
pub fn evaluate_gate(gate: &RegressGate, stats: &WindowStats) -> GateResult {
    let mut notes = Vec::new();
    if let Some(min) = gate.min_depth {
        let avg = stats.avg_depth();
        if avg < min {
            notes.push(format!("avg_depth {avg:.2} < {}", display_threshold(min)));
        }
    }
    if let Some(max) = gate.max_wobble {
        let avg = stats.avg_wobble();
        if avg > max {
            notes.push(format!("avg_wobble {avg:.2} > {}", display_threshold(max)));
        }
    }
    GateResult::from_notes(&gate.name, notes)
}

/// Evaluate every gate in order.  Pure; no I/O.
pub fn evaluate_gates(gates: &[RegressGate], stats: &WindowStats, timestamp: u64) -> RegressReport {
    let results: Vec<GateResult> = gates.iter().map(|g| evaluate_gate(g, stats)).collect();
    let overall = results.iter().all(|r| r.pass);
    RegressReport { overall, results, timestamp }
}

// ---------------------------------------------------------------------------
// RegressionRunner
// ---------------------------------------------------------------------------

pub struct RegressionRunner {
    store: Arc<dyn KvStore>,
    clock: Arc<KeyClock>,
    telemetry: Arc<TelemetryStore>,
}

impl RegressionRunner {
    pub fn open(
        store: Arc<dyn KvStore>,
        clock: Arc<KeyClock>,
        telemetry: Arc<TelemetryStore>,
    ) -> Result<Self> {
        if let Some(last) = store.keys(REGRESS_PREFIX)?.last() {
            let name = last.rsplit('/').next().unwrap_or(last);
            if let Some(stamp) = Stamp::parse_from_name(name, "regress_") {
                clock.observe(stamp);
            }
        }
        Ok(Self { store, clock, telemetry })
    }

    /// Run `gates` against the fixed recent window and persist the report.
    pub fn run(&self, gates: &[RegressGate]) -> Result<RegressReport> {
        if gates.is_empty() {
            return Err(TunerError::invalid_state("at least one gate is required"));
        }
        let records = self.telemetry.recent(REGRESS_WINDOW)?;
        let stats = WindowStats::from_records(&records);
        let stamp = self.clock.next();
        let report = evaluate_gates(gates, &stats, stamp.ts);
        let key = format!("{REGRESS_PREFIX}{}", stamp.key_part());
        self.store.put_json(&key, &report)?;

        let failed: Vec<&str> = report.failed().map(|r| r.name.as_str()).collect();
        if report.overall {
            tracing::info!(
                target: "self_tune::gate",
                key = %key,
                gates = gates.len(),
                records = stats.records,
                "regression gates passed"
            );
        } else {
            tracing::warn!(
                target: "self_tune::gate",
                key = %key,
                failed = ?failed,
                records = stats.records,
                "regression gates failed"
            );
        }
        Ok(report)
    }

    /// The most recently persisted report, if any.
    pub fn latest(&self) -> Result<Option<RegressReport>> {
        match self.store.keys(REGRESS_PREFIX)?.last() {
            Some(key) => self.store.get_json(key),
            None => Ok(None),
        }
    }
}
