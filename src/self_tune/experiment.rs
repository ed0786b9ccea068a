//! # Stage: A/B Experiment Tracker
//!
//! ## Responsibility
//! Two-arm online experiments over one coaching metric.  Each experiment keeps
//! a running `(n, sum)` per arm; status reads derive per-arm means and a
//! winner once both arms have observations.
//!
//! Winner rule: the arm whose mean exceeds the other's by more than
//! [`WINNER_MARGIN`] (absolute).  Anything closer is inconclusive.  There is
//! no variance or sample-size test.
//!
//! ## Guarantees
//! - Lost-update free: arm updates are read-modify-write under a
//!   per-experiment lock
//! - Read-only status: `means` / `winner` are derived, never persisted
//! - `winner` is only reported when both arms have `n > 0`
//!
//! ## NOT Responsible For
//! - Routing sessions to arms (caller's concern)
//! - Stopping experiments after `duration_sessions`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::store::{sanitize_segment, JsonStore, KeyClock, KvStore};

/// Storage area for experiment state documents.
pub const EXPERIMENT_AREA: &str = "experiments";
/// Absolute difference in means required to call a winner.
pub const WINNER_MARGIN: f64 = 0.05;

fn default_duration_sessions() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// Arm
// ---------------------------------------------------------------------------

/// Which arm of the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arm {
    A,
    B,
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arm::A => write!(f, "A"),
            Arm::B => write!(f, "B"),
        }
    }
}

impl std::str::FromStr for Arm {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Arm::A),
            "B" => Ok(Arm::B),
            other => Err(TunerError::bad_request(format!("unknown arm '{other}', expected A or B"))),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The configuration an experiment was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    /// Metric the arms are compared on (higher is better).
    pub metric: String,
    pub variant_a: BTreeMap<String, f64>,
    pub variant_b: BTreeMap<String, f64>,
    #[serde(default = "default_duration_sessions")]
    pub duration_sessions: u32,
}

/// Running statistics for one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub n: u64,
    pub sum: f64,
}

impl ArmStats {
    pub fn record(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
    }

    /// `sum / n`, or `None` before the first observation.
    pub fn mean(&self) -> Option<f64> {
        if self.n == 0 {
            None
        } else {
            Some(self.sum / self.n as f64)
        }
    }
}

/// Persisted experiment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub id: String,
    pub cfg: ExperimentConfig,
    pub a: ArmStats,
    pub b: ArmStats,
}

impl ExperimentState {
    pub fn arm_mut(&mut self, arm: Arm) -> &mut ArmStats {
        match arm {
            Arm::A => &mut self.a,
            Arm::B => &mut self.b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArmMeans {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
}

/// Experiment state plus the read-time verdict.
///
/// `means` and `winner` are omitted until both arms have data; once present,
/// `winner` is `null` when the result is inconclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentStatus {
    #[serde(flatten)]
    pub state: ExperimentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub means: Option<ArmMeans>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Option<Arm>>,
}

/// Pick a winner from two arm means.
pub fn decide_winner(mean_a: f64, mean_b: f64) -> Option<Arm> {
    if mean_a - mean_b > WINNER_MARGIN {
        Some(Arm::A)
    } else if mean_b - mean_a > WINNER_MARGIN {
        Some(Arm::B)
    } else {
        None
    }
}

impl ExperimentStatus {
    pub fn from_state(state: ExperimentState) -> Self {
        match (state.a.mean(), state.b.mean()) {
            (Some(a), Some(b)) => Self {
                means: Some(ArmMeans { a, b }),
                winner: Some(decide_winner(a, b)),
                state,
            },
            _ => Self { state, means: None, winner: None },
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentTracker
// ---------------------------------------------------------------------------

/// File-backed experiment registry with per-experiment locking.
pub struct ExperimentTracker {
    store: Arc<dyn KvStore>,
    clock: Arc<KeyClock>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ExperimentTracker {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<KeyClock>) -> Self {
        Self { store, clock, locks: Mutex::new(HashMap::new()) }
    }

    /// Run `f` while holding the lock for `id`.  The lock entry is dropped
    /// from the map once no other caller holds it, so the map only ever
    /// contains ids with an operation in flight.
    fn with_lock<T>(&self, id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        let out = {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            f()
        };
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
        out
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn key(id: &str) -> String {
        format!("{EXPERIMENT_AREA}/{id}")
    }

    /// Reject ids that could not have been produced by [`Self::start`].
    fn checked_key(id: &str) -> Result<String> {
        if id.is_empty() || sanitize_segment(id) != id || !id.starts_with("exp_") {
            return Err(TunerError::not_found("Experiment not found"));
        }
        Ok(Self::key(id))
    }

    /// Create an experiment with both arms zeroed; returns its id.
    pub fn start(&self, cfg: ExperimentConfig) -> Result<String> {
        let stamp = self.clock.next();
        let base = format!("exp_{}_{}", stamp.ts, sanitize_segment(&cfg.name));
        let (id, state) = self.with_lock(&base, || {
            let id = if self.store.get(&Self::key(&base))?.is_some() {
                format!("{base}_{}", stamp.seq)
            } else {
                base.clone()
            };
            let state =
                ExperimentState { id: id.clone(), cfg, a: ArmStats::default(), b: ArmStats::default() };
            self.store.put_json(&Self::key(&id), &state)?;
            Ok((id, state))
        })?;
        tracing::info!(
            target: "self_tune::experiment",
            exp_id = %id,
            metric = %state.cfg.metric,
            duration_sessions = state.cfg.duration_sessions,
            "experiment started"
        );
        Ok(id)
    }

    /// Stored state, or `NotFound`.
    pub fn get(&self, exp_id: &str) -> Result<ExperimentState> {
        let key = Self::checked_key(exp_id)?;
        self.store
            .get_json(&key)?
            .ok_or_else(|| TunerError::not_found("Experiment not found"))
    }

    /// State plus derived means / winner.
    pub fn status(&self, exp_id: &str) -> Result<ExperimentStatus> {
        Ok(ExperimentStatus::from_state(self.get(exp_id)?))
    }

    /// Add one observation to `arm`: `n += 1`, `sum += value`.
    pub fn record(&self, exp_id: &str, arm: Arm, value: f64) -> Result<ExperimentState> {
        if !value.is_finite() {
            return Err(TunerError::bad_request("observation must be a finite number"));
        }
        let key = Self::checked_key(exp_id)?;
        let state = self.with_lock(exp_id, || {
            let mut state: ExperimentState = self
                .store
                .get_json(&key)?
                .ok_or_else(|| TunerError::not_found("Experiment not found"))?;
            state.arm_mut(arm).record(value);
            self.store.put_json(&key, &state)?;
            Ok(state)
        })?;
        tracing::debug!(
            target: "self_tune::experiment",
            exp_id = %exp_id,
            arm = %arm,
            value,
            "arm observation recorded"
        );
        Ok(state)
    }
}
