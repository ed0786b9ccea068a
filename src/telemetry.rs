//! # Stage: Telemetry Store
//!
//! ## Responsibility
//! Durable, append-only log of per-session movement-quality samples.  Each
//! ingested record is written twice: once as an individually addressable
//! document (`telemetry/t_{ts}_{seq}_{session}`) and once as a line in the
//! rolling `telemetry/rolling.jsonl` log for cheap sequential scans.
//!
//! [`TelemetryStore::recent`] reads the addressable documents, never the
//! rolling log, so pruning the log externally does not change what the tuner
//! and gate runner see.
//!
//! ## Guarantees
//! - `ts` is assigned exactly once, at ingestion, and is monotonic
//!   non-decreasing in arrival order
//! - Keys are unique even for same-second ingests of the same session
//! - Ingests are serialized, so the rolling log order equals key order
//! - A failed ingest is never returned by `recent()`; at worst it leaves one
//!   orphan line in the rolling log
//!
//! ## NOT Responsible For
//! - Retention / pruning
//! - Feeding experiment arms (the `experiment`/`variant` tags are stored only)

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{sanitize_segment, JsonStore, KeyClock, KvStore, Stamp};

/// Key prefix of addressable telemetry documents.
pub const TELEMETRY_PREFIX: &str = "telemetry/t_";
/// Append-only newline-delimited copy of every record.
pub const ROLLING_LOG: &str = "telemetry/rolling.jsonl";

/// Depth metric name (fraction of target squat depth reached).
pub const METRIC_DEPTH: &str = "depth";
/// Lateral knee wobble metric name, in degrees.
pub const METRIC_KNEE_WOBBLE: &str = "knee_wobble_deg";

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// A telemetry sample as submitted by a client (no timestamp yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryInput {
    pub source: String,
    pub session_id: String,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub experiment: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

/// A stored telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub source: String,
    pub session_id: String,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub experiment: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    /// Server-assigned ingestion time, Unix seconds.
    pub ts: u64,
}

impl TelemetryRecord {
    fn stamped(input: TelemetryInput, ts: u64) -> Self {
        Self {
            source: input.source,
            session_id: input.session_id,
            metrics: input.metrics,
            experiment: input.experiment,
            variant: input.variant,
            ts,
        }
    }

    /// The client-supplied part of this record.
    pub fn input(&self) -> TelemetryInput {
        TelemetryInput {
            source: self.source.clone(),
            session_id: self.session_id.clone(),
            metrics: self.metrics.clone(),
            experiment: self.experiment.clone(),
            variant: self.variant.clone(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// TelemetryStore
// ---------------------------------------------------------------------------

/// Append-only telemetry log with a bounded recent-window reader.
pub struct TelemetryStore {
    store: Arc<dyn KvStore>,
    clock: Arc<KeyClock>,
    ingest_lock: Mutex<()>,
}

impl TelemetryStore {
    /// Open over `store`, advancing `clock` past any records already on disk.
    pub fn open(store: Arc<dyn KvStore>, clock: Arc<KeyClock>) -> Result<Self> {
        if let Some(last) = store.keys(TELEMETRY_PREFIX)?.last() {
            let name = last.rsplit('/').next().unwrap_or(last);
            if let Some(stamp) = Stamp::parse_from_name(name, "t_") {
                clock.observe(stamp);
            }
        }
        Ok(Self { store, clock, ingest_lock: Mutex::new(()) })
    }

    /// Stamp, persist and log one record.
    pub fn ingest(&self, input: TelemetryInput) -> Result<TelemetryRecord> {
        let _guard = self.ingest_lock.lock().unwrap_or_else(|p| p.into_inner());
        let stamp = self.clock.next();
        let record = TelemetryRecord::stamped(input, stamp.ts);
        let key = format!(
            "{TELEMETRY_PREFIX}{}_{}",
            stamp.key_part(),
            sanitize_segment(&record.session_id)
        );
        // log first: a failed ingest must never reach `recent()`
        self.store.append_line(ROLLING_LOG, &serde_json::to_string(&record)?)?;
        self.store.put_json(&key, &record)?;
        tracing::debug!(
            target: "telemetry",
            key = %key,
            session = %record.session_id,
            metrics = record.metrics.len(),
            "telemetry ingested"
        );
        Ok(record)
    }

    /// The most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Result<Vec<TelemetryRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let keys = self.store.keys(TELEMETRY_PREFIX)?;
        let start = keys.len().saturating_sub(n);
        let mut out = Vec::with_capacity(keys.len() - start);
        for key in &keys[start..] {
            if let Some(rec) = self.store.get_json::<TelemetryRecord>(key)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Number of addressable records on record.
    pub fn count(&self) -> Result<usize> {
        Ok(self.store.keys(TELEMETRY_PREFIX)?.len())
    }
}
