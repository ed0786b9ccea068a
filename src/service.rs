//! # Stage: Service Router
//!
//! ## Responsibility
//! Own one instance of every tuning component and map `(method, path, query,
//! body)` onto them.  Bodies are decoded into typed requests, outcomes are
//! rendered as JSON values with an HTTP status, and every [`TunerError`] is
//! turned into a `{"detail": ...}` body with the status from
//! [`TunerError::status_code`].
//!
//! ## Guarantees
//! - Synchronous and socket-free: the web layer calls [`TuningService::handle`]
//!   from `spawn_blocking`, tests call it directly
//! - Unknown path is 404, known path with the wrong method is 405
//! - `OPTIONS` on any known path is a 204 preflight reply
//! - Malformed or missing request bodies are 400, never 500
//!
//! ## NOT Responsible For
//! - Reading from or writing to sockets (see `web`)
//! - Authentication (there is none)

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ServiceConfig;
use crate::error::{Result, TunerError};
use crate::metrics::MetricsCollector;
use crate::self_tune::experiment::{Arm, ExperimentConfig, ExperimentTracker};
use crate::self_tune::gate::{RegressGate, RegressionRunner};
use crate::self_tune::ledger::RuleLedger;
use crate::self_tune::tuner::{AutoTuner, TuningPolicy, DEFAULT_WINDOW};
use crate::store::{FsStore, KeyClock, KvStore, MemoryStore};
use crate::telemetry::{TelemetryInput, TelemetryStore};

/// Name reported by `GET /health`.
pub const SERVICE_LABEL: &str = "Maat2.0";
/// Title printed in the startup banner.
pub const SERVICE_TITLE: &str = "Maat 2.0 Brain";

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTuneRequest {
    #[serde(rename = "move")]
    pub movement: String,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default)]
    pub policy: TuningPolicy,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequest {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressRequest {
    pub gates: Vec<RegressGate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub exp_id: String,
    pub arm: Arm,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A rendered reply: HTTP status plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn detail(status: u16, detail: impl Into<String>) -> Self {
        Self { status, body: json!({ "detail": detail.into() }) }
    }

    /// Empty reply to a CORS preflight.
    pub fn no_content() -> Self {
        Self { status: 204, body: Value::Null }
    }

    pub fn from_error(err: &TunerError) -> Self {
        Self::detail(err.status_code(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Routes the service answers, with the one method each accepts.
pub const ROUTES: &[(&str, &str)] = &[
    ("GET", "/"),
    ("GET", "/health"),
    ("POST", "/telemetry/ingest"),
    ("POST", "/tuning/auto"),
    ("GET", "/tuning/proposals"),
    ("POST", "/rules/version/promote"),
    ("POST", "/rules/version/rollback"),
    ("GET", "/rules/versions"),
    ("POST", "/experiments/ab/start"),
    ("POST", "/experiments/ab/record"),
    ("GET", "/experiments/ab/status"),
    ("POST", "/tests/regress/run"),
    ("GET", "/tests/regress/latest"),
    ("GET", "/metrics"),
];

// ---------------------------------------------------------------------------
// TuningService
// ---------------------------------------------------------------------------

pub struct TuningService {
    data_dir: String,
    telemetry: Arc<TelemetryStore>,
    tuner: AutoTuner,
    gates: RegressionRunner,
    ledger: RuleLedger,
    experiments: ExperimentTracker,
    metrics: MetricsCollector,
}

impl TuningService {
    /// Build every component over the store selected by `config`.
    pub fn open(config: &ServiceConfig) -> Result<Self> {
        if config.in_memory {
            return Self::with_store(Arc::new(MemoryStore::new()), ":memory:");
        }
        let store = FsStore::open(&config.data_dir)?;
        Self::with_store(Arc::new(store), &config.data_dir.display().to_string())
    }

    /// Convenience for an on-disk service rooted at `dir`.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        let store = FsStore::open(dir)?;
        Self::with_store(Arc::new(store), &dir.display().to_string())
    }

    pub fn with_store(store: Arc<dyn KvStore>, data_dir: &str) -> Result<Self> {
        let clock = Arc::new(KeyClock::new());
        Self::with_store_and_clock(store, clock, data_dir)
    }

    pub fn with_store_and_clock(
        store: Arc<dyn KvStore>,
        clock: Arc<KeyClock>,
        data_dir: &str,
    ) -> Result<Self> {
        let telemetry = Arc::new(TelemetryStore::open(Arc::clone(&store), Arc::clone(&clock))?);
        let tuner = AutoTuner::open(Arc::clone(&store), Arc::clone(&clock), Arc::clone(&telemetry))?;
        let gates = RegressionRunner::open(Arc::clone(&store), Arc::clone(&clock), Arc::clone(&telemetry))?;
        let ledger = RuleLedger::open(Arc::clone(&store), Arc::clone(&clock))?;
        let experiments = ExperimentTracker::new(store, clock);
        tracing::info!(target: "service", data_dir = %data_dir, "tuning service ready");
        Ok(Self {
            data_dir: data_dir.to_string(),
            telemetry,
            tuner,
            gates,
            ledger,
            experiments,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }

    /// Per-route request counters; the web layer records into it.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Dispatch one request.  Never panics on caller input.
    pub fn handle(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> Response {
        let method = method.to_ascii_uppercase();
        if !ROUTES.iter().any(|(_, p)| *p == path) {
            return Response::detail(404, "Not Found");
        }
        if method == "OPTIONS" {
            return Response::no_content();
        }
        if !ROUTES.iter().any(|(m, p)| *p == path && *m == method) {
            return Response::detail(405, "Method Not Allowed");
        }
        match self.route(&method, path, query, body) {
            Ok(resp) => resp,
            Err(err) => {
                if err.is_client_error() {
                    tracing::debug!(target: "service", path = %path, error = %err, "request rejected");
                } else {
                    tracing::error!(target: "service", path = %path, error = %err, "request failed");
                }
                Response::from_error(&err)
            }
        }
    }

    fn route(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<Response> {
        match (method, path) {
            ("GET", "/") => Ok(Response::ok(json!({
                "ok": true,
                "service": "Maat2.0 API",
                "hint": "Use /health or POST /telemetry/ingest",
            }))),
            ("GET", "/health") => self.health(),
            ("POST", "/telemetry/ingest") => {
                self.telemetry.ingest(decode(body)?)?;
                Ok(Response::ok(json!({ "ok": true })))
            }
            ("POST", "/tuning/auto") => {
                let req: AutoTuneRequest = decode(body)?;
                let proposal = self.tuner.propose(&req.movement, req.window, &req.policy)?;
                Ok(Response::ok(json!({ "ok": true, "proposal": proposal })))
            }
            ("GET", "/tuning/proposals") => {
                let proposals = self.tuner.proposals()?;
                Ok(Response::ok(json!({ "ok": true, "proposals": proposals })))
            }
            ("POST", "/rules/version/promote") => {
                let req: LabelRequest = decode(body)?;
                let promotion = self.ledger.promote(&req.label)?;
                Ok(Response::ok(json!({ "ok": true, "version_file": promotion.location })))
            }
            ("POST", "/rules/version/rollback") => {
                let req: LabelRequest = decode(body)?;
                self.ledger.rollback(&req.label)?;
                Ok(Response::ok(json!({ "ok": true })))
            }
            ("GET", "/rules/versions") => {
                let versions = self.ledger.versions()?;
                Ok(Response::ok(json!({ "ok": true, "versions": versions })))
            }
            ("POST", "/experiments/ab/start") => {
                let cfg: ExperimentConfig = decode(body)?;
                let exp_id = self.experiments.start(cfg)?;
                Ok(Response::ok(json!({ "ok": true, "exp_id": exp_id })))
            }
            ("POST", "/experiments/ab/record") => {
                let req: RecordRequest = decode(body)?;
                let state = self.experiments.record(&req.exp_id, req.arm, req.value)?;
                Ok(Response::ok(json!({ "ok": true, "state": state })))
            }
            ("GET", "/experiments/ab/status") => {
                let exp_id = query
                    .get("exp_id")
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| TunerError::bad_request("missing query parameter: exp_id"))?;
                let status = self.experiments.status(exp_id)?;
                Ok(Response::ok(serde_json::to_value(status)?))
            }
            ("POST", "/tests/regress/run") => {
                let req: RegressRequest = decode(body)?;
                let report = self.gates.run(&req.gates)?;
                Ok(Response::ok(json!({ "overall": report.overall, "results": report.results })))
            }
            ("GET", "/tests/regress/latest") => {
                let report = self
                    .gates
                    .latest()?
                    .ok_or_else(|| TunerError::not_found("No regression report"))?;
                Ok(Response::ok(serde_json::to_value(report)?))
            }
            ("GET", "/metrics") => Ok(Response::ok(serde_json::to_value(self.metrics.snapshot())?)),
            _ => Ok(Response::detail(404, "Not Found")),
        }
    }

    fn health(&self) -> Result<Response> {
        Ok(Response::ok(json!({
            "ok": true,
            "label": SERVICE_LABEL,
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": self.data_dir,
            "telemetry_records": self.telemetry.count()?,
        })))
    }
}

/// Decode a JSON body; any failure is the caller's fault.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(TunerError::bad_request("request body required"));
    }
    serde_json::from_slice(body).map_err(|e| TunerError::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ROLLING_LOG;

    fn service() -> (Arc<MemoryStore>, TuningService) {
        let mem = Arc::new(MemoryStore::new());
        let svc = TuningService::with_store(mem.clone(), ":memory:").unwrap();
        (mem, svc)
    }

    fn post(svc: &TuningService, path: &str, body: Value) -> Response {
        svc.handle("POST", path, &HashMap::new(), body.to_string().as_bytes())
    }

    fn get(svc: &TuningService, path: &str) -> Response {
        svc.handle("GET", path, &HashMap::new(), b"")
    }

    fn ingest(svc: &TuningService, session: &str, depth: f64, wobble: Option<f64>) {
        let mut metrics = serde_json::Map::new();
        metrics.insert("depth".into(), json!(depth));
        if let Some(w) = wobble {
            metrics.insert("knee_wobble_deg".into(), json!(w));
        }
        let resp = post(
            svc,
            "/telemetry/ingest",
            json!({ "source": "pose", "session_id": session, "metrics": metrics }),
        );
        assert_eq!(resp.status, 200, "{:?}", resp.body);
    }

    // -- routing --

    #[test]
    fn test_root_and_health() {
        let (_, svc) = service();
        let root = get(&svc, "/");
        assert_eq!(root.body["ok"], json!(true));
        assert_eq!(root.body["service"], json!("Maat2.0 API"));

        let health = get(&svc, "/health");
        assert_eq!(health.status, 200);
        assert_eq!(health.body["label"], json!("Maat2.0"));
        assert_eq!(health.body["telemetry_records"], json!(0));
    }

    #[test]
    fn test_unknown_path_is_404() {
        let (_, svc) = service();
        let resp = get(&svc, "/nope");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body["detail"], json!("Not Found"));
    }

    #[test]
    fn test_wrong_method_is_405() {
        let (_, svc) = service();
        assert_eq!(get(&svc, "/tuning/auto").status, 405);
        assert_eq!(post(&svc, "/health", json!({})).status, 405);
    }

    #[test]
    fn test_options_preflight_on_known_routes() {
        let (_, svc) = service();
        for (_, path) in ROUTES {
            let resp = svc.handle("OPTIONS", path, &HashMap::new(), b"");
            assert_eq!(resp.status, 204, "{path}");
            assert_eq!(resp.body, Value::Null);
        }
        assert_eq!(svc.handle("options", "/tuning/auto", &HashMap::new(), b"").status, 204);
        assert_eq!(svc.handle("OPTIONS", "/nope", &HashMap::new(), b"").status, 404);
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let (_, svc) = service();
        assert_eq!(svc.handle("get", "/health", &HashMap::new(), b"").status, 200);
    }

    #[test]
    fn test_malformed_json_is_400() {
        let (_, svc) = service();
        let resp = svc.handle("POST", "/telemetry/ingest", &HashMap::new(), b"{not json");
        assert_eq!(resp.status, 400);
        assert!(resp.body["detail"].as_str().unwrap().starts_with("bad request"));
    }

    #[test]
    fn test_empty_body_is_400() {
        let (_, svc) = service();
        let resp = svc.handle("POST", "/rules/version/promote", &HashMap::new(), b"");
        assert_eq!(resp.status, 400);
    }

    #[test]
    fn test_missing_required_field_is_400() {
        let (_, svc) = service();
        let resp = post(&svc, "/telemetry/ingest", json!({ "source": "pose" }));
        assert_eq!(resp.status, 400);
    }

    // -- telemetry + tuning --

    #[test]
    fn test_ingest_writes_record_and_log() {
        let (mem, svc) = service();
        ingest(&svc, "s1", 0.9, Some(1.0));
        assert_eq!(mem.read_log(ROLLING_LOG).unwrap().lines().count(), 1);
        assert_eq!(get(&svc, "/health").body["telemetry_records"], json!(1));
    }

    #[test]
    fn test_auto_tune_without_telemetry_is_400() {
        let (_, svc) = service();
        let resp = post(&svc, "/tuning/auto", json!({ "move": "squat" }));
        assert_eq!(resp.status, 400);
        assert_eq!(resp.body["detail"], json!("No telemetry"));
    }

    #[test]
    fn test_auto_tune_low_depth_recommends_hips_drop() {
        let (_, svc) = service();
        ingest(&svc, "s1", 0.5, Some(1.0));
        ingest(&svc, "s2", 0.7, Some(2.0));
        let resp = post(&svc, "/tuning/auto", json!({ "move": "squat", "window": 10 }));
        assert_eq!(resp.status, 200);
        let proposal = &resp.body["proposal"];
        assert_eq!(proposal["move"], json!("squat"));
        assert_eq!(proposal["recommended"]["hips_drop"]["op"], json!("scale_up"));
        assert!(proposal["recommended"].get("tempo_slowdown").is_none());
        assert_eq!(proposal["notes"][0], json!("Depth 0.60 < min 0.8"));
    }

    #[test]
    fn test_auto_tune_policy_override() {
        let (_, svc) = service();
        ingest(&svc, "s1", 0.5, Some(1.0));
        let resp = post(
            &svc,
            "/tuning/auto",
            json!({ "move": "squat", "policy": { "depth_min": 0.4, "wobble_max": 0.5 } }),
        );
        let rec = &resp.body["proposal"]["recommended"];
        assert!(rec.get("hips_drop").is_none());
        assert!(rec.get("tempo_slowdown").is_some());
    }

    #[test]
    fn test_auto_tune_zero_window_is_400() {
        let (_, svc) = service();
        ingest(&svc, "s1", 0.9, Some(1.0));
        assert_eq!(post(&svc, "/tuning/auto", json!({ "move": "squat", "window": 0 })).status, 400);
    }

    #[test]
    fn test_proposals_listing_grows() {
        let (_, svc) = service();
        ingest(&svc, "s1", 0.9, Some(1.0));
        post(&svc, "/tuning/auto", json!({ "move": "squat" }));
        post(&svc, "/tuning/auto", json!({ "move": "lunge" }));
        let listed = get(&svc, "/tuning/proposals");
        assert_eq!(listed.body["proposals"].as_array().unwrap().len(), 2);
    }

    // -- ledger --

    #[test]
    fn test_promote_without_proposals_is_400() {
        let (_, svc) = service();
        let resp = post(&svc, "/rules/version/promote", json!({ "label": "v1" }));
        assert_eq!(resp.status, 400);
        assert_eq!(resp.body["detail"], json!("No tuning proposals to version"));
    }

    #[test]
    fn test_promote_then_rollback() {
        let (mem, svc) = service();
        ingest(&svc, "s1", 0.5, None);
        post(&svc, "/tuning/auto", json!({ "move": "squat" }));
        let promoted = post(&svc, "/rules/version/promote", json!({ "label": "v1" }));
        assert_eq!(promoted.status, 200);
        assert!(promoted.body["version_file"].as_str().unwrap().contains("version_"));

        let rolled = post(&svc, "/rules/version/rollback", json!({ "label": "v1" }));
        assert_eq!(rolled.body, json!({ "ok": true }));
        assert!(mem.read_log("rules/rollback.log").unwrap().contains("\tROLLBACK\tv1"));

        let versions = get(&svc, "/rules/versions");
        assert_eq!(versions.body["versions"].as_array().unwrap().len(), 1);
    }

    // -- experiments --

    #[test]
    fn test_experiment_lifecycle() {
        let (_, svc) = service();
        let started = post(
            &svc,
            "/experiments/ab/start",
            json!({ "name": "cue", "metric": "depth", "variant_a": {}, "variant_b": { "x": 1.0 } }),
        );
        let exp_id = started.body["exp_id"].as_str().unwrap().to_string();
        assert!(exp_id.starts_with("exp_"));

        let mut query = HashMap::new();
        query.insert("exp_id".to_string(), exp_id.clone());
        let status = svc.handle("GET", "/experiments/ab/status", &query, b"");
        assert_eq!(status.status, 200);
        assert_eq!(status.body["cfg"]["duration_sessions"], json!(20));
        assert!(status.body.get("winner").is_none());

        post(&svc, "/experiments/ab/record", json!({ "exp_id": exp_id, "arm": "A", "value": 0.9 }));
        post(&svc, "/experiments/ab/record", json!({ "exp_id": exp_id, "arm": "B", "value": 0.7 }));
        let status = svc.handle("GET", "/experiments/ab/status", &query, b"");
        assert_eq!(status.body["winner"], json!("A"));
        assert_eq!(status.body["a"]["n"], json!(1));
    }

    #[test]
    fn test_experiment_status_unknown_is_404() {
        let (_, svc) = service();
        let mut query = HashMap::new();
        query.insert("exp_id".to_string(), "exp_1_missing".to_string());
        let resp = svc.handle("GET", "/experiments/ab/status", &query, b"");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body["detail"], json!("Experiment not found"));
    }

    #[test]
    fn test_experiment_status_missing_query_is_400() {
        let (_, svc) = service();
        assert_eq!(get(&svc, "/experiments/ab/status").status, 400);
    }

    #[test]
    fn test_record_bad_arm_is_400() {
        let (_, svc) = service();
        let resp = post(&svc, "/experiments/ab/record", json!({ "exp_id": "exp_1_x", "arm": "C", "value": 1.0 }));
        assert_eq!(resp.status, 400);
    }

    // -- regression gates --

    #[test]
    fn test_regress_run_and_latest() {
        let (_, svc) = service();
        assert_eq!(get(&svc, "/tests/regress/latest").status, 404);
        ingest(&svc, "s1", 0.7, Some(1.0));
        let resp = post(
            &svc,
            "/tests/regress/run",
            json!({ "gates": [{ "name": "depth", "min_depth": 0.8 }, { "name": "open" }] }),
        );
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["overall"], json!(false));
        assert_eq!(resp.body["results"][0]["notes"][0], json!("avg_depth 0.70 < 0.8"));
        assert_eq!(resp.body["results"][1]["pass"], json!(true));
        assert!(resp.body.get("timestamp").is_none());

        let latest = get(&svc, "/tests/regress/latest");
        assert_eq!(latest.status, 200);
        assert_eq!(latest.body["overall"], json!(false));
    }

    #[test]
    fn test_metrics_reports_recorded_requests() {
        let (_, svc) = service();
        svc.metrics().record("GET", "/health", 200, std::time::Duration::from_millis(4));
        svc.metrics().record("POST", "/tuning/auto", 400, std::time::Duration::from_millis(2));

        let resp = get(&svc, "/metrics");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["system_metrics"]["total_requests"], json!(2));
        assert_eq!(resp.body["system_metrics"]["error_count"], json!(1));
        assert_eq!(resp.body["route_metrics"][0]["route"], json!("GET /health"));
        assert_eq!(resp.body["route_metrics"][1]["route"], json!("POST /tuning/auto"));
    }

    #[test]
    fn test_regress_empty_gates_is_400() {
        let (_, svc) = service();
        assert_eq!(post(&svc, "/tests/regress/run", json!({ "gates": [] })).status, 400);
    }
}
