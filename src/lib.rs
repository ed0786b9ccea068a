//! Telemetry-driven self-tuning for a movement-coaching backend.
//!
//! Movement telemetry is ingested per session, recent windows are reduced to
//! average depth and knee wobble, and from those the crate proposes rule
//! adjustments, gates releases, versions rule history and tracks two-arm A/B
//! experiments.  Everything is persisted as JSON documents under one data
//! directory and exposed over a small HTTP/JSON API.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod self_tune;
pub mod service;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod web;

pub use config::ServiceConfig;
pub use error::{Result, TunerError};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use service::{Response, TuningService};
pub use store::{FsStore, JsonStore, KeyClock, KvStore, MemoryStore};
pub use telemetry::{TelemetryInput, TelemetryRecord, TelemetryStore};
