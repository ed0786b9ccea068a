//! # Module: self_tune
//!
//! Self-tuning core: turns recent movement telemetry into rule adjustments,
//! gates releases on telemetry thresholds, versions the rule history, and
//! tracks A/B experiments.
//!
//! ## Sub-modules
//! - [`tuner`]: auto-tuner producing tuning proposals
//! - [`gate`]: regression gate runner
//! - [`ledger`]: rule version promotion and rollback intents
//! - [`experiment`]: two-arm A/B tracker

pub mod tuner;
pub mod gate;
pub mod ledger;
pub mod experiment;
