//! Window statistics shared by the auto-tuner and the regression gates.
//!
//! Absence of a metric is not an error: a record without `depth` simply
//! contributes nothing to the depth sample set.  Internally the mean is the
//! tri-state [`SampleMean`]; at the wire boundary the documented defaults
//! apply (depth → `0.0`, wobble → [`NO_WOBBLE_SENTINEL`]).

use crate::telemetry::{TelemetryRecord, METRIC_DEPTH, METRIC_KNEE_WOBBLE};

/// Reported `avg_depth` when the window has no depth samples.
pub const NO_DEPTH_DEFAULT: f64 = 0.0;
/// Reported `avg_wobble` when the window has no wobble samples ("unknown/bad").
pub const NO_WOBBLE_SENTINEL: f64 = 999.0;

/// Mean of one metric across a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleMean {
    NoData,
    Mean { value: f64, samples: usize },
}

impl SampleMean {
    /// Arithmetic mean of `values`, or `NoData` when empty.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let (sum, n) = values.into_iter().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        if n == 0 {
            SampleMean::NoData
        } else {
            SampleMean::Mean { value: sum / n as f64, samples: n }
        }
    }

    /// The mean, or `default` when there were no samples.
    pub fn value_or(&self, default: f64) -> f64 {
        match self {
            SampleMean::NoData => default,
            SampleMean::Mean { value, .. } => *value,
        }
    }

    pub fn samples(&self) -> usize {
        match self {
            SampleMean::NoData => 0,
            SampleMean::Mean { samples, .. } => *samples,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, SampleMean::NoData)
    }
}

/// Depth and wobble means over one telemetry window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub records: usize,
    pub depth: SampleMean,
    pub wobble: SampleMean,
}

impl WindowStats {
    pub fn from_records(records: &[TelemetryRecord]) -> Self {
        Self {
            records: records.len(),
            depth: SampleMean::of(records.iter().filter_map(|r| r.metric(METRIC_DEPTH))),
            wobble: SampleMean::of(records.iter().filter_map(|r| r.metric(METRIC_KNEE_WOBBLE))),
        }
    }

    pub fn avg_depth(&self) -> f64 {
        self.depth.value_or(NO_DEPTH_DEFAULT)
    }

    pub fn avg_wobble(&self) -> f64 {
        self.wobble.value_or(NO_WOBBLE_SENTINEL)
    }
}

/// Render a threshold the way operators type it: `0.8`, `3.0`, `12.5`.
pub fn display_threshold(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}
