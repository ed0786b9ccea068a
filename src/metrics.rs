//! Request counters and latency per route, served by `GET /metrics`.
//!
//! One bucket per `(method, path)` pair listed in [`ROUTES`]; everything else
//! (unknown paths, wrong methods, preflights, malformed requests) shares the
//! [`OTHER_ROUTE`] bucket, so the map never grows past `ROUTES.len() + 1`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::service::ROUTES;

/// Bucket for requests that did not hit a known route.
pub const OTHER_ROUTE: &str = "other";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub route: String,
    pub request_count: u64,
    /// Responses with status >= 400.
    pub error_count: u64,
    pub average_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub last_status: u16,
}

impl RouteMetrics {
    fn new(route: String) -> Self {
        Self {
            route,
            request_count: 0,
            error_count: 0,
            average_response_time_ms: 0.0,
            max_response_time_ms: 0.0,
            last_status: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_requests: u64,
    pub error_count: u64,
    /// Percentage of requests answered with status >= 400.
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system_metrics: SystemMetrics,
    /// Sorted by route.
    pub route_metrics: Vec<RouteMetrics>,
}

pub struct MetricsCollector {
    routes: Mutex<HashMap<String, RouteMetrics>>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { routes: Mutex::new(HashMap::new()), start_time: Instant::now() }
    }

    /// Bucket name for a request line.
    pub fn route_label(method: &str, path: &str) -> String {
        let method = method.to_ascii_uppercase();
        if ROUTES.iter().any(|(m, p)| *m == method && *p == path) {
            format!("{method} {path}")
        } else {
            OTHER_ROUTE.to_string()
        }
    }

    pub fn record(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let route = Self::route_label(method, path);
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        let metric = routes.entry(route.clone()).or_insert_with(|| RouteMetrics::new(route));

        metric.request_count += 1;
        if status >= 400 {
            metric.error_count += 1;
        }
        metric.average_response_time_ms = (metric.average_response_time_ms
            * (metric.request_count - 1) as f64
            + ms)
            / metric.request_count as f64;
        metric.max_response_time_ms = metric.max_response_time_ms.max(ms);
        metric.last_status = status;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut route_metrics: Vec<RouteMetrics> = {
            let routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
            routes.values().cloned().collect()
        };
        route_metrics.sort_by(|a, b| a.route.cmp(&b.route));

        let total_requests: u64 = route_metrics.iter().map(|m| m.request_count).sum();
        let error_count: u64 = route_metrics.iter().map(|m| m.error_count).sum();
        let (error_rate, average_response_time_ms) = if total_requests == 0 {
            (0.0, 0.0)
        } else {
            let weighted: f64 = route_metrics
                .iter()
                .map(|m| m.average_response_time_ms * m.request_count as f64)
                .sum();
            (
                error_count as f64 / total_requests as f64 * 100.0,
                weighted / total_requests as f64,
            )
        };

        MetricsSnapshot {
            system_metrics: SystemMetrics {
                total_requests,
                error_count,
                error_rate,
                average_response_time_ms,
                uptime_seconds: self.start_time.elapsed().as_secs(),
            },
            route_metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap.system_metrics.total_requests, 0);
        assert_eq!(snap.system_metrics.error_rate, 0.0);
        assert!(snap.route_metrics.is_empty());
    }

    #[test]
    fn test_record_aggregates_per_route() {
        let collector = MetricsCollector::new();
        collector.record("GET", "/health", 200, Duration::from_millis(10));
        collector.record("get", "/health", 200, Duration::from_millis(30));
        collector.record("POST", "/tuning/auto", 400, Duration::from_millis(5));

        let snap = collector.snapshot();
        assert_eq!(snap.system_metrics.total_requests, 3);
        assert_eq!(snap.system_metrics.error_count, 1);
        assert!((snap.system_metrics.error_rate - 100.0 / 3.0).abs() < 1e-9);

        assert_eq!(snap.route_metrics.len(), 2);
        let health = &snap.route_metrics[0];
        assert_eq!(health.route, "GET /health");
        assert_eq!(health.request_count, 2);
        assert!((health.average_response_time_ms - 20.0).abs() < 1e-6);
        assert!((health.max_response_time_ms - 30.0).abs() < 1e-6);
        assert_eq!(snap.route_metrics[1].last_status, 400);
    }

    #[test]
    fn test_unknown_requests_share_one_bucket() {
        let collector = MetricsCollector::new();
        for i in 0..500 {
            collector.record("GET", &format!("/random/{i}"), 404, Duration::ZERO);
        }
        collector.record("DELETE", "/health", 405, Duration::ZERO);
        collector.record("OPTIONS", "/health", 204, Duration::ZERO);

        let snap = collector.snapshot();
        assert_eq!(snap.route_metrics.len(), 1);
        assert_eq!(snap.route_metrics[0].route, OTHER_ROUTE);
        assert_eq!(snap.route_metrics[0].request_count, 502);
        assert_eq!(snap.route_metrics[0].error_count, 501);
    }
}
