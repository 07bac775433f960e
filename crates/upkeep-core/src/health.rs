//! Bounded-retry liveness probe against the managed service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::HealthConfig;

/// One liveness probe. Returns `Err(reason)` when the service is unhealthy.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, endpoint: &str, timeout: Duration) -> std::result::Result<(), String>;
}

/// Probes over HTTP; any 2xx response counts as healthy.
#[derive(Debug, Default)]
pub struct HttpProbe;

impl HealthProbe for HttpProbe {
    fn probe(&self, endpoint: &str, timeout: Duration) -> std::result::Result<(), String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        let resp = client.get(endpoint).send().map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", resp.status()))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    pub attempt_number: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub passed: bool,
    pub attempts: u32,
    /// Latency of the last attempt.
    pub latency_ms: u64,
    pub results: Vec<HealthCheckResult>,
}

impl HealthReport {
    pub fn last_error(&self) -> Option<&str> {
        self.results.last().and_then(|r| r.error.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct CheckParams {
    pub max_attempts: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl CheckParams {
    pub fn post_update(cfg: &HealthConfig) -> Self {
        Self {
            max_attempts: cfg.attempts.max(1),
            delay: Duration::from_secs(cfg.delay_secs),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    pub fn baseline(cfg: &HealthConfig) -> Self {
        Self {
            max_attempts: cfg.baseline_attempts.max(1),
            ..Self::post_update(cfg)
        }
    }
}

/// Run up to `max_attempts` probes, sleeping `delay` after each failure.
pub fn check(
    probe: &dyn HealthProbe,
    endpoint: &str,
    params: &CheckParams,
) -> HealthReport {
    let mut results = Vec::new();
    for attempt in 1..=params.max_attempts.max(1) {
        let started = Instant::now();
        let outcome = probe.probe(endpoint, params.timeout);
        let result = HealthCheckResult {
            timestamp: Utc::now(),
            passed: outcome.is_ok(),
            attempt_number: attempt,
            latency_ms: started.elapsed().as_millis() as u64,
            error: outcome.err(),
        };
        tracing::debug!(
            attempt,
            passed = result.passed,
            latency_ms = result.latency_ms,
            error = result.error.as_deref().unwrap_or(""),
            "health probe"
        );
        let passed = result.passed;
        results.push(result);
        if passed {
            break;
        }
        if attempt < params.max_attempts {
            std::thread::sleep(params.delay);
        }
    }

    let last = results.last();
    HealthReport {
        passed: last.is_some_and(|r| r.passed),
        attempts: results.len() as u32,
        latency_ms: last.map_or(0, |r| r.latency_ms),
        results,
    }
}
