//! Maintenance-mode flag shared with the managed service's request path.
//!
//! The flag exists only while maintenance is active. The managed service reads
//! it per request through [`MaintenanceFlag::gate`]; this module owns writing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::{io, paths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceFlag {
    #[serde(default = "default_version")]
    pub version: u32,
    pub enabled: bool,
    pub reason: String,
    pub start_time: DateTime<Utc>,
    /// Seconds.
    pub estimated_duration: u64,
}

fn default_version() -> u32 {
    1
}

/// What the managed service should do with one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Structured 503 for API callers.
    ApiUnavailable,
    /// HTML holding page for browsers.
    HoldingPage,
}

impl MaintenanceFlag {
    pub fn gate(&self, cfg: &MaintenanceConfig, path: &str, accepts_html: bool) -> GateDecision {
        if !self.enabled {
            return GateDecision::Allow;
        }
        let is_admin = cfg
            .admin_prefixes
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p.trim_end_matches('/'))));
        let is_static = cfg.static_prefixes.iter().any(|p| path.starts_with(p.as_str()));
        if is_admin || is_static {
            return GateDecision::Allow;
        }
        if path.starts_with(cfg.api_prefix.as_str()) || !accepts_html {
            GateDecision::ApiUnavailable
        } else {
            GateDecision::HoldingPage
        }
    }

    /// Seconds until the estimated end, never below 30.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - self.start_time).num_seconds().max(0) as u64;
        self.estimated_duration.saturating_sub(elapsed).max(30)
    }

    pub fn unavailable_body(&self, now: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "error": "service_unavailable",
            "message": "The service is undergoing maintenance. Please try again shortly.",
            "reason": self.reason,
            "maintenance": true,
            "retryAfter": self.retry_after(now),
        })
    }

    pub fn holding_page(&self) -> String {
        let minutes = self.estimated_duration.div_ceil(60).max(1);
        format!(
            "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
             <meta http-equiv=\"refresh\" content=\"30\">\n<title>Maintenance</title>\n</head>\n\
             <body>\n<h1>We'll be right back</h1>\n<p>{}</p>\n\
             <p>Expected duration: about {minutes} minute(s).</p>\n</body>\n</html>\n",
            html_escape(&self.reason)
        )
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Debug, Clone)]
pub struct MaintenanceController {
    path: PathBuf,
}

impl MaintenanceController {
    pub fn new(root: &Path) -> Self {
        Self {
            path: paths::maintenance_path(root),
        }
    }

    pub fn enable(&self, reason: &str, estimated_duration_secs: u64) -> Result<MaintenanceFlag> {
        let flag = MaintenanceFlag {
            version: 1,
            enabled: true,
            reason: reason.to_string(),
            start_time: Utc::now(),
            estimated_duration: estimated_duration_secs,
        };
        io::write_json(&self.path, &flag)?;
        tracing::info!(reason, "maintenance mode enabled");
        Ok(flag)
    }

    /// Remove the flag. Returns false if maintenance was not active.
    pub fn disable(&self) -> Result<bool> {
        let removed = io::remove_if_exists(&self.path)?;
        if removed {
            tracing::info!("maintenance mode disabled");
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<Option<MaintenanceFlag>> {
        io::read_json(&self.path)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.status(), Ok(Some(flag)) if flag.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn active() -> MaintenanceFlag {
        MaintenanceFlag {
            version: 1,
            enabled: true,
            reason: "Upgrading to v2".into(),
            start_time: Utc::now(),
            estimated_duration: 300,
        }
    }

    #[test]
    fn enable_disable_round_trip() {
        let dir = TempDir::new().unwrap();
        let ctl = MaintenanceController::new(dir.path());
        assert!(!ctl.is_enabled());
        ctl.enable("update", 120).unwrap();
        assert!(ctl.is_enabled());
        let flag = ctl.status().unwrap().unwrap();
        assert_eq!(flag.reason, "update");
        assert_eq!(flag.estimated_duration, 120);
        assert!(ctl.disable().unwrap());
        assert!(!ctl.disable().unwrap());
        assert!(ctl.status().unwrap().is_none());
    }

    #[test]
    fn flag_uses_wire_names() {
        let raw = serde_json::to_value(active()).unwrap();
        for key in ["enabled", "reason", "startTime", "estimatedDuration"] {
            assert!(raw.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn gate_lets_admin_and_static_through() {
        let cfg = MaintenanceConfig::default();
        let flag = active();
        assert_eq!(flag.gate(&cfg, "/admin", true), GateDecision::Allow);
        assert_eq!(flag.gate(&cfg, "/admin/updates", true), GateDecision::Allow);
        assert_eq!(flag.gate(&cfg, "/api/admin/backups", false), GateDecision::Allow);
        assert_eq!(flag.gate(&cfg, "/static/app.css", true), GateDecision::Allow);
        assert_eq!(flag.gate(&cfg, "/favicon.ico", true), GateDecision::Allow);
    }

    #[test]
    fn gate_deflects_api_and_browser_traffic() {
        let cfg = MaintenanceConfig::default();
        let flag = active();
        assert_eq!(
            flag.gate(&cfg, "/api/links", true),
            GateDecision::ApiUnavailable
        );
        assert_eq!(flag.gate(&cfg, "/abc123", true), GateDecision::HoldingPage);
        assert_eq!(
            flag.gate(&cfg, "/abc123", false),
            GateDecision::ApiUnavailable
        );
        // A prefix match must be on a path segment boundary.
        assert_eq!(flag.gate(&cfg, "/administrator", true), GateDecision::HoldingPage);
    }

    #[test]
    fn disabled_flag_allows_everything() {
        let cfg = MaintenanceConfig::default();
        let mut flag = active();
        flag.enabled = false;
        assert_eq!(flag.gate(&cfg, "/api/links", false), GateDecision::Allow);
    }

    #[test]
    fn retry_after_has_floor() {
        let mut flag = active();
        flag.start_time = Utc::now() - chrono::Duration::seconds(1000);
        assert_eq!(flag.retry_after(Utc::now()), 30);
        let body = flag.unavailable_body(Utc::now());
        assert_eq!(body["maintenance"], true);
    }

    #[test]
    fn holding_page_escapes_reason() {
        let mut flag = active();
        flag.reason = "<script>".into();
        let html = flag.holding_page();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("5 minute(s)"));
    }
}
