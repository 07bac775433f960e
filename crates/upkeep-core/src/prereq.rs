//! Host readiness checks run before an update touches anything.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PrerequisiteConfig;

#[derive(Debug, Clone, Serialize)]
pub struct PrereqFailure {
    pub check: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub disk_free_bytes: Option<u64>,
    pub mem_available_bytes: Option<u64>,
    pub load_average: Option<f64>,
}

impl SystemSnapshot {
    pub fn capture(dir: &Path) -> Self {
        Self {
            disk_free_bytes: disk_free_bytes(dir),
            mem_available_bytes: mem_available_bytes(),
            load_average: load_average(),
        }
    }
}

/// Run every check and collect all failures; an empty list means ready.
pub fn check(cfg: &PrerequisiteConfig, app_dir: &Path) -> Vec<PrereqFailure> {
    let mut failures = Vec::new();

    for tool in &cfg.tools {
        if which::which(tool).is_err() {
            failures.push(PrereqFailure {
                check: "tools".into(),
                message: format!("required tool '{tool}' not found on PATH"),
            });
        }
    }

    let snapshot = SystemSnapshot::capture(app_dir);
    const MB: u64 = 1024 * 1024;
    if let Some(free) = snapshot.disk_free_bytes {
        if free < cfg.min_disk_mb.saturating_mul(MB) {
            failures.push(PrereqFailure {
                check: "disk".into(),
                message: format!(
                    "{} MB free, {} MB required",
                    free / MB,
                    cfg.min_disk_mb
                ),
            });
        }
    }
    if let Some(avail) = snapshot.mem_available_bytes {
        if avail < cfg.min_memory_mb.saturating_mul(MB) {
            failures.push(PrereqFailure {
                check: "memory".into(),
                message: format!(
                    "{} MB available, {} MB required",
                    avail / MB,
                    cfg.min_memory_mb
                ),
            });
        }
    }

    if let Some(target) = &cfg.network_probe {
        if let Err(e) = dial(target, Duration::from_secs(5)) {
            failures.push(PrereqFailure {
                check: "network".into(),
                message: format!("{target} unreachable: {e}"),
            });
        }
    }

    failures
}

fn dial(target: &str, timeout: Duration) -> std::io::Result<()> {
    let addr = target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other("no address resolved"))?;
    TcpStream::connect_timeout(&addr, timeout).map(|_| ())
}

fn disk_free_bytes(dir: &Path) -> Option<u64> {
    #[cfg(unix)]
    {
        let stat = nix::sys::statvfs::statvfs(dir).ok()?;
        Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        None
    }
}

fn mem_available_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_available(&meminfo)
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn load_average() -> Option<f64> {
    std::fs::read_to_string("/proc/loadavg")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn permissive() -> PrerequisiteConfig {
        PrerequisiteConfig {
            tools: vec!["sh".into()],
            min_disk_mb: 0,
            min_memory_mb: 0,
            network_probe: None,
        }
    }

    #[test]
    fn permissive_config_passes() {
        let dir = TempDir::new().unwrap();
        assert!(check(&permissive(), dir.path()).is_empty());
    }

    #[test]
    fn missing_tool_reported() {
        let dir = TempDir::new().unwrap();
        let mut cfg = permissive();
        cfg.tools.push("__no_such_tool__".into());
        let failures = check(&cfg, dir.path());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].check, "tools");
    }

    #[test]
    fn impossible_disk_threshold_reported() {
        let dir = TempDir::new().unwrap();
        let mut cfg = permissive();
        cfg.min_disk_mb = u64::MAX / (2 * 1024 * 1024);
        let failures = check(&cfg, dir.path());
        assert!(failures.iter().any(|f| f.check == "disk"));
    }

    #[test]
    fn oversized_thresholds_saturate() {
        let dir = TempDir::new().unwrap();
        let mut cfg = permissive();
        cfg.min_disk_mb = u64::MAX;
        cfg.min_memory_mb = u64::MAX;
        let failures = check(&cfg, dir.path());
        assert!(failures.iter().any(|f| f.check == "disk"));
        if std::path::Path::new("/proc/meminfo").exists() {
            assert!(failures.iter().any(|f| f.check == "memory"));
        }
    }

    #[test]
    fn unreachable_network_reported() {
        let dir = TempDir::new().unwrap();
        let mut cfg = permissive();
        // Port 1 on loopback is closed on any sane host.
        cfg.network_probe = Some("127.0.0.1:1".into());
        let failures = check(&cfg, dir.path());
        assert!(failures.iter().any(|f| f.check == "network"));
    }

    #[test]
    fn parses_meminfo() {
        let sample = "MemTotal:       16314276 kB\nMemFree:  1 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_mem_available(sample), Some(8_000_000 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }
}
