use std::path::Path;

use upkeep_core::health::{self, CheckParams, HttpProbe};
use upkeep_core::UpkeepError;

use crate::output::{print_json, print_table};

/// `--health-check`: probe with the post-update policy; non-zero exit when unhealthy.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let cfg = &config.health;
    let report = health::check(&HttpProbe, &cfg.endpoint, &CheckParams::post_update(cfg));

    if json {
        print_json(&report)?;
    } else {
        let rows = report
            .results
            .iter()
            .map(|r| {
                vec![
                    r.attempt_number.to_string(),
                    if r.passed { "ok" } else { "fail" }.to_string(),
                    format!("{} ms", r.latency_ms),
                    r.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        println!("{}", cfg.endpoint);
        print_table(&["ATTEMPT", "RESULT", "LATENCY", "ERROR"], rows);
    }

    if report.passed {
        return Ok(());
    }
    Err(UpkeepError::HealthCheckFailure {
        attempts: report.attempts,
        message: report.last_error().unwrap_or("unhealthy").to_string(),
    }
    .into())
}
