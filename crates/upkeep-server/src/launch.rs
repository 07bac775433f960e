use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use upkeep_core::{io, paths};

/// Start `launcher --root <root> <args..>` detached from the request: its own
/// process group, stdin and stdout closed, stderr appended to `update.log`.
/// Returns the child pid; the child is reaped in the background.
pub fn spawn_detached(launcher: &Path, root: &Path, args: &[String]) -> anyhow::Result<u32> {
    io::ensure_dir(&paths::upkeep_dir(root))?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths::log_path(root))?;

    let mut child = Command::new(launcher)
        .arg("--root")
        .arg(root)
        .args(args)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .process_group(0)
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn '{}': {e}", launcher.display()))?;

    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("detached process exited before reporting a pid"))?;
    tracing::info!(pid, args = ?args, "launched detached session");

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!(pid, %status, "detached session exited"),
            Err(e) => tracing::warn!(pid, error = %e, "failed to reap detached session"),
        }
    });
    Ok(pid)
}
