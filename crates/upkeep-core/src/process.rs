//! Typed subprocess invocation.
//!
//! Every external command the orchestrator runs (git, package managers,
//! service managers, migration scripts) is described by a [`CommandSpec`]
//! and validated before it is spawned. [`CommandRunner`] records the pid of
//! the running child in `.upkeep/child.pid` so an operator cancel can signal
//! it, and removes the record once the child exits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpkeepError};
use crate::{io, paths};

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; relative paths resolve against the runner's base dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Structural checks that need no filesystem access.
    pub fn check_shape(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(UpkeepError::InvalidCommand("empty program".into()));
        }
        let has_nul = self.program.contains('\0') || self.args.iter().any(|a| a.contains('\0'));
        if has_nul {
            return Err(UpkeepError::InvalidCommand(format!(
                "'{}' contains a NUL byte",
                self.program
            )));
        }
        Ok(())
    }

    /// Full validation: shape plus the program must be resolvable.
    pub fn validate(&self) -> Result<()> {
        self.check_shape()?;
        if self.program.contains('/') {
            if !Path::new(&self.program).exists() {
                return Err(UpkeepError::InvalidCommand(format!(
                    "program not found: {}",
                    self.program
                )));
            }
        } else if which::which(&self.program).is_err() {
            return Err(UpkeepError::InvalidCommand(format!(
                "'{}' is not on PATH",
                self.program
            )));
        }
        Ok(())
    }

    /// Shell-quoted rendering, used in logs and generated restore scripts.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Quote `s` for POSIX sh when it contains anything outside a safe set.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs [`CommandSpec`]s to completion.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    root: PathBuf,
    base_dir: PathBuf,
}

impl CommandRunner {
    /// `root` hosts the `.upkeep/` state dir; `base_dir` resolves relative cwds.
    pub fn new(root: &Path, base_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
        }
    }

    /// Run and return the output regardless of exit status.
    pub fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        spec.validate()?;
        let cwd = match &spec.cwd {
            Some(dir) => paths::resolve(&self.base_dir, dir),
            None => self.base_dir.clone(),
        };
        tracing::debug!(command = %spec.display(), cwd = %cwd.display(), "spawning");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| UpkeepError::SpawnFailed {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;

        let pid_file = paths::child_pid_path(&self.root);
        if let Err(e) = io::atomic_write(&pid_file, child.id().to_string().as_bytes()) {
            tracing::warn!(error = %e, "could not record child pid");
        }
        let waited = child.wait_with_output();
        let _ = io::remove_if_exists(&pid_file);
        let output = waited?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and fail with `CommandFailed` on a non-zero exit.
    pub fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.output(spec)?;
        if !output.success() {
            let status = match output.code {
                Some(code) => format!("exit code {code}"),
                None => "a signal".to_string(),
            };
            return Err(UpkeepError::CommandFailed {
                program: spec.program.clone(),
                status,
                stderr: output.stderr.chars().take(500).collect(),
            });
        }
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// PID helpers
// ---------------------------------------------------------------------------

/// Returns true if a process with `pid` exists (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

/// Signal `pid`. Returns false when the process no longer exists.
pub fn signal_pid(pid: u32, how: Termination) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| UpkeepError::InvalidCommand(format!("pid {pid} out of range")))?;
        let signal = match how {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(UpkeepError::Io(std::io::Error::from(e))),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, how);
        Err(UpkeepError::Io(std::io::Error::other(
            "signalling processes is only supported on unix",
        )))
    }
}

/// Poll until `pid` exits or `grace` elapses. Returns true if it exited.
fn wait_for_exit(pid: u32, grace: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + grace;
    loop {
        reap(pid);
        if !pid_alive(pid) {
            break;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    true
}

/// Signal every member of process group `pgid`. Returns false when no such
/// group exists.
pub fn signal_group(pgid: u32, how: Termination) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pgid)
            .map_err(|_| UpkeepError::InvalidCommand(format!("pgid {pgid} out of range")))?;
        let signal = match how {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(UpkeepError::Io(std::io::Error::from(e))),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, how);
        Ok(false)
    }
}

fn group_alive(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        match i32::try_from(pgid) {
            Ok(raw) if raw > 0 => matches!(killpg(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM)),
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}

fn wait_for_group_exit(pgid: u32, grace: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + grace;
    loop {
        reap(pgid);
        if !group_alive(pgid) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}

/// SIGTERM `leader` together with its process group, then SIGKILL whatever
/// is left once `grace` elapses. A pid that leads no group is signalled alone.
pub fn terminate_group(leader: u32, grace: std::time::Duration) -> Result<()> {
    let group = signal_group(leader, Termination::Graceful)?;
    if !group && !signal_pid(leader, Termination::Graceful)? {
        return Ok(());
    }
    let gone = |limit| {
        if group {
            wait_for_group_exit(leader, limit)
        } else {
            wait_for_exit(leader, limit)
        }
    };
    if !gone(grace) {
        tracing::warn!(pid = leader, group, "grace period elapsed, sending SIGKILL");
        if group {
            signal_group(leader, Termination::Forced)?;
        } else {
            signal_pid(leader, Termination::Forced)?;
        }
        gone(std::time::Duration::from_secs(5));
    }
    Ok(())
}

/// Collect `pid` if it is an exited child of this process, so it does not
/// linger as a zombie that still answers the liveness probe.
fn reap(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::wait::{waitpid, WaitPidFlag};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            let _ = waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
