//! Start/stop of the managed process behind one interface.
//!
//! Backends differ only in how they talk to the process manager; the
//! orchestrator never branches on which one is configured.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Serialize;

use crate::config::ServiceBackend;
use crate::error::{Result, UpkeepError};
use crate::process::{self, shell_quote, CommandRunner, CommandSpec};
use crate::{io, paths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unknown,
}

pub trait ServiceController: Send + Sync {
    fn start(&self) -> Result<()>;
    /// Graceful stop, escalating to forced termination after `grace`.
    fn stop(&self, grace: Duration) -> Result<()>;
    fn status(&self) -> Result<ServiceStatus>;
    /// POSIX sh lines performing `action`, for generated restore scripts.
    fn script(&self, action: ServiceAction) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

/// Build the controller for the configured backend.
pub fn controller(
    backend: &ServiceBackend,
    runner: CommandRunner,
    app_dir: &Path,
) -> Box<dyn ServiceController> {
    match backend {
        ServiceBackend::Systemd { unit } => Box::new(Systemd {
            unit: unit.clone(),
            runner,
        }),
        ServiceBackend::Pm2 { name } => Box::new(Pm2 {
            name: name.clone(),
            runner,
        }),
        ServiceBackend::Process {
            command,
            pid_file,
            log_file,
        } => Box::new(RawProcess {
            command: command.clone(),
            pid_file: paths::resolve(app_dir, pid_file),
            log_file: log_file.as_ref().map(|p| paths::resolve(app_dir, p)),
            app_dir: app_dir.to_path_buf(),
        }),
    }
}

// ---------------------------------------------------------------------------
// systemd
// ---------------------------------------------------------------------------

pub struct Systemd {
    unit: String,
    runner: CommandRunner,
}

impl Systemd {
    fn systemctl(&self, args: &[&str]) -> CommandSpec {
        let mut all: Vec<&str> = args.to_vec();
        all.push(&self.unit);
        CommandSpec::new("systemctl", all)
    }
}

impl ServiceController for Systemd {
    fn start(&self) -> Result<()> {
        self.runner.run(&self.systemctl(&["start"]))?;
        Ok(())
    }

    fn stop(&self, grace: Duration) -> Result<()> {
        self.runner.run(&self.systemctl(&["stop"]))?;
        let deadline = std::time::Instant::now() + grace;
        while self.status()? == ServiceStatus::Running {
            if std::time::Instant::now() >= deadline {
                tracing::warn!(unit = %self.unit, "grace period elapsed, sending SIGKILL");
                self.runner
                    .run(&self.systemctl(&["kill", "--signal=SIGKILL"]))?;
                break;
            }
            std::thread::sleep(Duration::from_millis(500));
        }
        Ok(())
    }

    fn status(&self) -> Result<ServiceStatus> {
        let out = self.runner.output(&self.systemctl(&["is-active"]))?;
        Ok(match out.stdout.trim() {
            "active" | "activating" | "deactivating" | "reloading" => ServiceStatus::Running,
            "inactive" | "failed" => ServiceStatus::Stopped,
            _ => ServiceStatus::Unknown,
        })
    }

    fn script(&self, action: ServiceAction) -> String {
        let unit = shell_quote(&self.unit);
        match action {
            ServiceAction::Start => format!("systemctl start {unit}"),
            ServiceAction::Stop => format!("systemctl stop {unit} || true"),
        }
    }
}

// ---------------------------------------------------------------------------
// pm2
// ---------------------------------------------------------------------------

pub struct Pm2 {
    name: String,
    runner: CommandRunner,
}

impl ServiceController for Pm2 {
    fn start(&self) -> Result<()> {
        self.runner
            .run(&CommandSpec::new("pm2", ["start", self.name.as_str()]))?;
        Ok(())
    }

    fn stop(&self, grace: Duration) -> Result<()> {
        let ms = grace.as_millis().to_string();
        let graceful = CommandSpec::new(
            "pm2",
            ["stop", self.name.as_str(), "--kill-timeout", ms.as_str()],
        );
        if let Err(e) = self.runner.run(&graceful) {
            tracing::warn!(error = %e, "pm2 stop failed, deleting process");
            self.runner
                .run(&CommandSpec::new("pm2", ["delete", self.name.as_str()]))?;
        }
        Ok(())
    }

    fn status(&self) -> Result<ServiceStatus> {
        let out = self
            .runner
            .output(&CommandSpec::new("pm2", ["pid", self.name.as_str()]))?;
        Ok(match out.stdout.trim().parse::<u32>() {
            Ok(0) => ServiceStatus::Stopped,
            Ok(_) => ServiceStatus::Running,
            Err(_) if out.stdout.trim().is_empty() => ServiceStatus::Stopped,
            Err(_) => ServiceStatus::Unknown,
        })
    }

    fn script(&self, action: ServiceAction) -> String {
        let name = shell_quote(&self.name);
        match action {
            ServiceAction::Start => format!("pm2 start {name}"),
            ServiceAction::Stop => format!("pm2 stop {name} || true"),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw process
// ---------------------------------------------------------------------------

pub struct RawProcess {
    command: CommandSpec,
    pid_file: PathBuf,
    log_file: Option<PathBuf>,
    app_dir: PathBuf,
}

impl RawProcess {
    fn pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

impl ServiceController for RawProcess {
    fn start(&self) -> Result<()> {
        if let Some(pid) = self.pid().filter(|p| process::pid_alive(*p)) {
            tracing::info!(pid, "service already running");
            return Ok(());
        }
        self.command.validate()?;
        let cwd = match &self.command.cwd {
            Some(dir) => paths::resolve(&self.app_dir, dir),
            None => self.app_dir.clone(),
        };
        let (stdout, stderr) = match &self.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    io::ensure_dir(parent)?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                (Stdio::from(file.try_clone()?), Stdio::from(file))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(&self.command.env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|e| UpkeepError::SpawnFailed {
            program: self.command.program.clone(),
            reason: e.to_string(),
        })?;
        io::atomic_write(&self.pid_file, child.id().to_string().as_bytes())?;
        tracing::info!(pid = child.id(), "service started");
        Ok(())
    }

    fn stop(&self, grace: Duration) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        // `start` made the service a group leader; its children go with it.
        process::terminate_group(pid, grace)?;
        io::remove_if_exists(&self.pid_file)?;
        Ok(())
    }

    fn status(&self) -> Result<ServiceStatus> {
        Ok(match self.pid() {
            Some(pid) if process::pid_alive(pid) => ServiceStatus::Running,
            _ => ServiceStatus::Stopped,
        })
    }

    fn script(&self, action: ServiceAction) -> String {
        let pid_file = shell_quote(&self.pid_file.display().to_string());
        match action {
            ServiceAction::Stop => format!(
                "if [ -f {pid_file} ]; then kill \"$(cat {pid_file})\" 2>/dev/null || true; sleep 2; rm -f {pid_file}; fi"
            ),
            ServiceAction::Start => {
                let log = self
                    .log_file
                    .as_ref()
                    .map(|p| shell_quote(&p.display().to_string()))
                    .unwrap_or_else(|| "/dev/null".to_string());
                format!(
                    "nohup {} >> {log} 2>&1 &\necho $! > {pid_file}",
                    self.command.display()
                )
            }
        }
    }
}
