//! In-memory collaborators for orchestration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::backup::BackupManager;
use crate::config::{Config, LayerConfig};
use crate::error::Result;
use crate::health::HealthProbe;
use crate::maintenance::MaintenanceController;
use crate::orchestrator::{Environment, Orchestrator, UpdateOptions, UpdateSummary};
use crate::paths;
use crate::process::{CommandRunner, CommandSpec};
use crate::progress::{ProgressReporter, UpdateSession};
use crate::repo::Repository;
use crate::service::{ServiceAction, ServiceController, ServiceStatus};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct World {
    pub(crate) head: String,
    pub(crate) remote: String,
    pub(crate) dirty: bool,
    pub(crate) calls: Vec<String>,
    /// Probes fail while this revision is checked out.
    pub(crate) broken_revision: Option<String>,
    pub(crate) always_unhealthy: bool,
    /// Written by `stop`, simulating an operator cancel mid-run.
    pub(crate) cancel_on_stop: Option<PathBuf>,
}

pub(crate) type Shared = Arc<Mutex<World>>;

pub(crate) struct FakeRepo(pub(crate) Shared);

impl Repository for FakeRepo {
    fn has_local_changes(&self) -> Result<bool> {
        Ok(self.0.lock().unwrap().dirty)
    }
    fn fetch(&self, _branch: &str) -> Result<()> {
        self.0.lock().unwrap().calls.push("fetch".into());
        Ok(())
    }
    fn head(&self) -> Result<String> {
        Ok(self.0.lock().unwrap().head.clone())
    }
    fn remote_head(&self, _branch: &str) -> Result<String> {
        Ok(self.0.lock().unwrap().remote.clone())
    }
    fn checkout(&self, revision: &str) -> Result<()> {
        let mut w = self.0.lock().unwrap();
        w.calls.push(format!("checkout {revision}"));
        w.head = revision.to_string();
        Ok(())
    }
}

pub(crate) struct FakeService(pub(crate) Shared);

impl ServiceController for FakeService {
    fn start(&self) -> Result<()> {
        self.0.lock().unwrap().calls.push("start".into());
        Ok(())
    }
    fn stop(&self, _grace: Duration) -> Result<()> {
        let mut w = self.0.lock().unwrap();
        w.calls.push("stop".into());
        if let Some(path) = &w.cancel_on_stop {
            std::fs::write(path, "cancel").unwrap();
        }
        Ok(())
    }
    fn status(&self) -> Result<ServiceStatus> {
        Ok(ServiceStatus::Running)
    }
    fn script(&self, _action: ServiceAction) -> String {
        "true".into()
    }
}

pub(crate) struct FakeProbe(pub(crate) Shared);

impl HealthProbe for FakeProbe {
    fn probe(&self, _endpoint: &str, _timeout: Duration) -> std::result::Result<(), String> {
        let w = self.0.lock().unwrap();
        if w.always_unhealthy || w.broken_revision.as_deref() == Some(w.head.as_str()) {
            Err("HTTP 503".into())
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub(crate) struct Fixture {
    pub(crate) dir: TempDir,
    pub(crate) world: Shared,
    pub(crate) config: Config,
}

impl Fixture {
    pub(crate) fn new(head: &str, remote: &str) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hello')").unwrap();

        let mut config = Config::default();
        config.health.attempts = 2;
        config.health.baseline_attempts = 1;
        config.health.delay_secs = 0;
        config.health.timeout_secs = 1;
        config.prerequisites.tools.clear();
        config.prerequisites.min_disk_mb = 0;
        config.prerequisites.min_memory_mb = 0;
        config.prerequisites.network_probe = None;
        config.stop_grace_secs = 1;
        config.backup.retention = 5;
        config.layers.push(LayerConfig {
            name: "service".into(),
            dir: PathBuf::from("."),
            install: CommandSpec::new("sh", ["-c", "echo ok > built.txt"]),
            build: None,
            artifacts: vec![PathBuf::from("built.txt")],
        });

        let world = Arc::new(Mutex::new(World {
            head: head.into(),
            remote: remote.into(),
            ..World::default()
        }));
        Self { dir, world, config }
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn env(&self) -> Environment {
        Environment {
            root: self.root().to_path_buf(),
            config: self.config.clone(),
            service: Box::new(FakeService(self.world.clone())),
            repo: Box::new(FakeRepo(self.world.clone())),
            probe: Box::new(FakeProbe(self.world.clone())),
            runner: CommandRunner::new(self.root(), self.root()),
        }
    }

    pub(crate) fn run(&self, options: UpdateOptions) -> Result<UpdateSummary> {
        Orchestrator::new(self.env(), options).run()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.world.lock().unwrap().calls.clone()
    }

    pub(crate) fn session(&self) -> UpdateSession {
        ProgressReporter::read(self.root()).unwrap().unwrap()
    }

    pub(crate) fn backup_count(&self) -> usize {
        BackupManager::new(self.root(), &self.config)
            .list()
            .unwrap()
            .len()
    }

    pub(crate) fn maintenance_on(&self) -> bool {
        MaintenanceController::new(self.root()).is_enabled()
    }

    pub(crate) fn lock_held(&self) -> bool {
        paths::lock_path(self.root()).exists()
    }
}

