use crate::error::{Result, UpkeepError};
use crate::paths;
use crate::process::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServiceBackend
// ---------------------------------------------------------------------------

/// How the managed service is started and stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceBackend {
    /// An init-system unit driven through `systemctl`.
    Systemd { unit: String },
    /// A pm2-managed process.
    Pm2 { name: String },
    /// A raw process we spawn ourselves and track through a pid file.
    Process {
        command: CommandSpec,
        #[serde(default = "default_pid_file")]
        pid_file: PathBuf,
        #[serde(default)]
        log_file: Option<PathBuf>,
    },
}

fn default_pid_file() -> PathBuf {
    PathBuf::from(".upkeep/service.pid")
}

impl Default for ServiceBackend {
    fn default() -> Self {
        ServiceBackend::Systemd {
            unit: "app".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub endpoint: String,
    /// Attempts for the post-update (hard) check.
    pub attempts: u32,
    /// Attempts for the baseline (soft) check.
    pub baseline_attempts: u32,
    pub delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5000/health".to_string(),
            attempts: 10,
            baseline_attempts: 3,
            delay_secs: 3,
            timeout_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// RepositoryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub remote: String,
    pub branch: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackupConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub retention: usize,
    /// Entry names skipped at any depth. `*.ext` entries match by suffix.
    pub exclude: Vec<String>,
    pub include_logs: bool,
    pub logs_dir: PathBuf,
}

fn default_excludes() -> Vec<String> {
    [
        ".git",
        "__pycache__",
        ".cache",
        "node_modules",
        "dist",
        "build",
        "target",
        "*.pyc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(paths::BACKUPS_DIR),
            retention: 10,
            exclude: default_excludes(),
            include_logs: false,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

// ---------------------------------------------------------------------------
// Layers, migrations, prerequisites
// ---------------------------------------------------------------------------

/// A managed dependency layer (e.g. the Python service, the JS frontend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default = "default_layer_dir")]
    pub dir: PathBuf,
    pub install: CommandSpec,
    /// Compiles the layer into a deployable artifact.
    #[serde(default)]
    pub build: Option<CommandSpec>,
    /// Paths (relative to the app dir) that must exist after install/build.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

fn default_layer_dir() -> PathBuf {
    PathBuf::from(".")
}

impl LayerConfig {
    /// Install then build, with working dirs anchored at the layer dir.
    pub fn commands(&self) -> Vec<CommandSpec> {
        std::iter::once(&self.install)
            .chain(self.build.as_ref())
            .map(|cmd| {
                let cwd = match &cmd.cwd {
                    Some(dir) => self.dir.join(dir),
                    None => self.dir.clone(),
                };
                cmd.clone().in_dir(cwd)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Migration entry point; the step is a no-op when it does not exist.
    pub script: PathBuf,
    pub command: CommandSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrerequisiteConfig {
    pub tools: Vec<String>,
    pub min_disk_mb: u64,
    pub min_memory_mb: u64,
    /// `host:port` dialed to confirm network reachability.
    pub network_probe: Option<String>,
}

impl Default for PrerequisiteConfig {
    fn default() -> Self {
        Self {
            tools: vec!["git".to_string()],
            min_disk_mb: 500,
            min_memory_mb: 128,
            network_probe: Some("github.com:443".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// MaintenanceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub estimated_duration_secs: u64,
    pub admin_prefixes: Vec<String>,
    pub static_prefixes: Vec<String>,
    pub api_prefix: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            estimated_duration_secs: 300,
            admin_prefixes: vec!["/admin".to_string(), "/api/admin".to_string()],
            static_prefixes: vec![
                "/static/".to_string(),
                "/assets/".to_string(),
                "/favicon.ico".to_string(),
            ],
            api_prefix: "/api/".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    /// Application file tree, relative to the project root.
    pub app_dir: PathBuf,
    pub service: ServiceBackend,
    pub health: HealthConfig,
    pub repository: RepositoryConfig,
    pub backup: BackupConfig,
    /// SQLite datastore file, relative to the app dir.
    pub datastore: Option<PathBuf>,
    pub layers: Vec<LayerConfig>,
    pub migrations: Option<MigrationConfig>,
    /// Loads the service entry point without serving, to catch import errors.
    pub entry_check: Option<CommandSpec>,
    pub prerequisites: PrerequisiteConfig,
    pub stop_grace_secs: u64,
    pub system_update: Option<CommandSpec>,
    pub maintenance: MaintenanceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            app_dir: PathBuf::from("."),
            service: ServiceBackend::default(),
            health: HealthConfig::default(),
            repository: RepositoryConfig::default(),
            backup: BackupConfig::default(),
            datastore: None,
            layers: Vec::new(),
            migrations: None,
            entry_check: None,
            prerequisites: PrerequisiteConfig::default(),
            stop_grace_secs: 30,
            system_update: None,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    /// Load `.upkeep/config.yaml`; a missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        if cfg.backup.retention == 0 {
            return Err(UpkeepError::Config(
                "backup.retention must be at least 1".into(),
            ));
        }
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn app_dir(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.app_dir)
    }

    pub fn backup_dir(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.backup.dir)
    }

    pub fn datastore_path(&self, root: &Path) -> Option<PathBuf> {
        self.datastore
            .as_ref()
            .map(|p| paths::resolve(&self.app_dir(root), p))
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !self.health.endpoint.starts_with("http://")
            && !self.health.endpoint.starts_with("https://")
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "health.endpoint '{}' is not an http(s) URL",
                    self.health.endpoint
                ),
            });
        }

        if self.health.attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "health.attempts must be at least 1".to_string(),
            });
        }

        if self.backup.retention == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "backup.retention must be at least 1".to_string(),
            });
        } else if self.backup.retention > 100 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "backup.retention={} (>100 is unusual)",
                    self.backup.retention
                ),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.name.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("duplicate layer name '{}'", layer.name),
                });
            }
            if let Err(e) = layer.install.check_shape() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("layer '{}' install: {e}", layer.name),
                });
            }
        }

        if let ServiceBackend::Systemd { unit } | ServiceBackend::Pm2 { name: unit } =
            &self.service
        {
            if unit.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "service name is empty".to_string(),
                });
            }
        }

        if self.stop_grace_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "stop_grace_secs=0: services are killed without a graceful stop"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
