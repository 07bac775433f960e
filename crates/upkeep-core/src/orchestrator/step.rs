use serde::Serialize;

/// The update pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Step {
    AcquireLock,
    CheckPrerequisites,
    CheckRepositoryState,
    BaselineHealthCheck,
    EnableMaintenanceMode,
    CreateBackup,
    StopServices,
    FetchAndApplyChanges,
    InstallDependencies,
    ApplyDataMigrations,
    ValidateInstallation,
    StartServices,
    PostUpdateHealthCheck,
    DisableMaintenanceMode,
    PruneOldBackups,
    Finalize,
}

impl Step {
    pub const ALL: [Step; 16] = [
        Step::AcquireLock,
        Step::CheckPrerequisites,
        Step::CheckRepositoryState,
        Step::BaselineHealthCheck,
        Step::EnableMaintenanceMode,
        Step::CreateBackup,
        Step::StopServices,
        Step::FetchAndApplyChanges,
        Step::InstallDependencies,
        Step::ApplyDataMigrations,
        Step::ValidateInstallation,
        Step::StartServices,
        Step::PostUpdateHealthCheck,
        Step::DisableMaintenanceMode,
        Step::PruneOldBackups,
        Step::Finalize,
    ];

    pub const TOTAL: u32 = Self::ALL.len() as u32;

    /// The first step that changes the running system.
    pub const MUTATION_BOUNDARY: Step = Step::StopServices;

    pub fn name(self) -> &'static str {
        match self {
            Step::AcquireLock => "AcquireLock",
            Step::CheckPrerequisites => "CheckPrerequisites",
            Step::CheckRepositoryState => "CheckRepositoryState",
            Step::BaselineHealthCheck => "BaselineHealthCheck",
            Step::EnableMaintenanceMode => "EnableMaintenanceMode",
            Step::CreateBackup => "CreateBackup",
            Step::StopServices => "StopServices",
            Step::FetchAndApplyChanges => "FetchAndApplyChanges",
            Step::InstallDependencies => "InstallDependencies",
            Step::ApplyDataMigrations => "ApplyDataMigrations",
            Step::ValidateInstallation => "ValidateInstallation",
            Step::StartServices => "StartServices",
            Step::PostUpdateHealthCheck => "PostUpdateHealthCheck",
            Step::DisableMaintenanceMode => "DisableMaintenanceMode",
            Step::PruneOldBackups => "PruneOldBackups",
            Step::Finalize => "Finalize",
        }
    }

    /// 1-based position in the pipeline.
    pub fn index(self) -> u32 {
        self as u32 + 1
    }

    pub fn is_mutating(self) -> bool {
        self >= Self::MUTATION_BOUNDARY
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
