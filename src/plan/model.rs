//! The plan tree: typed, versioned artifacts that are the unit of intent.
//!
//! A [`Plan`] is a linear sequence of [`PlannedPhase`]s, each holding a
//! partially ordered set of [`PlannedOperation`]s. Plans are immutable once
//! saved; sharing between a plan and its apply state is by id, never by
//! reference. All maps are `BTreeMap` so serialized plans have a stable key
//! order and hash identically across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hooks::HookSpec;

/// Cluster lifecycle operation a plan was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterOperation {
    Deploy,
    Upgrade,
    Import,
    Start,
    Stop,
    Destroy,
}

impl ClusterOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Upgrade => "upgrade",
            Self::Import => "import",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for ClusterOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed enumeration of atomic operation types.
///
/// The handler registry is keyed by this enum; a type without a registered
/// handler is a startup configuration error, not a runtime one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    DownloadBinary,
    CopyBinary,
    CreateDirectory,
    CreateSymlink,
    UploadFile,
    RemoveDirectory,
    GenerateConfig,
    GenerateSupervisorConfig,
    StartSupervisor,
    StartProcess,
    StopProcess,
    WaitForProcess,
    WaitForReady,
    InitReplicaSet,
    AddShard,
    VerifyHealth,
    SaveMetadata,
    Backup,
    Restore,
    SetFcv,
    Drain,
    Import,
    Validate,
}

impl OperationType {
    /// Every member of the closed enumeration, in declaration order.
    pub fn all() -> &'static [OperationType] {
        use OperationType::*;
        &[
            DownloadBinary,
            CopyBinary,
            CreateDirectory,
            CreateSymlink,
            UploadFile,
            RemoveDirectory,
            GenerateConfig,
            GenerateSupervisorConfig,
            StartSupervisor,
            StartProcess,
            StopProcess,
            WaitForProcess,
            WaitForReady,
            InitReplicaSet,
            AddShard,
            VerifyHealth,
            SaveMetadata,
            Backup,
            Restore,
            SetFcv,
            Drain,
            Import,
            Validate,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadBinary => "download_binary",
            Self::CopyBinary => "copy_binary",
            Self::CreateDirectory => "create_directory",
            Self::CreateSymlink => "create_symlink",
            Self::UploadFile => "upload_file",
            Self::RemoveDirectory => "remove_directory",
            Self::GenerateConfig => "generate_config",
            Self::GenerateSupervisorConfig => "generate_supervisor_config",
            Self::StartSupervisor => "start_supervisor",
            Self::StartProcess => "start_process",
            Self::StopProcess => "stop_process",
            Self::WaitForProcess => "wait_for_process",
            Self::WaitForReady => "wait_for_ready",
            Self::InitReplicaSet => "init_replica_set",
            Self::AddShard => "add_shard",
            Self::VerifyHealth => "verify_health",
            Self::SaveMetadata => "save_metadata",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::SetFcv => "set_fcv",
            Self::Drain => "drain",
            Self::Import => "import",
            Self::Validate => "validate",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an operation targets: a host, a process, a file, a cluster member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Resource kind, e.g. "host", "process", "replica_set".
    #[serde(default)]
    pub kind: String,
    /// Resource name within its kind.
    #[serde(default)]
    pub name: String,
    /// Host that routes the operation to a backend executor. Empty means
    /// the engine's default backend is acceptable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Target {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Action an expected state delta performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    Start,
    Stop,
    None,
}

/// Expected state delta of one operation, used for display and diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub resource_type: String,
    pub resource_id: String,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

impl Change {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        action: ChangeAction,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            action,
            before: None,
            after: None,
        }
    }
}

/// Closed vocabulary of declarative pre-condition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    PortAvailable,
    DiskSpace,
    ProcessNotRunning,
    FileExists,
    DirectoryExists,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortAvailable => "port_available",
            Self::DiskSpace => "disk_space",
            Self::ProcessNotRunning => "process_not_running",
            Self::FileExists => "file_exists",
            Self::DirectoryExists => "directory_exists",
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declarative safety check evaluated before an operation's handler runs.
///
/// A failing required check aborts the operation; a failing optional check
/// is logged and execution proceeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    pub check_type: CheckType,
    /// Check subject: a path, a port number, a pid — interpreted per type.
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl SafetyCheck {
    pub fn new(id: impl Into<String>, check_type: CheckType, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            check_type,
            target: target.into(),
            params: BTreeMap::new(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One issue raised during plan validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub severity: Severity,
}

/// Outcome of plan validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub warnings: Vec<ValidationIssue>,
    /// Names of the checks that were evaluated.
    #[serde(default)]
    pub checks: Vec<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            checks: Vec::new(),
        }
    }
}

/// Resource footprint estimate for a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub hosts: usize,
    pub total_processes: usize,
    #[serde(default)]
    pub ports_used: Vec<u16>,
    pub disk_gb: f64,
    #[serde(default)]
    pub processes_per_host: BTreeMap<String, usize>,
}

/// The atomic unit of change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub description: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub pre_conditions: Vec<SafetyCheck>,
    #[serde(default)]
    pub changes: Vec<Change>,
    /// Present in the persisted format for future use; the apply engine
    /// does not consult it — parallel grouping is positional.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// When true, the operation may run concurrently with adjacent
    /// same-flag operations within its phase.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl PlannedOperation {
    pub fn new(
        id: impl Into<String>,
        op_type: OperationType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            op_type,
            description: description.into(),
            target: Target::default(),
            pre_conditions: Vec::new(),
            changes: Vec::new(),
            depends_on: Vec::new(),
            parallel: false,
            params: BTreeMap::new(),
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_pre_condition(mut self, check: SafetyCheck) -> Self {
        self.pre_conditions.push(check);
        self
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

/// Named, ordered grouping of operations; the unit of checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub order: u32,
    #[serde(default)]
    pub operations: Vec<PlannedOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_hook: Option<HookSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_hook: Option<HookSpec>,
    /// Estimated duration in seconds, when the planner produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
}

impl PlannedPhase {
    pub fn new(name: impl Into<String>, order: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            order,
            operations: Vec::new(),
            before_hook: None,
            after_hook: None,
            estimated_duration_secs: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_operation(mut self, op: PlannedOperation) -> Self {
        self.operations.push(op);
        self
    }
}

/// Immutable, content-hashed specification of an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Time-sortable unique id; assigned by the store on first save when
    /// empty.
    #[serde(default)]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub cluster_name: String,
    pub operation: ClusterOperation,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub validation: ValidationResult,
    #[serde(default)]
    pub phases: Vec<PlannedPhase>,
    #[serde(default)]
    pub resources: ResourceEstimate,
    /// Extra environment exported to every lifecycle hook of this plan.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Plan-level lifecycle hooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookSpec>,
}

impl Plan {
    pub fn new(cluster_name: impl Into<String>, operation: ClusterOperation) -> Self {
        Self {
            id: String::new(),
            created_at: Utc::now(),
            cluster_name: cluster_name.into(),
            operation,
            version: String::new(),
            variant: String::new(),
            topology: None,
            options: BTreeMap::new(),
            validation: ValidationResult::default(),
            phases: Vec::new(),
            resources: ResourceEstimate::default(),
            env: BTreeMap::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn with_phase(mut self, phase: PlannedPhase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_hook(mut self, hook: HookSpec) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Find a phase by name.
    pub fn phase(&self, name: &str) -> Option<&PlannedPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phases sorted by declared order.
    pub fn ordered_phases(&self) -> Vec<&PlannedPhase> {
        let mut phases: Vec<&PlannedPhase> = self.phases.iter().collect();
        phases.sort_by_key(|p| p.order);
        phases
    }

    /// Total operation count across all phases.
    pub fn operation_count(&self) -> usize {
        self.phases.iter().map(|p| p.operations.len()).sum()
    }
}
