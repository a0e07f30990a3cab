//! Durable apply state: per-phase and per-operation status, errors,
//! execution log, and checkpoint references.
//!
//! The state document is the authoritative record of an apply's progress.
//! Mutations go through the methods below; the engine serializes access by
//! holding the state behind a single async mutex, so the persisted document
//! never reflects a partially written operation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use tracing::debug;

use crate::errors::StoreError;
use crate::plan::model::{ClusterOperation, Plan};
use crate::storage::{self, StorageLayout};

/// Status of a whole apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl ApplyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Only paused and failed applies may be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one phase or one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Execution record of one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Execution record of one operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub retries: u32,
}

/// Reference to a frozen snapshot of the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub state_path: String,
}

/// One recorded error; the list is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyErrorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub message: String,
    /// True when the failure happened before any effect ran (validation or
    /// pre-condition), so retrying after plan edits is safe.
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

/// One execution log line; the list is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Persistent execution record of one apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyState {
    pub id: String,
    pub plan_id: String,
    pub cluster_name: String,
    pub operation: ClusterOperation,
    pub status: ApplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub phase_states: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub operation_states: BTreeMap<String, OperationState>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub errors: Vec<ApplyErrorRecord>,
    #[serde(default)]
    pub execution_log: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApplyState {
    /// Fresh pending state for a plan.
    pub fn for_plan(plan: &Plan) -> Self {
        let now = Utc::now();
        Self {
            id: storage::time_sortable_id("state"),
            plan_id: plan.id.clone(),
            cluster_name: plan.cluster_name.clone(),
            operation: plan.operation,
            status: ApplyStatus::Pending,
            current_phase: None,
            phase_states: BTreeMap::new(),
            operation_states: BTreeMap::new(),
            checkpoints: Vec::new(),
            errors: Vec::new(),
            execution_log: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append an execution log line.
    pub fn log(&mut self, level: &str, message: impl Into<String>) {
        self.execution_log.push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        });
        self.touch();
    }

    pub fn mark_running(&mut self) {
        self.status = ApplyStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = ApplyStatus::Completed;
        self.current_phase = None;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self) {
        self.status = ApplyStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_paused(&mut self) {
        self.status = ApplyStatus::Paused;
        self.touch();
    }

    pub fn start_phase(&mut self, name: &str) {
        self.current_phase = Some(name.to_string());
        let entry = self.phase_states.entry(name.to_string()).or_default();
        entry.status = StepStatus::Running;
        entry.started_at.get_or_insert_with(Utc::now);
        entry.error = None;
        self.log("info", format!("phase {name} started"));
    }

    pub fn complete_phase(&mut self, name: &str) {
        let entry = self.phase_states.entry(name.to_string()).or_default();
        entry.status = StepStatus::Completed;
        entry.completed_at = Some(Utc::now());
        self.log("info", format!("phase {name} completed"));
    }

    pub fn fail_phase(&mut self, name: &str, error: &str) {
        let entry = self.phase_states.entry(name.to_string()).or_default();
        entry.status = StepStatus::Failed;
        entry.completed_at = Some(Utc::now());
        entry.error = Some(error.to_string());
        self.errors.push(ApplyErrorRecord {
            phase: Some(name.to_string()),
            operation: None,
            message: error.to_string(),
            recoverable: false,
            timestamp: Utc::now(),
        });
        self.log("error", format!("phase {name} failed: {error}"));
    }

    pub fn start_operation(&mut self, op_id: &str) {
        let entry = self.operation_states.entry(op_id.to_string()).or_default();
        if entry.started_at.is_some() {
            entry.retries += 1;
        }
        entry.status = StepStatus::Running;
        entry.started_at = Some(Utc::now());
        entry.error = None;
        self.log("info", format!("operation {op_id} started"));
    }

    pub fn complete_operation(&mut self, op_id: &str, result: Option<serde_json::Value>) {
        let entry = self.operation_states.entry(op_id.to_string()).or_default();
        entry.status = StepStatus::Completed;
        entry.completed_at = Some(Utc::now());
        entry.result = result;
        self.log("info", format!("operation {op_id} completed"));
    }

    pub fn skip_operation(&mut self, op_id: &str, reason: &str) {
        let entry = self.operation_states.entry(op_id.to_string()).or_default();
        entry.status = StepStatus::Completed;
        entry.completed_at = Some(Utc::now());
        entry.result = Some(serde_json::json!({ "skipped": true, "reason": reason }));
        self.log("info", format!("operation {op_id} skipped: {reason}"));
    }

    pub fn fail_operation(&mut self, phase: &str, op_id: &str, error: &str, recoverable: bool) {
        let entry = self.operation_states.entry(op_id.to_string()).or_default();
        entry.status = StepStatus::Failed;
        entry.completed_at = Some(Utc::now());
        entry.error = Some(error.to_string());
        self.errors.push(ApplyErrorRecord {
            phase: Some(phase.to_string()),
            operation: Some(op_id.to_string()),
            message: error.to_string(),
            recoverable,
            timestamp: Utc::now(),
        });
        self.log("error", format!("operation {op_id} failed: {error}"));
    }

    /// A phase counts as completed only when every one of its operations is.
    pub fn phase_operations_completed(&self, op_ids: &[String]) -> bool {
        op_ids.iter().all(|id| {
            self.operation_states
                .get(id)
                .map(|s| s.status == StepStatus::Completed)
                .unwrap_or(false)
        })
    }
}

/// Persists state documents and checkpoint snapshots.
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: StorageLayout,
}

impl StateStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Marshal-then-rename the state document.
    pub fn save(&self, state: &ApplyState) -> Result<(), StoreError> {
        let path = self.layout.state_path(&state.cluster_name, &state.id);
        let bytes = serde_json::to_vec_pretty(state)?;
        storage::write_atomic(&path, &bytes)?;
        Ok(())
    }

    pub fn load(&self, cluster: &str, state_id: &str) -> Result<ApplyState, StoreError> {
        let path = self.layout.state_path(cluster, state_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::StateNotFound {
                    cluster: cluster.to_string(),
                    state_id: state_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Freeze the current state into the checkpoints directory and append
    /// the reference entry to `state.checkpoints`.
    pub fn checkpoint(
        &self,
        state: &mut ApplyState,
        description: &str,
        phase: &str,
        operation: Option<&str>,
    ) -> Result<Checkpoint, StoreError> {
        let id = storage::time_sortable_id("ckpt");
        let path = self
            .layout
            .checkpoint_path(&state.cluster_name, &state.id, &id);
        let checkpoint = Checkpoint {
            id: id.clone(),
            description: description.to_string(),
            timestamp: Utc::now(),
            phase: phase.to_string(),
            operation: operation.map(|s| s.to_string()),
            state_path: path.to_string_lossy().to_string(),
        };
        state.checkpoints.push(checkpoint.clone());

        let bytes = serde_json::to_vec_pretty(state)?;
        storage::write_atomic(&path, &bytes)?;
        debug!(checkpoint_id = %id, phase, "checkpoint written");
        Ok(checkpoint)
    }

    /// State ids recorded for a cluster, oldest first. Ids are
    /// time-sortable, so lexicographic order is creation order.
    pub fn list(&self, cluster: &str) -> Result<Vec<String>, StoreError> {
        let Ok(entries) = fs::read_dir(self.layout.state_dir(cluster)) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".json"))
            .map(|n| n.trim_end_matches(".json").to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Load a frozen checkpoint snapshot.
    pub fn load_checkpoint(
        &self,
        cluster: &str,
        state_id: &str,
        checkpoint_id: &str,
    ) -> Result<ApplyState, StoreError> {
        let path = self.layout.checkpoint_path(cluster, state_id, checkpoint_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::CheckpointNotFound {
                    state_id: state_id.to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
