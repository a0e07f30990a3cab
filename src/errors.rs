//! Typed error hierarchy for the mup core.
//!
//! One top-level enum per subsystem:
//! - `ExecutorError` — backend (local, SSH, simulator) failures
//! - `LockError` — cluster lock manager failures
//! - `StoreError` — plan and state store failures
//! - `OperationError` — per-operation handler failures
//! - `HookError` — lifecycle hook failures
//! - `ApplyError` — apply engine failures

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from an execution backend.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Command '{command}' exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("MongoDB command failed: {message}")]
    Mongo { message: String },

    #[error("Simulated failure for {operation} on {target}: {message}")]
    Simulated {
        operation: String,
        target: String,
        message: String,
    },

    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { seconds: u64, what: String },

    #[error("Operation not supported by this backend: {operation}")]
    Unsupported { operation: String },
}

impl ExecutorError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a transport error from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: cause.to_string(),
        }
    }
}

/// Errors from the cluster lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Cluster {cluster} is locked by {locked_by} until {expires_at}")]
    Locked {
        cluster: String,
        locked_by: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lock on cluster {cluster} is owned by {owner}")]
    NotOwner { cluster: String, owner: String },

    #[error("Lock on cluster {cluster} has expired")]
    Expired { cluster: String },

    #[error("Lock serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the plan and state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Plan {plan_id} not found for cluster {cluster}")]
    PlanNotFound { cluster: String, plan_id: String },

    #[error("State {state_id} not found for cluster {cluster}")]
    StateNotFound { cluster: String, state_id: String },

    #[error("Checkpoint {checkpoint_id} not found for state {state_id}")]
    CheckpointNotFound {
        state_id: String,
        checkpoint_id: String,
    },

    #[error("Plan {plan_id} already exists for cluster {cluster}")]
    PlanAlreadyExists { cluster: String, plan_id: String },

    #[error("Checksum mismatch for plan {plan_id} of cluster {cluster}")]
    ChecksumMismatch { cluster: String, plan_id: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single operation's four-phase lifecycle.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Required pre-condition {check} failed: {reason}")]
    PreConditionFailed { check: String, reason: String },

    #[error("Post-verification failed: {0}")]
    Verification(String),

    #[error("No handler registered for operation type {op_type}")]
    UnknownHandler { op_type: String },

    #[error("No executor registered for host {host}")]
    UnknownBackend { host: String },

    #[error("Operation timed out after {seconds}s waiting for {what}")]
    Timeout { seconds: u64, what: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl OperationError {
    /// True when retrying after plan edits is safe (the effect never ran).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::PreConditionFailed { .. }
        )
    }
}

/// Errors from lifecycle hook execution.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Failed to spawn hook '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Hook '{name}' timed out after {seconds}s")]
    Timeout { name: String, seconds: u64 },

    #[error("Hook '{name}' exited with code {exit_code}: {stderr}")]
    NonZero {
        name: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Errors from the apply engine.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("No handler registered for operation type {op_type}")]
    UnknownHandler { op_type: String },

    #[error("No executor registered for host {host}")]
    UnknownBackend { host: String },

    #[error("Phase {phase} not found in plan")]
    PhaseNotFound { phase: String },

    #[error("Cannot resume apply in status {status}")]
    CannotResume { status: String },

    #[error("Apply paused at a phase boundary")]
    Paused,

    #[error("Phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: OperationError,
    },

    #[error("Not implemented: {what}")]
    NotImplemented { what: String },

    #[error("Apply timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Apply cancelled")]
    Cancelled,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
