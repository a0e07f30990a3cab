//! Operation handler protocol: the four-phase per-step contract that makes
//! every operation safely idempotent and re-runnable.
//!
//! Each handler implements `IsComplete` / `PreHook` / `Execute` /
//! `PostHook` against the [`Executor`] seam, so the same handler runs
//! against local processes, remote shells, or the simulator.

pub mod binaries;
pub mod executor;
pub mod fs;
pub mod meta;
pub mod mongo;
pub mod process;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::OperationError;
use crate::executor::Executor;
use crate::plan::model::{Change, OperationType, PlannedOperation};
use crate::storage::StorageLayout;

pub use executor::{OperationExecutor, OperationOutcome};
pub use registry::HandlerRegistry;

/// Context shared by every handler invocation within one apply.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub cluster_name: String,
    pub plan_id: String,
    /// Storage tree, for handlers that persist cluster documents.
    pub storage: StorageLayout,
    /// Cooperative cancellation; honoured at executor calls and poll loops.
    pub cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(
        cluster_name: impl Into<String>,
        plan_id: impl Into<String>,
        storage: StorageLayout,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            plan_id: plan_id.into(),
            storage,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail fast when the apply has been cancelled.
    pub fn ensure_live(&self) -> Result<(), OperationError> {
        if self.cancel.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Result of a PreHook or PostHook phase.
///
/// Errors block execution; warnings do not. State-change entries describe
/// detected divergence between the plan and observed reality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub state_changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for HookResult {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            state_changes: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl HookResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![message.into()],
            ..Default::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.valid = false;
        self.errors.push(message.into());
        self
    }

    pub fn with_warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }

    pub fn with_state_change(mut self, change: Change) -> Self {
        self.state_changes.push(change);
        self
    }

    /// Collapse into the error the engine records, when invalid.
    pub fn into_validation_error(self) -> Option<OperationError> {
        if self.valid {
            None
        } else {
            Some(OperationError::Validation(self.errors.join("; ")))
        }
    }
}

/// Result of an Execute phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl OperationResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            changes: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_change(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The four-phase per-operation contract.
///
/// `execute` must be idempotent given an unchanged world; `is_complete` is
/// a cheap read-only probe that lets the engine skip already-done work on
/// resume. Intrinsically non-idempotent intents (wait-for-ready) return
/// `false` unconditionally.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn op_type(&self) -> OperationType;

    async fn is_complete(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let _ = (ctx, op, exec);
        Ok(false)
    }

    async fn pre_hook(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let _ = (ctx, op, exec);
        Ok(HookResult::ok())
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError>;

    async fn post_hook(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let _ = (ctx, op, exec);
        Ok(HookResult::ok())
    }
}

impl std::fmt::Debug for dyn OperationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OperationHandler").field(&self.op_type()).finish()
    }
}

/// Typed view over an operation's duck-typed parameter map.
///
/// Persisted params stay `BTreeMap<String, Value>` for forward
/// compatibility; handlers read them only through this view, which
/// normalizes on ingress: JSON numbers may arrive as floating point and
/// are narrowed when integral, file modes accept octal strings.
pub struct Params<'a> {
    map: &'a BTreeMap<String, serde_json::Value>,
}

fn as_u64(value: &serde_json::Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    match value.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 => Some(f as u64),
        _ => None,
    }
}

impl<'a> Params<'a> {
    pub fn new(op: &'a PlannedOperation) -> Self {
        Self { map: &op.params }
    }

    pub fn str(&self, key: &str) -> Result<&'a str, OperationError> {
        self.map
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OperationError::Validation(format!("missing or empty parameter '{key}'"))
            })
    }

    pub fn str_opt(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).and_then(|v| v.as_str())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.str_opt(key).unwrap_or(default).to_string()
    }

    pub fn u64(&self, key: &str) -> Result<u64, OperationError> {
        self.map.get(key).and_then(as_u64).ok_or_else(|| {
            OperationError::Validation(format!("parameter '{key}' must be a non-negative integer"))
        })
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, OperationError> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => as_u64(v).ok_or_else(|| {
                OperationError::Validation(format!(
                    "parameter '{key}' must be a non-negative integer"
                ))
            }),
        }
    }

    pub fn pid(&self, key: &str) -> Result<u32, OperationError> {
        let n = self.u64(key)?;
        u32::try_from(n)
            .map_err(|_| OperationError::Validation(format!("parameter '{key}' is not a valid pid")))
    }

    pub fn port(&self, key: &str) -> Result<u16, OperationError> {
        let n = self.u64(key)?;
        u16::try_from(n).map_err(|_| {
            OperationError::Validation(format!("parameter '{key}' is not a valid port"))
        })
    }

    /// A list of ports; accepts integers and integral floats.
    pub fn ports(&self, key: &str) -> Result<Vec<u16>, OperationError> {
        let values = self
            .map
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| OperationError::Validation(format!("parameter '{key}' must be a list")))?;
        values
            .iter()
            .map(|v| {
                as_u64(v)
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| {
                        OperationError::Validation(format!(
                            "parameter '{key}' contains an invalid port"
                        ))
                    })
            })
            .collect()
    }

    pub fn str_list(&self, key: &str) -> Result<Vec<String>, OperationError> {
        let values = self
            .map
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| OperationError::Validation(format!("parameter '{key}' must be a list")))?;
        values
            .iter()
            .map(|v| {
                v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    OperationError::Validation(format!(
                        "parameter '{key}' contains a non-string entry"
                    ))
                })
            })
            .collect()
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.map
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// A file mode: a JSON number (decimal) or an octal string like "0755".
    pub fn mode_or(&self, key: &str, default: u32) -> Result<u32, OperationError> {
        match self.map.get(key) {
            None => Ok(default),
            Some(v) => {
                if let Some(n) = as_u64(v) {
                    return u32::try_from(n).map_err(|_| {
                        OperationError::Validation(format!("parameter '{key}' is not a valid mode"))
                    });
                }
                let s = v.as_str().ok_or_else(|| {
                    OperationError::Validation(format!("parameter '{key}' is not a valid mode"))
                })?;
                u32::from_str_radix(s.trim_start_matches("0o").trim_start_matches('0'), 8)
                    .or_else(|_| u32::from_str_radix(s, 8))
                    .map_err(|_| {
                        OperationError::Validation(format!(
                            "parameter '{key}' is not a valid octal mode"
                        ))
                    })
            }
        }
    }

    pub fn duration_secs_or(&self, key: &str, default_secs: u64) -> Result<Duration, OperationError> {
        Ok(Duration::from_secs(self.u64_or(key, default_secs)?))
    }

    pub fn raw(&self, key: &str) -> Option<&'a serde_json::Value> {
        self.map.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op_with(params: &[(&str, serde_json::Value)]) -> PlannedOperation {
        let mut op = PlannedOperation::new("op-1", OperationType::CreateDirectory, "test");
        for (k, v) in params {
            op.params.insert(k.to_string(), v.clone());
        }
        op
    }

    #[test]
    fn str_rejects_missing_and_empty() {
        let op = op_with(&[("path", json!(""))]);
        let params = Params::new(&op);
        assert!(params.str("path").is_err());
        assert!(params.str("absent").is_err());

        let op = op_with(&[("path", json!("/data/db"))]);
        assert_eq!(Params::new(&op).str("path").unwrap(), "/data/db");
    }

    #[test]
    fn numbers_are_widened_from_float() {
        let op = op_with(&[("port", json!(27017.0)), ("timeout_secs", json!(60))]);
        let params = Params::new(&op);
        assert_eq!(params.port("port").unwrap(), 27017);
        assert_eq!(params.u64("timeout_secs").unwrap(), 60);
    }

    #[test]
    fn fractional_numbers_are_rejected() {
        let op = op_with(&[("port", json!(27017.5))]);
        assert!(Params::new(&op).port("port").is_err());
    }

    #[test]
    fn mode_accepts_octal_strings_and_numbers() {
        let op = op_with(&[("a", json!("0755")), ("b", json!("0o644")), ("c", json!(493))]);
        let params = Params::new(&op);
        assert_eq!(params.mode_or("a", 0).unwrap(), 0o755);
        assert_eq!(params.mode_or("b", 0).unwrap(), 0o644);
        assert_eq!(params.mode_or("c", 0).unwrap(), 493);
        assert_eq!(params.mode_or("absent", 0o600).unwrap(), 0o600);
    }

    #[test]
    fn ports_list_widens_floats() {
        let op = op_with(&[("ports", json!([27017, 27018.0]))]);
        assert_eq!(Params::new(&op).ports("ports").unwrap(), vec![27017, 27018]);
    }

    #[test]
    fn hook_result_accumulates_errors() {
        let result = HookResult::ok()
            .with_warning("port already in use")
            .with_error("path is empty");
        assert!(!result.valid);
        assert_eq!(result.warnings.len(), 1);
        let err = result.into_validation_error().unwrap();
        assert!(matches!(err, OperationError::Validation(_)));
    }

    #[test]
    fn context_reports_cancellation() {
        let ctx = OperationContext::new("c1", "p1", StorageLayout::new("/tmp/mup"));
        assert!(ctx.ensure_live().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(
            ctx.ensure_live().unwrap_err(),
            OperationError::Cancelled
        ));
    }
}
