//! The operation executor: routes an operation to the right backend,
//! evaluates its declarative safety checks, and drives the four-phase
//! handler lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{HandlerRegistry, HookResult, OperationContext, OperationResult};
use crate::errors::OperationError;
use crate::executor::Executor;
use crate::plan::model::{CheckType, PlannedOperation, SafetyCheck};

/// Outcome of one full four-phase run.
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    /// `IsComplete` reported the work already done; nothing ran.
    Skipped { reason: String },
    /// The handler executed and post-verification passed.
    Executed(OperationResult),
}

/// Minimum free disk a `disk_space` check requires when its params carry
/// no explicit bound.
const DEFAULT_MIN_DISK_BYTES: u64 = 1024 * 1024 * 1024;

pub struct OperationExecutor {
    registry: HandlerRegistry,
    backends: HashMap<String, Arc<dyn Executor>>,
    /// Backend used when `op.target.host` is empty. Declared explicitly at
    /// construction; implicit fallbacks are ambiguous with several backends.
    default_backend: String,
}

impl OperationExecutor {
    /// Build with a single backend that is also the default route.
    pub fn new(registry: HandlerRegistry, default_backend: Arc<dyn Executor>) -> Self {
        let name = default_backend.name().to_string();
        let mut backends: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        backends.insert(name.clone(), default_backend);
        Self {
            registry,
            backends,
            default_backend: name,
        }
    }

    /// Register an additional backend, addressable via `op.target.host`.
    pub fn with_backend(mut self, backend: Arc<dyn Executor>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Resolve the backend an operation routes to.
    pub fn resolve_backend(
        &self,
        op: &PlannedOperation,
    ) -> Result<Arc<dyn Executor>, OperationError> {
        let host = match &op.target.host {
            Some(host) if !host.is_empty() => host.as_str(),
            _ => self.default_backend.as_str(),
        };
        self.backends
            .get(host)
            .cloned()
            .ok_or_else(|| OperationError::UnknownBackend {
                host: host.to_string(),
            })
    }

    /// Evaluate one safety check against the resolved backend.
    async fn evaluate_check(
        &self,
        check: &SafetyCheck,
        exec: &dyn Executor,
    ) -> Result<Option<String>, OperationError> {
        let failure = match check.check_type {
            CheckType::PortAvailable => {
                let port = check.target.parse::<u16>().map_err(|_| {
                    OperationError::Validation(format!(
                        "check {}: target '{}' is not a port",
                        check.id, check.target
                    ))
                })?;
                if exec.port_free(port).await? {
                    None
                } else {
                    Some(format!("port {port} is already in use"))
                }
            }
            CheckType::DiskSpace => {
                let min_bytes = check
                    .params
                    .get("min_bytes")
                    .and_then(|v| v.as_u64())
                    .or_else(|| {
                        check
                            .params
                            .get("min_gb")
                            .and_then(|v| v.as_f64())
                            .map(|gb| (gb * 1024.0 * 1024.0 * 1024.0) as u64)
                    })
                    .unwrap_or(DEFAULT_MIN_DISK_BYTES);
                let available = exec.available_disk(&check.target).await?;
                if available >= min_bytes {
                    None
                } else {
                    Some(format!(
                        "{} has {available} bytes free, need {min_bytes}",
                        check.target
                    ))
                }
            }
            CheckType::ProcessNotRunning => {
                let pid = check.target.parse::<u32>().map_err(|_| {
                    OperationError::Validation(format!(
                        "check {}: target '{}' is not a pid",
                        check.id, check.target
                    ))
                })?;
                if exec.process_running(pid).await? {
                    Some(format!("process {pid} is running"))
                } else {
                    None
                }
            }
            CheckType::FileExists | CheckType::DirectoryExists => {
                if exec.file_exists(&check.target).await? {
                    None
                } else {
                    Some(format!("{} does not exist", check.target))
                }
            }
        };
        Ok(failure)
    }

    /// Evaluate `op.pre_conditions`. A failing required check aborts; a
    /// failing optional check is logged and collected as a warning.
    pub async fn check_pre_conditions(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<Vec<String>, OperationError> {
        let mut warnings = Vec::new();
        for check in &op.pre_conditions {
            ctx.ensure_live()?;
            if let Some(reason) = self.evaluate_check(check, exec).await? {
                if check.required {
                    return Err(OperationError::PreConditionFailed {
                        check: check.id.clone(),
                        reason,
                    });
                }
                warn!(op_id = %op.id, check = %check.id, reason = %reason, "optional pre-condition failed");
                warnings.push(format!("{}: {reason}", check.id));
            }
        }
        Ok(warnings)
    }

    /// Pre-conditions plus the handler's PreHook, in that order.
    pub async fn validate(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
    ) -> Result<HookResult, OperationError> {
        let exec = self.resolve_backend(op)?;
        let handler = self.registry.resolve(op.op_type)?;
        let check_warnings = self
            .check_pre_conditions(ctx, op, exec.as_ref())
            .await?;
        let mut result = handler.pre_hook(ctx, op, exec.as_ref()).await?;
        result.warnings.extend(check_warnings);
        Ok(result)
    }

    /// The full per-operation flow: `IsComplete`, pre-conditions, PreHook,
    /// Execute, PostHook.
    pub async fn execute_operation(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
    ) -> Result<OperationOutcome, OperationError> {
        let exec = self.resolve_backend(op)?;
        let handler = self.registry.resolve(op.op_type)?;
        ctx.ensure_live()?;

        if handler.is_complete(ctx, op, exec.as_ref()).await? {
            debug!(op_id = %op.id, op_type = %op.op_type, "already complete, skipping");
            return Ok(OperationOutcome::Skipped {
                reason: "already complete".to_string(),
            });
        }

        self.check_pre_conditions(ctx, op, exec.as_ref()).await?;
        let pre = handler.pre_hook(ctx, op, exec.as_ref()).await?;
        for warning in &pre.warnings {
            warn!(op_id = %op.id, warning = %warning, "pre-hook warning");
        }
        if let Some(err) = pre.into_validation_error() {
            return Err(err);
        }

        ctx.ensure_live()?;
        let result = handler.execute(ctx, op, exec.as_ref()).await?;

        let post = handler.post_hook(ctx, op, exec.as_ref()).await?;
        for warning in &post.warnings {
            warn!(op_id = %op.id, warning = %warning, "post-hook warning");
        }
        if !post.valid {
            return Err(OperationError::Verification(post.errors.join("; ")));
        }
        Ok(OperationOutcome::Executed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatorExecutor;
    use crate::executor::simulator::Scenario;
    use crate::plan::model::{OperationType, Target};
    use crate::storage::StorageLayout;
    use serde_json::json;

    fn ctx() -> OperationContext {
        OperationContext::new("c1", "plan-1", StorageLayout::new("/tmp/mup-test"))
    }

    fn op_executor(sim: Arc<SimulatorExecutor>) -> OperationExecutor {
        OperationExecutor::new(HandlerRegistry::standard(), sim)
    }

    fn dir_op(path: &str) -> PlannedOperation {
        PlannedOperation::new("op-1", OperationType::CreateDirectory, "data dir")
            .with_param("path", json!(path))
    }

    #[tokio::test]
    async fn execute_runs_four_phases_and_skips_when_complete() {
        let sim = Arc::new(SimulatorExecutor::new());
        let executor = op_executor(sim.clone());
        let ctx = ctx();
        let op = dir_op("/data/db");

        let first = executor.execute_operation(&ctx, &op).await.unwrap();
        assert!(matches!(first, OperationOutcome::Executed(_)));

        let second = executor.execute_operation(&ctx, &op).await.unwrap();
        assert!(matches!(second, OperationOutcome::Skipped { .. }));

        // Only the first run created the directory.
        assert_eq!(sim.operations_of_type("create_directory").await.len(), 1);
    }

    #[tokio::test]
    async fn required_pre_condition_aborts() {
        let scenario = Scenario {
            busy_ports: vec![27017],
            ..Default::default()
        };
        let sim = Arc::new(SimulatorExecutor::with_scenario(scenario));
        let executor = op_executor(sim);
        let op = dir_op("/data/db").with_pre_condition(SafetyCheck::new(
            "chk-port",
            CheckType::PortAvailable,
            "27017",
        ));

        let err = executor.execute_operation(&ctx(), &op).await.unwrap_err();
        assert!(matches!(err, OperationError::PreConditionFailed { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn optional_pre_condition_only_warns() {
        let scenario = Scenario {
            busy_ports: vec![27017],
            ..Default::default()
        };
        let sim = Arc::new(SimulatorExecutor::with_scenario(scenario));
        let executor = op_executor(sim);
        let op = dir_op("/data/db").with_pre_condition(
            SafetyCheck::new("chk-port", CheckType::PortAvailable, "27017").optional(),
        );

        let outcome = executor.execute_operation(&ctx(), &op).await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Executed(_)));

        let warnings = executor
            .check_pre_conditions(
                &ctx(),
                &op,
                executor.resolve_backend(&op).unwrap().as_ref(),
            )
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn disk_space_check_uses_min_gb() {
        let scenario = Scenario {
            disk_available_bytes: Some(100 * 1024 * 1024),
            ..Default::default()
        };
        let sim = Arc::new(SimulatorExecutor::with_scenario(scenario));
        let executor = op_executor(sim);
        let mut check = SafetyCheck::new("chk-disk", CheckType::DiskSpace, "/data");
        check.params.insert("min_gb".to_string(), json!(10.0));
        let op = dir_op("/data/db").with_pre_condition(check);

        let err = executor.execute_operation(&ctx(), &op).await.unwrap_err();
        assert!(matches!(err, OperationError::PreConditionFailed { .. }));
    }

    #[tokio::test]
    async fn invalid_pre_hook_is_recoverable_validation() {
        let sim = Arc::new(SimulatorExecutor::new());
        let executor = op_executor(sim);
        // Missing 'path' param.
        let op = PlannedOperation::new("op-1", OperationType::CreateDirectory, "dir");

        let err = executor.execute_operation(&ctx(), &op).await.unwrap_err();
        assert!(matches!(err, OperationError::Validation(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn unknown_host_is_a_config_error() {
        let sim = Arc::new(SimulatorExecutor::new());
        let executor = op_executor(sim);
        let op = dir_op("/data/db")
            .with_target(Target::new("host", "db9").with_host("db9.example.com"));

        let err = executor.execute_operation(&ctx(), &op).await.unwrap_err();
        assert!(matches!(err, OperationError::UnknownBackend { .. }));
    }

    #[tokio::test]
    async fn empty_host_routes_to_default_backend() {
        let sim = Arc::new(SimulatorExecutor::new());
        let executor = op_executor(sim.clone());
        let op = dir_op("/data/db").with_target(Target::new("host", ""));

        executor.execute_operation(&ctx(), &op).await.unwrap();
        assert!(sim.dir_exists("/data/db").await);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let sim = Arc::new(SimulatorExecutor::new());
        let executor = op_executor(sim);
        let ctx = ctx();
        ctx.cancel.cancel();

        let err = executor
            .execute_operation(&ctx, &dir_op("/data/db"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Cancelled));
    }
}
