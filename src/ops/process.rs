//! Process lifecycle handlers: start-supervisor, start-process,
//! stop-process, wait-for-process, wait-for-ready.
//!
//! Daemon supervision is an external collaborator; start operations invoke
//! the supervisor client binary through the command path, which makes them
//! idempotent at the supervisor (a running program is a no-op there).

use async_trait::async_trait;
use std::time::Duration;

use super::{HookResult, OperationContext, OperationHandler, OperationResult, Params};
use crate::errors::{ExecutorError, OperationError};
use crate::executor::Executor;
use crate::plan::model::{Change, ChangeAction, OperationType, PlannedOperation};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Starts the per-cluster supervisor daemon.
pub struct StartSupervisorHandler;

#[async_trait]
impl OperationHandler for StartSupervisorHandler {
    fn op_type(&self) -> OperationType {
        OperationType::StartSupervisor
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        if Params::new(op).str("command").is_err() {
            return Ok(HookResult::error("missing or empty parameter 'command'"));
        }
        Ok(HookResult::ok())
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        ctx.ensure_live()?;
        let command = Params::new(op).str("command")?;
        let output = exec.run_command(command, None).await?;
        if !output.success() {
            return Err(OperationError::Executor(ExecutorError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.output.trim().to_string(),
            }));
        }
        Ok(OperationResult::success("supervisor started")
            .with_change(Change::new("supervisor", &ctx.cluster_name, ChangeAction::Start)))
    }
}

/// Asks the supervisor to start a managed program.
pub struct StartProcessHandler;

#[async_trait]
impl OperationHandler for StartProcessHandler {
    fn op_type(&self) -> OperationType {
        OperationType::StartProcess
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let mut result = HookResult::ok();
        for key in ["supervisor_bin", "endpoint", "program"] {
            if params.str(key).is_err() {
                result = result.with_error(format!("missing or empty parameter '{key}'"));
            }
        }
        Ok(result)
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        ctx.ensure_live()?;
        let params = Params::new(op);
        let bin = params.str("supervisor_bin")?;
        let endpoint = params.str("endpoint")?;
        let program = params.str("program")?;

        let command = format!("{bin} --endpoint {endpoint} start {program}");
        let output = exec.run_command(&command, None).await?;
        if !output.success() {
            return Err(OperationError::Executor(ExecutorError::CommandFailed {
                command,
                exit_code: output.exit_code,
                stderr: output.output.trim().to_string(),
            }));
        }
        Ok(OperationResult::success(format!("started {program}"))
            .with_change(Change::new("process", program, ChangeAction::Start)))
    }
}

/// Gracefully stops a process by pid.
pub struct StopProcessHandler;

#[async_trait]
impl OperationHandler for StopProcessHandler {
    fn op_type(&self) -> OperationType {
        OperationType::StopProcess
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let pid = Params::new(op).pid("pid")?;
        Ok(!exec.process_running(pid).await?)
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        if Params::new(op).pid("pid").is_err() {
            return Ok(HookResult::error("parameter 'pid' must be a valid pid"));
        }
        Ok(HookResult::ok())
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        ctx.ensure_live()?;
        let params = Params::new(op);
        let pid = params.pid("pid")?;
        let grace = params.duration_secs_or("grace_secs", 10)?;
        exec.stop_process(pid, grace).await?;
        Ok(OperationResult::success(format!("stopped pid {pid}"))
            .with_change(Change::new("process", pid.to_string(), ChangeAction::Stop)))
    }

    async fn post_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let pid = Params::new(op).pid("pid")?;
        if exec.process_running(pid).await? {
            Ok(HookResult::ok().with_warning(format!("pid {pid} still running after stop")))
        } else {
            Ok(HookResult::ok())
        }
    }
}

/// Polls until a process is alive. Never reports complete up front: the
/// wait itself is the point.
pub struct WaitForProcessHandler;

#[async_trait]
impl OperationHandler for WaitForProcessHandler {
    fn op_type(&self) -> OperationType {
        OperationType::WaitForProcess
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        let params = Params::new(op);
        let pid = params.pid("pid")?;
        let timeout = params.duration_secs_or("timeout_secs", 60)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            ctx.ensure_live()?;
            if exec.process_running(pid).await? {
                return Ok(OperationResult::success(format!("pid {pid} is running")));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OperationError::Timeout {
                    seconds: timeout.as_secs(),
                    what: format!("process {pid}"),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Polls until a port on the target host is accepting connections.
pub struct WaitForReadyHandler;

#[async_trait]
impl OperationHandler for WaitForReadyHandler {
    fn op_type(&self) -> OperationType {
        OperationType::WaitForReady
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        if Params::new(op).port("port").is_err() {
            return Ok(HookResult::error("parameter 'port' must be a valid port"));
        }
        Ok(HookResult::ok())
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        let params = Params::new(op);
        let port = params.port("port")?;
        let timeout = params.duration_secs_or("timeout_secs", 120)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            ctx.ensure_live()?;
            if !exec.port_free(port).await? {
                return Ok(OperationResult::success(format!("port {port} is listening")));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OperationError::Timeout {
                    seconds: timeout.as_secs(),
                    what: format!("port {port} to listen"),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
