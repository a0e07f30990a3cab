//! Binary and config-file handlers: download-binary, copy-binary,
//! generate-config, generate-supervisor-config.
//!
//! Binary acquisition and template rendering are external collaborators;
//! these handlers only move already-decided bytes through the executor
//! seam, so the same operations replay against the simulator.

use async_trait::async_trait;

use super::{HookResult, OperationContext, OperationHandler, OperationResult, Params};
use crate::errors::{ExecutorError, OperationError};
use crate::executor::{Executor, sh_quote};
use crate::plan::model::{Change, ChangeAction, OperationType, PlannedOperation};

async fn run_checked(
    exec: &dyn Executor,
    command: &str,
) -> Result<crate::executor::CommandOutput, OperationError> {
    let output = exec.run_command(command, None).await?;
    if !output.success() {
        return Err(OperationError::Executor(ExecutorError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.output.trim().to_string(),
        }));
    }
    Ok(output)
}

/// Fetches a binary over HTTP through the backend's command path.
pub struct DownloadBinaryHandler;

#[async_trait]
impl OperationHandler for DownloadBinaryHandler {
    fn op_type(&self) -> OperationType {
        OperationType::DownloadBinary
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let dest = Params::new(op).str("dest")?;
        Ok(exec.file_exists(dest).await?)
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        if params.str("url").is_err() || params.str("dest").is_err() {
            return Ok(HookResult::error("parameters 'url' and 'dest' are required"));
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
        let url = params.str("url")?;
        let dest = params.str("dest")?;
        let mode = params.mode_or("mode", 0o755)?;

        run_checked(
            exec,
            &format!(
                "curl -fsSL -o {dest} {url} && chmod {mode:o} {dest}",
                dest = sh_quote(dest),
                url = sh_quote(url),
            ),
        )
        .await?;
        Ok(OperationResult::success(format!("downloaded {url} to {dest}"))
            .with_change(Change::new("binary", dest, ChangeAction::Create)))
    }

    // Download rides the command path; execute already checked the exit
    // code, and the simulator has no file to observe.
}

/// Copies an extracted binary into place.
pub struct CopyBinaryHandler;

#[async_trait]
impl OperationHandler for CopyBinaryHandler {
    fn op_type(&self) -> OperationType {
        OperationType::CopyBinary
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let dest = Params::new(op).str("dest")?;
        Ok(exec.file_exists(dest).await?)
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        if params.str("source").is_err() || params.str("dest").is_err() {
            return Ok(HookResult::error(
                "parameters 'source' and 'dest' are required",
            ));
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
        let source = params.str("source")?;
        let dest = params.str("dest")?;

        let mut command = format!("cp -p {} {}", sh_quote(source), sh_quote(dest));
        if params.raw("mode").is_some() {
            let mode = params.mode_or("mode", 0o755)?;
            command.push_str(&format!(" && chmod {mode:o} {}", sh_quote(dest)));
        }
        run_checked(exec, &command).await?;
        Ok(OperationResult::success(format!("copied {source} to {dest}"))
            .with_change(Change::new("binary", dest, ChangeAction::Create)))
    }
}

/// Writes a pre-rendered daemon or supervisor config file.
///
/// Template rendering happens at plan time; the operation receives the
/// final content and uploads it.
pub struct GenerateConfigHandler {
    op_type: OperationType,
}

impl GenerateConfigHandler {
    pub fn config() -> Self {
        Self {
            op_type: OperationType::GenerateConfig,
        }
    }

    pub fn supervisor_config() -> Self {
        Self {
            op_type: OperationType::GenerateSupervisorConfig,
        }
    }
}

#[async_trait]
impl OperationHandler for GenerateConfigHandler {
    fn op_type(&self) -> OperationType {
        self.op_type
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        if params.str("path").is_err() || params.str("content").is_err() {
            return Ok(HookResult::error(
                "parameters 'path' and 'content' are required",
            ));
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
        let path = params.str("path")?;
        let content = params.str("content")?;
        let mode = params.mode_or("mode", 0o644)?;

        exec.upload_bytes(content.as_bytes(), path, mode).await?;
        Ok(OperationResult::success(format!("wrote config {path}"))
            .with_change(Change::new("config", path, ChangeAction::Create)))
    }

    async fn post_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let path = Params::new(op).str("path")?;
        if exec.file_exists(path).await? {
            Ok(HookResult::ok())
        } else {
            Ok(HookResult::error(format!("{path} missing after write")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatorExecutor;
    use crate::storage::StorageLayout;
    use serde_json::json;

    fn ctx() -> OperationContext {
        OperationContext::new("c1", "plan-1", StorageLayout::new("/tmp/mup-test"))
    }

    #[tokio::test]
    async fn download_runs_curl_through_command_path() {
        let sim = SimulatorExecutor::new();
        let op = PlannedOperation::new("op-1", OperationType::DownloadBinary, "dl")
            .with_param("url", json!("https://example.com/mongodb.tgz"))
            .with_param("dest", json!("/opt/mongodb.tgz"));

        let result = DownloadBinaryHandler.execute(&ctx(), &op, &sim).await.unwrap();
        assert!(result.success);

        let executed = sim.operations_of_type("execute").await;
        assert_eq!(executed.len(), 1);
        assert!(executed[0].target.contains("curl -fsSL"));
    }

    #[tokio::test]
    async fn generate_config_writes_rendered_content() {
        let sim = SimulatorExecutor::new();
        let handler = GenerateConfigHandler::config();
        let op = PlannedOperation::new("op-1", OperationType::GenerateConfig, "cfg")
            .with_param("path", json!("/etc/mongod.conf"))
            .with_param("content", json!("storage:\n  dbPath: /data/db\n"));
        let ctx = ctx();

        assert!(handler.pre_hook(&ctx, &op, &sim).await.unwrap().valid);
        handler.execute(&ctx, &op, &sim).await.unwrap();
        assert!(handler.post_hook(&ctx, &op, &sim).await.unwrap().valid);
        assert!(
            String::from_utf8(sim.file_content("/etc/mongod.conf").await.unwrap())
                .unwrap()
                .contains("dbPath")
        );
    }

    #[tokio::test]
    async fn generate_config_requires_content() {
        let sim = SimulatorExecutor::new();
        let op = PlannedOperation::new("op-1", OperationType::GenerateConfig, "cfg")
            .with_param("path", json!("/etc/mongod.conf"));
        let result = GenerateConfigHandler::config()
            .pre_hook(&ctx(), &op, &sim)
            .await
            .unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn supervisor_variant_reports_its_type() {
        assert_eq!(
            GenerateConfigHandler::supervisor_config().op_type(),
            OperationType::GenerateSupervisorConfig
        );
    }
}
