//! Cluster document and data handlers: save-metadata, backup, restore,
//! import.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HookResult, OperationContext, OperationHandler, OperationResult, Params};
use crate::errors::{ExecutorError, OperationError};
use crate::executor::{Executor, sh_quote};
use crate::plan::model::{Change, ChangeAction, OperationType, PlannedOperation};

/// The `meta.yaml` document describing a deployed cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub name: String,
    pub version: String,
    pub variant: String,
    pub bin_path: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<serde_json::Value>,
    pub deploy_mode: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    pub connection_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_bin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_endpoint: Option<String>,
}

/// Shell binary for a server version: `mongosh` from 5.0 on, the legacy
/// `mongo` before that.
pub fn shell_for_version(version: &str) -> &'static str {
    let major = version
        .split('.')
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    if major >= 5 { "mongosh" } else { "mongo" }
}

/// Writes the cluster metadata document through the executor file API.
pub struct SaveMetadataHandler;

#[async_trait]
impl OperationHandler for SaveMetadataHandler {
    fn op_type(&self) -> OperationType {
        OperationType::SaveMetadata
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        if Params::new(op).str("version").is_err() {
            return Ok(HookResult::error("missing or empty parameter 'version'"));
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
        let version = params.str("version")?;
        let nodes = params.str_list("nodes").unwrap_or_default();
        let first_node = nodes
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost:27017".to_string());

        let metadata = ClusterMetadata {
            name: ctx.cluster_name.clone(),
            version: version.to_string(),
            variant: params.string_or("variant", "community"),
            bin_path: params.string_or("bin_path", ""),
            created_at: Utc::now(),
            status: "running".to_string(),
            topology: params.raw("topology").cloned(),
            deploy_mode: params.string_or("deploy_mode", "standalone"),
            nodes,
            connection_command: format!(
                "{} mongodb://{first_node}",
                shell_for_version(version)
            ),
            supervisor_bin: params.str_opt("supervisor_bin").map(|s| s.to_string()),
            supervisor_endpoint: params.str_opt("supervisor_endpoint").map(|s| s.to_string()),
        };

        let yaml = serde_yaml::to_string(&metadata)
            .map_err(|e| OperationError::Validation(format!("metadata serialization: {e}")))?;
        let dest = ctx
            .storage
            .meta_path(&ctx.cluster_name)
            .to_string_lossy()
            .to_string();
        exec.upload_bytes(yaml.as_bytes(), &dest, 0o644).await?;
        Ok(OperationResult::success(format!("metadata saved to {dest}"))
            .with_change(Change::new("metadata", &dest, ChangeAction::Update)))
    }

    async fn post_hook(
        &self,
        ctx: &OperationContext,
        _op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let dest = ctx
            .storage
            .meta_path(&ctx.cluster_name)
            .to_string_lossy()
            .to_string();
        if exec.file_exists(&dest).await? {
            Ok(HookResult::ok())
        } else {
            Ok(HookResult::error(format!("{dest} missing after save")))
        }
    }
}

async fn run_checked(
    exec: &dyn Executor,
    command: &str,
) -> Result<(), OperationError> {
    let output = exec.run_command(command, None).await?;
    if !output.success() {
        return Err(OperationError::Executor(ExecutorError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.output.trim().to_string(),
        }));
    }
    Ok(())
}

/// Archives a data directory with tar.
pub struct BackupHandler;

#[async_trait]
impl OperationHandler for BackupHandler {
    fn op_type(&self) -> OperationType {
        OperationType::Backup
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let archive = Params::new(op).str("archive")?;
        Ok(exec.file_exists(archive).await?)
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let (Ok(source), Ok(_archive)) = (params.str("source_dir"), params.str("archive")) else {
            return Ok(HookResult::error(
                "parameters 'source_dir' and 'archive' are required",
            ));
        };
        if !exec.file_exists(source).await? {
            return Ok(HookResult::error(format!(
                "source directory {source} does not exist"
            )));
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
        let source = params.str("source_dir")?;
        let archive = params.str("archive")?;
        run_checked(
            exec,
            &format!(
                "tar -czf {} -C {} .",
                sh_quote(archive),
                sh_quote(source)
            ),
        )
        .await?;
        Ok(OperationResult::success(format!("backed up {source} to {archive}"))
            .with_change(Change::new("backup", archive, ChangeAction::Create)))
    }
}

/// Restores a tar archive into a data directory.
pub struct RestoreHandler;

#[async_trait]
impl OperationHandler for RestoreHandler {
    fn op_type(&self) -> OperationType {
        OperationType::Restore
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let (Ok(archive), Ok(_dest)) = (params.str("archive"), params.str("dest_dir")) else {
            return Ok(HookResult::error(
                "parameters 'archive' and 'dest_dir' are required",
            ));
        };
        if !exec.file_exists(archive).await? {
            return Ok(HookResult::error(format!("archive {archive} does not exist")));
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
        let archive = params.str("archive")?;
        let dest = params.str("dest_dir")?;
        exec.create_dir(dest).await?;
        run_checked(
            exec,
            &format!("tar -xzf {} -C {}", sh_quote(archive), sh_quote(dest)),
        )
        .await?;
        Ok(OperationResult::success(format!("restored {archive} into {dest}"))
            .with_change(Change::new("directory", dest, ChangeAction::Update)))
    }
}

/// Runs a planner-assembled data import command (mongorestore, mongoimport).
pub struct ImportHandler;

#[async_trait]
impl OperationHandler for ImportHandler {
    fn op_type(&self) -> OperationType {
        OperationType::Import
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
        run_checked(exec, command).await?;
        Ok(OperationResult::success("import finished"))
    }
}
