//! Filesystem operation handlers: create-directory, create-symlink,
//! upload-file, remove-directory.

use async_trait::async_trait;

use super::{HookResult, OperationContext, OperationHandler, OperationResult, Params};
use crate::errors::OperationError;
use crate::executor::Executor;
use crate::plan::model::{Change, ChangeAction, OperationType, PlannedOperation};

/// Creates a directory with parent-implied semantics.
pub struct CreateDirectoryHandler;

#[async_trait]
impl OperationHandler for CreateDirectoryHandler {
    fn op_type(&self) -> OperationType {
        OperationType::CreateDirectory
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let path = Params::new(op).str("path")?;
        Ok(exec.file_exists(path).await?)
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let Ok(path) = params.str("path") else {
            return Ok(HookResult::error("missing or empty parameter 'path'"));
        };
        let mut result = HookResult::ok();
        if exec.file_exists(path).await? {
            // Divergence from the plan's expectation, not an error.
            result = result
                .with_warning(format!("directory {path} already exists"))
                .with_state_change(Change::new("directory", path, ChangeAction::None));
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
        let path = Params::new(op).str("path")?;
        exec.create_dir(path).await?;
        Ok(OperationResult::success(format!("created directory {path}"))
            .with_change(Change::new("directory", path, ChangeAction::Create)))
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
            Ok(HookResult::error(format!(
                "directory {path} missing after create"
            )))
        }
    }
}

/// Creates a symlink, replacing any previous link at the same path.
pub struct CreateSymlinkHandler;

#[async_trait]
impl OperationHandler for CreateSymlinkHandler {
    fn op_type(&self) -> OperationType {
        OperationType::CreateSymlink
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let params = Params::new(op);
        let target = params.str("target")?;
        let link = params.str("link")?;
        Ok(exec.read_symlink(link).await?.as_deref() == Some(target))
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let mut result = HookResult::ok();
        let (target, link) = match (params.str("target"), params.str("link")) {
            (Ok(t), Ok(l)) => (t, l),
            _ => return Ok(HookResult::error("parameters 'target' and 'link' are required")),
        };

        // Absolute targets must exist; relative ones are resolved against
        // the link's parent at runtime and cannot be checked here.
        if target.starts_with('/') && !exec.file_exists(target).await? {
            result = result.with_error(format!("symlink target {target} does not exist"));
        }
        if let Some(parent) = std::path::Path::new(link).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() && !exec.file_exists(&parent).await? {
                result = result.with_error(format!("parent directory {parent} does not exist"));
            }
        }
        // A non-symlink at the link path is a conflict we refuse to clobber.
        if exec.file_exists(link).await? && exec.read_symlink(link).await?.is_none() {
            result = result.with_error(format!("{link} exists and is not a symlink"));
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
        let target = params.str("target")?;
        let link = params.str("link")?;
        exec.create_symlink(target, link).await?;
        Ok(
            OperationResult::success(format!("linked {link} -> {target}")).with_change(
                Change::new("symlink", link, ChangeAction::Create),
            ),
        )
    }

    async fn post_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let target = params.str("target")?;
        let link = params.str("link")?;
        match exec.read_symlink(link).await? {
            Some(actual) if actual == target => Ok(HookResult::ok()),
            Some(actual) => Ok(HookResult::error(format!(
                "{link} points at {actual}, expected {target}"
            ))),
            None => Ok(HookResult::error(format!("{link} is not a symlink"))),
        }
    }
}

/// Uploads a local file or inline content to a destination path.
pub struct UploadFileHandler;

#[async_trait]
impl OperationHandler for UploadFileHandler {
    fn op_type(&self) -> OperationType {
        OperationType::UploadFile
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
        if params.str("dest").is_err() {
            return Ok(HookResult::error("missing or empty parameter 'dest'"));
        }
        match (params.str_opt("source"), params.str_opt("content")) {
            (None, None) => Ok(HookResult::error(
                "either 'source' or 'content' is required",
            )),
            (Some(source), _) if !std::path::Path::new(source).exists() => Ok(
                HookResult::error(format!("source file {source} does not exist")),
            ),
            _ => Ok(HookResult::ok()),
        }
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        ctx.ensure_live()?;
        let params = Params::new(op);
        let dest = params.str("dest")?;
        let mode = params.mode_or("mode", 0o644)?;

        if let Some(content) = params.str_opt("content") {
            exec.upload_bytes(content.as_bytes(), dest, mode).await?;
        } else {
            let source = params.str("source")?;
            exec.upload_file(std::path::Path::new(source), dest).await?;
        }
        Ok(OperationResult::success(format!("uploaded {dest}"))
            .with_change(Change::new("file", dest, ChangeAction::Create)))
    }

    async fn post_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let dest = Params::new(op).str("dest")?;
        if exec.file_exists(dest).await? {
            Ok(HookResult::ok())
        } else {
            Ok(HookResult::error(format!("{dest} missing after upload")))
        }
    }
}

/// Removes a directory; idempotent by design.
pub struct RemoveDirectoryHandler;

#[async_trait]
impl OperationHandler for RemoveDirectoryHandler {
    fn op_type(&self) -> OperationType {
        OperationType::RemoveDirectory
    }

    async fn is_complete(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<bool, OperationError> {
        let path = Params::new(op).str("path")?;
        Ok(!exec.file_exists(path).await?)
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let Ok(path) = params.str("path") else {
            return Ok(HookResult::error("missing or empty parameter 'path'"));
        };
        let mut result = HookResult::ok();
        if params.bool_or("recursive", false) {
            result = result.with_warning(format!("recursive removal of {path}"));
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
        let path = params.str("path")?;
        let recursive = params.bool_or("recursive", false);
        exec.remove_dir(path, recursive).await?;
        Ok(OperationResult::success(format!("removed directory {path}"))
            .with_change(Change::new("directory", path, ChangeAction::Delete)))
    }

    async fn post_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let path = Params::new(op).str("path")?;
        if exec.file_exists(path).await? {
            Ok(HookResult::error(format!("{path} still exists after removal")))
        } else {
            Ok(HookResult::ok())
        }
    }
}
