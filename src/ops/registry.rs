//! Closed registry mapping operation types to handlers.
//!
//! A type without a registered handler is a configuration error surfaced
//! at engine construction, never at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use super::OperationHandler;
use super::binaries::{CopyBinaryHandler, DownloadBinaryHandler, GenerateConfigHandler};
use super::fs::{
    CreateDirectoryHandler, CreateSymlinkHandler, RemoveDirectoryHandler, UploadFileHandler,
};
use super::meta::{BackupHandler, ImportHandler, RestoreHandler, SaveMetadataHandler};
use super::mongo::{
    AddShardHandler, DrainHandler, InitReplicaSetHandler, SetFcvHandler, ValidateHandler,
    VerifyHealthHandler,
};
use super::process::{
    StartProcessHandler, StartSupervisorHandler, StopProcessHandler, WaitForProcessHandler,
    WaitForReadyHandler,
};
use crate::errors::OperationError;
use crate::plan::model::OperationType;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry covering the full closed operation-type enumeration.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DownloadBinaryHandler));
        registry.register(Arc::new(CopyBinaryHandler));
        registry.register(Arc::new(CreateDirectoryHandler));
        registry.register(Arc::new(CreateSymlinkHandler));
        registry.register(Arc::new(UploadFileHandler));
        registry.register(Arc::new(RemoveDirectoryHandler));
        registry.register(Arc::new(GenerateConfigHandler::config()));
        registry.register(Arc::new(GenerateConfigHandler::supervisor_config()));
        registry.register(Arc::new(StartSupervisorHandler));
        registry.register(Arc::new(StartProcessHandler));
        registry.register(Arc::new(StopProcessHandler));
        registry.register(Arc::new(WaitForProcessHandler));
        registry.register(Arc::new(WaitForReadyHandler));
        registry.register(Arc::new(InitReplicaSetHandler));
        registry.register(Arc::new(AddShardHandler));
        registry.register(Arc::new(VerifyHealthHandler));
        registry.register(Arc::new(SaveMetadataHandler));
        registry.register(Arc::new(BackupHandler));
        registry.register(Arc::new(RestoreHandler));
        registry.register(Arc::new(SetFcvHandler));
        registry.register(Arc::new(DrainHandler));
        registry.register(Arc::new(ImportHandler));
        registry.register(Arc::new(ValidateHandler));
        registry
    }

    /// Register a handler under its own declared type.
    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.op_type(), handler);
    }

    pub fn get(&self, op_type: OperationType) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&op_type).cloned()
    }

    pub fn resolve(&self, op_type: OperationType) -> Result<Arc<dyn OperationHandler>, OperationError> {
        self.get(op_type).ok_or_else(|| OperationError::UnknownHandler {
            op_type: op_type.as_str().to_string(),
        })
    }

    /// Startup check: every member of the closed enumeration has a handler.
    pub fn missing_types(&self) -> Vec<OperationType> {
        OperationType::all()
            .iter()
            .filter(|t| !self.handlers.contains_key(*t))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_covers_every_operation_type() {
        let registry = HandlerRegistry::standard();
        assert!(registry.missing_types().is_empty());
        for op_type in OperationType::all() {
            let handler = registry.resolve(*op_type).unwrap();
            assert_eq!(handler.op_type(), *op_type);
        }
    }

    #[test]
    fn missing_handler_is_a_typed_error() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve(OperationType::AddShard).unwrap_err();
        assert!(matches!(err, OperationError::UnknownHandler { .. }));
        assert_eq!(registry.missing_types().len(), OperationType::all().len());
    }
}
