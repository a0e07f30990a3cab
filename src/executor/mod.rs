//! The executor abstraction: a uniform capability bundle over local
//! processes, remote SSH hosts, and the in-memory simulator.
//!
//! Operation handlers only ever talk to `dyn Executor`, so the same handler
//! runs unchanged against any backend. The contract is strictly pre/post:
//! inputs are validated, side effects are observable either in the real
//! world or in simulator state, and errors come back as typed
//! [`ExecutorError`] kinds without partial mutation where avoidable.

pub mod local;
pub mod remote;
pub mod simulator;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::errors::ExecutorError;

pub use local::LocalExecutor;
pub use remote::RemoteExecutor;
pub use simulator::SimulatorExecutor;

/// Quote a string for safe interpolation into `sh -c`.
pub(crate) fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Combined output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Host facts reported by a backend.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// A MongoDB endpoint an admin command is addressed to.
#[derive(Debug, Clone)]
pub struct MongoEndpoint {
    /// `host:port` of the daemon or router.
    pub address: String,
    /// Direct connection to a single member (bypasses topology discovery);
    /// used when talking to a member that is not yet part of a replica set.
    pub direct: bool,
}

impl MongoEndpoint {
    pub fn direct(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            direct: true,
        }
    }

    pub fn routed(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            direct: false,
        }
    }

    pub fn uri(&self) -> String {
        if self.direct {
            format!("mongodb://{}/?directConnection=true", self.address)
        } else {
            format!("mongodb://{}/", self.address)
        }
    }
}

/// Uniform capability set every backend exposes.
///
/// The MongoDB admin entry point is deliberately distinct from the shell
/// command path so the simulator can record protocol-level operations
/// faithfully; `safety_check` marks probes whose "not initialized" style
/// failures are expected by the caller.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Backend label used in routing and logs.
    fn name(&self) -> &str;

    // -- filesystem --

    /// Create a directory, parents implied (like `mkdir -p`).
    async fn create_dir(&self, path: &str) -> Result<(), ExecutorError>;

    /// Write bytes to a path on the backend with the given mode.
    async fn upload_bytes(
        &self,
        content: &[u8],
        dest: &str,
        mode: u32,
    ) -> Result<(), ExecutorError>;

    /// Copy a local file to a path on the backend.
    async fn upload_file(&self, local: &Path, dest: &str) -> Result<(), ExecutorError>;

    /// Fetch a path on the backend into a local file.
    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ExecutorError>;

    async fn file_exists(&self, path: &str) -> Result<bool, ExecutorError>;

    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError>;

    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), ExecutorError>;

    /// Create a symlink at `link` pointing at `target`, replacing any
    /// existing link.
    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), ExecutorError>;

    /// Resolve a symlink's target string, or `None` when `link` is not a
    /// symlink.
    async fn read_symlink(&self, link: &str) -> Result<Option<String>, ExecutorError>;

    // -- commands --

    /// Run a shell command to completion, optionally feeding stdin, and
    /// return its combined output.
    async fn run_command(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecutorError>;

    /// Spawn a background process and return an opaque pid.
    async fn spawn_process(&self, command: &str, args: &[String]) -> Result<u32, ExecutorError>;

    // -- MongoDB admin --

    /// Run an admin command against a MongoDB endpoint.
    async fn run_mongo_command(
        &self,
        endpoint: &MongoEndpoint,
        command: serde_json::Value,
        safety_check: bool,
    ) -> Result<serde_json::Value, ExecutorError>;

    // -- processes --

    async fn process_running(&self, pid: u32) -> Result<bool, ExecutorError>;

    /// Hard-kill a process.
    async fn kill_process(&self, pid: u32) -> Result<(), ExecutorError>;

    /// Soft signal, then wait up to `grace` for exit before hard-killing.
    async fn stop_process(&self, pid: u32, grace: Duration) -> Result<(), ExecutorError>;

    // -- system --

    async fn system_info(&self) -> Result<SystemInfo, ExecutorError>;

    /// Available disk bytes at a path.
    async fn available_disk(&self, path: &str) -> Result<u64, ExecutorError>;

    /// True when nothing is listening on the port.
    async fn port_free(&self, port: u16) -> Result<bool, ExecutorError>;

    async fn user_exists(&self, user: &str) -> Result<bool, ExecutorError>;

    // -- lifecycle --

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), ExecutorError>;

    /// Release all underlying connections.
    async fn close(&self) -> Result<(), ExecutorError>;
}
