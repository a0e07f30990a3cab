//! Deterministic in-memory backend used for planning previews, dry runs,
//! and tests.
//!
//! Every executor call is recorded as a tagged entry in an append-only
//! operation log. Identical inputs and scenarios produce identical logs
//! (timestamps aside), which is a tested property. Failures can be injected
//! per `(operation, target)` pair, command output can be canned through a
//! response table, and whole worlds can be declared up front as YAML
//! scenarios.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{CommandOutput, Executor, MongoEndpoint, SystemInfo};
use crate::errors::ExecutorError;

/// First pid handed out by the allocator.
const FIRST_PID: u32 = 1000;

/// Default simulated free disk: 500 GiB.
const DEFAULT_DISK_AVAILABLE: u64 = 500 * 1024 * 1024 * 1024;

/// One recorded executor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimOperation {
    pub id: u64,
    #[serde(rename = "type")]
    pub op_type: String,
    pub target: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SimOperation {
    /// Identity of the record with the timestamp masked, for determinism
    /// comparisons.
    pub fn fingerprint(&self) -> (u64, String, String, String, String, Option<String>) {
        (
            self.id,
            self.op_type.clone(),
            self.target.clone(),
            serde_json::to_string(&self.details).unwrap_or_default(),
            self.result.clone(),
            self.error.clone(),
        )
    }
}

/// Injectable failure: a call whose `(operation, target)` matches returns
/// the configured error. A `*` target matches every target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRule {
    pub operation: String,
    pub target: String,
    pub error: String,
}

impl FailureRule {
    fn matches(&self, operation: &str, target: &str) -> bool {
        self.operation == operation && (self.target == "*" || self.target == target)
    }
}

/// A file seeded by a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// A process pre-running when the scenario starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioProcess {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A replica set that already exists in the simulated world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReplicaSet {
    pub name: String,
    pub members: Vec<String>,
}

/// Declarative simulator world, loadable from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
    #[serde(default)]
    pub failures: Vec<FailureRule>,
    #[serde(default)]
    pub files: Vec<ScenarioFile>,
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub processes: Vec<ScenarioProcess>,
    #[serde(default)]
    pub busy_ports: Vec<u16>,
    #[serde(default)]
    pub replica_sets: Vec<ScenarioReplicaSet>,
    #[serde(default)]
    pub disk_available_bytes: Option<u64>,
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Built-in scenario templates.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "port-conflict" => Some(Self {
                name: name.to_string(),
                description: "the default mongod port is already taken".to_string(),
                busy_ports: vec![27017],
                ..Default::default()
            }),
            "permission-denied" => Some(Self {
                name: name.to_string(),
                description: "filesystem writes are rejected".to_string(),
                failures: vec![
                    FailureRule {
                        operation: "create_directory".to_string(),
                        target: "*".to_string(),
                        error: "permission denied".to_string(),
                    },
                    FailureRule {
                        operation: "upload_content".to_string(),
                        target: "*".to_string(),
                        error: "permission denied".to_string(),
                    },
                ],
                ..Default::default()
            }),
            "disk-full" => Some(Self {
                name: name.to_string(),
                description: "almost no free disk".to_string(),
                disk_available_bytes: Some(100 * 1024 * 1024),
                ..Default::default()
            }),
            "network-failure" => Some(Self {
                name: name.to_string(),
                description: "no endpoint is reachable".to_string(),
                failures: vec![FailureRule {
                    operation: "connect".to_string(),
                    target: "*".to_string(),
                    error: "connection refused".to_string(),
                }],
                ..Default::default()
            }),
            "existing-cluster" => Some(Self {
                name: name.to_string(),
                description: "a single-node replica set is already deployed".to_string(),
                dirs: vec!["/data/db".to_string()],
                processes: vec![ScenarioProcess {
                    command: "mongod".to_string(),
                    args: vec!["--port".to_string(), "27017".to_string()],
                }],
                busy_ports: vec![27017],
                replica_sets: vec![ScenarioReplicaSet {
                    name: "rs0".to_string(),
                    members: vec!["localhost:27017".to_string()],
                }],
                ..Default::default()
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SimFile {
    content: Vec<u8>,
    mode: u32,
    created_at: DateTime<Utc>,
}

/// Observable view of a simulated file.
#[derive(Debug, Clone)]
pub struct SimFileInfo {
    pub size: usize,
    pub mode: u32,
    pub created_at: DateTime<Utc>,
}

/// Observable view of a simulated process.
#[derive(Debug, Clone)]
pub struct SimProcessInfo {
    pub command: String,
    pub args: Vec<String>,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SimProcessState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
struct SimProcess {
    command: String,
    args: Vec<String>,
    state: SimProcessState,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SimState {
    files: BTreeMap<String, SimFile>,
    dirs: BTreeSet<String>,
    symlinks: BTreeMap<String, String>,
    processes: BTreeMap<u32, SimProcess>,
    next_pid: u32,
    operations: Vec<SimOperation>,
    next_op_id: u64,
    failures: Vec<FailureRule>,
    responses: BTreeMap<String, String>,
    busy_ports: BTreeSet<u16>,
    disk_available: u64,
    /// Member address -> replica set name, for every initiated member.
    initiated_members: BTreeMap<String, String>,
    /// Shard name -> connection string.
    shards: BTreeMap<String, String>,
    connected_endpoints: BTreeSet<String>,
}

impl SimState {
    /// Record one call. When a failure rule matches, the log entry carries
    /// the error and the matching `ExecutorError` is returned.
    fn record(
        &mut self,
        op_type: &str,
        target: &str,
        details: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), ExecutorError> {
        self.next_op_id += 1;
        let failure = self
            .failures
            .iter()
            .find(|f| f.matches(op_type, target))
            .cloned();
        self.operations.push(SimOperation {
            id: self.next_op_id,
            op_type: op_type.to_string(),
            target: target.to_string(),
            details,
            result: if failure.is_some() { "error" } else { "success" }.to_string(),
            error: failure.as_ref().map(|f| f.error.clone()),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        });
        match failure {
            Some(rule) => Err(ExecutorError::Simulated {
                operation: op_type.to_string(),
                target: target.to_string(),
                message: rule.error,
            }),
            None => Ok(()),
        }
    }
}

/// Default canned output for common probe commands.
fn default_responses() -> BTreeMap<String, String> {
    let mut responses = BTreeMap::new();
    responses.insert("hostname".to_string(), "sim-host".to_string());
    responses.insert("whoami".to_string(), "mup".to_string());
    responses.insert("uname".to_string(), "Linux".to_string());
    responses.insert(
        "uname -s -m -r".to_string(),
        "Linux x86_64 6.1.0".to_string(),
    );
    responses.insert("id -u".to_string(), "1000".to_string());
    responses
}

/// The in-memory executor.
pub struct SimulatorExecutor {
    name: String,
    state: Mutex<SimState>,
}

impl Default for SimulatorExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatorExecutor {
    pub fn new() -> Self {
        Self::with_scenario(Scenario::default())
    }

    /// Construct with a scenario applied: responses, failures, seeded
    /// files/dirs, pre-running processes, busy ports, existing replica sets.
    pub fn with_scenario(scenario: Scenario) -> Self {
        let mut state = SimState {
            next_pid: FIRST_PID,
            responses: default_responses(),
            disk_available: scenario.disk_available_bytes.unwrap_or(DEFAULT_DISK_AVAILABLE),
            ..Default::default()
        };
        state.responses.extend(scenario.responses);
        state.failures = scenario.failures;
        state.busy_ports = scenario.busy_ports.into_iter().collect();
        for dir in scenario.dirs {
            state.dirs.insert(dir);
        }
        for file in scenario.files {
            state.files.insert(
                file.path,
                SimFile {
                    content: file.content.into_bytes(),
                    mode: file.mode.unwrap_or(0o644),
                    created_at: Utc::now(),
                },
            );
        }
        for process in scenario.processes {
            let pid = state.next_pid;
            state.next_pid += 1;
            state.processes.insert(
                pid,
                SimProcess {
                    command: process.command,
                    args: process.args,
                    state: SimProcessState::Running,
                    started_at: Utc::now(),
                    stopped_at: None,
                },
            );
        }
        for set in scenario.replica_sets {
            for member in set.members {
                state.initiated_members.insert(member, set.name.clone());
            }
        }
        Self {
            name: "simulator".to_string(),
            state: Mutex::new(state),
        }
    }

    /// Construct from a built-in scenario template.
    pub fn with_builtin_scenario(name: &str) -> Option<Self> {
        Scenario::builtin(name).map(Self::with_scenario)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Snapshot of the append-only operation log.
    pub async fn operation_log(&self) -> Vec<SimOperation> {
        self.state.lock().await.operations.clone()
    }

    /// Log entries of one operation type.
    pub async fn operations_of_type(&self, op_type: &str) -> Vec<SimOperation> {
        self.state
            .lock()
            .await
            .operations
            .iter()
            .filter(|op| op.op_type == op_type)
            .cloned()
            .collect()
    }

    pub async fn add_failure(&self, rule: FailureRule) {
        self.state.lock().await.failures.push(rule);
    }

    /// Drop every failure rule matching the pair.
    pub async fn remove_failure(&self, operation: &str, target: &str) {
        self.state
            .lock()
            .await
            .failures
            .retain(|f| !(f.operation == operation && f.target == target));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    pub async fn set_response(&self, command: impl Into<String>, stdout: impl Into<String>) {
        self.state
            .lock()
            .await
            .responses
            .insert(command.into(), stdout.into());
    }

    pub async fn dir_exists(&self, path: &str) -> bool {
        self.state.lock().await.dirs.contains(path)
    }

    pub async fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .files
            .get(path)
            .map(|f| f.content.clone())
    }

    /// Size, mode, and creation time of a simulated file.
    pub async fn file_info(&self, path: &str) -> Option<SimFileInfo> {
        self.state.lock().await.files.get(path).map(|f| SimFileInfo {
            size: f.content.len(),
            mode: f.mode,
            created_at: f.created_at,
        })
    }

    /// Command line and liveness of a simulated process.
    pub async fn process_info(&self, pid: u32) -> Option<SimProcessInfo> {
        self.state.lock().await.processes.get(&pid).map(|p| SimProcessInfo {
            command: p.command.clone(),
            args: p.args.clone(),
            running: p.state == SimProcessState::Running,
            started_at: p.started_at,
            stopped_at: p.stopped_at,
        })
    }

    pub async fn running_process_count(&self) -> usize {
        self.state
            .lock()
            .await
            .processes
            .values()
            .filter(|p| p.state == SimProcessState::Running)
            .count()
    }

    /// Record the implicit connect the first time an endpoint is used.
    fn connect_if_new(
        state: &mut SimState,
        endpoint: &MongoEndpoint,
    ) -> Result<(), ExecutorError> {
        if state.connected_endpoints.contains(&endpoint.address) {
            return Ok(());
        }
        let mut details = BTreeMap::new();
        details.insert("direct".to_string(), json!(endpoint.direct));
        state.record("connect", &endpoint.address, details)?;
        state.connected_endpoints.insert(endpoint.address.clone());
        Ok(())
    }

    fn primary_status(set_name: &str, address: &str) -> serde_json::Value {
        json!({
            "ok": 1,
            "set": set_name,
            "myState": 1,
            "members": [
                { "name": address, "state": 1, "stateStr": "PRIMARY" }
            ]
        })
    }
}

#[async_trait]
impl Executor for SimulatorExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("create_directory", path, BTreeMap::new())?;
        // Parents implied.
        let mut current = std::path::PathBuf::new();
        for component in Path::new(path).components() {
            current.push(component);
            state.dirs.insert(current.to_string_lossy().to_string());
        }
        Ok(())
    }

    async fn upload_bytes(
        &self,
        content: &[u8],
        dest: &str,
        mode: u32,
    ) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        details.insert("size".to_string(), json!(content.len()));
        details.insert("mode".to_string(), json!(format!("{mode:o}")));
        state.record("upload_content", dest, details)?;
        state.files.insert(
            dest.to_string(),
            SimFile {
                content: content.to_vec(),
                mode,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn upload_file(&self, local: &Path, dest: &str) -> Result<(), ExecutorError> {
        let content = std::fs::read(local).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExecutorError::NotFound {
                path: local.display().to_string(),
            },
            _ => ExecutorError::io(local.display().to_string(), e),
        })?;
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        details.insert("source".to_string(), json!(local.display().to_string()));
        details.insert("size".to_string(), json!(content.len()));
        state.record("upload_file", dest, details)?;
        state.files.insert(
            dest.to_string(),
            SimFile {
                content,
                mode: 0o644,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("download_file", remote, BTreeMap::new())?;
        let Some(file) = state.files.get(remote) else {
            return Err(ExecutorError::NotFound {
                path: remote.to_string(),
            });
        };
        std::fs::write(local, &file.content)
            .map_err(|e| ExecutorError::io(local.display().to_string(), e))?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("file_exists", path, BTreeMap::new())?;
        Ok(state.files.contains_key(path)
            || state.dirs.contains(path)
            || state.symlinks.contains_key(path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("remove_file", path, BTreeMap::new())?;
        state.files.remove(path);
        state.symlinks.remove(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str, recursive: bool) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        details.insert("recursive".to_string(), json!(recursive));
        state.record("remove_directory", path, details)?;
        state.dirs.remove(path);
        if recursive {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            state.dirs.retain(|d| !d.starts_with(&prefix));
            state.files.retain(|f, _| !f.starts_with(&prefix));
            state.symlinks.retain(|l, _| !l.starts_with(&prefix));
        }
        Ok(())
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        details.insert("target".to_string(), json!(target));
        state.record("create_symlink", link, details)?;
        state.symlinks.insert(link.to_string(), target.to_string());
        Ok(())
    }

    async fn read_symlink(&self, link: &str) -> Result<Option<String>, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("read_symlink", link, BTreeMap::new())?;
        Ok(state.symlinks.get(link).cloned())
    }

    async fn run_command(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ExecutorError> {
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        if let Some(bytes) = stdin {
            details.insert("stdin_bytes".to_string(), json!(bytes.len()));
        }
        state.record("execute", command, details)?;
        let output = state.responses.get(command).cloned().unwrap_or_default();
        Ok(CommandOutput {
            output,
            exit_code: 0,
        })
    }

    async fn spawn_process(&self, command: &str, args: &[String]) -> Result<u32, ExecutorError> {
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        details.insert("args".to_string(), json!(args));
        state.record("spawn_process", command, details)?;
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            SimProcess {
                command: command.to_string(),
                args: args.to_vec(),
                state: SimProcessState::Running,
                started_at: Utc::now(),
                stopped_at: None,
            },
        );
        Ok(pid)
    }

    async fn run_mongo_command(
        &self,
        endpoint: &MongoEndpoint,
        command: serde_json::Value,
        safety_check: bool,
    ) -> Result<serde_json::Value, ExecutorError> {
        let mut state = self.state.lock().await;
        Self::connect_if_new(&mut state, endpoint)?;

        let command_name = command
            .as_object()
            .and_then(|o| o.keys().next().cloned())
            .unwrap_or_else(|| "unknown".to_string());
        let mut details = BTreeMap::new();
        details.insert("command".to_string(), json!(command_name.clone()));
        details.insert("safety_check".to_string(), json!(safety_check));
        state.record("mongo_command", &endpoint.address, details)?;

        match command_name.as_str() {
            "replSetGetStatus" => match state.initiated_members.get(&endpoint.address) {
                Some(set_name) => Ok(Self::primary_status(set_name, &endpoint.address)),
                // Safety checks expect this exact failure mode; callers
                // branch on the phrase to decide to initiate.
                None => Err(ExecutorError::Mongo {
                    message: "no replset config has been received".to_string(),
                }),
            },
            "replSetInitiate" => {
                if state.initiated_members.contains_key(&endpoint.address) {
                    return Err(ExecutorError::Mongo {
                        message: "already initialized".to_string(),
                    });
                }
                let config = &command["replSetInitiate"];
                let set_name = config["_id"].as_str().unwrap_or("rs0").to_string();
                let members: Vec<String> = config["members"]
                    .as_array()
                    .map(|members| {
                        members
                            .iter()
                            .filter_map(|m| m["host"].as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                if members.is_empty() {
                    state
                        .initiated_members
                        .insert(endpoint.address.clone(), set_name.clone());
                } else {
                    for member in members {
                        state.initiated_members.insert(member, set_name.clone());
                    }
                }
                Ok(json!({ "ok": 1 }))
            }
            "listShards" => {
                let shards: Vec<serde_json::Value> = state
                    .shards
                    .iter()
                    .map(|(id, host)| json!({ "_id": id, "host": host }))
                    .collect();
                Ok(json!({ "ok": 1, "shards": shards }))
            }
            "addShard" => {
                let connstr = command["addShard"].as_str().unwrap_or_default().to_string();
                let name = command
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| connstr.split('/').next().map(|s| s.to_string()))
                    .unwrap_or_default();
                state.shards.insert(name.clone(), connstr);
                Ok(json!({ "ok": 1, "shardAdded": name }))
            }
            "removeShard" => {
                let name = command["removeShard"].as_str().unwrap_or_default();
                match state.shards.remove(name) {
                    Some(_) => Ok(json!({ "ok": 1, "state": "completed", "shard": name })),
                    None => Err(ExecutorError::Mongo {
                        message: format!("shard {name} does not exist"),
                    }),
                }
            }
            // ping, hello, setFeatureCompatibilityVersion, and the rest of
            // the admin surface succeed trivially.
            _ => Ok(json!({ "ok": 1 })),
        }
    }

    async fn process_running(&self, pid: u32) -> Result<bool, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("process_running", &pid.to_string(), BTreeMap::new())?;
        Ok(state
            .processes
            .get(&pid)
            .map(|p| p.state == SimProcessState::Running)
            .unwrap_or(false))
    }

    async fn kill_process(&self, pid: u32) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("kill_process", &pid.to_string(), BTreeMap::new())?;
        if let Some(process) = state.processes.get_mut(&pid) {
            process.state = SimProcessState::Stopped;
            process.stopped_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn stop_process(&self, pid: u32, grace: Duration) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        let mut details = BTreeMap::new();
        details.insert("grace_secs".to_string(), json!(grace.as_secs()));
        state.record("stop_process", &pid.to_string(), details)?;
        if let Some(process) = state.processes.get_mut(&pid) {
            process.state = SimProcessState::Stopped;
            process.stopped_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn system_info(&self) -> Result<SystemInfo, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("system_info", "localhost", BTreeMap::new())?;
        Ok(SystemInfo {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            version: "6.1.0".to_string(),
        })
    }

    async fn available_disk(&self, path: &str) -> Result<u64, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("disk_space", path, BTreeMap::new())?;
        Ok(state.disk_available)
    }

    async fn port_free(&self, port: u16) -> Result<bool, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("port_check", &port.to_string(), BTreeMap::new())?;
        Ok(!state.busy_ports.contains(&port))
    }

    async fn user_exists(&self, user: &str) -> Result<bool, ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("user_exists", user, BTreeMap::new())?;
        // The simulated world has the common service users.
        Ok(matches!(user, "root" | "mup" | "mongodb"))
    }

    async fn ping(&self) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("ping", "localhost", BTreeMap::new())?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        state.record("close", "localhost", BTreeMap::new())?;
        state.connected_endpoints.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_in_order() {
        let sim = SimulatorExecutor::new();
        sim.create_dir("/data/db").await.unwrap();
        sim.upload_bytes(b"cfg", "/data/db/mongod.conf", 0o644)
            .await
            .unwrap();

        let log = sim.operation_log().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].op_type, "create_directory");
        assert_eq!(log[0].target, "/data/db");
        assert_eq!(log[1].op_type, "upload_content");
        assert_eq!(log[0].id, 1);
        assert_eq!(log[1].id, 2);

        let info = sim.file_info("/data/db/mongod.conf").await.unwrap();
        assert_eq!(info.size, 3);
        assert_eq!(info.mode, 0o644);
    }

    #[tokio::test]
    async fn create_dir_implies_parents() {
        let sim = SimulatorExecutor::new();
        sim.create_dir("/data/db/journal").await.unwrap();
        assert!(sim.dir_exists("/data/db").await);
        assert!(sim.file_exists("/data/db/journal").await.unwrap());
    }

    #[tokio::test]
    async fn injected_failure_is_returned_and_recorded() {
        let sim = SimulatorExecutor::new();
        sim.add_failure(FailureRule {
            operation: "create_directory".to_string(),
            target: "/data/db".to_string(),
            error: "disk error".to_string(),
        })
        .await;

        let err = sim.create_dir("/data/db").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Simulated { .. }));
        assert!(!sim.dir_exists("/data/db").await);

        let log = sim.operation_log().await;
        assert_eq!(log[0].result, "error");
        assert_eq!(log[0].error.as_deref(), Some("disk error"));

        // Other targets are unaffected.
        sim.create_dir("/data/other").await.unwrap();

        sim.remove_failure("create_directory", "/data/db").await;
        sim.create_dir("/data/db").await.unwrap();
        assert!(sim.dir_exists("/data/db").await);
    }

    #[tokio::test]
    async fn pid_allocation_starts_at_1000() {
        let sim = SimulatorExecutor::new();
        let pid1 = sim
            .spawn_process("mongod", &["--port".to_string(), "27017".to_string()])
            .await
            .unwrap();
        let pid2 = sim.spawn_process("mongos", &[]).await.unwrap();
        assert_eq!(pid1, 1000);
        assert_eq!(pid2, 1001);
        assert!(sim.process_running(pid1).await.unwrap());

        sim.stop_process(pid1, Duration::from_secs(5)).await.unwrap();
        assert!(!sim.process_running(pid1).await.unwrap());

        let info = sim.process_info(pid1).await.unwrap();
        assert_eq!(info.command, "mongod");
        assert_eq!(info.args, vec!["--port", "27017"]);
        assert!(!info.running);
        assert!(info.stopped_at.is_some());
        assert!(info.stopped_at.unwrap() >= info.started_at);
    }

    #[tokio::test]
    async fn response_table_serves_canned_output() {
        let sim = SimulatorExecutor::new();
        let out = sim.run_command("hostname", None).await.unwrap();
        assert_eq!(out.output, "sim-host");
        assert!(out.success());

        // Unknown commands return empty output.
        let unknown = sim.run_command("made-up-probe", None).await.unwrap();
        assert_eq!(unknown.output, "");

        sim.set_response("made-up-probe", "42").await;
        assert_eq!(sim.run_command("made-up-probe", None).await.unwrap().output, "42");
    }

    #[tokio::test]
    async fn repl_set_lifecycle_is_simulated() {
        let sim = SimulatorExecutor::new();
        let endpoint = MongoEndpoint::direct("localhost:27017");

        // Safety check before init fails with the canonical phrase.
        let err = sim
            .run_mongo_command(&endpoint, json!({"replSetGetStatus": 1}), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no replset config"));

        sim.run_mongo_command(
            &endpoint,
            json!({"replSetInitiate": {"_id": "rs0", "members": [
                {"_id": 0, "host": "localhost:27017"},
                {"_id": 1, "host": "localhost:27018"},
            ]}}),
            false,
        )
        .await
        .unwrap();

        // Every member now reports PRIMARY state.
        let status = sim
            .run_mongo_command(
                &MongoEndpoint::direct("localhost:27018"),
                json!({"replSetGetStatus": 1}),
                false,
            )
            .await
            .unwrap();
        assert_eq!(status["set"], "rs0");
        assert_eq!(status["members"][0]["stateStr"], "PRIMARY");

        // Re-initiating is refused with the idempotency phrase.
        let err = sim
            .run_mongo_command(&endpoint, json!({"replSetInitiate": {"_id": "rs0"}}), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already initialized"));
    }

    #[tokio::test]
    async fn shard_registry_is_simulated() {
        let sim = SimulatorExecutor::new();
        let mongos = MongoEndpoint::routed("localhost:27016");

        let before = sim
            .run_mongo_command(&mongos, json!({"listShards": 1}), false)
            .await
            .unwrap();
        assert_eq!(before["shards"].as_array().unwrap().len(), 0);

        sim.run_mongo_command(
            &mongos,
            json!({"addShard": "shard01/localhost:27018", "name": "shard01"}),
            false,
        )
        .await
        .unwrap();

        let after = sim
            .run_mongo_command(&mongos, json!({"listShards": 1}), false)
            .await
            .unwrap();
        assert_eq!(after["shards"][0]["_id"], "shard01");
    }

    #[tokio::test]
    async fn connect_is_recorded_once_per_endpoint() {
        let sim = SimulatorExecutor::new();
        let endpoint = MongoEndpoint::direct("localhost:27017");
        let _ = sim
            .run_mongo_command(&endpoint, json!({"ping": 1}), false)
            .await;
        let _ = sim
            .run_mongo_command(&endpoint, json!({"ping": 1}), false)
            .await;

        let connects = sim.operations_of_type("connect").await;
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].target, "localhost:27017");
    }

    #[tokio::test]
    async fn scenario_yaml_seeds_world() {
        let yaml = r#"
name: seeded
responses:
  hostname: db1
failures:
  - operation: create_directory
    target: /forbidden
    error: permission denied
files:
  - path: /etc/mongod.conf
    content: "port: 27017"
dirs:
  - /data/db
processes:
  - command: mongod
    args: ["--port", "27017"]
busy_ports: [27017]
"#;
        let sim = SimulatorExecutor::with_scenario(Scenario::from_yaml(yaml).unwrap());
        assert!(sim.file_exists("/etc/mongod.conf").await.unwrap());
        assert!(sim.dir_exists("/data/db").await);
        assert_eq!(sim.running_process_count().await, 1);
        assert!(!sim.port_free(27017).await.unwrap());
        assert!(sim.port_free(27018).await.unwrap());
        assert_eq!(sim.run_command("hostname", None).await.unwrap().output, "db1");
        assert!(sim.create_dir("/forbidden").await.is_err());
    }

    #[tokio::test]
    async fn builtin_scenarios_exist() {
        for name in [
            "port-conflict",
            "permission-denied",
            "disk-full",
            "network-failure",
            "existing-cluster",
        ] {
            assert!(Scenario::builtin(name).is_some(), "missing template {name}");
        }
        assert!(Scenario::builtin("unknown").is_none());

        let sim = SimulatorExecutor::with_builtin_scenario("existing-cluster").unwrap();
        let status = sim
            .run_mongo_command(
                &MongoEndpoint::direct("localhost:27017"),
                json!({"replSetGetStatus": 1}),
                true,
            )
            .await
            .unwrap();
        assert_eq!(status["set"], "rs0");
    }

    #[tokio::test]
    async fn identical_runs_produce_identical_logs() {
        async fn drive(sim: &SimulatorExecutor) {
            sim.create_dir("/data/db").await.unwrap();
            sim.upload_bytes(b"cfg", "/data/db/mongod.conf", 0o600)
                .await
                .unwrap();
            let pid = sim.spawn_process("mongod", &["--port".into(), "27017".into()])
                .await
                .unwrap();
            let _ = sim.process_running(pid).await;
            let _ = sim
                .run_mongo_command(
                    &MongoEndpoint::direct("localhost:27017"),
                    json!({"replSetGetStatus": 1}),
                    true,
                )
                .await;
        }

        let scenario = Scenario::builtin("port-conflict").unwrap();
        let sim_a = SimulatorExecutor::with_scenario(scenario.clone());
        let sim_b = SimulatorExecutor::with_scenario(scenario);
        drive(&sim_a).await;
        drive(&sim_b).await;

        let log_a: Vec<_> = sim_a
            .operation_log()
            .await
            .iter()
            .map(|op| op.fingerprint())
            .collect();
        let log_b: Vec<_> = sim_b
            .operation_log()
            .await
            .iter()
            .map(|op| op.fingerprint())
            .collect();
        assert_eq!(log_a, log_b);
    }
}
