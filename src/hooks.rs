//! Lifecycle-scoped shell hooks.
//!
//! Hooks are shell commands keyed by lifecycle event. The engine invokes
//! them through `sh -c` with a composed environment: the process env, the
//! core `MUP_*` variables, the plan's env map, and the hook's own env map,
//! later layers overriding earlier ones. Failures respect
//! `continue_on_error`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::HookError;

/// Lifecycle events a hook can be keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforePlan,
    AfterPlan,
    BeforeApply,
    AfterApply,
    BeforePhase,
    AfterPhase,
    BeforeOperation,
    AfterOperation,
    OnError,
    OnSuccess,
}

impl HookEvent {
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::BeforePlan,
            HookEvent::AfterPlan,
            HookEvent::BeforeApply,
            HookEvent::AfterApply,
            HookEvent::BeforePhase,
            HookEvent::AfterPhase,
            HookEvent::BeforeOperation,
            HookEvent::AfterOperation,
            HookEvent::OnError,
            HookEvent::OnSuccess,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforePlan => "before_plan",
            HookEvent::AfterPlan => "after_plan",
            HookEvent::BeforeApply => "before_apply",
            HookEvent::AfterApply => "after_apply",
            HookEvent::BeforePhase => "before_phase",
            HookEvent::AfterPhase => "after_phase",
            HookEvent::BeforeOperation => "before_operation",
            HookEvent::AfterOperation => "after_operation",
            HookEvent::OnError => "on_error",
            HookEvent::OnSuccess => "on_success",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::all()
            .iter()
            .find(|e| e.as_str() == s.to_lowercase())
            .copied()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid hook event '{s}'. Valid values: {}",
                    HookEvent::all()
                        .iter()
                        .map(|e| e.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

fn default_timeout() -> u64 {
    30
}

/// A single hook declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    pub event: HookEvent,
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl HookSpec {
    pub fn new(
        name: impl Into<String>,
        event: HookEvent,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event,
            command: command.into(),
            timeout_secs: default_timeout(),
            env: BTreeMap::new(),
            continue_on_error: false,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// Executes hooks with a composed environment.
#[derive(Debug, Clone, Default)]
pub struct HookRunner;

impl HookRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run one hook. `env` is the already-composed core + plan environment;
    /// the hook's own env map is layered on top.
    pub async fn run(
        &self,
        hook: &HookSpec,
        env: &BTreeMap<String, String>,
    ) -> Result<(), HookError> {
        debug!(hook = %hook.name, event = %hook.event, "running hook");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&hook.command)
            .envs(env)
            .envs(&hook.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| HookError::Spawn {
                name: hook.name.clone(),
                source,
            })?;

        let output = match timeout(
            Duration::from_secs(hook.timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => result.map_err(|source| HookError::Spawn {
                name: hook.name.clone(),
                source,
            })?,
            Err(_) => {
                return Err(HookError::Timeout {
                    name: hook.name.clone(),
                    seconds: hook.timeout_secs,
                });
            }
        };

        if !output.status.success() {
            return Err(HookError::NonZero {
                name: hook.name.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run every hook keyed by `event`, in declaration order.
    ///
    /// A failing hook with `continue_on_error` is logged and skipped; the
    /// first hard failure is returned and later hooks do not run.
    pub async fn run_event(
        &self,
        hooks: &[HookSpec],
        event: HookEvent,
        env: &BTreeMap<String, String>,
    ) -> Result<(), HookError> {
        for hook in hooks.iter().filter(|h| h.event == event) {
            match self.run(hook, env).await {
                Ok(()) => {}
                Err(e) if hook.continue_on_error => {
                    warn!(hook = %hook.name, error = %e, "hook failed, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
