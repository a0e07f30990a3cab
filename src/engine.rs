//! The apply engine: drives a plan phase by phase against the configured
//! backends, with checkpointing, crash-safe resume, lifecycle hooks,
//! parallel operation groups, and cluster locking.
//!
//! The engine is single-actor within one apply: phases run sequentially,
//! and inside a phase a maximal run of consecutive `parallel` operations
//! forms a group that spawns one task per operation and joins before
//! continuing. Serialization across applies is the lock manager's job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ApplyError, OperationError};
use crate::hooks::{HookEvent, HookRunner, HookSpec};
use crate::lock::LockManager;
use crate::ops::{OperationContext, OperationExecutor, OperationOutcome};
use crate::plan::model::{Plan, PlannedOperation, PlannedPhase};
use crate::plan::store::PlanStore;
use crate::state::{ApplyState, StateStore};
use crate::storage::StorageLayout;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Wall-clock bound on a whole apply.
    pub deploy_timeout: Duration,
    /// Lease length requested at lock acquisition.
    pub lock_timeout: Duration,
    /// Cadence of the background lock renewal task.
    pub lock_renew_interval: Duration,
    /// Extension applied on each renewal.
    pub lock_extension: Duration,
    /// Upgrade best-effort per-operation state persistence to fail-closed.
    pub fail_closed_persistence: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            deploy_timeout: Duration::from_secs(30 * 60),
            lock_timeout: Duration::ZERO, // lock manager default, 24h
            lock_renew_interval: Duration::from_secs(30),
            lock_extension: Duration::from_secs(5 * 60),
            fail_closed_persistence: false,
        }
    }
}

/// Everything one operation task needs, bundled so parallel groups can
/// share it by `Arc`.
struct OpTaskEnv {
    op_executor: Arc<OperationExecutor>,
    state: Arc<Mutex<ApplyState>>,
    state_store: StateStore,
    ctx: OperationContext,
    hook_runner: HookRunner,
    plan_hooks: Arc<Vec<HookSpec>>,
    hook_env: BTreeMap<String, String>,
    phase: String,
    fail_closed: bool,
}

impl OpTaskEnv {
    /// Persist the state document, honoring the persistence policy.
    async fn persist(&self) -> Result<(), OperationError> {
        let state = self.state.lock().await;
        match self.state_store.save(&state) {
            Ok(()) => Ok(()),
            Err(e) if self.fail_closed => {
                Err(OperationError::Internal(format!("state persistence failed: {e}")))
            }
            Err(e) => {
                // Forward progress beats a perfect record here.
                warn!(state_id = %state.id, error = %e, "state persistence failed, continuing");
                Ok(())
            }
        }
    }

    async fn fire_op_hooks(&self, event: HookEvent) {
        if let Err(e) = self
            .hook_runner
            .run_event(&self.plan_hooks, event, &self.hook_env)
            .await
        {
            warn!(event = %event, error = %e, "operation hook failed");
        }
    }

    /// Run one operation through the four-phase protocol, recording its
    /// state transitions.
    async fn run_operation(self: Arc<Self>, op: PlannedOperation) -> Result<(), OperationError> {
        self.state.lock().await.start_operation(&op.id);
        self.persist().await?;
        self.fire_op_hooks(HookEvent::BeforeOperation).await;

        match self.op_executor.execute_operation(&self.ctx, &op).await {
            Ok(OperationOutcome::Skipped { reason }) => {
                self.state.lock().await.skip_operation(&op.id, &reason);
            }
            Ok(OperationOutcome::Executed(result)) => {
                let value = serde_json::to_value(&result).ok();
                self.state.lock().await.complete_operation(&op.id, value);
            }
            Err(e) => {
                self.state.lock().await.fail_operation(
                    &self.phase,
                    &op.id,
                    &e.to_string(),
                    e.is_recoverable(),
                );
                // Best effort: the failure must land on disk if possible.
                let _ = self.persist().await;
                self.fire_op_hooks(HookEvent::AfterOperation).await;
                return Err(e);
            }
        }

        self.persist().await?;
        self.fire_op_hooks(HookEvent::AfterOperation).await;
        Ok(())
    }
}

/// A maximal run of consecutive same-flag operations. Declared order is
/// preserved across groups; order inside a parallel group is not.
fn group_operations(ops: &[PlannedOperation]) -> Vec<(bool, Vec<PlannedOperation>)> {
    let mut groups: Vec<(bool, Vec<PlannedOperation>)> = Vec::new();
    for op in ops {
        match groups.last_mut() {
            Some((true, run)) if op.parallel => run.push(op.clone()),
            _ => groups.push((op.parallel, vec![op.clone()])),
        }
    }
    // Singleton "parallel" runs execute sequentially anyway; the flag only
    // matters for runs of two or more.
    groups
}

/// Plan-and-apply executor for one storage root.
pub struct ApplyEngine {
    op_executor: Arc<OperationExecutor>,
    plan_store: PlanStore,
    state_store: StateStore,
    lock_manager: LockManager,
    hook_runner: HookRunner,
    storage: StorageLayout,
    options: EngineOptions,
    paused: Arc<AtomicBool>,
}

impl ApplyEngine {
    /// Build an engine. Fails when the handler registry does not cover the
    /// closed operation-type enumeration — a configuration error caught at
    /// startup, not at runtime.
    pub fn new(
        storage: StorageLayout,
        op_executor: OperationExecutor,
    ) -> Result<Self, ApplyError> {
        let missing = op_executor.registry().missing_types();
        if let Some(op_type) = missing.first() {
            return Err(ApplyError::UnknownHandler {
                op_type: op_type.as_str().to_string(),
            });
        }
        Ok(Self {
            op_executor: Arc::new(op_executor),
            plan_store: PlanStore::new(storage.clone()),
            state_store: StateStore::new(storage.clone()),
            lock_manager: LockManager::new(storage.clone()),
            hook_runner: HookRunner::new(),
            storage,
            options: EngineOptions::default(),
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a different lock identity (tests model competing processes).
    pub fn with_lock_manager(mut self, lock_manager: LockManager) -> Self {
        self.lock_manager = lock_manager;
        self
    }

    pub fn plan_store(&self) -> &PlanStore {
        &self.plan_store
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Request a pause. Observed at phase boundaries; nothing preempts a
    /// running operation.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Rollback to a checkpoint. Declared in the engine surface,
    /// deliberately unimplemented at this revision.
    pub async fn rollback(&self, _checkpoint_id: &str) -> Result<(), ApplyError> {
        Err(ApplyError::NotImplemented {
            what: "rollback".to_string(),
        })
    }

    /// Execute a plan from its first phase.
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
    ) -> Result<ApplyState, ApplyError> {
        let state = ApplyState::for_plan(plan);
        self.drive(cancel, plan.clone(), state, None).await
    }

    /// Re-enter a paused or failed apply at its recorded phase. Handlers
    /// are idempotent, so re-execution of the interrupted phase is safe.
    pub async fn resume(
        &self,
        cancel: &CancellationToken,
        state: ApplyState,
    ) -> Result<ApplyState, ApplyError> {
        if !state.status.is_resumable() {
            return Err(ApplyError::CannotResume {
                status: state.status.to_string(),
            });
        }
        let plan = self
            .plan_store
            .load(&state.cluster_name, &state.plan_id)?;
        let resume_phase = state.current_phase.clone();
        if let Some(name) = &resume_phase {
            if plan.phase(name).is_none() {
                return Err(ApplyError::PhaseNotFound {
                    phase: name.clone(),
                });
            }
        }
        self.drive(cancel, plan, state, resume_phase).await
    }

    /// Common apply/resume driver: lock, renew, hooks, phases, terminal
    /// state.
    async fn drive(
        &self,
        cancel: &CancellationToken,
        plan: Plan,
        mut state: ApplyState,
        resume_phase: Option<String>,
    ) -> Result<ApplyState, ApplyError> {
        self.paused.store(false, Ordering::SeqCst);
        self.storage.ensure_cluster_dirs(&plan.cluster_name)?;

        let lock = self.lock_manager.acquire(
            &plan.cluster_name,
            &plan.id,
            plan.operation,
            self.options.lock_timeout,
        )?;
        let renewal_cancel = cancel.child_token();
        let renewal = self.lock_manager.start_renewal(
            lock.clone(),
            self.options.lock_renew_interval,
            self.options.lock_extension,
            renewal_cancel.clone(),
        );

        state.mark_running();
        self.state_store.save(&state)?;
        info!(
            cluster = %plan.cluster_name,
            plan_id = %plan.id,
            state_id = %state.id,
            operation = %plan.operation,
            "apply started"
        );

        let shared = Arc::new(Mutex::new(state));
        let result = tokio::time::timeout(
            self.options.deploy_timeout,
            self.run_phases(cancel, &plan, shared.clone(), resume_phase),
        )
        .await
        .unwrap_or(Err(ApplyError::Timeout {
            seconds: self.options.deploy_timeout.as_secs(),
        }));

        renewal_cancel.cancel();
        renewal.await.ok();
        if let Err(e) = self.lock_manager.release(&plan.cluster_name, &lock) {
            warn!(cluster = %plan.cluster_name, error = %e, "lock release failed");
        }

        let mut state = shared.lock().await.clone();
        match result {
            Ok(()) => {
                state.mark_completed();
                self.state_store.save(&state)?;
                let env = self.hook_env(&plan, &state);
                self.fire_event(&plan, HookEvent::AfterApply, &env).await;
                self.fire_event(&plan, HookEvent::OnSuccess, &env).await;
                info!(state_id = %state.id, "apply completed");
                Ok(state)
            }
            Err(ApplyError::Paused) => {
                state.mark_paused();
                self.state_store.save(&state)?;
                info!(state_id = %state.id, "apply paused");
                Err(ApplyError::Paused)
            }
            Err(e) => {
                state.mark_failed();
                self.state_store.save(&state)?;
                let env = self.hook_env(&plan, &state);
                self.fire_event(&plan, HookEvent::OnError, &env).await;
                error!(state_id = %state.id, error = %e, "apply failed");
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        shared: Arc<Mutex<ApplyState>>,
        resume_phase: Option<String>,
    ) -> Result<(), ApplyError> {
        let phases = plan.ordered_phases();
        let start = match &resume_phase {
            Some(name) => phases
                .iter()
                .position(|p| &p.name == name)
                .ok_or_else(|| ApplyError::PhaseNotFound {
                    phase: name.clone(),
                })?,
            None => 0,
        };

        {
            let state = shared.lock().await.clone();
            self.fire_event(plan, HookEvent::BeforeApply, &self.hook_env(plan, &state))
                .await;
        }

        for &phase in &phases[start..] {
            if cancel.is_cancelled() {
                return Err(ApplyError::Cancelled);
            }
            self.run_phase(cancel, plan, shared.clone(), phase).await?;

            // Checkpoint the phase, then persist the updated state doc.
            {
                let mut state = shared.lock().await;
                self.state_store.checkpoint(
                    &mut state,
                    &format!("after phase {}", phase.name),
                    &phase.name,
                    None,
                )?;
                self.state_store.save(&state)?;
            }

            if self.paused.swap(false, Ordering::SeqCst) {
                return Err(ApplyError::Paused);
            }
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        shared: Arc<Mutex<ApplyState>>,
        phase: &PlannedPhase,
    ) -> Result<(), ApplyError> {
        {
            let mut state = shared.lock().await;
            state.start_phase(&phase.name);
            let _ = self.state_store.save(&state);
        }
        debug!(phase = %phase.name, operations = phase.operations.len(), "phase started");

        let env = {
            let state = shared.lock().await.clone();
            self.hook_env(plan, &state)
        };

        // before_phase is the one event that can veto execution; its
        // continue_on_error flag is the opt-out.
        if let Err(e) = self
            .hook_runner
            .run_event(&plan.hooks, HookEvent::BeforePhase, &env)
            .await
        {
            self.fail_phase_state(&shared, &phase.name, &e.to_string()).await;
            return Err(ApplyError::Hook(e));
        }
        if let Some(hook) = &phase.before_hook {
            if let Err(e) = self.hook_runner.run(hook, &env).await {
                if hook.continue_on_error {
                    warn!(hook = %hook.name, error = %e, "phase hook failed, continuing");
                } else {
                    self.fail_phase_state(&shared, &phase.name, &e.to_string()).await;
                    return Err(ApplyError::Hook(e));
                }
            }
        }

        let ctx = OperationContext::new(
            plan.cluster_name.clone(),
            plan.id.clone(),
            self.storage.clone(),
        )
        .with_cancel(cancel.child_token());

        let task_env = Arc::new(OpTaskEnv {
            op_executor: self.op_executor.clone(),
            state: shared.clone(),
            state_store: self.state_store.clone(),
            ctx,
            hook_runner: self.hook_runner.clone(),
            plan_hooks: Arc::new(plan.hooks.clone()),
            hook_env: env.clone(),
            phase: phase.name.clone(),
            fail_closed: self.options.fail_closed_persistence,
        });

        let phase_result = self
            .run_groups(cancel, task_env, &phase.operations)
            .await;

        if let Err(e) = phase_result {
            let message = e.to_string();
            self.fail_phase_state(&shared, &phase.name, &message).await;
            return Err(ApplyError::PhaseFailed {
                phase: phase.name.clone(),
                source: e,
            });
        }

        {
            let mut state = shared.lock().await;
            state.complete_phase(&phase.name);
        }

        // after_phase failures are logged, never fatal.
        if let Err(e) = self
            .hook_runner
            .run_event(&plan.hooks, HookEvent::AfterPhase, &env)
            .await
        {
            warn!(phase = %phase.name, error = %e, "after_phase hook failed");
        }
        if let Some(hook) = &phase.after_hook {
            if let Err(e) = self.hook_runner.run(hook, &env).await {
                warn!(hook = %hook.name, error = %e, "after_phase hook failed");
            }
        }
        Ok(())
    }

    async fn run_groups(
        &self,
        cancel: &CancellationToken,
        task_env: Arc<OpTaskEnv>,
        operations: &[PlannedOperation],
    ) -> Result<(), OperationError> {
        for (parallel, group) in group_operations(operations) {
            if cancel.is_cancelled() {
                return Err(OperationError::Cancelled);
            }
            if parallel && group.len() > 1 {
                let handles: Vec<_> = group
                    .into_iter()
                    .map(|op| {
                        let env = task_env.clone();
                        tokio::spawn(env.run_operation(op))
                    })
                    .collect();
                let results = futures::future::join_all(handles).await;
                // First error in declared order wins; later failures were
                // already recorded against their operations.
                let first_error = results.into_iter().find_map(|joined| match joined {
                    Ok(Err(e)) => Some(e),
                    Err(join_err) => Some(OperationError::Internal(join_err.to_string())),
                    Ok(Ok(())) => None,
                });
                if let Some(e) = first_error {
                    return Err(e);
                }
            } else {
                for op in group {
                    task_env.clone().run_operation(op).await?;
                }
            }
        }
        Ok(())
    }

    async fn fail_phase_state(
        &self,
        shared: &Arc<Mutex<ApplyState>>,
        phase: &str,
        error: &str,
    ) {
        let mut state = shared.lock().await;
        state.fail_phase(phase, error);
        let _ = self.state_store.save(&state);
    }

    /// Fire a log-only lifecycle event.
    async fn fire_event(&self, plan: &Plan, event: HookEvent, env: &BTreeMap<String, String>) {
        if let Err(e) = self.hook_runner.run_event(&plan.hooks, event, env).await {
            warn!(event = %event, error = %e, "lifecycle hook failed");
        }
    }

    /// Core `MUP_*` environment plus the plan's env map.
    fn hook_env(&self, plan: &Plan, state: &ApplyState) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("MUP_CLUSTER_NAME".to_string(), plan.cluster_name.clone());
        env.insert("MUP_OPERATION".to_string(), plan.operation.to_string());
        env.insert("MUP_PLAN_ID".to_string(), plan.id.clone());
        env.insert("MUP_STATE_ID".to_string(), state.id.clone());
        env.insert(
            "MUP_CURRENT_PHASE".to_string(),
            state.current_phase.clone().unwrap_or_default(),
        );
        env.insert("MUP_STATUS".to_string(), state.status.to_string());
        env.insert("MUP_VERSION".to_string(), plan.version.clone());
        env.insert("MUP_VARIANT".to_string(), plan.variant.clone());
        for (key, value) in &plan.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}
