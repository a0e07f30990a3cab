//! End-to-end tests for the plan-and-apply engine.
//!
//! These drive the public library surface — plan store, lock manager, and
//! apply engine over the simulator backend — through the full lifecycle:
//! save, lock, apply, checkpoint, fail, resume.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mup::engine::{ApplyEngine, EngineOptions};
use mup::errors::{ApplyError, LockError};
use mup::executor::SimulatorExecutor;
use mup::executor::simulator::FailureRule;
use mup::hooks::{HookEvent, HookSpec};
use mup::lock::LockManager;
use mup::ops::{HandlerRegistry, OperationExecutor};
use mup::plan::{
    ClusterOperation, OperationType, Plan, PlanStore, PlannedOperation, PlannedPhase,
};
use mup::state::{ApplyStatus, StepStatus};
use mup::storage::StorageLayout;
use serde_json::json;
use tempfile::TempDir;

fn layout(dir: &TempDir) -> StorageLayout {
    // RUST_LOG=debug surfaces engine traces when a test misbehaves.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    StorageLayout::new(dir.path())
}

fn engine(dir: &TempDir, sim: Arc<SimulatorExecutor>) -> ApplyEngine {
    let op_executor = OperationExecutor::new(HandlerRegistry::standard(), sim);
    ApplyEngine::new(layout(dir), op_executor).unwrap()
}

fn dir_op(id: &str, path: &str) -> PlannedOperation {
    PlannedOperation::new(id, OperationType::CreateDirectory, format!("create {path}"))
        .with_param("path", json!(path))
}

/// A three-phase plan, one create_directory op per phase.
fn three_phase_plan(cluster: &str) -> Plan {
    Plan::new(cluster, ClusterOperation::Deploy)
        .with_version("7.0.0")
        .with_phase(
            PlannedPhase::new("prepare", 1).with_operation(dir_op("op-prepare", "/data/prepare")),
        )
        .with_phase(
            PlannedPhase::new("deploy", 2).with_operation(dir_op("op-deploy", "/data/deploy")),
        )
        .with_phase(
            PlannedPhase::new("initialize", 3)
                .with_operation(dir_op("op-initialize", "/data/initialize")),
        )
}

// =============================================================================
// Scenario 1: plan round-trip with tamper
// =============================================================================

#[test]
fn plan_round_trip_with_tamper() {
    let dir = TempDir::new().unwrap();
    let store = PlanStore::new(layout(&dir));

    let mut plan = Plan::new("c1", ClusterOperation::Deploy)
        .with_version("7.0.0")
        .with_phase(PlannedPhase::new("deploy", 1).with_operation(
            dir_op("op-1", "/data/db").with_param("port", json!(27017)),
        ));
    let plan_id = store.save(&mut plan).unwrap();
    assert!(!plan_id.is_empty());

    let checksum_path = dir
        .path()
        .join(format!("clusters/c1/plans/{plan_id}.json.sha256"));
    assert!(checksum_path.exists());
    assert!(store.verify("c1", &plan_id).unwrap());

    let loaded = store.load("c1", &plan_id).unwrap();
    assert_eq!(loaded, plan);

    // Tamper with the on-disk plan.
    std::fs::write(
        dir.path().join(format!("clusters/c1/plans/{plan_id}.json")),
        "tampered",
    )
    .unwrap();
    assert!(!store.verify("c1", &plan_id).unwrap());

    let list = store.list("c1").unwrap();
    assert_eq!(list.len(), 1);
    assert!(!list[0].verified);
}

// =============================================================================
// Scenario 2: lock mutual exclusion
// =============================================================================

#[test]
fn lock_mutual_exclusion() {
    let dir = TempDir::new().unwrap();
    let process_a = LockManager::new(layout(&dir)).with_identity("a@host:1");
    let process_b = LockManager::new(layout(&dir)).with_identity("b@host:2");
    let hour = Duration::from_secs(3600);

    let mut lock_a = process_a
        .acquire("c1", "p1", ClusterOperation::Deploy, hour)
        .unwrap();
    assert_eq!(lock_a.renew_count, 0);

    let denied = process_b
        .acquire("c1", "p2", ClusterOperation::Upgrade, hour)
        .unwrap_err();
    assert!(matches!(denied, LockError::Locked { .. }));

    process_a.release("c1", &lock_a).unwrap();
    process_b
        .acquire("c1", "p2", ClusterOperation::Upgrade, hour)
        .unwrap();

    // A's lease is gone; its renewal must fail.
    assert!(process_a.renew(&mut lock_a, hour).is_err());
}

// =============================================================================
// Scenario 3: expired lock reclaim
// =============================================================================

#[test]
fn expired_lock_reclaim() {
    let dir = TempDir::new().unwrap();
    let process_a = LockManager::new(layout(&dir)).with_identity("a@host:1");
    let process_b = LockManager::new(layout(&dir)).with_identity("b@host:2");

    process_a
        .acquire("c1", "p1", ClusterOperation::Deploy, Duration::from_millis(1))
        .unwrap();
    std::thread::sleep(Duration::from_millis(10));

    assert!(!process_a.is_locked("c1"));
    let reclaimed = process_b
        .acquire("c1", "p2", ClusterOperation::Deploy, Duration::from_secs(3600))
        .unwrap();
    assert_eq!(reclaimed.locked_by, "b@host:2");
}

// =============================================================================
// Scenario 4: apply happy path with checkpoints
// =============================================================================

#[tokio::test]
async fn apply_happy_path_with_checkpoints() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let mut plan = three_phase_plan("c1");
    engine.plan_store().save(&mut plan).unwrap();

    let cancel = CancellationToken::new();
    let state = engine.apply(&cancel, &plan).await.unwrap();

    assert_eq!(state.status, ApplyStatus::Completed);
    assert!(state.completed_at.is_some());
    for phase in ["prepare", "deploy", "initialize"] {
        assert_eq!(
            state.phase_states[phase].status,
            StepStatus::Completed,
            "phase {phase}"
        );
    }

    // Three checkpoints, in phase order.
    assert_eq!(state.checkpoints.len(), 3);
    let phases: Vec<&str> = state.checkpoints.iter().map(|c| c.phase.as_str()).collect();
    assert_eq!(phases, vec!["prepare", "deploy", "initialize"]);
    for checkpoint in &state.checkpoints {
        assert!(std::path::Path::new(&checkpoint.state_path).exists());
    }

    // Exactly three directory creations hit the backend.
    let created = sim.operations_of_type("create_directory").await;
    assert_eq!(created.len(), 3);

    // The lock is released after the apply.
    assert!(!engine.lock_manager().is_locked("c1"));
}

// =============================================================================
// Scenario 5: resume after failure
// =============================================================================

#[tokio::test]
async fn resume_after_failure() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let mut plan = three_phase_plan("c1");
    engine.plan_store().save(&mut plan).unwrap();

    sim.add_failure(FailureRule {
        operation: "create_directory".to_string(),
        target: "/data/deploy".to_string(),
        error: "disk error".to_string(),
    })
    .await;

    let cancel = CancellationToken::new();
    let err = engine.apply(&cancel, &plan).await.unwrap_err();
    assert!(matches!(err, ApplyError::PhaseFailed { .. }));

    // The failure is durable: reload the state document from disk.
    let state_ids = engine.state_store().list("c1").unwrap();
    assert_eq!(state_ids.len(), 1);
    let state = engine.state_store().load("c1", &state_ids[0]).unwrap();

    assert_eq!(state.status, ApplyStatus::Failed);
    assert_eq!(state.current_phase.as_deref(), Some("deploy"));
    assert!(state.phase_states["deploy"].error.is_some());
    assert_eq!(state.phase_states["prepare"].status, StepStatus::Completed);
    // Only the prepare checkpoint exists.
    assert_eq!(state.checkpoints.len(), 1);
    assert_eq!(state.checkpoints[0].phase, "prepare");

    // Clear the injected failure and resume at the deploy phase.
    sim.remove_failure("create_directory", "/data/deploy").await;
    let resumed = engine.resume(&cancel, state).await.unwrap();

    assert_eq!(resumed.status, ApplyStatus::Completed);
    assert_eq!(resumed.phase_states["deploy"].status, StepStatus::Completed);
    assert_eq!(
        resumed.phase_states["initialize"].status,
        StepStatus::Completed
    );

    // Resume re-entered at deploy: the prepare directory was created once,
    // deploy failed once and succeeded once, initialize succeeded once.
    let created = sim.operations_of_type("create_directory").await;
    assert_eq!(created.len(), 4);
    let succeeded = created.iter().filter(|op| op.result == "success").count();
    assert_eq!(succeeded, 3);
}

// =============================================================================
// Scenario 6: init replica set is idempotent through the engine
// =============================================================================

fn init_plan(cluster: &str) -> Plan {
    Plan::new(cluster, ClusterOperation::Deploy)
        .with_version("7.0.0")
        .with_phase(
            PlannedPhase::new("initialize", 1).with_operation(
                PlannedOperation::new("op-init", OperationType::InitReplicaSet, "init rs0")
                    .with_param("replica_set", json!("rs0"))
                    .with_param(
                        "members",
                        json!(["localhost:27017", "localhost:27018", "localhost:27019"]),
                    )
                    .with_param("retries", json!(3)),
            ),
        )
}

#[tokio::test]
async fn init_replica_set_idempotent_across_applies() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());
    let cancel = CancellationToken::new();

    let mut first_plan = init_plan("c1");
    engine.plan_store().save(&mut first_plan).unwrap();
    let first = engine.apply(&cancel, &first_plan).await.unwrap();
    assert_eq!(first.status, ApplyStatus::Completed);

    let connects = sim.operations_of_type("connect").await;
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].target, "localhost:27017");

    let commands: Vec<String> = sim
        .operations_of_type("mongo_command")
        .await
        .iter()
        .map(|op| op.details["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        commands,
        vec!["replSetGetStatus", "replSetInitiate", "replSetGetStatus"]
    );

    // Second apply: one safety probe that now sees PRIMARY, no second
    // replSetInitiate.
    let mut second_plan = init_plan("c1");
    engine.plan_store().save(&mut second_plan).unwrap();
    let second = engine.apply(&cancel, &second_plan).await.unwrap();
    assert_eq!(second.status, ApplyStatus::Completed);

    let op_state = &second.operation_states["op-init"];
    let result = op_state.result.as_ref().unwrap();
    assert_eq!(result["metadata"]["already_initialized"], json!(true));

    let commands: Vec<String> = sim
        .operations_of_type("mongo_command")
        .await
        .iter()
        .map(|op| op.details["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        commands,
        vec![
            "replSetGetStatus",
            "replSetInitiate",
            "replSetGetStatus",
            "replSetGetStatus",
        ]
    );
}

// =============================================================================
// Engine semantics beyond the literal scenarios
// =============================================================================

#[tokio::test]
async fn parallel_group_completes_all_operations() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let mut phase = PlannedPhase::new("deploy", 1);
    for i in 0..4 {
        let mut op = dir_op(&format!("op-{i}"), &format!("/data/node{i}"));
        op.parallel = true;
        phase.operations.push(op);
    }
    let mut plan = Plan::new("c1", ClusterOperation::Deploy).with_phase(phase);
    engine.plan_store().save(&mut plan).unwrap();

    let state = engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap();
    assert_eq!(state.status, ApplyStatus::Completed);
    for i in 0..4 {
        assert!(sim.dir_exists(&format!("/data/node{i}")).await, "node{i}");
        assert_eq!(
            state.operation_states[&format!("op-{i}")].status,
            StepStatus::Completed
        );
    }
}

#[tokio::test]
async fn parallel_group_failure_does_not_roll_back_completed_ops() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let mut phase = PlannedPhase::new("deploy", 1);
    for i in 0..3 {
        let mut op = dir_op(&format!("op-{i}"), &format!("/data/node{i}"));
        op.parallel = true;
        phase.operations.push(op);
    }
    let mut plan = Plan::new("c1", ClusterOperation::Deploy).with_phase(phase);
    engine.plan_store().save(&mut plan).unwrap();

    sim.add_failure(FailureRule {
        operation: "create_directory".to_string(),
        target: "/data/node1".to_string(),
        error: "disk error".to_string(),
    })
    .await;

    let err = engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::PhaseFailed { .. }));

    // Completed siblings stay completed.
    assert!(sim.dir_exists("/data/node0").await);
    assert!(sim.dir_exists("/data/node2").await);
    assert!(!sim.dir_exists("/data/node1").await);
}

#[tokio::test]
async fn sequential_failure_stops_the_phase() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let plan_phase = PlannedPhase::new("deploy", 1)
        .with_operation(dir_op("op-0", "/data/a"))
        .with_operation(dir_op("op-1", "/data/b"))
        .with_operation(dir_op("op-2", "/data/c"));
    let mut plan = Plan::new("c1", ClusterOperation::Deploy).with_phase(plan_phase);
    engine.plan_store().save(&mut plan).unwrap();

    sim.add_failure(FailureRule {
        operation: "create_directory".to_string(),
        target: "/data/b".to_string(),
        error: "disk error".to_string(),
    })
    .await;

    engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap_err();

    // The op after the failure never ran.
    assert!(sim.dir_exists("/data/a").await);
    assert!(!sim.dir_exists("/data/c").await);
}

#[tokio::test]
async fn rollback_is_declared_but_unimplemented() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim);
    let err = engine.rollback("ckpt-1").await.unwrap_err();
    assert!(matches!(err, ApplyError::NotImplemented { .. }));
}

#[tokio::test]
async fn resume_refuses_completed_state() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim);

    let mut plan = three_phase_plan("c1");
    engine.plan_store().save(&mut plan).unwrap();
    let state = engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap();

    let err = engine
        .resume(&CancellationToken::new(), state)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::CannotResume { .. }));
}

#[tokio::test]
async fn apply_is_denied_while_cluster_is_locked() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim);

    // Another process holds the cluster.
    let other = LockManager::new(layout(&dir)).with_identity("other@host:9");
    other
        .acquire("c1", "p-other", ClusterOperation::Upgrade, Duration::from_secs(3600))
        .unwrap();

    let mut plan = three_phase_plan("c1");
    engine.plan_store().save(&mut plan).unwrap();
    let err = engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Lock(LockError::Locked { .. })));
}

#[tokio::test]
async fn hooks_fire_with_core_environment() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim);

    let hook_out = dir.path().join("hook.out");
    let mut plan = three_phase_plan("c1").with_hook(HookSpec::new(
        "record-env",
        HookEvent::BeforePhase,
        format!(
            "echo \"$MUP_CLUSTER_NAME $MUP_OPERATION $MUP_CURRENT_PHASE\" >> {}",
            hook_out.display()
        ),
    ));
    plan.env
        .insert("MUP_EXTRA".to_string(), "extra".to_string());
    engine.plan_store().save(&mut plan).unwrap();

    engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap();

    let content = std::fs::read_to_string(&hook_out).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "c1 deploy prepare");
    assert_eq!(lines[2], "c1 deploy initialize");
}

#[tokio::test]
async fn failing_before_phase_hook_blocks_the_phase() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let mut plan = three_phase_plan("c1").with_hook(HookSpec::new(
        "gate",
        HookEvent::BeforePhase,
        "exit 1",
    ));
    engine.plan_store().save(&mut plan).unwrap();

    let err = engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Hook(_)));
    assert_eq!(sim.operations_of_type("create_directory").await.len(), 0);
}

#[tokio::test]
async fn pause_and_resume_at_phase_boundary() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = Arc::new(engine(&dir, sim.clone()));

    let mut plan = three_phase_plan("c1");
    // Stall the first phase so the pause request lands mid-apply.
    plan.phases[0].after_hook = Some(HookSpec::new("stall", HookEvent::AfterPhase, "sleep 1"));
    engine.plan_store().save(&mut plan).unwrap();

    let apply_task = {
        let engine = engine.clone();
        let plan = plan.clone();
        tokio::spawn(async move { engine.apply(&CancellationToken::new(), &plan).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.pause();

    let err = apply_task.await.unwrap().unwrap_err();
    assert!(matches!(err, ApplyError::Paused));

    let state_ids = engine.state_store().list("c1").unwrap();
    let state = engine.state_store().load("c1", &state_ids[0]).unwrap();
    assert_eq!(state.status, ApplyStatus::Paused);
    assert_eq!(state.phase_states["prepare"].status, StepStatus::Completed);

    // Handlers are idempotent, so re-entering the recorded phase is safe.
    let resumed = engine
        .resume(&CancellationToken::new(), state)
        .await
        .unwrap();
    assert_eq!(resumed.status, ApplyStatus::Completed);
}

#[tokio::test]
async fn deploy_timeout_fails_the_apply() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let op_executor = OperationExecutor::new(HandlerRegistry::standard(), sim);
    let engine = ApplyEngine::new(layout(&dir), op_executor)
        .unwrap()
        .with_options(EngineOptions {
            deploy_timeout: Duration::from_millis(50),
            ..Default::default()
        });

    // wait_for_ready on a port nothing listens on burns past the deadline.
    let phase = PlannedPhase::new("wait", 1).with_operation(
        PlannedOperation::new("op-wait", OperationType::WaitForReady, "wait for mongod")
            .with_param("port", json!(27017))
            .with_param("timeout_secs", json!(30)),
    );
    let mut plan = Plan::new("c1", ClusterOperation::Start).with_phase(phase);
    engine.plan_store().save(&mut plan).unwrap();

    let err = engine
        .apply(&CancellationToken::new(), &plan)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Timeout { .. }));

    let state_ids = engine.state_store().list("c1").unwrap();
    let state = engine.state_store().load("c1", &state_ids[0]).unwrap();
    assert_eq!(state.status, ApplyStatus::Failed);
}

#[tokio::test]
async fn cancellation_unwinds_without_rollback() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatorExecutor::new());
    let engine = engine(&dir, sim.clone());

    let mut plan = three_phase_plan("c1");
    engine.plan_store().save(&mut plan).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.apply(&cancel, &plan).await.unwrap_err();
    assert!(matches!(err, ApplyError::Cancelled));
    assert_eq!(sim.operations_of_type("create_directory").await.len(), 0);
}
