//! MongoDB admin handlers: init-replica-set, add-shard, verify-health,
//! set-fcv, drain, validate.
//!
//! All of these ride the executor's dedicated admin entry point; known
//! idempotent server responses are recognized by substring match on a
//! small, fixed phrase set.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::{HookResult, OperationContext, OperationHandler, OperationResult, Params};
use crate::errors::{ExecutorError, OperationError};
use crate::executor::{Executor, MongoEndpoint};
use crate::plan::model::{Change, ChangeAction, OperationType, PlannedOperation};

/// Server phrases that mean "the replica set is already there".
const ALREADY_INITIALIZED_PHRASES: &[&str] = &["already initialized", "already initiated"];

/// Server phrases that mean "no replica set config yet" — the expected
/// safety-check outcome before a first initiation.
const NOT_INITIALIZED_PHRASES: &[&str] = &[
    "no replset config",
    "notyetinitialized",
    "not yet initialized",
];

fn matches_phrase(message: &str, phrases: &[&str]) -> bool {
    let lower = message.to_lowercase();
    phrases.iter().any(|p| lower.contains(p))
}

fn is_primary(status: &serde_json::Value) -> bool {
    if status.get("myState").and_then(|v| v.as_i64()) == Some(1) {
        return true;
    }
    status
        .get("members")
        .and_then(|v| v.as_array())
        .map(|members| {
            members
                .iter()
                .any(|m| m.get("stateStr").and_then(|v| v.as_str()) == Some("PRIMARY"))
        })
        .unwrap_or(false)
}

/// Initiates a replica set and waits for a PRIMARY.
pub struct InitReplicaSetHandler;

#[async_trait]
impl OperationHandler for InitReplicaSetHandler {
    fn op_type(&self) -> OperationType {
        OperationType::InitReplicaSet
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let mut result = HookResult::ok();
        if params.str("replica_set").is_err() {
            result = result.with_error("missing or empty parameter 'replica_set'");
        }
        match params.str_list("members") {
            Ok(members) if members.is_empty() => {
                result = result.with_error("'members' must list at least one host:port");
            }
            Ok(members) => {
                for member in &members {
                    if !member.contains(':') {
                        result =
                            result.with_error(format!("member '{member}' is not host:port"));
                    }
                }
            }
            Err(_) => result = result.with_error("parameter 'members' must be a list"),
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
        let set_name = params.str("replica_set")?;
        let members = params.str_list("members")?;
        let retries = params.u64_or("retries", 30)?;

        // Direct connection to the first member; it is not part of a
        // topology yet.
        let endpoint = MongoEndpoint::direct(&members[0]);

        // Safety probe: "not initialized" is the expected first-run answer.
        match exec
            .run_mongo_command(&endpoint, json!({ "replSetGetStatus": 1 }), true)
            .await
        {
            Ok(_) => {
                return Ok(OperationResult::success(format!(
                    "replica set {set_name} already initialized"
                ))
                .with_metadata("already_initialized", json!(true)));
            }
            Err(ExecutorError::Mongo { message })
                if matches_phrase(&message, NOT_INITIALIZED_PHRASES) => {}
            Err(e) => return Err(e.into()),
        }

        let config_members: Vec<serde_json::Value> = members
            .iter()
            .enumerate()
            .map(|(i, host)| json!({ "_id": i, "host": host }))
            .collect();
        let initiate = json!({
            "replSetInitiate": { "_id": set_name, "members": config_members }
        });
        match exec.run_mongo_command(&endpoint, initiate, false).await {
            Ok(_) => {}
            Err(ExecutorError::Mongo { message })
                if matches_phrase(&message, ALREADY_INITIALIZED_PHRASES) =>
            {
                return Ok(OperationResult::success(format!(
                    "replica set {set_name} already initialized"
                ))
                .with_metadata("already_initialized", json!(true)));
            }
            Err(e) => return Err(e.into()),
        }

        // Re-poll until a member reports PRIMARY or the retry bound hits.
        for _ in 0..retries {
            ctx.ensure_live()?;
            if let Ok(status) = exec
                .run_mongo_command(&endpoint, json!({ "replSetGetStatus": 1 }), false)
                .await
            {
                if is_primary(&status) {
                    return Ok(OperationResult::success(format!(
                        "replica set {set_name} initialized with {} members",
                        members.len()
                    ))
                    .with_change(Change::new("replica_set", set_name, ChangeAction::Create)));
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(OperationError::Timeout {
            seconds: retries,
            what: format!("replica set {set_name} PRIMARY"),
        })
    }
}

/// Registers a shard with a mongos, idempotently.
pub struct AddShardHandler;

#[async_trait]
impl OperationHandler for AddShardHandler {
    fn op_type(&self) -> OperationType {
        OperationType::AddShard
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        let mut result = HookResult::ok();
        for key in ["shard", "connection_string", "mongos"] {
            if params.str(key).is_err() {
                result = result.with_error(format!("missing or empty parameter '{key}'"));
            }
        }
        if let Some(mongos) = params.str_opt("mongos") {
            if !mongos.contains(':') {
                result = result.with_error(format!("mongos '{mongos}' is not host:port"));
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
        let shard = params.str("shard")?;
        let connection_string = params.str("connection_string")?;
        let mongos = params.str("mongos")?;

        // Non-direct: the router resolves topology itself.
        let endpoint = MongoEndpoint::routed(mongos);

        let existing = exec
            .run_mongo_command(&endpoint, json!({ "listShards": 1 }), false)
            .await?;
        let present = existing
            .get("shards")
            .and_then(|v| v.as_array())
            .map(|shards| {
                shards
                    .iter()
                    .any(|s| s.get("_id").and_then(|v| v.as_str()) == Some(shard))
            })
            .unwrap_or(false);
        if present {
            return Ok(
                OperationResult::success(format!("shard {shard} already present"))
                    .with_metadata("already_exists", json!(true)),
            );
        }

        match exec
            .run_mongo_command(
                &endpoint,
                json!({ "addShard": connection_string, "name": shard }),
                false,
            )
            .await
        {
            Ok(_) => Ok(OperationResult::success(format!("added shard {shard}"))
                .with_change(Change::new("shard", shard, ChangeAction::Create))),
            Err(ExecutorError::Mongo { message }) if matches_phrase(&message, &["already exists"]) => {
                Ok(OperationResult::success(format!("shard {shard} already present"))
                    .with_metadata("already_exists", json!(true)))
            }
            Err(e) => Err(e.into()),
        }
    }

    // PostHook trusts Execute at this revision.
}

/// Checks that every listed port is listening.
pub struct VerifyHealthHandler;

#[async_trait]
impl OperationHandler for VerifyHealthHandler {
    fn op_type(&self) -> OperationType {
        OperationType::VerifyHealth
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        match Params::new(op).ports("ports") {
            Ok(ports) if ports.is_empty() => {
                Ok(HookResult::error("'ports' must list at least one port"))
            }
            Ok(_) => Ok(HookResult::ok()),
            Err(e) => Ok(HookResult::error(e.to_string())),
        }
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        let ports = Params::new(op).ports("ports")?;
        let mut silent = Vec::new();
        for port in &ports {
            ctx.ensure_live()?;
            if exec.port_free(*port).await? {
                silent.push(port.to_string());
            }
        }
        if !silent.is_empty() {
            return Err(OperationError::Verification(format!(
                "ports not listening: {}",
                silent.join(", ")
            )));
        }
        Ok(OperationResult::success(format!(
            "{} ports healthy",
            ports.len()
        )))
    }
}

/// Sets the feature compatibility version after an upgrade.
pub struct SetFcvHandler;

#[async_trait]
impl OperationHandler for SetFcvHandler {
    fn op_type(&self) -> OperationType {
        OperationType::SetFcv
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        if params.str("endpoint").is_err() || params.str("version").is_err() {
            return Ok(HookResult::error(
                "parameters 'endpoint' and 'version' are required",
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
        let endpoint = params.str("endpoint")?;
        let version = params.str("version")?;

        // The confirm flag is mandatory from 7.0 on.
        let major = version.split('.').next().and_then(|s| s.parse::<u32>().ok());
        let command = if major.map(|m| m >= 7).unwrap_or(false) {
            json!({ "setFeatureCompatibilityVersion": version, "confirm": true })
        } else {
            json!({ "setFeatureCompatibilityVersion": version })
        };
        exec.run_mongo_command(&MongoEndpoint::routed(endpoint), command, false)
            .await?;
        Ok(OperationResult::success(format!("FCV set to {version}"))
            .with_change(Change::new("fcv", endpoint, ChangeAction::Update)))
    }
}

/// Drains a shard off the cluster via `removeShard`.
pub struct DrainHandler;

#[async_trait]
impl OperationHandler for DrainHandler {
    fn op_type(&self) -> OperationType {
        OperationType::Drain
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        let params = Params::new(op);
        if params.str("mongos").is_err() || params.str("shard").is_err() {
            return Ok(HookResult::error(
                "parameters 'mongos' and 'shard' are required",
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
        let mongos = params.str("mongos")?;
        let shard = params.str("shard")?;

        match exec
            .run_mongo_command(
                &MongoEndpoint::routed(mongos),
                json!({ "removeShard": shard }),
                false,
            )
            .await
        {
            Ok(reply) => {
                let state = reply
                    .get("state")
                    .and_then(|v| v.as_str())
                    .unwrap_or("started")
                    .to_string();
                Ok(OperationResult::success(format!(
                    "shard {shard} drain {state}"
                ))
                .with_metadata("drain_state", json!(state))
                .with_change(Change::new("shard", shard, ChangeAction::Delete)))
            }
            Err(ExecutorError::Mongo { message })
                if matches_phrase(&message, &["does not exist", "not found"]) =>
            {
                Ok(OperationResult::success(format!("shard {shard} already gone"))
                    .with_metadata("already_drained", json!(true)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Pings every listed endpoint; any unreachable endpoint fails.
pub struct ValidateHandler;

#[async_trait]
impl OperationHandler for ValidateHandler {
    fn op_type(&self) -> OperationType {
        OperationType::Validate
    }

    async fn pre_hook(
        &self,
        _ctx: &OperationContext,
        op: &PlannedOperation,
        _exec: &dyn Executor,
    ) -> Result<HookResult, OperationError> {
        match Params::new(op).str_list("endpoints") {
            Ok(endpoints) if endpoints.is_empty() => {
                Ok(HookResult::error("'endpoints' must list at least one host:port"))
            }
            Ok(_) => Ok(HookResult::ok()),
            Err(e) => Ok(HookResult::error(e.to_string())),
        }
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        op: &PlannedOperation,
        exec: &dyn Executor,
    ) -> Result<OperationResult, OperationError> {
        let endpoints = Params::new(op).str_list("endpoints")?;
        let mut unreachable = Vec::new();
        for address in &endpoints {
            ctx.ensure_live()?;
            let endpoint = MongoEndpoint::direct(address);
            if exec
                .run_mongo_command(&endpoint, json!({ "ping": 1 }), true)
                .await
                .is_err()
            {
                unreachable.push(address.clone());
            }
        }
        if !unreachable.is_empty() {
            return Err(OperationError::Verification(format!(
                "endpoints unreachable: {}",
                unreachable.join(", ")
            )));
        }
        Ok(OperationResult::success(format!(
            "validated {} endpoints",
            endpoints.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatorExecutor;
    use crate::executor::simulator::{FailureRule, Scenario};
    use crate::storage::StorageLayout;
    use serde_json::json as j;

    fn ctx() -> OperationContext {
        OperationContext::new("c1", "plan-1", StorageLayout::new("/tmp/mup-test"))
    }

    fn init_op() -> PlannedOperation {
        PlannedOperation::new("op-1", OperationType::InitReplicaSet, "init rs0")
            .with_param("replica_set", j!("rs0"))
            .with_param(
                "members",
                j!(["localhost:27017", "localhost:27018", "localhost:27019"]),
            )
            .with_param("retries", j!(3))
    }

    #[tokio::test]
    async fn init_replica_set_first_run_initiates_and_waits_for_primary() {
        let sim = SimulatorExecutor::new();
        let handler = InitReplicaSetHandler;
        let op = init_op();
        let ctx = ctx();

        assert!(handler.pre_hook(&ctx, &op, &sim).await.unwrap().valid);
        let result = handler.execute(&ctx, &op, &sim).await.unwrap();
        assert!(result.success);
        assert!(result.metadata.get("already_initialized").is_none());

        let mongo_ops = sim.operations_of_type("mongo_command").await;
        let commands: Vec<&str> = mongo_ops
            .iter()
            .map(|o| o.details["command"].as_str().unwrap())
            .collect();
        assert_eq!(
            commands,
            vec!["replSetGetStatus", "replSetInitiate", "replSetGetStatus"]
        );
        // The first probe is flagged as a safety check.
        assert_eq!(mongo_ops[0].details["safety_check"], j!(true));
    }

    #[tokio::test]
    async fn init_replica_set_second_run_is_idempotent() {
        let sim = SimulatorExecutor::new();
        let handler = InitReplicaSetHandler;
        let op = init_op();
        let ctx = ctx();

        handler.execute(&ctx, &op, &sim).await.unwrap();
        let before = sim.operations_of_type("mongo_command").await.len();

        let second = handler.execute(&ctx, &op, &sim).await.unwrap();
        assert_eq!(second.metadata["already_initialized"], j!(true));

        let after = sim.operations_of_type("mongo_command").await;
        // Only one extra probe, no second replSetInitiate.
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last().unwrap().details["command"], j!("replSetGetStatus"));
    }

    #[tokio::test]
    async fn init_replica_set_validates_members() {
        let sim = SimulatorExecutor::new();
        let op = PlannedOperation::new("op-1", OperationType::InitReplicaSet, "init")
            .with_param("replica_set", j!("rs0"))
            .with_param("members", j!(["nocolon"]));
        let result = InitReplicaSetHandler.pre_hook(&ctx(), &op, &sim).await.unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn add_shard_is_idempotent() {
        let sim = SimulatorExecutor::new();
        let handler = AddShardHandler;
        let op = PlannedOperation::new("op-1", OperationType::AddShard, "add shard01")
            .with_param("shard", j!("shard01"))
            .with_param("connection_string", j!("shard01/localhost:27018"))
            .with_param("mongos", j!("localhost:27016"));
        let ctx = ctx();

        let first = handler.execute(&ctx, &op, &sim).await.unwrap();
        assert!(first.metadata.get("already_exists").is_none());

        let second = handler.execute(&ctx, &op, &sim).await.unwrap();
        assert_eq!(second.metadata["already_exists"], j!(true));
    }

    #[tokio::test]
    async fn verify_health_fails_on_silent_port() {
        let scenario = Scenario {
            busy_ports: vec![27017],
            ..Default::default()
        };
        let sim = SimulatorExecutor::with_scenario(scenario);
        let handler = VerifyHealthHandler;
        let ctx = ctx();

        let healthy = PlannedOperation::new("op-1", OperationType::VerifyHealth, "health")
            .with_param("ports", j!([27017]));
        assert!(handler.execute(&ctx, &healthy, &sim).await.is_ok());

        let unhealthy = PlannedOperation::new("op-2", OperationType::VerifyHealth, "health")
            .with_param("ports", j!([27017, 27018]));
        let err = handler.execute(&ctx, &unhealthy, &sim).await.unwrap_err();
        assert!(err.to_string().contains("27018"));
    }

    #[tokio::test]
    async fn set_fcv_adds_confirm_from_seven() {
        let sim = SimulatorExecutor::new();
        let handler = SetFcvHandler;
        let ctx = ctx();
        let op = PlannedOperation::new("op-1", OperationType::SetFcv, "fcv")
            .with_param("endpoint", j!("localhost:27017"))
            .with_param("version", j!("7.0"));
        assert!(handler.execute(&ctx, &op, &sim).await.is_ok());
    }

    #[tokio::test]
    async fn drain_handles_missing_shard() {
        let sim = SimulatorExecutor::new();
        let handler = DrainHandler;
        let op = PlannedOperation::new("op-1", OperationType::Drain, "drain")
            .with_param("mongos", j!("localhost:27016"))
            .with_param("shard", j!("shard01"));
        let result = handler.execute(&ctx(), &op, &sim).await.unwrap();
        assert_eq!(result.metadata["already_drained"], j!(true));
    }

    #[tokio::test]
    async fn validate_fails_on_unreachable_endpoint() {
        let sim = SimulatorExecutor::new();
        sim.add_failure(FailureRule {
            operation: "mongo_command".to_string(),
            target: "localhost:27018".to_string(),
            error: "connection refused".to_string(),
        })
        .await;
        let op = PlannedOperation::new("op-1", OperationType::Validate, "validate")
            .with_param("endpoints", j!(["localhost:27017", "localhost:27018"]));
        let err = ValidateHandler.execute(&ctx(), &op, &sim).await.unwrap_err();
        assert!(err.to_string().contains("localhost:27018"));
    }
}
