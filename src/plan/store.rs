//! Content-addressed plan persistence.
//!
//! A saved plan is two sibling files: the canonical JSON document and a
//! `.sha256` carrying the hex digest of those exact bytes. Verification
//! recomputes the digest over the on-disk bytes; any mismatch marks the
//! plan as tampered without raising an error.

use sha2::{Digest, Sha256};
use std::fs;
use tracing::debug;

use crate::errors::StoreError;
use crate::plan::model::{ClusterOperation, Plan};
use crate::storage::{self, StorageLayout};

/// Lightweight projection of a stored plan.
///
/// `operation` is `None` when the on-disk document no longer parses
/// (a tampered plan still shows up in listings, flagged unverified).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlanMetadata {
    pub id: String,
    pub operation: Option<ClusterOperation>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub variant: String,
    pub is_valid: bool,
    pub phase_count: usize,
    pub phase_names: Vec<String>,
    pub size_bytes: u64,
    pub verified: bool,
}

/// Stores plans under `clusters/<cluster>/plans/`.
#[derive(Debug, Clone)]
pub struct PlanStore {
    layout: StorageLayout,
}

impl PlanStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Persist a plan, assigning `id` and `created_at` when unset.
    ///
    /// Returns the plan id. Plans are immutable after save: writing an id
    /// that already exists on disk is refused.
    pub fn save(&self, plan: &mut Plan) -> Result<String, StoreError> {
        if plan.id.is_empty() {
            plan.id = storage::time_sortable_id("plan");
        }
        if plan.created_at.timestamp() == 0 {
            plan.created_at = chrono::Utc::now();
        }

        let path = self.layout.plan_path(&plan.cluster_name, &plan.id);
        if path.exists() {
            return Err(StoreError::PlanAlreadyExists {
                cluster: plan.cluster_name.clone(),
                plan_id: plan.id.clone(),
            });
        }

        let bytes = serde_json::to_vec_pretty(plan)?;
        let digest = hex::encode(Sha256::digest(&bytes));

        storage::write_atomic(&path, &bytes)?;
        storage::write_atomic(
            &self.layout.checksum_path(&plan.cluster_name, &plan.id),
            digest.as_bytes(),
        )?;

        debug!(plan_id = %plan.id, cluster = %plan.cluster_name, "plan saved");
        Ok(plan.id.clone())
    }

    /// Load a plan by id.
    pub fn load(&self, cluster: &str, plan_id: &str) -> Result<Plan, StoreError> {
        let path = self.layout.plan_path(cluster, plan_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::PlanNotFound {
                    cluster: cluster.to_string(),
                    plan_id: plan_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load a plan and fail when its checksum no longer matches.
    pub fn load_verified(&self, cluster: &str, plan_id: &str) -> Result<Plan, StoreError> {
        if !self.verify(cluster, plan_id)? {
            return Err(StoreError::ChecksumMismatch {
                cluster: cluster.to_string(),
                plan_id: plan_id.to_string(),
            });
        }
        self.load(cluster, plan_id)
    }

    /// Recompute the SHA-256 of the on-disk plan bytes and compare it to
    /// the stored digest. Tampering yields `false`, not an error; a missing
    /// plan file is an error.
    pub fn verify(&self, cluster: &str, plan_id: &str) -> Result<bool, StoreError> {
        let path = self.layout.plan_path(cluster, plan_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::PlanNotFound {
                    cluster: cluster.to_string(),
                    plan_id: plan_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let Ok(stored) = fs::read_to_string(self.layout.checksum_path(cluster, plan_id)) else {
            return Ok(false);
        };
        let actual = hex::encode(Sha256::digest(&bytes));
        Ok(actual == stored.trim())
    }

    /// Metadata for every plan of a cluster, newest first.
    pub fn list(&self, cluster: &str) -> Result<Vec<PlanMetadata>, StoreError> {
        let dir = self.layout.plans_dir(cluster);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(Vec::new());
        };

        let mut plans = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let plan_id = name.trim_end_matches(".json");
            match self.metadata(cluster, plan_id) {
                Ok(meta) => plans.push(meta),
                Err(e) => debug!(plan_id, error = %e, "skipping unreadable plan entry"),
            }
        }

        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(plans)
    }

    /// Metadata projection for one plan, including its verification flag.
    ///
    /// Survives a plan document that no longer parses: the projection then
    /// carries only the id, size, and a `false` verification flag.
    pub fn metadata(&self, cluster: &str, plan_id: &str) -> Result<PlanMetadata, StoreError> {
        let path = self.layout.plan_path(cluster, plan_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::PlanNotFound {
                    cluster: cluster.to_string(),
                    plan_id: plan_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let verified = self.verify(cluster, plan_id).unwrap_or(false);

        let meta = match serde_json::from_slice::<Plan>(&bytes) {
            Ok(plan) => PlanMetadata {
                id: plan.id,
                operation: Some(plan.operation),
                created_at: plan.created_at,
                version: plan.version,
                variant: plan.variant,
                is_valid: plan.validation.valid,
                phase_count: plan.phases.len(),
                phase_names: plan.phases.iter().map(|p| p.name.clone()).collect(),
                size_bytes: bytes.len() as u64,
                verified,
            },
            Err(_) => PlanMetadata {
                id: plan_id.to_string(),
                operation: None,
                created_at: chrono::DateTime::UNIX_EPOCH,
                version: String::new(),
                variant: String::new(),
                is_valid: false,
                phase_count: 0,
                phase_names: Vec::new(),
                size_bytes: bytes.len() as u64,
                verified,
            },
        };
        Ok(meta)
    }

    /// Remove a plan and its checksum; a missing checksum is ignored.
    pub fn delete(&self, cluster: &str, plan_id: &str) -> Result<(), StoreError> {
        let path = self.layout.plan_path(cluster, plan_id);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::PlanNotFound {
                    cluster: cluster.to_string(),
                    plan_id: plan_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let _ = fs::remove_file(self.layout.checksum_path(cluster, plan_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{OperationType, PlannedOperation, PlannedPhase};
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> PlanStore {
        PlanStore::new(StorageLayout::new(dir.path()))
    }

    fn sample_plan() -> Plan {
        Plan::new("c1", ClusterOperation::Deploy)
            .with_version("7.0.0")
            .with_variant("community")
            .with_phase(PlannedPhase::new("prepare", 1).with_operation(
                PlannedOperation::new("op-1", OperationType::CreateDirectory, "data dir"),
            ))
    }

    #[test]
    fn save_assigns_id_and_writes_checksum() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut plan = sample_plan();

        let id = store.save(&mut plan).unwrap();
        assert!(id.starts_with("plan-"));
        assert!(dir
            .path()
            .join(format!("clusters/c1/plans/{id}.json.sha256"))
            .exists());
    }

    #[test]
    fn save_load_round_trip_preserves_content() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut plan = sample_plan();
        let id = store.save(&mut plan).unwrap();

        let loaded = store.load("c1", &id).unwrap();
        assert_eq!(loaded, plan);
        assert!(store.verify("c1", &id).unwrap());
    }

    #[test]
    fn save_refuses_to_overwrite_existing_plan() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut plan = sample_plan();
        let id = store.save(&mut plan).unwrap();

        let mut again = sample_plan();
        again.id = id;
        let err = store.save(&mut again).unwrap_err();
        assert!(matches!(err, StoreError::PlanAlreadyExists { .. }));
    }

    #[test]
    fn verify_detects_tampering_without_error() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut plan = sample_plan();
        let id = store.save(&mut plan).unwrap();

        fs::write(dir.path().join(format!("clusters/c1/plans/{id}.json")), "tampered").unwrap();
        assert!(!store.verify("c1", &id).unwrap());
    }

    #[test]
    fn load_missing_plan_is_not_found() {
        let dir = tempdir().unwrap();
        let err = store(&dir).load("c1", "plan-nope").unwrap_err();
        assert!(matches!(err, StoreError::PlanNotFound { .. }));
    }

    #[test]
    fn list_is_sorted_newest_first_with_verified_flag() {
        let dir = tempdir().unwrap();
        let store = store(&dir);

        let mut first = sample_plan();
        first.id = "plan-20250101000000-aaaaaaaa".into();
        first.created_at = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        store.save(&mut first).unwrap();

        let mut second = sample_plan();
        second.id = "plan-20250102000000-bbbbbbbb".into();
        second.created_at = chrono::DateTime::parse_from_rfc3339("2025-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        store.save(&mut second).unwrap();

        // Tamper with the older plan.
        fs::write(
            dir.path().join(format!("clusters/c1/plans/{}.json", first.id)),
            "tampered",
        )
        .unwrap();

        let list = store.list("c1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
        assert!(list[0].verified);
        // The tampered plan stays listed, flagged unverified.
        assert_eq!(list[1].id, first.id);
        assert!(!list[1].verified);
        assert!(list[1].operation.is_none());
    }

    #[test]
    fn metadata_projects_phase_names() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut plan = sample_plan();
        let id = store.save(&mut plan).unwrap();

        let meta = store.metadata("c1", &id).unwrap();
        assert_eq!(meta.phase_names, vec!["prepare"]);
        assert_eq!(meta.phase_count, 1);
        assert!(meta.is_valid);
        assert!(meta.size_bytes > 0);
        assert!(meta.verified);
    }

    #[test]
    fn delete_removes_plan_and_checksum() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut plan = sample_plan();
        let id = store.save(&mut plan).unwrap();

        store.delete("c1", &id).unwrap();
        assert!(matches!(
            store.load("c1", &id).unwrap_err(),
            StoreError::PlanNotFound { .. }
        ));
        assert!(!dir
            .path()
            .join(format!("clusters/c1/plans/{id}.json.sha256"))
            .exists());
    }
}
