//! Filesystem-backed cluster lock with lease, renew, and expiry semantics.
//!
//! One lock file per cluster (`clusters/<name>/cluster.lock`) holds a JSON
//! lease document. A non-expired document owned by another identity denies
//! acquisition; expired documents are reclaimable by anyone. Every disk
//! mutation is a temp-file write followed by a rename, so a partially
//! written lock is never observable.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::LockError;
use crate::plan::model::ClusterOperation;
use crate::storage::{self, StorageLayout};

/// Default lease length when the caller passes a zero timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Lease document describing the current owner of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLock {
    pub cluster_name: String,
    pub plan_id: String,
    pub operation: ClusterOperation,
    /// Fingerprint of the acquiring process: `user@host:pid`.
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_timeout_secs: u64,
    pub renew_count: u32,
}

impl ClusterLock {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Fingerprint of this process: `user@host:pid`.
pub fn process_identity() -> String {
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string());
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host}:{}", std::process::id())
}

/// Serializes applies per cluster through a lease file.
#[derive(Debug, Clone)]
pub struct LockManager {
    layout: StorageLayout,
    identity: String,
}

impl LockManager {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            identity: process_identity(),
        }
    }

    /// Override the owner fingerprint. Lets tests model competing
    /// processes against the same storage root.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Acquire the cluster lock, installing a fresh lease document.
    ///
    /// Fails with [`LockError::Locked`] when a non-expired lease owned by a
    /// different identity exists. A zero `timeout` means
    /// [`DEFAULT_LOCK_TIMEOUT`].
    pub fn acquire(
        &self,
        cluster: &str,
        plan_id: &str,
        operation: ClusterOperation,
        timeout: Duration,
    ) -> Result<ClusterLock, LockError> {
        if let Some(existing) = self.read(cluster)? {
            if !existing.is_expired() && existing.locked_by != self.identity {
                return Err(LockError::Locked {
                    cluster: cluster.to_string(),
                    locked_by: existing.locked_by,
                    expires_at: existing.expires_at,
                });
            }
            if existing.is_expired() {
                debug!(cluster, previous_owner = %existing.locked_by, "reclaiming expired lock");
            }
        }

        let timeout = if timeout.is_zero() {
            DEFAULT_LOCK_TIMEOUT
        } else {
            timeout
        };
        let now = Utc::now();
        let lock = ClusterLock {
            cluster_name: cluster.to_string(),
            plan_id: plan_id.to_string(),
            operation,
            locked_by: self.identity.clone(),
            locked_at: now,
            expires_at: now + ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::hours(24)),
            lock_timeout_secs: timeout.as_secs(),
            renew_count: 0,
        };
        self.write(&lock)?;
        debug!(cluster, owner = %lock.locked_by, "lock acquired");
        Ok(lock)
    }

    /// Extend a held lease to `now + extension`.
    ///
    /// The caller must still be the persisted owner, and the lease must not
    /// have expired.
    pub fn renew(&self, lock: &mut ClusterLock, extension: Duration) -> Result<(), LockError> {
        let Some(persisted) = self.read(&lock.cluster_name)? else {
            return Err(LockError::Expired {
                cluster: lock.cluster_name.clone(),
            });
        };
        if persisted.locked_by != lock.locked_by {
            return Err(LockError::NotOwner {
                cluster: lock.cluster_name.clone(),
                owner: persisted.locked_by,
            });
        }
        if persisted.is_expired() {
            return Err(LockError::Expired {
                cluster: lock.cluster_name.clone(),
            });
        }

        lock.expires_at =
            Utc::now() + ChronoDuration::from_std(extension).unwrap_or(ChronoDuration::hours(1));
        lock.renew_count = persisted.renew_count + 1;
        self.write(lock)?;
        Ok(())
    }

    /// Release a held lease. Releasing an already-expired lease is a no-op
    /// success; releasing someone else's live lease is refused.
    pub fn release(&self, cluster: &str, lock: &ClusterLock) -> Result<(), LockError> {
        let Some(persisted) = self.read(cluster)? else {
            return Ok(());
        };
        if persisted.locked_by != lock.locked_by {
            if persisted.is_expired() {
                return Ok(());
            }
            return Err(LockError::NotOwner {
                cluster: cluster.to_string(),
                owner: persisted.locked_by,
            });
        }
        fs::remove_file(self.layout.lock_path(cluster))?;
        debug!(cluster, "lock released");
        Ok(())
    }

    /// True iff a non-expired lease document exists.
    pub fn is_locked(&self, cluster: &str) -> bool {
        match self.read(cluster) {
            Ok(Some(lock)) => !lock.is_expired(),
            Ok(None) => false,
            Err(e) => {
                warn!(cluster, error = %e, "unreadable lock file treated as unlocked");
                false
            }
        }
    }

    /// Administrative override: drop the lock file unconditionally.
    pub fn force_unlock(&self, cluster: &str) -> Result<(), LockError> {
        match fs::remove_file(self.layout.lock_path(cluster)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Sweep every cluster directory, removing expired lock files.
    /// Returns the clusters that were cleaned.
    pub fn cleanup_expired_locks(&self) -> Result<Vec<String>, LockError> {
        let mut cleaned = Vec::new();
        for cluster in self.layout.list_clusters() {
            if let Ok(Some(lock)) = self.read(&cluster) {
                if lock.is_expired() {
                    self.force_unlock(&cluster)?;
                    debug!(cluster = %cluster, "expired lock removed");
                    cleaned.push(cluster);
                }
            }
        }
        Ok(cleaned)
    }

    /// Spawn a background task renewing `lock` every `interval` until the
    /// token is cancelled. A renewal error stops the renewer; the engine
    /// does not abort the apply for it.
    pub fn start_renewal(
        &self,
        mut lock: ClusterLock,
        interval: Duration,
        extension: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.renew(&mut lock, extension) {
                            warn!(cluster = %lock.cluster_name, error = %e, "lock renewal failed, stopping renewer");
                            break;
                        }
                        debug!(cluster = %lock.cluster_name, renew_count = lock.renew_count, "lock renewed");
                    }
                }
            }
        })
    }

    fn read(&self, cluster: &str) -> Result<Option<ClusterLock>, LockError> {
        let path = self.layout.lock_path(cluster);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io(e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write(&self, lock: &ClusterLock) -> Result<(), LockError> {
        let bytes = serde_json::to_vec_pretty(lock)?;
        storage::write_atomic(&self.layout.lock_path(&lock.cluster_name), &bytes)?;
        Ok(())
    }
}
