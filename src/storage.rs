//! On-disk storage layout and atomic file writes.
//!
//! All durable artifacts live under a single configurable root
//! (default `~/.mup/storage`):
//!
//! ```text
//! clusters/<name>/meta.yaml
//! clusters/<name>/cluster.lock
//! clusters/<name>/plans/<plan_id>.json
//! clusters/<name>/plans/<plan_id>.json.sha256
//! clusters/<name>/state/<state_id>.json
//! clusters/<name>/state/<state_id>-checkpoints/<checkpoint_id>.json
//! ```
//!
//! Every mutation goes through [`write_atomic`]: a temp-file write followed
//! by a rename, so a partially written document is never observable.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Resolves paths inside the storage tree.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a layout at the default root, `~/.mup/storage`.
    pub fn with_default_root() -> Self {
        Self::new(default_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clusters_dir(&self) -> PathBuf {
        self.root.join("clusters")
    }

    pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.clusters_dir().join(cluster)
    }

    pub fn meta_path(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("meta.yaml")
    }

    pub fn lock_path(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("cluster.lock")
    }

    pub fn plans_dir(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("plans")
    }

    pub fn plan_path(&self, cluster: &str, plan_id: &str) -> PathBuf {
        self.plans_dir(cluster).join(format!("{plan_id}.json"))
    }

    pub fn checksum_path(&self, cluster: &str, plan_id: &str) -> PathBuf {
        self.plans_dir(cluster).join(format!("{plan_id}.json.sha256"))
    }

    pub fn state_dir(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("state")
    }

    pub fn state_path(&self, cluster: &str, state_id: &str) -> PathBuf {
        self.state_dir(cluster).join(format!("{state_id}.json"))
    }

    pub fn checkpoints_dir(&self, cluster: &str, state_id: &str) -> PathBuf {
        self.state_dir(cluster).join(format!("{state_id}-checkpoints"))
    }

    pub fn checkpoint_path(&self, cluster: &str, state_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir(cluster, state_id)
            .join(format!("{checkpoint_id}.json"))
    }

    /// Create the directory skeleton for a cluster.
    pub fn ensure_cluster_dirs(&self, cluster: &str) -> Result<()> {
        fs::create_dir_all(self.plans_dir(cluster))
            .context("Failed to create plans directory")?;
        fs::create_dir_all(self.state_dir(cluster))
            .context("Failed to create state directory")?;
        Ok(())
    }

    /// Names of every cluster that has a directory under the root.
    pub fn list_clusters(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.clusters_dir()) else {
            return Vec::new();
        };
        let mut clusters: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        clusters.sort();
        clusters
    }
}

/// Default storage root: `~/.mup/storage`, falling back to the current
/// directory when no home is available.
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mup")
        .join("storage")
}

/// Write bytes to `path` via temp-file + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Generate a time-sortable unique id: `<prefix>-<yyyymmddHHMMSS>-<uuid4[..8]>`.
///
/// Lexicographic order equals creation order at second granularity; the
/// uuid suffix disambiguates ids minted within the same second.
pub fn time_sortable_id(prefix: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{stamp}-{}", &suffix[..8])
}
