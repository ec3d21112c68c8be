//! The per-container state record. External `ps`-style tooling enumerates
//! the record directory and correlates each file with a live `/proc/<pid>`;
//! the engine only writes one record on start and removes it on shutdown.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{getuid, Pid};
use serde::{Deserialize, Serialize};

use crate::oci::Annotations;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub pid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
}

impl StateRecord {
    pub fn new(container_id: &str, pid: Pid, annotations: Option<&Annotations>) -> Self {
        Self {
            container_id: container_id.to_string(),
            pid: pid.as_raw(),
            app: annotations.and_then(|a| a.app.clone()),
            base: annotations.and_then(|a| a.base.clone()),
            runtime: annotations.and_then(|a| a.runtime.clone()),
            extensions: annotations.and_then(|a| a.extensions.clone()),
        }
    }

    /// Writes the record under `base_dir` and returns a guard that removes
    /// it again when dropped.
    pub fn save(&self, base_dir: &Path) -> Result<StateFileGuard> {
        fs::create_dir_all(base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;

        let path = base_dir.join(format!("{}.json", self.container_id));
        let file = fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(StateFileGuard { path })
    }
}

/// The per-user record directory, `/run/user/<uid>/linglong/box`.
pub fn default_state_dir() -> PathBuf {
    PathBuf::from(format!("/run/user/{}/linglong/box", getuid()))
}

/// Owns the on-disk record; dropping it removes the file.
pub struct StateFileGuard {
    path: PathBuf,
}

impl Drop for StateFileGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::error!("remove {} failed: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::create_temp_dir;

    #[test]
    fn test_state_file_lifecycle() -> Result<()> {
        let dir = create_temp_dir("ll_box_state_lifecycle")?;
        let annotations = Annotations {
            app: Some("org.example.demo".to_string()),
            base: Some("org.deepin.base".to_string()),
            ..Default::default()
        };
        let record = StateRecord::new("c1", Pid::from_raw(4242), Some(&annotations));

        let path = dir.join("c1.json");
        {
            let _guard = record.save(dir.path())?;
            assert!(path.is_file());

            let content = fs::read_to_string(&path)?;
            let loaded: StateRecord = serde_json::from_str(&content)?;
            assert_eq!(loaded.container_id, "c1");
            assert_eq!(loaded.pid, 4242);
            assert_eq!(loaded.app.as_deref(), Some("org.example.demo"));
            assert_eq!(loaded.base.as_deref(), Some("org.deepin.base"));
            assert!(content.contains("containerID"));
        }
        // guard dropped: the record is gone
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_record_without_annotations() -> Result<()> {
        let dir = create_temp_dir("ll_box_state_bare")?;
        let record = StateRecord::new("c2", Pid::from_raw(7), None);
        let _guard = record.save(dir.path())?;

        let content = fs::read_to_string(dir.join("c2.json"))?;
        assert!(!content.contains("app"));
        Ok(())
    }
}
