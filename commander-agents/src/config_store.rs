//! YAML file per node holding its last persisted engine settings.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use commander_core::{EngineSettings, LifecycleError};

use crate::lifecycle::EngineConfigStore;

/// Stores `<dir>/<node_id>.engine.yaml`, replaced atomically via rename.
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, node_id: &str) -> PathBuf {
        let safe: String = node_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.engine.yaml"))
    }
}

fn persist_failed(node_id: &str, reason: impl ToString) -> LifecycleError {
    LifecycleError::ConfigPersistFailed {
        node_id: node_id.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl EngineConfigStore for FileConfigStore {
    async fn persist(&self, node_id: &str, settings: &EngineSettings) -> Result<(), LifecycleError> {
        let yaml = serde_yaml::to_string(settings).map_err(|e| persist_failed(node_id, e))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| persist_failed(node_id, e))?;

        let path = self.path_for(node_id);
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| persist_failed(node_id, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persist_failed(node_id, e))?;

        tracing::debug!(node_id = %node_id, path = %path.display(), "Engine settings persisted");
        Ok(())
    }

    async fn load(&self, node_id: &str) -> Result<Option<EngineSettings>, LifecycleError> {
        let path = self.path_for(node_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persist_failed(node_id, e)),
        };
        serde_yaml::from_str(&text)
            .map(Some)
            .map_err(|e| persist_failed(node_id, format!("{}: {e}", path.display())))
    }
}
