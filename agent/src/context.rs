use std::path::PathBuf;

use async_trait::async_trait;
use protocol::PatchError;

/// Accessors for host-owned settings the engine needs mid-operation.
#[async_trait]
pub trait HostContext: Send + Sync {
    async fn data_path(&self) -> Result<PathBuf, PatchError>;
    async fn mods_path(&self) -> Result<PathBuf, PatchError>;
    async fn mod_loader_path(&self) -> Result<PathBuf, PatchError>;
    async fn dependencies_path(&self) -> Result<PathBuf, PatchError>;
    async fn extension_path(&self) -> Result<PathBuf, PatchError>;
    async fn is_deployment_required(&self) -> Result<bool, PatchError>;
    async fn app_version(&self) -> Result<String, PatchError>;
    async fn game_version(&self) -> Result<String, PatchError>;
}

/// Context whose answers are known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    pub data_path: PathBuf,
    pub mods_path: PathBuf,
    pub mod_loader_path: PathBuf,
    pub dependencies_path: PathBuf,
    pub extension_path: PathBuf,
    pub deployment_required: bool,
    pub app_version: String,
    pub game_version: String,
}

impl StaticContext {
    /// Everything lives in `data_path` except the files to deploy.
    pub fn new(data_path: impl Into<PathBuf>, dependencies_path: impl Into<PathBuf>) -> Self {
        let data_path = data_path.into();
        Self {
            mods_path: data_path.join("Mods"),
            mod_loader_path: data_path.clone(),
            data_path,
            dependencies_path: dependencies_path.into(),
            deployment_required: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl HostContext for StaticContext {
    async fn data_path(&self) -> Result<PathBuf, PatchError> {
        Ok(self.data_path.clone())
    }

    async fn mods_path(&self) -> Result<PathBuf, PatchError> {
        Ok(self.mods_path.clone())
    }

    async fn mod_loader_path(&self) -> Result<PathBuf, PatchError> {
        Ok(self.mod_loader_path.clone())
    }

    async fn dependencies_path(&self) -> Result<PathBuf, PatchError> {
        Ok(self.dependencies_path.clone())
    }

    async fn extension_path(&self) -> Result<PathBuf, PatchError> {
        Ok(self.extension_path.clone())
    }

    async fn is_deployment_required(&self) -> Result<bool, PatchError> {
        Ok(self.deployment_required)
    }

    async fn app_version(&self) -> Result<String, PatchError> {
        Ok(self.app_version.clone())
    }

    async fn game_version(&self) -> Result<String, PatchError> {
        Ok(self.game_version.clone())
    }
}
