use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{CallbackTarget, PatchError, Value, CONTEXT_CALLBACK_KIND};

use super::Session;
use crate::context::HostContext;

/// Host accessors reachable over the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextCall {
    DataPath,
    ModsPath,
    ModLoaderPath,
    DependenciesPath,
    ExtensionPath,
    IsDeploymentRequired,
    AppVersion,
    GameVersion,
}

impl ContextCall {
    pub fn name(self) -> &'static str {
        match self {
            ContextCall::DataPath => "getDataPath",
            ContextCall::ModsPath => "getModsPath",
            ContextCall::ModLoaderPath => "getModLoaderPath",
            ContextCall::DependenciesPath => "getDependenciesPath",
            ContextCall::ExtensionPath => "getExtensionPath",
            ContextCall::IsDeploymentRequired => "isDeploymentRequired",
            ContextCall::AppVersion => "getAppVersion",
            ContextCall::GameVersion => "getGameVersion",
        }
    }
}

/// Answers context questions by asking the host, on behalf of one request.
pub struct ContextProxy {
    session: Arc<Session>,
    request_id: String,
}

impl ContextProxy {
    pub fn new(session: Arc<Session>, request_id: impl Into<String>) -> Self {
        Self {
            session,
            request_id: request_id.into(),
        }
    }

    async fn call(&self, accessor: ContextCall) -> Result<Value, PatchError> {
        let target = CallbackTarget {
            id: self.request_id.clone(),
            kind: CONTEXT_CALLBACK_KIND.to_string(),
        };
        let data = Value::map([
            ("name", Value::from(accessor.name())),
            ("args", Value::Array(Vec::new())),
        ]);
        self.session.pending.call(&self.session.outbox, target, data).await
    }

    async fn string(&self, accessor: ContextCall) -> Result<String, PatchError> {
        match self.call(accessor).await? {
            Value::String(s) => Ok(s),
            other => Err(PatchError::InvalidArgument(format!(
                "{} returned {other:?}, expected a string",
                accessor.name()
            ))),
        }
    }

    async fn path(&self, accessor: ContextCall) -> Result<PathBuf, PatchError> {
        self.string(accessor).await.map(PathBuf::from)
    }
}

#[async_trait]
impl HostContext for ContextProxy {
    async fn data_path(&self) -> Result<PathBuf, PatchError> {
        self.path(ContextCall::DataPath).await
    }

    async fn mods_path(&self) -> Result<PathBuf, PatchError> {
        self.path(ContextCall::ModsPath).await
    }

    async fn mod_loader_path(&self) -> Result<PathBuf, PatchError> {
        self.path(ContextCall::ModLoaderPath).await
    }

    async fn dependencies_path(&self) -> Result<PathBuf, PatchError> {
        self.path(ContextCall::DependenciesPath).await
    }

    async fn extension_path(&self) -> Result<PathBuf, PatchError> {
        self.path(ContextCall::ExtensionPath).await
    }

    async fn is_deployment_required(&self) -> Result<bool, PatchError> {
        match self.call(ContextCall::IsDeploymentRequired).await? {
            Value::Bool(required) => Ok(required),
            Value::String(s) => Ok(s.eq_ignore_ascii_case("true")),
            other => Err(PatchError::InvalidArgument(format!(
                "isDeploymentRequired returned {other:?}"
            ))),
        }
    }

    async fn app_version(&self) -> Result<String, PatchError> {
        self.string(ContextCall::AppVersion).await
    }

    async fn game_version(&self) -> Result<String, PatchError> {
        self.string(ContextCall::GameVersion).await
    }
}
