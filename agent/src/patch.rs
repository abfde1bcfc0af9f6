use std::sync::Arc;

use async_trait::async_trait;
use protocol::{PatchConfig, PatchError, PatchResult, Value};
use tracing::warn;

use crate::config::EngineConfig;
use crate::context::HostContext;
use crate::injector::Injector;
use composite::CompositePatch;
use deployment::{BundleDeployment, DependencyDeployment};
use reflection::{HttpReplacementSource, ReflectionPatch, ReplacementSource};

pub mod composite;
pub mod deployment;
pub mod reflection;

/// The four operations every patch answers. None of them fail: errors are
/// reported through the returned result.
#[async_trait]
pub trait Patch: Send + Sync {
    async fn is_applicable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult;
    async fn apply(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult;
    async fn remove(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult;
    async fn is_applied(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult;
}

/// Every patch a session can route commands to.
pub struct PatchSet {
    pub injector: Arc<Injector>,
    pub reflection: Arc<ReflectionPatch>,
    pub mod_loader: CompositePatch,
    pub ui_bundle: CompositePatch,
}

impl PatchSet {
    /// Attempts to build the patch set, downloading runtime replacements from
    /// the configured base URL.
    pub fn new(config: &EngineConfig) -> Result<Self, PatchError> {
        let source = HttpReplacementSource::new(config.replacement_base_url.clone())?;
        Ok(Self::with_replacements(config, Arc::new(source)))
    }

    pub fn with_replacements(config: &EngineConfig, replacements: Arc<dyn ReplacementSource>) -> Self {
        let injector = Arc::new(Injector::new(config));
        let reflection = Arc::new(ReflectionPatch::new(config, replacements));

        Self {
            mod_loader: CompositePatch::new(
                "mod loader",
                reflection.clone(),
                Box::new(DependencyDeployment::new(config)),
                injector.clone(),
            ),
            ui_bundle: CompositePatch::new(
                "ui bundle",
                reflection.clone(),
                Box::new(BundleDeployment::new(config)),
                injector.clone(),
            ),
            injector,
            reflection,
        }
    }
}

pub(crate) fn with_descriptors(result: PatchResult, config: &PatchConfig) -> PatchResult {
    let targets = config
        .target_descriptors()
        .into_iter()
        .map(Value::String)
        .collect::<Vec<_>>();
    result
        .with_extra("source", config.source.to_string())
        .with_extra("targets", targets)
}

pub(crate) fn failed(operation: &str, err: &PatchError) -> PatchResult {
    warn!(operation, kind = %err.kind(), "patch operation failed: {err}");
    PatchResult::from_error(err)
}
