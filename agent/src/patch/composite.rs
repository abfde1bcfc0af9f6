use std::sync::Arc;

use async_trait::async_trait;
use protocol::{PatchConfig, PatchResult};
use tracing::{info, warn};

use crate::context::HostContext;
use crate::injector::Injector;
use crate::patch::deployment::Deployment;
use crate::patch::reflection::{ReflectionPatch, ENABLED_MESSAGE};
use crate::patch::{failed, Patch};

/// Enables reflection, deploys files, then injects. Each step only runs when
/// the previous one succeeded.
pub struct CompositePatch {
    name: &'static str,
    prerequisite: Arc<ReflectionPatch>,
    deployment: Box<dyn Deployment>,
    injector: Arc<Injector>,
}

impl CompositePatch {
    pub fn new(
        name: &'static str,
        prerequisite: Arc<ReflectionPatch>,
        deployment: Box<dyn Deployment>,
        injector: Arc<Injector>,
    ) -> Self {
        Self {
            name,
            prerequisite,
            deployment,
            injector,
        }
    }
}

#[async_trait]
impl Patch for CompositePatch {
    async fn is_applicable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        let prerequisite = self.prerequisite.is_applicable(config, ctx).await;
        if !prerequisite.result && prerequisite.message != ENABLED_MESSAGE {
            return prerequisite;
        }
        self.injector.is_applicable(config, ctx).await
    }

    async fn apply(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        let applicable = self.is_applicable(config, ctx).await;
        if !applicable.result {
            return applicable;
        }

        let prerequisite = self.prerequisite.apply(config, ctx).await;
        if !prerequisite.result {
            warn!(patch = self.name, "prerequisite failed: {}", prerequisite.message);
            return prerequisite;
        }

        match ctx.is_deployment_required().await {
            Ok(true) => match self.deployment.deploy(config, ctx).await {
                Ok(deployed) if deployed.result => {}
                Ok(deployed) => return deployed,
                Err(err) => return failed("deploy", &err),
            },
            Ok(false) => info!(patch = self.name, "host does not require deployment"),
            Err(err) => return failed("deploy", &err),
        }

        self.injector.apply(config, ctx).await
    }

    async fn remove(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        if let Err(err) = self.deployment.purge(config, ctx).await {
            warn!(patch = self.name, "ignoring purge failure: {err}");
        }
        self.injector.remove(config, ctx).await
    }

    async fn is_applied(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        self.injector.is_applied(config, ctx).await
    }
}
