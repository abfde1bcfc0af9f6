use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{PatchConfig, PatchError, PatchResult};
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::config::EngineConfig;
use crate::context::HostContext;
use crate::module::{store, Version};
use crate::patch::{failed, with_descriptors, Patch};

pub const SUPPORT_MODULE: &str = "mscorlib.dll";
pub const ENABLED_MESSAGE: &str = "Reflection is enabled";

const BUILDER_TYPE: &str = "System.Reflection.Emit.AssemblyBuilder";
const BUILDER_METHOD: &str = "DefineDynamicAssembly";
const DISABLED_MARKER: &str = "PlatformNotSupportedException";

/// Replacement runtime modules, one per supported major version.
pub const REPLACEMENTS: [&str; 3] = [
    "mscorlib.dll.2.0.50727.1433",
    "mscorlib.dll.3.0.40818.0",
    "mscorlib.dll.4.6.57.0",
];

/// Where replacement modules come from.
#[async_trait]
pub trait ReplacementSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, PatchError>;
}

pub struct HttpReplacementSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReplacementSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PatchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| PatchError::DownloadFailure(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl ReplacementSource for HttpReplacementSource {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, PatchError> {
        let url = format!("{}{name}", self.base_url);
        debug!(%url, "downloading replacement");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| PatchError::DownloadFailure(format!("Failed to download {url}: {err}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| PatchError::DownloadFailure(format!("Failed to download {url}: {err}")))?;
        Ok(bytes.to_vec())
    }
}

/// Swaps in a runtime support module that does not refuse dynamic code
/// generation.
pub struct ReflectionPatch {
    backups: BackupStore,
    replacements: Arc<dyn ReplacementSource>,
}

impl ReflectionPatch {
    pub fn new(config: &EngineConfig, replacements: Arc<dyn ReplacementSource>) -> Self {
        Self {
            backups: BackupStore::new(config.backup_tag.clone()),
            replacements,
        }
    }

    /// Inspects the support module in `data_path`. A missing module or one
    /// from an old runtime counts as enabled.
    pub fn is_enabled(&self, data_path: &Path) -> bool {
        let path = self.inspected_path(data_path);
        if !path.exists() {
            return true;
        }

        let module = match store::read_module(&path) {
            Ok(module) => module,
            Err(err) => {
                warn!(path = %path.display(), "unable to inspect support module: {err}");
                return false;
            }
        };
        if module.version.major <= 3 {
            return true;
        }

        let Some(method) = module.find_type(BUILDER_TYPE).and_then(|ty| {
            ty.methods
                .iter()
                .find(|m| m.name.contains(BUILDER_METHOD) && m.parameters.len() == 2)
        }) else {
            return false;
        };

        !method
            .instructions()
            .iter()
            .any(|i| i.to_string().contains(DISABLED_MARKER))
    }

    // A linked support module has already been swapped out. Its backup holds
    // the shipped one.
    fn inspected_path(&self, data_path: &Path) -> PathBuf {
        let path = data_path.join(SUPPORT_MODULE);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => self.backups.backup_path(&path),
            _ => path,
        }
    }

    async fn check_applicable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let data_path = ctx.data_path().await?;
        let result = if self.is_enabled(&data_path) {
            PatchResult::failure(ENABLED_MESSAGE)
        } else {
            PatchResult::success("Can be applied")
        };
        Ok(with_descriptors(result, config))
    }

    async fn enable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let data_path = ctx.data_path().await?;
        if self.is_enabled(&data_path) {
            return Ok(with_descriptors(PatchResult::success(ENABLED_MESSAGE), config));
        }

        let support = self.inspected_path(&data_path);
        let version = store::read_module(&support)?.version;
        let name = replacement_for(version).ok_or_else(|| {
            PatchError::UnhandledCapabilityVersion(format!("Unhandled mscorlib version {version}"))
        })?;
        let bytes = self.replacements.fetch(name).await?;

        let mod_loader_path = ctx.mod_loader_path().await?;
        if data_path == mod_loader_path {
            let staged = data_path.join(name);
            fs::write(&staged, &bytes).map_err(|err| PatchError::io_at(&staged, err))?;
            self.backups.replace_file(&data_path.join(SUPPORT_MODULE), &staged)?;
            if let Err(err) = fs::remove_file(&staged) {
                warn!(path = %staged.display(), "failed to remove staged replacement: {err}");
            }
        } else {
            fs::create_dir_all(&mod_loader_path).map_err(|err| PatchError::io_at(&mod_loader_path, err))?;
            let destination = mod_loader_path.join(SUPPORT_MODULE);
            fs::write(&destination, &bytes).map_err(|err| PatchError::io_at(&destination, err))?;
        }

        info!(replacement = name, "reflection enabled");
        Ok(with_descriptors(PatchResult::success("Reflection enabled"), config))
    }

    async fn disable(&self, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let data_path = ctx.data_path().await?;
        let restored = self.backups.restore_if_present(&data_path.join(SUPPORT_MODULE))?;
        Ok(PatchResult::success(if restored {
            "Reflection patch removed"
        } else {
            "Nothing to remove"
        }))
    }
}

#[async_trait]
impl Patch for ReflectionPatch {
    async fn is_applicable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        self.check_applicable(config, ctx)
            .await
            .unwrap_or_else(|err| failed("reflection is_applicable", &err))
    }

    async fn apply(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        self.enable(config, ctx)
            .await
            .unwrap_or_else(|err| failed("reflection apply", &err))
    }

    async fn remove(&self, _config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        self.disable(ctx)
            .await
            .unwrap_or_else(|err| failed("reflection remove", &err))
    }

    async fn is_applied(&self, _config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        match ctx.data_path().await {
            Ok(data_path) if self.is_enabled(&data_path) => PatchResult::success(ENABLED_MESSAGE),
            Ok(_) => PatchResult::failure("Reflection is disabled"),
            Err(err) => failed("reflection is_applied", &err),
        }
    }
}

fn replacement_for(version: Version) -> Option<&'static str> {
    let prefix = format!("{}.{}.", SUPPORT_MODULE, version.major);
    REPLACEMENTS.into_iter().find(|name| name.starts_with(&prefix))
}
