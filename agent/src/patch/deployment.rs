use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use protocol::{PatchConfig, PatchError, PatchResult};
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::config::EngineConfig;
use crate::context::HostContext;

/// Files a composite patch puts in place before injecting, and takes away
/// again on removal.
#[async_trait]
pub trait Deployment: Send + Sync {
    async fn deploy(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError>;
    async fn purge(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError>;
}

/// Copies the mod loader's support libraries next to the game.
pub struct DependencyDeployment {
    files: Vec<String>,
    backups: BackupStore,
}

impl DependencyDeployment {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            files: config.dependency_files.clone(),
            backups: BackupStore::new(config.backup_tag.clone()),
        }
    }

    fn listed_files(&self, dir: &Path) -> Result<Vec<PathBuf>, PatchError> {
        let entries = fs::read_dir(dir).map_err(|err| PatchError::io_at(dir, err))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| self.files.iter().any(|f| f == name))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Deployment for DependencyDeployment {
    async fn deploy(&self, _config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let data_path = ctx.data_path().await?;
        if !data_path.is_dir() {
            return Err(PatchError::MissingFile(format!(
                "Datapath {} does not exist",
                data_path.display()
            )));
        }

        let mods_path = ctx.mods_path().await?;
        fs::create_dir_all(&mods_path).map_err(|err| PatchError::io_at(&mods_path, err))?;

        let libraries = ctx.dependencies_path().await?;
        let mod_loader_path = ctx.mod_loader_path().await?;
        let mut copied = 0usize;
        for file in self.listed_files(&libraries)? {
            let Some(name) = file.file_name() else {
                continue;
            };
            let destination = mod_loader_path.join(name);
            if destination.exists() {
                debug!(file = %destination.display(), "already deployed");
                continue;
            }

            fs::copy(&file, &destination).map_err(|err| PatchError::io_at(&destination, err))?;
            copied += 1;
        }

        info!(copied, destination = %mod_loader_path.display(), "deployed dependencies");
        Ok(PatchResult::success("Dependencies deployed").with_extra("copied", copied as f64))
    }

    async fn purge(&self, _config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let mod_loader_path = ctx.mod_loader_path().await?;
        let data_path = ctx.data_path().await?;
        let mut dirs = vec![mod_loader_path];
        if !dirs.contains(&data_path) {
            dirs.push(data_path);
        }

        let mut removed = 0usize;
        for dir in dirs.iter().filter(|dir| dir.is_dir()) {
            for file in self.listed_files(dir)? {
                if !self.backups.restore_if_present(&file)? {
                    fs::remove_file(&file).map_err(|err| PatchError::io_at(&file, err))?;
                }
                removed += 1;
            }
        }
        info!(removed, "purged dependencies");
        Ok(PatchResult::success("Dependencies purged"))
    }
}

/// Copies the in-game UI bundle into the mod loader's bundle directory.
pub struct BundleDeployment {
    bundle_name: String,
    bundle_dir: String,
}

impl BundleDeployment {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            bundle_name: config.ui_bundle_name.clone(),
            bundle_dir: config.bundle_dir.clone(),
        }
    }
}

#[async_trait]
impl Deployment for BundleDeployment {
    async fn deploy(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let extension_path = match &config.extension_path {
            Some(path) => path.clone(),
            None => ctx.extension_path().await?,
        };
        let destination = ctx.mod_loader_path().await?.join(&self.bundle_dir).join("UI");
        fs::create_dir_all(&destination).map_err(|err| PatchError::io_at(&destination, err))?;

        let mut deployed = 0usize;
        let mut last_error = None;
        for name in [self.bundle_name.clone(), format!("{}.manifest", self.bundle_name)] {
            let from = extension_path.join(&name);
            let to = destination.join(&name);
            match fs::copy(&from, &to) {
                Ok(_) => deployed += 1,
                Err(err) => {
                    warn!(file = %from.display(), "failed to deploy bundle file: {err}");
                    last_error = Some(PatchError::io_at(&from, err));
                }
            }
        }

        match (deployed, last_error) {
            (0, Some(err)) => Err(err),
            _ => Ok(PatchResult::success("UI bundle deployed")),
        }
    }

    async fn purge(&self, _config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        let bundles = ctx.mod_loader_path().await?.join(&self.bundle_dir);
        if bundles.exists() {
            fs::remove_dir_all(&bundles).map_err(|err| PatchError::io_at(&bundles, err))?;
        }
        Ok(PatchResult::success("UI bundle purged"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticContext;
    use protocol::{Command, EntryPoint};

    fn config() -> PatchConfig {
        PatchConfig::new(
            Command::DeployDependencies,
            EntryPoint::new("Acme.dll", "Acme.Loader", "Start"),
            vec![EntryPoint::new("Game.dll", "Game.Boot", "Main")],
        )
    }

    fn context(root: &Path) -> StaticContext {
        let data = root.join("Managed");
        let libs = root.join("libs");
        fs::create_dir_all(&data).expect("create data");
        fs::create_dir_all(&libs).expect("create libs");
        StaticContext::new(data, libs)
    }

    #[tokio::test]
    async fn deploys_only_listed_missing_files() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let ctx = context(dir.path());
        fs::write(ctx.dependencies_path.join("0Harmony.dll"), b"harmony").expect("write");
        fs::write(ctx.dependencies_path.join("ModLoader.dll"), b"loader").expect("write");
        fs::write(ctx.dependencies_path.join("unrelated.dll"), b"x").expect("write");
        fs::write(ctx.data_path.join("ModLoader.dll"), b"existing").expect("write");
        let deployment = DependencyDeployment::new(&EngineConfig::default());

        let result = deployment.deploy(&config(), &ctx).await.expect("deploy");
        assert!(result.result);

        assert_eq!(fs::read(ctx.data_path.join("0Harmony.dll")).expect("read"), b"harmony");
        assert_eq!(fs::read(ctx.data_path.join("ModLoader.dll")).expect("read"), b"existing");
        assert!(!ctx.data_path.join("unrelated.dll").exists());
        assert!(ctx.mods_path.is_dir());
    }

    #[tokio::test]
    async fn deploy_requires_data_path() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let ctx = StaticContext::new(dir.path().join("missing"), dir.path());

        let err = DependencyDeployment::new(&EngineConfig::default())
            .deploy(&config(), &ctx)
            .await
            .expect_err("missing data path");
        assert!(matches!(err, PatchError::MissingFile(_)));
    }

    #[tokio::test]
    async fn purge_restores_backups_or_deletes() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let ctx = context(dir.path());
        let engine = EngineConfig::default();
        let backups = BackupStore::new(engine.backup_tag.clone());

        let harmony = ctx.data_path.join("0Harmony.dll");
        fs::write(&harmony, b"shipped").expect("write");
        backups.backup(&harmony, false).expect("backup");
        fs::write(&harmony, b"ours").expect("write");
        fs::write(ctx.data_path.join("ModLoader.dll"), b"loader").expect("write");

        DependencyDeployment::new(&engine)
            .purge(&config(), &ctx)
            .await
            .expect("purge");

        assert_eq!(fs::read(&harmony).expect("read"), b"shipped");
        assert!(!ctx.data_path.join("ModLoader.dll").exists());
    }

    #[tokio::test]
    async fn purge_clears_separate_mod_loader_directory() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let mut ctx = context(dir.path());
        ctx.mod_loader_path = dir.path().join("loader");
        fs::create_dir_all(&ctx.mod_loader_path).expect("create loader dir");
        fs::write(ctx.dependencies_path.join("0Harmony.dll"), b"harmony").expect("write");
        fs::write(ctx.data_path.join("ModLoader.dll"), b"stale").expect("write");
        let deployment = DependencyDeployment::new(&EngineConfig::default());

        deployment.deploy(&config(), &ctx).await.expect("deploy");
        let deployed = ctx.mod_loader_path.join("0Harmony.dll");
        assert!(deployed.exists());
        assert!(!ctx.data_path.join("0Harmony.dll").exists());

        deployment.purge(&config(), &ctx).await.expect("purge");
        assert!(!deployed.exists());
        assert!(!ctx.data_path.join("ModLoader.dll").exists());
    }

    #[tokio::test]
    async fn bundle_round_trip() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let mut ctx = context(dir.path());
        ctx.extension_path = dir.path().join("ext");
        fs::create_dir_all(&ctx.extension_path).expect("create ext");
        fs::write(ctx.extension_path.join("modui"), b"bundle").expect("write");
        let deployment = BundleDeployment::new(&EngineConfig::default());

        let result = deployment.deploy(&config(), &ctx).await.expect("deploy");
        assert!(result.result);
        let bundle_dir = ctx.mod_loader_path.join("ModBundles");
        assert!(bundle_dir.join("UI").join("modui").exists());

        deployment.purge(&config(), &ctx).await.expect("purge");
        assert!(!bundle_dir.exists());
    }

    #[tokio::test]
    async fn bundle_without_files_fails() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let mut ctx = context(dir.path());
        ctx.extension_path = dir.path().join("ext");

        let err = BundleDeployment::new(&EngineConfig::default())
            .deploy(&config(), &ctx)
            .await
            .expect_err("nothing to deploy");
        assert!(matches!(err, PatchError::MissingFile(_)));
    }
}
