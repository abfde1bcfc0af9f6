use std::path::Path;

use async_trait::async_trait;
use protocol::{EntryPoint, PatchConfig, PatchError, PatchResult, ENTRY_POINT_FORMAT};
use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::config::EngineConfig;
use crate::context::HostContext;
use crate::entry_point;
use crate::module::{store, Instruction, LoadedModule, Module, OpCode, Resolver};
use crate::patch::{failed, with_descriptors, Patch};

/// Inserts a call to the source entry point at the start of every target
/// method, and takes it out again.
#[derive(Debug, Clone)]
pub struct Injector {
    backups: BackupStore,
}

impl Injector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            backups: BackupStore::new(config.backup_tag.clone()),
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// True when the target method already calls something whose descriptor
    /// contains the source's `Type::Method`.
    // Substring match on the textual operand. Two methods sharing a
    // `Type::Method` suffix in different modules are indistinguishable here.
    pub fn is_injected(module: &Module, source: &EntryPoint, target: &EntryPoint) -> Result<bool, PatchError> {
        let method = entry_point::resolve(module, target)?;
        Ok(find_injected_call(method.instructions(), source).is_some())
    }

    async fn check_applicable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        config.validate()?;
        let data_path = ctx.data_path().await?;
        let mod_loader_path = ctx.mod_loader_path().await?;

        let source = load_entry(&config.source, "source")?;

        let mut already_injected = Vec::new();
        for target in &config.targets {
            let loaded = load_entry(target, "target")?;
            Resolver::for_target(target, &data_path, &mod_loader_path).resolve_references(&source)?;

            if Self::is_injected(&loaded, &config.source, target)? {
                already_injected.push(target.describe());
            }
        }

        let result = if already_injected.len() == config.targets.len() {
            PatchResult::success(format!("{} is already injected", already_injected.join(", ")))
                .with_extra("alreadyInjected", true)
        } else {
            PatchResult::success("Patch is applicable")
        };
        Ok(with_descriptors(result, config))
    }

    async fn try_apply(&self, config: &PatchConfig, ctx: &dyn HostContext) -> Result<PatchResult, PatchError> {
        config.validate()?;
        let data_path = ctx.data_path().await?;
        let mod_loader_path = ctx.mod_loader_path().await?;
        let source = load_entry(&config.source, "source")?;

        for target in &config.targets {
            let resolver = Resolver::for_target(target, &data_path, &mod_loader_path);
            self.apply_target(&source, &config.source, target, &resolver)?;
        }

        Ok(with_descriptors(PatchResult::success("Patch applied"), config))
    }

    fn apply_target(
        &self,
        source_module: &Module,
        source: &EntryPoint,
        target: &EntryPoint,
        resolver: &Resolver,
    ) -> Result<(), PatchError> {
        let path = target.module_path.as_path();
        let mut loaded = store::load(path, true)?;
        let injected = Self::is_injected(&loaded.module, source, target);
        if injected.map_err(|err| entry_error(err, target, "target"))? {
            info!(target = %target.describe(), "already injected, skipping");
            return Ok(());
        }

        self.backups.backup(path, true)?;
        let outcome = inject(&mut loaded, source_module, source, target, resolver).and_then(|()| loaded.save());
        if let Err(err) = outcome {
            warn!(target = %target.describe(), "injection failed, restoring backup: {err}");
            if let Err(restore_err) = self.recover(&loaded) {
                warn!(path = %path.display(), "failed to restore backup: {restore_err}");
            }
            return Err(err);
        }

        info!(target = %target.describe(), source = %source, "injected entry point");
        Ok(())
    }

    fn try_remove(&self, config: &PatchConfig) -> Result<PatchResult, PatchError> {
        config.validate()?;
        for target in &config.targets {
            self.remove_target(&config.source, target)?;
        }
        Ok(with_descriptors(PatchResult::success("Patch removed"), config))
    }

    fn remove_target(&self, source: &EntryPoint, target: &EntryPoint) -> Result<(), PatchError> {
        let path = target.module_path.as_path();
        let mut loaded = store::load(path, true)?;

        let method = entry_point::resolve(&loaded.module, target)
            .map_err(|err| entry_error(err, target, "target"))?;
        let body = method.instructions();
        let Some(index) = find_injected_call(body, source) else {
            info!(target = %target.describe(), "not injected, nothing to remove");
            return Ok(());
        };
        let payload = source.payload();
        let start = if index > 0 && !payload.is_empty() && body[index - 1] == Instruction::ldstr(payload) {
            index - 1
        } else {
            index
        };

        let removed = loaded.remove_instructions(target, start..index + 1)?;
        if let Some(reference) = removed.last().and_then(Instruction::method_operand) {
            loaded.module.prune_reference(&reference.module);
        }

        if let Err(err) = loaded.save() {
            warn!(target = %target.describe(), "removal failed, putting original back: {err}");
            self.recover(&loaded)?;
            return Err(err);
        }

        match self.backups.discard_if_identical(path) {
            Ok(true) => info!(path = %path.display(), "dropped backup matching restored module"),
            Ok(false) => {}
            Err(err) => warn!(path = %path.display(), "failed to inspect backup: {err}"),
        }
        info!(target = %target.describe(), source = %source, "removed injected call");
        Ok(())
    }

    /// Puts a module back after a failed write: from its backup when there
    /// is one, otherwise from the scratch copy taken at load.
    fn recover(&self, loaded: &LoadedModule) -> Result<(), PatchError> {
        if self.backups.has_backup(loaded.path()) {
            self.backups.restore(loaded.path())
        } else {
            loaded.restore_original()
        }
    }

    fn check_applied(&self, config: &PatchConfig) -> Result<PatchResult, PatchError> {
        config.validate()?;
        for target in &config.targets {
            let module = load_entry(target, "target")?;
            if !Self::is_injected(&module, &config.source, target)? {
                return Ok(PatchResult::failure(format!("{} is not injected", target.describe())));
            }
        }
        Ok(with_descriptors(PatchResult::success("Patch is applied"), config))
    }
}

#[async_trait]
impl Patch for Injector {
    async fn is_applicable(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        self.check_applicable(config, ctx)
            .await
            .unwrap_or_else(|err| failed("is_applicable", &err))
    }

    async fn apply(&self, config: &PatchConfig, ctx: &dyn HostContext) -> PatchResult {
        self.try_apply(config, ctx)
            .await
            .unwrap_or_else(|err| failed("apply", &err))
    }

    async fn remove(&self, config: &PatchConfig, _ctx: &dyn HostContext) -> PatchResult {
        self.try_remove(config)
            .unwrap_or_else(|err| failed("remove", &err))
    }

    async fn is_applied(&self, config: &PatchConfig, _ctx: &dyn HostContext) -> PatchResult {
        self.check_applied(config)
            .unwrap_or_else(|err| failed("is_applied", &err))
    }
}

fn find_injected_call(instructions: &[Instruction], source: &EntryPoint) -> Option<usize> {
    let needle = source.to_string();
    instructions
        .iter()
        .position(|i| i.opcode == OpCode::Call && i.operand.to_string().contains(&needle))
}

fn inject(
    loaded: &mut LoadedModule,
    source_module: &Module,
    source: &EntryPoint,
    target: &EntryPoint,
    resolver: &Resolver,
) -> Result<(), PatchError> {
    resolver.resolve_references(source_module)?;
    let source_method = entry_point::resolve(source_module, source)?;
    let reference = loaded.module.import_method(source_module, &source.type_name, source_method);
    loaded.insert_call(target, reference, source.payload())
}

/// Rewords a failed lookup so it names the entry point and its role.
fn entry_error(err: PatchError, entry: &EntryPoint, role: &str) -> PatchError {
    match err {
        PatchError::InvalidEntryPoint(_) => PatchError::InvalidEntryPoint(format!(
            "Unable to find {} {role} entry point. Expected format is {ENTRY_POINT_FORMAT}",
            entry.describe()
        )),
        other => other,
    }
}

/// Loads the module behind `entry` read-only and checks the entry point
/// resolves inside it.
fn load_entry(entry: &EntryPoint, role: &str) -> Result<Module, PatchError> {
    let path: &Path = &entry.module_path;
    if !path.exists() {
        return Err(PatchError::missing_file(path));
    }

    let loaded = store::load(path, false)?;
    entry_point::resolve(&loaded.module, entry).map_err(|err| entry_error(err, entry, role))?;
    Ok(loaded.module)
}
