use std::path::{Path, PathBuf};

use protocol::{EntryPoint, PatchError};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{store, Module, ModuleRef};

const DIRECT_EXTENSIONS: [&str; 2] = ["dll", "exe"];

/// Resolves module references against an ordered list of directories.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    search_paths: Vec<PathBuf>,
}

impl Resolver {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut search_paths: Vec<PathBuf> = Vec::new();
        for path in paths {
            if !path.as_os_str().is_empty() && !search_paths.contains(&path) {
                search_paths.push(path);
            }
        }
        Self { search_paths }
    }

    /// Search order for a target: its own dependency directory, the data
    /// path, then the mod loader directory.
    pub fn for_target(target: &EntryPoint, data_path: &Path, mod_loader_path: &Path) -> Self {
        Self::new([
            target.dependency_dir(),
            data_path.to_path_buf(),
            mod_loader_path.to_path_buf(),
        ])
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn resolve(&self, reference: &ModuleRef) -> Result<Module, PatchError> {
        self.lookup(reference)
            .or_else(|| self.scan(reference))
            .ok_or_else(|| {
                PatchError::UnresolvedDependency(format!(
                    "Unable to resolve {} {}",
                    reference.name, reference.version
                ))
            })
    }

    /// Resolves every reference of `module`, stopping at the first failure.
    pub fn resolve_references(&self, module: &Module) -> Result<Vec<Module>, PatchError> {
        module.references.iter().map(|r| self.resolve(r)).collect()
    }

    fn lookup(&self, reference: &ModuleRef) -> Option<Module> {
        self.search_paths
            .iter()
            .flat_map(|dir| DIRECT_EXTENSIONS.iter().map(move |ext| dir.join(format!("{}.{ext}", reference.name))))
            .filter(|candidate| candidate.is_file())
            .filter_map(|candidate| read_candidate(&candidate))
            .find(|module| module.name == reference.name)
    }

    fn scan(&self, reference: &ModuleRef) -> Option<Module> {
        let mut candidates: Vec<PathBuf> = self
            .search_paths
            .iter()
            .filter(|dir| dir.is_dir())
            .flat_map(|dir| {
                WalkDir::new(dir)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_scan_match(path, &reference.name))
            .collect();
        candidates.sort();
        candidates.dedup();
        debug!(reference = %reference.name, candidates = candidates.len(), "scanning for module");

        let modules: Vec<Module> = candidates.iter().filter_map(|path| read_candidate(path)).collect();
        let exact = modules.iter().position(|module| module.name == reference.name);
        match exact {
            Some(index) => modules.into_iter().nth(index),
            None => modules.into_iter().next(),
        }
    }
}

fn is_scan_match(path: &Path, name: &str) -> bool {
    let is_dll = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"));
    let contains_name = path
        .file_name()
        .and_then(|file| file.to_str())
        .is_some_and(|file| file.contains(name));
    is_dll && contains_name
}

fn read_candidate(path: &Path) -> Option<Module> {
    match store::read_module(path) {
        Ok(module) => Some(module),
        Err(err) => {
            warn!(path = %path.display(), "skipping unreadable module: {err}");
            None
        }
    }
}
