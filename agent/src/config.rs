use std::path::Path;
use std::time::Duration;

use protocol::{PatchError, DEFAULT_BACKUP_TAG, DEFAULT_CALL_TIMEOUT_MS};
use serde::Deserialize;

pub const DEFAULT_REPLACEMENT_BASE_URL: &str =
    "https://raw.githubusercontent.com/injector-tools/runtime-replacements/master/";

/// Support files shipped alongside the mod loader.
pub const DEFAULT_DEPENDENCY_FILES: [&str; 5] = [
    "0Harmony.dll",
    "Mono.Cecil.dll",
    "Newtonsoft.Json.dll",
    "ModLoader.dll",
    "ModLoader.Shared.dll",
];

/// Settings shared by every request a process serves. Built once by the
/// binary and passed down, nothing in the engine reads globals.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub backup_tag: String,
    pub call_timeout_ms: u64,
    pub queue_capacity: usize,
    pub replacement_base_url: String,
    pub dependency_files: Vec<String>,
    pub ui_bundle_name: String,
    pub bundle_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_tag: DEFAULT_BACKUP_TAG.to_string(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            queue_capacity: 64,
            replacement_base_url: DEFAULT_REPLACEMENT_BASE_URL.to_string(),
            dependency_files: DEFAULT_DEPENDENCY_FILES.iter().map(|f| f.to_string()).collect(),
            ui_bundle_name: "modui".to_string(),
            bundle_dir: "ModBundles".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, PatchError> {
        let text = std::fs::read_to_string(path).map_err(|err| PatchError::io_at(path, err))?;
        serde_json::from_str(&text).map_err(|err| {
            PatchError::InvalidArgument(format!("Invalid config {}: {err}", path.display()))
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_replacement_base_url(mut self, url: impl Into<String>) -> Self {
        self.replacement_base_url = url.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"callTimeoutMs": 250, "bundleDir": "Bundles"}"#).expect("write config");

        let config = EngineConfig::load(&path).expect("load config");
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.bundle_dir, "Bundles");
        assert_eq!(config.backup_tag, DEFAULT_BACKUP_TAG);
        assert_eq!(config.dependency_files.len(), DEFAULT_DEPENDENCY_FILES.len());
    }

    #[test]
    fn malformed_file_is_invalid_argument() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{").expect("write config");

        let err = EngineConfig::load(&path).expect_err("malformed");
        assert!(matches!(err, PatchError::InvalidArgument(_)));
    }
}
