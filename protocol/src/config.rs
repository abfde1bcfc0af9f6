use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{PatchError, Value};

pub const ENTRY_POINT_FORMAT: &str = "Namespace.className::methodName";

/// A (module, type, method) triple naming either the injected method or the
/// method receiving the injected call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    pub module_path: PathBuf,
    #[serde(default)]
    pub dependency_path: Option<PathBuf>,
    pub type_name: String,
    pub method_name: String,
    #[serde(default)]
    pub payload: Option<String>,
}

impl EntryPoint {
    pub fn new(
        module_path: impl Into<PathBuf>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            dependency_path: None,
            type_name: type_name.into(),
            method_name: method_name.into(),
            payload: None,
        }
    }

    /// Builds an entry point from a `Namespace.Type::Method` descriptor.
    pub fn from_descriptor(
        module_path: impl Into<PathBuf>,
        descriptor: &str,
    ) -> Result<Self, PatchError> {
        let (type_name, method_name) = Self::parse_descriptor(descriptor)?;
        Ok(Self::new(module_path, type_name, method_name))
    }

    pub fn parse_descriptor(descriptor: &str) -> Result<(String, String), PatchError> {
        let invalid = || {
            PatchError::InvalidEntryPoint(format!(
                "Invalid entry point {descriptor}. Expected format is {ENTRY_POINT_FORMAT}"
            ))
        };

        let (type_name, method_name) = descriptor.trim().split_once("::").ok_or_else(invalid)?;
        if type_name.is_empty() || method_name.is_empty() || method_name.contains("::") {
            return Err(invalid());
        }

        Ok((type_name.to_string(), method_name.to_string()))
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_dependency_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dependency_path = Some(path.into());
        self
    }

    /// Directory searched first for this module's references. Falls back to
    /// the directory holding the module itself.
    pub fn dependency_dir(&self) -> PathBuf {
        match &self.dependency_path {
            Some(path) => path.clone(),
            None => self
                .module_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default(),
        }
    }

    pub fn payload(&self) -> &str {
        self.payload.as_deref().unwrap_or_default()
    }

    /// `<module path>_<Type::Method>`, used when reporting on a specific target.
    pub fn describe(&self) -> String {
        format!("{}_{}", self.module_path.display(), self)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.type_name, self.method_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    IsPatchApplicable,
    ApplyPatch,
    RemovePatch,
    IsPatchApplied,
    DeployDependencies,
    PurgeDependencies,
    EnableCapability,
    DisableCapability,
    DeployUiBundle,
    PurgeUiBundle,
    Invoke,
    Reply,
    Quit,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Self::IsPatchApplicable,
        Self::ApplyPatch,
        Self::RemovePatch,
        Self::IsPatchApplied,
        Self::DeployDependencies,
        Self::PurgeDependencies,
        Self::EnableCapability,
        Self::DisableCapability,
        Self::DeployUiBundle,
        Self::PurgeUiBundle,
        Self::Invoke,
        Self::Reply,
        Self::Quit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsPatchApplicable => "IsPatchApplicable",
            Self::ApplyPatch => "ApplyPatch",
            Self::RemovePatch => "RemovePatch",
            Self::IsPatchApplied => "IsPatchApplied",
            Self::DeployDependencies => "DeployDependencies",
            Self::PurgeDependencies => "PurgeDependencies",
            Self::EnableCapability => "EnableCapability",
            Self::DisableCapability => "DisableCapability",
            Self::DeployUiBundle => "DeployUiBundle",
            Self::PurgeUiBundle => "PurgeUiBundle",
            Self::Invoke => "Invoke",
            Self::Reply => "Reply",
            Self::Quit => "Quit",
        }
    }
}

impl FromStr for Command {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| PatchError::InvalidArgument(format!("Unknown command {s}")))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One patch request: a single source injected into every target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchConfig {
    pub command: Command,
    #[serde(default)]
    pub extension_path: Option<PathBuf>,
    pub source: EntryPoint,
    pub targets: Vec<EntryPoint>,
}

impl PatchConfig {
    pub fn new(command: Command, source: EntryPoint, targets: Vec<EntryPoint>) -> Self {
        Self {
            command,
            extension_path: None,
            source,
            targets,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, PatchError> {
        let config: PatchConfig = serde_json::from_value(value.to_json())
            .map_err(|err| PatchError::InvalidArgument(format!("Invalid patch config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PatchError> {
        if self.targets.is_empty() {
            return Err(PatchError::InvalidArgument(
                "Patch config requires at least one target".to_string(),
            ));
        }
        Ok(())
    }

    pub fn target_descriptors(&self) -> Vec<String> {
        self.targets.iter().map(EntryPoint::to_string).collect()
    }
}
