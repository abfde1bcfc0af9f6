use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PatchError {
    #[error("{0}")]
    MissingFile(String),
    #[error("{0}")]
    InvalidEntryPoint(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    FileOperation(String),
    #[error("{0}")]
    UnhandledCapabilityVersion(String),
    #[error("{0}")]
    DownloadFailure(String),
    #[error("{0}")]
    UnresolvedDependency(String),
    #[error("task timeout")]
    Timeout,
    #[error("{0}")]
    Unknown(String),
}

impl PatchError {
    pub fn missing_file(path: &Path) -> Self {
        Self::MissingFile(format!("{} does not exist", path.display()))
    }

    /// Attaches the offending path to an IO error. Not-found errors map onto
    /// `MissingFile`, anything else is a failed file operation.
    pub fn io_at(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::missing_file(path),
            _ => Self::FileOperation(format!("{}: {source}", path.display())),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingFile(_) => ErrorKind::MissingFile,
            Self::InvalidEntryPoint(_) => ErrorKind::InvalidEntryPoint,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::FileOperation(_) => ErrorKind::FileOperationError,
            Self::UnhandledCapabilityVersion(_) => ErrorKind::UnhandledCapabilityVersion,
            Self::DownloadFailure(_) => ErrorKind::DownloadFailure,
            Self::UnresolvedDependency(_) => ErrorKind::UnresolvedDependency,
            Self::Timeout => ErrorKind::Timeout,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MissingFile,
    InvalidEntryPoint,
    InvalidArgument,
    FileOperationError,
    UnhandledCapabilityVersion,
    DownloadFailure,
    UnresolvedDependency,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        Self::MissingFile,
        Self::InvalidEntryPoint,
        Self::InvalidArgument,
        Self::FileOperationError,
        Self::UnhandledCapabilityVersion,
        Self::DownloadFailure,
        Self::UnresolvedDependency,
        Self::Timeout,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingFile => "MissingFile",
            Self::InvalidEntryPoint => "InvalidEntryPoint",
            Self::InvalidArgument => "InvalidArgument",
            Self::FileOperationError => "FileOperationError",
            Self::UnhandledCapabilityVersion => "UnhandledCapabilityVersion",
            Self::DownloadFailure => "DownloadFailure",
            Self::UnresolvedDependency => "UnresolvedDependency",
            Self::Timeout => "Timeout",
            Self::Unknown => "Unknown",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Process exit code reported by the standalone binaries.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::InvalidEntryPoint => 1,
            Self::MissingFile => 2,
            Self::InvalidArgument => 3,
            Self::FileOperationError => 4,
            Self::UnhandledCapabilityVersion => 5,
            Self::DownloadFailure => 6,
            Self::UnresolvedDependency => 7,
            Self::Timeout => 8,
            Self::Unknown => 13,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
