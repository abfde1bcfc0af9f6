mod config;
mod error;
mod frame;
mod message;
mod result;
mod value;

pub use config::{Command, EntryPoint, PatchConfig, ENTRY_POINT_FORMAT};
pub use error::{ErrorKind, PatchError};
pub use frame::{encode_frame, FrameDecoder};
pub use message::{CallbackTarget, ErrorRecord, OutMessage, Request};
pub use result::PatchResult;
pub use value::Value;

/// Terminates every frame on the control channel.
pub const FRAME_SENTINEL: char = '\u{FFFF}';

/// Suffix appended to a module path to name its backup.
pub const DEFAULT_BACKUP_TAG: &str = ".injector_backup";

/// How long a nested call into the host may stay unanswered.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Callback type announced for context accessor calls.
pub const CONTEXT_CALLBACK_KIND: &str = "context";

pub const IPC_BINARY_NAME: &str = "injector-ipc";
