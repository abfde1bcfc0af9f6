use serde::{Deserialize, Serialize};

use crate::{Command, PatchError, Value};

/// Inbound envelope: `{id, payload: {command, ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        serde_json::from_str(text)
            .map_err(|err| PatchError::InvalidArgument(format!("Malformed request: {err}")))
    }

    pub fn command_name(&self) -> Option<&str> {
        self.payload.get("command").and_then(Value::as_str)
    }

    pub fn command(&self) -> Option<Command> {
        self.command_name().and_then(|name| name.parse().ok())
    }
}

/// Identifies which nested host object an outbound message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
}

impl From<&PatchError> for ErrorRecord {
    fn from(err: &PatchError) -> Self {
        Self {
            name: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outbound envelope: `{id, callback?, data?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl OutMessage {
    pub fn to_json_string(&self) -> Result<String, PatchError> {
        serde_json::to_string(self)
            .map_err(|err| PatchError::Unknown(format!("Failed to serialize message: {err}")))
    }
}
