use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ErrorKind, PatchError, Value};

const RESERVED_KEYS: [&str; 2] = ["result", "message"];
const ERROR_KIND_KEY: &str = "errorKind";

/// Outcome of every patch operation. Failures travel as data, never as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct PatchResult {
    pub result: bool,
    pub message: String,
    extra: BTreeMap<String, Value>,
}

impl PatchResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            result: true,
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn from_error(err: &PatchError) -> Self {
        Self::failure(err.to_string()).with_extra(ERROR_KIND_KEY, err.kind().as_str())
    }

    /// Adds an auxiliary field. Keys that would shadow `result` or `message`
    /// are dropped.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.extra.insert(key, value.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.result
    }

    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.extra
            .get(ERROR_KIND_KEY)
            .and_then(Value::as_str)
            .and_then(ErrorKind::parse)
    }
}

impl From<PatchResult> for Value {
    fn from(value: PatchResult) -> Self {
        let mut map = value.extra;
        map.insert("result".to_string(), Value::Bool(value.result));
        map.insert("message".to_string(), Value::String(value.message));
        Value::Map(map)
    }
}

impl TryFrom<Value> for PatchResult {
    type Error = PatchError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Map(mut map) = value else {
            return Err(PatchError::InvalidArgument("Patch result must be a map".to_string()));
        };

        let result = map
            .remove("result")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| PatchError::InvalidArgument("Patch result lacks result".to_string()))?;
        let message = match map.remove("message") {
            Some(Value::String(message)) => message,
            _ => String::new(),
        };

        Ok(Self {
            result,
            message,
            extra: map,
        })
    }
}
