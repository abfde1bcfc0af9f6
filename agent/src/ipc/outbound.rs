use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::{CallbackTarget, ErrorRecord, OutMessage, PatchError, PatchResult, Value};

pub type Callback = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, PatchError>> + Send + Sync>;

/// Reply data before it is written. Unlike [`Value`] it may carry functions,
/// which go out as `{"__callback": id}` tokens.
#[derive(Clone)]
pub enum Outbound {
    Value(Value),
    Callback(Callback),
    List(Vec<Outbound>),
    Record(BTreeMap<String, Outbound>),
}

impl Outbound {
    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PatchError>> + Send + 'static,
    {
        Outbound::Callback(Arc::new(move |args| Box::pin(f(args))))
    }

    /// Converts to JSON, moving every callback into `callbacks` under a
    /// fresh id.
    pub fn into_wire(self, callbacks: &mut HashMap<String, Callback>) -> serde_json::Value {
        match self {
            Outbound::Value(value) => value.to_json(),
            Outbound::Callback(callback) => {
                let id = uuid::Uuid::new_v4().to_string();
                callbacks.insert(id.clone(), callback);
                serde_json::json!({ "__callback": id })
            }
            Outbound::List(items) => {
                serde_json::Value::Array(items.into_iter().map(|item| item.into_wire(callbacks)).collect())
            }
            Outbound::Record(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(key, field)| (key, field.into_wire(callbacks)))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outbound::Callback(_) => f.write_str("Callback"),
            Outbound::List(items) => f.debug_tuple("List").field(items).finish(),
            Outbound::Record(fields) => f.debug_tuple("Record").field(fields).finish(),
        }
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Outbound::Value(value)
    }
}

impl From<PatchResult> for Outbound {
    fn from(result: PatchResult) -> Self {
        Outbound::Value(result.into())
    }
}

/// A message queued for the writer.
#[derive(Debug)]
pub struct Envelope {
    pub id: String,
    pub callback: Option<CallbackTarget>,
    pub data: Option<Outbound>,
    pub error: Option<ErrorRecord>,
}

impl Envelope {
    pub fn reply(id: impl Into<String>, data: impl Into<Outbound>) -> Self {
        Self {
            id: id.into(),
            callback: None,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, err: &PatchError) -> Self {
        Self {
            id: id.into(),
            callback: None,
            data: None,
            error: Some(ErrorRecord::from(err)),
        }
    }

    pub fn call(id: impl Into<String>, target: CallbackTarget, data: Value) -> Self {
        Self {
            id: id.into(),
            callback: Some(target),
            data: Some(Outbound::Value(data)),
            error: None,
        }
    }

    /// Splits into the wire message and the callbacks it announced.
    pub fn into_wire(self) -> (OutMessage, HashMap<String, Callback>) {
        let mut callbacks = HashMap::new();
        let data = self.data.map(|data| data.into_wire(&mut callbacks));
        let message = OutMessage {
            id: self.id,
            callback: self.callback,
            data,
            error: self.error,
        };
        (message, callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_become_tokens() {
        let mut fields = BTreeMap::new();
        fields.insert("progress".to_string(), Outbound::callback(|_args| async { Ok::<_, PatchError>(Value::Null) }));
        fields.insert("name".to_string(), Outbound::Value(Value::from("loader")));

        let (message, callbacks) = Envelope::reply("7", Outbound::Record(fields)).into_wire();
        assert_eq!(callbacks.len(), 1);

        let id = callbacks.keys().next().expect("callback id").clone();
        assert_eq!(
            message.data,
            Some(serde_json::json!({"name": "loader", "progress": {"__callback": id}}))
        );
    }

    #[test]
    fn errors_carry_kind_name() {
        let (message, _) = Envelope::error("9", &PatchError::Timeout).into_wire();
        let error = message.error.expect("error record");
        assert_eq!(error.name, "Timeout");
        assert_eq!(error.message, "task timeout");
        assert!(message.data.is_none());
    }
}
