use std::collections::HashMap;

use parking_lot::Mutex;
use protocol::{PatchError, Value};

use super::outbound::Callback;

/// Functions handed to the host, keyed by the request whose reply carried
/// them. Entries stay registered after use.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<String, HashMap<String, Callback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, callbacks: HashMap<String, Callback>) {
        if callbacks.is_empty() {
            return;
        }
        self.entries
            .lock()
            .entry(request_id.to_string())
            .or_default()
            .extend(callbacks);
    }

    pub async fn invoke(&self, request_id: &str, callback_id: &str, args: Vec<Value>) -> Result<Value, PatchError> {
        let callback = self
            .entries
            .lock()
            .get(request_id)
            .and_then(|callbacks| callbacks.get(callback_id))
            .cloned();
        let Some(callback) = callback else {
            return Err(PatchError::InvalidArgument(format!(
                "No callback {callback_id} registered for request {request_id}"
            )));
        };

        let args = if args.is_empty() { vec![Value::Null] } else { args };
        callback(args).await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::outbound::Outbound;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: Arc<AtomicUsize>) -> Callback {
        let Outbound::Callback(callback) = Outbound::callback(move |args: Vec<Value>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Array(args))
            }
        }) else {
            unreachable!("callback constructor")
        };
        callback
    }

    #[tokio::test]
    async fn callbacks_are_multi_use() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = CallbackRegistry::new();
        registry.register("req", HashMap::from([("cb".to_string(), counting(counter.clone()))]));

        let first = registry.invoke("req", "cb", vec![]).await.expect("first invoke");
        let second = registry
            .invoke("req", "cb", vec![Value::from(42.0)])
            .await
            .expect("second invoke");

        assert_eq!(first, Value::Array(vec![Value::Null]));
        assert_eq!(second, Value::Array(vec![Value::Number(42.0)]));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_callback_is_an_error() {
        let registry = CallbackRegistry::new();
        let err = registry.invoke("req", "cb", vec![]).await.expect_err("unknown");
        assert!(matches!(err, PatchError::InvalidArgument(_)));
    }
}
