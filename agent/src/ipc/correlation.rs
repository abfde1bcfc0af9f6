use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use protocol::{CallbackTarget, PatchError, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::outbound::Envelope;

type Completion = oneshot::Sender<Result<Value, PatchError>>;

/// Producer side of the writer queue. Closing it lets the writer drain and
/// stop once in-flight handlers are done with their clones.
pub struct Outbox {
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), PatchError> {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(PatchError::Unknown("Channel is closed".to_string()));
        };
        tx.send(envelope)
            .await
            .map_err(|_| PatchError::Unknown("Channel is closed".to_string()))
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// Calls issued to the host that are still waiting for a `Reply`.
pub struct PendingCalls {
    table: Mutex<HashMap<String, Completion>>,
    timeout: Duration,
}

impl PendingCalls {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Sends `data` to the host and waits for the matching reply. The entry
    /// is dropped on timeout so a late reply finds nothing to resolve.
    pub async fn call(&self, outbox: &Outbox, target: CallbackTarget, data: Value) -> Result<Value, PatchError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.table.lock().insert(id.clone(), tx);

        if let Err(err) = outbox.send(Envelope::call(id.clone(), target, data)).await {
            self.table.lock().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PatchError::Unknown(format!("Call {id} was abandoned"))),
            Err(_) => {
                self.table.lock().remove(&id);
                debug!(call_id = %id, "host call timed out");
                Err(PatchError::Timeout)
            }
        }
    }

    /// Completes the call registered under `id`. Unknown ids are dropped.
    pub fn resolve(&self, id: &str, result: Result<Value, PatchError>) -> bool {
        let completion = self.table.lock().remove(id);
        match completion {
            Some(completion) => completion.send(result).is_ok(),
            None => {
                debug!(call_id = %id, "dropping reply for unknown call");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
