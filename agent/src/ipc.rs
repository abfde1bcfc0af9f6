use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::patch::PatchSet;
use callbacks::CallbackRegistry;
use correlation::{Outbox, PendingCalls};
use outbound::Envelope;

pub mod callbacks;
pub mod correlation;
pub mod dispatcher;
pub mod outbound;
pub mod proxy;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use transport::{connect, serve, Endpoint};

/// State shared by every handler running on one connection.
pub struct Session {
    pub config: Arc<EngineConfig>,
    pub patches: PatchSet,
    pub pending: PendingCalls,
    pub callbacks: CallbackRegistry,
    pub outbox: Outbox,
}

impl Session {
    /// Creates the session together with the receiving end of its writer
    /// queue.
    pub fn new(config: Arc<EngineConfig>, patches: PatchSet) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let session = Self {
            pending: PendingCalls::new(config.call_timeout()),
            callbacks: CallbackRegistry::new(),
            outbox: Outbox::new(tx),
            patches,
            config,
        };
        (Arc::new(session), rx)
    }
}
