use std::sync::Arc;

use protocol::PatchError;
use tracing::info;

pub mod backup;
pub mod config;
pub mod context;
pub mod entry_point;
pub mod injector;
pub mod ipc;
pub mod module;
pub mod patch;

pub use config::EngineConfig;
pub use context::{HostContext, StaticContext};
pub use injector::Injector;
pub use patch::{Patch, PatchSet};

/// Connects to the host at `endpoint` and serves requests until it hangs up.
pub async fn run(endpoint: ipc::Endpoint, config: EngineConfig) -> Result<(), PatchError> {
    let config = Arc::new(config);
    let patches = PatchSet::new(&config)?;
    let (session, outgoing) = ipc::Session::new(config, patches);
    let dispatcher = Arc::new(ipc::Dispatcher::new(session));

    let (reader, writer) = ipc::connect(&endpoint).await?;
    info!(%endpoint, "connected to host");
    ipc::serve(reader, writer, dispatcher, outgoing).await
}
