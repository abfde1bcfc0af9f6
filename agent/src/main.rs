use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use injector_agent::ipc::Endpoint;
use injector_agent::EngineConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "injector-ipc")]
#[command(version)]
/// Serves patch requests from a host process over a local channel.
struct Args {
    /// Loopback port to connect to, or the pipe name when --pipe is given
    id: String,

    #[arg(long)]
    /// Connect through a named pipe (a unix socket path outside Windows)
    pipe: bool,

    #[arg(short)]
    #[arg(long)]
    /// JSON engine configuration
    config: Option<PathBuf>,

    #[arg(long)]
    /// How long to wait for the host to answer a nested call
    timeout_ms: Option<u64>,

    #[arg(long)]
    /// Base URL runtime replacements are downloaded from
    replacement_url: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(url) = args.replacement_url {
        config = config.with_replacement_base_url(url);
    }

    let endpoint = Endpoint::parse(&args.id, args.pipe)?;
    injector_agent::run(endpoint, config)
        .await
        .context("patch session failed")?;
    Ok(())
}
