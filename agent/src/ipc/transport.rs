use std::fmt;
use std::sync::Arc;

use protocol::{encode_frame, FrameDecoder, PatchError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::outbound::Envelope;
use super::{Dispatcher, Session};

const READ_CHUNK: usize = 64 * 1024;

pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How the host expects to be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Loopback TCP port.
    Tcp(u16),
    /// Named pipe pair on Windows, unix socket path elsewhere.
    Pipe(String),
}

impl Endpoint {
    pub fn parse(id: &str, pipe: bool) -> Result<Self, PatchError> {
        if pipe {
            return Ok(Endpoint::Pipe(id.to_string()));
        }
        id.parse()
            .map(Endpoint::Tcp)
            .map_err(|_| PatchError::InvalidArgument(format!("{id} is not a valid port")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(port) => write!(f, "127.0.0.1:{port}"),
            Endpoint::Pipe(name) => write!(f, "pipe {name}"),
        }
    }
}

fn channel_error(endpoint: &Endpoint, err: std::io::Error) -> PatchError {
    PatchError::FileOperation(format!("Failed to connect to {endpoint}: {err}"))
}

pub async fn connect(endpoint: &Endpoint) -> Result<(ChannelReader, ChannelWriter), PatchError> {
    match endpoint {
        Endpoint::Tcp(port) => {
            let stream = tokio::net::TcpStream::connect(("127.0.0.1", *port))
                .await
                .map_err(|err| channel_error(endpoint, err))?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        Endpoint::Pipe(name) => connect_pipe(endpoint, name).await,
    }
}

#[cfg(windows)]
async fn connect_pipe(endpoint: &Endpoint, name: &str) -> Result<(ChannelReader, ChannelWriter), PatchError> {
    use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};

    let reader = ClientOptions::new()
        .open(format!(r"\\.\pipe\{name}"))
        .map_err(|err| channel_error(endpoint, err))?;
    let writer = ServerOptions::new()
        .first_pipe_instance(true)
        .create(format!(r"\\.\pipe\{name}_reply"))
        .map_err(|err| channel_error(endpoint, err))?;
    writer.connect().await.map_err(|err| channel_error(endpoint, err))?;
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(unix)]
async fn connect_pipe(endpoint: &Endpoint, name: &str) -> Result<(ChannelReader, ChannelWriter), PatchError> {
    let stream = tokio::net::UnixStream::connect(name)
        .await
        .map_err(|err| channel_error(endpoint, err))?;
    let (reader, writer) = stream.into_split();
    Ok((Box::new(reader), Box::new(writer)))
}

/// Runs the reader and writer loops for one connection until the host hangs
/// up and every queued reply has been written.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    outgoing: mpsc::Receiver<Envelope>,
) -> Result<(), PatchError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let session = dispatcher.session().clone();
    let reader_task = tokio::spawn(read_loop(reader, dispatcher));
    let writer_task = tokio::spawn(write_loop(writer, outgoing, session));

    let (read, write) = tokio::join!(reader_task, writer_task);
    let joined = |err: tokio::task::JoinError| PatchError::Unknown(format!("Channel task failed: {err}"));
    read.map_err(joined)??;
    write.map_err(joined)??;
    Ok(())
}

async fn read_loop<R>(mut reader: R, dispatcher: Arc<Dispatcher>) -> Result<(), PatchError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut handlers = JoinSet::new();

    let outcome = loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(err) => break Err(PatchError::Unknown(format!("Channel read failed: {err}"))),
        };

        decoder.push(&chunk[..read]);
        while let Some(frame) = decoder.next_frame() {
            match frame {
                Ok(text) => {
                    handlers.spawn(dispatcher.clone().handle_frame(text));
                }
                Err(err) => warn!("discarding frame: {err}"),
            }
        }
        while let Some(done) = handlers.try_join_next() {
            log_handler_exit(done);
        }
    };

    if decoder.pending() > 0 {
        debug!(bytes = decoder.pending(), "channel closed mid-frame");
    }
    info!(in_flight = handlers.len(), "channel closed, no more input");
    while let Some(done) = handlers.join_next().await {
        log_handler_exit(done);
    }
    dispatcher.session().outbox.close();
    outcome
}

fn log_handler_exit(done: Result<(), tokio::task::JoinError>) {
    if let Err(err) = done {
        warn!("request handler failed: {err}");
    }
}

async fn write_loop<W>(mut writer: W, mut outgoing: mpsc::Receiver<Envelope>, session: Arc<Session>) -> Result<(), PatchError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outgoing.recv().await {
        let (message, callbacks) = envelope.into_wire();
        session.callbacks.register(&message.id, callbacks);

        let text = match message.to_json_string() {
            Ok(text) => text,
            Err(err) => {
                warn!(message_id = %message.id, "dropping message: {err}");
                continue;
            }
        };

        let written = async {
            writer.write_all(&encode_frame(&text)).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            session.outbox.close();
            return Err(PatchError::Unknown(format!("Channel write failed: {err}")));
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!("channel shutdown: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints() {
        assert_eq!(Endpoint::parse("5151", false).expect("port"), Endpoint::Tcp(5151));
        assert_eq!(
            Endpoint::parse("injector_ipc", true).expect("pipe"),
            Endpoint::Pipe("injector_ipc".to_string())
        );
        assert!(Endpoint::parse("not-a-port", false).is_err());
    }
}
