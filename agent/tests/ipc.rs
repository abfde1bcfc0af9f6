use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use injector_agent::ipc::outbound::Outbound;
use injector_agent::ipc::{self, Dispatcher, Session};
use injector_agent::module::{store, Instruction, MethodDef, Module, OpCode, TypeDef, Version};
use injector_agent::patch::reflection::ReplacementSource;
use injector_agent::{EngineConfig, PatchSet};
use protocol::{encode_frame, FrameDecoder, PatchError, Value};
use serde_json::{json, Value as Json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

struct NoDownloads;

#[async_trait]
impl ReplacementSource for NoDownloads {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, PatchError> {
        Err(PatchError::DownloadFailure(format!("offline: {name}")))
    }
}

/// Plays the host side of a session.
struct Host {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
    server: JoinHandle<Result<(), PatchError>>,
}

impl Host {
    fn start(config: EngineConfig, customize: impl FnOnce(&mut Dispatcher)) -> Self {
        let (engine_side, host_side) = tokio::io::duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine_side);

        let config = Arc::new(config);
        let patches = PatchSet::with_replacements(&config, Arc::new(NoDownloads));
        let (session, outgoing) = Session::new(config, patches);
        let mut dispatcher = Dispatcher::new(session);
        customize(&mut dispatcher);

        let server = tokio::spawn(ipc::serve(engine_read, engine_write, Arc::new(dispatcher), outgoing));
        let (reader, writer) = tokio::io::split(host_side);
        Self {
            reader,
            writer,
            decoder: FrameDecoder::new(),
            server,
        }
    }

    async fn send(&mut self, message: Json) {
        self.writer
            .write_all(&encode_frame(&message.to_string()))
            .await
            .expect("send frame");
    }

    async fn recv(&mut self) -> Json {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return serde_json::from_str(&frame.expect("valid frame")).expect("valid json");
            }

            let mut buf = [0u8; 4096];
            let read = tokio::time::timeout(Duration::from_secs(10), self.reader.read(&mut buf))
                .await
                .expect("engine answered in time")
                .expect("read from engine");
            assert!(read > 0, "engine hung up");
            self.decoder.push(&buf[..read]);
        }
    }

    /// Answers context calls with `answer` until the reply to `id` arrives.
    async fn reply_to(&mut self, id: &str, answer: impl Fn(&str) -> Json) -> Json {
        loop {
            let message = self.recv().await;
            if message["id"] == id {
                return message;
            }

            assert_eq!(message["callback"]["id"], id, "nested call belongs to the request");
            assert_eq!(message["callback"]["type"], "context");
            let name = message["data"]["name"].as_str().expect("accessor name");
            let reply = json!({
                "id": format!("reply-{}", message["id"].as_str().expect("call id")),
                "payload": {
                    "command": "Reply",
                    "request": {"id": message["id"]},
                    "data": answer(name),
                },
            });
            self.send(reply).await;
        }
    }

    async fn shutdown(mut self) {
        self.writer.shutdown().await.expect("close host side");
        let result = tokio::time::timeout(Duration::from_secs(10), self.server)
            .await
            .expect("server stopped in time")
            .expect("server task");
        assert!(result.is_ok(), "{result:?}");
    }
}

fn write_modules(data: &Path) {
    let loader = Module::new("Acme", Version::new(1, 0, 0, 0)).with_type(
        TypeDef::class("Acme.Loader")
            .with_method(MethodDef::new("Start").with_body(vec![Instruction::simple(OpCode::Ret)])),
    );
    let game = Module::new("Game", Version::new(1, 0, 0, 0)).with_type(
        TypeDef::class("Game.Boot")
            .with_method(MethodDef::new("Main").with_body(vec![Instruction::simple(OpCode::Ret)])),
    );
    store::write(&loader, &data.join("Acme.dll")).expect("write loader");
    store::write(&game, &data.join("Game.dll")).expect("write game");
}

fn patch_request(id: &str, command: &str, data: &Path) -> Json {
    json!({
        "id": id,
        "payload": {
            "command": command,
            "patchConfig": {
                "command": command,
                "source": {
                    "modulePath": data.join("Acme.dll"),
                    "typeName": "Acme.Loader",
                    "methodName": "Start",
                },
                "targets": [{
                    "modulePath": data.join("Game.dll"),
                    "typeName": "Game.Boot",
                    "methodName": "Main",
                }],
            },
        },
    })
}

fn paths(data: PathBuf) -> impl Fn(&str) -> Json {
    move |name: &str| match name {
        "getDataPath" | "getModLoaderPath" => json!(data),
        "isDeploymentRequired" => json!(false),
        other => panic!("unexpected accessor {other}"),
    }
}

#[tokio::test]
async fn apply_answers_nested_context_calls() {
    let dir = tempfile::tempdir().expect("create tempdir");
    write_modules(dir.path());
    let mut host = Host::start(EngineConfig::default(), |_| {});

    host.send(patch_request("1", "ApplyPatch", dir.path())).await;
    let reply = host.reply_to("1", paths(dir.path().to_path_buf())).await;
    assert_eq!(reply["data"]["result"], true, "{reply}");

    host.send(patch_request("2", "IsPatchApplicable", dir.path())).await;
    let reply = host.reply_to("2", paths(dir.path().to_path_buf())).await;
    assert_eq!(reply["data"]["result"], true);
    assert!(reply["data"]["message"]
        .as_str()
        .expect("message")
        .contains("already injected"));

    host.shutdown().await;
}

#[tokio::test]
async fn unanswered_context_call_times_out() {
    let dir = tempfile::tempdir().expect("create tempdir");
    write_modules(dir.path());
    let config = EngineConfig::default().with_call_timeout(Duration::from_millis(100));
    let mut host = Host::start(config, |_| {});
    let original = std::fs::read(dir.path().join("Game.dll")).expect("read target");

    host.send(patch_request("1", "ApplyPatch", dir.path())).await;
    let call = host.recv().await;
    assert_eq!(call["data"]["name"], "getDataPath");

    let reply = host.recv().await;
    assert_eq!(reply["id"], "1");
    assert_eq!(reply["data"]["result"], false);
    assert_eq!(reply["data"]["message"], "task timeout");
    assert_eq!(std::fs::read(dir.path().join("Game.dll")).expect("read target"), original);

    // A reply arriving after the timeout is dropped silently.
    host.send(json!({
        "id": "late",
        "payload": {"command": "Reply", "request": {"id": call["id"]}, "data": "/too/late"},
    }))
    .await;
    host.shutdown().await;
}

#[tokio::test]
async fn callbacks_can_be_invoked_repeatedly() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut host = Host::start(EngineConfig::default(), move |dispatcher| {
        dispatcher.register_handler("Subscribe", move |_session, _request| {
            let counter = counter.clone();
            async move {
                let mut fields = BTreeMap::new();
                fields.insert(
                    "onProgress".to_string(),
                    Outbound::callback(move |args| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, PatchError>(Value::Array(args))
                        }
                    }),
                );
                Ok::<_, PatchError>(Some(Outbound::Record(fields)))
            }
        });
    });

    host.send(json!({"id": "sub", "payload": {"command": "Subscribe"}})).await;
    let reply = host.recv().await;
    let callback_id = reply["data"]["onProgress"]["__callback"]
        .as_str()
        .expect("callback token")
        .to_string();

    for (id, args) in [("i1", json!([])), ("i2", json!([50]))] {
        host.send(json!({
            "id": id,
            "payload": {
                "command": "Invoke",
                "data": {"requestId": "sub", "callbackId": callback_id, "args": args},
            },
        }))
        .await;
        let reply = host.recv().await;
        assert_eq!(reply["id"], id);
        assert!(reply.get("error").is_none(), "{reply}");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    host.shutdown().await;
}

#[tokio::test]
async fn unknown_commands_are_acknowledged() {
    let mut host = Host::start(EngineConfig::default(), |_| {});

    host.send(json!({"id": "u", "payload": {"command": "Teleport"}})).await;
    assert_eq!(host.recv().await, json!({"id": "u", "data": ""}));

    host.send(json!({"id": "q", "payload": {"command": "Quit"}})).await;
    assert_eq!(host.recv().await, json!({"id": "q", "data": ""}));

    host.shutdown().await;
}

#[tokio::test]
async fn handler_errors_are_reported() {
    let mut host = Host::start(EngineConfig::default(), |_| {});

    host.send(json!({"id": "e", "payload": {"command": "ApplyPatch"}})).await;
    let reply = host.recv().await;
    assert_eq!(reply["id"], "e");
    assert_eq!(reply["error"]["name"], "InvalidArgument");
    assert!(reply.get("data").is_none());

    host.send(json!({
        "id": "x",
        "payload": {"command": "Invoke", "data": {"requestId": "nope", "callbackId": "nope", "args": []}},
    }))
    .await;
    let reply = host.recv().await;
    assert_eq!(reply["error"]["name"], "InvalidArgument");

    host.shutdown().await;
}

#[tokio::test]
async fn in_flight_requests_are_answered_after_host_stops_sending() {
    let mut host = Host::start(EngineConfig::default(), |dispatcher| {
        dispatcher.register_handler("Slow", |_session, _request| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, PatchError>(Some(Outbound::Value(Value::String("done".to_string()))))
        });
    });

    host.send(json!({"id": "s", "payload": {"command": "Slow"}})).await;
    host.writer.shutdown().await.expect("close host side");

    assert_eq!(host.recv().await, json!({"id": "s", "data": "done"}));
    let result = tokio::time::timeout(Duration::from_secs(10), host.server)
        .await
        .expect("server stopped in time")
        .expect("server task");
    assert!(result.is_ok(), "{result:?}");
}
