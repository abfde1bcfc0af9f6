use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::{Command, PatchConfig, PatchError, Request, Value};
use tracing::{debug, warn};

use super::outbound::{Envelope, Outbound};
use super::proxy::ContextProxy;
use super::Session;
use crate::patch::Patch;

pub type HandlerFuture = BoxFuture<'static, Result<Option<Outbound>, PatchError>>;
pub type Handler = Arc<dyn Fn(Arc<Session>, Request) -> HandlerFuture + Send + Sync>;

const PATCH_COMMANDS: [Command; 10] = [
    Command::IsPatchApplicable,
    Command::ApplyPatch,
    Command::RemovePatch,
    Command::IsPatchApplied,
    Command::DeployDependencies,
    Command::PurgeDependencies,
    Command::EnableCapability,
    Command::DisableCapability,
    Command::DeployUiBundle,
    Command::PurgeUiBundle,
];

/// Routes inbound requests by their `command` name.
pub struct Dispatcher {
    session: Arc<Session>,
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        let mut dispatcher = Self {
            session,
            handlers: HashMap::new(),
        };

        for command in PATCH_COMMANDS {
            dispatcher.register_handler(command.as_str(), move |session, request| {
                run_patch(session, request, command)
            });
        }
        dispatcher.register_handler(Command::Invoke.as_str(), invoke);
        dispatcher.register_handler(Command::Reply.as_str(), reply);
        dispatcher.register_handler(Command::Quit.as_str(), |_, _| async {
            Ok::<_, PatchError>(Some(Outbound::Value(Value::String(String::new()))))
        });
        dispatcher
    }

    /// Adds or replaces the handler for `command`.
    pub fn register_handler<F, Fut>(&mut self, command: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Session>, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Outbound>, PatchError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |session, request| Box::pin(handler(session, request)));
        self.handlers.insert(command.into(), handler);
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Runs the handler for `request`. `None` means nothing is sent back.
    pub async fn dispatch(&self, request: Request) -> Option<Envelope> {
        let id = request.id.clone();
        let command = request.command_name().unwrap_or_default().to_string();

        let Some(handler) = self.handlers.get(&command).cloned() else {
            debug!(request_id = %id, %command, "unknown command, acknowledging");
            return Some(Envelope::reply(id, Value::String(String::new())));
        };

        match handler(self.session.clone(), request).await {
            Ok(Some(data)) => Some(Envelope::reply(id, data)),
            Ok(None) => None,
            Err(err) => {
                warn!(request_id = %id, %command, "request failed: {err}");
                Some(Envelope::error(id, &err))
            }
        }
    }

    /// Parses one frame, dispatches it and queues the answer.
    pub async fn handle_frame(self: Arc<Self>, frame: String) {
        let request = match Request::parse(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping frame: {err}");
                return;
            }
        };

        if let Some(envelope) = self.dispatch(request).await {
            if let Err(err) = self.session.outbox.send(envelope).await {
                warn!("failed to queue reply: {err}");
            }
        }
    }
}

async fn run_patch(session: Arc<Session>, request: Request, command: Command) -> Result<Option<Outbound>, PatchError> {
    let config = request
        .payload
        .get("patchConfig")
        .ok_or_else(|| PatchError::InvalidArgument(format!("{command} requires a patchConfig")))?;
    let config = PatchConfig::from_value(config)?;
    let ctx = ContextProxy::new(session.clone(), request.id.clone());
    let patches = &session.patches;

    let result = match command {
        Command::IsPatchApplicable => patches.injector.is_applicable(&config, &ctx).await,
        Command::ApplyPatch => {
            let applicable = patches.injector.is_applicable(&config, &ctx).await;
            if !applicable.result {
                applicable
            } else {
                patches.injector.apply(&config, &ctx).await
            }
        }
        Command::RemovePatch => patches.injector.remove(&config, &ctx).await,
        Command::IsPatchApplied => patches.injector.is_applied(&config, &ctx).await,
        Command::DeployDependencies => patches.mod_loader.apply(&config, &ctx).await,
        Command::PurgeDependencies => patches.mod_loader.remove(&config, &ctx).await,
        Command::EnableCapability => {
            let applicable = patches.reflection.is_applicable(&config, &ctx).await;
            if !applicable.result {
                applicable
            } else {
                patches.reflection.apply(&config, &ctx).await
            }
        }
        Command::DisableCapability => patches.reflection.remove(&config, &ctx).await,
        Command::DeployUiBundle => patches.ui_bundle.apply(&config, &ctx).await,
        Command::PurgeUiBundle => patches.ui_bundle.remove(&config, &ctx).await,
        Command::Invoke | Command::Reply | Command::Quit => {
            return Err(PatchError::InvalidArgument(format!("{command} is not a patch command")));
        }
    };

    Ok(Some(Outbound::from(result)))
}

async fn invoke(session: Arc<Session>, request: Request) -> Result<Option<Outbound>, PatchError> {
    let data = request.payload.get("data").unwrap_or(&request.payload);
    let field = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PatchError::InvalidArgument(format!("Invoke requires {key}")))
    };
    let request_id = field("requestId")?;
    let callback_id = field("callbackId")?;
    let args = data
        .get("args")
        .and_then(Value::as_array)
        .map(<[Value]>::to_vec)
        .unwrap_or_default();

    let result = session.callbacks.invoke(&request_id, &callback_id, args).await?;
    Ok(Some(Outbound::Value(result)))
}

async fn reply(session: Arc<Session>, request: Request) -> Result<Option<Outbound>, PatchError> {
    let payload = &request.payload;
    let Some(call_id) = payload
        .get("request")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
    else {
        warn!(request_id = %request.id, "reply without request id");
        return Ok(None);
    };

    let result = match (payload.get("error"), payload.get("data")) {
        (Some(error), _) if !error.is_null() => Err(PatchError::Unknown(
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Host reported an error")
                .to_string(),
        )),
        (_, Some(data)) => Ok(data.clone()),
        _ => Err(PatchError::InvalidArgument(format!(
            "No data and no error field in reply to {call_id}"
        ))),
    };

    session.pending.resolve(call_id, result);
    Ok(None)
}
