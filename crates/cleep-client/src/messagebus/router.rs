//! Typed command handlers.
//!
//! Each command declares the parameters it accepts. Requests are validated
//! against that schema before the handler runs, and the sender identity is
//! handed over in the [`CommandContext`] rather than as a parameter.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, error};

use cleep_shared::{CleepError, ErrorKind};

use super::{CommandResult, MessageRequest, MessageResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Bool,
    Integer,
    Number,
    Object,
    Array,
    Any,
}

impl ParamType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamType) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamType) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Validated parameters plus the identity of the caller.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub sender: Option<String>,
    pub params: Map<String, Value>,
}

impl CommandContext {
    pub fn str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.params.get(name).and_then(Value::as_bool)
    }

    /// Deserialize an optional parameter into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CleepError> {
        match self.params.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CleepError::new(
                    ErrorKind::InvalidParameter,
                    format!("Parameter \"{name}\" is invalid: {e}"),
                )
            }),
        }
    }

    /// Deserialize a parameter declared as required.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, CleepError> {
        self.get(name)?.ok_or_else(|| {
            CleepError::new(
                ErrorKind::MissingParameter,
                format!("Parameter \"{name}\" is missing"),
            )
        })
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = CommandResult> + Send>>;
type Handler = Arc<dyn Fn(CommandContext) -> HandlerFuture + Send + Sync>;

struct CommandEntry {
    params: Vec<ParamSpec>,
    handler: Handler,
}

/// Commands served by one recipient.
pub struct CommandRouter {
    name: String,
    commands: HashMap<String, CommandEntry>,
}

impl CommandRouter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            commands: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register<F, Fut>(&mut self, command: &str, params: &[ParamSpec], handler: F)
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.commands.insert(
            command.to_string(),
            CommandEntry {
                params: params.to_vec(),
                handler,
            },
        );
    }

    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn bind(&self, entry: &CommandEntry, request: &MessageRequest) -> Result<CommandContext, CleepError> {
        let mut params = Map::new();
        for spec in &entry.params {
            match request.params.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(CleepError::new(
                        ErrorKind::MissingParameter,
                        format!("Parameter \"{}\" is missing", spec.name),
                    ));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(CleepError::new(
                        ErrorKind::InvalidParameter,
                        format!("Parameter \"{}\" must be {:?}", spec.name, spec.kind),
                    ));
                }
                Some(value) => {
                    params.insert(spec.name.to_string(), value.clone());
                }
            }
        }
        Ok(CommandContext {
            sender: request.sender.clone(),
            params,
        })
    }

    /// Validate and run the command carried by `request`.
    ///
    /// A panicking handler is turned into an error response.
    pub async fn dispatch(&self, request: &MessageRequest) -> MessageResponse {
        let name = request.name();
        let Some(entry) = self.commands.get(name) else {
            return MessageResponse::failure_kind(
                ErrorKind::InvalidCommand,
                format!("Command \"{name}\" doesn't exist in {}", self.name),
            );
        };

        let ctx = match self.bind(entry, request) {
            Ok(ctx) => ctx,
            Err(e) => {
                debug!(command = name, error = %e, "Command rejected");
                return MessageResponse::failure(e);
            }
        };

        let future = (entry.handler)(ctx);
        match tokio::spawn(future).await {
            Ok(result) => result.into(),
            Err(join_error) => {
                let message = match join_error.try_into_panic() {
                    Ok(payload) => payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "Handler panicked".to_string()),
                    Err(e) => e.to_string(),
                };
                error!(recipient = %self.name, command = name, %message, "Command handler failed");
                MessageResponse::failure_kind(ErrorKind::CommandError, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messagebus::CommandOk;
    use serde_json::json;

    fn router() -> CommandRouter {
        let mut router = CommandRouter::new("Core");
        router.register(
            "echo",
            &[
                ParamSpec::required("text", ParamType::String),
                ParamSpec::optional("times", ParamType::Integer),
            ],
            |ctx| async move {
                let text = ctx.require::<String>("text")?;
                let times = ctx.get::<usize>("times")?.unwrap_or(1);
                Ok(CommandOk::data(json!({
                    "text": text.repeat(times),
                    "sender": ctx.sender,
                })))
            },
        );
        router.register("fail", &[], |_| async move {
            Err(CleepError::new(ErrorKind::CommandError, "nope"))
        });
        router.register("panic", &[], |_| async move {
            if true {
                panic!("boom");
            }
            Ok(CommandOk::default())
        });
        router
    }

    fn request(command: &str, params: Value) -> MessageRequest {
        let params = params.as_object().cloned().unwrap_or_default();
        MessageRequest::command(command, params)
            .to("core")
            .from_sender("ui")
    }

    #[tokio::test]
    async fn test_dispatch_binds_params_and_sender() {
        let resp = router()
            .dispatch(&request("echo", json!({"text": "ab", "times": 2, "extra": 1})))
            .await;
        assert!(!resp.error);
        assert_eq!(resp.data, json!({"text": "abab", "sender": "ui"}));
    }

    #[tokio::test]
    async fn test_missing_and_invalid_params() {
        let router = router();
        let resp = router.dispatch(&request("echo", json!({}))).await;
        assert_eq!(resp.kind, Some(ErrorKind::MissingParameter));

        let resp = router.dispatch(&request("echo", json!({"text": 3}))).await;
        assert_eq!(resp.kind, Some(ErrorKind::InvalidParameter));
    }

    #[tokio::test]
    async fn test_unknown_command_and_failures() {
        let router = router();
        assert_eq!(router.name(), "core");

        let resp = router.dispatch(&request("nothing", json!({}))).await;
        assert_eq!(resp.kind, Some(ErrorKind::InvalidCommand));

        let resp = router.dispatch(&request("fail", json!({}))).await;
        assert!(resp.error);
        assert_eq!(resp.message, "nope");

        let resp = router.dispatch(&request("panic", json!({}))).await;
        assert!(resp.error);
        assert_eq!(resp.message, "boom");
        assert_eq!(resp.kind, Some(ErrorKind::CommandError));
    }
}
