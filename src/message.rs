//! Command, reply and result envelope types.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Reserved command type used for liveness probes.
pub const PING_COMMAND: &str = "ping";

/// Reserved command type used as a best-effort close notification.
pub const CLOSE_COMMAND: &str = "close";

/// Status string a peer uses for a successful reply.
pub const STATUS_SUCCESS: &str = "success";

/// Error text used when a failed reply carries no `error` field.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Parameters attached to a command.
pub type Params = Map<String, Value>;

/// An outbound command: `{"type": ..., "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command type understood by the peer.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Optional parameters. Omitted from the wire when absent or empty.
    #[serde(default, skip_serializing_if = "params_absent")]
    pub params: Option<Params>,
}

fn params_absent(params: &Option<Params>) -> bool {
    params.as_ref().is_none_or(Map::is_empty)
}

impl Command {
    /// Create a command without parameters.
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            params: None,
        }
    }

    /// Create a command with parameters.
    pub fn with_params(command_type: impl Into<String>, params: Params) -> Self {
        Self {
            command_type: command_type.into(),
            params: Some(params),
        }
    }

    /// Create a liveness probe.
    pub fn ping() -> Self {
        Self::new(PING_COMMAND)
    }

    /// Create a close notification.
    pub fn close() -> Self {
        Self::new(CLOSE_COMMAND)
    }
}

/// A raw reply as sent by the peer.
///
/// Any JSON object is accepted. Fields of an unexpected type are kept where
/// they can be shown (`error` is rendered as JSON text) and otherwise
/// dropped, so defaults apply when the reply becomes a [`CommandResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Params")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

impl From<Params> for Response {
    fn from(mut fields: Params) -> Self {
        Self {
            status: fields.remove("status").and_then(display_text),
            result: fields.remove("result"),
            error: fields.remove("error").and_then(display_text),
            recoverable: fields.remove("recoverable").and_then(|v| v.as_bool()),
        }
    }
}

fn display_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

impl Response {
    /// Build a success reply.
    pub fn success(result: Value) -> Self {
        Self {
            status: Some(STATUS_SUCCESS.to_string()),
            result: Some(result),
            ..Default::default()
        }
    }

    /// Build an error reply.
    pub fn error(error: impl Into<String>, recoverable: bool) -> Self {
        Self {
            status: Some("error".to_string()),
            error: Some(error.into()),
            recoverable: Some(recoverable),
            ..Default::default()
        }
    }

    /// Check if the peer reported success.
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SUCCESS)
    }

    /// Convert into the caller-facing envelope.
    pub fn into_result(self) -> CommandResult {
        if self.is_success() {
            let data = match self.result {
                Some(Value::Object(map)) => map,
                None | Some(Value::Null) => Map::new(),
                Some(other) => {
                    let mut map = Map::new();
                    map.insert("result".to_string(), other);
                    map
                }
            };
            CommandResult::success(data)
        } else {
            CommandResult::failure(
                self.error.unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                self.recoverable.unwrap_or(true),
            )
        }
    }
}

/// Uniform outcome of every command.
///
/// `recoverable` is only meaningful on failure: `true` means a later retry
/// may succeed, `false` means the peer rejected the request itself.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub data: Map<String, Value>,
    pub error: Option<String>,
    pub recoverable: bool,
}

impl CommandResult {
    /// A successful result carrying `data`.
    pub fn success(data: Map<String, Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            recoverable: true,
        }
    }

    /// A failed result.
    pub fn failure(error: impl Into<String>, recoverable: bool) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error: Some(error.into()),
            recoverable,
        }
    }

    /// Error text, if this is a failure.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Render the envelope for an upstream caller.
    ///
    /// On success `data` is flattened next to `success`; on failure the
    /// object carries `error` and `recoverable`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("success".to_string(), Value::Bool(self.success));
        if self.success {
            for (key, value) in &self.data {
                if key != "success" {
                    map.insert(key.clone(), value.clone());
                }
            }
        } else {
            map.insert(
                "error".to_string(),
                self.error
                    .as_ref()
                    .map_or(Value::Null, |e| Value::String(e.clone())),
            );
            map.insert("recoverable".to_string(), Value::Bool(self.recoverable));
        }
        Value::Object(map)
    }

    /// Render the envelope as indented JSON.
    pub fn to_json_pretty(&self) -> String {
        // Serializing a `Value` cannot fail.
        serde_json::to_string_pretty(&self.to_value()).unwrap_or_default()
    }
}

impl Serialize for CommandResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
