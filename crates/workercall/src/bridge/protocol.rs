//! Wire protocol types for host-worker communication.
//!
//! One channel, two directions:
//! - **Host to worker**: commands tagged by `cmd`. Most expect exactly one
//!   reply; notifications (`endOfRequest`, `shutdown`) expect none.
//! - **Worker to host**: replies carrying either `value` or `err`. Replies have
//!   no correlation id; they answer the oldest outstanding command.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A payload that can be written to the worker channel.
///
/// The sequencer never looks inside a payload. It only asks whether the worker
/// will answer it, so calls and notifications cannot be mixed up.
pub trait Envelope: Serialize + Send + 'static {
    /// True when the worker answers this payload with exactly one reply.
    fn expects_reply(&self) -> bool;

    /// Short name used in logs.
    fn label(&self) -> &'static str {
        "message"
    }
}

/// Commands from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    /// Prepare the worker's execution context. Must be the first call.
    InitWorker { worker_id: u32 },

    /// Load one endpoint module at a given API version.
    ImportEndpoint {
        path: String,
        api_version: String,
        version: String,
    },

    /// Run the handler registered for `path` against an HTTP-shaped request.
    CallHandler {
        request_id: u64,
        path: String,
        api_version: String,
        request: HandlerRequest,
    },

    /// Pull the next response body chunk for a request. `null` means drained.
    ReadWorkerChannel { request_id: u64 },

    /// The host is done with a request; the worker may drop its state.
    EndOfRequest { request_id: u64 },

    Shutdown,
}

impl Envelope for WorkerCommand {
    fn expects_reply(&self) -> bool {
        !matches!(self, Self::EndOfRequest { .. } | Self::Shutdown)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::InitWorker { .. } => "initWorker",
            Self::ImportEndpoint { .. } => "importEndpoint",
            Self::CallHandler { .. } => "callHandler",
            Self::ReadWorkerChannel { .. } => "readWorkerChannel",
            Self::EndOfRequest { .. } => "endOfRequest",
            Self::Shutdown => "shutdown",
        }
    }
}

/// HTTP-shaped request handed to an endpoint handler.
///
/// The body travels base64-encoded so arbitrary bytes survive JSON framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HandlerRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = Some(encode_chunk(body));
        self
    }

    /// Decoded body bytes, if any.
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.body.as_deref().map(decode_chunk).transpose()
    }
}

/// HTTP-shaped response head returned by `callHandler`.
///
/// The body is not inlined; when `has_body` is set the host drains it with
/// `readWorkerChannel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub has_body: bool,
}

/// Reply from worker to host.
///
/// The presence of `err` is the only thing the host inspects; a missing
/// `value` means `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<serde_json::Value>,
}

impl WorkerReply {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            err: None,
        }
    }

    pub fn err(failure: WorkerFailure) -> Self {
        Self {
            value: None,
            err: Some(failure.0),
        }
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    pub fn into_result(self) -> Result<serde_json::Value, WorkerFailure> {
        match self.err {
            Some(err) => Err(WorkerFailure(err)),
            None => Ok(self.value.unwrap_or(serde_json::Value::Null)),
        }
    }
}

impl From<Result<serde_json::Value, WorkerFailure>> for WorkerReply {
    fn from(result: Result<serde_json::Value, WorkerFailure>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(failure) => Self::err(failure),
        }
    }
}

/// Error payload attached by the worker to a failed reply.
///
/// Opaque JSON; `message` and `code` are read when present.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure(pub serde_json::Value);

impl WorkerFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self(serde_json::json!({ "message": message.into() }))
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self(serde_json::json!({ "code": code.into(), "message": message.into() }))
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn code(&self) -> Option<&str> {
        self.0.get("code").and_then(|c| c.as_str())
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => match other.get("message").and_then(|m| m.as_str()) {
                Some(message) => f.write_str(message),
                None => write!(f, "{}", other),
            },
        }
    }
}

impl std::error::Error for WorkerFailure {}

pub fn encode_chunk(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_chunk(chunk: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(chunk)
}
