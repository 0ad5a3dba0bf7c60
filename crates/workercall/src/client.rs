//! Typed command API on top of the call sequencer.
//!
//! Each method is one `call()` or `notify()` plus decoding of the reply value.
//! A reply of the wrong shape fails only that call; the sequencer keeps going.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;

use crate::bridge::protocol::{HandlerRequest, HandlerResponse, WorkerCommand, decode_chunk};
use crate::sequencer::{CallError, CallSequencer};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("unexpected reply to {cmd}: {source}")]
    Decode {
        cmd: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid body chunk for request {request_id}: {source}")]
    Chunk {
        request_id: u64,
        #[source]
        source: base64::DecodeError,
    },
}

impl ClientError {
    /// The worker's own error payload, if the worker rejected the call.
    pub fn worker_failure(&self) -> Option<&crate::bridge::protocol::WorkerFailure> {
        match self {
            Self::Call(e) => e.worker_failure(),
            _ => None,
        }
    }
}

/// Full result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub request_id: u64,
    pub response: HandlerResponse,
    pub body: Vec<u8>,
}

/// Typed client for a worker. Cheap to clone; clones share request ids.
#[derive(Clone)]
pub struct WorkerClient {
    sequencer: CallSequencer<WorkerCommand>,
    next_request_id: Arc<AtomicU64>,
}

impl WorkerClient {
    pub fn new(sequencer: CallSequencer<WorkerCommand>) -> Self {
        Self {
            sequencer,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn sequencer(&self) -> &CallSequencer<WorkerCommand> {
        &self.sequencer
    }

    /// Allocate a request id unique within this client.
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn init_worker(&self, worker_id: u32) -> Result<(), ClientError> {
        self.sequencer
            .call(WorkerCommand::InitWorker { worker_id })?
            .await?;
        Ok(())
    }

    pub async fn import_endpoint(
        &self,
        path: impl Into<String>,
        api_version: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.sequencer
            .call(WorkerCommand::ImportEndpoint {
                path: path.into(),
                api_version: api_version.into(),
                version: version.into(),
            })?
            .await?;
        Ok(())
    }

    /// Invoke a handler and return the response head.
    pub async fn call_handler(
        &self,
        request_id: u64,
        path: impl Into<String>,
        api_version: impl Into<String>,
        request: HandlerRequest,
    ) -> Result<HandlerResponse, ClientError> {
        let value = self
            .sequencer
            .call(WorkerCommand::CallHandler {
                request_id,
                path: path.into(),
                api_version: api_version.into(),
                request,
            })?
            .await?;
        decode("callHandler", value)
    }

    /// Read the next body chunk. `None` once the body is drained.
    pub async fn read_body_chunk(&self, request_id: u64) -> Result<Option<Vec<u8>>, ClientError> {
        let value = self
            .sequencer
            .call(WorkerCommand::ReadWorkerChannel { request_id })?
            .await?;
        let chunk: Option<String> = decode("readWorkerChannel", value)?;
        chunk
            .map(|c| decode_chunk(&c))
            .transpose()
            .map_err(|source| ClientError::Chunk { request_id, source })
    }

    /// Read body chunks until the worker reports the body drained.
    pub async fn read_body(&self, request_id: u64) -> Result<Vec<u8>, ClientError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.read_body_chunk(request_id).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    pub fn end_of_request(&self, request_id: u64) -> Result<(), ClientError> {
        self.sequencer
            .notify(WorkerCommand::EndOfRequest { request_id })?;
        Ok(())
    }

    /// Send `shutdown` once every call already submitted has settled.
    ///
    /// The sequencer takes no further calls; its driver stops after writing it.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.sequencer.close_with(WorkerCommand::Shutdown)?;
        Ok(())
    }

    /// Run one request end to end: call the handler, drain the body, release it.
    pub async fn dispatch(
        &self,
        path: impl Into<String>,
        api_version: impl Into<String>,
        request: HandlerRequest,
    ) -> Result<HandlerOutcome, ClientError> {
        let request_id = self.next_request_id();
        let response = self
            .call_handler(request_id, path, api_version, request)
            .await?;

        let body = if response.has_body {
            self.read_body(request_id).await
        } else {
            Ok(Vec::new())
        };
        self.end_of_request(request_id)?;

        Ok(HandlerOutcome {
            request_id,
            response,
            body: body?,
        })
    }
}

fn decode<T: DeserializeOwned>(
    cmd: &'static str,
    value: serde_json::Value,
) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(|source| ClientError::Decode { cmd, source })
}
