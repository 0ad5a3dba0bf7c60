//! Reference worker that echoes request bodies back through imported endpoints.
//!
//! Used by the `workercall-echo-worker` binary and by tests that need a real
//! worker on the other end of the channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::bridge::protocol::{
    Envelope, HandlerRequest, HandlerResponse, WorkerCommand, WorkerFailure, encode_chunk,
};
use crate::worker::CommandHandler;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct EchoState {
    worker_id: Option<u32>,
    /// (api_version, path) -> module version
    endpoints: HashMap<(String, String), String>,
    /// request id -> body chunks not yet read
    bodies: HashMap<u64, VecDeque<Vec<u8>>>,
}

pub struct EchoWorker {
    state: Mutex<EchoState>,
    chunk_size: usize,
}

impl Default for EchoWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoWorker {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            state: Mutex::new(EchoState::default()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Requests whose state has not been released with `endOfRequest`.
    pub fn open_requests(&self) -> usize {
        self.lock().map(|s| s.bodies.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, EchoState>, WorkerFailure> {
        self.state.lock().map_err(|_| {
            tracing::error!("Echo worker state mutex poisoned");
            WorkerFailure::with_code("E_INTERNAL", "worker state poisoned")
        })
    }

    fn call_handler(
        &self,
        state: &mut EchoState,
        request_id: u64,
        path: String,
        api_version: String,
        request: HandlerRequest,
    ) -> Result<serde_json::Value, WorkerFailure> {
        let Some(version) = state.endpoints.get(&(api_version.clone(), path.clone())) else {
            return Err(WorkerFailure::with_code(
                "E_NO_ENDPOINT",
                format!("no endpoint {} at API version {}", path, api_version),
            ));
        };
        if state.bodies.contains_key(&request_id) {
            return Err(WorkerFailure::with_code(
                "E_DUPLICATE_REQUEST",
                format!("request {} is already open", request_id),
            ));
        }

        let body = request
            .body_bytes()
            .map_err(|e| WorkerFailure::with_code("E_BAD_BODY", e.to_string()))?
            .unwrap_or_default();

        let content_type = request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let response = HandlerResponse {
            status: 200,
            headers: vec![
                ("content-type".to_string(), content_type),
                ("x-endpoint-version".to_string(), version.clone()),
            ],
            has_body: !body.is_empty(),
        };

        let chunks = body.chunks(self.chunk_size).map(<[u8]>::to_vec).collect();
        state.bodies.insert(request_id, chunks);

        tracing::debug!(request_id, %path, method = %request.method, "Handled request");
        serde_json::to_value(response)
            .map_err(|e| WorkerFailure::with_code("E_INTERNAL", e.to_string()))
    }
}

#[async_trait::async_trait]
impl CommandHandler for EchoWorker {
    async fn handle(&self, command: WorkerCommand) -> Result<serde_json::Value, WorkerFailure> {
        let mut state = self.lock()?;

        if let WorkerCommand::InitWorker { worker_id } = command {
            if let Some(existing) = state.worker_id {
                return Err(WorkerFailure::with_code(
                    "E_ALREADY_INITIALIZED",
                    format!("worker already initialized as {}", existing),
                ));
            }
            state.worker_id = Some(worker_id);
            tracing::info!(worker_id, "Worker initialized");
            return Ok(serde_json::Value::Null);
        }

        if state.worker_id.is_none() {
            return Err(WorkerFailure::with_code(
                "E_NOT_INITIALIZED",
                "initWorker must be the first call",
            ));
        }

        match command {
            WorkerCommand::ImportEndpoint {
                path,
                api_version,
                version,
            } => {
                tracing::debug!(%path, %api_version, %version, "Imported endpoint");
                state.endpoints.insert((api_version, path), version);
                Ok(serde_json::Value::Null)
            }
            WorkerCommand::CallHandler {
                request_id,
                path,
                api_version,
                request,
            } => self.call_handler(&mut state, request_id, path, api_version, request),
            WorkerCommand::ReadWorkerChannel { request_id } => {
                let Some(chunks) = state.bodies.get_mut(&request_id) else {
                    return Err(WorkerFailure::with_code(
                        "E_NO_REQUEST",
                        format!("request {} is not open", request_id),
                    ));
                };
                Ok(chunks
                    .pop_front()
                    .map(|chunk| serde_json::Value::String(encode_chunk(&chunk)))
                    .unwrap_or(serde_json::Value::Null))
            }
            other => Err(WorkerFailure::with_code(
                "E_NOT_A_CALL",
                format!("{} expects no reply", other.label()),
            )),
        }
    }

    async fn notify(&self, command: WorkerCommand) {
        if let WorkerCommand::EndOfRequest { request_id } = command
            && let Ok(mut state) = self.lock()
            && state.bodies.remove(&request_id).is_none()
        {
            tracing::warn!(request_id, "endOfRequest for unknown request");
        }
    }
}
