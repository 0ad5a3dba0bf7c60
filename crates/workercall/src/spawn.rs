//! Worker subprocess lifecycle.
//!
//! Flow:
//! 1. Spawn the worker process with piped stdin/stdout
//! 2. Wrap the pipes in a WorkerChannel and start the sequencer driver
//! 3. Send initWorker and wait for its reply (bounded by `init_timeout`)
//! 4. Hand back a WorkerProcess owning the child, the client and the driver

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::protocol::WorkerCommand;
use crate::bridge::transport::WorkerChannel;
use crate::client::{ClientError, WorkerClient};
use crate::sequencer::{CallSequencer, SequencerError};

/// Channel type for a worker running as a child process.
pub type ProcessChannel = WorkerChannel<ChildStdout, ChildStdin, WorkerCommand>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    Pipe(&'static str),
    #[error("worker initialization failed: {0}")]
    Init(#[source] ClientError),
    #[error("worker initialization timed out after {0:?}")]
    InitTimeout(Duration),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &SpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawner that runs `config.program` with `config.args`.
///
/// stdin/stdout carry the protocol; stderr is inherited so worker logs reach
/// the host's stderr.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&config.program)
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub struct SpawnConfig {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub worker_id: u32,
    pub init_timeout: Duration,
    pub max_frame_length: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl SpawnConfig {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            worker_id: 0,
            init_timeout: Duration::from_secs(30),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_worker_id(mut self, worker_id: u32) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// A running, initialized worker process.
pub struct WorkerProcess {
    child: Child,
    client: WorkerClient,
    driver: JoinHandle<Result<(), SequencerError>>,
}

impl WorkerProcess {
    pub fn client(&self) -> &WorkerClient {
        &self.client
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Let queued calls finish, ask the worker to exit, wait for it, and return
    /// the driver's outcome.
    pub async fn shutdown(self) -> Result<(), SequencerError> {
        if let Err(e) = self.client.shutdown() {
            tracing::warn!(error = %e, "Failed to send shutdown to worker");
        }
        drop(self.client);

        // The driver writes shutdown only after the queue drains, so wait for it first.
        let result = driver_outcome(self.driver.await);

        let mut child = self.child;
        match child.wait().await {
            Ok(status) => tracing::info!(%status, "Worker exited"),
            Err(e) => tracing::warn!(error = %e, "Failed to wait for worker"),
        }
        result
    }

    /// Wait for the sequencer driver to stop on its own, e.g. after a protocol
    /// violation, then kill the worker.
    pub async fn wait_driver(self) -> Result<(), SequencerError> {
        let result = driver_outcome(self.driver.await);
        drop(self.client);

        let mut child = self.child;
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Failed to kill worker");
        }
        result
    }
}

fn driver_outcome(
    joined: Result<Result<(), SequencerError>, tokio::task::JoinError>,
) -> Result<(), SequencerError> {
    joined.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Sequencer driver task failed");
        Err(SequencerError::DriverFailed(e))
    })
}

pub async fn spawn_worker(config: SpawnConfig) -> Result<WorkerProcess, SpawnError> {
    tracing::info!(program = ?config.program, "Spawning worker subprocess");
    let mut child = config.spawner.spawn(&config)?;

    let stdin = child.stdin.take().ok_or(SpawnError::Pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::Pipe("stdout"))?;

    let channel = WorkerChannel::with_max_frame_length(stdout, stdin, config.max_frame_length);
    let (sequencer, driver) = CallSequencer::spawn(channel);
    let client = WorkerClient::new(sequencer);

    tracing::debug!(worker_id = config.worker_id, "Sending initWorker");
    match tokio::time::timeout(config.init_timeout, client.init_worker(config.worker_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Worker initialization failed");
            return Err(SpawnError::Init(e));
        }
        Err(_) => {
            tracing::error!(timeout = ?config.init_timeout, "Worker initialization timed out");
            return Err(SpawnError::InitTimeout(config.init_timeout));
        }
    }

    tracing::info!(pid = ?child.id(), sequencer = %client.sequencer().id(), "Worker ready");
    Ok(WorkerProcess {
        child,
        client,
        driver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSpawner;

    impl WorkerSpawner for FailingSpawner {
        fn spawn(&self, _config: &SpawnConfig) -> Result<Child, SpawnError> {
            Err(SpawnError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such worker",
            )))
        }
    }

    #[test]
    fn spawn_config_defaults() {
        let config = SpawnConfig::new("worker");
        assert_eq!(config.program, OsString::from("worker"));
        assert!(config.args.is_empty());
        assert_eq!(config.worker_id, 0);
        assert_eq!(config.init_timeout, Duration::from_secs(30));
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
    }

    #[test]
    fn spawn_config_builder() {
        let config = SpawnConfig::new("worker")
            .with_arg("--flag")
            .with_env("WORKERCALL_LOG", "debug")
            .with_worker_id(7)
            .with_init_timeout(Duration::from_secs(1))
            .with_max_frame_length(1024);
        assert_eq!(config.args, vec![OsString::from("--flag")]);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.worker_id, 7);
        assert_eq!(config.init_timeout, Duration::from_secs(1));
        assert_eq!(config.max_frame_length, 1024);
    }

    #[tokio::test]
    async fn spawner_failure_is_reported() {
        let config = SpawnConfig::new("worker").with_spawner(Arc::new(FailingSpawner));
        let err = spawn_worker(config).await.err().unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let config = SpawnConfig::new("/nonexistent/workercall-worker");
        let err = spawn_worker(config).await.err().unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[tokio::test]
    async fn crashed_driver_is_not_a_clean_stop() {
        let driver = tokio::spawn(std::future::pending::<Result<(), SequencerError>>());
        driver.abort();

        let result = driver_outcome(driver.await);
        assert!(matches!(result, Err(SequencerError::DriverFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unsolicited_reply_after_init_stops_driver() {
        // Answers initWorker, then sends a second reply nobody asked for.
        let script = r#"head -c 1 >/dev/null; printf '\000\000\000\013{"value":1}\000\000\000\013{"value":2}'; sleep 10"#;
        let config = SpawnConfig::new("sh")
            .with_arg("-c")
            .with_arg(script)
            .with_init_timeout(Duration::from_secs(5));

        let worker = spawn_worker(config).await.unwrap();
        assert!(worker.id().is_some());

        let result = worker.wait_driver().await;
        assert!(matches!(result, Err(SequencerError::UnsolicitedReply)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_that_exits_fails_init() {
        let config = SpawnConfig::new("true").with_init_timeout(Duration::from_secs(5));
        let err = spawn_worker(config).await.err().unwrap();
        assert!(matches!(err, SpawnError::Init(_)));
    }
}
