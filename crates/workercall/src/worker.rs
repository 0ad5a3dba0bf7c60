//! Worker side of the channel.
//!
//! The counterpart of the sequencer: reads one command, runs it, writes exactly
//! one reply for calls and nothing for notifications, then reads the next.
//! Serial processing is what makes reply order match request order.

use std::io;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Envelope, WorkerCommand, WorkerFailure, WorkerReply};
use crate::bridge::transport::WorkerEnd;

/// Trait for the command handler - abstracts what the worker actually runs.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Run a command that expects a reply.
    async fn handle(&self, command: WorkerCommand) -> Result<serde_json::Value, WorkerFailure>;

    /// Observe a notification. No reply is written whatever happens here.
    async fn notify(&self, command: WorkerCommand) {
        tracing::trace!(cmd = command.label(), "Notification ignored");
    }
}

/// Run the worker loop over raw byte streams (e.g. stdin/stdout).
pub async fn run_worker<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> io::Result<()>
where
    H: CommandHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let commands = FramedRead::new(reader, JsonCodec::<WorkerCommand>::new());
    let replies = FramedWrite::new(writer, JsonCodec::<WorkerReply>::new());
    serve(handler, commands, replies).await
}

/// Run the worker loop on the worker end of an in-memory pipe.
pub async fn run_worker_on<H: CommandHandler>(
    handler: Arc<H>,
    end: WorkerEnd<WorkerCommand>,
) -> io::Result<()> {
    serve(handler, end.reader, end.writer).await
}

async fn serve<H, S, K>(handler: Arc<H>, mut commands: S, mut replies: K) -> io::Result<()>
where
    H: CommandHandler,
    S: Stream<Item = io::Result<WorkerCommand>> + Unpin,
    K: Sink<WorkerReply, Error = io::Error> + Unpin,
{
    tracing::info!("Worker ready for commands");

    loop {
        match commands.next().await {
            Some(Ok(WorkerCommand::Shutdown)) => {
                tracing::info!("Shutdown requested");
                handler.notify(WorkerCommand::Shutdown).await;
                break;
            }
            Some(Ok(command)) if command.expects_reply() => {
                let label = command.label();
                tracing::trace!(cmd = label, "Command received");
                let result = handler.handle(command).await;
                if let Err(ref failure) = result {
                    tracing::debug!(cmd = label, error = %failure, "Command failed");
                }
                replies.send(WorkerReply::from(result)).await?;
            }
            Some(Ok(command)) => {
                tracing::trace!(cmd = command.label(), "Notification received");
                handler.notify(command).await;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Command channel error");
                return Err(e);
            }
            None => {
                tracing::info!("Host closed the channel, exiting");
                break;
            }
        }
    }

    tracing::info!("Worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::bridge::transport::pipe;
    use crate::sequencer::{CallError, CallSequencer};

    #[derive(Default)]
    struct Recorder {
        notified: Mutex<Vec<WorkerCommand>>,
    }

    #[async_trait::async_trait]
    impl CommandHandler for Recorder {
        async fn handle(
            &self,
            command: WorkerCommand,
        ) -> Result<serde_json::Value, WorkerFailure> {
            match command {
                WorkerCommand::InitWorker { worker_id } => Ok(json!(worker_id)),
                other => Err(WorkerFailure::with_code("E_UNSUPPORTED", other.label())),
            }
        }

        async fn notify(&self, command: WorkerCommand) {
            self.notified.lock().unwrap().push(command);
        }
    }

    #[tokio::test]
    async fn worker_answers_calls_in_order() {
        let (host, end) = pipe::<WorkerCommand>(64 * 1024);
        let recorder = Arc::new(Recorder::default());
        let worker = tokio::spawn(run_worker_on(Arc::clone(&recorder), end));
        let (seq, _driver) = CallSequencer::spawn(host);

        let init = seq.call(WorkerCommand::InitWorker { worker_id: 4 }).unwrap();
        let read = seq
            .call(WorkerCommand::ReadWorkerChannel { request_id: 1 })
            .unwrap();

        assert_eq!(init.await.unwrap(), json!(4));
        let err = read.await.unwrap_err();
        assert!(matches!(err, CallError::Worker(_)));
        assert_eq!(
            err.worker_failure().and_then(|f| f.code()),
            Some("E_UNSUPPORTED")
        );

        seq.notify(WorkerCommand::Shutdown).unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let (host, end) = pipe::<WorkerCommand>(64 * 1024);
        let recorder = Arc::new(Recorder::default());
        let worker = tokio::spawn(run_worker_on(Arc::clone(&recorder), end));
        let (seq, _driver) = CallSequencer::spawn(host);

        seq.notify(WorkerCommand::EndOfRequest { request_id: 3 })
            .unwrap();
        // A stray reply to the notification would be fatal for the sequencer.
        let init = seq.call(WorkerCommand::InitWorker { worker_id: 1 }).unwrap();
        assert_eq!(init.await.unwrap(), json!(1));

        seq.notify(WorkerCommand::Shutdown).unwrap();
        worker.await.unwrap().unwrap();

        let notified = recorder.notified.lock().unwrap().clone();
        assert_eq!(
            notified,
            vec![
                WorkerCommand::EndOfRequest { request_id: 3 },
                WorkerCommand::Shutdown
            ]
        );
    }

    #[tokio::test]
    async fn worker_exits_when_host_closes() {
        let (host, end) = pipe::<WorkerCommand>(1024);
        let worker = tokio::spawn(run_worker_on(Arc::new(Recorder::default()), end));
        drop(host);
        assert!(worker.await.unwrap().is_ok());
    }
}
