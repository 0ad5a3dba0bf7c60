//! Call sequencer - turns a single-flight worker channel into concurrent calls.
//!
//! Flow:
//! 1. `call()` hands the request to the driver task and returns a `CallHandle`
//! 2. Driver appends it to the `CallQueue`; if the worker was idle it is sent now
//! 3. Each reply settles the queue head, which is then removed
//! 4. If more calls are queued, the new head is sent immediately
//!
//! Only the driver touches the queue and the channel. Callers talk to it over an
//! unbounded mpsc, so `call()` and `notify()` never block.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{Envelope, WorkerFailure, WorkerReply};
use crate::bridge::transport::WorkerChannel;

/// What a call's handle resolves to.
pub type Settlement = Result<serde_json::Value, CallError>;

/// Identifier for one sequencer, carried in its log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequencerId(uuid::Uuid);

impl SequencerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SequencerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SequencerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single call, as seen by its caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The worker answered this call with an error payload.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerFailure),

    /// The sequencer stopped before this call was settled.
    #[error("sequencer closed before the call settled")]
    Closed,

    #[error("`{label}` expects no reply; send it with notify()")]
    NotACall { label: &'static str },

    #[error("`{label}` expects a reply; send it with call()")]
    NotANotification { label: &'static str },
}

impl CallError {
    pub fn worker_failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Worker(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Fatal sequencer outcome. Returned by the driver, never by a call.
///
/// Every variant means correlation between requests and replies is lost, so
/// the sequencer stops and all pending calls fail with `CallError::Closed`.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("protocol violation: reply received with no pending call")]
    UnsolicitedReply,

    #[error("protocol violation: channel error: {0}")]
    Transport(#[from] io::Error),

    #[error("worker closed the channel with {pending} call(s) pending")]
    WorkerClosed { pending: usize },

    #[error("sequencer driver task failed: {0}")]
    DriverFailed(#[source] tokio::task::JoinError),
}

/// Lifecycle of one queued call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Queued,
    Dispatched,
}

/// One call waiting for its reply.
///
/// `request` is `Some` while queued and taken when the call is dispatched.
struct PendingCall<Req> {
    request: Option<Req>,
    settle: oneshot::Sender<Settlement>,
}

impl<Req> PendingCall<Req> {
    fn state(&self) -> CallState {
        if self.request.is_some() {
            CallState::Queued
        } else {
            CallState::Dispatched
        }
    }
}

/// FIFO of pending calls. The head is the call the worker is working on.
///
/// Pure bookkeeping: methods return the request that must be written next, and
/// the owner writes it. At most one entry is ever `Dispatched`, and it is
/// always the head.
pub struct CallQueue<Req> {
    calls: VecDeque<PendingCall<Req>>,
}

impl<Req> Default for CallQueue<Req> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req> CallQueue<Req> {
    pub fn new() -> Self {
        Self {
            calls: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// State of the call at `position` (0 is the head).
    pub fn state(&self, position: usize) -> Option<CallState> {
        self.calls.get(position).map(PendingCall::state)
    }

    /// Append a call. Returns the request to send if the worker was idle.
    pub fn push(&mut self, request: Req, settle: oneshot::Sender<Settlement>) -> Option<Req> {
        let was_idle = self.calls.is_empty();
        self.calls.push_back(PendingCall {
            request: Some(request),
            settle,
        });
        if was_idle { self.dispatch_head() } else { None }
    }

    /// Settle the head with `reply`, remove it, and return the next request to send.
    pub fn settle_head(&mut self, reply: WorkerReply) -> Result<Option<Req>, SequencerError> {
        let Some(head) = self.calls.front() else {
            return Err(SequencerError::UnsolicitedReply);
        };
        debug_assert_eq!(head.state(), CallState::Dispatched);

        let outcome = reply.into_result().map_err(CallError::Worker);
        if let Some(call) = self.calls.pop_front()
            && call.settle.send(outcome).is_err()
        {
            tracing::debug!("Caller dropped its handle before the reply arrived");
        }

        Ok(self.dispatch_head())
    }

    fn dispatch_head(&mut self) -> Option<Req> {
        self.calls.front_mut().and_then(|head| head.request.take())
    }
}

/// Awaitable result of one call. Settles exactly once.
///
/// Dropping the handle does not cancel the call; the worker still runs it and
/// its reply is discarded.
#[must_use = "a call's result is only observable through its handle"]
pub struct CallHandle {
    rx: oneshot::Receiver<Settlement>,
}

impl Future for CallHandle {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::Closed)))
    }
}

enum Submission<Req> {
    Call {
        request: Req,
        settle: oneshot::Sender<Settlement>,
    },
    Notify {
        request: Req,
    },
    CloseWith {
        request: Req,
    },
}

/// Caller-facing handle to a sequencer. Cheap to clone.
pub struct CallSequencer<Req> {
    id: SequencerId,
    tx: mpsc::UnboundedSender<Submission<Req>>,
    pending: Arc<AtomicUsize>,
}

impl<Req> Clone for CallSequencer<Req> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<Req: Envelope> CallSequencer<Req> {
    /// Build a sequencer over `channel`. The driver must be run for calls to progress.
    pub fn new<R, W>(channel: WorkerChannel<R, W, Req>) -> (Self, SequencerDriver<R, W, Req>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let id = SequencerId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let handle = Self {
            id,
            tx,
            pending: Arc::clone(&pending),
        };
        let driver = SequencerDriver {
            id,
            channel,
            rx,
            queue: CallQueue::new(),
            pending,
        };
        (handle, driver)
    }

    /// Build a sequencer and run its driver on the current tokio runtime.
    pub fn spawn<R, W>(
        channel: WorkerChannel<R, W, Req>,
    ) -> (Self, JoinHandle<Result<(), SequencerError>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, driver) = Self::new(channel);
        let join = tokio::spawn(driver.run());
        (handle, join)
    }

    pub fn id(&self) -> SequencerId {
        self.id
    }

    /// Submit a call. The only synchronous error is passing a notification.
    pub fn call(&self, request: Req) -> Result<CallHandle, CallError> {
        if !request.expects_reply() {
            return Err(CallError::NotACall {
                label: request.label(),
            });
        }

        let (settle, rx) = oneshot::channel();
        if self.tx.send(Submission::Call { request, settle }).is_err() {
            // The returned submission drops its sender, so the handle reports Closed.
            tracing::debug!(sequencer = %self.id, "Call submitted after sequencer stopped");
        }
        Ok(CallHandle { rx })
    }

    /// Write a fire-and-forget message. It never enters the call queue.
    pub fn notify(&self, request: Req) -> Result<(), CallError> {
        if request.expects_reply() {
            return Err(CallError::NotANotification {
                label: request.label(),
            });
        }

        self.tx
            .send(Submission::Notify { request })
            .map_err(|_| CallError::Closed)
    }

    /// Stop taking submissions, then write `request` once every call submitted
    /// before it has settled. The driver exits right after writing it.
    ///
    /// Anything submitted afterwards is discarded; calls resolve to `Closed`.
    pub fn close_with(&self, request: Req) -> Result<(), CallError> {
        if request.expects_reply() {
            return Err(CallError::NotANotification {
                label: request.label(),
            });
        }

        self.tx
            .send(Submission::CloseWith { request })
            .map_err(|_| CallError::Closed)
    }

    /// Number of calls queued or in flight, as last seen by the driver.
    pub fn pending_calls(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Single owner of the call queue and the worker channel.
///
/// `run()` returns `Ok(())` once every `CallSequencer` is dropped (or
/// `close_with` was used) and the queue has drained, or when the worker closes
/// an idle channel. Any protocol
/// violation ends it with an error.
pub struct SequencerDriver<R, W, Req> {
    id: SequencerId,
    channel: WorkerChannel<R, W, Req>,
    rx: mpsc::UnboundedReceiver<Submission<Req>>,
    queue: CallQueue<Req>,
    pending: Arc<AtomicUsize>,
}

impl<R, W, Req> SequencerDriver<R, W, Req>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    Req: Envelope,
{
    pub async fn run(mut self) -> Result<(), SequencerError> {
        tracing::debug!(sequencer = %self.id, "Sequencer driver starting");
        let result = self.event_loop().await;

        // Stop intake first so late calls see Closed rather than hang.
        self.rx.close();
        self.pending.store(0, Ordering::Release);

        match &result {
            Ok(()) => tracing::debug!(sequencer = %self.id, "Sequencer driver exiting"),
            Err(e) => tracing::error!(
                sequencer = %self.id,
                pending = self.queue.len(),
                error = %e,
                "Sequencer failed, abandoning pending calls"
            ),
        }
        // Dropping the queue drops every settle sender; their handles resolve to Closed.
        result
    }

    async fn event_loop(&mut self) -> Result<(), SequencerError> {
        let mut accepting = true;
        let mut last_word: Option<Req> = None;

        loop {
            if !accepting && self.queue.is_empty() {
                if let Some(request) = last_word.take() {
                    tracing::debug!(sequencer = %self.id, cmd = request.label(), "Queue drained, sending final notification");
                    self.write(request).await?;
                }
                return Ok(());
            }

            tokio::select! {
                biased;

                reply = self.channel.reader.next() => {
                    match reply {
                        Some(Ok(reply)) => self.on_reply(reply).await?,
                        Some(Err(e)) => return Err(SequencerError::Transport(e)),
                        None if self.queue.is_empty() => {
                            tracing::info!(sequencer = %self.id, "Worker closed the channel");
                            return Ok(());
                        }
                        None => {
                            return Err(SequencerError::WorkerClosed {
                                pending: self.queue.len(),
                            });
                        }
                    }
                }

                submission = self.rx.recv(), if accepting => {
                    match submission {
                        Some(Submission::Call { request, settle }) => {
                            self.on_call(request, settle).await?;
                        }
                        Some(Submission::Notify { request }) => {
                            tracing::trace!(sequencer = %self.id, cmd = request.label(), "Sending notification");
                            self.write(request).await?;
                        }
                        Some(Submission::CloseWith { request }) => {
                            let discarded = self.stop_intake();
                            tracing::debug!(
                                sequencer = %self.id,
                                pending = self.queue.len(),
                                discarded,
                                "Closing after queue drains"
                            );
                            last_word = Some(request);
                            accepting = false;
                        }
                        None => {
                            tracing::debug!(
                                sequencer = %self.id,
                                pending = self.queue.len(),
                                "All callers gone, draining queue"
                            );
                            accepting = false;
                        }
                    }
                }
            }
        }
    }

    /// Close the submission channel and drop whatever is still buffered in it.
    fn stop_intake(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        // Dropped settle senders resolve their handles to Closed.
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    async fn on_call(
        &mut self,
        request: Req,
        settle: oneshot::Sender<Settlement>,
    ) -> Result<(), SequencerError> {
        let label = request.label();
        let dispatch = self.queue.push(request, settle);
        self.pending.store(self.queue.len(), Ordering::Release);

        match dispatch {
            Some(request) => {
                tracing::trace!(sequencer = %self.id, cmd = label, "Dispatching call to idle worker");
                self.write(request).await
            }
            None => {
                tracing::trace!(
                    sequencer = %self.id,
                    cmd = label,
                    pending = self.queue.len(),
                    "Worker busy, call queued"
                );
                Ok(())
            }
        }
    }

    async fn on_reply(&mut self, reply: WorkerReply) -> Result<(), SequencerError> {
        if reply.is_err() {
            tracing::debug!(sequencer = %self.id, "Worker rejected call");
        }
        let next = self.queue.settle_head(reply)?;
        self.pending.store(self.queue.len(), Ordering::Release);

        if let Some(request) = next {
            tracing::trace!(sequencer = %self.id, cmd = request.label(), "Dispatching next queued call");
            self.write(request).await?;
        }
        Ok(())
    }

    async fn write(&mut self, request: Req) -> Result<(), SequencerError> {
        self.channel
            .writer
            .send(request)
            .await
            .map_err(SequencerError::Transport)
    }
}
