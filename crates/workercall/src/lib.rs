//! workercall: ordered request/response calls over a single-flight worker channel.

pub mod bridge;
pub mod client;
pub mod echo;
pub mod logging;
pub mod sequencer;
pub mod spawn;
pub mod worker;

pub use bridge::protocol::{
    Envelope, HandlerRequest, HandlerResponse, WorkerCommand, WorkerFailure, WorkerReply,
};
pub use bridge::transport::WorkerChannel;
pub use client::{ClientError, HandlerOutcome, WorkerClient};
pub use sequencer::{
    CallError, CallHandle, CallQueue, CallSequencer, CallState, SequencerDriver, SequencerError,
    SequencerId,
};
pub use spawn::{SpawnConfig, SpawnError, WorkerProcess, WorkerSpawner, spawn_worker};
pub use worker::{CommandHandler, run_worker};
