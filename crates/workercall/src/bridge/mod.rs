//! IPC bridge between the host and its worker.
//!
//! This module provides the wire protocol, codec and channel plumbing that the
//! call sequencer runs on.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerCommand, WorkerReply, HTTP-shaped payloads)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: WorkerChannel and its ordering contract

pub mod codec;
pub mod protocol;
pub mod transport;
