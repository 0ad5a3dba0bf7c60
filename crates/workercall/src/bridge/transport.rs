//! Worker channel transport.
//!
//! The channel contract the sequencer relies on:
//! - **ordered**: replies come back in the order requests were written;
//! - **reliable**: frames are neither dropped nor duplicated;
//! - **single-flight**: the worker reads its next request only after replying
//!   to the previous one.
//!
//! Nothing on the wire correlates a reply with its request, so these
//! properties are the only correlation there is.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonCodec};
use super::protocol::WorkerReply;

/// Framed reader/writer pair for one worker.
///
/// `Req` is the outbound payload type; inbound frames are always `WorkerReply`.
pub struct WorkerChannel<R, W, Req> {
    pub(crate) reader: FramedRead<R, JsonCodec<WorkerReply>>,
    pub(crate) writer: FramedWrite<W, JsonCodec<Req>>,
}

impl<R, W, Req> WorkerChannel<R, W, Req>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_frame_length(reader, writer, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(reader: R, writer: W, max_frame_length: usize) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonCodec::with_max_frame_length(max_frame_length)),
            writer: FramedWrite::new(writer, JsonCodec::with_max_frame_length(max_frame_length)),
        }
    }
}

/// Worker end of an in-memory channel: reads `Req`, writes `WorkerReply`.
pub struct WorkerEnd<Req> {
    pub reader: FramedRead<ReadHalf<DuplexStream>, JsonCodec<Req>>,
    pub writer: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<WorkerReply>>,
}

/// Host end of an in-memory channel.
pub type HostEnd<Req> = WorkerChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, Req>;

/// Create an in-memory host/worker channel pair.
///
/// Used to run a worker loop in the same process, and by tests that play the
/// worker by hand.
pub fn pipe<Req>(buffer: usize) -> (HostEnd<Req>, WorkerEnd<Req>) {
    let (host, worker) = tokio::io::duplex(buffer);
    let (host_read, host_write) = tokio::io::split(host);
    let (worker_read, worker_write) = tokio::io::split(worker);

    let host_end = WorkerChannel::new(host_read, host_write);
    let worker_end = WorkerEnd {
        reader: FramedRead::new(worker_read, JsonCodec::new()),
        writer: FramedWrite::new(worker_write, JsonCodec::new()),
    };
    (host_end, worker_end)
}
