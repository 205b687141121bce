//! kb-relay: Duplex relay engine for kbridge
//!
//! This crate moves frames between a local ("downstream") connection and a
//! remote ("upstream") WebSocket. It owns the ordering, buffering and
//! shutdown rules; the front-ends in `kb-proxy` only decide which
//! connections to pair.

pub mod downstream;
pub mod queue;
pub mod relay;
pub mod ws;

pub use downstream::{
    service_unavailable_block, ByteDownstream, Downstream, DownstreamReader, DownstreamWriter,
    MessageDownstream, UpstreamFault,
};
pub use queue::{FrameQueue, FrameReceiver, FrameSender, QueueClosed};
pub use relay::{DuplexRelay, RelayOutcome, RelayState, Termination};
