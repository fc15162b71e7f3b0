//! SST: a reliable, ordered, multi-stream transport layered on best-effort
//! datagrams. A connection between two endpoints multiplexes a tree of
//! substreams rooted at the connection's initial stream; every stream is an
//! independently flow-controlled reliable byte stream.

pub mod connection;
pub mod error;
pub mod packet;
pub mod service;
pub mod stream;

pub use connection::{CloseReason, ConnectionState, ROOT_LSID};
pub use error::SstError;
pub use packet::{PacketType, SstHeader, SstPacket};
pub use service::{Endpoint, SstDatagram, SstEvent, SstService};
pub use stream::StreamState;

use crate::time::SpaceDuration;

/// Transport tuning knobs. The defaults document the choices the protocol
/// itself leaves open: initial window of four segments, additive increase
/// of one segment per ack advance, multiplicative decrease to half on loss,
/// 200ms initial retransmission timeout doubling to a 10s ceiling, and six
/// retries before a connection is declared dead.
#[derive(Clone, Debug)]
pub struct SstConfig {
    pub max_segment_bytes: usize,
    pub initial_cwnd_segments: usize,
    pub send_buffer_bytes: usize,
    pub recv_window_bytes: usize,
    pub recv_window_segments: usize,
    pub rto_initial: SpaceDuration,
    pub rto_ceiling: SpaceDuration,
    pub max_retries: u32,
    pub close_linger: SpaceDuration,
}

impl Default for SstConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 1280,
            initial_cwnd_segments: 4,
            send_buffer_bytes: 256 * 1024,
            recv_window_bytes: 64 * 1024,
            recv_window_segments: 128,
            rto_initial: SpaceDuration::from_millis(200),
            rto_ceiling: SpaceDuration::from_secs(10),
            max_retries: 6,
            close_linger: SpaceDuration::from_secs(30),
        }
    }
}

impl SstConfig {
    pub fn initial_cwnd_bytes(&self) -> usize {
        self.max_segment_bytes * self.initial_cwnd_segments
    }
}
