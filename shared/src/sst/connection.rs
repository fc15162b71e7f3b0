use std::collections::HashMap;

use log::warn;

use crate::sst::error::SstError;
use crate::sst::packet::{
    ConnectionHandshake, PacketType, SstHeader, SstPacket, SubstreamHandshake,
};
use crate::sst::stream::{Stream, StreamOutput, StreamPacket, StreamState};
use crate::sst::SstConfig;
use crate::time::{SpaceDuration, SpaceInstant};

/// Connection lifecycle per the transport contract.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Pending,
    Connected,
    Disconnecting,
    TimedOut,
    Closed,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CloseReason {
    Graceful,
    Forced,
    TimedOut,
}

/// Events surfaced by a connection; the service decorates them with the
/// remote endpoint.
#[derive(Clone, Debug)]
pub enum ConnEvent {
    Established,
    Failed,
    StreamConnected { lsid: u16 },
    IncomingStream { lsid: u16, parent_lsid: u16, port: u32 },
    StreamData { lsid: u16, bytes: Vec<u8> },
    StreamClosed { lsid: u16, graceful: bool },
    Closed { reason: CloseReason },
}

/// The root stream of every connection.
pub const ROOT_LSID: u16 = 0;

// Every stream opens with this sequence number; the value itself is
// exchanged in the handshake so peers never assume it.
const INITIAL_STREAM_SEQ: u32 = 1;

struct PendingInit {
    payload: Vec<u8>,
    sent_at: SpaceInstant,
    rto: SpaceDuration,
    retries: u32,
}

/// One SST connection: a pair of channel identifiers, a tree of substreams
/// rooted at lsid 0, and handshake/retransmit state. Substream ids are
/// allocated from a monotonic counter partitioned by initiator: the
/// initiator uses even ids, the acceptor odd, so concurrent opens never
/// collide.
pub struct Connection {
    pub local_channel: u32,
    pub remote_channel: u32,
    pub state: ConnectionState,
    pub local_port: u32,
    pub remote_port: u32,

    initiated: bool,
    next_lsid: u16,
    streams: HashMap<u16, Stream>,
    root_handshake: Option<PendingInit>,
    pending_substreams: HashMap<u16, PendingInit>,
    events: Vec<ConnEvent>,
}

impl Connection {
    /// Initiator side: sends the opening Init from `advance` until the
    /// InitAck arrives.
    pub fn connect(
        local_channel: u32,
        local_port: u32,
        remote_port: u32,
        config: &SstConfig,
        now: SpaceInstant,
    ) -> Self {
        let mut streams = HashMap::new();
        streams.insert(
            ROOT_LSID,
            Stream::new(
                ROOT_LSID,
                ROOT_LSID,
                local_port,
                remote_port,
                StreamState::Pending,
                INITIAL_STREAM_SEQ,
                0,
                config.recv_window_bytes,
                config,
            ),
        );
        let handshake = ConnectionHandshake {
            initial_seq: INITIAL_STREAM_SEQ,
            recv_window: config.recv_window_bytes as u32,
        };
        Self {
            local_channel,
            remote_channel: 0,
            state: ConnectionState::Pending,
            local_port,
            remote_port,
            initiated: true,
            next_lsid: 2,
            streams,
            root_handshake: Some(PendingInit {
                payload: handshake.encode(),
                sent_at: SpaceInstant::EPOCH,
                rto: config.rto_initial,
                retries: 0,
            }),
            pending_substreams: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Acceptor side: constructed from an incoming connection Init; the
    /// InitAck reply is produced immediately.
    pub fn accept(
        local_channel: u32,
        remote_channel: u32,
        local_port: u32,
        remote_port: u32,
        peer: ConnectionHandshake,
        config: &SstConfig,
    ) -> (Self, SstPacket) {
        let mut streams = HashMap::new();
        let mut root = Stream::new(
            ROOT_LSID,
            ROOT_LSID,
            local_port,
            remote_port,
            StreamState::Connected,
            INITIAL_STREAM_SEQ,
            peer.initial_seq,
            peer.recv_window as usize,
            config,
        );
        root.complete_handshake(peer.initial_seq, peer.recv_window as usize);
        streams.insert(ROOT_LSID, root);

        let connection = Self {
            local_channel,
            remote_channel,
            state: ConnectionState::Connected,
            local_port,
            remote_port,
            initiated: false,
            next_lsid: 3,
            streams,
            root_handshake: None,
            pending_substreams: HashMap::new(),
            events: Vec::new(),
        };
        let ack = connection.init_ack_packet(ROOT_LSID, config);
        (connection, ack)
    }

    fn init_ack_packet(&self, lsid: u16, config: &SstConfig) -> SstPacket {
        SstPacket {
            header: SstHeader {
                channel_id: self.local_channel,
                connection_id: self.remote_channel,
                lsid,
                seq: INITIAL_STREAM_SEQ,
                ack: self
                    .streams
                    .get(&lsid)
                    .map(|stream| stream.cumulative_ack())
                    .unwrap_or(0),
                packet_type: PacketType::InitAck,
            },
            payload: ConnectionHandshake {
                initial_seq: INITIAL_STREAM_SEQ,
                recv_window: config.recv_window_bytes as u32,
            }
            .encode(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<ConnEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Pending | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    // Stream surface

    /// Open a child stream under `parent_lsid`. The stream is usable
    /// immediately; bytes queue until the peer's InitAck arrives.
    pub fn open_substream(
        &mut self,
        parent_lsid: u16,
        local_port: u32,
        remote_port: u32,
        config: &SstConfig,
    ) -> Result<u16, SstError> {
        if self.state != ConnectionState::Connected && self.state != ConnectionState::Pending {
            return Err(SstError::NotConnected {
                channel: self.local_channel,
            });
        }
        if !self.streams.contains_key(&parent_lsid) {
            return Err(SstError::UnknownStream {
                channel: self.local_channel,
                lsid: parent_lsid,
            });
        }
        let lsid = self.next_lsid;
        self.next_lsid = self.next_lsid.wrapping_add(2);

        self.streams.insert(
            lsid,
            Stream::new(
                lsid,
                parent_lsid,
                local_port,
                remote_port,
                StreamState::Pending,
                INITIAL_STREAM_SEQ,
                0,
                config.recv_window_bytes,
                config,
            ),
        );
        let handshake = SubstreamHandshake {
            parent_lsid,
            local_port,
            remote_port,
            initial_seq: INITIAL_STREAM_SEQ,
            recv_window: config.recv_window_bytes as u32,
        };
        self.pending_substreams.insert(
            lsid,
            PendingInit {
                payload: handshake.encode(),
                sent_at: SpaceInstant::EPOCH,
                rto: config.rto_initial,
                retries: 0,
            },
        );
        Ok(lsid)
    }

    pub fn send(&mut self, lsid: u16, bytes: &[u8], config: &SstConfig) -> Result<(), SstError> {
        if !self.is_open() {
            return Err(SstError::NotConnected {
                channel: self.local_channel,
            });
        }
        let stream = self.streams.get_mut(&lsid).ok_or(SstError::UnknownStream {
            channel: self.local_channel,
            lsid,
        })?;
        stream.send(bytes, config)
    }

    pub fn close_stream(&mut self, lsid: u16, graceful: bool) -> Result<(), SstError> {
        let stream = self.streams.get_mut(&lsid).ok_or(SstError::UnknownStream {
            channel: self.local_channel,
            lsid,
        })?;
        if graceful {
            stream.close_graceful();
        } else {
            let was_open = !stream.is_closed();
            stream.close_forced();
            if was_open {
                self.events.push(ConnEvent::StreamClosed {
                    lsid,
                    graceful: false,
                });
            }
            if lsid == ROOT_LSID {
                self.force_close(CloseReason::Forced);
            }
        }
        Ok(())
    }

    /// Drop every stream and close the connection immediately.
    pub fn force_close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed || self.state == ConnectionState::TimedOut {
            return;
        }
        for (lsid, stream) in self.streams.iter_mut() {
            if !stream.is_closed() {
                stream.close_forced();
                self.events.push(ConnEvent::StreamClosed {
                    lsid: *lsid,
                    graceful: reason == CloseReason::Graceful,
                });
            }
        }
        self.state = match reason {
            CloseReason::TimedOut => ConnectionState::TimedOut,
            _ => ConnectionState::Closed,
        };
        self.events.push(ConnEvent::Closed { reason });
    }

    // Packet handling

    /// Process one decoded packet addressed to this connection. Returns
    /// packets to transmit in direct response (FinAcks, InitAcks).
    pub fn handle_packet(&mut self, packet: SstPacket, config: &SstConfig) -> Vec<SstPacket> {
        let mut replies = Vec::new();
        let header = packet.header;

        match header.packet_type {
            PacketType::Init => {
                if header.lsid == ROOT_LSID {
                    // duplicate connection open: re-ack idempotently
                    if !self.initiated {
                        replies.push(self.init_ack_packet(ROOT_LSID, config));
                    }
                } else {
                    self.handle_substream_init(header, &packet.payload, config, &mut replies);
                }
            }
            PacketType::InitAck => self.handle_init_ack(header, &packet.payload, config),
            PacketType::Data => {
                let mut output = StreamOutput::default();
                if let Some(stream) = self.streams.get_mut(&header.lsid) {
                    stream.handle_ack(header.ack, config, &mut output);
                    if !packet.payload.is_empty() {
                        stream.handle_segment(
                            header.seq,
                            packet.payload,
                            false,
                            config,
                            &mut output,
                        );
                    }
                }
                self.surface(header.lsid, output);
            }
            PacketType::Fin => {
                let mut output = StreamOutput::default();
                if let Some(stream) = self.streams.get_mut(&header.lsid) {
                    stream.handle_ack(header.ack, config, &mut output);
                    stream.handle_segment(header.seq, packet.payload, true, config, &mut output);
                    if stream.remote_fin_received() {
                        replies.push(SstPacket {
                            header: SstHeader {
                                channel_id: self.local_channel,
                                connection_id: self.remote_channel,
                                lsid: header.lsid,
                                seq: stream.next_send_seq(),
                                ack: stream.cumulative_ack(),
                                packet_type: PacketType::FinAck,
                            },
                            payload: Vec::new(),
                        });
                    }
                } else {
                    // Fin for a stream we already tore down: re-ack so the
                    // peer stops retransmitting
                    replies.push(SstPacket {
                        header: SstHeader {
                            channel_id: self.local_channel,
                            connection_id: self.remote_channel,
                            lsid: header.lsid,
                            seq: 0,
                            ack: header.seq.wrapping_add(1),
                            packet_type: PacketType::FinAck,
                        },
                        payload: Vec::new(),
                    });
                }
                self.surface(header.lsid, output);
            }
            PacketType::FinAck => {
                let mut output = StreamOutput::default();
                if let Some(stream) = self.streams.get_mut(&header.lsid) {
                    stream.handle_ack(header.ack, config, &mut output);
                }
                self.surface(header.lsid, output);
            }
            PacketType::Rst => {
                if header.lsid == ROOT_LSID {
                    self.force_close(CloseReason::Forced);
                } else {
                    let mut output = StreamOutput::default();
                    if let Some(stream) = self.streams.get_mut(&header.lsid) {
                        stream.handle_rst(&mut output);
                    }
                    self.surface(header.lsid, output);
                }
            }
        }

        replies
    }

    fn handle_substream_init(
        &mut self,
        header: SstHeader,
        payload: &[u8],
        config: &SstConfig,
        replies: &mut Vec<SstPacket>,
    ) {
        if self.streams.contains_key(&header.lsid) {
            // duplicate Init: idempotent re-ack
            replies.push(self.init_ack_packet(header.lsid, config));
            return;
        }
        let handshake = match SubstreamHandshake::decode(payload) {
            Ok(handshake) => handshake,
            Err(error) => {
                warn!(
                    "dropping malformed substream init on channel {}: {}",
                    self.local_channel, error
                );
                return;
            }
        };
        // the opener's local port is our remote port and vice versa
        let mut stream = Stream::new(
            header.lsid,
            handshake.parent_lsid,
            handshake.remote_port,
            handshake.local_port,
            StreamState::Connected,
            INITIAL_STREAM_SEQ,
            handshake.initial_seq,
            handshake.recv_window as usize,
            config,
        );
        stream.complete_handshake(handshake.initial_seq, handshake.recv_window as usize);
        self.streams.insert(header.lsid, stream);
        replies.push(self.init_ack_packet(header.lsid, config));
        self.events.push(ConnEvent::IncomingStream {
            lsid: header.lsid,
            parent_lsid: handshake.parent_lsid,
            port: handshake.remote_port,
        });
    }

    fn handle_init_ack(&mut self, header: SstHeader, payload: &[u8], config: &SstConfig) {
        let handshake = match ConnectionHandshake::decode(payload) {
            Ok(handshake) => handshake,
            Err(error) => {
                warn!(
                    "dropping malformed init-ack on channel {}: {}",
                    self.local_channel, error
                );
                return;
            }
        };
        if header.lsid == ROOT_LSID {
            if self.state == ConnectionState::Pending {
                self.remote_channel = header.channel_id;
                self.state = ConnectionState::Connected;
                self.root_handshake = None;
                if let Some(root) = self.streams.get_mut(&ROOT_LSID) {
                    root.complete_handshake(handshake.initial_seq, handshake.recv_window as usize);
                }
                self.events.push(ConnEvent::Established);
            }
            return;
        }
        if self.pending_substreams.remove(&header.lsid).is_some() {
            if let Some(stream) = self.streams.get_mut(&header.lsid) {
                stream.complete_handshake(handshake.initial_seq, handshake.recv_window as usize);
            }
            self.events.push(ConnEvent::StreamConnected { lsid: header.lsid });
        }
    }

    fn surface(&mut self, lsid: u16, output: StreamOutput) {
        if !output.delivered.is_empty() {
            self.events.push(ConnEvent::StreamData {
                lsid,
                bytes: output.delivered,
            });
        }
        if output.closed_gracefully {
            self.events.push(ConnEvent::StreamClosed {
                lsid,
                graceful: true,
            });
            if lsid == ROOT_LSID {
                // root close tears the whole connection down once its Fin
                // exchange completes
                self.state = ConnectionState::Disconnecting;
                self.cascade_root_close();
            }
        }
        if output.closed_forced {
            self.events.push(ConnEvent::StreamClosed {
                lsid,
                graceful: false,
            });
        }
    }

    fn cascade_root_close(&mut self) {
        for (lsid, stream) in self.streams.iter_mut() {
            if *lsid != ROOT_LSID && !stream.is_closed() {
                stream.close_forced();
                self.events.push(ConnEvent::StreamClosed {
                    lsid: *lsid,
                    graceful: true,
                });
            }
        }
        self.state = ConnectionState::Closed;
        self.events.push(ConnEvent::Closed {
            reason: CloseReason::Graceful,
        });
    }

    // Poll

    /// Retransmit handshakes, drive every stream, and collect outbound
    /// packets.
    pub fn advance(&mut self, now: SpaceInstant, config: &SstConfig) -> Vec<SstPacket> {
        let mut out = Vec::new();
        if !self.is_open() {
            return out;
        }

        // connection-opening Init
        let mut handshake_failed = false;
        if let Some(pending) = self.root_handshake.as_mut() {
            if now >= pending.sent_at + pending.rto || pending.retries == 0 {
                if pending.retries > config.max_retries {
                    handshake_failed = true;
                } else {
                    pending.retries += 1;
                    pending.sent_at = now;
                    pending.rto = SpaceDuration::from_micros(
                        (pending.rto.as_micros() * 2).min(config.rto_ceiling.as_micros()),
                    );
                    out.push(SstPacket {
                        header: SstHeader {
                            channel_id: self.local_channel,
                            connection_id: 0,
                            lsid: ROOT_LSID,
                            seq: INITIAL_STREAM_SEQ,
                            ack: 0,
                            packet_type: PacketType::Init,
                        },
                        payload: pending.payload.clone(),
                    });
                }
            }
        }
        if handshake_failed {
            self.root_handshake = None;
            self.state = ConnectionState::TimedOut;
            self.events.push(ConnEvent::Failed);
            return out;
        }

        // substream-opening Inits
        let mut expired = Vec::new();
        for (lsid, pending) in self.pending_substreams.iter_mut() {
            if now < pending.sent_at + pending.rto && pending.retries > 0 {
                continue;
            }
            if pending.retries > config.max_retries {
                expired.push(*lsid);
                continue;
            }
            pending.retries += 1;
            pending.sent_at = now;
            pending.rto = SpaceDuration::from_micros(
                (pending.rto.as_micros() * 2).min(config.rto_ceiling.as_micros()),
            );
            out.push(SstPacket {
                header: SstHeader {
                    channel_id: self.local_channel,
                    connection_id: self.remote_channel,
                    lsid: *lsid,
                    seq: INITIAL_STREAM_SEQ,
                    ack: 0,
                    packet_type: PacketType::Init,
                },
                payload: pending.payload.clone(),
            });
        }
        for lsid in expired {
            self.pending_substreams.remove(&lsid);
            if let Some(stream) = self.streams.get_mut(&lsid) {
                stream.close_forced();
            }
            self.events.push(ConnEvent::StreamClosed {
                lsid,
                graceful: false,
            });
        }

        // streams only transmit once the connection handshake is done
        if self.state == ConnectionState::Pending {
            return out;
        }

        let mut timed_out = false;
        let mut stream_packets = Vec::new();
        // Substream data drains ahead of the root stream so that bytes sent
        // before a root close are on the wire before the root's Fin.
        let mut lsids: Vec<u16> = self.streams.keys().copied().collect();
        lsids.sort_unstable_by_key(|lsid| (*lsid == ROOT_LSID, *lsid));
        for lsid in lsids {
            // substreams still waiting for their InitAck hold their data
            if self.pending_substreams.contains_key(&lsid) {
                continue;
            }
            let stream = self.streams.get_mut(&lsid).expect("lsid from keys");
            stream_packets.clear();
            if stream.advance(now, config, &mut stream_packets).is_err() {
                timed_out = true;
                break;
            }
            let ack = stream.cumulative_ack();
            for stream_packet in stream_packets.drain(..) {
                out.push(SstPacket {
                    header: SstHeader {
                        channel_id: self.local_channel,
                        connection_id: self.remote_channel,
                        lsid,
                        seq: stream_packet.seq,
                        ack,
                        packet_type: stream_packet.packet_type,
                    },
                    payload: stream_packet.payload,
                });
            }
        }

        if timed_out {
            self.force_close(CloseReason::TimedOut);
        }
        out
    }
}
