use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use log::{debug, warn};

use crate::sst::connection::{CloseReason, ConnEvent, Connection, ROOT_LSID};
use crate::sst::error::SstError;
use crate::sst::packet::{ConnectionHandshake, PacketType, SstHeader, SstPacket};
use crate::sst::SstConfig;
use crate::time::SpaceInstant;

/// Anything that can address an SST peer: a space-object reference for ODP
/// traffic, a server id for OHDP traffic.
pub trait Endpoint: Copy + Eq + Hash + Debug {}

impl<T: Copy + Eq + Hash + Debug> Endpoint for T {}

/// A datagram as the transport sees it. The caller maps these to and from
/// ODP/OHDP datagrams, attaching whatever extra header fields that substrate
/// carries.
#[derive(Clone, Debug)]
pub struct SstDatagram<E: Endpoint> {
    pub source: E,
    pub dest: E,
    pub source_port: u32,
    pub dest_port: u32,
    pub payload: Vec<u8>,
}

/// Transport events, drained each poll.
#[derive(Clone, Debug)]
pub enum SstEvent<E: Endpoint> {
    ConnectionEstablished { channel: u32, remote: E },
    ConnectionFailed { channel: u32, remote: E },
    IncomingConnection { channel: u32, remote: E, port: u32 },
    StreamConnected { channel: u32, lsid: u16 },
    IncomingStream { channel: u32, lsid: u16, parent_lsid: u16, port: u32 },
    StreamData { channel: u32, lsid: u16, bytes: Vec<u8> },
    StreamClosed { channel: u32, lsid: u16, graceful: bool },
    ConnectionClosed { channel: u32, reason: CloseReason },
}

struct ConnectionSlot<E: Endpoint> {
    remote: E,
    connection: Connection,
    closed_at: Option<SpaceInstant>,
}

/// The SST endpoint service for one local address: owns every connection,
/// accepts on listened ports, and shuttles packets to and from the datagram
/// substrate. Purely poll-driven; call [`SstService::handle_datagram`] for
/// each arrival and [`SstService::advance`] once per tick.
pub struct SstService<E: Endpoint> {
    local: E,
    config: SstConfig,
    connections: HashMap<u32, ConnectionSlot<E>>,
    channel_by_remote: HashMap<(E, u32), u32>,
    listen_ports: HashSet<u32>,
    next_channel: u32,
    events: Vec<SstEvent<E>>,
    outbox: Vec<SstDatagram<E>>,
    parse_errors: u64,
}

impl<E: Endpoint> SstService<E> {
    pub fn new(local: E, config: SstConfig) -> Self {
        Self {
            local,
            config,
            connections: HashMap::new(),
            channel_by_remote: HashMap::new(),
            listen_ports: HashSet::new(),
            next_channel: 1,
            events: Vec::new(),
            outbox: Vec::new(),
            parse_errors: 0,
        }
    }

    pub fn local(&self) -> E {
        self.local
    }

    /// Count of dropped undecodable packets.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Accept incoming connections on `port`.
    pub fn listen(&mut self, port: u32) {
        self.listen_ports.insert(port);
    }

    /// Open a connection to `remote`; the root stream is usable
    /// immediately and flushes once the handshake completes. Returns the
    /// local channel id identifying the connection in all events.
    pub fn connect(&mut self, remote: E, local_port: u32, remote_port: u32, now: SpaceInstant) -> u32 {
        let channel = self.allocate_channel();
        let connection = Connection::connect(channel, local_port, remote_port, &self.config, now);
        self.connections.insert(
            channel,
            ConnectionSlot {
                remote,
                connection,
                closed_at: None,
            },
        );
        channel
    }

    fn allocate_channel(&mut self) -> u32 {
        let channel = self.next_channel;
        self.next_channel = self.next_channel.wrapping_add(1).max(1);
        channel
    }

    pub fn open_substream(
        &mut self,
        channel: u32,
        parent_lsid: u16,
        local_port: u32,
        remote_port: u32,
    ) -> Result<u16, SstError> {
        let slot = self
            .connections
            .get_mut(&channel)
            .ok_or(SstError::UnknownConnection { channel })?;
        slot.connection
            .open_substream(parent_lsid, local_port, remote_port, &self.config)
    }

    pub fn send(&mut self, channel: u32, lsid: u16, bytes: &[u8]) -> Result<(), SstError> {
        let slot = self
            .connections
            .get_mut(&channel)
            .ok_or(SstError::UnknownConnection { channel })?;
        slot.connection.send(lsid, bytes, &self.config)
    }

    pub fn close_stream(&mut self, channel: u32, lsid: u16, graceful: bool) -> Result<(), SstError> {
        let slot = self
            .connections
            .get_mut(&channel)
            .ok_or(SstError::UnknownConnection { channel })?;
        slot.connection.close_stream(lsid, graceful)?;
        if !graceful {
            let packet = SstPacket {
                header: SstHeader {
                    channel_id: slot.connection.local_channel,
                    connection_id: slot.connection.remote_channel,
                    lsid,
                    seq: 0,
                    ack: 0,
                    packet_type: PacketType::Rst,
                },
                payload: Vec::new(),
            };
            let datagram = Self::wrap(self.local, slot, packet);
            self.outbox.push(datagram);
        }
        Ok(())
    }

    /// Graceful connection close: close the root stream, which tears down
    /// the substream tree once the Fin exchange completes.
    pub fn close_connection(&mut self, channel: u32, graceful: bool) -> Result<(), SstError> {
        if graceful {
            self.close_stream(channel, ROOT_LSID, true)
        } else {
            self.close_stream(channel, ROOT_LSID, false)
        }
    }

    fn wrap(local: E, slot: &ConnectionSlot<E>, packet: SstPacket) -> SstDatagram<E> {
        SstDatagram {
            source: local,
            dest: slot.remote,
            source_port: slot.connection.local_port,
            dest_port: slot.connection.remote_port,
            payload: packet.encode(),
        }
    }

    /// Process one arriving datagram.
    pub fn handle_datagram(&mut self, datagram: SstDatagram<E>, now: SpaceInstant) {
        let packet = match SstPacket::decode(&datagram.payload) {
            Ok(packet) => packet,
            Err(error) => {
                self.parse_errors += 1;
                debug!("dropping undecodable sst packet: {}", error);
                return;
            }
        };

        let channel = if packet.header.connection_id != 0 {
            // addressed to one of our channels directly
            packet.header.connection_id
        } else if let Some(known) = self
            .channel_by_remote
            .get(&(datagram.source, packet.header.channel_id))
        {
            *known
        } else if packet.header.packet_type == PacketType::Init
            && packet.header.lsid == ROOT_LSID
        {
            match self.accept_connection(&datagram, &packet) {
                Some(channel) => channel,
                None => return,
            }
        } else {
            debug!(
                "dropping packet for unknown connection from {:?}",
                datagram.source
            );
            return;
        };

        let Some(slot) = self.connections.get_mut(&channel) else {
            debug!("dropping packet for vanished channel {}", channel);
            return;
        };
        if slot.remote != datagram.source {
            warn!(
                "dropping packet claiming channel {} from unexpected source {:?}",
                channel, datagram.source
            );
            return;
        }

        // learn the peer's channel on first contact
        if slot.connection.remote_channel == 0
            && packet.header.packet_type != PacketType::Init
        {
            slot.connection.remote_channel = packet.header.channel_id;
        }

        let replies = slot.connection.handle_packet(packet, &self.config);
        for reply in replies {
            let datagram = Self::wrap(self.local, slot, reply);
            self.outbox.push(datagram);
        }
        self.collect_events(channel, now);
    }

    fn accept_connection(&mut self, datagram: &SstDatagram<E>, packet: &SstPacket) -> Option<u32> {
        if !self.listen_ports.contains(&datagram.dest_port) {
            debug!(
                "dropping connection attempt on un-listened port {}",
                datagram.dest_port
            );
            return None;
        }
        let handshake = match ConnectionHandshake::decode(&packet.payload) {
            Ok(handshake) => handshake,
            Err(_) => {
                self.parse_errors += 1;
                return None;
            }
        };
        let channel = self.allocate_channel();
        let (connection, init_ack) = Connection::accept(
            channel,
            packet.header.channel_id,
            datagram.dest_port,
            datagram.source_port,
            handshake,
            &self.config,
        );
        let slot = ConnectionSlot {
            remote: datagram.source,
            connection,
            closed_at: None,
        };
        let ack_datagram = Self::wrap(self.local, &slot, init_ack);
        self.outbox.push(ack_datagram);
        self.connections.insert(channel, slot);
        self.channel_by_remote
            .insert((datagram.source, packet.header.channel_id), channel);
        self.events.push(SstEvent::IncomingConnection {
            channel,
            remote: datagram.source,
            port: datagram.dest_port,
        });
        Some(channel)
    }

    fn collect_events(&mut self, channel: u32, now: SpaceInstant) {
        let Some(slot) = self.connections.get_mut(&channel) else {
            return;
        };
        let remote = slot.remote;
        for event in slot.connection.drain_events() {
            let mapped = match event {
                ConnEvent::Established => SstEvent::ConnectionEstablished { channel, remote },
                ConnEvent::Failed => {
                    slot.closed_at = Some(now);
                    SstEvent::ConnectionFailed { channel, remote }
                }
                ConnEvent::StreamConnected { lsid } => SstEvent::StreamConnected { channel, lsid },
                ConnEvent::IncomingStream {
                    lsid,
                    parent_lsid,
                    port,
                } => SstEvent::IncomingStream {
                    channel,
                    lsid,
                    parent_lsid,
                    port,
                },
                ConnEvent::StreamData { lsid, bytes } => {
                    SstEvent::StreamData { channel, lsid, bytes }
                }
                ConnEvent::StreamClosed { lsid, graceful } => {
                    SstEvent::StreamClosed { channel, lsid, graceful }
                }
                ConnEvent::Closed { reason } => {
                    slot.closed_at = Some(now);
                    SstEvent::ConnectionClosed { channel, reason }
                }
            };
            self.events.push(mapped);
        }
    }

    /// Drive handshake and stream timers, collect everything there is to
    /// transmit, and prune connections past their close linger.
    pub fn advance(&mut self, now: SpaceInstant) -> Vec<SstDatagram<E>> {
        let channels: Vec<u32> = self.connections.keys().copied().collect();
        for channel in channels {
            let Some(slot) = self.connections.get_mut(&channel) else {
                continue;
            };
            let packets = slot.connection.advance(now, &self.config);
            for packet in packets {
                let datagram = Self::wrap(self.local, slot, packet);
                self.outbox.push(datagram);
            }
            self.collect_events(channel, now);
        }

        // closed connections linger so they can still re-ack stray Fins
        let linger = self.config.close_linger;
        let mut stale: Vec<u32> = Vec::new();
        for (channel, slot) in self.connections.iter() {
            if let Some(closed_at) = slot.closed_at {
                if now >= closed_at + linger {
                    stale.push(*channel);
                }
            }
        }
        for channel in stale {
            if let Some(slot) = self.connections.remove(&channel) {
                self.channel_by_remote
                    .remove(&(slot.remote, slot.connection.remote_channel));
            }
        }

        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<SstEvent<E>> {
        std::mem::take(&mut self.events)
    }
}
