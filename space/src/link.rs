//! Inter-server links: one SST connection per peer pair carrying
//! length-framed [`ServerMessage`]s on the root stream, mapped onto OHDP
//! datagrams. Sequence numbers make the payloads safe under crossed dials,
//! so whoever has traffic first simply connects.

use std::collections::HashMap;

use log::{debug, warn};
use parsec_shared::sst::{SstConfig, SstDatagram, SstEvent, SstService, ROOT_LSID};
use parsec_shared::{
    port, ByteReader, ByteWriter, OhdpDatagram, OhdpHeader, ServerId, ServerMessage, SpaceInstant,
};

use crate::context::{Counters, SpaceContext};

struct PeerState {
    channel: u32,
    connected: bool,
    /// Messages queued until the SST handshake completes.
    backlog: Vec<Vec<u8>>,
}

struct ChannelState {
    remote: ServerId,
    /// Partial frame reassembly: stream bytes accumulate until a whole
    /// length-prefixed message is present.
    buffer: Vec<u8>,
}

/// All SST links of one server.
pub struct PeerLinks {
    ctx: SpaceContext,
    sst: SstService<ServerId>,
    peers: HashMap<ServerId, PeerState>,
    channels: HashMap<u32, ChannelState>,
    inbound: Vec<(ServerId, ServerMessage)>,
    failed_peers: Vec<ServerId>,
}

impl PeerLinks {
    pub fn new(ctx: SpaceContext, config: SstConfig) -> Self {
        let mut sst = SstService::new(ctx.server_id, config);
        sst.listen(port::LINK);
        Self {
            ctx,
            sst,
            peers: HashMap::new(),
            channels: HashMap::new(),
            inbound: Vec::new(),
            failed_peers: Vec::new(),
        }
    }

    /// Make sure a link to `peer` exists, dialing if none does. Crossed
    /// dials are harmless: frames are accepted on any channel from the
    /// peer, and sends stick to whichever channel connected first.
    pub fn ensure_link(&mut self, peer: ServerId, now: SpaceInstant) {
        if peer == self.ctx.server_id || self.peers.contains_key(&peer) {
            return;
        }
        let channel = self.sst.connect(peer, port::LINK, port::LINK, now);
        self.peers.insert(
            peer,
            PeerState {
                channel,
                connected: false,
                backlog: Vec::new(),
            },
        );
        self.channels.insert(
            channel,
            ChannelState {
                remote: peer,
                buffer: Vec::new(),
            },
        );
    }

    pub fn is_connected(&self, peer: &ServerId) -> bool {
        self.peers.get(peer).map(|p| p.connected).unwrap_or(false)
    }

    /// Queue a message for `peer`, framing it onto the link's root stream.
    pub fn send(&mut self, peer: ServerId, message: &ServerMessage, now: SpaceInstant) {
        self.ensure_link(peer, now);
        let encoded = message.encode();
        let mut framed = ByteWriter::with_capacity(4 + encoded.len());
        framed.write_bytes(&encoded);
        let framed = framed.finish();

        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        if !state.connected {
            state.backlog.push(framed);
            return;
        }
        if let Err(error) = self.sst.send(state.channel, ROOT_LSID, &framed) {
            warn!("link to {} refused a frame: {}", peer, error);
            Counters::bump(&self.ctx.counters.fair_queue_overflow);
        }
    }

    /// Feed one arriving OHDP datagram into the link layer.
    pub fn handle_datagram(&mut self, datagram: OhdpDatagram, now: SpaceInstant) {
        if datagram.header.dest_port != port::LINK {
            debug!(
                "dropping ohdp datagram for unhandled port {}",
                datagram.header.dest_port
            );
            Counters::bump(&self.ctx.counters.parse_errors);
            return;
        }
        self.sst.handle_datagram(
            SstDatagram {
                source: datagram.header.source_server,
                dest: datagram.header.dest_server,
                source_port: datagram.header.source_port,
                dest_port: datagram.header.dest_port,
                payload: datagram.payload,
            },
            now,
        );
    }

    /// Drive the transport, surface inbound messages, and return outbound
    /// datagrams for the network.
    pub fn advance(&mut self, now: SpaceInstant) -> Vec<OhdpDatagram> {
        for event in self.sst.drain_events() {
            self.handle_event(event);
        }
        let datagrams = self.sst.advance(now);
        for event in self.sst.drain_events() {
            self.handle_event(event);
        }
        datagrams
            .into_iter()
            .map(|datagram| OhdpDatagram {
                header: OhdpHeader {
                    source_server: datagram.source,
                    dest_server: datagram.dest,
                    source_port: datagram.source_port,
                    dest_port: datagram.dest_port,
                },
                payload: datagram.payload,
            })
            .collect()
    }

    pub fn drain_inbound(&mut self) -> Vec<(ServerId, ServerMessage)> {
        std::mem::take(&mut self.inbound)
    }

    /// Peers whose link died since the last drain; they redial lazily on
    /// the next send.
    pub fn drain_failed_peers(&mut self) -> Vec<ServerId> {
        std::mem::take(&mut self.failed_peers)
    }

    fn handle_event(&mut self, event: SstEvent<ServerId>) {
        match event {
            SstEvent::ConnectionEstablished { channel, remote } => {
                if let Some(state) = self.peers.get_mut(&remote) {
                    state.connected = true;
                    for framed in std::mem::take(&mut state.backlog) {
                        if let Err(error) = self.sst.send(channel, ROOT_LSID, &framed) {
                            warn!("link to {} dropped backlog frame: {}", remote, error);
                        }
                    }
                }
            }
            SstEvent::IncomingConnection { channel, remote, .. } => {
                // accepted side of the link
                self.channels.insert(
                    channel,
                    ChannelState {
                        remote,
                        buffer: Vec::new(),
                    },
                );
                let state = self.peers.entry(remote).or_insert(PeerState {
                    channel,
                    connected: false,
                    backlog: Vec::new(),
                });
                if !state.connected {
                    state.channel = channel;
                    state.connected = true;
                    let backlog = std::mem::take(&mut state.backlog);
                    for framed in backlog {
                        if let Err(error) = self.sst.send(channel, ROOT_LSID, &framed) {
                            warn!("link to {} dropped backlog frame: {}", remote, error);
                        }
                    }
                }
            }
            SstEvent::StreamData { channel, lsid, bytes } => {
                if lsid != ROOT_LSID {
                    return;
                }
                let Some(state) = self.channels.get_mut(&channel) else {
                    return;
                };
                state.buffer.extend_from_slice(&bytes);
                let remote = state.remote;
                loop {
                    let Some(state) = self.channels.get_mut(&channel) else {
                        break;
                    };
                    let frame = {
                        let mut reader = ByteReader::new(&state.buffer);
                        match reader.read_bytes() {
                            Ok(frame) => {
                                let frame = frame.to_vec();
                                let consumed = state.buffer.len() - reader.remaining();
                                state.buffer.drain(..consumed);
                                frame
                            }
                            Err(_) => break,
                        }
                    };
                    match ServerMessage::decode(&frame) {
                        Ok(message) => self.inbound.push((remote, message)),
                        Err(error) => {
                            warn!("undecodable server message from {}: {}", remote, error);
                            Counters::bump(&self.ctx.counters.parse_errors);
                        }
                    }
                }
            }
            SstEvent::ConnectionFailed { channel, remote } => {
                // redial happens on the next send or ensure_link
                warn!("link to {} failed to establish", remote);
                self.channels.remove(&channel);
                self.peers.remove(&remote);
                self.failed_peers.push(remote);
            }
            SstEvent::ConnectionClosed { channel, reason } => {
                if let Some(state) = self.channels.remove(&channel) {
                    warn!("link to {} closed: {:?}", state.remote, reason);
                    self.peers.remove(&state.remote);
                    self.failed_peers.push(state.remote);
                }
            }
            SstEvent::StreamConnected { .. }
            | SstEvent::IncomingStream { .. }
            | SstEvent::StreamClosed { .. } => {}
        }
    }
}
