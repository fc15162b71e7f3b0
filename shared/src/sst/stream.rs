use std::collections::VecDeque;

use crate::sequence::{seq_greater_than, seq_less_than, SequenceList};
use crate::sst::error::SstError;
use crate::sst::packet::PacketType;
use crate::sst::SstConfig;
use crate::time::{SpaceDuration, SpaceInstant};

/// Stream lifecycle. `Pending` is a substream opener waiting for its
/// InitAck; `Disconnecting` is a graceful close still flushing or waiting
/// for its Fin to be acknowledged.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StreamState {
    Pending,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A packet the stream wants transmitted. The connection fills in channel
/// identifiers, the lsid, and the piggybacked cumulative ack.
#[derive(Clone, Debug)]
pub struct StreamPacket {
    pub packet_type: PacketType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// What happened while the stream processed input: bytes to deliver in
/// order, and/or a close to surface.
#[derive(Default)]
pub struct StreamOutput {
    pub delivered: Vec<u8>,
    pub closed_gracefully: bool,
    pub closed_forced: bool,
}

struct Segment {
    seq: u32,
    payload: Vec<u8>,
    fin: bool,
    sent_at: SpaceInstant,
    rto: SpaceDuration,
    retries: u32,
    force_retransmit: bool,
}

/// One reliable ordered byte stream inside a connection. Sequence numbers
/// count segments, not bytes; each Data or Fin consumes exactly one. An
/// empty Data packet is a bare acknowledgment and never reaches
/// [`Stream::handle_segment`].
pub struct Stream {
    pub lsid: u16,
    pub parent_lsid: u16,
    pub local_port: u32,
    pub remote_port: u32,
    pub state: StreamState,

    // send side
    send_buffer: VecDeque<u8>,
    unacked: VecDeque<Segment>,
    next_send_seq: u32,
    inflight_bytes: usize,
    cwnd: usize,
    peer_rwnd: usize,
    last_ack_seen: u32,
    dup_acks: u32,
    fin_queued: bool,
    fin_sent: bool,

    // receive side
    next_recv_seq: u32,
    out_of_order: SequenceList<(Vec<u8>, bool)>,
    remote_fin: bool,
    pending_ack: bool,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lsid: u16,
        parent_lsid: u16,
        local_port: u32,
        remote_port: u32,
        state: StreamState,
        initial_send_seq: u32,
        peer_initial_seq: u32,
        peer_rwnd: usize,
        config: &SstConfig,
    ) -> Self {
        Self {
            lsid,
            parent_lsid,
            local_port,
            remote_port,
            state,
            send_buffer: VecDeque::new(),
            unacked: VecDeque::new(),
            next_send_seq: initial_send_seq,
            inflight_bytes: 0,
            cwnd: config.initial_cwnd_bytes(),
            peer_rwnd,
            last_ack_seen: initial_send_seq,
            dup_acks: 0,
            fin_queued: false,
            fin_sent: false,
            next_recv_seq: peer_initial_seq,
            out_of_order: SequenceList::new(),
            remote_fin: false,
            pending_ack: false,
        }
    }

    /// Called on the opener once the peer's InitAck arrives with its
    /// negotiated sequence state.
    pub fn complete_handshake(&mut self, peer_initial_seq: u32, peer_rwnd: usize) {
        self.next_recv_seq = peer_initial_seq;
        self.peer_rwnd = peer_rwnd;
        self.state = StreamState::Connected;
    }

    pub fn cumulative_ack(&self) -> u32 {
        self.next_recv_seq
    }

    pub fn next_send_seq(&self) -> u32 {
        self.next_send_seq
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Disconnected
    }

    pub fn remote_fin_received(&self) -> bool {
        self.remote_fin
    }

    // Send path

    /// Queue bytes for transmission. Bytes are segmented lazily in
    /// [`Stream::advance`]; segment boundaries are not preserved for the
    /// receiver.
    pub fn send(&mut self, bytes: &[u8], config: &SstConfig) -> Result<(), SstError> {
        match self.state {
            StreamState::Pending | StreamState::Connected => {}
            StreamState::Disconnecting | StreamState::Disconnected => {
                return Err(SstError::StreamClosed { lsid: self.lsid });
            }
        }
        if self.send_buffer.len() + bytes.len() > config.send_buffer_bytes {
            return Err(SstError::SendBufferFull {
                buffered: self.send_buffer.len(),
                limit: config.send_buffer_bytes,
            });
        }
        self.send_buffer.extend(bytes.iter().copied());
        Ok(())
    }

    /// Begin a graceful close: flush whatever is queued, then Fin.
    pub fn close_graceful(&mut self) {
        if self.state == StreamState::Disconnected {
            return;
        }
        self.state = StreamState::Disconnecting;
        self.fin_queued = true;
    }

    /// Forced close: drop all buffers immediately. The connection emits the
    /// Rst.
    pub fn close_forced(&mut self) {
        self.state = StreamState::Disconnected;
        self.send_buffer.clear();
        self.unacked.clear();
        self.inflight_bytes = 0;
    }

    fn window_available(&self) -> usize {
        self.cwnd
            .min(self.peer_rwnd)
            .saturating_sub(self.inflight_bytes)
    }

    fn halve_cwnd(&mut self, config: &SstConfig) {
        self.cwnd = (self.cwnd / 2).max(config.max_segment_bytes);
    }

    /// Segment queued bytes, retransmit expired segments, and emit bare
    /// acknowledgments. Appends packets for the connection to transmit.
    /// Returns `Err` when a segment exhausted the retry budget, which fails
    /// the whole connection.
    pub fn advance(
        &mut self,
        now: SpaceInstant,
        config: &SstConfig,
        packets: &mut Vec<StreamPacket>,
    ) -> Result<(), ()> {
        if self.state == StreamState::Disconnected {
            return Ok(());
        }

        // expired segments first: they already hold window
        let mut retransmitted = false;
        for segment in self.unacked.iter_mut() {
            if !segment.force_retransmit && now < segment.sent_at + segment.rto {
                continue;
            }
            if segment.retries >= config.max_retries {
                return Err(());
            }
            segment.force_retransmit = false;
            segment.retries += 1;
            segment.sent_at = now;
            segment.rto = SpaceDuration::from_micros(
                (segment.rto.as_micros() * 2).min(config.rto_ceiling.as_micros()),
            );
            retransmitted = true;
            packets.push(StreamPacket {
                packet_type: if segment.fin {
                    PacketType::Fin
                } else {
                    PacketType::Data
                },
                seq: segment.seq,
                payload: segment.payload.clone(),
            });
        }
        if retransmitted {
            // A timeout is a loss signal.
            self.halve_cwnd(config);
        }

        if self.state == StreamState::Connected || self.state == StreamState::Disconnecting {
            // new segments while the window allows
            while !self.send_buffer.is_empty() {
                let available = self.window_available();
                if available == 0 {
                    break;
                }
                let take = self
                    .send_buffer
                    .len()
                    .min(config.max_segment_bytes)
                    .min(available);
                let payload: Vec<u8> = self.send_buffer.drain(..take).collect();
                let seq = self.next_send_seq;
                self.next_send_seq = self.next_send_seq.wrapping_add(1);
                self.inflight_bytes += payload.len();
                packets.push(StreamPacket {
                    packet_type: PacketType::Data,
                    seq,
                    payload: payload.clone(),
                });
                self.unacked.push_back(Segment {
                    seq,
                    payload,
                    fin: false,
                    sent_at: now,
                    rto: config.rto_initial,
                    retries: 0,
                    force_retransmit: false,
                });
                self.pending_ack = false;
            }

            // graceful close: Fin goes out once the buffer is flushed
            if self.fin_queued && !self.fin_sent && self.send_buffer.is_empty() {
                let seq = self.next_send_seq;
                self.next_send_seq = self.next_send_seq.wrapping_add(1);
                self.fin_sent = true;
                packets.push(StreamPacket {
                    packet_type: PacketType::Fin,
                    seq,
                    payload: Vec::new(),
                });
                self.unacked.push_back(Segment {
                    seq,
                    payload: Vec::new(),
                    fin: true,
                    sent_at: now,
                    rto: config.rto_initial,
                    retries: 0,
                    force_retransmit: false,
                });
                self.pending_ack = false;
            }
        }

        // bare ack if no outbound segment carried it
        if self.pending_ack {
            self.pending_ack = false;
            packets.push(StreamPacket {
                packet_type: PacketType::Data,
                seq: self.next_send_seq,
                payload: Vec::new(),
            });
        }

        Ok(())
    }

    // Receive path

    /// Process the cumulative ack carried by any inbound packet.
    pub fn handle_ack(&mut self, ack: u32, config: &SstConfig, output: &mut StreamOutput) {
        if seq_greater_than(ack, self.last_ack_seen) {
            self.last_ack_seen = ack;
            self.dup_acks = 0;
            let mut advanced = false;
            while let Some(front) = self.unacked.front() {
                if !seq_less_than(front.seq, ack) {
                    break;
                }
                let segment = self.unacked.pop_front().expect("front checked above");
                self.inflight_bytes -= segment.payload.len();
                advanced = true;
                if segment.fin {
                    // our Fin is acknowledged; the close is complete
                    self.state = StreamState::Disconnected;
                    output.closed_gracefully = true;
                }
            }
            if advanced {
                self.cwnd += config.max_segment_bytes;
            }
        } else if ack == self.last_ack_seen && !self.unacked.is_empty() {
            self.dup_acks += 1;
            if self.dup_acks == 3 {
                self.dup_acks = 0;
                self.halve_cwnd(config);
                if let Some(front) = self.unacked.front_mut() {
                    // fast retransmit on the next advance
                    front.force_retransmit = true;
                }
            }
        }
    }

    /// Process an inbound Data or Fin segment (never a bare ack).
    pub fn handle_segment(
        &mut self,
        seq: u32,
        payload: Vec<u8>,
        fin: bool,
        config: &SstConfig,
        output: &mut StreamOutput,
    ) {
        if seq_less_than(seq, self.next_recv_seq) {
            // duplicate of delivered data; re-ack so the sender advances
            self.pending_ack = true;
            return;
        }

        if seq == self.next_recv_seq {
            self.accept_in_order(payload, fin, output);
            // drain anything now contiguous
            loop {
                match self.out_of_order.front() {
                    Some((front_seq, _)) if *front_seq == self.next_recv_seq => {}
                    _ => break,
                }
                let (_, (buffered_payload, buffered_fin)) =
                    self.out_of_order.pop_front().expect("front checked above");
                self.accept_in_order(buffered_payload, buffered_fin, output);
            }
        } else {
            // out of order: buffer within the receive window
            let distance = seq.wrapping_sub(self.next_recv_seq);
            if (distance as usize) <= config.recv_window_segments {
                // duplicates are fine, first arrival wins
                let _ = self.out_of_order.try_insert(seq, (payload, fin));
            }
        }
        self.pending_ack = true;
    }

    fn accept_in_order(&mut self, payload: Vec<u8>, fin: bool, output: &mut StreamOutput) {
        self.next_recv_seq = self.next_recv_seq.wrapping_add(1);
        if fin {
            // remote closed; everything it sent has been delivered
            self.remote_fin = true;
            if self.state != StreamState::Disconnected {
                self.state = StreamState::Disconnected;
                output.closed_gracefully = true;
            }
        } else {
            output.delivered.extend_from_slice(&payload);
        }
    }

    /// Peer forced the stream down.
    pub fn handle_rst(&mut self, output: &mut StreamOutput) {
        if self.state != StreamState::Disconnected {
            self.close_forced();
            output.closed_forced = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SstConfig {
        SstConfig::default()
    }

    fn connected_pair_stream() -> Stream {
        Stream::new(
            0,
            0,
            1,
            1,
            StreamState::Connected,
            100,
            500,
            64 * 1024,
            &config(),
        )
    }

    fn advance_collect(stream: &mut Stream, now: SpaceInstant) -> Vec<StreamPacket> {
        let mut packets = Vec::new();
        stream.advance(now, &config(), &mut packets).unwrap();
        packets
    }

    #[test]
    fn segments_and_acks_flow() {
        let mut sender = connected_pair_stream();
        let now = SpaceInstant::from_millis(0);

        sender.send(b"hello world", &config()).unwrap();
        let packets = advance_collect(&mut sender, now);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].seq, 100);
        assert_eq!(packets[0].payload, b"hello world");

        // cumulative ack past the segment clears it
        let mut output = StreamOutput::default();
        sender.handle_ack(101, &config(), &mut output);
        assert_eq!(sender.inflight_bytes, 0);
        assert!(sender.unacked.is_empty());
    }

    #[test]
    fn receiver_reorders_segments() {
        let mut receiver = Stream::new(
            0,
            0,
            1,
            1,
            StreamState::Connected,
            500,
            100,
            64 * 1024,
            &config(),
        );

        let mut output = StreamOutput::default();
        receiver.handle_segment(101, b"world".to_vec(), false, &config(), &mut output);
        assert!(output.delivered.is_empty());

        receiver.handle_segment(100, b"hello ".to_vec(), false, &config(), &mut output);
        assert_eq!(output.delivered, b"hello world");
        assert_eq!(receiver.cumulative_ack(), 102);
    }

    #[test]
    fn duplicate_segments_deliver_once() {
        let mut receiver = connected_pair_stream();
        let first = receiver.cumulative_ack();

        let mut output = StreamOutput::default();
        receiver.handle_segment(first, b"abc".to_vec(), false, &config(), &mut output);
        receiver.handle_segment(first, b"abc".to_vec(), false, &config(), &mut output);
        assert_eq!(output.delivered, b"abc");
    }

    #[test]
    fn rto_retransmits_with_backoff() {
        let mut sender = connected_pair_stream();
        sender.send(b"data", &config()).unwrap();
        let t0 = SpaceInstant::from_millis(0);
        assert_eq!(advance_collect(&mut sender, t0).len(), 1);

        // nothing before the timer
        let before = t0 + SpaceDuration::from_millis(100);
        assert!(advance_collect(&mut sender, before).is_empty());

        // fires at the initial rto
        let at = t0 + config().rto_initial;
        let packets = advance_collect(&mut sender, at);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"data");

        // backoff doubled: quiet until 3x initial
        let quiet = at + config().rto_initial;
        assert!(advance_collect(&mut sender, quiet).is_empty());
        let again = at + SpaceDuration::from_micros(config().rto_initial.as_micros() * 2);
        assert_eq!(advance_collect(&mut sender, again).len(), 1);
    }

    #[test]
    fn retry_budget_exhaustion_fails() {
        let mut sender = connected_pair_stream();
        sender.send(b"data", &config()).unwrap();
        let mut now = SpaceInstant::from_millis(0);
        let mut packets = Vec::new();
        sender.advance(now, &config(), &mut packets).unwrap();

        for _ in 0..config().max_retries {
            now += SpaceDuration::from_secs(30);
            packets.clear();
            sender.advance(now, &config(), &mut packets).unwrap();
            assert_eq!(packets.len(), 1);
        }
        now += SpaceDuration::from_secs(30);
        packets.clear();
        assert!(sender.advance(now, &config(), &mut packets).is_err());
    }

    #[test]
    fn triple_dup_ack_fast_retransmits() {
        let mut sender = connected_pair_stream();
        sender.send(b"aaaa", &config()).unwrap();
        let t0 = SpaceInstant::from_millis(0);
        advance_collect(&mut sender, t0);
        let cwnd_before = sender.cwnd;

        let mut output = StreamOutput::default();
        sender.handle_ack(100, &config(), &mut output);
        sender.handle_ack(100, &config(), &mut output);
        sender.handle_ack(100, &config(), &mut output);
        assert!(sender.cwnd < cwnd_before || cwnd_before == config().max_segment_bytes);

        // the forced timer fires immediately
        let packets = advance_collect(&mut sender, t0 + SpaceDuration::from_millis(1));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"aaaa");
    }

    #[test]
    fn graceful_close_flushes_then_fins() {
        let mut sender = connected_pair_stream();
        sender.send(b"tail", &config()).unwrap();
        sender.close_graceful();
        assert_eq!(sender.state, StreamState::Disconnecting);

        let packets = advance_collect(&mut sender, SpaceInstant::from_millis(0));
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type, PacketType::Data);
        assert_eq!(packets[1].packet_type, PacketType::Fin);

        // acking through the Fin completes the close
        let mut output = StreamOutput::default();
        sender.handle_ack(102, &config(), &mut output);
        assert!(output.closed_gracefully);
        assert_eq!(sender.state, StreamState::Disconnected);
    }

    #[test]
    fn send_after_close_rejected() {
        let mut stream = connected_pair_stream();
        stream.close_graceful();
        assert_eq!(
            stream.send(b"x", &config()),
            Err(SstError::StreamClosed { lsid: 0 })
        );
    }

    #[test]
    fn fin_delivers_remaining_bytes_first() {
        let mut receiver = connected_pair_stream();
        let base = receiver.cumulative_ack();

        let mut output = StreamOutput::default();
        // Fin arrives before the last data segment
        receiver.handle_segment(base.wrapping_add(1), Vec::new(), true, &config(), &mut output);
        assert!(!output.closed_gracefully);

        receiver.handle_segment(base, b"last".to_vec(), false, &config(), &mut output);
        assert_eq!(output.delivered, b"last");
        assert!(output.closed_gracefully);
        assert!(receiver.remote_fin_received());
    }
}
