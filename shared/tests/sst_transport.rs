//! End-to-end exercises of the SST transport over an in-memory datagram
//! link, including loss and timeout behavior.

use parsec_shared::sst::{
    CloseReason, SstConfig, SstDatagram, SstEvent, SstService, ROOT_LSID,
};
use parsec_shared::{SpaceDuration, SpaceInstant};

const A: u32 = 1;
const B: u32 = 2;
const LISTEN_PORT: u32 = 20;

/// Two services joined by a lossy link. Each tick advances time, moves
/// packets across (dropping a configured fraction), and accumulates events.
struct Link {
    a: SstService<u32>,
    b: SstService<u32>,
    now: SpaceInstant,
    step: SpaceDuration,
    loss: f64,
    rng: fastrand::Rng,
    a_events: Vec<SstEvent<u32>>,
    b_events: Vec<SstEvent<u32>>,
}

impl Link {
    fn new(loss: f64, seed: u64) -> Self {
        let mut b = SstService::new(B, SstConfig::default());
        b.listen(LISTEN_PORT);
        Self {
            a: SstService::new(A, SstConfig::default()),
            b,
            now: SpaceInstant::from_millis(0),
            step: SpaceDuration::from_millis(50),
            loss,
            rng: fastrand::Rng::with_seed(seed),
            a_events: Vec::new(),
            b_events: Vec::new(),
        }
    }

    fn connected(loss: f64, seed: u64) -> (Self, u32, u32) {
        let mut link = Link::new(loss, seed);
        let a_channel = link.a.connect(B, 10, LISTEN_PORT, link.now);
        // a perfect link needs only a few ticks; a lossy one retries
        for _ in 0..200 {
            link.tick();
            if link.established().is_some() {
                break;
            }
        }
        let b_channel = link.established().expect("handshake did not complete");
        (link, a_channel, b_channel)
    }

    fn established(&self) -> Option<u32> {
        let a_ok = self
            .a_events
            .iter()
            .any(|event| matches!(event, SstEvent::ConnectionEstablished { .. }));
        if !a_ok {
            return None;
        }
        self.b_events.iter().find_map(|event| match event {
            SstEvent::IncomingConnection { channel, .. } => Some(*channel),
            _ => None,
        })
    }

    fn tick(&mut self) {
        self.now += self.step;
        let from_a = self.a.advance(self.now);
        let from_b = self.b.advance(self.now);
        self.deliver(from_a, from_b);
        self.a_events.extend(self.a.drain_events());
        self.b_events.extend(self.b.drain_events());
    }

    fn deliver(&mut self, from_a: Vec<SstDatagram<u32>>, from_b: Vec<SstDatagram<u32>>) {
        for datagram in from_a {
            if self.rng.f64() >= self.loss {
                self.b.handle_datagram(datagram, self.now);
            }
        }
        for datagram in from_b {
            if self.rng.f64() >= self.loss {
                self.a.handle_datagram(datagram, self.now);
            }
        }
    }

    fn bytes_received_on(&self, b_side: bool, channel: u32, lsid: u16) -> Vec<u8> {
        let events = if b_side { &self.b_events } else { &self.a_events };
        let mut bytes = Vec::new();
        for event in events {
            if let SstEvent::StreamData {
                channel: event_channel,
                lsid: event_lsid,
                bytes: chunk,
            } = event
            {
                if *event_channel == channel && *event_lsid == lsid {
                    bytes.extend_from_slice(chunk);
                }
            }
        }
        bytes
    }

    fn closed_streams_on(&self, b_side: bool, channel: u32) -> Vec<(u16, bool)> {
        let events = if b_side { &self.b_events } else { &self.a_events };
        events
            .iter()
            .filter_map(|event| match event {
                SstEvent::StreamClosed {
                    channel: event_channel,
                    lsid,
                    graceful,
                } if *event_channel == channel => Some((*lsid, *graceful)),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn connect_and_exchange_bytes() {
    let (mut link, a_channel, b_channel) = Link::connected(0.0, 7);

    link.a.send(a_channel, ROOT_LSID, b"ping from a").unwrap();
    link.b.send(b_channel, ROOT_LSID, b" and pong from b").unwrap();
    for _ in 0..10 {
        link.tick();
    }

    assert_eq!(link.bytes_received_on(true, b_channel, ROOT_LSID), b"ping from a");
    assert_eq!(
        link.bytes_received_on(false, a_channel, ROOT_LSID),
        b" and pong from b"
    );
}

#[test]
fn multiple_sends_concatenate_in_order() {
    let (mut link, a_channel, b_channel) = Link::connected(0.0, 8);

    let mut expected = Vec::new();
    for index in 0u32..50 {
        let chunk = format!("chunk-{:04};", index);
        expected.extend_from_slice(chunk.as_bytes());
        link.a.send(a_channel, ROOT_LSID, chunk.as_bytes()).unwrap();
    }
    for _ in 0..50 {
        link.tick();
    }

    assert_eq!(link.bytes_received_on(true, b_channel, ROOT_LSID), expected);
}

#[test]
fn lossy_link_delivers_everything_in_order() {
    let (mut link, a_channel, b_channel) = Link::connected(0.0, 42);
    link.loss = 0.4;

    // a payload large enough to need many segments
    let mut payload = Vec::new();
    for index in 0u32..5000 {
        payload.extend_from_slice(&index.to_be_bytes());
    }
    link.a.send(a_channel, ROOT_LSID, &payload).unwrap();

    for _ in 0..4000 {
        link.tick();
        if link.bytes_received_on(true, b_channel, ROOT_LSID).len() == payload.len() {
            break;
        }
    }

    assert_eq!(link.bytes_received_on(true, b_channel, ROOT_LSID), payload);
}

#[test]
fn graceful_close_delivers_tail_then_end_of_stream() {
    let (mut link, a_channel, b_channel) = Link::connected(0.0, 9);

    link.a.send(a_channel, ROOT_LSID, b"final words").unwrap();
    link.a.close_connection(a_channel, true).unwrap();
    for _ in 0..20 {
        link.tick();
    }

    assert_eq!(link.bytes_received_on(true, b_channel, ROOT_LSID), b"final words");
    let b_closed = link.closed_streams_on(true, b_channel);
    assert!(b_closed.contains(&(ROOT_LSID, true)));
    let a_closed = link.closed_streams_on(false, a_channel);
    assert!(a_closed.contains(&(ROOT_LSID, true)));
    assert!(link.a_events.iter().any(|event| matches!(
        event,
        SstEvent::ConnectionClosed {
            reason: CloseReason::Graceful,
            ..
        }
    )));
}

#[test]
fn substream_tree_and_root_close_cascade() {
    let (mut link, a_channel, b_channel) = Link::connected(0.0, 10);

    let c1 = link.a.open_substream(a_channel, ROOT_LSID, 100, 200).unwrap();
    for _ in 0..5 {
        link.tick();
    }
    let c2 = link.a.open_substream(a_channel, c1, 101, 201).unwrap();
    // initiator-allocated ids are even and never reused
    assert_eq!(c1 % 2, 0);
    assert_eq!(c2 % 2, 0);
    assert_ne!(c1, c2);

    // data queued on c2 before the root closes must still arrive
    link.a.send(a_channel, c2, b"deep data").unwrap();
    for _ in 0..5 {
        link.tick();
    }
    link.a.close_connection(a_channel, true).unwrap();
    for _ in 0..20 {
        link.tick();
    }

    // b saw both incoming substreams with the right tree shape
    let mut incoming = link.b_events.iter().filter_map(|event| match event {
        SstEvent::IncomingStream {
            lsid, parent_lsid, ..
        } => Some((*lsid, *parent_lsid)),
        _ => None,
    });
    assert_eq!(incoming.next(), Some((c1, ROOT_LSID)));
    assert_eq!(incoming.next(), Some((c2, c1)));

    assert_eq!(link.bytes_received_on(true, b_channel, c2), b"deep data");

    // every stream on both sides observed disconnection after the Fin
    // exchange on the root
    for (side_is_b, channel) in [(false, a_channel), (true, b_channel)] {
        let closed = link.closed_streams_on(side_is_b, channel);
        for lsid in [ROOT_LSID, c1, c2] {
            assert!(
                closed.iter().any(|(closed_lsid, _)| *closed_lsid == lsid),
                "lsid {} not closed on side b={}",
                lsid,
                side_is_b
            );
        }
    }
}

#[test]
fn unreachable_peer_times_out_the_handshake() {
    let mut link = Link::new(1.0, 11);
    let a_channel = link.a.connect(B, 10, LISTEN_PORT, link.now);

    link.step = SpaceDuration::from_secs(30);
    for _ in 0..10 {
        link.tick();
    }

    assert!(link.a_events.iter().any(|event| matches!(
        event,
        SstEvent::ConnectionFailed { channel, .. } if *channel == a_channel
    )));
}

#[test]
fn dead_link_times_out_an_established_connection() {
    let (mut link, a_channel, _b_channel) = Link::connected(0.0, 12);

    // sever the link, then keep talking
    link.loss = 1.0;
    link.a.send(a_channel, ROOT_LSID, b"into the void").unwrap();
    link.step = SpaceDuration::from_secs(30);
    for _ in 0..10 {
        link.tick();
    }

    assert!(link.a_events.iter().any(|event| matches!(
        event,
        SstEvent::ConnectionClosed {
            reason: CloseReason::TimedOut,
            ..
        }
    )));
    // the stream surfaced a non-graceful close
    let closed = link.closed_streams_on(false, a_channel);
    assert!(closed.contains(&(ROOT_LSID, false)));
}

#[test]
fn corrupt_packets_are_counted_not_fatal() {
    let (mut link, a_channel, b_channel) = Link::connected(0.0, 13);

    link.b.handle_datagram(
        SstDatagram {
            source: A,
            dest: B,
            source_port: 10,
            dest_port: LISTEN_PORT,
            payload: vec![0xff, 0x01],
        },
        link.now,
    );
    assert_eq!(link.b.parse_errors(), 1);

    // the connection still works
    link.a.send(a_channel, ROOT_LSID, b"still alive").unwrap();
    for _ in 0..10 {
        link.tick();
    }
    assert_eq!(link.bytes_received_on(true, b_channel, ROOT_LSID), b"still alive");
}
