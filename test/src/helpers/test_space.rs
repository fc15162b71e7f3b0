use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parsec_shared::{
    LocField, LocFieldValue, ObjectId, OdpDatagram, OdpHeader, ServerId, ServerMessage,
    SessionRequest, SessionStatus, SpaceDuration, SpaceId, SpaceInstant, SpaceObjectRef,
    TimeSource, TimedMotionVector, Vec3,
};
use parsec_space::{
    MemoryStore, ServerConfig, SessionConfig, SessionEvent, SpaceContext, SpaceServer,
};

pub const DEFAULT_RADIUS: f32 = 1.0;

/// N space servers over one shared directory map, joined by an in-memory
/// OHDP network with optional seeded loss. Time is virtual: each tick
/// advances it by a fixed step.
pub struct TestSpace {
    pub servers: Vec<SpaceServer>,
    now: SpaceInstant,
    step: SpaceDuration,
    loss: f64,
    rng: fastrand::Rng,
    pub session_events: Vec<(ServerId, SessionEvent)>,
}

impl TestSpace {
    pub fn new(count: usize) -> Self {
        Self::with_loss(count, 0.0, 1)
    }

    pub fn with_loss(count: usize, loss: f64, seed: u64) -> Self {
        let map = Arc::new(Mutex::new(HashMap::new()));
        let now = SpaceInstant::from_secs(1);
        let peers: Vec<ServerId> = (1..=count as u32).map(ServerId).collect();

        let mut servers = Vec::with_capacity(count);
        for id in 1..=count as u32 {
            let ctx = SpaceContext::new(
                ServerId(id),
                SpaceId::ZERO,
                TimeSource::new(SpaceInstant::EPOCH),
            );
            let mut server = SpaceServer::new(
                ctx,
                ServerConfig::default(),
                Box::new(MemoryStore::with_map(map.clone())),
                now,
            );
            server.set_peers(
                peers
                    .iter()
                    .copied()
                    .filter(|peer| *peer != ServerId(id))
                    .collect(),
            );
            servers.push(server);
        }

        Self {
            servers,
            now,
            step: SpaceDuration::from_millis(50),
            loss,
            rng: fastrand::Rng::with_seed(seed),
            session_events: Vec::new(),
        }
    }

    pub fn now(&self) -> SpaceInstant {
        self.now
    }

    pub fn set_loss(&mut self, loss: f64) {
        self.loss = loss;
    }

    pub fn server(&mut self, id: ServerId) -> &mut SpaceServer {
        &mut self.servers[(id.0 - 1) as usize]
    }

    /// One round: every server ticks, its outbound datagrams cross the
    /// (possibly lossy) network, and virtual time advances.
    pub fn tick(&mut self) {
        self.now += self.step;
        let now = self.now;

        let mut in_flight = Vec::new();
        let mut events = Vec::new();
        for server in self.servers.iter_mut() {
            let id = server.ctx.server_id;
            for event in server.drain_session_events() {
                events.push((id, event));
            }
            in_flight.extend(server.tick(now));
        }
        self.session_events.extend(events);
        for datagram in in_flight {
            if self.loss > 0.0 && self.rng.f64() < self.loss {
                continue;
            }
            let dest = datagram.header.dest_server;
            if dest.0 == 0 || dest.0 as usize > self.servers.len() {
                continue;
            }
            self.server(dest).handle_server_datagram(datagram, now);
        }
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Run until `predicate` holds or `max_ticks` elapse; returns whether
    /// it held.
    pub fn run_until(&mut self, max_ticks: usize, mut predicate: impl FnMut(&mut TestSpace) -> bool) -> bool {
        for _ in 0..max_ticks {
            if predicate(self) {
                return true;
            }
            self.tick();
        }
        predicate(self)
    }

    // Object-side drivers

    pub fn session_request(object: ObjectId, position: Vec3, radius: f32) -> SessionRequest {
        SessionRequest {
            object,
            radius,
            token: SessionConfig::default().secret,
            fields: vec![
                LocField {
                    seqno: 1,
                    value: LocFieldValue::Location(TimedMotionVector::stationary(
                        SpaceInstant::from_secs(1),
                        position,
                    )),
                },
                LocField {
                    seqno: 1,
                    value: LocFieldValue::Bounds(parsec_shared::BoundingInfo::single_object(
                        radius,
                    )),
                },
            ],
        }
    }

    /// Drive a session request at `server` and pump until it resolves.
    pub fn connect_object(
        &mut self,
        server: ServerId,
        object: ObjectId,
        position: Vec3,
        radius: f32,
    ) -> SessionStatus {
        let request = Self::session_request(object, position, radius);
        let now = self.now;
        let datagram = object_datagram(object, parsec_shared::port::SESSION, ServerMessage::SessionRequest(request).encode());
        self.server(server).handle_object_datagram(datagram, now);

        let mut status = None;
        self.run_until(50, |space| {
            status = space.session_events.iter().find_map(|(event_server, event)| {
                if *event_server != server {
                    return None;
                }
                match event {
                    SessionEvent::Admitted { object: admitted } if *admitted == object => {
                        Some(SessionStatus::Success)
                    }
                    SessionEvent::Rejected {
                        object: rejected,
                        status,
                    } if *rejected == object => Some(*status),
                    _ => None,
                }
            });
            status.is_some()
        });
        status.expect("session request never resolved")
    }

    /// Send an object-to-object datagram into `server`'s forwarding plane.
    pub fn send_object_message(
        &mut self,
        server: ServerId,
        from: ObjectId,
        to: ObjectId,
        payload: Vec<u8>,
    ) {
        let now = self.now;
        let datagram = OdpDatagram {
            header: OdpHeader {
                source: SpaceObjectRef::new(SpaceId::ZERO, from),
                dest: SpaceObjectRef::new(SpaceId::ZERO, to),
                source_port: parsec_shared::port::USER_BASE,
                dest_port: parsec_shared::port::USER_BASE,
                unique_id: self.rng.u64(..),
            },
            payload,
        };
        self.server(server).handle_object_datagram(datagram, now);
    }

    /// Everything delivered to a locally connected object, decoded where
    /// the payload is a system message.
    pub fn drain_object_messages(
        &mut self,
        server: ServerId,
        object: ObjectId,
    ) -> Vec<(u32, Result<ServerMessage, Vec<u8>>)> {
        self.server(server)
            .drain_object_inbox(&object)
            .into_iter()
            .map(|datagram| {
                let port = datagram.header.dest_port;
                let decoded = ServerMessage::decode(&datagram.payload)
                    .map_err(|_| datagram.payload.clone());
                (port, decoded)
            })
            .collect()
    }
}

pub fn object_datagram(dest: ObjectId, dest_port: u32, payload: Vec<u8>) -> OdpDatagram {
    OdpDatagram {
        header: OdpHeader {
            source: SpaceObjectRef::new(SpaceId::ZERO, dest),
            dest: SpaceObjectRef::new(SpaceId::ZERO, dest),
            source_port: dest_port,
            dest_port,
            unique_id: 0,
        },
        payload,
    }
}
