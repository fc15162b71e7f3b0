//! One space-server node assembled: directory, location, proximity,
//! forwarding, receive-side weighting, sessions, and the peer links, all
//! driven from a single poll loop. The binary drives this on the wall
//! clock; tests drive it on a virtual one.

use log::{debug, warn};
use parsec_shared::sst::SstConfig;
use parsec_shared::{
    port, LocUpdate, ObjectId, OdpDatagram, OdpHeader, OhdpDatagram, ProxResults, ServerId,
    ServerMessage, SpaceInstant, SpaceObjectRef, WeightUpdate,
};

use crate::context::{Counters, SpaceContext};
use crate::forwarder::{Forwarder, ForwarderConfig};
use crate::link::PeerLinks;
use crate::loc::subscription::SubscriberRef;
use crate::loc::LocationService;
use crate::oseg::store::KeyValueStore;
use crate::oseg::{ObjectSegmentation, OsegConfig, OsegEvent};
use crate::prox::{ProxConfig, ProxEvent, ProximityEngine, QuerierRef, QueryCenter};
use crate::receiver::{ReceiverConfig, ServerMessageReceiver};
use crate::session::{ObjectSessionManager, SessionConfig};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub oseg: OsegConfig,
    pub prox: ProxConfig,
    pub forwarder: ForwarderConfig,
    pub receiver: ReceiverConfig,
    pub session: SessionConfig,
    pub sst: SstConfig,
    /// Inter-server transmit budget per tick, bytes.
    pub tick_budget_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            oseg: OsegConfig::default(),
            prox: ProxConfig::default(),
            forwarder: ForwarderConfig::default(),
            receiver: ReceiverConfig::default(),
            session: SessionConfig::default(),
            sst: SstConfig::default(),
            tick_budget_bytes: 256 * 1024,
        }
    }
}

pub struct SpaceServer {
    pub ctx: SpaceContext,
    config: ServerConfig,
    oseg: ObjectSegmentation,
    loc: LocationService,
    prox: ProximityEngine,
    forwarder: Forwarder,
    receiver: ServerMessageReceiver,
    sessions: ObjectSessionManager,
    links: PeerLinks,
    known_peers: Vec<ServerId>,
}

impl SpaceServer {
    pub fn new(
        ctx: SpaceContext,
        config: ServerConfig,
        store: Box<dyn KeyValueStore>,
        now: SpaceInstant,
    ) -> Self {
        let oseg = ObjectSegmentation::new(ctx.clone(), store, config.oseg.clone());
        let mut loc = LocationService::new(ctx.clone(), 1024);
        let prox = ProximityEngine::new(ctx.clone(), config.prox.clone(), &mut loc);
        let forwarder = Forwarder::new(ctx.clone(), config.forwarder.clone());
        let receiver = ServerMessageReceiver::new(config.receiver.clone(), now);
        let sessions = ObjectSessionManager::new(ctx.clone(), config.session.clone());
        let links = PeerLinks::new(ctx.clone(), config.sst.clone());
        Self {
            ctx,
            config,
            oseg,
            loc,
            prox,
            forwarder,
            receiver,
            sessions,
            links,
            known_peers: Vec::new(),
        }
    }

    /// Peers from the layout; links dial lazily as traffic appears.
    pub fn set_peers(&mut self, peers: Vec<ServerId>) {
        for peer in &peers {
            self.forwarder.ensure_peer(*peer);
        }
        self.known_peers = peers;
    }

    // Component access for orchestration and tests

    pub fn loc(&self) -> &LocationService {
        &self.loc
    }

    pub fn loc_mut(&mut self) -> &mut LocationService {
        &mut self.loc
    }

    pub fn oseg_mut(&mut self) -> &mut ObjectSegmentation {
        &mut self.oseg
    }

    pub fn sessions_mut(&mut self) -> &mut ObjectSessionManager {
        &mut self.sessions
    }

    /// Session lifecycle notifications accumulated since the last drain.
    pub fn drain_session_events(&mut self) -> Vec<crate::session::SessionEvent> {
        self.sessions.drain_events()
    }

    /// Hand `object` off to `dest`. Returns false when the object is not
    /// in a migratable state.
    pub fn begin_migration(&mut self, object: &ObjectId, dest: ServerId, now: SpaceInstant) -> bool {
        self.sessions.begin_migration(
            object,
            dest,
            now,
            &mut self.loc,
            &mut self.oseg,
            &mut self.forwarder,
        )
    }

    pub fn counters(&self) -> &Counters {
        &self.ctx.counters
    }

    /// Register a proximity query for a locally connected object.
    pub fn register_object_query(
        &mut self,
        object: ObjectId,
        theta: f32,
        max_results: usize,
    ) {
        self.prox.register_query(
            QuerierRef::Object(object),
            QueryCenter::Object(object),
            theta,
            max_results,
        );
    }

    /// Register a query on behalf of a peer server; its results seed that
    /// server's replicas.
    pub fn register_server_query(
        &mut self,
        server: ServerId,
        center: parsec_shared::Vec3,
        theta: f32,
        max_results: usize,
    ) {
        self.prox.register_query(
            QuerierRef::Server(server),
            QueryCenter::Position(center),
            theta,
            max_results,
        );
    }

    pub fn remove_object_query(&mut self, object: &ObjectId) {
        for event in self.prox.remove_query(&QuerierRef::Object(*object)) {
            if let ProxEvent::Exit { querier: QuerierRef::Object(querier), object } = event {
                self.loc
                    .unsubscribe(SubscriberRef::Object(querier), &object);
            }
        }
    }

    /// Drain the ODP datagrams owed to a locally connected object (its
    /// session inbox). The object host transport picks these up.
    pub fn drain_object_inbox(&mut self, object: &ObjectId) -> Vec<OdpDatagram> {
        self.forwarder.drain_local(object)
    }

    // External inputs

    /// A datagram arriving from an object host (session requests and
    /// object-to-object traffic).
    pub fn handle_object_datagram(&mut self, datagram: OdpDatagram, now: SpaceInstant) {
        if datagram.header.dest_port == port::SESSION {
            match ServerMessage::decode(&datagram.payload) {
                Ok(ServerMessage::SessionRequest(request)) => {
                    self.sessions.handle_session_request(request, &mut self.oseg);
                }
                Ok(other) => {
                    debug!("unexpected session-port payload: {:?}", other);
                    Counters::bump(&self.ctx.counters.parse_errors);
                }
                Err(error) => {
                    warn!("undecodable session request: {}", error);
                    Counters::bump(&self.ctx.counters.parse_errors);
                }
            }
            return;
        }
        self.route_object_datagram(datagram, now);
    }

    fn route_object_datagram(&mut self, datagram: OdpDatagram, now: SpaceInstant) {
        let dest = datagram.header.dest.object;
        if self.sessions.is_arriving(&dest) {
            // migration in progress: hold until the state applies
            self.sessions.buffer_arriving(&dest, datagram);
            return;
        }
        self.forwarder.route(datagram, &mut self.oseg, now);
    }

    /// A datagram arriving from a peer server.
    pub fn handle_server_datagram(&mut self, datagram: OhdpDatagram, now: SpaceInstant) {
        self.receiver
            .on_bytes(datagram.header.source_server, datagram.size());
        self.links.handle_datagram(datagram, now);
    }

    // The poll loop

    /// One tick: ingest peer messages, drive every component, and emit the
    /// OHDP datagrams owed to the network.
    pub fn tick(&mut self, now: SpaceInstant) -> Vec<OhdpDatagram> {
        // inbound server messages from the links
        for (from, message) in self.links.drain_inbound() {
            self.dispatch_server_message(from, message, now);
        }

        // a dead link discards its queued traffic
        for peer in self.links.drain_failed_peers() {
            let dropped = self.forwarder.remove_peer(&peer);
            if dropped > 0 {
                warn!("dropped {} queued datagrams for dead peer {}", dropped, peer);
            }
            // keep the queue alive for future traffic
            self.forwarder.ensure_peer(peer);
        }

        // directory completions
        self.oseg.process(now);
        for event in self.oseg.drain_events() {
            let leftover = self.sessions.handle_oseg_event(
                event,
                now,
                &mut self.loc,
                &mut self.forwarder,
            );
            match leftover {
                Some(OsegEvent::LookupCompleted { object, entry }) => {
                    self.forwarder
                        .lookup_completed(&object, entry.map(|entry| entry.server));
                }
                Some(_) | None => {}
            }
        }

        // migration timeouts
        self.sessions.tick(now, &mut self.oseg, &mut self.forwarder);

        // proximity evaluation feeds subscriptions and result streams
        let prox_events = self.prox.tick(now, &mut self.loc);
        self.deliver_prox_events(prox_events, now);

        // update distribution
        for (subscriber, updates) in self.loc.flush_subscriptions() {
            match subscriber {
                SubscriberRef::Server(server) => {
                    for update in updates {
                        self.links.send(server, &ServerMessage::Loc(update), now);
                    }
                }
                SubscriberRef::Object(object) => {
                    for update in updates {
                        let datagram = self.system_datagram(
                            object,
                            port::LOCATION,
                            ServerMessage::Loc(update).encode(),
                        );
                        self.route_object_datagram(datagram, now);
                    }
                }
            }
        }

        // session layer output; a null destination is a broadcast
        for (server, message) in self.sessions.drain_outbound() {
            if server.is_null() {
                for peer in self.known_peers.clone() {
                    self.links.send(peer, &message, now);
                }
            } else {
                self.links.send(server, &message, now);
            }
        }
        for response in self.sessions.drain_responses() {
            let object = response.object;
            let datagram = self.system_datagram(
                object,
                port::SESSION,
                ServerMessage::SessionResponse(response).encode(),
            );
            // the responding path works even for rejected sessions with no
            // local route; those drop with a counter, as the object host
            // is expected to poll
            self.route_object_datagram(datagram, now);
        }

        // receive-side weight rebroadcast
        if let Some(update) = self.receiver.tick(now) {
            for peer in self.known_peers.clone() {
                self.links
                    .send(peer, &ServerMessage::Weight(update.clone()), now);
            }
        }

        // fair-queued inter-server transmission
        for (server, datagram) in self.forwarder.service(self.config.tick_budget_bytes) {
            self.links.send(
                server,
                &ServerMessage::ObjectRoute(datagram.encode()),
                now,
            );
        }

        self.links.advance(now)
    }

    fn dispatch_server_message(&mut self, from: ServerId, message: ServerMessage, now: SpaceInstant) {
        match message {
            ServerMessage::Loc(update) => {
                self.loc.replica_updated(&update);
            }
            ServerMessage::OsegMigrateAck(ack) => {
                self.sessions.handle_migrate_ack(
                    &ack,
                    &mut self.loc,
                    &mut self.oseg,
                    &mut self.forwarder,
                );
            }
            ServerMessage::OsegUpdate(update) => {
                self.oseg.handle_oseg_update(&update);
            }
            ServerMessage::Weight(update) => self.apply_weight_update(from, update),
            ServerMessage::Migrate(state) => {
                self.sessions.handle_migrate_state(state, &mut self.oseg);
            }
            ServerMessage::ObjectRoute(bytes) => match OdpDatagram::decode(&bytes) {
                Ok(datagram) => self.route_object_datagram(datagram, now),
                Err(error) => {
                    warn!("undecodable routed datagram from {}: {}", from, error);
                    Counters::bump(&self.ctx.counters.parse_errors);
                }
            },
            ServerMessage::SessionRequest(_)
            | ServerMessage::SessionResponse(_)
            | ServerMessage::Prox(_) => {
                warn!("object-facing message on the server link from {}", from);
                Counters::bump(&self.ctx.counters.parse_errors);
            }
        }
    }

    fn apply_weight_update(&mut self, from: ServerId, update: WeightUpdate) {
        // our share of the receiver's capacity becomes the weight of our
        // queue toward it
        for (server, share) in update.entries {
            if server == self.ctx.server_id {
                let weight = share.max(f64::MIN_POSITIVE);
                self.forwarder.set_peer_weight(from, weight);
            }
        }
    }

    fn deliver_prox_events(&mut self, events: Vec<ProxEvent>, now: SpaceInstant) {
        use std::collections::BTreeMap;

        // batch per querier, maintaining subscriptions as objects enter
        // and leave result sets
        let mut batches: BTreeMap<QuerierRef, ProxResults> = BTreeMap::new();
        for event in events {
            match event {
                ProxEvent::Enter { querier, object, fields } => {
                    let subscriber = match querier {
                        QuerierRef::Object(q) => SubscriberRef::Object(q),
                        QuerierRef::Server(s) => SubscriberRef::Server(s),
                    };
                    self.loc.subscribe(subscriber, object);
                    batches
                        .entry(querier)
                        .or_default()
                        .enter
                        .push((object, fields));
                }
                ProxEvent::Exit { querier, object } => {
                    let subscriber = match querier {
                        QuerierRef::Object(q) => SubscriberRef::Object(q),
                        QuerierRef::Server(s) => SubscriberRef::Server(s),
                    };
                    self.loc.unsubscribe(subscriber, &object);
                    batches.entry(querier).or_default().exit.push(object);
                }
            }
        }

        for (querier, results) in batches {
            match querier {
                QuerierRef::Server(server) => {
                    // a remote server's querier: seed its replicas directly
                    for (object, fields) in &results.enter {
                        self.links.send(
                            server,
                            &ServerMessage::Loc(LocUpdate {
                                object: *object,
                                aggregate: false,
                                fields: fields.clone(),
                            }),
                            now,
                        );
                    }
                }
                QuerierRef::Object(object) => {
                    let datagram = self.system_datagram(
                        object,
                        port::PROXIMITY,
                        ServerMessage::Prox(results).encode(),
                    );
                    self.route_object_datagram(datagram, now);
                }
            }
        }
    }

    fn system_datagram(&self, dest: ObjectId, dest_port: u32, payload: Vec<u8>) -> OdpDatagram {
        OdpDatagram {
            header: OdpHeader {
                source: SpaceObjectRef::new(self.ctx.space, ObjectId::ZERO),
                dest: SpaceObjectRef::new(self.ctx.space, dest),
                source_port: dest_port,
                dest_port,
                unique_id: fastrand::u64(..),
            },
            payload,
        }
    }
}
