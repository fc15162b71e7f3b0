//! The forwarding plane: a local fast path that hands datagrams straight
//! to live sessions, and an inter-server path that resolves destinations
//! through OSeg and schedules transmission across per-peer queues under
//! weighted fair queuing.

pub mod fair_queue;

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use parsec_shared::{ObjectId, OdpDatagram, ServerId, SpaceInstant};

use crate::context::{Counters, SpaceContext};
use crate::forwarder::fair_queue::{FairQueue, PushResult, Queued};
use crate::oseg::ObjectSegmentation;

impl Queued for OdpDatagram {
    fn size(&self) -> usize {
        self.size()
    }
}

#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    /// Cap on datagrams parked per unresolved destination object.
    pub pending_per_object: usize,
    /// Cap on datagrams queued per peer server.
    pub peer_queue_messages: usize,
    pub default_peer_weight: f64,
    /// Null-message size for the fair queue's idle advancement.
    pub null_message_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            pending_per_object: 32,
            peer_queue_messages: 4096,
            default_peer_weight: 1.0,
            null_message_size: 64,
        }
    }
}

struct LocalRoute {
    enabled: bool,
    inbox: VecDeque<OdpDatagram>,
}

pub struct Forwarder {
    ctx: SpaceContext,
    config: ForwarderConfig,
    local: HashMap<ObjectId, LocalRoute>,
    peers: FairQueue<OdpDatagram, ServerId>,
    pending: HashMap<ObjectId, VecDeque<OdpDatagram>>,
    /// Objects mid-migration: traffic for them is relayed to the
    /// destination server until the handoff acks.
    migration_relays: HashMap<ObjectId, ServerId>,
}

impl Forwarder {
    pub fn new(ctx: SpaceContext, config: ForwarderConfig) -> Self {
        Self {
            ctx,
            peers: FairQueue::new(config.null_message_size),
            config,
            local: HashMap::new(),
            pending: HashMap::new(),
            migration_relays: HashMap::new(),
        }
    }

    // Session table

    pub fn register_local(&mut self, object: ObjectId) {
        self.local.insert(
            object,
            LocalRoute {
                enabled: true,
                inbox: VecDeque::new(),
            },
        );
    }

    pub fn unregister_local(&mut self, object: &ObjectId) {
        self.local.remove(object);
    }

    /// Temporarily stop local delivery (session paused mid-migration).
    pub fn set_local_enabled(&mut self, object: &ObjectId, enabled: bool) {
        if let Some(route) = self.local.get_mut(object) {
            route.enabled = enabled;
        }
    }

    pub fn is_local(&self, object: &ObjectId) -> bool {
        self.local.contains_key(object)
    }

    /// Push a datagram straight into a registered session's inbox,
    /// bypassing resolution entirely (used when replaying buffered
    /// migration traffic).
    pub fn deliver_local(&mut self, datagram: OdpDatagram) {
        let dest = datagram.header.dest.object;
        match self.local.get_mut(&dest) {
            Some(route) if route.enabled => {
                route.inbox.push_back(datagram);
                Counters::bump(&self.ctx.counters.forwarded_locally);
            }
            _ => Counters::bump(&self.ctx.counters.dropped_local_closed),
        }
    }

    /// The session layer drains each object's inbox for delivery.
    pub fn drain_local(&mut self, object: &ObjectId) -> Vec<OdpDatagram> {
        self.local
            .get_mut(object)
            .map(|route| route.inbox.drain(..).collect())
            .unwrap_or_default()
    }

    // Peer table

    pub fn ensure_peer(&mut self, server: ServerId) {
        if !self.peers.has_queue(&server) {
            self.peers.add_queue(
                server,
                self.config.default_peer_weight,
                self.config.peer_queue_messages,
            );
        }
    }

    pub fn set_peer_weight(&mut self, server: ServerId, weight: f64) {
        self.ensure_peer(server);
        self.peers.set_weight(&server, weight);
    }

    /// A peer connection died: discard its queue. The caller decides what
    /// to tell the connection manager.
    pub fn remove_peer(&mut self, server: &ServerId) -> usize {
        let dropped = self.peers.remove_queue(server).len();
        for _ in 0..dropped {
            Counters::bump(&self.ctx.counters.dropped_unknown_object);
        }
        dropped
    }

    // Migration relay

    pub fn set_migration_relay(&mut self, object: ObjectId, dest: ServerId) {
        self.migration_relays.insert(object, dest);
    }

    pub fn clear_migration_relay(&mut self, object: &ObjectId) {
        self.migration_relays.remove(object);
    }

    // Routing

    /// Route one datagram: local fast path, migration relay, resolved peer
    /// queue, or the pending table while a lookup is in flight.
    pub fn route(
        &mut self,
        datagram: OdpDatagram,
        oseg: &mut ObjectSegmentation,
        now: SpaceInstant,
    ) {
        let dest = datagram.header.dest.object;

        // local fast path: no serialization, straight to the session inbox
        if let Some(route) = self.local.get_mut(&dest) {
            if route.enabled {
                route.inbox.push_back(datagram);
                Counters::bump(&self.ctx.counters.forwarded_locally);
            } else {
                Counters::bump(&self.ctx.counters.dropped_local_closed);
            }
            return;
        }

        // mid-migration traffic chases the object to its destination
        if let Some(dest_server) = self.migration_relays.get(&dest).copied() {
            self.enqueue_peer(dest_server, datagram);
            return;
        }

        match oseg.lookup(&dest, now) {
            Some(entry) => {
                if entry.server == self.ctx.server_id {
                    // the directory says we host it but no session exists:
                    // a closed session or a stale self-entry either way
                    Counters::bump(&self.ctx.counters.dropped_local_closed);
                    debug!("dropping datagram for {} with no live session", dest);
                    return;
                }
                self.enqueue_peer(entry.server, datagram);
            }
            None => {
                let queue = self.pending.entry(dest).or_default();
                if queue.len() >= self.config.pending_per_object {
                    Counters::bump(&self.ctx.counters.dropped_pending_overflow);
                    debug!("pending queue overflow for {}", dest);
                    return;
                }
                queue.push_back(datagram);
            }
        }
    }

    /// OSeg resolved (or failed to resolve) an object: flush its parked
    /// datagrams.
    pub fn lookup_completed(&mut self, object: &ObjectId, server: Option<ServerId>) {
        let Some(parked) = self.pending.remove(object) else {
            return;
        };
        match server {
            Some(server) if server != self.ctx.server_id => {
                for datagram in parked {
                    self.enqueue_peer(server, datagram);
                }
            }
            Some(_) => {
                // resolved to ourselves after all: replay through the local
                // path in case the session connected meanwhile
                for datagram in parked {
                    let dest = datagram.header.dest.object;
                    if let Some(route) = self.local.get_mut(&dest) {
                        if route.enabled {
                            route.inbox.push_back(datagram);
                            Counters::bump(&self.ctx.counters.forwarded_locally);
                            continue;
                        }
                    }
                    Counters::bump(&self.ctx.counters.dropped_local_closed);
                }
            }
            None => {
                for _ in 0..parked.len() {
                    Counters::bump(&self.ctx.counters.dropped_unknown_object);
                }
                warn!("dropping {} datagrams for unresolvable {}", parked.len(), object);
            }
        }
    }

    fn enqueue_peer(&mut self, server: ServerId, datagram: OdpDatagram) {
        self.ensure_peer(server);
        if self.peers.push(&server, datagram) == PushResult::Overflow {
            Counters::bump(&self.ctx.counters.fair_queue_overflow);
        }
    }

    /// Transmit up to `budget_bytes` of inter-server traffic, fairly across
    /// peers. Returns (destination, datagram) pairs for the link layer.
    pub fn service(&mut self, budget_bytes: usize) -> Vec<(ServerId, OdpDatagram)> {
        let mut budget = budget_bytes;
        let mut out = Vec::new();
        while let Some((server, datagram)) = self.peers.pop(&mut budget) {
            out.push((server, datagram));
        }
        out
    }

    pub fn backlog(&self) -> usize {
        self.peers.total_queued()
    }
}
