//! The object connection manager: session admission against the directory,
//! disconnects, and both sides of migration orchestration. A migrating
//! object's traffic is relayed by the source until the destination's
//! directory commit is acknowledged; the destination buffers that traffic
//! until the migrated state has been applied.

use std::collections::{HashMap, HashSet};

use log::{error, info, warn};
use parsec_shared::{
    MigrateState, ObjectId, OdpDatagram, OsegMigrateAck, ServerId, SessionRequest, SessionResponse,
    SessionStatus, SpaceDuration, SpaceInstant,
};

use crate::context::SpaceContext;
use crate::forwarder::Forwarder;
use crate::loc::record::LocRecord;
use crate::loc::subscription::SubscriberRef;
use crate::loc::LocationService;
use crate::oseg::{ObjectSegmentation, OsegAddStatus, OsegEntry, OsegEvent};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    Connecting,
    Connected,
    MigratingOut,
    Disconnecting,
    Disconnected,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Admitted { object: ObjectId },
    Rejected { object: ObjectId, status: SessionStatus },
    Disconnected { object: ObjectId },
    MigrationStarted { object: ObjectId, dest: ServerId },
    /// Source side: the destination acknowledged, the object is gone.
    MigrationCompleted { object: ObjectId, dest: ServerId },
    /// Destination side: state applied, the object now lives here.
    MigrationArrived { object: ObjectId, from: ServerId },
    MigrationFailed { object: ObjectId },
}

struct Session {
    state: SessionState,
    radius: f32,
}

struct ArrivingMigration {
    from: ServerId,
    state: MigrateState,
    buffered: Vec<OdpDatagram>,
}

struct OutgoingMigration {
    dest: ServerId,
    radius: f32,
    started: SpaceInstant,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub secret: Vec<u8>,
    pub migration_timeout: SpaceDuration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: b"parsec".to_vec(),
            migration_timeout: SpaceDuration::from_secs(30),
        }
    }
}

pub struct ObjectSessionManager {
    ctx: SpaceContext,
    config: SessionConfig,
    sessions: HashMap<ObjectId, Session>,
    /// Admission in flight: session requests waiting on the directory.
    connecting: HashMap<ObjectId, SessionRequest>,
    arriving: HashMap<ObjectId, ArrivingMigration>,
    outgoing: HashMap<ObjectId, OutgoingMigration>,
    /// Terminal sessions noticed by a previous tick; swept on the next so
    /// the Disconnected state stays queryable for one poll round.
    retired: HashSet<ObjectId>,
    events: Vec<SessionEvent>,
    /// Server messages owed to peers (migrate state, acks).
    outbound: Vec<(ServerId, parsec_shared::ServerMessage)>,
    /// Responses owed to connecting objects.
    responses: Vec<SessionResponse>,
}

impl ObjectSessionManager {
    pub fn new(ctx: SpaceContext, config: SessionConfig) -> Self {
        Self {
            ctx,
            config,
            sessions: HashMap::new(),
            connecting: HashMap::new(),
            arriving: HashMap::new(),
            outgoing: HashMap::new(),
            retired: HashSet::new(),
            events: Vec::new(),
            outbound: Vec::new(),
            responses: Vec::new(),
        }
    }

    pub fn state(&self, object: &ObjectId) -> Option<SessionState> {
        if self.connecting.contains_key(object) {
            return Some(SessionState::Connecting);
        }
        self.sessions.get(object).map(|session| session.state)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drain_outbound(&mut self) -> Vec<(ServerId, parsec_shared::ServerMessage)> {
        std::mem::take(&mut self.outbound)
    }

    pub fn drain_responses(&mut self) -> Vec<SessionResponse> {
        std::mem::take(&mut self.responses)
    }

    // Admission

    /// An object asks to join. The credential gates entry; the directory's
    /// conditional write decides races with other servers.
    pub fn handle_session_request(&mut self, request: SessionRequest, oseg: &mut ObjectSegmentation) {
        let object = request.object;
        if request.token != self.config.secret {
            warn!("rejecting session for {}: bad credential", object);
            self.responses.push(SessionResponse {
                object,
                status: SessionStatus::InvalidToken,
            });
            self.events.push(SessionEvent::Rejected {
                object,
                status: SessionStatus::InvalidToken,
            });
            return;
        }
        if self.sessions.contains_key(&object) || self.connecting.contains_key(&object) {
            self.responses.push(SessionResponse {
                object,
                status: SessionStatus::AlreadyRegistered,
            });
            self.events.push(SessionEvent::Rejected {
                object,
                status: SessionStatus::AlreadyRegistered,
            });
            return;
        }
        oseg.add_new_object(object, request.radius);
        self.connecting.insert(object, request);
    }

    // Migration, source side

    /// Start shipping `object` to `dest`. Returns false when the object is
    /// not in a migratable state.
    pub fn begin_migration(
        &mut self,
        object: &ObjectId,
        dest: ServerId,
        now: SpaceInstant,
        loc: &mut LocationService,
        oseg: &mut ObjectSegmentation,
        forwarder: &mut Forwarder,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(object) else {
            warn!("cannot migrate {}: no session", object);
            return false;
        };
        if session.state != SessionState::Connected {
            warn!("cannot migrate {}: session is {:?}", object, session.state);
            return false;
        }
        if !oseg.clear_to_migrate(object) {
            warn!("cannot migrate {}: not clear to migrate", object);
            return false;
        }
        let Some(record) = loc.record(object) else {
            error!("session for {} has no loc record", object);
            return false;
        };
        let radius = session.radius;
        let subscribers: Vec<ObjectId> = loc
            .subscribers_of(object)
            .into_iter()
            .filter_map(|subscriber| match subscriber {
                SubscriberRef::Object(subscriber_object) => Some(subscriber_object),
                SubscriberRef::Server(_) => None,
            })
            .collect();
        let state = MigrateState {
            object: *object,
            radius,
            source: self.ctx.server_id,
            fields: record.to_fields(),
            subscribers,
        };

        session.state = SessionState::MigratingOut;
        oseg.migrate_object(
            object,
            OsegEntry {
                server: dest,
                radius,
            },
        );
        // traffic for the object now chases it to the destination
        forwarder.unregister_local(object);
        forwarder.set_migration_relay(*object, dest);
        self.outgoing.insert(
            *object,
            OutgoingMigration {
                dest,
                radius,
                started: now,
            },
        );
        self.outbound
            .push((dest, parsec_shared::ServerMessage::Migrate(state)));
        self.events.push(SessionEvent::MigrationStarted {
            object: *object,
            dest,
        });
        info!("migration of {} to {} started", object, dest);
        true
    }

    /// The destination acknowledged: drop our copy and the session.
    pub fn handle_migrate_ack(
        &mut self,
        ack: &OsegMigrateAck,
        loc: &mut LocationService,
        oseg: &mut ObjectSegmentation,
        forwarder: &mut Forwarder,
    ) {
        oseg.handle_migrate_ack(ack);
        // oseg validated the ack; only a real in-flight migration reaches
        // the session teardown
        let Some(outgoing) = self.outgoing.remove(&ack.object) else {
            return;
        };
        // the ack is the handoff's completion: the session goes straight
        // to its terminal state and is swept on a later tick
        if let Some(session) = self.sessions.get_mut(&ack.object) {
            session.state = SessionState::Disconnected;
        }
        loc.local_object_removed(&ack.object);
        loc.unsubscribe_all(SubscriberRef::Object(ack.object));
        forwarder.clear_migration_relay(&ack.object);
        self.events.push(SessionEvent::MigrationCompleted {
            object: ack.object,
            dest: outgoing.dest,
        });
        self.events.push(SessionEvent::Disconnected { object: ack.object });
        info!("migration of {} to {} complete", ack.object, outgoing.dest);
    }

    // Migration, destination side

    /// Migrated state arrived: claim authority via the directory. Traffic
    /// for the object buffers here until the commit lands.
    pub fn handle_migrate_state(&mut self, state: MigrateState, oseg: &mut ObjectSegmentation) {
        if oseg.is_local(&state.object) {
            error!(
                "migration arrived for {} which we already own",
                state.object
            );
            return;
        }
        let from = state.source;
        oseg.add_migrated_object(state.object, state.radius, from, true);
        self.arriving.insert(
            state.object,
            ArrivingMigration {
                from,
                state,
                buffered: Vec::new(),
            },
        );
    }

    pub fn is_arriving(&self, object: &ObjectId) -> bool {
        self.arriving.contains_key(object)
    }

    /// Park a datagram for an object whose migration has not applied yet.
    pub fn buffer_arriving(&mut self, object: &ObjectId, datagram: OdpDatagram) {
        if let Some(arriving) = self.arriving.get_mut(object) {
            arriving.buffered.push(datagram);
        }
    }

    // Directory completions

    /// Feed every OSeg event through the session layer; unhandled events
    /// are returned for other components (the forwarder's lookups).
    pub fn handle_oseg_event(
        &mut self,
        event: OsegEvent,
        now: SpaceInstant,
        loc: &mut LocationService,
        forwarder: &mut Forwarder,
    ) -> Option<OsegEvent> {
        match event {
            OsegEvent::AddNewFinished { object, status } => {
                self.finish_admission(object, status, now, loc, forwarder);
                None
            }
            OsegEvent::MigrateCommitted {
                object,
                radius,
                ack_to,
            } => {
                self.finish_arrival(object, radius, ack_to, loc, forwarder);
                None
            }
            OsegEvent::MigrateCommitFailed { object } => {
                error!("migration commit for {} failed; dropping arrival", object);
                self.arriving.remove(&object);
                self.events.push(SessionEvent::MigrationFailed { object });
                None
            }
            OsegEvent::RemoveFinished { object } => {
                // the directory delete completes a disconnect
                if let Some(session) = self.sessions.get_mut(&object) {
                    if session.state == SessionState::Disconnecting {
                        session.state = SessionState::Disconnected;
                        self.events.push(SessionEvent::Disconnected { object });
                    }
                }
                None
            }
            other => Some(other),
        }
    }

    fn finish_admission(
        &mut self,
        object: ObjectId,
        status: OsegAddStatus,
        now: SpaceInstant,
        loc: &mut LocationService,
        forwarder: &mut Forwarder,
    ) {
        let Some(request) = self.connecting.remove(&object) else {
            // an add we did not initiate (e.g. test-driven); ignore
            return;
        };
        match status {
            OsegAddStatus::Success => {
                let mut record = LocRecord::from_fields(&request.fields, false);
                if request.fields.is_empty() {
                    record = LocRecord::stationary(now, parsec_shared::Vec3::ZERO, request.radius);
                }
                self.sessions.insert(
                    object,
                    Session {
                        state: SessionState::Connected,
                        radius: request.radius,
                    },
                );
                forwarder.register_local(object);
                loc.local_object_added(object, record);
                self.responses.push(SessionResponse {
                    object,
                    status: SessionStatus::Success,
                });
                self.events.push(SessionEvent::Admitted { object });
                info!("session for {} admitted", object);
            }
            OsegAddStatus::AlreadyRegistered => {
                // the object lives elsewhere; it must pick a fresh id
                self.responses.push(SessionResponse {
                    object,
                    status: SessionStatus::AlreadyRegistered,
                });
                self.events.push(SessionEvent::Rejected {
                    object,
                    status: SessionStatus::AlreadyRegistered,
                });
            }
            OsegAddStatus::UnknownError => {
                self.responses.push(SessionResponse {
                    object,
                    status: SessionStatus::InternalError,
                });
                self.events.push(SessionEvent::Rejected {
                    object,
                    status: SessionStatus::InternalError,
                });
            }
        }
    }

    fn finish_arrival(
        &mut self,
        object: ObjectId,
        radius: f32,
        ack_to: Option<ServerId>,
        loc: &mut LocationService,
        forwarder: &mut Forwarder,
    ) {
        let Some(arriving) = self.arriving.remove(&object) else {
            warn!("directory commit for {} with no arriving state", object);
            return;
        };
        let record = LocRecord::from_fields(&arriving.state.fields, false);
        self.sessions.insert(
            object,
            Session {
                state: SessionState::Connected,
                radius,
            },
        );
        forwarder.register_local(object);
        loc.local_object_added(object, record);
        for subscriber in &arriving.state.subscribers {
            loc.subscribe(SubscriberRef::Object(*subscriber), object);
        }
        // replay traffic that raced ahead of the state transfer
        for datagram in arriving.buffered {
            forwarder.deliver_local(datagram);
        }
        if let Some(ack_to) = ack_to {
            self.outbound.push((
                ack_to,
                parsec_shared::ServerMessage::OsegMigrateAck(OsegMigrateAck {
                    from: self.ctx.server_id,
                    to: ack_to,
                    object,
                    radius,
                }),
            ));
        }
        // best-effort cache invalidation; the null destination fans out to
        // every peer
        self.outbound.push((
            ServerId::NULL,
            parsec_shared::ServerMessage::OsegUpdate(parsec_shared::OsegUpdate {
                object,
                server: self.ctx.server_id,
                radius,
            }),
        ));
        self.events.push(SessionEvent::MigrationArrived {
            object,
            from: arriving.from,
        });
        info!("migration of {} from {} applied", object, arriving.from);
    }

    // Disconnect

    /// Begin tearing a session down: presence and routing go immediately,
    /// the state machine moves to `Disconnecting`, and `Disconnected`
    /// follows once the directory delete lands.
    pub fn disconnect(
        &mut self,
        object: &ObjectId,
        loc: &mut LocationService,
        oseg: &mut ObjectSegmentation,
        forwarder: &mut Forwarder,
    ) {
        let Some(session) = self.sessions.get_mut(object) else {
            return;
        };
        match session.state {
            SessionState::MigratingOut => {
                warn!("disconnect for {} during migration; letting handoff finish", object);
                return;
            }
            SessionState::Disconnecting | SessionState::Disconnected => return,
            SessionState::Connecting | SessionState::Connected => {}
        }
        session.state = SessionState::Disconnecting;
        oseg.remove_object(object);
        loc.local_object_removed(object);
        loc.unsubscribe_all(SubscriberRef::Object(*object));
        forwarder.unregister_local(object);
    }

    // Poll

    /// Expire outgoing migrations whose handoff never completed (the
    /// object stays on this server) and sweep terminal sessions.
    pub fn tick(
        &mut self,
        now: SpaceInstant,
        oseg: &mut ObjectSegmentation,
        forwarder: &mut Forwarder,
    ) {
        // two-phase sweep: a Disconnected session noticed by the previous
        // pass is dropped now, so the terminal state was queryable for at
        // least one full poll round
        let previously_retired = std::mem::take(&mut self.retired);
        self.sessions.retain(|object, session| {
            session.state != SessionState::Disconnected || !previously_retired.contains(object)
        });
        self.retired = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state == SessionState::Disconnected)
            .map(|(object, _)| *object)
            .collect();

        let timeout = self.config.migration_timeout;
        let expired: Vec<ObjectId> = self
            .outgoing
            .iter()
            .filter(|(_, outgoing)| now >= outgoing.started + timeout)
            .map(|(object, _)| *object)
            .collect();
        for object in expired {
            let outgoing = self.outgoing.remove(&object).expect("from keys");
            error!(
                "migration of {} to {} timed out; keeping the object",
                object, outgoing.dest
            );
            oseg.revert_migration(&object, outgoing.radius);
            forwarder.clear_migration_relay(&object);
            forwarder.register_local(object);
            if let Some(session) = self.sessions.get_mut(&object) {
                session.state = SessionState::Connected;
            }
            self.events.push(SessionEvent::MigrationFailed { object });
        }
    }
}
