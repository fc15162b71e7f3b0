//! Object segmentation: the distributed directory mapping each object to
//! the server currently authoritative for it, with a local cache and
//! migration handoff. The backing-store write is the commit point for every
//! ownership change; at most one server holds an object locally at a time.

pub mod cache;
pub mod store;

use std::collections::HashMap;

use log::{error, warn};
use parsec_shared::{ObjectId, OsegMigrateAck, OsegUpdate, ServerId, SpaceDuration, SpaceInstant};

use crate::context::{Counters, SpaceContext};
use crate::oseg::cache::OsegCache;
use crate::oseg::store::{KeyValueStore, StoreRequest, StoreResponse, StoreToken};

/// A directory answer: which server owns the object, and its radius. A
/// missing entry is represented by `Option::None`, never by server 0.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct OsegEntry {
    pub server: ServerId,
    pub radius: f32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OsegAddStatus {
    Success,
    AlreadyRegistered,
    UnknownError,
}

/// Completions drained by the owner each tick.
#[derive(Clone, Debug)]
pub enum OsegEvent {
    LookupCompleted {
        object: ObjectId,
        entry: Option<OsegEntry>,
    },
    AddNewFinished {
        object: ObjectId,
        status: OsegAddStatus,
    },
    /// Destination-side directory write committed; if `ack_to` is set the
    /// session layer owes the source a MigrateAck.
    MigrateCommitted {
        object: ObjectId,
        radius: f32,
        ack_to: Option<ServerId>,
    },
    MigrateCommitFailed {
        object: ObjectId,
    },
    /// Source side: the destination acknowledged; the session may now be
    /// torn down.
    MigrationAcked {
        object: ObjectId,
        new_server: ServerId,
        radius: f32,
    },
    RemoveFinished {
        object: ObjectId,
    },
}

enum PendingOp {
    Lookup { object: ObjectId, started: SpaceInstant },
    AddNew { object: ObjectId, radius: f32 },
    AddMigrated {
        object: ObjectId,
        radius: f32,
        ack_to: Option<ServerId>,
    },
    Remove { object: ObjectId },
}

/// Tuning for the directory component.
#[derive(Clone, Debug)]
pub struct OsegConfig {
    pub prefix: String,
    pub cache_capacity: usize,
    pub cache_ttl: SpaceDuration,
    pub lookup_timeout: SpaceDuration,
}

impl Default for OsegConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            cache_capacity: 10_000,
            cache_ttl: SpaceDuration::from_secs(60),
            lookup_timeout: SpaceDuration::from_secs(5),
        }
    }
}

pub struct ObjectSegmentation {
    ctx: SpaceContext,
    store: Box<dyn KeyValueStore>,
    prefix: String,
    lookup_timeout: SpaceDuration,
    cache: OsegCache,
    /// Objects this server is authoritative for, with their radii.
    local: HashMap<ObjectId, f32>,
    /// Outgoing migrations awaiting the destination's ack; we keep
    /// forwarding for these but no longer claim authority.
    migrating_out: HashMap<ObjectId, OsegEntry>,
    pending: HashMap<StoreToken, PendingOp>,
    pending_lookups: HashMap<ObjectId, StoreToken>,
    next_token: StoreToken,
    events: Vec<OsegEvent>,
}

impl ObjectSegmentation {
    pub fn new(ctx: SpaceContext, store: Box<dyn KeyValueStore>, config: OsegConfig) -> Self {
        Self {
            ctx,
            store,
            prefix: config.prefix,
            lookup_timeout: config.lookup_timeout,
            cache: OsegCache::new(config.cache_capacity, config.cache_ttl),
            local: HashMap::new(),
            migrating_out: HashMap::new(),
            pending: HashMap::new(),
            pending_lookups: HashMap::new(),
            next_token: 1,
            events: Vec::new(),
        }
    }

    fn key(&self, object: &ObjectId) -> String {
        format!("{}{}", self.prefix, object)
    }

    fn value(&self, radius: f32) -> String {
        format!("{}:{}", self.ctx.server_id.0, radius)
    }

    fn parse_value(value: &str) -> Option<OsegEntry> {
        let (server, radius) = value.split_once(':')?;
        let server: u32 = server.parse().ok()?;
        let radius: f32 = radius.parse().ok()?;
        if server == 0 {
            return None;
        }
        Some(OsegEntry {
            server: ServerId(server),
            radius,
        })
    }

    fn allocate_token(&mut self, op: PendingOp) -> StoreToken {
        let token = self.next_token;
        self.next_token += 1;
        self.pending.insert(token, op);
        token
    }

    /// Is this server currently authoritative for `object`?
    pub fn is_local(&self, object: &ObjectId) -> bool {
        self.local.contains_key(object)
    }

    /// Is an outgoing migration in flight for `object`?
    pub fn is_migrating_out(&self, object: &ObjectId) -> bool {
        self.migrating_out.contains_key(object)
    }

    // Public operations

    /// Non-blocking, possibly-stale read: the local table, then the cache.
    pub fn cache_lookup(&mut self, object: &ObjectId) -> Option<OsegEntry> {
        if let Some(radius) = self.local.get(object) {
            return Some(OsegEntry {
                server: self.ctx.server_id,
                radius: *radius,
            });
        }
        self.cache.get_stale(object)
    }

    /// Resolve `object`. A synchronous answer comes from the local table or
    /// a fresh cache entry; otherwise a store read is issued and the answer
    /// arrives later as [`OsegEvent::LookupCompleted`].
    pub fn lookup(&mut self, object: &ObjectId, now: SpaceInstant) -> Option<OsegEntry> {
        if let Some(radius) = self.local.get(object) {
            return Some(OsegEntry {
                server: self.ctx.server_id,
                radius: *radius,
            });
        }
        if let Some(entry) = self.cache.get(object, now) {
            Counters::bump(&self.ctx.counters.oseg_cache_hits);
            return Some(entry);
        }
        Counters::bump(&self.ctx.counters.oseg_cache_misses);

        if self.pending_lookups.contains_key(object) {
            // a read is already in flight; its completion answers this
            // caller too
            return None;
        }
        let key = self.key(object);
        let token = self.allocate_token(PendingOp::Lookup {
            object: *object,
            started: now,
        });
        self.pending_lookups.insert(*object, token);
        self.store.submit(token, StoreRequest::Get { key });
        None
    }

    /// Register a freshly connected object. Completes with
    /// [`OsegEvent::AddNewFinished`]; the conditional write makes
    /// simultaneous registrations race safely.
    pub fn add_new_object(&mut self, object: ObjectId, radius: f32) {
        let key = self.key(&object);
        let value = self.value(radius);
        let token = self.allocate_token(PendingOp::AddNew { object, radius });
        self.store.submit(token, StoreRequest::SetNx { key, value });
    }

    /// Claim authority for an object arriving by migration. The
    /// unconditional write is the commit point; if `generate_ack`, the
    /// completion event instructs the session layer to ack `from`.
    pub fn add_migrated_object(
        &mut self,
        object: ObjectId,
        radius: f32,
        from: ServerId,
        generate_ack: bool,
    ) {
        let key = self.key(&object);
        let value = self.value(radius);
        let token = self.allocate_token(PendingOp::AddMigrated {
            object,
            radius,
            ack_to: generate_ack.then_some(from),
        });
        self.store.submit(token, StoreRequest::Set { key, value });
    }

    /// Deregister a local object (disconnect, not migration).
    pub fn remove_object(&mut self, object: &ObjectId) {
        if self.local.remove(object).is_none() {
            warn!("remove_object for non-local object {}", object);
        }
        let key = self.key(object);
        let token = self.allocate_token(PendingOp::Remove { object: *object });
        self.store.submit(token, StoreRequest::Del { key });
    }

    /// Gate before shipping migration state: false when the object is not
    /// ours or another migration is already in flight.
    pub fn clear_to_migrate(&self, object: &ObjectId) -> bool {
        self.local.contains_key(object) && !self.migrating_out.contains_key(object)
    }

    /// Relinquish local authority; the destination's `add_migrated_object`
    /// performs the directory write, preserving exactly-one ownership.
    pub fn migrate_object(&mut self, object: &ObjectId, new_entry: OsegEntry) {
        if self.local.remove(object).is_none() {
            error!(
                "migrate_object for object {} we are not authoritative for",
                object
            );
            return;
        }
        let now = self.ctx.now();
        self.migrating_out.insert(*object, new_entry);
        self.cache.insert(*object, new_entry, now);
        Counters::bump(&self.ctx.counters.migrations_out);
    }

    /// Abort an outgoing migration whose handoff never completed: the
    /// directory still names this server, so reclaim local authority.
    pub fn revert_migration(&mut self, object: &ObjectId, radius: f32) {
        if self.migrating_out.remove(object).is_none() {
            return;
        }
        self.local.insert(*object, radius);
    }

    // Message handlers

    pub fn handle_migrate_ack(&mut self, ack: &OsegMigrateAck) {
        let now = self.ctx.now();
        match self.migrating_out.remove(&ack.object) {
            Some(_) => {
                let entry = OsegEntry {
                    server: ack.from,
                    radius: ack.radius,
                };
                self.cache.insert(ack.object, entry, now);
                self.events.push(OsegEvent::MigrationAcked {
                    object: ack.object,
                    new_server: ack.from,
                    radius: ack.radius,
                });
            }
            None => {
                // consistency error: never mutate local state for it
                error!(
                    "migrate ack for object {} with no migration in flight",
                    ack.object
                );
            }
        }
    }

    pub fn handle_oseg_update(&mut self, update: &OsegUpdate) {
        let now = self.ctx.now();
        if update.server.is_null() {
            self.cache.invalidate(&update.object);
            return;
        }
        self.cache.insert(
            update.object,
            OsegEntry {
                server: update.server,
                radius: update.radius,
            },
            now,
        );
    }

    // Poll

    /// Drain store completions and lookup timeouts into events.
    pub fn process(&mut self, now: SpaceInstant) {
        for (token, result) in self.store.poll() {
            let Some(op) = self.pending.remove(&token) else {
                continue;
            };
            match op {
                PendingOp::Lookup { object, .. } => {
                    self.pending_lookups.remove(&object);
                    let entry = match result {
                        Ok(StoreResponse::Value(Some(raw))) => match Self::parse_value(&raw) {
                            Some(entry) => {
                                self.cache.insert(object, entry, now);
                                Some(entry)
                            }
                            None => {
                                error!("malformed directory value '{}' for {}", raw, object);
                                None
                            }
                        },
                        Ok(StoreResponse::Value(None)) => None,
                        Ok(other) => {
                            error!("unexpected reply {:?} to directory read", other);
                            None
                        }
                        Err(error) => {
                            // directory unreachable: fall back to the last
                            // cached answer if there is one
                            warn!("directory read for {} failed: {}", object, error);
                            self.cache.get_stale(&object)
                        }
                    };
                    self.events.push(OsegEvent::LookupCompleted { object, entry });
                }
                PendingOp::AddNew { object, radius } => {
                    let status = match result {
                        Ok(StoreResponse::SetNx { won: true }) => {
                            self.local.insert(object, radius);
                            self.cache.insert(
                                object,
                                OsegEntry {
                                    server: self.ctx.server_id,
                                    radius,
                                },
                                now,
                            );
                            OsegAddStatus::Success
                        }
                        Ok(StoreResponse::SetNx { won: false }) => OsegAddStatus::AlreadyRegistered,
                        Ok(other) => {
                            error!("unexpected reply {:?} to conditional add", other);
                            OsegAddStatus::UnknownError
                        }
                        Err(error) => {
                            warn!("directory add for {} failed: {}", object, error);
                            OsegAddStatus::UnknownError
                        }
                    };
                    self.events.push(OsegEvent::AddNewFinished { object, status });
                }
                PendingOp::AddMigrated {
                    object,
                    radius,
                    ack_to,
                } => match result {
                    Ok(StoreResponse::Done) => {
                        self.local.insert(object, radius);
                        self.cache.insert(
                            object,
                            OsegEntry {
                                server: self.ctx.server_id,
                                radius,
                            },
                            now,
                        );
                        Counters::bump(&self.ctx.counters.migrations_in);
                        self.events.push(OsegEvent::MigrateCommitted {
                            object,
                            radius,
                            ack_to,
                        });
                    }
                    other => {
                        warn!("directory write for migrated {} failed: {:?}", object, other);
                        self.events.push(OsegEvent::MigrateCommitFailed { object });
                    }
                },
                PendingOp::Remove { object } => {
                    self.cache.invalidate(&object);
                    self.events.push(OsegEvent::RemoveFinished { object });
                }
            }
        }

        // expire stuck lookups
        let timeout = self.lookup_timeout;
        let mut expired: Vec<(ObjectId, StoreToken)> = Vec::new();
        for (token, op) in self.pending.iter() {
            if let PendingOp::Lookup { object, started } = op {
                if now >= *started + timeout {
                    expired.push((*object, *token));
                }
            }
        }
        for (object, token) in expired {
            self.pending.remove(&token);
            self.pending_lookups.remove(&object);
            let entry = self.cache.get_stale(&object);
            warn!("directory read for {} timed out", object);
            self.events.push(OsegEvent::LookupCompleted { object, entry });
        }
    }

    pub fn drain_events(&mut self) -> Vec<OsegEvent> {
        std::mem::take(&mut self.events)
    }
}
