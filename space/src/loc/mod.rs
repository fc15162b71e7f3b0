//! The location service: authoritative presence records for locally-owned
//! objects, read-only replicas for remote objects of interest, listener
//! fan-out, and subscription-based update distribution.

pub mod record;
pub mod subscription;

use std::collections::HashMap;

use log::warn;
use parsec_shared::{LocField, LocUpdate, ObjectId};

use crate::context::{Counters, SpaceContext};
use crate::loc::record::LocRecord;
use crate::loc::subscription::{SubscriberRef, SubscriberTable};

/// Change notifications fanned out to registered listeners (the proximity
/// engine among them). Listeners see the same event stream subscribers do.
#[derive(Clone, Debug)]
pub enum LocEvent {
    Added {
        object: ObjectId,
        aggregate: bool,
        local: bool,
    },
    Removed {
        object: ObjectId,
    },
    Updated {
        object: ObjectId,
        aggregate: bool,
        field: LocField,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ListenerKey(u32);

struct Listener {
    wants_aggregates: bool,
    queue: Vec<LocEvent>,
}

pub struct LocationService {
    ctx: SpaceContext,
    local: HashMap<ObjectId, LocRecord>,
    replicas: HashMap<ObjectId, LocRecord>,
    listeners: HashMap<ListenerKey, Listener>,
    next_listener: u32,
    subscribers: SubscriberTable,
}

impl LocationService {
    pub fn new(ctx: SpaceContext, max_pending_per_subscriber: usize) -> Self {
        Self {
            ctx,
            local: HashMap::new(),
            replicas: HashMap::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            subscribers: SubscriberTable::new(max_pending_per_subscriber),
        }
    }

    // Listener registration

    pub fn add_listener(&mut self, wants_aggregates: bool) -> ListenerKey {
        let key = ListenerKey(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(
            key,
            Listener {
                wants_aggregates,
                queue: Vec::new(),
            },
        );
        key
    }

    pub fn remove_listener(&mut self, key: ListenerKey) {
        self.listeners.remove(&key);
    }

    pub fn drain_listener(&mut self, key: ListenerKey) -> Vec<LocEvent> {
        self.listeners
            .get_mut(&key)
            .map(|listener| std::mem::take(&mut listener.queue))
            .unwrap_or_default()
    }

    fn emit(&mut self, aggregate: bool, event: LocEvent) {
        for listener in self.listeners.values_mut() {
            if aggregate && !listener.wants_aggregates {
                continue;
            }
            listener.queue.push(event.clone());
        }
    }

    // Record access

    pub fn record(&self, object: &ObjectId) -> Option<&LocRecord> {
        self.local.get(object).or_else(|| self.replicas.get(object))
    }

    pub fn is_local(&self, object: &ObjectId) -> bool {
        self.local.contains_key(object)
    }

    pub fn local_objects(&self) -> impl Iterator<Item = (&ObjectId, &LocRecord)> {
        self.local.iter()
    }

    // Local (authoritative) surface

    pub fn local_object_added(&mut self, object: ObjectId, record: LocRecord) {
        let aggregate = record.aggregate;
        if self.local.insert(object, record).is_some() {
            warn!("local object {} added twice", object);
        }
        self.emit(
            aggregate,
            LocEvent::Added {
                object,
                aggregate,
                local: true,
            },
        );
    }

    pub fn local_object_removed(&mut self, object: &ObjectId) {
        let Some(record) = self.local.remove(object) else {
            return;
        };
        self.emit(record.aggregate, LocEvent::Removed { object: *object });
    }

    /// Apply one field update to a local record; distributes to listeners
    /// and subscribers iff the sequence number advanced.
    pub fn local_updated(&mut self, object: &ObjectId, field: LocField) {
        let Some(record) = self.local.get_mut(object) else {
            warn!("update for unknown local object {}", object);
            return;
        };
        let aggregate = record.aggregate;
        if !record.apply(&field) {
            Counters::bump(&self.ctx.counters.loc_updates_stale);
            return;
        }
        Counters::bump(&self.ctx.counters.loc_updates_applied);
        self.subscribers.note_update(object, aggregate, &field);
        self.emit(
            aggregate,
            LocEvent::Updated {
                object: *object,
                aggregate,
                field,
            },
        );
    }

    // Replica surface (driven by inbound LocUpdates)

    pub fn replica_object_added(&mut self, object: ObjectId, record: LocRecord) {
        let aggregate = record.aggregate;
        self.replicas.insert(object, record);
        self.emit(
            aggregate,
            LocEvent::Added {
                object,
                aggregate,
                local: false,
            },
        );
    }

    pub fn replica_object_removed(&mut self, object: &ObjectId) {
        let Some(record) = self.replicas.remove(object) else {
            return;
        };
        self.emit(record.aggregate, LocEvent::Removed { object: *object });
    }

    /// Apply a replica update received over the wire. Creates the replica
    /// if this is the first sight of the object.
    pub fn replica_updated(&mut self, update: &LocUpdate) {
        if self.local.contains_key(&update.object) {
            // replication echo for an object we own: consistency error,
            // never overwrite authoritative state
            warn!("replica update for locally-owned object {}", update.object);
            return;
        }
        if !self.replicas.contains_key(&update.object) {
            let record = LocRecord::from_fields(&update.fields, update.aggregate);
            self.replica_object_added(update.object, record);
            return;
        }
        for field in &update.fields {
            let record = self.replicas.get_mut(&update.object).expect("checked above");
            let aggregate = record.aggregate;
            if record.apply(field) {
                Counters::bump(&self.ctx.counters.loc_updates_applied);
                self.emit(
                    aggregate,
                    LocEvent::Updated {
                        object: update.object,
                        aggregate,
                        field: field.clone(),
                    },
                );
            } else {
                Counters::bump(&self.ctx.counters.loc_updates_stale);
            }
        }
    }

    // Subscriptions

    pub fn subscribe(&mut self, subscriber: SubscriberRef, object: ObjectId) {
        self.subscribers.subscribe(subscriber, object);
    }

    pub fn unsubscribe(&mut self, subscriber: SubscriberRef, object: &ObjectId) {
        self.subscribers.unsubscribe(subscriber, object);
    }

    pub fn unsubscribe_all(&mut self, subscriber: SubscriberRef) {
        self.subscribers.unsubscribe_all(subscriber);
    }

    pub fn subscribers_of(&self, object: &ObjectId) -> Vec<SubscriberRef> {
        self.subscribers.subscribers_of(object)
    }

    /// Drain every dirty subscriber's coalesced deltas, in deterministic
    /// subscriber order.
    pub fn flush_subscriptions(&mut self) -> Vec<(SubscriberRef, Vec<LocUpdate>)> {
        let mut flushed = Vec::new();
        for subscriber in self.subscribers.dirty_subscribers() {
            let updates = self.subscribers.flush(subscriber);
            if !updates.is_empty() {
                flushed.push((subscriber, updates));
            }
        }
        flushed
    }
}
