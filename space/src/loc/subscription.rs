//! Update distribution: per-subscriber coalescing delta queues. Each
//! subscriber holds at most one pending delta per object; later updates
//! merge into it (last value wins per field), so a slow consumer sees the
//! latest state even when it misses intermediates. Within one
//! (object, field) pair sequence numbers only ever advance.

use std::collections::{BTreeSet, HashMap, VecDeque};

use log::warn;
use parsec_shared::{LocField, LocUpdate, ObjectId, ServerId};

use crate::loc::record::LocFieldKind;

/// Who receives Loc updates: a locally connected object or a peer server
/// holding replicas.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum SubscriberRef {
    Object(ObjectId),
    Server(ServerId),
}

struct PendingDelta {
    aggregate: bool,
    fields: HashMap<LocFieldKind, LocField>,
}

struct SubscriberQueue {
    order: VecDeque<ObjectId>,
    pending: HashMap<ObjectId, PendingDelta>,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            pending: HashMap::new(),
        }
    }
}

pub struct SubscriberTable {
    /// object -> subscribers, ordered for deterministic delivery
    by_object: HashMap<ObjectId, BTreeSet<SubscriberRef>>,
    by_subscriber: HashMap<SubscriberRef, BTreeSet<ObjectId>>,
    queues: HashMap<SubscriberRef, SubscriberQueue>,
    /// Protective bound on distinct objects pending per subscriber; the
    /// coalescing invariant keeps real queues at or below the subscriber's
    /// subscription count.
    max_pending_objects: usize,
}

impl SubscriberTable {
    pub fn new(max_pending_objects: usize) -> Self {
        Self {
            by_object: HashMap::new(),
            by_subscriber: HashMap::new(),
            queues: HashMap::new(),
            max_pending_objects,
        }
    }

    pub fn subscribe(&mut self, subscriber: SubscriberRef, object: ObjectId) {
        self.by_object.entry(object).or_default().insert(subscriber);
        self.by_subscriber
            .entry(subscriber)
            .or_default()
            .insert(object);
    }

    pub fn unsubscribe(&mut self, subscriber: SubscriberRef, object: &ObjectId) {
        if let Some(subscribers) = self.by_object.get_mut(object) {
            subscribers.remove(&subscriber);
            if subscribers.is_empty() {
                self.by_object.remove(object);
            }
        }
        if let Some(objects) = self.by_subscriber.get_mut(&subscriber) {
            objects.remove(object);
            if objects.is_empty() {
                self.by_subscriber.remove(&subscriber);
            }
        }
        if let Some(queue) = self.queues.get_mut(&subscriber) {
            queue.pending.remove(object);
            queue.order.retain(|pending| pending != object);
        }
    }

    pub fn unsubscribe_all(&mut self, subscriber: SubscriberRef) {
        if let Some(objects) = self.by_subscriber.remove(&subscriber) {
            for object in objects {
                if let Some(subscribers) = self.by_object.get_mut(&object) {
                    subscribers.remove(&subscriber);
                    if subscribers.is_empty() {
                        self.by_object.remove(&object);
                    }
                }
            }
        }
        self.queues.remove(&subscriber);
    }

    pub fn subscribers_of(&self, object: &ObjectId) -> Vec<SubscriberRef> {
        self.by_object
            .get(object)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriptions_of(&self, subscriber: SubscriberRef) -> Vec<ObjectId> {
        self.by_subscriber
            .get(&subscriber)
            .map(|objects| objects.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record an applied field change for every subscriber of `object`.
    pub fn note_update(&mut self, object: &ObjectId, aggregate: bool, field: &LocField) {
        let Some(subscribers) = self.by_object.get(object) else {
            return;
        };
        let kind = LocFieldKind::of(&field.value);
        for subscriber in subscribers.iter().copied() {
            let queue = self
                .queues
                .entry(subscriber)
                .or_insert_with(SubscriberQueue::new);
            match queue.pending.get_mut(object) {
                Some(delta) => {
                    // coalesce in place; last value wins, seqno only grows
                    let slot = delta.fields.entry(kind).or_insert_with(|| field.clone());
                    if field.seqno > slot.seqno {
                        *slot = field.clone();
                    }
                }
                None => {
                    if queue.order.len() >= self.max_pending_objects {
                        warn!(
                            "subscriber {:?} pending-update bound hit, dropping delta for {}",
                            subscriber, object
                        );
                        continue;
                    }
                    let mut fields = HashMap::new();
                    fields.insert(kind, field.clone());
                    queue.pending.insert(*object, PendingDelta { aggregate, fields });
                    queue.order.push_back(*object);
                }
            }
        }
    }

    /// Drain one subscriber's coalesced deltas in arrival order.
    pub fn flush(&mut self, subscriber: SubscriberRef) -> Vec<LocUpdate> {
        let Some(queue) = self.queues.get_mut(&subscriber) else {
            return Vec::new();
        };
        let mut updates = Vec::new();
        while let Some(object) = queue.order.pop_front() {
            let Some(delta) = queue.pending.remove(&object) else {
                continue;
            };
            let mut fields: Vec<LocField> = delta.fields.into_values().collect();
            // deterministic field order inside one update
            fields.sort_by_key(|field| LocFieldKind::of(&field.value) as u8);
            updates.push(LocUpdate {
                object,
                aggregate: delta.aggregate,
                fields,
            });
        }
        updates
    }

    /// Every subscriber with something pending, in deterministic order.
    pub fn dirty_subscribers(&self) -> Vec<SubscriberRef> {
        let mut dirty: Vec<SubscriberRef> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.order.is_empty())
            .map(|(subscriber, _)| *subscriber)
            .collect();
        dirty.sort();
        dirty
    }
}
