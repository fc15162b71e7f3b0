//! The proximity engine: continuous solid-angle queries over the local and
//! replicated object sets, incremental Enter/Exit result streams, and
//! aggregate publication. Index structure is rebuildable in place; queries
//! migrate to the new tree a bounded number per tick so a rebuild never
//! stalls the query plane.

pub mod index;

use std::collections::{BTreeSet, HashMap};

use log::warn;
use parsec_shared::{LocField, LocFieldValue, ObjectId, ServerId, SpaceInstant, Vec3};

use crate::context::{Counters, SpaceContext};
use crate::loc::record::LocRecord;
use crate::loc::{LocEvent, ListenerKey, LocationService};
use crate::prox::index::{AggregateEvent, SphereTree};

/// Who is asking: a locally connected object or a peer server aggregating
/// for its own queriers.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum QuerierRef {
    Object(ObjectId),
    Server(ServerId),
}

/// What the query is centered on: a fixed position or an object to follow.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum QueryCenter {
    Position(Vec3),
    Object(ObjectId),
}

/// Incremental result-stream events. Enter carries the object's current
/// presence fields (with their sequence numbers) so downstream consumers
/// can seed replicas without a second round trip.
#[derive(Clone, Debug)]
pub enum ProxEvent {
    Enter {
        querier: QuerierRef,
        object: ObjectId,
        fields: Vec<LocField>,
    },
    Exit {
        querier: QuerierRef,
        object: ObjectId,
    },
}

#[derive(Clone, Debug)]
pub struct ProxConfig {
    pub branching: usize,
    /// How many queries move to a rebuilding index per tick.
    pub rebuild_migrate_per_tick: usize,
    pub default_max_results: usize,
}

impl Default for ProxConfig {
    fn default() -> Self {
        Self {
            branching: 8,
            rebuild_migrate_per_tick: 16,
            default_max_results: 1000,
        }
    }
}

struct QueryState {
    center: QueryCenter,
    theta: f32,
    max_results: usize,
    results: BTreeSet<ObjectId>,
    on_rebuilding: bool,
}

pub struct ProximityEngine {
    ctx: SpaceContext,
    config: ProxConfig,
    listener: ListenerKey,
    primary: SphereTree,
    rebuilding: Option<SphereTree>,
    queries: HashMap<QuerierRef, QueryState>,
    /// Seqno counter per published aggregate.
    aggregate_seqnos: HashMap<ObjectId, u64>,
    aggregate_generation: u64,
    /// Aggregate lifecycle accumulated by a rebuilding tree; replayed into
    /// Loc when that tree is promoted.
    held_rebuild_events: Vec<AggregateEvent>,
    /// Staged for the next publish pass at promotion: retirement of the
    /// outgoing tree's aggregates followed by the promoted tree's history.
    promotion_events: Vec<AggregateEvent>,
}

impl ProximityEngine {
    pub fn new(ctx: SpaceContext, config: ProxConfig, loc: &mut LocationService) -> Self {
        // the engine publishes aggregates itself, so it must not consume
        // them back or it would index its own proxies
        let listener = loc.add_listener(false);
        let base = Self::aggregate_base(ctx.server_id, 0);
        Self {
            ctx,
            listener,
            primary: SphereTree::new(config.branching, base),
            rebuilding: None,
            queries: HashMap::new(),
            aggregate_seqnos: HashMap::new(),
            aggregate_generation: 0,
            held_rebuild_events: Vec::new(),
            promotion_events: Vec::new(),
            config,
        }
    }

    fn aggregate_base(server: ServerId, generation: u64) -> u128 {
        // high byte tags synthetic ids; server and tree generation keep
        // them unique across nodes and rebuilds
        (0xa6u128 << 120) | ((server.0 as u128) << 80) | ((generation as u128) << 48)
    }

    // Query lifecycle

    /// Register (or replace) the continuous query for `querier`.
    pub fn register_query(
        &mut self,
        querier: QuerierRef,
        center: QueryCenter,
        theta: f32,
        max_results: usize,
    ) {
        self.queries.insert(
            querier,
            QueryState {
                center,
                theta,
                max_results: max_results.min(self.config.default_max_results).max(1),
                results: BTreeSet::new(),
                on_rebuilding: false,
            },
        );
    }

    /// Drop the query, returning the final Exit events for everything that
    /// was in its result set.
    pub fn remove_query(&mut self, querier: &QuerierRef) -> Vec<ProxEvent> {
        let Some(state) = self.queries.remove(querier) else {
            return Vec::new();
        };
        state
            .results
            .into_iter()
            .map(|object| ProxEvent::Exit {
                querier: *querier,
                object,
            })
            .collect()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Begin an in-place rebuild with a new branching factor. Queries keep
    /// answering from the old tree and migrate over a few per tick.
    pub fn begin_rebuild(&mut self, branching: usize) {
        self.aggregate_generation += 1;
        let base = Self::aggregate_base(self.ctx.server_id, self.aggregate_generation);
        let mut fresh = SphereTree::new(branching, base);
        for (object, position, radius) in self.primary.objects() {
            fresh.insert(object, position, radius);
        }
        for state in self.queries.values_mut() {
            state.on_rebuilding = false;
        }
        // a superseded in-flight rebuild never went live; drop its history
        self.held_rebuild_events.clear();
        self.rebuilding = Some(fresh);
    }

    pub fn rebuilding(&self) -> bool {
        self.rebuilding.is_some()
    }

    // Tick

    /// One evaluation pass: fold in Loc changes, advance any rebuild, and
    /// re-evaluate queries, emitting Enter/Exit transitions.
    pub fn tick(&mut self, now: SpaceInstant, loc: &mut LocationService) -> Vec<ProxEvent> {
        let mut events = Vec::new();
        self.apply_loc_events(now, loc, &mut events);
        self.advance_rebuild();
        self.evaluate_queries(now, loc, &mut events);
        self.publish_aggregates(now, loc);
        for _ in 0..events.len() {
            Counters::bump(&self.ctx.counters.prox_events);
        }
        events
    }

    fn object_geometry(record: &LocRecord, now: SpaceInstant) -> (Vec3, f32) {
        let position = record.location.position_at(now) + record.bounds.center_offset;
        (position, record.bounds.full_radius())
    }

    fn apply_loc_events(
        &mut self,
        now: SpaceInstant,
        loc: &mut LocationService,
        events: &mut Vec<ProxEvent>,
    ) {
        for event in loc.drain_listener(self.listener) {
            match event {
                LocEvent::Added { object, .. } => {
                    let Some(record) = loc.record(&object) else {
                        continue;
                    };
                    let (position, radius) = Self::object_geometry(record, now);
                    self.primary.insert(object, position, radius);
                    if let Some(rebuilding) = self.rebuilding.as_mut() {
                        rebuilding.insert(object, position, radius);
                    }
                }
                LocEvent::Removed { object } => {
                    self.primary.remove(&object);
                    if let Some(rebuilding) = self.rebuilding.as_mut() {
                        rebuilding.remove(&object);
                    }
                    // handles into Loc are now dangling; retire the object
                    // from every result set
                    for (querier, state) in self.queries.iter_mut() {
                        if state.results.remove(&object) {
                            events.push(ProxEvent::Exit {
                                querier: *querier,
                                object,
                            });
                        }
                    }
                }
                LocEvent::Updated { object, field, .. } => {
                    let relevant = matches!(
                        field.value,
                        LocFieldValue::Location(_) | LocFieldValue::Bounds(_)
                    );
                    if !relevant {
                        continue;
                    }
                    let Some(record) = loc.record(&object) else {
                        continue;
                    };
                    let (position, radius) = Self::object_geometry(record, now);
                    self.primary.update(object, position, radius);
                    if let Some(rebuilding) = self.rebuilding.as_mut() {
                        rebuilding.update(object, position, radius);
                    }
                }
            }
        }
    }

    fn advance_rebuild(&mut self) {
        if self.rebuilding.is_none() {
            return;
        }
        let mut budget = self.config.rebuild_migrate_per_tick;
        let mut queriers: Vec<QuerierRef> = self.queries.keys().copied().collect();
        queriers.sort();
        for querier in queriers {
            if budget == 0 {
                break;
            }
            let state = self.queries.get_mut(&querier).expect("querier from keys");
            if !state.on_rebuilding {
                state.on_rebuilding = true;
                budget -= 1;
            }
        }
        let all_migrated = self.queries.values().all(|state| state.on_rebuilding);
        if all_migrated {
            let fresh = self.rebuilding.take().expect("checked above");
            // retire every aggregate published for the outgoing tree, then
            // replay the promoted tree's construction history so its nodes
            // exist in Loc before any later update names them
            let mut retired: Vec<ObjectId> = self.aggregate_seqnos.keys().copied().collect();
            retired.sort();
            self.promotion_events
                .extend(retired.into_iter().map(|id| AggregateEvent::Destroyed { id }));
            self.promotion_events.append(&mut self.held_rebuild_events);
            self.primary = fresh;
            for state in self.queries.values_mut() {
                state.on_rebuilding = false;
            }
        }
    }

    fn evaluate_queries(
        &mut self,
        now: SpaceInstant,
        loc: &LocationService,
        events: &mut Vec<ProxEvent>,
    ) {
        let mut queriers: Vec<QuerierRef> = self.queries.keys().copied().collect();
        queriers.sort();
        for querier in queriers {
            let state = self.queries.get_mut(&querier).expect("querier from keys");
            let center = match state.center {
                QueryCenter::Position(position) => position,
                QueryCenter::Object(object) => match loc.record(&object) {
                    Some(record) => record.location.position_at(now),
                    None => {
                        // center object left this server; hold results
                        // until the querier re-registers or is removed
                        continue;
                    }
                },
            };
            let tree = if state.on_rebuilding {
                self.rebuilding.as_ref().unwrap_or(&self.primary)
            } else {
                &self.primary
            };
            let mut fresh: BTreeSet<ObjectId> = tree
                .query(center, state.theta, state.max_results)
                .into_iter()
                .map(|(object, _)| object)
                .collect();
            // an object never appears in its own result stream
            if let QuerierRef::Object(querier_object) = querier {
                fresh.remove(&querier_object);
            }

            for object in fresh.difference(&state.results) {
                let fields = match loc.record(object) {
                    Some(record) => record.to_fields(),
                    None => {
                        warn!("index returned object {} unknown to loc", object);
                        continue;
                    }
                };
                events.push(ProxEvent::Enter {
                    querier,
                    object: *object,
                    fields,
                });
            }
            for object in state.results.difference(&fresh) {
                events.push(ProxEvent::Exit {
                    querier,
                    object: *object,
                });
            }
            state.results = fresh;
        }
    }

    fn publish_aggregates(&mut self, now: SpaceInstant, loc: &mut LocationService) {
        // promotion replay first, then whatever the live tree did this tick
        let mut drained = std::mem::take(&mut self.promotion_events);
        drained.extend(self.primary.drain_aggregate_events());
        if let Some(rebuilding) = self.rebuilding.as_mut() {
            // the rebuilding tree's aggregates go live only at promotion;
            // hold its lifecycle until then
            self.held_rebuild_events
                .extend(rebuilding.drain_aggregate_events());
        }

        // coalesce this tick's churn down to one outcome per aggregate
        #[derive(Default)]
        struct Coalesced {
            created: bool,
            destroyed: bool,
            update: Option<(Vec3, f32, f32)>,
        }
        let mut outcomes: HashMap<ObjectId, Coalesced> = HashMap::new();
        let mut order: Vec<ObjectId> = Vec::new();
        for event in drained.drain(..) {
            match event {
                AggregateEvent::Created { id } => {
                    if !outcomes.contains_key(&id) {
                        order.push(id);
                    }
                    outcomes.entry(id).or_default().created = true;
                }
                AggregateEvent::Updated {
                    id,
                    center,
                    radius,
                    max_object_radius,
                } => {
                    if !outcomes.contains_key(&id) {
                        order.push(id);
                    }
                    outcomes.entry(id).or_default().update =
                        Some((center, radius, max_object_radius));
                }
                AggregateEvent::Destroyed { id } => {
                    if !outcomes.contains_key(&id) {
                        order.push(id);
                    }
                    outcomes.entry(id).or_default().destroyed = true;
                }
            }
        }

        for id in order {
            let Some(outcome) = outcomes.remove(&id) else {
                continue;
            };
            if outcome.destroyed {
                // created-then-destroyed within one tick cancels out
                if !outcome.created {
                    self.aggregate_seqnos.remove(&id);
                    loc.local_object_removed(&id);
                }
                continue;
            }
            if outcome.created {
                self.aggregate_seqnos.insert(id, 1);
                let record = LocRecord::stationary(now, Vec3::ZERO, 0.0).aggregate();
                loc.local_object_added(id, record);
            }
            if let Some((center, radius, max_object_radius)) = outcome.update {
                let Some(seqno) = self.aggregate_seqnos.get_mut(&id) else {
                    continue;
                };
                *seqno += 2;
                let bounds_seqno = *seqno;
                let location_seqno = bounds_seqno - 1;
                loc.local_updated(
                    &id,
                    LocField {
                        seqno: location_seqno,
                        value: LocFieldValue::Location(
                            parsec_shared::TimedMotionVector::stationary(now, center),
                        ),
                    },
                );
                loc.local_updated(
                    &id,
                    LocField {
                        seqno: bounds_seqno,
                        value: LocFieldValue::Bounds(parsec_shared::BoundingInfo {
                            center_offset: Vec3::ZERO,
                            center_bounds_radius: radius,
                            max_object_radius,
                        }),
                    },
                );
            }
        }
    }
}
