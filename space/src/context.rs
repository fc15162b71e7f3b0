use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parsec_shared::{ServerId, SpaceId, SpaceInstant, TimeSource};

/// Drop-reason and throughput telemetry for one server. Counters are cheap
/// saturating atomics bumped from any strand; a periodic snapshot goes to
/// the log the way the forwarding plane reports its time series.
#[derive(Default, Debug)]
pub struct Counters {
    pub forwarded_locally: AtomicU64,
    pub dropped_local_closed: AtomicU64,
    pub dropped_unknown_object: AtomicU64,
    pub dropped_pending_overflow: AtomicU64,
    pub fair_queue_overflow: AtomicU64,
    pub parse_errors: AtomicU64,
    pub oseg_cache_hits: AtomicU64,
    pub oseg_cache_misses: AtomicU64,
    pub loc_updates_applied: AtomicU64,
    pub loc_updates_stale: AtomicU64,
    pub prox_events: AtomicU64,
    pub migrations_in: AtomicU64,
    pub migrations_out: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("forwarded.locally", self.forwarded_locally.load(Ordering::Relaxed)),
            ("dropped.local_closed", self.dropped_local_closed.load(Ordering::Relaxed)),
            ("dropped.unknown_object", self.dropped_unknown_object.load(Ordering::Relaxed)),
            ("dropped.pending_overflow", self.dropped_pending_overflow.load(Ordering::Relaxed)),
            ("dropped.fair_queue_overflow", self.fair_queue_overflow.load(Ordering::Relaxed)),
            ("parse_errors", self.parse_errors.load(Ordering::Relaxed)),
            ("oseg.cache_hits", self.oseg_cache_hits.load(Ordering::Relaxed)),
            ("oseg.cache_misses", self.oseg_cache_misses.load(Ordering::Relaxed)),
            ("loc.updates_applied", self.loc_updates_applied.load(Ordering::Relaxed)),
            ("loc.updates_stale", self.loc_updates_stale.load(Ordering::Relaxed)),
            ("prox.events", self.prox_events.load(Ordering::Relaxed)),
            ("migrations.in", self.migrations_in.load(Ordering::Relaxed)),
            ("migrations.out", self.migrations_out.load(Ordering::Relaxed)),
        ]
    }

    pub fn report(&self, server: ServerId) {
        for (name, value) in self.snapshot() {
            if value != 0 {
                info!("space.{}.{} = {}", server.0, name, value);
            }
        }
    }
}

/// Everything a component needs to know about the node it runs on, passed
/// explicitly at construction. Tests build a fresh context per case; there
/// are no process-global singletons.
#[derive(Clone)]
pub struct SpaceContext {
    pub server_id: ServerId,
    pub space: SpaceId,
    pub time: TimeSource,
    pub counters: Arc<Counters>,
}

impl SpaceContext {
    pub fn new(server_id: ServerId, space: SpaceId, time: TimeSource) -> Self {
        Self {
            server_id,
            space,
            time,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn now(&self) -> SpaceInstant {
        self.time.now()
    }
}
