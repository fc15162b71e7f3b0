//! The receive side of the inter-server fair-queueing loop: measure the
//! inbound byte rate per peer, derive each peer's used share of this
//! node's capacity, and periodically broadcast those shares back upstream
//! so the senders' fair queues rebalance.

use std::collections::HashMap;

use parsec_shared::{ServerId, SpaceDuration, SpaceInstant, Timer, WeightUpdate};

/// Exponentially blended rate estimate over fixed observation intervals.
#[derive(Clone, Debug, Default)]
struct RateEstimator {
    rate: f64,
    pending_bytes: u64,
}

impl RateEstimator {
    fn observe(&mut self, bytes: usize) {
        self.pending_bytes += bytes as u64;
    }

    fn fold(&mut self, interval_secs: f64, blend: f64) -> f64 {
        let fresh = self.pending_bytes as f64 / interval_secs;
        self.pending_bytes = 0;
        self.rate = self.rate * blend + fresh * (1.0 - blend);
        self.rate
    }
}

#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// Per-peer capacity hint for this node, bytes per second.
    pub capacity: f64,
    pub report_interval: SpaceDuration,
    /// EWMA retention per interval; 0 tracks instantaneously, values near
    /// 1 smooth heavily.
    pub blend: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000_000.0,
            report_interval: SpaceDuration::from_millis(500),
            blend: 0.5,
        }
    }
}

pub struct ServerMessageReceiver {
    config: ReceiverConfig,
    rates: HashMap<ServerId, RateEstimator>,
    report_timer: Timer,
    total_rate: f64,
}

impl ServerMessageReceiver {
    pub fn new(config: ReceiverConfig, now: SpaceInstant) -> Self {
        Self {
            report_timer: Timer::new(config.report_interval, now),
            config,
            rates: HashMap::new(),
            total_rate: 0.0,
        }
    }

    /// Record `bytes` received from `from`.
    pub fn on_bytes(&mut self, from: ServerId, bytes: usize) {
        self.rates.entry(from).or_default().observe(bytes);
    }

    /// Inbound demand currently exceeds capacity.
    pub fn is_blocked(&self) -> bool {
        self.total_rate > self.config.capacity
    }

    pub fn capacity(&self) -> f64 {
        self.config.capacity
    }

    /// When the report timer rings, fold the interval's bytes into the
    /// rate estimates and produce the used-weight broadcast.
    pub fn tick(&mut self, now: SpaceInstant) -> Option<WeightUpdate> {
        if !self.report_timer.ringing(now) {
            return None;
        }
        self.report_timer.reset(now);

        let interval_secs = self.config.report_interval.as_secs_f32() as f64;
        let blend = self.config.blend;
        let mut entries: Vec<(ServerId, f64)> = Vec::new();
        let mut total = 0.0;
        for (server, estimator) in self.rates.iter_mut() {
            let rate = estimator.fold(interval_secs, blend);
            total += rate;
            entries.push((*server, rate));
        }
        self.total_rate = total;
        if entries.is_empty() {
            return None;
        }

        // normalize to used shares; an all-idle interval reports equal
        // shares so senders keep their queues alive
        entries.sort_by_key(|(server, _)| *server);
        let entries = entries
            .into_iter()
            .map(|(server, rate)| {
                let share = if total > 0.0 {
                    rate / total
                } else {
                    1.0 / self.rates.len() as f64
                };
                (server, share)
            })
            .collect();
        Some(WeightUpdate {
            receiver_capacity: self.config.capacity,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn receiver(now: SpaceInstant) -> ServerMessageReceiver {
        ServerMessageReceiver::new(ReceiverConfig::default(), now)
    }

    #[test]
    fn no_report_before_the_interval() {
        let t0 = SpaceInstant::from_secs(1);
        let mut receiver = receiver(t0);
        receiver.on_bytes(ServerId(2), 1000);
        assert!(receiver.tick(t0 + SpaceDuration::from_millis(100)).is_none());
    }

    #[test]
    fn shares_track_observed_traffic() {
        let t0 = SpaceInstant::from_secs(1);
        let mut receiver = receiver(t0);
        receiver.on_bytes(ServerId(2), 3000);
        receiver.on_bytes(ServerId(3), 1000);

        let update = receiver
            .tick(t0 + SpaceDuration::from_millis(600))
            .expect("report due");
        assert_eq!(update.entries.len(), 2);
        let shares: HashMap<ServerId, f64> = update.entries.into_iter().collect();
        assert!((shares[&ServerId(2)] - 0.75).abs() < 1e-9);
        assert!((shares[&ServerId(3)] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn idle_interval_reports_equal_shares() {
        let t0 = SpaceInstant::from_secs(1);
        let mut receiver = receiver(t0);
        receiver.on_bytes(ServerId(2), 100);
        receiver.on_bytes(ServerId(3), 100);
        receiver.tick(t0 + SpaceDuration::from_millis(600)).unwrap();

        // rates decay; after enough idle intervals everything is zero
        let mut now = t0 + SpaceDuration::from_millis(600);
        let mut last = None;
        for _ in 0..200 {
            now += SpaceDuration::from_millis(600);
            if let Some(update) = receiver.tick(now) {
                last = Some(update);
            }
        }
        let update = last.expect("reports kept coming");
        for (_, share) in update.entries {
            assert!((share - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn blocked_when_demand_exceeds_capacity() {
        let t0 = SpaceInstant::from_secs(1);
        let mut receiver = receiver(t0);
        // 10 MB/s capacity; observe far more in half a second
        receiver.on_bytes(ServerId(2), 50_000_000);
        receiver.tick(t0 + SpaceDuration::from_millis(600));
        assert!(receiver.is_blocked());
    }
}
