use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::time::{SpaceDuration, SpaceInstant};

/// A poll-style timer against the space timebase: arm it with a duration,
/// ask it whether it is ringing, reset it to go again.
#[derive(Clone, Debug)]
pub struct Timer {
    duration: SpaceDuration,
    deadline: SpaceInstant,
}

impl Timer {
    pub fn new(duration: SpaceDuration, now: SpaceInstant) -> Self {
        Self {
            duration,
            deadline: now + duration,
        }
    }

    pub fn ringing(&self, now: SpaceInstant) -> bool {
        now >= self.deadline
    }

    pub fn reset(&mut self, now: SpaceInstant) {
        self.deadline = now + self.duration;
    }

    pub fn set_duration(&mut self, duration: SpaceDuration, now: SpaceInstant) {
        self.duration = duration;
        self.reset(now);
    }

    pub fn deadline(&self) -> SpaceInstant {
        self.deadline
    }
}

/// Source of generation counters for cancellable deferred work. A timer or
/// async completion snapshots the current generation when scheduled; bumping
/// the source invalidates every outstanding snapshot, so a stale firing
/// discovers it has been cancelled and becomes a no-op.
#[derive(Clone, Debug, Default)]
pub struct GenerationSource {
    current: Arc<AtomicU64>,
}

/// A snapshot taken from a [`GenerationSource`].
#[derive(Clone, Debug)]
pub struct Generation {
    source: Arc<AtomicU64>,
    value: u64,
}

impl GenerationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Generation {
        Generation {
            source: self.current.clone(),
            value: self.current.load(Ordering::Acquire),
        }
    }

    /// Invalidate all outstanding snapshots.
    pub fn cancel_all(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }
}

impl Generation {
    pub fn is_current(&self) -> bool {
        self.source.load(Ordering::Acquire) == self.value
    }
}
