//! Property checks for the two quantified invariants that lend themselves
//! to randomized inputs: per-field sequence monotonicity in Loc records,
//! and fair-queue service shares converging to the weight ratios.

use parsec_shared::{LocField, LocFieldValue, SpaceInstant, TimedMotionVector, Vec3};
use parsec_space::forwarder::fair_queue::{FairQueue, Queued};
use parsec_space::{LocFieldKind, LocRecord};
use proptest::prelude::*;

#[derive(Clone, Debug)]
struct FixedSize(usize);

impl Queued for FixedSize {
    fn size(&self) -> usize {
        self.0
    }
}

fn location_field(seqno: u64, x: f32) -> LocField {
    LocField {
        seqno,
        value: LocFieldValue::Location(TimedMotionVector::stationary(
            SpaceInstant::from_secs(0),
            Vec3::new(x, 0.0, 0.0),
        )),
    }
}

proptest! {
    /// For every (object, field): the stored sequence number is
    /// monotonically non-decreasing under any update order, and the value
    /// always belongs to the highest sequence number seen.
    #[test]
    fn loc_seqnos_never_regress(updates in prop::collection::vec((1u64..100, -100.0f32..100.0), 1..60)) {
        let mut record = LocRecord::stationary(SpaceInstant::from_secs(0), Vec3::ZERO, 1.0);
        let mut highest = record.seqno(LocFieldKind::Location);
        let mut expected_x = record.location.position().x;

        for (seqno, x) in updates {
            let before = record.seqno(LocFieldKind::Location);
            let applied = record.apply(&location_field(seqno, x));
            let after = record.seqno(LocFieldKind::Location);

            prop_assert!(after >= before);
            prop_assert_eq!(applied, seqno > before);
            if seqno > highest {
                highest = seqno;
                expected_x = x;
            }
            prop_assert_eq!(after, highest.max(before));
            prop_assert_eq!(record.location.position().x, expected_x);
        }
    }

    /// With all queues continuously non-empty, bytes served per queue
    /// converge to w_i / sum(w).
    #[test]
    fn fair_queue_shares_follow_weights(weights in prop::collection::vec(1u32..=8, 2..5)) {
        const MESSAGE_SIZE: usize = 100;
        const ROUNDS: usize = 2000;

        let mut queue: FairQueue<FixedSize, usize> = FairQueue::new(0);
        for (index, weight) in weights.iter().enumerate() {
            queue.add_queue(index, *weight as f64, ROUNDS * 2);
            for _ in 0..ROUNDS * 2 {
                queue.push(&index, FixedSize(MESSAGE_SIZE));
            }
        }

        let mut served = vec![0usize; weights.len()];
        let mut budget = MESSAGE_SIZE * ROUNDS;
        while let Some((index, _)) = queue.pop(&mut budget) {
            served[index] += 1;
        }

        let total_served: usize = served.iter().sum();
        prop_assert_eq!(total_served, ROUNDS);
        let total_weight: u32 = weights.iter().sum();
        for (index, weight) in weights.iter().enumerate() {
            let expected = *weight as f64 / total_weight as f64;
            let actual = served[index] as f64 / total_served as f64;
            prop_assert!(
                (actual - expected).abs() < 0.05,
                "queue {} served {} expected {}",
                index,
                actual,
                expected
            );
        }
    }
}
