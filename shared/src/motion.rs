use crate::math::{Quat, Vec3};
use crate::time::SpaceInstant;

/// Linear motion sampled at a point in time: position `p` at `t0` moving at
/// constant velocity `v`. Position at any later instant is extrapolated as
/// `p + (t − t0)·v`.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct TimedMotionVector {
    t0: SpaceInstant,
    position: Vec3,
    velocity: Vec3,
}

impl TimedMotionVector {
    pub fn new(t0: SpaceInstant, position: Vec3, velocity: Vec3) -> Self {
        Self {
            t0,
            position,
            velocity,
        }
    }

    pub fn stationary(t0: SpaceInstant, position: Vec3) -> Self {
        Self::new(t0, position, Vec3::ZERO)
    }

    pub fn time(&self) -> SpaceInstant {
        self.t0
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn position_at(&self, t: SpaceInstant) -> Vec3 {
        let dt = (t - self.t0).as_secs_f32();
        self.position + self.velocity * dt
    }

    /// Resample so that `t` becomes the new reference point without changing
    /// the described motion.
    pub fn resampled_at(&self, t: SpaceInstant) -> TimedMotionVector {
        TimedMotionVector::new(t, self.position_at(t), self.velocity)
    }
}

/// Rotational motion: orientation `q` at `t0` spinning at constant angular
/// velocity `ω` (axis scaled by radians per second). Orientation at time t
/// is `q · exp(ω·(t−t0)/2)`, renormalized on read.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct TimedMotionQuaternion {
    t0: SpaceInstant,
    orientation: Quat,
    angular_velocity: Vec3,
}

impl TimedMotionQuaternion {
    pub fn new(t0: SpaceInstant, orientation: Quat, angular_velocity: Vec3) -> Self {
        Self {
            t0,
            orientation,
            angular_velocity,
        }
    }

    pub fn fixed(t0: SpaceInstant, orientation: Quat) -> Self {
        Self::new(t0, orientation, Vec3::ZERO)
    }

    pub fn time(&self) -> SpaceInstant {
        self.t0
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn angular_velocity(&self) -> Vec3 {
        self.angular_velocity
    }

    pub fn orientation_at(&self, t: SpaceInstant) -> Quat {
        let dt = (t - self.t0).as_secs_f32();
        let half_spin = self.angular_velocity * (dt * 0.5);
        self.orientation.mul(&Quat::exp(half_spin)).normalized()
    }
}

/// Bounds description for an object or an aggregate: a sphere of
/// `center_bounds_radius` around `center_offset` containing all member
/// centers, and the largest member radius. For an individual object the
/// center-bounds radius is zero and `max_object_radius` is the object's own
/// radius.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct BoundingInfo {
    pub center_offset: Vec3,
    pub center_bounds_radius: f32,
    pub max_object_radius: f32,
}

impl BoundingInfo {
    pub fn single_object(radius: f32) -> Self {
        Self {
            center_offset: Vec3::ZERO,
            center_bounds_radius: 0.0,
            max_object_radius: radius,
        }
    }

    pub fn is_single_object(&self) -> bool {
        self.center_bounds_radius == 0.0
    }

    /// Radius of a sphere guaranteed to contain every member entirely.
    pub fn full_radius(&self) -> f32 {
        self.center_bounds_radius + self.max_object_radius
    }

    /// Smallest bounding description (centered between the two inputs)
    /// containing both, used to build aggregates.
    pub fn merged_with(&self, self_center: Vec3, other: &BoundingInfo, other_center: Vec3) -> (Vec3, BoundingInfo) {
        let a = self_center + self.center_offset;
        let b = other_center + other.center_offset;
        let span = b - a;
        let dist = span.length();

        // Merge the two center-bound spheres into one enclosing sphere.
        let (center, radius) = if dist <= f32::EPSILON {
            (a, self.center_bounds_radius.max(other.center_bounds_radius))
        } else {
            let r = (dist + self.center_bounds_radius + other.center_bounds_radius) * 0.5;
            let r = r.max(self.center_bounds_radius).max(other.center_bounds_radius);
            let dir = span * (1.0 / dist);
            let offset = (r - self.center_bounds_radius).max(0.0).min(dist);
            (a + dir * offset, r)
        };

        let merged = BoundingInfo {
            center_offset: Vec3::ZERO,
            center_bounds_radius: radius,
            max_object_radius: self.max_object_radius.max(other.max_object_radius),
        };
        (center, merged)
    }
}
