use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// A 3-component single-precision vector. Only the operations the motion
/// types and the proximity engine need are provided.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn length_squared(&self) -> f32 {
        self.dot(self)
    }

    pub fn length(&self) -> f32 {
        self.length_squared().sqrt()
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        (*other - *self).length()
    }

    /// Unit vector in the same direction, or `None` for a (near-)zero
    /// vector.
    pub fn normalized(&self) -> Option<Vec3> {
        let len = self.length();
        if len <= f32::EPSILON {
            return None;
        }
        Some(*self * (1.0 / len))
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Vec3) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

/// A unit quaternion representing an orientation, stored (w, x, y, z).
/// [`Quat::normalized`] is applied on every read path that extrapolates.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Quat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// Hamilton product `self ⊗ rhs`.
    pub fn mul(&self, rhs: &Quat) -> Quat {
        Quat {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }

    /// Quaternion exponential of a pure vector `v`, i.e. the rotation by
    /// angle `2·|v|` about `v`'s axis. Used to integrate angular velocity.
    pub fn exp(v: Vec3) -> Quat {
        let angle = v.length();
        if angle <= f32::EPSILON {
            return Quat::IDENTITY;
        }
        let (sin, cos) = angle.sin_cos();
        let scale = sin / angle;
        Quat {
            w: cos,
            x: v.x * scale,
            y: v.y * scale,
            z: v.z * scale,
        }
    }

    pub fn length(&self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Renormalized copy; degenerate quaternions collapse to identity.
    pub fn normalized(&self) -> Quat {
        let len = self.length();
        if len <= f32::EPSILON {
            return Quat::IDENTITY;
        }
        let inv = 1.0 / len;
        Quat {
            w: self.w * inv,
            x: self.x * inv,
            y: self.y * inv,
            z: self.z * inv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn vec_ops() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);
        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
        assert_eq!(b - a, Vec3::new(3.0, 3.0, 3.0));
        assert!(approx(a.dot(&b), 32.0));
        assert!(approx(Vec3::new(3.0, 4.0, 0.0).length(), 5.0));
    }

    #[test]
    fn normalize_zero_vector_is_none() {
        assert!(Vec3::ZERO.normalized().is_none());
    }

    #[test]
    fn quat_identity_is_neutral() {
        let q = Quat::new(0.5, 0.5, 0.5, 0.5);
        let r = q.mul(&Quat::IDENTITY);
        assert!(approx(r.w, q.w) && approx(r.x, q.x));
    }

    #[test]
    fn quat_exp_of_zero_is_identity() {
        assert_eq!(Quat::exp(Vec3::ZERO), Quat::IDENTITY);
    }

    #[test]
    fn quat_exp_rotates_by_twice_the_argument() {
        // exp of pi/4 about z is a 90 degree rotation
        let q = Quat::exp(Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_4));
        assert!(approx(q.w, std::f32::consts::FRAC_1_SQRT_2));
        assert!(approx(q.z, std::f32::consts::FRAC_1_SQRT_2));
    }

    #[test]
    fn degenerate_quat_normalizes_to_identity() {
        assert_eq!(Quat::new(0.0, 0.0, 0.0, 0.0).normalized(), Quat::IDENTITY);
    }
}
