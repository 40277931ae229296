//! Ray type for path tracing.
//!
//! A ray is defined by an origin point, a direction vector, a valid length
//! and a time value for motion blur. Queries only ever shorten `t`.

use ivar_math::Vec3;

/// Screen-space derivatives of a ray, used to size texture filter footprints.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RayDifferentials {
    /// Origin derivative (dx, dy)
    pub dp: [Vec3; 2],
    /// Direction derivative (dx, dy)
    pub dd: [Vec3; 2],
}

impl RayDifferentials {
    /// Carry the differentials across a transfer of length `t` to a surface with
    /// normal `ng`.
    pub fn transfer(&self, direction: Vec3, t: f32, ng: Vec3) -> Self {
        let dn = direction.dot(ng);
        if dn.abs() < 1e-12 {
            return *self;
        }
        let mut out = *self;
        for i in 0..2 {
            let tmp = self.dp[i] + t * self.dd[i];
            let dt = -tmp.dot(ng) / dn;
            out.dp[i] = tmp + dt * direction;
        }
        out
    }
}

/// A ray with origin, direction, length and time.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    /// Origin point of the ray
    pub origin: Vec3,
    /// Direction vector (not necessarily normalized)
    pub direction: Vec3,
    /// Valid length along `direction`; f32::MAX for unbounded rays
    pub t: f32,
    /// Shutter time in [0, 1]
    pub time: f32,
    pub differentials: Option<RayDifferentials>,
}

impl Ray {
    /// Create an unbounded ray.
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3, time: f32) -> Self {
        Self {
            origin,
            direction,
            t: f32::MAX,
            time,
            differentials: None,
        }
    }

    /// Create a ray limited to `t` along its direction.
    #[inline]
    pub fn segment(origin: Vec3, direction: Vec3, t: f32, time: f32) -> Self {
        Self {
            t,
            ..Self::new(origin, direction, time)
        }
    }

    /// Compute a point along the ray at parameter t.
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + t * self.direction
    }

    /// End point of a bounded ray.
    #[inline]
    pub fn end(&self) -> Vec3 {
        self.at(self.t)
    }

    /// Shorten the ray. Lengths are never extended.
    #[inline]
    pub fn clip(&mut self, t: f32) {
        self.t = self.t.min(t);
    }

    /// The bare form used for bounding-box tests.
    #[inline]
    pub fn to_math(&self) -> ivar_math::Ray {
        ivar_math::Ray::new(self.origin, self.direction, self.time)
    }
}

impl Default for Ray {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::Z, 0.0)
    }
}

/// Offset a hit position along the geometric normal so the next ray does not
/// re-hit the surface it leaves.
///
/// The offset scales with the magnitude of the position, in the manner of
/// integer-ULP offsetting.
pub fn offset_ray_origin(p: Vec3, ng: Vec3, towards: Vec3) -> Vec3 {
    const ORIGIN_EPSILON: f32 = 1e-5;
    let scale = ORIGIN_EPSILON * (1.0 + p.abs().max_element());
    let n = if ng.dot(towards) < 0.0 { -ng } else { ng };
    p + n * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_at() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X, 0.0);

        assert_eq!(ray.at(0.0), Vec3::ZERO);
        assert_eq!(ray.at(2.5), Vec3::new(2.5, 0.0, 0.0));
        assert_eq!(ray.t, f32::MAX);
    }

    #[test]
    fn test_clip_never_extends() {
        let mut ray = Ray::segment(Vec3::ZERO, Vec3::Z, 4.0, 0.0);
        ray.clip(10.0);
        assert_eq!(ray.t, 4.0);
        ray.clip(1.0);
        assert_eq!(ray.t, 1.0);
        assert_eq!(ray.end(), Vec3::Z);
    }

    #[test]
    fn test_offset_moves_to_requested_side() {
        let p = Vec3::new(0.0, 0.0, 0.0);
        let above = offset_ray_origin(p, Vec3::Z, Vec3::Z);
        let below = offset_ray_origin(p, Vec3::Z, -Vec3::Z);
        assert!(above.z > 0.0);
        assert!(below.z < 0.0);
    }

    #[test]
    fn test_differential_transfer_lands_on_plane() {
        let diff = RayDifferentials {
            dp: [Vec3::ZERO; 2],
            dd: [Vec3::X * 0.01, Vec3::Y * 0.01],
        };
        let out = diff.transfer(-Vec3::Z, 5.0, Vec3::Z);
        assert!((out.dp[0] - Vec3::X * 0.05).length() < 1e-6);
        assert!(out.dp[1].z.abs() < 1e-6);
    }
}
