//! Math types for the Ivar path tracing core.
//!
//! Re-exports glam and adds the few geometric types every other crate
//! needs: intervals, bounding boxes, rays and motion-blur transforms.

// Re-export glam for convenience
pub use glam::*;

mod aabb;
mod interval;
mod motion;
mod ray;
mod transform;

pub use aabb::Aabb;
pub use interval::Interval;
pub use motion::{interpolate_motion, motion_step_at, DecomposedTransform, MAX_MOTION_STEPS};
pub use ray::Ray;
pub use transform::Mat4Ext;

/// Build an orthonormal basis `(t, b)` around unit vector `n`.
///
/// Uses the branchless construction of Duff et al. 2017.
#[inline]
pub fn make_orthonormals(n: Vec3) -> (Vec3, Vec3) {
    let sign = 1.0_f32.copysign(n.z);
    let a = -1.0 / (sign + n.z);
    let b = n.x * n.y * a;
    let t = Vec3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x);
    let bt = Vec3::new(b, sign + n.y * n.y * a, -n.y);
    (t, bt)
}
