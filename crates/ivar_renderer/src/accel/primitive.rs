//! Ray-primitive intersection for triangles and curve segments.

use ivar_math::{Vec3, Vec4};

/// Raw hit against one primitive, in the space the ray was given in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveHit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    /// Geometric normal, unnormalized
    pub ng: Vec3,
}

/// Möller-Trumbore ray-triangle intersection.
///
/// Accepts hits with `t_min < t < t_max`. Barycentrics follow
/// `P = (1 - u - v) * v0 + u * v1 + v * v2`, and `ng = (v1 - v0) x (v2 - v0)`.
#[inline]
pub fn intersect_triangle(
    origin: Vec3,
    direction: Vec3,
    t_min: f32,
    t_max: f32,
    [v0, v1, v2]: [Vec3; 3],
) -> Option<PrimitiveHit> {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let h = direction.cross(edge2);
    let a = edge1.dot(h);

    // Ray is parallel to triangle
    if a.abs() < 1e-12 {
        return None;
    }

    let f = 1.0 / a;
    let s = origin - v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(edge1);
    let v = f * direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(q);
    if t <= t_min || t >= t_max {
        return None;
    }

    Some(PrimitiveHit {
        t,
        u,
        v,
        ng: edge1.cross(edge2),
    })
}

/// Intersect a round linear curve segment between keys `k0` and `k1`
/// (xyz = position, w = radius).
///
/// The segment is treated locally as a sphere of interpolated radius centred
/// on the axis point closest to the ray. Returns the nearest root past
/// `t_min`; when the ray starts inside the curve that root is the exit point,
/// whose normal faces along the ray. `u` is the position along the segment,
/// `v` the offset from the axis relative to the radius.
pub fn intersect_curve_segment(
    origin: Vec3,
    direction: Vec3,
    t_min: f32,
    t_max: f32,
    k0: Vec4,
    k1: Vec4,
) -> Option<PrimitiveHit> {
    let p0 = k0.truncate();
    let axis = k1.truncate() - p0;

    let w = origin - p0;
    let a = direction.dot(direction);
    let b = direction.dot(axis);
    let c = axis.dot(axis);
    let d = direction.dot(w);
    let e = axis.dot(w);
    if a <= 0.0 || c <= 0.0 {
        return None;
    }

    let denom = a * c - b * b;
    let s = if denom > 1e-12 * a * c {
        ((a * e - b * d) / denom).clamp(0.0, 1.0)
    } else {
        (e / c).clamp(0.0, 1.0)
    };

    let center = p0 + axis * s;
    let radius = k0.w + (k1.w - k0.w) * s;
    if radius <= 0.0 {
        return None;
    }

    let oc = origin - center;
    let half_b = oc.dot(direction);
    let cc = oc.dot(oc) - radius * radius;
    let disc = half_b * half_b - a * cc;
    if disc < 0.0 {
        return None;
    }
    let sqrt_disc = disc.sqrt();

    let mut t = (-half_b - sqrt_disc) / a;
    if t <= t_min {
        t = (-half_b + sqrt_disc) / a;
    }
    if t <= t_min || t >= t_max {
        return None;
    }

    let ng = origin + direction * t - center;
    Some(PrimitiveHit {
        t,
        u: s,
        v: (ng - axis * (ng.dot(axis) / c)).length() / radius,
        ng,
    })
}
