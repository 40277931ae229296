//! Hair and fiber curves.
//!
//! Curves are stored as a flat key array shared by every curve; each key is a
//! position plus radius packed into a `Vec4`. A curve with `n` keys has `n - 1`
//! linear segments, and every segment is one primitive in the acceleration
//! structure.

use ivar_math::{Aabb, Vec3, Vec4};

use crate::mesh::validate_motion;
use crate::scene::SceneError;

/// Where one curve's keys live in the shared key array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Curve {
    pub first_key: u32,
    pub num_keys: u32,
    pub shader: u32,
}

impl Curve {
    pub fn num_segments(&self) -> usize {
        self.num_keys.saturating_sub(1) as usize
    }
}

/// A set of linear curves with optional per-key motion.
#[derive(Clone, Debug, Default)]
pub struct Curves {
    /// xyz = position, w = radius
    pub keys: Vec<Vec4>,
    pub curves: Vec<Curve>,
    /// Keys per motion step. Empty for static curves.
    pub motion: Vec<Vec<Vec4>>,
}

impl Curves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a curve through `points` with per-point radii.
    pub fn add_curve(&mut self, points: &[Vec3], radii: &[f32], shader: u32) {
        let first_key = self.keys.len() as u32;
        self.keys.extend(
            points
                .iter()
                .zip(radii.iter().chain(std::iter::repeat(radii.last().unwrap_or(&0.0))))
                .map(|(p, r)| p.extend(*r)),
        );
        self.curves.push(Curve {
            first_key,
            num_keys: points.len() as u32,
            shader,
        });
    }

    pub fn with_motion(mut self, motion: Vec<Vec<Vec4>>) -> Self {
        self.motion = motion;
        self
    }

    pub fn curve_count(&self) -> usize {
        self.curves.len()
    }

    /// Total number of segments over all curves.
    pub fn segment_count(&self) -> usize {
        self.curves.iter().map(Curve::num_segments).sum()
    }

    pub fn motion_steps(&self) -> usize {
        self.motion.len().max(1)
    }

    /// Iterate over (curve, segment) for every segment, in primitive order.
    pub fn segments(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.curves
            .iter()
            .enumerate()
            .flat_map(|(curve, c)| (0..c.num_segments()).map(move |seg| (curve, seg)))
    }

    fn step_keys(&self, step: usize) -> &[Vec4] {
        if self.motion.is_empty() {
            &self.keys
        } else {
            &self.motion[step.min(self.motion.len() - 1)]
        }
    }

    /// The two keys bounding a segment at a motion step.
    pub fn segment_keys(&self, curve: usize, segment: usize, step: usize) -> [Vec4; 2] {
        let keys = self.step_keys(step);
        let k = self.curves[curve].first_key as usize + segment;
        [keys[k], keys[k + 1]]
    }

    /// Bounds of a segment across every motion step, padded by the radius.
    pub fn segment_bounds(&self, curve: usize, segment: usize) -> Aabb {
        (0..self.motion_steps()).fold(Aabb::EMPTY, |acc, step| {
            let [k0, k1] = self.segment_keys(curve, segment, step);
            let r = k0.w.max(k1.w);
            let lo = k0.truncate().min(k1.truncate()) - Vec3::splat(r);
            let hi = k0.truncate().max(k1.truncate()) + Vec3::splat(r);
            Aabb::surrounding(&acc, &Aabb::from_points(lo, hi))
        })
    }

    pub fn bounds(&self) -> Aabb {
        self.segments()
            .fold(Aabb::EMPTY, |acc, (c, s)| Aabb::surrounding(&acc, &self.segment_bounds(c, s)))
    }

    pub fn validate(&self) -> Result<(), SceneError> {
        for (index, curve) in self.curves.iter().enumerate() {
            if curve.num_keys < 2 {
                return Err(SceneError::ShortCurve(index));
            }
            let end = curve.first_key as usize + curve.num_keys as usize;
            if end > self.keys.len() {
                return Err(SceneError::CurveKeysOutOfRange {
                    curve: index,
                    keys: self.keys.len(),
                });
            }
        }
        validate_motion(&self.motion, self.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_curves() -> Curves {
        let mut curves = Curves::new();
        curves.add_curve(
            &[Vec3::ZERO, Vec3::Y, Vec3::new(0.0, 2.0, 0.0)],
            &[0.1, 0.05, 0.01],
            0,
        );
        curves.add_curve(&[Vec3::X, Vec3::new(1.0, 1.0, 0.0)], &[0.2], 1);
        curves
    }

    #[test]
    fn test_segment_enumeration() {
        let curves = two_curves();
        assert_eq!(curves.curve_count(), 2);
        assert_eq!(curves.segment_count(), 3);
        let segs: Vec<_> = curves.segments().collect();
        assert_eq!(segs, vec![(0, 0), (0, 1), (1, 0)]);
        assert!(curves.validate().is_ok());
    }

    #[test]
    fn test_missing_radii_repeat_last() {
        let curves = two_curves();
        let [k0, k1] = curves.segment_keys(1, 0, 0);
        assert_eq!(k0.w, 0.2);
        assert_eq!(k1.w, 0.2);
    }

    #[test]
    fn test_segment_bounds_include_radius() {
        let curves = two_curves();
        let b = curves.segment_bounds(0, 0);
        assert!((b.x.min + 0.1).abs() < 1e-5);
        assert!((b.y.max - 1.1).abs() < 1e-5);
    }

    #[test]
    fn test_short_curve_rejected() {
        let mut curves = Curves::new();
        curves.add_curve(&[Vec3::ZERO], &[0.1], 0);
        assert!(matches!(curves.validate(), Err(SceneError::ShortCurve(0))));
    }
}
