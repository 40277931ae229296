//! Hit records returned by acceleration-structure queries.

use ivar_math::Vec3;

/// Kind of primitive a hit landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    #[default]
    Triangle,
    MotionTriangle,
    Curve,
    MotionCurve,
}

impl PrimitiveType {
    pub fn is_curve(self) -> bool {
        matches!(self, Self::Curve | Self::MotionCurve)
    }

    pub fn is_motion(self) -> bool {
        matches!(self, Self::MotionTriangle | Self::MotionCurve)
    }

    pub(crate) fn with_motion(self, motion: bool) -> Self {
        match (self, motion) {
            (Self::Triangle | Self::MotionTriangle, false) => Self::Triangle,
            (Self::Triangle | Self::MotionTriangle, true) => Self::MotionTriangle,
            (Self::Curve | Self::MotionCurve, false) => Self::Curve,
            (Self::Curve | Self::MotionCurve, true) => Self::MotionCurve,
        }
    }
}

/// A ray hit.
///
/// `t` is measured along the world-space ray even for instanced geometry.
/// `u`, `v` are barycentrics for triangles; for curves `u` is the position
/// along the segment and `v` the signed offset across it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intersection {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    /// Index into the primitive pack
    pub prim: u32,
    pub object: u32,
    pub prim_type: PrimitiveType,
    /// Curve segment within its curve; 0 for triangles
    pub segment: u32,
    /// World-space geometric normal, unnormalized, facing as wound
    pub ng: Vec3,
}

impl Intersection {
    /// True when two records describe the same surface crossing.
    pub fn same_hit(&self, other: &Intersection) -> bool {
        self.object == other.object && self.prim == other.prim && self.t == other.t
    }
}
