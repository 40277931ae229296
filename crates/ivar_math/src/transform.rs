// Transform utilities for Mat4
//
// Extends glam::Mat4 with the operations instancing needs: box transforms and
// normal transforms.

use crate::Aabb;
use glam::{Mat3, Mat4, Vec3};

/// Extension trait for Mat4 to provide additional transform utilities
pub trait Mat4Ext {
    /// Transform an axis-aligned bounding box.
    /// Computes the bounding box of all 8 transformed corners.
    fn transform_aabb(&self, aabb: &Aabb) -> Aabb;

    /// Transform a surface normal (inverse transpose of the upper 3x3).
    fn transform_normal(&self, normal: Vec3) -> Vec3;

    /// True when the transform flips handedness, which flips triangle winding.
    fn has_negative_scale(&self) -> bool;
}

impl Mat4Ext for Mat4 {
    fn transform_aabb(&self, aabb: &Aabb) -> Aabb {
        if aabb.is_empty() {
            return Aabb::EMPTY;
        }
        let lo = aabb.min();
        let hi = aabb.max();
        Aabb::from_point_iter((0..8).map(|i| {
            let corner = Vec3::new(
                if i & 1 == 0 { lo.x } else { hi.x },
                if i & 2 == 0 { lo.y } else { hi.y },
                if i & 4 == 0 { lo.z } else { hi.z },
            );
            self.transform_point3(corner)
        }))
    }

    fn transform_normal(&self, normal: Vec3) -> Vec3 {
        Mat3::from_mat4(*self).inverse().transpose() * normal
    }

    fn has_negative_scale(&self) -> bool {
        Mat3::from_mat4(*self).determinant() < 0.0
    }
}
