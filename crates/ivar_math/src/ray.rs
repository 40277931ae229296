use crate::Vec3;

/// A bare geometric ray, used for bounding-box tests.
///
/// The renderer carries its own ray type with length and differentials; this
/// one is the minimal form the slab test needs. `inv_direction` is cached
/// because BVH traversal tests the same ray against many boxes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub inv_direction: Vec3,
    pub time: f32,
}

impl Ray {
    /// Create a new ray.
    pub fn new(origin: Vec3, direction: Vec3, time: f32) -> Self {
        Self {
            origin,
            direction,
            inv_direction: direction.recip(),
            time,
        }
    }

    /// Get the point along the ray at parameter t.
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_at() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X, 0.0);

        assert_eq!(ray.at(0.0), Vec3::ZERO);
        assert_eq!(ray.at(2.0), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(ray.at(-1.0), Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_inverse_direction_handles_axis_rays() {
        let ray = Ray::new(Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0), 0.5);
        assert_eq!(ray.inv_direction.y, 0.5);
        assert!(ray.inv_direction.x.is_infinite());
        assert_eq!(ray.time, 0.5);
    }
}
