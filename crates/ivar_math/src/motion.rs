//! Motion-blur transforms.
//!
//! Animated instances store one decomposed transform per motion step; the
//! transform at a given shutter time interpolates translation and scale
//! linearly and rotation spherically, which keeps rigid motion rigid.

use glam::{Mat4, Quat, Vec3};

/// Upper bound on motion steps, shared by geometry keys and instance transforms.
pub const MAX_MOTION_STEPS: usize = 129;

/// A transform split into scale, rotation and translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecomposedTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl DecomposedTransform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_mat4(m: &Mat4) -> Self {
        let (scale, rotation, translation) = m.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
            scale,
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Interpolate towards `other` by `t` in [0, 1].
    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        // Take the short way around when the quaternions sit in opposite hemispheres.
        let target = if self.rotation.dot(other.rotation) < 0.0 {
            -other.rotation
        } else {
            other.rotation
        };
        Self {
            translation: self.translation.lerp(other.translation, t),
            rotation: self.rotation.slerp(target, t).normalize(),
            scale: self.scale.lerp(other.scale, t),
        }
    }
}

impl Default for DecomposedTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Locate `time` (in [0, 1]) between motion steps.
///
/// Returns the lower step index and the fraction towards the next step.
#[inline]
pub fn motion_step_at(num_steps: usize, time: f32) -> (usize, f32) {
    debug_assert!(num_steps >= 1);
    if num_steps <= 1 {
        return (0, 0.0);
    }
    let max_step = num_steps - 1;
    let scaled = time.clamp(0.0, 1.0) * max_step as f32;
    let step = (scaled.floor() as usize).min(max_step - 1);
    (step, scaled - step as f32)
}

/// Transform matrix of a motion sequence at shutter time `time`.
pub fn interpolate_motion(steps: &[DecomposedTransform], time: f32) -> Mat4 {
    match steps.len() {
        0 => Mat4::IDENTITY,
        1 => steps[0].to_mat4(),
        n => {
            let (step, frac) = motion_step_at(n, time);
            steps[step].lerp(&steps[step + 1], frac).to_mat4()
        }
    }
}
