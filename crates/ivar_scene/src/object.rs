//! Objects: placed instances of shared geometry.

use ivar_math::{interpolate_motion, Aabb, DecomposedTransform, Mat4, Mat4Ext};

bitflags::bitflags! {
    /// Ray types an object is visible to.
    ///
    /// Traversal compares this mask against the visibility of the query ray
    /// and skips objects with no bit in common.
    #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
    pub struct Visibility: u32 {
        const CAMERA = 1 << 0;
        const DIFFUSE = 1 << 1;
        const GLOSSY = 1 << 2;
        const TRANSMISSION = 1 << 3;
        const SHADOW = 1 << 4;
        const VOLUME_SCATTER = 1 << 5;

        const ALL = Self::CAMERA.bits()
            | Self::DIFFUSE.bits()
            | Self::GLOSSY.bits()
            | Self::TRANSMISSION.bits()
            | Self::SHADOW.bits()
            | Self::VOLUME_SCATTER.bits();
    }
}

bitflags::bitflags! {
    /// Per-object properties derived from its geometry, shaders and transform.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct ObjectFlags: u32 {
        /// Some shader on the object has a volume component.
        const HAS_VOLUME = 1 << 0;
        /// The transform mirrors, so triangle winding flips.
        const NEGATIVE_SCALE = 1 << 1;
        /// Transform or geometry moves during the shutter.
        const MOTION = 1 << 2;
    }
}

/// Object-to-world transform, static or sampled over the shutter.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectTransform {
    Static(Mat4),
    /// Evenly spaced transform steps over the shutter interval [0, 1]
    Motion(Vec<DecomposedTransform>),
}

impl Default for ObjectTransform {
    fn default() -> Self {
        Self::Static(Mat4::IDENTITY)
    }
}

impl ObjectTransform {
    /// Transform at shutter time `time`.
    pub fn at(&self, time: f32) -> Mat4 {
        match self {
            Self::Static(m) => *m,
            Self::Motion(steps) => interpolate_motion(steps, time),
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(self, Self::Motion(steps) if steps.len() > 1)
    }

    pub fn motion_steps(&self) -> usize {
        match self {
            Self::Static(_) => 1,
            Self::Motion(steps) => steps.len().max(1),
        }
    }

    /// World bounds of a local box over the whole shutter.
    ///
    /// Rotating steps are also sampled halfway between keys, since an
    /// interpolated rotation can sweep outside both endpoint boxes.
    pub fn transform_bounds(&self, local: &Aabb) -> Aabb {
        match self {
            Self::Static(m) => m.transform_aabb(local),
            Self::Motion(steps) if steps.len() < 2 => self.at(0.0).transform_aabb(local),
            Self::Motion(steps) => {
                let samples = (steps.len() - 1) * 2;
                (0..=samples).fold(Aabb::EMPTY, |acc, i| {
                    let time = i as f32 / samples as f32;
                    Aabb::surrounding(&acc, &self.at(time).transform_aabb(local))
                })
            }
        }
    }

    pub fn has_negative_scale(&self) -> bool {
        match self {
            Self::Static(m) => m.has_negative_scale(),
            Self::Motion(steps) => steps
                .first()
                .is_some_and(|s| s.scale.x * s.scale.y * s.scale.z < 0.0),
        }
    }
}

/// An instance of one geometry in the world.
#[derive(Clone, Debug)]
pub struct Object {
    /// Index into `Scene::geometries`
    pub geometry: usize,
    pub transform: ObjectTransform,
    pub visibility: Visibility,
    /// Derived when the object is added to a scene
    pub flags: ObjectFlags,
}

impl Object {
    pub fn new(geometry: usize) -> Self {
        Self {
            geometry,
            transform: ObjectTransform::default(),
            visibility: Visibility::ALL,
            flags: ObjectFlags::empty(),
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = ObjectTransform::Static(transform);
        self
    }

    pub fn with_motion(mut self, steps: Vec<DecomposedTransform>) -> Self {
        self.transform = ObjectTransform::Motion(steps);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}
