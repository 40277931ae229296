//! Scene store handed to the acceleration structure at commit time.
//!
//! Geometry is shared: several objects may reference the same geometry index,
//! and the acceleration structure builds one bottom-level hierarchy per
//! geometry regardless of how many objects use it.

use ivar_math::{Aabb, Mat4Ext};
use thiserror::Error;

use crate::curves::Curves;
use crate::mesh::Mesh;
use crate::object::{Object, ObjectFlags};

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("index count {0} is not a multiple of 3")]
    IndexCount(usize),

    #[error("vertex index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },

    #[error("expected {expected} per-primitive shaders, found {found}")]
    ShaderCount { expected: usize, found: usize },

    #[error("shader {0} is not registered")]
    UnknownShader(u32),

    #[error("{0} motion steps exceed the supported maximum")]
    TooManyMotionSteps(usize),

    #[error("motion requires at least two steps")]
    SingleMotionStep,

    #[error("motion step {step} has {found} keys, expected {expected}")]
    MotionKeyCount {
        step: usize,
        expected: usize,
        found: usize,
    },

    #[error("curve {0} has fewer than two keys")]
    ShortCurve(usize),

    #[error("curve {curve} reads past the end of {keys} keys")]
    CurveKeysOutOfRange { curve: usize, keys: usize },

    #[error("object references geometry {0}, which does not exist")]
    UnknownGeometry(usize),
}

bitflags::bitflags! {
    /// Shader properties the traversal filters and integrator branch on.
    #[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
    pub struct ShaderFlags: u32 {
        /// Emission is importance sampled by the light sampler, so hits need MIS.
        const USE_MIS = 1 << 0;
        const HAS_SURFACE_TRANSPARENT = 1 << 1;
        /// Shadow rays may pass through with partial attenuation.
        const HAS_TRANSPARENT_SHADOW = 1 << 2;
        const HAS_VOLUME = 1 << 3;
        const HETEROGENEOUS_VOLUME = 1 << 4;
        const HAS_EMISSION = 1 << 5;
        const HAS_BSSRDF = 1 << 6;
    }
}

#[derive(Clone, Debug)]
pub struct ShaderInfo {
    pub name: String,
    pub flags: ShaderFlags,
}

/// Primitive storage shared between objects.
#[derive(Clone, Debug)]
pub enum Geometry {
    Mesh(Mesh),
    Curves(Curves),
}

impl Geometry {
    /// Number of acceleration-structure primitives (triangles or curve segments).
    pub fn primitive_count(&self) -> usize {
        match self {
            Self::Mesh(mesh) => mesh.triangle_count(),
            Self::Curves(curves) => curves.segment_count(),
        }
    }

    pub fn motion_steps(&self) -> usize {
        match self {
            Self::Mesh(mesh) => mesh.motion_steps(),
            Self::Curves(curves) => curves.motion_steps(),
        }
    }

    pub fn bounds(&self) -> Aabb {
        match self {
            Self::Mesh(mesh) => mesh.bounds,
            Self::Curves(curves) => curves.bounds(),
        }
    }

    /// Every shader id referenced by the geometry.
    pub fn shaders(&self) -> Vec<u32> {
        let mut shaders: Vec<u32> = match self {
            Self::Mesh(mesh) => mesh.shaders.clone(),
            Self::Curves(curves) => curves.curves.iter().map(|c| c.shader).collect(),
        };
        shaders.sort_unstable();
        shaders.dedup();
        shaders
    }

    pub fn validate(&self) -> Result<(), SceneError> {
        match self {
            Self::Mesh(mesh) => mesh.validate(),
            Self::Curves(curves) => curves.validate(),
        }
    }
}

/// Flattened scene: shader table, geometries and the objects placing them.
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub shaders: Vec<ShaderInfo>,
    pub geometries: Vec<Geometry>,
    pub objects: Vec<Object>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shader and return its id.
    pub fn add_shader(&mut self, name: impl Into<String>, flags: ShaderFlags) -> u32 {
        self.shaders.push(ShaderInfo {
            name: name.into(),
            flags,
        });
        (self.shaders.len() - 1) as u32
    }

    pub fn shader_flags(&self, shader: u32) -> ShaderFlags {
        self.shaders
            .get(shader as usize)
            .map(|s| s.flags)
            .unwrap_or_default()
    }

    /// Validate and add a geometry, returning its index.
    pub fn add_geometry(&mut self, geometry: impl Into<Geometry>) -> Result<usize, SceneError> {
        let geometry = geometry.into();
        geometry.validate()?;
        if let Some(&shader) = geometry
            .shaders()
            .iter()
            .find(|&&s| s as usize >= self.shaders.len())
        {
            return Err(SceneError::UnknownShader(shader));
        }
        log::debug!(
            "Geometry {}: {} primitives, {} motion step(s)",
            self.geometries.len(),
            geometry.primitive_count(),
            geometry.motion_steps()
        );
        self.geometries.push(geometry);
        Ok(self.geometries.len() - 1)
    }

    /// Add an object, deriving its flags, and return its index.
    pub fn add_object(&mut self, mut object: Object) -> Result<usize, SceneError> {
        object.flags = self.object_flags(&object)?;
        self.objects.push(object);
        Ok(self.objects.len() - 1)
    }

    fn object_flags(&self, object: &Object) -> Result<ObjectFlags, SceneError> {
        let geometry = self
            .geometries
            .get(object.geometry)
            .ok_or(SceneError::UnknownGeometry(object.geometry))?;

        let mut flags = ObjectFlags::empty();
        if geometry
            .shaders()
            .iter()
            .any(|&s| self.shader_flags(s).contains(ShaderFlags::HAS_VOLUME))
        {
            flags |= ObjectFlags::HAS_VOLUME;
        }
        if object.transform.has_negative_scale() {
            flags |= ObjectFlags::NEGATIVE_SCALE;
        }
        if object.transform.is_motion() || geometry.motion_steps() > 1 {
            flags |= ObjectFlags::MOTION;
        }
        Ok(flags)
    }

    /// Indices of the objects instancing a geometry.
    pub fn geometry_users(&self, geometry: usize) -> impl Iterator<Item = usize> + '_ {
        self.objects
            .iter()
            .enumerate()
            .filter(move |(_, o)| o.geometry == geometry)
            .map(|(i, _)| i)
    }

    /// Total acceleration-structure primitives over all geometries.
    pub fn primitive_count(&self) -> usize {
        self.geometries.iter().map(Geometry::primitive_count).sum()
    }

    /// World-space bounds over all objects and the whole shutter.
    pub fn world_bounds(&self) -> Aabb {
        self.objects.iter().fold(Aabb::EMPTY, |acc, object| {
            match self.geometries.get(object.geometry) {
                Some(geometry) => Aabb::surrounding(
                    &acc,
                    &object.transform.transform_bounds(&geometry.bounds()),
                ),
                None => acc,
            }
        })
    }

    /// Check every geometry and object reference.
    pub fn validate(&self) -> Result<(), SceneError> {
        for geometry in &self.geometries {
            geometry.validate()?;
        }
        for object in &self.objects {
            self.object_flags(object)?;
        }
        Ok(())
    }

    /// True when any object's transform mirrors space.
    pub fn has_mirrored_objects(&self) -> bool {
        self.objects
            .iter()
            .any(|o| o.transform.at(0.0).has_negative_scale())
    }
}

impl From<Mesh> for Geometry {
    fn from(mesh: Mesh) -> Self {
        Self::Mesh(mesh)
    }
}

impl From<Curves> for Geometry {
    fn from(curves: Curves) -> Self {
        Self::Curves(curves)
    }
}
