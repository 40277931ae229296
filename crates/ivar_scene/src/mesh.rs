//! Triangle mesh geometry.
//!
//! A mesh is a flat list of positions and triangle indices, with one shader id
//! per triangle. Deforming meshes carry one full position array per motion
//! step; the steps are evenly spaced over the shutter interval [0, 1].

use ivar_math::{motion_step_at, Aabb, Vec3, MAX_MOTION_STEPS};

use crate::scene::SceneError;

/// A triangle mesh with optional per-vertex motion keys.
#[derive(Clone, Debug)]
pub struct Mesh {
    /// Vertex positions at the shutter center (one Vec3 per vertex)
    pub positions: Vec<Vec3>,

    /// Vertex normals (optional - computed on demand)
    pub normals: Option<Vec<Vec3>>,

    /// Triangle indices (every 3 indices form a triangle)
    pub indices: Vec<u32>,

    /// Shader id per triangle. A single entry applies to every triangle.
    pub shaders: Vec<u32>,

    /// Positions per motion step. Empty for static meshes.
    pub motion: Vec<Vec<Vec3>>,

    /// Bounds over every motion step
    pub bounds: Aabb,
}

impl Mesh {
    /// Create a static mesh from positions and indices, using shader 0.
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        let bounds = Aabb::from_point_iter(positions.iter().copied());
        Self {
            positions,
            normals: None,
            indices,
            shaders: vec![0],
            motion: Vec::new(),
            bounds,
        }
    }

    /// Assign one shader to every triangle.
    pub fn with_shader(mut self, shader: u32) -> Self {
        self.shaders = vec![shader];
        self
    }

    /// Assign a shader per triangle.
    pub fn with_shaders(mut self, shaders: Vec<u32>) -> Self {
        self.shaders = shaders;
        self
    }

    /// Attach motion keys, one position array per step.
    pub fn with_motion(mut self, motion: Vec<Vec<Vec3>>) -> Self {
        self.motion = motion;
        self.update_bounds();
        self
    }

    /// Recompute bounds after positions or motion keys changed.
    pub fn update_bounds(&mut self) {
        self.bounds = if self.motion.is_empty() {
            Aabb::from_point_iter(self.positions.iter().copied())
        } else {
            Aabb::from_point_iter(self.motion.iter().flatten().copied())
        };
    }

    /// Get the number of triangles in the mesh.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get the number of vertices in the mesh.
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of motion steps; 1 for static meshes.
    pub fn motion_steps(&self) -> usize {
        self.motion.len().max(1)
    }

    /// Shader id of a triangle.
    pub fn shader(&self, tri: usize) -> u32 {
        match self.shaders.len() {
            0 => 0,
            1 => self.shaders[0],
            _ => self.shaders[tri],
        }
    }

    /// Vertex indices of a triangle.
    #[inline]
    pub fn triangle(&self, tri: usize) -> [usize; 3] {
        let i = tri * 3;
        [
            self.indices[i] as usize,
            self.indices[i + 1] as usize,
            self.indices[i + 2] as usize,
        ]
    }

    /// Positions of motion step `step` (the center positions when static).
    pub fn step_positions(&self, step: usize) -> &[Vec3] {
        if self.motion.is_empty() {
            &self.positions
        } else {
            &self.motion[step.min(self.motion.len() - 1)]
        }
    }

    /// Triangle corners at a given motion step.
    pub fn triangle_vertices(&self, tri: usize, step: usize) -> [Vec3; 3] {
        let positions = self.step_positions(step);
        let [a, b, c] = self.triangle(tri);
        [positions[a], positions[b], positions[c]]
    }

    /// Triangle corners interpolated at shutter time `time`.
    pub fn triangle_vertices_at(&self, tri: usize, time: f32) -> [Vec3; 3] {
        if self.motion.len() < 2 {
            return self.triangle_vertices(tri, 0);
        }
        let (step, frac) = motion_step_at(self.motion.len(), time);
        let v0 = self.triangle_vertices(tri, step);
        let v1 = self.triangle_vertices(tri, step + 1);
        [
            v0[0].lerp(v1[0], frac),
            v0[1].lerp(v1[1], frac),
            v0[2].lerp(v1[2], frac),
        ]
    }

    /// Bounds of one triangle across every motion step.
    pub fn triangle_bounds(&self, tri: usize) -> Aabb {
        Aabb::from_point_iter(
            (0..self.motion_steps()).flat_map(|step| self.triangle_vertices(tri, step)),
        )
    }

    /// Compute smooth vertex normals by averaging face normals.
    ///
    /// Triangles wind counter-clockwise around their front-facing normal.
    pub fn compute_normals(&mut self) {
        let vertex_count = self.positions.len();
        let mut normals = vec![Vec3::ZERO; vertex_count];

        for face in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [face[0] as usize, face[1] as usize, face[2] as usize];
            if i0 >= vertex_count || i1 >= vertex_count || i2 >= vertex_count {
                continue;
            }

            let p0 = self.positions[i0];
            let face_normal = (self.positions[i1] - p0).cross(self.positions[i2] - p0);

            normals[i0] += face_normal;
            normals[i1] += face_normal;
            normals[i2] += face_normal;
        }

        for normal in &mut normals {
            *normal = normal.try_normalize().unwrap_or(Vec3::Z);
        }

        self.normals = Some(normals);
    }

    /// Check indices, shader table and motion keys for consistency.
    pub fn validate(&self) -> Result<(), SceneError> {
        if self.indices.len() % 3 != 0 {
            return Err(SceneError::IndexCount(self.indices.len()));
        }
        let vertex_count = self.positions.len();
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(SceneError::IndexOutOfRange {
                index,
                vertex_count,
            });
        }
        let triangles = self.triangle_count();
        if self.shaders.len() > 1 && self.shaders.len() != triangles {
            return Err(SceneError::ShaderCount {
                expected: triangles,
                found: self.shaders.len(),
            });
        }
        validate_motion(&self.motion, vertex_count)
    }
}

pub(crate) fn validate_motion<T>(motion: &[Vec<T>], keys: usize) -> Result<(), SceneError> {
    if motion.len() > MAX_MOTION_STEPS {
        return Err(SceneError::TooManyMotionSteps(motion.len()));
    }
    if motion.len() == 1 {
        return Err(SceneError::SingleMotionStep);
    }
    if let Some(step) = motion.iter().position(|s| s.len() != keys) {
        return Err(SceneError::MotionKeyCount {
            step,
            expected: keys,
            found: motion[step].len(),
        });
    }
    Ok(())
}
