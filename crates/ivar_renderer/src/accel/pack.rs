//! Flattened primitive arrays shared by traversal and shading.
//!
//! Every primitive of every instanced geometry gets one slot in a set of
//! parallel arrays. A geometry's primitives are contiguous, starting at its
//! global primitive offset, and each object records the offset of the
//! geometry it instances so a hit maps back to mesh and shader data.

use std::str::FromStr;

use ivar_math::{motion_step_at, Vec3, Vec4};
use ivar_scene::{Geometry, ObjectFlags, Scene, ShaderFlags, Visibility};
use thiserror::Error;

use crate::intersection::PrimitiveType;

/// Marks an object whose geometry has no primitives in the pack.
pub const NO_NODE_OFFSET: u32 = u32::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("unknown buffer slot `{0}`")]
    UnknownSlot(String),

    #[error("array `{slot}` has {len} entries, expected {expected}")]
    LengthMismatch {
        slot: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("primitive {prim} references missing {what} {index}")]
    Dangling {
        prim: usize,
        what: &'static str,
        index: u32,
    },
}

/// Named device-global arrays of the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    PrimIndex,
    PrimType,
    PrimObject,
    PrimGeometry,
    PrimSegment,
    PrimShader,
    PrimVerts,
    TriVerts,
    CurveKeys,
    ObjectNodeOffset,
    ObjectFlags,
    ObjectVisibility,
    ShaderFlags,
}

impl BufferSlot {
    pub const ALL: [BufferSlot; 13] = [
        BufferSlot::PrimIndex,
        BufferSlot::PrimType,
        BufferSlot::PrimObject,
        BufferSlot::PrimGeometry,
        BufferSlot::PrimSegment,
        BufferSlot::PrimShader,
        BufferSlot::PrimVerts,
        BufferSlot::TriVerts,
        BufferSlot::CurveKeys,
        BufferSlot::ObjectNodeOffset,
        BufferSlot::ObjectFlags,
        BufferSlot::ObjectVisibility,
        BufferSlot::ShaderFlags,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BufferSlot::PrimIndex => "prim_index",
            BufferSlot::PrimType => "prim_type",
            BufferSlot::PrimObject => "prim_object",
            BufferSlot::PrimGeometry => "prim_geometry",
            BufferSlot::PrimSegment => "prim_segment",
            BufferSlot::PrimShader => "prim_shader",
            BufferSlot::PrimVerts => "prim_verts",
            BufferSlot::TriVerts => "tri_verts",
            BufferSlot::CurveKeys => "curve_keys",
            BufferSlot::ObjectNodeOffset => "object_node_offset",
            BufferSlot::ObjectFlags => "object_flags",
            BufferSlot::ObjectVisibility => "object_visibility",
            BufferSlot::ShaderFlags => "shader_flags",
        }
    }
}

impl FromStr for BufferSlot {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BufferSlot::ALL
            .into_iter()
            .find(|slot| slot.name() == s)
            .ok_or_else(|| PackError::UnknownSlot(s.to_string()))
    }
}

/// Parallel primitive arrays plus per-object and per-shader tables.
#[derive(Debug, Clone, Default)]
pub struct PackedPrimitives {
    /// Triangle index in its mesh, or curve index in its curve set
    pub prim_index: Vec<u32>,
    pub prim_type: Vec<PrimitiveType>,
    /// First object instancing the primitive's geometry
    pub prim_object: Vec<u32>,
    pub prim_geometry: Vec<u32>,
    pub prim_segment: Vec<u32>,
    pub prim_shader: Vec<u32>,
    /// Offset into `tri_verts` (3 per step) or `curve_keys` (2 per step)
    pub prim_verts: Vec<u32>,
    pub tri_verts: Vec<Vec3>,
    pub curve_keys: Vec<Vec4>,

    /// Global primitive offset of each geometry; `NO_NODE_OFFSET` when skipped
    pub geometry_prim_offset: Vec<u32>,
    pub geometry_motion_steps: Vec<u32>,

    pub object_node_offset: Vec<u32>,
    pub object_geometry: Vec<u32>,
    pub object_flags: Vec<ObjectFlags>,
    pub object_visibility: Vec<Visibility>,

    /// Per shader id, captured at build and left alone by refit
    pub shader_flags: Vec<ShaderFlags>,
}

impl PackedPrimitives {
    /// Flatten every geometry instanced by at least one object.
    ///
    /// A geometry whose vertex buffer cannot be reserved is logged and left
    /// out; objects instancing it get `NO_NODE_OFFSET`.
    pub fn from_scene(scene: &Scene) -> Self {
        let mut pack = PackedPrimitives {
            shader_flags: scene.shaders.iter().map(|s| s.flags).collect(),
            ..Default::default()
        };

        for (geom_index, geometry) in scene.geometries.iter().enumerate() {
            let Some(first_user) = scene.geometry_users(geom_index).next() else {
                log::debug!("Geometry {} has no objects, not packed", geom_index);
                pack.geometry_prim_offset.push(NO_NODE_OFFSET);
                pack.geometry_motion_steps.push(geometry.motion_steps() as u32);
                continue;
            };

            let offset = pack.prim_index.len() as u32;
            match pack.push_geometry(geometry, geom_index as u32, first_user as u32) {
                Ok(()) => pack.geometry_prim_offset.push(offset),
                Err(bytes) => {
                    log::error!(
                        "Failed to allocate {} bytes for geometry {}, skipping it",
                        bytes,
                        geom_index
                    );
                    pack.truncate_prims(offset as usize);
                    pack.geometry_prim_offset.push(NO_NODE_OFFSET);
                }
            }
            pack.geometry_motion_steps.push(geometry.motion_steps() as u32);
        }

        for object in &scene.objects {
            pack.object_node_offset
                .push(pack.geometry_prim_offset[object.geometry]);
            pack.object_geometry.push(object.geometry as u32);
            pack.object_flags.push(object.flags);
            pack.object_visibility.push(object.visibility);
        }

        pack
    }

    /// Append one geometry's primitives; on allocation failure returns the
    /// number of bytes that could not be reserved.
    fn push_geometry(&mut self, geometry: &Geometry, geom: u32, object: u32) -> Result<(), usize> {
        let prims = geometry.primitive_count();
        let steps = geometry.motion_steps();
        let motion = steps > 1;

        for array in [
            &mut self.prim_index,
            &mut self.prim_object,
            &mut self.prim_geometry,
            &mut self.prim_segment,
            &mut self.prim_shader,
            &mut self.prim_verts,
        ] {
            array
                .try_reserve_exact(prims)
                .map_err(|_| prims * std::mem::size_of::<u32>())?;
        }
        self.prim_type
            .try_reserve_exact(prims)
            .map_err(|_| prims * std::mem::size_of::<PrimitiveType>())?;

        match geometry {
            Geometry::Mesh(mesh) => {
                let verts = prims * 3 * steps;
                self.tri_verts
                    .try_reserve_exact(verts)
                    .map_err(|_| verts * std::mem::size_of::<Vec3>())?;
                for tri in 0..prims {
                    self.prim_index.push(tri as u32);
                    self.prim_type
                        .push(PrimitiveType::Triangle.with_motion(motion));
                    self.prim_object.push(object);
                    self.prim_geometry.push(geom);
                    self.prim_segment.push(0);
                    self.prim_shader.push(mesh.shader(tri));
                    self.prim_verts.push(self.tri_verts.len() as u32);
                    for step in 0..steps {
                        self.tri_verts.extend(mesh.triangle_vertices(tri, step));
                    }
                }
            }
            Geometry::Curves(curves) => {
                let keys = prims * 2 * steps;
                self.curve_keys
                    .try_reserve_exact(keys)
                    .map_err(|_| keys * std::mem::size_of::<Vec4>())?;
                for (curve, segment) in curves.segments() {
                    self.prim_index.push(curve as u32);
                    self.prim_type.push(PrimitiveType::Curve.with_motion(motion));
                    self.prim_object.push(object);
                    self.prim_geometry.push(geom);
                    self.prim_segment.push(segment as u32);
                    self.prim_shader.push(curves.curves[curve].shader);
                    self.prim_verts.push(self.curve_keys.len() as u32);
                    for step in 0..steps {
                        self.curve_keys
                            .extend(curves.segment_keys(curve, segment, step));
                    }
                }
            }
        }
        Ok(())
    }

    fn truncate_prims(&mut self, len: usize) {
        self.prim_index.truncate(len);
        self.prim_type.truncate(len);
        self.prim_object.truncate(len);
        self.prim_geometry.truncate(len);
        self.prim_segment.truncate(len);
        self.prim_shader.truncate(len);
        self.prim_verts.truncate(len);
    }

    /// Rewrite vertex data in place from the scene, keeping the layout.
    ///
    /// Only valid when primitive and motion-step counts are unchanged.
    /// Primitive shader ids and `shader_flags` are fixed at build time; a
    /// shader change needs a full build.
    pub fn update_vertices(&mut self, scene: &Scene) {
        for (geom_index, geometry) in scene.geometries.iter().enumerate() {
            let offset = self.geometry_prim_offset[geom_index];
            if offset == NO_NODE_OFFSET {
                continue;
            }
            let steps = geometry.motion_steps();
            match geometry {
                Geometry::Mesh(mesh) => {
                    for tri in 0..mesh.triangle_count() {
                        let base = self.prim_verts[offset as usize + tri] as usize;
                        for step in 0..steps {
                            let at = base + step * 3;
                            self.tri_verts[at..at + 3]
                                .copy_from_slice(&mesh.triangle_vertices(tri, step));
                        }
                    }
                }
                Geometry::Curves(curves) => {
                    for (i, (curve, segment)) in curves.segments().enumerate() {
                        let base = self.prim_verts[offset as usize + i] as usize;
                        for step in 0..steps {
                            let at = base + step * 2;
                            self.curve_keys[at..at + 2]
                                .copy_from_slice(&curves.segment_keys(curve, segment, step));
                        }
                    }
                }
            }
        }
        for (object_index, object) in scene.objects.iter().enumerate() {
            self.object_flags[object_index] = object.flags;
            self.object_visibility[object_index] = object.visibility;
        }
    }

    pub fn len(&self) -> usize {
        self.prim_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prim_index.is_empty()
    }

    #[inline]
    pub fn shader_flags_of(&self, prim: u32) -> ShaderFlags {
        self.prim_shader
            .get(prim as usize)
            .and_then(|&s| self.shader_flags.get(s as usize))
            .copied()
            .unwrap_or_default()
    }

    #[inline]
    pub fn object_flags_of(&self, object: u32) -> ObjectFlags {
        self.object_flags
            .get(object as usize)
            .copied()
            .unwrap_or_default()
    }

    fn motion_steps_of(&self, prim: usize) -> usize {
        self.geometry_motion_steps[self.prim_geometry[prim] as usize] as usize
    }

    /// Triangle corners at shutter time `time`, in object space.
    pub fn triangle_vertices(&self, prim: u32, time: f32) -> [Vec3; 3] {
        let prim = prim as usize;
        let base = self.prim_verts[prim] as usize;
        let steps = self.motion_steps_of(prim);
        if steps <= 1 {
            return [self.tri_verts[base], self.tri_verts[base + 1], self.tri_verts[base + 2]];
        }
        let (step, frac) = motion_step_at(steps, time);
        let a = base + step * 3;
        let b = a + 3;
        [
            self.tri_verts[a].lerp(self.tri_verts[b], frac),
            self.tri_verts[a + 1].lerp(self.tri_verts[b + 1], frac),
            self.tri_verts[a + 2].lerp(self.tri_verts[b + 2], frac),
        ]
    }

    /// Curve segment keys at shutter time `time`, in object space.
    pub fn curve_keys(&self, prim: u32, time: f32) -> [Vec4; 2] {
        let prim = prim as usize;
        let base = self.prim_verts[prim] as usize;
        let steps = self.motion_steps_of(prim);
        if steps <= 1 {
            return [self.curve_keys[base], self.curve_keys[base + 1]];
        }
        let (step, frac) = motion_step_at(steps, time);
        let a = base + step * 2;
        [
            self.curve_keys[a].lerp(self.curve_keys[a + 2], frac),
            self.curve_keys[a + 1].lerp(self.curve_keys[a + 3], frac),
        ]
    }

    /// Object-space bounds of a primitive over the whole shutter.
    pub fn prim_bounds(&self, prim: u32) -> ivar_math::Aabb {
        let p = prim as usize;
        let base = self.prim_verts[p] as usize;
        let steps = self.motion_steps_of(p);
        if self.prim_type[p].is_curve() {
            let keys = &self.curve_keys[base..base + 2 * steps];
            keys.iter().fold(ivar_math::Aabb::EMPTY, |acc, k| {
                let r = Vec3::splat(k.w);
                let p = k.truncate();
                ivar_math::Aabb::surrounding(&acc, &ivar_math::Aabb::from_points(p - r, p + r))
            })
        } else {
            ivar_math::Aabb::from_point_iter(self.tri_verts[base..base + 3 * steps].iter().copied())
        }
    }

    /// Object-space vertex positions as flat floats, for native buffers.
    pub fn tri_vert_floats(&self) -> &[f32] {
        bytemuck::cast_slice(&self.tri_verts)
    }

    /// Size in bytes of one named array.
    pub fn byte_size(&self, slot: BufferSlot) -> usize {
        use std::mem::size_of_val;
        match slot {
            BufferSlot::PrimIndex => size_of_val(self.prim_index.as_slice()),
            BufferSlot::PrimType => size_of_val(self.prim_type.as_slice()),
            BufferSlot::PrimObject => size_of_val(self.prim_object.as_slice()),
            BufferSlot::PrimGeometry => size_of_val(self.prim_geometry.as_slice()),
            BufferSlot::PrimSegment => size_of_val(self.prim_segment.as_slice()),
            BufferSlot::PrimShader => size_of_val(self.prim_shader.as_slice()),
            BufferSlot::PrimVerts => size_of_val(self.prim_verts.as_slice()),
            BufferSlot::TriVerts => size_of_val(self.tri_verts.as_slice()),
            BufferSlot::CurveKeys => size_of_val(self.curve_keys.as_slice()),
            BufferSlot::ObjectNodeOffset => size_of_val(self.object_node_offset.as_slice()),
            BufferSlot::ObjectFlags => size_of_val(self.object_flags.as_slice()),
            BufferSlot::ObjectVisibility => size_of_val(self.object_visibility.as_slice()),
            BufferSlot::ShaderFlags => size_of_val(self.shader_flags.as_slice()),
        }
    }

    /// Total bytes over every named array.
    pub fn total_bytes(&self) -> usize {
        BufferSlot::ALL.iter().map(|&slot| self.byte_size(slot)).sum()
    }

    /// Check that the parallel arrays agree and every reference is live.
    pub fn validate(&self) -> Result<(), PackError> {
        let expected = self.prim_index.len();
        let lengths = [
            (BufferSlot::PrimType, self.prim_type.len()),
            (BufferSlot::PrimObject, self.prim_object.len()),
            (BufferSlot::PrimGeometry, self.prim_geometry.len()),
            (BufferSlot::PrimSegment, self.prim_segment.len()),
            (BufferSlot::PrimShader, self.prim_shader.len()),
            (BufferSlot::PrimVerts, self.prim_verts.len()),
        ];
        for (slot, len) in lengths {
            if len != expected {
                return Err(PackError::LengthMismatch {
                    slot: slot.name(),
                    len,
                    expected,
                });
            }
        }

        let objects = self.object_node_offset.len();
        for (slot, len) in [
            (BufferSlot::ObjectFlags, self.object_flags.len()),
            (BufferSlot::ObjectVisibility, self.object_visibility.len()),
        ] {
            if len != objects {
                return Err(PackError::LengthMismatch {
                    slot: slot.name(),
                    len,
                    expected: objects,
                });
            }
        }

        for prim in 0..expected {
            let object = self.prim_object[prim];
            if object as usize >= objects {
                return Err(PackError::Dangling {
                    prim,
                    what: "object",
                    index: object,
                });
            }
            let geometry = self.prim_geometry[prim];
            if self
                .geometry_prim_offset
                .get(geometry as usize)
                .map_or(true, |&o| o == NO_NODE_OFFSET)
            {
                return Err(PackError::Dangling {
                    prim,
                    what: "geometry",
                    index: geometry,
                });
            }
            let shader = self.prim_shader[prim];
            if shader as usize >= self.shader_flags.len() {
                return Err(PackError::Dangling {
                    prim,
                    what: "shader",
                    index: shader,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivar_scene::{Curves, Mesh, Object};

    fn scene() -> Scene {
        let mut scene = Scene::new();
        scene.add_shader("a", ShaderFlags::empty());
        scene.add_shader("b", ShaderFlags::HAS_TRANSPARENT_SHADOW);
        let quad = Mesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::new(1.0, 1.0, 0.0)],
            vec![0, 1, 2, 1, 3, 2],
        )
        .with_shaders(vec![0, 1]);
        let unused = Mesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]);
        let mut curves = Curves::new();
        curves.add_curve(&[Vec3::ZERO, Vec3::Y, Vec3::Y * 2.0], &[0.1], 1);

        let q = scene.add_geometry(quad).unwrap();
        scene.add_geometry(unused).unwrap();
        let c = scene.add_geometry(curves).unwrap();
        scene.add_object(Object::new(q)).unwrap();
        scene.add_object(Object::new(c)).unwrap();
        scene.add_object(Object::new(q)).unwrap();
        scene
    }

    #[test]
    fn test_pack_layout() {
        let pack = PackedPrimitives::from_scene(&scene());
        assert!(pack.validate().is_ok());
        assert_eq!(pack.len(), 4);
        assert_eq!(pack.geometry_prim_offset, vec![0, NO_NODE_OFFSET, 2]);
        assert_eq!(pack.object_node_offset, vec![0, 2, 0]);
        assert_eq!(pack.prim_type[3], PrimitiveType::Curve);
        assert_eq!(pack.prim_segment[3], 1);
        assert_eq!(pack.shader_flags_of(1), ShaderFlags::HAS_TRANSPARENT_SHADOW);
        assert_eq!(pack.triangle_vertices(1, 0.0)[1], Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(pack.curve_keys(3, 0.0)[1].y, 2.0);
    }

    #[test]
    fn test_buffer_slots_by_name() {
        for slot in BufferSlot::ALL {
            assert_eq!(slot.name().parse::<BufferSlot>(), Ok(slot));
        }
        assert_eq!(
            "prim_nonsense".parse::<BufferSlot>(),
            Err(PackError::UnknownSlot("prim_nonsense".into()))
        );

        let pack = PackedPrimitives::from_scene(&scene());
        assert_eq!(pack.byte_size(BufferSlot::TriVerts), 6 * 12);
        assert_eq!(pack.byte_size(BufferSlot::PrimIndex), 4 * 4);
        assert!(pack.total_bytes() > 0);
        assert_eq!(pack.tri_vert_floats().len(), 18);
    }

    #[test]
    fn test_validate_catches_dangling_object() {
        let mut pack = PackedPrimitives::from_scene(&scene());
        pack.prim_object[0] = 9;
        assert!(matches!(
            pack.validate(),
            Err(PackError::Dangling { what: "object", .. })
        ));

        let mut pack = PackedPrimitives::from_scene(&scene());
        pack.prim_shader.pop();
        assert!(matches!(pack.validate(), Err(PackError::LengthMismatch { .. })));
    }

    #[test]
    fn test_update_vertices_in_place() {
        let mut scene = scene();
        let mut pack = PackedPrimitives::from_scene(&scene);
        if let Geometry::Mesh(mesh) = &mut scene.geometries[0] {
            for p in &mut mesh.positions {
                p.z += 1.0;
            }
        }
        pack.update_vertices(&scene);
        assert_eq!(pack.triangle_vertices(0, 0.0)[0].z, 1.0);
    }
}
