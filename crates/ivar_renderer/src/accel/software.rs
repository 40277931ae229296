//! Two-level BVH traversal in software.
//!
//! Each geometry gets one bottom-level BVH over its primitives in object
//! space. Objects are instances of those trees under a top-level BVH over
//! their world bounds. Rays are carried into object space without
//! renormalising the direction, so hit distances stay world-space.

use std::sync::Arc;

use ivar_math::{Mat3, Mat4, Ray as MathRay};
use ivar_scene::{Object, ObjectFlags, ObjectTransform, Scene, Visibility};
use rayon::prelude::*;

use super::bvh::{BuildItem, BvhNode, Visit};
use super::pack::{PackedPrimitives, NO_NODE_OFFSET};
use super::primitive::{intersect_curve_segment, intersect_triangle, PrimitiveHit};
use super::{Accel, AccelError, AccelParams, LocalHits, ShadowHits};
use crate::device::BackendDevice;
use crate::filter::{FilterResult, IntersectContext, QueryKind};
use crate::intersection::Intersection;
use crate::progress::Progress;
use crate::ray::Ray;
use crate::sampling::LcgSampler;

/// Object-to-world placement of one instance.
#[derive(Debug, Clone)]
pub(super) enum Placement {
    Static { world_to_local: Mat4 },
    Motion(ObjectTransform),
}

impl Placement {
    pub(super) fn new(transform: &ObjectTransform) -> Self {
        if transform.is_motion() {
            Placement::Motion(transform.clone())
        } else {
            Placement::Static {
                world_to_local: transform.at(0.0).inverse(),
            }
        }
    }

    #[inline]
    pub(super) fn world_to_local(&self, time: f32) -> Mat4 {
        match self {
            Placement::Static { world_to_local } => *world_to_local,
            Placement::Motion(transform) => transform.at(time).inverse(),
        }
    }
}

#[derive(Debug, Clone)]
struct Instance {
    object: u32,
    geometry: usize,
    prim_offset: u32,
    placement: Placement,
    visibility: Visibility,
    negative_scale: bool,
    bounds: ivar_math::Aabb,
}

/// Counts that must match for a refit to reuse the current trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Topology {
    geometries: Vec<(usize, usize)>,
    objects: Vec<(usize, usize)>,
}

impl Topology {
    pub(super) fn of(scene: &Scene) -> Self {
        Self {
            geometries: scene
                .geometries
                .iter()
                .map(|g| (g.primitive_count(), g.motion_steps()))
                .collect(),
            objects: scene
                .objects
                .iter()
                .map(|o| (o.geometry, o.transform.motion_steps()))
                .collect(),
        }
    }
}

pub struct SoftwareAccel {
    params: AccelParams,
    device: Arc<BackendDevice>,
    pack: PackedPrimitives,
    geometry_bvhs: Vec<Option<BvhNode>>,
    instances: Vec<Instance>,
    top: BvhNode,
    topology: Option<Topology>,
    bytes: u64,
}

impl SoftwareAccel {
    pub fn new(params: AccelParams, device: Arc<BackendDevice>) -> Self {
        Self {
            params,
            device,
            pack: PackedPrimitives::default(),
            geometry_bvhs: Vec::new(),
            instances: Vec::new(),
            top: BvhNode::Empty,
            topology: None,
            bytes: 0,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn clear(&mut self) {
        self.pack = PackedPrimitives::default();
        self.geometry_bvhs.clear();
        self.instances.clear();
        self.top = BvhNode::Empty;
        self.topology = None;
        self.track_memory(0);
    }

    fn track_memory(&mut self, bytes: u64) {
        if self.bytes > 0 {
            self.device.memory.free(self.bytes);
        }
        if bytes > 0 {
            self.device.memory.alloc(bytes);
        }
        self.bytes = bytes;
    }

    fn estimated_bytes(&self) -> u64 {
        let nodes: usize = self
            .geometry_bvhs
            .iter()
            .flatten()
            .chain(std::iter::once(&self.top))
            .map(|bvh| bvh.leaf_count() * 2)
            .sum();
        (self.pack.total_bytes()
            + nodes * std::mem::size_of::<BvhNode>()
            + self.instances.len() * std::mem::size_of::<Instance>()) as u64
    }

    fn make_instance(&self, index: usize, object: &Object) -> Option<Instance> {
        let prim_offset = self.pack.object_node_offset[index];
        if prim_offset == NO_NODE_OFFSET {
            return None;
        }
        let bvh = self.geometry_bvhs.get(object.geometry)?.as_ref()?;
        Some(Instance {
            object: index as u32,
            geometry: object.geometry,
            prim_offset,
            placement: Placement::new(&object.transform),
            visibility: object.visibility,
            negative_scale: object.flags.contains(ObjectFlags::NEGATIVE_SCALE),
            bounds: object.transform.transform_bounds(&bvh.bounding_box()),
        })
    }

    fn intersect_prim(&self, prim: u32, ray: &MathRay, t_max: f32) -> Option<PrimitiveHit> {
        if self.pack.prim_type[prim as usize].is_curve() {
            let [k0, k1] = self.pack.curve_keys(prim, ray.time);
            intersect_curve_segment(ray.origin, ray.direction, 0.0, t_max, k0, k1)
        } else {
            let verts = self.pack.triangle_vertices(prim, ray.time);
            intersect_triangle(ray.origin, ray.direction, 0.0, t_max, verts)
        }
    }

    /// Walk both levels, passing every candidate through `ctx`.
    ///
    /// Returns the closest accepted hit. With `any_hit` the first accepted
    /// hit ends the traversal.
    fn traverse(
        &self,
        ray: &Ray,
        visibility: Visibility,
        ctx: &mut IntersectContext<'_>,
        any_hit: bool,
    ) -> Option<Intersection> {
        let world = ray.to_math();
        let mut t_max = ray.t;
        let mut closest = None;

        self.top.traverse(&world, 0.0, &mut t_max, &mut |index, t_max| {
            let instance = &self.instances[index as usize];
            if !instance.visibility.intersects(visibility) || ctx.skips_object(instance.object) {
                return Visit::Continue;
            }
            let Some(Some(bvh)) = self.geometry_bvhs.get(instance.geometry) else {
                return Visit::Continue;
            };

            let to_local = instance.placement.world_to_local(ray.time);
            let local = MathRay::new(
                to_local.transform_point3(ray.origin),
                to_local.transform_vector3(ray.direction),
                ray.time,
            );
            // Inverse transpose of local-to-world.
            let normal_matrix = Mat3::from_mat4(to_local).transpose();

            let finished = bvh.traverse(&local, 0.0, t_max, &mut |local_prim, t_max| {
                let prim = instance.prim_offset + local_prim;
                let Some(hit) = self.intersect_prim(prim, &local, *t_max) else {
                    return Visit::Continue;
                };
                let prim_type = self.pack.prim_type[prim as usize];
                let mut ng = normal_matrix * hit.ng;
                if instance.negative_scale && !prim_type.is_curve() {
                    ng = -ng;
                }
                let isect = Intersection {
                    t: hit.t,
                    u: hit.u,
                    v: hit.v,
                    prim,
                    object: instance.object,
                    prim_type,
                    segment: self.pack.prim_segment[prim as usize],
                    ng,
                };
                match ctx.filter(&isect, ray.direction) {
                    FilterResult::Accept => {
                        *t_max = isect.t;
                        closest = Some(isect);
                        if any_hit {
                            Visit::Stop
                        } else {
                            Visit::Continue
                        }
                    }
                    FilterResult::Ignore => Visit::Continue,
                    FilterResult::Terminate => Visit::Stop,
                }
            });
            if finished {
                Visit::Continue
            } else {
                Visit::Stop
            }
        });

        closest
    }

    fn context(&self, kind: QueryKind) -> IntersectContext<'_> {
        IntersectContext::new(kind, &self.pack)
            .with_curve_backface_culling(self.params.curve_backface_culling)
    }
}

impl Accel for SoftwareAccel {
    fn build(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError> {
        let device = Arc::clone(&self.device);
        let _guard = device.lock_build()?;
        scene.validate()?;

        let quality = self.params.build_quality();
        progress.set_status("Packing primitives");
        progress.set_total(scene.geometries.len() as u64 + 1);

        let pack = PackedPrimitives::from_scene(scene);
        pack.validate()?;

        progress.set_status(format!("Building BVH ({:?})", quality));
        let max_leaf_size = self.params.max_leaf_size;
        let geometry_bvhs = (0..scene.geometries.len())
            .into_par_iter()
            .map(|geom| {
                if progress.is_cancelled() {
                    return Err(AccelError::Cancelled);
                }
                let offset = pack.geometry_prim_offset[geom];
                if offset == NO_NODE_OFFSET {
                    return Ok(None);
                }
                let count = scene.geometries[geom].primitive_count() as u32;
                let items = (0..count)
                    .map(|i| BuildItem::new(i, pack.prim_bounds(offset + i)))
                    .collect();
                let bvh = BvhNode::build(items, quality, max_leaf_size);
                progress.add_completed(1);
                Ok(Some(bvh))
            })
            .collect::<Result<Vec<_>, _>>();

        let geometry_bvhs = match geometry_bvhs {
            Ok(bvhs) => bvhs,
            Err(err) => {
                log::warn!("BVH build cancelled");
                self.clear();
                return Err(err);
            }
        };
        if progress.is_cancelled() {
            log::warn!("BVH build cancelled before top level");
            self.clear();
            return Err(AccelError::Cancelled);
        }

        self.pack = pack;
        self.geometry_bvhs = geometry_bvhs;
        self.instances = scene
            .objects
            .iter()
            .enumerate()
            .filter_map(|(i, object)| self.make_instance(i, object))
            .collect();

        progress.set_status("Building top level");
        let items = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, inst)| BuildItem::new(i as u32, inst.bounds))
            .collect();
        self.top = BvhNode::build(items, quality, max_leaf_size);
        self.topology = Some(Topology::of(scene));
        progress.add_completed(1);

        let bytes = self.estimated_bytes();
        self.track_memory(bytes);

        log::info!(
            "Built {:?} BVH: {} primitives, {} instances, top depth {}, {} KiB",
            quality,
            self.pack.len(),
            self.instances.len(),
            self.top.depth(),
            bytes / 1024
        );
        Ok(())
    }

    fn refit(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError> {
        if self.topology.as_ref() != Some(&Topology::of(scene)) {
            log::debug!("Scene topology changed, rebuilding instead of refitting");
            return self.build(scene, progress);
        }

        let device = Arc::clone(&self.device);
        let _guard = device.lock_build()?;
        progress.set_status("Refitting BVH");

        self.pack.update_vertices(scene);
        let pack = &self.pack;
        self.geometry_bvhs
            .par_iter_mut()
            .enumerate()
            .for_each(|(geom, bvh)| {
                if let Some(bvh) = bvh {
                    let offset = pack.geometry_prim_offset[geom];
                    bvh.refit(&|i| pack.prim_bounds(offset + i));
                }
            });

        for instance in &mut self.instances {
            let object = &scene.objects[instance.object as usize];
            let local = self.geometry_bvhs[instance.geometry]
                .as_ref()
                .map(BvhNode::bounding_box)
                .unwrap_or(ivar_math::Aabb::EMPTY);
            instance.placement = Placement::new(&object.transform);
            instance.visibility = object.visibility;
            instance.negative_scale = object.flags.contains(ObjectFlags::NEGATIVE_SCALE);
            instance.bounds = object.transform.transform_bounds(&local);
        }
        let instances = &self.instances;
        self.top.refit(&|i| instances[i as usize].bounds);

        log::debug!("Refit {} primitives", self.pack.len());
        Ok(())
    }

    fn intersect(&self, ray: &Ray, visibility: Visibility) -> Option<Intersection> {
        let mut ctx = self.context(QueryKind::Regular);
        self.traverse(ray, visibility, &mut ctx, false)
    }

    fn occluded(&self, ray: &Ray, visibility: Visibility) -> bool {
        let mut ctx = self.context(QueryKind::Regular);
        self.traverse(ray, visibility, &mut ctx, true).is_some()
    }

    fn intersect_all(&self, ray: &Ray, visibility: Visibility, max_hits: usize) -> ShadowHits {
        let mut ctx = self.context(QueryKind::ShadowAll { max_hits });
        self.traverse(ray, visibility, &mut ctx, false);
        ShadowHits {
            hits: ctx.hits,
            num_hits: ctx.num_hits,
            opaque: ctx.opaque_hit.is_some(),
        }
    }

    fn intersect_volume_all(
        &self,
        ray: &Ray,
        visibility: Visibility,
        max_hits: usize,
    ) -> Vec<Intersection> {
        let mut ctx = self.context(QueryKind::VolumeAll { max_hits });
        self.traverse(ray, visibility, &mut ctx, false);
        ctx.hits.into_vec()
    }

    fn intersect_local(
        &self,
        ray: &Ray,
        object: u32,
        sampler: &mut LcgSampler,
        max_hits: usize,
    ) -> LocalHits {
        let mut ctx = self
            .context(QueryKind::Local { object, max_hits })
            .with_sampler(sampler);
        self.traverse(ray, Visibility::ALL, &mut ctx, false);
        LocalHits {
            hits: ctx.hits,
            num_hits: ctx.num_hits,
        }
    }

    fn pack(&self) -> &PackedPrimitives {
        &self.pack
    }

    fn device(&self) -> &Arc<BackendDevice> {
        &self.device
    }
}

impl Drop for SoftwareAccel {
    fn drop(&mut self) {
        self.track_memory(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKey, DeviceManager};
    use crate::intersection::PrimitiveType;
    use ivar_math::{DecomposedTransform, Vec3};
    use ivar_scene::{Curves, Geometry, Mesh, ShaderFlags};

    /// Unit quad spanning [-1, 1]^2 at z = -1.
    fn quad(shader: u32) -> Mesh {
        Mesh::new(
            vec![
                Vec3::new(-1.0, -1.0, -1.0),
                Vec3::new(1.0, -1.0, -1.0),
                Vec3::new(1.0, 1.0, -1.0),
                Vec3::new(-1.0, 1.0, -1.0),
            ],
            vec![0, 1, 2, 0, 2, 3],
        )
        .with_shader(shader)
    }

    fn accel() -> SoftwareAccel {
        let device = DeviceManager::new().acquire(DeviceKey::SOFTWARE).unwrap();
        SoftwareAccel::new(AccelParams::default(), device)
    }

    fn built(scene: &Scene) -> SoftwareAccel {
        let mut accel = accel();
        accel.build(scene, &Progress::new()).unwrap();
        accel
    }

    fn single_quad_scene() -> Scene {
        let mut scene = Scene::new();
        let opaque = scene.add_shader("opaque", ShaderFlags::empty());
        let q = scene.add_geometry(quad(opaque)).unwrap();
        scene.add_object(Object::new(q)).unwrap();
        scene
    }

    fn down(x: f32, y: f32) -> Ray {
        Ray::new(Vec3::new(x, y, 0.0), -Vec3::Z, 0.0)
    }

    #[test]
    fn test_miss() {
        let accel = built(&single_quad_scene());
        let up = Ray::new(Vec3::ZERO, Vec3::Z, 0.0);
        assert!(accel.intersect(&up, Visibility::ALL).is_none());
        assert!(!accel.occluded(&up, Visibility::ALL));
        assert!(accel.intersect(&down(3.0, 0.0), Visibility::ALL).is_none());
    }

    #[test]
    fn test_closest_hit_values() {
        let accel = built(&single_quad_scene());
        let hit = accel.intersect(&down(0.5, -0.5), Visibility::ALL).unwrap();
        assert!((hit.t - 1.0).abs() < 1e-5);
        assert_eq!(hit.prim, 0);
        assert_eq!(hit.object, 0);
        assert!((hit.u - 0.5).abs() < 1e-5);
        assert!((hit.v - 0.25).abs() < 1e-5);
        assert!(hit.ng.normalize().abs_diff_eq(Vec3::Z, 1e-5));
        assert!(accel.occluded(&down(0.5, -0.5), Visibility::ALL));
    }

    #[test]
    fn test_ray_length_limits_hits() {
        let accel = built(&single_quad_scene());
        let short = Ray::segment(Vec3::new(0.5, -0.5, 0.0), -Vec3::Z, 0.5, 0.0);
        assert!(accel.intersect(&short, Visibility::ALL).is_none());
        assert!(!accel.occluded(&short, Visibility::ALL));
    }

    #[test]
    fn test_empty_scene() {
        let accel = built(&Scene::new());
        assert!(accel.intersect(&down(0.0, 0.0), Visibility::ALL).is_none());
        assert_eq!(accel.instance_count(), 0);
    }

    #[test]
    fn test_instance_hits_use_world_distance() {
        let mut scene = single_quad_scene();
        let transform =
            Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)) * Mat4::from_scale(Vec3::splat(2.0));
        scene
            .add_object(Object::new(0).with_transform(transform))
            .unwrap();
        let accel = built(&scene);

        let hit = accel.intersect(&down(6.0, -1.0), Visibility::ALL).unwrap();
        assert_eq!(hit.object, 1);
        assert!((hit.t - 2.0).abs() < 1e-5);
        assert!((hit.u - 0.5).abs() < 1e-5);
        assert!((hit.v - 0.25).abs() < 1e-5);

        // An unnormalized direction scales t the same way in both spaces.
        let fast = Ray::new(Vec3::new(6.0, -1.0, 0.0), -Vec3::Z * 2.0, 0.0);
        let hit = accel.intersect(&fast, Visibility::ALL).unwrap();
        assert!((hit.t - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_mirrored_instance_keeps_winding_normal() {
        let mut scene = Scene::new();
        let shader = scene.add_shader("s", ShaderFlags::empty());
        let q = scene.add_geometry(quad(shader)).unwrap();
        scene
            .add_object(Object::new(q).with_transform(Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0))))
            .unwrap();
        let accel = built(&scene);
        let hit = accel.intersect(&down(0.5, 0.5), Visibility::ALL).unwrap();
        // Mirroring reverses winding, so the geometric normal faces away.
        assert!(hit.ng.z < 0.0);
    }

    #[test]
    fn test_visibility_mask() {
        let mut scene = Scene::new();
        let shader = scene.add_shader("s", ShaderFlags::empty());
        let q = scene.add_geometry(quad(shader)).unwrap();
        scene
            .add_object(Object::new(q).with_visibility(Visibility::CAMERA))
            .unwrap();
        let accel = built(&scene);
        assert!(accel.intersect(&down(0.5, 0.5), Visibility::CAMERA).is_some());
        assert!(accel.intersect(&down(0.5, 0.5), Visibility::SHADOW).is_none());
        assert!(!accel.occluded(&down(0.5, 0.5), Visibility::SHADOW));
    }

    #[test]
    fn test_object_motion() {
        let mut scene = Scene::new();
        let shader = scene.add_shader("s", ShaderFlags::empty());
        let q = scene.add_geometry(quad(shader)).unwrap();
        let end = DecomposedTransform {
            translation: Vec3::new(10.0, 0.0, 0.0),
            ..DecomposedTransform::IDENTITY
        };
        scene
            .add_object(Object::new(q).with_motion(vec![DecomposedTransform::IDENTITY, end]))
            .unwrap();
        let accel = built(&scene);

        let mut ray = down(10.5, 0.5);
        ray.time = 1.0;
        assert!(accel.intersect(&ray, Visibility::ALL).is_some());
        ray.time = 0.0;
        assert!(accel.intersect(&ray, Visibility::ALL).is_none());
        assert!(accel.intersect(&down(0.5, 0.5), Visibility::ALL).is_some());
    }

    #[test]
    fn test_deformation_motion() {
        let mut scene = Scene::new();
        let shader = scene.add_shader("s", ShaderFlags::empty());
        let start = quad(shader);
        let lowered: Vec<Vec3> = start.positions.iter().map(|p| *p - Vec3::Z).collect();
        let mesh = start.clone().with_motion(vec![start.positions.clone(), lowered]);
        let m = scene.add_geometry(mesh).unwrap();
        scene.add_object(Object::new(m)).unwrap();
        let accel = built(&scene);

        let mut ray = down(0.5, -0.5);
        ray.time = 0.5;
        let hit = accel.intersect(&ray, Visibility::ALL).unwrap();
        assert!((hit.t - 1.5).abs() < 1e-4);
        assert!(hit.prim_type.is_motion());
    }

    #[test]
    fn test_curve_hit() {
        let mut scene = Scene::new();
        let shader = scene.add_shader("hair", ShaderFlags::empty());
        let mut curves = Curves::new();
        curves.add_curve(
            &[Vec3::new(0.0, -1.0, -1.0), Vec3::new(0.0, 1.0, -1.0)],
            &[0.1],
            shader,
        );
        let c = scene.add_geometry(curves).unwrap();
        scene.add_object(Object::new(c)).unwrap();
        let accel = built(&scene);

        let hit = accel.intersect(&down(0.0, 0.5), Visibility::ALL).unwrap();
        assert_eq!(hit.prim_type, PrimitiveType::Curve);
        assert!((hit.t - 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_refit_is_idempotent() {
        let mut scene = single_quad_scene();
        scene
            .add_object(Object::new(0).with_transform(Mat4::from_translation(Vec3::X * 3.0)))
            .unwrap();
        let mut accel = built(&scene);

        let rays: Vec<Ray> = (0..20)
            .flat_map(|i| (0..5).map(move |j| down(-1.5 + i as f32 * 0.29, -1.2 + j as f32 * 0.5)))
            .collect();
        let before: Vec<_> = rays.iter().map(|r| accel.intersect(r, Visibility::ALL)).collect();
        accel.refit(&scene, &Progress::new()).unwrap();
        let after: Vec<_> = rays.iter().map(|r| accel.intersect(r, Visibility::ALL)).collect();
        assert_eq!(before, after);
        assert!(before.iter().any(Option::is_some));
    }

    #[test]
    fn test_refit_follows_moved_vertices() {
        let mut scene = single_quad_scene();
        let mut accel = built(&scene);
        let shader_flags = accel.pack().shader_flags.clone();
        if let Geometry::Mesh(mesh) = &mut scene.geometries[0] {
            for p in &mut mesh.positions {
                p.z -= 2.0;
            }
            mesh.update_bounds();
        }
        accel.refit(&scene, &Progress::new()).unwrap();
        let hit = accel.intersect(&down(0.5, -0.5), Visibility::ALL).unwrap();
        assert!((hit.t - 3.0).abs() < 1e-5);
        assert_eq!(accel.pack().shader_flags, shader_flags);
    }

    #[test]
    fn test_refit_rebuilds_when_counts_change() {
        let mut scene = single_quad_scene();
        let mut accel = built(&scene);
        scene
            .add_object(Object::new(0).with_transform(Mat4::from_translation(Vec3::X * 4.0)))
            .unwrap();
        accel.refit(&scene, &Progress::new()).unwrap();
        assert_eq!(accel.instance_count(), 2);
        assert_eq!(
            accel.intersect(&down(4.5, 0.5), Visibility::ALL).map(|h| h.object),
            Some(1)
        );
    }

    #[test]
    fn test_cancelled_build_leaves_nothing() {
        let scene = single_quad_scene();
        let mut accel = accel();
        let progress = Progress::new();
        progress.cancel();
        assert!(matches!(
            accel.build(&scene, &progress),
            Err(AccelError::Cancelled)
        ));
        assert!(accel.intersect(&down(0.5, 0.5), Visibility::ALL).is_none());
        assert!(accel.pack().is_empty());
    }

    #[test]
    fn test_build_fails_on_errored_device() {
        let scene = single_quad_scene();
        let mut accel = accel();
        accel.device().set_error("lost");
        assert!(matches!(
            accel.build(&scene, &Progress::new()),
            Err(AccelError::Device(_))
        ));
    }

    #[test]
    fn test_memory_is_accounted() {
        let accel = built(&single_quad_scene());
        let (alloc, free) = accel.device().memory.pending();
        assert!(alloc > 0);
        assert_eq!(free, 0);
        let device = Arc::clone(accel.device());
        drop(accel);
        let (alloc, free) = device.memory.pending();
        assert_eq!(alloc, free);
    }

    fn layered_scene(flags: [ShaderFlags; 2]) -> Scene {
        let mut scene = Scene::new();
        for (i, f) in flags.into_iter().enumerate() {
            let shader = scene.add_shader(format!("layer{}", i), f);
            let q = scene.add_geometry(quad(shader)).unwrap();
            scene
                .add_object(
                    Object::new(q).with_transform(Mat4::from_translation(-Vec3::Z * i as f32 * 2.0)),
                )
                .unwrap();
        }
        scene
    }

    #[test]
    fn test_shadow_all_records_transparent_and_stops_at_opaque() {
        let scene = layered_scene([ShaderFlags::HAS_TRANSPARENT_SHADOW, ShaderFlags::empty()]);
        let accel = built(&scene);
        let hits = accel.intersect_all(&down(0.5, 0.5), Visibility::SHADOW, 4);
        assert!(hits.opaque);
        assert!(hits.blocked());

        let scene = layered_scene([ShaderFlags::HAS_TRANSPARENT_SHADOW; 2]);
        let accel = built(&scene);
        let hits = accel.intersect_all(&down(0.5, 0.5), Visibility::SHADOW, 4);
        assert!(!hits.blocked());
        assert_eq!(hits.hits.len(), 2);
        assert_eq!(hits.num_hits, 2);

        let capped = accel.intersect_all(&down(0.5, 0.5), Visibility::SHADOW, 1);
        assert!(capped.blocked());
        assert_eq!(capped.hits.len(), 1);
    }

    #[test]
    fn test_volume_all_keeps_volume_objects() {
        let scene = layered_scene([ShaderFlags::empty(), ShaderFlags::HAS_VOLUME]);
        let accel = built(&scene);
        let hits = accel.intersect_volume_all(&down(0.5, 0.5), Visibility::ALL, 4);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object, 1);
        assert!((hits[0].t - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_local_query_sees_one_object() {
        let scene = layered_scene([ShaderFlags::empty(); 2]);
        let accel = built(&scene);
        let mut sampler = LcgSampler::new(7);
        let local = accel.intersect_local(&down(0.5, 0.5), 1, &mut sampler, 4);
        assert_eq!(local.num_hits, 1);
        assert_eq!(local.hits[0].object, 1);

        let miss = accel.intersect_local(&down(5.0, 0.5), 0, &mut sampler, 4);
        assert_eq!(miss.num_hits, 0);
    }
    #[test]
    fn test_random_soup_matches_brute_force() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x1ea7);
        let point = |rng: &mut StdRng| {
            Vec3::new(
                rng.gen_range(-4.0..4.0),
                rng.gen_range(-4.0..4.0),
                rng.gen_range(-4.0..4.0),
            )
        };
        let mut positions = Vec::new();
        for _ in 0..200 {
            let center = point(&mut rng);
            for _ in 0..3 {
                positions.push(center + point(&mut rng) * 0.15);
            }
        }
        let indices: Vec<u32> = (0..positions.len() as u32).collect();
        let triangles: Vec<[Vec3; 3]> = positions.chunks_exact(3).map(|t| [t[0], t[1], t[2]]).collect();

        let mut scene = Scene::new();
        let shader = scene.add_shader("opaque", ShaderFlags::empty());
        let g = scene.add_geometry(Mesh::new(positions, indices).with_shader(shader)).unwrap();
        scene.add_object(Object::new(g)).unwrap();

        for params in [
            AccelParams::default(),
            AccelParams::default().with_dynamic(true),
            AccelParams::default().with_spatial_split(true),
        ] {
            let device = DeviceManager::new().acquire(DeviceKey::SOFTWARE).unwrap();
            let mut accel = SoftwareAccel::new(params, device);
            accel.build(&scene, &Progress::new()).unwrap();

            for _ in 0..500 {
                let origin = point(&mut rng) * 1.5;
                let direction = (point(&mut rng) - origin).normalize();
                let ray = Ray::new(origin, direction, 0.0);

                let expected = triangles
                    .iter()
                    .filter_map(|&tri| intersect_triangle(origin, direction, 0.0, f32::MAX, tri))
                    .map(|hit| hit.t)
                    .fold(None, |best: Option<f32>, t| Some(best.map_or(t, |b| b.min(t))));
                let found = accel.intersect(&ray, Visibility::ALL).map(|hit| hit.t);
                match (expected, found) {
                    (Some(a), Some(b)) => assert!((a - b).abs() < 1e-4, "{:?}: {} != {}", params, a, b),
                    (None, None) => {}
                    other => panic!("{:?}: brute force and BVH disagree: {:?}", params, other),
                }
                assert_eq!(found.is_some(), accel.occluded(&ray, Visibility::ALL));
            }
        }
    }
}
