//! Embree 4 backend with the same two-level layout as the software BVH.
//!
//! Manual FFI bindings to the Embree 4 C API, limited to what the renderer
//! needs: triangle and round linear curve geometry with time steps,
//! instances with per-step transforms, and argument filter callbacks that
//! route every candidate hit through `IntersectContext`.

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use ivar_math::{Mat3, Vec3};
use ivar_scene::{ObjectFlags, ObjectTransform, Scene, Visibility};

use super::bvh::BuildQuality;
use super::pack::{PackedPrimitives, NO_NODE_OFFSET};
use super::software::{Placement, Topology};
use super::{Accel, AccelError, AccelParams, LocalHits, ShadowHits};
use crate::device::BackendDevice;
use crate::filter::{FilterResult, IntersectContext, QueryKind};
use crate::intersection::{Intersection, PrimitiveType};
use crate::progress::Progress;
use crate::ray::Ray;
use crate::sampling::LcgSampler;

// ============================================================================
// Embree FFI Bindings
// ============================================================================

#[allow(non_camel_case_types)]
type RTCDevice = *mut c_void;

#[allow(non_camel_case_types)]
type RTCScene = *mut c_void;

#[allow(non_camel_case_types)]
type RTCGeometry = *mut c_void;

// From rtcore_geometry.h
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(dead_code)]
enum RTCGeometryType {
    Triangle = 0,
    RoundLinearCurve = 16,
    Instance = 121,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RTCBufferType {
    Index = 0,
    Vertex = 1,
}

// From rtcore_common.h
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RTCFormat {
    UInt = 0x5001,
    UInt3 = 0x5003,
    Float3 = 0x9003,
    Float4 = 0x9004,
    Float4x4ColumnMajor = 0x9244,
}

const RTC_SCENE_FLAG_DYNAMIC: u32 = 1 << 0;
const RTC_SCENE_FLAG_ROBUST: u32 = 1 << 2;
const RTC_SCENE_FLAG_FILTER_FUNCTION_IN_ARGUMENTS: u32 = 1 << 3;

const RTC_BUILD_QUALITY_LOW: u32 = 0;
const RTC_BUILD_QUALITY_MEDIUM: u32 = 1;
const RTC_BUILD_QUALITY_HIGH: u32 = 2;
const RTC_BUILD_QUALITY_REFIT: u32 = 3;

const RTC_RAY_QUERY_FLAG_INVOKE_ARGUMENT_FILTER: u32 = 1 << 1;
const RTC_FEATURE_FLAG_ALL: u32 = 0xFFFF_FFFF;

const RTC_INVALID_GEOMETRY_ID: u32 = 0xFFFF_FFFF;

#[repr(C, align(16))]
#[derive(Debug, Copy, Clone)]
struct RTCRay {
    org_x: f32,
    org_y: f32,
    org_z: f32,
    tnear: f32,

    dir_x: f32,
    dir_y: f32,
    dir_z: f32,
    time: f32,

    tfar: f32,
    mask: u32,
    id: u32,
    flags: u32,
}

#[repr(C, align(16))]
#[derive(Debug, Copy, Clone)]
struct RTCHit {
    ng_x: f32,
    ng_y: f32,
    ng_z: f32,

    u: f32,
    v: f32,

    prim_id: u32,
    geom_id: u32,
    inst_id: [u32; 1],
}

#[repr(C, align(16))]
#[derive(Debug, Copy, Clone)]
struct RTCRayHit {
    ray: RTCRay,
    hit: RTCHit,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct RTCRayQueryContext {
    inst_id: [u32; 1],
}

#[repr(C)]
struct RTCFilterFunctionNArguments {
    valid: *mut i32,
    geometry_user_ptr: *mut c_void,
    context: *mut RTCRayQueryContext,
    ray: *mut RTCRay,
    hit: *mut RTCHit,
    n: u32,
}

type RTCFilterFunctionN = unsafe extern "C" fn(args: *const RTCFilterFunctionNArguments);
type RTCProgressMonitorFunction = unsafe extern "C" fn(ptr: *mut c_void, n: f64) -> bool;

/// Layout shared by `RTCIntersectArguments` and `RTCOccludedArguments`.
#[repr(C)]
struct RTCQueryArguments {
    flags: u32,
    feature_mask: u32,
    context: *mut RTCRayQueryContext,
    filter: Option<RTCFilterFunctionN>,
    callback: *const c_void,
}

#[link(name = "embree4")]
extern "C" {
    fn rtcNewDevice(config: *const c_char) -> RTCDevice;
    fn rtcReleaseDevice(device: RTCDevice);
    fn rtcGetDeviceError(device: RTCDevice) -> i32;

    fn rtcNewScene(device: RTCDevice) -> RTCScene;
    fn rtcReleaseScene(scene: RTCScene);
    fn rtcCommitScene(scene: RTCScene);
    fn rtcSetSceneFlags(scene: RTCScene, flags: u32);
    fn rtcSetSceneBuildQuality(scene: RTCScene, quality: u32);
    fn rtcSetSceneProgressMonitorFunction(
        scene: RTCScene,
        progress: Option<RTCProgressMonitorFunction>,
        ptr: *mut c_void,
    );

    fn rtcNewGeometry(device: RTCDevice, geom_type: RTCGeometryType) -> RTCGeometry;
    fn rtcReleaseGeometry(geom: RTCGeometry);
    fn rtcCommitGeometry(geom: RTCGeometry);
    fn rtcAttachGeometry(scene: RTCScene, geom: RTCGeometry) -> u32;
    fn rtcSetGeometryBuildQuality(geom: RTCGeometry, quality: u32);
    fn rtcSetGeometryTimeStepCount(geom: RTCGeometry, time_step_count: u32);
    fn rtcSetGeometryMask(geom: RTCGeometry, mask: u32);

    fn rtcSetNewGeometryBuffer(
        geom: RTCGeometry,
        buffer_type: u32,
        slot: u32,
        format: u32,
        byte_stride: usize,
        item_count: usize,
    ) -> *mut c_void;
    fn rtcGetGeometryBufferData(geom: RTCGeometry, buffer_type: u32, slot: u32) -> *mut c_void;
    fn rtcUpdateGeometryBuffer(geom: RTCGeometry, buffer_type: u32, slot: u32);

    fn rtcSetGeometryInstancedScene(geom: RTCGeometry, scene: RTCScene);
    fn rtcSetGeometryTransform(geom: RTCGeometry, time_step: u32, format: u32, xfm: *const f32);

    fn rtcIntersect1(scene: RTCScene, rayhit: *mut RTCRayHit, args: *const RTCQueryArguments);
    fn rtcOccluded1(scene: RTCScene, ray: *mut RTCRay, args: *const RTCQueryArguments);
}

fn error_name(code: i32) -> &'static str {
    match code {
        1 => "RTC_ERROR_UNKNOWN",
        2 => "RTC_ERROR_INVALID_ARGUMENT",
        3 => "RTC_ERROR_INVALID_OPERATION",
        4 => "RTC_ERROR_OUT_OF_MEMORY",
        5 => "RTC_ERROR_UNSUPPORTED_CPU",
        6 => "RTC_ERROR_CANCELLED",
        _ => "UNKNOWN_ERROR",
    }
}

fn build_quality(quality: BuildQuality) -> u32 {
    match quality {
        BuildQuality::Low => RTC_BUILD_QUALITY_LOW,
        BuildQuality::Medium => RTC_BUILD_QUALITY_MEDIUM,
        BuildQuality::High => RTC_BUILD_QUALITY_HIGH,
    }
}

// ============================================================================
// Native device
// ============================================================================

/// Owned `RTCDevice` handle, created once per `BackendDevice`.
pub struct NativeDevice {
    handle: RTCDevice,
}

impl NativeDevice {
    pub fn create() -> Result<Self, String> {
        // SAFETY: a null config selects Embree's defaults.
        let handle = unsafe { rtcNewDevice(std::ptr::null()) };
        if handle.is_null() {
            // SAFETY: a null device queries the thread-local creation error.
            let code = unsafe { rtcGetDeviceError(std::ptr::null_mut()) };
            return Err(format!("rtcNewDevice failed: {}", error_name(code)));
        }
        Ok(Self { handle })
    }

    fn check(&self, what: &str) -> Result<(), AccelError> {
        // SAFETY: handle is a live device.
        let code = unsafe { rtcGetDeviceError(self.handle) };
        if code == 0 {
            Ok(())
        } else {
            Err(AccelError::Device(format!(
                "Embree error after {}: {} ({})",
                what,
                code,
                error_name(code)
            )))
        }
    }
}

impl std::fmt::Debug for NativeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDevice")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        // SAFETY: every scene built on this device holds an Arc to its owner.
        unsafe { rtcReleaseDevice(self.handle) }
    }
}

// SAFETY: Embree devices are internally synchronized.
unsafe impl Send for NativeDevice {}
unsafe impl Sync for NativeDevice {}

// ============================================================================
// Acceleration structure
// ============================================================================

/// One bottom-level Embree scene holding a single geometry.
struct GeometrySlot {
    scene: RTCScene,
    geom: RTCGeometry,
    prim_type: PrimitiveType,
    geometry: usize,
    prim_offset: u32,
    prim_count: usize,
    steps: usize,
}

/// One instance in the top-level scene, indexed by its Embree geometry id.
struct InstanceSlot {
    geom: RTCGeometry,
    object: u32,
    prim_offset: u32,
    placement: Placement,
    negative_scale: bool,
}

pub struct EmbreeAccel {
    params: AccelParams,
    device: Arc<BackendDevice>,
    pack: PackedPrimitives,
    geometries: Vec<Option<GeometrySlot>>,
    instances: Vec<InstanceSlot>,
    top: RTCScene,
    topology: Option<Topology>,
    bytes: u64,
}

// SAFETY: Embree scenes are read-only and thread-safe after rtcCommitScene;
// mutation only happens through `&mut self` under the device build lock.
unsafe impl Send for EmbreeAccel {}
unsafe impl Sync for EmbreeAccel {}

enum Outcome {
    Closest(Option<Intersection>),
    Occluded(bool),
}

/// Query state handed to the filter callback. `rtc` must stay first so the
/// context pointer Embree passes back can be cast to this type.
#[repr(C)]
struct QueryContext<'a, 'b> {
    rtc: RTCRayQueryContext,
    accel: &'a EmbreeAccel,
    filter: &'a mut IntersectContext<'b>,
    direction: Vec3,
}

unsafe extern "C" fn filter_hit(args: *const RTCFilterFunctionNArguments) {
    // SAFETY: Embree passes the context given to rtcIntersect1/rtcOccluded1
    // and a single ray/hit pair for the 1-wide queries used here.
    let args = &*args;
    let ctx = &mut *(args.context as *mut QueryContext<'_, '_>);
    let ray = &*args.ray;
    let hit = &*args.hit;

    let verdict = match ctx.accel.native_hit(ray, hit) {
        Some(isect) => ctx.filter.filter(&isect, ctx.direction),
        None => FilterResult::Ignore,
    };
    if verdict == FilterResult::Ignore {
        *args.valid = 0;
    }
}

unsafe extern "C" fn monitor_progress(ptr: *mut c_void, _fraction: f64) -> bool {
    // SAFETY: set to a live `Progress` for the duration of one commit.
    let progress = &*(ptr as *const Progress);
    !progress.is_cancelled()
}

impl EmbreeAccel {
    pub fn new(params: AccelParams, device: Arc<BackendDevice>) -> Result<Self, AccelError> {
        if device.native.is_none() {
            return Err(AccelError::BackendUnavailable(
                device
                    .error()
                    .unwrap_or_else(|| "no Embree device".to_string()),
            ));
        }
        Ok(Self {
            params,
            device,
            pack: PackedPrimitives::default(),
            geometries: Vec::new(),
            instances: Vec::new(),
            top: std::ptr::null_mut(),
            topology: None,
            bytes: 0,
        })
    }

    fn release(&mut self) {
        // SAFETY: handles were created by this accel and are released once.
        unsafe {
            for instance in self.instances.drain(..) {
                rtcReleaseGeometry(instance.geom);
            }
            if !self.top.is_null() {
                rtcReleaseScene(self.top);
                self.top = std::ptr::null_mut();
            }
            for slot in self.geometries.drain(..).flatten() {
                rtcReleaseGeometry(slot.geom);
                rtcReleaseScene(slot.scene);
            }
        }
        self.pack = PackedPrimitives::default();
        self.topology = None;
        if self.bytes > 0 {
            self.device.memory.free(self.bytes);
            self.bytes = 0;
        }
    }

    /// Copy one geometry's vertex data from the pack into its Embree buffers.
    ///
    /// # Safety
    /// `slot.geom` must have a vertex buffer per time step sized for `slot`.
    unsafe fn write_vertices(pack: &PackedPrimitives, slot: &GeometrySlot) {
        let curve = slot.prim_type.is_curve();
        let per_prim = if curve { 2 } else { 3 };
        for step in 0..slot.steps {
            let data = rtcGetGeometryBufferData(slot.geom, RTCBufferType::Vertex as u32, step as u32)
                as *mut [f32; 4];
            let verts = std::slice::from_raw_parts_mut(data, slot.prim_count * per_prim);
            for i in 0..slot.prim_count {
                let base = pack.prim_verts[slot.prim_offset as usize + i] as usize;
                for k in 0..per_prim {
                    verts[i * per_prim + k] = if curve {
                        pack.curve_keys[base + step * 2 + k].to_array()
                    } else {
                        pack.tri_verts[base + step * 3 + k].extend(0.0).to_array()
                    };
                }
            }
        }
    }

    fn build_geometry(
        &self,
        native: &NativeDevice,
        geometry: usize,
        quality: BuildQuality,
    ) -> Result<Option<GeometrySlot>, AccelError> {
        let prim_offset = self.pack.geometry_prim_offset[geometry];
        if prim_offset == NO_NODE_OFFSET {
            return Ok(None);
        }
        let steps = self.pack.geometry_motion_steps[geometry] as usize;
        let prim_count = self
            .pack
            .prim_geometry
            .iter()
            .skip(prim_offset as usize)
            .take_while(|&&g| g as usize == geometry)
            .count();
        let prim_type = self.pack.prim_type[prim_offset as usize];
        let curve = prim_type.is_curve();

        // SAFETY: all handles come from `native`; buffers are allocated by
        // Embree with the sizes written below.
        unsafe {
            let kind = if curve {
                RTCGeometryType::RoundLinearCurve
            } else {
                RTCGeometryType::Triangle
            };
            let geom = rtcNewGeometry(native.handle, kind);
            if geom.is_null() {
                native.check("rtcNewGeometry")?;
                return Err(AccelError::Device("rtcNewGeometry returned null".into()));
            }
            rtcSetGeometryBuildQuality(geom, build_quality(quality));
            if steps > 1 {
                rtcSetGeometryTimeStepCount(geom, steps as u32);
            }

            let (per_prim, format) = if curve {
                (2, RTCFormat::Float4)
            } else {
                (3, RTCFormat::Float3)
            };
            for step in 0..steps {
                rtcSetNewGeometryBuffer(
                    geom,
                    RTCBufferType::Vertex as u32,
                    step as u32,
                    format as u32,
                    16,
                    prim_count * per_prim,
                );
            }
            native.check("allocating vertex buffers")?;

            if curve {
                let index = rtcSetNewGeometryBuffer(
                    geom,
                    RTCBufferType::Index as u32,
                    0,
                    RTCFormat::UInt as u32,
                    4,
                    prim_count,
                ) as *mut u32;
                native.check("allocating curve index buffer")?;
                for (i, first) in std::slice::from_raw_parts_mut(index, prim_count)
                    .iter_mut()
                    .enumerate()
                {
                    *first = (i * 2) as u32;
                }
            } else {
                let index = rtcSetNewGeometryBuffer(
                    geom,
                    RTCBufferType::Index as u32,
                    0,
                    RTCFormat::UInt3 as u32,
                    12,
                    prim_count,
                ) as *mut [u32; 3];
                native.check("allocating triangle index buffer")?;
                for (i, tri) in std::slice::from_raw_parts_mut(index, prim_count)
                    .iter_mut()
                    .enumerate()
                {
                    let base = (i * 3) as u32;
                    *tri = [base, base + 1, base + 2];
                }
            }

            let slot = GeometrySlot {
                scene: rtcNewScene(native.handle),
                geom,
                prim_type,
                geometry,
                prim_offset,
                prim_count,
                steps,
            };
            Self::write_vertices(&self.pack, &slot);
            rtcCommitGeometry(geom);

            let mut flags = RTC_SCENE_FLAG_FILTER_FUNCTION_IN_ARGUMENTS | RTC_SCENE_FLAG_ROBUST;
            if self.params.dynamic {
                flags |= RTC_SCENE_FLAG_DYNAMIC;
            }
            rtcSetSceneFlags(slot.scene, flags);
            rtcSetSceneBuildQuality(slot.scene, build_quality(quality));
            rtcAttachGeometry(slot.scene, geom);
            rtcCommitScene(slot.scene);
            native.check("committing geometry scene")?;
            log::debug!(
                "Embree geometry {}: {} {:?} primitives, {} steps",
                slot.geometry,
                slot.prim_count,
                slot.prim_type,
                slot.steps
            );
            Ok(Some(slot))
        }
    }

    /// # Safety
    /// `geom` must be a live instance geometry.
    unsafe fn set_instance_transform(geom: RTCGeometry, transform: &ObjectTransform) {
        match transform {
            ObjectTransform::Motion(steps) if transform.is_motion() => {
                rtcSetGeometryTimeStepCount(geom, steps.len() as u32);
                for (step, key) in steps.iter().enumerate() {
                    let m = key.to_mat4().to_cols_array();
                    rtcSetGeometryTransform(
                        geom,
                        step as u32,
                        RTCFormat::Float4x4ColumnMajor as u32,
                        m.as_ptr(),
                    );
                }
            }
            _ => {
                let m = transform.at(0.0).to_cols_array();
                rtcSetGeometryTransform(geom, 0, RTCFormat::Float4x4ColumnMajor as u32, m.as_ptr());
            }
        }
    }

    /// Commit `scene`, cancelling through the progress monitor.
    fn commit_with_progress(&self, scene: RTCScene, progress: &Progress) {
        // SAFETY: the monitor pointer is cleared before `progress` goes out of scope.
        unsafe {
            rtcSetSceneProgressMonitorFunction(
                scene,
                Some(monitor_progress),
                progress as *const Progress as *mut c_void,
            );
            rtcCommitScene(scene);
            rtcSetSceneProgressMonitorFunction(scene, None, std::ptr::null_mut());
        }
    }

    fn build_locked(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError> {
        let quality = self.params.build_quality();
        progress.set_status("Packing primitives");
        progress.set_total(scene.geometries.len() as u64 + 1);
        self.pack = PackedPrimitives::from_scene(scene);
        self.pack.validate()?;

        progress.set_status(format!("Building Embree BVH ({:?})", quality));
        let device = Arc::clone(&self.device);
        let native = device
            .native
            .as_ref()
            .ok_or_else(|| AccelError::BackendUnavailable("no Embree device".into()))?;

        for geometry in 0..scene.geometries.len() {
            if progress.is_cancelled() {
                return Err(AccelError::Cancelled);
            }
            let slot = self.build_geometry(native, geometry, quality)?;
            self.geometries.push(slot);
            progress.add_completed(1);
        }
        if progress.is_cancelled() {
            return Err(AccelError::Cancelled);
        }

        // SAFETY: handles come from `native` and are owned by `self`.
        unsafe {
            self.top = rtcNewScene(native.handle);
            let mut flags = RTC_SCENE_FLAG_FILTER_FUNCTION_IN_ARGUMENTS;
            if self.params.dynamic {
                flags |= RTC_SCENE_FLAG_DYNAMIC;
            }
            rtcSetSceneFlags(self.top, flags);
            rtcSetSceneBuildQuality(self.top, build_quality(quality));

            for (index, object) in scene.objects.iter().enumerate() {
                let Some(Some(slot)) = self.geometries.get(object.geometry) else {
                    continue;
                };
                let geom = rtcNewGeometry(native.handle, RTCGeometryType::Instance);
                if geom.is_null() {
                    log::warn!("Failed to create instance for object {}", index);
                    continue;
                }
                rtcSetGeometryInstancedScene(geom, slot.scene);
                rtcSetGeometryMask(geom, object.visibility.bits());
                Self::set_instance_transform(geom, &object.transform);
                rtcCommitGeometry(geom);
                let id = rtcAttachGeometry(self.top, geom);
                debug_assert_eq!(id as usize, self.instances.len());
                self.instances.push(InstanceSlot {
                    geom,
                    object: index as u32,
                    prim_offset: slot.prim_offset,
                    placement: Placement::new(&object.transform),
                    negative_scale: object.flags.contains(ObjectFlags::NEGATIVE_SCALE),
                });
            }
        }

        progress.set_status("Building top level");
        self.commit_with_progress(self.top, progress);
        if progress.is_cancelled() {
            return Err(AccelError::Cancelled);
        }
        native.check("committing top-level scene")?;
        progress.add_completed(1);

        self.topology = Some(Topology::of(scene));
        self.bytes = (self.pack.total_bytes() * 2) as u64;
        self.device.memory.alloc(self.bytes);
        log::info!(
            "Built Embree BVH: {} primitives, {} instances",
            self.pack.len(),
            self.instances.len()
        );
        Ok(())
    }

    /// Map a native hit to a pack primitive with a world-space normal.
    fn native_hit(&self, ray: &RTCRay, hit: &RTCHit) -> Option<Intersection> {
        if hit.inst_id[0] == RTC_INVALID_GEOMETRY_ID {
            return None;
        }
        let instance = self.instances.get(hit.inst_id[0] as usize)?;
        let prim = instance.prim_offset + hit.prim_id;
        let prim_type = *self.pack.prim_type.get(prim as usize)?;

        let to_local = instance.placement.world_to_local(ray.time);
        let mut ng = Mat3::from_mat4(to_local).transpose() * Vec3::new(hit.ng_x, hit.ng_y, hit.ng_z);
        if instance.negative_scale && !prim_type.is_curve() {
            ng = -ng;
        }
        Some(Intersection {
            t: ray.tfar,
            u: hit.u,
            v: hit.v,
            prim,
            object: instance.object,
            prim_type,
            segment: self.pack.prim_segment[prim as usize],
            ng,
        })
    }

    fn native_ray(ray: &Ray, visibility: Visibility) -> RTCRay {
        RTCRay {
            org_x: ray.origin.x,
            org_y: ray.origin.y,
            org_z: ray.origin.z,
            tnear: 0.0,

            dir_x: ray.direction.x,
            dir_y: ray.direction.y,
            dir_z: ray.direction.z,
            time: ray.time,

            tfar: ray.t,
            mask: visibility.bits(),
            id: 0,
            flags: 0,
        }
    }

    fn context(&self, kind: QueryKind) -> IntersectContext<'_> {
        IntersectContext::new(kind, &self.pack)
            .with_curve_backface_culling(self.params.curve_backface_culling)
    }

    /// Run a query through the filter callback.
    ///
    /// Closest-hit queries use `rtcIntersect1` and return the hit. Every
    /// other query uses `rtcOccluded1`, where a kept hit ends the traversal.
    fn query(
        &self,
        ray: &Ray,
        visibility: Visibility,
        filter: &mut IntersectContext<'_>,
        closest: bool,
    ) -> Outcome {
        if self.top.is_null() {
            return if closest {
                Outcome::Closest(None)
            } else {
                Outcome::Occluded(false)
            };
        }
        let mut ctx = QueryContext {
            rtc: RTCRayQueryContext {
                inst_id: [RTC_INVALID_GEOMETRY_ID],
            },
            accel: self,
            filter,
            direction: ray.direction,
        };
        let args = RTCQueryArguments {
            flags: RTC_RAY_QUERY_FLAG_INVOKE_ARGUMENT_FILTER,
            feature_mask: RTC_FEATURE_FLAG_ALL,
            context: &mut ctx as *mut QueryContext<'_, '_> as *mut RTCRayQueryContext,
            filter: Some(filter_hit),
            callback: std::ptr::null(),
        };

        let mut native = Self::native_ray(ray, visibility);
        if !closest {
            // SAFETY: `ctx` outlives the call and `args.context` points at it.
            unsafe { rtcOccluded1(self.top, &mut native, &args) };
            // Embree marks an occluded ray with tfar = -inf.
            return Outcome::Occluded(native.tfar == f32::NEG_INFINITY);
        }

        let mut rayhit = RTCRayHit {
            ray: native,
            hit: RTCHit {
                ng_x: 0.0,
                ng_y: 0.0,
                ng_z: 0.0,
                u: 0.0,
                v: 0.0,
                prim_id: RTC_INVALID_GEOMETRY_ID,
                geom_id: RTC_INVALID_GEOMETRY_ID,
                inst_id: [RTC_INVALID_GEOMETRY_ID],
            },
        };
        // SAFETY: as above.
        unsafe { rtcIntersect1(self.top, &mut rayhit, &args) };
        if rayhit.hit.geom_id == RTC_INVALID_GEOMETRY_ID {
            return Outcome::Closest(None);
        }
        Outcome::Closest(self.native_hit(&rayhit.ray, &rayhit.hit))
    }

    fn any_hit(&self, ray: &Ray, visibility: Visibility, filter: &mut IntersectContext<'_>) -> bool {
        matches!(self.query(ray, visibility, filter, false), Outcome::Occluded(true))
    }
}

impl Accel for EmbreeAccel {
    fn build(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError> {
        let device = Arc::clone(&self.device);
        let _guard = device.lock_build()?;
        scene.validate()?;
        self.release();

        let result = self.build_locked(scene, progress);
        if let Err(err) = &result {
            match err {
                AccelError::Cancelled => log::warn!("Embree build cancelled"),
                AccelError::Device(message) => device.set_error(message.clone()),
                _ => {}
            }
            self.release();
        }
        result
    }

    fn refit(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError> {
        if self.topology.as_ref() != Some(&Topology::of(scene)) {
            log::debug!("Scene topology changed, rebuilding instead of refitting");
            return self.build(scene, progress);
        }

        let device = Arc::clone(&self.device);
        let _guard = device.lock_build()?;
        let native = device
            .native
            .as_ref()
            .ok_or_else(|| AccelError::BackendUnavailable("no Embree device".into()))?;
        progress.set_status("Refitting Embree BVH");
        self.pack.update_vertices(scene);

        // SAFETY: buffers and handles were created in `build` with the same topology.
        unsafe {
            for slot in self.geometries.iter().flatten() {
                Self::write_vertices(&self.pack, slot);
                for step in 0..slot.steps {
                    rtcUpdateGeometryBuffer(slot.geom, RTCBufferType::Vertex as u32, step as u32);
                }
                rtcCommitGeometry(slot.geom);
                rtcSetSceneBuildQuality(slot.scene, RTC_BUILD_QUALITY_REFIT);
                rtcCommitScene(slot.scene);
            }
            for instance in &mut self.instances {
                let object = &scene.objects[instance.object as usize];
                rtcSetGeometryMask(instance.geom, object.visibility.bits());
                Self::set_instance_transform(instance.geom, &object.transform);
                rtcCommitGeometry(instance.geom);
                instance.placement = Placement::new(&object.transform);
                instance.negative_scale = object.flags.contains(ObjectFlags::NEGATIVE_SCALE);
            }
        }
        self.commit_with_progress(self.top, progress);
        if let Err(err) = native.check("refit") {
            if let AccelError::Device(message) = &err {
                device.set_error(message.clone());
            }
            return Err(err);
        }
        Ok(())
    }

    fn intersect(&self, ray: &Ray, visibility: Visibility) -> Option<Intersection> {
        let mut ctx = self.context(QueryKind::Regular);
        match self.query(ray, visibility, &mut ctx, true) {
            Outcome::Closest(hit) => hit,
            Outcome::Occluded(_) => None,
        }
    }

    fn occluded(&self, ray: &Ray, visibility: Visibility) -> bool {
        let mut ctx = self.context(QueryKind::Regular);
        self.any_hit(ray, visibility, &mut ctx)
    }

    fn intersect_all(&self, ray: &Ray, visibility: Visibility, max_hits: usize) -> ShadowHits {
        let mut ctx = self.context(QueryKind::ShadowAll { max_hits });
        self.any_hit(ray, visibility, &mut ctx);
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
        self.any_hit(ray, visibility, &mut ctx);
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
        self.any_hit(ray, Visibility::ALL, &mut ctx);
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

impl Drop for EmbreeAccel {
    fn drop(&mut self) {
        // Instances and the top scene go before the scenes they reference.
        self.release();
    }
}
