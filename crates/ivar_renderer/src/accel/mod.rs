//! Scene acceleration structures.
//!
//! One interface, two backends:
//!
//! - `SoftwareAccel`: a two-level BVH built in this crate
//! - `EmbreeAccel` (feature `embree`): the same two-level layout on Embree 4
//!
//! Both build one bottom-level hierarchy per geometry, attach one instance
//! per object and merge the instances under a top-level hierarchy. Hits are
//! reported with the primitive's index in the shared `PackedPrimitives`.

use std::sync::Arc;

use ivar_scene::{Scene, SceneError, Visibility};
use serde::Deserialize;
use smallvec::SmallVec;
use thiserror::Error;

use crate::device::{BackendDevice, BackendKind};
use crate::intersection::Intersection;
use crate::progress::Progress;
use crate::ray::Ray;
use crate::sampling::LcgSampler;

pub mod bvh;
#[cfg(feature = "embree")]
pub mod embree;
pub mod pack;
pub mod primitive;
pub mod software;

pub use bvh::{BuildQuality, BvhNode};
pub use pack::{BufferSlot, PackError, PackedPrimitives};
pub use software::SoftwareAccel;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("build cancelled")]
    Cancelled,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("invalid scene: {0}")]
    Scene(#[from] SceneError),

    #[error("inconsistent primitive pack: {0}")]
    Pack(#[from] PackError),
}

/// Which backend lays out the hierarchy; one per device kind.
pub type BvhLayout = BackendKind;

/// Acceleration structure options.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccelParams {
    pub layout: BvhLayout,
    /// Geometry changes every frame; favour build speed.
    pub dynamic: bool,
    pub use_spatial_split: bool,
    pub max_leaf_size: usize,
    pub curve_backface_culling: bool,
}

impl Default for AccelParams {
    fn default() -> Self {
        Self {
            layout: BackendKind::Software,
            dynamic: false,
            use_spatial_split: false,
            max_leaf_size: 4,
            curve_backface_culling: true,
        }
    }
}

impl AccelParams {
    pub fn with_layout(mut self, layout: BvhLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_spatial_split(mut self, enabled: bool) -> Self {
        self.use_spatial_split = enabled;
        self
    }

    pub fn build_quality(&self) -> BuildQuality {
        BuildQuality::select(self)
    }
}

impl BuildQuality {
    /// Dynamic scenes build fastest; static scenes with spatial splits build best.
    pub fn select(params: &AccelParams) -> Self {
        if params.dynamic {
            BuildQuality::Low
        } else if params.use_spatial_split {
            BuildQuality::High
        } else {
            BuildQuality::Medium
        }
    }
}

/// Result of a record-all shadow query.
#[derive(Debug, Clone, Default)]
pub struct ShadowHits {
    /// Transparent hits, unordered
    pub hits: SmallVec<[Intersection; 8]>,
    /// Transparent hits seen, which exceeds `hits.len()` when the cap was hit
    pub num_hits: u32,
    /// An opaque surface was found
    pub opaque: bool,
}

impl ShadowHits {
    /// Nothing can pass: an opaque hit, or more transparent hits than fit.
    pub fn blocked(&self) -> bool {
        self.opaque || self.num_hits as usize > self.hits.len()
    }
}

/// Result of a local query against one object.
#[derive(Debug, Clone, Default)]
pub struct LocalHits {
    pub hits: SmallVec<[Intersection; 8]>,
    /// Candidates seen; hits were reservoir sampled when this exceeds `hits.len()`
    pub num_hits: u32,
}

/// Scene traversal contract shared by every backend.
pub trait Accel: Send + Sync {
    /// Build from scratch.
    fn build(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError>;

    /// Update for moved vertices or transforms, keeping topology. Falls back to
    /// `build` when primitive or motion-step counts changed.
    fn refit(&mut self, scene: &Scene, progress: &Progress) -> Result<(), AccelError>;

    /// Closest hit along `ray` on objects visible to `visibility`.
    fn intersect(&self, ray: &Ray, visibility: Visibility) -> Option<Intersection>;

    /// Any opaque-or-transparent hit at all; no shader is consulted.
    fn occluded(&self, ray: &Ray, visibility: Visibility) -> bool;

    /// Record transparent hits up to `max_hits`, stopping at the first opaque hit.
    fn intersect_all(&self, ray: &Ray, visibility: Visibility, max_hits: usize) -> ShadowHits;

    /// Record hits on objects with a volume, up to `max_hits`.
    fn intersect_volume_all(
        &self,
        ray: &Ray,
        visibility: Visibility,
        max_hits: usize,
    ) -> Vec<Intersection>;

    /// Hits on `object` only, reservoir sampled past `max_hits`.
    fn intersect_local(
        &self,
        ray: &Ray,
        object: u32,
        sampler: &mut LcgSampler,
        max_hits: usize,
    ) -> LocalHits;

    /// Primitive arrays for mapping hits back to scene data.
    fn pack(&self) -> &PackedPrimitives;

    fn device(&self) -> &Arc<BackendDevice>;
}

/// Create the acceleration structure `params.layout` selects on `device`.
pub fn create_accel(
    params: AccelParams,
    device: Arc<BackendDevice>,
) -> Result<Box<dyn Accel>, AccelError> {
    if device.key().kind != params.layout {
        return Err(AccelError::Device(format!(
            "{:?} layout requested on a {:?} device",
            params.layout,
            device.key().kind
        )));
    }
    match params.layout {
        BackendKind::Software => Ok(Box::new(SoftwareAccel::new(params, device))),
        #[cfg(feature = "embree")]
        BackendKind::Embree => Ok(Box::new(embree::EmbreeAccel::new(params, device)?)),
        #[cfg(not(feature = "embree"))]
        BackendKind::Embree => Err(AccelError::BackendUnavailable(
            "built without the `embree` feature".into(),
        )),
    }
}
