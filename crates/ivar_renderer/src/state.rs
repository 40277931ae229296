//! Per-path mutable state.
//!
//! A `PathState` lives for one camera sample: it counts bounces per
//! category, carries the ray-type flags that drive visibility and MIS, the
//! sample-stream cursor, and the stack of volumes the path is inside.

use bitflags::bitflags;
use ivar_math::Vec3;
use ivar_scene::{ShaderFlags, Visibility};
use smallvec::SmallVec;

use crate::accel::Accel;
use crate::integrator::IntegratorConfig;
use crate::ray::Ray;
use crate::sampling::dim;
use crate::shader::{BsdfLabel, ShaderData, ShaderDataFlags};

bitflags! {
    /// What kind of ray the path is currently following.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PathRayFlags: u32 {
        const CAMERA = 1 << 0;
        const REFLECT = 1 << 1;
        const TRANSMIT = 1 << 2;
        const DIFFUSE = 1 << 3;
        const GLOSSY = 1 << 4;
        const SINGULAR = 1 << 5;
        const TRANSPARENT = 1 << 6;
        const SHADOW = 1 << 7;
        const VOLUME_SCATTER = 1 << 8;
        /// Previous bounce cannot be importance sampled by lights
        const MIS_SKIP = 1 << 9;
        /// Some earlier bounce was diffuse
        const DIFFUSE_ANCESTOR = 1 << 10;
        /// Only transparent bounces so far; misses count towards alpha
        const TRANSPARENT_BACKGROUND = 1 << 11;

        const ALL_VISIBILITY = Self::CAMERA.bits()
            | Self::REFLECT.bits()
            | Self::TRANSMIT.bits()
            | Self::DIFFUSE.bits()
            | Self::GLOSSY.bits()
            | Self::SINGULAR.bits()
            | Self::TRANSPARENT.bits()
            | Self::SHADOW.bits()
            | Self::VOLUME_SCATTER.bits();
    }
}

impl PathRayFlags {
    /// Object visibility mask for rays of this kind.
    pub fn visibility(self) -> Visibility {
        let mut mask = Visibility::empty();
        if self.contains(Self::CAMERA) {
            mask |= Visibility::CAMERA;
        }
        if self.contains(Self::DIFFUSE) {
            mask |= Visibility::DIFFUSE;
        }
        if self.intersects(Self::GLOSSY | Self::SINGULAR) {
            mask |= Visibility::GLOSSY;
        }
        if self.contains(Self::TRANSMIT) {
            mask |= Visibility::TRANSMISSION;
        }
        if self.contains(Self::VOLUME_SCATTER) {
            mask |= Visibility::VOLUME_SCATTER;
        }
        if self.contains(Self::SHADOW) {
            mask |= Visibility::SHADOW;
        }
        if mask.is_empty() {
            Visibility::ALL
        } else {
            mask
        }
    }
}

/// Maximum number of nested volumes a path tracks.
pub const VOLUME_STACK_SIZE: usize = 32;

/// Upper bound on volume-only boundaries crossed by one path.
pub const VOLUME_BOUNDS_MAX: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeEntry {
    pub object: u32,
    pub shader: u32,
}

/// Volumes enclosing the current path vertex, innermost last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeStack {
    entries: SmallVec<[VolumeEntry; 4]>,
}

impl VolumeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, object: u32) -> bool {
        self.entries.iter().any(|e| e.object == object)
    }

    /// Push a volume; entering one already on the stack is a no-op.
    /// Returns false when the stack is full.
    pub fn enter(&mut self, entry: VolumeEntry) -> bool {
        if self.contains(entry.object) {
            return true;
        }
        if self.entries.len() >= VOLUME_STACK_SIZE {
            log::debug!("Volume stack full, ignoring object {}", entry.object);
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn exit(&mut self, object: u32) {
        self.entries.retain(|e| e.object != object);
    }

    /// Cross a surface: leaving through a back face exits its volume,
    /// entering through a front face pushes it.
    pub fn enter_exit(&mut self, sd: &ShaderData) {
        if !sd.flag.contains(ShaderDataFlags::HAS_VOLUME) {
            return;
        }
        let Some(object) = sd.object else {
            return;
        };
        if sd.flag.contains(ShaderDataFlags::BACKFACING) {
            self.exit(object);
        } else {
            self.enter(VolumeEntry {
                object,
                shader: sd.shader,
            });
        }
    }

    /// True when any volume on the stack needs ray marching.
    pub fn is_heterogeneous(&self, shader_flags: &[ShaderFlags]) -> bool {
        self.entries.iter().any(|e| {
            shader_flags
                .get(e.shader as usize)
                .is_some_and(|f| f.contains(ShaderFlags::HETEROGENEOUS_VOLUME))
        })
    }

    /// Find the volumes enclosing a camera at `origin`.
    ///
    /// Casts one ray through every volume boundary; a volume whose back face
    /// is hit before any front face of the same object encloses the origin.
    pub fn init_from_camera(&mut self, accel: &dyn Accel, origin: Vec3, time: f32) {
        self.entries.clear();
        let ray = Ray::new(origin, Vec3::Z, time);
        let mut hits = accel.intersect_volume_all(&ray, Visibility::ALL, VOLUME_STACK_SIZE * 2);
        hits.sort_by(|a, b| a.t.total_cmp(&b.t));

        let mut entered: SmallVec<[u32; 8]> = SmallVec::new();
        for hit in &hits {
            let sd = ShaderData::from_intersection(accel.pack(), hit, &ray);
            if !sd.flag.contains(ShaderDataFlags::BACKFACING) {
                entered.push(hit.object);
            } else if !entered.contains(&hit.object) {
                self.enter(VolumeEntry {
                    object: hit.object,
                    shader: sd.shader,
                });
            }
        }
    }

    /// Update for a path that jumps from `from` to `to` below a surface.
    pub fn update_for_segment(&mut self, accel: &dyn Accel, from: Vec3, to: Vec3, time: f32) {
        let ray = Ray::segment(from, to - from, 1.0, time);
        let mut hits = accel.intersect_volume_all(&ray, Visibility::ALL, VOLUME_STACK_SIZE * 2);
        hits.sort_by(|a, b| a.t.total_cmp(&b.t));
        for hit in &hits {
            let sd = ShaderData::from_intersection(accel.pack(), hit, &ray);
            self.enter_exit(&sd);
        }
    }
}

/// Mutable record of one in-flight path.
#[derive(Debug, Clone)]
pub struct PathState {
    pub flag: PathRayFlags,

    pub bounce: u32,
    pub diffuse_bounce: u32,
    pub glossy_bounce: u32,
    pub transmission_bounce: u32,
    pub volume_bounce: u32,
    pub volume_bounds_bounce: u32,
    pub transparent_bounce: u32,

    /// Pdf of the last BSDF sample, for MIS against lights
    pub ray_pdf: f32,
    /// Smallest BSDF pdf seen so far, drives glossy blurring
    pub min_ray_pdf: f32,

    pub rng_hash: u32,
    pub rng_offset: u32,
    pub sample: u32,

    pub volume_stack: VolumeStack,
}

impl PathState {
    pub fn new(rng_hash: u32, sample: u32, transparent_background: bool) -> Self {
        let mut flag = PathRayFlags::CAMERA | PathRayFlags::SINGULAR | PathRayFlags::MIS_SKIP;
        if transparent_background {
            flag |= PathRayFlags::TRANSPARENT_BACKGROUND;
        }
        Self {
            flag,
            bounce: 0,
            diffuse_bounce: 0,
            glossy_bounce: 0,
            transmission_bounce: 0,
            volume_bounce: 0,
            volume_bounds_bounce: 0,
            transparent_bounce: 0,
            ray_pdf: 0.0,
            min_ray_pdf: f32::MAX,
            rng_hash,
            rng_offset: dim::BASE_NUM,
            sample,
            volume_stack: VolumeStack::new(),
        }
    }

    /// Dimension `offset` of the current bounce block.
    #[inline]
    pub fn dimension(&self, offset: u32) -> u32 {
        self.rng_offset + offset
    }

    /// Advance past a sampled bounce with the given lobe label.
    pub fn next(&mut self, label: BsdfLabel) {
        self.rng_offset += dim::BOUNCE_NUM;

        if label.contains(BsdfLabel::TRANSPARENT) {
            self.flag |= PathRayFlags::TRANSPARENT;
            self.transparent_bounce += 1;
            return;
        }

        self.flag
            .remove(PathRayFlags::ALL_VISIBILITY | PathRayFlags::MIS_SKIP | PathRayFlags::TRANSPARENT_BACKGROUND);

        // Volume scatters only count against the volume budget.
        if label.contains(BsdfLabel::VOLUME_SCATTER) {
            self.flag |= PathRayFlags::VOLUME_SCATTER;
            self.volume_bounce += 1;
            return;
        }

        self.bounce += 1;

        if label.contains(BsdfLabel::REFLECT) {
            self.flag |= PathRayFlags::REFLECT;
        } else {
            self.flag |= PathRayFlags::TRANSMIT;
            self.transmission_bounce += 1;
        }

        if label.contains(BsdfLabel::DIFFUSE) {
            self.flag |= PathRayFlags::DIFFUSE | PathRayFlags::DIFFUSE_ANCESTOR;
            self.diffuse_bounce += 1;
        } else if label.contains(BsdfLabel::GLOSSY) {
            self.flag |= PathRayFlags::GLOSSY;
            self.glossy_bounce += 1;
        } else {
            self.flag |= PathRayFlags::SINGULAR | PathRayFlags::MIS_SKIP;
            self.glossy_bounce += 1;
        }
    }

    /// Scattering vertices behind the path, surface and volume alike.
    /// Direct and indirect light are split on this.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.bounce + self.volume_bounce
    }

    /// True once any per-category budget is spent.
    pub fn bounces_exhausted(&self, config: &IntegratorConfig) -> bool {
        self.bounce > config.max_bounce
            || self.diffuse_bounce > config.max_diffuse_bounce
            || self.glossy_bounce > config.max_glossy_bounce
            || self.transmission_bounce > config.max_transmission_bounce
            || self.volume_bounce > config.max_volume_bounce
    }

    /// Russian-roulette survival probability for the current vertex.
    ///
    /// Zero once a bounce budget is spent. The first bounces up to
    /// `min_bounce` always survive; after that the path survives with
    /// `min(sqrt(max throughput), 1)`.
    pub fn continuation_probability(&self, config: &IntegratorConfig, throughput: Vec3) -> f32 {
        if self.flag.contains(PathRayFlags::TRANSPARENT) {
            if self.transparent_bounce >= config.max_transparent_bounce {
                return 0.0;
            }
            if self.transparent_bounce <= config.transparent_min_bounce {
                return 1.0;
            }
        } else {
            if self.bounces_exhausted(config) {
                return 0.0;
            }
            if self.bounce <= config.min_bounce {
                return 1.0;
            }
        }
        throughput.abs().max_element().sqrt().min(1.0)
    }
}
