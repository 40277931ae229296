//! Shading at path vertices.
//!
//! Surface evaluation produces a small set of weighted closures: BSDFs,
//! subsurface (BSSRDF) profiles and emission. The integrator only talks to
//! them through the `Bsdf` and `Bssrdf` traits and to the shading system
//! through `ShadingEvaluator`, so node graphs can live elsewhere. A plain
//! per-shader table (`ShaderTable`) is provided for scenes without one.

use std::f32::consts::{FRAC_1_PI, PI};

use bitflags::bitflags;
use ivar_math::{make_orthonormals, Vec3};
use ivar_scene::ShaderFlags;
use smallvec::SmallVec;

use crate::accel::PackedPrimitives;
use crate::intersection::{Intersection, PrimitiveType};
use crate::radiance::{BsdfEval, ClosureChannel};
use crate::ray::Ray;
use crate::sampling::sample_cos_hemisphere;
use crate::state::{PathRayFlags, VolumeStack};
use crate::volume::{HenyeyGreenstein, VolumeClosures};

bitflags! {
    /// Properties of the shading point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderDataFlags: u32 {
        /// Ray arrived at the back of the surface; normals were flipped
        const BACKFACING = 1 << 0;
        const USE_MIS = 1 << 1;
        const HAS_TRANSPARENT_SHADOW = 1 << 2;
        const HAS_VOLUME = 1 << 3;
        const HETEROGENEOUS_VOLUME = 1 << 4;
        const HAS_EMISSION = 1 << 5;
        const HAS_BSSRDF = 1 << 6;
    }
}

impl From<ShaderFlags> for ShaderDataFlags {
    fn from(flags: ShaderFlags) -> Self {
        let mut out = ShaderDataFlags::empty();
        for (from, to) in [
            (ShaderFlags::USE_MIS, ShaderDataFlags::USE_MIS),
            (ShaderFlags::HAS_TRANSPARENT_SHADOW, ShaderDataFlags::HAS_TRANSPARENT_SHADOW),
            (ShaderFlags::HAS_VOLUME, ShaderDataFlags::HAS_VOLUME),
            (ShaderFlags::HETEROGENEOUS_VOLUME, ShaderDataFlags::HETEROGENEOUS_VOLUME),
            (ShaderFlags::HAS_EMISSION, ShaderDataFlags::HAS_EMISSION),
            (ShaderFlags::HAS_BSSRDF, ShaderDataFlags::HAS_BSSRDF),
        ] {
            if flags.contains(from) {
                out |= to;
            }
        }
        out
    }
}

bitflags! {
    /// Lobe a sampled direction came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BsdfLabel: u32 {
        const REFLECT = 1 << 0;
        const TRANSMIT = 1 << 1;
        const DIFFUSE = 1 << 2;
        const GLOSSY = 1 << 3;
        const SINGULAR = 1 << 4;
        const TRANSPARENT = 1 << 5;
        const VOLUME_SCATTER = 1 << 6;
    }
}

/// Geometry of a shading point, all in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaderData {
    pub p: Vec3,
    /// Geometric normal, facing the incoming ray
    pub ng: Vec3,
    /// Shading normal, facing the incoming ray
    pub n: Vec3,
    /// Unit vector back towards the ray origin
    pub i: Vec3,
    pub u: f32,
    pub v: f32,
    /// World distance from the ray origin
    pub ray_length: f32,
    pub time: f32,
    pub object: Option<u32>,
    pub prim: Option<u32>,
    pub prim_type: PrimitiveType,
    pub shader: u32,
    pub flag: ShaderDataFlags,
}

impl ShaderData {
    pub fn from_intersection(pack: &PackedPrimitives, isect: &Intersection, ray: &Ray) -> Self {
        let i = -ray.direction.normalize_or_zero();
        let mut ng = isect.ng.normalize_or_zero();
        if ng == Vec3::ZERO {
            ng = i;
        }
        let shader = pack.prim_shader.get(isect.prim as usize).copied().unwrap_or(0);
        let mut flag = ShaderDataFlags::from(pack.shader_flags_of(isect.prim));
        if ng.dot(i) < 0.0 {
            ng = -ng;
            flag |= ShaderDataFlags::BACKFACING;
        }
        Self {
            p: ray.at(isect.t),
            ng,
            n: ng,
            i,
            u: isect.u,
            v: isect.v,
            ray_length: isect.t * ray.direction.length(),
            time: ray.time,
            object: Some(isect.object),
            prim: Some(isect.prim),
            prim_type: isect.prim_type,
            shader,
            flag,
        }
    }

    /// A point inside a volume, at `t` along `ray`.
    pub fn for_volume(ray: &Ray, t: f32) -> Self {
        let i = -ray.direction.normalize_or_zero();
        Self {
            p: ray.at(t),
            ng: i,
            n: i,
            i,
            u: 0.0,
            v: 0.0,
            ray_length: t * ray.direction.length(),
            time: ray.time,
            object: None,
            prim: None,
            prim_type: PrimitiveType::Triangle,
            shader: 0,
            flag: ShaderDataFlags::empty(),
        }
    }
}

/// Result of sampling a closure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BsdfSample {
    pub omega_in: Vec3,
    /// BSDF value times the cosine term
    pub eval: Vec3,
    pub pdf: f32,
    pub label: BsdfLabel,
}

/// A scattering lobe at a surface point.
pub trait Bsdf {
    fn channel(&self) -> ClosureChannel;

    /// Value (cosine included) and pdf for light arriving from `omega_in`.
    fn eval(&self, sd: &ShaderData, omega_in: Vec3) -> (Vec3, f32);

    fn sample(&self, sd: &ShaderData, u: f32, v: f32) -> Option<BsdfSample>;

    /// Lobes with a delta distribution can only be sampled, never evaluated.
    fn is_singular(&self) -> bool {
        false
    }

    fn is_glossy(&self) -> bool {
        false
    }

    /// Widen the lobe to at least `roughness`.
    fn blur(&mut self, _roughness: f32) {}
}

/// Lambertian reflection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffuseBsdf {
    pub n: Vec3,
    pub channel: ClosureChannel,
}

impl Bsdf for DiffuseBsdf {
    fn channel(&self) -> ClosureChannel {
        self.channel
    }

    fn eval(&self, _sd: &ShaderData, omega_in: Vec3) -> (Vec3, f32) {
        let cos_ni = self.n.dot(omega_in);
        if cos_ni <= 0.0 {
            return (Vec3::ZERO, 0.0);
        }
        let pdf = cos_ni * FRAC_1_PI;
        (Vec3::splat(pdf), pdf)
    }

    fn sample(&self, sd: &ShaderData, u: f32, v: f32) -> Option<BsdfSample> {
        let (omega_in, pdf) = sample_cos_hemisphere(self.n, u, v);
        if sd.ng.dot(omega_in) <= 0.0 || pdf <= 0.0 {
            return None;
        }
        Some(BsdfSample {
            omega_in,
            eval: Vec3::splat(pdf),
            pdf,
            label: BsdfLabel::REFLECT | BsdfLabel::DIFFUSE,
        })
    }
}

/// Below this roughness a glossy lobe is a perfect mirror.
const SINGULAR_ROUGHNESS: f32 = 1e-4;

/// Normalized Phong lobe about the mirror direction; a mirror at zero
/// roughness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlossyBsdf {
    pub n: Vec3,
    pub roughness: f32,
}

impl GlossyBsdf {
    fn exponent(&self) -> f32 {
        (2.0 / (self.roughness * self.roughness) - 2.0).max(0.0)
    }

    fn reflect(&self, sd: &ShaderData) -> Vec3 {
        2.0 * self.n.dot(sd.i) * self.n - sd.i
    }
}

impl Bsdf for GlossyBsdf {
    fn channel(&self) -> ClosureChannel {
        ClosureChannel::Glossy
    }

    fn is_singular(&self) -> bool {
        self.roughness < SINGULAR_ROUGHNESS
    }

    fn is_glossy(&self) -> bool {
        true
    }

    fn eval(&self, sd: &ShaderData, omega_in: Vec3) -> (Vec3, f32) {
        if self.is_singular() {
            return (Vec3::ZERO, 0.0);
        }
        let cos_ni = self.n.dot(omega_in);
        let cos_ri = self.reflect(sd).dot(omega_in);
        if cos_ni <= 0.0 || cos_ri <= 0.0 {
            return (Vec3::ZERO, 0.0);
        }
        let e = self.exponent();
        let lobe = cos_ri.powf(e);
        let pdf = (e + 1.0) / (2.0 * PI) * lobe;
        (Vec3::splat((e + 2.0) / (2.0 * PI) * lobe * cos_ni), pdf)
    }

    fn sample(&self, sd: &ShaderData, u: f32, v: f32) -> Option<BsdfSample> {
        let r = self.reflect(sd);
        if self.is_singular() {
            if sd.ng.dot(r) <= 0.0 {
                return None;
            }
            return Some(BsdfSample {
                omega_in: r,
                eval: Vec3::ONE,
                pdf: 1.0,
                label: BsdfLabel::REFLECT | BsdfLabel::SINGULAR,
            });
        }

        let e = self.exponent();
        let cos_a = u.powf(1.0 / (e + 1.0));
        let sin_a = (1.0 - cos_a * cos_a).max(0.0).sqrt();
        let phi = 2.0 * PI * v;
        let (t, b) = make_orthonormals(r);
        let omega_in = (t * phi.cos() + b * phi.sin()) * sin_a + r * cos_a;
        if sd.ng.dot(omega_in) <= 0.0 {
            return None;
        }
        let (eval, pdf) = self.eval(sd, omega_in);
        (pdf > 0.0).then_some(BsdfSample {
            omega_in,
            eval,
            pdf,
            label: BsdfLabel::REFLECT | BsdfLabel::GLOSSY,
        })
    }

    fn blur(&mut self, roughness: f32) {
        self.roughness = self.roughness.max(roughness);
    }
}

/// Straight pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransparentBsdf;

impl Bsdf for TransparentBsdf {
    fn channel(&self) -> ClosureChannel {
        ClosureChannel::Transparent
    }

    fn is_singular(&self) -> bool {
        true
    }

    fn eval(&self, _sd: &ShaderData, _omega_in: Vec3) -> (Vec3, f32) {
        (Vec3::ZERO, 0.0)
    }

    fn sample(&self, sd: &ShaderData, _u: f32, _v: f32) -> Option<BsdfSample> {
        Some(BsdfSample {
            omega_in: -sd.i,
            eval: Vec3::ONE,
            pdf: 1.0,
            label: BsdfLabel::TRANSMIT | BsdfLabel::TRANSPARENT,
        })
    }
}

/// Built-in lobes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BsdfKind {
    Diffuse(DiffuseBsdf),
    Glossy(GlossyBsdf),
    Transparent(TransparentBsdf),
}

impl BsdfKind {
    pub fn as_bsdf(&self) -> &dyn Bsdf {
        match self {
            BsdfKind::Diffuse(b) => b,
            BsdfKind::Glossy(b) => b,
            BsdfKind::Transparent(b) => b,
        }
    }

    pub fn as_bsdf_mut(&mut self) -> &mut dyn Bsdf {
        match self {
            BsdfKind::Diffuse(b) => b,
            BsdfKind::Glossy(b) => b,
            BsdfKind::Transparent(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BsdfClosure {
    pub weight: Vec3,
    pub sample_weight: f32,
    pub bsdf: BsdfKind,
}

/// A radial diffusion profile for subsurface scattering.
///
/// Densities are per unit disk area. Each color channel has its own
/// radius; `sample` picks a channel uniformly and `pdf` is the average
/// over channels of their densities.
pub trait Bssrdf {
    /// Per-channel density at distance `r`.
    fn eval(&self, r: f32) -> Vec3;

    /// Density of `sample` producing `r`.
    fn pdf(&self, r: f32) -> f32;

    /// Radius for a uniform `xi`.
    fn sample(&self, xi: f32) -> f32;

    /// No sample is farther than this.
    fn max_radius(&self) -> f32;
}

/// Split `xi` into a channel pick over channels with nonzero radius and a
/// rescaled remainder.
fn pick_channel(radius: Vec3, xi: f32) -> Option<(f32, f32)> {
    let active: SmallVec<[f32; 3]> = radius.to_array().into_iter().filter(|&r| r > 0.0).collect();
    if active.is_empty() {
        return None;
    }
    let n = active.len() as f32;
    let scaled = xi * n;
    let index = (scaled as usize).min(active.len() - 1);
    Some((active[index], (scaled - index as f32).clamp(0.0, 1.0)))
}

fn channel_average(radius: Vec3, density: impl Fn(f32) -> f32) -> f32 {
    let mut sum = 0.0;
    let mut count = 0;
    for r in radius.to_array() {
        if r > 0.0 {
            sum += density(r);
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Cubic falloff `10 (R - r)^3 / (pi R^5)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicProfile {
    pub radius: Vec3,
}

impl CubicProfile {
    fn density(radius: f32, r: f32) -> f32 {
        if radius <= 0.0 || r >= radius {
            return 0.0;
        }
        let d = radius - r;
        10.0 * d * d * d / (PI * radius.powi(5))
    }

    /// Inverts the radial CDF `10x^2 - 20x^3 + 15x^4 - 4x^5` by bisection.
    fn sample_unit(xi: f32) -> f32 {
        let cdf = |x: f32| x * x * (10.0 + x * (-20.0 + x * (15.0 - 4.0 * x)));
        let (mut lo, mut hi) = (0.0f32, 1.0f32);
        for _ in 0..24 {
            let mid = 0.5 * (lo + hi);
            if cdf(mid) < xi {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

impl Bssrdf for CubicProfile {
    fn eval(&self, r: f32) -> Vec3 {
        Vec3::new(
            Self::density(self.radius.x, r),
            Self::density(self.radius.y, r),
            Self::density(self.radius.z, r),
        )
    }

    fn pdf(&self, r: f32) -> f32 {
        channel_average(self.radius, |radius| Self::density(radius, r))
    }

    fn sample(&self, xi: f32) -> f32 {
        match pick_channel(self.radius, xi) {
            Some((radius, xi)) => Self::sample_unit(xi) * radius,
            None => 0.0,
        }
    }

    fn max_radius(&self) -> f32 {
        self.radius.max_element()
    }
}

const GAUSS_TRUNCATE: f32 = 12.46;

/// Truncated 2D Gaussian with variance `(R/4)^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianProfile {
    pub radius: Vec3,
}

impl GaussianProfile {
    fn variance(radius: f32) -> f32 {
        radius * radius * (0.25 * 0.25)
    }

    fn truncation(radius: f32) -> f32 {
        (Self::variance(radius) * GAUSS_TRUNCATE).sqrt()
    }

    fn density(radius: f32, r: f32) -> f32 {
        if radius <= 0.0 {
            return 0.0;
        }
        let v = Self::variance(radius);
        let rm = Self::truncation(radius);
        if r >= rm {
            return 0.0;
        }
        let norm = 1.0 - (-rm * rm / (2.0 * v)).exp();
        (-r * r / (2.0 * v)).exp() / (2.0 * PI * v) / norm
    }
}

impl Bssrdf for GaussianProfile {
    fn eval(&self, r: f32) -> Vec3 {
        Vec3::new(
            Self::density(self.radius.x, r),
            Self::density(self.radius.y, r),
            Self::density(self.radius.z, r),
        )
    }

    fn pdf(&self, r: f32) -> f32 {
        channel_average(self.radius, |radius| Self::density(radius, r))
    }

    fn sample(&self, xi: f32) -> f32 {
        let Some((radius, xi)) = pick_channel(self.radius, xi) else {
            return 0.0;
        };
        let v = Self::variance(radius);
        let rm = Self::truncation(radius);
        let r_trunc = 1.0 - (-rm * rm / (2.0 * v)).exp();
        (-2.0 * v * (1.0 - xi * r_trunc).ln()).max(0.0).sqrt()
    }

    fn max_radius(&self) -> f32 {
        Self::truncation(self.radius.max_element())
    }
}

/// Falloff shape of a subsurface closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BssrdfFalloff {
    #[default]
    Cubic,
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BssrdfProfile {
    Cubic(CubicProfile),
    Gaussian(GaussianProfile),
}

impl BssrdfProfile {
    pub fn new(falloff: BssrdfFalloff, radius: Vec3) -> Self {
        match falloff {
            BssrdfFalloff::Cubic => BssrdfProfile::Cubic(CubicProfile { radius }),
            BssrdfFalloff::Gaussian => BssrdfProfile::Gaussian(GaussianProfile { radius }),
        }
    }

    pub fn as_bssrdf(&self) -> &dyn Bssrdf {
        match self {
            BssrdfProfile::Cubic(p) => p,
            BssrdfProfile::Gaussian(p) => p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BssrdfClosure {
    pub weight: Vec3,
    pub sample_weight: f32,
    pub profile: BssrdfProfile,
    pub n: Vec3,
}

fn sample_weight_of(weight: Vec3) -> f32 {
    (weight.element_sum() / 3.0).abs()
}

/// Closures of one surface evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderClosures {
    pub bsdfs: SmallVec<[BsdfClosure; 4]>,
    pub bssrdfs: SmallVec<[BssrdfClosure; 2]>,
    pub emission: Vec3,
}

impl ShaderClosures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bsdf(&mut self, weight: Vec3, bsdf: BsdfKind) {
        let sample_weight = sample_weight_of(weight);
        if sample_weight > 0.0 {
            self.bsdfs.push(BsdfClosure {
                weight,
                sample_weight,
                bsdf,
            });
        }
    }

    pub fn add_diffuse(&mut self, weight: Vec3, n: Vec3) {
        self.add_bsdf(
            weight,
            BsdfKind::Diffuse(DiffuseBsdf {
                n,
                channel: ClosureChannel::Diffuse,
            }),
        );
    }

    pub fn add_glossy(&mut self, weight: Vec3, n: Vec3, roughness: f32) {
        self.add_bsdf(weight, BsdfKind::Glossy(GlossyBsdf { n, roughness }));
    }

    pub fn add_transparent(&mut self, weight: Vec3) {
        self.add_bsdf(weight, BsdfKind::Transparent(TransparentBsdf));
    }

    pub fn add_bssrdf(&mut self, weight: Vec3, profile: BssrdfProfile, n: Vec3) {
        let sample_weight = sample_weight_of(weight);
        if sample_weight > 0.0 && profile.as_bssrdf().max_radius() > 0.0 {
            self.bssrdfs.push(BssrdfClosure {
                weight,
                sample_weight,
                profile,
                n,
            });
        } else if sample_weight > 0.0 {
            // A zero radius scatters nowhere: plain diffuse.
            self.add_diffuse(weight, n);
        }
    }

    pub fn add_emission(&mut self, emission: Vec3) {
        self.emission += emission;
    }

    pub fn has_bsdf(&self) -> bool {
        !self.bsdfs.is_empty()
    }

    pub fn has_bssrdf(&self) -> bool {
        !self.bssrdfs.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.bsdfs.is_empty() && self.bssrdfs.is_empty() && self.emission == Vec3::ZERO
    }

    /// Fraction of light passing straight through.
    pub fn transparency(&self) -> Vec3 {
        self.bsdfs
            .iter()
            .filter(|c| matches!(c.bsdf, BsdfKind::Transparent(_)))
            .map(|c| c.weight)
            .sum()
    }

    /// Whether anything other than transparency can be evaluated.
    pub fn has_bsdf_eval(&self) -> bool {
        self.bsdfs.iter().any(|c| !c.bsdf.as_bsdf().is_singular())
    }

    /// Albedo ambient occlusion is weighted by.
    pub fn diffuse_albedo(&self) -> Vec3 {
        self.bsdfs
            .iter()
            .filter(|c| matches!(c.bsdf, BsdfKind::Diffuse(_)))
            .map(|c| c.weight)
            .sum()
    }

    pub fn bsdf_sample_weight(&self) -> f32 {
        self.bsdfs.iter().map(|c| c.sample_weight).sum()
    }

    pub fn bssrdf_sample_weight(&self) -> f32 {
        self.bssrdfs.iter().map(|c| c.sample_weight).sum()
    }

    /// Replace subsurface closures with diffuse ones in the subsurface channel.
    pub fn convert_bssrdfs_to_diffuse(&mut self) {
        for closure in std::mem::take(&mut self.bssrdfs) {
            self.add_bsdf(
                closure.weight,
                BsdfKind::Diffuse(DiffuseBsdf {
                    n: closure.n,
                    channel: ClosureChannel::Subsurface,
                }),
            );
        }
    }

    pub fn remove_bssrdfs(&mut self) {
        self.bssrdfs.clear();
    }

    pub fn blur(&mut self, roughness: f32) {
        for closure in &mut self.bsdfs {
            closure.bsdf.as_bsdf_mut().blur(roughness);
        }
    }

    /// Drop glossy lobes on paths that already bounced diffusely.
    pub fn filter_caustics(&mut self, reflective: bool) {
        if !reflective {
            self.bsdfs.retain(|c| !c.bsdf.as_bsdf().is_glossy());
        }
    }

    /// Combined value and pdf of every evaluable closure for `omega_in`.
    pub fn eval(&self, sd: &ShaderData, omega_in: Vec3, use_light_pass: bool) -> (BsdfEval, f32) {
        let mut eval = BsdfEval::new(use_light_pass);
        let mut pdf = 0.0;
        let mut sum_sample_weight = 0.0;
        for closure in &self.bsdfs {
            let bsdf = closure.bsdf.as_bsdf();
            if !bsdf.is_singular() {
                let (value, closure_pdf) = bsdf.eval(sd, omega_in);
                if closure_pdf > 0.0 {
                    eval.accum(bsdf.channel(), value * closure.weight);
                    pdf += closure_pdf * closure.sample_weight;
                }
            }
            sum_sample_weight += closure.sample_weight;
        }
        if sum_sample_weight > 0.0 {
            pdf /= sum_sample_weight;
        }
        (eval, pdf)
    }

    /// Pick a closure by sample weight with `pick` and sample it with `(u, v)`.
    /// Non-singular samples are combined with every other closure's value
    /// and pdf for the same direction.
    pub fn sample(
        &self,
        sd: &ShaderData,
        pick: f32,
        u: f32,
        v: f32,
        use_light_pass: bool,
    ) -> Option<(BsdfEval, f32, BsdfSample)> {
        let total = self.bsdf_sample_weight();
        if total <= 0.0 {
            return None;
        }
        let mut r = pick * total;
        let mut chosen = self.bsdfs.len() - 1;
        for (index, closure) in self.bsdfs.iter().enumerate() {
            if r < closure.sample_weight {
                chosen = index;
                break;
            }
            r -= closure.sample_weight;
        }

        let closure = &self.bsdfs[chosen];
        let bsdf = closure.bsdf.as_bsdf();
        let sample = bsdf.sample(sd, u, v)?;
        if sample.pdf <= 0.0 {
            return None;
        }

        let mut eval = BsdfEval::with_value(use_light_pass, bsdf.channel(), sample.eval * closure.weight);
        let mut pdf = sample.pdf * closure.sample_weight;
        if !sample.label.intersects(BsdfLabel::SINGULAR | BsdfLabel::TRANSPARENT) {
            for (index, other) in self.bsdfs.iter().enumerate() {
                let other_bsdf = other.bsdf.as_bsdf();
                if index == chosen || other_bsdf.is_singular() {
                    continue;
                }
                let (value, other_pdf) = other_bsdf.eval(sd, sample.omega_in);
                if other_pdf > 0.0 {
                    eval.accum(other_bsdf.channel(), value * other.weight);
                    pdf += other_pdf * other.sample_weight;
                }
            }
        }
        Some((eval, pdf / total, sample))
    }
}

/// Shading system contract.
pub trait ShadingEvaluator: Send + Sync {
    fn evaluate_surface(&self, sd: &ShaderData, path_flag: PathRayFlags) -> ShaderClosures;

    /// Combined coefficients of every volume on `stack` at `sd.p`.
    fn evaluate_volume(&self, sd: &ShaderData, stack: &VolumeStack, path_flag: PathRayFlags) -> VolumeClosures;

    /// Radiance arriving from the environment along `ray`.
    fn evaluate_background(&self, ray: &Ray, path_flag: PathRayFlags) -> Vec3;

    /// Transmittance through a surface hit by a shadow ray.
    fn evaluate_shadow(&self, sd: &ShaderData, path_flag: PathRayFlags) -> Vec3 {
        self.evaluate_surface(sd, path_flag | PathRayFlags::SHADOW)
            .transparency()
    }
}

/// Participating medium of a `SurfaceShader`.
#[derive(Debug, Clone, Copy)]
pub struct VolumeShader {
    pub absorption: Vec3,
    pub scatter: Vec3,
    pub emission: Vec3,
    /// Henyey-Greenstein anisotropy in (-1, 1)
    pub anisotropy: f32,
    /// Spatial density multiplier; constant when absent
    pub density: Option<fn(Vec3) -> f32>,
}

impl Default for VolumeShader {
    fn default() -> Self {
        Self {
            absorption: Vec3::ZERO,
            scatter: Vec3::ZERO,
            emission: Vec3::ZERO,
            anisotropy: 0.0,
            density: None,
        }
    }
}

/// Fixed-function shader: a weighted sum of the built-in closures.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceShader {
    pub diffuse: Vec3,
    pub glossy: Vec3,
    pub roughness: f32,
    pub transparent: Vec3,
    pub emission: Vec3,
    pub subsurface: Vec3,
    pub subsurface_radius: Vec3,
    pub falloff: BssrdfFalloff,
    pub volume: Option<VolumeShader>,
}

impl Default for SurfaceShader {
    fn default() -> Self {
        Self {
            diffuse: Vec3::splat(0.8),
            glossy: Vec3::ZERO,
            roughness: 0.0,
            transparent: Vec3::ZERO,
            emission: Vec3::ZERO,
            subsurface: Vec3::ZERO,
            subsurface_radius: Vec3::ZERO,
            falloff: BssrdfFalloff::Cubic,
            volume: None,
        }
    }
}

impl SurfaceShader {
    pub fn diffuse(color: Vec3) -> Self {
        Self {
            diffuse: color,
            ..Default::default()
        }
    }

    pub fn emissive(emission: Vec3) -> Self {
        Self {
            diffuse: Vec3::ZERO,
            emission,
            ..Default::default()
        }
    }

    /// Volume boundary with no surface of its own; rays and shadows pass
    /// straight through it.
    pub fn volume_only(volume: VolumeShader) -> Self {
        Self {
            diffuse: Vec3::ZERO,
            transparent: Vec3::ONE,
            volume: Some(volume),
            ..Default::default()
        }
    }

    /// Scene flags matching the closures this shader produces.
    pub fn flags(&self) -> ShaderFlags {
        let mut flags = ShaderFlags::USE_MIS;
        if self.transparent != Vec3::ZERO {
            flags |= ShaderFlags::HAS_SURFACE_TRANSPARENT | ShaderFlags::HAS_TRANSPARENT_SHADOW;
        }
        if self.emission != Vec3::ZERO {
            flags |= ShaderFlags::HAS_EMISSION;
        }
        if self.subsurface != Vec3::ZERO {
            flags |= ShaderFlags::HAS_BSSRDF;
        }
        if let Some(volume) = &self.volume {
            flags |= ShaderFlags::HAS_VOLUME;
            if volume.density.is_some() {
                flags |= ShaderFlags::HETEROGENEOUS_VOLUME;
            }
        }
        flags
    }
}

/// `ShadingEvaluator` over a list of `SurfaceShader`s indexed by shader id.
#[derive(Debug, Clone, Default)]
pub struct ShaderTable {
    pub shaders: Vec<SurfaceShader>,
    pub background: Vec3,
}

impl ShaderTable {
    pub fn new(background: Vec3) -> Self {
        Self {
            shaders: Vec::new(),
            background,
        }
    }

    /// Append a shader; returns its id.
    pub fn add(&mut self, shader: SurfaceShader) -> u32 {
        self.shaders.push(shader);
        (self.shaders.len() - 1) as u32
    }
}

impl ShadingEvaluator for ShaderTable {
    fn evaluate_surface(&self, sd: &ShaderData, _path_flag: PathRayFlags) -> ShaderClosures {
        let mut closures = ShaderClosures::new();
        let Some(shader) = self.shaders.get(sd.shader as usize) else {
            return closures;
        };
        closures.add_diffuse(shader.diffuse, sd.n);
        closures.add_glossy(shader.glossy, sd.n, shader.roughness);
        closures.add_transparent(shader.transparent);
        closures.add_bssrdf(
            shader.subsurface,
            BssrdfProfile::new(shader.falloff, shader.subsurface_radius),
            sd.n,
        );
        closures.add_emission(shader.emission);
        closures
    }

    fn evaluate_volume(&self, sd: &ShaderData, stack: &VolumeStack, _path_flag: PathRayFlags) -> VolumeClosures {
        let mut closures = VolumeClosures::default();
        let mut g_weight = 0.0;
        for entry in stack.iter() {
            let Some(volume) = self.shaders.get(entry.shader as usize).and_then(|s| s.volume) else {
                continue;
            };
            let density = volume.density.map_or(1.0, |f| f(sd.p).max(0.0));
            closures.absorption += volume.absorption * density;
            closures.scatter += volume.scatter * density;
            closures.emission += volume.emission * density;
            let w = (volume.scatter * density).element_sum();
            closures.phase.g += volume.anisotropy * w;
            g_weight += w;
        }
        closures.phase = HenyeyGreenstein::new(if g_weight > 0.0 {
            closures.phase.g / g_weight
        } else {
            0.0
        });
        closures
    }

    fn evaluate_background(&self, _ray: &Ray, _path_flag: PathRayFlags) -> Vec3 {
        self.background
    }
}
