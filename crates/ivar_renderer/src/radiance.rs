//! Radiance accumulation along a path.
//!
//! With light passes enabled every contribution lands in a pass channel:
//! direct and indirect light per closure category, emission, background and
//! ambient occlusion. The split happens at the first non-transparent bounce:
//! the BSDF weights of that bounce are stored per category and everything
//! collected further down the path is divided back out by the combined
//! first-bounce throughput and redistributed over those weights. Without
//! light passes everything goes into `emission`.

use ivar_math::{Vec3, Vec4};

use crate::state::{PathRayFlags, PathState};

/// Pass category a closure contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureChannel {
    Diffuse,
    Glossy,
    Transmission,
    Transparent,
    Subsurface,
    Scatter,
}

/// A BSDF (or phase function) value split by closure category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BsdfEval {
    pub use_light_pass: bool,
    pub diffuse: Vec3,
    pub glossy: Vec3,
    pub transmission: Vec3,
    pub transparent: Vec3,
    pub subsurface: Vec3,
    pub scatter: Vec3,
}

impl BsdfEval {
    pub fn new(use_light_pass: bool) -> Self {
        Self {
            use_light_pass,
            diffuse: Vec3::ZERO,
            glossy: Vec3::ZERO,
            transmission: Vec3::ZERO,
            transparent: Vec3::ZERO,
            subsurface: Vec3::ZERO,
            scatter: Vec3::ZERO,
        }
    }

    pub fn with_value(use_light_pass: bool, channel: ClosureChannel, value: Vec3) -> Self {
        let mut eval = Self::new(use_light_pass);
        eval.accum(channel, value);
        eval
    }

    pub fn accum(&mut self, channel: ClosureChannel, value: Vec3) {
        if !self.use_light_pass {
            self.diffuse += value;
            return;
        }
        match channel {
            ClosureChannel::Diffuse => self.diffuse += value,
            ClosureChannel::Glossy => self.glossy += value,
            ClosureChannel::Transmission => self.transmission += value,
            ClosureChannel::Transparent => self.transparent += value,
            ClosureChannel::Subsurface => self.subsurface += value,
            ClosureChannel::Scatter => self.scatter += value,
        }
    }

    /// Sum over the light-carrying channels; transparency is not light.
    pub fn sum(&self) -> Vec3 {
        self.diffuse + self.glossy + self.transmission + self.subsurface + self.scatter
    }

    pub fn is_zero(&self) -> bool {
        self.sum() == Vec3::ZERO && self.transparent == Vec3::ZERO
    }

    pub fn mul(&mut self, value: Vec3) {
        self.diffuse *= value;
        self.glossy *= value;
        self.transmission *= value;
        self.transparent *= value;
        self.subsurface *= value;
        self.scatter *= value;
    }
}

/// Light-pass channels of one category, direct and indirect.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LightChannels {
    pub diffuse: Vec3,
    pub glossy: Vec3,
    pub transmission: Vec3,
    pub subsurface: Vec3,
    pub scatter: Vec3,
}

impl LightChannels {
    pub fn sum(&self) -> Vec3 {
        self.diffuse + self.glossy + self.transmission + self.subsurface + self.scatter
    }

    fn scale(&mut self, s: f32) {
        self.diffuse *= s;
        self.glossy *= s;
        self.transmission *= s;
        self.subsurface *= s;
        self.scatter *= s;
    }

    /// Add `light` weighted per category by `weights`.
    fn accum_weighted(&mut self, weights: &LightChannels, light: Vec3) {
        self.diffuse += weights.diffuse * light;
        self.glossy += weights.glossy * light;
        self.transmission += weights.transmission * light;
        self.subsurface += weights.subsurface * light;
        self.scatter += weights.scatter * light;
    }

    fn accum_eval(&mut self, throughput: Vec3, eval: &BsdfEval, shadow: Vec3) {
        self.diffuse += throughput * eval.diffuse * shadow;
        self.glossy += throughput * eval.glossy * shadow;
        self.transmission += throughput * eval.transmission * shadow;
        self.subsurface += throughput * eval.subsurface * shadow;
        self.scatter += throughput * eval.scatter * shadow;
    }
}

/// Radiance gathered by one path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRadiance {
    pub use_light_pass: bool,

    pub emission: Vec3,
    pub background: Vec3,
    pub ao: Vec3,
    /// Unoccluded fraction of lamp samples (rgb) over their count (w)
    pub shadow: Vec4,
    /// Alpha lost to the background through transparent surfaces
    pub transparent: f32,

    pub direct: LightChannels,
    pub indirect: LightChannels,

    /// First-bounce weights per category
    pub path: LightChannels,
    /// Combined first-bounce throughput the collected light is divided by
    pub direct_throughput: Vec3,
    /// Light collected by BSDF sampling from the second vertex
    pub direct_emission: Vec3,
    /// Light collected further down the path
    pub indirect_sum: Vec3,

    /// Direct lighting ignoring occlusion
    pub path_total: Vec3,
}

impl PathRadiance {
    pub fn new(use_light_pass: bool) -> Self {
        Self {
            use_light_pass,
            emission: Vec3::ZERO,
            background: Vec3::ZERO,
            ao: Vec3::ZERO,
            shadow: Vec4::ZERO,
            transparent: 0.0,
            direct: LightChannels::default(),
            indirect: LightChannels::default(),
            path: LightChannels::default(),
            direct_throughput: Vec3::ZERO,
            direct_emission: Vec3::ZERO,
            indirect_sum: Vec3::ZERO,
            path_total: Vec3::ZERO,
        }
    }

    /// Update `throughput` for a sampled bounce with BSDF value `eval` and
    /// pdf `pdf`, splitting categories at the first real bounce.
    pub fn bsdf_bounce(
        &mut self,
        state: &PathState,
        throughput: &mut Vec3,
        eval: &BsdfEval,
        pdf: f32,
        transparent: bool,
    ) {
        let inverse_pdf = 1.0 / pdf;

        if !self.use_light_pass {
            *throughput *= eval.diffuse * inverse_pdf;
            return;
        }

        if state.depth() == 0 && !transparent {
            let value = *throughput * inverse_pdf;
            self.path = LightChannels {
                diffuse: eval.diffuse * value,
                glossy: eval.glossy * value,
                transmission: eval.transmission * value,
                subsurface: eval.subsurface * value,
                scatter: eval.scatter * value,
            };
            *throughput = self.path.sum();
            self.direct_throughput = *throughput;
        } else {
            *throughput *= (eval.sum() + eval.transparent) * inverse_pdf;
        }
    }

    /// Emission seen by the path at its current vertex.
    pub fn accum_emission(&mut self, state: &PathState, throughput: Vec3, value: Vec3) {
        let contribution = throughput * value;
        if !self.use_light_pass {
            self.emission += contribution;
            return;
        }
        match state.depth() {
            0 => self.emission += contribution,
            1 => self.direct_emission += contribution,
            _ => self.indirect_sum += contribution,
        }
    }

    /// Background reached by the path.
    pub fn accum_background(&mut self, state: &PathState, throughput: Vec3, value: Vec3) {
        if state.flag.contains(PathRayFlags::TRANSPARENT_BACKGROUND) {
            self.transparent += throughput.element_sum() / 3.0;
            return;
        }
        let contribution = throughput * value;
        if !self.use_light_pass {
            self.emission += contribution;
            return;
        }
        match state.depth() {
            0 => self.background += contribution,
            1 => self.direct_emission += contribution,
            _ => self.indirect_sum += contribution,
        }
    }

    /// Light sample connected at the current vertex. `shadow` is the
    /// transmittance towards the light, `is_lamp` marks samples that count
    /// towards the shadow pass.
    pub fn accum_light(
        &mut self,
        state: &PathState,
        throughput: Vec3,
        eval: &BsdfEval,
        shadow: Vec3,
        is_lamp: bool,
    ) {
        if !self.use_light_pass {
            self.emission += throughput * eval.diffuse * shadow;
            return;
        }
        if state.depth() == 0 {
            self.direct.accum_eval(throughput, eval, shadow);
            if is_lamp {
                self.shadow += shadow.extend(1.0);
            }
        } else {
            self.indirect_sum += throughput * eval.sum() * shadow;
        }
    }

    /// Light sample contribution before occlusion.
    pub fn accum_total_light(&mut self, state: &PathState, throughput: Vec3, eval: &BsdfEval) {
        if state.depth() == 0 {
            self.path_total += throughput * eval.sum();
        }
    }

    /// Ambient occlusion sample; `alpha` is the surface coverage and `bsdf`
    /// the diffuse albedo the occlusion is weighted with.
    pub fn accum_ao(&mut self, state: &PathState, throughput: Vec3, alpha: f32, bsdf: Vec3, ao: Vec3) {
        if !self.use_light_pass {
            self.emission += throughput * bsdf * ao;
            return;
        }
        if state.depth() == 0 {
            self.direct.diffuse += throughput * bsdf * ao;
            self.ao += alpha * throughput * ao;
        } else {
            self.indirect_sum += throughput * bsdf * ao;
        }
    }

    /// Move light collected behind the first bounce into the per-category
    /// pass channels.
    pub fn sum_indirect(&mut self) {
        if !self.use_light_pass {
            return;
        }
        let direct_emission = safe_divide_color(self.direct_emission, self.direct_throughput);
        self.direct.accum_weighted(&self.path, direct_emission);

        let indirect = safe_divide_color(self.indirect_sum, self.direct_throughput);
        self.indirect.accum_weighted(&self.path, indirect);
    }

    /// Forget the first-bounce split before starting another branch.
    pub fn reset_indirect(&mut self) {
        if !self.use_light_pass {
            return;
        }
        self.path = LightChannels::default();
        self.direct_emission = Vec3::ZERO;
        self.indirect_sum = Vec3::ZERO;
    }

    /// Radiance the pixel receives from this path.
    pub fn sum(&self) -> Vec3 {
        if !self.use_light_pass {
            return self.emission;
        }
        self.direct_sum() + self.indirect.sum()
    }

    fn direct_sum(&self) -> Vec3 {
        self.direct.sum() + self.emission + self.background
    }

    /// Finish the path: reject non-finite results and scale channel groups
    /// whose sum exceeds the clamp. A clamp of zero disables it.
    pub fn clamp_and_sum(&mut self, clamp_direct: f32, clamp_indirect: f32) -> Vec3 {
        self.sum_indirect();
        self.reset_indirect();

        let total = self.sum();
        if !(total.abs().element_sum()).is_finite() {
            log::trace!("Discarding non-finite path radiance {:?}", total);
            self.zero();
            return Vec3::ZERO;
        }

        if !self.use_light_pass {
            let s = self.emission.abs().element_sum();
            if clamp_direct > 0.0 && s > clamp_direct {
                self.emission *= clamp_direct / s;
            }
            return self.sum();
        }

        let direct = self.direct_sum().abs().element_sum();
        if clamp_direct > 0.0 && direct > clamp_direct {
            let scale = clamp_direct / direct;
            self.direct.scale(scale);
            self.emission *= scale;
            self.background *= scale;
        }

        let indirect = self.indirect.sum().abs().element_sum();
        if clamp_indirect > 0.0 && indirect > clamp_indirect {
            self.indirect.scale(clamp_indirect / indirect);
        }

        self.sum()
    }

    fn zero(&mut self) {
        *self = Self {
            transparent: self.transparent,
            ..Self::new(self.use_light_pass)
        };
    }
}

fn safe_divide_color(a: Vec3, b: Vec3) -> Vec3 {
    let div = |x: f32, y: f32| if y != 0.0 { x / y } else { 0.0 };
    Vec3::new(div(a.x, b.x), div(a.y, b.y), div(a.z, b.z))
}
