//! The path integration loop.
//!
//! `PathIntegrator::trace` follows one camera sample through the scene. Each
//! iteration intersects the ray, integrates the volumes the segment crosses,
//! shades the hit, connects to a light and samples the next direction, until
//! the path escapes, is absorbed or loses at Russian roulette.
//!
//! Light sampling and BSDF sampling both see emitters that report
//! `use_mis`; the two estimates are combined with the power heuristic.

use std::fs;
use std::path::Path;

use ivar_math::{Vec3, Vec4};
use serde::Deserialize;
use thiserror::Error;

use crate::accel::Accel;
use crate::device::DeviceCapabilities;
use crate::intersection::Intersection;
use crate::light::{power_heuristic, EmitterHit, LightKind, LightSample, LightSampler};
use crate::radiance::{BsdfEval, ClosureChannel, PathRadiance};
use crate::ray::{offset_ray_origin, Ray};
use crate::sampling::{dim, sample_cos_hemisphere, LcgSampler, Sampler, SamplingPattern};
use crate::shader::{
    BsdfKind, BsdfLabel, DiffuseBsdf, ShaderClosures, ShaderData, ShaderDataFlags, ShadingEvaluator,
};
use crate::shadow::{ShadowResolver, ShadowStrategy};
use crate::state::{PathRayFlags, PathState, VolumeStack};
use crate::subsurface::{pick_closure, find_exit_points, ClosurePick, DiskSample};
use crate::volume::{HenyeyGreenstein, VolumeIntegrateResult, VolumeIntegrator};

/// Scramble for the reservoir sampler of subsurface disk rays.
const SUBSURFACE_SCRAMBLE: u32 = 0x68bc_21eb;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed integrator config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid integrator config: {0}")]
    Invalid(String),
}

/// Integrator settings.
///
/// Loaded from JSON with every field optional; unknown fields are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegratorConfig {
    pub max_bounce: u32,
    pub max_diffuse_bounce: u32,
    pub max_glossy_bounce: u32,
    pub max_transmission_bounce: u32,
    pub max_volume_bounce: u32,
    pub max_transparent_bounce: u32,
    /// Transparent bounces that always survive Russian roulette
    pub transparent_min_bounce: u32,
    /// Bounces that always survive Russian roulette
    pub min_bounce: u32,

    pub transparent_shadows: bool,
    /// Keep per-category light passes instead of one combined value
    pub use_light_pass: bool,

    /// Per-sample clamp on direct light; 0 disables
    pub sample_clamp_direct: f32,
    /// Per-sample clamp on indirect light; 0 disables
    pub sample_clamp_indirect: f32,
    /// Widen glossy lobes behind blurry bounces; 0 disables
    pub filter_glossy: f32,
    /// Allow glossy reflection after a diffuse bounce
    pub caustics_reflective: bool,

    /// Ambient occlusion ray length; 0 disables the pass
    pub ao_distance: f32,
    /// Strength of ambient occlusion added as diffuse light
    pub ao_factor: f32,

    pub volume_step_size: f32,
    pub volume_max_steps: usize,

    /// Light samples below this contribution are dropped stochastically
    pub light_sampling_threshold: f32,

    pub sampling_pattern: SamplingPattern,
    pub samples: u32,
    pub seed: u32,
    /// Background misses count towards alpha instead of color
    pub transparent_background: bool,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            max_bounce: 12,
            max_diffuse_bounce: 4,
            max_glossy_bounce: 4,
            max_transmission_bounce: 12,
            max_volume_bounce: 1,
            max_transparent_bounce: 8,
            transparent_min_bounce: 8,
            min_bounce: 1,
            transparent_shadows: true,
            use_light_pass: true,
            sample_clamp_direct: 0.0,
            sample_clamp_indirect: 0.0,
            filter_glossy: 0.0,
            caustics_reflective: true,
            ao_distance: 0.0,
            ao_factor: 0.0,
            volume_step_size: 0.1,
            volume_max_steps: 1024,
            light_sampling_threshold: 0.0,
            sampling_pattern: SamplingPattern::SobolBurley,
            samples: 16,
            seed: 0,
            transparent_background: false,
        }
    }
}

impl IntegratorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.samples == 0 {
            return Err(ConfigError::Invalid("samples must be at least 1".into()));
        }
        if !(self.volume_step_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "volume_step_size must be positive, got {}",
                self.volume_step_size
            )));
        }
        if self.volume_max_steps == 0 {
            return Err(ConfigError::Invalid("volume_max_steps must be at least 1".into()));
        }
        for (name, value) in [
            ("sample_clamp_direct", self.sample_clamp_direct),
            ("sample_clamp_indirect", self.sample_clamp_indirect),
            ("filter_glossy", self.filter_glossy),
            ("ao_distance", self.ao_distance),
            ("light_sampling_threshold", self.light_sampling_threshold),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::Invalid(format!("{} must not be negative, got {}", name, value)));
            }
        }
        Ok(())
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// Set the total bounce limit and every per-category limit to `bounces`.
    pub fn with_bounces(mut self, bounces: u32) -> Self {
        self.max_bounce = bounces;
        self.max_diffuse_bounce = bounces;
        self.max_glossy_bounce = bounces;
        self.max_transmission_bounce = bounces;
        self
    }

    pub fn with_light_passes(mut self, enabled: bool) -> Self {
        self.use_light_pass = enabled;
        self
    }

    pub fn with_clamp(mut self, direct: f32, indirect: f32) -> Self {
        self.sample_clamp_direct = direct;
        self.sample_clamp_indirect = indirect;
        self
    }
}

/// Everything one camera sample produced.
#[derive(Debug, Clone)]
pub struct PathResult {
    /// Clamped color and alpha
    pub combined: Vec4,
    pub radiance: PathRadiance,
}

/// Traces paths through one committed scene.
pub struct PathIntegrator<'a> {
    accel: &'a dyn Accel,
    shading: &'a dyn ShadingEvaluator,
    lights: &'a dyn LightSampler,
    config: &'a IntegratorConfig,
    sampler: Sampler,
    volumes: VolumeIntegrator<'a>,
    capabilities: DeviceCapabilities,
    shadow_strategy: ShadowStrategy,
}

impl<'a> PathIntegrator<'a> {
    pub fn new(
        accel: &'a dyn Accel,
        shading: &'a dyn ShadingEvaluator,
        lights: &'a dyn LightSampler,
        config: &'a IntegratorConfig,
    ) -> Self {
        let sampler = Sampler::new(config.sampling_pattern, config.samples);
        let capabilities = accel.device().capabilities();
        let shadow_strategy = ShadowStrategy::for_capabilities(&capabilities);
        Self {
            accel,
            shading,
            lights,
            config,
            sampler,
            volumes: VolumeIntegrator {
                shading,
                sampler,
                config,
                shader_flags: &accel.pack().shader_flags,
            },
            capabilities,
            shadow_strategy,
        }
    }

    pub fn with_shadow_strategy(mut self, strategy: ShadowStrategy) -> Self {
        self.shadow_strategy = strategy;
        self
    }

    /// Trace one camera sample. `volume_stack` holds the volumes enclosing
    /// the camera.
    pub fn trace(&self, camera_ray: &Ray, rng_hash: u32, sample: u32, volume_stack: &VolumeStack) -> PathResult {
        let mut state = PathState::new(rng_hash, sample, self.config.transparent_background);
        if self.capabilities.volumes {
            state.volume_stack = volume_stack.clone();
        }
        let mut radiance = PathRadiance::new(self.config.use_light_pass);
        let mut throughput = Vec3::ONE;
        let mut ray = *camera_ray;

        self.integrate(&mut state, &mut ray, &mut throughput, &mut radiance);

        let color = radiance.clamp_and_sum(self.config.sample_clamp_direct, self.config.sample_clamp_indirect);
        let alpha = (1.0 - radiance.transparent).clamp(0.0, 1.0);
        PathResult {
            combined: color.extend(alpha),
            radiance,
        }
    }

    #[inline]
    fn sample_1d(&self, state: &PathState, offset: u32) -> f32 {
        self.sampler
            .sample_1d(state.rng_hash, state.sample, state.dimension(offset))
    }

    #[inline]
    fn sample_2d(&self, state: &PathState, offset: u32) -> (f32, f32) {
        self.sampler
            .sample_2d(state.rng_hash, state.sample, state.dimension(offset))
    }

    fn shadow_resolver(&self) -> ShadowResolver<'_> {
        ShadowResolver {
            accel: self.accel,
            shading: self.shading,
            volumes: &self.volumes,
            config: self.config,
            strategy: self.shadow_strategy,
        }
    }

    /// Russian roulette at the current vertex. Returns false when the path
    /// ends; survivors have `throughput` scaled by the inverse probability.
    fn survive(&self, state: &PathState, throughput: &mut Vec3) -> bool {
        let probability = state.continuation_probability(self.config, *throughput);
        if probability == 0.0 {
            return false;
        }
        if probability < 1.0 {
            if self.sample_1d(state, dim::TERMINATE) >= probability {
                return false;
            }
            *throughput /= probability;
        }
        true
    }

    fn integrate(&self, state: &mut PathState, ray: &mut Ray, throughput: &mut Vec3, radiance: &mut PathRadiance) {
        loop {
            let hit = self.accel.intersect(ray, state.flag.visibility());
            if let Some(isect) = &hit {
                ray.clip(isect.t);
            }

            if !state.volume_stack.is_empty() {
                if let VolumeIntegrateResult::Scattered { t, phase } =
                    self.volumes.integrate(state, ray, throughput, radiance)
                {
                    if self.scatter_volume(state, ray, t, phase, throughput, radiance) {
                        continue;
                    }
                    return;
                }
                if *throughput == Vec3::ZERO {
                    return;
                }
            }

            let Some(isect) = hit else {
                self.accum_background(state, ray, *throughput, radiance);
                return;
            };

            let sd = ShaderData::from_intersection(self.accel.pack(), &isect, ray);
            let mut closures = self.shading.evaluate_surface(&sd, state.flag);

            let diffuse_ancestor = state.flag.contains(PathRayFlags::DIFFUSE_ANCESTOR);
            if diffuse_ancestor || !self.capabilities.subsurface {
                closures.convert_bssrdfs_to_diffuse();
            }
            if diffuse_ancestor {
                closures.filter_caustics(self.config.caustics_reflective);
            }
            self.blur_glossy(state, &mut closures);

            if closures.emission != Vec3::ZERO {
                let emission = self.surface_emission(state, &sd, &isect, ray, closures.emission);
                radiance.accum_emission(state, *throughput, emission);
            }

            if !closures.has_bsdf() && !closures.has_bssrdf() {
                return;
            }

            if !self.survive(state, throughput) {
                return;
            }

            if state.depth() == 0 && self.config.ao_distance > 0.0 {
                self.ambient_occlusion(state, &sd, &closures, *throughput, radiance);
            }

            let mut pick = self.sample_1d(state, dim::BSDF_PICK);
            if closures.has_bssrdf() {
                let (choice, rescaled) = pick_closure(&closures, pick, throughput);
                match choice {
                    ClosurePick::Bssrdf(index) => {
                        self.scatter_subsurface(state, &sd, &closures, index, *throughput, radiance);
                        return;
                    }
                    ClosurePick::Bsdf => {
                        closures.remove_bssrdfs();
                        pick = rescaled;
                    }
                }
            }

            if closures.has_bsdf_eval() {
                self.connect_light(state, &sd, &closures, *throughput, radiance);
            }

            let differentials = ray
                .differentials
                .map(|d| d.transfer(ray.direction, isect.t, sd.ng));
            match self.scatter_surface(state, &sd, &closures, pick, throughput, radiance) {
                Some(mut next) => {
                    next.differentials = differentials;
                    *ray = next;
                }
                None => return,
            }
        }
    }

    fn blur_glossy(&self, state: &PathState, closures: &mut ShaderClosures) {
        if self.config.filter_glossy <= 0.0 || state.min_ray_pdf == f32::MAX {
            return;
        }
        let blur_pdf = state.min_ray_pdf / self.config.filter_glossy;
        if blur_pdf < 1.0 {
            closures.blur((1.0 - blur_pdf).sqrt() * 0.5);
        }
    }

    /// Emission of a hit surface, MIS weighted against light sampling when
    /// the previous bounce could have been importance sampled.
    fn surface_emission(
        &self,
        state: &PathState,
        sd: &ShaderData,
        isect: &Intersection,
        ray: &Ray,
        emission: Vec3,
    ) -> Vec3 {
        if state.flag.contains(PathRayFlags::MIS_SKIP) || !sd.flag.contains(ShaderDataFlags::USE_MIS) {
            return emission;
        }
        let hit = EmitterHit {
            p: sd.p,
            ng: isect.ng,
            object: isect.object,
            prim: isect.prim,
        };
        let light_pdf = self
            .lights
            .light_pdf(ray.origin, &hit, ray.direction, sd.ray_length);
        emission * power_heuristic(state.ray_pdf, light_pdf)
    }

    fn accum_background(&self, state: &PathState, ray: &Ray, throughput: Vec3, radiance: &mut PathRadiance) {
        let mut value = self.shading.evaluate_background(ray, state.flag);
        if !state.flag.contains(PathRayFlags::MIS_SKIP) {
            let light_pdf = self.lights.background_pdf(ray.direction.normalize_or_zero());
            value *= power_heuristic(state.ray_pdf, light_pdf);
        }
        radiance.accum_background(state, throughput, value);
    }

    fn ambient_occlusion(
        &self,
        state: &PathState,
        sd: &ShaderData,
        closures: &ShaderClosures,
        throughput: Vec3,
        radiance: &mut PathRadiance,
    ) {
        let albedo = closures.diffuse_albedo();
        if albedo == Vec3::ZERO {
            return;
        }
        let (u, v) = self.sample_2d(state, dim::BSDF_U);
        let (direction, pdf) = sample_cos_hemisphere(sd.n, u, v);
        if pdf <= 0.0 || sd.ng.dot(direction) <= 0.0 {
            return;
        }
        let alpha = 1.0 - closures.transparency().element_sum() / 3.0;
        let ray = Ray::segment(
            offset_ray_origin(sd.p, sd.ng, direction),
            direction,
            self.config.ao_distance,
            sd.time,
        );
        if let Some(ao) = self.shadow_resolver().resolve(state, &ray) {
            radiance.accum_ao(state, throughput, alpha, albedo * self.config.ao_factor, ao);
        }
    }

    fn connect_light(
        &self,
        state: &PathState,
        sd: &ShaderData,
        closures: &ShaderClosures,
        throughput: Vec3,
        radiance: &mut PathRadiance,
    ) {
        let (u, v) = self.sample_2d(state, dim::LIGHT_U);
        let Some(ls) = self.lights.sample_light(sd.p, u, v, sd.time) else {
            return;
        };
        let (eval, bsdf_pdf) = closures.eval(sd, ls.d, self.config.use_light_pass);
        let origin = offset_ray_origin(sd.p, sd.ng, ls.d);
        self.accum_light_sample(state, origin, sd.time, &ls, eval, bsdf_pdf, throughput, radiance);
    }

    #[allow(clippy::too_many_arguments)]
    fn accum_light_sample(
        &self,
        state: &PathState,
        origin: Vec3,
        time: f32,
        ls: &LightSample,
        mut eval: BsdfEval,
        bsdf_pdf: f32,
        throughput: Vec3,
        radiance: &mut PathRadiance,
    ) {
        if ls.pdf <= 0.0 || ls.eval == Vec3::ZERO || eval.is_zero() {
            return;
        }
        let mis = if ls.use_mis && !ls.is_delta() {
            power_heuristic(ls.pdf, bsdf_pdf)
        } else {
            1.0
        };
        eval.mul(ls.eval * (mis / ls.pdf));

        let threshold = self.config.light_sampling_threshold;
        if threshold > 0.0 {
            let probability = eval.sum().abs().max_element() / threshold;
            if probability < 1.0 {
                if self.sample_1d(state, dim::LIGHT_TERMINATE) >= probability {
                    return;
                }
                eval.mul(Vec3::splat(1.0 / probability));
            }
        }

        radiance.accum_total_light(state, throughput, &eval);

        let shadow_ray = if ls.kind == LightKind::Background {
            Ray::new(origin, ls.d, time)
        } else {
            let end = if ls.kind == LightKind::Area {
                offset_ray_origin(ls.p, ls.n, -ls.d)
            } else {
                ls.p
            };
            let to_light = end - origin;
            let length = to_light.length();
            if length <= 0.0 {
                return;
            }
            Ray::segment(origin, to_light / length, length, time)
        };

        let shadow = self
            .shadow_resolver()
            .resolve(state, &shadow_ray)
            .unwrap_or(Vec3::ZERO);
        radiance.accum_light(state, throughput, &eval, shadow, ls.kind == LightKind::Point);
    }

    /// Sample the next direction from `closures`. `None` ends the path.
    fn scatter_surface(
        &self,
        state: &mut PathState,
        sd: &ShaderData,
        closures: &ShaderClosures,
        pick: f32,
        throughput: &mut Vec3,
        radiance: &mut PathRadiance,
    ) -> Option<Ray> {
        let (u, v) = self.sample_2d(state, dim::BSDF_U);
        let (eval, pdf, sample) = closures.sample(sd, pick, u, v, self.config.use_light_pass)?;
        if pdf <= 0.0 || eval.is_zero() {
            return None;
        }

        let transparent = sample.label.contains(BsdfLabel::TRANSPARENT);
        radiance.bsdf_bounce(state, throughput, &eval, pdf, transparent);
        if !transparent {
            state.ray_pdf = pdf;
            state.min_ray_pdf = state.min_ray_pdf.min(pdf);
        }
        state.next(sample.label);

        if sample.label.contains(BsdfLabel::TRANSMIT) && self.capabilities.volumes {
            state.volume_stack.enter_exit(sd);
        }

        Some(Ray::new(
            offset_ray_origin(sd.p, sd.ng, sample.omega_in),
            sample.omega_in,
            sd.time,
        ))
    }

    /// Continue a path scattered at distance `t` inside a volume. Returns
    /// false when the path ends.
    fn scatter_volume(
        &self,
        state: &mut PathState,
        ray: &mut Ray,
        t: f32,
        phase: HenyeyGreenstein,
        throughput: &mut Vec3,
        radiance: &mut PathRadiance,
    ) -> bool {
        let p = ray.at(t);
        let direction = ray.direction.normalize_or_zero();

        if !self.survive(state, throughput) {
            return false;
        }

        let (u, v) = self.sample_2d(state, dim::LIGHT_U);
        if let Some(ls) = self.lights.sample_light(p, u, v, ray.time) {
            let phase_pdf = phase.pdf(direction.dot(ls.d));
            let eval = BsdfEval::with_value(
                self.config.use_light_pass,
                ClosureChannel::Scatter,
                Vec3::splat(phase_pdf),
            );
            self.accum_light_sample(state, p, ray.time, &ls, eval, phase_pdf, *throughput, radiance);
        }

        let (u, v) = self.sample_2d(state, dim::BSDF_U);
        let (omega_in, pdf) = phase.sample(direction, u, v);
        if pdf <= 0.0 {
            return false;
        }
        let eval = BsdfEval::with_value(self.config.use_light_pass, ClosureChannel::Scatter, Vec3::splat(pdf));
        radiance.bsdf_bounce(state, throughput, &eval, pdf, false);
        state.ray_pdf = pdf;
        state.min_ray_pdf = state.min_ray_pdf.min(pdf);
        state.next(BsdfLabel::VOLUME_SCATTER);

        *ray = Ray::new(p, omega_in, ray.time);
        true
    }

    /// Replace the path at `sd` by one continuation per point the subsurface
    /// disk ray finds. Each continuation is a diffuse vertex in the subsurface
    /// channel with its own light sample and indirect path.
    fn scatter_subsurface(
        &self,
        state: &PathState,
        sd: &ShaderData,
        closures: &ShaderClosures,
        index: usize,
        throughput: Vec3,
        radiance: &mut PathRadiance,
    ) {
        let (radius, angle) = self.sample_2d(state, dim::BSSRDF_U);
        let sample = DiskSample {
            axis: self.sample_1d(state, dim::BSSRDF_AXIS),
            radius,
            angle,
        };
        let mut lcg = LcgSampler::for_path(state.rng_hash, state.rng_offset, state.sample, SUBSURFACE_SCRAMBLE);
        let hits = find_exit_points(
            self.accel,
            sd,
            &closures.bssrdfs[index],
            closures.bssrdf_sample_weight(),
            sample,
            &mut lcg,
        );

        // Every continuation restarts from the split the path had here.
        radiance.sum_indirect();
        let path = radiance.path;
        let direct_throughput = radiance.direct_throughput;
        radiance.reset_indirect();

        for (i, hit) in hits.iter().enumerate() {
            let mut hit_state = state.clone();
            hit_state.flag |= PathRayFlags::DIFFUSE_ANCESTOR;
            hit_state.rng_offset += i as u32 * dim::BOUNCE_NUM;
            if self.capabilities.volumes {
                hit_state
                    .volume_stack
                    .update_for_segment(self.accel, sd.p, hit.sd.p, sd.time);
            }

            let mut hit_closures = ShaderClosures::new();
            hit_closures.add_bsdf(
                hit.weight,
                BsdfKind::Diffuse(DiffuseBsdf {
                    n: hit.sd.n,
                    channel: ClosureChannel::Subsurface,
                }),
            );

            radiance.path = path;
            radiance.direct_throughput = direct_throughput;
            let mut hit_throughput = throughput;
            self.connect_light(&hit_state, &hit.sd, &hit_closures, hit_throughput, radiance);

            let pick = self.sample_1d(&hit_state, dim::BSDF_PICK);
            if let Some(mut ray) =
                self.scatter_surface(&mut hit_state, &hit.sd, &hit_closures, pick, &mut hit_throughput, radiance)
            {
                self.integrate(&mut hit_state, &mut ray, &mut hit_throughput, radiance);
            }

            radiance.sum_indirect();
            radiance.reset_indirect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BackendKind;
    use crate::light::{PointLight, PointLights};
    use crate::sampling::pixel_rng_hash;
    use crate::shader::{BssrdfFalloff, SurfaceShader, VolumeShader};
    use crate::testing::{quad_at_z, slab, TestScene};

    fn down_from(z: f32) -> Ray {
        Ray::new(Vec3::new(0.0, 0.0, z), -Vec3::Z, 0.0)
    }

    fn trace_mean(
        test: &TestScene,
        lights: &dyn LightSampler,
        config: &IntegratorConfig,
        ray: &Ray,
        samples: u32,
    ) -> Vec4 {
        let accel = test.build();
        let integrator = PathIntegrator::new(&accel, &test.table, lights, config);
        let stack = VolumeStack::new();
        let rng_hash = pixel_rng_hash(3, 7, config.seed);
        let mut sum = Vec4::ZERO;
        for sample in 0..samples {
            sum += integrator.trace(ray, rng_hash, sample, &stack).combined;
        }
        sum / samples as f32
    }

    fn lit_floor(occluded: bool) -> (TestScene, PointLights) {
        let mut test = TestScene::new(Vec3::ZERO);
        let floor = test.shader(SurfaceShader::diffuse(Vec3::splat(0.5)));
        test.add_mesh(quad_at_z(0.0, floor));
        if occluded {
            let blocker = test.shader(SurfaceShader::default());
            test.add_mesh(quad_at_z(1.5, blocker));
        }
        let lights = PointLights::new(vec![PointLight {
            position: Vec3::new(0.0, 0.0, 2.0),
            intensity: Vec3::splat(4.0),
            shader: 0,
        }]);
        (test, lights)
    }

    #[test]
    fn test_direct_emission_seen_by_camera() {
        let mut test = TestScene::new(Vec3::ZERO);
        let light = test.shader(SurfaceShader::emissive(Vec3::new(1.0, 2.0, 3.0)));
        test.add_mesh(quad_at_z(0.0, light));
        let config = IntegratorConfig::default();
        let color = trace_mean(&test, &PointLights::default(), &config, &down_from(1.0), 1);
        assert!((color - Vec4::new(1.0, 2.0, 3.0, 1.0)).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_point_light_on_diffuse_floor() {
        let (test, lights) = lit_floor(false);
        let config = IntegratorConfig::default();
        let accel = test.build();
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);
        let result = integrator.trace(&down_from(1.0), 17, 0, &VolumeStack::new());

        // albedo / pi * cos(0) * intensity / distance^2
        let expected = 0.5 / std::f32::consts::PI;
        assert!((result.combined.truncate() - Vec3::splat(expected)).abs().max_element() < 1e-4);
        assert!((result.radiance.direct.diffuse - Vec3::splat(expected)).abs().max_element() < 1e-4);
        assert_eq!(result.radiance.shadow, Vec4::ONE);
    }

    /// Uniform white sky sampled straight up.
    struct Zenith;

    impl LightSampler for Zenith {
        fn sample_light(&self, p: Vec3, _u: f32, _v: f32, _time: f32) -> Option<LightSample> {
            Some(LightSample {
                p: p + Vec3::Z,
                n: -Vec3::Z,
                d: Vec3::Z,
                t: f32::INFINITY,
                shader: 0,
                object: None,
                prim: None,
                kind: LightKind::Background,
                eval: Vec3::ONE,
                pdf: 1.0,
                use_mis: false,
            })
        }

        fn light_pdf(&self, _from: Vec3, _hit: &EmitterHit, _direction: Vec3, _distance: f32) -> f32 {
            0.0
        }
    }

    #[test]
    fn test_background_light_occlusion() {
        let config = IntegratorConfig::default().with_bounces(0);
        let expected = 0.5 / std::f32::consts::PI;
        for occluded in [false, true] {
            let (test, _) = lit_floor(occluded);
            let accel = test.build();
            for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
                let integrator =
                    PathIntegrator::new(&accel, &test.table, &Zenith, &config).with_shadow_strategy(strategy);
                let result = integrator.trace(&down_from(1.0), 5, 0, &VolumeStack::new());
                let direct = result.radiance.direct.diffuse;
                if occluded {
                    assert_eq!(direct, Vec3::ZERO, "{:?}", strategy);
                    assert_eq!(result.combined.truncate(), Vec3::ZERO, "{:?}", strategy);
                } else {
                    assert!((direct - Vec3::splat(expected)).abs().max_element() < 1e-4, "{:?}", strategy);
                }
            }
        }
    }

    #[test]
    fn test_occluded_point_light_is_black() {
        let (test, lights) = lit_floor(true);
        let config = IntegratorConfig::default();
        let accel = test.build();
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config).with_shadow_strategy(strategy);
            let result = integrator.trace(&down_from(1.0), 17, 0, &VolumeStack::new());
            assert_eq!(result.combined.truncate(), Vec3::ZERO);
            assert_eq!(result.radiance.shadow, Vec4::new(0.0, 0.0, 0.0, 1.0));
        }
        let color = trace_mean(&test, &lights, &config, &down_from(1.0), 32);
        assert_eq!(color.truncate(), Vec3::ZERO);
    }

    /// Two emissive planes of albedo 0.5 facing each other: L = 1 + 0.5 L.
    fn emissive_corridor() -> TestScene {
        let mut test = TestScene::new(Vec3::ZERO);
        let shader = test.shader(SurfaceShader {
            diffuse: Vec3::splat(0.5),
            emission: Vec3::ONE,
            ..Default::default()
        });
        test.add_mesh(quad_at_z(0.0, shader));
        test.add_mesh(quad_at_z(0.1, shader));
        test
    }

    #[test]
    fn test_russian_roulette_is_unbiased() {
        let test = emissive_corridor();
        let config = IntegratorConfig::default().with_bounces(64);
        let color = trace_mean(&test, &PointLights::default(), &config, &down_from(0.05), 2048);
        for c in color.truncate().to_array() {
            assert!((c - 2.0).abs() < 0.1, "mean {} expected 2", c);
        }
    }

    #[test]
    fn test_light_passes_match_combined() {
        let test = emissive_corridor();
        let lights = PointLights::new(vec![PointLight {
            position: Vec3::new(0.5, 0.0, 0.08),
            intensity: Vec3::new(0.2, 0.1, 0.05),
            shader: 0,
        }]);
        let split = IntegratorConfig::default();
        let combined = IntegratorConfig::default().with_light_passes(false);
        let accel = test.build();
        let a = PathIntegrator::new(&accel, &test.table, &lights, &split);
        let b = PathIntegrator::new(&accel, &test.table, &lights, &combined);
        for sample in 0..64 {
            let ray = down_from(0.05);
            let x = a.trace(&ray, 5, sample, &VolumeStack::new());
            let y = b.trace(&ray, 5, sample, &VolumeStack::new());
            let scale = 1.0 + y.combined.abs().max_element();
            assert!(
                (x.combined - y.combined).abs().max_element() < 1e-4 * scale,
                "sample {}: {:?} != {:?}",
                sample,
                x.combined,
                y.combined
            );
        }
    }

    #[test]
    fn test_clamp_limits_every_sample() {
        let test = emissive_corridor();
        let config = IntegratorConfig::default().with_bounces(64).with_clamp(1.5, 0.5);
        let accel = test.build();
        let lights = PointLights::default();
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);
        for sample in 0..64 {
            let result = integrator.trace(&down_from(0.05), 9, sample, &VolumeStack::new());
            let r = &result.radiance;
            let direct = (r.direct.sum() + r.emission + r.background).abs().element_sum();
            assert!(direct <= 1.5 + 1e-4);
            assert!(r.indirect.sum().abs().element_sum() <= 0.5 + 1e-4);
        }
    }

    #[test]
    fn test_transparent_layer_sets_alpha() {
        let mut test = TestScene::new(Vec3::ONE);
        let glass = test.shader(SurfaceShader {
            diffuse: Vec3::ZERO,
            transparent: Vec3::splat(0.5),
            ..Default::default()
        });
        test.add_mesh(quad_at_z(0.0, glass));
        let config = IntegratorConfig {
            transparent_background: true,
            ..Default::default()
        };
        let lights = PointLights::default();

        let through = trace_mean(&test, &lights, &config, &down_from(1.0), 1);
        assert!((through.w - 0.5).abs() < 1e-6);
        assert_eq!(through.truncate(), Vec3::ZERO);

        let miss = trace_mean(&test, &lights, &config, &Ray::new(Vec3::Z, Vec3::Z, 0.0), 1);
        assert_eq!(miss, Vec4::ZERO);
    }

    #[test]
    fn test_transparent_bounces_keep_budget() {
        let mut test = TestScene::new(Vec3::ZERO);
        let glass = test.shader(SurfaceShader {
            diffuse: Vec3::ZERO,
            transparent: Vec3::ONE,
            ..Default::default()
        });
        let light = test.shader(SurfaceShader::emissive(Vec3::ONE));
        for i in 0..4 {
            test.add_mesh(quad_at_z(-(i as f32) * 0.5, glass));
        }
        test.add_mesh(quad_at_z(-3.0, light));
        let config = IntegratorConfig {
            max_bounce: 0,
            ..Default::default()
        };
        let color = trace_mean(&test, &PointLights::default(), &config, &down_from(1.0), 1);
        assert!((color.truncate() - Vec3::ONE).abs().max_element() < 1e-6);

        let starved = IntegratorConfig {
            max_transparent_bounce: 2,
            ..config
        };
        let color = trace_mean(&test, &PointLights::default(), &starved, &down_from(1.0), 1);
        assert_eq!(color.truncate(), Vec3::ZERO);
    }

    #[test]
    fn test_absorbing_volume_between_camera_and_light() {
        let sigma = Vec3::new(0.5, 1.0, 2.0);
        let mut test = TestScene::new(Vec3::ZERO);
        let medium = test.shader(SurfaceShader::volume_only(VolumeShader {
            absorption: sigma,
            ..Default::default()
        }));
        let light = test.shader(SurfaceShader::emissive(Vec3::ONE));
        test.add_mesh(slab(-1.5, -0.5, medium));
        test.add_mesh(quad_at_z(-2.0, light));
        let config = IntegratorConfig::default();
        let color = trace_mean(&test, &PointLights::default(), &config, &down_from(0.0), 1);
        let expected = Vec3::new((-0.5f32).exp(), (-1.0f32).exp(), (-2.0f32).exp());
        assert!((color.truncate() - expected).abs().max_element() < 1e-4);
    }

    #[test]
    fn test_volumes_disabled_by_capabilities() {
        let mut test = TestScene::new(Vec3::ZERO);
        let medium = test.shader(SurfaceShader::volume_only(VolumeShader {
            absorption: Vec3::splat(1.0),
            ..Default::default()
        }));
        let light = test.shader(SurfaceShader::emissive(Vec3::ONE));
        test.add_mesh(slab(-1.5, -0.5, medium));
        test.add_mesh(quad_at_z(-2.0, light));

        let mut caps = DeviceCapabilities::for_backend(BackendKind::Software);
        caps.volumes = false;
        let accel = test.build_with(caps);
        let config = IntegratorConfig::default();
        let lights = PointLights::default();
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);
        let color = integrator.trace(&down_from(0.0), 1, 0, &VolumeStack::new()).combined;
        assert!((color.truncate() - Vec3::ONE).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_subsurface_disabled_shades_diffuse() {
        let mut test = TestScene::new(Vec3::ZERO);
        let skin = test.shader(SurfaceShader {
            diffuse: Vec3::ZERO,
            subsurface: Vec3::splat(0.8),
            subsurface_radius: Vec3::splat(0.2),
            falloff: BssrdfFalloff::Cubic,
            ..Default::default()
        });
        test.add_mesh(slab(-1.0, 0.0, skin));
        let lights = PointLights::new(vec![PointLight {
            position: Vec3::new(0.0, 0.0, 2.0),
            intensity: Vec3::splat(4.0),
            shader: 0,
        }]);
        let mut caps = DeviceCapabilities::for_backend(BackendKind::Software);
        caps.subsurface = false;
        let accel = test.build_with(caps);
        let config = IntegratorConfig::default().with_bounces(0);
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);

        // Lit like a diffuse surface of the subsurface color, in the subsurface pass.
        let result = integrator.trace(&down_from(1.0), 11, 0, &VolumeStack::new());
        let expected = 0.8 / std::f32::consts::PI;
        assert!((result.radiance.direct.subsurface - Vec3::splat(expected)).abs().max_element() < 1e-4);
    }

    #[test]
    fn test_subsurface_lights_through_subsurface_channel() {
        let mut test = TestScene::new(Vec3::ZERO);
        let skin = test.shader(SurfaceShader {
            diffuse: Vec3::ZERO,
            subsurface: Vec3::splat(0.8),
            subsurface_radius: Vec3::splat(0.2),
            falloff: BssrdfFalloff::Cubic,
            ..Default::default()
        });
        test.add_mesh(slab(-1.0, 0.0, skin));
        let lights = PointLights::new(vec![PointLight {
            position: Vec3::new(0.0, 0.0, 2.0),
            intensity: Vec3::splat(4.0),
            shader: 0,
        }]);
        let config = IntegratorConfig::default();
        let accel = test.build();
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);

        let mut subsurface = Vec3::ZERO;
        let mut total = Vec3::ZERO;
        for sample in 0..64 {
            let result = integrator.trace(&down_from(1.0), 11, sample, &VolumeStack::new());
            assert!(result.combined.is_finite());
            subsurface += result.radiance.direct.subsurface;
            total += result.combined.truncate();
        }
        assert!(subsurface.min_element() > 0.0);
        assert!(total.min_element() > 0.0);
    }

    #[test]
    fn test_ambient_occlusion_pass() {
        let mut test = TestScene::new(Vec3::ZERO);
        let floor = test.shader(SurfaceShader::diffuse(Vec3::splat(0.5)));
        test.add_mesh(quad_at_z(0.0, floor));
        let config = IntegratorConfig {
            ao_distance: 100.0,
            ..Default::default()
        };
        let lights = PointLights::default();
        let accel = test.build();
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);
        let open = integrator.trace(&down_from(1.0), 2, 0, &VolumeStack::new());
        assert_eq!(open.radiance.ao, Vec3::ONE);
        assert_eq!(open.combined.truncate(), Vec3::ZERO);

        test.add_mesh(quad_at_z(0.5, floor));
        let accel = test.build();
        let integrator = PathIntegrator::new(&accel, &test.table, &lights, &config);
        let mut ao = Vec3::ZERO;
        for sample in 0..64 {
            ao += integrator
                .trace(&Ray::new(Vec3::new(0.0, 0.0, 0.25), -Vec3::Z, 0.0), 2, sample, &VolumeStack::new())
                .radiance
                .ao;
        }
        assert!((ao / 64.0).max_element() < 0.1);
    }

    #[test]
    fn test_config_from_json() {
        let config = IntegratorConfig::from_json(
            r#"{ "max_bounce": 3, "sampling_pattern": "correlated_multi_jitter", "sample_clamp_indirect": 10.0 }"#,
        )
        .unwrap();
        assert_eq!(config.max_bounce, 3);
        assert_eq!(config.sampling_pattern, SamplingPattern::CorrelatedMultiJitter);
        assert_eq!(config.sample_clamp_indirect, 10.0);
        assert_eq!(config.max_diffuse_bounce, IntegratorConfig::default().max_diffuse_bounce);

        assert!(matches!(
            IntegratorConfig::from_json(r#"{ "max_bounces": 3 }"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            IntegratorConfig::from_json(r#"{ "volume_step_size": 0.0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            IntegratorConfig::load("/nonexistent/ivar/integrator.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
