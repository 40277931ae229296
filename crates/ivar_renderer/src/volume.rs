//! Participating media along path segments.
//!
//! Segments inside volumes whose shaders are all homogeneous are integrated
//! analytically; anything else is ray marched with fixed steps. Scattering
//! picks a color channel, samples a distance from that channel's extinction
//! and weights by the average pdf over channels.

use std::f32::consts::PI;

use ivar_math::{make_orthonormals, Vec3};
use ivar_scene::ShaderFlags;

use crate::integrator::IntegratorConfig;
use crate::radiance::PathRadiance;
use crate::ray::Ray;
use crate::sampling::{dim, LcgSampler, Sampler};
use crate::shader::{ShaderData, ShadingEvaluator};
use crate::state::{PathRayFlags, PathState, VolumeStack};

/// Throughput below which a marched segment is treated as opaque.
const VOLUME_THROUGHPUT_EPSILON: f32 = 1e-6;

/// Henyey-Greenstein phase function.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HenyeyGreenstein {
    pub g: f32,
}

impl HenyeyGreenstein {
    pub fn new(g: f32) -> Self {
        Self {
            g: g.clamp(-0.99, 0.99),
        }
    }

    /// Density over the sphere for turning by `cos_theta` from the direction
    /// of travel.
    pub fn pdf(&self, cos_theta: f32) -> f32 {
        let g = self.g;
        let denom = 1.0 + g * g - 2.0 * g * cos_theta;
        (1.0 - g * g) / (4.0 * PI * denom * denom.sqrt())
    }

    /// New direction for a ray travelling along `direction` (unit length).
    pub fn sample(&self, direction: Vec3, u: f32, v: f32) -> (Vec3, f32) {
        let g = self.g;
        let cos_theta = if g.abs() < 1e-3 {
            1.0 - 2.0 * u
        } else {
            let k = (1.0 - g * g) / (1.0 - g + 2.0 * g * u);
            ((1.0 + g * g - k * k) / (2.0 * g)).clamp(-1.0, 1.0)
        };
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let phi = 2.0 * PI * v;
        let (t, b) = make_orthonormals(direction);
        let omega = (t * phi.cos() + b * phi.sin()) * sin_theta + direction * cos_theta;
        (omega, self.pdf(cos_theta))
    }
}

/// Combined coefficients of the volumes at a point, per world unit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VolumeClosures {
    pub absorption: Vec3,
    pub scatter: Vec3,
    pub emission: Vec3,
    pub phase: HenyeyGreenstein,
}

impl VolumeClosures {
    pub fn extinction(&self) -> Vec3 {
        self.absorption + self.scatter
    }
}

/// Outcome of integrating one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeIntegrateResult {
    /// The path passed through with reduced throughput
    Attenuated,
    /// The path scattered at `t` along the segment
    Scattered { t: f32, phase: HenyeyGreenstein },
}

fn transmittance(sigma_t: Vec3, length: f32) -> Vec3 {
    if length.is_infinite() {
        return Vec3::select(sigma_t.cmpgt(Vec3::ZERO), Vec3::ZERO, Vec3::ONE);
    }
    (-sigma_t * length).exp()
}

/// Emission integrated over `length` with extinction applied.
fn emission_integral(closures: &VolumeClosures, length: f32) -> Vec3 {
    let sigma_t = closures.extinction();
    let channel = |e: f32, s: f32| {
        if e == 0.0 {
            0.0
        } else if s > 0.0 {
            if length.is_infinite() {
                e / s
            } else {
                e * (1.0 - (-s * length).exp()) / s
            }
        } else if length.is_infinite() {
            0.0
        } else {
            e * length
        }
    };
    Vec3::new(
        channel(closures.emission.x, sigma_t.x),
        channel(closures.emission.y, sigma_t.y),
        channel(closures.emission.z, sigma_t.z),
    )
}

fn channel_pick(u: f32) -> usize {
    ((u * 3.0) as usize).min(2)
}

/// Volume integration bound to one frame's shading and settings.
pub struct VolumeIntegrator<'a> {
    pub shading: &'a dyn ShadingEvaluator,
    pub sampler: Sampler,
    pub config: &'a IntegratorConfig,
    pub shader_flags: &'a [ShaderFlags],
}

impl<'a> VolumeIntegrator<'a> {
    fn is_heterogeneous(&self, stack: &VolumeStack, ray: &Ray) -> bool {
        ray.t != f32::MAX && stack.is_heterogeneous(self.shader_flags)
    }

    fn segment_length(ray: &Ray) -> f32 {
        if ray.t == f32::MAX {
            f32::INFINITY
        } else {
            ray.t * ray.direction.length()
        }
    }

    fn steps(&self, length: f32) -> (usize, f32) {
        let step_size = self.config.volume_step_size;
        let steps = ((length / step_size).ceil() as usize).clamp(1, self.config.volume_max_steps);
        (steps, length / steps as f32)
    }

    /// Integrate the volume stack along `ray` up to `ray.t`, adding emission
    /// to `radiance` and updating `throughput`.
    pub fn integrate(
        &self,
        state: &PathState,
        ray: &Ray,
        throughput: &mut Vec3,
        radiance: &mut PathRadiance,
    ) -> VolumeIntegrateResult {
        if self.is_heterogeneous(&state.volume_stack, ray) {
            self.integrate_heterogeneous(state, ray, throughput, radiance)
        } else {
            self.integrate_homogeneous(state, ray, throughput, radiance)
        }
    }

    fn can_scatter(&self, state: &PathState, closures: &VolumeClosures) -> bool {
        closures.scatter != Vec3::ZERO && state.volume_bounce < self.config.max_volume_bounce
    }

    fn integrate_homogeneous(
        &self,
        state: &PathState,
        ray: &Ray,
        throughput: &mut Vec3,
        radiance: &mut PathRadiance,
    ) -> VolumeIntegrateResult {
        let sd = ShaderData::for_volume(ray, 0.0);
        let closures = self
            .shading
            .evaluate_volume(&sd, &state.volume_stack, state.flag);
        let sigma_t = closures.extinction();
        let length = Self::segment_length(ray);

        if closures.emission != Vec3::ZERO {
            radiance.accum_emission(state, *throughput, emission_integral(&closures, length));
        }

        if !self.can_scatter(state, &closures) {
            *throughput *= transmittance(sigma_t, length);
            return VolumeIntegrateResult::Attenuated;
        }

        let channel = channel_pick(self.sampler.sample_1d(
            state.rng_hash,
            state.sample,
            state.dimension(dim::PHASE_CHANNEL),
        ));
        let xi = self
            .sampler
            .sample_1d(state.rng_hash, state.sample, state.dimension(dim::SCATTER_DISTANCE));
        let sample_sigma_t = sigma_t[channel];
        let sample_t = if sample_sigma_t > 0.0 {
            -(1.0 - xi).ln() / sample_sigma_t
        } else {
            f32::INFINITY
        };

        if sample_t < length {
            let tr = transmittance(sigma_t, sample_t);
            let pdf = (sigma_t * tr).element_sum() / 3.0;
            *throughput *= closures.scatter * tr / pdf;
            return VolumeIntegrateResult::Scattered {
                t: sample_t / ray.direction.length(),
                phase: closures.phase,
            };
        }

        let tr = transmittance(sigma_t, length);
        let pdf = tr.element_sum() / 3.0;
        *throughput = if pdf > 0.0 {
            *throughput * tr / pdf
        } else {
            Vec3::ZERO
        };
        VolumeIntegrateResult::Attenuated
    }

    fn integrate_heterogeneous(
        &self,
        state: &PathState,
        ray: &Ray,
        throughput: &mut Vec3,
        radiance: &mut PathRadiance,
    ) -> VolumeIntegrateResult {
        let dir_len = ray.direction.length();
        let length = ray.t * dir_len;
        let (steps, step) = self.steps(length);

        let mut lcg = LcgSampler::for_path(state.rng_hash, state.rng_offset, state.sample, 0x15b4f88d);
        let shade_offset = lcg.next_f32();
        let channel = channel_pick(self.sampler.sample_1d(
            state.rng_hash,
            state.sample,
            state.dimension(dim::PHASE_CHANNEL),
        ));
        let mut xi = self
            .sampler
            .sample_1d(state.rng_hash, state.sample, state.dimension(dim::SCATTER_DISTANCE));

        let mut tp = *throughput;
        for i in 0..steps {
            let t0 = i as f32 * step;
            let sd = ShaderData::for_volume(ray, (t0 + shade_offset * step) / dir_len);
            let closures = self
                .shading
                .evaluate_volume(&sd, &state.volume_stack, state.flag);
            let sigma_t = closures.extinction();

            if closures.emission != Vec3::ZERO {
                radiance.accum_emission(state, tp, emission_integral(&closures, step));
            }

            if self.can_scatter(state, &closures) {
                let sample_sigma_t = sigma_t[channel];
                let survive = (-sample_sigma_t * step).exp();
                if xi < 1.0 - survive {
                    let dt = -(1.0 - xi).ln() / sample_sigma_t;
                    let tr = transmittance(sigma_t, dt);
                    let pdf = (sigma_t * tr).element_sum() / 3.0;
                    *throughput = tp * closures.scatter * tr / pdf;
                    return VolumeIntegrateResult::Scattered {
                        t: (t0 + dt) / dir_len,
                        phase: closures.phase,
                    };
                }
                xi = ((xi - (1.0 - survive)) / survive).clamp(0.0, 1.0);
                let tr = transmittance(sigma_t, step);
                let pdf = tr.element_sum() / 3.0;
                tp = if pdf > 0.0 { tp * tr / pdf } else { Vec3::ZERO };
            } else {
                tp *= transmittance(sigma_t, step);
            }

            if tp.max_element() < VOLUME_THROUGHPUT_EPSILON {
                tp = Vec3::ZERO;
                break;
            }
        }
        *throughput = tp;
        VolumeIntegrateResult::Attenuated
    }

    /// Transmittance of `stack` along a shadow segment.
    pub fn shadow_transmittance(&self, stack: &VolumeStack, ray: &Ray, path_flag: PathRayFlags) -> Vec3 {
        if stack.is_empty() {
            return Vec3::ONE;
        }
        let length = Self::segment_length(ray);
        if !self.is_heterogeneous(stack, ray) {
            let sd = ShaderData::for_volume(ray, 0.0);
            let closures = self.shading.evaluate_volume(&sd, stack, path_flag);
            return transmittance(closures.extinction(), length);
        }

        let dir_len = ray.direction.length();
        let (steps, step) = self.steps(length);
        let mut tr = Vec3::ONE;
        for i in 0..steps {
            let t = (i as f32 + 0.5) * step;
            let sd = ShaderData::for_volume(ray, t / dir_len);
            let closures = self.shading.evaluate_volume(&sd, stack, path_flag);
            tr *= transmittance(closures.extinction(), step);
            if tr.max_element() < VOLUME_THROUGHPUT_EPSILON {
                return Vec3::ZERO;
            }
        }
        tr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingPattern;
    use crate::shader::{ShaderTable, SurfaceShader, VolumeShader};
    use crate::state::VolumeEntry;

    fn table(volume: VolumeShader) -> ShaderTable {
        let mut table = ShaderTable::new(Vec3::ZERO);
        table.add(SurfaceShader::volume_only(volume));
        table
    }

    fn state_in_volume() -> PathState {
        let mut state = PathState::new(3, 0, false);
        state.volume_stack.enter(VolumeEntry { object: 0, shader: 0 });
        state
    }

    #[test]
    fn test_hg_normalized() {
        for g in [-0.6, 0.0, 0.8] {
            let hg = HenyeyGreenstein::new(g);
            let n = 2000;
            let integral: f32 = (0..n)
                .map(|i| {
                    let cos = -1.0 + 2.0 * (i as f32 + 0.5) / n as f32;
                    2.0 * PI * hg.pdf(cos) * (2.0 / n as f32)
                })
                .sum();
            assert!((integral - 1.0).abs() < 1e-2, "g={} integral={}", g, integral);
        }
    }

    #[test]
    fn test_hg_sample_forward() {
        let hg = HenyeyGreenstein::new(0.9);
        let (dir, pdf) = hg.sample(Vec3::X, 0.99, 0.3);
        assert!(dir.dot(Vec3::X) > 0.9);
        assert!((hg.pdf(dir.dot(Vec3::X)) - pdf).abs() / pdf < 1e-3);
    }

    #[test]
    fn test_homogeneous_absorption_is_analytic() {
        let table = table(VolumeShader {
            absorption: Vec3::new(1.0, 0.5, 0.0),
            ..Default::default()
        });
        let config = IntegratorConfig::default();
        let integrator = VolumeIntegrator {
            shading: &table,
            sampler: Sampler::new(SamplingPattern::SobolBurley, 1),
            config: &config,
            shader_flags: &[ShaderFlags::HAS_VOLUME],
        };
        let state = state_in_volume();
        let ray = Ray::segment(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0), 1.0, 0.0);
        let mut throughput = Vec3::ONE;
        let mut l = PathRadiance::new(true);
        let result = integrator.integrate(&state, &ray, &mut throughput, &mut l);
        assert_eq!(result, VolumeIntegrateResult::Attenuated);
        let expected = Vec3::new((-2.0f32).exp(), (-1.0f32).exp(), 1.0);
        assert!((throughput - expected).abs().max_element() < 1e-5);

        let shadow = integrator.shadow_transmittance(&state.volume_stack, &ray, PathRayFlags::SHADOW);
        assert!((shadow - expected).abs().max_element() < 1e-5);
    }

    #[test]
    fn test_emission_accumulates() {
        let table = table(VolumeShader {
            emission: Vec3::ONE,
            ..Default::default()
        });
        let config = IntegratorConfig::default();
        let integrator = VolumeIntegrator {
            shading: &table,
            sampler: Sampler::new(SamplingPattern::SobolBurley, 1),
            config: &config,
            shader_flags: &[ShaderFlags::HAS_VOLUME],
        };
        let state = state_in_volume();
        let ray = Ray::segment(Vec3::ZERO, Vec3::Z, 3.0, 0.0);
        let mut throughput = Vec3::ONE;
        let mut l = PathRadiance::new(true);
        integrator.integrate(&state, &ray, &mut throughput, &mut l);
        assert!((l.emission - Vec3::splat(3.0)).abs().max_element() < 1e-5);
        assert_eq!(throughput, Vec3::ONE);
    }

    fn density(p: Vec3) -> f32 {
        if p.x < 1.0 {
            1.0
        } else {
            0.0
        }
    }

    #[test]
    fn test_heterogeneous_matches_piecewise_density() {
        let table = table(VolumeShader {
            absorption: Vec3::ONE,
            density: Some(density),
            ..Default::default()
        });
        let config = IntegratorConfig {
            volume_step_size: 0.25,
            ..Default::default()
        };
        let flags = [ShaderFlags::HAS_VOLUME | ShaderFlags::HETEROGENEOUS_VOLUME];
        let integrator = VolumeIntegrator {
            shading: &table,
            sampler: Sampler::new(SamplingPattern::SobolBurley, 1),
            config: &config,
            shader_flags: &flags,
        };
        let state = state_in_volume();
        let ray = Ray::segment(Vec3::ZERO, Vec3::X, 2.0, 0.0);

        let shadow = integrator.shadow_transmittance(&state.volume_stack, &ray, PathRayFlags::SHADOW);
        assert!((shadow - Vec3::splat((-1.0f32).exp())).abs().max_element() < 1e-5);

        let mut throughput = Vec3::ONE;
        let mut l = PathRadiance::new(true);
        integrator.integrate(&state, &ray, &mut throughput, &mut l);
        assert!((throughput - Vec3::splat((-1.0f32).exp())).abs().max_element() < 1e-5);
    }

    #[test]
    fn test_dense_scatterer_scatters() {
        let table = table(VolumeShader {
            scatter: Vec3::splat(1000.0),
            ..Default::default()
        });
        let config = IntegratorConfig {
            max_volume_bounce: 4,
            ..Default::default()
        };
        let integrator = VolumeIntegrator {
            shading: &table,
            sampler: Sampler::new(SamplingPattern::SobolBurley, 1),
            config: &config,
            shader_flags: &[ShaderFlags::HAS_VOLUME],
        };
        let state = state_in_volume();
        let ray = Ray::segment(Vec3::ZERO, Vec3::Z, 1.0, 0.0);
        let mut throughput = Vec3::ONE;
        let mut l = PathRadiance::new(true);
        match integrator.integrate(&state, &ray, &mut throughput, &mut l) {
            VolumeIntegrateResult::Scattered { t, .. } => {
                assert!(t > 0.0 && t < 1.0);
                // Pure scattering with equal channels keeps unit throughput.
                assert!((throughput - Vec3::ONE).abs().max_element() < 1e-3);
            }
            other => panic!("expected scattering, got {:?}", other),
        }
    }
}
