//! Shadow rays through transparent surfaces and volumes.
//!
//! Opaque shadows need one occlusion query. Transparent shadows gather the
//! surfaces along the segment and multiply their transparency, either from
//! one record-all query (`Batch`) when the backend supports it or by
//! repeated closest-hit queries (`Step`). Both honour the transparent
//! bounce budget and attenuate by the volumes the path is inside.

use ivar_math::Vec3;
use ivar_scene::Visibility;

use crate::accel::Accel;
use crate::device::DeviceCapabilities;
use crate::integrator::IntegratorConfig;
use crate::ray::{offset_ray_origin, Ray};
use crate::shader::{ShaderData, ShaderDataFlags, ShadingEvaluator};
use crate::state::{PathRayFlags, PathState, VolumeStack};
use crate::volume::VolumeIntegrator;

/// Hits closer than this, scaled by the magnitude of the ray origin, are
/// the surface the previous step left from.
pub const SHADOW_ADVANCE_EPSILON: f32 = 1e-5;

/// Re-hits skipped along one shadow ray before a hit counts as a crossing.
pub const MAX_SHADOW_REHITS: u32 = 4;

/// Whether a step hit at distance `t` from `origin` is the surface the
/// previous step left from. Independent of the segment length, so unbounded
/// rays are judged like short ones.
fn is_rehit(origin: Vec3, t: f32, rehits: u32) -> bool {
    rehits < MAX_SHADOW_REHITS && t <= SHADOW_ADVANCE_EPSILON * (1.0 + origin.abs().max_element())
}

/// How transparent shadow hits are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowStrategy {
    /// Record every hit in one query
    Batch,
    /// Advance hit by hit
    Step,
}

impl ShadowStrategy {
    pub fn for_capabilities(caps: &DeviceCapabilities) -> Self {
        if caps.record_all_hits {
            ShadowStrategy::Batch
        } else {
            ShadowStrategy::Step
        }
    }
}

/// Resolves shadow rays for one frame.
pub struct ShadowResolver<'a> {
    pub accel: &'a dyn Accel,
    pub shading: &'a dyn ShadingEvaluator,
    pub volumes: &'a VolumeIntegrator<'a>,
    pub config: &'a IntegratorConfig,
    pub strategy: ShadowStrategy,
}

impl<'a> ShadowResolver<'a> {
    /// Light transmitted along `ray`, or `None` when fully blocked.
    pub fn resolve(&self, state: &PathState, ray: &Ray) -> Option<Vec3> {
        if ray.t <= 0.0 {
            return Some(Vec3::ONE);
        }

        if !self.config.transparent_shadows {
            if self.accel.occluded(ray, Visibility::SHADOW) {
                return None;
            }
            return self.attenuate(&state.volume_stack, ray, Vec3::ONE);
        }

        let budget = self
            .config
            .max_transparent_bounce
            .saturating_sub(state.transparent_bounce) as usize;
        match self.strategy {
            ShadowStrategy::Batch => self.resolve_batch(state, ray, budget),
            ShadowStrategy::Step => self.resolve_step(state, ray, budget),
        }
    }

    fn attenuate(&self, stack: &VolumeStack, segment: &Ray, throughput: Vec3) -> Option<Vec3> {
        let tr = throughput * self.volumes.shadow_transmittance(stack, segment, PathRayFlags::SHADOW);
        (tr != Vec3::ZERO).then_some(tr)
    }

    fn shade_hit(&self, sd: &ShaderData) -> Option<Vec3> {
        if !sd.flag.contains(ShaderDataFlags::HAS_TRANSPARENT_SHADOW) {
            return None;
        }
        let tr = self.shading.evaluate_shadow(sd, PathRayFlags::SHADOW);
        (tr != Vec3::ZERO).then_some(tr)
    }

    fn resolve_batch(&self, state: &PathState, ray: &Ray, budget: usize) -> Option<Vec3> {
        let mut record = self.accel.intersect_all(ray, Visibility::SHADOW, budget);
        if record.blocked() {
            return None;
        }
        record.hits.sort_by(|a, b| a.t.total_cmp(&b.t));

        let mut throughput = Vec3::ONE;
        let mut stack = state.volume_stack.clone();
        let mut last_t = 0.0;
        for hit in &record.hits {
            if !stack.is_empty() {
                let segment = Ray::segment(ray.at(last_t), ray.direction, hit.t - last_t, ray.time);
                throughput = self.attenuate(&stack, &segment, throughput)?;
            }
            let sd = ShaderData::from_intersection(self.accel.pack(), hit, ray);
            throughput *= self.shade_hit(&sd)?;
            stack.enter_exit(&sd);
            last_t = hit.t;
        }

        if stack.is_empty() {
            return Some(throughput);
        }
        let segment = Ray::segment(ray.at(last_t), ray.direction, ray.t - last_t, ray.time);
        self.attenuate(&stack, &segment, throughput)
    }

    fn resolve_step(&self, state: &PathState, ray: &Ray, budget: usize) -> Option<Vec3> {
        let mut throughput = Vec3::ONE;
        let mut stack = state.volume_stack.clone();
        let mut segment = *ray;
        let mut crossed = 0;
        let mut rehits = 0;

        loop {
            let Some(hit) = self.accel.intersect(&segment, Visibility::SHADOW) else {
                return self.attenuate(&stack, &segment, throughput);
            };

            let sd = ShaderData::from_intersection(self.accel.pack(), &hit, &segment);
            if is_rehit(segment.origin, hit.t, rehits) {
                rehits += 1;
                segment.origin = offset_ray_origin(sd.p, sd.ng, segment.direction);
                segment.t -= hit.t;
                if segment.t <= 0.0 {
                    return self.attenuate(&stack, &segment, throughput);
                }
                continue;
            }

            if crossed >= budget {
                return None;
            }
            crossed += 1;

            if !stack.is_empty() {
                let part = Ray::segment(segment.origin, segment.direction, hit.t, segment.time);
                throughput = self.attenuate(&stack, &part, throughput)?;
            }
            throughput *= self.shade_hit(&sd)?;
            stack.enter_exit(&sd);

            segment.origin = offset_ray_origin(sd.p, sd.ng, segment.direction);
            segment.t -= hit.t;
            if segment.t <= 0.0 {
                return Some(throughput);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BackendKind;
    use crate::testing::ShadowFixture;

    fn shadow_ray() -> Ray {
        Ray::segment(Vec3::new(0.2, 0.3, 0.0), Vec3::Z, 10.0, 0.0)
    }

    #[test]
    fn test_strategy_from_capabilities() {
        let mut caps = DeviceCapabilities::for_backend(BackendKind::Software);
        assert_eq!(ShadowStrategy::for_capabilities(&caps), ShadowStrategy::Batch);
        caps.record_all_hits = false;
        assert_eq!(ShadowStrategy::for_capabilities(&caps), ShadowStrategy::Step);
    }

    #[test]
    fn test_unblocked_and_blocked() {
        let fixture = ShadowFixture::new(&[]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &shadow_ray()), Some(Vec3::ONE));
        }

        let fixture = ShadowFixture::new(&[(2.0, Vec3::ZERO)]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &shadow_ray()), None);
        }
    }

    #[test]
    fn test_transparency_multiplies() {
        let fixture = ShadowFixture::new(&[(2.0, Vec3::splat(0.5)), (4.0, Vec3::new(0.5, 0.25, 1.0))]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            let tr = fixture.resolve(strategy, &shadow_ray()).unwrap();
            assert!((tr - Vec3::new(0.25, 0.125, 0.5)).abs().max_element() < 1e-6);
        }
    }

    #[test]
    fn test_budget_exhausted_blocks() {
        let layers: Vec<(f32, Vec3)> = (1..=4).map(|i| (i as f32, Vec3::splat(0.9))).collect();
        let mut fixture = ShadowFixture::new(&layers);
        fixture.config.max_transparent_bounce = 3;
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &shadow_ray()), None);
        }
        fixture.config.max_transparent_bounce = 4;
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert!(fixture.resolve(strategy, &shadow_ray()).is_some());
        }
    }

    #[test]
    fn test_adding_occluders_never_brightens() {
        let mut layers = Vec::new();
        let mut previous = Vec3::ONE;
        for (i, tr) in [Vec3::splat(0.8), Vec3::new(0.9, 0.5, 0.7), Vec3::ONE, Vec3::ZERO]
            .into_iter()
            .enumerate()
        {
            layers.push((1.0 + i as f32, tr));
            let fixture = ShadowFixture::new(&layers);
            for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
                let current = fixture.resolve(strategy, &shadow_ray()).unwrap_or(Vec3::ZERO);
                assert!(current.cmple(previous + 1e-6).all(), "{:?} > {:?}", current, previous);
            }
            previous = fixture
                .resolve(ShadowStrategy::Step, &shadow_ray())
                .unwrap_or(Vec3::ZERO);
        }
        assert_eq!(previous, Vec3::ZERO);
    }

    #[test]
    fn test_opaque_mode_ignores_transparency() {
        let mut fixture = ShadowFixture::new(&[(2.0, Vec3::splat(0.5))]);
        fixture.config.transparent_shadows = false;
        assert_eq!(fixture.resolve(ShadowStrategy::Step, &shadow_ray()), None);
    }

    fn unbounded_ray() -> Ray {
        Ray::new(Vec3::new(0.2, 0.3, 0.0), Vec3::Z, 0.0)
    }

    #[test]
    fn test_unbounded_ray_blocked_by_opaque() {
        let fixture = ShadowFixture::new(&[]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &unbounded_ray()), Some(Vec3::ONE));
        }

        let fixture = ShadowFixture::new(&[(2.0, Vec3::ZERO)]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &unbounded_ray()), None, "{:?}", strategy);
        }

        let fixture = ShadowFixture::new(&[(2.0, Vec3::splat(0.5)), (1000.0, Vec3::ZERO)]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &unbounded_ray()), None, "{:?}", strategy);
        }
    }

    #[test]
    fn test_strategies_agree_at_any_length() {
        let fixture = ShadowFixture::new(&[
            (2.0, Vec3::splat(0.5)),
            (4.0, Vec3::new(0.5, 0.25, 1.0)),
            (500.0, Vec3::splat(0.8)),
        ]);
        let origin = Vec3::new(0.2, 0.3, 0.0);
        for length in [3.0, 10.0, 1000.0, 1e30, f32::MAX] {
            let ray = Ray::segment(origin, Vec3::Z, length, 0.0);
            let batch = fixture.resolve(ShadowStrategy::Batch, &ray).unwrap();
            let step = fixture.resolve(ShadowStrategy::Step, &ray).unwrap();
            assert!((batch - step).abs().max_element() < 1e-6, "length {}: {:?} != {:?}", length, batch, step);
        }
        let far = fixture.resolve(ShadowStrategy::Step, &unbounded_ray()).unwrap();
        assert!((far - Vec3::new(0.2, 0.1, 0.4)).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_rehit_is_absolute_and_capped() {
        let origin = Vec3::new(0.2, 0.3, 2.0);
        assert!(is_rehit(origin, 1e-6, 0));
        assert!(!is_rehit(origin, 0.5, 0));
        // Not scaled by how far the segment reaches.
        assert!(!is_rehit(origin, 2.0, 0));
        // Far from the world origin the tolerance grows with float spacing.
        assert!(is_rehit(Vec3::splat(1e4), 0.05, 0));
        assert!(!is_rehit(origin, 1e-6, MAX_SHADOW_REHITS));
    }

    #[test]
    fn test_segment_stops_before_far_hits() {
        let fixture = ShadowFixture::new(&[(20.0, Vec3::ZERO)]);
        for strategy in [ShadowStrategy::Batch, ShadowStrategy::Step] {
            assert_eq!(fixture.resolve(strategy, &shadow_ray()), Some(Vec3::ONE));
        }
    }
}
