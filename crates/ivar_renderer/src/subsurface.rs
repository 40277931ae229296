//! Subsurface scattering by disk probing.
//!
//! A radius is drawn from the closure's profile, placed on a disk around
//! the shading point perpendicular to one of three axes (normal 50%, each
//! tangent 25%) and projected onto the object with a local query. Each hit
//! found becomes a new diffuse vertex; the three axes are combined with the
//! power heuristic.

use std::f32::consts::PI;

use ivar_math::{make_orthonormals, Vec3};
use smallvec::SmallVec;

use crate::accel::Accel;
use crate::ray::Ray;
use crate::sampling::LcgSampler;
use crate::shader::{BssrdfClosure, ShaderClosures, ShaderData, ShaderDataFlags};

/// Hits kept per disk ray; extra candidates are reservoir sampled.
pub const BSSRDF_MAX_HITS: usize = 4;

const AXIS_PDF: [f32; 3] = [0.5, 0.25, 0.25];

/// Which closure group handles the vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosurePick {
    Bsdf,
    Bssrdf(usize),
}

/// Choose between scattering by BSDF and by one of the subsurface closures
/// in proportion to sample weight. Scales `throughput` by the inverse
/// group probability and returns `u` rescaled for reuse.
pub fn pick_closure(closures: &ShaderClosures, u: f32, throughput: &mut Vec3) -> (ClosurePick, f32) {
    let sum_bsdf = closures.bsdf_sample_weight();
    let sum_bssrdf = closures.bssrdf_sample_weight();
    if sum_bssrdf <= 0.0 {
        return (ClosurePick::Bsdf, u);
    }
    let total = sum_bsdf + sum_bssrdf;
    let mut r = u * total;

    if r < sum_bsdf {
        *throughput *= total / sum_bsdf;
        return (ClosurePick::Bsdf, r / sum_bsdf);
    }

    r -= sum_bsdf;
    *throughput *= total / sum_bssrdf;
    let last = closures.bssrdfs.len() - 1;
    for (index, closure) in closures.bssrdfs.iter().enumerate() {
        if r < closure.sample_weight || index == last {
            let rescaled = (r / closure.sample_weight).clamp(0.0, 1.0);
            return (ClosurePick::Bssrdf(index), rescaled);
        }
        r -= closure.sample_weight;
    }
    (ClosurePick::Bssrdf(last), 0.0)
}

/// A point the disk ray reached, shaded as an outward-facing surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubsurfaceHit {
    pub sd: ShaderData,
    pub weight: Vec3,
}

/// Random numbers for one disk ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskSample {
    pub axis: f32,
    pub radius: f32,
    pub angle: f32,
}

/// Search the object under `sd` for exit points of `closure`.
///
/// `group_weight` is the summed sample weight of every subsurface closure,
/// so hit weights carry the inverse probability of having picked this one.
pub fn find_exit_points(
    accel: &dyn Accel,
    sd: &ShaderData,
    closure: &BssrdfClosure,
    group_weight: f32,
    sample: DiskSample,
    lcg: &mut LcgSampler,
) -> SmallVec<[SubsurfaceHit; BSSRDF_MAX_HITS]> {
    let mut out = SmallVec::new();
    let Some(object) = sd.object else {
        return out;
    };

    let n = closure.n;
    let (t, b) = make_orthonormals(n);
    let axes = [n, t, b];
    let (axis, disk_n, disk_t, disk_b) = if sample.axis < 0.5 {
        (0, n, t, b)
    } else if sample.axis < 0.75 {
        (1, t, b, n)
    } else {
        (2, b, n, t)
    };

    let profile = closure.profile.as_bssrdf();
    let r_max = profile.max_radius();
    let r = profile.sample(sample.radius);
    if r >= r_max {
        return out;
    }
    let pdf_disk = profile.pdf(r);
    if pdf_disk <= 0.0 {
        return out;
    }

    let phi = 2.0 * PI * sample.angle;
    let height = (r_max * r_max - r * r).sqrt();
    let disk_p = (disk_t * phi.cos() + disk_b * phi.sin()) * r;
    let disk_ray = Ray::segment(sd.p + disk_n * height + disk_p, -disk_n, 2.0 * height, sd.time);

    let local = accel.intersect_local(&disk_ray, object, lcg, BSSRDF_MAX_HITS);
    if local.hits.is_empty() {
        return out;
    }
    let count_scale = local.num_hits as f32 / local.hits.len() as f32;
    let closure_scale = closure.weight * (group_weight / closure.sample_weight);

    for hit in &local.hits {
        let mut hit_sd = ShaderData::from_intersection(accel.pack(), hit, &disk_ray);
        let hit_ng = hit_sd.ng;

        let pdfs = [0, 1, 2].map(|i| AXIS_PDF[i] * axes[i].dot(hit_ng).abs());
        let denom: f32 = pdfs.iter().map(|p| p * p).sum();
        if denom <= 0.0 {
            continue;
        }
        let mis = pdfs[axis] / denom;

        let distance = (hit_sd.p - sd.p).length();
        let eval = profile.eval(distance) / pdf_disk;
        let weight = closure_scale * eval * mis * count_scale;
        if weight == Vec3::ZERO {
            continue;
        }

        let outward = if hit_ng.dot(sd.n) < 0.0 { -hit_ng } else { hit_ng };
        hit_sd.ng = outward;
        hit_sd.n = outward;
        hit_sd.i = outward;
        hit_sd.flag.remove(ShaderDataFlags::BACKFACING);
        out.push(SubsurfaceHit { sd: hit_sd, weight });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{BssrdfFalloff, BssrdfProfile};
    use crate::testing::{build_accel, flat_scene, quad_at_z};

    fn closure(weight: Vec3) -> BssrdfClosure {
        BssrdfClosure {
            weight,
            sample_weight: weight.element_sum() / 3.0,
            profile: BssrdfProfile::new(BssrdfFalloff::Cubic, Vec3::splat(0.5)),
            n: Vec3::Z,
        }
    }

    fn surface_point(accel: &dyn Accel) -> ShaderData {
        let ray = Ray::new(Vec3::new(0.1, 0.2, 1.0), -Vec3::Z, 0.0);
        let hit = accel.intersect(&ray, ivar_scene::Visibility::ALL).unwrap();
        ShaderData::from_intersection(accel.pack(), &hit, &ray)
    }

    #[test]
    fn test_pick_closure_rescales() {
        let mut closures = ShaderClosures::new();
        closures.add_diffuse(Vec3::splat(0.25), Vec3::Z);
        closures.add_bssrdf(
            Vec3::splat(0.75),
            BssrdfProfile::new(BssrdfFalloff::Gaussian, Vec3::ONE),
            Vec3::Z,
        );

        let mut tp = Vec3::ONE;
        let (pick, u) = pick_closure(&closures, 0.125, &mut tp);
        assert_eq!(pick, ClosurePick::Bsdf);
        assert!((u - 0.5).abs() < 1e-6);
        assert!((tp - Vec3::splat(4.0)).abs().max_element() < 1e-6);

        let mut tp = Vec3::ONE;
        let (pick, _) = pick_closure(&closures, 0.5, &mut tp);
        assert_eq!(pick, ClosurePick::Bssrdf(0));
        assert!((tp - Vec3::splat(4.0 / 3.0)).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_normal_disk_ray_finds_flat_surface() {
        let (scene, _) = flat_scene(vec![quad_at_z(0.0, 0)]);
        let accel = build_accel(&scene);
        let sd = surface_point(&accel);
        let c = closure(Vec3::new(1.0, 0.5, 0.25));
        let mut lcg = LcgSampler::new(1);

        let sample = DiskSample {
            axis: 0.2,
            radius: 0.4,
            angle: 0.3,
        };
        let hits = find_exit_points(&accel, &sd, &c, c.sample_weight, sample, &mut lcg);
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert!(hit.sd.p.z.abs() < 1e-5);
        assert_eq!(hit.sd.n, Vec3::Z);
        // Only the normal axis sees the plane: 1 / pick probability 0.5.
        assert!((hit.weight - c.weight * 2.0).abs().max_element() < 1e-3);
        let r = (hit.sd.p - sd.p).length();
        assert!(r > 0.0 && r < 0.5);
    }

    #[test]
    fn test_tangent_disk_ray_misses_flat_surface() {
        let (scene, _) = flat_scene(vec![quad_at_z(0.0, 0)]);
        let accel = build_accel(&scene);
        let sd = surface_point(&accel);
        let c = closure(Vec3::ONE);
        let mut lcg = LcgSampler::new(1);
        for axis in [0.6, 0.9] {
            let sample = DiskSample {
                axis,
                radius: 0.4,
                angle: 0.3,
            };
            assert!(find_exit_points(&accel, &sd, &c, 1.0, sample, &mut lcg).is_empty());
        }
    }
}
