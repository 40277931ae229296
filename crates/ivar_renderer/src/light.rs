//! Light sampling interface.
//!
//! Lights are sampled from a shading point; the sample carries the
//! radiance arriving along the sampled direction and its solid-angle pdf
//! (for delta lights only the selection probability). Emitters that can
//! also be hit by BSDF rays report `use_mis` so both strategies are weighted
//! with the power heuristic.

use std::collections::HashMap;

use ivar_math::Vec3;
use ivar_scene::{Geometry, Scene};

use crate::accel::pack::NO_NODE_OFFSET;
use crate::accel::PackedPrimitives;

/// Kind of emitter a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point,
    Area,
    Background,
}

/// One light sample as seen from a shading point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSample {
    /// Position on the light; a far point for distant lights
    pub p: Vec3,
    /// Light surface normal
    pub n: Vec3,
    /// Unit direction from the shading point towards the light
    pub d: Vec3,
    /// Distance to the light; f32::INFINITY for distant lights
    pub t: f32,
    pub shader: u32,
    pub object: Option<u32>,
    pub prim: Option<u32>,
    pub kind: LightKind,
    /// Radiance arriving along `d`
    pub eval: Vec3,
    /// Solid-angle pdf, or selection probability for delta lights
    pub pdf: f32,
    pub use_mis: bool,
}

impl LightSample {
    pub fn is_delta(&self) -> bool {
        self.kind == LightKind::Point
    }
}

/// Where a BSDF-sampled ray hit an emitter, for computing the light pdf of
/// that direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitterHit {
    pub p: Vec3,
    pub ng: Vec3,
    pub object: u32,
    pub prim: u32,
}

pub trait LightSampler: Send + Sync {
    /// Sample one light as seen from `p`. `None` when nothing can light it.
    fn sample_light(&self, p: Vec3, u: f32, v: f32, time: f32) -> Option<LightSample>;

    /// Solid-angle pdf that `sample_light` from `from` picks `hit` along
    /// `direction` at `distance`.
    fn light_pdf(&self, from: Vec3, hit: &EmitterHit, direction: Vec3, distance: f32) -> f32;

    /// Solid-angle pdf of sampling the environment along `direction`.
    fn background_pdf(&self, _direction: Vec3) -> f32 {
        0.0
    }
}

/// Power heuristic with exponent 2.
#[inline]
pub fn power_heuristic(a: f32, b: f32) -> f32 {
    let a2 = a * a;
    let b2 = b * b;
    if a2 + b2 == 0.0 {
        return 0.0;
    }
    a2 / (a2 + b2)
}

/// An isotropic point emitter of radiant intensity `intensity`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub intensity: Vec3,
    pub shader: u32,
}

/// Uniform selection among point lights.
#[derive(Debug, Clone, Default)]
pub struct PointLights {
    pub lights: Vec<PointLight>,
}

impl PointLights {
    pub fn new(lights: Vec<PointLight>) -> Self {
        Self { lights }
    }
}

impl LightSampler for PointLights {
    fn sample_light(&self, p: Vec3, u: f32, _v: f32, _time: f32) -> Option<LightSample> {
        if self.lights.is_empty() {
            return None;
        }
        let count = self.lights.len();
        let index = ((u * count as f32) as usize).min(count - 1);
        let light = &self.lights[index];

        let to_light = light.position - p;
        let distance = to_light.length();
        if distance <= 0.0 {
            return None;
        }
        let d = to_light / distance;
        Some(LightSample {
            p: light.position,
            n: -d,
            d,
            t: distance,
            shader: light.shader,
            object: None,
            prim: None,
            kind: LightKind::Point,
            eval: light.intensity / (distance * distance),
            pdf: 1.0 / count as f32,
            use_mis: false,
        })
    }

    fn light_pdf(&self, _from: Vec3, _hit: &EmitterHit, _direction: Vec3, _distance: f32) -> f32 {
        0.0
    }
}

/// An emissive triangle, stored in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleLight {
    pub verts: [Vec3; 3],
    pub emission: Vec3,
    pub area: f32,
    pub object: u32,
    pub prim: u32,
    pub shader: u32,
}

impl TriangleLight {
    fn normal(&self) -> Vec3 {
        (self.verts[1] - self.verts[0])
            .cross(self.verts[2] - self.verts[0])
            .normalize_or_zero()
    }
}

/// Point lights plus emissive triangles, picked in proportion to power.
#[derive(Debug, Clone, Default)]
pub struct SceneLights {
    pub points: Vec<PointLight>,
    pub triangles: Vec<TriangleLight>,
    /// Running power sums over points then triangles
    cdf: Vec<f32>,
    by_prim: HashMap<(u32, u32), usize>,
}

fn luminance(c: Vec3) -> f32 {
    c.dot(Vec3::new(0.2126, 0.7152, 0.0722))
}

impl SceneLights {
    pub fn new(points: Vec<PointLight>, triangles: Vec<TriangleLight>) -> Self {
        let mut lights = Self {
            points,
            triangles,
            ..Default::default()
        };
        lights.rebuild_distribution();
        lights
    }

    /// Collect every static triangle whose shader emits, using `emission`
    /// to look shaders up. Objects with transform motion are skipped.
    pub fn from_scene(
        scene: &Scene,
        pack: &PackedPrimitives,
        points: Vec<PointLight>,
        emission: impl Fn(u32) -> Vec3,
    ) -> Self {
        let mut triangles = Vec::new();
        for (object_index, object) in scene.objects.iter().enumerate() {
            let Some(Geometry::Mesh(mesh)) = scene.geometries.get(object.geometry) else {
                continue;
            };
            if object.transform.is_motion() || mesh.motion_steps() > 1 {
                continue;
            }
            let offset = pack
                .geometry_prim_offset
                .get(object.geometry)
                .copied()
                .unwrap_or(NO_NODE_OFFSET);
            if offset == NO_NODE_OFFSET {
                continue;
            }
            let to_world = object.transform.at(0.5);
            for tri in 0..mesh.triangle_count() {
                let shader = mesh.shader(tri);
                let radiance = emission(shader);
                if radiance == Vec3::ZERO {
                    continue;
                }
                let verts = mesh
                    .triangle_vertices(tri, 0)
                    .map(|v| to_world.transform_point3(v));
                let area = 0.5 * (verts[1] - verts[0]).cross(verts[2] - verts[0]).length();
                if area <= 0.0 {
                    continue;
                }
                triangles.push(TriangleLight {
                    verts,
                    emission: radiance,
                    area,
                    object: object_index as u32,
                    prim: offset + tri as u32,
                    shader,
                });
            }
        }
        log::debug!(
            "Light list: {} point lights, {} emissive triangles",
            points.len(),
            triangles.len()
        );
        Self::new(points, triangles)
    }

    fn rebuild_distribution(&mut self) {
        let powers = self
            .points
            .iter()
            .map(|l| luminance(l.intensity))
            .chain(self.triangles.iter().map(|t| luminance(t.emission) * t.area));
        let mut sum = 0.0;
        self.cdf = powers
            .map(|p| {
                sum += p.max(0.0);
                sum
            })
            .collect();
        self.by_prim = self
            .triangles
            .iter()
            .enumerate()
            .map(|(i, t)| ((t.object, t.prim), i))
            .collect();
    }

    fn total_power(&self) -> f32 {
        self.cdf.last().copied().unwrap_or(0.0)
    }

    fn selection_pdf(&self, index: usize) -> f32 {
        let total = self.total_power();
        if total <= 0.0 {
            return 0.0;
        }
        let prev = if index == 0 { 0.0 } else { self.cdf[index - 1] };
        (self.cdf[index] - prev) / total
    }

    pub fn is_empty(&self) -> bool {
        self.cdf.is_empty()
    }
}

impl LightSampler for SceneLights {
    fn sample_light(&self, p: Vec3, u: f32, v: f32, _time: f32) -> Option<LightSample> {
        let total = self.total_power();
        if total <= 0.0 {
            return None;
        }
        let target = u * total;
        let index = self
            .cdf
            .partition_point(|&c| c <= target)
            .min(self.cdf.len() - 1);
        let selection = self.selection_pdf(index);
        let prev = if index == 0 { 0.0 } else { self.cdf[index - 1] };
        // Reuse what is left of `u` inside the chosen bucket.
        let u = ((target - prev) / (self.cdf[index] - prev)).clamp(0.0, 1.0);

        if index < self.points.len() {
            let mut ls = PointLights::new(vec![self.points[index]]).sample_light(p, 0.0, 0.0, 0.0)?;
            ls.pdf = selection;
            return Some(ls);
        }

        let tri = &self.triangles[index - self.points.len()];
        let su = u.sqrt();
        let (b0, b1) = (1.0 - su, v * su);
        let point = b0 * tri.verts[0] + b1 * tri.verts[1] + (1.0 - b0 - b1) * tri.verts[2];
        let to_light = point - p;
        let distance = to_light.length();
        if distance <= 0.0 {
            return None;
        }
        let d = to_light / distance;
        let n = tri.normal();
        let cos_light = n.dot(-d).abs();
        if cos_light <= 0.0 {
            return None;
        }
        Some(LightSample {
            p: point,
            n,
            d,
            t: distance,
            shader: tri.shader,
            object: Some(tri.object),
            prim: Some(tri.prim),
            kind: LightKind::Area,
            eval: tri.emission,
            pdf: selection * distance * distance / (cos_light * tri.area),
            use_mis: true,
        })
    }

    fn light_pdf(&self, _from: Vec3, hit: &EmitterHit, direction: Vec3, distance: f32) -> f32 {
        let Some(&index) = self.by_prim.get(&(hit.object, hit.prim)) else {
            return 0.0;
        };
        let tri = &self.triangles[index];
        let cos_light = hit.ng.normalize_or_zero().dot(direction.normalize_or_zero()).abs();
        if cos_light <= 0.0 {
            return 0.0;
        }
        self.selection_pdf(self.points.len() + index) * distance * distance / (cos_light * tri.area)
    }
}
