//! Render buffers.
//!
//! One buffer per enabled pass, each holding the running sum of samples.
//! The first sample of a pixel overwrites whatever the buffer held, so a
//! buffer can be reused across frames without clearing.

use ivar_math::{Vec3, Vec4};

use crate::bucket::Bucket;
use crate::integrator::PathResult;

/// Output passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Clamped color with alpha
    Combined,
    Emission,
    Background,
    Ao,
    /// Unoccluded fraction of lamp samples
    Shadow,
    DiffuseDirect,
    DiffuseIndirect,
    GlossyDirect,
    GlossyIndirect,
    TransmissionDirect,
    TransmissionIndirect,
    SubsurfaceDirect,
    SubsurfaceIndirect,
    VolumeDirect,
    VolumeIndirect,
}

impl PassKind {
    /// Every pass the light-pass split produces.
    pub const LIGHT_PASSES: [PassKind; 15] = [
        PassKind::Combined,
        PassKind::Emission,
        PassKind::Background,
        PassKind::Ao,
        PassKind::Shadow,
        PassKind::DiffuseDirect,
        PassKind::DiffuseIndirect,
        PassKind::GlossyDirect,
        PassKind::GlossyIndirect,
        PassKind::TransmissionDirect,
        PassKind::TransmissionIndirect,
        PassKind::SubsurfaceDirect,
        PassKind::SubsurfaceIndirect,
        PassKind::VolumeDirect,
        PassKind::VolumeIndirect,
    ];

    /// This pass's value for one path.
    pub fn value(self, result: &PathResult) -> Vec4 {
        let r = &result.radiance;
        let rgb = |c: Vec3| c.extend(0.0);
        match self {
            PassKind::Combined => result.combined,
            PassKind::Emission => rgb(r.emission),
            PassKind::Background => rgb(r.background),
            PassKind::Ao => rgb(r.ao),
            PassKind::Shadow => r.shadow,
            PassKind::DiffuseDirect => rgb(r.direct.diffuse),
            PassKind::DiffuseIndirect => rgb(r.indirect.diffuse),
            PassKind::GlossyDirect => rgb(r.direct.glossy),
            PassKind::GlossyIndirect => rgb(r.indirect.glossy),
            PassKind::TransmissionDirect => rgb(r.direct.transmission),
            PassKind::TransmissionIndirect => rgb(r.indirect.transmission),
            PassKind::SubsurfaceDirect => rgb(r.direct.subsurface),
            PassKind::SubsurfaceIndirect => rgb(r.indirect.subsurface),
            PassKind::VolumeDirect => rgb(r.direct.scatter),
            PassKind::VolumeIndirect => rgb(r.indirect.scatter),
        }
    }
}

/// Pass buffers for a rectangle of pixels.
#[derive(Debug, Clone)]
pub struct RenderBuffers {
    pub width: u32,
    pub height: u32,
    passes: Vec<(PassKind, Vec<Vec4>)>,
    /// Samples accumulated per pixel
    samples: Vec<u32>,
}

impl RenderBuffers {
    pub fn new(width: u32, height: u32, passes: &[PassKind]) -> Self {
        let len = (width * height) as usize;
        let mut kinds: Vec<PassKind> = Vec::with_capacity(passes.len() + 1);
        kinds.push(PassKind::Combined);
        for &kind in passes {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Self {
            width,
            height,
            passes: kinds.into_iter().map(|k| (k, vec![Vec4::ZERO; len])).collect(),
            samples: vec![0; len],
        }
    }

    pub fn passes(&self) -> impl Iterator<Item = PassKind> + '_ {
        self.passes.iter().map(|(k, _)| *k)
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    /// Add `result` as sample `sample` of pixel (x, y). Sample 0 replaces
    /// the pixel's previous contents.
    pub fn accumulate(&mut self, x: u32, y: u32, sample: u32, result: &PathResult) {
        let i = self.index(x, y);
        for (kind, buffer) in &mut self.passes {
            let value = kind.value(result);
            if sample == 0 {
                buffer[i] = value;
            } else {
                buffer[i] += value;
            }
        }
        self.samples[i] = if sample == 0 { 1 } else { self.samples[i] + 1 };
    }

    pub fn sample_count(&self, x: u32, y: u32) -> u32 {
        self.samples[self.index(x, y)]
    }

    /// Copy a rendered bucket into place.
    pub fn write_bucket(&mut self, bucket: &Bucket, tile: &RenderBuffers) {
        for ly in 0..bucket.height {
            for lx in 0..bucket.width {
                let src = tile.index(lx, ly);
                let dst = self.index(bucket.x + lx, bucket.y + ly);
                for (kind, buffer) in &mut self.passes {
                    if let Some((_, from)) = tile.passes.iter().find(|(k, _)| *k == *kind) {
                        buffer[dst] = from[src];
                    }
                }
                self.samples[dst] = tile.samples[src];
            }
        }
    }

    /// Per-pixel average of a pass; `None` when the pass is not stored.
    /// Shadow is returned as the unoccluded fraction with alpha one.
    pub fn resolve(&self, kind: PassKind) -> Option<Vec<Vec4>> {
        let (_, buffer) = self.passes.iter().find(|(k, _)| *k == kind)?;
        let pixels = buffer
            .iter()
            .zip(&self.samples)
            .map(|(&sum, &count)| {
                if kind == PassKind::Shadow {
                    return if sum.w > 0.0 {
                        (sum.truncate() / sum.w).extend(1.0)
                    } else {
                        Vec4::ONE
                    };
                }
                if count == 0 {
                    Vec4::ZERO
                } else {
                    sum / count as f32
                }
            })
            .collect();
        Some(pixels)
    }

    /// Combined pass as gamma-corrected 8-bit RGBA, row-major.
    pub fn to_rgba8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.width * self.height * 4) as usize);
        if let Some(pixels) = self.resolve(PassKind::Combined) {
            for p in pixels {
                out.extend_from_slice(&color_to_rgba(p));
            }
        }
        out
    }
}

/// Apply gamma correction (gamma = 2.0).
#[inline]
pub fn linear_to_gamma(linear: f32) -> f32 {
    if linear > 0.0 {
        linear.sqrt()
    } else {
        0.0
    }
}

/// Convert a linear color with alpha to 8-bit RGBA.
pub fn color_to_rgba(color: Vec4) -> [u8; 4] {
    let to_byte = |c: f32| (255.0 * c.clamp(0.0, 1.0)) as u8;
    [
        to_byte(linear_to_gamma(color.x)),
        to_byte(linear_to_gamma(color.y)),
        to_byte(linear_to_gamma(color.z)),
        to_byte(color.w),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radiance::PathRadiance;

    fn result(combined: Vec4) -> PathResult {
        let mut radiance = PathRadiance::new(true);
        radiance.emission = combined.truncate();
        radiance.shadow = Vec4::new(1.0, 1.0, 1.0, 1.0);
        PathResult { combined, radiance }
    }

    #[test]
    fn test_first_sample_overwrites() {
        let mut buffers = RenderBuffers::new(2, 2, &[PassKind::Emission]);
        buffers.accumulate(1, 0, 0, &result(Vec4::splat(5.0)));
        buffers.accumulate(1, 0, 1, &result(Vec4::splat(1.0)));
        buffers.accumulate(1, 0, 0, &result(Vec4::splat(2.0)));
        buffers.accumulate(1, 0, 1, &result(Vec4::splat(4.0)));

        assert_eq!(buffers.sample_count(1, 0), 2);
        let combined = buffers.resolve(PassKind::Combined).unwrap();
        assert_eq!(combined[1], Vec4::splat(3.0));
        assert_eq!(combined[0], Vec4::ZERO);
        let emission = buffers.resolve(PassKind::Emission).unwrap();
        assert_eq!(emission[1], Vec4::new(3.0, 3.0, 3.0, 0.0));
        assert!(buffers.resolve(PassKind::Ao).is_none());
    }

    #[test]
    fn test_shadow_resolves_to_fraction() {
        let mut buffers = RenderBuffers::new(1, 1, &[PassKind::Shadow]);
        let mut lit = result(Vec4::ONE);
        lit.radiance.shadow = Vec4::new(1.0, 1.0, 1.0, 1.0);
        let mut dark = result(Vec4::ONE);
        dark.radiance.shadow = Vec4::new(0.0, 0.0, 0.0, 1.0);
        buffers.accumulate(0, 0, 0, &lit);
        buffers.accumulate(0, 0, 1, &dark);
        let shadow = buffers.resolve(PassKind::Shadow).unwrap();
        assert_eq!(shadow[0], Vec4::new(0.5, 0.5, 0.5, 1.0));
    }

    #[test]
    fn test_write_bucket_places_tile() {
        let mut frame = RenderBuffers::new(4, 4, &[]);
        let bucket = Bucket::new(2, 1, 2, 2, 0);
        let mut tile = RenderBuffers::new(2, 2, &[]);
        tile.accumulate(1, 1, 0, &result(Vec4::ONE));
        frame.write_bucket(&bucket, &tile);

        let combined = frame.resolve(PassKind::Combined).unwrap();
        assert_eq!(combined[2 * 4 + 3], Vec4::ONE);
        assert_eq!(frame.sample_count(3, 2), 1);
        assert_eq!(frame.sample_count(2, 1), 0);
    }

    #[test]
    fn test_color_to_rgba() {
        assert_eq!(color_to_rgba(Vec4::new(0.0, 0.25, 1.0, 1.0)), [0, 127, 255, 255]);
        assert_eq!(color_to_rgba(Vec4::new(-1.0, 4.0, 0.0, 0.5)), [0, 255, 0, 127]);
    }
}
