//! Frame rendering.
//!
//! `Renderer` ties a camera, a built acceleration structure, the shading
//! and light collaborators and an `IntegratorConfig` together. `trace` is
//! the per-sample entry point; `render_frame` renders every bucket in
//! parallel with rayon.

use ivar_math::Vec4;
use rayon::prelude::*;

use crate::accel::Accel;
use crate::bucket::{generate_buckets, render_bucket, DEFAULT_BUCKET_SIZE};
use crate::camera::Camera;
use crate::film::{PassKind, RenderBuffers};
use crate::integrator::{IntegratorConfig, PathIntegrator, PathResult};
use crate::light::LightSampler;
use crate::progress::Progress;
use crate::sampling::{pixel_rng_hash, Sampler};
use crate::shader::ShadingEvaluator;
use crate::state::VolumeStack;

/// Renders frames of one committed scene.
pub struct Renderer<'a> {
    camera: &'a Camera,
    accel: &'a dyn Accel,
    config: &'a IntegratorConfig,
    integrator: PathIntegrator<'a>,
    sampler: Sampler,
    /// Volumes enclosing the camera
    camera_volumes: VolumeStack,
    passes: Vec<PassKind>,
    bucket_size: u32,
}

impl<'a> Renderer<'a> {
    pub fn new(
        camera: &'a Camera,
        accel: &'a dyn Accel,
        shading: &'a dyn ShadingEvaluator,
        lights: &'a dyn LightSampler,
        config: &'a IntegratorConfig,
    ) -> Self {
        let mut camera_volumes = VolumeStack::new();
        camera_volumes.init_from_camera(accel, camera.position(), camera.shutter().0);
        if !camera_volumes.is_empty() {
            log::debug!("Camera starts inside {} volume(s)", camera_volumes.len());
        }

        let passes = if config.use_light_pass {
            PassKind::LIGHT_PASSES.to_vec()
        } else {
            vec![PassKind::Combined]
        };

        Self {
            camera,
            accel,
            config,
            integrator: PathIntegrator::new(accel, shading, lights, config),
            sampler: Sampler::new(config.sampling_pattern, config.samples),
            camera_volumes,
            passes,
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }

    /// Set the bucket edge length in pixels.
    pub fn with_bucket_size(mut self, size: u32) -> Self {
        self.bucket_size = size.max(1);
        self
    }

    /// Restrict the stored passes. Combined is always kept.
    pub fn with_passes(mut self, passes: &[PassKind]) -> Self {
        self.passes = passes.to_vec();
        self
    }

    pub fn config(&self) -> &IntegratorConfig {
        self.config
    }

    pub fn passes(&self) -> &[PassKind] {
        &self.passes
    }

    /// RGBA of one camera sample of pixel (x, y).
    pub fn trace(&self, x: u32, y: u32, sample: u32, seed: u32) -> Vec4 {
        self.trace_with_seed(x, y, sample, seed).combined
    }

    /// Full result of one camera sample, seeded from the config.
    pub fn trace_sample(&self, x: u32, y: u32, sample: u32) -> PathResult {
        self.trace_with_seed(x, y, sample, self.config.seed)
    }

    fn trace_with_seed(&self, x: u32, y: u32, sample: u32, seed: u32) -> PathResult {
        let rng_hash = pixel_rng_hash(x, y, seed);
        let ray = self.camera.generate_ray(x, y, &self.sampler, rng_hash, sample);
        self.integrator.trace(&ray, rng_hash, sample, &self.camera_volumes)
    }

    /// Render all samples of every pixel. A cancelled render returns what
    /// was finished; untouched pixels have a sample count of zero.
    pub fn render_frame(&self, progress: &Progress) -> RenderBuffers {
        let width = self.camera.image_width;
        let height = self.camera.image_height;
        let buckets = generate_buckets(width, height, self.bucket_size);

        log::info!(
            "Rendering {}x{} at {} spp in {} buckets on {:?}",
            width,
            height,
            self.config.samples,
            buckets.len(),
            self.accel.device().key()
        );
        progress.set_total(width as u64 * height as u64 * self.config.samples as u64);
        progress.set_status("Rendering");

        let start = std::time::Instant::now();
        let results: Vec<_> = buckets
            .par_iter()
            .map(|bucket| render_bucket(bucket, self, progress))
            .collect();

        let mut buffers = RenderBuffers::new(width, height, &self.passes);
        for result in &results {
            buffers.write_bucket(&result.bucket, &result.buffers);
        }

        if progress.is_cancelled() {
            log::warn!("Render cancelled after {:.2?}", start.elapsed());
            progress.set_status("Cancelled");
        } else {
            log::info!("Rendered in {:.2?}", start.elapsed());
            progress.set_status("Done");
        }
        buffers
    }
}
