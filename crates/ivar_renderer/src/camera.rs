//! Camera for primary ray generation.
//!
//! Pixel, lens and shutter positions come from the frame's sample stream
//! (filter, lens and time dimensions), so each camera sample is
//! reproducible from its pixel hash and sample index.

use ivar_math::Vec3;

use crate::ray::{Ray, RayDifferentials};
use crate::sampling::{concentric_sample_disk, dim, Sampler};

/// Thin-lens camera.
#[derive(Debug, Clone)]
pub struct Camera {
    // Image settings
    pub image_width: u32,
    pub image_height: u32,

    // Camera positioning
    look_from: Vec3,
    look_at: Vec3,
    vup: Vec3,

    // Lens settings
    vfov: f32,          // Vertical field of view in degrees
    defocus_angle: f32, // Variation angle of rays through each pixel
    focus_dist: f32,    // Distance from camera to plane of perfect focus

    // Shutter interval in normalized frame time
    shutter_open: f32,
    shutter_close: f32,

    // Cached computed values (set by initialize())
    center: Vec3,
    pixel00_loc: Vec3,
    pixel_delta_u: Vec3,
    pixel_delta_v: Vec3,
    u: Vec3,
    v: Vec3,
    w: Vec3,
    defocus_disk_u: Vec3,
    defocus_disk_v: Vec3,
}

impl Camera {
    /// Create a new camera with default settings.
    pub fn new() -> Self {
        Self {
            image_width: 800,
            image_height: 450,
            look_from: Vec3::new(0.0, 0.0, 0.0),
            look_at: Vec3::new(0.0, 0.0, -1.0),
            vup: Vec3::new(0.0, 1.0, 0.0),
            vfov: 90.0,
            defocus_angle: 0.0,
            focus_dist: 1.0,
            shutter_open: 0.0,
            shutter_close: 0.0,
            center: Vec3::ZERO,
            pixel00_loc: Vec3::ZERO,
            pixel_delta_u: Vec3::ZERO,
            pixel_delta_v: Vec3::ZERO,
            u: Vec3::X,
            v: Vec3::Y,
            w: Vec3::Z,
            defocus_disk_u: Vec3::ZERO,
            defocus_disk_v: Vec3::ZERO,
        }
    }

    /// Set image resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.image_width = width.max(1);
        self.image_height = height.max(1);
        self
    }

    /// Set camera position.
    pub fn with_position(mut self, look_from: Vec3, look_at: Vec3, vup: Vec3) -> Self {
        self.look_from = look_from;
        self.look_at = look_at;
        self.vup = vup;
        self
    }

    /// Set lens settings.
    pub fn with_lens(mut self, vfov: f32, defocus_angle: f32, focus_dist: f32) -> Self {
        self.vfov = vfov;
        self.defocus_angle = defocus_angle;
        self.focus_dist = focus_dist;
        self
    }

    /// Open the shutter over `[open, close]`; equal values disable motion blur.
    pub fn with_shutter(mut self, open: f32, close: f32) -> Self {
        self.shutter_open = open;
        self.shutter_close = close.max(open);
        self
    }

    /// Initialize the camera (must be called before generating rays).
    pub fn initialize(&mut self) {
        self.center = self.look_from;

        let theta = self.vfov.to_radians();
        let h = (theta / 2.0).tan();
        let viewport_height = 2.0 * h * self.focus_dist;
        let viewport_width = viewport_height * (self.image_width as f32 / self.image_height as f32);

        self.w = (self.look_from - self.look_at).normalize();
        self.u = self.vup.cross(self.w).normalize();
        self.v = self.w.cross(self.u);

        let viewport_u = viewport_width * self.u;
        let viewport_v = -viewport_height * self.v;

        self.pixel_delta_u = viewport_u / self.image_width as f32;
        self.pixel_delta_v = viewport_v / self.image_height as f32;

        let viewport_upper_left = self.center - self.focus_dist * self.w - viewport_u / 2.0 - viewport_v / 2.0;
        self.pixel00_loc = viewport_upper_left + 0.5 * (self.pixel_delta_u + self.pixel_delta_v);

        let defocus_radius = self.focus_dist * (self.defocus_angle / 2.0).to_radians().tan();
        self.defocus_disk_u = self.u * defocus_radius;
        self.defocus_disk_v = self.v * defocus_radius;
    }

    pub fn position(&self) -> Vec3 {
        self.center
    }

    pub fn shutter(&self) -> (f32, f32) {
        (self.shutter_open, self.shutter_close)
    }

    /// Primary ray for `sample` of pixel (x, y), with unit direction and
    /// pixel-footprint differentials.
    pub fn generate_ray(&self, x: u32, y: u32, sampler: &Sampler, rng_hash: u32, sample: u32) -> Ray {
        let (fu, fv) = sampler.sample_2d(rng_hash, sample, dim::FILTER_U);
        let pixel_sample = self.pixel00_loc
            + (x as f32 + fu - 0.5) * self.pixel_delta_u
            + (y as f32 + fv - 0.5) * self.pixel_delta_v;

        let origin = if self.defocus_angle <= 0.0 {
            self.center
        } else {
            let (lu, lv) = sampler.sample_2d(rng_hash, sample, dim::LENS_U);
            let (dx, dy) = concentric_sample_disk(lu, lv);
            self.center + dx * self.defocus_disk_u + dy * self.defocus_disk_v
        };

        let time = if self.shutter_close > self.shutter_open {
            let t = sampler.sample_1d(rng_hash, sample, dim::TIME);
            self.shutter_open + (self.shutter_close - self.shutter_open) * t
        } else {
            self.shutter_open
        };

        let to_pixel = pixel_sample - origin;
        let direction = to_pixel.normalize();
        let mut ray = Ray::new(origin, direction, time);
        ray.differentials = Some(RayDifferentials {
            dp: [Vec3::ZERO; 2],
            dd: [
                (to_pixel + self.pixel_delta_u).normalize() - direction,
                (to_pixel + self.pixel_delta_v).normalize() - direction,
            ],
        });
        ray
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingPattern;

    fn sampler() -> Sampler {
        Sampler::new(SamplingPattern::SobolBurley, 16)
    }

    #[test]
    fn test_camera_initialize() {
        let mut camera = Camera::new()
            .with_resolution(800, 600)
            .with_position(
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(0.0, 0.0, -1.0),
                Vec3::new(0.0, 1.0, 0.0),
            )
            .with_lens(90.0, 0.0, 1.0);

        camera.initialize();

        assert_eq!(camera.center, Vec3::ZERO);
        assert!((camera.w - Vec3::Z).length() < 0.001);
    }

    #[test]
    fn test_camera_ray_direction() {
        let mut camera = Camera::new()
            .with_resolution(100, 100)
            .with_position(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y)
            .with_lens(90.0, 0.0, 1.0);
        camera.initialize();

        let ray = camera.generate_ray(50, 50, &sampler(), 7, 0);
        assert!(ray.direction.z < -0.99);
        assert_eq!(ray.origin, Vec3::ZERO);
        assert!((ray.direction.length() - 1.0).abs() < 1e-5);

        let d = ray.differentials.unwrap();
        assert!(d.dd[0].x > 0.0);
        assert!(d.dd[1].y < 0.0);
    }

    #[test]
    fn test_filter_samples_stay_in_pixel() {
        let mut camera = Camera::new()
            .with_resolution(10, 10)
            .with_position(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y)
            .with_lens(90.0, 0.0, 1.0);
        camera.initialize();

        // 90 degrees over 10 pixels: pixel 0 spans x in [-1, -0.8] on the
        // image plane at distance 1.
        for sample in 0..32 {
            let ray = camera.generate_ray(0, 0, &sampler(), 3, sample);
            let x = ray.direction.x / -ray.direction.z;
            assert!((-1.0..=-0.8).contains(&x), "{}", x);
        }
    }

    #[test]
    fn test_lens_and_shutter() {
        let mut camera = Camera::new()
            .with_resolution(64, 64)
            .with_position(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y)
            .with_lens(40.0, 10.0, 5.0)
            .with_shutter(0.25, 0.75);
        camera.initialize();

        let radius = 5.0 * 5.0f32.to_radians().tan();
        let mut moved = false;
        for sample in 0..32 {
            let ray = camera.generate_ray(32, 32, &sampler(), 11, sample);
            assert!(ray.origin.length() <= radius + 1e-5);
            assert!((0.25..=0.75).contains(&ray.time));
            moved |= ray.origin.length() > 1e-4;

            // Every lens position focuses on the same plane point.
            let on_focus_plane = ray.at(5.0 / -ray.direction.z);
            assert!(on_focus_plane.x.abs() < 0.2 && on_focus_plane.y.abs() < 0.2);
        }
        assert!(moved);
    }
}
