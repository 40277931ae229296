//! Ivar renderer core - CPU path tracing
//!
//! Ray acceleration and light transport for a physically based path
//! tracer: a two-level BVH behind the `Accel` interface (with an optional
//! Embree backend), and the path integration loop with light sampling,
//! transparent shadows, participating media and subsurface scattering.
//!
//! Shading and light selection are supplied by the host through the
//! `ShadingEvaluator` and `LightSampler` traits.

pub mod accel;
pub mod bucket;
pub mod camera;
pub mod device;
pub mod film;
pub mod filter;
pub mod integrator;
pub mod intersection;
pub mod light;
pub mod progress;
pub mod radiance;
pub mod ray;
pub mod renderer;
pub mod sampling;
pub mod shader;
pub mod shadow;
pub mod state;
pub mod subsurface;
pub mod volume;

#[cfg(test)]
mod testing;

pub use accel::{create_accel, Accel, AccelError, AccelParams, PackedPrimitives, SoftwareAccel};
pub use bucket::{generate_buckets, Bucket, BucketResult, DEFAULT_BUCKET_SIZE};
pub use camera::Camera;
pub use device::{BackendDevice, BackendKind, DeviceCapabilities, DeviceKey, DeviceManager};
pub use film::{color_to_rgba, PassKind, RenderBuffers};
pub use integrator::{ConfigError, IntegratorConfig, PathIntegrator, PathResult};
pub use intersection::{Intersection, PrimitiveType};
pub use light::{EmitterHit, LightKind, LightSample, LightSampler, PointLight, PointLights, SceneLights};
pub use progress::Progress;
pub use radiance::{BsdfEval, ClosureChannel, PathRadiance};
pub use ray::Ray;
pub use renderer::Renderer;
pub use sampling::{Sampler, SamplingPattern};
pub use shader::{ShaderClosures, ShaderData, ShaderTable, ShadingEvaluator, SurfaceShader, VolumeShader};
pub use state::{PathRayFlags, PathState, VolumeStack};

/// Re-export the math types every caller needs
pub use ivar_math::{Aabb, Interval, Vec3, Vec4};
