//! Fixture scenes shared by the unit tests.

use ivar_math::Vec3;
use ivar_scene::{Mesh, Object, Scene};

use crate::accel::{Accel, AccelParams, SoftwareAccel};
use crate::device::{BackendKind, DeviceCapabilities, DeviceKey, DeviceManager};
use crate::integrator::IntegratorConfig;
use crate::progress::Progress;
use crate::ray::Ray;
use crate::sampling::{Sampler, SamplingPattern};
use crate::shader::{ShaderTable, SurfaceShader};
use crate::shadow::{ShadowResolver, ShadowStrategy};
use crate::state::PathState;
use crate::volume::VolumeIntegrator;

pub(crate) const QUAD_HALF_EXTENT: f32 = 5.0;

/// Square in the plane `z`, normal +Z.
pub(crate) fn quad_at_z(z: f32, shader: u32) -> Mesh {
    let e = QUAD_HALF_EXTENT;
    Mesh::new(
        vec![
            Vec3::new(-e, -e, z),
            Vec3::new(e, -e, z),
            Vec3::new(e, e, z),
            Vec3::new(-e, e, z),
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
    .with_shader(shader)
}

/// Slab between `bottom` and `top` closed by outward-facing caps; the sides
/// are left open since the caps are much wider than the slab is thick.
pub(crate) fn slab(bottom: f32, top: f32, shader: u32) -> Mesh {
    let e = QUAD_HALF_EXTENT;
    Mesh::new(
        vec![
            Vec3::new(-e, -e, top),
            Vec3::new(e, -e, top),
            Vec3::new(e, e, top),
            Vec3::new(-e, e, top),
            Vec3::new(-e, -e, bottom),
            Vec3::new(e, -e, bottom),
            Vec3::new(e, e, bottom),
            Vec3::new(-e, e, bottom),
        ],
        vec![0, 1, 2, 0, 2, 3, 4, 6, 5, 4, 7, 6],
    )
    .with_shader(shader)
}

pub(crate) fn build_accel(scene: &Scene) -> SoftwareAccel {
    build_accel_with(scene, DeviceCapabilities::for_backend(BackendKind::Software))
}

pub(crate) fn build_accel_with(scene: &Scene, capabilities: DeviceCapabilities) -> SoftwareAccel {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = DeviceManager::new()
        .acquire_with(DeviceKey::SOFTWARE, capabilities)
        .expect("software device");
    let mut accel = SoftwareAccel::new(AccelParams::default(), device);
    accel.build(scene, &Progress::new()).expect("build");
    accel
}

/// A scene and the shader table its shader ids index.
pub(crate) struct TestScene {
    pub scene: Scene,
    pub table: ShaderTable,
}

impl TestScene {
    pub fn new(background: Vec3) -> Self {
        Self {
            scene: Scene::new(),
            table: ShaderTable::new(background),
        }
    }

    pub fn shader(&mut self, shader: SurfaceShader) -> u32 {
        let id = self.table.add(shader);
        let scene_id = self.scene.add_shader(format!("shader{}", id), shader.flags());
        assert_eq!(id, scene_id);
        id
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> usize {
        let geometry = self.scene.add_geometry(mesh).expect("valid mesh");
        self.scene.add_object(Object::new(geometry)).expect("valid object")
    }

    pub fn build(&self) -> SoftwareAccel {
        build_accel(&self.scene)
    }

    pub fn build_with(&self, capabilities: DeviceCapabilities) -> SoftwareAccel {
        build_accel_with(&self.scene, capabilities)
    }
}

/// Scene of `meshes` sharing a default diffuse shader with id 0.
pub(crate) fn flat_scene(meshes: Vec<Mesh>) -> (Scene, ShaderTable) {
    let mut test = TestScene::new(Vec3::ZERO);
    test.shader(SurfaceShader::default());
    for mesh in meshes {
        test.add_mesh(mesh);
    }
    (test.scene, test.table)
}

/// Stack of horizontal layers for shadow tests. A zero transparency is an
/// opaque layer.
pub(crate) struct ShadowFixture {
    pub test: TestScene,
    pub accel: SoftwareAccel,
    pub config: IntegratorConfig,
}

impl ShadowFixture {
    pub fn new(layers: &[(f32, Vec3)]) -> Self {
        let mut test = TestScene::new(Vec3::ZERO);
        let opaque = test.shader(SurfaceShader::default());
        for &(z, transparency) in layers {
            let shader = if transparency == Vec3::ZERO {
                opaque
            } else {
                test.shader(SurfaceShader {
                    diffuse: Vec3::ZERO,
                    transparent: transparency,
                    ..Default::default()
                })
            };
            test.add_mesh(quad_at_z(z, shader));
        }
        let accel = test.build();
        Self {
            test,
            accel,
            config: IntegratorConfig::default(),
        }
    }

    pub fn resolve(&self, strategy: ShadowStrategy, ray: &Ray) -> Option<Vec3> {
        let volumes = VolumeIntegrator {
            shading: &self.test.table,
            sampler: Sampler::new(SamplingPattern::SobolBurley, 1),
            config: &self.config,
            shader_flags: &self.accel.pack().shader_flags,
        };
        let resolver = ShadowResolver {
            accel: &self.accel,
            shading: &self.test.table,
            volumes: &volumes,
            config: &self.config,
            strategy,
        };
        resolver.resolve(&PathState::new(0, 0, false), ray)
    }
}
