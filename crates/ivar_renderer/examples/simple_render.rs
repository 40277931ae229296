//! Simple path tracer example.
//!
//! Renders a small lit room with a subsurface block and a foggy slab and
//! saves the result as PPM. An optional first argument names an integrator
//! config JSON file.
//!
//! Run with: cargo run --release --example simple_render -- [config.json]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use anyhow::Context;
use ivar_renderer::{
    create_accel, AccelParams, Camera, DeviceKey, DeviceManager, IntegratorConfig, PointLight, Progress,
    RenderBuffers, Renderer, SceneLights, ShaderTable, SurfaceShader, Vec3, VolumeShader,
};
use ivar_scene::{Mesh, Object, Scene};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => IntegratorConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => IntegratorConfig::default().with_samples(32),
    };

    let (scene, shaders) = build_scene()?;

    let device = DeviceManager::new().acquire(DeviceKey::SOFTWARE)?;
    let mut accel = create_accel(AccelParams::default(), Arc::clone(&device))?;
    accel.build(&scene, &Progress::new())?;

    let lights = SceneLights::from_scene(
        &scene,
        accel.pack(),
        vec![PointLight {
            position: Vec3::new(-1.5, 3.5, 1.5),
            intensity: Vec3::new(6.0, 5.0, 4.0),
            shader: 0,
        }],
        |shader| {
            shaders
                .shaders
                .get(shader as usize)
                .map_or(Vec3::ZERO, |s| s.emission)
        },
    );

    let mut camera = Camera::new()
        .with_resolution(320, 240)
        .with_position(Vec3::new(0.0, 2.0, 7.0), Vec3::new(0.0, 1.0, 0.0), Vec3::Y)
        .with_lens(45.0, 0.0, 7.0);
    camera.initialize();

    let renderer = Renderer::new(&camera, accel.as_ref(), &shaders, &lights, &config);
    let buffers = renderer.render_frame(&Progress::new());

    let filename = "output.ppm";
    save_ppm(&buffers, filename).with_context(|| format!("writing {}", filename))?;
    log::info!("Saved to {}", filename);
    Ok(())
}

fn quad(corners: [Vec3; 4], shader: u32) -> Mesh {
    Mesh::new(corners.to_vec(), vec![0, 1, 2, 0, 2, 3]).with_shader(shader)
}

/// Axis-aligned box with outward-facing triangles.
fn cuboid(min: Vec3, max: Vec3, shader: u32) -> Mesh {
    let p = |x: bool, y: bool, z: bool| {
        Vec3::new(
            if x { max.x } else { min.x },
            if y { max.y } else { min.y },
            if z { max.z } else { min.z },
        )
    };
    let positions = vec![
        p(false, false, false),
        p(true, false, false),
        p(true, true, false),
        p(false, true, false),
        p(false, false, true),
        p(true, false, true),
        p(true, true, true),
        p(false, true, true),
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 0, 3, 2, // back
        4, 5, 6, 4, 6, 7, // front
        0, 4, 7, 0, 7, 3, // left
        1, 2, 6, 1, 6, 5, // right
        3, 7, 6, 3, 6, 2, // top
        0, 1, 5, 0, 5, 4, // bottom
    ];
    Mesh::new(positions, indices).with_shader(shader)
}

fn build_scene() -> anyhow::Result<(Scene, ShaderTable)> {
    let mut scene = Scene::new();
    let mut shaders = ShaderTable::new(Vec3::new(0.05, 0.06, 0.08));
    let mut add_shader = |scene: &mut Scene, name: &str, shader: SurfaceShader| {
        let id = shaders.add(shader);
        scene.add_shader(name, shader.flags());
        id
    };

    let white = add_shader(&mut scene, "white", SurfaceShader::diffuse(Vec3::splat(0.7)));
    let red = add_shader(&mut scene, "red", SurfaceShader::diffuse(Vec3::new(0.7, 0.1, 0.1)));
    let light = add_shader(&mut scene, "light", SurfaceShader::emissive(Vec3::splat(8.0)));
    let skin = add_shader(
        &mut scene,
        "skin",
        SurfaceShader {
            diffuse: Vec3::splat(0.1),
            subsurface: Vec3::new(0.8, 0.5, 0.4),
            subsurface_radius: Vec3::new(0.3, 0.15, 0.1),
            ..Default::default()
        },
    );
    let fog = add_shader(
        &mut scene,
        "fog",
        SurfaceShader::volume_only(VolumeShader {
            scatter: Vec3::splat(0.3),
            absorption: Vec3::splat(0.05),
            anisotropy: 0.3,
            ..Default::default()
        }),
    );

    let meshes = [
        quad(
            [
                Vec3::new(-3.0, 0.0, 3.0),
                Vec3::new(3.0, 0.0, 3.0),
                Vec3::new(3.0, 0.0, -3.0),
                Vec3::new(-3.0, 0.0, -3.0),
            ],
            white,
        ),
        quad(
            [
                Vec3::new(-3.0, 0.0, -3.0),
                Vec3::new(3.0, 0.0, -3.0),
                Vec3::new(3.0, 4.0, -3.0),
                Vec3::new(-3.0, 4.0, -3.0),
            ],
            white,
        ),
        quad(
            [
                Vec3::new(-3.0, 0.0, 3.0),
                Vec3::new(-3.0, 0.0, -3.0),
                Vec3::new(-3.0, 4.0, -3.0),
                Vec3::new(-3.0, 4.0, 3.0),
            ],
            red,
        ),
        quad(
            [
                Vec3::new(-0.75, 3.99, -0.75),
                Vec3::new(0.75, 3.99, -0.75),
                Vec3::new(0.75, 3.99, 0.75),
                Vec3::new(-0.75, 3.99, 0.75),
            ],
            light,
        ),
        cuboid(Vec3::new(-1.5, 0.0, -1.0), Vec3::new(-0.3, 1.2, 0.2), skin),
        cuboid(Vec3::new(0.3, 0.0, -0.5), Vec3::new(1.8, 1.5, 1.0), fog),
    ];
    for mesh in meshes {
        let geometry = scene.add_geometry(mesh)?;
        scene.add_object(Object::new(geometry))?;
    }
    Ok((scene, shaders))
}

fn save_ppm(buffers: &RenderBuffers, filename: &str) -> std::io::Result<()> {
    let file = File::create(filename)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "P3")?;
    writeln!(writer, "{} {}", buffers.width, buffers.height)?;
    writeln!(writer, "255")?;

    for rgba in buffers.to_rgba8().chunks_exact(4) {
        writeln!(writer, "{} {} {}", rgba[0], rgba[1], rgba[2])?;
    }

    writer.flush()
}
