//! Ivar Scene - flattened geometry and object store.
//!
//! This crate provides the data the acceleration structures are built from:
//!
//! - **Geometry**: triangle `Mesh`es and `Curves`, with optional motion keys
//! - **Objects**: instances of a shared geometry with a static or animated transform
//! - **Shader table**: per-shader flags the traversal filters need
//!
//! The host scene graph fills a `Scene` and hands it to an acceleration
//! structure at commit time.
//!
//! # Example
//!
//! ```ignore
//! use ivar_scene::{Mesh, Object, Scene, ShaderFlags};
//!
//! let mut scene = Scene::new();
//! let shader = scene.add_shader("grey", ShaderFlags::empty());
//! let geom = scene.add_geometry(mesh.with_shader(shader))?;
//! scene.add_object(Object::new(geom))?;
//! ```

pub mod curves;
pub mod mesh;
pub mod object;
pub mod scene;

pub use curves::Curves;
pub use mesh::Mesh;
pub use object::{Object, ObjectFlags, ObjectTransform, Visibility};
pub use scene::{Geometry, Scene, SceneError, ShaderFlags, ShaderInfo};
