#![allow(dead_code)]

use deferred_renderer::backend::HeadlessBackend;
use deferred_renderer::material::{builtin, MaterialLibrary};
use deferred_renderer::pipeline::PipelineConfig;
use deferred_renderer::resources::Mesh;
use deferred_renderer::scene::{Camera, Drawable, Light, Projection, Scene, Transform};
use glam::Vec3;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small targets keep the CPU device fast.
pub fn small_config() -> PipelineConfig {
    PipelineConfig {
        width: 32,
        height: 24,
        shadow_map_size: 16,
        probe_map_size: Some(8),
        probe_capacity: 2,
        ..Default::default()
    }
}

pub fn device(width: u32, height: u32) -> HeadlessBackend {
    init_logging();
    HeadlessBackend::new(width, height)
}

pub fn perspective_camera(name: &str) -> Camera {
    Camera::new(name, Projection::perspective(60.0, 4.0 / 3.0, 0.1, 50.0))
        .with_transform(Transform::looking_at(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, Vec3::Y))
}

/// One perspective camera looking at a standard cube lit by an ambient light.
pub fn lit_cube_scene(library: &mut MaterialLibrary) -> Scene {
    let mut scene = Scene::new();
    let cube = scene.add_mesh(Mesh::cube());
    let material = library
        .create_material(builtin::STANDARD)
        .expect("standard material");
    scene.add_drawable(Drawable::new("cube", cube, material));
    scene.add_light(Light::ambient(Vec3::splat(0.5)));
    scene.add_camera(perspective_camera("main"));
    scene
}
