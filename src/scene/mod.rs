//! Scene management
//!
//! The scene owns cameras, meshes, drawables, lights and light probes in
//! insertion order. Per frame, [`Scene::gather_render_data`] fills a
//! camera's [`RenderDataManager`] with what that camera can see.

mod camera;
mod light;
mod light_probe;
mod render_data;
mod transform;

pub use camera::*;
pub use light::*;
pub use light_probe::*;
pub use render_data::*;
pub use transform::*;

use glam::Vec3;

use crate::material::{builtin, MaterialHandle, MaterialLibrary};
use crate::resources::Mesh;

/// Index of a mesh owned by the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshIndex(pub usize);

/// Index of a drawable owned by the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawableId(pub usize);

/// Index of a light owned by the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightId(pub usize);

/// Index of a light probe owned by the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(pub usize);

/// A mesh drawn with a material
#[derive(Debug, Clone)]
pub struct Drawable {
    pub name: String,
    pub mesh: MeshIndex,
    pub material: MaterialHandle,
    pub transform: Transform,
    pub cast_shadows: bool,
    pub visible: bool,
}

impl Drawable {
    pub fn new(name: &str, mesh: MeshIndex, material: MaterialHandle) -> Self {
        Self {
            name: name.to_string(),
            mesh,
            material,
            transform: Transform::default(),
            cast_shadows: true,
            visible: true,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.transform.position = position;
        self
    }

    pub fn with_shadows(mut self, cast_shadows: bool) -> Self {
        self.cast_shadows = cast_shadows;
        self
    }

    /// Bounding sphere of `mesh` under this drawable's transform.
    pub fn world_bounds(&self, mesh: &Mesh) -> (Vec3, f32) {
        let (center, radius) = mesh.bounding_sphere();
        (
            self.transform.matrix().transform_point3(center),
            radius * self.transform.max_scale(),
        )
    }
}

/// The scene containing all renderable content
#[derive(Debug, Default)]
pub struct Scene {
    cameras: Vec<Camera>,
    meshes: Vec<Mesh>,
    drawables: Vec<Drawable>,
    lights: Vec<Light>,
    probes: Vec<LightProbe>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a camera; cameras are processed in insertion order.
    pub fn add_camera(&mut self, camera: Camera) -> usize {
        self.cameras.push(camera);
        self.cameras.len() - 1
    }

    pub fn camera(&self, index: usize) -> &Camera {
        &self.cameras[index]
    }

    pub fn camera_mut(&mut self, index: usize) -> &mut Camera {
        &mut self.cameras[index]
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    pub fn cameras_mut(&mut self) -> &mut [Camera] {
        &mut self.cameras
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshIndex {
        self.meshes.push(mesh);
        MeshIndex(self.meshes.len() - 1)
    }

    pub fn mesh(&self, index: MeshIndex) -> &Mesh {
        &self.meshes[index.0]
    }

    pub fn add_drawable(&mut self, drawable: Drawable) -> DrawableId {
        self.drawables.push(drawable);
        DrawableId(self.drawables.len() - 1)
    }

    pub fn drawable(&self, id: DrawableId) -> &Drawable {
        &self.drawables[id.0]
    }

    pub fn drawable_mut(&mut self, id: DrawableId) -> &mut Drawable {
        &mut self.drawables[id.0]
    }

    pub fn drawables(&self) -> &[Drawable] {
        &self.drawables
    }

    pub fn add_light(&mut self, light: Light) -> LightId {
        self.lights.push(light);
        LightId(self.lights.len() - 1)
    }

    pub fn light(&self, id: LightId) -> &Light {
        &self.lights[id.0]
    }

    pub fn light_mut(&mut self, id: LightId) -> &mut Light {
        &mut self.lights[id.0]
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn lights_mut(&mut self) -> &mut [Light] {
        &mut self.lights
    }

    /// Append a probe. Probes get consecutive cube-array slices.
    pub fn add_probe(&mut self, mut probe: LightProbe) -> ProbeId {
        probe.set_slice(self.probes.len() as u32);
        self.probes.push(probe);
        ProbeId(self.probes.len() - 1)
    }

    pub fn probe(&self, id: ProbeId) -> &LightProbe {
        &self.probes[id.0]
    }

    pub fn probe_mut(&mut self, id: ProbeId) -> &mut LightProbe {
        &mut self.probes[id.0]
    }

    pub fn probes(&self) -> &[LightProbe] {
        &self.probes
    }

    /// Rebuild the render queues of camera `index` from what it can see.
    pub fn gather_render_data(&mut self, index: usize, library: &MaterialLibrary) {
        let mut data = std::mem::take(self.cameras[index].render_data_mut());
        self.collect(&self.cameras[index], library, &mut data);
        *self.cameras[index].render_data_mut() = data;
    }

    /// Rebuild the render queues of a probe's capture camera.
    pub fn gather_probe_render_data(&mut self, id: ProbeId, library: &MaterialLibrary) {
        let mut data = std::mem::take(self.probes[id.0].camera_mut().render_data_mut());
        self.collect(self.probes[id.0].camera(), library, &mut data);
        *self.probes[id.0].camera_mut().render_data_mut() = data;
    }

    fn collect(&self, camera: &Camera, library: &MaterialLibrary, data: &mut RenderDataManager) {
        data.clear();
        let frustum = camera.frustum();
        let eye = camera.position();

        for (index, drawable) in self.drawables.iter().enumerate() {
            if !drawable.visible {
                continue;
            }
            let id = DrawableId(index);
            let material = drawable.material;
            let (center, radius) = drawable.world_bounds(&self.meshes[drawable.mesh.0]);
            let distance = center.distance(eye);
            let item = RenderItem::Drawable { id, distance };

            // Casters outside the view can still shadow what is inside it.
            if drawable.cast_shadows && library.has_technique(material, RenderQueue::Shadow) {
                data.push(RenderBucket::Shadow, item);
            }
            if library.has_technique(material, RenderQueue::PostProcess) {
                data.push(RenderBucket::PostProcess, item);
            }
            if !frustum.intersects_sphere(center, radius) {
                continue;
            }
            if library.has_technique(material, RenderQueue::Opaque) {
                let specific = library
                    .find_pass(material, RenderQueue::Opaque, builtin::PASS_SPECIFIC_SHADING)
                    .is_some();
                let pass = if specific {
                    OpaquePass::Specific
                } else {
                    OpaquePass::Batch
                };
                data.push(RenderBucket::Opaque(pass), item);
            }
            if library.has_technique(material, RenderQueue::Transparent) {
                data.push(RenderBucket::Transparent, item);
            }
        }

        for (index, light) in self.lights.iter().enumerate() {
            let visible = match light.bounding_sphere() {
                Some((center, radius)) => frustum.intersects_sphere(center, radius),
                None => true,
            };
            if visible {
                data.push(RenderBucket::Lighting(light.kind), RenderItem::Light(LightId(index)));
            }
        }

        if camera.order != CameraOrder::LightProbe {
            for (index, probe) in self.probes.iter().enumerate() {
                if frustum.intersects_sphere(probe.position(), probe.range()) {
                    data.push(RenderBucket::LightProbe, RenderItem::Probe(ProbeId(index)));
                }
            }
        }

        data.sort_back_to_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn scene_with_camera() -> (Scene, MaterialLibrary) {
        let mut scene = Scene::new();
        scene.add_camera(
            Camera::new("main", Projection::perspective(60.0, 1.0, 0.1, 100.0))
                .with_transform(Transform::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y)),
        );
        (scene, MaterialLibrary::with_builtin())
    }

    #[test]
    fn test_gather_classifies_by_technique() {
        let (mut scene, mut library) = scene_with_camera();
        let cube = scene.add_mesh(Mesh::cube());
        let standard = library.create_material(builtin::STANDARD).unwrap();
        let unlit = library.create_material(builtin::STANDARD_UNLIT).unwrap();
        let glass = library.create_material(builtin::STANDARD_TRANSPARENT).unwrap();
        scene.add_drawable(Drawable::new("a", cube, standard));
        scene.add_drawable(Drawable::new("b", cube, unlit));
        scene.add_drawable(Drawable::new("c", cube, glass));

        scene.gather_render_data(0, &library);
        let data = scene.camera(0).render_data();
        assert_eq!(
            data.drawables(RenderBucket::Opaque(OpaquePass::Batch)).collect::<Vec<_>>(),
            vec![DrawableId(0)]
        );
        assert_eq!(
            data.drawables(RenderBucket::Opaque(OpaquePass::Specific)).collect::<Vec<_>>(),
            vec![DrawableId(1)]
        );
        assert_eq!(data.drawables(RenderBucket::Transparent).count(), 1);
        assert_eq!(data.drawables(RenderBucket::Shadow).count(), 2);
    }

    #[test]
    fn test_gather_culls_outside_frustum() {
        let (mut scene, mut library) = scene_with_camera();
        let cube = scene.add_mesh(Mesh::cube());
        let standard = library.create_material(builtin::STANDARD).unwrap();
        scene.add_drawable(Drawable::new("behind", cube, standard).with_position(Vec3::new(0.0, 0.0, 30.0)));
        scene.add_light(Light::point(Vec3::new(0.0, 0.0, 40.0), Vec3::ONE, 1.0));
        scene.add_light(Light::ambient(Vec3::ONE));

        scene.gather_render_data(0, &library);
        let data = scene.camera(0).render_data();
        assert!(data.is_empty(RenderBucket::Opaque(OpaquePass::Batch)));
        assert_eq!(data.drawables(RenderBucket::Shadow).count(), 1);
        assert_eq!(data.lights(LightKind::Point).count(), 0);
        assert_eq!(data.lights(LightKind::Ambient).count(), 1);
    }

    #[test]
    fn test_gather_rebuilds_each_time() {
        let (mut scene, mut library) = scene_with_camera();
        let cube = scene.add_mesh(Mesh::cube());
        let standard = library.create_material(builtin::STANDARD).unwrap();
        let id = scene.add_drawable(Drawable::new("a", cube, standard));

        scene.gather_render_data(0, &library);
        scene.drawable_mut(id).visible = false;
        scene.gather_render_data(0, &library);
        assert_eq!(scene.camera(0).render_data().total_items(), 0);
    }

    #[test]
    fn test_transparent_sorted_far_first() {
        let (mut scene, mut library) = scene_with_camera();
        let cube = scene.add_mesh(Mesh::cube());
        let glass = library.create_material(builtin::STANDARD_TRANSPARENT).unwrap();
        let near = scene.add_drawable(Drawable::new("near", cube, glass).with_position(Vec3::new(0.0, 0.0, 5.0)));
        let far = scene.add_drawable(Drawable::new("far", cube, glass).with_position(Vec3::new(0.0, 0.0, -5.0)));

        scene.gather_render_data(0, &library);
        let order: Vec<_> = scene
            .camera(0)
            .render_data()
            .drawables(RenderBucket::Transparent)
            .collect();
        assert_eq!(order, vec![far, near]);
    }

    #[test]
    fn test_probes_get_slices() {
        let mut scene = Scene::new();
        let a = scene.add_probe(LightProbe::new("a", Vec3::ZERO, 5.0));
        let b = scene.add_probe(LightProbe::new("b", Vec3::X, 5.0));
        assert_eq!(scene.probe(a).slice(), 0);
        assert_eq!(scene.probe(b).slice(), 1);
        assert_eq!(scene.probe(b).camera().clear_color, Vec4::new(0.0, 0.0, 0.0, 1.0));
    }
}
