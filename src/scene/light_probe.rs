//! Light probes
//!
//! A probe captures the scene around a point into one slice of the
//! pipeline's cube-map arrays. The capture itself lives in
//! [`crate::pipeline::LightProbePipeline`]; this is the scene-side state.

use glam::{Vec3, Vec4};

use super::camera::{Camera, CameraOrder, ClearFlags, Projection};
use super::transform::Transform;

/// Look and up directions of the six cube faces, in layer order
/// (+X, -X, +Y, -Y, +Z, -Z).
pub const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

/// A point capturing its surroundings into a cube map
#[derive(Debug, Clone)]
pub struct LightProbe {
    pub name: String,
    position: Vec3,
    range: f32,
    need_update: bool,
    camera: Camera,
    slice: u32,
}

impl LightProbe {
    /// A new probe starts dirty.
    pub fn new(name: &str, position: Vec3, range: f32) -> Self {
        let camera = Camera::new(
            &format!("{name}/capture"),
            Projection::perspective(90.0, 1.0, 0.05, range.max(0.1)),
        )
        .with_order(CameraOrder::LightProbe)
        .with_clear(ClearFlags::COLOR | ClearFlags::DEPTH, Vec4::new(0.0, 0.0, 0.0, 1.0))
        .with_transform(Transform::from_position(position));

        Self {
            name: name.to_string(),
            position,
            range,
            need_update: true,
            camera,
            slice: 0,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Move the probe; its capture becomes stale.
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.camera.transform_mut().position = position;
        self.need_update = true;
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    pub fn set_range(&mut self, range: f32) {
        self.range = range;
        if let Projection::Perspective { fov_y, aspect, near, .. } = *self.camera.projection() {
            self.camera.set_projection(Projection::Perspective {
                fov_y,
                aspect,
                near,
                far: range.max(near + 0.01),
            });
        }
        self.need_update = true;
    }

    pub fn need_update(&self) -> bool {
        self.need_update
    }

    /// Request a fresh capture next frame.
    pub fn mark_dirty(&mut self) {
        self.need_update = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.need_update = false;
    }

    /// Camera used only for capture. Its clear flags and color apply to every face.
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Slice of the probe cube-map arrays this probe writes into.
    pub fn slice(&self) -> u32 {
        self.slice
    }

    pub(crate) fn set_slice(&mut self, slice: u32) {
        self.slice = slice;
    }

    /// Array layer of `face` within the cube-map arrays.
    pub fn layer(&self, face: usize) -> u32 {
        self.slice * 6 + face as u32
    }

    /// Transform of the capture camera for one face.
    pub fn face_transform(&self, face: usize) -> Transform {
        let (look, up) = CUBE_FACES[face];
        let mut transform = Transform::from_position(self.position);
        transform.look_to(look, up);
        transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_faces_are_orthonormal() {
        for (look, up) in CUBE_FACES {
            assert_eq!(look.dot(up), 0.0);
            assert_eq!(look.length(), 1.0);
        }
    }

    #[test]
    fn test_face_transform_looks_along_face() {
        let probe = LightProbe::new("probe", Vec3::new(1.0, 2.0, 3.0), 20.0);
        for (face, (look, _)) in CUBE_FACES.iter().enumerate() {
            let transform = probe.face_transform(face);
            assert!((transform.forward() - *look).length() < 1e-5);
            assert_eq!(transform.position, probe.position());
        }
    }

    #[test]
    fn test_dirty_tracking() {
        let mut probe = LightProbe::new("probe", Vec3::ZERO, 10.0);
        assert!(probe.need_update());
        probe.mark_clean();
        assert!(!probe.need_update());
        probe.set_position(Vec3::X);
        assert!(probe.need_update());
        assert_eq!(probe.camera().position(), Vec3::X);
    }

    #[test]
    fn test_capture_camera_is_square() {
        let probe = LightProbe::new("probe", Vec3::ZERO, 10.0);
        let camera = probe.camera();
        assert_eq!(camera.order, CameraOrder::LightProbe);
        assert!((camera.projection().fov_y().unwrap() - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
        assert_eq!(camera.projection().far(), 10.0);
    }

    #[test]
    fn test_layers_follow_slice() {
        let mut probe = LightProbe::new("probe", Vec3::ZERO, 10.0);
        probe.set_slice(2);
        assert_eq!(probe.layer(0), 12);
        assert_eq!(probe.layer(5), 17);
    }
}
