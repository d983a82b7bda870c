//! Camera state
//!
//! View and projection matrices are derived lazily: every setter that
//! affects them drops the cached set, and every getter recomputes it first
//! when it is missing.

use std::cell::Cell;

use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};

use crate::backend::{TextureHandle, Viewport};

use super::render_data::RenderDataManager;
use super::transform::Transform;

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        width: f32,
        height: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        Projection::Orthographic {
            width,
            height,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                width,
                height,
                near,
                far,
            } => Mat4::orthographic_rh(
                -width * 0.5,
                width * 0.5,
                -height * 0.5,
                height * 0.5,
                near,
                far,
            ),
        }
    }

    pub fn near(&self) -> f32 {
        match self {
            Projection::Perspective { near, .. } | Projection::Orthographic { near, .. } => *near,
        }
    }

    pub fn far(&self) -> f32 {
        match self {
            Projection::Perspective { far, .. } | Projection::Orthographic { far, .. } => *far,
        }
    }

    /// Vertical field of view in radians, perspective only.
    pub fn fov_y(&self) -> Option<f32> {
        match self {
            Projection::Perspective { fov_y, .. } => Some(*fov_y),
            Projection::Orthographic { .. } => None,
        }
    }

    /// View volume extent, orthographic only.
    pub fn ortho_size(&self) -> Option<(f32, f32)> {
        match self {
            Projection::Orthographic { width, height, .. } => Some((*width, *height)),
            Projection::Perspective { .. } => None,
        }
    }

    /// Adapt to a new aspect ratio. Orthographic volumes keep their height.
    pub fn set_aspect(&mut self, new_aspect: f32) {
        match self {
            Projection::Perspective { aspect, .. } => *aspect = new_aspect,
            Projection::Orthographic { width, height, .. } => *width = *height * new_aspect,
        }
    }
}

bitflags! {
    /// Which attachments a camera clears before rendering
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// When in the frame a camera is processed, and what it renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CameraOrder {
    /// Full pipeline into the camera's own render texture
    Custom,
    /// Internal: shadow-map rendering
    Shadow,
    /// Internal: light-probe capture
    LightProbe,
    /// Full pipeline presented to the backbuffer
    Scene3D,
    /// Transparent queue drawn directly over the backbuffer
    Overlay2D,
}

impl CameraOrder {
    /// Internal cameras are driven by their sub-pipeline, not the frame loop.
    pub fn is_internal(&self) -> bool {
        matches!(self, CameraOrder::Shadow | CameraOrder::LightProbe)
    }
}

/// Viewport rectangle in normalized `[0, 1]` coordinates, origin top-left
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for ViewRect {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

/// Matrices derived from a camera's transform and projection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub inverse_view: Mat4,
    pub inverse_projection: Mat4,
    pub inverse_view_projection: Mat4,
}

impl CameraMatrices {
    fn compute(transform: &Transform, projection: &Projection) -> Self {
        let inverse_view = Mat4::from_rotation_translation(transform.rotation, transform.position);
        let view = inverse_view.inverse();
        let projection = projection.matrix();
        let view_projection = projection * view;
        Self {
            view,
            projection,
            view_projection,
            inverse_view,
            inverse_projection: projection.inverse(),
            inverse_view_projection: view_projection.inverse(),
        }
    }
}

/// Six clip planes as `(normal, distance)` with normals pointing inward
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extract planes from a view-projection matrix with `[0, 1]` clip depth.
    pub fn from_view_projection(m: Mat4) -> Self {
        let rows = [m.row(0), m.row(1), m.row(2), m.row(3)];
        let planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            rows[2],
            rows[3] - rows[2],
        ]
        .map(|p| p / p.truncate().length());
        Self { planes }
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.truncate().dot(center) + p.w >= -radius)
    }
}

/// Per-viewpoint rendering state
#[derive(Debug, Clone)]
pub struct Camera {
    pub name: String,
    transform: Transform,
    projection: Projection,
    pub viewport: ViewRect,
    pub clear_flags: ClearFlags,
    pub clear_color: Vec4,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub order: CameraOrder,
    /// Target of a [`CameraOrder::Custom`] camera
    pub render_texture: Option<TextureHandle>,
    matrices: Cell<Option<CameraMatrices>>,
    render_data: RenderDataManager,
}

impl Camera {
    pub fn new(name: &str, projection: Projection) -> Self {
        Self {
            name: name.to_string(),
            transform: Transform::default(),
            projection,
            viewport: ViewRect::default(),
            clear_flags: ClearFlags::COLOR | ClearFlags::DEPTH,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            clear_depth: 1.0,
            clear_stencil: 0,
            order: CameraOrder::Scene3D,
            render_texture: None,
            matrices: Cell::new(None),
            render_data: RenderDataManager::new(),
        }
    }

    pub fn with_order(mut self, order: CameraOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.set_transform(transform);
        self
    }

    pub fn with_clear(mut self, flags: ClearFlags, color: Vec4) -> Self {
        self.clear_flags = flags;
        self.clear_color = color;
        self
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.matrices.set(None);
    }

    /// Mutable access to the transform; marks the matrices dirty.
    pub fn transform_mut(&mut self) -> &mut Transform {
        self.matrices.set(None);
        &mut self.transform
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
        self.matrices.set(None);
    }

    /// Match the projection to a render area of `width` by `height` pixels.
    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let aspect = (width as f32 * self.viewport.width) / (height as f32 * self.viewport.height);
        self.projection.set_aspect(aspect);
        self.matrices.set(None);
    }

    /// Whether the cached matrices are stale.
    pub fn is_dirty(&self) -> bool {
        self.matrices.get().is_none()
    }

    /// Current matrices, recomputed first if dirty.
    pub fn matrices(&self) -> CameraMatrices {
        match self.matrices.get() {
            Some(matrices) => matrices,
            None => {
                let matrices = CameraMatrices::compute(&self.transform, &self.projection);
                self.matrices.set(Some(matrices));
                matrices
            }
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.matrices().view_projection
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection())
    }

    pub fn position(&self) -> Vec3 {
        self.transform.position
    }

    /// Viewport in pixels for a target of the given size.
    pub fn pixel_viewport(&self, width: u32, height: u32) -> Viewport {
        Viewport {
            x: (self.viewport.x * width as f32).round(),
            y: (self.viewport.y * height as f32).round(),
            width: (self.viewport.width * width as f32).round().max(1.0),
            height: (self.viewport.height * height as f32).round().max(1.0),
        }
    }

    pub fn render_data(&self) -> &RenderDataManager {
        &self.render_data
    }

    pub fn render_data_mut(&mut self) -> &mut RenderDataManager {
        &mut self.render_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrices_are_lazy() {
        let mut camera = Camera::new("main", Projection::default());
        assert!(camera.is_dirty());
        let first = camera.matrices();
        assert!(!camera.is_dirty());

        camera.transform_mut().position = Vec3::new(0.0, 0.0, 10.0);
        assert!(camera.is_dirty());
        let second = camera.matrices();
        assert_ne!(first.view, second.view);
    }

    #[test]
    fn test_projection_params_follow_mode() {
        let ortho = Projection::orthographic(4.0, 2.0, 0.1, 10.0);
        assert_eq!(ortho.fov_y(), None);
        assert_eq!(ortho.ortho_size(), Some((4.0, 2.0)));

        let persp = Projection::perspective(90.0, 1.0, 0.1, 10.0);
        assert!(persp.ortho_size().is_none());
        assert!((persp.fov_y().unwrap() - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn test_set_aspect_keeps_ortho_height() {
        let mut camera = Camera::new("ui", Projection::orthographic(2.0, 2.0, 0.0, 1.0));
        camera.set_aspect(800, 400);
        assert_eq!(camera.projection().ortho_size(), Some((4.0, 2.0)));
    }

    #[test]
    fn test_view_matrix_inverts_transform() {
        let camera = Camera::new("main", Projection::default()).with_transform(
            Transform::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y),
        );
        let view = camera.matrices().view;
        let origin = view.transform_point3(Vec3::ZERO);
        assert!((origin - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-5);
    }

    #[test]
    fn test_frustum_culls_spheres_behind() {
        let camera = Camera::new("main", Projection::perspective(60.0, 1.0, 0.1, 100.0))
            .with_transform(Transform::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y));
        let frustum = camera.frustum();
        assert!(frustum.intersects_sphere(Vec3::ZERO, 0.5));
        assert!(!frustum.intersects_sphere(Vec3::new(0.0, 0.0, 20.0), 0.5));
        assert!(!frustum.intersects_sphere(Vec3::new(50.0, 0.0, 0.0), 0.5));
    }

    #[test]
    fn test_pixel_viewport() {
        let mut camera = Camera::new("main", Projection::default());
        camera.viewport = ViewRect {
            x: 0.5,
            y: 0.0,
            width: 0.5,
            height: 1.0,
        };
        let vp = camera.pixel_viewport(800, 600);
        assert_eq!((vp.x, vp.y, vp.width, vp.height), (400.0, 0.0, 400.0, 600.0));
    }
}
