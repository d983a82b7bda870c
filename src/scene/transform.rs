//! Rigid transform with scale

use glam::{Mat3, Mat4, Quat, Vec3};

/// Position, rotation and scale of a scene node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Transform at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let mut transform = Self::from_position(position);
        transform.look_at(target, up);
        transform
    }

    /// Model matrix
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Local -Z in world space
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Local +X in world space
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Local +Y in world space
    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// Rotate so that local -Z points at `target`.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);
        self.rotation = Quat::from_mat3(&Mat3::from_cols(right, up, -forward));
    }

    /// Rotate so that local -Z points along `direction`.
    pub fn look_to(&mut self, direction: Vec3, up: Vec3) {
        let target = self.position + direction;
        self.look_at(target, up);
    }

    /// Largest axis scale, for scaling bounding spheres.
    pub fn max_scale(&self) -> f32 {
        self.scale.abs().max_element()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_at_points_forward() {
        let transform = Transform::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!((transform.forward() - -Vec3::Z).length() < 1e-5);
        assert!((transform.up() - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_look_to_matches_view_matrix() {
        let mut transform = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        transform.look_to(Vec3::X, Vec3::Y);
        let view = transform.matrix().inverse();
        let expected = Mat4::look_to_rh(transform.position, Vec3::X, Vec3::Y);
        assert!(view.abs_diff_eq(expected, 1e-5));
    }
}
