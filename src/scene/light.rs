//! Light sources
//!
//! Lights are owned by the scene; the pipeline reads them during a frame
//! and only writes the per-frame shadow binding.

use glam::{Mat4, Vec3};

use crate::backend::program::SHADOW_NEAR;

use super::light_probe::CUBE_FACES;
use super::ProbeId;

/// Light type, in the order lighting passes accumulate them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Sun,
    Directional,
    Ambient,
    Point,
    Spot,
    Environment,
}

impl LightKind {
    pub const ALL: &'static [LightKind] = &[
        LightKind::Sun,
        LightKind::Directional,
        LightKind::Ambient,
        LightKind::Point,
        LightKind::Spot,
        LightKind::Environment,
    ];

    /// Kinds that can render into a shadow map.
    pub fn supports_shadows(&self) -> bool {
        !matches!(self, LightKind::Ambient | LightKind::Environment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShadowMode {
    #[default]
    None,
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShadowQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Shadow map a light was assigned for the current frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShadowBinding {
    /// Slot in the 2D shadow-map pool
    Map { slot: usize, view_projection: Mat4 },
    /// Slot in the cube shadow-map pool
    Cube { slot: usize },
}

/// A light source
#[derive(Debug, Clone)]
pub struct Light {
    pub name: String,
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub position: Vec3,
    /// Direction light travels in; ignored by point/ambient lights
    pub direction: Vec3,
    pub range: f32,
    /// Constant, linear and quadratic attenuation terms
    pub attenuation: Vec3,
    /// Inner and outer cone half-angles in radians
    pub spot_angles: (f32, f32),
    pub shadow: ShadowMode,
    pub shadow_quality: ShadowQuality,
    /// Apply subsurface translucency against this light's shadow map
    pub subsurface: bool,
    /// Probe an environment light samples
    pub probe: Option<ProbeId>,
    pub(crate) shadow_binding: Option<ShadowBinding>,
}

impl Light {
    fn new(name: &str, kind: LightKind, color: Vec3) -> Self {
        Self {
            name: name.to_string(),
            kind,
            color,
            intensity: 1.0,
            position: Vec3::ZERO,
            direction: -Vec3::Y,
            range: 10.0,
            attenuation: Vec3::new(1.0, 0.0, 1.0),
            spot_angles: (0.3, 0.5),
            shadow: ShadowMode::None,
            shadow_quality: ShadowQuality::default(),
            subsurface: false,
            probe: None,
            shadow_binding: None,
        }
    }

    pub fn sun(direction: Vec3, color: Vec3) -> Self {
        Self {
            direction: direction.normalize(),
            ..Self::new("sun", LightKind::Sun, color)
        }
    }

    pub fn directional(direction: Vec3, color: Vec3) -> Self {
        Self {
            direction: direction.normalize(),
            ..Self::new("directional", LightKind::Directional, color)
        }
    }

    pub fn ambient(color: Vec3) -> Self {
        Self::new("ambient", LightKind::Ambient, color)
    }

    pub fn point(position: Vec3, color: Vec3, range: f32) -> Self {
        Self {
            position,
            range,
            ..Self::new("point", LightKind::Point, color)
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, color: Vec3, range: f32) -> Self {
        Self {
            position,
            direction: direction.normalize(),
            range,
            ..Self::new("spot", LightKind::Spot, color)
        }
    }

    pub fn environment(probe: ProbeId, color: Vec3) -> Self {
        Self {
            probe: Some(probe),
            ..Self::new("environment", LightKind::Environment, color)
        }
    }

    pub fn with_shadow(mut self, mode: ShadowMode) -> Self {
        self.shadow = mode;
        self
    }

    pub fn with_subsurface(mut self, subsurface: bool) -> Self {
        self.subsurface = subsurface;
        self
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn casts_shadow(&self) -> bool {
        self.shadow != ShadowMode::None && self.kind.supports_shadows()
    }

    /// Shadow map bound for the current frame, if any.
    pub fn shadow_binding(&self) -> Option<ShadowBinding> {
        self.shadow_binding
    }

    pub fn radiance(&self) -> Vec3 {
        self.color * self.intensity
    }

    /// Volume of influence for culling; `None` for lights that reach everywhere.
    pub fn bounding_sphere(&self) -> Option<(Vec3, f32)> {
        match self.kind {
            LightKind::Point | LightKind::Spot => Some((self.position, self.range)),
            _ => None,
        }
    }

    /// Cosines of the inner and outer spot cone half-angles.
    pub fn spot_cone(&self) -> (f32, f32) {
        (self.spot_angles.0.cos(), self.spot_angles.1.cos())
    }

    /// Light-space transform for a 2D shadow map.
    ///
    /// Directional lights fit an orthographic box of half-size `extent`
    /// around `focus`; spot lights use their cone.
    pub fn shadow_view_projection(&self, focus: Vec3, extent: f32) -> Mat4 {
        let up = if self.direction.y.abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        match self.kind {
            LightKind::Spot => {
                let view = Mat4::look_to_rh(self.position, self.direction, up);
                let fov = (self.spot_angles.1 * 2.0).clamp(0.01, std::f32::consts::PI - 0.01);
                Mat4::perspective_rh(fov, 1.0, SHADOW_NEAR, self.range.max(0.1)) * view
            }
            _ => {
                let eye = focus - self.direction * extent * 2.0;
                let view = Mat4::look_to_rh(eye, self.direction, up);
                Mat4::orthographic_rh(-extent, extent, -extent, extent, 0.0, extent * 4.0) * view
            }
        }
    }

    /// Light-space transform of one face of a point light's cube shadow map.
    pub fn cube_face_view_projection(&self, face: usize) -> Mat4 {
        let (look, up) = CUBE_FACES[face];
        let view = Mat4::look_to_rh(self.position, look, up);
        Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, SHADOW_NEAR, self.range.max(0.1)) * view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_support() {
        assert!(!Light::ambient(Vec3::ONE)
            .with_shadow(ShadowMode::Hard)
            .casts_shadow());
        assert!(Light::spot(Vec3::ZERO, -Vec3::Y, Vec3::ONE, 5.0)
            .with_shadow(ShadowMode::Soft)
            .casts_shadow());
        assert!(!Light::sun(-Vec3::Y, Vec3::ONE).casts_shadow());
    }

    #[test]
    fn test_bounds() {
        let point = Light::point(Vec3::X, Vec3::ONE, 3.0);
        assert_eq!(point.bounding_sphere(), Some((Vec3::X, 3.0)));
        assert_eq!(Light::sun(-Vec3::Y, Vec3::ONE).bounding_sphere(), None);
    }

    #[test]
    fn test_directional_shadow_contains_focus() {
        let light = Light::directional(Vec3::new(0.3, -1.0, 0.2), Vec3::ONE);
        let m = light.shadow_view_projection(Vec3::new(1.0, 0.0, 1.0), 10.0);
        let clip = m.project_point3(Vec3::new(1.0, 0.0, 1.0));
        assert!(clip.x.abs() < 1e-4 && clip.y.abs() < 1e-4);
        assert!(clip.z > 0.0 && clip.z < 1.0);
    }

    #[test]
    fn test_lighting_order() {
        assert_eq!(LightKind::ALL.first(), Some(&LightKind::Sun));
        assert_eq!(LightKind::ALL[4], LightKind::Spot);
    }
}
