//! Built-in shading programs
//!
//! A [`PassState`](super::PassState) names the program its draws run. Both
//! devices implement every program: the headless device with CPU kernels,
//! the wgpu device with generated WGSL. Programs read their textures from
//! material parameters by name and everything else from [`ProgramUniforms`].

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::material::{ElementType, VariantType};
use crate::scene::CUBE_FACES;

use super::traits::{DrawCall, Geometry};
use super::types::Viewport;

/// Offset added before taking the log of a luminance
pub const LOG_EPSILON: f32 = 1e-4;
/// World-space distance an occluder must lie in front of a surface to shadow it
pub const SHADOW_BIAS: f32 = 0.05;
/// View-space slack before an occlusion sample counts as hidden
pub const OCCLUSION_BIAS: f32 = 0.02;
/// Attenuation per unit of light-space depth through a translucent body
pub const TRANSLUCENCY_FALLOFF: f32 = 100.0;
/// How fast bilateral blur weights fall off with linear depth difference
pub const BILATERAL_SHARPNESS: f32 = 200.0;
/// Middle grey the adapted luminance is exposed to
pub const KEY_VALUE: f32 = 0.18;
/// Near plane of spot and point light shadow projections
pub const SHADOW_NEAR: f32 = 0.05;
/// Blur taps held by the uniform block, center included
pub const MAX_BLUR_TAPS: usize = 8;
/// Occlusion kernel samples held by the uniform block
pub const MAX_KERNEL_SAMPLES: usize = 32;

/// How a light program computes irradiance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightModel {
    Directional,
    Ambient,
    Point,
    Spot,
    Environment,
}

/// What a draw computes per fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Program {
    /// `tint × input0`, where input0 is the first texture parameter
    #[default]
    Tint,
    /// Albedo and encoded world normal into two targets
    GBuffer,
    /// View depth over the far plane from hardware depth
    LinearDepth,
    /// Irradiance of one light, optionally shadowed
    Light { model: LightModel, shadowed: bool },
    /// `ln(ε + L)` of the source luminance
    LogLuminance,
    /// 2×2 box average of a source twice the target's size
    Downsample,
    /// Adapted luminance from a log-average, alpha-blended over time
    Adapt,
    /// Scales colors by how far their luminance exceeds a threshold
    BrightPass,
    /// Separable Gaussian blur
    Blur,
    /// Separable blur weighted by linear depth similarity
    BilateralBlur { depth_scaled: bool },
    /// Exposure, bloom and a tone curve
    ToneMap,
    /// Hemisphere occlusion from linear depth and normals
    Occlusion,
    /// Light transmitted through bodies seen from a shadow map
    Translucency,
}

/// How a program reads one texture input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Color,
    Depth,
    /// Six consecutive layers starting at the bound view's layer
    ColorLayers,
    DepthLayers,
}

/// Texture input of a program, matched to a material parameter by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub name: &'static str,
    pub kind: InputKind,
}

const fn slot(name: &'static str, kind: InputKind) -> InputSlot {
    InputSlot { name, kind }
}

use InputKind::*;

const SOURCE: &[InputSlot] = &[slot("source", Color)];

impl Program {
    /// Named texture inputs in binding order. [`Program::Tint`] has none
    /// here; it binds whatever texture parameter comes first.
    pub fn inputs(&self) -> &'static [InputSlot] {
        match self {
            Program::Tint | Program::GBuffer => &[],
            Program::LinearDepth => const { &[slot("depth", Depth)] },
            Program::Light { model, shadowed } => match (model, shadowed) {
                (LightModel::Environment, _) => const { &[
                    slot("normal", Color),
                    slot("depth", Depth),
                    slot("probe_color", ColorLayers),
                ] },
                (LightModel::Point, true) => const { &[
                    slot("normal", Color),
                    slot("depth", Depth),
                    slot("shadow_map", DepthLayers),
                ] },
                (LightModel::Ambient, _) | (_, false) => {
                    const { &[slot("normal", Color), slot("depth", Depth)] }
                }
                (_, true) => const { &[
                    slot("normal", Color),
                    slot("depth", Depth),
                    slot("shadow_map", Depth),
                ] },
            },
            Program::LogLuminance | Program::Downsample | Program::BrightPass | Program::Blur => SOURCE,
            Program::Adapt => const { &[slot("measured", Color)] },
            Program::BilateralBlur { .. } => const { &[slot("source", Color), slot("linear_depth", Color)] },
            Program::ToneMap => const { &[
                slot("scene", Color),
                slot("bloom", Color),
                slot("adapted", Color),
            ] },
            Program::Occlusion => const { &[slot("linear_depth", Color), slot("normal", Color)] },
            Program::Translucency => const { &[
                slot("albedo", Color),
                slot("linear_depth", Color),
                slot("shadow_map", Depth),
            ] },
        }
    }
}

/// Uniform block shared by every program. Matches `Uniforms` in the WGSL prelude.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ProgramUniforms {
    /// Clip-space transform of mesh draws
    pub transform: Mat4,
    pub world: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
    pub inverse_projection: Mat4,
    pub inverse_view_projection: Mat4,
    pub shadow_matrix: Mat4,
    pub inverse_shadow_matrix: Mat4,
    pub view_to_light: Mat4,
    pub tint: Vec4,
    /// Framebuffer size in pixels in `xy`
    pub target_size: Vec4,
    /// Viewport origin in `xy`, size in `zw`, in pixels
    pub viewport: Vec4,
    pub light_direction: Vec4,
    /// Light position, range in `w`
    pub light_position: Vec4,
    /// Spot cone cosines in `xy`, camera near and far in `zw`
    pub cone_near_far: Vec4,
    /// Blur step in `xy`, step scale in `z`, tap count in `w`
    pub blur: Vec4,
    /// Program scalars: tone map (exposure, bloom strength, operator),
    /// bright pass (threshold), occlusion (radius, intensity, samples)
    pub values: Vec4,
    pub weights: [Vec4; MAX_BLUR_TAPS / 4],
    pub kernel: [Vec4; MAX_KERNEL_SAMPLES],
}

const MAT4: VariantType = VariantType::Scalar(ElementType::Float4x4);
const FLOAT: VariantType = VariantType::Scalar(ElementType::Float);
const FLOAT2: VariantType = VariantType::Scalar(ElementType::Float2);
const FLOAT3: VariantType = VariantType::Scalar(ElementType::Float3);
const INT: VariantType = VariantType::Scalar(ElementType::Int);

impl ProgramUniforms {
    /// Collect the uniforms of `call` drawn into a `target_size` framebuffer.
    pub fn gather(call: &DrawCall<'_>, target_size: Vec2, viewport: Viewport) -> Self {
        let mut u = Self {
            transform: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            inverse_projection: Mat4::IDENTITY,
            inverse_view_projection: Mat4::IDENTITY,
            shadow_matrix: Mat4::IDENTITY,
            inverse_shadow_matrix: Mat4::IDENTITY,
            view_to_light: Mat4::IDENTITY,
            tint: Vec4::from(call.tint()),
            target_size: target_size.extend(0.0).extend(0.0),
            viewport: Vec4::new(viewport.x, viewport.y, viewport.width, viewport.height),
            light_direction: Vec4::new(0.0, -1.0, 0.0, 0.0),
            light_position: Vec4::ZERO,
            cone_near_far: Vec4::new(1.0, 0.0, 0.1, 100.0),
            blur: Vec4::new(0.0, 0.0, 1.0, 0.0),
            values: Vec4::ZERO,
            weights: [Vec4::ZERO; MAX_BLUR_TAPS / 4],
            kernel: [Vec4::ZERO; MAX_KERNEL_SAMPLES],
        };
        if let Geometry::Mesh { transform, .. } = call.geometry {
            u.transform = transform;
        }

        let mut sample_count = 0.0;
        let mut kernel_len = 0;
        for (name, value) in &call.parameters {
            match (*name, value.variant_type()) {
                ("world", MAT4) => u.world = *value.get_float4x4(),
                ("view", MAT4) => u.view = *value.get_float4x4(),
                ("projection", MAT4) => u.projection = *value.get_float4x4(),
                ("inverse_projection", MAT4) => u.inverse_projection = *value.get_float4x4(),
                ("inverse_view_projection", MAT4) => {
                    u.inverse_view_projection = *value.get_float4x4()
                }
                ("shadow_matrix", MAT4) => u.shadow_matrix = *value.get_float4x4(),
                ("view_to_light", MAT4) => u.view_to_light = *value.get_float4x4(),
                ("direction" | "light_direction", FLOAT3) => {
                    u.light_direction = value.get_float3().extend(0.0)
                }
                ("direction", FLOAT2) => {
                    let step = value.get_float2();
                    u.blur.x = step.x;
                    u.blur.y = step.y;
                }
                ("position" | "light_position", FLOAT3) => {
                    let range = u.light_position.w;
                    u.light_position = value.get_float3().extend(range);
                }
                ("range", FLOAT) => u.light_position.w = value.get_float(),
                ("cone", FLOAT2) => {
                    let cone = value.get_float2();
                    u.cone_near_far.x = cone.x;
                    u.cone_near_far.y = cone.y;
                }
                ("near_far", FLOAT2) => {
                    let near_far = value.get_float2();
                    u.cone_near_far.z = near_far.x;
                    u.cone_near_far.w = near_far.y;
                }
                ("width", FLOAT) => u.blur.z = value.get_float(),
                ("weights", VariantType::Array(ElementType::Float, _)) => {
                    let weights = value.get_float_array();
                    let taps = weights.len().min(MAX_BLUR_TAPS);
                    for (i, w) in weights.iter().take(taps).enumerate() {
                        u.weights[i / 4][i % 4] = *w;
                    }
                    u.blur.w = taps as f32;
                }
                ("kernel", VariantType::Array(ElementType::Float4, _)) => {
                    let kernel = value.get_float4_array();
                    kernel_len = kernel.len().min(MAX_KERNEL_SAMPLES);
                    u.kernel[..kernel_len].copy_from_slice(&kernel[..kernel_len]);
                }
                ("exposure" | "threshold" | "radius", FLOAT) => u.values.x = value.get_float(),
                ("bloom_strength" | "intensity", FLOAT) => u.values.y = value.get_float(),
                ("operator", INT) => u.values.z = value.get_int() as f32,
                ("sample_count", INT) => sample_count = value.get_int().max(0) as f32,
                _ => {}
            }
        }
        if kernel_len > 0 {
            u.values.z = sample_count.min(kernel_len as f32);
        }
        if u.shadow_matrix.determinant().abs() > f32::EPSILON {
            u.inverse_shadow_matrix = u.shadow_matrix.inverse();
        }
        u
    }

    /// Blur weight `i` taps away from the center.
    pub fn weight(&self, i: usize) -> f32 {
        self.weights[i / 4][i % 4]
    }
}

/// Face of a cube a direction points into, the face-local texture
/// coordinate and the distance along the face axis.
///
/// Faces follow [`CUBE_FACES`], sampled the way a 90° camera looking along
/// the face renders it.
pub fn cube_lookup(direction: Vec3) -> (u32, Vec2, f32) {
    let mut face = 0;
    let mut best = f32::NEG_INFINITY;
    for (i, (look, _)) in CUBE_FACES.iter().enumerate() {
        let d = look.dot(direction);
        if d > best {
            best = d;
            face = i;
        }
    }
    let (look, up) = CUBE_FACES[face];
    let side = look.cross(up).normalize();
    let up = side.cross(look);
    let axis = best.max(1e-6);
    let ndc = Vec2::new(side.dot(direction), up.dot(direction)) / axis;
    (face as u32, Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5), axis)
}

/// Depth a right-handed zero-to-one perspective projection stores for a
/// point `distance` in front of the eye.
pub fn perspective_depth(distance: f32, near: f32, far: f32) -> f32 {
    far * (distance - near) / ((far - near) * distance)
}

/// Inverse of [`perspective_depth`].
pub fn perspective_distance(depth: f32, near: f32, far: f32) -> f32 {
    near * far / (far - depth * (far - near)).max(f32::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PassState;
    use crate::material::{MaterialVariant, PassId};

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<ProgramUniforms>(), 1248);
    }

    #[test]
    fn test_gather_maps_parameters_by_name() {
        let state = PassState::fullscreen(None).with_program(Program::Blur);
        let step = MaterialVariant::from_value(Vec2::new(0.25, 0.0));
        let weights = MaterialVariant::from_value([0.4f32, 0.2, 0.1].as_slice());
        let range = MaterialVariant::from_value(7.0f32);
        let position = MaterialVariant::from_value(Vec3::new(1.0, 2.0, 3.0));
        let call = DrawCall {
            label: "blur",
            pass: PassId(0),
            state: &state,
            parameters: vec![
                ("direction", &step),
                ("weights", &weights),
                ("range", &range),
                ("position", &position),
            ],
            geometry: Geometry::Fullscreen,
        };
        let u = ProgramUniforms::gather(&call, Vec2::new(8.0, 4.0), Viewport::full(8, 4));
        assert_eq!(u.blur, Vec4::new(0.25, 0.0, 1.0, 3.0));
        assert_eq!(u.weight(2), 0.1);
        assert_eq!(u.light_position, Vec4::new(1.0, 2.0, 3.0, 7.0));
        assert_eq!(u.target_size.truncate().truncate(), Vec2::new(8.0, 4.0));
    }

    #[test]
    fn test_sample_count_bounded_by_kernel() {
        let state = PassState::fullscreen(None).with_program(Program::Occlusion);
        let kernel = MaterialVariant::from_value([Vec4::Z; 4].as_slice());
        let count = MaterialVariant::from_value(16i32);
        let call = DrawCall {
            label: "occlusion",
            pass: PassId(0),
            state: &state,
            parameters: vec![("sample_count", &count), ("kernel", &kernel)],
            geometry: Geometry::Fullscreen,
        };
        let u = ProgramUniforms::gather(&call, Vec2::ONE, Viewport::full(1, 1));
        assert_eq!(u.values.z, 4.0);
    }

    #[test]
    fn test_cube_lookup_matches_face_projection() {
        let near = SHADOW_NEAR;
        let far = 10.0;
        let point = Vec3::new(0.3, -0.8, 2.0);
        let (face, uv, distance) = cube_lookup(point);
        assert_eq!(face, 4);

        let (look, up) = CUBE_FACES[face as usize];
        let clip = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, near, far)
            * Mat4::look_to_rh(Vec3::ZERO, look, up);
        let ndc = clip.project_point3(point);
        assert!((uv.x - (ndc.x * 0.5 + 0.5)).abs() < 1e-5);
        assert!((uv.y - (0.5 - ndc.y * 0.5)).abs() < 1e-5);
        assert!((perspective_depth(distance, near, far) - ndc.z).abs() < 1e-5);
        assert!((perspective_distance(ndc.z, near, far) - distance).abs() < 1e-3);
    }

    #[test]
    fn test_light_inputs_follow_shadow_kind() {
        let point = Program::Light {
            model: LightModel::Point,
            shadowed: true,
        };
        assert_eq!(point.inputs()[2].kind, InputKind::DepthLayers);
        let spot = Program::Light {
            model: LightModel::Spot,
            shadowed: true,
        };
        assert_eq!(spot.inputs()[2].kind, InputKind::Depth);
        let ambient = Program::Light {
            model: LightModel::Ambient,
            shadowed: true,
        };
        assert_eq!(ambient.inputs().len(), 2);
    }
}
