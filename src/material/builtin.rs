//! Materials the pipeline itself renders with
//!
//! Custom WGSL may replace any of these by registering a definition with the
//! same name and compatible parameters.

use glam::{Mat4, Vec2, Vec4};

use crate::backend::{BlendState, CompareFunction, LightModel, PassState, Program};
use crate::scene::RenderQueue;

use super::library::{MaterialDefinition, PassDefinition};
use super::semantic::Semantic;

pub const STANDARD: &str = "standard";
pub const STANDARD_UNLIT: &str = "standard_unlit";
pub const STANDARD_TRANSPARENT: &str = "standard_transparent";

pub const LIGHT_SUN: &str = "light/sun";
pub const LIGHT_DIRECTIONAL: &str = "light/directional";
pub const LIGHT_AMBIENT: &str = "light/ambient";
pub const LIGHT_POINT: &str = "light/point";
pub const LIGHT_SPOT: &str = "light/spot";
pub const LIGHT_ENVIRONMENT: &str = "light/environment";

pub const LINEAR_DEPTH: &str = "deferred/linear_depth";
pub const BLIT: &str = "postprocess/blit";
pub const TINT: &str = "postprocess/tint";

pub const HDR_LUMINANCE: &str = "hdr/luminance";
pub const HDR_DOWNSAMPLE: &str = "hdr/downsample";
pub const HDR_ADAPT: &str = "hdr/adapt";
pub const HDR_BRIGHT_PASS: &str = "hdr/bright_pass";
pub const HDR_BLUR: &str = "hdr/blur";
pub const HDR_BLOOM_COMBINE: &str = "hdr/bloom_combine";
pub const HDR_TONEMAP: &str = "hdr/tonemap";

pub const SSDO_OCCLUSION: &str = "ssdo/occlusion";
pub const SSDO_BLUR: &str = "ssdo/blur";
pub const SSDO_COMPOSITE: &str = "ssdo/composite";

pub const SUBSURFACE_TRANSLUCENCY: &str = "subsurface/translucency";
pub const SUBSURFACE_BLUR: &str = "subsurface/blur";

pub const PASS_GBUFFER: &str = "gbuffer";
pub const PASS_SHADING: &str = "shading";
pub const PASS_SPECIFIC_SHADING: &str = "specific_shading";
pub const PASS_SHADOW: &str = "shadow";
pub const PASS_TRANSPARENT: &str = "transparent";
pub const PASS_TRANSPARENT_LIGHT: &str = "transparent_light";
pub const PASS_LIGHTING: &str = "lighting";
pub const PASS_LIGHTING_SHADOW: &str = "lighting_shadow";
pub const PASS_DEPTH_LINEAR: &str = "depth_linear";

/// Occlusion samples per pixel in the SSDO kernel.
pub const SSDO_SAMPLE_COUNT: i32 = 16;
/// Taps on each side of the SSDO blur center.
pub const SSDO_BLUR_RADIUS: i32 = 4;
/// Taps on each side of the bloom blur center.
pub const BLOOM_BLUR_RADIUS: usize = 4;
/// Taps on each side of the subsurface blur center.
pub const SUBSURFACE_BLUR_RADIUS: usize = 3;

fn fullscreen(
    name: &str,
    queue: RenderQueue,
    blend: Option<BlendState>,
    program: Program,
) -> MaterialDefinition {
    MaterialDefinition::new(name).with_technique(
        queue,
        vec![PassDefinition::new(
            name,
            PassState::fullscreen(blend).with_program(program),
        )],
    )
}

fn light(name: &str, model: LightModel) -> MaterialDefinition {
    let additive = PassState::fullscreen(Some(BlendState::additive()));
    let lit = additive.clone().with_program(Program::Light {
        model,
        shadowed: false,
    });
    let shadowed_state = additive.with_program(Program::Light {
        model,
        shadowed: true,
    });
    let common = [
        "light_color",
        "albedo",
        "normal",
        "depth",
        "direction",
        "position",
        "range",
        "cone",
        "inverse_view_projection",
    ];
    let mut shadowed: Vec<&str> = common.to_vec();
    shadowed.extend(["shadow_map", "shadow_matrix"]);

    MaterialDefinition::new(name)
        .with_technique(
            RenderQueue::Lighting,
            vec![
                PassDefinition::new(PASS_LIGHTING, lit).using(&common),
                PassDefinition::new(PASS_LIGHTING_SHADOW, shadowed_state).using(&shadowed),
            ],
        )
        .with_semantic("light_color", Semantic::LightColor)
        .with_semantic("albedo", Semantic::GBufferAlbedo)
        .with_semantic("normal", Semantic::GBufferNormal)
        .with_semantic("depth", Semantic::GBufferDepth)
        .with_semantic("direction", Semantic::LightDirection)
        .with_semantic("position", Semantic::LightPosition)
        .with_semantic("range", Semantic::LightRange)
        .with_semantic("cone", Semantic::LightSpotCone)
        .with_semantic("inverse_view_projection", Semantic::InverseViewProjection)
        .with_semantic("shadow_map", Semantic::ShadowMap)
        .with_semantic("shadow_matrix", Semantic::ShadowMatrix)
}

/// Every built-in definition.
pub fn definitions() -> Vec<MaterialDefinition> {
    let geometry = PassState::geometry();
    let gbuffer = geometry.clone().with_program(Program::GBuffer);
    let shade = PassState::default().with_depth(CompareFunction::LessEqual, false);

    vec![
        MaterialDefinition::new(STANDARD)
            .with_technique(
                RenderQueue::Opaque,
                vec![
                    PassDefinition::new(PASS_GBUFFER, gbuffer.clone()).using(&["color", "world"]),
                    PassDefinition::new(PASS_SHADING, shade.clone()).using(&["color", "lighting"]),
                ],
            )
            .with_technique(
                RenderQueue::Shadow,
                vec![PassDefinition::new(PASS_SHADOW, geometry.clone()).using(&[])],
            )
            .with_parameter("color", Vec4::ONE)
            .with_semantic("world", Semantic::World)
            .with_semantic("lighting", Semantic::LightingBuffer),
        MaterialDefinition::new(STANDARD_UNLIT)
            .with_technique(
                RenderQueue::Opaque,
                vec![
                    PassDefinition::new(PASS_GBUFFER, gbuffer),
                    PassDefinition::new(PASS_SPECIFIC_SHADING, shade),
                ],
            )
            .with_technique(
                RenderQueue::Shadow,
                vec![PassDefinition::new(PASS_SHADOW, geometry).using(&[])],
            )
            .with_parameter("color", Vec4::ONE)
            .with_semantic("world", Semantic::World),
        MaterialDefinition::new(STANDARD_TRANSPARENT)
            .with_technique(
                RenderQueue::Transparent,
                vec![
                    PassDefinition::new(
                        PASS_TRANSPARENT,
                        PassState::default()
                            .with_depth(CompareFunction::LessEqual, false)
                            .with_blend(BlendState::alpha_blending()),
                    )
                    .using(&["color"]),
                    PassDefinition::new(
                        PASS_TRANSPARENT_LIGHT,
                        PassState::default()
                            .with_depth(CompareFunction::LessEqual, false)
                            .with_blend(BlendState::additive()),
                    ),
                ],
            )
            .with_parameter("color", Vec4::new(1.0, 1.0, 1.0, 0.5))
            .with_semantic("light_color", Semantic::LightColor)
            .with_semantic("light_direction", Semantic::LightDirection)
            .with_semantic("light_position", Semantic::LightPosition),
        light(LIGHT_SUN, LightModel::Directional),
        light(LIGHT_DIRECTIONAL, LightModel::Directional),
        light(LIGHT_AMBIENT, LightModel::Ambient),
        light(LIGHT_POINT, LightModel::Point),
        light(LIGHT_SPOT, LightModel::Spot),
        MaterialDefinition::new(LIGHT_ENVIRONMENT)
            .with_technique(
                RenderQueue::Lighting,
                vec![PassDefinition::new(
                    PASS_LIGHTING,
                    PassState::fullscreen(Some(BlendState::additive())).with_program(
                        Program::Light {
                            model: LightModel::Environment,
                            shadowed: false,
                        },
                    ),
                )],
            )
            .with_semantic("light_color", Semantic::LightColor)
            .with_semantic("albedo", Semantic::GBufferAlbedo)
            .with_semantic("depth", Semantic::GBufferDepth)
            .with_semantic("inverse_view_projection", Semantic::InverseViewProjection)
            .with_semantic("probe_color", Semantic::ProbeColor)
            .with_semantic("probe_normal", Semantic::ProbeNormal)
            .with_semantic("normal", Semantic::GBufferNormal),
        MaterialDefinition::new(LINEAR_DEPTH)
            .with_technique(
                RenderQueue::Opaque,
                vec![PassDefinition::new(
                    PASS_DEPTH_LINEAR,
                    PassState::default().with_program(Program::LinearDepth),
                )],
            )
            .with_semantic("depth", Semantic::GBufferDepth)
            .with_semantic("inverse_projection", Semantic::InverseProjection)
            .with_semantic("near_far", Semantic::CameraNearFar),
        fullscreen(BLIT, RenderQueue::PostProcess, None, Program::Tint).with_texture("source"),
        fullscreen(
            TINT,
            RenderQueue::PostProcess,
            Some(BlendState::multiply()),
            Program::Tint,
        )
        .with_parameter("color", Vec4::ONE),
        fullscreen(HDR_LUMINANCE, RenderQueue::PostProcess, None, Program::LogLuminance)
            .with_texture("source"),
        fullscreen(HDR_DOWNSAMPLE, RenderQueue::PostProcess, None, Program::Downsample)
            .with_texture("source"),
        fullscreen(
            HDR_ADAPT,
            RenderQueue::PostProcess,
            Some(BlendState::alpha_blending()),
            Program::Adapt,
        )
        .with_parameter("color", Vec4::ONE)
        .with_texture("measured"),
        fullscreen(HDR_BRIGHT_PASS, RenderQueue::PostProcess, None, Program::BrightPass)
            .with_texture("source")
            .with_parameter("threshold", 1.0f32),
        fullscreen(HDR_BLUR, RenderQueue::PostProcess, None, Program::Blur)
            .with_texture("source")
            .with_parameter("direction", Vec2::X)
            .with_parameter("weights", [0.0f32; BLOOM_BLUR_RADIUS + 1].as_slice()),
        fullscreen(
            HDR_BLOOM_COMBINE,
            RenderQueue::PostProcess,
            Some(BlendState::additive()),
            Program::Tint,
        )
        .with_parameter("color", Vec4::ONE)
        .with_texture("source"),
        fullscreen(HDR_TONEMAP, RenderQueue::PostProcess, None, Program::ToneMap)
            .with_texture("scene")
            .with_texture("bloom")
            .with_texture("adapted")
            .with_parameter("exposure", 1.0f32)
            .with_parameter("bloom_strength", 0.0f32)
            .with_parameter("operator", 0i32),
        fullscreen(SSDO_OCCLUSION, RenderQueue::PostProcess, None, Program::Occlusion)
            .with_semantic("linear_depth", Semantic::LinearDepth)
            .with_semantic("normal", Semantic::GBufferNormal)
            .with_semantic("view", Semantic::View)
            .with_semantic("projection", Semantic::Projection)
            .with_semantic("inverse_projection", Semantic::InverseProjection)
            .with_semantic("near_far", Semantic::CameraNearFar)
            .with_parameter("sample_count", SSDO_SAMPLE_COUNT)
            .with_parameter("blur_radius", SSDO_BLUR_RADIUS)
            .with_parameter("kernel", [Vec4::ZERO; SSDO_SAMPLE_COUNT as usize].as_slice())
            .with_parameter("radius", 0.5f32)
            .with_parameter("intensity", 1.0f32),
        fullscreen(
            SSDO_BLUR,
            RenderQueue::PostProcess,
            None,
            Program::BilateralBlur {
                depth_scaled: false,
            },
        )
        .with_texture("source")
        .with_semantic("linear_depth", Semantic::LinearDepth)
        .with_semantic("near_far", Semantic::CameraNearFar)
        .with_parameter("direction", Vec2::X)
        .with_parameter("width", 1.0f32)
        .with_parameter(
            "weights",
            [0.0f32; SSDO_BLUR_RADIUS as usize + 1].as_slice(),
        ),
        fullscreen(
            SSDO_COMPOSITE,
            RenderQueue::PostProcess,
            Some(BlendState::multiply()),
            Program::Tint,
        )
        .with_texture("occlusion"),
        fullscreen(
            SUBSURFACE_TRANSLUCENCY,
            RenderQueue::PostProcess,
            Some(BlendState::additive()),
            Program::Translucency,
        )
        .with_parameter("color", Vec4::ONE)
        .with_semantic("light_color", Semantic::LightColor)
        .with_semantic("albedo", Semantic::GBufferAlbedo)
        .with_semantic("linear_depth", Semantic::LinearDepth)
        .with_semantic("inverse_projection", Semantic::InverseProjection)
        .with_semantic("near_far", Semantic::CameraNearFar)
        .with_semantic("shadow_map", Semantic::ShadowMap)
        .with_semantic("shadow_matrix", Semantic::ShadowMatrix)
        .with_parameter("view_to_light", Mat4::IDENTITY),
        fullscreen(
            SUBSURFACE_BLUR,
            RenderQueue::PostProcess,
            None,
            Program::BilateralBlur { depth_scaled: true },
        )
        .with_texture("source")
        .with_semantic("linear_depth", Semantic::LinearDepth)
        .with_semantic("near_far", Semantic::CameraNearFar)
        .with_parameter("direction", Vec2::X)
        .with_parameter("width", 1.0f32)
        .with_parameter("weights", [0.0f32; SUBSURFACE_BLUR_RADIUS + 1].as_slice()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::MaterialLibrary;

    #[test]
    fn test_builtin_names_are_unique() {
        let defs = definitions();
        let mut names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), defs.len());
    }

    #[test]
    fn test_lights_have_shadow_variant() {
        let mut library = MaterialLibrary::with_builtin();
        for name in [LIGHT_SUN, LIGHT_DIRECTIONAL, LIGHT_AMBIENT, LIGHT_POINT, LIGHT_SPOT] {
            let material = library.create_material(name).unwrap();
            assert!(library
                .find_pass(material, RenderQueue::Lighting, PASS_LIGHTING_SHADOW)
                .is_some());
        }
    }

    #[test]
    fn test_ssdo_constants_live_in_material() {
        let mut library = MaterialLibrary::with_builtin();
        let material = library.create_material(SSDO_OCCLUSION).unwrap();
        let samples = library.get_parameter(material, "sample_count").unwrap();
        assert_eq!(library.parameter(samples).get_int(), SSDO_SAMPLE_COUNT);
    }
}
