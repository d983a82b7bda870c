//! WGSL for material passes
//!
//! Every pass module starts with a shared prelude: the [`ProgramUniforms`]
//! block as `draw`, both vertex entry points and helpers mirroring the CPU
//! kernels. Texture inputs follow at bindings 1.., one per slot of the
//! pass's [`Program`]. Built-in passes append the program's `shade` and an
//! `fs_main` writing it to every color target. A pass with custom WGSL
//! appends that instead and must define `fs_main` itself; it sees the
//! first texture parameter as `input0` and through `input_texel`.
//!
//! [`ProgramUniforms`]: crate::backend::program::ProgramUniforms

use std::fmt::Write;

use crate::backend::program::*;
use crate::scene::CUBE_FACES;

/// WGSL type and sampling family of one texture binding
pub(super) fn binding_kinds(program: Program, depth_input: bool) -> Vec<InputKind> {
    let slots = program.inputs();
    if slots.is_empty() {
        return vec![if depth_input { InputKind::Depth } else { InputKind::Color }];
    }
    slots.iter().map(|slot| slot.kind).collect()
}

const UNIFORMS: &str = r#"
struct Uniforms {
    transform: mat4x4<f32>,
    world: mat4x4<f32>,
    view: mat4x4<f32>,
    projection: mat4x4<f32>,
    inverse_projection: mat4x4<f32>,
    inverse_view_projection: mat4x4<f32>,
    shadow_matrix: mat4x4<f32>,
    inverse_shadow_matrix: mat4x4<f32>,
    view_to_light: mat4x4<f32>,
    tint: vec4<f32>,
    target_size: vec4<f32>,
    viewport: vec4<f32>,
    light_direction: vec4<f32>,
    light_position: vec4<f32>,
    cone_near_far: vec4<f32>,
    blur: vec4<f32>,
    values: vec4<f32>,
    weights: array<vec4<f32>, 2>,
    kernel: array<vec4<f32>, 32>,
}

@group(0) @binding(0) var<uniform> draw: Uniforms;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) normal: vec3<f32>,
}

@vertex
fn vs_mesh(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> VertexOutput {
    var output: VertexOutput;
    output.position = draw.transform * vec4<f32>(position, 1.0);
    output.normal = (draw.world * vec4<f32>(normal, 0.0)).xyz;
    return output;
}

@vertex
fn vs_fullscreen(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    var output: VertexOutput;

    // Triangle covering the viewport
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    output.position = vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
    output.normal = vec3<f32>(0.0, 0.0, 1.0);

    return output;
}

fn texel_coord(uv: vec2<f32>, dims: vec2<u32>) -> vec2<i32> {
    let c = vec2<u32>(clamp(uv, vec2<f32>(0.0), vec2<f32>(1.0)) * vec2<f32>(dims));
    return vec2<i32>(min(c, dims - vec2<u32>(1u, 1u)));
}

fn frag_uv(frag: vec2<f32>) -> vec2<f32> {
    return frag / max(draw.target_size.xy, vec2<f32>(1.0));
}

fn luminance(c: vec4<f32>) -> f32 {
    return 0.2126 * c.x + 0.7152 * c.y + 0.0722 * c.z;
}

fn normalize_or_zero(v: vec3<f32>) -> vec3<f32> {
    let l = length(v);
    if l <= 0.0 {
        return vec3<f32>(0.0);
    }
    return v / l;
}

fn decode_normal(encoded: vec4<f32>) -> vec3<f32> {
    return normalize_or_zero(encoded.xyz * 2.0 - 1.0);
}

fn project_point(m: mat4x4<f32>, p: vec3<f32>) -> vec3<f32> {
    let c = m * vec4<f32>(p, 1.0);
    return c.xyz / c.w;
}

fn in_unit_square(uv: vec2<f32>) -> bool {
    return all(uv >= vec2<f32>(0.0)) && all(uv <= vec2<f32>(1.0));
}

fn clip_to_uv(ndc: vec2<f32>) -> vec2<f32> {
    return vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
}

fn fragment_ndc(frag: vec2<f32>) -> vec2<f32> {
    let rel = (frag - draw.viewport.xy) / max(draw.viewport.zw, vec2<f32>(1.0));
    return vec2<f32>(rel.x * 2.0 - 1.0, 1.0 - rel.y * 2.0);
}

fn ndc_to_uv(ndc: vec2<f32>) -> vec2<f32> {
    let rel = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    return (draw.viewport.xy + rel * draw.viewport.zw) / max(draw.target_size.xy, vec2<f32>(1.0));
}

fn view_position(ndc: vec2<f32>, linear_z: f32) -> vec3<f32> {
    let near = project_point(draw.inverse_projection, vec3<f32>(ndc, 0.0));
    let far = project_point(draw.inverse_projection, vec3<f32>(ndc, 1.0));
    let dist = linear_z * draw.cone_near_far.w;
    let span = near.z - far.z;
    var t = 0.0;
    if abs(span) > EPSILON {
        t = (dist + near.z) / span;
    }
    return mix(near, far, t);
}

fn weight(i: i32) -> f32 {
    return draw.weights[i / 4][i % 4];
}

struct CubeLookup {
    face: u32,
    uv: vec2<f32>,
    axis: f32,
}

fn cube_lookup(direction: vec3<f32>) -> CubeLookup {
    var looks = CUBE_LOOK;
    var ups = CUBE_UP;
    var face = 0u;
    var best = -3.4e38;
    for (var i = 0u; i < 6u; i++) {
        let d = dot(looks[i], direction);
        if d > best {
            best = d;
            face = i;
        }
    }
    let look = looks[face];
    let side = normalize(cross(look, ups[face]));
    let up = cross(side, look);
    let axis = max(best, 1e-6);
    let ndc = vec2<f32>(dot(side, direction), dot(up, direction)) / axis;
    return CubeLookup(face, vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5), axis);
}

fn perspective_distance(depth: f32, near: f32, far: f32) -> f32 {
    return near * far / max(far - depth * (far - near), EPSILON);
}

struct Shaded {
    first: vec4<f32>,
    rest: vec4<f32>,
    keep: bool,
}

fn both(color: vec4<f32>) -> Shaded {
    return Shaded(color, color, true);
}

fn discarded() -> Shaded {
    return Shaded(vec4<f32>(0.0), vec4<f32>(0.0), false);
}
"#;

fn vec3(v: glam::Vec3) -> String {
    format!("vec3<f32>({:?}, {:?}, {:?})", v.x, v.y, v.z)
}

fn constants() -> String {
    let looks: Vec<String> = CUBE_FACES.iter().map(|(look, _)| vec3(*look)).collect();
    let ups: Vec<String> = CUBE_FACES.iter().map(|(_, up)| vec3(*up)).collect();
    format!(
        "
const EPSILON: f32 = {:?};
const LOG_EPSILON: f32 = {LOG_EPSILON:?};
const SHADOW_BIAS: f32 = {SHADOW_BIAS:?};
const OCCLUSION_BIAS: f32 = {OCCLUSION_BIAS:?};
const TRANSLUCENCY_FALLOFF: f32 = {TRANSLUCENCY_FALLOFF:?};
const BILATERAL_SHARPNESS: f32 = {BILATERAL_SHARPNESS:?};
const KEY_VALUE: f32 = {KEY_VALUE:?};
const SHADOW_NEAR: f32 = {SHADOW_NEAR:?};
const CUBE_LOOK = array<vec3<f32>, 6>({});
const CUBE_UP = array<vec3<f32>, 6>({});
",
        f32::EPSILON,
        looks.join(", "),
        ups.join(", "),
    )
}

/// Binding declarations `{prefix}{i}` and `sample{i}` helpers for the input slots.
fn inputs(kinds: &[InputKind], prefix: &str) -> String {
    let mut source = String::new();
    for (i, kind) in kinds.iter().enumerate() {
        let binding = i + 1;
        let (ty, load) = match kind {
            InputKind::Color => ("texture_2d<f32>", "textureLoad(VAR, c, 0)"),
            InputKind::Depth => ("texture_depth_2d", "vec4<f32>(vec3<f32>(textureLoad(VAR, c, 0)), 1.0)"),
            InputKind::ColorLayers => ("texture_2d_array<f32>", "textureLoad(VAR, c, layer, 0)"),
            InputKind::DepthLayers => (
                "texture_depth_2d_array",
                "vec4<f32>(vec3<f32>(textureLoad(VAR, c, layer, 0)), 1.0)",
            ),
        };
        let var = format!("{prefix}{i}");
        let load = load.replace("VAR", &var);
        let _ = writeln!(source, "\n@group(0) @binding({binding}) var {var}: {ty};");
        match kind {
            InputKind::Color | InputKind::Depth => {
                let _ = write!(
                    source,
                    "
fn sample{i}(uv: vec2<f32>) -> vec4<f32> {{
    let c = texel_coord(uv, textureDimensions({var}));
    return {load};
}}
"
                );
            }
            InputKind::ColorLayers | InputKind::DepthLayers => {
                let _ = write!(
                    source,
                    "
fn sample_layer{i}(layer: u32, uv: vec2<f32>) -> vec4<f32> {{
    let c = texel_coord(uv, textureDimensions({var}));
    return {load};
}}

fn sample{i}(uv: vec2<f32>) -> vec4<f32> {{
    return sample_layer{i}(0u, uv);
}}
"
                );
            }
        }
    }
    source
}

const CUSTOM_INPUT: &str = r#"
fn input_texel(frag: vec2<f32>) -> vec4<f32> {
    return sample0(frag_uv(frag));
}
"#;

/// Module source for a pass running `program` into `color_targets`
/// attachments, or the custom WGSL when one is set.
pub(super) fn pass_module(
    program: Program,
    custom: Option<&str>,
    color_targets: usize,
    depth_input: bool,
) -> String {
    let kinds = binding_kinds(program, depth_input);
    let prefix = if custom.is_some() { "input" } else { "t" };
    let mut source = format!("{}{UNIFORMS}{}", constants(), inputs(&kinds, prefix));
    match custom {
        Some(custom) => {
            source.push_str(CUSTOM_INPUT);
            source.push_str(custom);
        }
        None if color_targets > 0 => {
            source.push_str(&program_source(program));
            source.push_str(&fragment_entry(color_targets));
        }
        None => {}
    }
    source
}

fn fragment_entry(color_targets: usize) -> String {
    let fields: String = (0..color_targets)
        .map(|i| format!("    @location({i}) target{i}: vec4<f32>,\n"))
        .collect();
    let writes: String = (1..color_targets)
        .map(|i| format!("    output.target{i} = shaded.rest;\n"))
        .collect();
    format!(
        r#"
struct FragmentOutput {{
{fields}}}

@fragment
fn fs_main(input: VertexOutput) -> FragmentOutput {{
    let shaded = shade(input);
    if !shaded.keep {{
        discard;
    }}
    var output: FragmentOutput;
    output.target0 = shaded.first;
{writes}    return output;
}}
"#
    )
}

fn shade_fn(body: &str) -> String {
    format!(
        "
fn shade(input: VertexOutput) -> Shaded {{
    let uv = frag_uv(input.position.xy);
{body}}}
"
    )
}

/// `shade` for a built-in program.
fn program_source(program: Program) -> String {
    match program {
        Program::Tint => shade_fn("    return both(draw.tint * sample0(uv));\n"),
        Program::GBuffer => shade_fn(
            "    let normal = normalize_or_zero(input.normal);
    return Shaded(draw.tint * sample0(uv), vec4<f32>(normal * 0.5 + 0.5, 1.0), true);
",
        ),
        Program::LinearDepth => shade_fn(
            "    let depth = sample0(uv).x;
    if depth >= 1.0 {
        return both(vec4<f32>(1.0));
    }
    let view_pos = project_point(draw.inverse_projection, vec3<f32>(fragment_ndc(input.position.xy), depth));
    let linear_z = saturate(-view_pos.z / max(draw.cone_near_far.w, EPSILON));
    return both(vec4<f32>(linear_z, linear_z, linear_z, 1.0));
",
        ),
        Program::Light { model, shadowed } => light_source(model, shadowed),
        Program::LogLuminance => shade_fn(
            "    let v = log(LOG_EPSILON + luminance(sample0(uv)));
    return both(vec4<f32>(v, v, v, 1.0));
",
        ),
        Program::Downsample => shade_fn(
            "    let offset = 0.25 / max(draw.target_size.xy, vec2<f32>(1.0));
    let sum = sample0(uv + offset * vec2<f32>(-1.0, -1.0)) + sample0(uv + offset * vec2<f32>(1.0, -1.0))
        + sample0(uv + offset * vec2<f32>(-1.0, 1.0)) + sample0(uv + offset * vec2<f32>(1.0, 1.0));
    return both(sum * 0.25);
",
        ),
        Program::Adapt => shade_fn(
            "    let e = max(exp(sample0(uv).x) - LOG_EPSILON, 0.0);
    return both(vec4<f32>(e, e, e, draw.tint.w));
",
        ),
        Program::BrightPass => shade_fn(
            "    let c = sample0(uv);
    let l = luminance(c);
    let scale = max(l - draw.values.x, 0.0) / max(l, 1e-4);
    return both(vec4<f32>(c.xyz * scale, 1.0));
",
        ),
        Program::Blur => shade_fn(
            "    let taps = i32(draw.blur.w);
    if taps == 0 {
        return both(sample0(uv));
    }
    let stride = draw.blur.xy * draw.blur.z;
    var sum = vec4<f32>(0.0);
    for (var i = -(taps - 1); i < taps; i++) {
        sum += weight(abs(i)) * sample0(uv + stride * f32(i));
    }
    return both(sum);
",
        ),
        Program::BilateralBlur { depth_scaled } => shade_fn(&format!(
            "    let taps = i32(draw.blur.w);
    let center = sample1(uv).x;
    if taps == 0 {{
        return both(sample0(uv));
    }}
    var stride = draw.blur.xy * draw.blur.z;
    if {depth_scaled} {{
        stride /= max(center * draw.cone_near_far.w, 1.0);
    }}
    var sum = vec4<f32>(0.0);
    var total = 0.0;
    for (var i = -(taps - 1); i < taps; i++) {{
        let tap = uv + stride * f32(i);
        let w = weight(abs(i)) * exp(-abs(sample1(tap).x - center) * BILATERAL_SHARPNESS);
        sum += sample0(tap) * w;
        total += w;
    }}
    if total <= EPSILON {{
        return both(sample0(uv));
    }}
    return both(sum / total);
"
        )),
        Program::ToneMap => shade_fn(
            "    let scene = sample0(uv);
    let hdr = scene.xyz + sample1(uv).xyz * draw.values.y;
    let x = hdr * draw.values.x * KEY_VALUE / max(sample2(uv).x, 1e-3);
    var mapped = x;
    let curve = i32(draw.values.z);
    if curve == 1 {
        mapped = x / (vec3<f32>(1.0) + x);
    } else if curve != 0 {
        mapped = (x * (x * 2.51 + 0.03)) / (x * (x * 2.43 + 0.59) + 0.14);
    }
    return both(vec4<f32>(clamp(mapped, vec3<f32>(0.0), vec3<f32>(1.0)), scene.w));
",
        ),
        Program::Occlusion => shade_fn(
            "    let linear_z = sample0(uv).x;
    let count = u32(draw.values.z);
    if linear_z >= 1.0 || count == 0u {
        return both(vec4<f32>(1.0));
    }
    let p = view_position(fragment_ndc(input.position.xy), linear_z);
    let view3 = mat3x3<f32>(draw.view[0].xyz, draw.view[1].xyz, draw.view[2].xyz);
    let n = normalize_or_zero(view3 * decode_normal(sample1(uv)));
    if all(n == vec3<f32>(0.0)) {
        return both(vec4<f32>(1.0));
    }

    let pixel = vec2<u32>(input.position.xy);
    let angle = f32((pixel.x & 3u) + 4u * (pixel.y & 3u)) * 6.2831855 / 16.0;
    let r = vec3<f32>(cos(angle), sin(angle), 0.0);
    var t = r - n * dot(r, n);
    if dot(t, t) < 1e-6 {
        t = cross(n, vec3<f32>(0.0, 0.0, 1.0));
    }
    if dot(t, t) < 1e-6 {
        t = cross(n, vec3<f32>(1.0, 0.0, 0.0));
    }
    t = normalize(t);
    let b = cross(n, t);

    let radius = draw.values.x;
    let far = draw.cone_near_far.w;
    var occluded = 0.0;
    for (var i = 0u; i < count; i++) {
        let k = draw.kernel[i];
        let s = p + (t * k.x + b * k.y + n * k.z) * radius;
        let clip = draw.projection * vec4<f32>(s, 1.0);
        if clip.w <= 1e-6 {
            continue;
        }
        let scene = sample0(ndc_to_uv(clip.xy / clip.w)).x * far;
        if scene < -s.z - OCCLUSION_BIAS {
            occluded += smoothstep(0.0, 1.0, radius / max(abs(-p.z - scene), 1e-4));
        }
    }
    let v = saturate(1.0 - draw.values.y * occluded / f32(count));
    return both(vec4<f32>(v, v, v, 1.0));
",
        ),
        Program::Translucency => shade_fn(
            "    let linear_z = sample1(uv).x;
    if linear_z >= 1.0 {
        return discarded();
    }
    let p = view_position(fragment_ndc(input.position.xy), linear_z);
    let clip = draw.view_to_light * vec4<f32>(p, 1.0);
    if clip.w <= 1e-6 {
        return discarded();
    }
    let lp = clip.xyz / clip.w;
    let light_uv = clip_to_uv(lp.xy);
    if !in_unit_square(light_uv) || lp.z < 0.0 || lp.z > 1.0 {
        return discarded();
    }
    let thickness = max(lp.z - sample2(light_uv).x, 0.0);
    let transmitted = draw.tint.xyz * sample0(uv).xyz * exp(-thickness * TRANSLUCENCY_FALLOFF);
    return both(vec4<f32>(transmitted, 0.0));
",
        ),
    }
}

const MAP_VISIBILITY: &str = r#"
fn map_visibility(world: vec3<f32>) -> f32 {
    let clip = draw.shadow_matrix * vec4<f32>(world, 1.0);
    if clip.w <= 1e-6 {
        return 1.0;
    }
    let p = clip.xyz / clip.w;
    let uv = clip_to_uv(p.xy);
    if !in_unit_square(uv) || p.z > 1.0 {
        return 1.0;
    }
    let stored = sample2(uv).x;
    if p.z <= stored {
        return 1.0;
    }
    let occluder = project_point(draw.inverse_shadow_matrix, vec3<f32>(p.xy, stored));
    return select(1.0, 0.0, distance(world, occluder) > SHADOW_BIAS);
}
"#;

const CUBE_VISIBILITY: &str = r#"
fn cube_visibility(world: vec3<f32>) -> f32 {
    let lookup = cube_lookup(world - draw.light_position.xyz);
    let far = max(draw.light_position.w, 0.1);
    let stored = perspective_distance(sample_layer2(lookup.face, lookup.uv).x, SHADOW_NEAR, far);
    return select(1.0, 0.0, lookup.axis - stored > SHADOW_BIAS);
}
"#;

const SPOT_FACTOR: &str = r#"
fn spot_factor(cone: vec2<f32>, cos_angle: f32) -> f32 {
    if cone.x - cone.y <= 1e-4 {
        return select(0.0, 1.0, cos_angle >= cone.y);
    }
    return saturate((cos_angle - cone.y) / (cone.x - cone.y));
}
"#;

fn light_source(model: LightModel, shadowed: bool) -> String {
    let irradiance = match model {
        LightModel::Ambient => "    let irradiance = vec3<f32>(1.0);\n".to_string(),
        LightModel::Directional => {
            "    let irradiance = vec3<f32>(max(dot(normal, -direction), 0.0));\n".to_string()
        }
        LightModel::Point | LightModel::Spot => {
            let spot = if model == LightModel::Spot {
                "    term *= spot_factor(draw.cone_near_far.xy, dot(-l, direction));\n"
            } else {
                ""
            };
            format!(
                "    let to_light = draw.light_position.xyz - world;
    let dist = length(to_light);
    let l = to_light / max(dist, 1e-6);
    let falloff = max(1.0 - dist / max(draw.light_position.w, 1e-4), 0.0);
    var term = falloff * falloff * max(dot(normal, l), 0.0);
{spot}    let irradiance = vec3<f32>(term);
"
            )
        }
        LightModel::Environment => "    let lookup = cube_lookup(normal);
    let irradiance = sample_layer2(lookup.face, lookup.uv).xyz;
"
        .to_string(),
    };
    let (helper, visibility) = match model {
        _ if !shadowed => ("", "1.0"),
        LightModel::Ambient | LightModel::Environment => ("", "1.0"),
        LightModel::Point => (CUBE_VISIBILITY, "cube_visibility(world)"),
        LightModel::Directional | LightModel::Spot => (MAP_VISIBILITY, "map_visibility(world)"),
    };
    let spot = if model == LightModel::Spot { SPOT_FACTOR } else { "" };
    let body = format!(
        "    let depth = sample1(uv).x;
    if depth >= 1.0 {{
        return discarded();
    }}
    let normal = decode_normal(sample0(uv));
    let world = project_point(draw.inverse_view_projection, vec3<f32>(fragment_ndc(input.position.xy), depth));
    let direction = normalize_or_zero(draw.light_direction.xyz);
{irradiance}    let visibility = {visibility};
    return both(vec4<f32>(draw.tint.xyz * irradiance * visibility, 0.0));
"
    );
    format!("{spot}{helper}{}", shade_fn(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gbuffer_writes_normal_to_second_target() {
        let source = pass_module(Program::GBuffer, None, 2, false);
        assert!(source.contains("@location(1) target1"));
        assert!(source.contains("output.target1 = shaded.rest;"));
        assert!(source.contains("normal * 0.5 + 0.5"));
        assert!(source.contains("var t0: texture_2d<f32>"));
    }

    #[test]
    fn test_depth_only_pass_has_no_fragment() {
        let source = pass_module(Program::Tint, None, 0, true);
        assert!(!source.contains("fs_main"));
        assert!(source.contains("texture_depth_2d"));
    }

    #[test]
    fn test_custom_fragment_appended() {
        let source = pass_module(Program::Tint, Some("@fragment fn fs_main() {}"), 1, false);
        assert!(source.ends_with("@fragment fn fs_main() {}"));
        assert!(source.contains("fn input_texel"));
        assert!(!source.contains("FragmentOutput"));
    }

    #[test]
    fn test_program_bindings_follow_slots() {
        let point = Program::Light {
            model: LightModel::Point,
            shadowed: true,
        };
        let source = pass_module(point, None, 1, false);
        assert!(source.contains("@group(0) @binding(3) var t2: texture_depth_2d_array;"));
        assert!(source.contains("cube_visibility(world)"));
        assert!(!source.contains("map_visibility"));

        let unshadowed = Program::Light {
            model: LightModel::Spot,
            shadowed: false,
        };
        let source = pass_module(unshadowed, None, 1, false);
        assert!(!source.contains("var t2"));
        assert!(source.contains("spot_factor(draw.cone_near_far.xy"));
    }

    #[test]
    fn test_tone_map_reads_adapted_luminance() {
        let source = pass_module(Program::ToneMap, None, 1, false);
        assert_eq!(binding_kinds(Program::ToneMap, false).len(), 3);
        assert!(source.contains("max(sample2(uv).x, 1e-3)"));
        assert!(source.contains("KEY_VALUE"));
    }

    #[test]
    fn test_constants_emitted_from_rust() {
        let source = constants();
        assert!(source.contains(&format!("const SHADOW_BIAS: f32 = {SHADOW_BIAS:?};")));
        assert!(source.contains("const CUBE_LOOK = array<vec3<f32>, 6>(vec3<f32>(1.0, 0.0, 0.0)"));
    }
}
