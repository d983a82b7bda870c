//! CPU kernels of the built-in programs
//!
//! The headless device shades every fragment through [`shade`]. Each kernel
//! mirrors the WGSL the wgpu device generates for the same [`Program`].

use glam::{Mat3, Vec2, Vec3, Vec4, Vec3Swizzles, Vec4Swizzles};

use super::program::*;

/// Nearest-sampled copy of one input subresource.
pub(super) struct Sampled {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<[f32; 4]>,
}

impl Sampled {
    pub fn sample(&self, uv: Vec2) -> Vec4 {
        let uv = uv.clamp(Vec2::ZERO, Vec2::ONE);
        let x = ((uv.x * self.width as f32) as u32).min(self.width - 1);
        let y = ((uv.y * self.height as f32) as u32).min(self.height - 1);
        Vec4::from(self.texels[(y * self.width + x) as usize])
    }
}

pub(super) enum Input {
    Flat(Sampled),
    /// One entry per cube face
    Layers(Vec<Sampled>),
}

/// Texture inputs of one draw, indexed like [`Program::inputs`].
/// Missing inputs read as one, which is white for colors and the far plane
/// for depth.
pub(super) struct Inputs(pub Vec<Option<Input>>);

impl Inputs {
    fn sample(&self, slot: usize, uv: Vec2) -> Vec4 {
        match self.0.get(slot) {
            Some(Some(Input::Flat(s))) => s.sample(uv),
            Some(Some(Input::Layers(layers))) => layers.first().map_or(Vec4::ONE, |s| s.sample(uv)),
            _ => Vec4::ONE,
        }
    }

    fn sample_layer(&self, slot: usize, layer: u32, uv: Vec2) -> Vec4 {
        match self.0.get(slot) {
            Some(Some(Input::Layers(layers))) => {
                layers.get(layer as usize).map_or(Vec4::ONE, |s| s.sample(uv))
            }
            Some(Some(Input::Flat(s))) => s.sample(uv),
            _ => Vec4::ONE,
        }
    }
}

/// Per-fragment values interpolated by the rasterizer
pub(super) struct Fragment {
    /// Pixel center in framebuffer coordinates
    pub position: Vec2,
    /// Interpolated world normal of mesh draws
    pub normal: Vec3,
}

/// Colors for the first and every further attachment; `None` discards.
pub(super) type Shaded = Option<[Vec4; 2]>;

fn both(color: Vec4) -> Shaded {
    Some([color, color])
}

fn saturate(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

fn luminance(c: Vec4) -> f32 {
    0.2126 * c.x + 0.7152 * c.y + 0.0722 * c.z
}

fn decode_normal(encoded: Vec4) -> Vec3 {
    (encoded.xyz() * 2.0 - 1.0).normalize_or_zero()
}

fn smoothstep(x: f32) -> f32 {
    let t = saturate(x);
    t * t * (3.0 - 2.0 * t)
}

fn in_unit_square(uv: Vec2) -> bool {
    uv.cmpge(Vec2::ZERO).all() && uv.cmple(Vec2::ONE).all()
}

fn clip_to_uv(ndc: Vec2) -> Vec2 {
    Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5)
}

/// Normalized device coordinates of a pixel within the viewport.
fn fragment_ndc(u: &ProgramUniforms, position: Vec2) -> Vec2 {
    let rel = (position - u.viewport.xy()) / u.viewport.zw().max(Vec2::ONE);
    Vec2::new(rel.x * 2.0 - 1.0, 1.0 - rel.y * 2.0)
}

/// Framebuffer texture coordinate of a point in normalized device coordinates.
fn ndc_to_uv(u: &ProgramUniforms, ndc: Vec2) -> Vec2 {
    let rel = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    (u.viewport.xy() + rel * u.viewport.zw()) / u.target_size.xy().max(Vec2::ONE)
}

/// View-space position on the pixel's eye ray at a linear depth.
fn view_position(u: &ProgramUniforms, ndc: Vec2, linear: f32) -> Vec3 {
    let near = u.inverse_projection.project_point3(ndc.extend(0.0));
    let far = u.inverse_projection.project_point3(ndc.extend(1.0));
    let distance = linear * u.cone_near_far.w;
    let span = near.z - far.z;
    let t = if span.abs() > f32::EPSILON {
        (distance + near.z) / span
    } else {
        0.0
    };
    near.lerp(far, t)
}

/// Shade one fragment of `program`.
pub(super) fn shade(program: Program, u: &ProgramUniforms, inputs: &Inputs, fragment: &Fragment) -> Shaded {
    let uv = fragment.position / u.target_size.xy().max(Vec2::ONE);
    match program {
        Program::Tint => both(u.tint * inputs.sample(0, uv)),
        Program::GBuffer => {
            let normal = fragment.normal.normalize_or_zero();
            Some([u.tint * inputs.sample(0, uv), (normal * 0.5 + 0.5).extend(1.0)])
        }
        Program::LinearDepth => {
            let depth = inputs.sample(0, uv).x;
            if depth >= 1.0 {
                return both(Vec4::ONE);
            }
            let ndc = fragment_ndc(u, fragment.position);
            let view = u.inverse_projection.project_point3(ndc.extend(depth));
            let linear = saturate(-view.z / u.cone_near_far.w.max(f32::EPSILON));
            both(Vec4::new(linear, linear, linear, 1.0))
        }
        Program::Light { model, shadowed } => light(model, shadowed, u, inputs, fragment, uv),
        Program::LogLuminance => {
            let v = (LOG_EPSILON + luminance(inputs.sample(0, uv))).ln();
            both(Vec4::new(v, v, v, 1.0))
        }
        Program::Downsample => {
            let offset = 0.25 / u.target_size.xy().max(Vec2::ONE);
            let sum = [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)]
                .into_iter()
                .map(|(x, y)| inputs.sample(0, uv + offset * Vec2::new(x, y)))
                .sum::<Vec4>();
            both(sum * 0.25)
        }
        Program::Adapt => {
            let e = (inputs.sample(0, uv).x.exp() - LOG_EPSILON).max(0.0);
            both(Vec4::new(e, e, e, u.tint.w))
        }
        Program::BrightPass => {
            let c = inputs.sample(0, uv);
            let l = luminance(c);
            let scale = (l - u.values.x).max(0.0) / l.max(1e-4);
            both((c.xyz() * scale).extend(1.0))
        }
        Program::Blur => {
            let taps = u.blur.w as i32;
            if taps == 0 {
                return both(inputs.sample(0, uv));
            }
            let step = u.blur.xy() * u.blur.z;
            let sum = (-(taps - 1)..taps)
                .map(|i| u.weight(i.unsigned_abs() as usize) * inputs.sample(0, uv + step * i as f32))
                .sum::<Vec4>();
            both(sum)
        }
        Program::BilateralBlur { depth_scaled } => bilateral_blur(depth_scaled, u, inputs, uv),
        Program::ToneMap => tone_map(u, inputs, uv),
        Program::Occlusion => occlusion(u, inputs, fragment, uv),
        Program::Translucency => translucency(u, inputs, fragment, uv),
    }
}

fn light(
    model: LightModel,
    shadowed: bool,
    u: &ProgramUniforms,
    inputs: &Inputs,
    fragment: &Fragment,
    uv: Vec2,
) -> Shaded {
    let depth = inputs.sample(1, uv).x;
    if depth >= 1.0 {
        return None;
    }
    let normal = decode_normal(inputs.sample(0, uv));
    let ndc = fragment_ndc(u, fragment.position);
    let world = u.inverse_view_projection.project_point3(ndc.extend(depth));
    let direction = u.light_direction.xyz().normalize_or_zero();

    let irradiance = match model {
        LightModel::Ambient => Vec3::ONE,
        LightModel::Directional => Vec3::splat(normal.dot(-direction).max(0.0)),
        LightModel::Point | LightModel::Spot => {
            let to_light = u.light_position.xyz() - world;
            let distance = to_light.length();
            let l = to_light / distance.max(1e-6);
            let falloff = (1.0 - distance / u.light_position.w.max(1e-4)).max(0.0);
            let mut term = falloff * falloff * normal.dot(l).max(0.0);
            if model == LightModel::Spot {
                term *= spot_factor(u.cone_near_far.xy(), (-l).dot(direction));
            }
            Vec3::splat(term)
        }
        LightModel::Environment => {
            let (face, face_uv, _) = cube_lookup(normal);
            inputs.sample_layer(2, face, face_uv).xyz()
        }
    };

    let visibility = match model {
        _ if !shadowed => 1.0,
        LightModel::Ambient | LightModel::Environment => 1.0,
        LightModel::Point => cube_visibility(u, inputs, world),
        LightModel::Directional | LightModel::Spot => map_visibility(u, inputs, world),
    };
    both((u.tint.xyz() * irradiance * visibility).extend(0.0))
}

/// Smooth falloff between the inner and outer cone cosines.
fn spot_factor(cone: Vec2, cos_angle: f32) -> f32 {
    let (inner, outer) = (cone.x, cone.y);
    if inner - outer <= 1e-4 {
        if cos_angle >= outer {
            1.0
        } else {
            0.0
        }
    } else {
        saturate((cos_angle - outer) / (inner - outer))
    }
}

fn map_visibility(u: &ProgramUniforms, inputs: &Inputs, world: Vec3) -> f32 {
    let clip = u.shadow_matrix * world.extend(1.0);
    if clip.w <= 1e-6 {
        return 1.0;
    }
    let p = clip.xyz() / clip.w;
    let uv = clip_to_uv(p.xy());
    if !in_unit_square(uv) || p.z > 1.0 {
        return 1.0;
    }
    let stored = inputs.sample(2, uv).x;
    if p.z <= stored {
        return 1.0;
    }
    let occluder = u.inverse_shadow_matrix.project_point3(p.xy().extend(stored));
    if world.distance(occluder) > SHADOW_BIAS {
        0.0
    } else {
        1.0
    }
}

fn cube_visibility(u: &ProgramUniforms, inputs: &Inputs, world: Vec3) -> f32 {
    let (face, uv, distance) = cube_lookup(world - u.light_position.xyz());
    let far = u.light_position.w.max(0.1);
    let stored = perspective_distance(inputs.sample_layer(2, face, uv).x, SHADOW_NEAR, far);
    if distance - stored > SHADOW_BIAS {
        0.0
    } else {
        1.0
    }
}

fn bilateral_blur(depth_scaled: bool, u: &ProgramUniforms, inputs: &Inputs, uv: Vec2) -> Shaded {
    let taps = u.blur.w as i32;
    let center = inputs.sample(1, uv).x;
    if taps == 0 {
        return both(inputs.sample(0, uv));
    }
    let mut step = u.blur.xy() * u.blur.z;
    if depth_scaled {
        step /= (center * u.cone_near_far.w).max(1.0);
    }
    let mut sum = Vec4::ZERO;
    let mut total = 0.0;
    for i in -(taps - 1)..taps {
        let tap = uv + step * i as f32;
        let depth = inputs.sample(1, tap).x;
        let w = u.weight(i.unsigned_abs() as usize) * (-(depth - center).abs() * BILATERAL_SHARPNESS).exp();
        sum += inputs.sample(0, tap) * w;
        total += w;
    }
    if total <= f32::EPSILON {
        return both(inputs.sample(0, uv));
    }
    both(sum / total)
}

fn tone_map(u: &ProgramUniforms, inputs: &Inputs, uv: Vec2) -> Shaded {
    let scene = inputs.sample(0, uv);
    let bloom = inputs.sample(1, uv);
    let adapted = inputs.sample(2, uv).x;
    let (exposure, strength, operator) = (u.values.x, u.values.y, u.values.z as i32);
    let hdr = scene.xyz() + bloom.xyz() * strength;
    let x = hdr * exposure * KEY_VALUE / adapted.max(1e-3);
    let mapped = match operator {
        0 => x,
        1 => x / (Vec3::ONE + x),
        _ => (x * (x * 2.51 + 0.03)) / (x * (x * 2.43 + 0.59) + 0.14),
    };
    both(mapped.clamp(Vec3::ZERO, Vec3::ONE).extend(scene.w))
}

fn occlusion(u: &ProgramUniforms, inputs: &Inputs, fragment: &Fragment, uv: Vec2) -> Shaded {
    let linear = inputs.sample(0, uv).x;
    let count = u.values.z as usize;
    if linear >= 1.0 || count == 0 {
        return both(Vec4::ONE);
    }
    let ndc = fragment_ndc(u, fragment.position);
    let p = view_position(u, ndc, linear);
    let n = (Mat3::from_mat4(u.view) * decode_normal(inputs.sample(1, uv))).normalize_or_zero();
    if n == Vec3::ZERO {
        return both(Vec4::ONE);
    }

    let (px, py) = (fragment.position.x as u32, fragment.position.y as u32);
    let angle = ((px & 3) + 4 * (py & 3)) as f32 * std::f32::consts::TAU / 16.0;
    let r = Vec3::new(angle.cos(), angle.sin(), 0.0);
    let mut t = r - n * r.dot(n);
    if t.length_squared() < 1e-6 {
        t = n.cross(Vec3::Z);
    }
    if t.length_squared() < 1e-6 {
        t = n.cross(Vec3::X);
    }
    let t = t.normalize();
    let b = n.cross(t);

    let (radius, intensity, far) = (u.values.x, u.values.y, u.cone_near_far.w);
    let mut occluded = 0.0;
    for k in &u.kernel[..count] {
        let s = p + (t * k.x + b * k.y + n * k.z) * radius;
        let clip = u.projection * s.extend(1.0);
        if clip.w <= 1e-6 {
            continue;
        }
        let sample_uv = ndc_to_uv(u, clip.xy() / clip.w);
        let scene = inputs.sample(0, sample_uv).x * far;
        if scene < -s.z - OCCLUSION_BIAS {
            occluded += smoothstep(radius / (-p.z - scene).abs().max(1e-4));
        }
    }
    let v = saturate(1.0 - intensity * occluded / count as f32);
    both(Vec4::new(v, v, v, 1.0))
}

fn translucency(u: &ProgramUniforms, inputs: &Inputs, fragment: &Fragment, uv: Vec2) -> Shaded {
    let linear = inputs.sample(1, uv).x;
    if linear >= 1.0 {
        return None;
    }
    let ndc = fragment_ndc(u, fragment.position);
    let p = view_position(u, ndc, linear);
    let clip = u.view_to_light * p.extend(1.0);
    if clip.w <= 1e-6 {
        return None;
    }
    let lp = clip.xyz() / clip.w;
    let light_uv = clip_to_uv(lp.xy());
    if !in_unit_square(light_uv) || !(0.0..=1.0).contains(&lp.z) {
        return None;
    }
    let thickness = (lp.z - inputs.sample(2, light_uv).x).max(0.0);
    let albedo = inputs.sample(0, uv);
    let transmitted = u.tint.xyz() * albedo.xyz() * (-thickness * TRANSLUCENCY_FALLOFF).exp();
    both(transmitted.extend(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use glam::Mat4;

    fn uniforms(width: f32, height: f32) -> ProgramUniforms {
        let mut u = ProgramUniforms::zeroed();
        u.target_size = Vec4::new(width, height, 0.0, 0.0);
        u.viewport = Vec4::new(0.0, 0.0, width, height);
        u.tint = Vec4::ONE;
        u.view = Mat4::IDENTITY;
        u.blur.z = 1.0;
        u
    }

    fn flat(texels: Vec<[f32; 4]>, width: u32, height: u32) -> Option<Input> {
        Some(Input::Flat(Sampled {
            width,
            height,
            texels,
        }))
    }

    fn at(x: f32, y: f32) -> Fragment {
        Fragment {
            position: Vec2::new(x, y),
            normal: Vec3::Z,
        }
    }

    #[test]
    fn test_log_luminance_then_adapt_recovers_value() {
        let u = uniforms(1.0, 1.0);
        let inputs = Inputs(vec![flat(vec![[2.0, 2.0, 2.0, 1.0]], 1, 1)]);
        let [log, _] = shade(Program::LogLuminance, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert!((log.x - (2.0f32 + LOG_EPSILON).ln()).abs() < 1e-6);

        let inputs = Inputs(vec![flat(vec![log.to_array()], 1, 1)]);
        let [adapted, _] = shade(Program::Adapt, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert!((adapted.x - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_downsample_averages_four_texels() {
        let u = uniforms(1.0, 1.0);
        let texels = vec![[1.0; 4], [2.0; 4], [3.0; 4], [6.0; 4]];
        let inputs = Inputs(vec![flat(texels, 2, 2)]);
        let [c, _] = shade(Program::Downsample, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert_eq!(c.x, 3.0);
    }

    #[test]
    fn test_bright_pass_zero_below_threshold() {
        let mut u = uniforms(1.0, 1.0);
        u.values.x = 1.0;
        let inputs = Inputs(vec![flat(vec![[0.8, 0.8, 0.8, 1.0]], 1, 1)]);
        let [dim, _] = shade(Program::BrightPass, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert_eq!(dim.xyz(), Vec3::ZERO);

        let inputs = Inputs(vec![flat(vec![[4.0, 4.0, 4.0, 1.0]], 1, 1)]);
        let [bright, _] = shade(Program::BrightPass, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert!((bright.x - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_tone_map_exposure_and_operators() {
        let mut u = uniforms(1.0, 1.0);
        u.values = Vec4::new(1.0, 0.0, 1.0, 0.0);
        let inputs = Inputs(vec![
            flat(vec![[1.0, 1.0, 1.0, 1.0]], 1, 1),
            flat(vec![[0.0; 4]], 1, 1),
            flat(vec![[KEY_VALUE, KEY_VALUE, KEY_VALUE, 1.0]], 1, 1),
        ]);
        let [reinhard, _] = shade(Program::ToneMap, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert!((reinhard.x - 0.5).abs() < 1e-6);

        u.values.x = 3.0;
        let [brighter, _] = shade(Program::ToneMap, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert!((brighter.x - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_spot_factor() {
        let cone = Vec2::new(0.9, 0.7);
        assert_eq!(spot_factor(cone, 0.95), 1.0);
        assert_eq!(spot_factor(cone, 0.5), 0.0);
        assert!((spot_factor(cone, 0.8) - 0.5).abs() < 1e-5);
        assert_eq!(spot_factor(Vec2::splat(0.8), 0.81), 1.0);
    }

    #[test]
    fn test_directional_light_respects_normal_and_shadow() {
        let mut u = uniforms(1.0, 1.0);
        u.light_direction = Vec4::new(0.0, -1.0, 0.0, 0.0);
        u.shadow_matrix = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0)
            * Mat4::look_to_rh(Vec3::new(0.0, 5.0, 0.0), Vec3::NEG_Y, Vec3::Z);
        u.inverse_shadow_matrix = u.shadow_matrix.inverse();
        let up = [0.5, 1.0, 0.5, 1.0];
        let program = |shadowed| Program::Light {
            model: LightModel::Directional,
            shadowed,
        };

        // The fragment reconstructs to the origin.
        let lit_inputs = Inputs(vec![flat(vec![up], 1, 1), flat(vec![[0.5; 4]], 1, 1), flat(vec![[1.0; 4]], 1, 1)]);
        u.inverse_view_projection = Mat4::from_scale(Vec3::ZERO);
        let [lit, _] = shade(program(true), &u, &lit_inputs, &at(0.5, 0.5)).unwrap();
        assert!((lit.x - 1.0).abs() < 1e-5);
        assert_eq!(lit.w, 0.0);

        let blocked = Inputs(vec![flat(vec![up], 1, 1), flat(vec![[0.5; 4]], 1, 1), flat(vec![[0.1; 4]], 1, 1)]);
        let [shadowed, _] = shade(program(true), &u, &blocked, &at(0.5, 0.5)).unwrap();
        assert_eq!(shadowed.x, 0.0);
        let [unshadowed, _] = shade(program(false), &u, &blocked, &at(0.5, 0.5)).unwrap();
        assert!((unshadowed.x - 1.0).abs() < 1e-5);

        let sky = Inputs(vec![flat(vec![up], 1, 1), flat(vec![[1.0; 4]], 1, 1)]);
        assert!(shade(program(false), &u, &sky, &at(0.5, 0.5)).is_none());
    }

    #[test]
    fn test_point_shadow_distance() {
        let mut u = uniforms(1.0, 1.0);
        u.light_position = Vec4::new(0.0, 0.0, 0.0, 10.0);
        let world = Vec3::new(0.0, 0.0, 4.0);
        let occluder = perspective_depth(2.0, SHADOW_NEAR, 10.0);
        let layers = |depth: f32| {
            Inputs(vec![
                None,
                None,
                Some(Input::Layers(
                    (0..6)
                        .map(|_| Sampled {
                            width: 1,
                            height: 1,
                            texels: vec![[depth; 4]],
                        })
                        .collect(),
                )),
            ])
        };
        assert_eq!(cube_visibility(&u, &layers(occluder), world), 0.0);
        let surface = perspective_depth(4.0, SHADOW_NEAR, 10.0);
        assert_eq!(cube_visibility(&u, &layers(surface), world), 1.0);
    }

    #[test]
    fn test_bilateral_blur_keeps_depth_edges() {
        let mut u = uniforms(2.0, 1.0);
        u.blur = Vec4::new(0.5, 0.0, 1.0, 2.0);
        u.weights[0] = Vec4::new(0.5, 0.25, 0.0, 0.0);
        u.cone_near_far.w = 100.0;
        let inputs = Inputs(vec![
            flat(vec![[1.0; 4], [0.0; 4]], 2, 1),
            flat(vec![[0.1; 4], [0.9; 4]], 2, 1),
        ]);
        let [c, _] = shade(Program::BilateralBlur { depth_scaled: false }, &u, &inputs, &at(0.5, 0.5)).unwrap();
        assert!(c.x > 0.999);
    }

    #[test]
    fn test_occlusion_open_plane_unoccluded() {
        let mut u = uniforms(4.0, 4.0);
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0);
        u.projection = projection;
        u.inverse_projection = projection.inverse();
        u.cone_near_far = Vec4::new(1.0, 0.0, 0.1, 10.0);
        u.values = Vec4::new(0.5, 1.0, 4.0, 0.0);
        for (i, k) in [Vec4::Z, Vec4::new(0.5, 0.0, 0.5, 0.0), Vec4::new(0.0, 0.5, 0.5, 0.0), Vec4::new(-0.3, 0.3, 0.3, 0.0)]
            .into_iter()
            .enumerate()
        {
            u.kernel[i] = k;
        }
        // Wall facing the camera at distance 5.
        let linear = 0.5;
        let inputs = Inputs(vec![
            flat(vec![[linear, linear, linear, 1.0]; 16], 4, 4),
            flat(vec![[0.5, 0.5, 1.0, 1.0]; 16], 4, 4),
        ]);
        let [open, _] = shade(Program::Occlusion, &u, &inputs, &at(1.5, 1.5)).unwrap();
        assert!((open.x - 1.0).abs() < 1e-5);

        let sky = Inputs(vec![flat(vec![[1.0; 4]; 16], 4, 4), None]);
        let [far, _] = shade(Program::Occlusion, &u, &sky, &at(1.5, 1.5)).unwrap();
        assert_eq!(far.x, 1.0);
    }
}
