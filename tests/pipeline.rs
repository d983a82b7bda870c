mod common;

use deferred_renderer::backend::{
    GraphicsBackend, HeadlessBackend, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
    TextureView,
};
use deferred_renderer::material::builtin;
use deferred_renderer::pipeline::postprocess::{HdrStage, SsdoStage};
use deferred_renderer::pipeline::{
    HdrSettings, PipelineConfig, PipelineManager, RenderTargetSet, SsdoSettings,
};
use deferred_renderer::PipelineError;
use deferred_renderer::resources::Mesh;
use deferred_renderer::scene::{
    Camera, CameraOrder, ClearFlags, Drawable, Light, LightProbe, Projection, Scene, ShadowMode,
    Transform,
};
use glam::{Vec3, Vec4};
use rstest::rstest;

use common::*;

fn read(device: &mut impl GraphicsBackend, texture: TextureHandle) -> Vec<[f32; 4]> {
    device.read_pixels(TextureView::new(texture)).unwrap()
}

/// Backbuffer after one frame of the lit cube scene.
fn lit_cube_frame(config: PipelineConfig) -> Vec<[f32; 4]> {
    let mut device = device(config.width, config.height);
    let mut manager = PipelineManager::new(&mut device, config).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    manager.render_frame(&mut scene, 0.016).unwrap();
    let backbuffer = manager.device().backbuffer();
    read(manager.device_mut(), backbuffer)
}

fn brightness(pixels: &[[f32; 4]]) -> f32 {
    pixels.iter().map(|p| p[0] + p[1] + p[2]).sum()
}

fn target_sizes(device: &impl GraphicsBackend, set: &RenderTargetSet) -> Vec<(u32, u32)> {
    set.texture_ids()
        .map(|id| {
            let desc = device.texture_descriptor(set.texture(id)).unwrap();
            (desc.width, desc.height)
        })
        .collect()
}

#[test]
fn test_empty_scene_presents_clear_color() {
    let mut device = device(32, 24);
    {
        let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
        let mut scene = Scene::new();
        scene.add_camera(
            Camera::new("ortho", Projection::orthographic(4.0, 3.0, 0.1, 10.0))
                .with_clear(ClearFlags::COLOR | ClearFlags::DEPTH, Vec4::new(0.0, 0.0, 0.0, 1.0)),
        );
        manager.render_frame(&mut scene, 1.0 / 60.0).unwrap();
        assert_eq!(manager.frame_count(), 1);
    }
    let backbuffer = device.backbuffer();
    let pixels = read(&mut device, backbuffer);
    assert_eq!(pixels.len(), 32 * 24);
    assert!(pixels.iter().all(|p| *p == [0.0, 0.0, 0.0, 1.0]));
}

#[test]
fn test_lit_cube_shades_non_uniformly() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(
        &mut device,
        PipelineConfig {
            ssdo_enabled: false,
            ..small_config()
        },
    )
    .unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    manager.render_frame(&mut scene, 1.0 / 60.0).unwrap();

    let shading = manager.deferred().shading_texture();
    let pixels = read(manager.device_mut(), shading);
    let clear = scene.camera(0).clear_color.to_array();
    assert!(pixels.iter().any(|p| *p != clear));
    assert!(pixels.iter().any(|p| *p == clear));
}

#[test]
fn test_probe_captured_once_across_frames() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = Scene::new();
    scene.add_camera(perspective_camera("main"));
    let probe = scene.add_probe(LightProbe::new("probe", Vec3::ZERO, 10.0));

    manager.render_frame(&mut scene, 0.016).unwrap();
    assert!(!scene.probe(probe).need_update());
    manager.render_frame(&mut scene, 0.016).unwrap();

    let (color, normal) = manager.deferred().probe_textures().unwrap();
    for layer in 0..6 {
        assert_eq!(manager.device().copy_count(color, layer), 1);
        assert_eq!(manager.device().copy_count(normal, layer), 1);
    }
}

#[test]
fn test_resize_round_trip_restores_sizes() {
    let mut device = device(800, 600);
    let mut manager = PipelineManager::new(
        &mut device,
        PipelineConfig {
            width: 800,
            height: 600,
            ..small_config()
        },
    )
    .unwrap();
    let sizes = |m: &PipelineManager<&mut HeadlessBackend>| {
        let deferred = m.deferred();
        [
            target_sizes(m.device(), deferred.main_targets()),
            target_sizes(m.device(), deferred.shadow_targets()),
            target_sizes(m.device(), deferred.probe_targets()),
        ]
    };
    let before = sizes(&manager);
    let layouts = manager.device().live_layouts();
    assert!(before[0].contains(&(800, 600)));

    manager.resize(1920, 1080).unwrap();
    assert_eq!(manager.deferred().resolution(), (1920, 1080));
    assert_eq!(manager.device().live_layouts(), layouts);
    manager.resize(800, 600).unwrap();

    assert_eq!(sizes(&manager), before);
    assert_eq!(manager.device().live_layouts(), layouts);
}

#[test]
fn test_resize_reactivates_post_process() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());

    manager.resize(48, 40).unwrap();
    assert!(manager.chain().is_active());
    assert!(manager.chain().is_enabled(HdrStage::NAME));

    manager.device_mut().take_draw_log();
    manager.render_frame(&mut scene, 0.016).unwrap();
    let log = manager.device_mut().take_draw_log();
    assert!(log.iter().any(|l| l == builtin::HDR_TONEMAP));
    let backbuffer = manager.device().backbuffer();
    let desc = manager.device().texture_descriptor(backbuffer).unwrap();
    assert_eq!((desc.width, desc.height), (48, 40));
}

#[test]
fn test_zero_and_unchanged_resize_are_ignored() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let textures = manager.device().live_textures();
    manager.resize(0, 10).unwrap();
    manager.resize(32, 24).unwrap();
    assert_eq!(manager.device().resolution(), (32, 24));
    assert_eq!(manager.device().live_textures(), textures);
}

#[rstest]
#[case(&[], TextureFormat::Rgba16Float, TextureFormat::Depth24PlusStencil8)]
#[case(&[TextureFormat::Rgba16Float], TextureFormat::Rgba32Float, TextureFormat::Depth24PlusStencil8)]
#[case(
    &[TextureFormat::Rgba16Float, TextureFormat::Rgba32Float, TextureFormat::Depth24PlusStencil8],
    TextureFormat::Rgba8Unorm,
    TextureFormat::Depth32FloatStencil8
)]
fn test_format_fallback(
    #[case] missing: &[TextureFormat],
    #[case] color: TextureFormat,
    #[case] depth: TextureFormat,
) {
    init_logging();
    let mut device = HeadlessBackend::new(32, 24);
    for format in missing {
        device = device.without_format(*format);
    }
    let manager = PipelineManager::new(&mut device, small_config()).unwrap();
    assert_eq!(manager.deferred().hdr_format(), Some(color));
    assert_eq!(manager.deferred().depth_format(), Some(depth));
}

#[test]
fn test_setup_failure_releases_everything() {
    init_logging();
    let mut device = HeadlessBackend::new(32, 24).with_supported_formats(&[TextureFormat::Rgba8Unorm]);
    assert!(PipelineManager::new(&mut device, small_config()).is_err());
    assert_eq!(device.live_textures(), 0);
    assert_eq!(device.live_framebuffers(), 0);
    assert_eq!(device.live_layouts(), 0);
}

#[test]
fn test_failed_resize_tears_down() {
    init_logging();
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    manager.render_frame(&mut scene, 0.016).unwrap();

    manager.device_mut().fail_texture_creation_after(8);
    assert!(manager.resize(64, 48).is_err());
    manager.device_mut().clear_failure();

    assert!(!manager.is_active());
    assert!(matches!(
        manager.render_frame(&mut scene, 0.016),
        Err(PipelineError::Inactive)
    ));
    assert!(matches!(manager.resize(32, 24), Err(PipelineError::Inactive)));
    assert_eq!(manager.device().live_textures(), 0);
    assert_eq!(manager.device().live_framebuffers(), 0);
}

#[test]
fn test_refused_device_resize_restores_targets() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());

    manager.device_mut().fail_next_resize();
    assert!(manager.resize(64, 48).is_err());

    assert!(manager.is_active());
    assert!(!manager.deferred().is_resizing());
    assert_eq!(manager.device().resolution(), (32, 24));
    assert_eq!(manager.deferred().resolution(), (32, 24));
    manager.render_frame(&mut scene, 0.016).unwrap();

    manager.resize(64, 48).unwrap();
    assert_eq!(manager.deferred().resolution(), (64, 48));
}

#[test]
fn test_drop_releases_everything() {
    let mut device = device(32, 24);
    {
        let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
        let mut scene = lit_cube_scene(manager.library_mut());
        manager.render_frame(&mut scene, 0.016).unwrap();
        assert!(manager.device().live_textures() > 0);
    }
    assert_eq!(device.live_textures(), 0);
    assert_eq!(device.live_framebuffers(), 0);
    assert_eq!(device.live_layouts(), 0);
}

#[test]
fn test_eye_adaptation_converges() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = Scene::new();
    scene.add_camera(perspective_camera("dark"));
    let initial = manager.chain().stage::<HdrStage>().unwrap().adapted_luminance();

    let mut previous = initial;
    for _ in 0..10 {
        manager.render_frame(&mut scene, 1.0).unwrap();
        let hdr = manager.chain().stage::<HdrStage>().unwrap();
        assert!(hdr.measured_luminance().unwrap() < 1e-6);
        assert!(hdr.adapted_luminance() < previous);
        previous = hdr.adapted_luminance();
    }
    assert!(previous < initial * 0.1);

    // Frozen time leaves adaptation untouched.
    manager.render_frame(&mut scene, 0.0).unwrap();
    let hdr = manager.chain_mut().stage_mut::<HdrStage>().unwrap();
    assert_eq!(hdr.adapted_luminance(), previous);
}

#[test]
fn test_stage_toggle() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    let ssdo_drawn = |log: &[String]| log.iter().any(|l| l == builtin::SSDO_OCCLUSION);

    manager.render_frame(&mut scene, 0.016).unwrap();
    assert!(ssdo_drawn(&manager.device_mut().take_draw_log()));

    assert!(manager.set_stage_enabled("ssdo", false));
    assert!(!manager.set_stage_enabled("missing", false));
    manager.render_frame(&mut scene, 0.016).unwrap();
    assert!(!ssdo_drawn(&manager.device_mut().take_draw_log()));

    assert!(manager.set_stage_enabled("ssdo", true));
    manager.render_frame(&mut scene, 0.016).unwrap();
    assert!(ssdo_drawn(&manager.device_mut().take_draw_log()));
}

#[test]
fn test_custom_camera_renders_into_texture() {
    let mut device = device(32, 24);
    let target = device
        .create_texture(&TextureDescriptor {
            label: Some("mirror".to_string()),
            width: 16,
            height: 8,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::render_target(),
            ..Default::default()
        })
        .unwrap();
    let config = PipelineConfig {
        hdr_enabled: false,
        ssdo_enabled: false,
        ..small_config()
    };
    let mut manager = PipelineManager::new(&mut device, config).unwrap();
    let mut scene = Scene::new();
    let mut camera = perspective_camera("mirror")
        .with_order(CameraOrder::Custom)
        .with_clear(ClearFlags::COLOR | ClearFlags::DEPTH, Vec4::new(1.0, 0.0, 0.0, 1.0));
    camera.render_texture = Some(target);
    scene.add_camera(camera);

    manager.render_frame(&mut scene, 0.016).unwrap();
    let pixels = read(manager.device_mut(), target);
    assert_eq!(pixels.len(), 16 * 8);
    assert!(pixels.iter().all(|p| *p == [1.0, 0.0, 0.0, 1.0]));

    manager.release_render_texture(target);
    manager.device_mut().destroy_texture(target);
}

#[test]
fn test_overlay_draws_after_scene_cameras() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = Scene::new();
    let cube = scene.add_mesh(Mesh::cube());
    let glass = manager
        .library_mut()
        .create_material(builtin::STANDARD_TRANSPARENT)
        .unwrap();
    scene.add_drawable(Drawable::new("glass", cube, glass));
    scene.add_camera(perspective_camera("hud").with_order(CameraOrder::Overlay2D));
    scene.add_camera(perspective_camera("main"));

    manager.device_mut().take_draw_log();
    manager.render_frame(&mut scene, 0.016).unwrap();
    let log = manager.device_mut().take_draw_log();
    assert_eq!(log.first().map(String::as_str), Some("depth_linear"));
    assert_eq!(log.last().map(String::as_str), Some("transparent"));
    let blit = log.iter().rposition(|l| l == builtin::BLIT).unwrap();
    assert_eq!(blit, log.len() - 2);
}

#[test]
fn test_overlay_only_frame() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = Scene::new();
    let cube = scene.add_mesh(Mesh::cube());
    let glass = manager
        .library_mut()
        .create_material(builtin::STANDARD_TRANSPARENT)
        .unwrap();
    scene.add_drawable(Drawable::new("glass", cube, glass));
    scene.add_camera(perspective_camera("hud").with_order(CameraOrder::Overlay2D));

    manager.device_mut().take_draw_log();
    manager.render_frame(&mut scene, 0.016).unwrap();
    assert_eq!(manager.device_mut().take_draw_log(), vec!["transparent"]);
}

#[test]
fn test_exposure_brightens_output() {
    let frame = |exposure| {
        lit_cube_frame(PipelineConfig {
            hdr: HdrSettings {
                exposure,
                ..Default::default()
            },
            ..small_config()
        })
    };
    let dim = frame(1.0);
    let bright = frame(4.0);
    assert_ne!(dim, bright);
    assert!(brightness(&bright) > brightness(&dim));
}

#[test]
fn test_hdr_changes_presented_image() {
    let config = PipelineConfig {
        ssdo_enabled: false,
        ..small_config()
    };
    let hdr = lit_cube_frame(config.clone());
    let ldr = lit_cube_frame(PipelineConfig {
        hdr_enabled: false,
        ..config
    });
    assert_ne!(hdr, ldr);
    // Without tone mapping the ambient-lit cube presents its shading as is.
    assert!(ldr.iter().any(|p| (p[0] - 0.5).abs() < 0.01));
}

#[test]
fn test_bloom_empty_below_threshold() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    let bloom = |manager: &mut PipelineManager<&mut HeadlessBackend>| {
        let texture = manager.chain().stage::<HdrStage>().unwrap().bloom_texture().unwrap();
        read(manager.device_mut(), texture)
    };

    manager.render_frame(&mut scene, 0.016).unwrap();
    assert!(bloom(&mut manager).iter().all(|p| p[..3] == [0.0, 0.0, 0.0]));

    manager
        .chain_mut()
        .stage_mut::<HdrStage>()
        .unwrap()
        .settings_mut()
        .bloom_threshold = 0.1;
    manager.render_frame(&mut scene, 0.016).unwrap();
    assert!(bloom(&mut manager).iter().any(|p| p[0] > 0.0));
}

#[test]
fn test_lighting_follows_surface_normal() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(
        &mut device,
        PipelineConfig {
            ssdo_enabled: false,
            ..small_config()
        },
    )
    .unwrap();
    let mut scene = Scene::new();
    let material = manager.library_mut().create_material(builtin::STANDARD).unwrap();
    let floor = scene.add_mesh(Mesh::plane(8.0, 8.0, 1));
    let cube = scene.add_mesh(Mesh::cube());
    scene.add_drawable(Drawable::new("floor", floor, material).with_position(Vec3::new(0.0, -0.5, 0.0)));
    scene.add_drawable(Drawable::new("cube", cube, material));
    scene.add_light(Light::sun(Vec3::NEG_Z, Vec3::ONE));
    scene.add_camera(perspective_camera("main"));
    manager.render_frame(&mut scene, 0.016).unwrap();

    let linear_depth = manager.deferred().linear_depth_texture();
    let lighting = manager.deferred().lighting_texture();
    let depth = read(manager.device_mut(), linear_depth);
    let light = read(manager.device_mut(), lighting);
    let covered: Vec<f32> = depth
        .iter()
        .zip(&light)
        .filter(|(d, _)| d[0] < 1.0)
        .map(|(_, l)| l[0])
        .collect();
    assert!(!covered.is_empty());
    // The cube's front faces the sun, the floor is edge-on to it.
    assert!(covered.iter().any(|l| *l > 0.99));
    assert!(covered.iter().any(|l| *l < 0.01));
    assert!(light.iter().all(|p| p[3] == 1.0));
}

#[test]
fn test_ssdo_darkens_creases_only() {
    let mut device = device(32, 24);
    let config = PipelineConfig {
        ssdo: SsdoSettings {
            intensity: 2.0,
            blur: false,
            ..Default::default()
        },
        ..small_config()
    };
    let mut manager = PipelineManager::new(&mut device, config).unwrap();
    let mut scene = Scene::new();
    let material = manager.library_mut().create_material(builtin::STANDARD).unwrap();
    let floor = scene.add_mesh(Mesh::plane(40.0, 40.0, 1));
    let cube = scene.add_mesh(Mesh::cube());
    scene.add_drawable(Drawable::new("floor", floor, material).with_position(Vec3::new(0.0, -0.5, 0.0)));
    scene.add_drawable(Drawable::new("cube", cube, material));
    scene.add_light(Light::ambient(Vec3::ONE));
    scene.add_camera(
        Camera::new("top", Projection::perspective(60.0, 4.0 / 3.0, 0.1, 50.0))
            .with_transform(Transform::looking_at(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::NEG_Z)),
    );
    manager.render_frame(&mut scene, 0.016).unwrap();

    let occlusion = manager.chain().stage::<SsdoStage>().unwrap().occlusion_texture().unwrap();
    let linear_depth = manager.deferred().linear_depth_texture();
    let factors = read(manager.device_mut(), occlusion);
    let depth = read(manager.device_mut(), linear_depth);

    // The corner sees open floor, unlike a plain depth visualization would suggest.
    assert!(depth[0][0] < 1.0);
    assert!((factors[0][0] - 1.0).abs() < 1e-3);
    let darkest = factors.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min);
    assert!(darkest < 0.95, "darkest occlusion {darkest}");
}

#[rstest]
#[case::shadowed_subsurface_sun(Light::sun(Vec3::NEG_Y, Vec3::ONE), ShadowMode::Hard, true, true)]
#[case::unshadowed_sun(Light::sun(Vec3::NEG_Y, Vec3::ONE), ShadowMode::None, true, false)]
#[case::plain_sun(Light::sun(Vec3::NEG_Y, Vec3::ONE), ShadowMode::Hard, false, false)]
#[case::point_light(Light::point(Vec3::new(0.0, 2.0, 0.0), Vec3::ONE, 10.0), ShadowMode::Hard, true, false)]
fn test_subsurface_needs_shadowed_subsurface_light(
    #[case] light: Light,
    #[case] shadow: ShadowMode,
    #[case] subsurface: bool,
    #[case] expected: bool,
) {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    scene.add_light(light.with_shadow(shadow).with_subsurface(subsurface));

    manager.device_mut().take_draw_log();
    manager.render_frame(&mut scene, 0.016).unwrap();
    let log = manager.device_mut().take_draw_log();
    assert_eq!(log.iter().any(|l| l == builtin::SUBSURFACE_TRANSLUCENCY), expected);
    assert_eq!(log.iter().any(|l| l == builtin::SUBSURFACE_BLUR), expected);
}

#[test]
fn test_material_effects_draw_after_builtin_stages() {
    let mut device = device(32, 24);
    let mut manager = PipelineManager::new(&mut device, small_config()).unwrap();
    let mut scene = lit_cube_scene(manager.library_mut());
    let quad = scene.add_mesh(Mesh::quad());
    let fade = manager.library_mut().create_material(builtin::TINT).unwrap();
    let color = manager.library().get_parameter(fade, "color").unwrap();
    manager.library_mut().set(color, Vec4::new(0.0, 0.0, 0.0, 1.0));
    scene.add_drawable(Drawable::new("fade", quad, fade));

    manager.device_mut().take_draw_log();
    manager.render_frame(&mut scene, 0.016).unwrap();
    let log = manager.device_mut().take_draw_log();
    let tonemap = log.iter().position(|l| l == builtin::HDR_TONEMAP).unwrap();
    let fade_at = log.iter().position(|l| l == builtin::TINT).unwrap();
    assert!(fade_at > tonemap);

    // The multiplied black effect is the last word on the presented image.
    let backbuffer = manager.device().backbuffer();
    let pixels = read(manager.device_mut(), backbuffer);
    assert!(pixels.iter().all(|p| p[..3] == [0.0, 0.0, 0.0]));
}
