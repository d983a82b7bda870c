//! Deferred frame pipeline
//!
//! Per camera and frame the passes run in a fixed order:
//! 1. Light-probe capture for dirty probes the camera sees
//! 2. Shadow maps for shadow-casting lights
//! 3. G-buffer fill (albedo, normal, depth) and linear depth derivation
//! 4. Lighting accumulation, one fullscreen pass per light in
//!    sun, directional, ambient, point, spot, environment order
//! 5. Opaque shading composite and transparent geometry
//! 6. Post-process chain, then presentation

mod deferred;
mod light_probe;
mod manager;
pub mod postprocess;
mod targets;

pub use deferred::DeferredPipeline;
pub use light_probe::LightProbePipeline;
pub use manager::PipelineManager;
pub use targets::*;

use std::collections::HashMap;

use glam::Vec2;

use crate::backend::{
    FramebufferHandle, Geometry, GraphicsBackend, LoadOp, RenderPassDescriptor, TextureFormat,
    TextureHandle, TextureUsage, TextureView, Viewport,
};
use crate::error::{PipelineError, PipelineResult};
use crate::material::{
    MaterialHandle, MaterialLibrary, MaterialSemantics, PassHandle, Semantic, TextureBinding,
};
use crate::scene::{Camera, ClearFlags, RenderQueue, Scene};

/// Tone-mapping curve applied by the HDR stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToneMapOperator {
    Linear,
    Reinhard,
    #[default]
    Aces,
}

/// HDR, bloom and tone-mapping settings
#[derive(Debug, Clone)]
pub struct HdrSettings {
    pub exposure: f32,
    /// Luminance above which pixels contribute to bloom
    pub bloom_threshold: f32,
    pub bloom_strength: f32,
    /// Adapted luminance before the first frame
    pub initial_luminance: f32,
    pub operator: ToneMapOperator,
    /// Read the measured luminance back every frame to drive adaptation
    pub read_back_luminance: bool,
}

impl Default for HdrSettings {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            bloom_threshold: 1.0,
            bloom_strength: 0.04,
            initial_luminance: 0.5,
            operator: ToneMapOperator::default(),
            read_back_luminance: true,
        }
    }
}

/// Screen-space directional occlusion settings
#[derive(Debug, Clone)]
pub struct SsdoSettings {
    /// Sampling radius in view space
    pub radius: f32,
    pub intensity: f32,
    /// Separable blur of the raw occlusion
    pub blur: bool,
}

impl Default for SsdoSettings {
    fn default() -> Self {
        Self {
            radius: 0.5,
            intensity: 1.0,
            blur: true,
        }
    }
}

/// Subsurface scattering settings
#[derive(Debug, Clone)]
pub struct SubsurfaceSettings {
    pub strength: f32,
    /// Blur footprint in pixels at unit linear depth
    pub blur_width: f32,
}

impl Default for SubsurfaceSettings {
    fn default() -> Self {
        Self {
            strength: 0.5,
            blur_width: 1.0,
        }
    }
}

/// Configuration for the deferred pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Initial presentation resolution
    pub width: u32,
    pub height: u32,
    /// Depth formats to try, in order of preference
    pub depth_formats: Vec<TextureFormat>,
    /// HDR color formats to try, in order of preference
    pub color_formats: Vec<TextureFormat>,
    /// Format of the G-buffer albedo target
    pub albedo_format: TextureFormat,
    /// Edge length of 2D shadow maps and cube shadow faces
    pub shadow_map_size: u32,
    /// 2D shadow maps for sun, directional and spot lights
    pub shadow_map_count: usize,
    /// Cube shadow maps for point lights
    pub point_shadow_count: usize,
    /// Half-size of the box directional shadows cover around the camera
    pub shadow_distance: f32,
    /// Edge length of light-probe cube faces; no probe maps when `None`
    pub probe_map_size: Option<u32>,
    /// Number of cube slices in the probe arrays
    pub probe_capacity: u32,
    pub hdr: HdrSettings,
    pub ssdo: SsdoSettings,
    pub subsurface: SubsurfaceSettings,
    pub hdr_enabled: bool,
    pub ssdo_enabled: bool,
    pub subsurface_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            depth_formats: vec![
                TextureFormat::Depth24PlusStencil8,
                TextureFormat::Depth32FloatStencil8,
                TextureFormat::Depth32Float,
                TextureFormat::Depth16Unorm,
            ],
            color_formats: vec![
                TextureFormat::Rgba16Float,
                TextureFormat::Rgba32Float,
                TextureFormat::Rgba8Unorm,
            ],
            albedo_format: TextureFormat::Rgba8Unorm,
            shadow_map_size: 1024,
            shadow_map_count: 4,
            point_shadow_count: 2,
            shadow_distance: 50.0,
            probe_map_size: Some(128),
            probe_capacity: 4,
            hdr: HdrSettings::default(),
            ssdo: SsdoSettings::default(),
            subsurface: SubsurfaceSettings::default(),
            hdr_enabled: true,
            ssdo_enabled: true,
            subsurface_enabled: true,
        }
    }
}

/// Pick the first candidate the device can render to and sample.
pub fn choose_format(
    device: &dyn GraphicsBackend,
    candidates: &[TextureFormat],
    target: &'static str,
) -> PipelineResult<TextureFormat> {
    let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
    let position = candidates
        .iter()
        .position(|f| device.is_texture_supported(*f, usage))
        .ok_or(PipelineError::UnsupportedFormat { target })?;
    let format = candidates[position];
    if position > 0 {
        log::warn!(
            "Preferred {} format {:?} unsupported, falling back to {:?}",
            target,
            candidates[0],
            format
        );
    } else {
        log::debug!("Using {:?} for {}", format, target);
    }
    Ok(format)
}

/// Device, materials and semantics a pipeline component renders with
pub struct RenderContext<'a> {
    pub device: &'a mut dyn GraphicsBackend,
    pub library: &'a mut MaterialLibrary,
    pub semantics: &'a mut MaterialSemantics,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        device: &'a mut dyn GraphicsBackend,
        library: &'a mut MaterialLibrary,
        semantics: &'a mut MaterialSemantics,
    ) -> Self {
        Self {
            device,
            library,
            semantics,
        }
    }

    /// Draw `pass` with its current parameters. The draw is labelled with the pass name.
    pub fn draw(&mut self, pass: PassHandle, geometry: Geometry<'_>) {
        let library: &MaterialLibrary = self.library;
        let call = library.draw_call(library.pass_name(pass), pass, self.semantics, geometry);
        self.device.draw(&call);
    }

    /// One fullscreen draw into a framebuffer, optionally clearing it first.
    pub fn fullscreen_pass(
        &mut self,
        framebuffer: FramebufferHandle,
        clear: Option<[f32; 4]>,
        pass: PassHandle,
    ) {
        let label = self.library.pass_name(pass).to_string();
        let mut desc = RenderPassDescriptor::load(&label, framebuffer);
        if let Some(color) = clear {
            desc = desc.clear_colors(&[color]);
        }
        self.device.begin_render_pass(&desc);
        self.draw(pass, Geometry::Fullscreen);
        self.device.end_render_pass();
    }

    /// Point a texture parameter at mip 0 of `texture`.
    pub fn bind_texture(&mut self, material: MaterialHandle, name: &str, view: TextureView) {
        if let Some(parameter) = self.library.get_parameter(material, name) {
            self.library.set(parameter, TextureBinding::new(view));
        }
    }
}

/// Per-camera inputs post-process stages may read
pub struct FrameInputs<'a> {
    pub scene: &'a Scene,
    pub camera: &'a Camera,
    pub deferred: &'a DeferredPipeline,
    /// Seconds since the previous frame
    pub dt: f32,
}

/// Memoized pass lookups, so string-keyed resolution happens once per material
#[derive(Default)]
pub struct PassCache {
    passes: HashMap<(MaterialHandle, RenderQueue, &'static str), Option<PassHandle>>,
}

impl PassCache {
    pub fn get(
        &mut self,
        library: &MaterialLibrary,
        material: MaterialHandle,
        queue: RenderQueue,
        pass: &'static str,
    ) -> Option<PassHandle> {
        *self
            .passes
            .entry((material, queue, pass))
            .or_insert_with(|| library.find_pass(material, queue, pass))
    }

    pub fn clear(&mut self) {
        self.passes.clear();
    }
}

/// Write camera matrices and viewport into the semantic registry.
pub fn bind_camera_semantics(
    semantics: &mut MaterialSemantics,
    camera: &Camera,
    width: u32,
    height: u32,
) {
    let m = camera.matrices();
    semantics.set(Semantic::View, m.view);
    semantics.set(Semantic::Projection, m.projection);
    semantics.set(Semantic::ViewProjection, m.view_projection);
    semantics.set(Semantic::InverseView, m.inverse_view);
    semantics.set(Semantic::InverseProjection, m.inverse_projection);
    semantics.set(Semantic::InverseViewProjection, m.inverse_view_projection);
    semantics.set(Semantic::CameraPosition, camera.position().extend(1.0));
    semantics.set(
        Semantic::CameraNearFar,
        Vec2::new(camera.projection().near(), camera.projection().far()),
    );
    semantics.set(Semantic::ViewportSize, Vec2::new(width as f32, height as f32));
}

/// Load ops for a camera's clear flags.
pub fn camera_clear(
    desc: RenderPassDescriptor,
    camera: &Camera,
    color_attachments: usize,
) -> RenderPassDescriptor {
    let color = if camera.clear_flags.contains(ClearFlags::COLOR) {
        LoadOp::Clear(camera.clear_color.to_array())
    } else {
        LoadOp::Load
    };
    let depth = if camera.clear_flags.contains(ClearFlags::DEPTH) {
        LoadOp::Clear(camera.clear_depth)
    } else {
        LoadOp::Load
    };
    let stencil = if camera.clear_flags.contains(ClearFlags::STENCIL) {
        LoadOp::Clear(camera.clear_stencil)
    } else {
        LoadOp::Load
    };
    desc.color_ops(vec![color; color_attachments])
        .depth_op(depth)
        .stencil_op(stencil)
}

/// Full-target viewport of a texture's mip 0.
pub(crate) fn texture_viewport(device: &dyn GraphicsBackend, texture: TextureHandle) -> Viewport {
    device
        .texture_descriptor(texture)
        .map_or(Viewport::full(1, 1), |d| Viewport::full(d.width, d.height))
}

/// RGBA clear value for targets that accumulate.
pub(crate) const TRANSPARENT_BLACK: [f32; 4] = [0.0; 4];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use glam::{Vec3, Vec4};

    #[test]
    fn test_choose_format_prefers_first_supported() {
        let device = HeadlessBackend::new(4, 4).without_format(TextureFormat::Depth24PlusStencil8);
        let config = PipelineConfig::default();
        let format = choose_format(&device, &config.depth_formats, "depth").unwrap();
        assert_eq!(format, TextureFormat::Depth32FloatStencil8);
    }

    #[test]
    fn test_choose_format_fails_when_none_supported() {
        let device = HeadlessBackend::new(4, 4).with_supported_formats(&[TextureFormat::Rgba8Unorm]);
        let result = choose_format(&device, &[TextureFormat::Depth32Float], "depth");
        assert!(matches!(
            result,
            Err(PipelineError::UnsupportedFormat { target: "depth" })
        ));
    }

    #[test]
    fn test_camera_clear_follows_flags() {
        let camera = Camera::new("c", crate::scene::Projection::default())
            .with_clear(ClearFlags::DEPTH, Vec4::ONE);
        let desc = camera_clear(
            RenderPassDescriptor::load("test", FramebufferHandle(0)),
            &camera,
            2,
        );
        assert_eq!(desc.color_load_op(1), LoadOp::Load);
        assert_eq!(desc.depth_load_op, LoadOp::Clear(1.0));
        assert_eq!(desc.stencil_load_op, LoadOp::Load);
    }

    #[test]
    fn test_camera_semantics() {
        let mut semantics = MaterialSemantics::new();
        let camera = Camera::new("c", crate::scene::Projection::default())
            .with_transform(crate::scene::Transform::from_position(Vec3::new(1.0, 2.0, 3.0)));
        bind_camera_semantics(&mut semantics, &camera, 640, 480);
        assert_eq!(
            semantics.get(Semantic::CameraPosition).get_float4(),
            Vec4::new(1.0, 2.0, 3.0, 1.0)
        );
        assert_eq!(
            semantics.get(Semantic::ViewportSize).get_float2(),
            Vec2::new(640.0, 480.0)
        );
    }
}
