//! HDR stage: luminance measurement with eye adaptation, a bloom pyramid and
//! tone mapping into the low dynamic range output.
//!
//! Scene luminance is averaged in the log domain, so the measured value is
//! the geometric mean. Adaptation runs on the device: the tone map samples
//! the 1x1 adapted target directly, and read-back only mirrors it on the CPU.

use std::any::Any;

use glam::{Vec2, Vec4};

use crate::backend::program::LOG_EPSILON;
use crate::backend::*;
use crate::error::PipelineResult;
use crate::material::{builtin, MaterialHandle, MaterialLibrary, ParameterHandle, TextureBinding};
use crate::pipeline::targets::*;
use crate::pipeline::{FrameInputs, HdrSettings, RenderContext, TRANSPARENT_BLACK};
use crate::scene::RenderQueue;

use super::{gaussian_weights, PostMaterial, PostProcessStage, PostTarget, ORDER_HDR};

/// Edge length of the luminance measurement target
pub const LUMINANCE_SIZE: u32 = 64;

/// Number of bloom pyramid levels
pub const BLOOM_LEVELS: usize = 5;

/// Contribution of each bloom level, finest first
pub const BLOOM_WEIGHTS: [f32; BLOOM_LEVELS] = [0.3, 0.25, 0.2, 0.15, 0.1];

/// Fraction of the remaining distance to the measured luminance covered in
/// `dt` seconds.
pub fn adaptation_factor(dt: f32) -> f32 {
    if dt <= 0.0 {
        return 0.0;
    }
    (1.0 - 0.98f32.powf(50.0 * dt)).clamp(0.0, 1.0)
}

/// Luminance whose log was averaged into `log_average`.
fn from_log_average(log_average: f32) -> f32 {
    (log_average.exp() - LOG_EPSILON).max(0.0)
}

struct BloomLevel {
    texture: TextureId,
    framebuffer: FramebufferId,
    temp: TextureId,
    temp_fb: FramebufferId,
}

struct HdrTargets {
    luminance: TextureId,
    /// One framebuffer per luminance mip
    luminance_fbs: Vec<FramebufferId>,
    adapted: TextureId,
    adapted_fb: FramebufferId,
    bright: TextureId,
    bright_fb: FramebufferId,
    levels: Vec<BloomLevel>,
    bloom: TextureId,
    bloom_fb: FramebufferId,
}

struct HdrMaterials {
    luminance: PostMaterial,
    luminance_source: ParameterHandle,
    downsample: PostMaterial,
    downsample_source: ParameterHandle,
    adapt: PostMaterial,
    adapt_color: ParameterHandle,
    adapt_measured: ParameterHandle,
    bright: PostMaterial,
    bright_source: ParameterHandle,
    bright_threshold: ParameterHandle,
    blur: PostMaterial,
    blur_source: ParameterHandle,
    blur_direction: ParameterHandle,
    combine: PostMaterial,
    combine_color: ParameterHandle,
    combine_source: ParameterHandle,
    tonemap: PostMaterial,
    tonemap_scene: ParameterHandle,
    tonemap_bloom: ParameterHandle,
    tonemap_exposure: ParameterHandle,
    tonemap_adapted: ParameterHandle,
    tonemap_bloom_strength: ParameterHandle,
    tonemap_operator: ParameterHandle,
}

impl HdrMaterials {
    fn create(library: &mut MaterialLibrary, owned: &mut Vec<MaterialHandle>) -> PipelineResult<Self> {
        let luminance = PostMaterial::create(library, builtin::HDR_LUMINANCE, owned)?;
        let downsample = PostMaterial::create(library, builtin::HDR_DOWNSAMPLE, owned)?;
        let adapt = PostMaterial::create(library, builtin::HDR_ADAPT, owned)?;
        let bright = PostMaterial::create(library, builtin::HDR_BRIGHT_PASS, owned)?;
        let blur = PostMaterial::create(library, builtin::HDR_BLUR, owned)?;
        let combine = PostMaterial::create(library, builtin::HDR_BLOOM_COMBINE, owned)?;
        let tonemap = PostMaterial::create(library, builtin::HDR_TONEMAP, owned)?;

        let weights = gaussian_weights(builtin::BLOOM_BLUR_RADIUS, builtin::BLOOM_BLUR_RADIUS as f32 / 2.0);
        let blur_weights = blur.param(library, "weights")?;
        library.set(blur_weights, &weights);

        Ok(Self {
            luminance_source: luminance.param(library, "source")?,
            downsample_source: downsample.param(library, "source")?,
            adapt_color: adapt.param(library, "color")?,
            adapt_measured: adapt.param(library, "measured")?,
            bright_source: bright.param(library, "source")?,
            bright_threshold: bright.param(library, "threshold")?,
            blur_source: blur.param(library, "source")?,
            blur_direction: blur.param(library, "direction")?,
            combine_color: combine.param(library, "color")?,
            combine_source: combine.param(library, "source")?,
            tonemap_scene: tonemap.param(library, "scene")?,
            tonemap_bloom: tonemap.param(library, "bloom")?,
            tonemap_exposure: tonemap.param(library, "exposure")?,
            tonemap_adapted: tonemap.param(library, "adapted")?,
            tonemap_bloom_strength: tonemap.param(library, "bloom_strength")?,
            tonemap_operator: tonemap.param(library, "operator")?,
            luminance,
            downsample,
            adapt,
            bright,
            blur,
            combine,
            tonemap,
        })
    }
}

/// Tone mapping with eye adaptation and bloom
pub struct HdrStage {
    settings: HdrSettings,
    format: TextureFormat,
    adapted_luminance: f32,
    measured_luminance: Option<f32>,
    /// Seed the adapted target with the initial luminance on the next frame
    reset_adapted: bool,
    targets: RenderTargetSet,
    ids: Option<HdrTargets>,
    materials: Option<HdrMaterials>,
    owned: Vec<MaterialHandle>,
}

impl HdrStage {
    pub const NAME: &'static str = "hdr";

    pub fn new(settings: HdrSettings, format: TextureFormat) -> Self {
        Self {
            adapted_luminance: settings.initial_luminance,
            settings,
            format,
            measured_luminance: None,
            reset_adapted: true,
            targets: RenderTargetSet::new("hdr"),
            ids: None,
            materials: None,
            owned: Vec::new(),
        }
    }

    pub fn settings(&self) -> &HdrSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut HdrSettings {
        &mut self.settings
    }

    /// CPU mirror of the adapted luminance, advanced while read-back is on
    pub fn adapted_luminance(&self) -> f32 {
        self.adapted_luminance
    }

    /// Scene luminance read back in the most recent frame
    pub fn measured_luminance(&self) -> Option<f32> {
        self.measured_luminance
    }

    /// Combined bloom pyramid of the last frame
    pub fn bloom_texture(&self) -> Option<TextureHandle> {
        self.ids.as_ref().map(|ids| self.targets.texture(ids.bloom))
    }

    /// Move the adapted luminance towards `target` over `dt` seconds and
    /// return the new value.
    ///
    /// The distance to `target` shrinks strictly every step until it falls
    /// below floating-point resolution, at which point the value snaps.
    pub fn avg_luminance(&mut self, target: f32, dt: f32) -> f32 {
        let factor = adaptation_factor(dt);
        if factor == 0.0 {
            return self.adapted_luminance;
        }
        let current = self.adapted_luminance;
        let next = current + (target - current) * factor;
        self.adapted_luminance = if next == current || (target - next).abs() >= (target - current).abs() {
            target
        } else {
            next
        };
        self.adapted_luminance
    }

    fn declare_targets(&self) -> (RenderTargetSet, HdrTargets) {
        let mut targets = RenderTargetSet::new("hdr");
        let format = self.format;

        let luminance = targets.add_texture(
            TargetTexture::new("luminance", format)
                .with_size(TargetSize::square(LUMINANCE_SIZE))
                .with_mips(0),
        );
        let mips = TextureDescriptor::full_mip_count(LUMINANCE_SIZE, LUMINANCE_SIZE);
        let luminance_fbs = (0..mips)
            .map(|mip| {
                let attachment = if mip == 0 {
                    Attachment::owned(luminance)
                } else {
                    Attachment::shared(luminance).mip(mip)
                };
                targets.add_framebuffer(&format!("luminance_{mip}"), &[attachment], None)
            })
            .collect();

        let adapted = targets.add_texture(TargetTexture::new("adapted", format).with_size(TargetSize::square(1)));
        let adapted_fb = targets.add_framebuffer("adapted", &[Attachment::owned(adapted)], None);

        let half = TargetSize::Relative { scale: 0.5 };
        let bright = targets.add_texture(TargetTexture::new("bright", format).with_size(half));
        let bright_fb = targets.add_framebuffer("bright", &[Attachment::owned(bright)], None);

        let levels = (0..BLOOM_LEVELS)
            .map(|level| {
                let size = TargetSize::Relative {
                    scale: 0.5f32.powi(level as i32 + 1),
                };
                let texture = targets.add_texture(TargetTexture::new(&format!("bloom_{level}"), format).with_size(size));
                let framebuffer = targets.add_framebuffer(&format!("bloom_{level}"), &[Attachment::owned(texture)], None);
                let temp = targets.add_texture(TargetTexture::new(&format!("bloom_temp_{level}"), format).with_size(size));
                let temp_fb = targets.add_framebuffer(&format!("bloom_temp_{level}"), &[Attachment::owned(temp)], None);
                BloomLevel {
                    texture,
                    framebuffer,
                    temp,
                    temp_fb,
                }
            })
            .collect();

        let bloom = targets.add_texture(TargetTexture::new("bloom", format).with_size(half));
        let bloom_fb = targets.add_framebuffer("bloom", &[Attachment::owned(bloom)], None);

        (
            targets,
            HdrTargets {
                luminance,
                luminance_fbs,
                adapted,
                adapted_fb,
                bright,
                bright_fb,
                levels,
                bloom,
                bloom_fb,
            },
        )
    }

    /// Average the log luminance of the source into a 1x1 mip and blend its
    /// exponent into the adapted target.
    fn measure(&mut self, ctx: &mut RenderContext<'_>, source: TextureHandle, dt: f32) {
        let (Some(ids), Some(m)) = (self.ids.as_ref(), self.materials.as_ref()) else {
            return;
        };
        let targets = &self.targets;
        ctx.library.set(m.luminance_source, TextureBinding::new(TextureView::new(source)));
        ctx.fullscreen_pass(targets.framebuffer(ids.luminance_fbs[0]), None, m.luminance.pass);

        let luminance = targets.texture(ids.luminance);
        for mip in 1..ids.luminance_fbs.len() {
            ctx.library.set(
                m.downsample_source,
                TextureBinding::new(TextureView::mip(luminance, mip as u32 - 1)),
            );
            ctx.fullscreen_pass(targets.framebuffer(ids.luminance_fbs[mip]), None, m.downsample.pass);
        }
        let average = TextureView::mip(luminance, ids.luminance_fbs.len() as u32 - 1);

        let clear = self.reset_adapted.then(|| {
            let l = self.settings.initial_luminance;
            [l, l, l, 1.0]
        });
        self.reset_adapted = false;
        ctx.library.set(m.adapt_color, Vec4::new(1.0, 1.0, 1.0, adaptation_factor(dt)));
        ctx.library.set(m.adapt_measured, TextureBinding::new(average));
        ctx.fullscreen_pass(targets.framebuffer(ids.adapted_fb), clear, m.adapt.pass);

        if !self.settings.read_back_luminance {
            return;
        }
        match ctx.device.read_pixels(average) {
            Ok(pixels) => {
                if let Some(pixel) = pixels.first() {
                    let measured = from_log_average(pixel[0]);
                    self.measured_luminance = Some(measured);
                    self.avg_luminance(measured, dt);
                }
            }
            Err(e) => log::warn!("Luminance read-back failed: {}", e),
        }
    }

    /// Bright pass, blur each pyramid level, then add the levels together.
    fn bloom(&self, ctx: &mut RenderContext<'_>, source: TextureHandle) -> Option<TextureHandle> {
        let ids = self.ids.as_ref()?;
        let m = self.materials.as_ref()?;
        let targets = &self.targets;

        ctx.library.set(m.bright_source, TextureBinding::new(TextureView::new(source)));
        ctx.library.set(m.bright_threshold, self.settings.bloom_threshold);
        ctx.fullscreen_pass(targets.framebuffer(ids.bright_fb), None, m.bright.pass);

        let mut previous = ids.bright;
        for level in &ids.levels {
            let (width, _) = targets.texture_size(previous);
            ctx.library.set(m.blur_source, TextureBinding::new(TextureView::new(targets.texture(previous))));
            ctx.library.set(m.blur_direction, Vec2::new(1.0 / width as f32, 0.0));
            ctx.fullscreen_pass(targets.framebuffer(level.temp_fb), None, m.blur.pass);

            let (_, height) = targets.texture_size(level.temp);
            ctx.library.set(m.blur_source, TextureBinding::new(TextureView::new(targets.texture(level.temp))));
            ctx.library.set(m.blur_direction, Vec2::new(0.0, 1.0 / height as f32));
            ctx.fullscreen_pass(targets.framebuffer(level.framebuffer), None, m.blur.pass);
            previous = level.texture;
        }

        ctx.device.begin_render_pass(
            &RenderPassDescriptor::load("bloom_combine", targets.framebuffer(ids.bloom_fb))
                .clear_colors(&[TRANSPARENT_BLACK]),
        );
        for (level, weight) in ids.levels.iter().zip(BLOOM_WEIGHTS) {
            ctx.library.set(m.combine_color, Vec4::splat(weight));
            ctx.library.set(
                m.combine_source,
                TextureBinding::new(TextureView::new(targets.texture(level.texture))),
            );
            ctx.draw(m.combine.pass, Geometry::Fullscreen);
        }
        ctx.device.end_render_pass();

        Some(targets.texture(ids.bloom))
    }
}

impl PostProcessStage for HdrStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> i32 {
        ORDER_HDR
    }

    fn on_activate(&mut self, ctx: &mut RenderContext<'_>, width: u32, height: u32) -> PipelineResult<()> {
        let (targets, ids) = self.declare_targets();
        self.targets = targets;
        self.targets.create(ctx.device, width, height)?;
        self.ids = Some(ids);
        self.materials = Some(HdrMaterials::create(ctx.library, &mut self.owned)?);
        self.reset_adapted = true;
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut RenderContext<'_>) {
        self.targets.destroy(ctx.device);
        self.ids = None;
        self.materials = None;
        for material in self.owned.drain(..) {
            ctx.library.destroy_material(material);
        }
    }

    fn on_render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        frame: &FrameInputs<'_>,
        queue: RenderQueue,
        source: TextureHandle,
        dest: &PostTarget,
    ) -> bool {
        if queue != RenderQueue::PostProcess {
            return false;
        }
        self.measure(ctx, source, frame.dt);
        let Some(bloom) = self.bloom(ctx, source) else {
            return false;
        };
        let (Some(ids), Some(m)) = (self.ids.as_ref(), self.materials.as_ref()) else {
            return false;
        };

        ctx.library.set(m.tonemap_scene, TextureBinding::new(TextureView::new(source)));
        ctx.library.set(m.tonemap_bloom, TextureBinding::new(TextureView::new(bloom)));
        ctx.library.set(m.tonemap_exposure, self.settings.exposure);
        ctx.library.set(
            m.tonemap_adapted,
            TextureBinding::point(TextureView::new(self.targets.texture(ids.adapted))),
        );
        ctx.library.set(m.tonemap_bloom_strength, self.settings.bloom_strength);
        ctx.library.set(m.tonemap_operator, self.settings.operator as i32);
        ctx.fullscreen_pass(dest.framebuffer, None, m.tonemap.pass);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{MaterialSemantics, MaterialVariant, PassId};

    #[test]
    fn test_adaptation_factor() {
        assert_eq!(adaptation_factor(0.0), 0.0);
        let f = adaptation_factor(1.0 / 60.0);
        assert!(f > 0.0 && f < 1.0);
        assert!((adaptation_factor(0.02) - 0.02).abs() < 1e-6);
        assert!(adaptation_factor(1.0) > adaptation_factor(0.1));
    }

    #[test]
    fn test_avg_luminance_converges() {
        let mut stage = HdrStage::new(HdrSettings::default(), TextureFormat::Rgba16Float);
        let target = 2.0;
        let mut distance = (target - stage.adapted_luminance()).abs();
        for _ in 0..10_000 {
            let value = stage.avg_luminance(target, 1.0 / 60.0);
            let next = (target - value).abs();
            if distance == 0.0 {
                assert_eq!(next, 0.0);
            } else {
                assert!(next < distance);
            }
            distance = next;
        }
        assert_eq!(stage.adapted_luminance(), target);
    }

    #[test]
    fn test_zero_dt_keeps_luminance() {
        let mut stage = HdrStage::new(HdrSettings::default(), TextureFormat::Rgba16Float);
        assert_eq!(stage.avg_luminance(10.0, 0.0), HdrSettings::default().initial_luminance);
    }

    #[test]
    fn test_measured_luminance_is_geometric_mean() {
        let mut device = HeadlessBackend::new(4, 2);
        let source = device
            .create_texture(&TextureDescriptor {
                width: 4,
                height: 2,
                format: TextureFormat::Rgba16Float,
                usage: TextureUsage::render_target(),
                ..Default::default()
            })
            .unwrap();
        let layout = device
            .create_framebuffer_layout(&FramebufferLayoutDescriptor {
                color_formats: vec![TextureFormat::Rgba16Float],
                depth_format: None,
            })
            .unwrap();
        let framebuffer = device
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                layout,
                color_attachments: vec![TextureView::new(source)],
                depth_attachment: None,
                width: 4,
                height: 2,
            })
            .unwrap();

        // Left half at luminance 4, right half at 0.25.
        let state = PassState::fullscreen(None);
        let bright = MaterialVariant::from_value(Vec4::new(4.0, 4.0, 4.0, 1.0));
        device.render_begin().unwrap();
        device.begin_render_pass(
            &RenderPassDescriptor::load("source", framebuffer).clear_colors(&[[0.25, 0.25, 0.25, 1.0]]),
        );
        device.set_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: 2.0,
            height: 2.0,
        });
        device.draw(&DrawCall {
            label: "left",
            pass: PassId(0),
            state: &state,
            parameters: vec![("color", &bright)],
            geometry: Geometry::Fullscreen,
        });
        device.end_render_pass();

        let mut library = MaterialLibrary::with_builtin();
        let mut semantics = MaterialSemantics::new();
        let mut stage = HdrStage::new(HdrSettings::default(), TextureFormat::Rgba16Float);
        {
            let mut ctx = RenderContext::new(&mut device, &mut library, &mut semantics);
            stage.on_activate(&mut ctx, 4, 2).unwrap();
            stage.measure(&mut ctx, source, 1.0 / 60.0);
            stage.on_deactivate(&mut ctx);
        }
        device.render_end().unwrap();

        let measured = stage.measured_luminance().unwrap();
        assert!((measured - 1.0).abs() < 1e-3, "measured {measured}");
    }

    #[test]
    fn test_activate_and_deactivate_release_everything() {
        let mut device = HeadlessBackend::new(32, 32);
        let mut library = MaterialLibrary::with_builtin();
        let mut semantics = MaterialSemantics::new();
        let mut ctx = RenderContext::new(&mut device, &mut library, &mut semantics);

        let mut stage = HdrStage::new(HdrSettings::default(), TextureFormat::Rgba16Float);
        stage.on_activate(&mut ctx, 32, 32).unwrap();
        assert_eq!(stage.ids.as_ref().unwrap().luminance_fbs.len(), 7);
        assert_eq!(ctx.library.live_materials(), 7);
        stage.on_deactivate(&mut ctx);

        assert_eq!(ctx.library.live_materials(), 0);
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.live_framebuffers(), 0);
    }
}
