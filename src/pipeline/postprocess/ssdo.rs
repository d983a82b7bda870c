//! Screen-space directional occlusion
//!
//! Occlusion is estimated from linear depth and normals with a hemisphere
//! sample kernel, optionally blurred with a depth-aware separable filter,
//! and multiplied into a copy of the source.

use std::any::Any;

use glam::{Vec2, Vec4};

use crate::backend::*;
use crate::error::PipelineResult;
use crate::material::{builtin, MaterialHandle, MaterialLibrary, ParameterHandle, TextureBinding};
use crate::pipeline::targets::*;
use crate::pipeline::{FrameInputs, RenderContext, SsdoSettings};
use crate::scene::RenderQueue;

use super::{gaussian_weights, Blit, PostMaterial, PostProcessStage, PostTarget, ORDER_SSDO};

/// Hemisphere sample kernel around +Z, spread by the golden angle.
///
/// Samples grow quadratically in length so most of them land close to the
/// shaded point. Every sample has `z > 0` and length at most one.
pub fn ssdo_kernel(count: usize) -> Vec<Vec4> {
    let golden_angle = std::f32::consts::PI * (3.0 - 5f32.sqrt());
    (0..count)
        .map(|i| {
            let t = (i as f32 + 0.5) / count as f32;
            let z = 1.0 - t;
            let r = (1.0 - z * z).sqrt();
            let phi = golden_angle * i as f32;
            let scale = 0.1 + 0.9 * t * t;
            Vec4::new(r * phi.cos(), r * phi.sin(), z, 0.0) * scale
        })
        .collect()
}

struct SsdoTargets {
    occlusion: TextureId,
    occlusion_fb: FramebufferId,
    temp: TextureId,
    temp_fb: FramebufferId,
}

struct SsdoMaterials {
    occlusion: PostMaterial,
    radius: ParameterHandle,
    intensity: ParameterHandle,
    blur: PostMaterial,
    blur_source: ParameterHandle,
    blur_direction: ParameterHandle,
    composite: PostMaterial,
    composite_occlusion: ParameterHandle,
}

pub struct SsdoStage {
    settings: SsdoSettings,
    format: TextureFormat,
    targets: RenderTargetSet,
    ids: Option<SsdoTargets>,
    materials: Option<SsdoMaterials>,
    blit: Option<Blit>,
    owned: Vec<MaterialHandle>,
    sample_count: usize,
    blur_radius: usize,
}

impl SsdoStage {
    pub const NAME: &'static str = "ssdo";

    pub fn new(settings: SsdoSettings, format: TextureFormat) -> Self {
        Self {
            settings,
            format,
            targets: RenderTargetSet::new("ssdo"),
            ids: None,
            materials: None,
            blit: None,
            owned: Vec::new(),
            sample_count: 0,
            blur_radius: 0,
        }
    }

    pub fn settings_mut(&mut self) -> &mut SsdoSettings {
        &mut self.settings
    }

    /// Kernel size the occlusion material asked for
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn blur_radius(&self) -> usize {
        self.blur_radius
    }

    /// Occlusion factors of the last frame, blurred when blur is on
    pub fn occlusion_texture(&self) -> Option<TextureHandle> {
        self.ids.as_ref().map(|ids| self.targets.texture(ids.occlusion))
    }

    /// Resolve the materials and size the kernel and blur from the
    /// occlusion material's own constants.
    fn create_materials(&mut self, library: &mut MaterialLibrary) -> PipelineResult<SsdoMaterials> {
        let occlusion = PostMaterial::create(library, builtin::SSDO_OCCLUSION, &mut self.owned)?;
        let blur = PostMaterial::create(library, builtin::SSDO_BLUR, &mut self.owned)?;
        let composite = PostMaterial::create(library, builtin::SSDO_COMPOSITE, &mut self.owned)?;

        let sample_count = library
            .parameter(occlusion.param(library, "sample_count")?)
            .get_int()
            .max(1) as usize;
        let blur_radius = library
            .parameter(occlusion.param(library, "blur_radius")?)
            .get_int()
            .max(0) as usize;

        let kernel = occlusion.param(library, "kernel")?;
        library.set(kernel, &ssdo_kernel(sample_count));
        let weights = blur.param(library, "weights")?;
        library.set(weights, &gaussian_weights(blur_radius, blur_radius as f32 / 2.0));

        self.sample_count = sample_count;
        self.blur_radius = blur_radius;
        log::debug!("SSDO kernel of {} samples, blur radius {}", sample_count, blur_radius);

        Ok(SsdoMaterials {
            radius: occlusion.param(library, "radius")?,
            intensity: occlusion.param(library, "intensity")?,
            blur_source: blur.param(library, "source")?,
            blur_direction: blur.param(library, "direction")?,
            composite_occlusion: composite.param(library, "occlusion")?,
            occlusion,
            blur,
            composite,
        })
    }
}

impl PostProcessStage for SsdoStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> i32 {
        ORDER_SSDO
    }

    fn on_activate(&mut self, ctx: &mut RenderContext<'_>, width: u32, height: u32) -> PipelineResult<()> {
        let mut targets = RenderTargetSet::new("ssdo");
        let occlusion = targets.add_texture(TargetTexture::new("occlusion", self.format));
        let occlusion_fb = targets.add_framebuffer("occlusion", &[Attachment::owned(occlusion)], None);
        let temp = targets.add_texture(TargetTexture::new("blur", self.format));
        let temp_fb = targets.add_framebuffer("blur", &[Attachment::owned(temp)], None);
        self.targets = targets;
        self.targets.create(ctx.device, width, height)?;
        self.ids = Some(SsdoTargets {
            occlusion,
            occlusion_fb,
            temp,
            temp_fb,
        });

        self.materials = Some(self.create_materials(ctx.library)?);
        self.blit = Some(Blit::new(ctx.library)?);
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut RenderContext<'_>) {
        self.targets.destroy(ctx.device);
        self.ids = None;
        self.materials = None;
        if let Some(blit) = self.blit.take() {
            blit.destroy(ctx.library);
        }
        for material in self.owned.drain(..) {
            ctx.library.destroy_material(material);
        }
    }

    fn on_render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        _frame: &FrameInputs<'_>,
        queue: RenderQueue,
        source: TextureHandle,
        dest: &PostTarget,
    ) -> bool {
        if queue != RenderQueue::PostProcess {
            return false;
        }
        let (Some(ids), Some(m), Some(blit)) = (self.ids.as_ref(), self.materials.as_ref(), self.blit.as_ref())
        else {
            return false;
        };
        let targets = &self.targets;
        let occlusion = targets.texture(ids.occlusion);

        ctx.library.set(m.radius, self.settings.radius);
        ctx.library.set(m.intensity, self.settings.intensity);
        ctx.fullscreen_pass(targets.framebuffer(ids.occlusion_fb), None, m.occlusion.pass);

        if self.settings.blur && self.blur_radius > 0 {
            let (width, height) = targets.texture_size(ids.occlusion);
            ctx.library.set(m.blur_source, TextureBinding::new(TextureView::new(occlusion)));
            ctx.library.set(m.blur_direction, Vec2::new(1.0 / width as f32, 0.0));
            ctx.fullscreen_pass(targets.framebuffer(ids.temp_fb), None, m.blur.pass);

            ctx.library.set(m.blur_source, TextureBinding::new(TextureView::new(targets.texture(ids.temp))));
            ctx.library.set(m.blur_direction, Vec2::new(0.0, 1.0 / height as f32));
            ctx.fullscreen_pass(targets.framebuffer(ids.occlusion_fb), None, m.blur.pass);
        }

        blit.draw(ctx, TextureView::new(source), dest.framebuffer, None);
        ctx.library.set(m.composite_occlusion, TextureBinding::new(TextureView::new(occlusion)));
        ctx.fullscreen_pass(dest.framebuffer, None, m.composite.pass);
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
    use crate::material::MaterialSemantics;

    #[test]
    fn test_kernel_in_unit_hemisphere() {
        let kernel = ssdo_kernel(16);
        assert_eq!(kernel.len(), 16);
        for sample in &kernel {
            assert!(sample.z > 0.0);
            assert!(sample.length() <= 1.0 + 1e-5);
        }
        assert!(kernel[0].length() < kernel[15].length());
    }

    #[test]
    fn test_constants_come_from_material() {
        let mut device = HeadlessBackend::new(16, 16);
        let mut library = MaterialLibrary::with_builtin();
        let mut semantics = MaterialSemantics::new();
        let mut ctx = RenderContext::new(&mut device, &mut library, &mut semantics);

        let mut stage = SsdoStage::new(SsdoSettings::default(), TextureFormat::Rgba16Float);
        stage.on_activate(&mut ctx, 16, 16).unwrap();
        assert_eq!(stage.sample_count(), builtin::SSDO_SAMPLE_COUNT as usize);
        assert_eq!(stage.blur_radius(), builtin::SSDO_BLUR_RADIUS as usize);

        let m = stage.materials.as_ref().unwrap();
        let kernel = ctx.library.require_parameter(m.occlusion.material, "kernel").unwrap();
        assert_eq!(ctx.library.parameter(kernel).get_float4_array().len(), 16);
        let weights = ctx.library.require_parameter(m.blur.material, "weights").unwrap();
        assert_eq!(ctx.library.parameter(weights).get_float_array().len(), 5);

        stage.on_deactivate(&mut ctx);
        assert_eq!(ctx.library.live_materials(), 0);
    }
}
