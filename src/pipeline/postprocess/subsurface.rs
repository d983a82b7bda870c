//! Subsurface scattering approximation: translucency from each
//! shadow-casting subsurface light, followed by a depth-aware blur.
//!
//! Light transmitted through a body falls off with the distance between the
//! shaded point and the first surface the light's shadow map recorded.

use std::any::Any;

use glam::{Mat4, Vec2, Vec4};

use crate::backend::*;
use crate::error::PipelineResult;
use crate::material::{builtin, MaterialHandle, ParameterHandle, TextureBinding};
use crate::pipeline::deferred::bind_light_semantics;
use crate::pipeline::targets::*;
use crate::pipeline::{FrameInputs, RenderContext, SubsurfaceSettings};
use crate::scene::{Light, LightKind, RenderQueue, ShadowBinding};

use super::{gaussian_weights, Blit, PostMaterial, PostProcessStage, PostTarget, ORDER_SUBSURFACE};

struct SubsurfaceMaterials {
    translucency: PostMaterial,
    color: ParameterHandle,
    view_to_light: ParameterHandle,
    blur: PostMaterial,
    blur_source: ParameterHandle,
    blur_direction: ParameterHandle,
    blur_width: ParameterHandle,
}

pub struct SubsurfaceStage {
    settings: SubsurfaceSettings,
    format: TextureFormat,
    targets: RenderTargetSet,
    temp: Option<(TextureId, FramebufferId)>,
    materials: Option<SubsurfaceMaterials>,
    blit: Option<Blit>,
    owned: Vec<MaterialHandle>,
}

impl SubsurfaceStage {
    pub const NAME: &'static str = "subsurface";

    pub fn new(settings: SubsurfaceSettings, format: TextureFormat) -> Self {
        Self {
            settings,
            format,
            targets: RenderTargetSet::new("subsurface"),
            temp: None,
            materials: None,
            blit: None,
            owned: Vec::new(),
        }
    }

    pub fn settings_mut(&mut self) -> &mut SubsurfaceSettings {
        &mut self.settings
    }

    /// Visible lights that scatter and have a 2D shadow map this frame.
    /// Cube shadows carry no single light projection, so point lights never scatter.
    fn scattering_lights<'f>(frame: &FrameInputs<'f>) -> Vec<(&'f Light, TextureView, Mat4)> {
        let data = frame.camera.render_data();
        LightKind::ALL
            .iter()
            .flat_map(|kind| data.lights(*kind))
            .map(|id| frame.scene.light(id))
            .filter(|light| light.subsurface && light.casts_shadow())
            .filter_map(|light| {
                let binding = light.shadow_binding()?;
                let ShadowBinding::Map { view_projection, .. } = binding else {
                    return None;
                };
                let view = frame.deferred.shadow_view(binding)?;
                Some((light, view, view_projection))
            })
            .collect()
    }
}

impl PostProcessStage for SubsurfaceStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> i32 {
        ORDER_SUBSURFACE
    }

    fn on_activate(&mut self, ctx: &mut RenderContext<'_>, width: u32, height: u32) -> PipelineResult<()> {
        let mut targets = RenderTargetSet::new("subsurface");
        let texture = targets.add_texture(TargetTexture::new("blur", self.format));
        let framebuffer = targets.add_framebuffer("blur", &[Attachment::owned(texture)], None);
        self.targets = targets;
        self.targets.create(ctx.device, width, height)?;
        self.temp = Some((texture, framebuffer));

        let library = &mut *ctx.library;
        let translucency = PostMaterial::create(library, builtin::SUBSURFACE_TRANSLUCENCY, &mut self.owned)?;
        let blur = PostMaterial::create(library, builtin::SUBSURFACE_BLUR, &mut self.owned)?;
        let weights = blur.param(library, "weights")?;
        library.set(
            weights,
            &gaussian_weights(builtin::SUBSURFACE_BLUR_RADIUS, builtin::SUBSURFACE_BLUR_RADIUS as f32 / 2.0),
        );
        self.materials = Some(SubsurfaceMaterials {
            color: translucency.param(library, "color")?,
            view_to_light: translucency.param(library, "view_to_light")?,
            blur_source: blur.param(library, "source")?,
            blur_direction: blur.param(library, "direction")?,
            blur_width: blur.param(library, "width")?,
            translucency,
            blur,
        });
        self.blit = Some(Blit::new(library)?);
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut RenderContext<'_>) {
        self.targets.destroy(ctx.device);
        self.temp = None;
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
        frame: &FrameInputs<'_>,
        queue: RenderQueue,
        source: TextureHandle,
        dest: &PostTarget,
    ) -> bool {
        if queue != RenderQueue::PostProcess {
            return false;
        }
        let (Some((temp, temp_fb)), Some(m), Some(blit)) = (self.temp, self.materials.as_ref(), self.blit.as_ref())
        else {
            return false;
        };
        let lights = Self::scattering_lights(frame);
        if lights.is_empty() {
            return false;
        }

        blit.draw(ctx, TextureView::new(source), dest.framebuffer, None);

        let strength = self.settings.strength;
        ctx.library.set(m.color, Vec4::new(strength, strength, strength, 1.0));
        let inverse_view = frame.camera.matrices().inverse_view;
        ctx.device
            .begin_render_pass(&RenderPassDescriptor::load("subsurface_translucency", dest.framebuffer));
        for (light, shadow_map, view_projection) in &lights {
            bind_light_semantics(ctx.semantics, light, Some(*shadow_map));
            ctx.library.set(m.view_to_light, *view_projection * inverse_view);
            ctx.draw(m.translucency.pass, Geometry::Fullscreen);
        }
        ctx.device.end_render_pass();

        ctx.library.set(m.blur_width, self.settings.blur_width);
        ctx.library.set(m.blur_source, TextureBinding::new(TextureView::new(dest.texture)));
        ctx.library.set(m.blur_direction, Vec2::new(1.0 / dest.width as f32, 0.0));
        ctx.fullscreen_pass(self.targets.framebuffer(temp_fb), None, m.blur.pass);

        ctx.library.set(m.blur_source, TextureBinding::new(TextureView::new(self.targets.texture(temp))));
        ctx.library.set(m.blur_direction, Vec2::new(0.0, 1.0 / dest.height as f32));
        ctx.fullscreen_pass(dest.framebuffer, None, m.blur.pass);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
