//! Scene-authored effects: drawables whose material has a post-process
//! technique are drawn fullscreen over a copy of the source.

use std::any::Any;

use crate::backend::*;
use crate::error::PipelineResult;
use crate::material::{Semantic, TextureBinding};
use crate::pipeline::{FrameInputs, RenderContext};
use crate::scene::{RenderBucket, RenderQueue};

use super::{Blit, PostProcessStage, PostTarget, ORDER_MATERIAL_EFFECTS};

#[derive(Default)]
pub struct MaterialEffectStage {
    blit: Option<Blit>,
}

impl MaterialEffectStage {
    pub const NAME: &'static str = "material_effects";

    pub fn new() -> Self {
        Self::default()
    }
}

impl PostProcessStage for MaterialEffectStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> i32 {
        ORDER_MATERIAL_EFFECTS
    }

    fn on_activate(&mut self, ctx: &mut RenderContext<'_>, _width: u32, _height: u32) -> PipelineResult<()> {
        self.blit = Some(Blit::new(ctx.library)?);
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut RenderContext<'_>) {
        if let Some(blit) = self.blit.take() {
            blit.destroy(ctx.library);
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
        let data = frame.camera.render_data();
        if queue != RenderQueue::PostProcess || data.is_empty(RenderBucket::PostProcess) {
            return false;
        }
        let Some(blit) = self.blit.as_ref() else {
            return false;
        };

        blit.draw(ctx, TextureView::new(source), dest.framebuffer, None);
        ctx.semantics
            .set(Semantic::PostSource, TextureBinding::new(TextureView::new(source)));
        ctx.device
            .begin_render_pass(&RenderPassDescriptor::load("material_effects", dest.framebuffer));
        for id in data.drawables(RenderBucket::PostProcess) {
            let material = frame.scene.drawable(id).material;
            if let Some(pass) = ctx.library.get_tech(material, queue) {
                ctx.draw(pass, Geometry::Fullscreen);
            }
        }
        ctx.device.end_render_pass();
        ctx.semantics.clear(Semantic::PostSource);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
