//! Post-processing chain
//!
//! Stages run in ascending [`PostProcessStage::order`] between the shading
//! composite and presentation. Each stage reads the current source texture
//! and may write into one of two ping-pong targets; a stage that declines
//! leaves the source to flow on unchanged.

mod hdr;
mod material_effect;
mod ssdo;
mod subsurface;

pub use hdr::{adaptation_factor, HdrStage, BLOOM_LEVELS, BLOOM_WEIGHTS, LUMINANCE_SIZE};
pub use material_effect::MaterialEffectStage;
pub use ssdo::{ssdo_kernel, SsdoStage};
pub use subsurface::SubsurfaceStage;

use std::any::Any;

use crate::backend::*;
use crate::error::PipelineResult;
use crate::material::{builtin, MaterialHandle, MaterialLibrary, ParameterHandle, PassHandle, TextureBinding};
use crate::scene::RenderQueue;

use super::targets::*;
use super::{FrameInputs, RenderContext};

/// Stage ordering slots
pub const ORDER_SSDO: i32 = 100;
pub const ORDER_SUBSURFACE: i32 = 200;
pub const ORDER_HDR: i32 = 300;
pub const ORDER_MATERIAL_EFFECTS: i32 = 400;

/// Output a stage may render into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostTarget {
    pub texture: TextureHandle,
    pub framebuffer: FramebufferHandle,
    pub width: u32,
    pub height: u32,
}

/// A screen-space effect in the post-process chain
pub trait PostProcessStage {
    /// Stage name used for enabling and logging
    fn name(&self) -> &str;

    /// Position in the chain, lower runs first
    fn order(&self) -> i32;

    /// Allocate targets and resolve materials for a `width` by `height` frame.
    ///
    /// When this fails the chain calls [`on_deactivate`](Self::on_deactivate)
    /// to release whatever was created, so it must cope with partial state.
    fn on_activate(
        &mut self,
        ctx: &mut RenderContext<'_>,
        width: u32,
        height: u32,
    ) -> PipelineResult<()>;

    /// Release everything `on_activate` created.
    fn on_deactivate(&mut self, ctx: &mut RenderContext<'_>);

    /// Run the effect for `queue`, reading `source`.
    ///
    /// Returns whether `dest` now holds the stage's output.
    fn on_render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        frame: &FrameInputs<'_>,
        queue: RenderQueue,
        source: TextureHandle,
        dest: &PostTarget,
    ) -> bool;

    /// Allow downcasting
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Normalized one-sided Gaussian weights: `w[0] + 2 * sum(w[1..]) == 1`.
pub fn gaussian_weights(radius: usize, sigma: f32) -> Vec<f32> {
    let sigma = sigma.max(f32::EPSILON);
    let raw: Vec<f32> = (0..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total = raw[0] + 2.0 * raw[1..].iter().sum::<f32>();
    raw.into_iter().map(|w| w / total).collect()
}

/// A single-pass post-process material. The pass shares the material's name.
pub(crate) struct PostMaterial {
    pub material: MaterialHandle,
    pub pass: PassHandle,
}

impl PostMaterial {
    /// Create `name` and record it in `owned` before resolving the pass, so
    /// the caller can release it even when resolution fails.
    pub(crate) fn create(
        library: &mut MaterialLibrary,
        name: &str,
        owned: &mut Vec<MaterialHandle>,
    ) -> PipelineResult<Self> {
        let material = library.create_material(name)?;
        owned.push(material);
        let pass = library.require_pass(material, RenderQueue::PostProcess, name)?;
        Ok(Self { material, pass })
    }

    pub(crate) fn param(&self, library: &MaterialLibrary, name: &str) -> PipelineResult<ParameterHandle> {
        library.require_parameter(self.material, name)
    }
}

/// Fullscreen copy through the built-in blit material
pub struct Blit {
    material: PostMaterial,
    source: ParameterHandle,
}

impl Blit {
    pub fn new(library: &mut MaterialLibrary) -> PipelineResult<Self> {
        let mut owned = Vec::new();
        let created = PostMaterial::create(library, builtin::BLIT, &mut owned)
            .and_then(|material| Ok((material.param(library, "source")?, material)));
        match created {
            Ok((source, material)) => Ok(Self { material, source }),
            Err(e) => {
                for material in owned {
                    library.destroy_material(material);
                }
                Err(e)
            }
        }
    }

    /// Copy `source` into `framebuffer`, restricted to `viewport` when given.
    pub fn draw(
        &self,
        ctx: &mut RenderContext<'_>,
        source: TextureView,
        framebuffer: FramebufferHandle,
        viewport: Option<Viewport>,
    ) {
        ctx.library.set(self.source, TextureBinding::new(source));
        ctx.device
            .begin_render_pass(&RenderPassDescriptor::load("blit", framebuffer));
        if let Some(viewport) = viewport {
            ctx.device.set_viewport(viewport);
        }
        ctx.draw(self.material.pass, Geometry::Fullscreen);
        ctx.device.end_render_pass();
    }

    pub fn destroy(self, library: &mut MaterialLibrary) {
        library.destroy_material(self.material.material);
    }
}

struct StageEntry {
    stage: Box<dyn PostProcessStage>,
    enabled: bool,
    active: bool,
}

/// Ordered list of post-process stages sharing two ping-pong targets
pub struct PostProcessChain {
    stages: Vec<StageEntry>,
    targets: RenderTargetSet,
    ping_pong: Option<[(TextureId, FramebufferId); 2]>,
    size: (u32, u32),
}

impl Default for PostProcessChain {
    fn default() -> Self {
        Self::new()
    }
}

impl PostProcessChain {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            targets: RenderTargetSet::new("postprocess"),
            ping_pong: None,
            size: (0, 0),
        }
    }

    /// Insert a stage by order. Stages with equal order keep insertion order.
    pub fn add_stage(&mut self, stage: Box<dyn PostProcessStage>, enabled: bool) {
        let index = self
            .stages
            .iter()
            .position(|e| e.stage.order() > stage.order())
            .unwrap_or(self.stages.len());
        self.stages.insert(
            index,
            StageEntry {
                stage,
                enabled,
                active: false,
            },
        );
    }

    /// Create the ping-pong targets and activate every enabled stage.
    pub fn setup(&mut self, ctx: &mut RenderContext<'_>, format: TextureFormat) -> PipelineResult<()> {
        assert!(self.ping_pong.is_none(), "post-process chain set up twice");
        let mut targets = RenderTargetSet::new("postprocess");
        let ping_pong = ["ping", "pong"].map(|name| {
            let texture = targets.add_texture(TargetTexture::new(name, format));
            let framebuffer = targets.add_framebuffer(name, &[Attachment::owned(texture)], None);
            (texture, framebuffer)
        });
        let (width, height) = ctx.device.resolution();
        targets.create(ctx.device, width, height)?;
        self.targets = targets;
        self.ping_pong = Some(ping_pong);
        self.size = (width, height);
        self.activate_enabled(ctx);
        Ok(())
    }

    /// Deactivate every stage and destroy the ping-pong targets.
    pub fn teardown(&mut self, ctx: &mut RenderContext<'_>) {
        self.deactivate_all(ctx);
        self.targets.destroy(ctx.device);
        self.ping_pong = None;
    }

    pub fn is_active(&self) -> bool {
        self.ping_pong.is_some()
    }

    fn activate_enabled(&mut self, ctx: &mut RenderContext<'_>) {
        let (width, height) = self.size;
        for entry in &mut self.stages {
            if entry.enabled && !entry.active {
                Self::activate(entry, ctx, width, height);
            }
        }
    }

    fn activate(entry: &mut StageEntry, ctx: &mut RenderContext<'_>, width: u32, height: u32) -> bool {
        match entry.stage.on_activate(ctx, width, height) {
            Ok(()) => {
                log::info!("Activated post-process stage '{}'", entry.stage.name());
                entry.active = true;
            }
            Err(e) => {
                log::warn!(
                    "Post-process stage '{}' failed to activate and is disabled: {}",
                    entry.stage.name(),
                    e
                );
                entry.stage.on_deactivate(ctx);
                entry.enabled = false;
                entry.active = false;
            }
        }
        entry.active
    }

    fn deactivate_all(&mut self, ctx: &mut RenderContext<'_>) {
        for entry in self.stages.iter_mut().filter(|e| e.active) {
            entry.stage.on_deactivate(ctx);
            entry.active = false;
        }
    }

    /// Enable or disable a stage by name. Returns whether the stage ends up
    /// in the requested state; unknown names and failed activations give `false`.
    pub fn set_enabled(&mut self, ctx: &mut RenderContext<'_>, name: &str, enabled: bool) -> bool {
        let (width, height) = self.size;
        let chain_active = self.is_active();
        let Some(entry) = self.stages.iter_mut().find(|e| e.stage.name() == name) else {
            log::warn!("No post-process stage named '{}'", name);
            return false;
        };
        entry.enabled = enabled;
        if enabled && chain_active && !entry.active {
            return Self::activate(entry, ctx, width, height);
        }
        if !enabled && entry.active {
            entry.stage.on_deactivate(ctx);
            entry.active = false;
        }
        true
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.stages
            .iter()
            .any(|e| e.stage.name() == name && e.enabled)
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|e| e.stage.name()).collect()
    }

    pub fn stage<T: PostProcessStage + 'static>(&self) -> Option<&T> {
        self.stages
            .iter()
            .find_map(|e| e.stage.as_any().downcast_ref::<T>())
    }

    pub fn stage_mut<T: PostProcessStage + 'static>(&mut self) -> Option<&mut T> {
        self.stages
            .iter_mut()
            .find_map(|e| e.stage.as_any_mut().downcast_mut::<T>())
    }

    /// First half of a resize: release stage and chain targets.
    pub fn on_resolution_change_before(&mut self, ctx: &mut RenderContext<'_>) {
        for entry in self.stages.iter_mut().filter(|e| e.active) {
            entry.stage.on_deactivate(ctx);
            entry.active = false;
        }
        self.targets.release(ctx.device);
    }

    /// Second half of a resize: recreate at the new resolution and
    /// reactivate the enabled stages.
    pub fn on_resolution_change_after(&mut self, ctx: &mut RenderContext<'_>) -> PipelineResult<()> {
        if self.ping_pong.is_none() {
            return Ok(());
        }
        let (width, height) = ctx.device.resolution();
        self.targets.create(ctx.device, width, height)?;
        self.size = (width, height);
        self.activate_enabled(ctx);
        Ok(())
    }

    fn target(&self, index: usize) -> PostTarget {
        let Some(ping_pong) = self.ping_pong else {
            panic!("post-process chain used before setup");
        };
        let (texture, framebuffer) = ping_pong[index];
        let (width, height) = self.targets.framebuffer_size(framebuffer);
        PostTarget {
            texture: self.targets.texture(texture),
            framebuffer: self.targets.framebuffer(framebuffer),
            width,
            height,
        }
    }

    /// Run every active stage over `source` and return the final image.
    pub fn render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        frame: &FrameInputs<'_>,
        source: TextureHandle,
    ) -> TextureHandle {
        let targets = [self.target(0), self.target(1)];
        let mut current = source;
        for entry in self.stages.iter_mut().filter(|e| e.active) {
            let dest = if targets[0].texture == current {
                &targets[1]
            } else {
                &targets[0]
            };
            if entry
                .stage
                .on_render(ctx, frame, RenderQueue::PostProcess, current, dest)
            {
                log::trace!("Post-process stage '{}' produced output", entry.stage.name());
                current = dest.texture;
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_weights_normalized() {
        for radius in [1, 4, 8] {
            let weights = gaussian_weights(radius, radius as f32 / 2.0);
            assert_eq!(weights.len(), radius + 1);
            let total = weights[0] + 2.0 * weights[1..].iter().sum::<f32>();
            assert!((total - 1.0).abs() < 1e-5);
            assert!(weights.windows(2).all(|w| w[0] > w[1]));
        }
    }

    struct Marker {
        name: &'static str,
        order: i32,
    }

    impl PostProcessStage for Marker {
        fn name(&self) -> &str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn on_activate(&mut self, _: &mut RenderContext<'_>, _: u32, _: u32) -> PipelineResult<()> {
            Ok(())
        }
        fn on_deactivate(&mut self, _: &mut RenderContext<'_>) {}
        fn on_render(
            &mut self,
            _: &mut RenderContext<'_>,
            _: &FrameInputs<'_>,
            _: RenderQueue,
            _: TextureHandle,
            _: &PostTarget,
        ) -> bool {
            false
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_stages_sorted_by_order() {
        let mut chain = PostProcessChain::new();
        chain.add_stage(Box::new(Marker { name: "late", order: 300 }), true);
        chain.add_stage(Box::new(Marker { name: "early", order: 100 }), true);
        chain.add_stage(Box::new(Marker { name: "middle", order: 200 }), false);
        chain.add_stage(Box::new(Marker { name: "middle2", order: 200 }), true);
        assert_eq!(chain.stage_names(), vec!["early", "middle", "middle2", "late"]);
        assert!(!chain.is_enabled("middle"));
        assert!(chain.stage::<Marker>().is_some());
    }
}
