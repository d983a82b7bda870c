//! Frame driver
//!
//! Owns the device, the material library and every pipeline component.
//! Each frame the non-internal cameras are processed in [`CameraOrder`]:
//! custom and scene cameras run the full deferred pipeline and post-process
//! chain, overlay cameras draw their transparent queue over the backbuffer.

use std::collections::HashMap;

use crate::backend::*;
use crate::error::{PipelineError, PipelineResult};
use crate::material::{MaterialLibrary, MaterialSemantics};
use crate::scene::{CameraOrder, ProbeId, Scene};

use super::postprocess::{Blit, HdrStage, MaterialEffectStage, PostProcessChain, SsdoStage, SubsurfaceStage};
use super::{
    bind_camera_semantics, DeferredPipeline, FrameInputs, LightProbePipeline, PipelineConfig,
    RenderContext,
};

/// Framebuffer over a texture the pipeline does not own
struct ExternalTarget {
    layout: FramebufferLayoutHandle,
    framebuffer: FramebufferHandle,
    width: u32,
    height: u32,
}

impl ExternalTarget {
    fn wrap(device: &mut dyn GraphicsBackend, texture: TextureHandle, label: &str) -> PipelineResult<Self> {
        let (format, width, height) = device
            .texture_descriptor(texture)
            .map(|d| (d.format, d.width, d.height))
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            })?;
        let layout = device.create_framebuffer_layout(&FramebufferLayoutDescriptor {
            color_formats: vec![format],
            depth_format: None,
        })?;
        let framebuffer = device.create_framebuffer(&FramebufferDescriptor {
            label: Some(label.to_string()),
            layout,
            color_attachments: vec![TextureView::new(texture)],
            depth_attachment: None,
            width,
            height,
        });
        match framebuffer {
            Ok(framebuffer) => Ok(Self {
                layout,
                framebuffer,
                width,
                height,
            }),
            Err(e) => {
                device.destroy_framebuffer_layout(layout);
                Err(e.into())
            }
        }
    }

    fn destroy(self, device: &mut dyn GraphicsBackend) {
        device.destroy_framebuffer(self.framebuffer);
        device.destroy_framebuffer_layout(self.layout);
    }
}

/// Top-level renderer: sets up the pipeline on a device and renders scenes.
pub struct PipelineManager<B: GraphicsBackend> {
    device: B,
    library: MaterialLibrary,
    semantics: MaterialSemantics,
    config: PipelineConfig,
    deferred: DeferredPipeline,
    probes: LightProbePipeline,
    chain: PostProcessChain,
    blit: Option<Blit>,
    present: Option<ExternalTarget>,
    custom_targets: HashMap<TextureHandle, ExternalTarget>,
    resizing: bool,
    frame_count: u64,
}

impl<B: GraphicsBackend> PipelineManager<B> {
    /// Set up every pipeline component on `device` with the built-in materials.
    pub fn new(device: B, config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_library(device, MaterialLibrary::with_builtin(), config)
    }

    /// Like [`new`](Self::new) with a caller-provided material library.
    pub fn with_library(device: B, library: MaterialLibrary, config: PipelineConfig) -> PipelineResult<Self> {
        let mut manager = Self {
            deferred: DeferredPipeline::new(&config),
            device,
            library,
            semantics: MaterialSemantics::new(),
            config,
            probes: LightProbePipeline::new(),
            chain: PostProcessChain::new(),
            blit: None,
            present: None,
            custom_targets: HashMap::new(),
            resizing: false,
            frame_count: 0,
        };
        if let Err(e) = manager.setup() {
            manager.teardown();
            return Err(e);
        }
        Ok(manager)
    }

    fn setup(&mut self) -> PipelineResult<()> {
        log::info!("Setting up pipeline on {} backend", self.device.name());
        let (width, height) = self.device.resolution();
        if (width, height) != (self.config.width, self.config.height) {
            log::debug!(
                "Device resolution {}x{} overrides configured {}x{}",
                width,
                height,
                self.config.width,
                self.config.height
            );
        }

        self.deferred
            .setup(&mut self.device, &mut self.library, self.config.probe_map_size)?;
        self.probes.setup(&self.deferred);

        let format = self.deferred.hdr_format().unwrap_or(TextureFormat::Rgba16Float);
        let config = &self.config;
        self.chain
            .add_stage(Box::new(SsdoStage::new(config.ssdo.clone(), format)), config.ssdo_enabled);
        self.chain.add_stage(
            Box::new(SubsurfaceStage::new(config.subsurface.clone(), format)),
            config.subsurface_enabled,
        );
        self.chain
            .add_stage(Box::new(HdrStage::new(config.hdr.clone(), format)), config.hdr_enabled);
        self.chain.add_stage(Box::new(MaterialEffectStage::new()), true);

        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        self.chain.setup(&mut ctx, format)?;
        self.blit = Some(Blit::new(&mut self.library)?);
        let backbuffer = self.device.backbuffer();
        self.present = Some(ExternalTarget::wrap(&mut self.device, backbuffer, "backbuffer")?);
        Ok(())
    }

    /// Release everything in reverse order of creation. Safe to call twice.
    fn teardown(&mut self) {
        if let Some(present) = self.present.take() {
            present.destroy(&mut self.device);
        }
        for (_, target) in self.custom_targets.drain() {
            target.destroy(&mut self.device);
        }
        if let Some(blit) = self.blit.take() {
            blit.destroy(&mut self.library);
        }
        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        self.chain.teardown(&mut ctx);
        self.probes.teardown(&mut ctx);
        self.deferred.teardown(&mut self.device, &mut self.library);
    }

    /// Whether every component is set up. A resize that cannot recreate its
    /// targets tears the pipeline down and leaves it inactive.
    pub fn is_active(&self) -> bool {
        self.deferred.is_active() && self.chain.is_active() && self.present.is_some()
    }

    /// Render one frame of `scene`. `dt` is the time since the previous frame in seconds.
    ///
    /// Fails with [`PipelineError::Inactive`] once the pipeline has been torn down.
    pub fn render_frame(&mut self, scene: &mut Scene, dt: f32) -> PipelineResult<()> {
        assert!(!self.resizing, "render_frame during resize");
        if !self.is_active() {
            return Err(PipelineError::Inactive);
        }
        self.device.render_begin()?;
        self.probes.begin_frame();

        let mut cameras: Vec<usize> = (0..scene.cameras().len())
            .filter(|&index| !scene.camera(index).order.is_internal())
            .collect();
        cameras.sort_by_key(|&index| scene.camera(index).order);

        let mut result = Ok(());
        for index in cameras {
            let rendered = match scene.camera(index).order {
                CameraOrder::Overlay2D => {
                    self.render_overlay(scene, index);
                    Ok(())
                }
                _ => self.render_camera(scene, index, dt),
            };
            if let Err(e) = rendered {
                log::warn!("Camera '{}' skipped: {}", scene.camera(index).name, e);
                result = Err(e);
            }
        }

        self.device.render_end()?;
        self.frame_count += 1;
        result
    }

    /// Full pipeline for a scene or custom camera.
    fn render_camera(&mut self, scene: &mut Scene, index: usize, dt: f32) -> PipelineResult<()> {
        let (width, height) = match scene.camera(index).render_texture {
            Some(texture) => {
                if !self.custom_targets.contains_key(&texture) {
                    let target = ExternalTarget::wrap(&mut self.device, texture, &scene.camera(index).name)?;
                    self.custom_targets.insert(texture, target);
                }
                let target = &self.custom_targets[&texture];
                (target.width, target.height)
            }
            None => self.device.resolution(),
        };

        scene.camera_mut(index).set_aspect(width, height);
        scene.gather_render_data(index, &self.library);

        let probes: Vec<ProbeId> = scene.camera(index).render_data().probes().collect();
        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        if !probes.is_empty() {
            self.probes.render(&mut ctx, scene, &self.deferred, &probes);
        }
        self.deferred.bind_shadow_slots(scene, index);

        let scene: &Scene = scene;
        let camera = scene.camera(index);
        let shading = self.deferred.render(&mut ctx, scene, camera);
        let frame = FrameInputs {
            scene,
            camera,
            deferred: &self.deferred,
            dt,
        };
        let output = self.chain.render(&mut ctx, &frame, shading);

        let (framebuffer, viewport) = match camera.render_texture {
            Some(texture) => {
                let target = &self.custom_targets[&texture];
                (target.framebuffer, camera.pixel_viewport(target.width, target.height))
            }
            None => match self.present.as_ref() {
                Some(present) => (present.framebuffer, camera.pixel_viewport(width, height)),
                None => return Ok(()),
            },
        };
        if let Some(blit) = self.blit.as_ref() {
            blit.draw(&mut ctx, TextureView::new(output), framebuffer, Some(viewport));
        }
        log::trace!("Camera '{}' presented", camera.name);
        Ok(())
    }

    /// Transparent queue of an overlay camera, straight onto the backbuffer.
    fn render_overlay(&mut self, scene: &mut Scene, index: usize) {
        let Some(framebuffer) = self.present.as_ref().map(|p| p.framebuffer) else {
            return;
        };
        let (width, height) = self.device.resolution();
        scene.camera_mut(index).set_aspect(width, height);
        scene.gather_render_data(index, &self.library);

        let scene: &Scene = scene;
        let camera = scene.camera(index);
        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        bind_camera_semantics(ctx.semantics, camera, width, height);
        ctx.device
            .begin_render_pass(&RenderPassDescriptor::load("overlay", framebuffer));
        ctx.device.set_viewport(camera.pixel_viewport(width, height));
        let drawn = self.deferred.draw_transparent(&mut ctx, scene, camera);
        ctx.device.end_render_pass();
        log::trace!("Overlay '{}' drew {} items", camera.name, drawn);
    }

    /// Change the presentation resolution and recreate every
    /// resolution-dependent target.
    ///
    /// When the device refuses the new size the targets are recreated at the
    /// old one and the device error is returned. When the targets themselves
    /// cannot be recreated the pipeline is torn down and stays inactive.
    ///
    /// # Panics
    ///
    /// When called while a resize is already in progress.
    pub fn resize(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        assert!(!self.resizing, "resize re-entered");
        if !self.is_active() {
            return Err(PipelineError::Inactive);
        }
        if width == 0 || height == 0 {
            log::warn!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if self.device.resolution() == (width, height) {
            return Ok(());
        }
        log::info!("Resizing pipeline to {}x{}", width, height);

        self.device.render_begin()?;
        self.resizing = true;
        let result = self.resize_in_frame(width, height);
        let end = self.device.render_end();
        self.resizing = false;
        result?;
        end?;
        Ok(())
    }

    fn resize_in_frame(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        self.deferred.on_resolution_change_before(&mut self.device);
        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        self.chain.on_resolution_change_before(&mut ctx);
        if let Some(present) = self.present.take() {
            present.destroy(&mut self.device);
        }

        let resized = self.device.resize(width, height);
        if let Err(e) = &resized {
            let (old_width, old_height) = self.device.resolution();
            log::warn!(
                "Device refused {}x{}, restoring targets at {}x{}: {}",
                width,
                height,
                old_width,
                old_height,
                e
            );
        }

        if let Err(e) = self.recreate_targets() {
            log::error!("Resize could not recreate targets, tearing the pipeline down: {}", e);
            self.teardown();
            return Err(e);
        }
        resized.map_err(Into::into)
    }

    /// Second half of a resize, at whatever resolution the device now has.
    fn recreate_targets(&mut self) -> PipelineResult<()> {
        self.deferred.on_resolution_change_after(&mut self.device)?;
        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        self.chain.on_resolution_change_after(&mut ctx)?;
        let backbuffer = self.device.backbuffer();
        self.present = Some(ExternalTarget::wrap(&mut self.device, backbuffer, "backbuffer")?);
        Ok(())
    }

    /// Enable or disable a post-process stage by name.
    pub fn set_stage_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
        self.chain.set_enabled(&mut ctx, name, enabled)
    }

    /// Forget the framebuffer wrapping a custom camera's render texture.
    /// Call before destroying the texture.
    pub fn release_render_texture(&mut self, texture: TextureHandle) {
        if let Some(target) = self.custom_targets.remove(&texture) {
            target.destroy(&mut self.device);
        }
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut B {
        &mut self.device
    }

    pub fn library(&self) -> &MaterialLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut MaterialLibrary {
        &mut self.library
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn deferred(&self) -> &DeferredPipeline {
        &self.deferred
    }

    pub fn probes(&self) -> &LightProbePipeline {
        &self.probes
    }

    pub fn chain(&self) -> &PostProcessChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut PostProcessChain {
        &mut self.chain
    }

    /// Frames rendered so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl<B: GraphicsBackend> Drop for PipelineManager<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
