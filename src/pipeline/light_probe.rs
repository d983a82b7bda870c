//! Light-probe capture
//!
//! A dirty probe is rendered six times, once per cube face, into a
//! temporary reflective shadow map (color, normal, depth). After each face
//! the color and normal targets are copied into the probe's slice of the
//! deferred pipeline's cube arrays. The probe is marked clean only after
//! all six faces succeed.

use std::collections::HashSet;

use crate::backend::{RenderPassDescriptor, TextureHandle, TextureView};
use crate::error::PipelineResult;
use crate::material::builtin;
use crate::scene::{OpaquePass, ProbeId, RenderBucket, Scene};

use super::deferred::{draw_bucket, DeferredPipeline};
use super::targets::*;
use super::{bind_camera_semantics, camera_clear, PassCache, RenderContext};

struct Rsm {
    color: TextureId,
    normal: TextureId,
    framebuffer: FramebufferId,
}

/// Captures dirty light probes into cube-map arrays
pub struct LightProbePipeline {
    targets: RenderTargetSet,
    rsm: Option<Rsm>,
    size: u32,
    passes: PassCache,
    generation: u64,
    captured: HashSet<ProbeId>,
}

impl Default for LightProbePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl LightProbePipeline {
    pub fn new() -> Self {
        Self {
            targets: RenderTargetSet::new("probe_rsm"),
            rsm: None,
            size: 0,
            passes: PassCache::default(),
            generation: 0,
            captured: HashSet::new(),
        }
    }

    /// Declare the temporary capture targets. Without probe maps in
    /// `deferred` the sub-pipeline stays inactive and captures nothing.
    pub fn setup(&mut self, deferred: &DeferredPipeline) {
        let (Some(size), Some(depth), Some(color)) = (
            deferred.probe_map_size(),
            deferred.depth_format(),
            deferred.hdr_format(),
        ) else {
            log::debug!("Light probes disabled");
            return;
        };
        let mut targets = RenderTargetSet::new("probe_rsm");
        let size_spec = TargetSize::square(size);
        let color_id = targets.add_texture(TargetTexture::new("color", color).with_size(size_spec));
        let normal = targets.add_texture(TargetTexture::new("normal", color).with_size(size_spec));
        let depth = targets.add_texture(TargetTexture::new("depth", depth).with_size(size_spec));
        let framebuffer = targets.add_framebuffer(
            "capture",
            &[Attachment::owned(color_id), Attachment::owned(normal)],
            Some(Attachment::owned(depth)),
        );
        self.targets = targets;
        self.rsm = Some(Rsm {
            color: color_id,
            normal,
            framebuffer,
        });
        self.size = size;
        self.generation = deferred.probe_generation();
    }

    pub fn is_active(&self) -> bool {
        self.rsm.is_some()
    }

    /// Release the capture layouts.
    pub fn teardown(&mut self, ctx: &mut RenderContext<'_>) {
        self.targets.destroy(ctx.device);
        self.rsm = None;
        self.passes.clear();
    }

    /// Forget which probes were captured in the previous frame.
    pub fn begin_frame(&mut self) {
        self.captured.clear();
    }

    /// Capture every dirty probe in `probes`. Returns how many were captured.
    ///
    /// Clean probes cost nothing. A probe referenced again later in the same
    /// frame is not captured twice.
    pub fn render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        scene: &mut Scene,
        deferred: &DeferredPipeline,
        probes: &[ProbeId],
    ) -> usize {
        let Some((color, normal)) = deferred.probe_textures().filter(|_| self.is_active()) else {
            return 0;
        };
        if deferred.probe_generation() != self.generation {
            log::debug!("Probe maps were recreated, recapturing every probe");
            for index in 0..scene.probes().len() {
                scene.probe_mut(ProbeId(index)).mark_dirty();
            }
            self.generation = deferred.probe_generation();
        }

        let mut captured = 0;
        for &id in probes {
            let probe = scene.probe(id);
            if !probe.need_update() {
                continue;
            }
            if self.captured.contains(&id) {
                log::debug!("Probe '{}' already captured this frame", probe.name);
                continue;
            }
            if probe.slice() >= deferred.probe_capacity() {
                log::warn!(
                    "Probe '{}' uses slice {} beyond capacity {}",
                    probe.name,
                    probe.slice(),
                    deferred.probe_capacity()
                );
                continue;
            }

            self.captured.insert(id);
            match self.capture(ctx, scene, id, color, normal) {
                Ok(()) => {
                    scene.probe_mut(id).mark_clean();
                    captured += 1;
                }
                Err(e) => log::warn!(
                    "Capture of probe '{}' failed, retrying next frame: {}",
                    scene.probe(id).name,
                    e
                ),
            }
        }
        captured
    }

    fn capture(
        &mut self,
        ctx: &mut RenderContext<'_>,
        scene: &mut Scene,
        id: ProbeId,
        color: TextureHandle,
        normal: TextureHandle,
    ) -> PipelineResult<()> {
        log::debug!("Capturing probe '{}'", scene.probe(id).name);
        self.targets.create(ctx.device, self.size, self.size)?;
        let result = (0..6).try_for_each(|face| self.capture_face(ctx, scene, id, face, color, normal));
        self.targets.release(ctx.device);
        result
    }

    fn capture_face(
        &mut self,
        ctx: &mut RenderContext<'_>,
        scene: &mut Scene,
        id: ProbeId,
        face: usize,
        color: TextureHandle,
        normal: TextureHandle,
    ) -> PipelineResult<()> {
        let Some(rsm) = self.rsm.as_ref() else {
            return Ok(());
        };
        let transform = scene.probe(id).face_transform(face);
        scene.probe_mut(id).camera_mut().set_transform(transform);
        scene.gather_probe_render_data(id, ctx.library);

        let scene: &Scene = scene;
        let probe = scene.probe(id);
        let camera = probe.camera();
        bind_camera_semantics(ctx.semantics, camera, self.size, self.size);

        let framebuffer = self.targets.framebuffer(rsm.framebuffer);
        ctx.device.begin_render_pass(&camera_clear(
            RenderPassDescriptor::load("probe_capture", framebuffer),
            camera,
            2,
        ));
        let view_projection = camera.view_projection();
        for pass in [OpaquePass::Batch, OpaquePass::Specific] {
            draw_bucket(
                ctx,
                &mut self.passes,
                scene,
                camera.render_data(),
                RenderBucket::Opaque(pass),
                builtin::PASS_GBUFFER,
                view_projection,
            );
        }
        ctx.device.end_render_pass();

        let layer = probe.layer(face);
        ctx.device.copy_texture(
            TextureView::new(self.targets.texture(rsm.color)),
            TextureView::layer(color, layer),
        )?;
        ctx.device.copy_texture(
            TextureView::new(self.targets.texture(rsm.normal)),
            TextureView::layer(normal, layer),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GraphicsBackend, HeadlessBackend};
    use crate::material::{MaterialLibrary, MaterialSemantics};
    use crate::pipeline::PipelineConfig;
    use crate::resources::Mesh;
    use crate::scene::{Drawable, LightProbe};
    use glam::Vec3;

    struct Fixture {
        device: HeadlessBackend,
        library: MaterialLibrary,
        semantics: MaterialSemantics,
        deferred: DeferredPipeline,
        probes: LightProbePipeline,
        scene: Scene,
    }

    fn fixture() -> Fixture {
        let mut device = HeadlessBackend::new(16, 16);
        let mut library = MaterialLibrary::with_builtin();
        let config = PipelineConfig {
            shadow_map_size: 8,
            probe_capacity: 2,
            ..Default::default()
        };
        let mut deferred = DeferredPipeline::new(&config);
        deferred.setup(&mut device, &mut library, Some(4)).unwrap();
        let mut probes = LightProbePipeline::new();
        probes.setup(&deferred);
        Fixture {
            device,
            library,
            semantics: MaterialSemantics::new(),
            deferred,
            probes,
            scene: Scene::new(),
        }
    }

    impl Fixture {
        fn capture(&mut self, ids: &[ProbeId]) -> usize {
            self.device.render_begin().unwrap();
            self.probes.begin_frame();
            let mut ctx = RenderContext::new(&mut self.device, &mut self.library, &mut self.semantics);
            let count = self.probes.render(&mut ctx, &mut self.scene, &self.deferred, ids);
            self.device.render_end().unwrap();
            count
        }
    }

    #[test]
    fn test_capture_writes_each_face_once() {
        let mut f = fixture();
        let id = f.scene.add_probe(LightProbe::new("probe", Vec3::ZERO, 10.0));
        assert_eq!(f.capture(&[id]), 1);
        assert!(!f.scene.probe(id).need_update());

        let (color, normal) = f.deferred.probe_textures().unwrap();
        for layer in 0..6 {
            assert_eq!(f.device.copy_count(color, layer), 1);
            assert_eq!(f.device.copy_count(normal, layer), 1);
        }
        assert_eq!(f.device.copy_count(color, 6), 0);
    }

    #[test]
    fn test_clean_probe_draws_nothing() {
        let mut f = fixture();
        let cube = f.scene.add_mesh(Mesh::cube());
        let material = f.library.create_material(builtin::STANDARD).unwrap();
        f.scene.add_drawable(Drawable::new("box", cube, material).with_position(Vec3::X * 3.0));
        let id = f.scene.add_probe(LightProbe::new("probe", Vec3::ZERO, 10.0));

        f.capture(&[id]);
        let draws = f.device.draw_count();
        assert!(draws > 0);
        assert_eq!(f.capture(&[id]), 0);
        assert_eq!(f.device.draw_count(), draws);
    }

    #[test]
    fn test_same_probe_captured_once_per_frame() {
        let mut f = fixture();
        let id = f.scene.add_probe(LightProbe::new("probe", Vec3::ZERO, 10.0));
        f.device.render_begin().unwrap();
        f.probes.begin_frame();
        let mut ctx = RenderContext::new(&mut f.device, &mut f.library, &mut f.semantics);
        assert_eq!(f.probes.render(&mut ctx, &mut f.scene, &f.deferred, &[id, id]), 1);
        f.scene.probe_mut(id).mark_dirty();
        assert_eq!(f.probes.render(&mut ctx, &mut f.scene, &f.deferred, &[id]), 0);
        f.device.render_end().unwrap();
    }

    #[test]
    fn test_failed_capture_stays_dirty() {
        let mut f = fixture();
        let id = f.scene.add_probe(LightProbe::new("probe", Vec3::ZERO, 10.0));
        f.device.fail_texture_creation_after(0);
        assert_eq!(f.capture(&[id]), 0);
        assert!(f.scene.probe(id).need_update());

        f.device.clear_failure();
        assert_eq!(f.capture(&[id]), 1);
        assert!(!f.scene.probe(id).need_update());
    }

    #[test]
    fn test_slice_beyond_capacity_is_skipped() {
        let mut f = fixture();
        let ids: Vec<_> = (0..3)
            .map(|i| f.scene.add_probe(LightProbe::new(&format!("p{i}"), Vec3::ZERO, 5.0)))
            .collect();
        assert_eq!(f.capture(&ids), 2);
        assert!(f.scene.probe(ids[2]).need_update());
    }

    #[test]
    fn test_resize_marks_probes_dirty() {
        let mut f = fixture();
        let id = f.scene.add_probe(LightProbe::new("probe", Vec3::ZERO, 10.0));
        f.capture(&[id]);

        f.device.render_begin().unwrap();
        f.deferred.on_resolution_change_before(&mut f.device);
        f.device.resize(32, 32).unwrap();
        f.deferred.on_resolution_change_after(&mut f.device).unwrap();
        f.device.render_end().unwrap();

        assert_eq!(f.capture(&[]), 0);
        assert!(f.scene.probe(id).need_update());
        assert_eq!(f.capture(&[id]), 1);
    }
}
