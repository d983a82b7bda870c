//! Deferred pipeline orchestrator
//!
//! Owns the G-buffer, lighting and shading targets, the shadow-map pool and
//! the light-probe cube arrays, and issues the per-camera passes:
//! shadow maps, G-buffer fill, linear depth, light accumulation, opaque
//! shading, transparent geometry.

use glam::{Mat4, Vec2};

use crate::backend::*;
use crate::error::PipelineResult;
use crate::material::{
    builtin, MaterialHandle, MaterialLibrary, MaterialSemantics, PassHandle, Semantic,
    TextureBinding,
};
use crate::scene::{
    Camera, ClearFlags, Light, LightKind, OpaquePass, RenderBucket, RenderDataManager,
    RenderQueue, Scene, ShadowBinding,
};

use super::targets::*;
use super::{bind_camera_semantics, choose_format, PassCache, PipelineConfig, RenderContext};

/// G-buffer, lighting and shading targets
struct MainTargets {
    depth: TextureId,
    albedo: TextureId,
    normal: TextureId,
    linear_depth: TextureId,
    lighting: TextureId,
    shading: TextureId,
    gbuffer_fb: FramebufferId,
    linear_depth_fb: FramebufferId,
    lighting_fb: FramebufferId,
    shading_fb: FramebufferId,
}

struct ShadowTargets {
    maps: Vec<(TextureId, FramebufferId)>,
    cubes: Vec<(TextureId, [FramebufferId; 6])>,
}

struct ProbeTargets {
    color: TextureId,
    normal: TextureId,
}

struct LightMaterial {
    lit: PassHandle,
    shadowed: Option<PassHandle>,
}

/// Material of each light kind, drawn in [`LightKind::ALL`] order
fn light_material_name(kind: LightKind) -> &'static str {
    match kind {
        LightKind::Sun => builtin::LIGHT_SUN,
        LightKind::Directional => builtin::LIGHT_DIRECTIONAL,
        LightKind::Ambient => builtin::LIGHT_AMBIENT,
        LightKind::Point => builtin::LIGHT_POINT,
        LightKind::Spot => builtin::LIGHT_SPOT,
        LightKind::Environment => builtin::LIGHT_ENVIRONMENT,
    }
}

/// Write a light's parameters into the semantic registry.
pub fn bind_light_semantics(
    semantics: &mut MaterialSemantics,
    light: &Light,
    shadow_map: Option<TextureView>,
) {
    semantics.set(Semantic::LightColor, light.radiance().extend(1.0));
    semantics.set(Semantic::LightDirection, light.direction);
    semantics.set(Semantic::LightPosition, light.position);
    semantics.set(Semantic::LightRange, light.range);
    let (inner, outer) = light.spot_cone();
    semantics.set(Semantic::LightSpotCone, Vec2::new(inner, outer));

    match (light.shadow_binding(), shadow_map) {
        (Some(binding), Some(view)) => {
            let matrix = match binding {
                ShadowBinding::Map {
                    view_projection, ..
                } => view_projection,
                ShadowBinding::Cube { .. } => Mat4::IDENTITY,
            };
            semantics.set(Semantic::ShadowMatrix, matrix);
            semantics.set(Semantic::ShadowMap, TextureBinding::point(view));
        }
        _ => {
            semantics.clear(Semantic::ShadowMatrix);
            semantics.clear(Semantic::ShadowMap);
        }
    }
}

/// Draw every drawable of `bucket` with the named pass of its material.
/// Drawables whose material lacks the pass are skipped.
pub(crate) fn draw_bucket(
    ctx: &mut RenderContext<'_>,
    passes: &mut PassCache,
    scene: &Scene,
    data: &RenderDataManager,
    bucket: RenderBucket,
    pass_name: &'static str,
    view_projection: Mat4,
) -> usize {
    let mut drawn = 0;
    for id in data.drawables(bucket) {
        let drawable = scene.drawable(id);
        let Some(pass) = passes.get(ctx.library, drawable.material, bucket.queue(), pass_name)
        else {
            continue;
        };
        let world = drawable.transform.matrix();
        let transform = view_projection * world;
        ctx.semantics.set(Semantic::World, world);
        ctx.semantics.set(Semantic::WorldViewProjection, transform);
        ctx.draw(
            pass,
            Geometry::Mesh {
                mesh: scene.mesh(drawable.mesh),
                transform,
            },
        );
        drawn += 1;
    }
    drawn
}

/// Per-camera deferred renderer
pub struct DeferredPipeline {
    config: PipelineConfig,
    depth_format: Option<TextureFormat>,
    hdr_format: Option<TextureFormat>,
    main_set: RenderTargetSet,
    shadow_set: RenderTargetSet,
    probe_set: RenderTargetSet,
    main: Option<MainTargets>,
    shadows: Option<ShadowTargets>,
    probes: Option<ProbeTargets>,
    materials: Vec<MaterialHandle>,
    lights: Vec<(LightKind, LightMaterial)>,
    linear_depth: Option<PassHandle>,
    passes: PassCache,
    resizing: bool,
    probe_generation: u64,
}

impl DeferredPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
            depth_format: None,
            hdr_format: None,
            main_set: RenderTargetSet::new("deferred"),
            shadow_set: RenderTargetSet::new("shadows"),
            probe_set: RenderTargetSet::new("probes"),
            main: None,
            shadows: None,
            probes: None,
            materials: Vec::new(),
            lights: Vec::new(),
            linear_depth: None,
            passes: PassCache::default(),
            resizing: false,
            probe_generation: 0,
        }
    }

    /// Choose formats, resolve materials and create every render target.
    ///
    /// On failure nothing created here is kept and the pipeline stays inactive.
    pub fn setup(
        &mut self,
        device: &mut dyn GraphicsBackend,
        library: &mut MaterialLibrary,
        probe_map_size: Option<u32>,
    ) -> PipelineResult<()> {
        assert!(!self.is_active(), "deferred pipeline set up twice");
        match self.try_setup(device, library, probe_map_size) {
            Ok(()) => {
                let (width, height) = device.resolution();
                log::info!(
                    "Deferred pipeline ready at {}x{} (depth {:?}, color {:?})",
                    width,
                    height,
                    self.depth_format,
                    self.hdr_format
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("Deferred pipeline setup failed: {}", e);
                self.teardown(device, library);
                Err(e)
            }
        }
    }

    fn try_setup(
        &mut self,
        device: &mut dyn GraphicsBackend,
        library: &mut MaterialLibrary,
        probe_map_size: Option<u32>,
    ) -> PipelineResult<()> {
        let depth_format = choose_format(device, &self.config.depth_formats, "depth")?;
        let hdr_format = choose_format(device, &self.config.color_formats, "hdr color")?;
        let albedo_format = choose_format(
            device,
            &[self.config.albedo_format, hdr_format],
            "albedo",
        )?;
        self.depth_format = Some(depth_format);
        self.hdr_format = Some(hdr_format);

        for &kind in LightKind::ALL {
            let material = library.create_material(light_material_name(kind))?;
            self.materials.push(material);
            let light = LightMaterial {
                lit: library.require_pass(material, RenderQueue::Lighting, builtin::PASS_LIGHTING)?,
                shadowed: library.find_pass(
                    material,
                    RenderQueue::Lighting,
                    builtin::PASS_LIGHTING_SHADOW,
                ),
            };
            self.lights.push((kind, light));
        }
        let material = library.create_material(builtin::LINEAR_DEPTH)?;
        self.materials.push(material);
        let pass = library.require_pass(material, RenderQueue::Opaque, builtin::PASS_DEPTH_LINEAR)?;
        self.linear_depth = Some(pass);

        self.main_set = RenderTargetSet::new("deferred");
        let set = &mut self.main_set;
        let depth = set.add_texture(TargetTexture::new("depth", depth_format));
        let albedo = set.add_texture(TargetTexture::new("albedo", albedo_format));
        let normal = set.add_texture(TargetTexture::new("normal", hdr_format));
        let linear_depth = set.add_texture(TargetTexture::new("linear_depth", hdr_format));
        let lighting = set.add_texture(TargetTexture::new("lighting", hdr_format));
        let shading = set.add_texture(TargetTexture::new("shading", hdr_format));
        let main = MainTargets {
            gbuffer_fb: set.add_framebuffer(
                "gbuffer",
                &[Attachment::owned(albedo), Attachment::owned(normal)],
                Some(Attachment::owned(depth)),
            ),
            linear_depth_fb: set.add_framebuffer(
                "linear_depth",
                &[Attachment::owned(linear_depth)],
                None,
            ),
            lighting_fb: set.add_framebuffer(
                "lighting",
                &[Attachment::owned(lighting)],
                Some(Attachment::shared(depth)),
            ),
            shading_fb: set.add_framebuffer(
                "shading",
                &[Attachment::owned(shading)],
                Some(Attachment::shared(depth)),
            ),
            depth,
            albedo,
            normal,
            linear_depth,
            lighting,
            shading,
        };

        self.shadow_set = RenderTargetSet::new("shadows");
        let set = &mut self.shadow_set;
        let size = TargetSize::square(self.config.shadow_map_size);
        let maps = (0..self.config.shadow_map_count)
            .map(|i| {
                let texture = set.add_texture(
                    TargetTexture::new(&format!("shadow_map_{i}"), depth_format).with_size(size),
                );
                let framebuffer = set.add_framebuffer(
                    &format!("shadow_map_{i}"),
                    &[],
                    Some(Attachment::owned(texture)),
                );
                (texture, framebuffer)
            })
            .collect();
        let cubes = (0..self.config.point_shadow_count)
            .map(|i| {
                let texture = set.add_texture(
                    TargetTexture::new(&format!("shadow_cube_{i}"), depth_format)
                        .with_size(size)
                        .with_layers(6, TextureDimension::Cube),
                );
                let faces = std::array::from_fn(|face| {
                    let attachment = if face == 0 {
                        Attachment::owned(texture)
                    } else {
                        Attachment::shared(texture).layer(face as u32)
                    };
                    set.add_framebuffer(&format!("shadow_cube_{i}_{face}"), &[], Some(attachment))
                });
                (texture, faces)
            })
            .collect();

        self.probe_set = RenderTargetSet::new("probes");
        let probes = probe_map_size.map(|size| {
            let layers = self.config.probe_capacity.max(1) * 6;
            let spec = |name: &str| {
                TargetTexture::new(name, hdr_format)
                    .with_size(TargetSize::square(size))
                    .with_layers(layers, TextureDimension::CubeArray)
                    .with_usage(TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST | TextureUsage::COPY_SRC)
            };
            ProbeTargets {
                color: self.probe_set.add_texture(spec("probe_color")),
                normal: self.probe_set.add_texture(spec("probe_normal")),
            }
        });
        self.config.probe_map_size = probe_map_size;

        self.main = Some(main);
        self.shadows = Some(ShadowTargets { maps, cubes });
        self.probes = probes;
        self.create_targets(device)
    }

    fn create_targets(&mut self, device: &mut dyn GraphicsBackend) -> PipelineResult<()> {
        let (width, height) = device.resolution();
        self.main_set.create(device, width, height)?;
        self.shadow_set.create(device, width, height)?;
        if self.probes.is_some() {
            self.probe_set.create(device, width, height)?;
        }
        Ok(())
    }

    /// Destroy every target, layout and material. The pipeline becomes inactive.
    pub fn teardown(&mut self, device: &mut dyn GraphicsBackend, library: &mut MaterialLibrary) {
        self.main_set.destroy(device);
        self.shadow_set.destroy(device);
        self.probe_set.destroy(device);
        for material in self.materials.drain(..) {
            library.destroy_material(material);
        }
        self.lights.clear();
        self.linear_depth = None;
        self.passes.clear();
        self.main = None;
        self.shadows = None;
        self.probes = None;
        self.depth_format = None;
        self.hdr_format = None;
    }

    /// Whether setup succeeded and the targets exist.
    pub fn is_active(&self) -> bool {
        self.main.is_some()
    }

    #[track_caller]
    fn main(&self) -> &MainTargets {
        self.main
            .as_ref()
            .unwrap_or_else(|| panic!("deferred pipeline used before setup"))
    }

    /// First half of a resize: drop every texture and framebuffer, keep layouts.
    ///
    /// # Panics
    ///
    /// Outside a `render_begin`/`render_end` bracket, or when a resize is
    /// already in progress.
    pub fn on_resolution_change_before(&mut self, device: &mut dyn GraphicsBackend) {
        assert!(
            device.is_in_frame(),
            "resize must happen inside render_begin/render_end"
        );
        assert!(!self.resizing, "resize sequence re-entered");
        self.resizing = true;
        self.main_set.release(device);
        self.shadow_set.release(device);
        self.probe_set.release(device);
    }

    /// Second half of a resize: recreate everything at the device's new resolution.
    ///
    /// Probe maps come back empty, so [`probe_generation`](Self::probe_generation) advances.
    pub fn on_resolution_change_after(
        &mut self,
        device: &mut dyn GraphicsBackend,
    ) -> PipelineResult<()> {
        assert!(self.resizing, "on_resolution_change_after without before");
        self.resizing = false;
        self.create_targets(device)?;
        self.probe_generation += 1;
        let (width, height) = device.resolution();
        log::info!("Deferred targets recreated at {}x{}", width, height);
        Ok(())
    }

    pub fn is_resizing(&self) -> bool {
        self.resizing
    }

    /// Bumped whenever the probe cube arrays lose their contents.
    pub fn probe_generation(&self) -> u64 {
        self.probe_generation
    }

    /// Assign shadow slots to shadow-casting lights in light order.
    /// Lights beyond the pool's capacity render unshadowed this frame.
    pub fn bind_shadow_slots(&self, scene: &mut Scene, camera_index: usize) {
        let focus = scene.camera(camera_index).position();
        let extent = self.config.shadow_distance;
        let (map_capacity, cube_capacity) = self.shadow_capacity();
        let mut maps = 0;
        let mut cubes = 0;
        for light in scene.lights_mut() {
            light.shadow_binding = None;
            if !light.casts_shadow() {
                continue;
            }
            match light.kind {
                LightKind::Point if cubes < cube_capacity => {
                    light.shadow_binding = Some(ShadowBinding::Cube { slot: cubes });
                    cubes += 1;
                }
                LightKind::Sun | LightKind::Directional | LightKind::Spot if maps < map_capacity => {
                    light.shadow_binding = Some(ShadowBinding::Map {
                        slot: maps,
                        view_projection: light.shadow_view_projection(focus, extent),
                    });
                    maps += 1;
                }
                _ => log::debug!("No shadow slot left for light '{}'", light.name),
            }
        }
    }

    /// Number of 2D and cube shadow maps.
    pub fn shadow_capacity(&self) -> (usize, usize) {
        self.shadows
            .as_ref()
            .map_or((0, 0), |s| (s.maps.len(), s.cubes.len()))
    }

    /// Shadow map texture a binding refers to.
    pub fn shadow_view(&self, binding: ShadowBinding) -> Option<TextureView> {
        let shadows = self.shadows.as_ref()?;
        match binding {
            ShadowBinding::Map { slot, .. } => shadows
                .maps
                .get(slot)
                .map(|(texture, _)| TextureView::new(self.shadow_set.texture(*texture))),
            ShadowBinding::Cube { slot } => shadows
                .cubes
                .get(slot)
                .map(|(texture, _)| TextureView::new(self.shadow_set.texture(*texture))),
        }
    }

    /// Render every bound shadow map from the camera's shadow bucket.
    pub fn render_shadow_maps(&mut self, ctx: &mut RenderContext<'_>, scene: &Scene, camera: &Camera) {
        let Some(shadows) = self.shadows.as_ref() else {
            return;
        };
        let data = camera.render_data();
        for light in scene.lights() {
            let Some(binding) = light.shadow_binding() else {
                continue;
            };
            let faces: Vec<(FramebufferHandle, Mat4)> = match binding {
                ShadowBinding::Map {
                    slot,
                    view_projection,
                } => vec![(self.shadow_set.framebuffer(shadows.maps[slot].1), view_projection)],
                ShadowBinding::Cube { slot } => shadows.cubes[slot]
                    .1
                    .iter()
                    .enumerate()
                    .map(|(face, fb)| {
                        (self.shadow_set.framebuffer(*fb), light.cube_face_view_projection(face))
                    })
                    .collect(),
            };
            for (framebuffer, view_projection) in faces {
                ctx.device.begin_render_pass(
                    &RenderPassDescriptor::load("shadow", framebuffer).clear_depth(1.0),
                );
                ctx.semantics.set(Semantic::ViewProjection, view_projection);
                draw_bucket(
                    ctx,
                    &mut self.passes,
                    scene,
                    data,
                    RenderBucket::Shadow,
                    builtin::PASS_SHADOW,
                    view_projection,
                );
                ctx.device.end_render_pass();
            }
        }
    }

    /// Fill the G-buffer from both opaque buckets.
    pub fn render_opaques(&mut self, ctx: &mut RenderContext<'_>, scene: &Scene, camera: &Camera) {
        let main = self.main();
        let framebuffer = self.main_set.framebuffer(main.gbuffer_fb);
        let (width, height) = self.main_set.framebuffer_size(main.gbuffer_fb);
        let flags = camera.clear_flags;
        let mut desc = RenderPassDescriptor::load("gbuffer", framebuffer)
            .clear_colors(&[super::TRANSPARENT_BLACK, super::TRANSPARENT_BLACK]);
        if flags.contains(ClearFlags::DEPTH) {
            desc = desc.depth_op(LoadOp::Clear(camera.clear_depth));
        }
        if flags.contains(ClearFlags::STENCIL) {
            desc = desc.stencil_op(LoadOp::Clear(camera.clear_stencil));
        }
        ctx.device.begin_render_pass(&desc);
        ctx.device.set_viewport(camera.pixel_viewport(width, height));
        let view_projection = camera.view_projection();
        let data = camera.render_data();
        for pass in [OpaquePass::Batch, OpaquePass::Specific] {
            draw_bucket(
                ctx,
                &mut self.passes,
                scene,
                data,
                RenderBucket::Opaque(pass),
                builtin::PASS_GBUFFER,
                view_projection,
            );
        }
        ctx.device.end_render_pass();
    }

    /// Derive linear view depth from the G-buffer depth.
    pub fn render_opaques_depth_linear(&mut self, ctx: &mut RenderContext<'_>, camera: &Camera) {
        let Some(pass) = self.linear_depth else {
            return;
        };
        let main = self.main();
        let framebuffer = self.main_set.framebuffer(main.linear_depth_fb);
        let (width, height) = self.main_set.framebuffer_size(main.linear_depth_fb);
        ctx.device.begin_render_pass(
            &RenderPassDescriptor::load("depth_linear", framebuffer).clear_colors(&[[1.0; 4]]),
        );
        ctx.device.set_viewport(camera.pixel_viewport(width, height));
        ctx.draw(pass, Geometry::Fullscreen);
        ctx.device.end_render_pass();
    }

    /// Accumulate every visible light into the lighting buffer, one
    /// fullscreen additive pass per light in [`LightKind::ALL`] order.
    pub fn render_lights(&mut self, ctx: &mut RenderContext<'_>, scene: &Scene, camera: &Camera) {
        let main = self.main();
        let framebuffer = self.main_set.framebuffer(main.lighting_fb);
        let (width, height) = self.main_set.framebuffer_size(main.lighting_fb);
        ctx.device.begin_render_pass(
            &RenderPassDescriptor::load("lighting", framebuffer).clear_colors(&[[0.0, 0.0, 0.0, 1.0]]),
        );
        ctx.device.set_viewport(camera.pixel_viewport(width, height));

        let data = camera.render_data();
        for (kind, material) in &self.lights {
            for id in data.lights(*kind) {
                let light = scene.light(id);
                let shadow_map = light.shadow_binding().and_then(|b| self.shadow_view(b));
                bind_light_semantics(ctx.semantics, light, shadow_map);
                if *kind == LightKind::Environment {
                    self.bind_probe(ctx.semantics, scene, light);
                }
                let pass = match (shadow_map, material.shadowed) {
                    (Some(_), Some(shadowed)) => shadowed,
                    _ => material.lit,
                };
                ctx.draw(pass, Geometry::Fullscreen);
            }
        }
        ctx.device.end_render_pass();
    }

    fn bind_probe(&self, semantics: &mut MaterialSemantics, scene: &Scene, light: &Light) {
        let (Some(targets), Some(probe)) = (self.probes.as_ref(), light.probe) else {
            semantics.clear(Semantic::ProbeColor);
            semantics.clear(Semantic::ProbeNormal);
            return;
        };
        let layer = scene.probe(probe).layer(0);
        let color = TextureView::layer(self.probe_set.texture(targets.color), layer);
        let normal = TextureView::layer(self.probe_set.texture(targets.normal), layer);
        semantics.set(Semantic::ProbeColor, TextureBinding::new(color));
        semantics.set(Semantic::ProbeNormal, TextureBinding::new(normal));
    }

    /// Composite the batch opaque bucket with the shared shading pass.
    pub fn render_opaques_shading(
        &mut self,
        ctx: &mut RenderContext<'_>,
        scene: &Scene,
        camera: &Camera,
    ) {
        let main = self.main();
        let framebuffer = self.main_set.framebuffer(main.shading_fb);
        let (width, height) = self.main_set.framebuffer_size(main.shading_fb);
        let mut desc = RenderPassDescriptor::load("shading", framebuffer);
        if camera.clear_flags.contains(ClearFlags::COLOR) {
            desc = desc.clear_colors(&[camera.clear_color.to_array()]);
        }
        ctx.device.begin_render_pass(&desc);
        ctx.device.set_viewport(camera.pixel_viewport(width, height));
        draw_bucket(
            ctx,
            &mut self.passes,
            scene,
            camera.render_data(),
            RenderBucket::Opaque(OpaquePass::Batch),
            builtin::PASS_SHADING,
            camera.view_projection(),
        );
        ctx.device.end_render_pass();
    }

    /// Shade the specific opaque bucket with each material's own pass.
    pub fn render_opaques_specific_shading(
        &mut self,
        ctx: &mut RenderContext<'_>,
        scene: &Scene,
        camera: &Camera,
    ) {
        let data = camera.render_data();
        if data.is_empty(RenderBucket::Opaque(OpaquePass::Specific)) {
            return;
        }
        self.begin_shading_load(ctx, camera, "specific_shading");
        draw_bucket(
            ctx,
            &mut self.passes,
            scene,
            data,
            RenderBucket::Opaque(OpaquePass::Specific),
            builtin::PASS_SPECIFIC_SHADING,
            camera.view_projection(),
        );
        ctx.device.end_render_pass();
    }

    fn begin_shading_load(&self, ctx: &mut RenderContext<'_>, camera: &Camera, label: &str) {
        let main = self.main();
        let framebuffer = self.main_set.framebuffer(main.shading_fb);
        let (width, height) = self.main_set.framebuffer_size(main.shading_fb);
        ctx.device
            .begin_render_pass(&RenderPassDescriptor::load(label, framebuffer));
        ctx.device.set_viewport(camera.pixel_viewport(width, height));
    }

    /// Draw the transparent bucket back to front over the shading buffer.
    /// Each item draws its base pass, then one additive pass per light.
    pub fn render_transparent(&mut self, ctx: &mut RenderContext<'_>, scene: &Scene, camera: &Camera) {
        let data = camera.render_data();
        if data.is_empty(RenderBucket::Transparent) {
            return;
        }
        self.begin_shading_load(ctx, camera, "transparent");
        self.draw_transparent(ctx, scene, camera);
        ctx.device.end_render_pass();
    }

    /// Transparent draws into whatever pass is open.
    pub(crate) fn draw_transparent(
        &mut self,
        ctx: &mut RenderContext<'_>,
        scene: &Scene,
        camera: &Camera,
    ) -> usize {
        let data = camera.render_data();
        let view_projection = camera.view_projection();
        let mut drawn = 0;
        for id in data.drawables(RenderBucket::Transparent) {
            let drawable = scene.drawable(id);
            let material = drawable.material;
            let base = self.passes.get(
                ctx.library,
                material,
                RenderQueue::Transparent,
                builtin::PASS_TRANSPARENT,
            );
            let lit = self.passes.get(
                ctx.library,
                material,
                RenderQueue::Transparent,
                builtin::PASS_TRANSPARENT_LIGHT,
            );
            let world = drawable.transform.matrix();
            let transform = view_projection * world;
            let geometry = Geometry::Mesh {
                mesh: scene.mesh(drawable.mesh),
                transform,
            };
            ctx.semantics.set(Semantic::World, world);
            ctx.semantics.set(Semantic::WorldViewProjection, transform);

            if let Some(pass) = base {
                ctx.draw(pass, geometry);
                drawn += 1;
            }
            let Some(pass) = lit else {
                continue;
            };
            for kind in LightKind::ALL.iter().filter(|k| **k != LightKind::Environment) {
                for light_id in data.lights(*kind) {
                    let light = scene.light(light_id);
                    let shadow_map = light.shadow_binding().and_then(|b| self.shadow_view(b));
                    bind_light_semantics(ctx.semantics, light, shadow_map);
                    ctx.draw(pass, geometry);
                    drawn += 1;
                }
            }
        }
        drawn
    }

    /// Point the global texture semantics at this pipeline's targets.
    pub fn bind_target_semantics(&self, semantics: &mut MaterialSemantics) {
        let main = self.main();
        let view = |id| TextureView::new(self.main_set.texture(id));
        semantics.set(Semantic::GBufferAlbedo, TextureBinding::point(view(main.albedo)));
        semantics.set(Semantic::GBufferNormal, TextureBinding::point(view(main.normal)));
        semantics.set(Semantic::GBufferDepth, TextureBinding::point(view(main.depth)));
        semantics.set(Semantic::LinearDepth, TextureBinding::point(view(main.linear_depth)));
        semantics.set(Semantic::LightingBuffer, TextureBinding::point(view(main.lighting)));
        semantics.set(Semantic::ShadingBuffer, TextureBinding::point(view(main.shading)));
    }

    /// Render one camera and return the shading buffer.
    ///
    /// The camera's render data must have been gathered and shadow slots
    /// bound for this frame.
    pub fn render(&mut self, ctx: &mut RenderContext<'_>, scene: &Scene, camera: &Camera) -> TextureHandle {
        let (width, height) = self.resolution();
        log::debug!("Deferred render of camera '{}' at {}x{}", camera.name, width, height);

        self.render_shadow_maps(ctx, scene, camera);

        self.bind_target_semantics(ctx.semantics);
        bind_camera_semantics(ctx.semantics, camera, width, height);
        self.render_opaques(ctx, scene, camera);
        self.render_opaques_depth_linear(ctx, camera);
        self.render_lights(ctx, scene, camera);
        self.render_opaques_shading(ctx, scene, camera);
        self.render_opaques_specific_shading(ctx, scene, camera);
        self.render_transparent(ctx, scene, camera);
        self.shading_texture()
    }

    /// Size of the main targets.
    pub fn resolution(&self) -> (u32, u32) {
        self.main_set.texture_size(self.main().shading)
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth_format
    }

    pub fn hdr_format(&self) -> Option<TextureFormat> {
        self.hdr_format
    }

    pub fn depth_texture(&self) -> TextureHandle {
        self.main_set.texture(self.main().depth)
    }

    pub fn albedo_texture(&self) -> TextureHandle {
        self.main_set.texture(self.main().albedo)
    }

    pub fn normal_texture(&self) -> TextureHandle {
        self.main_set.texture(self.main().normal)
    }

    pub fn linear_depth_texture(&self) -> TextureHandle {
        self.main_set.texture(self.main().linear_depth)
    }

    pub fn lighting_texture(&self) -> TextureHandle {
        self.main_set.texture(self.main().lighting)
    }

    pub fn shading_texture(&self) -> TextureHandle {
        self.main_set.texture(self.main().shading)
    }

    pub fn shading_framebuffer(&self) -> FramebufferHandle {
        self.main_set.framebuffer(self.main().shading_fb)
    }

    /// Cube-array textures probes are captured into.
    pub fn probe_textures(&self) -> Option<(TextureHandle, TextureHandle)> {
        self.probes.as_ref().map(|p| {
            (
                self.probe_set.texture(p.color),
                self.probe_set.texture(p.normal),
            )
        })
    }

    pub fn probe_map_size(&self) -> Option<u32> {
        self.probes.as_ref().and(self.config.probe_map_size)
    }

    pub fn probe_capacity(&self) -> u32 {
        self.config.probe_capacity
    }

    pub fn main_targets(&self) -> &RenderTargetSet {
        &self.main_set
    }

    pub fn shadow_targets(&self) -> &RenderTargetSet {
        &self.shadow_set
    }

    pub fn probe_targets(&self) -> &RenderTargetSet {
        &self.probe_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Mesh;
    use crate::scene::{Drawable, Projection, ShadowMode, Transform};
    use glam::Vec3;

    fn setup(width: u32, height: u32) -> (HeadlessBackend, MaterialLibrary, DeferredPipeline) {
        let mut device = HeadlessBackend::new(width, height);
        let mut library = MaterialLibrary::with_builtin();
        let config = PipelineConfig {
            shadow_map_size: 16,
            ..Default::default()
        };
        let mut deferred = DeferredPipeline::new(&config);
        deferred.setup(&mut device, &mut library, Some(8)).unwrap();
        (device, library, deferred)
    }

    #[test]
    fn test_setup_creates_shared_depth() {
        let (device, _library, deferred) = setup(32, 24);
        let set = deferred.main_targets();
        let depth = deferred.depth_texture();
        let attached: Vec<_> = set
            .framebuffer_ids()
            .filter_map(|id| device.framebuffer_descriptor(set.framebuffer(id)))
            .filter_map(|d| d.depth_attachment)
            .map(|v| v.texture)
            .collect();
        assert_eq!(attached, vec![depth, depth, depth]);
        assert_eq!(deferred.resolution(), (32, 24));
        assert_eq!(deferred.depth_format(), Some(TextureFormat::Depth24PlusStencil8));
    }

    #[test]
    fn test_setup_fails_without_depth_format() {
        let mut device = HeadlessBackend::new(8, 8).with_supported_formats(&[
            TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba16Float,
        ]);
        let mut library = MaterialLibrary::with_builtin();
        let mut deferred = DeferredPipeline::new(&PipelineConfig::default());
        assert!(deferred.setup(&mut device, &mut library, None).is_err());
        assert!(!deferred.is_active());
        assert_eq!(device.live_textures(), 0);
        assert_eq!(library.live_materials(), 0);
    }

    #[test]
    fn test_failed_texture_creation_leaves_nothing() {
        let mut device = HeadlessBackend::new(8, 8);
        device.fail_texture_creation_after(3);
        let mut library = MaterialLibrary::with_builtin();
        let mut deferred = DeferredPipeline::new(&PipelineConfig::default());
        assert!(deferred.setup(&mut device, &mut library, Some(8)).is_err());
        assert!(!deferred.is_active());
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.live_framebuffers(), 0);
        assert_eq!(device.live_layouts(), 0);
    }

    #[test]
    fn test_shadow_slots_follow_light_order() {
        let (_device, _library, deferred) = setup(8, 8);
        let mut scene = Scene::new();
        scene.add_camera(Camera::new("main", Projection::default()));
        for _ in 0..6 {
            scene.add_light(
                Light::spot(Vec3::Y, -Vec3::Y, Vec3::ONE, 5.0).with_shadow(ShadowMode::Hard),
            );
        }
        scene.add_light(Light::point(Vec3::ZERO, Vec3::ONE, 3.0).with_shadow(ShadowMode::Soft));
        scene.add_light(Light::spot(Vec3::Y, -Vec3::Y, Vec3::ONE, 5.0));
        deferred.bind_shadow_slots(&mut scene, 0);

        let slots: Vec<_> = scene.lights().iter().map(|l| l.shadow_binding()).collect();
        for (i, slot) in slots.iter().take(4).enumerate() {
            assert!(matches!(slot, Some(ShadowBinding::Map { slot, .. }) if *slot == i));
        }
        assert_eq!(slots[4], None);
        assert_eq!(slots[5], None);
        assert_eq!(slots[6], Some(ShadowBinding::Cube { slot: 0 }));
        assert_eq!(slots[7], None);
    }

    #[test]
    fn test_pass_order() {
        let (mut device, mut library, mut deferred) = setup(16, 16);
        let mut semantics = MaterialSemantics::new();
        let mut scene = Scene::new();
        let cube = scene.add_mesh(Mesh::cube());
        let standard = library.create_material(builtin::STANDARD).unwrap();
        let glass = library.create_material(builtin::STANDARD_TRANSPARENT).unwrap();
        scene.add_drawable(Drawable::new("box", cube, standard));
        scene.add_drawable(Drawable::new("glass", cube, glass).with_position(Vec3::X));
        scene.add_light(Light::ambient(Vec3::splat(0.2)));
        scene.add_light(Light::sun(-Vec3::Y, Vec3::ONE).with_shadow(ShadowMode::Hard));
        scene.add_camera(
            Camera::new("main", Projection::perspective(60.0, 1.0, 0.1, 50.0))
                .with_transform(Transform::looking_at(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO, Vec3::Y)),
        );
        scene.gather_render_data(0, &library);
        deferred.bind_shadow_slots(&mut scene, 0);

        device.render_begin().unwrap();
        let mut ctx = RenderContext::new(&mut device, &mut library, &mut semantics);
        deferred.render(&mut ctx, &scene, scene.camera(0));
        device.render_end().unwrap();

        let log = device.take_draw_log();
        assert_eq!(
            log,
            vec![
                "shadow",
                "gbuffer",
                "depth_linear",
                "lighting_shadow",
                "lighting",
                "shading",
                "transparent",
                "transparent_light",
                "transparent_light",
            ]
        );
    }

    #[test]
    fn test_resize_keeps_layouts() {
        let (mut device, _library, mut deferred) = setup(8, 8);
        let layouts = device.live_layouts();
        device.render_begin().unwrap();
        deferred.on_resolution_change_before(&mut device);
        device.resize(20, 10).unwrap();
        deferred.on_resolution_change_after(&mut device).unwrap();
        device.render_end().unwrap();
        assert_eq!(device.live_layouts(), layouts);
        assert_eq!(deferred.resolution(), (20, 10));
        assert_eq!(deferred.probe_generation(), 1);
    }

    #[test]
    #[should_panic(expected = "inside render_begin/render_end")]
    fn test_resize_outside_frame_panics() {
        let (mut device, _library, mut deferred) = setup(8, 8);
        deferred.on_resolution_change_before(&mut device);
    }
}
