//! Headless CPU reference device
//!
//! Every texture subresource is kept in memory as RGBA `f32`. Draws are
//! rasterized on the CPU with a depth test and the pass's blend state, so
//! the pipeline can be exercised and inspected without a GPU.
//!
//! Fragments are shaded by the CPU kernels of the draw's [`Program`], with
//! inputs sampled nearest. Custom WGSL cannot run here, so draws with a
//! custom shader fall back to `tint × input0`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use glam::{Vec2, Vec3, Vec4};

use super::program::{InputKind, Program, ProgramUniforms};
use super::reference::{self, Fragment, Input, Inputs, Sampled};
use super::traits::*;
use super::types::*;

struct HeadlessTexture {
    desc: TextureDescriptor,
    /// One buffer per subresource, indexed by `layer * mip_levels + mip`.
    subresources: Vec<Vec<[f32; 4]>>,
}

impl HeadlessTexture {
    fn new(desc: &TextureDescriptor) -> Self {
        let empty = desc.format.store([0.0; 4]);
        let subresources = (0..desc.array_layers)
            .flat_map(|_| 0..desc.mip_levels)
            .map(|mip| {
                let (w, h) = desc.mip_size(mip);
                vec![empty; (w * h) as usize]
            })
            .collect();
        Self {
            desc: desc.clone(),
            subresources,
        }
    }

    fn index(&self, view: TextureView) -> Option<usize> {
        (view.layer < self.desc.array_layers && view.mip < self.desc.mip_levels)
            .then(|| (view.layer * self.desc.mip_levels + view.mip) as usize)
    }
}

struct ActivePass {
    framebuffer: FramebufferDescriptor,
    viewport: Viewport,
}

/// Draw and copy statistics
#[derive(Debug, Default, Clone)]
pub struct HeadlessStats {
    pub frames: usize,
    pub passes: usize,
    pub draws: usize,
    pub copies: usize,
}

/// CPU reference implementation of [`GraphicsBackend`]
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    supported: HashSet<TextureFormat>,
    textures: HashMap<u64, HeadlessTexture>,
    layouts: HashMap<u64, FramebufferLayoutDescriptor>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    next_id: u64,
    backbuffer: TextureHandle,
    in_frame: bool,
    pass: Option<ActivePass>,
    stats: HeadlessStats,
    draw_log: Vec<String>,
    layer_copies: HashMap<(TextureHandle, u32), usize>,
    fail_after: Option<usize>,
    fail_resize: bool,
}

impl HeadlessBackend {
    pub const BACKBUFFER_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

    /// Device presenting at `width` by `height` that supports every format.
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            width,
            height,
            supported: TextureFormat::ALL.iter().copied().collect(),
            textures: HashMap::new(),
            layouts: HashMap::new(),
            framebuffers: HashMap::new(),
            next_id: 1,
            backbuffer: TextureHandle(0),
            in_frame: false,
            pass: None,
            stats: HeadlessStats::default(),
            draw_log: Vec::new(),
            layer_copies: HashMap::new(),
            fail_after: None,
            fail_resize: false,
        };
        backend.backbuffer = backend.insert_texture(&Self::backbuffer_descriptor(width, height));
        log::info!("Headless backend initialized ({}x{})", width, height);
        backend
    }

    /// Restrict format support to `formats`.
    pub fn with_supported_formats(mut self, formats: &[TextureFormat]) -> Self {
        self.supported = formats.iter().copied().collect();
        self
    }

    /// Report `format` as unsupported.
    pub fn without_format(mut self, format: TextureFormat) -> Self {
        self.supported.remove(&format);
        self
    }

    /// Let `count` more textures be created, then fail every creation.
    pub fn fail_texture_creation_after(&mut self, count: usize) {
        self.fail_after = Some(count);
    }

    /// Stop injecting texture creation failures.
    pub fn clear_failure(&mut self) {
        self.fail_after = None;
        self.fail_resize = false;
    }

    /// Fail the next backbuffer resize.
    pub fn fail_next_resize(&mut self) {
        self.fail_resize = true;
    }

    pub fn stats(&self) -> &HeadlessStats {
        &self.stats
    }

    pub fn draw_count(&self) -> usize {
        self.stats.draws
    }

    /// Labels of every draw since the last call, in submission order.
    pub fn take_draw_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.draw_log)
    }

    pub fn draw_log(&self) -> &[String] {
        &self.draw_log
    }

    /// Number of copies written into `layer` of `texture`.
    pub fn copy_count(&self, texture: TextureHandle, layer: u32) -> usize {
        self.layer_copies
            .get(&(texture, layer))
            .copied()
            .unwrap_or(0)
    }

    /// Live textures, not counting the backbuffer.
    pub fn live_textures(&self) -> usize {
        self.textures.len() - 1
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_layouts(&self) -> usize {
        self.layouts.len()
    }

    /// Convert one subresource to an 8-bit image.
    pub fn to_image(&mut self, view: TextureView) -> BackendResult<image::RgbaImage> {
        let pixels = self.read_pixels(view)?;
        let desc = self.texture(view.texture)?.desc.clone();
        let (width, height) = desc.mip_size(view.mip);
        let bytes = pixels
            .iter()
            .flat_map(|p| p.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect();
        image::RgbaImage::from_raw(width, height, bytes)
            .ok_or_else(|| BackendError::ExportFailed("pixel buffer size mismatch".into()))
    }

    /// Write one subresource to a PNG file.
    pub fn save_png(&mut self, view: TextureView, path: impl AsRef<Path>) -> BackendResult<()> {
        let image = self.to_image(view)?;
        image
            .save(path.as_ref())
            .map_err(|e| BackendError::ExportFailed(e.to_string()))?;
        log::debug!("Saved {:?} to {}", view.texture, path.as_ref().display());
        Ok(())
    }

    fn backbuffer_descriptor(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor {
            label: Some("backbuffer".into()),
            width,
            height,
            format: Self::BACKBUFFER_FORMAT,
            usage: TextureUsage::render_target(),
            ..Default::default()
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_texture(&mut self, desc: &TextureDescriptor) -> TextureHandle {
        let id = self.allocate_id();
        self.textures.insert(id, HeadlessTexture::new(desc));
        TextureHandle(id)
    }

    fn texture(&self, handle: TextureHandle) -> BackendResult<&HeadlessTexture> {
        self.textures.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: handle.0,
        })
    }

    fn subresource_index(&self, view: TextureView) -> BackendResult<usize> {
        self.texture(view.texture)?
            .index(view)
            .ok_or_else(|| BackendError::InvalidCopy(format!("subresource {view:?} out of range")))
    }

    fn validate_attachment(
        &self,
        view: TextureView,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let texture = self.texture(view.texture)?;
        if texture.desc.format != format {
            return Err(BackendError::LayoutMismatch(format!(
                "{:?} is {:?}, layout expects {:?}",
                view.texture, texture.desc.format, format
            )));
        }
        if texture.index(view).is_none() {
            return Err(BackendError::LayoutMismatch(format!(
                "{view:?} is outside the texture"
            )));
        }
        if texture.desc.mip_size(view.mip) != (width, height) {
            return Err(BackendError::LayoutMismatch(format!(
                "{:?} is {:?}, framebuffer is {}x{}",
                view.texture,
                texture.desc.mip_size(view.mip),
                width,
                height
            )));
        }
        Ok(())
    }

    fn snapshot(&self, view: TextureView) -> Option<Sampled> {
        let texture = self.textures.get(&view.texture.0)?;
        let index = texture.index(view)?;
        let (width, height) = texture.desc.mip_size(view.mip);
        Some(Sampled {
            width,
            height,
            texels: texture.subresources[index].clone(),
        })
    }

    /// Six consecutive layers starting at the view's layer.
    fn snapshot_layers(&self, view: TextureView) -> Option<Vec<Sampled>> {
        (0..6)
            .map(|face| self.snapshot(TextureView { layer: view.layer + face, ..view }))
            .collect()
    }

    /// Copy every texture the program reads, in slot order.
    fn gather_inputs(&self, call: &DrawCall<'_>, program: Program) -> Inputs {
        let slots = program.inputs();
        if slots.is_empty() {
            let first = call.inputs().next().and_then(|view| self.snapshot(view));
            return Inputs(vec![first.map(Input::Flat)]);
        }
        Inputs(
            slots
                .iter()
                .map(|slot| {
                    let view = call.input(slot.name)?;
                    match slot.kind {
                        InputKind::Color | InputKind::Depth => self.snapshot(view).map(Input::Flat),
                        InputKind::ColorLayers | InputKind::DepthLayers => {
                            self.snapshot_layers(view).map(Input::Layers)
                        }
                    }
                })
                .collect(),
        )
    }

    fn clear_view(&mut self, view: TextureView, value: [f32; 4]) {
        if let Some(texture) = self.textures.get_mut(&view.texture.0) {
            if let Some(index) = texture.index(view) {
                let value = texture.desc.format.store(value);
                texture.subresources[index].fill(value);
            }
        }
    }

    /// Depth test and write at one pixel. Returns whether the fragment survives.
    fn depth_test(
        &mut self,
        framebuffer: &FramebufferDescriptor,
        state: &PassState,
        x: u32,
        y: u32,
        depth: f32,
    ) -> bool {
        let (Some(compare), Some(view)) = (state.depth_compare, framebuffer.depth_attachment)
        else {
            return true;
        };
        let Some(texture) = self.textures.get_mut(&view.texture.0) else {
            return true;
        };
        let Some(index) = texture.index(view) else {
            return true;
        };
        let texel = (y * framebuffer.width + x) as usize;
        let stored = texture.subresources[index][texel][0];
        if !compare.passes(depth, stored) {
            return false;
        }
        if state.depth_write {
            texture.subresources[index][texel] = texture.desc.format.store([depth, depth, depth, 1.0]);
        }
        true
    }

    /// Write `colors[0]` to the first attachment and `colors[1]` to the rest.
    fn write_color(
        &mut self,
        framebuffer: &FramebufferDescriptor,
        blend: Option<BlendState>,
        x: u32,
        y: u32,
        colors: [Vec4; 2],
    ) {
        let texel = (y * framebuffer.width + x) as usize;
        for (i, view) in framebuffer.color_attachments.iter().enumerate() {
            let color = colors[i.min(1)].to_array();
            let Some(texture) = self.textures.get_mut(&view.texture.0) else {
                continue;
            };
            let Some(index) = texture.index(*view) else {
                continue;
            };
            let dst = texture.subresources[index][texel];
            let out = match blend {
                Some(blend) => apply_blend(&blend, color, dst),
                None => color,
            };
            texture.subresources[index][texel] = texture.desc.format.store(out);
        }
    }

    /// Pixel bounds of the viewport clipped to the framebuffer.
    fn clip_rect(framebuffer: &FramebufferDescriptor, viewport: &Viewport) -> (u32, u32, u32, u32) {
        let x0 = viewport.x.max(0.0) as u32;
        let y0 = viewport.y.max(0.0) as u32;
        let x1 = ((viewport.x + viewport.width).max(0.0) as u32).min(framebuffer.width);
        let y1 = ((viewport.y + viewport.height).max(0.0) as u32).min(framebuffer.height);
        (x0, y0, x1, y1)
    }

    fn draw_fullscreen(
        &mut self,
        pass: &ActivePass,
        call: &DrawCall<'_>,
        program: Program,
        inputs: &Inputs,
    ) {
        let framebuffer = &pass.framebuffer;
        let size = Vec2::new(framebuffer.width as f32, framebuffer.height as f32);
        let uniforms = ProgramUniforms::gather(call, size, pass.viewport);
        let (x0, y0, x1, y1) = Self::clip_rect(framebuffer, &pass.viewport);
        for y in y0..y1 {
            for x in x0..x1 {
                let fragment = Fragment {
                    position: Vec2::new(x as f32, y as f32) + 0.5,
                    normal: Vec3::Z,
                };
                if let Some(colors) = reference::shade(program, &uniforms, inputs, &fragment) {
                    self.write_color(framebuffer, call.state.blend, x, y, colors);
                }
            }
        }
    }

    fn draw_mesh(
        &mut self,
        pass: &ActivePass,
        call: &DrawCall<'_>,
        program: Program,
        inputs: &Inputs,
        mesh: &crate::resources::Mesh,
        transform: glam::Mat4,
    ) {
        let framebuffer = &pass.framebuffer;
        let viewport = pass.viewport;
        let size = Vec2::new(framebuffer.width as f32, framebuffer.height as f32);
        let uniforms = ProgramUniforms::gather(call, size, viewport);
        let (x0, y0, x1, y1) = Self::clip_rect(framebuffer, &viewport);
        if x0 >= x1 || y0 >= y1 {
            return;
        }

        for triangle in mesh.indices.chunks_exact(3) {
            let vertices: [_; 3] = std::array::from_fn(|i| &mesh.vertices[triangle[i] as usize]);
            let clip: [Vec4; 3] = std::array::from_fn(|i| transform * vertices[i].position.extend(1.0));
            if clip.iter().any(|c| c.w <= 1e-6) {
                continue;
            }
            let ndc = clip.map(|c| c.truncate() / c.w);
            let normals = vertices.map(|v| uniforms.world.transform_vector3(v.normal));

            let ndc_area = (ndc[1].x - ndc[0].x) * (ndc[2].y - ndc[0].y)
                - (ndc[2].x - ndc[0].x) * (ndc[1].y - ndc[0].y);
            let culled = match call.state.cull {
                CullMode::None => ndc_area == 0.0,
                CullMode::Back => ndc_area <= 0.0,
                CullMode::Front => ndc_area >= 0.0,
            };
            if culled {
                continue;
            }

            let screen = ndc.map(|p| {
                Vec2::new(
                    viewport.x + (p.x * 0.5 + 0.5) * viewport.width,
                    viewport.y + (0.5 - p.y * 0.5) * viewport.height,
                )
            });
            let area = edge(screen[0], screen[1], screen[2]);
            if area == 0.0 {
                continue;
            }

            let min = screen[0].min(screen[1]).min(screen[2]);
            let max = screen[0].max(screen[1]).max(screen[2]);
            let bx0 = (min.x.floor().max(x0 as f32)) as u32;
            let by0 = (min.y.floor().max(y0 as f32)) as u32;
            let bx1 = (max.x.ceil().min(x1 as f32)) as u32;
            let by1 = (max.y.ceil().min(y1 as f32)) as u32;

            for y in by0..by1 {
                for x in bx0..bx1 {
                    let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                    let w0 = edge(screen[1], screen[2], p) / area;
                    let w1 = edge(screen[2], screen[0], p) / area;
                    let w2 = edge(screen[0], screen[1], p) / area;
                    if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                        continue;
                    }
                    let depth = w0 * ndc[0].z + w1 * ndc[1].z + w2 * ndc[2].z;
                    if !(0.0..=1.0).contains(&depth) {
                        continue;
                    }
                    let fragment = Fragment {
                        position: p,
                        normal: normals[0] * w0 + normals[1] * w1 + normals[2] * w2,
                    };
                    let Some(colors) = reference::shade(program, &uniforms, inputs, &fragment) else {
                        continue;
                    };
                    if !self.depth_test(framebuffer, call.state, x, y, depth) {
                        continue;
                    }
                    self.write_color(framebuffer, call.state.blend, x, y, colors);
                }
            }
        }
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

fn blend_factor(factor: BlendFactor, src: [f32; 4], dst: [f32; 4], channel: usize) -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::Src => src[channel],
        BlendFactor::OneMinusSrc => 1.0 - src[channel],
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::OneMinusSrcAlpha => 1.0 - src[3],
        BlendFactor::Dst => dst[channel],
        BlendFactor::OneMinusDst => 1.0 - dst[channel],
        BlendFactor::DstAlpha => dst[3],
        BlendFactor::OneMinusDstAlpha => 1.0 - dst[3],
    }
}

fn apply_blend(blend: &BlendState, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    std::array::from_fn(|channel| {
        let component = if channel == 3 { &blend.alpha } else { &blend.color };
        let s = src[channel] * blend_factor(component.src_factor, src, dst, channel);
        let d = dst[channel] * blend_factor(component.dst_factor, src, dst, channel);
        match component.operation {
            BlendOperation::Add => s + d,
            BlendOperation::Subtract => s - d,
            BlendOperation::ReverseSubtract => d - s,
            BlendOperation::Min => src[channel].min(dst[channel]),
            BlendOperation::Max => src[channel].max(dst[channel]),
        }
    })
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "Headless"
    }

    fn render_begin(&mut self) -> BackendResult<()> {
        assert!(!self.in_frame, "render_begin called twice without render_end");
        self.in_frame = true;
        Ok(())
    }

    fn render_end(&mut self) -> BackendResult<()> {
        assert!(self.in_frame, "render_end called without render_begin");
        assert!(self.pass.is_none(), "render_end called inside a render pass");
        self.in_frame = false;
        self.stats.frames += 1;
        Ok(())
    }

    fn is_in_frame(&self) -> bool {
        self.in_frame
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "invalid backbuffer size {width}x{height}"
            )));
        }
        if std::mem::take(&mut self.fail_resize) {
            return Err(BackendError::TextureCreationFailed(
                "backbuffer: injected failure".into(),
            ));
        }
        self.textures.remove(&self.backbuffer.0);
        self.backbuffer = self.insert_texture(&Self::backbuffer_descriptor(width, height));
        self.width = width;
        self.height = height;
        log::debug!("Headless backbuffer resized to {}x{}", width, height);
        Ok(())
    }

    fn backbuffer(&self) -> TextureHandle {
        self.backbuffer
    }

    fn is_texture_supported(&self, format: TextureFormat, _usage: TextureUsage) -> bool {
        self.supported.contains(&format)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if !self.is_texture_supported(desc.format, desc.usage) {
            return Err(BackendError::UnsupportedFormat(desc.format));
        }
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 || desc.mip_levels == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: empty extent {}x{}x{} with {} mips",
                desc.label, desc.width, desc.height, desc.array_layers, desc.mip_levels
            )));
        }
        match self.fail_after {
            Some(0) => {
                return Err(BackendError::TextureCreationFailed(format!(
                    "{:?}: injected failure",
                    desc.label
                )))
            }
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }
        let handle = self.insert_texture(desc);
        log::trace!(
            "Headless: created texture {:?} {:?} ({}x{}x{}, {:?})",
            handle,
            desc.label,
            desc.width,
            desc.height,
            desc.array_layers,
            desc.format
        );
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture == self.backbuffer {
            log::warn!("Ignoring request to destroy the backbuffer");
            return;
        }
        if self.textures.remove(&texture.0).is_none() {
            log::warn!("Destroying unknown texture {:?}", texture);
        }
    }

    fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    fn create_framebuffer_layout(
        &mut self,
        desc: &FramebufferLayoutDescriptor,
    ) -> BackendResult<FramebufferLayoutHandle> {
        if let Some(format) = desc
            .color_formats
            .iter()
            .chain(desc.depth_format.iter())
            .find(|f| !self.supported.contains(f))
        {
            return Err(BackendError::UnsupportedFormat(*format));
        }
        if desc.color_formats.iter().any(TextureFormat::is_depth)
            || desc.depth_format.is_some_and(|f| !f.is_depth())
        {
            return Err(BackendError::LayoutCreationFailed(format!(
                "attachment roles do not match formats: {desc:?}"
            )));
        }
        let id = self.allocate_id();
        self.layouts.insert(id, desc.clone());
        log::trace!("Headless: created layout {} {:?}", id, desc);
        Ok(FramebufferLayoutHandle(id))
    }

    fn destroy_framebuffer_layout(&mut self, layout: FramebufferLayoutHandle) {
        self.layouts.remove(&layout.0);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let layout = self
            .layouts
            .get(&desc.layout.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "framebuffer layout",
                id: desc.layout.0,
            })?;
        if layout.color_formats.len() != desc.color_attachments.len()
            || layout.depth_format.is_some() != desc.depth_attachment.is_some()
        {
            return Err(BackendError::LayoutMismatch(format!(
                "{:?}: attachment count differs from layout",
                desc.label
            )));
        }
        let expected: Vec<_> = desc
            .color_attachments
            .iter()
            .copied()
            .zip(layout.color_formats.iter().copied())
            .chain(desc.depth_attachment.zip(layout.depth_format))
            .collect();
        for (view, format) in expected {
            self.validate_attachment(view, format, desc.width, desc.height)?;
        }

        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        log::trace!("Headless: created framebuffer {} {:?}", id, desc.label);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn framebuffer_descriptor(
        &self,
        framebuffer: FramebufferHandle,
    ) -> Option<&FramebufferDescriptor> {
        self.framebuffers.get(&framebuffer.0)
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        assert!(self.in_frame, "render pass {:?} outside render_begin/render_end", desc.label);
        assert!(self.pass.is_none(), "render pass {:?} started inside another pass", desc.label);
        let framebuffer = self
            .framebuffers
            .get(&desc.framebuffer.0)
            .cloned()
            .unwrap_or_else(|| panic!("render pass {:?} on unknown framebuffer", desc.label));

        for (index, view) in framebuffer.color_attachments.iter().enumerate() {
            if let LoadOp::Clear(color) = desc.color_load_op(index) {
                self.clear_view(*view, color);
            }
        }
        if let (Some(view), LoadOp::Clear(depth)) = (framebuffer.depth_attachment, desc.depth_load_op) {
            self.clear_view(view, [depth, depth, depth, 1.0]);
        }

        self.stats.passes += 1;
        self.pass = Some(ActivePass {
            viewport: Viewport::full(framebuffer.width, framebuffer.height),
            framebuffer,
        });
    }

    fn end_render_pass(&mut self) {
        assert!(self.pass.take().is_some(), "end_render_pass without an active pass");
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        if let Some(pass) = &mut self.pass {
            pass.viewport = viewport;
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        let Some(pass) = self.pass.take() else {
            panic!("draw {:?} outside a render pass", call.label);
        };
        self.stats.draws += 1;
        self.draw_log.push(call.label.to_string());

        let program = call.program();
        let inputs = self.gather_inputs(call, program);
        match call.geometry {
            Geometry::Fullscreen => self.draw_fullscreen(&pass, call, program, &inputs),
            Geometry::Mesh { mesh, transform } => {
                self.draw_mesh(&pass, call, program, &inputs, mesh, transform)
            }
        }
        self.pass = Some(pass);
    }

    fn copy_texture(&mut self, src: TextureView, dst: TextureView) -> BackendResult<()> {
        let src_index = self.subresource_index(src)?;
        let dst_index = self.subresource_index(dst)?;
        let src_size = self.texture(src.texture)?.desc.mip_size(src.mip);
        let dst_size = self.texture(dst.texture)?.desc.mip_size(dst.mip);
        if src_size != dst_size {
            return Err(BackendError::InvalidCopy(format!(
                "size mismatch {src_size:?} -> {dst_size:?}"
            )));
        }

        let texels = self.texture(src.texture)?.subresources[src_index].clone();
        if let Some(texture) = self.textures.get_mut(&dst.texture.0) {
            let format = texture.desc.format;
            texture.subresources[dst_index] = texels.into_iter().map(|t| format.store(t)).collect();
        }
        self.stats.copies += 1;
        *self.layer_copies.entry((dst.texture, dst.layer)).or_insert(0) += 1;
        Ok(())
    }

    fn read_pixels(&mut self, view: TextureView) -> BackendResult<Vec<[f32; 4]>> {
        let index = self
            .texture(view.texture)?
            .index(view)
            .ok_or_else(|| BackendError::ReadbackFailed(format!("{view:?} out of range")))?;
        Ok(self.texture(view.texture)?.subresources[index].clone())
    }
}
