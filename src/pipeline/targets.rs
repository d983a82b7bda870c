//! Render-target arena
//!
//! A [`RenderTargetSet`] owns a group of textures and the framebuffers built
//! from them. Framebuffers refer to textures by [`TextureId`] only; a texture
//! attached as [`Attachment::owned`] belongs to that framebuffer, and every
//! other framebuffer attaching it must do so as [`Attachment::shared`], which
//! resolves to the same device texture.
//!
//! Layout descriptors are deduplicated by attachment formats and survive
//! [`RenderTargetSet::release`], so a resize recreates textures and
//! framebuffers against unchanged layouts.

use std::collections::HashMap;

use crate::backend::*;
use crate::error::PipelineResult;

/// Index of a texture within a [`RenderTargetSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(usize);

/// Index of a framebuffer within a [`RenderTargetSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(usize);

/// Size of a target, absolute or relative to the presentation resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSize {
    Absolute { width: u32, height: u32 },
    Relative { scale: f32 },
}

impl TargetSize {
    pub const FULL: TargetSize = TargetSize::Relative { scale: 1.0 };

    pub fn square(size: u32) -> Self {
        TargetSize::Absolute {
            width: size,
            height: size,
        }
    }

    pub fn resolve(&self, width: u32, height: u32) -> (u32, u32) {
        match *self {
            TargetSize::Absolute { width, height } => (width.max(1), height.max(1)),
            TargetSize::Relative { scale } => (
                ((width as f32 * scale).round() as u32).max(1),
                ((height as f32 * scale).round() as u32).max(1),
            ),
        }
    }
}

/// Description of a texture the set creates
#[derive(Debug, Clone)]
pub struct TargetTexture {
    pub name: String,
    pub format: TextureFormat,
    pub size: TargetSize,
    pub array_layers: u32,
    /// Mip count; `0` means a full chain down to 1x1.
    pub mip_levels: u32,
    pub dimension: TextureDimension,
    pub usage: TextureUsage,
}

impl TargetTexture {
    /// Full-resolution sampled render target.
    pub fn new(name: &str, format: TextureFormat) -> Self {
        Self {
            name: name.to_string(),
            format,
            size: TargetSize::FULL,
            array_layers: 1,
            mip_levels: 1,
            dimension: TextureDimension::D2,
            usage: TextureUsage::render_target(),
        }
    }

    pub fn with_size(mut self, size: TargetSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_layers(mut self, layers: u32, dimension: TextureDimension) -> Self {
        self.array_layers = layers;
        self.dimension = dimension;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    fn descriptor(&self, width: u32, height: u32) -> TextureDescriptor {
        let (width, height) = self.size.resolve(width, height);
        let mip_levels = if self.mip_levels == 0 {
            TextureDescriptor::full_mip_count(width, height)
        } else {
            self.mip_levels
        };
        TextureDescriptor {
            label: Some(self.name.clone()),
            width,
            height,
            array_layers: self.array_layers,
            mip_levels,
            format: self.format,
            usage: self.usage,
            dimension: self.dimension,
        }
    }
}

/// One subresource attached to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub texture: TextureId,
    pub layer: u32,
    pub mip: u32,
    pub shared: bool,
}

impl Attachment {
    /// Attach a texture this framebuffer owns.
    pub fn owned(texture: TextureId) -> Self {
        Self {
            texture,
            layer: 0,
            mip: 0,
            shared: false,
        }
    }

    /// Alias a texture owned elsewhere.
    pub fn shared(texture: TextureId) -> Self {
        Self {
            shared: true,
            ..Self::owned(texture)
        }
    }

    pub fn layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn mip(mut self, mip: u32) -> Self {
        self.mip = mip;
        self
    }
}

struct TextureEntry {
    spec: TargetTexture,
    owner: Option<FramebufferId>,
    handle: Option<TextureHandle>,
}

struct FramebufferEntry {
    name: String,
    colors: Vec<Attachment>,
    depth: Option<Attachment>,
    layout: FramebufferLayoutDescriptor,
    handle: Option<FramebufferHandle>,
}

/// A named group of textures and framebuffers created and released together
pub struct RenderTargetSet {
    name: String,
    textures: Vec<TextureEntry>,
    framebuffers: Vec<FramebufferEntry>,
    layouts: HashMap<FramebufferLayoutDescriptor, FramebufferLayoutHandle>,
    size: Option<(u32, u32)>,
}

impl RenderTargetSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            textures: Vec::new(),
            framebuffers: Vec::new(),
            layouts: HashMap::new(),
            size: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a texture. It is created by the next [`create`](Self::create).
    pub fn add_texture(&mut self, spec: TargetTexture) -> TextureId {
        self.textures.push(TextureEntry {
            spec,
            owner: None,
            handle: None,
        });
        TextureId(self.textures.len() - 1)
    }

    /// Declare a framebuffer over declared textures.
    ///
    /// # Panics
    ///
    /// When an owned attachment refers to a texture another framebuffer
    /// already owns.
    pub fn add_framebuffer(
        &mut self,
        name: &str,
        colors: &[Attachment],
        depth: Option<Attachment>,
    ) -> FramebufferId {
        assert!(
            !colors.is_empty() || depth.is_some(),
            "framebuffer '{name}' has no attachments"
        );
        let id = FramebufferId(self.framebuffers.len());
        for attachment in colors.iter().chain(depth.iter()) {
            if attachment.shared {
                continue;
            }
            let entry = &mut self.textures[attachment.texture.0];
            assert!(
                entry.owner.is_none(),
                "texture '{}' is already owned by another framebuffer; attach it as shared",
                entry.spec.name
            );
            entry.owner = Some(id);
        }

        let layout = FramebufferLayoutDescriptor {
            color_formats: colors
                .iter()
                .map(|a| self.textures[a.texture.0].spec.format)
                .collect(),
            depth_format: depth.map(|a| self.textures[a.texture.0].spec.format),
        };
        self.framebuffers.push(FramebufferEntry {
            name: name.to_string(),
            colors: colors.to_vec(),
            depth,
            layout,
            handle: None,
        });
        id
    }

    /// Whether device resources currently exist.
    pub fn is_created(&self) -> bool {
        self.size.is_some()
    }

    /// Resolution the set was last created for.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    /// Create every texture and framebuffer for a `width` by `height`
    /// presentation target, creating missing layouts first.
    ///
    /// On failure everything this call created is destroyed again, so the
    /// set is left released.
    pub fn create(
        &mut self,
        device: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> PipelineResult<()> {
        assert!(!self.is_created(), "render target set '{}' created twice", self.name);
        let created_layouts: Vec<_> = self
            .framebuffers
            .iter()
            .map(|fb| fb.layout.clone())
            .filter(|layout| !self.layouts.contains_key(layout))
            .collect();

        self.size = Some((width, height));
        match self.create_resources(device) {
            Ok(()) => {
                log::debug!(
                    "Created render targets '{}' ({} textures, {} framebuffers, {} layouts) at {}x{}",
                    self.name,
                    self.textures.len(),
                    self.framebuffers.len(),
                    self.layouts.len(),
                    width,
                    height
                );
                Ok(())
            }
            Err(e) => {
                self.release(device);
                for layout in created_layouts {
                    if let Some(handle) = self.layouts.remove(&layout) {
                        device.destroy_framebuffer_layout(handle);
                    }
                }
                Err(e)
            }
        }
    }

    fn create_resources(&mut self, device: &mut dyn GraphicsBackend) -> PipelineResult<()> {
        let (width, height) = self.size.unwrap_or((1, 1));
        for framebuffer in &self.framebuffers {
            if !self.layouts.contains_key(&framebuffer.layout) {
                let handle = device.create_framebuffer_layout(&framebuffer.layout)?;
                self.layouts.insert(framebuffer.layout.clone(), handle);
            }
        }

        for texture in &mut self.textures {
            let desc = texture.spec.descriptor(width, height);
            texture.handle = Some(device.create_texture(&desc)?);
        }

        for index in 0..self.framebuffers.len() {
            let desc = self.framebuffer_descriptor(FramebufferId(index));
            let handle = device.create_framebuffer(&desc)?;
            self.framebuffers[index].handle = Some(handle);
        }
        Ok(())
    }

    fn view(&self, attachment: &Attachment) -> TextureView {
        TextureView {
            texture: self.texture(attachment.texture),
            layer: attachment.layer,
            mip: attachment.mip,
        }
    }

    fn framebuffer_descriptor(&self, id: FramebufferId) -> FramebufferDescriptor {
        let entry = &self.framebuffers[id.0];
        let (width, height) = self.framebuffer_size(id);
        FramebufferDescriptor {
            label: Some(format!("{}/{}", self.name, entry.name)),
            layout: self.layouts[&entry.layout],
            color_attachments: entry.colors.iter().map(|a| self.view(a)).collect(),
            depth_attachment: entry.depth.as_ref().map(|a| self.view(a)),
            width,
            height,
        }
    }

    fn attachment_size(&self, attachment: &Attachment) -> (u32, u32) {
        let (width, height) = self.texture_size(attachment.texture);
        (
            (width >> attachment.mip).max(1),
            (height >> attachment.mip).max(1),
        )
    }

    fn destroy_resources(&mut self, device: &mut dyn GraphicsBackend) {
        for framebuffer in &mut self.framebuffers {
            if let Some(handle) = framebuffer.handle.take() {
                device.destroy_framebuffer(handle);
            }
        }
        for texture in &mut self.textures {
            if let Some(handle) = texture.handle.take() {
                device.destroy_texture(handle);
            }
        }
    }

    /// Destroy textures and framebuffers, keeping layouts.
    pub fn release(&mut self, device: &mut dyn GraphicsBackend) {
        self.destroy_resources(device);
        self.size = None;
    }

    /// Destroy everything including layouts.
    pub fn destroy(&mut self, device: &mut dyn GraphicsBackend) {
        self.release(device);
        for (_, handle) in self.layouts.drain() {
            device.destroy_framebuffer_layout(handle);
        }
    }

    /// Device texture of `id`.
    ///
    /// # Panics
    ///
    /// When the set has not been created.
    #[track_caller]
    pub fn texture(&self, id: TextureId) -> TextureHandle {
        let entry = &self.textures[id.0];
        entry.handle.unwrap_or_else(|| {
            panic!(
                "render target '{}/{}' used before setup",
                self.name, entry.spec.name
            )
        })
    }

    /// Device framebuffer of `id`.
    ///
    /// # Panics
    ///
    /// When the set has not been created.
    #[track_caller]
    pub fn framebuffer(&self, id: FramebufferId) -> FramebufferHandle {
        let entry = &self.framebuffers[id.0];
        entry.handle.unwrap_or_else(|| {
            panic!(
                "framebuffer '{}/{}' used before setup",
                self.name, entry.name
            )
        })
    }

    /// Layout a framebuffer was built against, once created.
    pub fn layout(&self, id: FramebufferId) -> Option<FramebufferLayoutHandle> {
        self.layouts.get(&self.framebuffers[id.0].layout).copied()
    }

    pub fn layout_count(&self) -> usize {
        self.layouts.len()
    }

    /// Size of mip 0 of a texture at the current resolution.
    pub fn texture_size(&self, id: TextureId) -> (u32, u32) {
        let (width, height) = self.size.unwrap_or((1, 1));
        self.textures[id.0].spec.size.resolve(width, height)
    }

    /// Pixel size of a framebuffer at the current resolution.
    pub fn framebuffer_size(&self, id: FramebufferId) -> (u32, u32) {
        let entry = &self.framebuffers[id.0];
        entry
            .colors
            .first()
            .or(entry.depth.as_ref())
            .map_or((1, 1), |a| self.attachment_size(a))
    }

    /// Framebuffer that owns a texture, if any.
    pub fn owner(&self, id: TextureId) -> Option<FramebufferId> {
        self.textures[id.0].owner
    }

    pub fn framebuffer_ids(&self) -> impl Iterator<Item = FramebufferId> {
        (0..self.framebuffers.len()).map(FramebufferId)
    }

    pub fn texture_ids(&self) -> impl Iterator<Item = TextureId> {
        (0..self.textures.len()).map(TextureId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deferred_like() -> (RenderTargetSet, TextureId, [FramebufferId; 3]) {
        let mut set = RenderTargetSet::new("test");
        let depth = set.add_texture(TargetTexture::new("depth", TextureFormat::Depth32Float));
        let albedo = set.add_texture(TargetTexture::new("albedo", TextureFormat::Rgba8Unorm));
        let light = set.add_texture(TargetTexture::new("light", TextureFormat::Rgba16Float));
        let shade = set.add_texture(TargetTexture::new("shade", TextureFormat::Rgba16Float));
        let gbuffer = set.add_framebuffer("gbuffer", &[Attachment::owned(albedo)], Some(Attachment::owned(depth)));
        let lighting = set.add_framebuffer("lighting", &[Attachment::owned(light)], Some(Attachment::shared(depth)));
        let shading = set.add_framebuffer("shading", &[Attachment::owned(shade)], Some(Attachment::shared(depth)));
        (set, depth, [gbuffer, lighting, shading])
    }

    #[test]
    fn test_layouts_are_deduplicated() {
        let mut device = HeadlessBackend::new(8, 8);
        let (mut set, _, [gbuffer, lighting, shading]) = deferred_like();
        set.create(&mut device, 8, 8).unwrap();
        assert_eq!(set.layout_count(), 2);
        assert_eq!(set.layout(lighting), set.layout(shading));
        assert_ne!(set.layout(gbuffer), set.layout(lighting));
        assert_eq!(device.live_layouts(), 2);
    }

    #[test]
    fn test_shared_depth_aliases_owner() {
        let mut device = HeadlessBackend::new(8, 8);
        let (mut set, depth, [gbuffer, lighting, shading]) = deferred_like();
        set.create(&mut device, 8, 8).unwrap();
        assert_eq!(set.owner(depth), Some(gbuffer));
        let expected = Some(TextureView::new(set.texture(depth)));
        for fb in [gbuffer, lighting, shading] {
            let desc = device.framebuffer_descriptor(set.framebuffer(fb)).unwrap();
            assert_eq!(desc.depth_attachment, expected);
        }
    }

    #[test]
    fn test_release_keeps_layouts() {
        let mut device = HeadlessBackend::new(8, 8);
        let (mut set, _, [gbuffer, ..]) = deferred_like();
        set.create(&mut device, 8, 8).unwrap();
        let layout = set.layout(gbuffer);
        set.release(&mut device);
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.live_framebuffers(), 0);
        assert_eq!(device.live_layouts(), 2);

        set.create(&mut device, 16, 4).unwrap();
        assert_eq!(set.layout(gbuffer), layout);
        assert_eq!(set.framebuffer_size(gbuffer), (16, 4));
        set.destroy(&mut device);
        assert_eq!(device.live_layouts(), 0);
    }

    #[test]
    fn test_failed_create_leaves_nothing() {
        let mut device = HeadlessBackend::new(8, 8);
        device.fail_texture_creation_after(2);
        let (mut set, ..) = deferred_like();
        assert!(set.create(&mut device, 8, 8).is_err());
        assert!(!set.is_created());
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.live_layouts(), 0);
    }

    #[test]
    #[should_panic(expected = "already owned")]
    fn test_double_ownership_panics() {
        let mut set = RenderTargetSet::new("test");
        let depth = set.add_texture(TargetTexture::new("depth", TextureFormat::Depth32Float));
        set.add_framebuffer("a", &[], Some(Attachment::owned(depth)));
        set.add_framebuffer("b", &[], Some(Attachment::owned(depth)));
    }

    #[test]
    fn test_relative_and_mip_sizes() {
        assert_eq!(TargetSize::Relative { scale: 0.5 }.resolve(801, 600), (401, 300));
        assert_eq!(TargetSize::square(64).resolve(1920, 1080), (64, 64));

        let mut device = HeadlessBackend::new(8, 8);
        let mut set = RenderTargetSet::new("lum");
        let lum = set.add_texture(
            TargetTexture::new("lum", TextureFormat::Rgba16Float)
                .with_size(TargetSize::square(16))
                .with_mips(0),
        );
        let mip2 = set.add_framebuffer("mip2", &[Attachment::owned(lum).mip(2)], None);
        set.create(&mut device, 8, 8).unwrap();
        assert_eq!(set.framebuffer_size(mip2), (4, 4));
        let desc = device.texture_descriptor(set.texture(lum)).unwrap();
        assert_eq!(desc.mip_levels, 5);
    }
}
