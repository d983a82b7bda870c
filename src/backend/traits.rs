//! Core device abstraction traits
//!
//! The pipeline only talks to the device through [`GraphicsBackend`]. Both the
//! headless reference device and the wgpu device implement it.

use glam::Mat4;
use thiserror::Error;

use crate::backend::program::Program;
use crate::backend::types::*;
use crate::material::{MaterialVariant, PassId};
use crate::resources::Mesh;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Texture format {0:?} is not supported for the requested usage")]
    UnsupportedFormat(TextureFormat),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create framebuffer layout: {0}")]
    LayoutCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Framebuffer attachments do not match layout: {0}")]
    LayoutMismatch(String),
    #[error("Invalid copy: {0}")]
    InvalidCopy(String),
    #[error("Unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("Readback failed: {0}")]
    ReadbackFailed(String),
    #[error("Failed to export image: {0}")]
    ExportFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a device texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a framebuffer layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferLayoutHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Render pass descriptor
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub framebuffer: FramebufferHandle,
    /// One entry per color attachment. Missing entries load.
    pub color_load_ops: Vec<LoadOp<[f32; 4]>>,
    pub depth_load_op: LoadOp<f32>,
    pub stencil_load_op: LoadOp<u32>,
}

impl RenderPassDescriptor {
    /// A pass that keeps every attachment's contents.
    pub fn load(label: &str, framebuffer: FramebufferHandle) -> Self {
        Self {
            label: Some(label.to_string()),
            framebuffer,
            color_load_ops: Vec::new(),
            depth_load_op: LoadOp::Load,
            stencil_load_op: LoadOp::Load,
        }
    }

    pub fn clear_colors(mut self, colors: &[[f32; 4]]) -> Self {
        self.color_load_ops = colors.iter().map(|c| LoadOp::Clear(*c)).collect();
        self
    }

    pub fn color_ops(mut self, ops: Vec<LoadOp<[f32; 4]>>) -> Self {
        self.color_load_ops = ops;
        self
    }

    pub fn clear_depth(mut self, depth: f32) -> Self {
        self.depth_load_op = LoadOp::Clear(depth);
        self
    }

    pub fn depth_op(mut self, op: LoadOp<f32>) -> Self {
        self.depth_load_op = op;
        self
    }

    pub fn stencil_op(mut self, op: LoadOp<u32>) -> Self {
        self.stencil_load_op = op;
        self
    }

    pub fn color_load_op(&self, index: usize) -> LoadOp<[f32; 4]> {
        self.color_load_ops.get(index).copied().unwrap_or(LoadOp::Load)
    }
}

/// What a draw rasterizes
#[derive(Debug, Clone, Copy)]
pub enum Geometry<'a> {
    /// An indexed triangle mesh with its clip-space transform.
    Mesh { mesh: &'a Mesh, transform: Mat4 },
    /// A triangle covering the current viewport.
    Fullscreen,
}

/// One draw of a material pass.
///
/// Texture-typed parameters are bound as inputs in declaration order.
#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub label: &'a str,
    pub pass: PassId,
    pub state: &'a PassState,
    pub parameters: Vec<(&'a str, &'a MaterialVariant)>,
    pub geometry: Geometry<'a>,
}

impl<'a> DrawCall<'a> {
    /// Product of the `color` and `light_color` parameters, white when absent.
    pub fn tint(&self) -> [f32; 4] {
        let mut tint = [1.0; 4];
        for (_, value) in self
            .parameters
            .iter()
            .filter(|(name, _)| *name == "color" || *name == "light_color")
        {
            if let Some(color) = value.as_color() {
                for (t, c) in tint.iter_mut().zip(color) {
                    *t *= c;
                }
            }
        }
        tint
    }

    /// Texture inputs in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = TextureView> + '_ {
        self.parameters
            .iter()
            .filter_map(|(_, value)| value.as_texture().map(|binding| binding.view))
    }

    /// Texture bound to the parameter `name`.
    pub fn input(&self, name: &str) -> Option<TextureView> {
        self.parameters
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, value)| value.as_texture())
            .map(|binding| binding.view)
    }

    /// Built-in program the draw runs. Custom shaders use the tint layout.
    pub fn program(&self) -> Program {
        if self.state.shader.is_some() {
            Program::Tint
        } else {
            self.state.program
        }
    }
}

/// Device interface consumed by the pipeline
pub trait GraphicsBackend {
    /// Human readable backend name
    fn name(&self) -> &str;

    // Frame bracketing

    /// Begin recording a frame
    fn render_begin(&mut self) -> BackendResult<()>;

    /// Submit everything recorded since `render_begin`
    fn render_end(&mut self) -> BackendResult<()>;

    /// Whether a `render_begin`/`render_end` bracket is open
    fn is_in_frame(&self) -> bool;

    // Presentation target

    /// Current presentation resolution
    fn resolution(&self) -> (u32, u32);

    /// Resize the presentation target. The previous backbuffer handle becomes invalid.
    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()>;

    /// Texture the final image is presented from
    fn backbuffer(&self) -> TextureHandle;

    // Resource creation

    /// Whether `format` can be created with `usage`
    fn is_texture_supported(&self, format: TextureFormat, usage: TextureUsage) -> bool;

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Descriptor a live texture was created with
    fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor>;

    /// Create a framebuffer layout
    fn create_framebuffer_layout(
        &mut self,
        desc: &FramebufferLayoutDescriptor,
    ) -> BackendResult<FramebufferLayoutHandle>;

    /// Destroy a framebuffer layout
    fn destroy_framebuffer_layout(&mut self, layout: FramebufferLayoutHandle);

    /// Create a framebuffer. Fails if the attachments disagree with the layout.
    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Descriptor a live framebuffer was created with
    fn framebuffer_descriptor(&self, framebuffer: FramebufferHandle)
        -> Option<&FramebufferDescriptor>;

    // Command recording

    /// Begin a render pass
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// End the current render pass
    fn end_render_pass(&mut self);

    /// Set the viewport for subsequent draws of the current pass
    fn set_viewport(&mut self, viewport: Viewport);

    /// Draw into the current render pass
    fn draw(&mut self, call: &DrawCall<'_>);

    /// Copy one subresource into another of identical size
    fn copy_texture(&mut self, src: TextureView, dst: TextureView) -> BackendResult<()>;

    /// Read back one subresource as RGBA, row-major
    fn read_pixels(&mut self, view: TextureView) -> BackendResult<Vec<[f32; 4]>>;
}

/// Lets a pipeline borrow a device the caller keeps ownership of.
impl<B: GraphicsBackend + ?Sized> GraphicsBackend for &mut B {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn render_begin(&mut self) -> BackendResult<()> {
        (**self).render_begin()
    }

    fn render_end(&mut self) -> BackendResult<()> {
        (**self).render_end()
    }

    fn is_in_frame(&self) -> bool {
        (**self).is_in_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        (**self).resize(width, height)
    }

    fn backbuffer(&self) -> TextureHandle {
        (**self).backbuffer()
    }

    fn is_texture_supported(&self, format: TextureFormat, usage: TextureUsage) -> bool {
        (**self).is_texture_supported(format, usage)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        (**self).create_texture(desc)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        (**self).destroy_texture(texture)
    }

    fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        (**self).texture_descriptor(texture)
    }

    fn create_framebuffer_layout(
        &mut self,
        desc: &FramebufferLayoutDescriptor,
    ) -> BackendResult<FramebufferLayoutHandle> {
        (**self).create_framebuffer_layout(desc)
    }

    fn destroy_framebuffer_layout(&mut self, layout: FramebufferLayoutHandle) {
        (**self).destroy_framebuffer_layout(layout)
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle> {
        (**self).create_framebuffer(desc)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        (**self).destroy_framebuffer(framebuffer)
    }

    fn framebuffer_descriptor(&self, framebuffer: FramebufferHandle)
        -> Option<&FramebufferDescriptor> {
        (**self).framebuffer_descriptor(framebuffer)
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        (**self).begin_render_pass(desc)
    }

    fn end_render_pass(&mut self) {
        (**self).end_render_pass()
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        (**self).set_viewport(viewport)
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        (**self).draw(call)
    }

    fn copy_texture(&mut self, src: TextureView, dst: TextureView) -> BackendResult<()> {
        (**self).copy_texture(src, dst)
    }

    fn read_pixels(&mut self, view: TextureView) -> BackendResult<Vec<[f32; 4]>> {
        (**self).read_pixels(view)
    }
}
