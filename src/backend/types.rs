//! Common types shared between device backends

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

use super::program::Program;
use super::traits::{FramebufferLayoutHandle, TextureHandle};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R16Float,
    R32Float,
    Rg16Float,
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
    Depth32FloatStencil8,
}

impl TextureFormat {
    pub const ALL: &'static [TextureFormat] = &[
        TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm,
        TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float,
        TextureFormat::R16Float,
        TextureFormat::R32Float,
        TextureFormat::Rg16Float,
        TextureFormat::Depth16Unorm,
        TextureFormat::Depth24Plus,
        TextureFormat::Depth24PlusStencil8,
        TextureFormat::Depth32Float,
        TextureFormat::Depth32FloatStencil8,
    ];

    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16Unorm
                | TextureFormat::Depth24Plus
                | TextureFormat::Depth24PlusStencil8
                | TextureFormat::Depth32Float
                | TextureFormat::Depth32FloatStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth24PlusStencil8 | TextureFormat::Depth32FloatStencil8
        )
    }

    /// Number of color channels actually stored by the format.
    pub fn channels(&self) -> u32 {
        match self {
            TextureFormat::R16Float
            | TextureFormat::R32Float
            | TextureFormat::Depth16Unorm
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float
            | TextureFormat::Depth32FloatStencil8 => 1,
            TextureFormat::Rg16Float => 2,
            _ => 4,
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R16Float | TextureFormat::Depth16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::Rg16Float
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Depth32FloatStencil8 => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    /// Normalized formats clamp stored values to `[0, 1]`.
    pub fn is_normalized(&self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8Unorm
                | TextureFormat::Rgba8UnormSrgb
                | TextureFormat::Bgra8Unorm
                | TextureFormat::Depth16Unorm
                | TextureFormat::Depth24Plus
                | TextureFormat::Depth24PlusStencil8
        )
    }

    /// Converts an RGBA value to what the format can hold: missing channels
    /// read back as zero (alpha as one) and normalized formats saturate.
    /// Depth reads back replicated into rgb, like a depth-compare-less sample.
    pub fn store(&self, color: [f32; 4]) -> [f32; 4] {
        let mut out = match self.channels() {
            1 if self.is_depth() => [color[0], color[0], color[0], 1.0],
            1 => [color[0], 0.0, 0.0, 1.0],
            2 => [color[0], color[1], 0.0, 1.0],
            _ => color,
        };
        if self.is_normalized() {
            for c in &mut out {
                *c = c.clamp(0.0, 1.0);
            }
        }
        out
    }
}

bitflags! {
    /// Texture usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const RENDER_ATTACHMENT = 1 << 3;
    }
}

impl TextureUsage {
    /// Usage of a render target that is also sampled and copied.
    pub fn render_target() -> Self {
        Self::RENDER_ATTACHMENT | Self::TEXTURE_BINDING | Self::COPY_SRC | Self::COPY_DST
    }
}

/// How array layers of a texture are interpreted when sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureDimension {
    #[default]
    D2,
    D2Array,
    Cube,
    CubeArray,
}

/// Texture descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub dimension: TextureDimension,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            array_layers: 1,
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            dimension: TextureDimension::D2,
        }
    }
}

impl TextureDescriptor {
    /// Size of the given mip level.
    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// Number of mips in a full chain down to 1x1.
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }
}

/// Immutable description of a framebuffer's attachment set.
///
/// Layouts are deduplicated by value, so two framebuffers with the same
/// color and depth formats share one layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferLayoutDescriptor {
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
}

/// One subresource of a texture used as an attachment, copy endpoint or input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureView {
    pub texture: TextureHandle,
    pub layer: u32,
    pub mip: u32,
}

impl TextureView {
    pub fn new(texture: TextureHandle) -> Self {
        Self {
            texture,
            layer: 0,
            mip: 0,
        }
    }

    pub fn layer(texture: TextureHandle, layer: u32) -> Self {
        Self {
            texture,
            layer,
            mip: 0,
        }
    }

    pub fn mip(texture: TextureHandle, mip: u32) -> Self {
        Self {
            texture,
            layer: 0,
            mip,
        }
    }
}

/// Framebuffer descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub layout: FramebufferLayoutHandle,
    pub color_attachments: Vec<TextureView>,
    pub depth_attachment: Option<TextureView>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<T> {
    Clear(T),
    Load,
}

/// Viewport rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

/// Compare function for depth tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunction {
    pub fn passes(&self, incoming: f32, stored: f32) -> bool {
        match self {
            CompareFunction::Never => false,
            CompareFunction::Less => incoming < stored,
            CompareFunction::Equal => incoming == stored,
            CompareFunction::LessEqual => incoming <= stored,
            CompareFunction::Greater => incoming > stored,
            CompareFunction::NotEqual => incoming != stored,
            CompareFunction::GreaterEqual => incoming >= stored,
            CompareFunction::Always => true,
        }
    }
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

/// Blend state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    pub fn additive() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::Zero,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
        }
    }

    /// `dst = dst * src`, alpha untouched.
    pub fn multiply() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::Dst,
                dst_factor: BlendFactor::Zero,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::Zero,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
        }
    }
}

/// Filter mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

/// Address mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Sampler state attached to a texture parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerState {
    pub filter: FilterMode,
    pub address: AddressMode,
}

impl SamplerState {
    pub fn point_clamp() -> Self {
        Self {
            filter: FilterMode::Nearest,
            address: AddressMode::ClampToEdge,
        }
    }
}

/// Fixed-function state of one material pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PassState {
    pub blend: Option<BlendState>,
    /// Depth test against the bound depth attachment; `None` disables it.
    pub depth_compare: Option<CompareFunction>,
    pub depth_write: bool,
    pub cull: CullMode,
    /// What each fragment computes. Ignored when `shader` is set.
    pub program: Program,
    /// Custom WGSL; built-in shading is used when absent.
    pub shader: Option<String>,
}

impl PassState {
    /// Opaque geometry: depth tested and written.
    pub fn geometry() -> Self {
        Self {
            depth_compare: Some(CompareFunction::LessEqual),
            depth_write: true,
            ..Default::default()
        }
    }

    /// Full-screen pass with optional blending and no depth.
    pub fn fullscreen(blend: Option<BlendState>) -> Self {
        Self {
            blend,
            ..Default::default()
        }
    }

    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn with_depth(mut self, compare: CompareFunction, write: bool) -> Self {
        self.depth_compare = Some(compare);
        self.depth_write = write;
        self
    }

    pub fn with_program(mut self, program: Program) -> Self {
        self.program = program;
        self
    }

    pub fn with_shader(mut self, source: impl Into<String>) -> Self {
        self.shader = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_count() {
        assert_eq!(TextureDescriptor::full_mip_count(1, 1), 1);
        assert_eq!(TextureDescriptor::full_mip_count(64, 64), 7);
        assert_eq!(TextureDescriptor::full_mip_count(800, 600), 10);
    }

    #[test]
    fn test_mip_size_never_zero() {
        let desc = TextureDescriptor {
            width: 64,
            height: 16,
            ..Default::default()
        };
        assert_eq!(desc.mip_size(0), (64, 16));
        assert_eq!(desc.mip_size(5), (2, 1));
        assert_eq!(desc.mip_size(6), (1, 1));
    }

    #[test]
    fn test_store_drops_missing_channels() {
        assert_eq!(
            TextureFormat::R32Float.store([2.5, 1.0, 1.0, 0.0]),
            [2.5, 0.0, 0.0, 1.0]
        );
        assert_eq!(
            TextureFormat::Rgba8Unorm.store([1.5, -0.5, 0.25, 1.0]),
            [1.0, 0.0, 0.25, 1.0]
        );
        assert_eq!(
            TextureFormat::Depth32Float.store([0.25, 0.0, 0.0, 0.0]),
            [0.25, 0.25, 0.25, 1.0]
        );
        assert_eq!(
            TextureFormat::Rgba16Float.store([4.0, 3.0, 2.0, 1.0]),
            [4.0, 3.0, 2.0, 1.0]
        );
    }

    #[test]
    fn test_depth_format_flags() {
        assert!(TextureFormat::Depth24PlusStencil8.is_depth());
        assert!(TextureFormat::Depth24PlusStencil8.has_stencil());
        assert!(TextureFormat::Depth32Float.is_depth());
        assert!(!TextureFormat::Depth32Float.has_stencil());
        assert!(!TextureFormat::Rgba16Float.is_depth());
    }
}
