//! wgpu backend implementation
//!
//! An offscreen device: the backbuffer is an ordinary texture, so frames can
//! be read back or exported without a window. Draws recorded between
//! `begin_render_pass` and `end_render_pass` are buffered and encoded when
//! the pass ends. A pass that loads depth and never writes it attaches the
//! depth read-only, so the lighting passes can sample the depth they test
//! against.

mod shader;

use std::collections::HashMap;
use std::sync::mpsc;

use wgpu::util::DeviceExt;

use crate::backend::program::{InputKind, Program, ProgramUniforms};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::material::PassId;
use crate::resources::MeshId;

const WHITE_TEXTURE: u64 = 0;

struct WgpuTexture {
    desc: TextureDescriptor,
    texture: wgpu::Texture,
}

struct WgpuFramebuffer {
    desc: FramebufferDescriptor,
    color_views: Vec<wgpu::TextureView>,
    depth_view: Option<wgpu::TextureView>,
}

struct GpuMesh {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    pass: PassId,
    layout: FramebufferLayoutHandle,
    program: Program,
    depth_input: bool,
    fullscreen: bool,
}

/// Buffered draw
struct PendingDraw {
    pipeline: PipelineKey,
    bind_group: wgpu::BindGroup,
    viewport: Viewport,
    mesh: Option<MeshId>,
    writes_depth: bool,
}

/// Pending render pass with buffered draws
struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    framebuffer: FramebufferDescriptor,
    viewport: Viewport,
    draws: Vec<PendingDraw>,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,

    width: u32,
    height: u32,
    backbuffer: TextureHandle,

    // Resource storage
    textures: HashMap<u64, WgpuTexture>,
    layouts: HashMap<u64, FramebufferLayoutDescriptor>,
    framebuffers: HashMap<u64, WgpuFramebuffer>,
    meshes: HashMap<MeshId, GpuMesh>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    next_id: u64,

    bind_layouts: HashMap<(Program, bool), wgpu::BindGroupLayout>,
    /// Six white layers standing in for missing color inputs
    white: wgpu::Texture,
    /// Six layers at the far plane standing in for missing depth inputs
    far_depth: wgpu::Texture,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    in_frame: bool,
    pending_render_pass: Option<PendingRenderPass>,
}

impl WgpuBackend {
    /// Create an offscreen device presenting at `width` by `height`.
    pub fn new(width: u32, height: u32) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(width, height))
    }

    pub async fn new_async(width: u32, height: u32) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No adapter found".to_string()))?;

        let info = adapter.get_info();
        log::info!("Using adapter: {} ({:?})", info.name, info.backend);

        let required_features = adapter.features() & wgpu::Features::DEPTH32FLOAT_STENCIL8;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Deferred Renderer Device"),
                    required_features,
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let white = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("white"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 6,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255; 24],
        );
        let far_depth = Self::far_depth_texture(&device, &queue);

        let mut backend = Self {
            instance,
            adapter,
            device,
            queue,
            width,
            height,
            backbuffer: TextureHandle(WHITE_TEXTURE),
            textures: HashMap::new(),
            layouts: HashMap::new(),
            framebuffers: HashMap::new(),
            meshes: HashMap::new(),
            pipelines: HashMap::new(),
            next_id: WHITE_TEXTURE + 1,
            bind_layouts: HashMap::new(),
            white,
            far_depth,
            encoder: None,
            in_frame: false,
            pending_render_pass: None,
        };
        backend.backbuffer = backend.create_texture(&Self::backbuffer_descriptor(width, height))?;
        log::info!("wgpu backend initialized ({}x{})", width, height);
        Ok(backend)
    }

    fn backbuffer_descriptor(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor {
            label: Some("backbuffer".to_string()),
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::render_target(),
            ..Default::default()
        }
    }

    /// Depth texture cleared to the far plane. Depth formats cannot be
    /// written by copies, so the clear is a render pass per layer.
    fn far_depth_texture(device: &wgpu::Device, queue: &wgpu::Queue) -> wgpu::Texture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("far depth"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 6,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Far Depth Clear"),
        });
        for layer in 0..6 {
            let view = texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: layer,
                array_layer_count: Some(1),
                ..Default::default()
            });
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("far depth"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        queue.submit(std::iter::once(encoder.finish()));
        texture
    }

    fn input_layout(device: &wgpu::Device, kinds: &[InputKind]) -> wgpu::BindGroupLayout {
        let uniforms = wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let textures = kinds.iter().enumerate().map(|(i, kind)| {
            let (sample_type, view_dimension) = Self::binding_type(*kind);
            wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type,
                    view_dimension,
                    multisampled: false,
                },
                count: None,
            }
        });
        let entries: Vec<_> = std::iter::once(uniforms).chain(textures).collect();
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Draw Input Layout"),
            entries: &entries,
        })
    }

    fn binding_type(kind: InputKind) -> (wgpu::TextureSampleType, wgpu::TextureViewDimension) {
        let color = wgpu::TextureSampleType::Float { filterable: false };
        match kind {
            InputKind::Color => (color, wgpu::TextureViewDimension::D2),
            InputKind::Depth => (wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2),
            InputKind::ColorLayers => (color, wgpu::TextureViewDimension::D2Array),
            InputKind::DepthLayers => (wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2Array),
        }
    }

    fn bind_layout(&mut self, program: Program, depth_input: bool) -> &wgpu::BindGroupLayout {
        let device = &self.device;
        self.bind_layouts.entry((program, depth_input)).or_insert_with(|| {
            Self::input_layout(device, &shader::binding_kinds(program, depth_input))
        })
    }

    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
            TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
            TextureFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth32FloatStencil8 => wgpu::TextureFormat::Depth32FloatStencil8,
        }
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_component(component: BlendComponent) -> wgpu::BlendComponent {
        wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(component.src_factor),
            dst_factor: Self::convert_blend_factor(component.dst_factor),
            operation: Self::convert_blend_operation(component.operation),
        }
    }

    fn convert_blend_state(state: BlendState) -> wgpu::BlendState {
        wgpu::BlendState {
            color: Self::convert_blend_component(state.color),
            alpha: Self::convert_blend_component(state.alpha),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture(&self, handle: TextureHandle) -> BackendResult<&WgpuTexture> {
        self.textures.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: handle.0,
        })
    }

    fn aspect(format: TextureFormat) -> wgpu::TextureAspect {
        if format.is_depth() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        }
    }

    /// View of an input slot: the bound subresource, or six layers from it
    /// for layered inputs.
    fn input_view(texture: &WgpuTexture, view: TextureView, kind: InputKind) -> wgpu::TextureView {
        let aspect = Self::aspect(texture.desc.format);
        match kind {
            InputKind::Color | InputKind::Depth => Self::create_view(texture, view, aspect),
            InputKind::ColorLayers | InputKind::DepthLayers => {
                let layers = texture.desc.array_layers.saturating_sub(view.layer).clamp(1, 6);
                texture.texture.create_view(&wgpu::TextureViewDescriptor {
                    label: texture.desc.label.as_deref(),
                    format: None,
                    dimension: Some(wgpu::TextureViewDimension::D2Array),
                    aspect,
                    base_mip_level: view.mip,
                    mip_level_count: Some(1),
                    base_array_layer: view.layer,
                    array_layer_count: Some(layers),
                })
            }
        }
    }

    fn placeholder_view(&self, kind: InputKind) -> wgpu::TextureView {
        let (texture, dimension, layers) = match kind {
            InputKind::Color => (&self.white, wgpu::TextureViewDimension::D2, 1),
            InputKind::Depth => (&self.far_depth, wgpu::TextureViewDimension::D2, 1),
            InputKind::ColorLayers => (&self.white, wgpu::TextureViewDimension::D2Array, 6),
            InputKind::DepthLayers => (&self.far_depth, wgpu::TextureViewDimension::D2Array, 6),
        };
        texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(dimension),
            array_layer_count: Some(layers),
            ..Default::default()
        })
    }

    /// Single-subresource 2D view
    fn create_view(texture: &WgpuTexture, view: TextureView, aspect: wgpu::TextureAspect) -> wgpu::TextureView {
        texture.texture.create_view(&wgpu::TextureViewDescriptor {
            label: texture.desc.label.as_deref(),
            format: None,
            dimension: Some(wgpu::TextureViewDimension::D2),
            aspect,
            base_mip_level: view.mip,
            mip_level_count: Some(1),
            base_array_layer: view.layer,
            array_layer_count: Some(1),
        })
    }

    fn validate_attachment(&self, view: TextureView, format: TextureFormat, width: u32, height: u32) -> BackendResult<()> {
        let texture = self.texture(view.texture)?;
        if texture.desc.format != format {
            return Err(BackendError::LayoutMismatch(format!(
                "attachment {:?} is {:?}, layout expects {:?}",
                texture.desc.label, texture.desc.format, format
            )));
        }
        if view.layer >= texture.desc.array_layers || view.mip >= texture.desc.mip_levels {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "{view:?} out of range for {:?}",
                texture.desc.label
            )));
        }
        if texture.desc.mip_size(view.mip) != (width, height) {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "attachment {:?} size differs from framebuffer {}x{}",
                texture.desc.label, width, height
            )));
        }
        Ok(())
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        })
    }

    /// Submit everything recorded so far.
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn upload_mesh(&mut self, mesh: &crate::resources::Mesh) {
        if self.meshes.contains_key(&mesh.id()) {
            return;
        }
        let vertices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&mesh.name),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&mesh.name),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        self.meshes.insert(
            mesh.id(),
            GpuMesh {
                vertices,
                indices,
                index_count: mesh.indices.len() as u32,
            },
        );
    }

    fn ensure_pipeline(&mut self, key: PipelineKey, state: &PassState) -> BackendResult<()> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        let layout = self
            .layouts
            .get(&key.layout.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "framebuffer layout",
                id: key.layout.0,
            })?
            .clone();

        let source = shader::pass_module(
            key.program,
            state.shader.as_deref(),
            layout.color_formats.len(),
            key.depth_input,
        );
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Material Pass Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        self.bind_layout(key.program, key.depth_input);
        let bind_group_layout = &self.bind_layouts[&(key.program, key.depth_input)];
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Material Pass Layout"),
            bind_group_layouts: &[bind_group_layout],
            push_constant_ranges: &[],
        });

        let vertex_attributes = wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];
        let mesh_buffers = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &vertex_attributes,
        }];
        let (entry_point, buffers): (&str, &[wgpu::VertexBufferLayout]) = if key.fullscreen {
            ("vs_fullscreen", &[])
        } else {
            ("vs_mesh", &mesh_buffers)
        };

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = layout
            .color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(*format),
                    blend: state.blend.map(Self::convert_blend_state),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = layout.depth_format.map(|format| wgpu::DepthStencilState {
            format: Self::convert_texture_format(format),
            depth_write_enabled: state.depth_compare.is_some() && state.depth_write,
            depth_compare: state
                .depth_compare
                .map_or(wgpu::CompareFunction::Always, Self::convert_compare_function),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Material Pass Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point,
                buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: (!color_targets.is_empty()).then(|| wgpu::FragmentState {
                module: &module,
                entry_point: "fs_main",
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: match state.cull {
                    CullMode::None => None,
                    CullMode::Front => Some(wgpu::Face::Front),
                    CullMode::Back => Some(wgpu::Face::Back),
                },
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });
        log::debug!(
            "Created {:?} pipeline for pass {:?} (fullscreen: {})",
            key.program,
            key.pass,
            key.fullscreen
        );
        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    /// Bytes per texel of the copyable aspect, `None` when it cannot be read back.
    fn readback_texel_size(format: TextureFormat) -> Option<u32> {
        match format {
            TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8 => None,
            TextureFormat::Depth32FloatStencil8 => Some(4),
            other => Some(other.bytes_per_pixel()),
        }
    }

    fn decode_texel(format: TextureFormat, bytes: &[u8]) -> [f32; 4] {
        let f16 = |i: usize| half::f16::from_le_bytes([bytes[i], bytes[i + 1]]).to_f32();
        let f32_at = |i: usize| f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let unorm8 = |i: usize| bytes[i] as f32 / 255.0;
        let raw = match format {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
                [unorm8(0), unorm8(1), unorm8(2), unorm8(3)]
            }
            TextureFormat::Bgra8Unorm => [unorm8(2), unorm8(1), unorm8(0), unorm8(3)],
            TextureFormat::Rgba16Float => [f16(0), f16(2), f16(4), f16(6)],
            TextureFormat::Rgba32Float => [f32_at(0), f32_at(4), f32_at(8), f32_at(12)],
            TextureFormat::R16Float => [f16(0), 0.0, 0.0, 1.0],
            TextureFormat::Rg16Float => [f16(0), f16(2), 0.0, 1.0],
            TextureFormat::R32Float | TextureFormat::Depth32Float | TextureFormat::Depth32FloatStencil8 => {
                [f32_at(0), 0.0, 0.0, 1.0]
            }
            TextureFormat::Depth16Unorm => {
                [u16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 65535.0, 0.0, 0.0, 1.0]
            }
            TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8 => [0.0, 0.0, 0.0, 1.0],
        };
        format.store(raw)
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn render_begin(&mut self) -> BackendResult<()> {
        assert!(!self.in_frame, "render_begin called twice without render_end");
        self.in_frame = true;
        self.encoder();
        Ok(())
    }

    fn render_end(&mut self) -> BackendResult<()> {
        assert!(self.in_frame, "render_end called without render_begin");
        assert!(
            self.pending_render_pass.is_none(),
            "render_end called inside a render pass"
        );
        self.flush();
        self.in_frame = false;
        Ok(())
    }

    fn is_in_frame(&self) -> bool {
        self.in_frame
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        let backbuffer = self.create_texture(&Self::backbuffer_descriptor(width, height))?;
        self.flush();
        self.textures.remove(&self.backbuffer.0);
        self.backbuffer = backbuffer;
        self.width = width;
        self.height = height;
        log::debug!("wgpu backbuffer resized to {}x{}", width, height);
        Ok(())
    }

    fn backbuffer(&self) -> TextureHandle {
        self.backbuffer
    }

    fn is_texture_supported(&self, format: TextureFormat, usage: TextureUsage) -> bool {
        if format == TextureFormat::Depth32FloatStencil8
            && !self.device.features().contains(wgpu::Features::DEPTH32FLOAT_STENCIL8)
        {
            return false;
        }
        let features = self
            .adapter
            .get_texture_format_features(Self::convert_texture_format(format));
        features
            .allowed_usages
            .contains(Self::convert_texture_usage(usage))
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

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::warn!("Texture {:?} creation failed: {}", desc.label, error);
            return Err(BackendError::OutOfMemory);
        }

        let id = self.allocate_id();
        self.textures.insert(
            id,
            WgpuTexture {
                desc: desc.clone(),
                texture,
            },
        );
        log::trace!("wgpu: created texture {} {:?}", id, desc.label);
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture == self.backbuffer {
            log::warn!("Ignoring request to destroy the backbuffer");
            return;
        }
        if let Some(texture) = self.textures.remove(&texture.0) {
            texture.texture.destroy();
        }
    }

    fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    fn create_framebuffer_layout(
        &mut self,
        desc: &FramebufferLayoutDescriptor,
    ) -> BackendResult<FramebufferLayoutHandle> {
        let usage = TextureUsage::RENDER_ATTACHMENT;
        if let Some(format) = desc
            .color_formats
            .iter()
            .chain(desc.depth_format.iter())
            .find(|f| !self.is_texture_supported(**f, usage))
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
        Ok(FramebufferLayoutHandle(id))
    }

    fn destroy_framebuffer_layout(&mut self, layout: FramebufferLayoutHandle) {
        self.layouts.remove(&layout.0);
        self.pipelines.retain(|key, _| key.layout != layout);
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let layout = self
            .layouts
            .get(&desc.layout.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "framebuffer layout",
                id: desc.layout.0,
            })?
            .clone();
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

        let color_views = desc
            .color_attachments
            .iter()
            .map(|view| Ok(Self::create_view(self.texture(view.texture)?, *view, wgpu::TextureAspect::All)))
            .collect::<BackendResult<Vec<_>>>()?;
        let depth_view = desc
            .depth_attachment
            .map(|view| Ok::<_, BackendError>(Self::create_view(self.texture(view.texture)?, view, wgpu::TextureAspect::All)))
            .transpose()?;

        let id = self.allocate_id();
        self.framebuffers.insert(
            id,
            WgpuFramebuffer {
                desc: desc.clone(),
                color_views,
                depth_view,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn framebuffer_descriptor(&self, framebuffer: FramebufferHandle) -> Option<&FramebufferDescriptor> {
        self.framebuffers.get(&framebuffer.0).map(|f| &f.desc)
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        assert!(self.in_frame, "render pass {:?} outside render_begin/render_end", desc.label);
        assert!(
            self.pending_render_pass.is_none(),
            "render pass {:?} started inside another pass",
            desc.label
        );
        let framebuffer = self
            .framebuffers
            .get(&desc.framebuffer.0)
            .map(|f| f.desc.clone())
            .unwrap_or_else(|| panic!("render pass {:?} on unknown framebuffer", desc.label));
        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            viewport: Viewport::full(framebuffer.width, framebuffer.height),
            framebuffer,
            draws: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_render_pass.take() else {
            panic!("end_render_pass without an active pass");
        };
        let Some(framebuffer) = self.framebuffers.get(&pending.descriptor.framebuffer.0) else {
            return;
        };
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = framebuffer
            .color_views
            .iter()
            .enumerate()
            .map(|(index, view)| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match pending.descriptor.color_load_op(index) {
                            LoadOp::Clear(color) => wgpu::LoadOp::Clear(wgpu::Color {
                                r: color[0] as f64,
                                g: color[1] as f64,
                                b: color[2] as f64,
                                a: color[3] as f64,
                            }),
                            LoadOp::Load => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let depth_format = pending
            .framebuffer
            .depth_attachment
            .and_then(|view| self.textures.get(&view.texture.0))
            .map(|t| t.desc.format);
        let read_only = matches!(pending.descriptor.depth_load_op, LoadOp::Load)
            && matches!(pending.descriptor.stencil_load_op, LoadOp::Load)
            && !pending.draws.iter().any(|draw| draw.writes_depth);
        let depth_attachment = framebuffer.depth_view.as_ref().map(|view| wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: (!read_only).then(|| wgpu::Operations {
                load: match pending.descriptor.depth_load_op {
                    LoadOp::Clear(depth) => wgpu::LoadOp::Clear(depth),
                    LoadOp::Load => wgpu::LoadOp::Load,
                },
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: depth_format
                .filter(|format| !read_only && format.has_stencil())
                .map(|_| wgpu::Operations {
                    load: match pending.descriptor.stencil_load_op {
                        LoadOp::Clear(stencil) => wgpu::LoadOp::Clear(stencil),
                        LoadOp::Load => wgpu::LoadOp::Load,
                    },
                    store: wgpu::StoreOp::Store,
                }),
        });

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: pending.descriptor.label.as_deref(),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let (width, height) = (pending.framebuffer.width as f32, pending.framebuffer.height as f32);
        for draw in &pending.draws {
            let Some(pipeline) = self.pipelines.get(&draw.pipeline) else {
                continue;
            };
            let x = draw.viewport.x.clamp(0.0, width);
            let y = draw.viewport.y.clamp(0.0, height);
            let w = draw.viewport.width.min(width - x);
            let h = draw.viewport.height.min(height - y);
            if w <= 0.0 || h <= 0.0 {
                continue;
            }
            render_pass.set_viewport(x, y, w, h, 0.0, 1.0);
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &draw.bind_group, &[]);
            match draw.mesh.and_then(|id| self.meshes.get(&id)) {
                Some(mesh) => {
                    render_pass.set_vertex_buffer(0, mesh.vertices.slice(..));
                    render_pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
                    render_pass.draw_indexed(0..mesh.index_count, 0, 0..1);
                }
                None => render_pass.draw(0..3, 0..1),
            }
        }
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        if let Some(pending) = &mut self.pending_render_pass {
            pending.viewport = viewport;
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        let Some(pending) = self.pending_render_pass.as_ref() else {
            panic!("draw {:?} outside a render pass", call.label);
        };
        let layout = pending.framebuffer.layout;
        let viewport = pending.viewport;
        let target_size = glam::Vec2::new(pending.framebuffer.width as f32, pending.framebuffer.height as f32);

        let program = call.program();
        let depth_input = program.inputs().is_empty()
            && call
                .inputs()
                .next()
                .and_then(|view| self.textures.get(&view.texture.0))
                .is_some_and(|t| t.desc.format.is_depth());
        let kinds = shader::binding_kinds(program, depth_input);
        let views: Vec<wgpu::TextureView> = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let bound = match program.inputs().get(i) {
                    Some(slot) => call.input(slot.name),
                    None => call.inputs().next(),
                };
                let wants_depth = matches!(kind, InputKind::Depth | InputKind::DepthLayers);
                match bound.and_then(|view| self.textures.get(&view.texture.0).map(|t| (t, view))) {
                    Some((texture, view)) if texture.desc.format.is_depth() == wants_depth => {
                        Self::input_view(texture, view, *kind)
                    }
                    Some((texture, _)) => {
                        log::warn!(
                            "Draw {:?}: input {} is {:?}, expected {:?}",
                            call.label,
                            i,
                            texture.desc.format,
                            kind
                        );
                        self.placeholder_view(*kind)
                    }
                    None => self.placeholder_view(*kind),
                }
            })
            .collect();

        let mesh = match call.geometry {
            Geometry::Mesh { mesh, .. } => Some(mesh),
            Geometry::Fullscreen => None,
        };
        let key = PipelineKey {
            pass: call.pass,
            layout,
            program,
            depth_input,
            fullscreen: mesh.is_none(),
        };
        if let Err(e) = self.ensure_pipeline(key, call.state) {
            log::warn!("Skipping draw {:?}: {}", call.label, e);
            return;
        }
        if let Some(mesh) = mesh {
            self.upload_mesh(mesh);
        }

        let uniforms = ProgramUniforms::gather(call, target_size, viewport);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(call.label),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let entries: Vec<wgpu::BindGroupEntry> = std::iter::once(wgpu::BindGroupEntry {
            binding: 0,
            resource: buffer.as_entire_binding(),
        })
        .chain(views.iter().enumerate().map(|(i, view)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: wgpu::BindingResource::TextureView(view),
        }))
        .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(call.label),
            layout: &self.bind_layouts[&(program, depth_input)],
            entries: &entries,
        });

        if let Some(pending) = self.pending_render_pass.as_mut() {
            pending.draws.push(PendingDraw {
                pipeline: key,
                bind_group,
                viewport,
                mesh: mesh.map(|m| m.id()),
                writes_depth: call.state.depth_compare.is_some() && call.state.depth_write,
            });
        }
    }

    fn copy_texture(&mut self, src: TextureView, dst: TextureView) -> BackendResult<()> {
        let src_size = self.texture(src.texture)?.desc.mip_size(src.mip);
        let dst_size = self.texture(dst.texture)?.desc.mip_size(dst.mip);
        if src_size != dst_size {
            return Err(BackendError::InvalidCopy(format!(
                "size mismatch {src_size:?} -> {dst_size:?}"
            )));
        }
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        });
        let (Some(src_texture), Some(dst_texture)) =
            (self.textures.get(&src.texture.0), self.textures.get(&dst.texture.0))
        else {
            return Err(BackendError::InvalidCopy("texture destroyed".to_string()));
        };
        encoder.copy_texture_to_texture(
            wgpu::ImageCopyTexture {
                texture: &src_texture.texture,
                mip_level: src.mip,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: src.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyTexture {
                texture: &dst_texture.texture,
                mip_level: dst.mip,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: dst.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: src_size.0,
                height: src_size.1,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_pixels(&mut self, view: TextureView) -> BackendResult<Vec<[f32; 4]>> {
        let (format, (width, height)) = {
            let texture = self.texture(view.texture)?;
            if view.layer >= texture.desc.array_layers || view.mip >= texture.desc.mip_levels {
                return Err(BackendError::ReadbackFailed(format!("{view:?} out of range")));
            }
            (texture.desc.format, texture.desc.mip_size(view.mip))
        };
        let texel_size = Self::readback_texel_size(format)
            .ok_or_else(|| BackendError::ReadbackFailed(format!("{format:?} cannot be read back")))?;

        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let row_bytes = width * texel_size;
        let padded_row = row_bytes.div_ceil(align) * align;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        let texture = self.texture(view.texture)?;
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &texture.texture,
                mip_level: view.mip,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: view.layer,
                },
                aspect: Self::aspect(format),
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        // Work recorded earlier this frame must land before the copy.
        let frame_commands = self.encoder.take().map(|e| e.finish());
        self.queue
            .submit(frame_commands.into_iter().chain(std::iter::once(encoder.finish())));

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;

        let pixels = {
            let data = slice.get_mapped_range();
            data.chunks_exact(padded_row as usize)
                .flat_map(|row| {
                    row[..row_bytes as usize]
                        .chunks_exact(texel_size as usize)
                        .map(|texel| Self::decode_texel(format, texel))
                })
                .collect()
        };
        buffer.unmap();
        Ok(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_texel_formats() {
        assert_eq!(
            WgpuBackend::decode_texel(TextureFormat::Rgba8Unorm, &[255, 0, 51, 255]),
            [1.0, 0.0, 0.2, 1.0]
        );
        assert_eq!(
            WgpuBackend::decode_texel(TextureFormat::Bgra8Unorm, &[0, 0, 255, 255]),
            [1.0, 0.0, 0.0, 1.0]
        );
        let depth = 0.5f32.to_le_bytes();
        assert_eq!(
            WgpuBackend::decode_texel(TextureFormat::Depth32Float, &depth),
            [0.5, 0.5, 0.5, 1.0]
        );
        let mut bytes = Vec::new();
        for v in [2.0f32, 1.0, 0.5, 1.0] {
            bytes.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        assert_eq!(
            WgpuBackend::decode_texel(TextureFormat::Rgba16Float, &bytes),
            [2.0, 1.0, 0.5, 1.0]
        );
    }

    #[test]
    fn test_depth24_not_readable() {
        assert_eq!(WgpuBackend::readback_texel_size(TextureFormat::Depth24PlusStencil8), None);
        assert_eq!(WgpuBackend::readback_texel_size(TextureFormat::Rgba16Float), Some(8));
    }
}
