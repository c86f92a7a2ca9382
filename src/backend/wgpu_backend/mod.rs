//! wgpu backend implementation
//!
//! Serves the GL-style path. Programs are GLSL compiled by wgpu's naga front
//! end; uniform blocks live in bind group 0 at their binding point and
//! texture unit `i` occupies bindings `2i`/`2i+1` of group 1. Fixed-function
//! state is folded into a [`PipelineState`] and pipelines are built lazily
//! per (program, state, vertex layout, attachment formats).

use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Occlusion queries that can be live at once.
const MAX_QUERIES: u32 = 1024;
/// Size of one transient uniform arena chunk.
const ARENA_CHUNK_SIZE: u64 = 256 * 1024;
/// Zeroed buffer bound to uniform bindings nothing was bound to.
const NULL_UNIFORM_SIZE: u64 = 16 * 1024;

/// Buffered render pass command
#[derive(Clone)]
enum RenderCommand {
    SetPipeline(u64),
    SetBindGroup { index: u32, bind_group: u64, offsets: Vec<u32> },
    SetVertexBuffer(u64),
    SetIndexBuffer { buffer: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32 },
    SetScissorRect { x: u32, y: u32, width: u32, height: u32 },
    SetStencilReference(u32),
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
    BeginOcclusionQuery(u32),
    EndOcclusionQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassTarget {
    Default,
    Framebuffer(u64),
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    target: PassTarget,
    color_format: Option<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
    sample_count: u32,
    commands: Vec<RenderCommand>,
    last_pipeline: Option<u64>,
    uses_queries: bool,
}

/// Swapchain or XR image the host renders the default framebuffer into
struct DefaultTarget {
    color: wgpu::TextureView,
    color_format: wgpu::TextureFormat,
    depth: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    desc: TextureDescriptor,
}

struct WgpuView {
    view: wgpu::TextureView,
    texture: u64,
}

struct WgpuFramebuffer {
    color: Option<u64>,
    depth_stencil: Option<u64>,
    color_format: Option<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
    sample_count: u32,
    status: FramebufferStatus,
}

struct WgpuProgram {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_bindings: Vec<u32>,
    textures: Vec<TextureSlotKind>,
}

#[derive(Debug, Clone, Copy)]
enum UniformSource {
    Buffer(u64),
    Arena { chunk: usize, offset: u32, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum UniformKey {
    Null,
    Buffer(u64),
    Arena { chunk: usize, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UniformGroupKey {
    program: u64,
    entries: Vec<UniformKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TextureGroupKey {
    program: u64,
    entries: Vec<Option<(u64, u64)>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u64,
    state: PipelineState,
    layout: VertexBufferLayout,
    color_format: Option<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
    sample_count: u32,
}

struct QuerySlot {
    index: u32,
    issued: u64,
    result: Option<u64>,
}

/// A resolved query range waiting to be mapped
struct QueryReadback {
    buffer: wgpu::Buffer,
    base: u32,
    queries: Vec<(u64, u32, u64)>,
    mapped: Arc<AtomicBool>,
}

/// Transient uniform storage, reset every frame
struct UniformArena {
    chunks: Vec<wgpu::Buffer>,
    chunk: usize,
    offset: u64,
    alignment: u64,
}

impl UniformArena {
    fn reset(&mut self) {
        self.chunk = 0;
        self.offset = 0;
    }

    fn allocate(&mut self, device: &wgpu::Device, size: u64) -> Option<(usize, u64)> {
        if size > ARENA_CHUNK_SIZE {
            return None;
        }
        let mut offset = align_up(self.offset, self.alignment);
        if offset + size > ARENA_CHUNK_SIZE {
            self.chunk += 1;
            offset = 0;
        }
        while self.chunks.len() <= self.chunk {
            log::debug!("WgpuBackend: uniform arena grows to {} chunks", self.chunks.len() + 1);
            self.chunks.push(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("uniform arena"),
                size: ARENA_CHUNK_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }));
        }
        self.offset = offset + size;
        Some((self.chunk, offset))
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Pad `data` to the 4-byte copy alignment wgpu requires.
fn copy_aligned(data: &[u8]) -> Cow<'_, [u8]> {
    let padded = align_up(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
    if padded == data.len() {
        Cow::Borrowed(data)
    } else {
        let mut bytes = data.to_vec();
        bytes.resize(padded, 0);
        Cow::Owned(bytes)
    }
}

/// wgpu backend implementation
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    default_target: Option<DefaultTarget>,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, WgpuTexture>,
    texture_views: HashMap<u64, WgpuView>,
    samplers: HashMap<u64, wgpu::Sampler>,
    programs: HashMap<u64, WgpuProgram>,
    framebuffers: HashMap<u64, WgpuFramebuffer>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,

    // Caches keyed by what the pipeline or bind group was built from
    pipeline_cache: HashMap<PipelineKey, Option<u64>>,
    uniform_group_cache: HashMap<UniformGroupKey, u64>,
    texture_group_cache: HashMap<TextureGroupKey, u64>,

    next_id: u64,

    // GL-style binding state
    state: PipelineState,
    program: Option<u64>,
    uniforms: HashMap<u32, UniformSource>,
    texture_units: HashMap<u32, (u64, u64)>,
    vertex_buffer: Option<(u64, VertexBufferLayout)>,
    index_buffer: Option<(u64, IndexFormat)>,

    arena: UniformArena,
    null_uniform: wgpu::Buffer,
    fallback_color: (wgpu::TextureView, wgpu::Sampler),
    fallback_depth: (wgpu::TextureView, wgpu::Sampler),

    // Occlusion queries
    query_set: wgpu::QuerySet,
    query_resolve: wgpu::Buffer,
    queries: HashMap<u64, QuerySlot>,
    free_query_indices: Vec<u32>,
    frame_queries: Vec<(u64, u32, u64)>,
    active_query: Option<u64>,
    readbacks: Vec<QueryReadback>,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    pending_render_pass: Option<PendingRenderPass>,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
            TextureFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            // uniform blocks are rewritten in place
            result |= wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST;
        }
        result
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

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
            VertexFormat::Sint32x2 => wgpu::VertexFormat::Sint32x2,
            VertexFormat::Sint32x3 => wgpu::VertexFormat::Sint32x3,
            VertexFormat::Sint32x4 => wgpu::VertexFormat::Sint32x4,
        }
    }

    fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
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

    fn convert_stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
        match op {
            StencilOperation::Keep => wgpu::StencilOperation::Keep,
            StencilOperation::Zero => wgpu::StencilOperation::Zero,
            StencilOperation::Replace => wgpu::StencilOperation::Replace,
            StencilOperation::Invert => wgpu::StencilOperation::Invert,
            StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
            StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
            StencilOperation::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
            StencilOperation::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
        }
    }

    fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }

    fn convert_cull_face(face: CullFace) -> Option<wgpu::Face> {
        match face {
            CullFace::Back => Some(wgpu::Face::Back),
            CullFace::Front => Some(wgpu::Face::Front),
            CullFace::None => None,
        }
    }

    fn convert_stencil(stencil: Option<StencilState>) -> wgpu::StencilState {
        let Some(stencil) = stencil else {
            return wgpu::StencilState::default();
        };
        let face = wgpu::StencilFaceState {
            compare: Self::convert_compare_function(stencil.compare),
            fail_op: Self::convert_stencil_operation(stencil.fail_op),
            depth_fail_op: Self::convert_stencil_operation(stencil.depth_fail_op),
            pass_op: Self::convert_stencil_operation(stencil.pass_op),
        };
        wgpu::StencilState {
            front: face,
            back: face,
            read_mask: stencil.read_mask,
            write_mask: stencil.write_mask,
        }
    }
}

impl WgpuBackend {
    /// Wrap a device and queue created by the host.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> BackendResult<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("occlusion queries"),
            ty: wgpu::QueryType::Occlusion,
            count: MAX_QUERIES,
        });
        let query_resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("occlusion resolve"),
            size: MAX_QUERIES as u64 * 8,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let null_uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("null uniform block"),
            size: NULL_UNIFORM_SIZE,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let fallback_color = Self::create_fallback(&device, &queue, false);
        let fallback_depth = Self::create_fallback(&device, &queue, true);

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(BackendError::InitializationFailed(error.to_string()));
        }

        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        log::info!(
            "wgpu backend ready (uniform alignment {}, {} occlusion queries)",
            alignment,
            MAX_QUERIES
        );

        Ok(Self {
            device,
            queue,
            default_target: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
            framebuffers: HashMap::new(),
            render_pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            pipeline_cache: HashMap::new(),
            uniform_group_cache: HashMap::new(),
            texture_group_cache: HashMap::new(),
            next_id: 1,
            state: PipelineState::default(),
            program: None,
            uniforms: HashMap::new(),
            texture_units: HashMap::new(),
            vertex_buffer: None,
            index_buffer: None,
            arena: UniformArena {
                chunks: Vec::new(),
                chunk: 0,
                offset: 0,
                alignment,
            },
            null_uniform,
            fallback_color,
            fallback_depth,
            query_set,
            query_resolve,
            queries: HashMap::new(),
            free_query_indices: (0..MAX_QUERIES).rev().collect(),
            frame_queries: Vec::new(),
            active_query: None,
            readbacks: Vec::new(),
            encoder: None,
            pending_render_pass: None,
        })
    }

    /// 1x1 texture sampled by units nothing was bound to.
    fn create_fallback(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        depth: bool,
    ) -> (wgpu::TextureView, wgpu::Sampler) {
        let size = wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        };
        let format = if depth {
            wgpu::TextureFormat::Depth32Float
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let usage = if depth {
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT
        } else {
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fallback texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        if !depth {
            queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &[255, 255, 255, 255],
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(4),
                    rows_per_image: Some(1),
                },
                size,
            );
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(if depth {
                wgpu::TextureViewDimension::D2Array
            } else {
                wgpu::TextureViewDimension::D2
            }),
            ..Default::default()
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("fallback sampler"),
            compare: depth.then_some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });
        (view, sampler)
    }

    /// Set the view the default framebuffer renders into. Call once per frame
    /// with the acquired swapchain or XR image.
    pub fn set_default_target(
        &mut self,
        color: wgpu::TextureView,
        color_format: wgpu::TextureFormat,
        depth: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    ) {
        self.default_target = Some(DefaultTarget {
            color,
            color_format,
            depth,
        });
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn attachment_info(&self, view: TextureViewHandle) -> Option<AttachmentInfo> {
        let texture = self.texture_views.get(&view.0)?.texture;
        let desc = &self.textures.get(&texture)?.desc;
        Some(AttachmentInfo {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            sample_count: desc.sample_count,
        })
    }

    fn push_command(&mut self, command: RenderCommand) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(command);
        }
    }

    /// Drop cached bind groups that reference a destroyed resource.
    fn evict_bind_groups(&mut self, uses: impl Fn(&[UniformKey], &[Option<(u64, u64)>], u64) -> bool) {
        let mut evicted = Vec::new();
        self.uniform_group_cache.retain(|key, id| {
            let keep = !uses(&key.entries, &[], key.program);
            if !keep {
                evicted.push(*id);
            }
            keep
        });
        self.texture_group_cache.retain(|key, id| {
            let keep = !uses(&[], &key.entries, key.program);
            if !keep {
                evicted.push(*id);
            }
            keep
        });
        for id in evicted {
            self.bind_groups.remove(&id);
        }
    }

    fn pipeline_for(&mut self, key: PipelineKey) -> Option<u64> {
        if let Some(cached) = self.pipeline_cache.get(&key) {
            return *cached;
        }
        let created = self.create_render_pipeline(&key);
        let id = match created {
            Ok(pipeline) => {
                let id = self.next_id();
                self.render_pipelines.insert(id, pipeline);
                log::debug!(
                    "WgpuBackend: pipeline {} built for program {} ({} cached)",
                    id,
                    key.program,
                    self.render_pipelines.len()
                );
                Some(id)
            }
            Err(e) => {
                log::error!("WgpuBackend: {}", e);
                None
            }
        };
        self.pipeline_cache.insert(key, id);
        id
    }

    fn create_render_pipeline(&self, key: &PipelineKey) -> BackendResult<wgpu::RenderPipeline> {
        let program = self
            .programs
            .get(&key.program)
            .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", key.program)))?;
        let state = &key.state;

        let attributes: Vec<wgpu::VertexAttribute> = key
            .layout
            .attributes
            .iter()
            .map(|a| wgpu::VertexAttribute {
                format: Self::convert_vertex_format(a.format),
                offset: a.offset,
                shader_location: a.location,
            })
            .collect();
        let vertex_buffers = [wgpu::VertexBufferLayout {
            array_stride: key.layout.array_stride,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &attributes,
        }];

        let is_triangles = matches!(
            state.topology,
            PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip
        );
        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: state.depth_test && state.depth_write,
            depth_compare: if state.depth_test {
                Self::convert_compare_function(state.depth_compare)
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: if format.has_stencil_aspect() {
                Self::convert_stencil(state.stencil)
            } else {
                wgpu::StencilState::default()
            },
            bias: match state.polygon_offset {
                Some(offset) if is_triangles => wgpu::DepthBiasState {
                    constant: offset.units as i32,
                    slope_scale: offset.factor,
                    clamp: 0.0,
                },
                _ => wgpu::DepthBiasState::default(),
            },
        });

        let blend = state.blend.then(|| wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: Self::convert_blend_factor(state.blend_src),
                dst_factor: Self::convert_blend_factor(state.blend_dst),
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: Self::convert_blend_factor(state.blend_src),
                dst_factor: Self::convert_blend_factor(state.blend_dst),
                operation: wgpu::BlendOperation::Add,
            },
        });
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_format
            .map(|format| wgpu::ColorTargetState {
                format,
                blend,
                write_mask: if state.color_write {
                    wgpu::ColorWrites::ALL
                } else {
                    wgpu::ColorWrites::empty()
                },
            })
            .into_iter()
            .map(Some)
            .collect();

        let (mask, alpha_to_coverage_enabled) = match state.alpha_to_coverage {
            Some(coverage) => (coverage.mask(key.sample_count), key.sample_count > 1),
            None => (!0, false),
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("material pipeline"),
            layout: Some(&program.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &program.vertex,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &vertex_buffers,
            },
            primitive: wgpu::PrimitiveState {
                topology: Self::convert_topology(state.topology),
                strip_index_format: None,
                front_face: match state.front_face {
                    FrontFace::Ccw => wgpu::FrontFace::Ccw,
                    FrontFace::Cw => wgpu::FrontFace::Cw,
                },
                cull_mode: Self::convert_cull_face(state.cull_face),
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: key.sample_count,
                mask,
                alpha_to_coverage_enabled,
            },
            fragment: Some(wgpu::FragmentState {
                module: &program.fragment,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &targets,
            }),
            multiview: None,
        });
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(BackendError::PipelineCreationFailed(error.to_string())),
            None => Ok(pipeline),
        }
    }

    fn uniform_group_for(&mut self, program_id: u64) -> Option<(u64, Vec<u32>)> {
        let program = self.programs.get(&program_id)?;
        let mut entries = Vec::with_capacity(program.uniform_bindings.len());
        let mut offsets = Vec::with_capacity(program.uniform_bindings.len());
        for binding in &program.uniform_bindings {
            match self.uniforms.get(binding) {
                Some(UniformSource::Buffer(id)) if self.buffers.contains_key(id) => {
                    entries.push(UniformKey::Buffer(*id));
                    offsets.push(0);
                }
                Some(UniformSource::Arena { chunk, offset, size }) => {
                    entries.push(UniformKey::Arena {
                        chunk: *chunk,
                        size: *size,
                    });
                    offsets.push(*offset);
                }
                _ => {
                    entries.push(UniformKey::Null);
                    offsets.push(0);
                }
            }
        }

        let key = UniformGroupKey {
            program: program_id,
            entries,
        };
        if let Some(id) = self.uniform_group_cache.get(&key) {
            return Some((*id, offsets));
        }

        let resources: Vec<wgpu::BindGroupEntry> = program
            .uniform_bindings
            .iter()
            .zip(&key.entries)
            .map(|(binding, entry)| {
                let (buffer, size) = match entry {
                    UniformKey::Buffer(id) => (&self.buffers[id], None),
                    UniformKey::Arena { chunk, size } => {
                        (&self.arena.chunks[*chunk], NonZeroU64::new(*size))
                    }
                    UniformKey::Null => (&self.null_uniform, None),
                };
                wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: 0,
                        size,
                    }),
                }
            })
            .collect();
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uniform blocks"),
            layout: &program.uniform_layout,
            entries: &resources,
        });
        let id = self.next_id();
        self.bind_groups.insert(id, group);
        self.uniform_group_cache.insert(key, id);
        Some((id, offsets))
    }

    fn texture_group_for(&mut self, program_id: u64) -> Option<u64> {
        let program = self.programs.get(&program_id)?;
        let entries: Vec<Option<(u64, u64)>> = (0..program.textures.len() as u32)
            .map(|unit| {
                self.texture_units.get(&unit).copied().filter(|(view, sampler)| {
                    self.texture_views.contains_key(view) && self.samplers.contains_key(sampler)
                })
            })
            .collect();

        let key = TextureGroupKey {
            program: program_id,
            entries,
        };
        if let Some(id) = self.texture_group_cache.get(&key) {
            return Some(*id);
        }

        let mut resources = Vec::with_capacity(key.entries.len() * 2);
        for (unit, (entry, kind)) in key.entries.iter().zip(&program.textures).enumerate() {
            let (view, sampler) = match (entry, kind) {
                (Some((view, sampler)), _) => (&self.texture_views[view].view, &self.samplers[sampler]),
                (None, TextureSlotKind::Color2d) => (&self.fallback_color.0, &self.fallback_color.1),
                (None, TextureSlotKind::DepthArray) => (&self.fallback_depth.0, &self.fallback_depth.1),
            };
            resources.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2,
                resource: wgpu::BindingResource::TextureView(view),
            });
            resources.push(wgpu::BindGroupEntry {
                binding: unit as u32 * 2 + 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texture units"),
            layout: &program.texture_layout,
            entries: &resources,
        });
        let id = self.next_id();
        self.bind_groups.insert(id, group);
        self.texture_group_cache.insert(key, id);
        Some(id)
    }

    /// Resolve the accumulated GL-style state into pipeline and bind group
    /// commands for the next draw. Returns false when the draw must be skipped.
    fn prepare_draw(&mut self) -> bool {
        let Some(pending) = self.pending_render_pass.as_ref() else {
            log::warn!("WgpuBackend: draw outside a render pass");
            return false;
        };
        let Some(program) = self.program else {
            log::warn!("WgpuBackend: draw without a program");
            return false;
        };
        let Some((vertex_buffer, layout)) = self.vertex_buffer.clone() else {
            log::warn!("WgpuBackend: draw without a vertex buffer");
            return false;
        };

        let key = PipelineKey {
            program,
            state: self.state,
            layout,
            color_format: pending.color_format,
            depth_format: pending.depth_format,
            sample_count: pending.sample_count,
        };
        let last_pipeline = pending.last_pipeline;
        let Some(pipeline) = self.pipeline_for(key) else {
            return false;
        };
        let Some((uniform_group, offsets)) = self.uniform_group_for(program) else {
            return false;
        };
        let Some(texture_group) = self.texture_group_for(program) else {
            return false;
        };

        if last_pipeline != Some(pipeline) {
            self.push_command(RenderCommand::SetPipeline(pipeline));
            if let Some(ref mut pending) = self.pending_render_pass {
                pending.last_pipeline = Some(pipeline);
            }
        }
        self.push_command(RenderCommand::SetBindGroup {
            index: 0,
            bind_group: uniform_group,
            offsets,
        });
        self.push_command(RenderCommand::SetBindGroup {
            index: 1,
            bind_group: texture_group,
            offsets: Vec::new(),
        });
        self.push_command(RenderCommand::SetVertexBuffer(vertex_buffer));
        if let Some(stencil) = self.state.stencil {
            self.push_command(RenderCommand::SetStencilReference(stencil.reference));
        }
        true
    }

    /// Move finished readbacks into the query results.
    fn collect_readbacks(&mut self) {
        let mut index = 0;
        while index < self.readbacks.len() {
            if !self.readbacks[index].mapped.load(Ordering::Acquire) {
                index += 1;
                continue;
            }
            let readback = self.readbacks.swap_remove(index);
            {
                let data = readback.buffer.slice(..).get_mapped_range();
                let values: Vec<u64> = data
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect();
                for (query, slot_index, issued) in &readback.queries {
                    let Some(slot) = self.queries.get_mut(query) else {
                        continue;
                    };
                    // a reissued query waits for its own readback
                    if slot.issued != *issued {
                        continue;
                    }
                    let offset = (slot_index - readback.base) as usize;
                    slot.result = values.get(offset).copied();
                }
            }
            readback.buffer.unmap();
        }
    }

    /// Resolve this frame's queries into a mappable buffer.
    fn resolve_queries(&mut self, encoder: &mut wgpu::CommandEncoder) -> Option<QueryReadback> {
        if self.frame_queries.is_empty() {
            return None;
        }
        let queries = std::mem::take(&mut self.frame_queries);
        let base = queries.iter().map(|(_, index, _)| *index).min()?;
        let end = queries.iter().map(|(_, index, _)| *index).max()? + 1;
        let size = (end - base) as u64 * 8;

        encoder.resolve_query_set(&self.query_set, base..end, &self.query_resolve, 0);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("occlusion readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&self.query_resolve, 0, &buffer, 0, size);
        Some(QueryReadback {
            buffer,
            base,
            queries,
            mapped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn view_for_target(&self, target: PassTarget, depth: bool) -> Option<&wgpu::TextureView> {
        match target {
            PassTarget::Default => {
                let default = self.default_target.as_ref()?;
                if depth {
                    default.depth.as_ref().map(|(view, _)| view)
                } else {
                    Some(&default.color)
                }
            }
            PassTarget::Framebuffer(id) => {
                let framebuffer = self.framebuffers.get(&id)?;
                let view = if depth {
                    framebuffer.depth_stencil?
                } else {
                    framebuffer.color?
                };
                self.texture_views.get(&view).map(|v| &v.view)
            }
        }
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            multiview: false,
            occlusion_queries: true,
            max_samples: 4,
        }
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        if self.encoder.is_some() {
            log::warn!("WgpuBackend: begin_frame called twice");
        }
        self.encoder = Some(self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame encoder"),
        }));
        self.arena.reset();
        self.uniforms
            .retain(|_, source| matches!(source, UniformSource::Buffer(_)));
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if self.pending_render_pass.is_some() {
            log::warn!("WgpuBackend: frame ended inside a render pass");
            self.end_render_pass();
        }
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(());
        };

        let readback = self.resolve_queries(&mut encoder);
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(readback) = readback {
            let mapped = readback.mapped.clone();
            readback
                .buffer
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| match result {
                    Ok(()) => mapped.store(true, Ordering::Release),
                    Err(e) => log::error!("WgpuBackend: occlusion readback failed: {}", e),
                });
            self.readbacks.push(readback);
        }
        let _ = self.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: align_up(desc.size.max(4), wgpu::COPY_BUFFER_ALIGNMENT),
            usage: Self::convert_buffer_usage(desc.usage),
            mapped_at_creation: false,
        });
        let id = self.next_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let mut contents = data.to_vec();
        let size = align_up(
            desc.size.max(data.len() as u64).max(4),
            wgpu::COPY_BUFFER_ALIGNMENT,
        );
        contents.resize(size as usize, 0);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: desc.label.as_deref(),
            contents: &contents,
            usage: Self::convert_buffer_usage(desc.usage),
        });
        let id = self.next_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        match self.buffers.get(&buffer.0) {
            Some(buf) if offset + data.len() as u64 <= buf.size() => {
                self.queue.write_buffer(buf, offset, &copy_aligned(data));
            }
            Some(buf) => log::error!(
                "WgpuBackend: write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                buf.size()
            ),
            None => log::error!("WgpuBackend: write to unknown buffer {:?}", buffer),
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized texture {:?}",
                desc.label
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let id = self.next_id();
        self.textures.insert(
            id,
            WgpuTexture {
                texture,
                desc: desc.clone(),
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        let view_desc = match desc.dimension {
            TextureViewDimension::Layer(layer) => {
                if layer >= tex.desc.layers {
                    return Err(BackendError::TextureCreationFailed(format!(
                        "layer {} out of range ({} layers)",
                        layer, tex.desc.layers
                    )));
                }
                wgpu::TextureViewDescriptor {
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                }
            }
            TextureViewDimension::Array => wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                // sampled depth-stencil views see only depth
                aspect: if tex.desc.format.has_stencil() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
                ..Default::default()
            },
        };
        let view = tex.texture.create_view(&view_desc);
        let id = self.next_id();
        self.texture_views.insert(
            id,
            WgpuView {
                view,
                texture: texture.0,
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        let Some(tex) = self.textures.get(&texture.0) else {
            log::error!("WgpuBackend: write to unknown texture {:?}", texture);
            return;
        };
        let bytes_per_row = width * tex.desc.format.bytes_per_pixel();
        if data.len() < (bytes_per_row * height) as usize {
            log::error!(
                "WgpuBackend: {} bytes do not cover a {}x{} texture",
                data.len(),
                width,
                height
            );
            return;
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: Self::convert_address_mode(desc.address_mode_u),
            address_mode_v: Self::convert_address_mode(desc.address_mode_v),
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: Self::convert_filter_mode(desc.mag_filter),
            min_filter: Self::convert_filter_mode(desc.min_filter),
            mipmap_filter: Self::convert_filter_mode(desc.mipmap_filter),
            compare: desc.compare.map(Self::convert_compare_function),
            ..Default::default()
        });
        let id = self.next_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        if desc.multiview {
            return Err(BackendError::ProgramCreationFailed(
                "multiview not supported by device".to_string(),
            ));
        }
        let label = desc.label.as_deref();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vertex = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Borrowed(&desc.vertex_source),
                stage: wgpu::naga::ShaderStage::Vertex,
                defines: Default::default(),
            },
        });
        let fragment = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Glsl {
                shader: Cow::Borrowed(&desc.fragment_source),
                stage: wgpu::naga::ShaderStage::Fragment,
                defines: Default::default(),
            },
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ProgramCreationFailed(format!(
                "{:?}: {}",
                desc.label, error
            )));
        }

        let uniform_entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .uniform_bindings
            .iter()
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding: *binding,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let mut texture_entries = Vec::with_capacity(desc.textures.len() * 2);
        for (unit, kind) in desc.textures.iter().enumerate() {
            let (sample_type, view_dimension, sampler) = match kind {
                TextureSlotKind::Color2d => (
                    wgpu::TextureSampleType::Float { filterable: true },
                    wgpu::TextureViewDimension::D2,
                    wgpu::SamplerBindingType::Filtering,
                ),
                TextureSlotKind::DepthArray => (
                    wgpu::TextureSampleType::Depth,
                    wgpu::TextureViewDimension::D2Array,
                    wgpu::SamplerBindingType::Comparison,
                ),
            };
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: unit as u32 * 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type,
                    view_dimension,
                    multisampled: false,
                },
                count: None,
            });
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: unit as u32 * 2 + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(sampler),
                count: None,
            });
        }

        let uniform_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("uniform blocks"),
            entries: &uniform_entries,
        });
        let texture_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("texture units"),
            entries: &texture_entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label,
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let id = self.next_id();
        self.programs.insert(
            id,
            WgpuProgram {
                vertex,
                fragment,
                uniform_layout,
                texture_layout,
                pipeline_layout,
                uniform_bindings: desc.uniform_bindings.clone(),
                textures: desc.textures.clone(),
            },
        );
        log::debug!("WgpuBackend: program {:?} compiled", desc.label);
        Ok(ProgramHandle(id))
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let color = desc.color.and_then(|v| self.attachment_info(v));
        let depth = desc.depth_stencil.and_then(|v| self.attachment_info(v));
        let status = match check_framebuffer_complete(color, depth) {
            Ok(()) => FramebufferStatus::Complete,
            Err(reason) => FramebufferStatus::Incomplete(reason),
        };
        let id = self.next_id();
        self.framebuffers.insert(
            id,
            WgpuFramebuffer {
                color: desc.color.map(|v| v.0),
                depth_stencil: desc.depth_stencil.map(|v| v.0),
                color_format: color.map(|c| Self::convert_texture_format(c.format)),
                depth_format: depth.map(|d| Self::convert_texture_format(d.format)),
                sample_count: desc.sample_count.max(1),
                status,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn framebuffer_status(&self, framebuffer: FramebufferHandle) -> FramebufferStatus {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|f| f.status.clone())
            .unwrap_or_else(|| FramebufferStatus::Incomplete("unknown framebuffer".to_string()))
    }

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle> {
        let index = self
            .free_query_indices
            .pop()
            .ok_or_else(|| BackendError::QueryFailed(format!("all {} queries in use", MAX_QUERIES)))?;
        let id = self.next_id();
        self.queries.insert(
            id,
            QuerySlot {
                index,
                issued: 0,
                result: None,
            },
        );
        Ok(QueryHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if self.pending_render_pass.is_some() {
            log::warn!("WgpuBackend: render pass {:?} begun inside another pass", desc.label);
            self.end_render_pass();
        }

        let (target, color_format, depth_format, sample_count) = match desc.framebuffer {
            None => match self.default_target.as_ref() {
                Some(default) => (
                    PassTarget::Default,
                    Some(default.color_format),
                    default.depth.as_ref().map(|(_, format)| *format),
                    1,
                ),
                None => {
                    log::error!("WgpuBackend: no default target set, pass {:?} dropped", desc.label);
                    return;
                }
            },
            Some(handle) => match self.framebuffers.get(&handle.0) {
                Some(fb) if fb.status.is_complete() => (
                    PassTarget::Framebuffer(handle.0),
                    fb.color_format,
                    fb.depth_format,
                    fb.sample_count,
                ),
                Some(fb) => {
                    log::error!("WgpuBackend: framebuffer {:?} incomplete: {:?}", handle, fb.status);
                    return;
                }
                None => {
                    log::error!("WgpuBackend: unknown framebuffer {:?}", handle);
                    return;
                }
            },
        };

        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            target,
            color_format,
            depth_format,
            sample_count,
            commands: Vec::new(),
            last_pipeline: None,
            uses_queries: false,
        });
    }

    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_render_pass.take() else {
            return;
        };
        let Some(mut encoder) = self.encoder.take() else {
            log::warn!("WgpuBackend: render pass ended outside a frame");
            return;
        };

        {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = self
                .view_for_target(pending.target, false)
                .filter(|_| pending.color_format.is_some())
                .map(|view| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: match pending.descriptor.clear_color {
                            Some(color) => wgpu::LoadOp::Clear(wgpu::Color {
                                r: color[0] as f64,
                                g: color[1] as f64,
                                b: color[2] as f64,
                                a: color[3] as f64,
                            }),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })
                .into_iter()
                .map(Some)
                .collect();

            let depth_attachment = self.view_for_target(pending.target, true).map(|view| {
                let has_stencil = pending
                    .depth_format
                    .map(|f| f.has_stencil_aspect())
                    .unwrap_or(false);
                wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: match pending.descriptor.clear_depth {
                            Some(depth) => wgpu::LoadOp::Clear(depth),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: has_stencil.then(|| wgpu::Operations {
                        load: match pending.descriptor.clear_stencil {
                            Some(stencil) => wgpu::LoadOp::Clear(stencil),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                }
            });

            // Create render pass and execute all buffered commands
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.descriptor.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: pending.uses_queries.then_some(&self.query_set),
            });

            for cmd in &pending.commands {
                match cmd {
                    RenderCommand::SetPipeline(id) => {
                        if let Some(pipeline) = self.render_pipelines.get(id) {
                            render_pass.set_pipeline(pipeline);
                        }
                    }
                    RenderCommand::SetBindGroup { index, bind_group, offsets } => {
                        if let Some(bg) = self.bind_groups.get(bind_group) {
                            render_pass.set_bind_group(*index, bg, offsets);
                        }
                    }
                    RenderCommand::SetVertexBuffer(buffer) => {
                        if let Some(buf) = self.buffers.get(buffer) {
                            render_pass.set_vertex_buffer(0, buf.slice(..));
                        }
                    }
                    RenderCommand::SetIndexBuffer { buffer, format } => {
                        if let Some(buf) = self.buffers.get(buffer) {
                            let wgpu_format = match format {
                                IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
                                IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
                            };
                            render_pass.set_index_buffer(buf.slice(..), wgpu_format);
                        }
                    }
                    RenderCommand::SetViewport { x, y, width, height } => {
                        render_pass.set_viewport(*x, *y, *width, *height, 0.0, 1.0);
                    }
                    RenderCommand::SetScissorRect { x, y, width, height } => {
                        render_pass.set_scissor_rect(*x, *y, *width, *height);
                    }
                    RenderCommand::SetStencilReference(reference) => {
                        render_pass.set_stencil_reference(*reference);
                    }
                    RenderCommand::Draw { vertices, instances } => {
                        render_pass.draw(vertices.clone(), instances.clone());
                    }
                    RenderCommand::DrawIndexed { indices, base_vertex, instances } => {
                        render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                    RenderCommand::BeginOcclusionQuery(index) => {
                        render_pass.begin_occlusion_query(*index);
                    }
                    RenderCommand::EndOcclusionQuery => {
                        render_pass.end_occlusion_query();
                    }
                }
            }
        }

        self.encoder = Some(encoder);
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.push_command(RenderCommand::SetViewport { x, y, width, height });
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.push_command(RenderCommand::SetScissorRect { x, y, width, height });
    }

    fn apply_state(&mut self, change: StateChange) {
        if let StateChange::LineWidth(width) = change {
            if width != 1.0 {
                log::trace!("WgpuBackend: line width {} not supported, drawing at 1.0", width);
            }
        }
        self.state.apply(change);
    }

    fn use_program(&mut self, program: ProgramHandle) {
        if !self.programs.contains_key(&program.0) {
            log::warn!("WgpuBackend: use of unknown program {:?}", program);
        }
        self.program = Some(program.0);
    }

    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle) {
        self.uniforms.insert(binding, UniformSource::Buffer(buffer.0));
    }

    fn push_uniforms(&mut self, binding: u32, data: &[u8]) {
        let data = copy_aligned(data);
        let size = data.len() as u64;
        let Some((chunk, offset)) = self.arena.allocate(&self.device, size) else {
            log::error!("WgpuBackend: uniform block of {} bytes exceeds the arena chunk", size);
            return;
        };
        self.queue.write_buffer(&self.arena.chunks[chunk], offset, &data);
        self.uniforms.insert(
            binding,
            UniformSource::Arena {
                chunk,
                offset: offset as u32,
                size,
            },
        );
    }

    fn bind_texture(&mut self, unit: u32, view: TextureViewHandle, sampler: SamplerHandle) {
        self.texture_units.insert(unit, (view.0, sampler.0));
    }

    fn set_vertex_buffer(&mut self, buffer: BufferHandle, layout: &VertexBufferLayout) {
        self.vertex_buffer = Some((buffer.0, layout.clone()));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat) {
        self.index_buffer = Some((buffer.0, format));
        self.push_command(RenderCommand::SetIndexBuffer {
            buffer: buffer.0,
            format,
        });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if self.prepare_draw() {
            self.push_command(RenderCommand::Draw { vertices, instances });
        }
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if self.index_buffer.is_none() {
            log::warn!("WgpuBackend: indexed draw without an index buffer");
            return;
        }
        if self.prepare_draw() {
            self.push_command(RenderCommand::DrawIndexed {
                indices,
                base_vertex,
                instances,
            });
        }
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        if self.pending_render_pass.is_none() {
            log::warn!("WgpuBackend: occlusion query {:?} begun outside a pass", query);
            return;
        }
        let Some(slot) = self.queries.get_mut(&query.0) else {
            log::warn!("WgpuBackend: unknown occlusion query {:?}", query);
            return;
        };
        slot.issued += 1;
        slot.result = None;
        let (index, issued) = (slot.index, slot.issued);
        self.frame_queries.push((query.0, index, issued));
        self.active_query = Some(query.0);
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.uses_queries = true;
            pending.commands.push(RenderCommand::BeginOcclusionQuery(index));
        }
    }

    fn end_occlusion_query(&mut self) {
        if self.active_query.take().is_some() {
            self.push_command(RenderCommand::EndOcclusionQuery);
        }
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.collect_readbacks();
        self.queries.get(&query.0).and_then(|slot| slot.result)
    }

    fn resolve_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        if self.pending_render_pass.is_some() {
            log::warn!("WgpuBackend: resolve inside a render pass");
            return;
        }
        let (Some(src), Some(dst)) = (self.textures.get(&src.0), self.textures.get(&dst.0)) else {
            log::error!("WgpuBackend: resolve between unknown textures");
            return;
        };
        let Some(encoder) = self.encoder.as_mut() else {
            log::warn!("WgpuBackend: resolve outside a frame");
            return;
        };
        let src_view = src.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let dst_view = dst.texture.create_view(&wgpu::TextureViewDescriptor::default());
        // an empty pass that loads and resolves
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("msaa resolve"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &src_view,
                resolve_target: Some(&dst_view),
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(&buffer.0) {
            buf.destroy();
        }
        self.uniforms
            .retain(|_, source| !matches!(source, UniformSource::Buffer(id) if *id == buffer.0));
        self.evict_bind_groups(|uniforms, _, _| uniforms.contains(&UniformKey::Buffer(buffer.0)));
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            tex.texture.destroy();
        }
        let views: Vec<u64> = self
            .texture_views
            .iter()
            .filter(|(_, v)| v.texture == texture.0)
            .map(|(id, _)| *id)
            .collect();
        for view in &views {
            self.texture_views.remove(view);
        }
        self.texture_units.retain(|_, (view, _)| !views.contains(view));
        self.evict_bind_groups(|_, textures, _| {
            textures
                .iter()
                .flatten()
                .any(|(view, _)| views.contains(view))
        });
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
        let mut dropped = Vec::new();
        self.pipeline_cache.retain(|key, id| {
            let keep = key.program != program.0;
            if !keep {
                dropped.extend(*id);
            }
            keep
        });
        for id in dropped {
            self.render_pipelines.remove(&id);
        }
        self.evict_bind_groups(|_, _, owner| owner == program.0);
        if self.program == Some(program.0) {
            self.program = None;
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn destroy_query(&mut self, query: QueryHandle) {
        if let Some(slot) = self.queries.remove(&query.0) {
            self.free_query_indices.push(slot.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_copy_aligned_pads_to_four_bytes() {
        assert!(matches!(copy_aligned(&[1, 2, 3, 4]), Cow::Borrowed(_)));
        assert_eq!(copy_aligned(&[1, 2, 3, 4, 5]).as_ref(), &[1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn test_cull_face_conversion() {
        assert_eq!(WgpuBackend::convert_cull_face(CullFace::None), None);
        assert_eq!(
            WgpuBackend::convert_cull_face(CullFace::Front),
            Some(wgpu::Face::Front)
        );
    }

    #[test]
    fn test_disabled_stencil_is_default() {
        assert_eq!(WgpuBackend::convert_stencil(None), wgpu::StencilState::default());
    }
}
