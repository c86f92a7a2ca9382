//! Core backend abstraction traits
//!
//! The renderer drives every backend through [`GraphicsBackend`]: a GL-style
//! immediate interface (bind, set state, draw). Explicit backends translate
//! the accumulated [`PipelineState`] into cached pipelines at draw time.

use crate::backend::types::*;
use std::ops::Range;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create program: {0}")]
    ProgramCreationFailed(String),
    #[error("Framebuffer incomplete: {0}")]
    FramebufferIncomplete(String),
    #[error("Occlusion query failed: {0}")]
    QueryFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a linked shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u64);

/// Handle to a framebuffer (a set of attachments)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to an occlusion query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHandle(pub(crate) u64);

/// Kind of texture a program samples at a given unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSlotKind {
    Color2d,
    /// Layered depth texture sampled with comparison (shadow maps)
    DepthArray,
}

/// Program descriptor. Sources are GLSL 300 es / 450 style text.
#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub label: Option<String>,
    pub vertex_source: String,
    pub fragment_source: String,
    /// Uniform block binding points used by the program
    pub uniform_bindings: Vec<u32>,
    /// Texture units in order; unit `i` lives at bindings `2i`/`2i+1` of set 1
    pub textures: Vec<TextureSlotKind>,
    pub multiview: bool,
}

/// Framebuffer descriptor
#[derive(Debug, Clone)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub color: Option<TextureViewHandle>,
    pub depth_stencil: Option<TextureViewHandle>,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
}

/// Result of a framebuffer completeness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    Incomplete(String),
}

impl FramebufferStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, FramebufferStatus::Complete)
    }
}

/// Render pass descriptor. `None` clear values load the previous contents.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub framebuffer: Option<FramebufferHandle>,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
    pub clear_stencil: Option<u32>,
}

/// Optional features a backend may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub multiview: bool,
    pub occlusion_queries: bool,
    pub max_samples: u32,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            multiview: false,
            occlusion_queries: true,
            max_samples: 4,
        }
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Main graphics backend trait
pub trait GraphicsBackend {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Begin a new frame
    fn begin_frame(&mut self) -> BackendResult<()>;

    /// Submit all work recorded this frame
    fn end_frame(&mut self) -> BackendResult<()>;

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Create a buffer with initial data
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> BackendResult<BufferHandle>;

    /// Write data to a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view
    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle>;

    /// Write RGBA data to layer 0 of a texture
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32);

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    /// Compile and link a shader program
    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle>;

    /// Create a framebuffer from existing attachment views
    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    fn framebuffer_status(&self, framebuffer: FramebufferHandle) -> FramebufferStatus;

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle>;

    // Command recording

    /// Begin a render pass. `framebuffer: None` targets the default framebuffer.
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// End the current render pass
    fn end_render_pass(&mut self);

    /// Set viewport
    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32);

    /// Set scissor rect
    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32);

    /// Change one piece of fixed-function state
    fn apply_state(&mut self, change: StateChange);

    fn use_program(&mut self, program: ProgramHandle);

    /// Bind a persistent uniform buffer at a binding point
    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle);

    /// Bind transient uniform data valid for the next draw only
    fn push_uniforms(&mut self, binding: u32, data: &[u8]);

    fn bind_texture(&mut self, unit: u32, view: TextureViewHandle, sampler: SamplerHandle);

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, buffer: BufferHandle, layout: &VertexBufferLayout);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat);

    /// Draw primitives
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    /// Draw indexed primitives
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    fn begin_occlusion_query(&mut self, query: QueryHandle);

    fn end_occlusion_query(&mut self);

    /// Non-blocking poll. `None` until the result is available.
    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64>;

    /// Resolve a multisampled texture into a single-sampled one
    fn resolve_texture(&mut self, src: TextureHandle, dst: TextureHandle);

    // Resource cleanup

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Destroy a texture and its views
    fn destroy_texture(&mut self, texture: TextureHandle);

    fn destroy_program(&mut self, program: ProgramHandle);

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn destroy_query(&mut self, query: QueryHandle);
}
