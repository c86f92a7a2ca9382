//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform GPU work. It validates resources the way a
//! real driver would (framebuffer completeness, handle lookups) and records
//! every command so tests can inspect the exact sequence the renderer issued.

use std::collections::HashMap;
use std::ops::Range;

use super::traits::*;
use super::types::*;

/// A command recorded by [`DummyBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginFrame,
    EndFrame,
    CreateBuffer(BufferHandle),
    CreateTexture(TextureHandle),
    CreateProgram(ProgramHandle),
    CreateFramebuffer(FramebufferHandle),
    WriteBuffer { buffer: BufferHandle, len: usize },
    WriteTexture(TextureHandle),
    BeginRenderPass {
        framebuffer: Option<FramebufferHandle>,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
        clear_stencil: Option<u32>,
    },
    EndRenderPass,
    SetViewport { width: f32, height: f32 },
    SetScissor { width: u32, height: u32 },
    State(StateChange),
    UseProgram(ProgramHandle),
    BindUniformBuffer { binding: u32, buffer: BufferHandle },
    PushUniforms { binding: u32, data: Vec<u8> },
    BindTexture { unit: u32, view: TextureViewHandle, sampler: SamplerHandle },
    SetVertexBuffer(BufferHandle),
    SetIndexBuffer(BufferHandle, IndexFormat),
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, instances: Range<u32> },
    BeginOcclusionQuery(QueryHandle),
    EndOcclusionQuery,
    ResolveTexture { src: TextureHandle, dst: TextureHandle },
}

#[derive(Debug)]
struct DummyView {
    texture: TextureHandle,
}

#[derive(Debug)]
struct DummyFramebuffer {
    status: FramebufferStatus,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    capabilities: BackendCapabilities,
    next_id: u64,
    buffers: HashMap<u64, u64>,
    textures: HashMap<u64, TextureDescriptor>,
    views: HashMap<u64, DummyView>,
    framebuffers: HashMap<u64, DummyFramebuffer>,
    programs: HashMap<u64, ProgramDescriptor>,
    queries: HashMap<u64, Option<u64>>,
    state: PipelineState,
    in_pass: bool,
    fail_programs: bool,
    commands: Vec<RecordedCommand>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::with_capabilities(BackendCapabilities::default())
    }

    pub fn with_capabilities(capabilities: BackendCapabilities) -> Self {
        Self {
            capabilities,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            queries: HashMap::new(),
            state: PipelineState::default(),
            in_pass: false,
            fail_programs: false,
            commands: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: RecordedCommand) {
        self.commands.push(command);
    }

    /// All commands recorded so far.
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Drain the recorded commands.
    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Make an occlusion query result available to the next poll.
    pub fn complete_query(&mut self, query: QueryHandle, samples: u64) {
        if let Some(result) = self.queries.get_mut(&query.0) {
            *result = Some(samples);
        }
    }

    /// Make every subsequent `create_program` call fail.
    pub fn set_fail_programs(&mut self, fail: bool) {
        self.fail_programs = fail;
    }

    /// Current accumulated fixed-function state.
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Texture a view was created from.
    pub fn view_texture(&self, view: TextureViewHandle) -> Option<TextureHandle> {
        self.views.get(&view.0).map(|v| v.texture)
    }

    pub fn program_descriptor(&self, program: ProgramHandle) -> Option<&ProgramDescriptor> {
        self.programs.get(&program.0)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn attachment_info(&self, view: TextureViewHandle) -> Option<AttachmentInfo> {
        let texture = self.views.get(&view.0)?.texture;
        let desc = self.textures.get(&texture.0)?;
        Some(AttachmentInfo {
            width: desc.width,
            height: desc.height,
            format: desc.format,
            sample_count: desc.sample_count,
        })
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        self.record(RecordedCommand::BeginFrame);
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if self.in_pass {
            log::warn!("DummyBackend: frame ended inside a render pass");
            self.in_pass = false;
        }
        self.record(RecordedCommand::EndFrame);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.next_id();
        self.buffers.insert(id, desc.size);
        let handle = BufferHandle(id);
        self.record(RecordedCommand::CreateBuffer(handle));
        Ok(handle)
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(&BufferDescriptor {
            size: desc.size.max(data.len() as u64),
            ..desc.clone()
        })?;
        self.write_buffer(handle, 0, data);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        match self.buffers.get(&buffer.0) {
            Some(size) if offset + data.len() as u64 <= *size => {
                self.record(RecordedCommand::WriteBuffer {
                    buffer,
                    len: data.len(),
                });
            }
            Some(size) => log::error!(
                "DummyBackend: write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                size
            ),
            None => log::error!("DummyBackend: write to unknown buffer {:?}", buffer),
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.layers
        );
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized texture {:?}",
                desc.label
            )));
        }
        let id = self.next_id();
        self.textures.insert(id, desc.clone());
        let handle = TextureHandle(id);
        self.record(RecordedCommand::CreateTexture(handle));
        Ok(handle)
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let layers = self
            .textures
            .get(&texture.0)
            .map(|t| t.layers)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        if let TextureViewDimension::Layer(layer) = desc.dimension {
            if layer >= layers {
                return Err(BackendError::TextureCreationFailed(format!(
                    "layer {} out of range ({} layers)",
                    layer, layers
                )));
            }
        }
        let id = self.next_id();
        self.views.insert(id, DummyView { texture });
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "DummyBackend: writing {} bytes to texture {:?} ({}x{})",
            data.len(),
            texture,
            width,
            height
        );
        self.record(RecordedCommand::WriteTexture(texture));
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.next_id()))
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        if self.fail_programs {
            return Err(BackendError::ProgramCreationFailed(format!(
                "{:?}: forced failure",
                desc.label
            )));
        }
        if desc.vertex_source.trim().is_empty() || desc.fragment_source.trim().is_empty() {
            return Err(BackendError::ProgramCreationFailed(format!(
                "{:?}: empty shader source",
                desc.label
            )));
        }
        if desc.multiview && !self.capabilities.multiview {
            return Err(BackendError::ProgramCreationFailed(
                "multiview not supported by device".to_string(),
            ));
        }
        let id = self.next_id();
        self.programs.insert(id, desc.clone());
        let handle = ProgramHandle(id);
        self.record(RecordedCommand::CreateProgram(handle));
        Ok(handle)
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
        self.framebuffers.insert(id, DummyFramebuffer { status });
        let handle = FramebufferHandle(id);
        self.record(RecordedCommand::CreateFramebuffer(handle));
        Ok(handle)
    }

    fn framebuffer_status(&self, framebuffer: FramebufferHandle) -> FramebufferStatus {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|f| f.status.clone())
            .unwrap_or_else(|| FramebufferStatus::Incomplete("unknown framebuffer".to_string()))
    }

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle> {
        if !self.capabilities.occlusion_queries {
            return Err(BackendError::QueryFailed("occlusion queries unsupported".into()));
        }
        let id = self.next_id();
        self.queries.insert(id, None);
        Ok(QueryHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if self.in_pass {
            log::warn!("DummyBackend: render pass {:?} begun inside another pass", desc.label);
        }
        self.in_pass = true;
        self.record(RecordedCommand::BeginRenderPass {
            framebuffer: desc.framebuffer,
            clear_color: desc.clear_color,
            clear_depth: desc.clear_depth,
            clear_stencil: desc.clear_stencil,
        });
    }

    fn end_render_pass(&mut self) {
        self.in_pass = false;
        self.record(RecordedCommand::EndRenderPass);
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32) {
        self.record(RecordedCommand::SetViewport { width, height });
    }

    fn set_scissor_rect(&mut self, _x: u32, _y: u32, width: u32, height: u32) {
        self.record(RecordedCommand::SetScissor { width, height });
    }

    fn apply_state(&mut self, change: StateChange) {
        self.state.apply(change);
        self.record(RecordedCommand::State(change));
    }

    fn use_program(&mut self, program: ProgramHandle) {
        self.record(RecordedCommand::UseProgram(program));
    }

    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle) {
        self.record(RecordedCommand::BindUniformBuffer { binding, buffer });
    }

    fn push_uniforms(&mut self, binding: u32, data: &[u8]) {
        self.record(RecordedCommand::PushUniforms {
            binding,
            data: data.to_vec(),
        });
    }

    fn bind_texture(&mut self, unit: u32, view: TextureViewHandle, sampler: SamplerHandle) {
        self.record(RecordedCommand::BindTexture {
            unit,
            view,
            sampler,
        });
    }

    fn set_vertex_buffer(&mut self, buffer: BufferHandle, _layout: &VertexBufferLayout) {
        self.record(RecordedCommand::SetVertexBuffer(buffer));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat) {
        self.record(RecordedCommand::SetIndexBuffer(buffer, format));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RecordedCommand::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, _base_vertex: i32, instances: Range<u32>) {
        self.record(RecordedCommand::DrawIndexed { indices, instances });
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        // a reissued query has no result until completed again
        if let Some(result) = self.queries.get_mut(&query.0) {
            *result = None;
        }
        self.record(RecordedCommand::BeginOcclusionQuery(query));
    }

    fn end_occlusion_query(&mut self) {
        self.record(RecordedCommand::EndOcclusionQuery);
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        self.queries.get(&query.0).copied().flatten()
    }

    fn resolve_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        self.record(RecordedCommand::ResolveTexture { src, dst });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.views.retain(|_, v| v.texture != texture);
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn destroy_query(&mut self, query: QueryHandle) {
        self.queries.remove(&query.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture_desc(format: TextureFormat, width: u32) -> TextureDescriptor {
        TextureDescriptor {
            label: Some("test".into()),
            width,
            height: 64,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
            ..Default::default()
        }
    }

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy Backend");
    }

    #[test]
    fn test_dummy_framebuffer_status() {
        let mut backend = DummyBackend::new();
        let color = backend
            .create_texture(&texture_desc(TextureFormat::Rgba8Unorm, 64))
            .unwrap();
        let depth = backend
            .create_texture(&texture_desc(TextureFormat::Depth24Plus, 32))
            .unwrap();
        let color_view = backend
            .create_texture_view(color, &TextureViewDescriptor::default())
            .unwrap();
        let depth_view = backend
            .create_texture_view(depth, &TextureViewDescriptor::default())
            .unwrap();

        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color: Some(color_view),
                depth_stencil: Some(depth_view),
                width: 64,
                height: 64,
                sample_count: 1,
            })
            .unwrap();
        assert!(!backend.framebuffer_status(fb).is_complete());
    }

    #[test]
    fn test_dummy_query_completion() {
        let mut backend = DummyBackend::new();
        let query = backend.create_occlusion_query().unwrap();
        assert_eq!(backend.poll_occlusion_query(query), None);
        backend.complete_query(query, 12);
        assert_eq!(backend.poll_occlusion_query(query), Some(12));
    }

    #[test]
    fn test_dummy_records_state() {
        let mut backend = DummyBackend::new();
        backend.apply_state(StateChange::DepthTest(false));
        assert!(!backend.state().depth_test);
        assert_eq!(
            backend.take_commands(),
            vec![RecordedCommand::State(StateChange::DepthTest(false))]
        );
        assert!(backend.commands().is_empty());
    }
}
