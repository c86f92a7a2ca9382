//! Vulkan backend implementation using ash
//!
//! The host owns the instance, device and presentation; this backend records
//! one command buffer per frame into whatever image the host hands it as the
//! default target. One frame is in flight at a time: `begin_frame` waits on
//! the previous submission before any per-frame storage is recycled.
//!
//! Bindings follow the same convention as the wgpu backend: uniform blocks
//! are dynamic uniform buffers in set 0 at their binding point, texture unit
//! `i` is a sampled image at binding `2i` and a sampler at `2i+1` of set 1.

mod conversion;
mod deferred;
mod pipeline;

use std::collections::HashMap;
use std::ops::Range;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;

use self::conversion::*;
use self::deferred::{DeferredDestructor, DeferredResource};
use self::pipeline::{AttachmentKey, PipelineDesc, RenderPassKey};
use crate::backend::traits::*;
use crate::backend::types::*;

/// Occlusion queries that can be live at once.
const MAX_QUERIES: u32 = 1024;
/// Size of one transient uniform arena chunk.
const ARENA_CHUNK_SIZE: u64 = 256 * 1024;
/// Zeroed buffer bound to uniform bindings nothing was bound to.
const NULL_UNIFORM_SIZE: u64 = 16 * 1024;
/// Descriptor sets per pool before another pool is chained on.
const SETS_PER_POOL: u32 = 1024;

/// Reserved ids of the textures bound to units nothing was bound to.
const FALLBACK_COLOR: u64 = 1;
const FALLBACK_DEPTH: u64 = 2;
/// Reserved id of the zeroed buffer bound to empty uniform bindings.
const NULL_UNIFORM: u64 = 3;
const FIRST_USER_ID: u64 = 16;

/// Device objects created and owned by the host.
///
/// The backend never destroys these. The device must outlive the backend.
pub struct VulkanContext {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    /// Whether the host enabled the `wideLines` device feature
    pub wide_lines: bool,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    format: vk::Format,
    desc: TextureDescriptor,
    /// Layout the image is kept in outside render passes and transfers
    layout: vk::ImageLayout,
}

struct VkView {
    view: vk::ImageView,
    texture: u64,
}

struct VkFramebuffer {
    color: Option<u64>,
    depth_stencil: Option<u64>,
    width: u32,
    height: u32,
    status: FramebufferStatus,
    /// Built on first use against the loading variant of its render pass
    framebuffer: Option<(vk::Framebuffer, RenderPassKey)>,
}

struct VkProgram {
    modules: [vk::ShaderModule; 2],
    set_layouts: [vk::DescriptorSetLayout; 2],
    pipeline_layout: vk::PipelineLayout,
    /// Sorted, which is also the dynamic offset order
    uniform_bindings: Vec<u32>,
    textures: Vec<TextureSlotKind>,
}

/// Swapchain or XR image the host renders the default framebuffer into
struct DefaultTarget {
    color: vk::ImageView,
    color_format: vk::Format,
    color_layout: vk::ImageLayout,
    depth: Option<(vk::ImageView, vk::Format)>,
    width: u32,
    height: u32,
    framebuffer: Option<(vk::Framebuffer, RenderPassKey)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u64,
    state: PipelineState,
    layout: VertexBufferLayout,
    pass: RenderPassKey,
}

struct ActivePass {
    key: RenderPassKey,
    has_stencil: bool,
    samples: u32,
    extent: vk::Extent2D,
    last_pipeline: Option<vk::Pipeline>,
}

#[derive(Debug, Clone, Copy)]
enum UniformSource {
    Buffer(u64),
    Arena { chunk: usize, offset: u32, size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    /// Must be reset outside a render pass before it can be issued
    NeedsReset,
    Ready,
    Issued { submitted: bool },
    /// Begun before it could be reset; reported visible
    Skipped,
}

struct VkQuery {
    index: u32,
    state: QueryState,
}

/// Write cursor into the transient uniform chunks, reset every frame
struct ArenaCursor {
    chunk: usize,
    offset: u64,
    alignment: u64,
}

impl ArenaCursor {
    fn reset(&mut self) {
        self.chunk = 0;
        self.offset = 0;
    }

    /// Reserve `size` bytes, returning the chunk and offset. `None` when all
    /// `chunk_count` chunks are exhausted and another must be created first.
    fn reserve(&mut self, size: u64, chunk_count: usize) -> Option<(usize, u64)> {
        let mut offset = align_up(self.offset, self.alignment);
        let mut chunk = self.chunk;
        if offset + size > ARENA_CHUNK_SIZE {
            chunk += 1;
            offset = 0;
        }
        if chunk >= chunk_count {
            return None;
        }
        self.chunk = chunk;
        self.offset = offset + size;
        Some((chunk, offset))
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment.max(1)) * alignment.max(1)
}

fn map_vk_error(e: vk::Result) -> BackendError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        other => BackendError::InitializationFailed(format!("{:?}", other)),
    }
}

/// Layout transition of every mip level and layer of an image.
fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        });
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    allocator: Option<Allocator>,
    wide_lines: bool,
    max_samples: u32,
    max_uniform_range: u64,
    default_target: Option<DefaultTarget>,

    // Frame submission
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    in_flight_fence: vk::Fence,
    recording: bool,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, VkView>,
    samplers: HashMap<u64, vk::Sampler>,
    programs: HashMap<u64, VkProgram>,
    framebuffers: HashMap<u64, VkFramebuffer>,

    // Caches
    render_passes: HashMap<RenderPassKey, vk::RenderPass>,
    pipelines: HashMap<PipelineKey, Option<vk::Pipeline>>,

    descriptor_pools: Vec<vk::DescriptorPool>,
    descriptor_pool_index: usize,
    deferred: DeferredDestructor,

    next_id: u64,

    // GL-style binding state
    state: PipelineState,
    program: Option<u64>,
    uniforms: HashMap<u32, UniformSource>,
    texture_units: HashMap<u32, (u64, u64)>,
    vertex_buffer: Option<(u64, VertexBufferLayout)>,
    index_buffer: Option<(u64, IndexFormat)>,
    active_pass: Option<ActivePass>,

    // Transient uniforms in host-visible chunks
    arena: ArenaCursor,
    arena_chunks: Vec<VkBuffer>,

    // Occlusion queries
    query_pool: vk::QueryPool,
    queries: HashMap<u64, VkQuery>,
    free_query_indices: Vec<u32>,
    active_query: Option<(u64, bool)>,
}

impl VulkanBackend {
    /// Create the backend on a device the host already set up.
    pub fn new(context: VulkanContext) -> BackendResult<Self> {
        let VulkanContext {
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            wide_lines,
        } = context;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = properties.limits;
        let sample_counts =
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
        let max_samples = [4, 2]
            .into_iter()
            .find(|&n| sample_counts.contains(convert_sample_count(n)))
            .unwrap_or(1);
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        log::info!("VulkanBackend: using {} (max {} samples)", device_name, max_samples);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let (command_pool, command_buffer, in_flight_fence, query_pool) = unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(queue_family_index);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?[0];

            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight_fence = device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let query_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::OCCLUSION)
                .query_count(MAX_QUERIES);
            let query_pool = device
                .create_query_pool(&query_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            (command_pool, command_buffer, in_flight_fence, query_pool)
        };

        let mut backend = Self {
            instance,
            physical_device,
            device,
            queue,
            allocator: Some(allocator),
            wide_lines,
            max_samples,
            max_uniform_range: limits.max_uniform_buffer_range as u64,
            default_target: None,
            command_pool,
            command_buffer,
            in_flight_fence,
            recording: false,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
            framebuffers: HashMap::new(),
            render_passes: HashMap::new(),
            pipelines: HashMap::new(),
            descriptor_pools: Vec::new(),
            descriptor_pool_index: 0,
            deferred: DeferredDestructor::default(),
            next_id: FIRST_USER_ID,
            state: PipelineState::default(),
            program: None,
            uniforms: HashMap::new(),
            texture_units: HashMap::new(),
            vertex_buffer: None,
            index_buffer: None,
            active_pass: None,
            arena: ArenaCursor {
                chunk: 0,
                offset: 0,
                alignment: limits.min_uniform_buffer_offset_alignment.max(16),
            },
            arena_chunks: Vec::new(),
            query_pool,
            queries: HashMap::new(),
            free_query_indices: (0..MAX_QUERIES).rev().collect(),
            active_query: None,
        };

        let mut null_uniform = backend.allocate_buffer(
            NULL_UNIFORM_SIZE,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "null uniform",
        )?;
        if let Some(mapped) = null_uniform.allocation.mapped_slice_mut() {
            mapped.fill(0);
        }
        backend.buffers.insert(NULL_UNIFORM, null_uniform);
        backend.create_fallbacks()?;
        Ok(backend)
    }

    /// Textures, views and samplers bound to units a draw left empty.
    fn create_fallbacks(&mut self) -> BackendResult<()> {
        let color = self.create_texture_with_id(
            FALLBACK_COLOR,
            &TextureDescriptor {
                label: Some("fallback color".to_string()),
                ..Default::default()
            },
        )?;
        self.write_texture(color, &[255; 4], 1, 1);
        self.create_view_with_id(FALLBACK_COLOR, color, &TextureViewDescriptor::default())?;
        let sampler = self.create_vk_sampler(&SamplerDescriptor::default())?;
        self.samplers.insert(FALLBACK_COLOR, sampler);

        let depth = self.create_texture_with_id(
            FALLBACK_DEPTH,
            &TextureDescriptor {
                label: Some("fallback depth".to_string()),
                format: TextureFormat::Depth32Float,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT,
                ..Default::default()
            },
        )?;
        self.clear_depth_texture(depth, 1.0)?;
        self.create_view_with_id(
            FALLBACK_DEPTH,
            depth,
            &TextureViewDescriptor {
                dimension: TextureViewDimension::Array,
            },
        )?;
        let compare = self.create_vk_sampler(&SamplerDescriptor {
            compare: Some(CompareFunction::LessEqual),
            ..Default::default()
        })?;
        self.samplers.insert(FALLBACK_DEPTH, compare);
        Ok(())
    }

    /// Set the image the default framebuffer renders into.
    ///
    /// `color_layout` is the layout the host keeps the image in before and
    /// after each pass; an optional depth attachment stays in
    /// `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`.
    pub fn set_default_target(
        &mut self,
        color: vk::ImageView,
        color_format: vk::Format,
        color_layout: vk::ImageLayout,
        depth: Option<(vk::ImageView, vk::Format)>,
        width: u32,
        height: u32,
    ) {
        if let Some(old) = self.default_target.take() {
            if let Some((framebuffer, _)) = old.framebuffer {
                self.deferred.push(DeferredResource::Framebuffer(framebuffer));
            }
        }
        self.default_target = Some(DefaultTarget {
            color,
            color_format,
            color_layout,
            depth,
            width,
            height,
            framebuffer: None,
        });
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Command buffer of the frame being recorded
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&mut self) -> BackendResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| BackendError::InitializationFailed("allocator not available".into()))
    }

    /// Create a persistently mapped buffer. Every buffer lives in host-visible
    /// memory so writes are plain copies.
    fn allocate_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> BackendResult<VkBuffer> {
        let size = size.max(4);
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);

            let allocated = self.allocator()?.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            });
            let allocation = match allocated {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(e.to_string()));
                }
            };

            if let Err(e) = self
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.deferred.push(DeferredResource::Buffer { buffer, allocation });
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }

            Ok(VkBuffer {
                buffer,
                allocation,
                size,
            })
        }
    }

    fn begin_single_time_commands(&self) -> BackendResult<vk::CommandBuffer> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self.device.allocate_command_buffers(&alloc_info).map_err(map_vk_error)?[0];

            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
                self.device.free_command_buffers(self.command_pool, &[cmd]);
                return Err(map_vk_error(e));
            }
            Ok(cmd)
        }
    }

    /// Submit and wait. Only used for uploads and initial layouts.
    fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        let result = unsafe {
            self.device.end_command_buffer(cmd).and_then(|()| {
                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
                self.device.queue_wait_idle(self.queue)
            })
        };
        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result.map_err(map_vk_error)
    }

    fn create_texture_with_id(&mut self, id: u64, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized texture {:?}",
                desc.label
            )));
        }
        let format = convert_texture_format(desc.format);
        let depth = desc.format.is_depth();
        let usage = convert_texture_usage(desc.usage, depth)
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let layout = resting_layout(desc.usage, depth);

        let image = unsafe {
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                })
                .mip_levels(desc.mip_levels.max(1))
                .array_layers(desc.layers)
                .format(format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .samples(convert_sample_count(desc.sample_count));
            self.device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocated = self.allocator()?.allocate(&AllocationCreateDesc {
            name: desc.label.as_deref().unwrap_or("texture"),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }
        };
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.deferred.push(DeferredResource::Image { image, allocation });
            return Err(BackendError::TextureCreationFailed(e.to_string()));
        }

        self.textures.insert(
            id,
            VkTexture {
                image,
                allocation,
                format,
                desc: desc.clone(),
                layout,
            },
        );

        let cmd = self.begin_single_time_commands()?;
        image_barrier(
            &self.device,
            cmd,
            image,
            aspect_mask(format, true),
            vk::ImageLayout::UNDEFINED,
            layout,
        );
        self.end_single_time_commands(cmd)?;
        Ok(TextureHandle(id))
    }

    fn create_view_with_id(
        &mut self,
        id: u64,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;

        let (view_type, base_layer, layer_count, aspect) = match desc.dimension {
            TextureViewDimension::Layer(layer) => {
                if layer >= tex.desc.layers {
                    return Err(BackendError::TextureCreationFailed(format!(
                        "layer {} out of range ({} layers)",
                        layer, tex.desc.layers
                    )));
                }
                // single layers are attachments, which need every aspect
                (vk::ImageViewType::TYPE_2D, layer, 1, aspect_mask(tex.format, true))
            }
            TextureViewDimension::Array => (
                vk::ImageViewType::TYPE_2D_ARRAY,
                0,
                tex.desc.layers,
                aspect_mask(tex.format, false),
            ),
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(tex.image)
            .view_type(view_type)
            .format(tex.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: base_layer,
                layer_count,
            });
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;
        self.texture_views.insert(
            id,
            VkView {
                view,
                texture: texture.0,
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn create_vk_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter(desc.mag_filter))
            .min_filter(convert_filter(desc.min_filter))
            .mipmap_mode(convert_mipmap_mode(desc.mipmap_filter))
            .address_mode_u(convert_address_mode(desc.address_mode_u))
            .address_mode_v(convert_address_mode(desc.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(convert_compare_op).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))
    }

    fn clear_depth_texture(&mut self, texture: TextureHandle, depth: f32) -> BackendResult<()> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        let (image, format, layout) = (tex.image, tex.format, tex.layout);
        let aspect = aspect_mask(format, true);

        let cmd = self.begin_single_time_commands()?;
        image_barrier(&self.device, cmd, image, aspect, layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearDepthStencilValue { depth, stencil: 0 },
                &[vk::ImageSubresourceRange {
                    aspect_mask: aspect,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                }],
            );
        }
        image_barrier(&self.device, cmd, image, aspect, vk::ImageLayout::TRANSFER_DST_OPTIMAL, layout);
        self.end_single_time_commands(cmd)
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

    fn attachment_key(&self, view: u64, clear: bool, clear_stencil: bool) -> Option<AttachmentKey> {
        let texture = self.textures.get(&self.texture_views.get(&view)?.texture)?;
        Some(AttachmentKey {
            format: texture.format,
            samples: texture.desc.sample_count.max(1),
            clear,
            clear_stencil,
            layout: texture.layout,
        })
    }

    fn render_pass_for(&mut self, key: RenderPassKey) -> BackendResult<vk::RenderPass> {
        if let Some(pass) = self.render_passes.get(&key) {
            return Ok(*pass);
        }
        let pass = pipeline::create_render_pass(&self.device, &key)?;
        log::debug!("VulkanBackend: render pass created for {:?}", key);
        self.render_passes.insert(key, pass);
        Ok(pass)
    }

    fn create_vk_framebuffer(
        &mut self,
        key: RenderPassKey,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> BackendResult<vk::Framebuffer> {
        let render_pass = self.render_pass_for(key)?;
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(width)
            .height(height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(|e| BackendError::FramebufferIncomplete(e.to_string()))
    }

    /// Resolve the pass target into its render pass key, framebuffer and size.
    fn pass_target(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> BackendResult<(RenderPassKey, vk::Framebuffer, vk::Extent2D)> {
        let clear_color = desc.clear_color.is_some();
        let clear_depth = desc.clear_depth.is_some();
        let clear_stencil = desc.clear_stencil.is_some();

        match desc.framebuffer {
            None => {
                let target = self
                    .default_target
                    .as_ref()
                    .ok_or_else(|| BackendError::FramebufferIncomplete("no default target set".into()))?;
                let key = RenderPassKey {
                    color: Some(AttachmentKey {
                        format: target.color_format,
                        samples: 1,
                        clear: clear_color,
                        clear_stencil: false,
                        layout: target.color_layout,
                    }),
                    depth: target.depth.map(|(_, format)| AttachmentKey {
                        format,
                        samples: 1,
                        clear: clear_depth,
                        clear_stencil,
                        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    }),
                };
                let extent = vk::Extent2D {
                    width: target.width,
                    height: target.height,
                };
                let compatible = key.compatible();
                if let Some((framebuffer, built_for)) = target.framebuffer {
                    if built_for == compatible {
                        return Ok((key, framebuffer, extent));
                    }
                }
                let mut attachments = vec![target.color];
                attachments.extend(target.depth.map(|(view, _)| view));
                let framebuffer =
                    self.create_vk_framebuffer(compatible, &attachments, extent.width, extent.height)?;
                if let Some(target) = self.default_target.as_mut() {
                    if let Some((old, _)) = target.framebuffer.replace((framebuffer, compatible)) {
                        self.deferred.push(DeferredResource::Framebuffer(old));
                    }
                }
                Ok((key, framebuffer, extent))
            }
            Some(handle) => {
                let fb = self
                    .framebuffers
                    .get(&handle.0)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))?;
                if let FramebufferStatus::Incomplete(reason) = &fb.status {
                    return Err(BackendError::FramebufferIncomplete(reason.clone()));
                }
                let (color, depth) = (fb.color, fb.depth_stencil);
                let extent = vk::Extent2D {
                    width: fb.width,
                    height: fb.height,
                };
                let existing = fb.framebuffer;
                let key = RenderPassKey {
                    color: color.and_then(|v| self.attachment_key(v, clear_color, false)),
                    depth: depth.and_then(|v| self.attachment_key(v, clear_depth, clear_stencil)),
                };
                let compatible = key.compatible();
                if let Some((framebuffer, built_for)) = existing {
                    if built_for == compatible {
                        return Ok((key, framebuffer, extent));
                    }
                }
                let attachments: Vec<vk::ImageView> = color
                    .into_iter()
                    .chain(depth)
                    .filter_map(|v| self.texture_views.get(&v).map(|view| view.view))
                    .collect();
                let framebuffer =
                    self.create_vk_framebuffer(compatible, &attachments, extent.width, extent.height)?;
                if let Some(fb) = self.framebuffers.get_mut(&handle.0) {
                    if let Some((old, _)) = fb.framebuffer.replace((framebuffer, compatible)) {
                        self.deferred.push(DeferredResource::Framebuffer(old));
                    }
                }
                Ok((key, framebuffer, extent))
            }
        }
    }

    fn pipeline_for(&mut self, key: PipelineKey, has_stencil: bool) -> Option<vk::Pipeline> {
        if let Some(cached) = self.pipelines.get(&key) {
            return *cached;
        }
        let created = self.create_pipeline(&key, has_stencil);
        let pipeline = match created {
            Ok(pipeline) => {
                log::debug!(
                    "VulkanBackend: pipeline built for program {} ({} cached)",
                    key.program,
                    self.pipelines.len() + 1
                );
                Some(pipeline)
            }
            Err(e) => {
                log::error!("VulkanBackend: {}", e);
                None
            }
        };
        self.pipelines.insert(key, pipeline);
        pipeline
    }

    fn create_pipeline(&mut self, key: &PipelineKey, has_stencil: bool) -> BackendResult<vk::Pipeline> {
        let render_pass = self.render_pass_for(key.pass)?;
        let program = self
            .programs
            .get(&key.program)
            .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", key.program)))?;
        let samples = key
            .pass
            .color
            .or(key.pass.depth)
            .map(|a| a.samples)
            .unwrap_or(1);
        pipeline::create_graphics_pipeline(
            &self.device,
            &PipelineDesc {
                vertex: program.modules[0],
                fragment: program.modules[1],
                layout: program.pipeline_layout,
                render_pass,
                state: &key.state,
                vertex_layout: &key.layout,
                has_color: key.pass.color.is_some(),
                has_stencil,
                samples,
                wide_lines: self.wide_lines,
            },
        )
    }

    fn create_descriptor_pool(&self) -> BackendResult<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: SETS_PER_POOL * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: SETS_PER_POOL * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: SETS_PER_POOL * 2,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(SETS_PER_POOL);
        unsafe { self.device.create_descriptor_pool(&pool_info, None) }.map_err(map_vk_error)
    }

    fn allocate_descriptor_set(&mut self, layout: vk::DescriptorSetLayout) -> BackendResult<vk::DescriptorSet> {
        loop {
            let fresh = self.descriptor_pool_index == self.descriptor_pools.len();
            if fresh {
                let pool = self.create_descriptor_pool()?;
                log::debug!(
                    "VulkanBackend: descriptor pools grow to {}",
                    self.descriptor_pools.len() + 1
                );
                self.descriptor_pools.push(pool);
            }
            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.descriptor_pools[self.descriptor_pool_index])
                .set_layouts(&layouts);
            match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => return Ok(sets[0]),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
                    if !fresh =>
                {
                    self.descriptor_pool_index += 1;
                }
                Err(e) => return Err(map_vk_error(e)),
            }
        }
    }

    /// Buffer, dynamic offset and range behind every uniform binding of a program.
    fn uniform_descriptors(&self, bindings: &[u32]) -> Vec<(vk::DescriptorBufferInfo, u32)> {
        let null_buffer = self
            .buffers
            .get(&NULL_UNIFORM)
            .map(|b| b.buffer)
            .unwrap_or_default();
        let null = (
            vk::DescriptorBufferInfo {
                buffer: null_buffer,
                offset: 0,
                range: NULL_UNIFORM_SIZE,
            },
            0,
        );
        bindings
            .iter()
            .map(|binding| match self.uniforms.get(binding) {
                Some(UniformSource::Buffer(id)) => match self.buffers.get(id) {
                    Some(buffer) => (
                        vk::DescriptorBufferInfo {
                            buffer: buffer.buffer,
                            offset: 0,
                            range: buffer.size.min(self.max_uniform_range),
                        },
                        0,
                    ),
                    None => null,
                },
                Some(UniformSource::Arena { chunk, offset, size }) => (
                    vk::DescriptorBufferInfo {
                        buffer: self.arena_chunks[*chunk].buffer,
                        offset: 0,
                        range: *size,
                    },
                    *offset,
                ),
                None => null,
            })
            .collect()
    }

    /// View, sampler and layout behind every texture unit of a program.
    fn texture_descriptors(&self, slots: &[TextureSlotKind]) -> Vec<(vk::DescriptorImageInfo, vk::DescriptorImageInfo)> {
        slots
            .iter()
            .enumerate()
            .map(|(unit, kind)| {
                let fallback = match kind {
                    TextureSlotKind::Color2d => (FALLBACK_COLOR, FALLBACK_COLOR),
                    TextureSlotKind::DepthArray => (FALLBACK_DEPTH, FALLBACK_DEPTH),
                };
                let bound = self
                    .texture_units
                    .get(&(unit as u32))
                    .copied()
                    .filter(|(view, sampler)| {
                        self.texture_views.contains_key(view) && self.samplers.contains_key(sampler)
                    })
                    .unwrap_or(fallback);
                let view = &self.texture_views[&bound.0];
                let layout = self
                    .textures
                    .get(&view.texture)
                    .map(|t| t.layout)
                    .unwrap_or(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                (
                    vk::DescriptorImageInfo::default()
                        .image_view(view.view)
                        .image_layout(layout),
                    vk::DescriptorImageInfo::default().sampler(self.samplers[&bound.1]),
                )
            })
            .collect()
    }

    /// Bind pipeline, descriptor sets and vertex buffer for the next draw.
    fn prepare_draw(&mut self) -> bool {
        let Some(pass) = self.active_pass.as_ref() else {
            log::warn!("VulkanBackend: draw outside a render pass");
            return false;
        };
        let Some(program_id) = self.program else {
            log::warn!("VulkanBackend: draw without a program");
            return false;
        };
        let Some((vertex_buffer, layout)) = self.vertex_buffer.clone() else {
            log::warn!("VulkanBackend: draw without a vertex buffer");
            return false;
        };
        let Some(vertex_buffer) = self.buffers.get(&vertex_buffer).map(|b| b.buffer) else {
            log::warn!("VulkanBackend: draw with a destroyed vertex buffer");
            return false;
        };

        let key = PipelineKey {
            program: program_id,
            state: self.state,
            layout,
            pass: pass.key.compatible(),
        };
        let last_pipeline = pass.last_pipeline;
        let has_stencil = pass.has_stencil;
        let Some(pipeline) = self.pipeline_for(key, has_stencil) else {
            return false;
        };

        let Some(program) = self.programs.get(&program_id) else {
            return false;
        };
        let set_layouts = program.set_layouts;
        let pipeline_layout = program.pipeline_layout;
        let uniform_bindings = program.uniform_bindings.clone();
        let buffer_infos = self.uniform_descriptors(&uniform_bindings);
        let image_infos = self.texture_descriptors(&program.textures);

        let sets = match (
            self.allocate_descriptor_set(set_layouts[0]),
            self.allocate_descriptor_set(set_layouts[1]),
        ) {
            (Ok(uniform_set), Ok(texture_set)) => [uniform_set, texture_set],
            (Err(e), _) | (_, Err(e)) => {
                log::error!("VulkanBackend: descriptor set allocation failed: {}", e);
                return false;
            }
        };

        let mut writes = Vec::with_capacity(uniform_bindings.len() + image_infos.len() * 2);
        for (binding, (info, _)) in uniform_bindings.iter().zip(&buffer_infos) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(sets[0])
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .buffer_info(std::slice::from_ref(info)),
            );
        }
        for (unit, (image, sampler)) in image_infos.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(sets[1])
                    .dst_binding(unit as u32 * 2)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(std::slice::from_ref(image)),
            );
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(sets[1])
                    .dst_binding(unit as u32 * 2 + 1)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(std::slice::from_ref(sampler)),
            );
        }
        let offsets: Vec<u32> = buffer_infos.iter().map(|(_, offset)| *offset).collect();

        let cmd = self.command_buffer;
        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
            if last_pipeline != Some(pipeline) {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &sets,
                &offsets,
            );
            self.device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
            let reference = self.state.stencil.map(|s| s.reference).unwrap_or(0);
            self.device
                .cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, reference);
            if self.wide_lines {
                self.device.cmd_set_line_width(cmd, self.state.line_width.max(1.0));
            }
        }
        if let Some(ref mut pass) = self.active_pass {
            pass.last_pipeline = Some(pipeline);
        }
        true
    }

    /// Destroy framebuffer objects that reference any of `views`.
    fn invalidate_framebuffers(&mut self, views: &[u64]) {
        for fb in self.framebuffers.values_mut() {
            let stale = fb.color.is_some_and(|v| views.contains(&v))
                || fb.depth_stencil.is_some_and(|v| views.contains(&v));
            if stale {
                if let Some((framebuffer, _)) = fb.framebuffer.take() {
                    self.deferred.push(DeferredResource::Framebuffer(framebuffer));
                }
                fb.status = FramebufferStatus::Incomplete("attachment destroyed".to_string());
            }
        }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            multiview: false,
            occlusion_queries: true,
            max_samples: self.max_samples,
        }
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        if self.recording {
            log::warn!("VulkanBackend: begin_frame called twice");
            return Ok(());
        }
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .map_err(map_vk_error)?;
            self.device
                .reset_fences(&[self.in_flight_fence])
                .map_err(map_vk_error)?;

            if let Some(allocator) = self.allocator.as_mut() {
                self.deferred.flush(&self.device, allocator);
            }
            for pool in &self.descriptor_pools {
                self.device
                    .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())
                    .map_err(map_vk_error)?;
            }
            self.descriptor_pool_index = 0;

            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(map_vk_error)?;
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(map_vk_error)?;

            for query in self.queries.values_mut() {
                if query.state == QueryState::NeedsReset {
                    self.device
                        .cmd_reset_query_pool(self.command_buffer, self.query_pool, query.index, 1);
                    query.state = QueryState::Ready;
                }
            }
        }
        self.arena.reset();
        self.uniforms
            .retain(|_, source| matches!(source, UniformSource::Buffer(_)));
        self.recording = true;
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if self.active_pass.is_some() {
            log::warn!("VulkanBackend: frame ended inside a render pass");
            self.end_render_pass();
        }
        if !self.recording {
            return Ok(());
        }
        self.recording = false;
        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(map_vk_error)?;
            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.queue, &[submit_info], self.in_flight_fence)
                .map_err(map_vk_error)?;
        }
        for query in self.queries.values_mut() {
            if query.state == (QueryState::Issued { submitted: false }) {
                query.state = QueryState::Issued { submitted: true };
            }
        }
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.allocate_buffer(
            desc.size,
            convert_buffer_usage(desc.usage),
            desc.label.as_deref().unwrap_or("buffer"),
        )?;
        let id = self.next_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
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
        let Some(vk_buffer) = self.buffers.get_mut(&buffer.0) else {
            log::error!("VulkanBackend: write to unknown buffer {:?}", buffer);
            return;
        };
        let Some(mapped) = vk_buffer.allocation.mapped_slice_mut() else {
            log::error!("VulkanBackend: buffer {:?} is not host visible", buffer);
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            log::error!(
                "VulkanBackend: write of {} bytes at {} overflows buffer {:?}",
                data.len(),
                offset,
                buffer
            );
            return;
        }
        mapped[start..end].copy_from_slice(data);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let id = self.next_id();
        self.create_texture_with_id(id, desc)
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let id = self.next_id();
        self.create_view_with_id(id, texture, desc)
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        let Some(tex) = self.textures.get(&texture.0) else {
            log::error!("VulkanBackend: write to unknown texture {:?}", texture);
            return;
        };
        let size = (width * height * tex.desc.format.bytes_per_pixel()) as usize;
        if data.len() < size {
            log::error!(
                "VulkanBackend: {} bytes do not cover a {}x{} texture",
                data.len(),
                width,
                height
            );
            return;
        }
        let (image, format, layout) = (tex.image, tex.format, tex.layout);

        let mut staging = match self.allocate_buffer(size as u64, vk::BufferUsageFlags::TRANSFER_SRC, "staging") {
            Ok(staging) => staging,
            Err(e) => {
                log::error!("VulkanBackend: {}", e);
                return;
            }
        };
        if let Some(mapped) = staging.allocation.mapped_slice_mut() {
            mapped[..size].copy_from_slice(&data[..size]);
        }

        let uploaded = self.begin_single_time_commands().and_then(|cmd| {
            let aspect = aspect_mask(format, false);
            image_barrier(&self.device, cmd, image, aspect, layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            image_barrier(&self.device, cmd, image, aspect, vk::ImageLayout::TRANSFER_DST_OPTIMAL, layout);
            self.end_single_time_commands(cmd)
        });
        if let Err(e) = uploaded {
            log::error!("VulkanBackend: texture upload failed: {}", e);
        }
        self.deferred.push(DeferredResource::Buffer {
            buffer: staging.buffer,
            allocation: staging.allocation,
        });
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.create_vk_sampler(desc)?;
        let id = self.next_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        if desc.multiview {
            log::warn!("VulkanBackend: multiview programs are not supported, compiling single view");
        }
        let vertex = pipeline::compile_glsl(&self.device, &desc.vertex_source, naga::ShaderStage::Vertex)?;
        let fragment =
            match pipeline::compile_glsl(&self.device, &desc.fragment_source, naga::ShaderStage::Fragment) {
                Ok(fragment) => fragment,
                Err(e) => {
                    unsafe { self.device.destroy_shader_module(vertex, None) };
                    return Err(e);
                }
            };

        let mut uniform_bindings = desc.uniform_bindings.clone();
        uniform_bindings.sort_unstable();
        uniform_bindings.dedup();

        let (set_layouts, pipeline_layout) =
            match pipeline::create_program_layout(&self.device, &uniform_bindings, &desc.textures) {
                Ok(layouts) => layouts,
                Err(e) => {
                    unsafe {
                        self.device.destroy_shader_module(vertex, None);
                        self.device.destroy_shader_module(fragment, None);
                    }
                    return Err(e);
                }
            };

        let id = self.next_id();
        log::debug!("VulkanBackend: program {} linked ({:?})", id, desc.label);
        self.programs.insert(
            id,
            VkProgram {
                modules: [vertex, fragment],
                set_layouts,
                pipeline_layout,
                uniform_bindings,
                textures: desc.textures.clone(),
            },
        );
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
        let size = color.or(depth).map(|a| (a.width, a.height)).unwrap_or((desc.width, desc.height));
        let id = self.next_id();
        self.framebuffers.insert(
            id,
            VkFramebuffer {
                color: desc.color.map(|v| v.0),
                depth_stencil: desc.depth_stencil.map(|v| v.0),
                width: size.0,
                height: size.1,
                status,
                framebuffer: None,
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
            VkQuery {
                index,
                state: QueryState::NeedsReset,
            },
        );
        Ok(QueryHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if !self.recording {
            log::warn!("VulkanBackend: render pass {:?} begun outside a frame", desc.label);
            return;
        }
        if self.active_pass.is_some() {
            log::warn!("VulkanBackend: render pass {:?} begun inside another pass", desc.label);
            self.end_render_pass();
        }

        let (key, framebuffer, extent) = match self.pass_target(desc) {
            Ok(target) => target,
            Err(e) => {
                log::error!("VulkanBackend: pass {:?} dropped: {}", desc.label, e);
                return;
            }
        };
        let render_pass = match self.render_pass_for(key) {
            Ok(pass) => pass,
            Err(e) => {
                log::error!("VulkanBackend: {}", e);
                return;
            }
        };

        let mut clear_values = Vec::with_capacity(2);
        if key.color.is_some() {
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: desc.clear_color.unwrap_or([0.0; 4]),
                },
            });
        }
        if key.depth.is_some() {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: desc.clear_depth.unwrap_or(1.0),
                    stencil: desc.clear_stencil.unwrap_or(0),
                },
            });
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[render_area]);
        }

        self.active_pass = Some(ActivePass {
            key,
            has_stencil: key.depth.is_some_and(|d| has_stencil(d.format)),
            samples: key.color.or(key.depth).map(|a| a.samples).unwrap_or(1),
            extent,
            last_pipeline: None,
        });
        self.set_viewport(0.0, 0.0, extent.width as f32, extent.height as f32);
    }

    fn end_render_pass(&mut self) {
        if self.active_query.is_some() {
            log::warn!("VulkanBackend: render pass ended with an open occlusion query");
            self.end_occlusion_query();
        }
        if let Some(pass) = self.active_pass.take() {
            log::trace!(
                "VulkanBackend: pass ended ({}x{}, {} samples)",
                pass.extent.width,
                pass.extent.height,
                pass.samples
            );
            unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        if !self.recording {
            return;
        }
        // flipped so clip space matches the GL convention
        let viewport = vk::Viewport {
            x,
            y: y + height,
            width,
            height: -height,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]) };
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        if !self.recording {
            return;
        }
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D { width, height },
        };
        unsafe { self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
    }

    fn apply_state(&mut self, change: StateChange) {
        if let StateChange::LineWidth(width) = change {
            if width != 1.0 && !self.wide_lines {
                log::trace!("VulkanBackend: wide lines not enabled, drawing at 1.0");
            }
        }
        self.state.apply(change);
    }

    fn use_program(&mut self, program: ProgramHandle) {
        if !self.programs.contains_key(&program.0) {
            log::warn!("VulkanBackend: use of unknown program {:?}", program);
        }
        self.program = Some(program.0);
    }

    fn bind_uniform_buffer(&mut self, binding: u32, buffer: BufferHandle) {
        self.uniforms.insert(binding, UniformSource::Buffer(buffer.0));
    }

    fn push_uniforms(&mut self, binding: u32, data: &[u8]) {
        let size = data.len() as u64;
        if size > ARENA_CHUNK_SIZE {
            log::error!("VulkanBackend: uniform block of {} bytes exceeds the arena chunk", size);
            return;
        }
        let (chunk, offset) = match self.arena.reserve(size, self.arena_chunks.len()) {
            Some(reserved) => reserved,
            None => {
                let buffer = match self.allocate_buffer(
                    ARENA_CHUNK_SIZE,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    "uniform arena",
                ) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        log::error!("VulkanBackend: {}", e);
                        return;
                    }
                };
                self.arena_chunks.push(buffer);
                log::debug!("VulkanBackend: uniform arena grows to {} chunks", self.arena_chunks.len());
                match self.arena.reserve(size, self.arena_chunks.len()) {
                    Some(reserved) => reserved,
                    None => return,
                }
            }
        };
        if let Some(mapped) = self.arena_chunks[chunk].allocation.mapped_slice_mut() {
            let start = offset as usize;
            mapped[start..start + data.len()].copy_from_slice(data);
        }
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
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if self.prepare_draw() {
            unsafe {
                self.device.cmd_draw(
                    self.command_buffer,
                    vertices.end - vertices.start,
                    instances.end - instances.start,
                    vertices.start,
                    instances.start,
                );
            }
        }
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        let Some((index_buffer, format)) = self.index_buffer else {
            log::warn!("VulkanBackend: indexed draw without an index buffer");
            return;
        };
        let Some(index_buffer) = self.buffers.get(&index_buffer).map(|b| b.buffer) else {
            log::warn!("VulkanBackend: indexed draw with a destroyed index buffer");
            return;
        };
        if self.prepare_draw() {
            unsafe {
                self.device.cmd_bind_index_buffer(
                    self.command_buffer,
                    index_buffer,
                    0,
                    convert_index_type(format),
                );
                self.device.cmd_draw_indexed(
                    self.command_buffer,
                    indices.end - indices.start,
                    instances.end - instances.start,
                    indices.start,
                    base_vertex,
                    instances.start,
                );
            }
        }
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        if self.active_pass.is_none() {
            log::warn!("VulkanBackend: occlusion query {:?} begun outside a pass", query);
            return;
        }
        let Some(slot) = self.queries.get_mut(&query.0) else {
            log::warn!("VulkanBackend: unknown occlusion query {:?}", query);
            return;
        };
        let recorded = match slot.state {
            QueryState::Ready => {
                unsafe {
                    self.device.cmd_begin_query(
                        self.command_buffer,
                        self.query_pool,
                        slot.index,
                        vk::QueryControlFlags::empty(),
                    );
                }
                slot.state = QueryState::Issued { submitted: false };
                true
            }
            QueryState::NeedsReset => {
                slot.state = QueryState::Skipped;
                false
            }
            QueryState::Issued { .. } | QueryState::Skipped => {
                log::warn!("VulkanBackend: occlusion query {:?} begun while pending", query);
                false
            }
        };
        self.active_query = Some((query.0, recorded));
    }

    fn end_occlusion_query(&mut self) {
        let Some((query, recorded)) = self.active_query.take() else {
            return;
        };
        if !recorded {
            return;
        }
        if let Some(slot) = self.queries.get(&query) {
            unsafe {
                self.device
                    .cmd_end_query(self.command_buffer, self.query_pool, slot.index);
            }
        }
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        let slot = self.queries.get_mut(&query.0)?;
        match slot.state {
            QueryState::Skipped => {
                slot.state = QueryState::NeedsReset;
                Some(1)
            }
            QueryState::Issued { submitted: true } => {
                let mut result = [0u64; 1];
                let fetched = unsafe {
                    self.device.get_query_pool_results(
                        self.query_pool,
                        slot.index,
                        &mut result,
                        vk::QueryResultFlags::TYPE_64,
                    )
                };
                match fetched {
                    Ok(()) => {
                        slot.state = QueryState::NeedsReset;
                        Some(result[0])
                    }
                    Err(vk::Result::NOT_READY) => None,
                    Err(e) => {
                        log::error!("VulkanBackend: occlusion query {:?} failed: {:?}", query, e);
                        slot.state = QueryState::NeedsReset;
                        Some(1)
                    }
                }
            }
            _ => None,
        }
    }

    fn resolve_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        if !self.recording || self.active_pass.is_some() {
            log::warn!("VulkanBackend: resolve outside a frame or inside a render pass");
            return;
        }
        let (Some(src), Some(dst)) = (self.textures.get(&src.0), self.textures.get(&dst.0)) else {
            log::error!("VulkanBackend: resolve between unknown textures");
            return;
        };
        if src.desc.sample_count <= 1 || dst.desc.sample_count != 1 {
            log::error!(
                "VulkanBackend: resolve needs a multisampled source and single-sampled target ({} -> {})",
                src.desc.sample_count,
                dst.desc.sample_count
            );
            return;
        }
        let cmd = self.command_buffer;
        let aspect = aspect_mask(src.format, false);
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageResolve::default()
            .src_subresource(subresource)
            .dst_subresource(subresource)
            .extent(vk::Extent3D {
                width: src.desc.width.min(dst.desc.width),
                height: src.desc.height.min(dst.desc.height),
                depth: 1,
            });

        image_barrier(&self.device, cmd, src.image, aspect, src.layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        image_barrier(&self.device, cmd, dst.image, aspect, dst.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        unsafe {
            self.device.cmd_resolve_image(
                cmd,
                src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        image_barrier(&self.device, cmd, src.image, aspect, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, src.layout);
        image_barrier(&self.device, cmd, dst.image, aspect, vk::ImageLayout::TRANSFER_DST_OPTIMAL, dst.layout);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if buffer.0 < FIRST_USER_ID {
            return;
        }
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            self.deferred.push(DeferredResource::Buffer {
                buffer: vk_buffer.buffer,
                allocation: vk_buffer.allocation,
            });
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture.0 < FIRST_USER_ID {
            return;
        }
        let Some(vk_texture) = self.textures.remove(&texture.0) else {
            return;
        };
        let views: Vec<u64> = self
            .texture_views
            .iter()
            .filter(|(_, view)| view.texture == texture.0)
            .map(|(id, _)| *id)
            .collect();
        for id in &views {
            if let Some(view) = self.texture_views.remove(id) {
                self.deferred.push(DeferredResource::ImageView(view.view));
            }
        }
        self.texture_units.retain(|_, (view, _)| !views.contains(view));
        self.invalidate_framebuffers(&views);
        self.deferred.push(DeferredResource::Image {
            image: vk_texture.image,
            allocation: vk_texture.allocation,
        });
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        let Some(vk_program) = self.programs.remove(&program.0) else {
            return;
        };
        let mut evicted = Vec::new();
        self.pipelines.retain(|key, pipeline| {
            let keep = key.program != program.0;
            if !keep {
                evicted.extend(pipeline.take());
            }
            keep
        });
        for pipeline in evicted {
            self.deferred.push(DeferredResource::Pipeline(pipeline));
        }
        if self.program == Some(program.0) {
            self.program = None;
        }
        self.deferred.push(DeferredResource::Program {
            modules: vk_program.modules,
            set_layouts: vk_program.set_layouts,
            pipeline_layout: vk_program.pipeline_layout,
        });
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(fb) = self.framebuffers.remove(&framebuffer.0) {
            if let Some((framebuffer, _)) = fb.framebuffer {
                self.deferred.push(DeferredResource::Framebuffer(framebuffer));
            }
        }
    }

    fn destroy_query(&mut self, query: QueryHandle) {
        if let Some(slot) = self.queries.remove(&query.0) {
            self.free_query_indices.push(slot.index);
        }
        if self.active_query.is_some_and(|(id, _)| id == query.0) {
            log::warn!("VulkanBackend: destroyed an open occlusion query");
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let Some(mut allocator) = self.allocator.take() else {
                return;
            };
            self.deferred.flush(&self.device, &mut allocator);

            for (_, buffer) in self.buffers.drain() {
                DeferredResource::Buffer {
                    buffer: buffer.buffer,
                    allocation: buffer.allocation,
                }
                .destroy(&self.device, &mut allocator);
            }
            for buffer in self.arena_chunks.drain(..) {
                DeferredResource::Buffer {
                    buffer: buffer.buffer,
                    allocation: buffer.allocation,
                }
                .destroy(&self.device, &mut allocator);
            }

            for (_, fb) in self.framebuffers.drain() {
                if let Some((framebuffer, _)) = fb.framebuffer {
                    self.device.destroy_framebuffer(framebuffer, None);
                }
            }
            if let Some((framebuffer, _)) = self.default_target.take().and_then(|t| t.framebuffer) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, view) in self.texture_views.drain() {
                self.device.destroy_image_view(view.view, None);
            }
            for (_, texture) in self.textures.drain() {
                DeferredResource::Image {
                    image: texture.image,
                    allocation: texture.allocation,
                }
                .destroy(&self.device, &mut allocator);
            }

            // Drop the allocator before the host destroys the device
            drop(allocator);

            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                if let Some(pipeline) = pipeline {
                    self.device.destroy_pipeline(pipeline, None);
                }
            }
            for (_, program) in self.programs.drain() {
                self.device.destroy_pipeline_layout(program.pipeline_layout, None);
                for layout in program.set_layouts {
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
                for module in program.modules {
                    self.device.destroy_shader_module(module, None);
                }
            }
            for (_, pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(pass, None);
            }
            for pool in self.descriptor_pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }

            self.device.destroy_query_pool(self.query_pool, None);
            self.device.destroy_fence(self.in_flight_fence, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> ArenaCursor {
        ArenaCursor {
            chunk: 0,
            offset: 0,
            alignment: 256,
        }
    }

    #[test]
    fn test_arena_aligns_offsets() {
        let mut arena = cursor();
        assert_eq!(arena.reserve(64, 1), Some((0, 0)));
        assert_eq!(arena.reserve(64, 1), Some((0, 256)));
        assert_eq!(arena.offset, 320);
    }

    #[test]
    fn test_arena_needs_new_chunk_when_full() {
        let mut arena = cursor();
        assert!(arena.reserve(ARENA_CHUNK_SIZE - 16, 1).is_some());
        assert_eq!(arena.reserve(64, 1), None);
        // a failed reservation leaves the cursor alone
        assert_eq!(arena.chunk, 0);
        assert_eq!(arena.reserve(64, 2), Some((1, 0)));

        arena.reset();
        assert_eq!(arena.reserve(8, 2), Some((0, 0)));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(300, 0), 300);
    }

    #[test]
    fn test_vk_error_mapping() {
        assert!(matches!(map_vk_error(vk::Result::ERROR_DEVICE_LOST), BackendError::DeviceLost));
        assert!(matches!(
            map_vk_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            BackendError::OutOfMemory
        ));
    }
}
