//! Deferred destruction of Vulkan resources.
//!
//! A resource destroyed while the frame that uses it is still recording or
//! executing is parked here and released after the next fence wait.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};

/// A Vulkan resource pending destruction.
pub enum DeferredResource {
    Buffer {
        buffer: vk::Buffer,
        allocation: Allocation,
    },
    Image {
        image: vk::Image,
        allocation: Allocation,
    },
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    Program {
        modules: [vk::ShaderModule; 2],
        set_layouts: [vk::DescriptorSetLayout; 2],
        pipeline_layout: vk::PipelineLayout,
    },
}

impl DeferredResource {
    /// Destroy the resource immediately.
    ///
    /// # Safety
    ///
    /// The GPU must no longer use the resource.
    pub unsafe fn destroy(self, device: &ash::Device, allocator: &mut Allocator) {
        match self {
            DeferredResource::Buffer { buffer, allocation } => {
                if let Err(e) = allocator.free(allocation) {
                    log::error!("Failed to free buffer allocation: {}", e);
                }
                unsafe { device.destroy_buffer(buffer, None) };
            }
            DeferredResource::Image { image, allocation } => {
                if let Err(e) = allocator.free(allocation) {
                    log::error!("Failed to free image allocation: {}", e);
                }
                unsafe { device.destroy_image(image, None) };
            }
            DeferredResource::ImageView(view) => unsafe { device.destroy_image_view(view, None) },
            DeferredResource::Sampler(sampler) => unsafe { device.destroy_sampler(sampler, None) },
            DeferredResource::Framebuffer(framebuffer) => unsafe {
                device.destroy_framebuffer(framebuffer, None)
            },
            DeferredResource::Pipeline(pipeline) => unsafe { device.destroy_pipeline(pipeline, None) },
            DeferredResource::Program {
                modules,
                set_layouts,
                pipeline_layout,
            } => unsafe {
                device.destroy_pipeline_layout(pipeline_layout, None);
                for layout in set_layouts {
                    device.destroy_descriptor_set_layout(layout, None);
                }
                for module in modules {
                    device.destroy_shader_module(module, None);
                }
            },
        }
    }
}

/// Queue of resources waiting for the in-flight frame to retire.
#[derive(Default)]
pub struct DeferredDestructor {
    pending: Vec<DeferredResource>,
}

impl DeferredDestructor {
    pub fn push(&mut self, resource: DeferredResource) {
        self.pending.push(resource);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Destroy everything queued.
    ///
    /// # Safety
    ///
    /// The frame that last used the queued resources must have completed.
    pub unsafe fn flush(&mut self, device: &ash::Device, allocator: &mut Allocator) {
        if !self.pending.is_empty() {
            log::trace!("Destroying {} deferred Vulkan resources", self.pending.len());
        }
        for resource in self.pending.drain(..) {
            unsafe { resource.destroy(device, allocator) };
        }
    }
}
