//! Backend selection
//!
//! The backend is chosen once, when the renderer is created. Everything after
//! that is statically dispatched through [`Renderer<B>`].

#[cfg(feature = "wgpu-backend")]
use std::sync::Arc;

use super::{RenderStats, Renderer};
use crate::backend::{DummyBackend, GraphicsBackend};
use crate::error::RenderResult;
use crate::render_target::{RenderTarget, RenderTexture};
use crate::scene::{Camera, Scene};
use crate::{BackendType, RendererConfig};

#[cfg(feature = "vulkan-backend")]
use crate::backend::vulkan::{VulkanBackend, VulkanContext};
#[cfg(feature = "wgpu-backend")]
use crate::backend::wgpu_backend::WgpuBackend;

/// Device handles created by the host, one per backend it can offer.
#[derive(Default)]
pub struct BackendContexts {
    #[cfg(feature = "wgpu-backend")]
    pub wgpu: Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)>,
    #[cfg(feature = "vulkan-backend")]
    pub vulkan: Option<VulkanContext>,
}

/// A renderer over whichever backend was selected.
pub enum RendererInstance {
    Dummy(Renderer<DummyBackend>),
    #[cfg(feature = "wgpu-backend")]
    Wgpu(Renderer<WgpuBackend>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan(Renderer<VulkanBackend>),
}

macro_rules! dispatch {
    ($self:expr, $renderer:ident => $body:expr) => {
        match $self {
            RendererInstance::Dummy($renderer) => $body,
            #[cfg(feature = "wgpu-backend")]
            RendererInstance::Wgpu($renderer) => $body,
            #[cfg(feature = "vulkan-backend")]
            RendererInstance::Vulkan($renderer) => $body,
        }
    };
}

impl RendererInstance {
    pub fn backend_type(&self) -> BackendType {
        match self {
            RendererInstance::Dummy(_) => BackendType::Dummy,
            #[cfg(feature = "wgpu-backend")]
            RendererInstance::Wgpu(_) => BackendType::Wgpu,
            #[cfg(feature = "vulkan-backend")]
            RendererInstance::Vulkan(_) => BackendType::Vulkan,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        dispatch!(self, r => r.backend().name())
    }

    pub fn stats(&self) -> RenderStats {
        dispatch!(self, r => r.stats())
    }

    pub fn begin_frame(&mut self) -> RenderResult<()> {
        dispatch!(self, r => r.begin_frame())
    }

    pub fn end_frame(&mut self) -> RenderResult<()> {
        dispatch!(self, r => r.end_frame())
    }

    pub fn render_camera(
        &mut self,
        scene: &mut Scene,
        camera: &Camera,
        target: Option<&mut RenderTexture>,
    ) -> RenderResult<()> {
        dispatch!(self, r => r.render_camera(scene, camera, target))
    }

    pub fn cull_and_render(&mut self, scene: &mut Scene, target: &mut RenderTarget) {
        dispatch!(self, r => r.cull_and_render(scene, target))
    }

    pub fn make_shadow_maps(&mut self, scene: &mut Scene) -> RenderResult<()> {
        dispatch!(self, r => r.make_shadow_maps(scene))
    }
}

/// Create a renderer on the configured backend.
///
/// The preferred backend is tried first, then Vulkan, then wgpu. When no GPU
/// backend can be created the recording dummy backend is used.
pub fn create_renderer(
    contexts: BackendContexts,
    config: RendererConfig,
) -> RenderResult<RendererInstance> {
    #[allow(unused_mut, unused_variables)]
    let mut contexts = contexts;
    let mut order = vec![config.backend];
    for fallback in [BackendType::Vulkan, BackendType::Wgpu] {
        if !order.contains(&fallback) {
            order.push(fallback);
        }
    }

    for backend in order {
        match backend {
            BackendType::Dummy => break,
            #[cfg(feature = "vulkan-backend")]
            BackendType::Vulkan => {
                let Some(context) = contexts.vulkan.take() else {
                    continue;
                };
                match VulkanBackend::new(context) {
                    Ok(vulkan) => {
                        log::info!("Using Vulkan backend (ash)");
                        return Ok(RendererInstance::Vulkan(Renderer::new(vulkan, config)));
                    }
                    Err(e) => log::warn!("Failed to create Vulkan backend: {}", e),
                }
            }
            #[cfg(feature = "wgpu-backend")]
            BackendType::Wgpu => {
                let Some((device, queue)) = contexts.wgpu.take() else {
                    continue;
                };
                match WgpuBackend::new(device, queue) {
                    Ok(wgpu) => {
                        log::info!("Using wgpu backend");
                        return Ok(RendererInstance::Wgpu(Renderer::new(wgpu, config)));
                    }
                    Err(e) => log::warn!("Failed to create wgpu backend: {}", e),
                }
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    log::info!("Using dummy backend");
    Ok(RendererInstance::Dummy(Renderer::new(DummyBackend::new(), config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falls_back_to_dummy_without_contexts() {
        let config = RendererConfig {
            backend: BackendType::Vulkan,
            ..Default::default()
        };
        let instance = create_renderer(BackendContexts::default(), config).unwrap();
        assert_eq!(instance.backend_type(), BackendType::Dummy);
        assert_eq!(instance.backend_name(), "Dummy Backend");
    }

    #[test]
    fn test_dummy_requested_explicitly() {
        let config = RendererConfig {
            backend: BackendType::Dummy,
            ..Default::default()
        };
        let mut instance = create_renderer(BackendContexts::default(), config).unwrap();
        let mut scene = Scene::new();
        instance
            .render_camera(&mut scene, &Camera::default(), None)
            .unwrap();
        assert_eq!(instance.stats().draw_calls, 0);
    }
}
