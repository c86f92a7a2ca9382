//! VR Render Core - the rendering core of a mobile VR engine
//!
//! Given a scene and a camera, the renderer culls visible objects, orders them
//! for correct compositing, binds geometry, material and lighting state and
//! issues draw calls: per eye, per shadow-casting light and per post effect.
//!
//! Three backends implement the same [`backend::GraphicsBackend`] trait:
//! - **Dummy**: records every command, used for testing without a GPU
//! - **wgpu**: immediate-style path (GLES/GL class devices through wgpu)
//! - **Vulkan**: explicit path via ash and gpu-allocator
//!
//! # Features
//! - Descriptor-driven layout engine (`"float3 color float opacity"` to packed
//!   std140 uniform blocks and interleaved vertex buffers)
//! - Signature-keyed shader registry with an error-shader fallback
//! - Materials with async-ready textures and version-based dirty tracking
//! - Frustum and occlusion culling, state sort, shadow maps, post-effect ping-pong

pub mod backend;
pub mod error;
pub mod layout;
pub mod render_data;
pub mod render_target;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shader;

pub use backend::{DummyBackend, GraphicsBackend};
pub use error::{RenderError, RenderResult};
pub use layout::{DataDescriptor, IndexBuffer, UniformBlock, VertexBuffer};
pub use render_data::{PassState, RenderData, RenderPass};
pub use render_target::{RenderTarget, RenderTexture, RenderTextureDescriptor, ShadowMap};
pub use renderer::{RenderState, RenderStats, Renderer};
pub use resources::{Material, Mesh, Texture, TextureData};
pub use scene::{Camera, Light, Scene, SceneObject};
pub use shader::{Shader, ShaderId, ShaderManager};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;

#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::{VulkanBackend, VulkanContext};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Recording backend, no GPU work
    Dummy,
    /// wgpu backend - immediate-style, GL class devices
    #[default]
    Wgpu,
    /// Vulkan backend via ash
    Vulkan,
}

/// Configuration for creating a renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Preferred backend
    pub backend: BackendType,
    /// Render both eyes in one pass with per-eye matrix arrays
    pub multiview: bool,
    /// Give render textures a stencil attachment and clear it
    pub use_stencil: bool,
    /// Run GPU occlusion queries for occlusion candidates
    pub occlusion_culling: bool,
    /// Square size of the layered shadow map
    pub shadow_map_size: u32,
    /// Number of shadow map layers (one per shadow-casting light)
    pub max_shadow_layers: u32,
    /// Sample count for render textures created by the renderer
    pub msaa_samples: u32,
    /// Background colour for cameras that do not set one
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Wgpu,
            multiview: false,
            use_stencil: false,
            occlusion_culling: true,
            shadow_map_size: 1024,
            max_shadow_layers: 4,
            msaa_samples: 1,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.backend, BackendType::Wgpu);
        assert!(!config.multiview);
        assert!(config.occlusion_culling);
        assert_eq!(config.msaa_samples, 1);
    }
}
