//! Backend abstraction layer
//!
//! Provides the [`GraphicsBackend`] trait and the types every backend shares.
//!
//! # Available Backends
//!
//! - `dummy` (always built): records commands, used for testing
//! - `wgpu-backend`: immediate-style path for GL class devices, through wgpu
//! - `vulkan-backend`: explicit path using ash, gpu-allocator and naga

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::{DummyBackend, RecordedCommand};
pub use traits::*;
pub use types::*;

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(any(feature = "vulkan-backend", feature = "wgpu-backend"))
}
