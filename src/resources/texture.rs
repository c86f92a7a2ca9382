//! Textures with asynchronous readiness
//!
//! Pixel data may be produced on any thread through [`Texture::update`]. The
//! rendering thread picks it up with [`Texture::check_for_update`], which is
//! the only place GPU resources are created. Until the first upload the
//! texture reports `is_ready() == false` and materials using it are skipped.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Decoded pixel data
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    /// Create a default white texture
    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a checkerboard texture
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8Unorm,
            data,
            name: "checkerboard".to_string(),
        }
    }
}

/// GPU side of a texture
#[derive(Debug, Clone, Copy)]
pub struct GpuTexture {
    pub handle: TextureHandle,
    pub view: TextureViewHandle,
    pub sampler: SamplerHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// False when the texture belongs to a render texture
    owned: bool,
}

/// A sampled texture shared between materials
#[derive(Debug)]
pub struct Texture {
    name: String,
    sampler: SamplerDescriptor,
    ready: AtomicBool,
    pending: Mutex<Option<TextureData>>,
    gpu: Mutex<Option<GpuTexture>>,
}

impl Texture {
    /// An empty texture that is not ready until data arrives.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sampler: SamplerDescriptor {
                label: Some(name.to_string()),
                ..Default::default()
            },
            ready: AtomicBool::new(false),
            pending: Mutex::new(None),
            gpu: Mutex::new(None),
        }
    }

    /// A texture with pixel data waiting for upload.
    pub fn from_data(data: TextureData) -> Self {
        let texture = Self::new(&data.name);
        texture.update(data);
        texture
    }

    /// Wrap the color attachment of a render texture. Ready immediately.
    pub fn from_render_target(name: &str, gpu: GpuTexture) -> Self {
        Self {
            name: name.to_string(),
            sampler: SamplerDescriptor::default(),
            ready: AtomicBool::new(true),
            pending: Mutex::new(None),
            gpu: Mutex::new(Some(GpuTexture { owned: false, ..gpu })),
        }
    }

    pub fn with_sampler(mut self, sampler: SamplerDescriptor) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking readiness poll.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Hand over new pixel data. Safe to call from any thread.
    pub fn update(&self, data: TextureData) {
        *self.pending.lock() = Some(data);
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Upload pending pixel data. Must run on the rendering thread.
    /// Returns true when an upload happened.
    pub fn check_for_update<B: GraphicsBackend>(&self, backend: &mut B) -> BackendResult<bool> {
        let Some(data) = self.pending.lock().take() else {
            return Ok(false);
        };

        let mut gpu = self.gpu.lock();
        let reuse = gpu.as_ref().is_some_and(|g| {
            g.owned && g.width == data.width && g.height == data.height && g.format == data.format
        });
        if reuse {
            if let Some(g) = gpu.as_ref() {
                backend.write_texture(g.handle, &data.data, data.width, data.height);
            }
        } else {
            if let Some(old) = gpu.take() {
                if old.owned {
                    backend.destroy_texture(old.handle);
                }
            }
            let handle = backend.create_texture(&TextureDescriptor {
                label: Some(data.name.clone()),
                width: data.width,
                height: data.height,
                format: data.format,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
                ..Default::default()
            })?;
            let view = backend.create_texture_view(handle, &TextureViewDescriptor::default())?;
            let sampler = backend.create_sampler(&self.sampler)?;
            backend.write_texture(handle, &data.data, data.width, data.height);
            *gpu = Some(GpuTexture {
                handle,
                view,
                sampler,
                width: data.width,
                height: data.height,
                format: data.format,
                owned: true,
            });
        }
        log::debug!("Texture {}: uploaded {}x{}", self.name, data.width, data.height);
        self.ready.store(true, Ordering::Release);
        Ok(true)
    }

    pub fn gpu(&self) -> Option<GpuTexture> {
        *self.gpu.lock()
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        if let Some(gpu) = self.gpu.lock().take() {
            if gpu.owned {
                backend.destroy_texture(gpu.handle);
            }
        }
        self.ready.store(false, Ordering::Release);
    }
}

impl GpuTexture {
    pub fn new(
        handle: TextureHandle,
        view: TextureViewHandle,
        sampler: SamplerHandle,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Self {
        Self {
            handle,
            view,
            sampler,
            width,
            height,
            format,
            owned: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use std::sync::Arc;

    #[test]
    fn test_texture_ready_after_upload() {
        let mut backend = DummyBackend::new();
        let texture = Texture::new("albedo");
        assert!(!texture.is_ready());
        assert!(!texture.check_for_update(&mut backend).unwrap());

        texture.update(TextureData::white());
        assert!(!texture.is_ready());
        assert!(texture.check_for_update(&mut backend).unwrap());
        assert!(texture.is_ready());
        assert!(texture.gpu().is_some());
    }

    #[test]
    fn test_update_from_another_thread() {
        let mut backend = DummyBackend::new();
        let texture = Arc::new(Texture::new("async"));
        let producer = texture.clone();
        std::thread::spawn(move || producer.update(TextureData::checkerboard(16, [0; 4], [255; 4])))
            .join()
            .unwrap();
        assert!(texture.has_pending_update());
        texture.check_for_update(&mut backend).unwrap();
        assert_eq!(texture.gpu().unwrap().width, 16);
    }

    #[test]
    fn test_same_size_update_reuses_texture() {
        let mut backend = DummyBackend::new();
        let texture = Texture::from_data(TextureData::white());
        texture.check_for_update(&mut backend).unwrap();
        let first = texture.gpu().unwrap().handle;
        texture.update(TextureData::solid_color([1, 2, 3, 4], "other"));
        texture.check_for_update(&mut backend).unwrap();
        assert_eq!(texture.gpu().unwrap().handle, first);
    }
}
