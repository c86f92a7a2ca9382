//! Triangle index storage.

use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat,
};

/// 16- or 32-bit indices with lazy GPU upload.
#[derive(Debug)]
pub struct IndexBuffer {
    format: IndexFormat,
    data: Vec<u8>,
    version: u64,
    gpu_version: u64,
    gpu_size: usize,
    buffer: Option<BufferHandle>,
}

impl IndexBuffer {
    /// `bytes_per_index` must be 2 or 4; anything else falls back to 4.
    pub fn new(bytes_per_index: u32) -> Self {
        let format = match bytes_per_index {
            2 => IndexFormat::Uint16,
            4 => IndexFormat::Uint32,
            other => {
                log::error!("IndexBuffer: unsupported index size {}, using 4 bytes", other);
                IndexFormat::Uint32
            }
        };
        Self {
            format,
            data: Vec::new(),
            version: 0,
            gpu_version: 0,
            gpu_size: 0,
            buffer: None,
        }
    }

    pub fn format(&self) -> IndexFormat {
        self.format
    }

    pub fn index_count(&self) -> u32 {
        (self.data.len() / self.format.size() as usize) as u32
    }

    pub fn set_short_vec(&mut self, indices: &[u16]) -> bool {
        if self.format != IndexFormat::Uint16 {
            log::error!("IndexBuffer: 16-bit indices written to a 32-bit buffer");
            return false;
        }
        self.data = bytemuck::cast_slice(indices).to_vec();
        self.version += 1;
        true
    }

    pub fn set_int_vec(&mut self, indices: &[u32]) -> bool {
        if self.format != IndexFormat::Uint32 {
            log::error!("IndexBuffer: 32-bit indices written to a 16-bit buffer");
            return false;
        }
        self.data = bytemuck::cast_slice(indices).to_vec();
        self.version += 1;
        true
    }

    pub fn get_short_vec(&self) -> Option<Vec<u16>> {
        (self.format == IndexFormat::Uint16).then(|| {
            self.data
                .chunks_exact(2)
                .map(bytemuck::pod_read_unaligned)
                .collect()
        })
    }

    pub fn get_int_vec(&self) -> Option<Vec<u32>> {
        (self.format == IndexFormat::Uint32).then(|| {
            self.data
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned)
                .collect()
        })
    }

    pub fn gpu_buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    pub fn update_gpu<B: GraphicsBackend>(&mut self, backend: &mut B) -> BackendResult<BufferHandle> {
        // buffer writes must be a multiple of 4 bytes
        let mut padded = self.data.clone();
        padded.resize(self.data.len().next_multiple_of(4).max(4), 0);

        if let Some(buffer) = self.buffer {
            if self.gpu_size >= padded.len() {
                if self.version != self.gpu_version {
                    backend.write_buffer(buffer, 0, &padded);
                    self.gpu_version = self.version;
                }
                return Ok(buffer);
            }
            backend.destroy_buffer(buffer);
        }
        let buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("index buffer".to_string()),
                size: padded.len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            },
            &padded,
        )?;
        self.buffer = Some(buffer);
        self.gpu_size = padded.len();
        self.gpu_version = self.version;
        Ok(buffer)
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_short_indices() {
        let mut ib = IndexBuffer::new(2);
        assert!(ib.set_short_vec(&[0, 1, 2, 2, 1, 3]));
        assert_eq!(ib.index_count(), 6);
        assert_eq!(ib.get_short_vec().unwrap(), vec![0, 1, 2, 2, 1, 3]);
        assert!(!ib.set_int_vec(&[0, 1, 2]));
        assert!(ib.get_int_vec().is_none());
    }

    #[test]
    fn test_upload_pads_to_four_bytes() {
        let mut backend = DummyBackend::new();
        let mut ib = IndexBuffer::new(2);
        ib.set_short_vec(&[0, 1, 2]);
        ib.update_gpu(&mut backend).unwrap();
        assert_eq!(ib.gpu_size, 8);
        assert_eq!(ib.index_count(), 3);
    }
}
