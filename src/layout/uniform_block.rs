//! Packed uniform blocks.

use std::collections::HashMap;

use glam::{Mat4, Vec2, Vec3, Vec4};

use super::descriptor::{DataDescriptor, Packing};
use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, ProgramHandle,
};

/// A named, std140-packed block of shader constants.
///
/// Every setter checks that the byte size of the value matches the declared
/// field exactly. A mismatch or an unknown name logs, returns `false` and
/// leaves the block untouched.
#[derive(Debug)]
pub struct UniformBlock {
    layout: DataDescriptor,
    block_name: String,
    binding: u32,
    data: Vec<u8>,
    version: u64,
    gpu_version: u64,
    uploaded: HashMap<ProgramHandle, u64>,
    buffer: Option<BufferHandle>,
}

impl UniformBlock {
    pub fn new(descriptor: &str, binding: u32, block_name: &str) -> Self {
        let layout = DataDescriptor::with_packing(descriptor, Packing::Std140);
        let data = vec![0u8; layout.total_size()];
        Self {
            layout,
            block_name: block_name.to_string(),
            binding,
            data,
            version: 0,
            gpu_version: 0,
            uploaded: HashMap::new(),
            buffer: None,
        }
    }

    pub fn layout(&self) -> &DataDescriptor {
        &self.layout
    }

    pub fn descriptor(&self) -> &str {
        self.layout.descriptor()
    }

    pub fn block_name(&self) -> &str {
        &self.block_name
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn total_size(&self) -> usize {
        self.layout.total_size()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Content version, bumped by every successful write.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True when the content changed since the last GPU upload.
    pub fn is_dirty(&self) -> bool {
        self.version != self.gpu_version
    }

    /// True when `program` has not yet seen the current content.
    pub fn is_dirty_for(&self, program: ProgramHandle) -> bool {
        self.uploaded.get(&program) != Some(&self.version)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.layout.find(name).is_some()
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.layout.is_set(name)
    }

    /// Copy raw bytes into a field. The length must equal the field size.
    pub fn set_bytes(&mut self, name: &str, bytes: &[u8]) -> bool {
        let Some(entry) = self.layout.find(name) else {
            log::error!("UniformBlock {}: uniform {} not found", self.block_name, name);
            return false;
        };
        if entry.size != bytes.len() {
            log::error!(
                "UniformBlock {}: size mismatch for {}, expected {} bytes, got {}",
                self.block_name,
                name,
                entry.size,
                bytes.len()
            );
            return false;
        }
        let range = entry.offset..entry.offset + entry.size;
        self.data[range].copy_from_slice(bytes);
        self.layout.mark_set(name);
        self.version += 1;
        true
    }

    /// Read the raw bytes of a field whose size must equal `size`.
    pub fn get_bytes(&self, name: &str, size: usize) -> Option<&[u8]> {
        let Some(entry) = self.layout.find(name) else {
            log::error!("UniformBlock {}: uniform {} not found", self.block_name, name);
            return None;
        };
        if entry.size != size {
            log::error!(
                "UniformBlock {}: size mismatch reading {}, declared {} bytes, requested {}",
                self.block_name,
                name,
                entry.size,
                size
            );
            return None;
        }
        Some(&self.data[entry.offset..entry.offset + entry.size])
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> bool {
        self.set_bytes(name, bytemuck::bytes_of(&value))
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> bool {
        self.set_bytes(name, bytemuck::bytes_of(&value))
    }

    pub fn set_vec2(&mut self, name: &str, value: Vec2) -> bool {
        self.set_bytes(name, bytemuck::bytes_of(&value))
    }

    pub fn set_vec3(&mut self, name: &str, value: Vec3) -> bool {
        self.set_bytes(name, bytemuck::bytes_of(&value))
    }

    pub fn set_vec4(&mut self, name: &str, value: Vec4) -> bool {
        self.set_bytes(name, bytemuck::bytes_of(&value))
    }

    pub fn set_mat4(&mut self, name: &str, value: &Mat4) -> bool {
        self.set_bytes(name, bytemuck::bytes_of(value))
    }

    pub fn set_mat4_array(&mut self, name: &str, values: &[Mat4]) -> bool {
        self.set_bytes(name, bytemuck::cast_slice(values))
    }

    pub fn set_int_vec(&mut self, name: &str, values: &[i32]) -> bool {
        self.set_bytes(name, bytemuck::cast_slice(values))
    }

    pub fn set_float_vec(&mut self, name: &str, values: &[f32]) -> bool {
        self.set_bytes(name, bytemuck::cast_slice(values))
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        self.get_bytes(name, 4).map(bytemuck::pod_read_unaligned)
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        self.get_bytes(name, 4).map(bytemuck::pod_read_unaligned)
    }

    pub fn get_vec2(&self, name: &str) -> Option<Vec2> {
        self.get_bytes(name, 8).map(bytemuck::pod_read_unaligned)
    }

    pub fn get_vec3(&self, name: &str) -> Option<Vec3> {
        self.get_bytes(name, 12).map(bytemuck::pod_read_unaligned)
    }

    pub fn get_vec4(&self, name: &str) -> Option<Vec4> {
        self.get_bytes(name, 16).map(bytemuck::pod_read_unaligned)
    }

    pub fn get_mat4(&self, name: &str) -> Option<Mat4> {
        self.get_bytes(name, 64).map(bytemuck::pod_read_unaligned)
    }

    pub fn get_int_vec(&self, name: &str, count: usize) -> Option<Vec<i32>> {
        self.get_bytes(name, count * 4)
            .map(|bytes| bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect())
    }

    pub fn get_float_vec(&self, name: &str, count: usize) -> Option<Vec<f32>> {
        self.get_bytes(name, count * 4)
            .map(|bytes| bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect())
    }

    /// GLSL declaration of this block.
    pub fn make_shader_layout(&self) -> String {
        let mut out = format!("layout (std140) uniform {}\n{{\n", self.block_name);
        for entry in self.layout.entries() {
            let base = entry
                .shader_type
                .split('[')
                .next()
                .unwrap_or(entry.shader_type.as_str());
            if entry.array_size > 1 {
                out.push_str(&format!("    {} {}[{}];\n", base, entry.name, entry.array_size));
            } else {
                out.push_str(&format!("    {} {};\n", base, entry.name));
            }
        }
        out.push_str("};\n");
        out
    }

    pub fn gpu_buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Upload the block if it changed and record that `program` has seen it.
    pub fn update_gpu<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        program: ProgramHandle,
    ) -> BackendResult<()> {
        match self.buffer {
            None => {
                let buffer = backend.create_buffer_init(
                    &BufferDescriptor {
                        label: Some(self.block_name.clone()),
                        size: self.data.len().max(16) as u64,
                        usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                    },
                    &self.data,
                )?;
                self.buffer = Some(buffer);
                self.gpu_version = self.version;
            }
            Some(buffer) if self.version != self.gpu_version => {
                backend.write_buffer(buffer, 0, &self.data);
                self.gpu_version = self.version;
            }
            Some(_) => {}
        }
        self.uploaded.insert(program, self.version);
        Ok(())
    }

    /// Bind the persistent buffer at this block's binding point.
    pub fn bind_buffer<B: GraphicsBackend>(&self, backend: &mut B) -> bool {
        match self.buffer {
            Some(buffer) => {
                backend.bind_uniform_buffer(self.binding, buffer);
                true
            }
            None => {
                log::error!("UniformBlock {}: bound before upload", self.block_name);
                false
            }
        }
    }

    /// Hand the current content to the backend for the next draw only.
    pub fn push<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.push_uniforms(self.binding, &self.data);
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy_buffer(buffer);
        }
        self.uploaded.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, RecordedCommand};

    fn material_block() -> UniformBlock {
        UniformBlock::new("float4 u_color float u_opacity int u_flags mat4 u_extra", 1, "Material_ubo")
    }

    #[test]
    fn test_set_get_round_trip() {
        let mut block = material_block();
        assert!(!block.is_dirty());
        assert!(block.set_vec4("u_color", Vec4::new(1.0, 0.5, 0.25, 1.0)));
        assert!(block.is_dirty());
        assert!(block.set_float("u_opacity", 0.75));
        assert!(block.set_int("u_flags", 7));
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        assert!(block.set_mat4("u_extra", &m));

        assert_eq!(block.get_vec4("u_color"), Some(Vec4::new(1.0, 0.5, 0.25, 1.0)));
        assert_eq!(block.get_float("u_opacity"), Some(0.75));
        assert_eq!(block.get_int("u_flags"), Some(7));
        assert_eq!(block.get_mat4("u_extra"), Some(m));
        assert!(block.is_set("u_color"));
    }

    #[test]
    fn test_size_mismatch_leaves_block_untouched() {
        let mut block = material_block();
        let before = block.data().to_vec();
        assert!(!block.set_vec3("u_color", Vec3::ONE));
        assert!(!block.set_float_vec("u_opacity", &[1.0, 2.0]));
        assert!(!block.set_float("u_missing", 1.0));
        assert_eq!(block.data(), &before[..]);
        assert!(!block.is_dirty());
        assert_eq!(block.get_vec3("u_color"), None);
    }

    #[test]
    fn test_dirty_tracked_per_program() {
        let mut backend = DummyBackend::new();
        let mut block = material_block();
        let a = ProgramHandle(100);
        let b = ProgramHandle(200);

        block.set_float("u_opacity", 1.0);
        block.update_gpu(&mut backend, a).unwrap();
        assert!(!block.is_dirty());
        assert!(!block.is_dirty_for(a));
        assert!(block.is_dirty_for(b));

        block.update_gpu(&mut backend, b).unwrap();
        block.set_float("u_opacity", 0.5);
        assert!(block.is_dirty_for(a));
        assert!(block.is_dirty_for(b));

        backend.take_commands();
        block.update_gpu(&mut backend, a).unwrap();
        block.update_gpu(&mut backend, b).unwrap();
        let writes = backend
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::WriteBuffer { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_make_shader_layout() {
        let block = UniformBlock::new("float3 u_color; mat4 u_bones[2]", 1, "Material_ubo");
        let layout = block.make_shader_layout();
        assert_eq!(
            layout,
            "layout (std140) uniform Material_ubo\n{\n    vec3 u_color;\n    mat4 u_bones[2];\n};\n"
        );
    }
}
