//! Interleaved per-vertex attribute storage.

use bytemuck::Pod;
use glam::Vec3;

use super::descriptor::{DataDescriptor, DataEntry, Packing};
use super::BONES_PER_VERTEX;
use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, VertexAttribute,
    VertexBufferLayout, VertexFormat,
};
use crate::scene::BoundingVolume;

/// Vertex data laid out by a tightly packed descriptor such as
/// `"float3 a_position float3 a_normal float2 a_texcoord"`.
///
/// Attributes are views (offset plus vertex stride) into one interleaved
/// byte buffer. The vertex count is fixed by the first successful write.
#[derive(Debug)]
pub struct VertexBuffer {
    layout: DataDescriptor,
    vertex_count: usize,
    data: Vec<u8>,
    version: u64,
    gpu_version: u64,
    gpu_size: usize,
    buffer: Option<BufferHandle>,
}

impl VertexBuffer {
    pub fn new(descriptor: &str, vertex_count: usize) -> Self {
        let mut vb = Self {
            layout: DataDescriptor::with_packing(descriptor, Packing::Tight),
            vertex_count: 0,
            data: Vec::new(),
            version: 0,
            gpu_version: 0,
            gpu_size: 0,
            buffer: None,
        };
        if vertex_count > 0 {
            vb.set_vertex_count(vertex_count);
        }
        vb
    }

    pub fn layout(&self) -> &DataDescriptor {
        &self.layout
    }

    pub fn descriptor(&self) -> &str {
        self.layout.descriptor()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Bytes per vertex.
    pub fn vertex_size(&self) -> usize {
        self.layout.total_size()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.version != self.gpu_version || self.buffer.is_none()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.layout.find(name).is_some()
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.layout.is_set(name)
    }

    /// Fix the vertex count. Only the first non-zero count is accepted; later
    /// calls succeed only if they repeat it.
    pub fn set_vertex_count(&mut self, count: usize) -> bool {
        if self.vertex_count == 0 {
            if count == 0 {
                log::error!("VertexBuffer: vertex count must be non-zero");
                return false;
            }
            self.vertex_count = count;
            self.data = vec![0u8; count * self.vertex_size()];
            self.version += 1;
            return true;
        }
        if count != self.vertex_count {
            log::error!(
                "VertexBuffer: cannot change vertex count from {} to {}",
                self.vertex_count,
                count
            );
            return false;
        }
        true
    }

    pub fn set_float_vec(&mut self, name: &str, src: &[f32], stride: usize) -> bool {
        self.set_components(name, src, stride)
    }

    pub fn set_int_vec(&mut self, name: &str, src: &[i32], stride: usize) -> bool {
        self.set_components(name, src, stride)
    }

    fn find_attribute(&self, name: &str) -> Option<DataEntry> {
        let entry = self.layout.find(name).cloned();
        if entry.is_none() {
            log::error!("VertexBuffer: attribute {} not found in vertex buffer", name);
        }
        entry
    }

    /// Copy `min(vertex_count, src.len() / stride)` vertices of a 4-byte
    /// component attribute. A stride of 0 means the attribute's own width.
    fn set_components<T: Pod>(&mut self, name: &str, src: &[T], stride: usize) -> bool {
        let Some(attr) = self.find_attribute(name) else {
            return false;
        };
        let width = attr.size / 4;
        let stride = if stride == 0 { width } else { stride };
        if stride < width {
            log::error!(
                "VertexBuffer: cannot copy to vertex array {}, stride is {} should be >= {}",
                name,
                stride,
                width
            );
            return false;
        }
        let src_vertices = src.len() / stride;
        if self.vertex_count == 0 && !self.set_vertex_count(src_vertices) {
            log::error!("VertexBuffer: source array for {} is empty", name);
            return false;
        }
        if src_vertices < self.vertex_count {
            log::error!(
                "VertexBuffer: not enough vertices in source array for {} ({} of {})",
                name,
                src_vertices,
                self.vertex_count
            );
        }

        let vertex_size = self.vertex_size();
        let copy = src_vertices.min(self.vertex_count);
        for i in 0..copy {
            let components = &src[i * stride..i * stride + width];
            let dst = i * vertex_size + attr.offset;
            self.data[dst..dst + attr.size].copy_from_slice(bytemuck::cast_slice(components));
        }
        self.layout.mark_set(name);
        self.version += 1;
        true
    }

    fn get_components<T: Pod>(&self, name: &str) -> Option<Vec<T>> {
        let attr = self.find_attribute(name)?;
        if !attr.is_set {
            log::error!("VertexBuffer: attribute {} has not been set", name);
            return None;
        }
        let vertex_size = self.vertex_size();
        let mut out = Vec::with_capacity(self.vertex_count * attr.size / 4);
        for i in 0..self.vertex_count {
            let start = i * vertex_size + attr.offset;
            out.extend(
                self.data[start..start + attr.size]
                    .chunks_exact(4)
                    .map(bytemuck::pod_read_unaligned::<T>),
            );
        }
        Some(out)
    }

    pub fn get_float_vec(&self, name: &str) -> Option<Vec<f32>> {
        self.get_components(name)
    }

    pub fn get_int_vec(&self, name: &str) -> Option<Vec<i32>> {
        self.get_components(name)
    }

    /// Write skinning data, `BONES_PER_VERTEX` entries per vertex.
    pub fn set_bone_data(&mut self, indices: &[i32], weights: &[f32]) -> bool {
        if !self.has_attribute("a_bone_indices") || !self.has_attribute("a_bone_weights") {
            log::error!("VertexBuffer: descriptor has no bone attributes");
            return false;
        }
        if indices.len() != weights.len() || indices.len() % BONES_PER_VERTEX != 0 {
            log::error!(
                "VertexBuffer: bone data needs {} indices and weights per vertex, got {} and {}",
                BONES_PER_VERTEX,
                indices.len(),
                weights.len()
            );
            return false;
        }
        self.set_int_vec("a_bone_indices", indices, BONES_PER_VERTEX)
            && self.set_float_vec("a_bone_weights", weights, BONES_PER_VERTEX)
    }

    /// Visit one attribute of every vertex. Returns false if the attribute is unset.
    pub fn for_all_vertices<F>(&self, name: &str, mut f: F) -> bool
    where
        F: FnMut(usize, &[f32]),
    {
        let Some(values) = self.get_float_vec(name) else {
            return false;
        };
        let width = self.layout.byte_size(name) / 4;
        for (i, vertex) in values.chunks_exact(width).enumerate() {
            f(i, vertex);
        }
        true
    }

    /// Axis-aligned bounds of `a_position`.
    pub fn bounding_volume(&self) -> BoundingVolume {
        let mut bv = BoundingVolume::empty();
        self.for_all_vertices("a_position", |_, p| {
            if p.len() >= 3 {
                bv.expand(Vec3::new(p[0], p[1], p[2]));
            }
        });
        log::trace!(
            "VertexBuffer::bounding_volume {:?} {:?} {} verts",
            bv.min,
            bv.max,
            self.vertex_count
        );
        bv
    }

    /// Vertex layout matching the inputs a shader declares, by name.
    /// Shader attribute `i` is bound at location `i`.
    pub fn layout_for(&self, shader_inputs: &DataDescriptor) -> VertexBufferLayout {
        let mut attributes = Vec::new();
        for (location, input) in shader_inputs.entries().iter().enumerate() {
            let Some(attr) = self.layout.find(&input.name) else {
                log::warn!(
                    "VertexBuffer: shader input {} missing from mesh '{}'",
                    input.name,
                    self.descriptor()
                );
                continue;
            };
            let Some(format) = vertex_format(attr) else {
                log::error!(
                    "VertexBuffer: attribute {} has non-vertex type {}",
                    attr.name,
                    attr.type_name
                );
                continue;
            };
            attributes.push(VertexAttribute {
                location: location as u32,
                format,
                offset: attr.offset as u64,
            });
        }
        VertexBufferLayout {
            array_stride: self.vertex_size() as u64,
            attributes,
        }
    }

    pub fn gpu_buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Upload vertex data if it changed, recreating the buffer on growth.
    pub fn update_gpu<B: GraphicsBackend>(&mut self, backend: &mut B) -> BackendResult<BufferHandle> {
        match self.buffer {
            Some(buffer) if self.gpu_size >= self.data.len() => {
                if self.version != self.gpu_version {
                    backend.write_buffer(buffer, 0, &self.data);
                    self.gpu_version = self.version;
                }
                Ok(buffer)
            }
            existing => {
                if let Some(old) = existing {
                    backend.destroy_buffer(old);
                }
                let buffer = backend.create_buffer_init(
                    &BufferDescriptor {
                        label: Some("vertex buffer".to_string()),
                        size: self.data.len().max(4) as u64,
                        usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                    },
                    &self.data,
                )?;
                self.buffer = Some(buffer);
                self.gpu_size = self.data.len();
                self.gpu_version = self.version;
                Ok(buffer)
            }
        }
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy_buffer(buffer);
        }
    }
}

fn vertex_format(entry: &DataEntry) -> Option<VertexFormat> {
    let format = match (entry.is_int(), entry.size) {
        (false, 4) => VertexFormat::Float32,
        (false, 8) => VertexFormat::Float32x2,
        (false, 12) => VertexFormat::Float32x3,
        (false, 16) if !entry.is_matrix() => VertexFormat::Float32x4,
        (true, 4) => VertexFormat::Sint32,
        (true, 8) => VertexFormat::Sint32x2,
        (true, 12) => VertexFormat::Sint32x3,
        (true, 16) => VertexFormat::Sint32x4,
        _ => return None,
    };
    Some(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: &str = "float3 a_position float2 a_texcoord";

    #[test]
    fn test_vertex_count_fixed_once_set() {
        let mut vb = VertexBuffer::new(DESC, 0);
        assert!(vb.set_vertex_count(4));
        assert!(vb.set_vertex_count(4));
        assert!(!vb.set_vertex_count(5));
        assert_eq!(vb.vertex_count(), 4);
        assert_eq!(vb.vertex_size(), 20);
    }

    #[test]
    fn test_set_and_get_interleaved() {
        let mut vb = VertexBuffer::new(DESC, 0);
        let positions = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let uvs = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        assert!(vb.set_float_vec("a_position", &positions, 0));
        assert!(vb.set_float_vec("a_texcoord", &uvs, 0));
        assert_eq!(vb.vertex_count(), 3);
        assert_eq!(vb.get_float_vec("a_position").unwrap(), positions.to_vec());
        assert_eq!(vb.get_float_vec("a_texcoord").unwrap(), uvs.to_vec());
    }

    #[test]
    fn test_source_stride() {
        let mut vb = VertexBuffer::new(DESC, 2);
        // position followed by an ignored extra component
        let src = [1.0, 2.0, 3.0, 9.0, 4.0, 5.0, 6.0, 9.0];
        assert!(vb.set_float_vec("a_position", &src, 4));
        assert_eq!(vb.get_float_vec("a_position").unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(!vb.set_float_vec("a_position", &src, 2));
    }

    #[test]
    fn test_short_source_never_writes_past_end() {
        let mut vb = VertexBuffer::new(DESC, 4);
        let before = vb.data().len();
        assert!(vb.set_float_vec("a_position", &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0], 0));
        assert_eq!(vb.data().len(), before);
        let positions = vb.get_float_vec("a_position").unwrap();
        assert_eq!(&positions[..6], &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(&positions[6..], &[0.0; 6]);

        // longer source is truncated to the fixed vertex count
        let long: Vec<f32> = (0..30).map(|i| i as f32).collect();
        assert!(vb.set_float_vec("a_position", &long, 0));
        assert_eq!(vb.data().len(), before);
    }

    #[test]
    fn test_bounding_volume() {
        let mut vb = VertexBuffer::new(DESC, 0);
        vb.set_float_vec("a_position", &[-1.0, 0.0, 2.0, 3.0, 4.0, -2.0], 0);
        let bv = vb.bounding_volume();
        assert_eq!(bv.min, Vec3::new(-1.0, 0.0, -2.0));
        assert_eq!(bv.max, Vec3::new(3.0, 4.0, 2.0));
        assert_eq!(bv.center(), Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn test_bone_data() {
        let mut vb = VertexBuffer::new("float3 a_position int4 a_bone_indices float4 a_bone_weights", 2);
        assert!(vb.set_bone_data(&[0, 1, 0, 0, 2, 3, 0, 0], &[0.5, 0.5, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]));
        assert_eq!(vb.get_int_vec("a_bone_indices").unwrap(), vec![0, 1, 0, 0, 2, 3, 0, 0]);
        assert!(!vb.set_bone_data(&[0, 1], &[1.0, 0.0]));
    }

    #[test]
    fn test_layout_for_shader_inputs() {
        let vb = VertexBuffer::new("float3 a_position float3 a_normal float2 a_texcoord", 1);
        let shader = DataDescriptor::with_packing("float3 a_position float2 a_texcoord", Packing::Tight);
        let layout = vb.layout_for(&shader);
        assert_eq!(layout.array_stride, 32);
        assert_eq!(layout.attributes.len(), 2);
        assert_eq!(layout.attributes[1].location, 1);
        assert_eq!(layout.attributes[1].offset, 24);
        assert_eq!(layout.attributes[1].format, VertexFormat::Float32x2);
    }
}
