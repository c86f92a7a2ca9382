//! Meshes: a vertex buffer plus an optional index buffer

use glam::{Vec2, Vec3};
use parking_lot::{Mutex, MutexGuard};

use crate::backend::{BackendResult, BufferHandle, GraphicsBackend, IndexFormat};
use crate::layout::{IndexBuffer, VertexBuffer};
use crate::scene::BoundingVolume;

/// Buffers ready for a draw call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub index_buffer: Option<(BufferHandle, IndexFormat, u32)>,
}

/// Geometry shared by render data.
///
/// Vertex and index data sit behind locks so geometry import and skinning
/// updates can run off the rendering thread.
#[derive(Debug)]
pub struct Mesh {
    name: String,
    vertices: Mutex<VertexBuffer>,
    indices: Mutex<Option<IndexBuffer>>,
}

impl Mesh {
    pub fn new(name: &str, vertex_descriptor: &str) -> Self {
        Self::from_buffers(name, VertexBuffer::new(vertex_descriptor, 0), None)
    }

    pub fn from_buffers(name: &str, vertices: VertexBuffer, indices: Option<IndexBuffer>) -> Self {
        Self {
            name: name.to_string(),
            vertices: Mutex::new(vertices),
            indices: Mutex::new(indices),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> MutexGuard<'_, VertexBuffer> {
        self.vertices.lock()
    }

    pub fn indices(&self) -> MutexGuard<'_, Option<IndexBuffer>> {
        self.indices.lock()
    }

    pub fn set_indices(&self, indices: IndexBuffer) {
        *self.indices.lock() = Some(indices);
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.lock().vertex_count()
    }

    pub fn index_count(&self) -> Option<u32> {
        self.indices.lock().as_ref().map(|ib| ib.index_count())
    }

    pub fn has_bones(&self) -> bool {
        self.vertices.lock().is_set("a_bone_weights")
    }

    pub fn bounding_volume(&self) -> BoundingVolume {
        self.vertices.lock().bounding_volume()
    }

    /// Upload changed vertex and index data.
    pub fn update_gpu<B: GraphicsBackend>(&self, backend: &mut B) -> BackendResult<GpuMesh> {
        let mut vertices = self.vertices.lock();
        let vertex_buffer = vertices.update_gpu(backend)?;
        let vertex_count = vertices.vertex_count() as u32;
        let index_buffer = match self.indices.lock().as_mut() {
            Some(ib) if ib.index_count() > 0 => {
                Some((ib.update_gpu(backend)?, ib.format(), ib.index_count()))
            }
            _ => None,
        };
        Ok(GpuMesh {
            vertex_buffer,
            vertex_count,
            index_buffer,
        })
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        self.vertices.lock().destroy(backend);
        if let Some(ib) = self.indices.lock().as_mut() {
            ib.destroy(backend);
        }
    }

    /// Full-screen quad in clip space for post effects.
    pub fn quad() -> Self {
        let mut vb = VertexBuffer::new("float3 a_position float2 a_texcoord", 4);
        vb.set_float_vec(
            "a_position",
            &[-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, -1.0, 1.0, 0.0, 1.0, 1.0, 0.0],
            0,
        );
        vb.set_float_vec("a_texcoord", &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0], 0);
        let mut ib = IndexBuffer::new(2);
        ib.set_short_vec(&[0, 1, 2, 2, 1, 3]);
        Self::from_buffers("quad", vb, Some(ib))
    }

    /// Unit cube with positions only, drawn for occlusion queries.
    pub fn bounding_box() -> Self {
        let mut vb = VertexBuffer::new("float3 a_position", 8);
        let mut positions = Vec::with_capacity(24);
        for i in 0..8 {
            positions.push(if i & 1 == 0 { -0.5 } else { 0.5 });
            positions.push(if i & 2 == 0 { -0.5 } else { 0.5 });
            positions.push(if i & 4 == 0 { -0.5 } else { 0.5 });
        }
        vb.set_float_vec("a_position", &positions, 0);
        let mut ib = IndexBuffer::new(2);
        ib.set_short_vec(&[
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
        ]);
        Self::from_buffers("bounding box", vb, Some(ib))
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];
        let corners = [
            (-0.5, -0.5, Vec2::new(0.0, 1.0)),
            (0.5, -0.5, Vec2::new(1.0, 1.0)),
            (0.5, 0.5, Vec2::new(1.0, 0.0)),
            (-0.5, 0.5, Vec2::new(0.0, 0.0)),
        ];

        let mut positions = Vec::with_capacity(72);
        let mut normals = Vec::with_capacity(72);
        let mut uvs = Vec::with_capacity(48);
        let mut indices = Vec::with_capacity(36);
        for (face, (normal, right)) in faces.iter().enumerate() {
            let up = normal.cross(*right);
            for (u, v, uv) in corners {
                let p = *normal * 0.5 + *right * u + up * v;
                positions.extend_from_slice(&p.to_array());
                normals.extend_from_slice(&normal.to_array());
                uvs.extend_from_slice(&uv.to_array());
            }
            let base = (face * 4) as u16;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        let mut vb = VertexBuffer::new("float3 a_position float3 a_normal float2 a_texcoord", 24);
        vb.set_float_vec("a_position", &positions, 0);
        vb.set_float_vec("a_normal", &normals, 0);
        vb.set_float_vec("a_texcoord", &uvs, 0);
        let mut ib = IndexBuffer::new(2);
        ib.set_short_vec(&indices);
        Self::from_buffers("cube", vb, Some(ib))
    }

    /// Create a plane on the XZ axis
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let subdivisions = subdivisions.max(1);
        let half_width = width / 2.0;
        let half_depth = depth / 2.0;
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut uvs = Vec::new();
        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                positions.extend_from_slice(&[
                    -half_width + x as f32 * step_x,
                    0.0,
                    -half_depth + z as f32 * step_z,
                ]);
                normals.extend_from_slice(&[0.0, 1.0, 0.0]);
                uvs.extend_from_slice(&[
                    x as f32 / subdivisions as f32,
                    z as f32 / subdivisions as f32,
                ]);
            }
        }

        let mut indices = Vec::new();
        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        let count = ((subdivisions + 1) * (subdivisions + 1)) as usize;
        let mut vb = VertexBuffer::new("float3 a_position float3 a_normal float2 a_texcoord", count);
        vb.set_float_vec("a_position", &positions, 0);
        vb.set_float_vec("a_normal", &normals, 0);
        vb.set_float_vec("a_texcoord", &uvs, 0);
        let mut ib = IndexBuffer::new(4);
        ib.set_int_vec(&indices);
        Self::from_buffers("plane", vb, Some(ib))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_cube_bounds() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.index_count(), Some(36));
        let bv = cube.bounding_volume();
        assert_eq!(bv.min, Vec3::splat(-0.5));
        assert_eq!(bv.max, Vec3::splat(0.5));
    }

    #[test]
    fn test_quad_upload() {
        let mut backend = DummyBackend::new();
        let quad = Mesh::quad();
        let gpu = quad.update_gpu(&mut backend).unwrap();
        assert_eq!(gpu.vertex_count, 4);
        assert_eq!(gpu.index_buffer.map(|(_, f, n)| (f, n)), Some((IndexFormat::Uint16, 6)));
    }

    #[test]
    fn test_plane_vertex_count() {
        let plane = Mesh::plane(2.0, 2.0, 2);
        assert_eq!(plane.vertex_count(), 9);
        assert_eq!(plane.index_count(), Some(24));
    }
}
