//! Descriptor-driven GPU data layout.
//!
//! A descriptor string such as `"float3 u_color float u_opacity mat4 u_model"`
//! defines the field table of a [`UniformBlock`] or the per-vertex record of a
//! [`VertexBuffer`]. Both are plain byte buffers laid out by [`DataDescriptor`]
//! and uploaded to the backend only when their content version changes.

mod descriptor;
mod index_buffer;
mod uniform_block;
mod vertex_buffer;

pub use descriptor::{parse_fields, DataDescriptor, DataEntry, FieldDecl, Packing};
pub use index_buffer::IndexBuffer;
pub use uniform_block::UniformBlock;
pub use vertex_buffer::VertexBuffer;

/// Uniform block binding points shared by every shader program.
pub mod bindings {
    /// Per-object transform matrices
    pub const TRANSFORM: u32 = 0;
    /// Material uniforms
    pub const MATERIAL: u32 = 1;
    /// Skinning matrices
    pub const BONES: u32 = 3;
    /// First light block; light `i` lives at `LIGHTS + i`
    pub const LIGHTS: u32 = 4;
    /// Maximum number of light blocks a program can see
    pub const MAX_LIGHTS: u32 = 4;
}

/// Transform block descriptor for single-view rendering.
pub const TRANSFORM_DESCRIPTOR: &str =
    "mat4 u_view; mat4 u_mvp; mat4 u_mv; mat4 u_mv_it; mat4 u_model; mat4 u_view_i; float u_right;";

/// Transform block descriptor when both eyes render in one multiview pass.
pub const TRANSFORM_DESCRIPTOR_MULTIVIEW: &str = "mat4 u_view_[2]; mat4 u_mvp_[2]; mat4 u_mv_[2]; \
     mat4 u_mv_it_[2]; mat4 u_model; mat4 u_view_i; float u_right;";

/// Skinning block descriptor.
pub const BONES_DESCRIPTOR: &str = "mat4 u_bone_matrix[60];";

/// Maximum number of bones per skinned mesh.
pub const MAX_BONES: usize = 60;

/// Bones influencing a single vertex.
pub const BONES_PER_VERTEX: usize = 4;
