//! Drawable units: a mesh plus an ordered list of material passes

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use glam::Mat4;

use crate::backend::{
    BlendFactor, CullFace, GraphicsBackend, PolygonOffset, PrimitiveTopology, ProgramHandle,
    SampleCoverage, StencilState,
};
use crate::layout::{bindings, UniformBlock, BONES_DESCRIPTOR, MAX_BONES};
use crate::resources::{Material, Mesh};
use crate::shader::ShaderId;

/// Eye bits of a render mask
pub mod render_mask {
    pub const LEFT: u32 = 0x1;
    pub const RIGHT: u32 = 0x2;
    pub const BOTH: u32 = LEFT | RIGHT;
}

/// Named rendering order bands
pub mod rendering_order {
    pub const STENCIL: i32 = -1000;
    pub const BACKGROUND: i32 = 1000;
    pub const GEOMETRY: i32 = 2000;
    pub const TRANSPARENT: i32 = 3000;
    pub const OVERLAY: i32 = 4000;

    /// Transparent objects are drawn back to front.
    pub fn is_transparent(order: i32) -> bool {
        (TRANSPARENT..OVERLAY).contains(&order)
    }
}

/// Fixed-function state of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassState {
    pub cull_face: CullFace,
    pub depth_test: bool,
    pub depth_mask: bool,
    pub alpha_blend: bool,
    pub blend_func: (BlendFactor, BlendFactor),
    pub polygon_offset: Option<PolygonOffset>,
    pub stencil: Option<StencilState>,
    pub alpha_to_coverage: Option<SampleCoverage>,
}

impl Default for PassState {
    fn default() -> Self {
        Self {
            cull_face: CullFace::Back,
            depth_test: true,
            depth_mask: true,
            alpha_blend: true,
            blend_func: (BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
            polygon_offset: None,
            stencil: None,
            alpha_to_coverage: None,
        }
    }
}

/// One material/shader pass of a [`RenderData`]
#[derive(Debug, Clone)]
pub struct RenderPass {
    material: Arc<Material>,
    shader: Option<ShaderId>,
    pub state: PassState,
    seen_version: Option<u64>,
}

impl RenderPass {
    pub fn new(material: Arc<Material>, shader: Option<ShaderId>) -> Self {
        Self {
            material,
            shader,
            state: PassState::default(),
            seen_version: None,
        }
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    pub fn set_material(&mut self, material: Arc<Material>) {
        self.material = material;
        self.seen_version = None;
    }

    pub fn shader(&self) -> Option<ShaderId> {
        self.shader
    }

    pub fn set_shader(&mut self, shader: ShaderId) {
        self.shader = Some(shader);
    }

    pub fn is_dirty(&self) -> bool {
        self.seen_version != Some(self.material.version())
    }

    fn mark_clean(&mut self) {
        self.seen_version = Some(self.material.version());
    }
}

/// A drawable unit
#[derive(Debug)]
pub struct RenderData {
    passes: Vec<RenderPass>,
    mesh: Option<Arc<Mesh>>,
    pub rendering_order: i32,
    pub render_mask: u32,
    pub cast_shadows: bool,
    pub draw_mode: PrimitiveTopology,
    bones: Option<UniformBlock>,
    seen_mesh_version: Option<u64>,
    camera_distance: f32,
}

impl RenderData {
    pub fn new(mesh: Arc<Mesh>) -> Self {
        Self {
            mesh: Some(mesh),
            ..Self::empty()
        }
    }

    pub fn empty() -> Self {
        Self {
            passes: Vec::new(),
            mesh: None,
            rendering_order: rendering_order::GEOMETRY,
            render_mask: render_mask::BOTH,
            cast_shadows: true,
            draw_mode: PrimitiveTopology::TriangleList,
            bones: None,
            seen_mesh_version: None,
            camera_distance: 0.0,
        }
    }

    pub fn with_rendering_order(mut self, order: i32) -> Self {
        self.rendering_order = order;
        self
    }

    pub fn add_pass(&mut self, material: Arc<Material>, shader: Option<ShaderId>) -> &mut RenderPass {
        self.passes.push(RenderPass::new(material, shader));
        let last = self.passes.len() - 1;
        &mut self.passes[last]
    }

    pub fn passes(&self) -> &[RenderPass] {
        &self.passes
    }

    pub fn pass(&self, index: usize) -> Option<&RenderPass> {
        self.passes.get(index)
    }

    pub fn pass_mut(&mut self, index: usize) -> Option<&mut RenderPass> {
        self.passes.get_mut(index)
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn material(&self, pass: usize) -> Option<&Arc<Material>> {
        self.passes.get(pass).map(|p| p.material())
    }

    pub fn shader(&self, pass: usize) -> Option<ShaderId> {
        self.passes.get(pass).and_then(|p| p.shader())
    }

    pub fn cull_face(&self, pass: usize) -> CullFace {
        self.passes.get(pass).map_or(CullFace::Back, |p| p.state.cull_face)
    }

    pub fn mesh(&self) -> Option<&Arc<Mesh>> {
        self.mesh.as_ref()
    }

    pub fn set_mesh(&mut self, mesh: Arc<Mesh>) {
        self.mesh = Some(mesh);
        self.seen_mesh_version = None;
    }

    pub fn is_transparent(&self) -> bool {
        rendering_order::is_transparent(self.rendering_order)
    }

    /// Distance from the camera computed during the last cull.
    pub fn camera_distance(&self) -> f32 {
        self.camera_distance
    }

    pub(crate) fn set_camera_distance(&mut self, distance: f32) {
        self.camera_distance = distance;
    }

    /// True when a material or the mesh changed since the last [`Self::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        let mesh_version = self.mesh.as_ref().map(|m| m.vertices().version());
        self.passes.iter().any(RenderPass::is_dirty) || mesh_version != self.seen_mesh_version
    }

    pub fn mark_clean(&mut self) {
        for pass in &mut self.passes {
            pass.mark_clean();
        }
        self.seen_mesh_version = self.mesh.as_ref().map(|m| m.vertices().version());
    }

    /// Hash of the state that decides batching, taken from the first pass.
    pub fn hash_code(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.render_mask.hash(&mut hasher);
        self.draw_mode.hash(&mut hasher);
        if let Some(pass) = self.passes.first() {
            pass.state.polygon_offset.hash(&mut hasher);
            pass.state.depth_test.hash(&mut hasher);
            pass.state.alpha_blend.hash(&mut hasher);
            pass.state.alpha_to_coverage.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Store skinning matrices. Missing bones are filled with identity.
    pub fn update_bones(&mut self, matrices: &[Mat4]) -> bool {
        if matrices.len() > MAX_BONES {
            log::error!(
                "RenderData: {} bones exceed the maximum of {}",
                matrices.len(),
                MAX_BONES
            );
            return false;
        }
        let mut padded = [Mat4::IDENTITY; MAX_BONES];
        padded[..matrices.len()].copy_from_slice(matrices);
        self.bones
            .get_or_insert_with(|| UniformBlock::new(BONES_DESCRIPTOR, bindings::BONES, "Bones_ubo"))
            .set_mat4_array("u_bone_matrix", &padded)
    }

    pub fn bones(&self) -> Option<&UniformBlock> {
        self.bones.as_ref()
    }

    /// Upload and bind the bone block for `program`, if this object is skinned.
    pub(crate) fn bind_bones<B: GraphicsBackend>(&mut self, backend: &mut B, program: ProgramHandle) {
        if let Some(bones) = self.bones.as_mut() {
            match bones.update_gpu(backend, program) {
                Ok(()) => {
                    bones.bind_buffer(backend);
                }
                Err(e) => log::error!("RenderData: bone upload failed: {}", e),
            }
        }
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if let Some(bones) = self.bones.as_mut() {
            bones.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_data() -> RenderData {
        let mut rd = RenderData::new(Arc::new(Mesh::cube()));
        rd.add_pass(Arc::new(Material::new("float4 u_color", "")), Some(ShaderId(1)));
        rd
    }

    #[test]
    fn test_material_change_marks_dirty() {
        let mut rd = render_data();
        assert!(rd.is_dirty());
        rd.mark_clean();
        assert!(!rd.is_dirty());

        rd.material(0).unwrap().set_vec4("u_color", glam::Vec4::ONE);
        assert!(rd.is_dirty());
        rd.mark_clean();

        rd.mesh().unwrap().vertices().set_float_vec("a_normal", &[0.0; 72], 0);
        assert!(rd.is_dirty());
    }

    #[test]
    fn test_hash_code_follows_first_pass_state() {
        let mut a = render_data();
        let b = render_data();
        assert_eq!(a.hash_code(), b.hash_code());
        a.pass_mut(0).unwrap().state.alpha_blend = false;
        assert_ne!(a.hash_code(), b.hash_code());
    }

    #[test]
    fn test_update_bones() {
        let mut rd = render_data();
        assert!(rd.bones().is_none());
        assert!(rd.update_bones(&[Mat4::from_scale(glam::Vec3::splat(2.0))]));
        let bones = rd.bones().unwrap();
        assert_eq!(bones.total_size(), 64 * 60);
        assert!(!rd.update_bones(&vec![Mat4::IDENTITY; 61]));
    }

    #[test]
    fn test_transparent_band() {
        assert!(rendering_order::is_transparent(rendering_order::TRANSPARENT));
        assert!(rendering_order::is_transparent(3500));
        assert!(!rendering_order::is_transparent(rendering_order::OVERLAY));
        assert!(!rendering_order::is_transparent(rendering_order::GEOMETRY));
    }
}
