//! Shader programs and the signature-keyed shader registry.
//!
//! A [`Shader`] is immutable once registered: signature, descriptors and GLSL
//! source never change. Only the backend program handle is created lazily the
//! first time the shader is used on the rendering thread.
//!
//! # Bindings
//!
//! Programs follow one binding convention across backends:
//!
//! - uniform blocks live in set 0 at the points in [`crate::layout::bindings`]
//! - texture unit `i` lives in set 1 at binding `2i` (image) and `2i + 1` (sampler)
//! - when a shader uses lights, the shadow map takes the unit after its own textures

pub mod builtin;
mod manager;

use parking_lot::Mutex;

use crate::backend::{GraphicsBackend, ProgramDescriptor, ProgramHandle, TextureSlotKind};
use crate::error::{RenderError, RenderResult};
use crate::layout::{bindings, parse_fields, DataDescriptor, Packing};

pub use manager::ShaderManager;

/// Fallback shader drawn when a pass names an unknown shader.
pub const ERROR_SHADER: &str = "GVRErrorShader";
/// Depth-only shader for shadow maps.
pub const DEPTH_SHADER: &str = "GVRDepthShader";
/// Depth-only shader for skinned meshes.
pub const DEPTH_SHADER_SKINNED: &str = "GVRDepthShader$a_bone_weights$a_bone_indices";
/// Shader used to draw bounding boxes for occlusion queries.
pub const BOUNDING_BOX_SHADER: &str = "GVRBoundingBoxShader";

/// Monotonically allocated shader id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaderId(pub u32);

/// Everything needed to register a shader.
#[derive(Debug, Clone, Default)]
pub struct ShaderDescriptor {
    pub signature: String,
    /// Material uniform descriptor (`"float4 u_color float u_opacity"`)
    pub uniform_descriptor: String,
    /// Texture slot descriptor (`"sampler2D u_texture"`)
    pub texture_descriptor: String,
    /// Vertex input descriptor; input `i` is bound at location `i`
    pub vertex_descriptor: String,
    pub vertex_source: String,
    pub fragment_source: String,
}

/// A registered shader.
#[derive(Debug)]
pub struct Shader {
    id: ShaderId,
    desc: ShaderDescriptor,
    vertex_inputs: DataDescriptor,
    texture_names: Vec<String>,
    uses_matrix_uniforms: bool,
    use_lights: bool,
    has_bones: bool,
    program: Mutex<Option<ProgramHandle>>,
}

impl Shader {
    pub(crate) fn new(id: ShaderId, desc: ShaderDescriptor) -> Self {
        let sources = [desc.vertex_source.as_str(), desc.fragment_source.as_str()];
        let mentions = |keys: &[&str]| sources.iter().any(|s| keys.iter().any(|k| s.contains(k)));

        let vertex_inputs = DataDescriptor::with_packing(&desc.vertex_descriptor, Packing::Tight);
        Self {
            id,
            uses_matrix_uniforms: mentions(&["u_model", "u_mvp", "Transform_ubo"]),
            use_lights: mentions(&["Lights", "u_shadow_maps"]),
            has_bones: vertex_inputs.find("a_bone_weights").is_some(),
            texture_names: parse_fields(&desc.texture_descriptor)
                .into_iter()
                .map(|f| f.name)
                .collect(),
            vertex_inputs,
            desc,
            program: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn signature(&self) -> &str {
        &self.desc.signature
    }

    pub fn uniform_descriptor(&self) -> &str {
        &self.desc.uniform_descriptor
    }

    pub fn texture_descriptor(&self) -> &str {
        &self.desc.texture_descriptor
    }

    pub fn vertex_inputs(&self) -> &DataDescriptor {
        &self.vertex_inputs
    }

    /// Texture slot names in unit order.
    pub fn texture_names(&self) -> &[String] {
        &self.texture_names
    }

    pub fn vertex_source(&self) -> &str {
        &self.desc.vertex_source
    }

    pub fn fragment_source(&self) -> &str {
        &self.desc.fragment_source
    }

    pub fn uses_matrix_uniforms(&self) -> bool {
        self.uses_matrix_uniforms
    }

    pub fn use_lights(&self) -> bool {
        self.use_lights
    }

    pub fn has_bones(&self) -> bool {
        self.has_bones
    }

    /// Texture unit of the shadow map, right after the shader's own textures.
    pub fn shadow_map_unit(&self) -> u32 {
        self.texture_names.len() as u32
    }

    pub fn program(&self) -> Option<ProgramHandle> {
        *self.program.lock()
    }

    /// Create the backend program on first use.
    ///
    /// In multiview mode the vertex source must use `gl_ViewID_OVR` and enable
    /// `GL_OVR_multiview2`, otherwise initialization fails.
    pub fn init<B: GraphicsBackend>(&self, backend: &mut B, multiview: bool) -> RenderResult<ProgramHandle> {
        let mut program = self.program.lock();
        if let Some(handle) = *program {
            return Ok(handle);
        }

        let vs = &self.desc.vertex_source;
        if multiview && !(vs.contains("gl_ViewID_OVR") && vs.contains("GL_OVR_multiview2")) {
            log::error!("Shader {}: shaders are not multiview", self.signature());
            return Err(RenderError::MultiviewUnsupported {
                signature: self.signature().to_string(),
            });
        }

        let mut uniform_bindings = Vec::new();
        if self.uses_matrix_uniforms {
            uniform_bindings.push(bindings::TRANSFORM);
        }
        if !DataDescriptor::new(&self.desc.uniform_descriptor).is_empty() {
            uniform_bindings.push(bindings::MATERIAL);
        }
        if self.has_bones {
            uniform_bindings.push(bindings::BONES);
        }
        let mut textures = vec![TextureSlotKind::Color2d; self.texture_names.len()];
        if self.use_lights {
            uniform_bindings.extend(bindings::LIGHTS..bindings::LIGHTS + bindings::MAX_LIGHTS);
            textures.push(TextureSlotKind::DepthArray);
        }

        let handle = backend
            .create_program(&ProgramDescriptor {
                label: Some(self.signature().to_string()),
                vertex_source: self.desc.vertex_source.clone(),
                fragment_source: self.desc.fragment_source.clone(),
                uniform_bindings,
                textures,
                multiview,
            })
            .map_err(|e| {
                log::error!("Shader {}: program creation failed: {}", self.signature(), e);
                RenderError::ShaderCompile {
                    signature: self.signature().to_string(),
                    reason: e.to_string(),
                }
            })?;
        log::debug!("Shader {} ({:?}) initialized", self.signature(), self.id);
        *program = Some(handle);
        Ok(handle)
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        if let Some(handle) = self.program.lock().take() {
            backend.destroy_program(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn unlit() -> ShaderDescriptor {
        ShaderDescriptor {
            signature: "Unlit".into(),
            uniform_descriptor: "float4 u_color".into(),
            texture_descriptor: "sampler2D u_texture".into(),
            vertex_descriptor: "float3 a_position float2 a_texcoord".into(),
            vertex_source: "uniform Transform_ubo { mat4 u_mvp; }; void main() {}".into(),
            fragment_source: "void main() {}".into(),
        }
    }

    #[test]
    fn test_shader_metadata() {
        let shader = Shader::new(ShaderId(1), unlit());
        assert!(shader.uses_matrix_uniforms());
        assert!(!shader.use_lights());
        assert!(!shader.has_bones());
        assert_eq!(shader.texture_names(), &["u_texture".to_string()]);
        assert_eq!(shader.shadow_map_unit(), 1);
    }

    #[test]
    fn test_init_creates_program_once() {
        let mut backend = DummyBackend::new();
        let shader = Shader::new(ShaderId(1), unlit());
        let first = shader.init(&mut backend, false).unwrap();
        let second = shader.init(&mut backend, false).unwrap();
        assert_eq!(first, second);

        let desc = backend.program_descriptor(first).unwrap();
        assert_eq!(desc.uniform_bindings, vec![bindings::TRANSFORM, bindings::MATERIAL]);
        assert_eq!(desc.textures, vec![TextureSlotKind::Color2d]);
    }

    #[test]
    fn test_multiview_requires_keywords() {
        let mut backend = DummyBackend::new();
        let shader = Shader::new(ShaderId(1), unlit());
        assert!(matches!(
            shader.init(&mut backend, true),
            Err(RenderError::MultiviewUnsupported { .. })
        ));
        assert!(shader.program().is_none());
    }

    #[test]
    fn test_compile_failure_propagates() {
        let mut backend = DummyBackend::new();
        backend.set_fail_programs(true);
        let shader = Shader::new(ShaderId(1), unlit());
        assert!(matches!(
            shader.init(&mut backend, false),
            Err(RenderError::ShaderCompile { .. })
        ));
    }
}
