//! Materials: one uniform block plus named texture slots

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use parking_lot::Mutex;

use super::texture::Texture;
use crate::backend::{GraphicsBackend, ProgramHandle};
use crate::layout::{bindings, parse_fields, UniformBlock};
use crate::shader::Shader;

/// Result of [`Material::update_gpu`].
pub const MATERIAL_NOT_READY: i32 = -1;
pub const MATERIAL_UPLOAD_FAILED: i32 = 0;
pub const MATERIAL_READY: i32 = 1;

#[derive(Debug)]
struct TextureSlots {
    names: Vec<String>,
    textures: Vec<Option<Arc<Texture>>>,
}

/// Shader data for one or more render passes.
///
/// Setters may be called from asset threads while the rendering thread
/// uploads; every mutator and the upload path take the same locks. Each
/// successful change bumps [`Material::version`] so render data holding the
/// material can tell that it changed.
#[derive(Debug)]
pub struct Material {
    uniforms: Mutex<UniformBlock>,
    textures: Mutex<TextureSlots>,
    texture_descriptor: String,
    version: AtomicU64,
}

impl Material {
    /// `texture_descriptor` uses the same grammar as uniform descriptors,
    /// e.g. `"sampler2D u_texture sampler2D u_normal_map"`.
    pub fn new(uniform_descriptor: &str, texture_descriptor: &str) -> Self {
        let names: Vec<String> = parse_fields(texture_descriptor)
            .into_iter()
            .map(|f| f.name)
            .collect();
        let textures = vec![None; names.len()];
        Self {
            uniforms: Mutex::new(UniformBlock::new(
                uniform_descriptor,
                bindings::MATERIAL,
                "Material_ubo",
            )),
            textures: Mutex::new(TextureSlots { names, textures }),
            texture_descriptor: texture_descriptor.to_string(),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn changed(&self, ok: bool) -> bool {
        if ok {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        ok
    }

    pub fn uniform_descriptor(&self) -> String {
        self.uniforms.lock().descriptor().to_string()
    }

    pub fn texture_descriptor(&self) -> &str {
        &self.texture_descriptor
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.uniforms.lock().has_field(name)
    }

    pub fn byte_size(&self, name: &str) -> usize {
        self.uniforms.lock().layout().byte_size(name)
    }

    pub fn set_int(&self, name: &str, value: i32) -> bool {
        let ok = self.uniforms.lock().set_int(name, value);
        self.changed(ok)
    }

    pub fn set_float(&self, name: &str, value: f32) -> bool {
        let ok = self.uniforms.lock().set_float(name, value);
        self.changed(ok)
    }

    pub fn set_vec2(&self, name: &str, value: Vec2) -> bool {
        let ok = self.uniforms.lock().set_vec2(name, value);
        self.changed(ok)
    }

    pub fn set_vec3(&self, name: &str, value: Vec3) -> bool {
        let ok = self.uniforms.lock().set_vec3(name, value);
        self.changed(ok)
    }

    pub fn set_vec4(&self, name: &str, value: Vec4) -> bool {
        let ok = self.uniforms.lock().set_vec4(name, value);
        self.changed(ok)
    }

    pub fn set_mat4(&self, name: &str, value: &Mat4) -> bool {
        let ok = self.uniforms.lock().set_mat4(name, value);
        self.changed(ok)
    }

    pub fn set_int_vec(&self, name: &str, values: &[i32]) -> bool {
        let ok = self.uniforms.lock().set_int_vec(name, values);
        self.changed(ok)
    }

    pub fn set_float_vec(&self, name: &str, values: &[f32]) -> bool {
        let ok = self.uniforms.lock().set_float_vec(name, values);
        self.changed(ok)
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        self.uniforms.lock().get_int(name)
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        self.uniforms.lock().get_float(name)
    }

    pub fn get_vec2(&self, name: &str) -> Option<Vec2> {
        self.uniforms.lock().get_vec2(name)
    }

    pub fn get_vec3(&self, name: &str) -> Option<Vec3> {
        self.uniforms.lock().get_vec3(name)
    }

    pub fn get_vec4(&self, name: &str) -> Option<Vec4> {
        self.uniforms.lock().get_vec4(name)
    }

    pub fn get_mat4(&self, name: &str) -> Option<Mat4> {
        self.uniforms.lock().get_mat4(name)
    }

    pub fn get_int_vec(&self, name: &str, count: usize) -> Option<Vec<i32>> {
        self.uniforms.lock().get_int_vec(name, count)
    }

    pub fn get_float_vec(&self, name: &str, count: usize) -> Option<Vec<f32>> {
        self.uniforms.lock().get_float_vec(name, count)
    }

    /// Rasterizer line width for passes using this material.
    pub fn line_width(&self) -> f32 {
        let uniforms = self.uniforms.lock();
        if uniforms.has_field("line_width") {
            uniforms.get_float("line_width").unwrap_or(1.0)
        } else {
            1.0
        }
    }

    /// Assign a texture to a slot. Names missing from the descriptor get a new slot.
    pub fn set_texture(&self, name: &str, texture: Arc<Texture>) {
        {
            let mut slots = self.textures.lock();
            match slots.names.iter().position(|n| n == name) {
                Some(i) => slots.textures[i] = Some(texture),
                None => {
                    slots.names.push(name.to_string());
                    slots.textures.push(Some(texture));
                }
            }
        }
        self.changed(true);
    }

    pub fn get_texture(&self, name: &str) -> Option<Arc<Texture>> {
        let slots = self.textures.lock();
        let i = slots.names.iter().position(|n| n == name)?;
        slots.textures[i].clone()
    }

    pub fn has_texture(&self, name: &str) -> bool {
        self.textures.lock().names.iter().any(|n| n == name)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.lock().names.len()
    }

    /// GLSL declaration of the material block.
    pub fn make_shader_layout(&self) -> String {
        self.uniforms.lock().make_shader_layout()
    }

    /// Prepare the material for drawing with `program`.
    ///
    /// Returns [`MATERIAL_NOT_READY`] (-1) if any texture slot is empty or its
    /// texture is still loading, [`MATERIAL_UPLOAD_FAILED`] (0) if the uniform
    /// upload failed and [`MATERIAL_READY`] (1) on success. Nothing is bound.
    pub fn update_gpu<B: GraphicsBackend>(&self, backend: &mut B, program: ProgramHandle) -> i32 {
        {
            let slots = self.textures.lock();
            for (name, texture) in slots.names.iter().zip(&slots.textures) {
                let Some(texture) = texture else {
                    log::trace!("Material::update_gpu {} is null", name);
                    return MATERIAL_NOT_READY;
                };
                if let Err(e) = texture.check_for_update(backend) {
                    log::error!("Material::update_gpu upload of {} failed: {}", name, e);
                }
                if !texture.is_ready() {
                    log::trace!("Material::update_gpu {} is not ready", name);
                    return MATERIAL_NOT_READY;
                }
            }
        }

        let mut uniforms = self.uniforms.lock();
        if uniforms.total_size() == 0 {
            return MATERIAL_READY;
        }
        match uniforms.update_gpu(backend, program) {
            Ok(()) => MATERIAL_READY,
            Err(e) => {
                log::error!("Material::update_gpu uniform upload failed: {}", e);
                MATERIAL_UPLOAD_FAILED
            }
        }
    }

    /// Bind the uniform block and the textures `shader` samples, in the
    /// shader's unit order. Returns the next free texture unit.
    pub fn bind<B: GraphicsBackend>(&self, backend: &mut B, shader: &Shader) -> u32 {
        {
            let uniforms = self.uniforms.lock();
            if uniforms.total_size() > 0 {
                uniforms.bind_buffer(backend);
            }
        }
        let slots = self.textures.lock();
        for (unit, name) in shader.texture_names().iter().enumerate() {
            let gpu = slots
                .names
                .iter()
                .position(|n| n == name)
                .and_then(|i| slots.textures[i].as_ref())
                .and_then(|t| t.gpu());
            match gpu {
                Some(gpu) => backend.bind_texture(unit as u32, gpu.view, gpu.sampler),
                None => log::error!(
                    "Material: shader {} samples {} which the material does not provide",
                    shader.signature(),
                    name
                ),
            }
        }
        shader.texture_names().len() as u32
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        self.uniforms.lock().destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::resources::TextureData;

    #[test]
    fn test_setters_bump_version() {
        let material = Material::new("float4 u_color float line_width", "");
        let v0 = material.version();
        assert!(material.set_vec4("u_color", Vec4::ONE));
        assert!(material.version() > v0);
        let v1 = material.version();
        assert!(!material.set_float("u_color", 1.0));
        assert_eq!(material.version(), v1);
    }

    #[test]
    fn test_line_width_default() {
        let material = Material::new("float4 u_color", "");
        assert_eq!(material.line_width(), 1.0);
        let lines = Material::new("float line_width", "");
        lines.set_float("line_width", 3.0);
        assert_eq!(lines.line_width(), 3.0);
    }

    #[test]
    fn test_update_gpu_not_ready_until_textures_load() {
        let mut backend = DummyBackend::new();
        let material = Material::new("float4 u_color", "sampler2D u_a sampler2D u_b");
        let program = ProgramHandle(1);

        // empty slot
        assert_eq!(material.update_gpu(&mut backend, program), MATERIAL_NOT_READY);

        let a = Arc::new(Texture::from_data(TextureData::white()));
        let b = Arc::new(Texture::new("loading"));
        material.set_texture("u_a", a);
        material.set_texture("u_b", b.clone());
        assert_eq!(material.update_gpu(&mut backend, program), MATERIAL_NOT_READY);

        b.update(TextureData::white());
        assert_eq!(material.update_gpu(&mut backend, program), MATERIAL_READY);
    }

    #[test]
    fn test_set_texture_adds_new_slot() {
        let material = Material::new("", "sampler2D u_texture");
        material.set_texture("u_extra", Arc::new(Texture::new("x")));
        assert_eq!(material.texture_count(), 2);
        assert!(material.has_texture("u_extra"));
        assert!(material.get_texture("u_texture").is_none());
    }
}
