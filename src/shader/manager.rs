//! Shader registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Shader, ShaderDescriptor, ShaderId};
use crate::backend::GraphicsBackend;

#[derive(Debug, Default)]
struct ShaderTables {
    latest_id: u32,
    by_signature: HashMap<String, Arc<Shader>>,
    by_id: HashMap<ShaderId, Arc<Shader>>,
}

/// Owns every shader, keyed both by signature and by id.
///
/// Registration is idempotent: adding a signature that already exists
/// returns the existing id and leaves the stored shader untouched.
#[derive(Debug, Default)]
pub struct ShaderManager {
    tables: Mutex<ShaderTables>,
}

impl ShaderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_shader(&self, desc: ShaderDescriptor) -> ShaderId {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.by_signature.get(&desc.signature) {
            return existing.id();
        }
        tables.latest_id += 1;
        let id = ShaderId(tables.latest_id);
        let signature = desc.signature.clone();
        let shader = Arc::new(Shader::new(id, desc));
        tables.by_signature.insert(signature.clone(), shader.clone());
        tables.by_id.insert(id, shader);
        log::debug!("SHADER: added shader {:?} {}", id, signature);
        id
    }

    pub fn find_shader(&self, signature: &str) -> Option<Arc<Shader>> {
        self.tables.lock().by_signature.get(signature).cloned()
    }

    pub fn get_shader(&self, id: ShaderId) -> Option<Arc<Shader>> {
        let shader = self.tables.lock().by_id.get(&id).cloned();
        if shader.is_none() {
            log::debug!("SHADER: getShader {:?} NOT FOUND", id);
        }
        shader
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every backend program.
    pub fn destroy_programs<B: GraphicsBackend>(&self, backend: &mut B) {
        for shader in self.tables.lock().by_id.values() {
            shader.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(signature: &str) -> ShaderDescriptor {
        ShaderDescriptor {
            signature: signature.to_string(),
            vertex_descriptor: "float3 a_position".to_string(),
            vertex_source: "void main() {}".to_string(),
            fragment_source: "void main() {}".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_shader_is_idempotent() {
        let manager = ShaderManager::new();
        let a = manager.add_shader(desc("A"));
        let b = manager.add_shader(desc("B"));
        let a2 = manager.add_shader(desc("A"));
        assert_eq!(a, a2);
        assert!(b > a);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_lookup_both_ways() {
        let manager = ShaderManager::new();
        let id = manager.add_shader(desc("Unlit"));
        assert_eq!(manager.find_shader("Unlit").unwrap().id(), id);
        assert_eq!(manager.get_shader(id).unwrap().signature(), "Unlit");
        assert!(manager.find_shader("Missing").is_none());
        assert!(manager.get_shader(ShaderId(99)).is_none());
    }
}
