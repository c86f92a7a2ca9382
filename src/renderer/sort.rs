//! State sort of the visible list

use std::cmp::Ordering;

use crate::backend::CullFace;
use crate::render_data::{rendering_order, RenderData};
use crate::scene::ObjectId;

/// Everything the comparator looks at, captured once per object.
#[derive(Debug, Clone, Copy)]
pub struct SortKey {
    pub id: ObjectId,
    pub rendering_order: i32,
    /// Shader of the first pass; unresolved shaders sort first
    pub shader: Option<u32>,
    pub pass_count: usize,
    /// Identity of the first pass material
    pub material: usize,
    pub cull_face: CullFace,
    pub hash: u64,
    pub distance: f32,
}

impl SortKey {
    pub fn new(id: ObjectId, render_data: &RenderData) -> Self {
        Self {
            id,
            rendering_order: render_data.rendering_order,
            shader: render_data.shader(0).map(|s| s.0),
            pass_count: render_data.pass_count(),
            material: render_data
                .material(0)
                .map_or(0, |m| std::sync::Arc::as_ptr(m) as usize),
            cull_face: render_data.cull_face(0),
            hash: render_data.hash_code(),
            distance: render_data.camera_distance(),
        }
    }
}

/// Rendering order, then shader, then pass count. Transparent objects go back
/// to front; everything else groups by material, cull face and state hash and
/// finally goes front to back.
pub fn compare(a: &SortKey, b: &SortKey) -> Ordering {
    a.rendering_order
        .cmp(&b.rendering_order)
        .then_with(|| a.shader.cmp(&b.shader))
        .then_with(|| a.pass_count.cmp(&b.pass_count))
        .then_with(|| {
            if rendering_order::is_transparent(a.rendering_order) {
                b.distance.total_cmp(&a.distance)
            } else {
                a.material
                    .cmp(&b.material)
                    .then_with(|| a.cull_face.cmp(&b.cull_face))
                    .then_with(|| a.hash.cmp(&b.hash))
                    .then_with(|| a.distance.total_cmp(&b.distance))
            }
        })
}

pub fn sort_keys(keys: &mut [SortKey]) {
    keys.sort_by(compare);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Material, Mesh};
    use crate::shader::ShaderId;
    use std::sync::Arc;

    fn key(id: usize, order: i32, distance: f32) -> SortKey {
        SortKey {
            id: ObjectId(id),
            rendering_order: order,
            shader: Some(1),
            pass_count: 1,
            material: 0x1000,
            cull_face: CullFace::Back,
            hash: 7,
            distance,
        }
    }

    #[test]
    fn test_transparent_back_to_front_after_opaque() {
        let mut keys = vec![
            key(0, rendering_order::TRANSPARENT, 5.0),
            key(1, rendering_order::TRANSPARENT, 2.0),
            key(2, rendering_order::GEOMETRY, 10.0),
        ];
        sort_keys(&mut keys);
        let ids: Vec<usize> = keys.iter().map(|k| k.id.0).collect();
        assert_eq!(ids, vec![2, 0, 1]);
    }

    #[test]
    fn test_opaque_front_to_back() {
        let mut keys = vec![
            key(0, rendering_order::GEOMETRY, 9.0),
            key(1, rendering_order::GEOMETRY, 1.0),
            key(2, rendering_order::GEOMETRY, 4.0),
        ];
        sort_keys(&mut keys);
        let ids: Vec<usize> = keys.iter().map(|k| k.id.0).collect();
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn test_shader_and_pass_count_precede_distance() {
        let mut near = key(0, rendering_order::GEOMETRY, 1.0);
        near.shader = Some(5);
        let mut multi = key(1, rendering_order::GEOMETRY, 0.5);
        multi.pass_count = 2;
        let far = key(2, rendering_order::GEOMETRY, 50.0);
        let mut keys = vec![near, multi, far];
        sort_keys(&mut keys);
        let ids: Vec<usize> = keys.iter().map(|k| k.id.0).collect();
        assert_eq!(ids, vec![2, 1, 0]);
    }

    #[test]
    fn test_key_from_render_data() {
        let material = Arc::new(Material::new("", ""));
        let mut rd = RenderData::new(Arc::new(Mesh::cube()));
        rd.add_pass(material.clone(), Some(ShaderId(3))).state.cull_face = CullFace::None;
        let k = SortKey::new(ObjectId(4), &rd);
        assert_eq!(k.shader, Some(3));
        assert_eq!(k.material, Arc::as_ptr(&material) as usize);
        assert_eq!(k.cull_face, CullFace::None);
    }
}
