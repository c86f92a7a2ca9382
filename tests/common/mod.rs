//! Common utilities for renderer integration tests.
//!
//! Every test drives a [`Renderer`] over the recording [`DummyBackend`] and
//! inspects the command stream it produced.

#![allow(dead_code)]

use std::sync::Arc;

use glam::{Mat4, Vec3};
use vr_render_core::backend::{BackendCapabilities, DummyBackend, RecordedCommand};
use vr_render_core::layout::bindings;
use vr_render_core::scene::{ObjectId, Projection};
use vr_render_core::shader::ShaderDescriptor;
use vr_render_core::{
    Camera, Material, Mesh, RenderData, Renderer, RendererConfig, Scene, SceneObject, ShaderId,
};

/// Byte offset of `u_model` in the single-view transform block.
const MODEL_OFFSET: usize = 4 * 64;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Renderer Setup
// ============================================================================

pub fn renderer() -> Renderer<DummyBackend> {
    renderer_with(RendererConfig::default())
}

pub fn renderer_with(config: RendererConfig) -> Renderer<DummyBackend> {
    init_logger();
    Renderer::new(DummyBackend::new(), config)
}

/// Renderer whose backend reports no occlusion query support.
pub fn renderer_without_queries() -> Renderer<DummyBackend> {
    init_logger();
    let backend = DummyBackend::with_capabilities(BackendCapabilities {
        occlusion_queries: false,
        ..Default::default()
    });
    Renderer::new(backend, RendererConfig::default())
}

/// Perspective camera at +5 on Z looking at the origin.
pub fn camera() -> Camera {
    Camera::new(Projection::perspective(90.0, 1.0, 0.1, 100.0)).look_at(
        Vec3::new(0.0, 0.0, 5.0),
        Vec3::ZERO,
        Vec3::Y,
    )
}

// ============================================================================
// Shaders and Scene Builders
// ============================================================================

const COLOR_VERTEX: &str = r#"#version 450
layout(std140, set = 0, binding = 0) uniform Transform_ubo {
    mat4 u_view;
    mat4 u_mvp;
    mat4 u_mv;
    mat4 u_mv_it;
    mat4 u_model;
    mat4 u_view_i;
    float u_right;
};
layout(location = 0) in vec3 a_position;
layout(location = 0) out vec2 v_uv;
void main() {
    v_uv = a_position.xy * 0.5 + 0.5;
    gl_Position = u_mvp * vec4(a_position, 1.0);
}
"#;

const COLOR_FRAGMENT: &str = r#"#version 450
layout(std140, set = 0, binding = 1) uniform Material_ubo {
    vec4 u_color;
};
layout(location = 0) out vec4 frag_color;
void main() {
    frag_color = u_color;
}
"#;

const TEXTURED_FRAGMENT: &str = r#"#version 450
layout(set = 1, binding = 0) uniform texture2D u_texture;
layout(set = 1, binding = 1) uniform sampler u_texture_sampler;
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 frag_color;
void main() {
    frag_color = texture(sampler2D(u_texture, u_texture_sampler), v_uv);
}
"#;

const LIT_FRAGMENT: &str = r#"#version 450
struct Light {
    vec4 world_position;
    vec4 world_direction;
    vec4 diffuse;
    int shadow_map_index;
};
layout(std140, set = 0, binding = 4) uniform Lights_ubo {
    Light u_light;
};
layout(set = 1, binding = 0) uniform texture2D u_texture;
layout(set = 1, binding = 1) uniform sampler u_texture_sampler;
layout(set = 1, binding = 2) uniform texture2DArray u_shadow_maps;
layout(set = 1, binding = 3) uniform samplerShadow u_shadow_maps_sampler;
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 frag_color;
void main() {
    frag_color = texture(sampler2D(u_texture, u_texture_sampler), v_uv) * u_light.diffuse;
}
"#;

/// Register a flat color shader under `signature`.
pub fn add_color_shader(renderer: &Renderer<DummyBackend>, signature: &str) -> ShaderId {
    renderer.shader_manager().add_shader(ShaderDescriptor {
        signature: signature.to_string(),
        uniform_descriptor: "float4 u_color".to_string(),
        vertex_descriptor: "float3 a_position".to_string(),
        vertex_source: COLOR_VERTEX.to_string(),
        fragment_source: COLOR_FRAGMENT.to_string(),
        ..Default::default()
    })
}

/// Register a shader sampling one `u_texture` slot.
pub fn add_textured_shader(renderer: &Renderer<DummyBackend>, signature: &str) -> ShaderId {
    renderer.shader_manager().add_shader(ShaderDescriptor {
        signature: signature.to_string(),
        texture_descriptor: "sampler2D u_texture".to_string(),
        vertex_descriptor: "float3 a_position".to_string(),
        vertex_source: COLOR_VERTEX.to_string(),
        fragment_source: TEXTURED_FRAGMENT.to_string(),
        ..Default::default()
    })
}

/// Register a lit shader with one `u_texture` slot that samples the shadow maps.
pub fn add_lit_shader(renderer: &Renderer<DummyBackend>, signature: &str) -> ShaderId {
    renderer.shader_manager().add_shader(ShaderDescriptor {
        signature: signature.to_string(),
        texture_descriptor: "sampler2D u_texture".to_string(),
        vertex_descriptor: "float3 a_position".to_string(),
        vertex_source: COLOR_VERTEX.to_string(),
        fragment_source: LIT_FRAGMENT.to_string(),
        ..Default::default()
    })
}

pub fn color_material() -> Arc<Material> {
    Arc::new(Material::new("float4 u_color", ""))
}

/// A unit cube drawn with one pass of `material` and `shader`.
pub fn cube(material: Arc<Material>, shader: ShaderId) -> RenderData {
    let mut render_data = RenderData::new(Arc::new(Mesh::cube()));
    render_data.add_pass(material, Some(shader));
    render_data
}

/// Add a cube at `position` as a root object.
pub fn add_cube(scene: &mut Scene, name: &str, position: Vec3, render_data: RenderData) -> ObjectId {
    scene.add_object(
        SceneObject::new(name)
            .with_render_data(render_data)
            .with_transform(Mat4::from_translation(position)),
        None,
    )
}

// ============================================================================
// Command Stream Inspection
// ============================================================================

/// Translation of the model matrix of every transform block pushed, in order.
pub fn drawn_positions(commands: &[RecordedCommand]) -> Vec<Vec3> {
    commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::PushUniforms { binding, data } if *binding == bindings::TRANSFORM => {
                let float = |i: usize| {
                    let start = MODEL_OFFSET + 48 + i * 4;
                    f32::from_le_bytes([data[start], data[start + 1], data[start + 2], data[start + 3]])
                };
                Some(Vec3::new(float(0), float(1), float(2)))
            }
            _ => None,
        })
        .collect()
}

pub fn count_draws(commands: &[RecordedCommand]) -> usize {
    commands
        .iter()
        .filter(|c| {
            matches!(
                c,
                RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }
            )
        })
        .count()
}

pub fn assert_close(a: Vec3, b: Vec3) {
    assert!((a - b).length() < 1e-4, "expected {:?}, got {:?}", b, a);
}
