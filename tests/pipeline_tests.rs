//! Integration tests for the camera render pipeline.
//!
//! The renderer runs against the recording dummy backend; assertions are made
//! on the command stream and on the renderer's statistics.
//!
//! # Test Categories
//!
//! - **Sort Tests**: rendering order bands, opaque front to back, transparent back to front
//! - **Readiness Tests**: objects wait for their textures before drawing
//! - **Occlusion Tests**: one outstanding query per object, visibility from the last result
//! - **Post Effect Tests**: A/B ping-pong and the final write to the destination
//! - **State Tests**: per-pass toggles are undone and every camera ends with the restore set
//! - **Fallback Tests**: missing or broken shaders draw with the error shader
//! - **Shadow Tests**: depth passes per shadow-casting light, skinned depth shader, shadow map binding
//! - **Target Tests**: render masks, render textures and multisample resolve
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test pipeline_tests
//! ```

mod common;

use std::sync::Arc;

use glam::Vec3;
use rstest::rstest;

use common::{
    add_color_shader, add_cube, add_lit_shader, add_textured_shader, assert_close, camera, color_material,
    count_draws, cube, drawn_positions, renderer, renderer_with, renderer_without_queries,
};
use vr_render_core::backend::{CullFace, RecordedCommand, StateChange};
use vr_render_core::render_data::{render_mask, rendering_order};
use vr_render_core::renderer::state;
use vr_render_core::shader::{ShaderDescriptor, DEPTH_SHADER, DEPTH_SHADER_SKINNED, ERROR_SHADER};
use vr_render_core::{
    Light, Material, Mesh, RenderData, RenderTarget, RenderTexture, RenderTextureDescriptor,
    RendererConfig, Scene, ShaderId, Texture, TextureData, VertexBuffer,
};

// ============================================================================
// Sort Tests
// ============================================================================

/// Objects sharing a material are drawn by camera distance.
///
/// This test verifies that:
/// 1. Opaque objects are drawn nearest first
/// 2. Transparent objects are drawn farthest first
#[rstest]
#[case::opaque(rendering_order::GEOMETRY, [2.0, 0.0, -2.0])]
#[case::transparent(rendering_order::TRANSPARENT, [-2.0, 0.0, 2.0])]
fn test_distance_order(#[case] order: i32, #[case] expected_z: [f32; 3]) {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let material = color_material();

    let mut scene = Scene::new();
    for (name, z) in [("middle", 0.0), ("far", -2.0), ("near", 2.0)] {
        let render_data = cube(material.clone(), shader).with_rendering_order(order);
        add_cube(&mut scene, name, Vec3::new(0.0, 0.0, z), render_data);
    }

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    let positions = drawn_positions(renderer.backend().commands());
    assert_eq!(positions.len(), 3);
    for (position, z) in positions.into_iter().zip(expected_z) {
        assert_close(position, Vec3::new(0.0, 0.0, z));
    }
}

/// Rendering order bands take precedence over distance.
#[test]
fn test_rendering_order_bands() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let material = color_material();

    let mut scene = Scene::new();
    let bands = [
        (rendering_order::OVERLAY, Vec3::new(-1.0, 0.0, 0.0)),
        (rendering_order::BACKGROUND, Vec3::new(1.0, 0.0, 0.0)),
        (rendering_order::TRANSPARENT, Vec3::new(0.0, 1.0, 0.0)),
        (rendering_order::GEOMETRY, Vec3::new(0.0, -1.0, 0.0)),
    ];
    for (order, position) in bands {
        let render_data = cube(material.clone(), shader).with_rendering_order(order);
        add_cube(&mut scene, "banded", position, render_data);
    }

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    let positions = drawn_positions(renderer.backend().commands());
    let expected = [
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(-1.0, 0.0, 0.0),
    ];
    assert_eq!(positions.len(), expected.len());
    for (position, expected) in positions.into_iter().zip(expected) {
        assert_close(position, expected);
    }
}

// ============================================================================
// Readiness Tests
// ============================================================================

/// An object whose texture is still loading is skipped until the data arrives.
///
/// This test verifies that:
/// 1. A material with a pending texture produces no draw
/// 2. The next frame after `Texture::update` uploads the texture and draws
#[test]
fn test_object_waits_for_texture() {
    let mut renderer = renderer_without_queries();
    let shader = add_textured_shader(&renderer, "test.textured");
    let material = Arc::new(Material::new("", "sampler2D u_texture"));
    let texture = Arc::new(Texture::new("loading"));
    material.set_texture("u_texture", texture.clone());

    let mut scene = Scene::new();
    add_cube(&mut scene, "textured", Vec3::ZERO, cube(material, shader));

    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    assert_eq!(renderer.stats().draw_calls, 0);
    assert!(!texture.is_ready());

    texture.update(TextureData::white());
    renderer.backend_mut().take_commands();
    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert!(texture.is_ready());
    assert_eq!(renderer.stats().draw_calls, 1);
    let gpu = texture.gpu().unwrap();
    assert!(renderer.backend().commands().contains(&RecordedCommand::BindTexture {
        unit: 0,
        view: gpu.view,
        sampler: gpu.sampler,
    }));
}

/// A material texture slot that was never assigned keeps the object hidden.
#[test]
fn test_empty_texture_slot_is_not_drawn() {
    let mut renderer = renderer_without_queries();
    let shader = add_textured_shader(&renderer, "test.textured");
    let material = Arc::new(Material::new("", "sampler2D u_texture"));

    let mut scene = Scene::new();
    add_cube(&mut scene, "untextured", Vec3::ZERO, cube(material, shader));
    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert_eq!(renderer.stats().draw_calls, 0);
}

// ============================================================================
// Occlusion Tests
// ============================================================================

fn occlusion_queries(commands: &[RecordedCommand]) -> Vec<vr_render_core::backend::QueryHandle> {
    commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::BeginOcclusionQuery(q) => Some(*q),
            _ => None,
        })
        .collect()
}

/// Occlusion candidates draw only after a query reported samples.
///
/// This test verifies that:
/// 1. The first frame issues a bounding box query and draws nothing
/// 2. No second query is issued while the first is outstanding
/// 3. Once the query completes with samples the object draws
/// 4. A new query is issued after the previous one resolved
#[test]
fn test_occlusion_query_lifecycle() {
    let mut renderer = renderer();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    let id = add_cube(&mut scene, "hidden", Vec3::ZERO, cube(color_material(), shader));
    scene.object_mut(id).unwrap().occlusion_candidate = true;

    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    let commands = renderer.backend_mut().take_commands();
    let queries = occlusion_queries(&commands);
    assert_eq!(queries.len(), 1);
    assert!(commands.contains(&RecordedCommand::EndOcclusionQuery));
    assert!(commands.contains(&RecordedCommand::State(StateChange::ColorMask(false))));
    assert_eq!(renderer.stats().draw_calls, 0);
    assert!(scene.object(id).unwrap().occlusion().is_query_issued());

    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    let commands = renderer.backend_mut().take_commands();
    assert!(occlusion_queries(&commands).is_empty());
    assert_eq!(renderer.stats().draw_calls, 0);

    renderer.backend_mut().complete_query(queries[0], 42);
    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    renderer.backend_mut().take_commands();
    assert_eq!(renderer.stats().draw_calls, 1);
    assert!(scene.object(id).unwrap().occlusion().is_visible());

    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    let commands = renderer.backend_mut().take_commands();
    assert_eq!(occlusion_queries(&commands), queries);
    assert_eq!(renderer.stats().draw_calls, 1);
}

/// A query that completes with zero samples hides the object again.
#[test]
fn test_occlusion_zero_samples_hides() {
    let mut renderer = renderer();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    let id = add_cube(&mut scene, "occluded", Vec3::ZERO, cube(color_material(), shader));
    scene.object_mut(id).unwrap().occlusion_candidate = true;

    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    let query = occlusion_queries(renderer.backend().commands())[0];
    renderer.backend_mut().complete_query(query, 0);
    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert_eq!(renderer.stats().draw_calls, 0);
    assert!(!scene.object(id).unwrap().occlusion().is_visible());
}

/// A bounding box query that could not be issued is retried on the next frame.
///
/// This test verifies that:
/// 1. A frame where the bounding box shader fails leaves no query outstanding
/// 2. The following frame issues the query once the shader builds
/// 3. The object draws after that query reports samples
#[test]
fn test_occlusion_query_retried_after_failed_issue() {
    let mut renderer = renderer();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    let id = add_cube(&mut scene, "retried", Vec3::ZERO, cube(color_material(), shader));
    scene.object_mut(id).unwrap().occlusion_candidate = true;

    renderer.backend_mut().set_fail_programs(true);
    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    let commands = renderer.backend_mut().take_commands();
    assert!(occlusion_queries(&commands).is_empty());
    assert!(!scene.object(id).unwrap().occlusion().is_query_issued());

    renderer.backend_mut().set_fail_programs(false);
    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    let commands = renderer.backend_mut().take_commands();
    let queries = occlusion_queries(&commands);
    assert_eq!(queries.len(), 1);
    assert!(scene.object(id).unwrap().occlusion().is_query_issued());

    renderer.backend_mut().complete_query(queries[0], 5);
    renderer.render_camera(&mut scene, &camera(), None).unwrap();
    assert_eq!(renderer.stats().draw_calls, 1);
}

/// Non-candidates and backends without queries are never occlusion tested.
#[rstest]
#[case::queries_supported(true)]
#[case::queries_unsupported(false)]
fn test_occlusion_skipped(#[case] supported: bool) {
    let mut renderer = if supported {
        renderer()
    } else {
        renderer_without_queries()
    };
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    let id = add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));
    // only a candidate on the backend that cannot run the query
    scene.object_mut(id).unwrap().occlusion_candidate = !supported;

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert!(occlusion_queries(renderer.backend().commands()).is_empty());
    assert_eq!(renderer.stats().draw_calls, 1);
}

// ============================================================================
// Post Effect Tests
// ============================================================================

/// Three post effects alternate between the A/B textures and the last one
/// writes the default framebuffer.
///
/// This test verifies that:
/// 1. The scene renders into texture A
/// 2. Each effect samples the texture the previous step wrote
/// 3. No effect samples the texture it renders into
/// 4. The final effect renders into the default framebuffer
#[test]
fn test_post_effect_ping_pong() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let effect_shader = add_textured_shader(&renderer, "test.post");
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));

    let mut camera = camera();
    for _ in 0..3 {
        camera.add_post_effect(Arc::new(Material::new("", "sampler2D u_texture")), effect_shader);
    }
    renderer.render_camera(&mut scene, &camera, None).unwrap();

    let textures = renderer.post_effect_textures().unwrap();
    let framebuffers = [textures[0].framebuffer(), textures[1].framebuffer()];
    let views = [
        textures[0].texture().gpu().unwrap().view,
        textures[1].texture().gpu().unwrap().view,
    ];

    let commands = renderer.backend().commands();
    let passes: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::BeginRenderPass { framebuffer, .. } => Some(*framebuffer),
            _ => None,
        })
        .collect();
    assert_eq!(
        passes,
        vec![Some(framebuffers[0]), Some(framebuffers[1]), Some(framebuffers[0]), None]
    );

    let sampled: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::BindTexture { view, .. } => Some(*view),
            _ => None,
        })
        .collect();
    assert_eq!(sampled, vec![views[0], views[1], views[0]]);

    // scene cube plus one quad per effect
    assert_eq!(renderer.stats().draw_calls, 4);
    assert_eq!(renderer.stats().triangles, 12 + 3 * 2);
}

/// A single post effect goes straight from A to the destination texture.
#[test]
fn test_single_post_effect_into_render_texture() {
    let mut renderer = renderer_without_queries();
    let effect_shader = add_textured_shader(&renderer, "test.post");
    let mut destination = RenderTexture::new(
        renderer.backend_mut(),
        RenderTextureDescriptor::color("destination", 128, 64),
    )
    .unwrap();

    let mut camera = camera();
    camera.add_post_effect(Arc::new(Material::new("", "sampler2D u_texture")), effect_shader);
    renderer
        .render_camera(&mut Scene::new(), &camera, Some(&mut destination))
        .unwrap();

    let textures = renderer.post_effect_textures().unwrap();
    assert_eq!((textures[0].width(), textures[0].height()), (128, 64));
    let passes: Vec<_> = renderer
        .backend()
        .commands()
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::BeginRenderPass { framebuffer, .. } => *framebuffer,
            _ => None,
        })
        .collect();
    assert_eq!(passes, vec![textures[0].framebuffer(), destination.framebuffer()]);
}

/// Post effect quads overwrite their target: the blending enabled by the
/// baseline state is switched off before the quad draws.
#[test]
fn test_post_effect_disables_blending() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let effect_shader = add_textured_shader(&renderer, "test.post");
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));

    let mut camera = camera();
    camera.add_post_effect(Arc::new(Material::new("", "sampler2D u_texture")), effect_shader);
    renderer.render_camera(&mut scene, &camera, None).unwrap();

    let commands = renderer.backend().commands();
    let effect_pass = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, RecordedCommand::BeginRenderPass { .. }))
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    let quad_draw = effect_pass
        + commands[effect_pass..]
            .iter()
            .position(|c| matches!(c, RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }))
            .unwrap();
    assert!(commands[effect_pass..quad_draw].contains(&RecordedCommand::State(StateChange::Blend(false))));
    assert_eq!(renderer.stats().draw_calls, 2);
}

// ============================================================================
// State Tests
// ============================================================================

/// Per-pass toggles are applied before the draw and undone after it.
#[test]
fn test_pass_state_is_restored() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut render_data = cube(color_material(), shader);
    {
        let pass = render_data.pass_mut(0).unwrap();
        pass.state.depth_mask = false;
        pass.state.alpha_blend = false;
        pass.state.cull_face = CullFace::Front;
    }
    let mut scene = Scene::new();
    add_cube(&mut scene, "stateful", Vec3::ZERO, render_data);

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    let commands = renderer.backend().commands();
    let draw = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
        .unwrap();
    let before = &commands[..draw];
    let after = &commands[draw..];
    assert!(before.contains(&RecordedCommand::State(StateChange::CullFace(CullFace::Front))));
    assert!(before.contains(&RecordedCommand::State(StateChange::DepthMask(false))));
    assert!(after.contains(&RecordedCommand::State(StateChange::DepthMask(true))));
    assert!(after.contains(&RecordedCommand::State(StateChange::Blend(true))));
    assert!(renderer.backend().state().depth_write);
}

/// Every camera render ends with the unconditional restore set.
#[rstest]
#[case::default_framebuffer(false)]
#[case::render_texture(true)]
fn test_camera_ends_with_restore(#[case] offscreen: bool) {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));

    let mut texture = offscreen.then(|| {
        RenderTexture::new(
            renderer.backend_mut(),
            RenderTextureDescriptor::color("offscreen", 32, 32),
        )
        .unwrap()
    });
    renderer
        .render_camera(&mut scene, &camera(), texture.as_mut())
        .unwrap();

    let commands = renderer.backend().commands();
    let tail = &commands[commands.len() - 3..];
    let expected: Vec<_> = state::restore()
        .into_iter()
        .map(RecordedCommand::State)
        .collect();
    assert_eq!(tail, expected.as_slice());
}

// ============================================================================
// Fallback Tests
// ============================================================================

/// Objects whose shader cannot be used draw with the error shader.
#[rstest]
#[case::unknown_shader(false)]
#[case::broken_shader(true)]
fn test_error_shader_fallback(#[case] register_broken: bool) {
    let mut renderer = renderer_without_queries();
    let shader = if register_broken {
        renderer.shader_manager().add_shader(ShaderDescriptor {
            signature: "test.broken".to_string(),
            vertex_descriptor: "float3 a_position".to_string(),
            vertex_source: "#version 450\nvoid main() {}\n".to_string(),
            fragment_source: String::new(),
            ..Default::default()
        })
    } else {
        ShaderId(4242)
    };
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    let error = renderer.shader_manager().find_shader(ERROR_SHADER).unwrap();
    let program = error.program().unwrap();
    assert!(renderer
        .backend()
        .commands()
        .contains(&RecordedCommand::UseProgram(program)));
    assert_eq!(renderer.stats().draw_calls, 1);
}

/// When no program can be created at all nothing draws and nothing panics.
#[test]
fn test_all_programs_failing_draws_nothing() {
    let mut renderer = renderer_without_queries();
    renderer.backend_mut().set_fail_programs(true);
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert_eq!(renderer.stats().draw_calls, 0);
    assert_eq!(count_draws(renderer.backend().commands()), 0);
}

// ============================================================================
// Shadow Tests
// ============================================================================

/// A shadow-casting directional light renders the scene with the depth shader
/// into its layer before the camera pass.
#[test]
fn test_shadow_pass_precedes_camera_pass() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    add_cube(&mut scene, "caster", Vec3::ZERO, cube(color_material(), shader));
    scene.add_light(Light::directional(Vec3::new(0.0, -1.0, -0.3)).with_shadows());

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert_eq!(scene.lights[0].shadow_layer(), Some(0));
    let shadow = renderer.shadow_texture().unwrap();
    let depth = renderer.shader_manager().find_shader(DEPTH_SHADER).unwrap();
    let depth_program = depth.program().unwrap();

    let commands = renderer.backend().commands();
    let shadow_pass = commands
        .iter()
        .position(|c| {
            matches!(c, RecordedCommand::BeginRenderPass { framebuffer: Some(fb), .. } if *fb == shadow.framebuffer())
        })
        .unwrap();
    let camera_pass = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::BeginRenderPass { framebuffer: None, .. }))
        .unwrap();
    let depth_use = commands
        .iter()
        .position(|c| *c == RecordedCommand::UseProgram(depth_program))
        .unwrap();
    assert!(shadow_pass < depth_use && depth_use < camera_pass);
    // depth pass plus the camera pass
    assert_eq!(renderer.stats().draw_calls, 2);
}

/// Objects that do not cast shadows are left out of the depth pass.
#[test]
fn test_non_casters_skip_shadow_pass() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut render_data = cube(color_material(), shader);
    render_data.cast_shadows = false;
    let mut scene = Scene::new();
    add_cube(&mut scene, "receiver", Vec3::ZERO, render_data);
    scene.add_light(Light::directional(Vec3::NEG_Y).with_shadows());

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert_eq!(renderer.stats().draw_calls, 1);
}

/// Lit shaders sample the shadow maps on the unit after their own textures.
#[test]
fn test_lit_shader_binds_shadow_maps() {
    let mut renderer = renderer_without_queries();
    let shader = add_lit_shader(&renderer, "test.lit");
    let material = Arc::new(Material::new("", "sampler2D u_texture"));
    material.set_texture("u_texture", Arc::new(Texture::from_data(TextureData::white())));
    let mut scene = Scene::new();
    add_cube(&mut scene, "lit", Vec3::ZERO, cube(material, shader));
    scene.add_light(Light::directional(Vec3::new(0.0, -1.0, -0.3)).with_shadows());

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    let lit = renderer.shader_manager().get_shader(shader).unwrap();
    assert!(lit.use_lights());
    let unit = lit.texture_names().len() as u32;
    assert_eq!(unit, lit.shadow_map_unit());
    let shadow = renderer.shadow_texture().unwrap().texture().gpu().unwrap();
    assert!(renderer.backend().commands().contains(&RecordedCommand::BindTexture {
        unit,
        view: shadow.view,
        sampler: shadow.sampler,
    }));
    assert_eq!(renderer.stats().draw_calls, 2);
}

/// Meshes with bone weights render their depth pass with the skinned depth shader.
#[test]
fn test_skinned_mesh_uses_skinned_depth_shader() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");

    let mut vertices = VertexBuffer::new(
        "float3 a_position float4 a_bone_weights int4 a_bone_indices",
        3,
    );
    assert!(vertices.set_float_vec(
        "a_position",
        &[-0.5, -0.5, 0.0, 0.5, -0.5, 0.0, 0.0, 0.5, 0.0],
        3
    ));
    assert!(vertices.set_bone_data(&[0i32; 12], &[1.0f32, 0.0, 0.0, 0.0].repeat(3)));
    let mesh = Arc::new(Mesh::from_buffers("skinned", vertices, None));
    assert!(mesh.has_bones());

    let mut render_data = RenderData::new(mesh);
    render_data.add_pass(color_material(), Some(shader));
    let mut scene = Scene::new();
    add_cube(&mut scene, "skinned", Vec3::ZERO, render_data);
    scene.add_light(Light::directional(Vec3::new(0.0, -1.0, -0.3)).with_shadows());

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    let skinned = renderer.shader_manager().find_shader(DEPTH_SHADER_SKINNED).unwrap();
    let rigid = renderer.shader_manager().find_shader(DEPTH_SHADER).unwrap();
    let commands = renderer.backend().commands();
    assert!(commands.contains(&RecordedCommand::UseProgram(skinned.program().unwrap())));
    // the rigid depth shader is never built
    assert!(rigid.program().is_none());
    assert_eq!(renderer.stats().draw_calls, 2);
}

// ============================================================================
// Target Tests
// ============================================================================

/// Objects outside the camera's eye mask are not drawn.
#[rstest]
#[case::left_only(render_mask::LEFT, 1)]
#[case::right_only(render_mask::RIGHT, 0)]
#[case::both(render_mask::BOTH, 1)]
fn test_render_mask_filtering(#[case] mask: u32, #[case] draws: u32) {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut render_data = cube(color_material(), shader);
    render_data.render_mask = mask;
    let mut scene = Scene::new();
    add_cube(&mut scene, "masked", Vec3::ZERO, render_data);

    let camera = camera().with_render_mask(render_mask::LEFT);
    renderer.render_camera(&mut scene, &camera, None).unwrap();

    assert_eq!(renderer.stats().draw_calls, draws);
}

/// Objects behind the camera are culled.
#[test]
fn test_frustum_culling() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    add_cube(&mut scene, "visible", Vec3::ZERO, cube(color_material(), shader));
    add_cube(&mut scene, "behind", Vec3::new(0.0, 0.0, 20.0), cube(color_material(), shader));

    renderer.render_camera(&mut scene, &camera(), None).unwrap();

    assert_eq!(renderer.stats().draw_calls, 1);
    assert_eq!(renderer.stats().triangles, 12);
}

/// A multisampled render texture is cleared with the camera background and
/// resolved after the pass.
#[test]
fn test_render_texture_target_resolves() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));
    let mut texture = RenderTexture::new(
        renderer.backend_mut(),
        RenderTextureDescriptor::color("msaa", 64, 64).with_samples(4),
    )
    .unwrap();

    let background = [0.2, 0.3, 0.4, 1.0];
    let camera = camera().with_background_color(background);
    renderer
        .render_camera(&mut scene, &camera, Some(&mut texture))
        .unwrap();

    let commands = renderer.backend().commands();
    assert!(commands.contains(&RecordedCommand::BeginRenderPass {
        framebuffer: Some(texture.framebuffer()),
        clear_color: Some(background),
        clear_depth: Some(1.0),
        clear_stencil: None,
    }));
    assert!(commands.contains(&RecordedCommand::SetViewport {
        width: 64.0,
        height: 64.0,
    }));
    assert!(commands.contains(&RecordedCommand::ResolveTexture {
        src: texture.color_texture().unwrap(),
        dst: texture.resolve_texture().unwrap(),
    }));
}

/// The default framebuffer is cleared with the configured colour when the
/// camera sets none.
#[test]
fn test_default_framebuffer_clear_color() {
    let clear_color = [0.1, 0.1, 0.1, 1.0];
    let mut renderer = renderer_with(RendererConfig {
        occlusion_culling: false,
        clear_color,
        ..Default::default()
    });

    renderer
        .render_camera(&mut Scene::new(), &camera(), None)
        .unwrap();

    assert!(renderer
        .backend()
        .commands()
        .contains(&RecordedCommand::BeginRenderPass {
            framebuffer: None,
            clear_color: Some(clear_color),
            clear_depth: Some(1.0),
            clear_stencil: None,
        }));
}

/// A render target renders its own camera without shadow maps.
#[test]
fn test_cull_and_render_target() {
    let mut renderer = renderer_without_queries();
    let shader = add_color_shader(&renderer, "test.color");
    let mut scene = Scene::new();
    add_cube(&mut scene, "cube", Vec3::ZERO, cube(color_material(), shader));
    scene.add_light(Light::directional(Vec3::NEG_Y).with_shadows());
    let texture = RenderTexture::new(
        renderer.backend_mut(),
        RenderTextureDescriptor::color("target", 16, 16),
    )
    .unwrap();
    let mut target = RenderTarget::new(camera(), Some(texture));

    renderer.cull_and_render(&mut scene, &mut target);

    assert!(renderer.shadow_texture().is_none());
    assert_eq!(count_draws(renderer.backend().commands()), 1);
    let framebuffer = target.texture().unwrap().framebuffer();
    assert!(renderer.backend().commands().iter().any(|c| matches!(
        c,
        RecordedCommand::BeginRenderPass { framebuffer: Some(fb), .. } if *fb == framebuffer
    )));
}
