//! The camera rendering pipeline
//!
//! For every camera the renderer culls the scene against the view frustum
//! (and, for occlusion candidates, against GPU occlusion queries), drops
//! objects whose materials are not ready, sorts what is left and draws each
//! pass with symmetric state toggles. Shadow maps render before the camera;
//! post effects ping-pong between two offscreen textures after it.

pub mod cull;
mod instance;
pub mod post_effect;
mod shadow;
pub mod sort;
pub mod state;
mod transform;

pub use cull::{Containment, Frustum};
pub use instance::{create_renderer, BackendContexts, RendererInstance};

use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::backend::{
    CullFace, GraphicsBackend, PrimitiveTopology, QueryHandle, RenderPassDescriptor, StateChange,
};
use crate::error::RenderResult;
use crate::layout::UniformBlock;
use crate::render_data::{render_mask, PassState, RenderData};
use crate::render_target::{RenderTarget, RenderTexture};
use crate::resources::{GpuMesh, GpuTexture, Material, Mesh, MATERIAL_NOT_READY};
use crate::scene::{BoundingVolume, Camera, Light, PostEffect, Scene, SceneObject};
use crate::shader::builtin::register_builtin_shaders;
use crate::shader::{
    Shader, ShaderId, ShaderManager, BOUNDING_BOX_SHADER, DEPTH_SHADER, DEPTH_SHADER_SKINNED,
    ERROR_SHADER,
};
use crate::RendererConfig;

use cull::Visible;
use sort::SortKey;

/// Per-camera rendering state
#[derive(Debug, Clone)]
pub struct RenderState {
    pub view: Mat4,
    pub projection: Mat4,
    /// Left and right eye views, used by multiview rendering
    pub eye_views: [Mat4; 2],
    pub camera_position: Vec3,
    pub render_mask: u32,
    pub viewport: [u32; 4],
    /// Depth-only shadow pass: every object draws with `material_override`
    pub shadow_map: bool,
    pub material_override: Option<Arc<Material>>,
    pub multiview: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            eye_views: [Mat4::IDENTITY; 2],
            camera_position: Vec3::ZERO,
            render_mask: render_mask::LEFT,
            viewport: [0, 0, 1024, 1024],
            shadow_map: false,
            material_override: None,
            multiview: false,
        }
    }
}

impl RenderState {
    pub fn from_camera(camera: &Camera, multiview: bool) -> Self {
        Self {
            view: camera.view_matrix(),
            projection: camera.projection_matrix(),
            eye_views: camera.eye_views(),
            camera_position: camera.position(),
            render_mask: camera.render_mask,
            viewport: camera.viewport,
            shadow_map: false,
            material_override: None,
            multiview,
        }
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// Counters for the last `render_camera` call, shadow and post-effect
/// draws included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub draw_calls: u32,
    pub triangles: u32,
}

impl RenderStats {
    fn record(&mut self, triangles: u32) {
        self.draw_calls += 1;
        self.triangles += triangles;
    }
}

/// Renders scenes through one backend.
pub struct Renderer<B: GraphicsBackend> {
    backend: B,
    config: RendererConfig,
    shaders: Arc<ShaderManager>,
    transform: UniformBlock,
    transform_multiview: UniformBlock,
    stats: RenderStats,
    quad: Option<Mesh>,
    bounding_box: Option<Mesh>,
    depth_material: Arc<Material>,
    post_effect_textures: Option<[RenderTexture; 2]>,
    shadow_texture: Option<RenderTexture>,
}

impl<B: GraphicsBackend> Renderer<B> {
    pub fn new(backend: B, config: RendererConfig) -> Self {
        Self::with_shader_manager(backend, config, Arc::new(ShaderManager::new()))
    }

    /// Create a renderer sharing an existing shader registry. The built-in
    /// shaders are added to it.
    pub fn with_shader_manager(
        backend: B,
        mut config: RendererConfig,
        shaders: Arc<ShaderManager>,
    ) -> Self {
        if config.multiview && !backend.capabilities().multiview {
            log::warn!(
                "Renderer: {} has no multiview support, rendering single view",
                backend.name()
            );
            config.multiview = false;
        }
        register_builtin_shaders(&shaders, config.multiview);
        log::info!(
            "Renderer created on {} (multiview: {}, occlusion culling: {})",
            backend.name(),
            config.multiview,
            config.occlusion_culling
        );
        Self {
            backend,
            config,
            shaders,
            transform: transform::transform_block(false),
            transform_multiview: transform::transform_block(true),
            stats: RenderStats::default(),
            quad: None,
            bounding_box: None,
            depth_material: Arc::new(Material::new("", "")),
            post_effect_textures: None,
            shadow_texture: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn shader_manager(&self) -> &Arc<ShaderManager> {
        &self.shaders
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Layered depth texture written by the last [`Self::make_shadow_maps`].
    pub fn shadow_texture(&self) -> Option<&RenderTexture> {
        self.shadow_texture.as_ref()
    }

    /// Offscreen A/B pair used by post effects, once created.
    pub fn post_effect_textures(&self) -> Option<&[RenderTexture; 2]> {
        self.post_effect_textures.as_ref()
    }

    pub fn begin_frame(&mut self) -> RenderResult<()> {
        Ok(self.backend.begin_frame()?)
    }

    pub fn end_frame(&mut self) -> RenderResult<()> {
        Ok(self.backend.end_frame()?)
    }

    /// Render `scene` as seen by `camera` into `target`, or into the default
    /// framebuffer when `target` is `None`.
    ///
    /// Shadow maps are rendered first. If the camera has post effects the
    /// scene goes to an offscreen texture and the last effect writes the
    /// destination. Per-object problems are logged and skipped; only one-time
    /// setup failures (render texture creation) return `Err`.
    pub fn render_camera(
        &mut self,
        scene: &mut Scene,
        camera: &Camera,
        mut target: Option<&mut RenderTexture>,
    ) -> RenderResult<()> {
        self.stats = RenderStats::default();
        scene.update_transforms();
        self.make_shadow_maps(scene)?;
        for light in &mut scene.lights {
            light.update_uniforms();
        }

        let mut state = RenderState::from_camera(camera, self.config.multiview);
        if let Some(texture) = target.as_deref() {
            state.viewport = [0, 0, texture.width(), texture.height()];
        }

        if camera.post_effects.is_empty() {
            self.begin_target(camera.background_color, state.viewport, target.as_deref_mut());
            self.render_scene(scene, &state);
            self.end_target(target.as_deref());
        } else {
            self.render_with_post_effects(scene, &state, camera, target)?;
        }
        self.restore_state();
        log::trace!(
            "Renderer: {} draw calls, {} triangles",
            self.stats.draw_calls,
            self.stats.triangles
        );
        Ok(())
    }

    /// Render a render target's camera with its own state, without shadow
    /// maps or post effects.
    pub fn cull_and_render(&mut self, scene: &mut Scene, target: &mut RenderTarget) {
        target.update_state(self.config.multiview);
        scene.update_transforms();
        for light in &mut scene.lights {
            light.update_uniforms();
        }

        let (camera, state, mut texture) = target.parts_mut();
        self.begin_target(camera.background_color, state.viewport, texture.as_deref_mut());
        self.render_scene(scene, state);
        self.end_target(texture.as_deref());
        self.restore_state();
    }

    fn render_with_post_effects(
        &mut self,
        scene: &mut Scene,
        state: &RenderState,
        camera: &Camera,
        mut target: Option<&mut RenderTexture>,
    ) -> RenderResult<()> {
        let (width, height) = match target.as_deref() {
            Some(texture) => (texture.width(), texture.height()),
            None => (camera.viewport[2], camera.viewport[3]),
        };
        post_effect::ensure_textures(
            &mut self.backend,
            &mut self.post_effect_textures,
            width.max(1),
            height.max(1),
            &self.config,
        )?;
        let Some(mut textures) = self.post_effect_textures.take() else {
            return Ok(());
        };

        let mut scene_state = state.clone();
        scene_state.viewport = [0, 0, textures[0].width(), textures[0].height()];
        self.begin_target(camera.background_color, scene_state.viewport, Some(&mut textures[0]));
        self.render_scene(scene, &scene_state);
        textures[0].end_rendering(&mut self.backend);

        let steps = post_effect::schedule(camera.post_effects.len());
        for (effect, step) in camera.post_effects.iter().zip(steps) {
            effect
                .material
                .set_texture("u_texture", textures[step.source].texture().clone());
            match step.destination {
                Some(dst) => textures[dst].begin_rendering(&mut self.backend),
                None => self.begin_target(
                    camera.background_color,
                    state.viewport,
                    target.as_deref_mut(),
                ),
            }
            self.draw_post_effect(effect);
            match step.destination {
                Some(dst) => textures[dst].end_rendering(&mut self.backend),
                None => self.end_target(target.as_deref()),
            }
        }

        self.post_effect_textures = Some(textures);
        Ok(())
    }

    fn begin_target(
        &mut self,
        background: Option<[f32; 4]>,
        viewport: [u32; 4],
        target: Option<&mut RenderTexture>,
    ) {
        match target {
            Some(texture) => {
                if background.is_some() {
                    texture.set_clear_color(background);
                }
                texture.begin_rendering(&mut self.backend);
            }
            None => {
                self.backend.begin_render_pass(&RenderPassDescriptor {
                    label: Some("default framebuffer".to_string()),
                    framebuffer: None,
                    clear_color: Some(background.unwrap_or(self.config.clear_color)),
                    clear_depth: Some(1.0),
                    clear_stencil: self.config.use_stencil.then_some(0),
                });
                let [x, y, width, height] = viewport;
                self.backend
                    .set_viewport(x as f32, y as f32, width as f32, height as f32);
                self.backend.set_scissor_rect(x, y, width, height);
            }
        }
    }

    fn end_target(&mut self, target: Option<&RenderTexture>) {
        match target {
            Some(texture) => texture.end_rendering(&mut self.backend),
            None => self.backend.end_render_pass(),
        }
    }

    fn restore_state(&mut self) {
        for change in state::restore() {
            self.backend.apply_state(change);
        }
    }

    /// Cull, sort and draw everything visible under `state` into the pass
    /// that is currently open.
    fn render_scene(&mut self, scene: &mut Scene, state: &RenderState) {
        for change in state::baseline() {
            self.backend.apply_state(change);
        }

        let frustum = Frustum::from_matrix(&state.view_projection());
        let mut visible = cull::frustum_cull(scene, &frustum, state.camera_position);
        if !state.shadow_map
            && self.config.occlusion_culling
            && self.backend.capabilities().occlusion_queries
        {
            visible = self.occlusion_cull(scene, state, visible);
        }

        let mut keys = self.prepare_draw_list(scene, state, &visible);
        sort::sort_keys(&mut keys);
        log::trace!(
            "Renderer: {} visible, {} ready to draw",
            visible.len(),
            keys.len()
        );

        let shadow = self.shadow_texture.as_ref().and_then(|t| t.texture().gpu());
        for key in keys {
            if let Some((object, lights)) = scene.object_and_lights_mut(key.id) {
                self.render_render_data(state, object, lights, shadow);
            }
        }
    }

    /// Keep occlusion candidates only once a query saw samples. A query
    /// is issued only when none is outstanding for the object.
    fn occlusion_cull(
        &mut self,
        scene: &mut Scene,
        state: &RenderState,
        visible: Vec<Visible>,
    ) -> Vec<Visible> {
        let mut kept = Vec::with_capacity(visible.len());
        for v in visible {
            let Some(object) = scene.object_mut(v.id) else {
                continue;
            };
            if !object.occlusion_candidate {
                kept.push(v);
                continue;
            }

            let bounds = object.bounds();
            let occlusion = object.occlusion_mut();
            let query = match occlusion.query {
                Some(query) => query,
                None => match self.backend.create_occlusion_query() {
                    Ok(query) => {
                        occlusion.query = Some(query);
                        query
                    }
                    Err(e) => {
                        log::warn!("Renderer: no occlusion query for {:?}: {}", v.id, e);
                        kept.push(v);
                        continue;
                    }
                },
            };

            if !occlusion.issued {
                occlusion.issued = self.draw_bounding_box(state, &bounds, query);
            }
            if let Some(samples) = self.backend.poll_occlusion_query(query) {
                occlusion.issued = false;
                occlusion.visible = samples > 0;
            }
            if occlusion.visible {
                kept.push(v);
            }
        }
        kept
    }

    /// Draw `bounds` inside `query`. False when the query could not be issued.
    fn draw_bounding_box(
        &mut self,
        state: &RenderState,
        bounds: &BoundingVolume,
        query: QueryHandle,
    ) -> bool {
        let Some(shader) = self.shaders.find_shader(BOUNDING_BOX_SHADER) else {
            log::error!("Renderer: {} is not registered", BOUNDING_BOX_SHADER);
            return false;
        };
        let program = match shader.init(&mut self.backend, state.multiview) {
            Ok(program) => program,
            Err(e) => {
                log::error!("Renderer: {}", e);
                return false;
            }
        };
        let mesh = self.bounding_box.get_or_insert_with(Mesh::bounding_box);
        let gpu = match mesh.update_gpu(&mut self.backend) {
            Ok(gpu) => gpu,
            Err(e) => {
                log::error!("Renderer: bounding box upload failed: {}", e);
                return false;
            }
        };
        let block = if state.multiview {
            &mut self.transform_multiview
        } else {
            &mut self.transform
        };
        transform::update_transforms(block, state, &bounds.unit_cube_transform());

        self.backend.apply_state(StateChange::ColorMask(false));
        self.backend.apply_state(StateChange::DepthMask(false));
        self.backend.apply_state(StateChange::CullFace(CullFace::None));
        self.backend.use_program(program);
        block.push(&mut self.backend);
        self.backend.begin_occlusion_query(query);
        draw_mesh(&mut self.backend, mesh, &gpu, &shader, PrimitiveTopology::TriangleList);
        self.backend.end_occlusion_query();
        self.backend.apply_state(StateChange::DepthMask(true));
        self.backend.apply_state(StateChange::ColorMask(true));
        true
    }

    /// Filter the visible list down to objects that can draw this frame and
    /// build their sort keys.
    fn prepare_draw_list(
        &mut self,
        scene: &mut Scene,
        state: &RenderState,
        visible: &[Visible],
    ) -> Vec<SortKey> {
        let mut keys = Vec::with_capacity(visible.len());
        for v in visible {
            let Some(render_data) = scene
                .object_mut(v.id)
                .and_then(|o| o.render_data.as_mut())
            else {
                continue;
            };
            if state.shadow_map && !render_data.cast_shadows {
                continue;
            }
            if render_data.render_mask & state.render_mask == 0 {
                continue;
            }
            render_data.set_camera_distance(v.distance);
            if !self.is_ready(render_data, state) {
                log::trace!("Renderer: {:?} is not ready, skipped this frame", v.id);
                continue;
            }
            keys.push(SortKey::new(v.id, render_data));
        }
        keys
    }

    /// Resolve every pass's shader and prepare its material. False when a
    /// material still waits for a texture.
    fn is_ready(&mut self, render_data: &RenderData, state: &RenderState) -> bool {
        for pass in 0..pass_count(render_data, state) {
            let Some(shader) = self.pass_shader(render_data, pass, state) else {
                return false;
            };
            let (Some(program), Some(material)) =
                (shader.program(), pass_material(render_data, pass, state))
            else {
                return false;
            };
            if material.update_gpu(&mut self.backend, program) == MATERIAL_NOT_READY {
                return false;
            }
        }
        true
    }

    fn pass_shader(
        &mut self,
        render_data: &RenderData,
        pass: usize,
        state: &RenderState,
    ) -> Option<Arc<Shader>> {
        if !state.shadow_map {
            return self.resolve_shader(render_data.shader(pass), state.multiview);
        }
        let skinned = render_data.mesh().is_some_and(|m| m.has_bones());
        let signature = if skinned {
            DEPTH_SHADER_SKINNED
        } else {
            DEPTH_SHADER
        };
        let Some(shader) = self.shaders.find_shader(signature) else {
            log::error!("Renderer: {} is not registered", signature);
            return None;
        };
        match shader.init(&mut self.backend, false) {
            Ok(_) => Some(shader),
            Err(e) => {
                log::error!("Renderer: {}", e);
                None
            }
        }
    }

    /// Look up a shader and make sure its program exists. Missing or broken
    /// shaders are replaced by the error shader.
    fn resolve_shader(&mut self, id: Option<ShaderId>, multiview: bool) -> Option<Arc<Shader>> {
        let shader = match id.and_then(|id| self.shaders.get_shader(id)) {
            Some(shader) => shader,
            None => {
                log::warn!("Renderer: shader {:?} not found, using {}", id, ERROR_SHADER);
                self.error_shader()?
            }
        };
        match shader.init(&mut self.backend, multiview) {
            Ok(_) => Some(shader),
            Err(e) if shader.signature() != ERROR_SHADER => {
                log::warn!("Renderer: {}, using {}", e, ERROR_SHADER);
                let fallback = self.error_shader()?;
                match fallback.init(&mut self.backend, multiview) {
                    Ok(_) => Some(fallback),
                    Err(e) => {
                        log::error!("Renderer: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                log::error!("Renderer: {}", e);
                None
            }
        }
    }

    fn error_shader(&self) -> Option<Arc<Shader>> {
        let shader = self.shaders.find_shader(ERROR_SHADER);
        if shader.is_none() {
            log::error!("Renderer: {} is not registered", ERROR_SHADER);
        }
        shader
    }

    fn render_render_data(
        &mut self,
        state: &RenderState,
        object: &mut SceneObject,
        lights: &[Light],
        shadow: Option<GpuTexture>,
    ) {
        let model = object.world_matrix();
        let Some(render_data) = object.render_data.as_mut() else {
            return;
        };
        let Some(mesh) = render_data.mesh().cloned() else {
            return;
        };
        let gpu_mesh = match mesh.update_gpu(&mut self.backend) {
            Ok(gpu) => gpu,
            Err(e) => {
                log::error!("Renderer: mesh {} upload failed: {}", mesh.name(), e);
                return;
            }
        };

        let block = if state.multiview {
            &mut self.transform_multiview
        } else {
            &mut self.transform
        };
        transform::update_transforms(block, state, &model);

        for pass in 0..pass_count(render_data, state) {
            let Some(shader) = self.pass_shader(render_data, pass, state) else {
                continue;
            };
            let (Some(program), Some(material)) =
                (shader.program(), pass_material(render_data, pass, state))
            else {
                continue;
            };
            if material.update_gpu(&mut self.backend, program) == MATERIAL_NOT_READY {
                continue;
            }

            let pass_state = if state.shadow_map {
                PassState::default()
            } else {
                render_data.passes()[pass].state
            };
            let changes = state::pass_changes(
                &pass_state,
                render_data.rendering_order,
                render_data.draw_mode,
                material.line_width(),
            );

            self.backend
                .apply_state(StateChange::CullFace(pass_state.cull_face));
            for change in &changes.set {
                self.backend.apply_state(*change);
            }

            self.backend.use_program(program);
            if shader.uses_matrix_uniforms() {
                let block = if state.multiview {
                    &self.transform_multiview
                } else {
                    &self.transform
                };
                block.push(&mut self.backend);
            }
            let next_unit = material.bind(&mut self.backend, &shader);
            if shader.has_bones() {
                render_data.bind_bones(&mut self.backend, program);
            }
            if shader.use_lights() && !state.shadow_map {
                bind_lights(&mut self.backend, lights, shadow, next_unit);
            }
            let triangles = draw_mesh(
                &mut self.backend,
                &mesh,
                &gpu_mesh,
                &shader,
                render_data.draw_mode,
            );
            self.stats.record(triangles);

            for change in &changes.restore {
                self.backend.apply_state(*change);
            }
        }
        render_data.mark_clean();
    }

    fn draw_post_effect(&mut self, effect: &PostEffect) {
        self.backend.apply_state(StateChange::DepthTest(false));
        self.backend.apply_state(StateChange::CullFace(CullFace::None));
        self.backend.apply_state(StateChange::Blend(false));

        let Some(shader) = self.resolve_shader(Some(effect.shader), false) else {
            return;
        };
        let Some(program) = shader.program() else {
            return;
        };
        if effect.material.update_gpu(&mut self.backend, program) == MATERIAL_NOT_READY {
            log::trace!("Renderer: post effect {} is not ready", shader.signature());
            return;
        }
        let quad = self.quad.get_or_insert_with(Mesh::quad);
        let gpu = match quad.update_gpu(&mut self.backend) {
            Ok(gpu) => gpu,
            Err(e) => {
                log::error!("Renderer: quad upload failed: {}", e);
                return;
            }
        };
        self.backend.use_program(program);
        effect.material.bind(&mut self.backend, &shader);
        let triangles = draw_mesh(
            &mut self.backend,
            quad,
            &gpu,
            &shader,
            PrimitiveTopology::TriangleList,
        );
        self.stats.record(triangles);
    }

    /// Release every GPU resource the renderer created.
    pub fn destroy(&mut self) {
        if let Some(mut texture) = self.shadow_texture.take() {
            texture.destroy(&mut self.backend);
        }
        if let Some(textures) = self.post_effect_textures.take() {
            for mut texture in textures {
                texture.destroy(&mut self.backend);
            }
        }
        for mesh in [self.quad.take(), self.bounding_box.take()].into_iter().flatten() {
            mesh.destroy(&mut self.backend);
        }
        self.transform.destroy(&mut self.backend);
        self.transform_multiview.destroy(&mut self.backend);
        self.shaders.destroy_programs(&mut self.backend);
    }
}

fn pass_count(render_data: &RenderData, state: &RenderState) -> usize {
    if state.shadow_map {
        render_data.pass_count().min(1)
    } else {
        render_data.pass_count()
    }
}

fn pass_material(render_data: &RenderData, pass: usize, state: &RenderState) -> Option<Arc<Material>> {
    state
        .material_override
        .clone()
        .or_else(|| render_data.material(pass).cloned())
}

/// Push enabled lights in scene order and bind the shadow maps after the
/// material's textures when any light has a layer.
fn bind_lights<B: GraphicsBackend>(
    backend: &mut B,
    lights: &[Light],
    shadow: Option<GpuTexture>,
    unit: u32,
) {
    let mut index = 0;
    let mut casts_shadow = false;
    for light in lights.iter().filter(|l| l.enabled) {
        if light.push(backend, index) {
            index += 1;
        }
        casts_shadow |= light.shadow_layer().is_some();
    }
    if casts_shadow {
        if let Some(gpu) = shadow {
            backend.bind_texture(unit, gpu.view, gpu.sampler);
        }
    }
}

/// Bind vertex and index buffers and issue the draw. Returns the triangle
/// count.
fn draw_mesh<B: GraphicsBackend>(
    backend: &mut B,
    mesh: &Mesh,
    gpu: &GpuMesh,
    shader: &Shader,
    topology: PrimitiveTopology,
) -> u32 {
    let layout = mesh.vertices().layout_for(shader.vertex_inputs());
    backend.set_vertex_buffer(gpu.vertex_buffer, &layout);
    match gpu.index_buffer {
        Some((buffer, format, count)) => {
            backend.set_index_buffer(buffer, format);
            backend.draw_indexed(0..count, 0, 0..1);
            topology.triangle_count(count)
        }
        None => {
            backend.draw(0..gpu.vertex_count, 0..1);
            topology.triangle_count(gpu.vertex_count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, RecordedCommand};
    use crate::scene::Projection;

    fn renderer() -> Renderer<DummyBackend> {
        Renderer::new(DummyBackend::new(), RendererConfig::default())
    }

    fn camera() -> Camera {
        Camera::new(Projection::perspective(90.0, 1.0, 0.1, 100.0)).look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
        )
    }

    fn cube_scene(shader: Option<ShaderId>) -> Scene {
        let mut rd = RenderData::new(Arc::new(Mesh::cube()));
        rd.add_pass(Arc::new(Material::new("float4 u_color", "")), shader);
        let mut scene = Scene::new();
        scene.add_object(SceneObject::new("cube").with_render_data(rd), None);
        scene
    }

    #[test]
    fn test_render_state_from_camera() {
        let camera = camera().with_render_mask(render_mask::RIGHT);
        let state = RenderState::from_camera(&camera, false);
        assert_eq!(state.render_mask, render_mask::RIGHT);
        assert!((state.camera_position - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-5);
        assert_eq!(state.view_projection(), camera.view_projection_matrix());
    }

    #[test]
    fn test_missing_shader_draws_with_error_shader() {
        let mut renderer = renderer();
        let mut scene = cube_scene(Some(ShaderId(999)));
        renderer.render_camera(&mut scene, &camera(), None).unwrap();

        let error = renderer.shader_manager().find_shader(ERROR_SHADER).unwrap();
        let program = error.program().unwrap();
        assert!(renderer
            .backend()
            .commands()
            .contains(&RecordedCommand::UseProgram(program)));
        assert_eq!(renderer.stats().draw_calls, 1);
        assert_eq!(renderer.stats().triangles, 12);
    }

    #[test]
    fn test_multiview_disabled_without_backend_support() {
        let config = RendererConfig {
            multiview: true,
            ..Default::default()
        };
        let renderer = Renderer::new(DummyBackend::new(), config);
        assert!(!renderer.config().multiview);
    }

    #[test]
    fn test_render_ends_with_restore() {
        let mut renderer = renderer();
        let mut scene = cube_scene(None);
        renderer.render_camera(&mut scene, &camera(), None).unwrap();
        let commands = renderer.backend().commands();
        let tail: Vec<_> = commands[commands.len() - 3..].to_vec();
        assert_eq!(
            tail,
            state::restore()
                .into_iter()
                .map(RecordedCommand::State)
                .collect::<Vec<_>>()
        );
    }
}
