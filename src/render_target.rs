//! Framebuffer abstraction: render textures, render targets and shadow maps

use std::sync::Arc;

use glam::Mat4;

use crate::backend::{
    CompareFunction, FramebufferDescriptor, FramebufferHandle, FramebufferStatus,
    GraphicsBackend, RenderPassDescriptor, SamplerDescriptor, TextureDescriptor, TextureFormat,
    TextureHandle, TextureUsage, TextureViewDescriptor, TextureViewDimension,
};
use crate::error::{RenderError, RenderResult};
use crate::render_data::render_mask;
use crate::renderer::RenderState;
use crate::resources::{GpuTexture, Material, Texture};
use crate::scene::Camera;

/// Render texture creation parameters
#[derive(Debug, Clone)]
pub struct RenderTextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// More than one layer creates a layered (array) target
    pub layers: u32,
    pub sample_count: u32,
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    /// `None` loads the previous color contents instead of clearing
    pub clear_color: Option<[f32; 4]>,
}

impl Default for RenderTextureDescriptor {
    fn default() -> Self {
        Self {
            label: "render texture".to_string(),
            width: 1024,
            height: 1024,
            layers: 1,
            sample_count: 1,
            color_format: Some(TextureFormat::Rgba8Unorm),
            depth_format: Some(TextureFormat::Depth24Plus),
            clear_color: Some([0.0, 0.0, 0.0, 1.0]),
        }
    }
}

impl RenderTextureDescriptor {
    pub fn color(label: &str, width: u32, height: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            ..Default::default()
        }
    }

    /// Depth-only layered target, one layer per shadow-casting light.
    pub fn depth_array(label: &str, size: u32, layers: u32) -> Self {
        Self {
            label: label.to_string(),
            width: size,
            height: size,
            layers,
            color_format: None,
            depth_format: Some(TextureFormat::Depth32Float),
            clear_color: None,
            ..Default::default()
        }
    }

    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    pub fn with_stencil(mut self, use_stencil: bool) -> Self {
        if use_stencil {
            self.depth_format = Some(TextureFormat::Depth24PlusStencil8);
        }
        self
    }
}

/// An offscreen color and/or depth target.
///
/// Multisampled targets render into a transient MSAA texture and resolve into
/// a single-sample texture in [`RenderTexture::end_rendering`]. The texture
/// materials sample is exposed through [`RenderTexture::texture`].
#[derive(Debug)]
pub struct RenderTexture {
    desc: RenderTextureDescriptor,
    color: Option<TextureHandle>,
    resolve: Option<TextureHandle>,
    depth: Option<TextureHandle>,
    framebuffers: Vec<FramebufferHandle>,
    layer_index: u32,
    texture: Arc<Texture>,
}

impl RenderTexture {
    pub fn new<B: GraphicsBackend>(backend: &mut B, desc: RenderTextureDescriptor) -> RenderResult<Self> {
        if desc.color_format.is_none() && desc.depth_format.is_none() {
            return Err(RenderError::InvalidDescriptor(format!(
                "render texture {} has no attachments",
                desc.label
            )));
        }
        let layers = desc.layers.max(1);
        let samples = desc.sample_count.max(1);
        let multisampled = samples > 1;

        let attachment = |format: TextureFormat, sample_count: u32, sampled: bool| TextureDescriptor {
            label: Some(desc.label.clone()),
            width: desc.width,
            height: desc.height,
            layers,
            mip_levels: 1,
            sample_count,
            format,
            usage: if sampled {
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC
            } else {
                TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC
            },
        };

        let color = match desc.color_format {
            Some(format) => Some(backend.create_texture(&attachment(format, samples, !multisampled))?),
            None => None,
        };
        let resolve = match (desc.color_format, multisampled) {
            (Some(format), true) => {
                let mut resolve_desc = attachment(format, 1, true);
                resolve_desc.usage = resolve_desc.usage | TextureUsage::COPY_DST;
                Some(backend.create_texture(&resolve_desc)?)
            }
            _ => None,
        };
        // depth is sampled only for depth-only targets (shadow maps)
        let depth = match desc.depth_format {
            Some(format) => Some(backend.create_texture(&attachment(
                format,
                samples,
                color.is_none() && !multisampled,
            ))?),
            None => None,
        };

        let mut framebuffers = Vec::with_capacity(layers as usize);
        for layer in 0..layers {
            let view = TextureViewDescriptor {
                dimension: TextureViewDimension::Layer(layer),
            };
            let color_view = match color {
                Some(t) => Some(backend.create_texture_view(t, &view)?),
                None => None,
            };
            let depth_view = match depth {
                Some(t) => Some(backend.create_texture_view(t, &view)?),
                None => None,
            };
            framebuffers.push(backend.create_framebuffer(&FramebufferDescriptor {
                label: Some(format!("{} layer {}", desc.label, layer)),
                color: color_view,
                depth_stencil: depth_view,
                width: desc.width,
                height: desc.height,
                sample_count: samples,
            })?);
        }

        // the texture materials sample
        let sampled = match (resolve.or(color), desc.color_format, depth, desc.depth_format) {
            (Some(t), Some(format), _, _) | (None, _, Some(t), Some(format)) => Some((t, format)),
            _ => None,
        };
        let Some((sampled, format)) = sampled else {
            return Err(RenderError::InvalidDescriptor(format!(
                "render texture {} has nothing to sample",
                desc.label
            )));
        };
        // depth-only targets are sampled as shadow map arrays
        let dimension = if layers > 1 || color.is_none() {
            TextureViewDimension::Array
        } else {
            TextureViewDimension::Layer(0)
        };
        let view = backend.create_texture_view(sampled, &TextureViewDescriptor { dimension })?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some(desc.label.clone()),
            compare: format.is_depth().then_some(CompareFunction::LessEqual),
            ..Default::default()
        })?;
        let texture = Arc::new(Texture::from_render_target(
            &desc.label,
            GpuTexture::new(sampled, view, sampler, desc.width, desc.height, format),
        ));

        let render_texture = Self {
            desc,
            color,
            resolve,
            depth,
            framebuffers,
            layer_index: 0,
            texture,
        };
        if let Err(e) = render_texture.check_complete(backend) {
            log::warn!("RenderTexture: {}", e);
        }
        log::debug!(
            "RenderTexture {}: {}x{} layers={} samples={}",
            render_texture.desc.label,
            render_texture.desc.width,
            render_texture.desc.height,
            layers,
            samples
        );
        Ok(render_texture)
    }

    /// Framebuffer completeness of every layer, with the backend's reason.
    pub fn check_complete<B: GraphicsBackend>(&self, backend: &B) -> RenderResult<()> {
        for fb in &self.framebuffers {
            if let FramebufferStatus::Incomplete(reason) = backend.framebuffer_status(*fb) {
                return Err(RenderError::FramebufferIncomplete {
                    label: self.desc.label.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn layers(&self) -> u32 {
        self.framebuffers.len() as u32
    }

    pub fn sample_count(&self) -> u32 {
        self.desc.sample_count.max(1)
    }

    pub fn has_stencil(&self) -> bool {
        self.desc.depth_format.is_some_and(|f| f.has_stencil())
    }

    pub fn clear_color(&self) -> Option<[f32; 4]> {
        self.desc.clear_color
    }

    pub fn set_clear_color(&mut self, color: Option<[f32; 4]>) {
        self.desc.clear_color = color;
    }

    pub fn layer_index(&self) -> u32 {
        self.layer_index
    }

    pub fn set_layer_index(&mut self, layer: u32) {
        if layer >= self.layers() {
            log::error!(
                "RenderTexture {}: layer {} out of range ({} layers)",
                self.desc.label,
                layer,
                self.layers()
            );
            return;
        }
        self.layer_index = layer;
    }

    /// The texture a material samples this target through.
    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn color_texture(&self) -> Option<TextureHandle> {
        self.color
    }

    pub fn resolve_texture(&self) -> Option<TextureHandle> {
        self.resolve
    }

    pub fn depth_texture(&self) -> Option<TextureHandle> {
        self.depth
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffers[self.layer_index as usize]
    }

    fn begin_pass<B: GraphicsBackend>(&self, backend: &mut B, clear: bool) {
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(self.desc.label.clone()),
            framebuffer: Some(self.framebuffer()),
            clear_color: if clear && self.color.is_some() {
                self.desc.clear_color
            } else {
                None
            },
            clear_depth: (clear && self.depth.is_some()).then_some(1.0),
            clear_stencil: (clear && self.has_stencil()).then_some(0),
        });
        backend.set_viewport(0.0, 0.0, self.desc.width as f32, self.desc.height as f32);
        backend.set_scissor_rect(0, 0, self.desc.width, self.desc.height);
    }

    /// Bind the current layer, clear it and set viewport and scissor to its size.
    pub fn begin_rendering<B: GraphicsBackend>(&self, backend: &mut B) {
        self.begin_pass(backend, true);
    }

    /// Bind one layer keeping its contents.
    pub fn bind_frame_buffer<B: GraphicsBackend>(&mut self, backend: &mut B, layer: u32) {
        self.set_layer_index(layer);
        self.begin_pass(backend, false);
    }

    /// Finish the pass and resolve multisampled color.
    pub fn end_rendering<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.end_render_pass();
        if let (Some(color), Some(resolve)) = (self.color, self.resolve) {
            backend.resolve_texture(color, resolve);
        }
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for fb in self.framebuffers.drain(..) {
            backend.destroy_framebuffer(fb);
        }
        for texture in [self.color.take(), self.resolve.take(), self.depth.take()]
            .into_iter()
            .flatten()
        {
            backend.destroy_texture(texture);
        }
    }
}

/// A camera rendering into a render texture, or into the default
/// framebuffer when no texture is attached.
#[derive(Debug)]
pub struct RenderTarget {
    pub camera: Camera,
    texture: Option<RenderTexture>,
    state: RenderState,
}

impl RenderTarget {
    pub fn new(camera: Camera, texture: Option<RenderTexture>) -> Self {
        let state = RenderState::from_camera(&camera, false);
        Self {
            camera,
            texture,
            state,
        }
    }

    pub fn texture(&self) -> Option<&RenderTexture> {
        self.texture.as_ref()
    }

    pub fn texture_mut(&mut self) -> Option<&mut RenderTexture> {
        self.texture.as_mut()
    }

    /// Swap the attached texture, returning the previous one.
    pub fn set_texture(&mut self, texture: Option<RenderTexture>) -> Option<RenderTexture> {
        std::mem::replace(&mut self.texture, texture)
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RenderState {
        &mut self.state
    }

    /// Refresh the render state from the camera, keeping overrides.
    pub fn update_state(&mut self, multiview: bool) {
        let material_override = self.state.material_override.take();
        let shadow_map = self.state.shadow_map;
        self.state = RenderState::from_camera(&self.camera, multiview);
        self.state.material_override = material_override;
        self.state.shadow_map = shadow_map;
        if let Some(texture) = &self.texture {
            self.state.viewport = [0, 0, texture.width(), texture.height()];
        }
    }

    /// Split borrow of the camera, the state and the texture.
    pub(crate) fn parts_mut(&mut self) -> (&Camera, &RenderState, Option<&mut RenderTexture>) {
        (&self.camera, &self.state, self.texture.as_mut())
    }
}

/// Render target of one shadow-casting light.
///
/// Renders depth only, with the depth material override, into one layer of
/// the shared layered shadow texture.
#[derive(Debug, Clone)]
pub struct ShadowMap {
    layer_index: u32,
    state: RenderState,
}

impl ShadowMap {
    pub fn new(view: Mat4, projection: Mat4, layer_index: u32, depth_material: Arc<Material>) -> Self {
        let mut state = RenderState {
            view,
            projection,
            eye_views: [view; 2],
            camera_position: view.inverse().w_axis.truncate(),
            ..RenderState::default()
        };
        state.material_override = Some(depth_material);
        state.render_mask = render_mask::LEFT;
        state.shadow_map = true;
        Self { layer_index, state }
    }

    pub fn layer_index(&self) -> u32 {
        self.layer_index
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    /// Bind this map's layer of `texture` and clear it.
    pub fn begin_rendering<B: GraphicsBackend>(&self, backend: &mut B, texture: &mut RenderTexture) {
        texture.set_layer_index(self.layer_index);
        texture.begin_rendering(backend);
    }

    pub fn end_rendering<B: GraphicsBackend>(&self, backend: &mut B, texture: &RenderTexture) {
        texture.end_rendering(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, RecordedCommand};

    #[test]
    fn test_msaa_resolves_on_end() {
        let mut backend = DummyBackend::new();
        let rt = RenderTexture::new(
            &mut backend,
            RenderTextureDescriptor::color("msaa", 64, 64).with_samples(4),
        )
        .unwrap();
        assert!(rt.check_complete(&backend).is_ok());
        assert!(rt.resolve_texture().is_some());

        backend.take_commands();
        rt.begin_rendering(&mut backend);
        rt.end_rendering(&mut backend);
        let commands = backend.take_commands();
        assert!(matches!(
            commands[0],
            RecordedCommand::BeginRenderPass {
                clear_color: Some(_),
                clear_depth: Some(_),
                clear_stencil: None,
                ..
            }
        ));
        assert_eq!(commands[1], RecordedCommand::SetViewport { width: 64.0, height: 64.0 });
        assert!(matches!(commands.last(), Some(RecordedCommand::ResolveTexture { .. })));
    }

    #[test]
    fn test_layered_depth_target() {
        let mut backend = DummyBackend::new();
        let mut rt =
            RenderTexture::new(&mut backend, RenderTextureDescriptor::depth_array("shadows", 256, 3))
                .unwrap();
        assert_eq!(rt.layers(), 3);
        let first = rt.framebuffer();
        rt.set_layer_index(2);
        assert_ne!(rt.framebuffer(), first);
        rt.set_layer_index(5);
        assert_eq!(rt.layer_index(), 2);

        backend.take_commands();
        rt.bind_frame_buffer(&mut backend, 1);
        assert!(matches!(
            backend.commands()[0],
            RecordedCommand::BeginRenderPass {
                clear_depth: None,
                ..
            }
        ));
        assert!(rt.texture().is_ready());
    }

    #[test]
    fn test_shadow_map_renders_one_layer() {
        let mut backend = DummyBackend::new();
        let mut shadows =
            RenderTexture::new(&mut backend, RenderTextureDescriptor::depth_array("shadows", 128, 2))
                .unwrap();
        let depth = Arc::new(Material::new("", ""));
        let map = ShadowMap::new(Mat4::IDENTITY, Mat4::IDENTITY, 1, depth.clone());

        let state = map.state();
        assert!(state.shadow_map);
        assert_eq!(state.render_mask, render_mask::LEFT);
        assert!(state.material_override.as_ref().is_some_and(|m| Arc::ptr_eq(m, &depth)));

        backend.take_commands();
        map.begin_rendering(&mut backend, &mut shadows);
        assert_eq!(shadows.layer_index(), 1);
        let layer = shadows.framebuffer();
        assert!(matches!(
            backend.commands()[0],
            RecordedCommand::BeginRenderPass { framebuffer: Some(fb), .. } if fb == layer
        ));
    }

    #[test]
    fn test_stencil_is_cleared() {
        let mut backend = DummyBackend::new();
        let rt = RenderTexture::new(
            &mut backend,
            RenderTextureDescriptor::color("stencil", 32, 32).with_stencil(true),
        )
        .unwrap();
        backend.take_commands();
        rt.begin_rendering(&mut backend);
        assert!(matches!(
            backend.commands()[0],
            RecordedCommand::BeginRenderPass {
                clear_stencil: Some(0),
                ..
            }
        ));
    }

    #[test]
    fn test_no_attachments_is_rejected() {
        let mut backend = DummyBackend::new();
        let desc = RenderTextureDescriptor {
            color_format: None,
            depth_format: None,
            ..Default::default()
        };
        assert!(matches!(
            RenderTexture::new(&mut backend, desc),
            Err(RenderError::InvalidDescriptor(_))
        ));
    }
}
