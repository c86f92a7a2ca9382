//! Shadow map pass

use super::Renderer;
use crate::backend::GraphicsBackend;
use crate::error::RenderResult;
use crate::render_target::{RenderTexture, RenderTextureDescriptor, ShadowMap};
use crate::scene::Scene;

impl<B: GraphicsBackend> Renderer<B> {
    /// Render a depth layer for every enabled shadow-casting light into the
    /// shared layered shadow texture.
    ///
    /// Layers are assigned in light order. Lights past the layer limit, and
    /// lights that do not cast shadows, get no layer.
    pub fn make_shadow_maps(&mut self, scene: &mut Scene) -> RenderResult<()> {
        let casters: Vec<usize> = scene
            .lights
            .iter()
            .enumerate()
            .filter(|(_, light)| light.enabled && light.cast_shadows)
            .map(|(i, _)| i)
            .collect();
        for light in &mut scene.lights {
            light.set_shadow_layer(None);
        }
        if casters.is_empty() {
            return Ok(());
        }

        let layers = self.config.max_shadow_layers.max(1);
        if casters.len() > layers as usize {
            log::warn!(
                "Renderer: {} shadow-casting lights, only {} shadow layers",
                casters.len(),
                layers
            );
        }
        let mut texture = match self.shadow_texture.take() {
            Some(texture) => texture,
            None => RenderTexture::new(
                &mut self.backend,
                RenderTextureDescriptor::depth_array("shadow maps", self.config.shadow_map_size, layers),
            )?,
        };

        for (layer, &index) in casters.iter().take(layers as usize).enumerate() {
            let layer = layer as u32;
            let light = &mut scene.lights[index];
            light.set_shadow_layer(Some(layer));
            let (view, projection) = light.shadow_view_projection();

            let shadow_map = ShadowMap::new(view, projection, layer, self.depth_material.clone());
            shadow_map.begin_rendering(&mut self.backend, &mut texture);
            self.render_scene(scene, shadow_map.state());
            shadow_map.end_rendering(&mut self.backend, &texture);
            log::trace!("Renderer: shadow layer {} rendered for light {}", layer, index);
        }

        self.shadow_texture = Some(texture);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec3;

    use super::*;
    use crate::backend::{DummyBackend, RecordedCommand};
    use crate::render_data::RenderData;
    use crate::resources::{Material, Mesh};
    use crate::scene::{Light, SceneObject};
    use crate::RendererConfig;

    fn scene_with_lights(count: usize) -> Scene {
        let mut scene = Scene::new();
        let mut rd = RenderData::new(Arc::new(Mesh::cube()));
        rd.add_pass(Arc::new(Material::new("", "")), None);
        scene.add_object(SceneObject::new("caster").with_render_data(rd), None);
        for _ in 0..count {
            scene.add_light(Light::directional(Vec3::new(0.0, -1.0, -0.2)).with_shadows());
        }
        scene.add_light(Light::point(Vec3::Y, 10.0));
        scene.update_transforms();
        scene
    }

    #[test]
    fn test_layers_assigned_in_light_order() {
        let mut renderer = Renderer::new(DummyBackend::new(), RendererConfig::default());
        let mut scene = scene_with_lights(2);
        renderer.make_shadow_maps(&mut scene).unwrap();

        assert_eq!(scene.lights[0].shadow_layer(), Some(0));
        assert_eq!(scene.lights[1].shadow_layer(), Some(1));
        assert_eq!(scene.lights[2].shadow_layer(), None);
        assert_eq!(renderer.shadow_texture().unwrap().layers(), 4);

        let passes = renderer
            .backend()
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::BeginRenderPass { clear_depth: Some(_), .. }))
            .count();
        assert_eq!(passes, 2);
    }

    #[test]
    fn test_lights_past_layer_limit_get_no_layer() {
        let config = RendererConfig {
            max_shadow_layers: 1,
            ..Default::default()
        };
        let mut renderer = Renderer::new(DummyBackend::new(), config);
        let mut scene = scene_with_lights(2);
        renderer.make_shadow_maps(&mut scene).unwrap();
        assert_eq!(scene.lights[0].shadow_layer(), Some(0));
        assert_eq!(scene.lights[1].shadow_layer(), None);
    }

    #[test]
    fn test_no_casters_creates_nothing() {
        let mut renderer = Renderer::new(DummyBackend::new(), RendererConfig::default());
        let mut scene = scene_with_lights(0);
        renderer.make_shadow_maps(&mut scene).unwrap();
        assert!(renderer.shadow_texture().is_none());
    }
}
