//! Light types for the scene

use glam::{Mat4, Vec3, Vec4};

use crate::backend::GraphicsBackend;
use crate::layout::{bindings, UniformBlock};

/// Per-light uniform block layout
pub const LIGHT_DESCRIPTOR: &str = "float4 world_position float4 world_direction float4 color \
                                    float4 params mat4 sm_matrix int shadow_map_index";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Directional,
    Point,
    /// Cone angles in radians
    Spot { inner_angle: f32, outer_angle: f32 },
}

impl LightKind {
    fn type_index(&self) -> f32 {
        match self {
            LightKind::Point => 0.0,
            LightKind::Spot { .. } => 1.0,
            LightKind::Directional => 2.0,
        }
    }
}

/// A scene light. Each light owns a uniform block which it pushes to the
/// shader at `LIGHTS + index` when a lit object is drawn.
#[derive(Debug)]
pub struct Light {
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
    pub enabled: bool,
    pub cast_shadows: bool,
    /// Width of the orthographic shadow volume of a directional light
    pub shadow_extent: f32,
    shadow_layer: Option<u32>,
    uniforms: UniformBlock,
}

impl Light {
    pub fn new(kind: LightKind) -> Self {
        Self {
            kind,
            position: Vec3::ZERO,
            direction: -Vec3::Z,
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 10.0,
            enabled: true,
            cast_shadows: false,
            shadow_extent: 20.0,
            shadow_layer: None,
            uniforms: UniformBlock::new(LIGHT_DESCRIPTOR, bindings::LIGHTS, "Lights_ubo"),
        }
    }

    pub fn directional(direction: Vec3) -> Self {
        Self {
            direction: direction.normalize(),
            ..Self::new(LightKind::Directional)
        }
    }

    pub fn point(position: Vec3, radius: f32) -> Self {
        Self {
            position,
            radius,
            ..Self::new(LightKind::Point)
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, inner_angle: f32, outer_angle: f32) -> Self {
        Self {
            position,
            direction: direction.normalize(),
            ..Self::new(LightKind::Spot {
                inner_angle,
                outer_angle,
            })
        }
    }

    pub fn with_shadows(mut self) -> Self {
        self.cast_shadows = true;
        self
    }

    /// Layer of the shadow map this light rendered into this frame.
    pub fn shadow_layer(&self) -> Option<u32> {
        self.shadow_layer
    }

    pub(crate) fn set_shadow_layer(&mut self, layer: Option<u32>) {
        self.shadow_layer = layer;
    }

    pub fn uniforms(&self) -> &UniformBlock {
        &self.uniforms
    }

    /// View and projection of the camera a shadow map is rendered with.
    pub fn shadow_view_projection(&self) -> (Mat4, Mat4) {
        let direction = self.direction.normalize_or_zero();
        let up = if direction.cross(Vec3::Y).length_squared() < 1e-6 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        match self.kind {
            LightKind::Directional => {
                let eye = self.position - direction * self.shadow_extent;
                let view = Mat4::look_at_rh(eye, eye + direction, up);
                let proj = Mat4::orthographic_rh(
                    -self.shadow_extent * 0.5,
                    self.shadow_extent * 0.5,
                    -self.shadow_extent * 0.5,
                    self.shadow_extent * 0.5,
                    0.1,
                    self.shadow_extent * 2.0,
                );
                (view, proj)
            }
            LightKind::Spot { outer_angle, .. } => {
                let view = Mat4::look_at_rh(self.position, self.position + direction, up);
                let proj = Mat4::perspective_rh((outer_angle * 2.0).max(0.01), 1.0, 0.1, self.radius);
                (view, proj)
            }
            LightKind::Point => {
                let view = Mat4::look_at_rh(self.position, self.position + direction, up);
                let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, self.radius);
                (view, proj)
            }
        }
    }

    /// Refresh the uniform block from the light's current parameters.
    pub fn update_uniforms(&mut self) {
        let (inner, outer) = match self.kind {
            LightKind::Spot {
                inner_angle,
                outer_angle,
            } => (inner_angle.cos(), outer_angle.cos()),
            _ => (0.0, 0.0),
        };
        let (view, proj) = self.shadow_view_projection();
        let layer = self.shadow_layer.map_or(-1, |l| l as i32);

        let block = &mut self.uniforms;
        block.set_vec4("world_position", self.position.extend(self.radius));
        block.set_vec4("world_direction", self.direction.extend(self.kind.type_index()));
        block.set_vec4("color", self.color.extend(self.intensity));
        block.set_vec4("params", Vec4::new(inner, outer, 0.0, 0.0));
        block.set_mat4("sm_matrix", &(proj * view));
        block.set_int("shadow_map_index", layer);
    }

    /// Push this light's uniforms for the next draw, as light number `index`.
    pub fn push<B: GraphicsBackend>(&self, backend: &mut B, index: u32) -> bool {
        if index >= bindings::MAX_LIGHTS {
            log::warn!("Light: only {} lights per draw are supported", bindings::MAX_LIGHTS);
            return false;
        }
        backend.push_uniforms(bindings::LIGHTS + index, self.uniforms.data());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniforms_follow_parameters() {
        let mut light = Light::spot(Vec3::new(0.0, 4.0, 0.0), -Vec3::Y, 0.3, 0.5).with_shadows();
        light.set_shadow_layer(Some(2));
        light.update_uniforms();
        let block = light.uniforms();
        assert_eq!(block.get_int("shadow_map_index"), Some(2));
        assert_eq!(block.get_vec4("world_direction"), Some(Vec4::new(0.0, -1.0, 0.0, 1.0)));
        assert_eq!(block.total_size(), 144);
    }

    #[test]
    fn test_shadow_camera_looks_along_direction() {
        let light = Light::directional(Vec3::new(0.0, -1.0, 0.0));
        let (view, _) = light.shadow_view_projection();
        // a point below the light ends up in front of the shadow camera
        let p = view.transform_point3(light.position - Vec3::Y);
        assert!(p.z < 0.0);
    }
}
