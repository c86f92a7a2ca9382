//! Cameras and their post effects

use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::render_data::render_mask;
use crate::resources::Material;
use crate::shader::ShaderId;

/// Camera projection type
#[derive(Debug, Clone, Copy)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        // 90 degree square eye buffer
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_2,
            aspect: 1.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        Projection::Orthographic {
            left: -width / 2.0,
            right: width / 2.0,
            bottom: -height / 2.0,
            top: height / 2.0,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
        }
    }
}

/// A full-screen pass applied to the camera image.
///
/// The previous stage's image is assigned to the material's `u_texture` slot
/// before the quad is drawn.
#[derive(Debug, Clone)]
pub struct PostEffect {
    pub material: Arc<Material>,
    pub shader: ShaderId,
}

/// Camera for viewing the scene
#[derive(Debug, Clone)]
pub struct Camera {
    /// Camera to world transform
    pub transform: Mat4,
    pub projection: Projection,
    /// Eye bits this camera renders, see [`render_mask`]
    pub render_mask: u32,
    /// Clear colour; `None` falls back to the target or renderer default
    pub background_color: Option<[f32; 4]>,
    /// Viewport used when rendering to the default framebuffer
    pub viewport: [u32; 4],
    /// Distance between the eyes for multiview rendering
    pub eye_separation: f32,
    pub post_effects: Vec<PostEffect>,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            projection: Projection::default(),
            render_mask: render_mask::LEFT,
            background_color: None,
            viewport: [0, 0, 1024, 1024],
            eye_separation: 0.064,
            post_effects: Vec::new(),
        }
    }
}

impl Camera {
    pub fn new(projection: Projection) -> Self {
        Self {
            projection,
            ..Default::default()
        }
    }

    /// Place the camera at `position` looking at `target`.
    pub fn look_at(mut self, position: Vec3, target: Vec3, up: Vec3) -> Self {
        self.transform = Mat4::look_at_rh(position, target, up).inverse();
        self
    }

    pub fn with_render_mask(mut self, mask: u32) -> Self {
        self.render_mask = mask;
        self
    }

    pub fn with_background_color(mut self, color: [f32; 4]) -> Self {
        self.background_color = Some(color);
        self
    }

    pub fn add_post_effect(&mut self, material: Arc<Material>, shader: ShaderId) {
        self.post_effects.push(PostEffect { material, shader });
    }

    pub fn position(&self) -> Vec3 {
        self.transform.w_axis.truncate()
    }

    /// World to view matrix
    pub fn view_matrix(&self) -> Mat4 {
        self.transform.inverse()
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Left and right eye view matrices for multiview rendering.
    pub fn eye_views(&self) -> [Mat4; 2] {
        let half = self.eye_separation * 0.5;
        let view = self.view_matrix();
        [
            Mat4::from_translation(Vec3::new(half, 0.0, 0.0)) * view,
            Mat4::from_translation(Vec3::new(-half, 0.0, 0.0)) * view,
        ]
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if let Projection::Perspective { aspect, .. } = &mut self.projection {
            *aspect = width / height;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_at_position() {
        let camera = Camera::default().look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!((camera.position() - Vec3::new(0.0, 0.0, 5.0)).length() < 1e-5);
        let origin_in_view = camera.view_matrix().transform_point3(Vec3::ZERO);
        assert!((origin_in_view - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-5);
    }

    #[test]
    fn test_eye_views_are_separated() {
        let camera = Camera::default();
        let [left, right] = camera.eye_views();
        let l = left.transform_point3(Vec3::ZERO);
        let r = right.transform_point3(Vec3::ZERO);
        assert!((l.x - r.x - camera.eye_separation).abs() < 1e-6);
    }
}
