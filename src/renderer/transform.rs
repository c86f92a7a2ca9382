//! Per-object transform uniforms

use glam::Mat4;

use super::RenderState;
use crate::layout::{bindings, UniformBlock, TRANSFORM_DESCRIPTOR, TRANSFORM_DESCRIPTOR_MULTIVIEW};
use crate::render_data::render_mask;

pub(crate) fn transform_block(multiview: bool) -> UniformBlock {
    let descriptor = if multiview {
        TRANSFORM_DESCRIPTOR_MULTIVIEW
    } else {
        TRANSFORM_DESCRIPTOR
    };
    UniformBlock::new(descriptor, bindings::TRANSFORM, "Transform_ubo")
}

/// Fill `block` with the matrices for drawing `model` under `state`.
///
/// Multiview blocks get one matrix per eye; the mono block uses the state's
/// single view.
pub(crate) fn update_transforms(block: &mut UniformBlock, state: &RenderState, model: &Mat4) {
    let right = if state.render_mask & render_mask::RIGHT != 0 {
        1.0
    } else {
        0.0
    };
    block.set_mat4("u_model", model);
    block.set_mat4("u_view_i", &state.view.inverse());
    block.set_float("u_right", right);

    if block.has_field("u_mvp_") {
        let mut views = [Mat4::IDENTITY; 2];
        let mut mvs = [Mat4::IDENTITY; 2];
        let mut mv_its = [Mat4::IDENTITY; 2];
        let mut mvps = [Mat4::IDENTITY; 2];
        for (eye, view) in state.eye_views.iter().enumerate() {
            let mv = *view * *model;
            views[eye] = *view;
            mvs[eye] = mv;
            mv_its[eye] = mv.inverse().transpose();
            mvps[eye] = state.projection * mv;
        }
        block.set_mat4_array("u_view_", &views);
        block.set_mat4_array("u_mv_", &mvs);
        block.set_mat4_array("u_mv_it_", &mv_its);
        block.set_mat4_array("u_mvp_", &mvps);
    } else {
        let mv = state.view * *model;
        block.set_mat4("u_view", &state.view);
        block.set_mat4("u_mv", &mv);
        block.set_mat4("u_mv_it", &mv.inverse().transpose());
        block.set_mat4("u_mvp", &(state.projection * mv));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn state() -> RenderState {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        RenderState {
            view,
            projection: Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0),
            eye_views: [
                Mat4::from_translation(Vec3::X * 0.032) * view,
                Mat4::from_translation(-Vec3::X * 0.032) * view,
            ],
            ..RenderState::default()
        }
    }

    #[test]
    fn test_mono_matrices() {
        let state = state();
        let model = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let mut block = transform_block(false);
        update_transforms(&mut block, &state, &model);

        let mv = state.view * model;
        assert_eq!(block.get_mat4("u_mv"), Some(mv));
        assert_eq!(block.get_mat4("u_mvp"), Some(state.projection * mv));
        assert_eq!(block.get_mat4("u_mv_it"), Some(mv.inverse().transpose()));
        assert_eq!(block.get_mat4("u_model"), Some(model));
        assert_eq!(block.get_float("u_right"), Some(0.0));
    }

    #[test]
    fn test_multiview_matrices_per_eye() {
        let mut state = state();
        state.multiview = true;
        state.render_mask = render_mask::BOTH;
        let mut block = transform_block(true);
        update_transforms(&mut block, &state, &Mat4::IDENTITY);

        let bytes = block.get_bytes("u_mvp_", 128).unwrap();
        let right: Vec<f32> = bytes[64..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let expected = state.projection * state.eye_views[1];
        assert_eq!(right, expected.to_cols_array().to_vec());
        assert_eq!(block.get_float("u_right"), Some(1.0));
    }
}
