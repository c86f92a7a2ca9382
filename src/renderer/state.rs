//! Per-pass fixed-function state toggles.
//!
//! Every change applied before a pass has its inverse applied afterwards, in
//! reverse order, so nothing leaks from one object to the next.

use crate::backend::{
    BlendFactor, CompareFunction, CullFace, FrontFace, PrimitiveTopology, StateChange,
};
use crate::render_data::{rendering_order, PassState};

/// State every camera render starts from.
pub fn baseline() -> Vec<StateChange> {
    vec![
        StateChange::DepthMask(true),
        StateChange::ColorMask(true),
        StateChange::DepthTest(true),
        StateChange::DepthFunc(CompareFunction::LessEqual),
        StateChange::CullFace(CullFace::Back),
        StateChange::FrontFace(FrontFace::Ccw),
        StateChange::Blend(true),
        StateChange::BlendFunc(BlendFactor::One, BlendFactor::OneMinusSrcAlpha),
        StateChange::PolygonOffset(None),
        StateChange::Stencil(None),
        StateChange::AlphaToCoverage(None),
        StateChange::LineWidth(1.0),
        StateChange::Topology(PrimitiveTopology::TriangleList),
    ]
}

/// Unconditional cleanup after all passes of a camera.
pub fn restore() -> [StateChange; 3] {
    [
        StateChange::DepthTest(false),
        StateChange::CullFace(CullFace::None),
        StateChange::Blend(false),
    ]
}

/// Changes for one pass and their inverses.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PassChanges {
    pub set: Vec<StateChange>,
    pub restore: Vec<StateChange>,
}

impl PassChanges {
    fn toggle(&mut self, set: StateChange, restore: StateChange) {
        self.set.push(set);
        self.restore.insert(0, restore);
    }
}

/// Toggles needed to draw a pass of an object in `order` band with the
/// given topology and line width.
pub fn pass_changes(
    state: &PassState,
    order: i32,
    topology: PrimitiveTopology,
    line_width: f32,
) -> PassChanges {
    let mut changes = PassChanges::default();
    let baseline_blend = (BlendFactor::One, BlendFactor::OneMinusSrcAlpha);

    if let Some(offset) = state.polygon_offset {
        changes.toggle(
            StateChange::PolygonOffset(Some(offset)),
            StateChange::PolygonOffset(None),
        );
    }
    if !state.depth_test {
        changes.toggle(StateChange::DepthTest(false), StateChange::DepthTest(true));
    }
    if !state.depth_mask {
        changes.toggle(StateChange::DepthMask(false), StateChange::DepthMask(true));
    }
    if let Some(stencil) = state.stencil {
        changes.toggle(StateChange::Stencil(Some(stencil)), StateChange::Stencil(None));
        if order == rendering_order::STENCIL {
            // stencil writers only touch the stencil buffer
            changes.toggle(StateChange::DepthMask(false), StateChange::DepthMask(true));
            changes.toggle(StateChange::ColorMask(false), StateChange::ColorMask(true));
        }
    }
    if !state.alpha_blend {
        changes.toggle(StateChange::Blend(false), StateChange::Blend(true));
    }
    if state.blend_func != baseline_blend {
        changes.toggle(
            StateChange::BlendFunc(state.blend_func.0, state.blend_func.1),
            StateChange::BlendFunc(baseline_blend.0, baseline_blend.1),
        );
    }
    if let Some(coverage) = state.alpha_to_coverage {
        changes.toggle(
            StateChange::AlphaToCoverage(Some(coverage)),
            StateChange::AlphaToCoverage(None),
        );
    }
    if topology != PrimitiveTopology::TriangleList {
        changes.toggle(
            StateChange::Topology(topology),
            StateChange::Topology(PrimitiveTopology::TriangleList),
        );
    }
    if topology.is_line() && line_width != 1.0 {
        changes.toggle(StateChange::LineWidth(line_width), StateChange::LineWidth(1.0));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        PipelineState, PolygonOffset, SampleCoverage, StencilOperation, StencilState,
    };

    fn stencil() -> StencilState {
        StencilState {
            compare: CompareFunction::Always,
            reference: 1,
            read_mask: 0xff,
            write_mask: 0xff,
            fail_op: StencilOperation::Keep,
            depth_fail_op: StencilOperation::Keep,
            pass_op: StencilOperation::Replace,
        }
    }

    #[test]
    fn test_default_pass_needs_no_toggles() {
        let changes = pass_changes(
            &PassState::default(),
            rendering_order::GEOMETRY,
            PrimitiveTopology::TriangleList,
            1.0,
        );
        assert!(changes.set.is_empty());
        assert!(changes.restore.is_empty());
    }

    #[test]
    fn test_restore_is_symmetric() {
        let state = PassState {
            depth_test: false,
            depth_mask: false,
            alpha_blend: false,
            blend_func: (BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha),
            polygon_offset: Some(PolygonOffset {
                factor: 1.0,
                units: 2.0,
            }),
            stencil: Some(stencil()),
            alpha_to_coverage: Some(SampleCoverage {
                value: 0.5,
                invert: false,
            }),
            ..Default::default()
        };
        let changes = pass_changes(&state, rendering_order::STENCIL, PrimitiveTopology::LineList, 3.0);
        assert_eq!(changes.set.len(), changes.restore.len());

        let mut pipeline = PipelineState::default();
        let before = pipeline;
        for c in &changes.set {
            pipeline.apply(*c);
        }
        assert!(!pipeline.color_write);
        assert!(!pipeline.depth_write);
        assert_eq!(pipeline.line_width, 3.0);
        for c in &changes.restore {
            pipeline.apply(*c);
        }
        assert_eq!(pipeline, before);
    }

    #[test]
    fn test_stencil_outside_stencil_band_keeps_color() {
        let state = PassState {
            stencil: Some(stencil()),
            ..Default::default()
        };
        let changes = pass_changes(&state, rendering_order::GEOMETRY, PrimitiveTopology::TriangleList, 1.0);
        assert_eq!(changes.set, vec![StateChange::Stencil(Some(stencil()))]);
    }

    #[test]
    fn test_baseline_matches_default_pipeline() {
        let mut pipeline = PipelineState {
            depth_test: false,
            blend: false,
            cull_face: CullFace::None,
            ..Default::default()
        };
        for c in baseline() {
            pipeline.apply(c);
        }
        assert_eq!(pipeline, PipelineState::default());
    }
}
