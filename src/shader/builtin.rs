//! Shaders the renderer itself depends on: the error fallback, the shadow
//! depth shaders and the bounding-box shader for occlusion queries.

use super::{
    ShaderDescriptor, ShaderManager, BOUNDING_BOX_SHADER, DEPTH_SHADER, DEPTH_SHADER_SKINNED,
    ERROR_SHADER,
};

const TRANSFORM_BLOCK: &str = r#"
layout(std140, set = 0, binding = 0) uniform Transform_ubo {
    mat4 u_view;
    mat4 u_mvp;
    mat4 u_mv;
    mat4 u_mv_it;
    mat4 u_model;
    mat4 u_view_i;
    float u_right;
};
"#;

const TRANSFORM_BLOCK_MULTIVIEW: &str = r#"
layout(std140) uniform Transform_ubo {
    mat4 u_view_[2];
    mat4 u_mvp_[2];
    mat4 u_mv_[2];
    mat4 u_mv_it_[2];
    mat4 u_model;
    mat4 u_view_i;
    float u_right;
};
"#;

const BONES_BLOCK: &str = r#"
layout(std140, set = 0, binding = 3) uniform Bones_ubo {
    mat4 u_bone_matrix[60];
};
"#;

fn position_vertex(multiview: bool, skinned: bool) -> String {
    if multiview {
        let mut src = String::from(
            "#version 300 es\n#extension GL_OVR_multiview2 : enable\nlayout(num_views = 2) in;\n",
        );
        src.push_str(TRANSFORM_BLOCK_MULTIVIEW);
        src.push_str("in vec3 a_position;\n");
        src.push_str(
            "void main() {\n    gl_Position = u_mvp_[gl_ViewID_OVR] * vec4(a_position, 1.0);\n}\n",
        );
        return src;
    }

    let mut src = String::from("#version 450\n");
    src.push_str(TRANSFORM_BLOCK);
    src.push_str("layout(location = 0) in vec3 a_position;\n");
    if skinned {
        src.push_str(BONES_BLOCK);
        src.push_str("layout(location = 1) in vec4 a_bone_weights;\n");
        src.push_str("layout(location = 2) in ivec4 a_bone_indices;\n");
        src.push_str(
            r#"void main() {
    mat4 skin = u_bone_matrix[a_bone_indices.x] * a_bone_weights.x
              + u_bone_matrix[a_bone_indices.y] * a_bone_weights.y
              + u_bone_matrix[a_bone_indices.z] * a_bone_weights.z
              + u_bone_matrix[a_bone_indices.w] * a_bone_weights.w;
    gl_Position = u_mvp * skin * vec4(a_position, 1.0);
}
"#,
        );
    } else {
        src.push_str("void main() {\n    gl_Position = u_mvp * vec4(a_position, 1.0);\n}\n");
    }
    src
}

fn solid_fragment(multiview: bool, color: &str) -> String {
    if multiview {
        format!(
            "#version 300 es\nprecision mediump float;\nout vec4 fragColor;\nvoid main() {{\n    fragColor = {};\n}}\n",
            color
        )
    } else {
        format!(
            "#version 450\nlayout(location = 0) out vec4 fragColor;\nvoid main() {{\n    fragColor = {};\n}}\n",
            color
        )
    }
}

fn depth_fragment(multiview: bool) -> String {
    let version = if multiview { "#version 300 es" } else { "#version 450" };
    format!("{}\nvoid main() {{\n}}\n", version)
}

/// Descriptors of every built-in shader.
pub fn builtin_shaders(multiview: bool) -> Vec<ShaderDescriptor> {
    vec![
        ShaderDescriptor {
            signature: ERROR_SHADER.to_string(),
            vertex_descriptor: "float3 a_position".to_string(),
            vertex_source: position_vertex(multiview, false),
            fragment_source: solid_fragment(multiview, "vec4(1.0, 0.0, 0.0, 1.0)"),
            ..Default::default()
        },
        ShaderDescriptor {
            signature: DEPTH_SHADER.to_string(),
            vertex_descriptor: "float3 a_position".to_string(),
            vertex_source: position_vertex(false, false),
            fragment_source: depth_fragment(false),
            ..Default::default()
        },
        ShaderDescriptor {
            signature: DEPTH_SHADER_SKINNED.to_string(),
            vertex_descriptor: "float3 a_position float4 a_bone_weights int4 a_bone_indices"
                .to_string(),
            vertex_source: position_vertex(false, true),
            fragment_source: depth_fragment(false),
            ..Default::default()
        },
        ShaderDescriptor {
            signature: BOUNDING_BOX_SHADER.to_string(),
            vertex_descriptor: "float3 a_position".to_string(),
            vertex_source: position_vertex(multiview, false),
            fragment_source: solid_fragment(multiview, "vec4(1.0)"),
            ..Default::default()
        },
    ]
}

/// Register the built-in shaders. Shadow maps always render single-view.
pub fn register_builtin_shaders(manager: &ShaderManager, multiview: bool) {
    for desc in builtin_shaders(multiview) {
        manager.add_shader(desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_shader_metadata() {
        let manager = ShaderManager::new();
        register_builtin_shaders(&manager, false);
        assert_eq!(manager.len(), 4);

        let skinned = manager.find_shader(DEPTH_SHADER_SKINNED).unwrap();
        assert!(skinned.has_bones());
        assert!(skinned.uses_matrix_uniforms());
        assert!(!manager.find_shader(DEPTH_SHADER).unwrap().has_bones());
    }

    #[test]
    fn test_multiview_error_shader_has_keywords() {
        let desc = builtin_shaders(true).remove(0);
        assert!(desc.vertex_source.contains("gl_ViewID_OVR"));
        assert!(desc.vertex_source.contains("GL_OVR_multiview2"));
    }
}
