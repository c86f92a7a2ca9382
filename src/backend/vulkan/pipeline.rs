//! Shader compilation, render passes and graphics pipelines.

use ash::vk;

use super::conversion::*;
use crate::backend::traits::{BackendError, BackendResult, TextureSlotKind};
use crate::backend::types::*;

/// Compile GLSL to SPIR-V and create a shader module.
pub fn compile_glsl(
    device: &ash::Device,
    source: &str,
    stage: naga::ShaderStage,
) -> BackendResult<vk::ShaderModule> {
    let options = naga::front::glsl::Options {
        stage,
        defines: Default::default(),
    };
    let mut frontend = naga::front::glsl::Frontend::default();
    let module = frontend
        .parse(&options, source)
        .map_err(|errors| BackendError::ShaderCreationFailed(format!("GLSL parse error:\n{errors}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("Validation error: {e}")))?;

    // the viewport is flipped instead of the shader
    let spv_options = naga::back::spv::Options {
        lang_version: (1, 0),
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: "main".to_string(),
    };
    let spv = naga::back::spv::write_vec(&module, &info, &spv_options, Some(&pipeline_options))
        .map_err(|e| BackendError::ShaderCreationFailed(format!("SPIR-V generation error: {e}")))?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| BackendError::ShaderCreationFailed(format!("{:?}", e)))
}

/// Descriptor set layouts and pipeline layout of a program.
///
/// Set 0 holds one dynamic uniform buffer per binding point, set 1 a sampled
/// image at `2i` and its sampler at `2i+1` for every texture unit.
pub fn create_program_layout(
    device: &ash::Device,
    uniform_bindings: &[u32],
    textures: &[TextureSlotKind],
) -> BackendResult<([vk::DescriptorSetLayout; 2], vk::PipelineLayout)> {
    let uniforms: Vec<vk::DescriptorSetLayoutBinding> = uniform_bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(*binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        })
        .collect();
    let samplers: Vec<vk::DescriptorSetLayoutBinding> = (0..textures.len() as u32)
        .flat_map(|unit| {
            [
                vk::DescriptorSetLayoutBinding::default()
                    .binding(unit * 2)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
                vk::DescriptorSetLayoutBinding::default()
                    .binding(unit * 2 + 1)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            ]
        })
        .collect();

    let create = |bindings: &[vk::DescriptorSetLayoutBinding]| {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        unsafe { device.create_descriptor_set_layout(&info, None) }
            .map_err(|e| BackendError::ProgramCreationFailed(format!("descriptor set layout: {:?}", e)))
    };
    let set_layouts = [create(&uniforms)?, create(&samplers)?];

    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| BackendError::ProgramCreationFailed(format!("pipeline layout: {:?}", e)))?;
    Ok((set_layouts, pipeline_layout))
}

/// One attachment of a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub format: vk::Format,
    pub samples: u32,
    pub clear: bool,
    pub clear_stencil: bool,
    /// Layout the attachment is in before and after the pass
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color: Option<AttachmentKey>,
    pub depth: Option<AttachmentKey>,
}

impl RenderPassKey {
    /// The loading variant, compatible with every clear combination.
    pub fn compatible(&self) -> Self {
        let load = |a: AttachmentKey| AttachmentKey {
            clear: false,
            clear_stencil: false,
            ..a
        };
        Self {
            color: self.color.map(load),
            depth: self.depth.map(load),
        }
    }
}

pub fn create_render_pass(device: &ash::Device, key: &RenderPassKey) -> BackendResult<vk::RenderPass> {
    let load_op = |clear: bool| {
        if clear {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        }
    };

    let mut attachments = Vec::with_capacity(2);
    let mut color_ref = None;
    let mut depth_ref = None;

    if let Some(color) = key.color {
        color_ref = Some(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        attachments.push(
            vk::AttachmentDescription::default()
                .format(color.format)
                .samples(convert_sample_count(color.samples))
                .load_op(load_op(color.clear))
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(if color.clear {
                    vk::ImageLayout::UNDEFINED
                } else {
                    color.layout
                })
                .final_layout(color.layout),
        );
    }
    if let Some(depth) = key.depth {
        let stencil = has_stencil(depth.format);
        let discard_all = depth.clear && (!stencil || depth.clear_stencil);
        depth_ref = Some(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        attachments.push(
            vk::AttachmentDescription::default()
                .format(depth.format)
                .samples(convert_sample_count(depth.samples))
                .load_op(load_op(depth.clear))
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(if stencil {
                    load_op(depth.clear_stencil)
                } else {
                    vk::AttachmentLoadOp::DONT_CARE
                })
                .stencil_store_op(if stencil {
                    vk::AttachmentStoreOp::STORE
                } else {
                    vk::AttachmentStoreOp::DONT_CARE
                })
                .initial_layout(if discard_all {
                    vk::ImageLayout::UNDEFINED
                } else {
                    depth.layout
                })
                .final_layout(depth.layout),
        );
    }

    let color_refs: Vec<vk::AttachmentReference> = color_ref.into_iter().collect();
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(ref depth_ref) = depth_ref {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let subpasses = [subpass];

    // order against any earlier sampling, transfer or attachment use
    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
            .dst_stage_mask(vk::PipelineStageFlags::ALL_GRAPHICS)
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::ALL_GRAPHICS)
            .dst_stage_mask(vk::PipelineStageFlags::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE),
    ];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }
        .map_err(|e| BackendError::PipelineCreationFailed(format!("render pass: {:?}", e)))
}

/// Everything a graphics pipeline is built from
pub struct PipelineDesc<'a> {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub state: &'a PipelineState,
    pub vertex_layout: &'a VertexBufferLayout,
    pub has_color: bool,
    pub has_stencil: bool,
    pub samples: u32,
    pub wide_lines: bool,
}

pub fn create_graphics_pipeline(device: &ash::Device, desc: &PipelineDesc) -> BackendResult<vk::Pipeline> {
    let state = desc.state;
    let entry = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(desc.vertex)
            .name(entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(desc.fragment)
            .name(entry),
    ];

    let bindings = [vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(desc.vertex_layout.array_stride as u32)
        .input_rate(vk::VertexInputRate::VERTEX)];
    let attributes: Vec<vk::VertexInputAttributeDescription> = desc
        .vertex_layout
        .attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::default()
                .location(attr.location)
                .binding(0)
                .format(convert_vertex_format(attr.format))
                .offset(attr.offset as u32)
        })
        .collect();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology(state.topology))
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let (bias_enable, bias_constant, bias_slope) = match state.polygon_offset {
        Some(offset) => (true, offset.units, offset.factor),
        None => (false, 0.0, 0.0),
    };
    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(convert_cull_mode(state.cull_face))
        .front_face(convert_front_face(state.front_face))
        .depth_bias_enable(bias_enable)
        .depth_bias_constant_factor(bias_constant)
        .depth_bias_slope_factor(bias_slope);

    let mask_words = match state.alpha_to_coverage {
        Some(coverage) => sample_mask_words(coverage.mask(desc.samples)),
        None => [vk::SampleMask::MAX; 2],
    };
    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(convert_sample_count(desc.samples))
        .sample_mask(&mask_words[..1])
        .alpha_to_coverage_enable(state.alpha_to_coverage.is_some() && desc.samples > 1);

    let stencil_face = state.stencil.map(|s| {
        vk::StencilOpState::default()
            .fail_op(convert_stencil_op(s.fail_op))
            .pass_op(convert_stencil_op(s.pass_op))
            .depth_fail_op(convert_stencil_op(s.depth_fail_op))
            .compare_op(convert_compare_op(s.compare))
            .compare_mask(s.read_mask)
            .write_mask(s.write_mask)
            .reference(s.reference)
    });
    let mut depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(state.depth_test)
        .depth_write_enable(state.depth_test && state.depth_write)
        .depth_compare_op(convert_compare_op(state.depth_compare))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(stencil_face.is_some() && desc.has_stencil);
    if let Some(face) = stencil_face {
        depth_stencil_state = depth_stencil_state.front(face).back(face);
    }

    let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .has_color
        .then(|| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(state.blend)
                .src_color_blend_factor(convert_blend_factor(state.blend_src))
                .dst_color_blend_factor(convert_blend_factor(state.blend_dst))
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(convert_blend_factor(state.blend_src))
                .dst_alpha_blend_factor(convert_blend_factor(state.blend_dst))
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(if state.color_write {
                    vk::ColorComponentFlags::RGBA
                } else {
                    vk::ColorComponentFlags::empty()
                })
        })
        .into_iter()
        .collect();
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let mut dynamic_states = vec![
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::STENCIL_REFERENCE,
    ];
    if desc.wide_lines {
        dynamic_states.push(vk::DynamicState::LINE_WIDTH);
    }
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| BackendError::PipelineCreationFailed(format!("{:?}", e)))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatible_render_pass_key_loads() {
        let attachment = AttachmentKey {
            format: vk::Format::D24_UNORM_S8_UINT,
            samples: 1,
            clear: true,
            clear_stencil: true,
            layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        };
        let key = RenderPassKey {
            color: None,
            depth: Some(attachment),
        };
        let compatible = key.compatible();
        let depth = compatible.depth.unwrap();
        assert!(!depth.clear && !depth.clear_stencil);
        assert_eq!(depth.format, attachment.format);
        assert_eq!(compatible, compatible.compatible());
    }
}
