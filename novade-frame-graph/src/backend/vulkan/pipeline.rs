use crate::backend::{DescriptorBindingDesc, DescriptorWrite, GraphicsPipelineBuild, ShaderModuleRef};
use crate::error::{RenderGraphError, Result};
use ash::{vk, Device};
use tracing::debug;

pub(super) fn create_descriptor_set_layout(
    device: &Device,
    bindings: &[DescriptorBindingDesc],
) -> Result<vk::DescriptorSetLayout> {
    let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(b.binding)
                .descriptor_type(b.ty)
                .descriptor_count(b.count)
                .stage_flags(b.stages)
                .build()
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&create_info, None) }?)
}

pub(super) fn create_pipeline_layout(
    device: &Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_bytes: u32,
) -> Result<vk::PipelineLayout> {
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::ALL,
        offset: 0,
        size: push_constant_bytes,
    }];
    let ranges: &[vk::PushConstantRange] = if push_constant_bytes > 0 {
        &push_constant_ranges
    } else {
        &[]
    };
    let create_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(ranges);
    Ok(unsafe { device.create_pipeline_layout(&create_info, None) }?)
}

fn stage_infos(stages: &[ShaderModuleRef<'_>]) -> Vec<vk::PipelineShaderStageCreateInfo> {
    stages
        .iter()
        .map(|s| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(s.stage)
                .module(s.module)
                .name(s.entry)
                .build()
        })
        .collect()
}

pub(super) fn create_graphics_pipeline(device: &Device, build: &GraphicsPipelineBuild<'_>) -> Result<vk::Pipeline> {
    let shader_stages = stage_infos(build.stages);
    let raster = build.raster;

    let (vertex_bindings, vertex_attributes) = match &raster.vertex_layout {
        Some(layout) => (
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            layout
                .attributes
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: 0,
                    format: a.format,
                    offset: a.offset,
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    let vertex_input_state_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly_state_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(raster.topology)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic; only the counts matter here.
    let viewport_state_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state_info = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(raster.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisample_state_info = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = build
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::builder()
                .blend_enable(raster.blend)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .build()
        })
        .collect();
    let color_blend_state_info = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let depth_stencil_state_info = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(raster.depth_test)
        .depth_write_enable(raster.depth_write)
        .depth_compare_op(raster.depth_compare)
        .stencil_test_enable(false);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_info = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(build.color_formats)
        .depth_attachment_format(build.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let graphics_pipeline_create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state_info)
        .input_assembly_state(&input_assembly_state_info)
        .viewport_state(&viewport_state_info)
        .rasterization_state(&rasterization_state_info)
        .multisample_state(&multisample_state_info)
        .color_blend_state(&color_blend_state_info)
        .depth_stencil_state(&depth_stencil_state_info)
        .dynamic_state(&dynamic_state_info)
        .layout(build.layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[graphics_pipeline_create_info], None)
    };
    first_pipeline(device, build.name, pipelines)
}

pub(super) fn create_compute_pipeline(
    device: &Device,
    layout: vk::PipelineLayout,
    stage: &ShaderModuleRef<'_>,
) -> Result<vk::Pipeline> {
    let stage_info = vk::PipelineShaderStageCreateInfo::builder()
        .stage(stage.stage)
        .module(stage.module)
        .name(stage.entry)
        .build();
    let create_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage_info)
        .layout(layout)
        .build();
    let pipelines = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) };
    first_pipeline(device, "compute", pipelines)
}

fn first_pipeline(
    device: &Device,
    name: &str,
    result: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
) -> Result<vk::Pipeline> {
    match result {
        Ok(pipelines) => pipelines.into_iter().next().ok_or_else(|| RenderGraphError::InvalidPipelineState {
            pipeline: name.to_string(),
            reason: "pipeline creation returned no pipeline".to_string(),
        }),
        Err((partial, err)) => {
            for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                unsafe { device.destroy_pipeline(pipeline, None) };
            }
            debug!("Pipeline '{}' creation failed: {}", name, err);
            Err(err.into())
        }
    }
}

pub(super) fn allocate_descriptor_set(
    device: &Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Result<Option<vk::DescriptorSet>> {
    let layouts = [layout];
    let allocate_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    match unsafe { device.allocate_descriptor_sets(&allocate_info) } {
        Ok(sets) => Ok(sets.into_iter().next()),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(super) fn write_descriptor_set(device: &Device, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
    let image_infos: Vec<vk::DescriptorImageInfo> = writes
        .iter()
        .map(|w| match *w {
            DescriptorWrite::Image {
                view, layout, sampler, ..
            } => vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
            DescriptorWrite::Buffer { .. } => vk::DescriptorImageInfo::default(),
        })
        .collect();
    let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
        .iter()
        .map(|w| match *w {
            DescriptorWrite::Buffer { buffer, range, .. } => vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range,
            },
            DescriptorWrite::Image { .. } => vk::DescriptorBufferInfo::default(),
        })
        .collect();

    let vk_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .enumerate()
        .map(|(i, w)| match *w {
            DescriptorWrite::Image { binding, ty, .. } => vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(ty)
                .image_info(std::slice::from_ref(&image_infos[i]))
                .build(),
            DescriptorWrite::Buffer { binding, ty, .. } => vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(ty)
                .buffer_info(std::slice::from_ref(&buffer_infos[i]))
                .build(),
        })
        .collect();
    unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
}
