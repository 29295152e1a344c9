#![allow(dead_code)]

use ash::vk;
use novade_frame_graph::backend::sim::{SimConfig, SimulatedDevice};
use novade_frame_graph::backend::SamplerInfo;
use novade_frame_graph::pipeline::SPIRV_MAGIC;
use novade_frame_graph::{
    AttachmentLoad, Binding, BindingResource, BufferDesc, BufferHandle, DescriptorSetHandle, FrameGraph,
    FrameGraphConfig, ImageDesc, ImageHandle, ImageSize, PassDesc, PipelineDesc, PipelineHandle, ResourceUsage,
    ShaderStageDesc, TargetFormat,
};

pub type SimGraph = FrameGraph<SimulatedDevice>;

/// A minimal SPIR-V module: header only, `tag` in the bound word.
pub fn spirv(tag: u32) -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, tag, 0]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

pub fn sim_graph() -> SimGraph {
    sim_graph_with(SimConfig::default(), FrameGraphConfig::default())
}

pub fn sim_graph_with(sim: SimConfig, config: FrameGraphConfig) -> SimGraph {
    FrameGraph::new(SimulatedDevice::new(sim), config).expect("frame graph on the simulated device")
}

pub fn color_target(graph: &mut SimGraph, name: &str) -> ImageHandle {
    graph
        .create_image(
            ImageDesc::new(
                name,
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                ImageSize::SwapchainRelative { scale: 1.0 },
            )
            .with_sampler(SamplerInfo::default()),
        )
        .expect("color target")
}

/// Fullscreen graphics pipeline sampling `inputs` combined image samplers.
pub fn fullscreen_pipeline(
    graph: &mut SimGraph,
    name: &str,
    tag: u32,
    target: TargetFormat,
    inputs: u32,
) -> PipelineHandle {
    let mut desc = PipelineDesc::graphics(name)
        .with_stage(ShaderStageDesc::vertex(spirv(1000)))
        .with_stage(ShaderStageDesc::fragment(spirv(tag)))
        .with_color_target(target);
    for binding in 0..inputs {
        desc = desc.with_binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
        );
    }
    graph.build_pipeline(desc).expect("fullscreen pipeline")
}

pub fn sampling_set(graph: &mut SimGraph, pipeline: PipelineHandle, images: &[ImageHandle]) -> DescriptorSetHandle {
    let bindings: Vec<Binding> = images
        .iter()
        .enumerate()
        .map(|(i, image)| Binding::new(i as u32, BindingResource::CombinedImageSampler(*image)))
        .collect();
    graph.build_descriptor_set(pipeline, &bindings).expect("descriptor set")
}

/// Clears `target` as a color attachment.
pub fn clear_pass(name: &str, target: ImageHandle) -> PassDesc {
    PassDesc::graphics(name)
        .write(target, ResourceUsage::color_attachment_write())
        .record(move |ctx| {
            ctx.begin_rendering(&[(target, AttachmentLoad::ClearColor([0.0; 4]))], None)?;
            ctx.end_rendering()
        })
}

/// Draws a fullscreen triangle into `target` sampling every image of `set`.
pub fn blit_pass(
    name: &str,
    inputs: &[ImageHandle],
    target: ImageHandle,
    pipeline: PipelineHandle,
    set: DescriptorSetHandle,
) -> PassDesc {
    let mut desc = PassDesc::graphics(name);
    for input in inputs {
        desc = desc.read(*input, ResourceUsage::fragment_sampled());
    }
    desc.write(target, ResourceUsage::color_attachment_write())
        .record(move |ctx| {
            ctx.begin_rendering(&[(target, AttachmentLoad::DontCare)], None)?;
            ctx.bind_pipeline(pipeline)?;
            ctx.bind_descriptor_set(set)?;
            ctx.draw(3, 1)?;
            ctx.end_rendering()
        })
}

/// Handles of the three-pass graphics, compute, graphics chain.
pub struct Chain {
    pub scene: ImageHandle,
    pub particles: BufferHandle,
    pub backbuffer: ImageHandle,
}

/// Size of the particle buffer, 16 bytes per particle.
pub const PARTICLE_BYTES: u64 = 16 * 1024;

/// "A" renders `scene` on the graphics queue, "B" samples it on the compute
/// queue and writes the `particles` buffer, "C" draws `particles` as vertex
/// input into the backbuffer.
pub fn register_chain(graph: &mut SimGraph) -> Chain {
    let scene = color_target(graph, "scene");
    let particles = graph
        .create_buffer(BufferDesc::new(
            "particles",
            PARTICLE_BYTES,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER,
        ))
        .expect("particle buffer");
    let backbuffer = graph.backbuffer().expect("backbuffer");

    let simulate = graph
        .build_pipeline(
            PipelineDesc::compute("simulate")
                .with_stage(ShaderStageDesc::compute(spirv(2000)))
                .with_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::COMPUTE)
                .with_binding(1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
        )
        .expect("compute pipeline");
    let simulate_set = graph
        .build_descriptor_set(
            simulate,
            &[
                Binding::new(0, BindingResource::CombinedImageSampler(scene)),
                Binding::new(1, BindingResource::StorageBuffer(particles)),
            ],
        )
        .expect("compute set");
    let draw = fullscreen_pipeline(graph, "particles", 2001, TargetFormat::Backbuffer, 0);

    graph.register_pass(clear_pass("A", scene)).expect("pass A");
    graph
        .register_pass(
            PassDesc::compute("B")
                .read(scene, ResourceUsage::compute_sampled())
                .write(particles, ResourceUsage::compute_storage_write())
                .record(move |ctx| {
                    ctx.bind_pipeline(simulate)?;
                    ctx.bind_descriptor_set(simulate_set)?;
                    ctx.dispatch(16, 1, 1)
                }),
        )
        .expect("pass B");
    graph
        .register_pass(
            PassDesc::graphics("C")
                .read(particles, ResourceUsage::vertex_buffer())
                .write(backbuffer, ResourceUsage::color_attachment_write())
                .record(move |ctx| {
                    ctx.begin_rendering(&[(backbuffer, AttachmentLoad::ClearColor([0.0; 4]))], None)?;
                    ctx.bind_pipeline(draw)?;
                    ctx.bind_vertex_buffer(particles)?;
                    ctx.draw((PARTICLE_BYTES / 16) as u32, 1)?;
                    ctx.end_rendering()
                }),
        )
        .expect("pass C");
    Chain {
        scene,
        particles,
        backbuffer,
    }
}

pub fn label_names(graph: &SimGraph) -> Vec<String> {
    graph
        .backend()
        .executed_labels()
        .into_iter()
        .map(|label| label.name)
        .collect()
}
