//! Runs a deferred lighting frame graph on the simulated device.
//!
//! Usage: `novade-frame-graph-headless [config.toml] [frames]`

use anyhow::{bail, Context};
use ash::vk;
use novade_frame_graph::backend::sim::{SimConfig, SimulatedDevice};
use novade_frame_graph::backend::{RasterState, SamplerInfo};
use novade_frame_graph::logging::{init_logging, init_minimal_logging};
use novade_frame_graph::pipeline::SPIRV_MAGIC;
use novade_frame_graph::{
    AttachmentLoad, Binding, BindingResource, BufferDesc, FrameGraph, FrameGraphConfig, ImageDesc, ImageSize,
    PassDesc, PipelineDesc, ResourceUsage, ShaderStageDesc, TargetFormat,
};
use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_FRAMES: u64 = 120;
const TEXTURE_SIZE: u32 = 256;

fn spirv(tag: u32) -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, tag, 0]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

fn build_scene(graph: &mut FrameGraph<SimulatedDevice>) -> anyhow::Result<()> {
    let backbuffer = graph.backbuffer().context("swapchain has no backbuffer")?;
    let full = ImageSize::SwapchainRelative { scale: 1.0 };
    let attachment = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;

    let albedo = graph.create_image(
        ImageDesc::new("gbuffer.albedo", vk::Format::R8G8B8A8_UNORM, attachment, full)
            .with_sampler(SamplerInfo::default()),
    )?;
    let normal = graph.create_image(
        ImageDesc::new("gbuffer.normal", vk::Format::A2B10G10R10_UNORM_PACK32, attachment, full)
            .with_sampler(SamplerInfo::default()),
    )?;
    let depth = graph.create_image(
        ImageDesc::new(
            "gbuffer.depth",
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            full,
        )
        .with_sampler(SamplerInfo {
            filter: vk::Filter::NEAREST,
            ..SamplerInfo::default()
        }),
    )?;
    let ao = graph.create_image(
        ImageDesc::new(
            "ssao",
            vk::Format::R8_UNORM,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            ImageSize::SwapchainRelative { scale: 0.5 },
        )
        .with_sampler(SamplerInfo::default()),
    )?;
    let hdr = graph.create_image(
        ImageDesc::new("hdr", vk::Format::R16G16B16A16_SFLOAT, attachment, full).with_sampler(SamplerInfo::default()),
    )?;
    let texels = (0..TEXTURE_SIZE * TEXTURE_SIZE)
        .flat_map(|i| {
            let checker = if (i / 16 + i / (16 * TEXTURE_SIZE)) % 2 == 0 { 0xff } else { 0x40 };
            [checker, checker, checker, 0xff]
        })
        .collect();
    let texture = graph.create_image(
        ImageDesc::new(
            "albedo-texture",
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            ImageSize::Absolute {
                width: TEXTURE_SIZE,
                height: TEXTURE_SIZE,
            },
        )
        .with_full_mip_chain()
        .with_contents(texels)
        .with_sampler(SamplerInfo {
            address_mode: vk::SamplerAddressMode::REPEAT,
            ..SamplerInfo::default()
        }),
    )?;
    let camera = graph.create_buffer(
        BufferDesc::new("camera", 256, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .host_visible()
            .with_contents(vec![0; 256]),
    )?;
    let vertices = graph.create_buffer(
        BufferDesc::new("cube.vertices", 36 * 32, vk::BufferUsageFlags::VERTEX_BUFFER).with_contents(vec![0; 36 * 32]),
    )?;

    let gbuffer_pipeline = graph.build_pipeline(
        PipelineDesc::graphics("gbuffer")
            .with_stage(ShaderStageDesc::vertex(spirv(1)))
            .with_stage(ShaderStageDesc::fragment(spirv(2)))
            .with_color_target(TargetFormat::Format(vk::Format::R8G8B8A8_UNORM))
            .with_color_target(TargetFormat::Format(vk::Format::A2B10G10R10_UNORM_PACK32))
            .with_depth_target(vk::Format::D32_SFLOAT)
            .with_raster(RasterState {
                depth_test: true,
                depth_write: true,
                ..RasterState::default()
            })
            .with_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
            .with_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
    )?;
    let ssao_pipeline = graph.build_pipeline(
        PipelineDesc::compute("ssao")
            .with_stage(ShaderStageDesc::compute(spirv(3)))
            .with_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::COMPUTE)
            .with_binding(1, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE),
    )?;
    let lighting_pipeline = graph.build_pipeline(
        PipelineDesc::graphics("lighting")
            .with_stage(ShaderStageDesc::vertex(spirv(4)))
            .with_stage(ShaderStageDesc::fragment(spirv(5)))
            .with_color_target(TargetFormat::Format(vk::Format::R16G16B16A16_SFLOAT))
            .with_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            .with_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            .with_binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
            .with_binding(3, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT),
    )?;
    let tonemap_pipeline = graph.build_pipeline(
        PipelineDesc::graphics("tonemap")
            .with_stage(ShaderStageDesc::vertex(spirv(4)))
            .with_stage(ShaderStageDesc::fragment(spirv(6)))
            .with_color_target(TargetFormat::Backbuffer)
            .with_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
    )?;

    let gbuffer_set = graph.build_descriptor_set(
        gbuffer_pipeline,
        &[
            Binding::new(0, BindingResource::UniformBuffer(camera)),
            Binding::new(1, BindingResource::CombinedImageSampler(texture)),
        ],
    )?;
    let ssao_set = graph.build_descriptor_set(
        ssao_pipeline,
        &[
            Binding::new(0, BindingResource::CombinedImageSampler(depth)),
            Binding::new(1, BindingResource::StorageImage(ao)),
        ],
    )?;
    let lighting_set = graph.build_descriptor_set(
        lighting_pipeline,
        &[
            Binding::new(0, BindingResource::CombinedImageSampler(albedo)),
            Binding::new(1, BindingResource::CombinedImageSampler(normal)),
            Binding::new(2, BindingResource::CombinedImageSampler(ao)),
            Binding::new(3, BindingResource::UniformBuffer(camera)),
        ],
    )?;
    let tonemap_set = graph.build_descriptor_set(
        tonemap_pipeline,
        &[Binding::new(0, BindingResource::CombinedImageSampler(hdr))],
    )?;

    graph.register_pass(PassDesc::generate_mips("texture-mips", texture))?;

    graph.register_pass(
        PassDesc::graphics("gbuffer")
            .read(camera, ResourceUsage::uniform_read(vk::PipelineStageFlags::VERTEX_SHADER))
            .read(vertices, ResourceUsage::vertex_buffer())
            .read(texture, ResourceUsage::fragment_sampled())
            .write(albedo, ResourceUsage::color_attachment_write())
            .write(normal, ResourceUsage::color_attachment_write())
            .write(depth, ResourceUsage::depth_attachment_write())
            .record(move |ctx| {
                ctx.begin_rendering(
                    &[
                        (albedo, AttachmentLoad::ClearColor([0.0, 0.0, 0.0, 1.0])),
                        (normal, AttachmentLoad::ClearColor([0.5, 0.5, 1.0, 0.0])),
                    ],
                    Some((depth, AttachmentLoad::ClearDepth(1.0))),
                )?;
                ctx.bind_pipeline(gbuffer_pipeline)?;
                ctx.bind_descriptor_set(gbuffer_set)?;
                ctx.bind_vertex_buffer(vertices)?;
                ctx.draw(36, 1)?;
                ctx.end_rendering()
            }),
    )?;

    // Shadow-free scenes can run without occlusion; the lighting pass falls
    // back to a cleared AO image.
    let ssao_registered = graph.register_optional_pass("ssao", |_| {
        Ok(PassDesc::compute("ssao")
            .read(
                depth,
                ResourceUsage::new(
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::AccessFlags::SHADER_READ,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                ),
            )
            .write(ao, ResourceUsage::compute_storage_write())
            .record(move |ctx| {
                let extent = ctx.image(ao)?.extent();
                ctx.bind_pipeline(ssao_pipeline)?;
                ctx.bind_descriptor_set(ssao_set)?;
                ctx.dispatch(extent.width.div_ceil(8), extent.height.div_ceil(8), 1)
            }))
    })?;
    if !ssao_registered {
        warn!("Running without ambient occlusion");
    }

    let lighting = PassDesc::graphics("lighting")
        .read(albedo, ResourceUsage::fragment_sampled())
        .read(normal, ResourceUsage::fragment_sampled())
        .read(camera, ResourceUsage::uniform_read(vk::PipelineStageFlags::FRAGMENT_SHADER))
        .write(hdr, ResourceUsage::color_attachment_write())
        .record(move |ctx| {
            ctx.begin_rendering(&[(hdr, AttachmentLoad::DontCare)], None)?;
            ctx.bind_pipeline(lighting_pipeline)?;
            ctx.bind_descriptor_set(lighting_set)?;
            ctx.draw(3, 1)?;
            ctx.end_rendering()
        });
    // Without the compute pass nothing ever writes the AO image.
    let lighting = if ssao_registered {
        lighting.read(ao, ResourceUsage::fragment_sampled())
    } else {
        lighting
            .read(ao, ResourceUsage::fragment_sampled())
            .allow_uninitialized_reads()
    };
    graph.register_pass(lighting)?;

    graph.register_pass(
        PassDesc::graphics("tonemap")
            .read(hdr, ResourceUsage::fragment_sampled())
            .write(backbuffer, ResourceUsage::color_attachment_write())
            .record(move |ctx| {
                ctx.begin_rendering(&[(backbuffer, AttachmentLoad::DontCare)], None)?;
                ctx.bind_pipeline(tonemap_pipeline)?;
                ctx.bind_descriptor_set(tonemap_set)?;
                ctx.draw(3, 1)?;
                ctx.end_rendering()
            }),
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => FrameGraphConfig::load(&PathBuf::from(path))?,
        None => FrameGraphConfig::default(),
    };
    let frames = match args.next() {
        Some(count) => count.parse::<u64>().context("frame count must be a number")?,
        None => DEFAULT_FRAMES,
    };
    if let Err(e) = init_logging(&config.logging) {
        init_minimal_logging();
        warn!("Falling back to stderr logging: {}", e);
    }

    let device = SimulatedDevice::new(SimConfig {
        surface_extent: vk::Extent2D {
            width: config.renderer.initial_width,
            height: config.renderer.initial_height,
        },
        ..SimConfig::default()
    });
    let mut graph = FrameGraph::new(device, config)?;
    build_scene(&mut graph)?;
    info!("Passes: {:?}", graph.pass_names());

    let mut presented = 0u64;
    let mut failed = 0u64;
    for frame in 0..frames {
        if frame == frames / 2 {
            let extent = vk::Extent2D {
                width: 1920,
                height: 1080,
            };
            info!("Resizing surface to {}x{}", extent.width, extent.height);
            graph.backend().inject_resize(extent);
        }
        match graph.run_frame() {
            Ok(report) if report.skipped => info!("Frame skipped"),
            Ok(report) => {
                presented += 1;
                if report.resized || report.frame_number % 30 == 1 {
                    info!(
                        "Frame {} slot {} image {}: {:?}, {} barriers in {} batches{}",
                        report.frame_number,
                        report.slot,
                        report.image_index,
                        report.passes_executed,
                        report.barriers_issued,
                        report.batches,
                        if report.resized { " (resized)" } else { "" }
                    );
                }
            }
            Err(e) if e.is_fatal() => return Err(e).context("frame loop ended"),
            Err(e) => {
                failed += 1;
                warn!("Frame failed: {}", e);
            }
        }
    }

    graph.wait_idle()?;
    let stats = graph.backend().stats();
    info!(
        "{} frames presented, {} failed; {} submissions, {} barriers, {} draws, {} dispatches, {} blits",
        presented, failed, stats.submissions, stats.barriers_executed, stats.draws, stats.dispatches, stats.blits
    );
    let violations = graph.backend().violations();
    if !violations.is_empty() {
        for violation in &violations {
            warn!("{}", violation);
        }
        bail!("{} device usage violations", violations.len());
    }
    Ok(())
}
