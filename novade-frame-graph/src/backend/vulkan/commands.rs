use crate::backend::{AttachmentInfo, AttachmentLoad, RenderingInfo};
use crate::barrier::{BarrierTarget, ResolvedBarrier};
use ash::{vk, Device};
use std::ffi::CString;

pub(super) fn pipeline_barrier(device: &Device, cb: vk::CommandBuffer, barriers: &[ResolvedBarrier]) {
    let mut src_stages = vk::PipelineStageFlags::empty();
    let mut dst_stages = vk::PipelineStageFlags::empty();
    let mut image_barriers = Vec::new();
    let mut buffer_barriers = Vec::new();
    for barrier in barriers {
        src_stages |= barrier.src.stages;
        dst_stages |= barrier.dst.stages;
        match barrier.target {
            BarrierTarget::Image { image, range } => image_barriers.push(
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(barrier.src.access)
                    .dst_access_mask(barrier.dst.access)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .src_queue_family_index(barrier.src_queue_family)
                    .dst_queue_family_index(barrier.dst_queue_family)
                    .image(image)
                    .subresource_range(range)
                    .build(),
            ),
            BarrierTarget::Buffer(buffer) => buffer_barriers.push(
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(barrier.src.access)
                    .dst_access_mask(barrier.dst.access)
                    .src_queue_family_index(barrier.src_queue_family)
                    .dst_queue_family_index(barrier.dst_queue_family)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build(),
            ),
        }
    }
    // Empty stage masks are invalid without synchronization2.
    if src_stages.is_empty() {
        src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if dst_stages.is_empty() {
        dst_stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            src_stages,
            dst_stages,
            vk::DependencyFlags::empty(),
            &[],
            &buffer_barriers,
            &image_barriers,
        );
    }
}

pub(super) fn begin_label(loader: &ash::extensions::ext::DebugUtils, cb: vk::CommandBuffer, name: &str) {
    let Ok(name) = CString::new(name) else {
        return;
    };
    let label = vk::DebugUtilsLabelEXT::builder()
        .label_name(&name)
        .color([0.4, 0.6, 0.9, 1.0]);
    unsafe { loader.cmd_begin_debug_utils_label(cb, &label) };
}

fn attachment(info: &AttachmentInfo) -> vk::RenderingAttachmentInfo {
    let (load_op, clear_value) = match info.load {
        AttachmentLoad::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
        AttachmentLoad::ClearColor(color) => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        ),
        AttachmentLoad::ClearDepth(depth) => (
            vk::AttachmentLoadOp::CLEAR,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
            },
        ),
        AttachmentLoad::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
    };
    let store_op = if info.store {
        vk::AttachmentStoreOp::STORE
    } else {
        vk::AttachmentStoreOp::DONT_CARE
    };
    vk::RenderingAttachmentInfo::builder()
        .image_view(info.view)
        .image_layout(info.layout)
        .load_op(load_op)
        .store_op(store_op)
        .clear_value(clear_value)
        .build()
}

pub(super) fn begin_rendering(device: &Device, cb: vk::CommandBuffer, info: &RenderingInfo) {
    let color_attachments: Vec<vk::RenderingAttachmentInfo> = info.color.iter().map(attachment).collect();
    let depth_attachment = info.depth.as_ref().map(attachment);
    let mut rendering_info = vk::RenderingInfo::builder()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: info.extent,
        })
        .layer_count(1)
        .color_attachments(&color_attachments);
    if let Some(depth) = depth_attachment.as_ref() {
        rendering_info = rendering_info.depth_attachment(depth);
    }
    unsafe { device.cmd_begin_rendering(cb, &rendering_info) };
}

pub(super) fn set_viewport_scissor(device: &Device, cb: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    unsafe {
        device.cmd_set_viewport(cb, 0, &[viewport]);
        device.cmd_set_scissor(cb, 0, &[scissor]);
    }
}

pub(super) fn copy_buffer_to_image(
    device: &Device,
    cb: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Image,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent3D,
) {
    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: extent,
    };
    unsafe {
        device.cmd_copy_buffer_to_image(cb, src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
    }
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// `src` and `dst` are (mip level, extent of that level).
pub(super) fn blit_mip(
    device: &Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    src: (u32, vk::Extent2D),
    dst: (u32, vk::Extent2D),
    layer_count: u32,
) {
    let layers = |mip_level| vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level,
        base_array_layer: 0,
        layer_count,
    };
    let region = vk::ImageBlit {
        src_subresource: layers(src.0),
        src_offsets: [vk::Offset3D::default(), far_corner(src.1)],
        dst_subresource: layers(dst.0),
        dst_offsets: [vk::Offset3D::default(), far_corner(dst.1)],
    };
    unsafe {
        device.cmd_blit_image(
            cb,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
            vk::Filter::LINEAR,
        );
    }
}
