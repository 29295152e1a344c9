use super::VulkanBackend;
use crate::backend::{AcquireResult, PresentStatus, SwapchainDesc, SwapchainInfo};
use crate::error::{RenderGraphError, Result};
use ash::vk;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(super) fn surface_extent(backend: &VulkanBackend) -> vk::Extent2D {
    let capabilities = unsafe {
        backend
            .surface_loader
            .get_physical_device_surface_capabilities(backend.physical_device, backend.surface)
    };
    match capabilities {
        Ok(capabilities) if capabilities.current_extent.width != u32::MAX => capabilities.current_extent,
        Ok(_) => backend.fallback_extent.get(),
        Err(e) => {
            warn!("Failed to query surface capabilities: {}", e);
            backend.fallback_extent.get()
        }
    }
}

fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|fmt| {
            fmt.format == vk::Format::B8G8R8A8_SRGB && fmt.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

pub(super) fn create(
    backend: &VulkanBackend,
    desc: &SwapchainDesc,
    old: Option<vk::SwapchainKHR>,
) -> Result<SwapchainInfo> {
    let capabilities = unsafe {
        backend
            .surface_loader
            .get_physical_device_surface_capabilities(backend.physical_device, backend.surface)
    }?;
    let formats = unsafe {
        backend
            .surface_loader
            .get_physical_device_surface_formats(backend.physical_device, backend.surface)
    }?;
    let present_modes = unsafe {
        backend
            .surface_loader
            .get_physical_device_surface_present_modes(backend.physical_device, backend.surface)
    }?;

    let surface_format = choose_format(&formats)
        .ok_or_else(|| RenderGraphError::Initialization("no surface formats available for swapchain".to_string()))?;
    if present_modes.is_empty() {
        return Err(RenderGraphError::Initialization(
            "no present modes available for swapchain".to_string(),
        ));
    }
    // FIFO is guaranteed to be available.
    let present_mode = if present_modes.contains(&desc.present_mode) {
        desc.present_mode
    } else {
        debug!("Present mode {:?} unsupported, using FIFO", desc.present_mode);
        vk::PresentModeKHR::FIFO
    };

    let extent = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desc.extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desc.extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    };

    let mut image_count = desc.image_count.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }

    // The frame graph only touches swap images from the graphics queue, which
    // is also the present queue.
    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(backend.surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old.unwrap_or_else(vk::SwapchainKHR::null));

    let handle = unsafe { backend.swapchain_loader.create_swapchain(&create_info, None) }?;
    let images = unsafe { backend.swapchain_loader.get_swapchain_images(handle) }?;
    info!(
        "Swapchain created: {}x{}, {} images, {:?}, {:?}",
        extent.width,
        extent.height,
        images.len(),
        surface_format.format,
        present_mode
    );
    Ok(SwapchainInfo {
        handle,
        format: surface_format.format,
        extent,
        images,
    })
}

pub(super) fn acquire(
    backend: &VulkanBackend,
    swapchain: vk::SwapchainKHR,
    signal: vk::Semaphore,
    timeout: Duration,
) -> Result<AcquireResult> {
    let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    match unsafe {
        backend
            .swapchain_loader
            .acquire_next_image(swapchain, nanos, signal, vk::Fence::null())
    } {
        Ok((index, suboptimal)) => Ok(AcquireResult::Acquired { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(RenderGraphError::DeviceLost(format!(
            "no swap image became available within {:?}",
            timeout
        ))),
        Err(e) => Err(e.into()),
    }
}

pub(super) fn present(
    backend: &VulkanBackend,
    swapchain: vk::SwapchainKHR,
    image_index: u32,
    wait: vk::Semaphore,
) -> Result<PresentStatus> {
    let wait_semaphores = [wait];
    let swapchains = [swapchain];
    let image_indices = [image_index];
    let present_info = vk::PresentInfoKHR::builder()
        .wait_semaphores(&wait_semaphores)
        .swapchains(&swapchains)
        .image_indices(&image_indices);
    let queue = backend.queue(crate::backend::QueueKind::Graphics);
    match unsafe { backend.swapchain_loader.queue_present(queue, &present_info) } {
        Ok(false) => Ok(PresentStatus::Ok),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Resized),
        Err(e) => Err(e.into()),
    }
}
