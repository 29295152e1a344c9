//! [`GpuBackend`] over a real Vulkan 1.3 device.
//!
//! Rendering uses dynamic rendering, so no render pass or framebuffer objects
//! exist. The surface is created by the host through a [`SurfaceSource`]; the
//! backend only needs the instance extensions it requires.

use super::{
    AcquireResult, DescriptorBindingDesc, DescriptorWrite, FenceWait, GpuBackend,
    GraphicsPipelineBuild, ImageInfo, ImageViewInfo, MemoryProperties, PresentStatus, QueueFamilies,
    QueueKind, RenderingInfo, SamplerInfo, ShaderModuleRef, Sharing, SubmitBatch, SwapchainDesc,
    SwapchainInfo,
};
use crate::barrier::ResolvedBarrier;
use crate::config::RendererConfig;
use crate::error::{RenderGraphError, Result};
use ash::vk;
use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::time::Duration;
use tracing::{debug, info, warn};

mod commands;
mod pipeline;
mod swapchain;

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *p_callback_data;
    let message_id_number = callback_data.message_id_number;

    let message_id_name = if callback_data.p_message_id_name.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };

    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::debug!(
                target: "vulkan",
                "[VERBOSE] type: {:?}, id: {} ({}), message: {}",
                message_type, message_id_name, message_id_number, message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(
                target: "vulkan",
                "[INFO] type: {:?}, id: {} ({}), message: {}",
                message_type, message_id_name, message_id_number, message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(
                target: "vulkan",
                "[WARNING] type: {:?}, id: {} ({}), message: {}",
                message_type, message_id_name, message_id_number, message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(
                target: "vulkan",
                "[ERROR] type: {:?}, id: {} ({}), message: {}",
                message_type, message_id_name, message_id_number, message
            );
        }
        _ => {
            tracing::trace!(
                target: "vulkan",
                "[UNKNOWN] severity: {:?}, type: {:?}, id: {} ({}), message: {}",
                message_severity, message_type, message_id_name, message_id_number, message
            );
        }
    }
    vk::FALSE
}

fn init_error(context: &str, e: impl std::fmt::Display) -> RenderGraphError {
    RenderGraphError::Initialization(format!("{}: {}", context, e))
}

/// Creates the presentation surface once the instance exists.
pub type SurfaceFactory = Box<dyn FnOnce(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR>>;

/// How the host provides a window surface.
pub struct SurfaceSource {
    /// Platform surface extensions, e.g. `VK_KHR_wayland_surface`.
    pub instance_extensions: Vec<&'static CStr>,
    pub create: SurfaceFactory,
    /// Used when the surface leaves its size to the swapchain (Wayland).
    pub initial_extent: vk::Extent2D,
}

#[derive(Debug, Clone, Copy)]
struct QueueFamilyIndices {
    graphics_family: Option<u32>,
    compute_family: Option<u32>,
    transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    fn resolve(&self) -> Option<QueueFamilies> {
        let graphics = self.graphics_family?;
        let compute = self.compute_family.unwrap_or(graphics);
        Some(QueueFamilies {
            graphics,
            compute,
            transfer: self.transfer_family.unwrap_or(compute),
        })
    }
}

pub struct VulkanBackend {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils_loader: Option<ash::extensions::ext::DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    physical_device: vk::PhysicalDevice,
    device_name: String,
    memory_properties: MemoryProperties,
    families: QueueFamilies,
    device: ash::Device,
    /// Indexed by [`QueueKind::index`].
    queues: [vk::Queue; 3],
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    swapchain_loader: ash::extensions::khr::Swapchain,
    fallback_extent: Cell<vk::Extent2D>,
}

impl VulkanBackend {
    pub fn new(config: &RendererConfig, surface_source: SurfaceSource) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| init_error("failed to load the Vulkan loader", e))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|e| init_error("invalid application name", e))?;
        let engine_name = CString::new("novade-frame-graph").map_err(|e| init_error("invalid engine name", e))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut instance_extensions: Vec<*const c_char> = vec![ash::extensions::khr::Surface::name().as_ptr()];
        instance_extensions.extend(surface_source.instance_extensions.iter().map(|e| e.as_ptr()));
        if config.enable_validation {
            instance_extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let validation_layer_name = CString::new("VK_LAYER_KHRONOS_validation")
            .map_err(|e| init_error("invalid layer name", e))?;
        let mut enabled_layer_names: Vec<*const c_char> = Vec::new();
        if config.enable_validation {
            enabled_layer_names.push(validation_layer_name.as_ptr());
        }

        let mut instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions)
            .enabled_layer_names(&enabled_layer_names);

        let mut debug_messenger_create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        if config.enable_validation {
            instance_create_info = instance_create_info.push_next(&mut debug_messenger_create_info);
        }

        let instance = unsafe { entry.create_instance(&instance_create_info, None) }
            .map_err(|e| init_error("failed to create the Vulkan instance", e))?;
        info!("Vulkan instance created successfully.");

        let mut debug_utils_loader = None;
        let mut debug_messenger = None;
        if config.enable_validation {
            let loader = ash::extensions::ext::DebugUtils::new(&entry, &instance);
            let messenger = unsafe { loader.create_debug_utils_messenger(&debug_messenger_create_info, None) }
                .map_err(|e| init_error("failed to create the debug messenger", e))?;
            debug_utils_loader = Some(loader);
            debug_messenger = Some(messenger);
            info!("Vulkan debug messenger created successfully.");
        }

        let surface = (surface_source.create)(&entry, &instance)?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        info!("Vulkan surface created successfully.");

        let (physical_device, indices, device_name) =
            Self::select_physical_device(&instance, &surface_loader, surface)?;
        let families = indices
            .resolve()
            .ok_or_else(|| RenderGraphError::Initialization("graphics queue family not found".to_string()))?;
        let memory_properties =
            MemoryProperties::from_vk(&unsafe { instance.get_physical_device_memory_properties(physical_device) });
        let device = Self::create_logical_device(&instance, physical_device, families)?;
        let queues = QueueKind::ALL.map(|kind| unsafe { device.get_device_queue(families.family(kind), 0) });
        info!(
            "Queues obtained. Graphics: {}, Compute: {}, Transfer: {}",
            families.graphics, families.compute, families.transfer
        );
        let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            debug_utils_loader,
            debug_messenger,
            physical_device,
            device_name,
            memory_properties,
            families,
            device,
            queues,
            surface_loader,
            surface,
            swapchain_loader,
            fallback_extent: Cell::new(surface_source.initial_extent),
        })
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, String)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| init_error("failed to enumerate physical devices", e))?;
        info!("Found {} physical devices.", physical_devices.len());

        let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilyIndices, String)> = None;
        for pdevice in physical_devices {
            let properties = unsafe { instance.get_physical_device_properties(pdevice) };
            let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            info!("Evaluating device: {}", device_name);

            if vk::api_version_minor(properties.api_version) < 3 {
                info!("Device {} does not support Vulkan 1.3", device_name);
                continue;
            }

            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
            let mut indices = QueueFamilyIndices {
                graphics_family: None,
                compute_family: None,
                transfer_family: None,
            };
            for (i, queue_family) in queue_families.iter().enumerate() {
                let i = i as u32;
                let flags = queue_family.queue_flags;
                if flags.contains(vk::QueueFlags::GRAPHICS) && indices.graphics_family.is_none() {
                    let presents = unsafe { surface_loader.get_physical_device_surface_support(pdevice, i, surface) }
                        .unwrap_or(false);
                    if presents {
                        indices.graphics_family = Some(i);
                    }
                } else if flags.contains(vk::QueueFlags::COMPUTE)
                    && !flags.contains(vk::QueueFlags::GRAPHICS)
                    && indices.compute_family.is_none()
                {
                    indices.compute_family = Some(i);
                } else if flags.contains(vk::QueueFlags::TRANSFER)
                    && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                    && indices.transfer_family.is_none()
                {
                    indices.transfer_family = Some(i);
                }
            }

            let available_extensions = unsafe { instance.enumerate_device_extension_properties(pdevice) }
                .map_err(|e| init_error("failed to enumerate device extensions", e))?;
            let required = ash::extensions::khr::Swapchain::name();
            let has_swapchain = available_extensions
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == required);
            if !has_swapchain {
                info!("Device {} does not support required extension: {:?}", device_name, required);
                continue;
            }

            if indices.graphics_family.is_none() {
                info!("Device {} has no graphics queue family that can present", device_name);
                continue;
            }

            let mut score = 1;
            if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                score += 1000;
            } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
                score += 500;
            }
            if indices.compute_family.is_some() {
                score += 10;
            }
            if best.as_ref().map_or(true, |(s, ..)| score > *s) {
                best = Some((score, pdevice, indices, device_name));
            }
        }

        let (_, pdevice, indices, name) = best.ok_or_else(|| {
            RenderGraphError::Initialization("failed to find a suitable physical device".to_string())
        })?;
        info!("Best physical device: {} with queue families: {:?}", name, indices);
        Ok((pdevice, indices, name))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priority = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priority)
                    .build()
            })
            .collect();

        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);
        let device_extensions: Vec<*const c_char> = vec![ash::extensions::khr::Swapchain::name().as_ptr()];
        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| init_error("failed to create the logical device", e))?;
        info!("Logical device created successfully.");
        Ok(device)
    }

    /// Size reported when the surface does not fix its own extent.
    pub fn set_surface_extent(&self, extent: vk::Extent2D) {
        self.fallback_extent.set(extent);
    }

    pub fn raw_device(&self) -> &ash::Device {
        &self.device
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        self.queues[kind.index()]
    }

    fn sharing_families(&self, sharing: Sharing) -> Option<Vec<u32>> {
        let unique = self.families.unique();
        match sharing {
            Sharing::Concurrent if unique.len() > 1 => Some(unique),
            _ => None,
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("Device wait idle failed during backend teardown: {}", e);
            }
            info!("Destroying Vulkan logical device...");
            self.device.destroy_device(None);
            info!("Destroying Vulkan surface...");
            self.surface_loader.destroy_surface(self.surface, None);
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                info!("Destroying Vulkan debug messenger...");
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            info!("Destroying Vulkan instance...");
            self.instance.destroy_instance(None);
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn memory_properties(&self) -> MemoryProperties {
        self.memory_properties.clone()
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        Ok(unsafe { self.device.allocate_memory(&info, None) }?)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image> {
        let families = self.sharing_families(info.sharing);
        let mut create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        create_info = match &families {
            Some(families) => create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families),
            None => create_info.sharing_mode(vk::SharingMode::EXCLUSIVE),
        };
        Ok(unsafe { self.device.create_image(&create_info, None) }?)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: u64) -> Result<()> {
        Ok(unsafe { self.device.bind_image_memory(image, memory, offset) }?)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn create_image_view(&self, image: vk::Image, info: &ImageViewInfo) -> Result<vk::ImageView> {
        let view_type = if info.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(info.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: info.aspect,
                base_mip_level: info.base_mip_level,
                level_count: info.level_count,
                base_array_layer: info.base_array_layer,
                layer_count: info.layer_count,
            });
        Ok(unsafe { self.device.create_image_view(&create_info, None) }?)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, info: &SamplerInfo) -> Result<vk::Sampler> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(info.filter)
            .min_filter(info.filter)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(info.address_mode)
            .address_mode_v(info.address_mode)
            .address_mode_w(info.address_mode)
            .min_lod(0.0)
            .max_lod(info.max_lod as f32);
        Ok(unsafe { self.device.create_sampler(&create_info, None) }?)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags, sharing: Sharing) -> Result<vk::Buffer> {
        let families = self.sharing_families(sharing);
        let mut create_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        create_info = match &families {
            Some(families) => create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families),
            None => create_info.sharing_mode(vk::SharingMode::EXCLUSIVE),
        };
        Ok(unsafe { self.device.create_buffer(&create_info, None) }?)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64) -> Result<()> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }?)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None) }?)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<FenceWait> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[fence], true, nanos) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence) }?)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.device.reset_fences(&[fence]) }?)
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe { self.device.create_semaphore(&create_info, None) }?)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        Ok(unsafe { self.device.create_command_pool(&create_info, None) }?)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        Ok(unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }?)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or(RenderGraphError::Vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        Ok(unsafe { self.device.begin_command_buffer(cb, &begin_info) }?)
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { self.device.end_command_buffer(cb) }?)
    }

    fn cmd_pipeline_barrier(&self, cb: vk::CommandBuffer, barriers: &[ResolvedBarrier]) {
        commands::pipeline_barrier(&self.device, cb, barriers);
    }

    fn cmd_begin_label(&self, cb: vk::CommandBuffer, name: &str) {
        if let Some(loader) = &self.debug_utils_loader {
            commands::begin_label(loader, cb, name);
        }
    }

    fn cmd_end_label(&self, cb: vk::CommandBuffer) {
        if let Some(loader) = &self.debug_utils_loader {
            unsafe { loader.cmd_end_debug_utils_label(cb) }
        }
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        commands::begin_rendering(&self.device, cb, info);
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cb) }
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(cb, bind_point, pipeline) }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cb, bind_point, layout, set_index, &[set], &[])
        }
    }

    fn cmd_bind_vertex_buffer(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, offset: u64) {
        unsafe { self.device.cmd_bind_vertex_buffers(cb, 0, &[buffer], &[offset]) }
    }

    fn cmd_set_viewport_scissor(&self, cb: vk::CommandBuffer, extent: vk::Extent2D) {
        commands::set_viewport_scissor(&self.device, cb, extent);
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw(cb, vertex_count, instance_count, 0, 0) }
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cb, x, y, z) }
    }

    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.device.cmd_copy_buffer(cb, src, dst, &[region]) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent3D,
    ) {
        commands::copy_buffer_to_image(&self.device, cb, src, dst, aspect, extent);
    }

    fn cmd_blit_mip(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        src_level: u32,
        src_extent: vk::Extent2D,
        dst_level: u32,
        dst_extent: vk::Extent2D,
        layer_count: u32,
    ) {
        commands::blit_mip(
            &self.device,
            cb,
            image,
            aspect,
            (src_level, src_extent),
            (dst_level, dst_extent),
            layer_count,
        );
    }

    fn submit(&self, queue: QueueKind, batch: &SubmitBatch) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = batch.waits.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = batch.waits.iter().map(|(_, stage)| *stage).collect();
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&batch.command_buffers)
            .signal_semaphores(&batch.signals)
            .build();
        let fence = batch.fence.unwrap_or_else(vk::Fence::null);
        unsafe { self.device.queue_submit(self.queue(queue), &[submit_info], fence) }?;
        debug!(
            "Submitted {} command buffers to the {:?} queue",
            batch.command_buffers.len(),
            queue
        );
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        Ok(unsafe { self.device.device_wait_idle() }?)
    }

    fn surface_extent(&self) -> vk::Extent2D {
        swapchain::surface_extent(self)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, old: Option<vk::SwapchainKHR>) -> Result<SwapchainInfo> {
        swapchain::create(self, desc, old)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<AcquireResult> {
        swapchain::acquire(self, swapchain, signal, timeout)
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        swapchain::present(self, swapchain, image_index, wait)
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        Ok(unsafe { self.device.create_shader_module(&create_info, None) }?)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBindingDesc]) -> Result<vk::DescriptorSetLayout> {
        pipeline::create_descriptor_set_layout(&self.device, bindings)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_bytes: u32,
    ) -> Result<vk::PipelineLayout> {
        pipeline::create_pipeline_layout(&self.device, set_layouts, push_constant_bytes)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(&self, build: &GraphicsPipelineBuild<'_>) -> Result<vk::Pipeline> {
        pipeline::create_graphics_pipeline(&self.device, build)
    }

    fn create_compute_pipeline(&self, layout: vk::PipelineLayout, stage: &ShaderModuleRef<'_>) -> Result<vk::Pipeline> {
        pipeline::create_compute_pipeline(&self.device, layout, stage)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None) }?)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>> {
        pipeline::allocate_descriptor_set(&self.device, pool, layout)
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        pipeline::write_descriptor_set(&self.device, set, writes);
    }
}
