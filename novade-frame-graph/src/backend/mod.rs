//! The seam between the frame graph and the graphics API.
//!
//! [`GpuBackend`] is a thin, object-safe layer over the handful of Vulkan
//! entry points the frame graph needs. Handles are plain `ash::vk` handles so
//! the core works with the same types the real device hands out.
//!
//! Two implementations exist: [`vulkan::VulkanBackend`] drives a real device
//! through `ash`, [`sim::SimulatedDevice`] models one in memory with an
//! asynchronous timeline and is used by the tests and the headless demo.

use crate::barrier::ResolvedBarrier;
use crate::error::Result;
use ash::vk;
use std::ffi::CStr;
use std::time::Duration;

pub mod sim;
pub mod vulkan;

/// The kind of queue a pass is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    pub fn index(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Compute => 1,
            QueueKind::Transfer => 2,
        }
    }
}

/// Queue family indices per queue kind. Kinds without a dedicated family
/// carry the graphics family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn single(family: u32) -> Self {
        Self {
            graphics: family,
            compute: family,
            transfer: family,
        }
    }

    pub fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    /// Distinct family indices in graphics, compute, transfer order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.compute, self.transfer] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: vk::MemoryHeapFlags,
}

/// Owned copy of the physical device memory layout.
#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    pub types: Vec<MemoryType>,
    pub heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    pub fn from_vk(props: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let types = props.memory_types[..props.memory_type_count as usize]
            .iter()
            .map(|t| MemoryType {
                property_flags: t.property_flags,
                heap_index: t.heap_index,
            })
            .collect();
        let heaps = props.memory_heaps[..props.memory_heap_count as usize]
            .iter()
            .map(|h| MemoryHeap {
                size: h.size,
                flags: h.flags,
            })
            .collect();
        Self { types, heaps }
    }
}

/// Sharing mode of an image or buffer across queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sharing {
    /// Owned by one queue family at a time; moving it needs a transfer.
    #[default]
    Exclusive,
    /// Usable from every family the device exposes.
    Concurrent,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sharing: Sharing,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageViewInfo {
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerInfo {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub max_lod: u32,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            max_lod: 0,
        }
    }
}

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Outcome of acquiring a swap image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Outcome of presenting a swap image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Ok,
    /// The surface changed; the swapchain must be rebuilt before the next frame.
    Resized,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Debug, Clone)]
pub struct SwapchainInfo {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
}

/// One queue submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

/// What happens to an attachment's contents when rendering begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttachmentLoad {
    Load,
    ClearColor([f32; 4]),
    ClearDepth(f32),
    DontCare,
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentInfo {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load: AttachmentLoad,
    pub store: bool,
}

/// Dynamic rendering scope.
#[derive(Debug, Clone)]
pub struct RenderingInfo {
    pub extent: vk::Extent2D,
    pub color: Vec<AttachmentInfo>,
    pub depth: Option<AttachmentInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: bool,
    pub vertex_layout: Option<VertexLayout>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend: false,
            vertex_layout: None,
        }
    }
}

pub struct ShaderModuleRef<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: &'a CStr,
}

/// Everything needed to create a graphics pipeline, with formats resolved.
pub struct GraphicsPipelineBuild<'a> {
    pub name: &'a str,
    pub layout: vk::PipelineLayout,
    pub stages: &'a [ShaderModuleRef<'a>],
    pub color_formats: &'a [vk::Format],
    pub depth_format: Option<vk::Format>,
    pub raster: &'a RasterState,
}

/// A descriptor write with handles already resolved.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    Image {
        binding: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        range: u64,
    },
}

/// Operations the frame graph performs on a GPU.
///
/// Creation functions return `Result`; destruction is infallible. Commands
/// (`cmd_*`) are recorded into a command buffer between
/// [`begin_command_buffer`](GpuBackend::begin_command_buffer) and
/// [`end_command_buffer`](GpuBackend::end_command_buffer).
pub trait GpuBackend {
    fn name(&self) -> &str;
    fn queue_families(&self) -> QueueFamilies;
    fn memory_properties(&self) -> MemoryProperties;

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Copies `data` into host-visible memory at `offset`.
    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()>;

    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: u64)
        -> Result<()>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, image: vk::Image, info: &ImageViewInfo) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, info: &SamplerInfo) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags, sharing: Sharing)
        -> Result<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<FenceWait>;
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Resets every command buffer allocated from `pool`.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()>;

    fn cmd_pipeline_barrier(&self, cb: vk::CommandBuffer, barriers: &[ResolvedBarrier]);
    fn cmd_begin_label(&self, cb: vk::CommandBuffer, name: &str);
    fn cmd_end_label(&self, cb: vk::CommandBuffer);
    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo);
    fn cmd_end_rendering(&self, cb: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    );
    fn cmd_bind_vertex_buffer(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, offset: u64);
    fn cmd_set_viewport_scissor(&self, cb: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64);
    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent3D,
    );
    /// Blits mip `src_level` into mip `dst_level` of the same image, all layers.
    #[allow(clippy::too_many_arguments)]
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
    );

    fn submit(&self, queue: QueueKind, batch: &SubmitBatch) -> Result<()>;
    fn device_wait_idle(&self) -> Result<()>;

    /// Current size of the presentation surface.
    fn surface_extent(&self) -> vk::Extent2D;
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<SwapchainInfo>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<AcquireResult>;
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentStatus>;

    /// Creates a module from SPIR-V words that already passed validation.
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBindingDesc],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_bytes: u32,
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, build: &GraphicsPipelineBuild<'_>) -> Result<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        stage: &ShaderModuleRef<'_>,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Returns `Ok(None)` when the pool is exhausted.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>>;
    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_families_deduplicate_fallbacks() {
        assert_eq!(QueueFamilies::single(0).unique(), vec![0]);
        let families = QueueFamilies {
            graphics: 0,
            compute: 2,
            transfer: 0,
        };
        assert_eq!(families.unique(), vec![0, 2]);
        assert_eq!(families.family(QueueKind::Compute), 2);
    }
}
