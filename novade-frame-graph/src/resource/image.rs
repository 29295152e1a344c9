//! Images, their views and their per-subresource synchronization state.

use super::{ResourceHandle, SubresourceRange};
use crate::backend::{GpuBackend, ImageInfo, ImageViewInfo, QueueKind, SamplerInfo, Sharing};
use crate::barrier::{
    merge_runs, resolve, return_home, AccessOutcome, BarrierDescriptor, ResourceUsage, StageAccess,
    SyncState,
};
use crate::error::Result;
use crate::memory::{DeviceMemoryAllocator, MemoryHandle};
use ash::vk;
use tracing::debug;

/// How an image's extent is determined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageSize {
    Absolute { width: u32, height: u32 },
    /// A fraction (or multiple) of the swapchain extent, rebuilt on resize.
    SwapchainRelative { scale: f32 },
}

impl ImageSize {
    pub fn resolve(&self, swapchain: vk::Extent2D) -> vk::Extent2D {
        match *self {
            ImageSize::Absolute { width, height } => vk::Extent2D {
                width: width.max(1),
                height: height.max(1),
            },
            ImageSize::SwapchainRelative { scale } => vk::Extent2D {
                width: ((swapchain.width as f32 * scale) as u32).max(1),
                height: ((swapchain.height as f32 * scale) as u32).max(1),
            },
        }
    }

    pub fn is_swapchain_relative(&self) -> bool {
        matches!(self, ImageSize::SwapchainRelative { .. })
    }
}

/// Number of levels in a full mip chain for `extent`.
pub fn full_mip_chain(extent: vk::Extent2D) -> u32 {
    32 - extent.width.max(extent.height).max(1).leading_zeros()
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        f if is_depth_format(f) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Description of an image to create.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub size: ImageSize,
    /// Zero requests the full chain.
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sharing: Sharing,
    pub sampler: Option<SamplerInfo>,
    /// Level 0 texels, uploaded before the first frame that follows creation.
    pub initial_contents: Option<Vec<u8>>,
}

impl ImageDesc {
    pub fn new(
        name: impl Into<String>,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        size: ImageSize,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            usage,
            size,
            mip_levels: 1,
            array_layers: 1,
            sharing: Sharing::Exclusive,
            sampler: None,
            initial_contents: None,
        }
    }

    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    pub fn with_full_mip_chain(self) -> Self {
        self.with_mip_levels(0)
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    pub fn with_sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerInfo) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_contents(mut self, texels: Vec<u8>) -> Self {
        self.initial_contents = Some(texels);
        self
    }

    pub(crate) fn resolved_mip_levels(&self, extent: vk::Extent2D) -> u32 {
        let full = full_mip_chain(extent);
        if self.mip_levels == 0 {
            full
        } else {
            self.mip_levels.min(full)
        }
    }
}

/// Per-subresource synchronization state of one image.
#[derive(Debug, Clone)]
pub struct ImageStateTracker {
    mip_levels: u32,
    array_layers: u32,
    states: Vec<SyncState>,
}

impl ImageStateTracker {
    pub fn new(mip_levels: u32, array_layers: u32, initial: SyncState) -> Self {
        Self {
            mip_levels,
            array_layers,
            states: vec![initial; (mip_levels * array_layers) as usize],
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn state(&self, mip: u32, layer: u32) -> &SyncState {
        &self.states[self.index(mip, layer)]
    }

    pub fn layout(&self, mip: u32, layer: u32) -> vk::ImageLayout {
        self.state(mip, layer).layout
    }

    /// Replaces every subresource state.
    pub fn reset(&mut self, state: SyncState) {
        self.states.iter_mut().for_each(|s| *s = state);
    }

    fn index(&self, mip: u32, layer: u32) -> usize {
        (layer * self.mip_levels + mip) as usize
    }

    fn clamp(&self, range: Option<SubresourceRange>) -> SubresourceRange {
        let full = SubresourceRange::full(self.mip_levels, self.array_layers);
        let range = range.unwrap_or(full);
        let base_mip_level = range.base_mip_level.min(self.mip_levels - 1);
        let base_array_layer = range.base_array_layer.min(self.array_layers - 1);
        SubresourceRange {
            base_mip_level,
            level_count: range.level_count.min(self.mip_levels - base_mip_level),
            base_array_layer,
            layer_count: range.layer_count.min(self.array_layers - base_array_layer),
        }
    }

    /// Computes the barriers that bring `range` to `layout` for an access at
    /// (`stage`, `access`), merging runs of subresources that share a state.
    /// Queue ownership is not considered.
    pub fn transition_to(
        &mut self,
        resource: ResourceHandle,
        range: SubresourceRange,
        layout: vk::ImageLayout,
        access: vk::AccessFlags,
        stage: vk::PipelineStageFlags,
    ) -> Vec<BarrierDescriptor> {
        let usage = ResourceUsage::new(stage, access, layout);
        self.apply(resource, Some(range), &usage, StageAccess::none(), None)
            .barriers
    }

    pub(crate) fn apply(
        &mut self,
        resource: ResourceHandle,
        range: Option<SubresourceRange>,
        usage: &ResourceUsage,
        widen: StageAccess,
        target_family: Option<u32>,
    ) -> AccessOutcome {
        let range = self.clamp(range);
        let mut barriers = Vec::new();
        let mut releases = Vec::new();
        let mut uninitialized_read = false;
        for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
            for mip in range.base_mip_level..range.base_mip_level + range.level_count {
                let index = self.index(mip, layer);
                let resolution = resolve(&self.states[index], usage, widen, true, target_family);
                uninitialized_read |= resolution.uninitialized_read;
                self.states[index] = resolution.next;
                if let Some(t) = resolution.barrier {
                    barriers.push((layer, mip, t));
                }
                if let Some(t) = resolution.release {
                    releases.push((layer, mip, t));
                }
            }
        }
        AccessOutcome {
            barriers: bind(resource, &barriers),
            releases: bind(resource, &releases),
            uninitialized_read,
        }
    }

    pub(crate) fn return_home(
        &mut self,
        resource: ResourceHandle,
        home: u32,
    ) -> (Vec<BarrierDescriptor>, Vec<BarrierDescriptor>) {
        let mut releases = Vec::new();
        let mut acquires = Vec::new();
        for layer in 0..self.array_layers {
            for mip in 0..self.mip_levels {
                let index = self.index(mip, layer);
                if let Some((release, acquire)) = return_home(&mut self.states[index], home) {
                    releases.push((layer, mip, release));
                    acquires.push((layer, mip, acquire));
                }
            }
        }
        (bind(resource, &releases), bind(resource, &acquires))
    }
}

fn bind(
    resource: ResourceHandle,
    entries: &[(u32, u32, crate::barrier::Transition)],
) -> Vec<BarrierDescriptor> {
    merge_runs(entries)
        .into_iter()
        .map(|(range, t)| BarrierDescriptor::from_transition(resource, Some(range), t))
        .collect()
}

/// The device objects behind an image.
#[derive(Debug, Clone)]
pub struct PhysicalImage {
    pub image: vk::Image,
    pub memory: Option<MemoryHandle>,
    pub view: vk::ImageView,
    pub mip_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

impl PhysicalImage {
    /// Creates, binds and views an image. Nothing leaks on failure.
    pub(crate) fn create(
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        desc: &ImageDesc,
        extent: vk::Extent2D,
        mip_levels: u32,
    ) -> Result<Self> {
        let image = backend.create_image(&ImageInfo {
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format: desc.format,
            usage: desc.usage,
            mip_levels,
            array_layers: desc.array_layers,
            sharing: desc.sharing,
        })?;

        let requirements = backend.image_memory_requirements(image);
        let memory = match allocator.allocate_with_fallback(
            backend,
            requirements.size,
            requirements.alignment,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            requirements.memory_type_bits,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                backend.destroy_image(image);
                return Err(e);
            }
        };

        let mut physical = PhysicalImage {
            image,
            memory: Some(memory),
            view: vk::ImageView::null(),
            mip_views: Vec::new(),
            extent,
        };
        if let Err(e) = physical.bind_and_view(backend, allocator, desc, mip_levels) {
            physical.destroy(backend, allocator);
            return Err(e);
        }
        debug!(
            "Created image '{}' {}x{} {:?}, {} mips",
            desc.name, extent.width, extent.height, desc.format, mip_levels
        );
        Ok(physical)
    }

    fn bind_and_view(
        &mut self,
        backend: &dyn GpuBackend,
        allocator: &DeviceMemoryAllocator,
        desc: &ImageDesc,
        mip_levels: u32,
    ) -> Result<()> {
        if let Some(memory) = self.memory {
            let allocation = allocator.get(memory)?;
            backend.bind_image_memory(self.image, allocation.memory, allocation.offset)?;
        }
        let aspect = aspect_for_format(desc.format);
        let view_info = |base_mip_level: u32, level_count: u32| ImageViewInfo {
            format: desc.format,
            aspect,
            base_mip_level,
            level_count,
            base_array_layer: 0,
            layer_count: desc.array_layers,
        };
        self.view = backend.create_image_view(self.image, &view_info(0, mip_levels))?;
        if mip_levels > 1 {
            for level in 0..mip_levels {
                let view = backend.create_image_view(self.image, &view_info(level, 1))?;
                self.mip_views.push(view);
            }
        }
        Ok(())
    }

    /// Destroys the device objects immediately. Callers ensure the GPU is done.
    pub(crate) fn destroy(&mut self, backend: &dyn GpuBackend, allocator: &mut DeviceMemoryAllocator) {
        for view in self.mip_views.drain(..) {
            backend.destroy_image_view(view);
        }
        if self.view != vk::ImageView::null() {
            backend.destroy_image_view(self.view);
            self.view = vk::ImageView::null();
        }
        backend.destroy_image(self.image);
        if let Some(memory) = self.memory.take() {
            allocator.free(backend, memory);
        }
    }
}

/// One image in the arena.
#[derive(Debug)]
pub struct ImageResource {
    pub(crate) desc: ImageDesc,
    pub(crate) physical: PhysicalImage,
    pub(crate) mip_levels: u32,
    pub(crate) sampler: Option<vk::Sampler>,
    pub(crate) state: ImageStateTracker,
    pub(crate) mips_generated: bool,
    pub(crate) last_used_frame: u64,
    pub(crate) last_queue: Option<QueueKind>,
    /// Swap images when this is the backbuffer.
    pub(crate) swap_images: Vec<(vk::Image, vk::ImageView)>,
}

impl ImageResource {
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn raw(&self) -> vk::Image {
        self.physical.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.physical.view
    }

    /// View of a single mip level. Images with one level return the full view.
    pub fn mip_view(&self, level: u32) -> Option<vk::ImageView> {
        if self.mip_levels == 1 && level == 0 {
            return Some(self.physical.view);
        }
        self.physical.mip_views.get(level as usize).copied()
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.physical.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.desc.format)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.desc.array_layers
    }

    pub fn is_backbuffer(&self) -> bool {
        !self.swap_images.is_empty()
    }

    /// Set once the built-in mip generation has run. Never cleared.
    pub fn mips_generated(&self) -> bool {
        self.mips_generated
    }

    pub fn state(&self) -> &ImageStateTracker {
        &self.state
    }

    pub fn last_used_frame(&self) -> u64 {
        self.last_used_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ImageHandle;
    use pretty_assertions::assert_eq;
    use slotmap::SlotMap;

    fn handle() -> ResourceHandle {
        let mut map: SlotMap<ImageHandle, ()> = SlotMap::with_key();
        ResourceHandle::Image(map.insert(()))
    }

    #[test]
    fn relative_sizes_follow_the_swapchain() {
        let size = ImageSize::SwapchainRelative { scale: 0.5 };
        let extent = size.resolve(vk::Extent2D {
            width: 1920,
            height: 1080,
        });
        assert_eq!((extent.width, extent.height), (960, 540));
        let tiny = size.resolve(vk::Extent2D { width: 1, height: 1 });
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(full_mip_chain(vk::Extent2D { width: 256, height: 64 }), 9);
        assert_eq!(full_mip_chain(vk::Extent2D { width: 1, height: 1 }), 1);
        assert_eq!(full_mip_chain(vk::Extent2D { width: 300, height: 200 }), 9);
    }

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_for_format(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn uniform_transition_is_one_descriptor() {
        let resource = handle();
        let mut tracker = ImageStateTracker::new(4, 2, SyncState::default());
        let barriers = tracker.transition_to(
            resource,
            SubresourceRange::full(4, 2),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        );
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, Some(SubresourceRange::full(4, 2)));
        assert_eq!(tracker.layout(3, 1), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn mixed_states_split_into_runs() {
        let resource = handle();
        let mut tracker = ImageStateTracker::new(4, 1, SyncState::default());
        tracker.transition_to(
            resource,
            SubresourceRange::full(4, 1),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        );
        // Mips 0 and 1 become transfer sources, 2 and 3 stay destinations.
        tracker.transition_to(
            resource,
            SubresourceRange {
                base_mip_level: 0,
                level_count: 2,
                base_array_layer: 0,
                layer_count: 1,
            },
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        );
        let barriers = tracker.transition_to(
            resource,
            SubresourceRange::full(4, 1),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barriers[0].range.unwrap().level_count, 2);
        assert_eq!(barriers[1].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[1].range.unwrap().base_mip_level, 2);
    }

    #[test]
    fn layout_already_matching_read_needs_nothing() {
        let resource = handle();
        let mut tracker = ImageStateTracker::new(1, 1, SyncState::default());
        tracker.transition_to(
            resource,
            SubresourceRange::full(1, 1),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        );
        let first = tracker.transition_to(
            resource,
            SubresourceRange::full(1, 1),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );
        let second = tracker.transition_to(
            resource,
            SubresourceRange::full(1, 1),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
