//! Registry of all images and buffers.

use super::buffer::{BufferDesc, BufferResource, MemoryLocation, PhysicalBuffer};
use super::image::{ImageDesc, ImageResource, ImageSize, ImageStateTracker, PhysicalImage};
use super::{BufferHandle, ImageHandle, ResourceHandle, SubresourceRange, TrackedState};
use crate::backend::{GpuBackend, QueueKind, SamplerInfo, Sharing};
use crate::barrier::SyncState;
use crate::error::{RenderGraphError, Result};
use crate::memory::DeviceMemoryAllocator;
use ash::vk;
use slotmap::SlotMap;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A device object waiting for the GPU to finish with it.
#[derive(Debug)]
pub enum RetiredObject {
    Image {
        physical: PhysicalImage,
        sampler: Option<vk::Sampler>,
    },
    Buffer(PhysicalBuffer),
    Pipeline(vk::Pipeline),
    PipelineLayout {
        layout: vk::PipelineLayout,
        set_layout: vk::DescriptorSetLayout,
    },
    Sampler(vk::Sampler),
    ImageView(vk::ImageView),
}

impl RetiredObject {
    pub fn destroy(self, backend: &dyn GpuBackend, allocator: &mut DeviceMemoryAllocator) {
        match self {
            RetiredObject::Image {
                mut physical,
                sampler,
            } => {
                physical.destroy(backend, allocator);
                if let Some(sampler) = sampler {
                    backend.destroy_sampler(sampler);
                }
            }
            RetiredObject::Buffer(physical) => physical.destroy(backend, allocator),
            RetiredObject::Pipeline(pipeline) => backend.destroy_pipeline(pipeline),
            RetiredObject::PipelineLayout { layout, set_layout } => {
                backend.destroy_pipeline_layout(layout);
                backend.destroy_descriptor_set_layout(set_layout);
            }
            RetiredObject::Sampler(sampler) => backend.destroy_sampler(sampler),
            RetiredObject::ImageView(view) => backend.destroy_image_view(view),
        }
    }
}

/// Objects destroyed once the frame that last used them has completed.
#[derive(Debug, Default)]
pub struct RetireQueue {
    entries: Vec<(RetiredObject, u64)>,
}

impl RetireQueue {
    pub fn push(&mut self, object: RetiredObject, last_used_frame: u64) {
        self.entries.push((object, last_used_frame));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroys every entry whose frame is at or below `last_completed_frame`.
    pub fn collect(
        &mut self,
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        last_completed_frame: u64,
    ) -> usize {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(_, frame)| *frame <= last_completed_frame);
        self.entries = pending;
        let count = ready.len();
        for (object, _) in ready {
            object.destroy(backend, allocator);
        }
        if count > 0 {
            debug!(
                "Destroyed {} retired objects (last completed frame {})",
                count, last_completed_frame
            );
        }
        count
    }

    /// Destroys everything. Only valid once the device is idle.
    pub fn drain(&mut self, backend: &dyn GpuBackend, allocator: &mut DeviceMemoryAllocator) {
        for (object, _) in self.entries.drain(..) {
            object.destroy(backend, allocator);
        }
    }
}

/// Initial contents waiting for a staging copy.
#[derive(Debug)]
pub struct PendingUpload {
    pub target: ResourceHandle,
    pub staging: PhysicalBuffer,
    pub size: u64,
}

impl PendingUpload {
    /// Subresources the copy writes.
    pub fn range(&self) -> Option<SubresourceRange> {
        match self.target {
            ResourceHandle::Image(_) => Some(SubresourceRange::mip(0, 1)),
            ResourceHandle::Buffer(_) => None,
        }
    }
}

const BACKBUFFER_NAME: &str = "backbuffer";

#[derive(Debug, Default)]
pub struct ResourceArena {
    images: SlotMap<ImageHandle, ImageResource>,
    buffers: SlotMap<BufferHandle, BufferResource>,
    names: HashMap<String, ResourceHandle>,
    backbuffer: Option<ImageHandle>,
    uploads: Vec<PendingUpload>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim_name(&self, name: &str) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(RenderGraphError::Initialization(format!(
                "a resource named '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    fn stage_contents(
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        name: &str,
        bytes: &[u8],
    ) -> Result<PhysicalBuffer> {
        let staging = PhysicalBuffer::create(
            backend,
            allocator,
            &format!("{}.staging", name),
            bytes.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::HostVisible,
            Sharing::Exclusive,
        )?;
        if let Err(e) = allocator.write(backend, staging.memory, bytes) {
            staging.destroy(backend, allocator);
            return Err(e);
        }
        Ok(staging)
    }

    pub fn create_image(
        &mut self,
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        desc: ImageDesc,
        swapchain_extent: vk::Extent2D,
    ) -> Result<ImageHandle> {
        self.claim_name(&desc.name)?;
        let mut desc = desc;
        if desc.initial_contents.is_some() {
            desc.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        let extent = desc.size.resolve(swapchain_extent);
        let mip_levels = desc.resolved_mip_levels(extent);
        let mut physical = PhysicalImage::create(backend, allocator, &desc, extent, mip_levels)?;

        let sampler = match desc.sampler {
            Some(info) => match backend.create_sampler(&SamplerInfo {
                max_lod: mip_levels,
                ..info
            }) {
                Ok(sampler) => Some(sampler),
                Err(e) => {
                    physical.destroy(backend, allocator);
                    return Err(e);
                }
            },
            None => None,
        };

        let staging = match desc.initial_contents.as_deref() {
            Some(bytes) => match Self::stage_contents(backend, allocator, &desc.name, bytes) {
                Ok(staging) => Some((staging, bytes.len() as u64)),
                Err(e) => {
                    RetiredObject::Image { physical, sampler }.destroy(backend, allocator);
                    return Err(e);
                }
            },
            None => None,
        };

        let name = desc.name.clone();
        let state = ImageStateTracker::new(mip_levels, desc.array_layers, SyncState::default());
        let handle = self.images.insert(ImageResource {
            desc,
            physical,
            mip_levels,
            sampler,
            state,
            mips_generated: false,
            last_used_frame: 0,
            last_queue: None,
            swap_images: Vec::new(),
        });
        if let Some((staging, size)) = staging {
            self.uploads.push(PendingUpload {
                target: handle.into(),
                staging,
                size,
            });
        }
        self.names.insert(name, handle.into());
        Ok(handle)
    }

    pub fn create_buffer(
        &mut self,
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        desc: BufferDesc,
    ) -> Result<BufferHandle> {
        self.claim_name(&desc.name)?;
        let mut usage = desc.usage;
        if desc.initial_contents.is_some() && desc.location == MemoryLocation::DeviceLocal {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        let physical = PhysicalBuffer::create(
            backend,
            allocator,
            &desc.name,
            desc.size,
            usage,
            desc.location,
            desc.sharing,
        )?;

        let mut state = SyncState::default();
        let mut staging = None;
        if let Some(bytes) = desc.initial_contents.as_deref() {
            let written = if physical.host_visible {
                allocator.write(backend, physical.memory, bytes).map(|_| {
                    state = SyncState::host_initialized();
                })
            } else {
                Self::stage_contents(backend, allocator, &desc.name, bytes)
                    .map(|s| staging = Some((s, bytes.len() as u64)))
            };
            if let Err(e) = written {
                physical.destroy(backend, allocator);
                return Err(e);
            }
        }

        let name = desc.name.clone();
        let handle = self.buffers.insert(BufferResource {
            desc,
            physical,
            state,
            last_used_frame: 0,
            last_queue: None,
        });
        if let Some((staging, size)) = staging {
            self.uploads.push(PendingUpload {
                target: handle.into(),
                staging,
                size,
            });
        }
        self.names.insert(name, handle.into());
        Ok(handle)
    }

    pub fn image(&self, handle: ImageHandle) -> Result<&ImageResource> {
        self.images
            .get(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "image" })
    }

    pub(crate) fn image_mut(&mut self, handle: ImageHandle) -> Result<&mut ImageResource> {
        self.images
            .get_mut(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "image" })
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferResource> {
        self.buffers
            .get(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "buffer" })
    }

    pub fn contains(&self, resource: ResourceHandle) -> bool {
        match resource {
            ResourceHandle::Image(h) => self.images.contains_key(h),
            ResourceHandle::Buffer(h) => self.buffers.contains_key(h),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ResourceHandle> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, resource: ResourceHandle) -> &str {
        match resource {
            ResourceHandle::Image(h) => self.images.get(h).map(|i| i.name()),
            ResourceHandle::Buffer(h) => self.buffers.get(h).map(|b| b.name()),
        }
        .unwrap_or("<destroyed>")
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn images(&self) -> impl Iterator<Item = (ImageHandle, &ImageResource)> {
        self.images.iter()
    }

    pub(crate) fn tracked_state(&self, resource: ResourceHandle) -> Result<TrackedState> {
        Ok(match resource {
            ResourceHandle::Image(h) => TrackedState::Image(self.image(h)?.state.clone()),
            ResourceHandle::Buffer(h) => TrackedState::Buffer(self.buffer(h)?.state),
        })
    }

    pub(crate) fn sharing(&self, resource: ResourceHandle) -> Result<Sharing> {
        Ok(match resource {
            ResourceHandle::Image(h) => self.image(h)?.desc.sharing,
            ResourceHandle::Buffer(h) => self.buffer(h)?.desc.sharing,
        })
    }

    pub(crate) fn last_queue(&self, resource: ResourceHandle) -> Result<Option<QueueKind>> {
        Ok(match resource {
            ResourceHandle::Image(h) => self.image(h)?.last_queue,
            ResourceHandle::Buffer(h) => self.buffer(h)?.last_queue,
        })
    }

    pub(crate) fn commit_state(
        &mut self,
        resource: ResourceHandle,
        state: TrackedState,
        queue: Option<QueueKind>,
        frame_number: u64,
    ) {
        match (resource, state) {
            (ResourceHandle::Image(h), TrackedState::Image(tracker)) => {
                if let Some(image) = self.images.get_mut(h) {
                    image.state = tracker;
                    image.last_queue = queue;
                    image.last_used_frame = frame_number;
                }
            }
            (ResourceHandle::Buffer(h), TrackedState::Buffer(sync)) => {
                if let Some(buffer) = self.buffers.get_mut(h) {
                    buffer.state = sync;
                    buffer.last_queue = queue;
                    buffer.last_used_frame = frame_number;
                }
            }
            (resource, _) => warn!("Tracked state kind mismatch for {:?}", resource),
        }
    }

    /// Records a use outside the planner so retirement tests can pin a frame.
    #[cfg(test)]
    pub(crate) fn mark_used(&mut self, resource: ResourceHandle, frame_number: u64) {
        match resource {
            ResourceHandle::Image(h) => {
                if let Some(image) = self.images.get_mut(h) {
                    image.last_used_frame = image.last_used_frame.max(frame_number);
                }
            }
            ResourceHandle::Buffer(h) => {
                if let Some(buffer) = self.buffers.get_mut(h) {
                    buffer.last_used_frame = buffer.last_used_frame.max(frame_number);
                }
            }
        }
    }

    pub fn backbuffer(&self) -> Option<ImageHandle> {
        self.backbuffer
    }

    /// Installs or replaces the swap images behind the backbuffer handle.
    pub(crate) fn set_backbuffer(
        &mut self,
        swap_images: Vec<(vk::Image, vk::ImageView)>,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<ImageHandle> {
        let (image, view) = swap_images.first().copied().ok_or_else(|| {
            RenderGraphError::Initialization("swapchain has no images".to_string())
        })?;
        let physical = PhysicalImage {
            image,
            memory: None,
            view,
            mip_views: Vec::new(),
            extent,
        };
        if let Some(handle) = self.backbuffer {
            let resource = self.image_mut(handle)?;
            resource.physical = physical;
            resource.desc.format = format;
            resource.desc.size = ImageSize::Absolute {
                width: extent.width,
                height: extent.height,
            };
            resource.swap_images = swap_images;
            resource.state.reset(SyncState::default());
            resource.last_queue = None;
            return Ok(handle);
        }

        let desc = ImageDesc::new(
            BACKBUFFER_NAME,
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            ImageSize::Absolute {
                width: extent.width,
                height: extent.height,
            },
        )
        .with_sharing(Sharing::Concurrent);
        self.claim_name(BACKBUFFER_NAME)?;
        let handle = self.images.insert(ImageResource {
            desc,
            physical,
            mip_levels: 1,
            sampler: None,
            state: ImageStateTracker::new(1, 1, SyncState::default()),
            mips_generated: false,
            last_used_frame: 0,
            last_queue: None,
            swap_images,
        });
        self.names.insert(BACKBUFFER_NAME.to_string(), handle.into());
        self.backbuffer = Some(handle);
        Ok(handle)
    }

    /// Points the backbuffer at swap image `index`, freshly acquired.
    pub(crate) fn begin_backbuffer_frame(&mut self, index: u32) -> Result<()> {
        let handle = self
            .backbuffer
            .ok_or(RenderGraphError::InvalidHandle { kind: "backbuffer" })?;
        let resource = self.image_mut(handle)?;
        let (image, view) = resource
            .swap_images
            .get(index as usize)
            .copied()
            .ok_or(RenderGraphError::InvalidHandle { kind: "swap image" })?;
        resource.physical.image = image;
        resource.physical.view = view;
        resource.state.reset(SyncState::acquired_swap_image());
        Ok(())
    }

    /// Puts the backbuffer into the post-acquire state so a frame can be
    /// planned before its swap image is known.
    pub(crate) fn reset_backbuffer_state(&mut self) {
        if let Some(image) = self.backbuffer.and_then(|h| self.images.get_mut(h)) {
            image.state.reset(SyncState::acquired_swap_image());
        }
    }

    pub fn pending_uploads(&self) -> &[PendingUpload] {
        &self.uploads
    }

    pub(crate) fn take_pending_uploads(&mut self) -> Vec<PendingUpload> {
        std::mem::take(&mut self.uploads)
    }

    pub(crate) fn mark_mips_generated(&mut self, handle: ImageHandle) -> Result<()> {
        self.image_mut(handle)?.mips_generated = true;
        Ok(())
    }

    /// Recreates every swapchain-relative image at `extent`. Handles stay
    /// valid; the replaced device objects are returned with their last use.
    ///
    /// All-or-nothing: if any image cannot be created, the ones already made
    /// are destroyed and every resource keeps its current images.
    pub(crate) fn rebuild_relative(
        &mut self,
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        extent: vk::Extent2D,
    ) -> Result<Vec<(ResourceHandle, RetiredObject, u64)>> {
        let targets: Vec<(ImageHandle, vk::Extent2D, u32)> = self
            .images
            .iter()
            .filter(|(_, image)| image.desc.size.is_swapchain_relative() && !image.is_backbuffer())
            .filter_map(|(handle, image)| {
                let new_extent = image.desc.size.resolve(extent);
                let unchanged = new_extent.width == image.physical.extent.width
                    && new_extent.height == image.physical.extent.height;
                (!unchanged).then(|| (handle, new_extent, image.desc.resolved_mip_levels(new_extent)))
            })
            .collect();

        let mut created: Vec<(ImageHandle, PhysicalImage, u32)> = Vec::with_capacity(targets.len());
        for (handle, new_extent, mip_levels) in targets {
            let desc = &self.image(handle)?.desc;
            match PhysicalImage::create(backend, allocator, desc, new_extent, mip_levels) {
                Ok(physical) => created.push((handle, physical, mip_levels)),
                Err(e) => {
                    warn!(
                        "Rebuilding '{}' at {}x{} failed, keeping the current images: {}",
                        desc.name, new_extent.width, new_extent.height, e
                    );
                    for (_, mut physical, _) in created {
                        physical.destroy(backend, allocator);
                    }
                    return Err(e);
                }
            }
        }

        let mut retired = Vec::with_capacity(created.len());
        for (handle, physical, mip_levels) in created {
            let image = self.image_mut(handle)?;
            let old = std::mem::replace(&mut image.physical, physical);
            image.mip_levels = mip_levels;
            image.state = ImageStateTracker::new(mip_levels, image.desc.array_layers, SyncState::default());
            image.last_queue = None;
            debug!(
                "Rebuilt '{}' at {}x{}",
                image.desc.name, image.physical.extent.width, image.physical.extent.height
            );
            retired.push((
                handle.into(),
                RetiredObject::Image {
                    physical: old,
                    sampler: None,
                },
                image.last_used_frame,
            ));
        }
        if !retired.is_empty() {
            info!(
                "Rebuilt {} resolution-dependent images at {}x{}",
                retired.len(),
                extent.width,
                extent.height
            );
        }
        Ok(retired)
    }

    /// Removes a resource. Its handle turns stale at once; the device objects
    /// are returned for deferred destruction together with their last use.
    pub fn destroy(&mut self, resource: ResourceHandle) -> Result<Vec<(RetiredObject, u64)>> {
        if self.backbuffer.is_some() && resource.as_image() == self.backbuffer {
            return Err(RenderGraphError::InvalidHandle { kind: "backbuffer" });
        }
        let (name, object, frame) = match resource {
            ResourceHandle::Image(h) => {
                let image = self
                    .images
                    .remove(h)
                    .ok_or(RenderGraphError::InvalidHandle { kind: "image" })?;
                (
                    image.desc.name,
                    RetiredObject::Image {
                        physical: image.physical,
                        sampler: image.sampler,
                    },
                    image.last_used_frame,
                )
            }
            ResourceHandle::Buffer(h) => {
                let buffer = self
                    .buffers
                    .remove(h)
                    .ok_or(RenderGraphError::InvalidHandle { kind: "buffer" })?;
                (buffer.desc.name, RetiredObject::Buffer(buffer.physical), buffer.last_used_frame)
            }
        };
        self.names.remove(&name);
        let mut retired = vec![(object, frame)];
        if let Some(index) = self.uploads.iter().position(|u| u.target == resource) {
            // Never recorded, so nothing on the GPU references it.
            let upload = self.uploads.swap_remove(index);
            retired.push((RetiredObject::Buffer(upload.staging), 0));
        }
        Ok(retired)
    }

    /// Destroys every device object the arena owns. Only valid once idle.
    pub(crate) fn destroy_all(&mut self, backend: &dyn GpuBackend, allocator: &mut DeviceMemoryAllocator) {
        for upload in self.uploads.drain(..) {
            upload.staging.destroy(backend, allocator);
        }
        for (_, mut image) in self.images.drain() {
            if image.is_backbuffer() {
                continue;
            }
            image.physical.destroy(backend, allocator);
            if let Some(sampler) = image.sampler {
                backend.destroy_sampler(sampler);
            }
        }
        for (_, buffer) in self.buffers.drain() {
            buffer.physical.destroy(backend, allocator);
        }
        self.names.clear();
        self.backbuffer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimConfig, SimulatedDevice};
    use pretty_assertions::assert_eq;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 640,
        height: 480,
    };

    fn setup() -> (SimulatedDevice, DeviceMemoryAllocator, ResourceArena) {
        let device = SimulatedDevice::new(SimConfig::default());
        let allocator = DeviceMemoryAllocator::new(device.memory_properties(), 1024 * 1024);
        (device, allocator, ResourceArena::new())
    }

    fn relative(name: &str, scale: f32) -> ImageDesc {
        ImageDesc::new(
            name,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ImageSize::SwapchainRelative { scale },
        )
    }

    #[test]
    fn names_are_unique() {
        let (device, mut allocator, mut arena) = setup();
        arena
            .create_image(&device, &mut allocator, relative("gbuffer", 1.0), EXTENT)
            .unwrap();
        let duplicate = arena.create_buffer(
            &device,
            &mut allocator,
            BufferDesc::new("gbuffer", 64, vk::BufferUsageFlags::STORAGE_BUFFER),
        );
        assert!(matches!(duplicate, Err(RenderGraphError::Initialization(_))));
        assert_eq!(arena.buffer_count(), 0);
    }

    #[test]
    fn destroyed_handles_go_stale() {
        let (device, mut allocator, mut arena) = setup();
        let handle = arena
            .create_image(&device, &mut allocator, relative("bloom", 0.5), EXTENT)
            .unwrap();
        let retired = arena.destroy(handle.into()).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(arena.image(handle).is_err());
        assert_eq!(arena.name_of(handle.into()), "<destroyed>");
        assert!(arena.lookup("bloom").is_none());
        assert!(matches!(
            arena.destroy(handle.into()),
            Err(RenderGraphError::InvalidHandle { kind: "image" })
        ));
        for (object, _) in retired {
            object.destroy(&device, &mut allocator);
        }
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn device_local_contents_are_staged() {
        let (device, mut allocator, mut arena) = setup();
        let staged = arena
            .create_buffer(
                &device,
                &mut allocator,
                BufferDesc::new("vertices", 48, vk::BufferUsageFlags::VERTEX_BUFFER).with_contents(vec![1; 48]),
            )
            .unwrap();
        let mapped = arena
            .create_buffer(
                &device,
                &mut allocator,
                BufferDesc::new("constants", 16, vk::BufferUsageFlags::UNIFORM_BUFFER)
                    .host_visible()
                    .with_contents(vec![2; 16]),
            )
            .unwrap();
        assert_eq!(arena.pending_uploads().len(), 1);
        assert_eq!(arena.pending_uploads()[0].target, ResourceHandle::from(staged));
        assert!(arena
            .buffer(staged)
            .unwrap()
            .usage()
            .contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(arena.buffer(mapped).unwrap().state().initialized);
        assert!(!arena.buffer(staged).unwrap().state().initialized);
    }

    #[test]
    fn rebuild_only_touches_relative_images_that_changed() {
        let (device, mut allocator, mut arena) = setup();
        let half = arena
            .create_image(&device, &mut allocator, relative("half", 0.5), EXTENT)
            .unwrap();
        let fixed = arena
            .create_image(
                &device,
                &mut allocator,
                ImageDesc::new(
                    "shadow-map",
                    vk::Format::D32_SFLOAT,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                    ImageSize::Absolute {
                        width: 2048,
                        height: 2048,
                    },
                ),
                EXTENT,
            )
            .unwrap();
        assert!(arena.rebuild_relative(&device, &mut allocator, EXTENT).unwrap().is_empty());

        let larger = vk::Extent2D {
            width: 1280,
            height: 960,
        };
        let rebuilt = arena.rebuild_relative(&device, &mut allocator, larger).unwrap();
        let handles: Vec<ResourceHandle> = rebuilt.iter().map(|(h, _, _)| *h).collect();
        assert_eq!(handles, vec![ResourceHandle::from(half)]);
        assert_eq!(
            arena.image(half).unwrap().extent(),
            vk::Extent2D {
                width: 640,
                height: 480
            }
        );
        assert_eq!(
            arena.image(fixed).unwrap().extent(),
            vk::Extent2D {
                width: 2048,
                height: 2048
            }
        );
        for (_, object, _) in rebuilt {
            object.destroy(&device, &mut allocator);
        }
        assert!(device.violations().is_empty());
    }

    #[test]
    fn failed_rebuild_keeps_every_image() {
        let device = SimulatedDevice::new(SimConfig {
            device_heap_size: 6 * 1024 * 1024,
            host_heap_size: 4096,
            ..SimConfig::default()
        });
        let mut allocator = DeviceMemoryAllocator::new(device.memory_properties(), 1024 * 1024);
        let mut arena = ResourceArena::new();
        let quarter = arena
            .create_image(&device, &mut allocator, relative("quarter", 0.25), EXTENT)
            .unwrap();
        let full = arena
            .create_image(&device, &mut allocator, relative("full", 1.0), EXTENT)
            .unwrap();
        let quarter_view = arena.image(quarter).unwrap().view();

        // "quarter" fits its block again, "full" does not fit the heap.
        let larger = vk::Extent2D {
            width: 1280,
            height: 960,
        };
        let result = arena.rebuild_relative(&device, &mut allocator, larger);
        assert!(matches!(result, Err(RenderGraphError::OutOfDeviceMemory { .. })));
        assert_eq!(
            arena.image(quarter).unwrap().extent(),
            vk::Extent2D {
                width: 160,
                height: 120
            }
        );
        assert_eq!(arena.image(quarter).unwrap().view(), quarter_view);
        assert_eq!(arena.image(full).unwrap().extent(), EXTENT);
        assert_eq!(allocator.live_allocations(), 2);
        assert_eq!(device.live_objects(ObjectKind::Image), 2);
        assert!(device.violations().is_empty());
    }
}
