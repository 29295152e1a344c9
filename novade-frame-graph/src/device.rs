//! Device context: the backend, frame-slot ring, swap targets and resource storage.

use crate::backend::{
    AcquireResult, GpuBackend, ImageViewInfo, PresentStatus, QueueFamilies, QueueKind, SubmitBatch,
    SwapchainDesc, SwapchainInfo,
};
use crate::config::{FrameGraphConfig, RendererConfig};
use crate::error::{RenderGraphError, Result};
use crate::memory::DeviceMemoryAllocator;
use crate::resource::arena::RetireQueue;
use crate::resource::{ResourceArena, ResourceHandle, RetiredObject};
use crate::sync::{FenceScheduler, FrameSync};
use ash::vk;
use tracing::{debug, error, info, warn};

/// The frame currently being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    pub slot: usize,
    pub frame_number: u64,
    pub image_index: u32,
    pub extent: vk::Extent2D,
}

/// Command buffers of one queue kind in one frame slot.
#[derive(Debug)]
struct CommandRing {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next: usize,
}

impl CommandRing {
    fn new(backend: &dyn GpuBackend, family: u32) -> Result<Self> {
        Ok(Self {
            pool: backend.create_command_pool(family)?,
            buffers: Vec::new(),
            next: 0,
        })
    }

    fn reset(&mut self, backend: &dyn GpuBackend) -> Result<()> {
        if self.next > 0 {
            backend.reset_command_pool(self.pool)?;
        }
        self.next = 0;
        Ok(())
    }

    fn begin_next(&mut self, backend: &dyn GpuBackend) -> Result<vk::CommandBuffer> {
        if self.next == self.buffers.len() {
            self.buffers.push(backend.allocate_command_buffer(self.pool)?);
        }
        let cb = self.buffers[self.next];
        self.next += 1;
        backend.begin_command_buffer(cb)?;
        Ok(cb)
    }
}

#[derive(Debug)]
struct Swapchain {
    info: SwapchainInfo,
    views: Vec<vk::ImageView>,
}

/// Owns the backend and everything whose lifetime is tied to the device.
pub struct DeviceContext<B: GpuBackend> {
    backend: B,
    families: QueueFamilies,
    renderer: RendererConfig,
    scheduler: FenceScheduler,
    commands: Vec<[CommandRing; 3]>,
    swapchain: Option<Swapchain>,
    arena: ResourceArena,
    allocator: DeviceMemoryAllocator,
    retired: RetireQueue,
    extent: vk::Extent2D,
}

impl<B: GpuBackend> std::fmt::Debug for DeviceContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.name())
            .field("families", &self.families)
            .field("extent", &self.extent)
            .field("frames_in_flight", &self.scheduler.frames_in_flight())
            .finish()
    }
}

impl<B: GpuBackend> DeviceContext<B> {
    pub fn new(backend: B, config: &FrameGraphConfig) -> Result<Self> {
        config.validate()?;
        let renderer = config.renderer.clone();
        let families = backend.queue_families();
        let allocator =
            DeviceMemoryAllocator::new(backend.memory_properties(), config.memory.block_size_bytes());
        let scheduler = FenceScheduler::new(
            &backend,
            renderer.frames_in_flight as usize,
            renderer.fence_timeout(),
        )?;

        let mut commands = Vec::with_capacity(renderer.frames_in_flight as usize);
        for _ in 0..renderer.frames_in_flight {
            commands.push([
                CommandRing::new(&backend, families.graphics)?,
                CommandRing::new(&backend, families.compute)?,
                CommandRing::new(&backend, families.transfer)?,
            ]);
        }

        let mut context = Self {
            backend,
            families,
            renderer,
            scheduler,
            commands,
            swapchain: None,
            arena: ResourceArena::new(),
            allocator,
            retired: RetireQueue::default(),
            extent: vk::Extent2D::default(),
        };

        let extent = context.backend.surface_extent();
        if extent.width > 0 && extent.height > 0 {
            context.create_swapchain(extent)?;
        } else {
            warn!("Surface has zero size; swapchain creation deferred");
        }
        info!(
            "Device context ready on '{}': {} frames in flight, families {:?}",
            context.backend.name(),
            context.scheduler.frames_in_flight(),
            context.families
        );
        Ok(context)
    }

    fn create_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
        let old = self.swapchain.take();
        let info = self.backend.create_swapchain(
            &SwapchainDesc {
                extent,
                image_count: self.renderer.swapchain_images,
                present_mode: self.renderer.present_mode.to_vk(),
            },
            old.as_ref().map(|s| s.info.handle),
        )?;
        if let Some(old) = old {
            self.destroy_swapchain(old);
        }

        let mut views = Vec::with_capacity(info.images.len());
        for image in &info.images {
            let view = self.backend.create_image_view(
                *image,
                &ImageViewInfo {
                    format: info.format,
                    aspect: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
            );
            match view {
                Ok(view) => views.push(view),
                Err(e) => {
                    self.destroy_swapchain(Swapchain { info, views });
                    return Err(e);
                }
            }
        }
        self.arena.set_backbuffer(
            info.images.iter().copied().zip(views.iter().copied()).collect(),
            info.format,
            info.extent,
        )?;
        info!(
            "Swapchain created: {}x{}, {} images, {:?}",
            info.extent.width,
            info.extent.height,
            info.images.len(),
            info.format
        );
        self.extent = info.extent;
        self.swapchain = Some(Swapchain { info, views });
        Ok(())
    }

    fn destroy_swapchain(&self, swapchain: Swapchain) {
        for view in swapchain.views {
            self.backend.destroy_image_view(view);
        }
        self.backend.destroy_swapchain(swapchain.info.handle);
    }

    /// Reclaims the current slot and acquires a swap image for it.
    pub fn acquire_frame(&mut self) -> Result<FrameHandle> {
        let slot = self.scheduler.current();
        self.scheduler.reclaim(&self.backend).map_err(|e| match e {
            RenderGraphError::Timeout { slot, waited } => {
                error!("Frame slot {} timed out after {:?}; treating the device as lost", slot, waited);
                RenderGraphError::DeviceLost(format!(
                    "fence of frame slot {} not signaled after {:?}",
                    slot, waited
                ))
            }
            e => e,
        })?;
        self.scheduler.poll(&self.backend)?;
        self.collect_retired();
        for ring in &mut self.commands[slot] {
            ring.reset(&self.backend)?;
        }

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or(RenderGraphError::ResizeRequired)?;
        let sync = *self.scheduler.sync(slot);
        let image_index = match self.backend.acquire_next_image(
            swapchain.info.handle,
            sync.image_available,
            self.renderer.fence_timeout(),
        )? {
            AcquireResult::Acquired { index, suboptimal } => {
                if suboptimal {
                    debug!("Acquired suboptimal swap image {}", index);
                }
                index
            }
            AcquireResult::OutOfDate => {
                debug!("Swapchain out of date at acquire");
                return Err(RenderGraphError::ResizeRequired);
            }
        };

        let frame_number = self.scheduler.begin(&self.backend)?;
        self.arena.begin_backbuffer_frame(image_index)?;
        Ok(FrameHandle {
            slot,
            frame_number,
            image_index,
            extent: self.extent,
        })
    }

    /// Begins a command buffer of the frame's slot for `queue`.
    pub fn command_buffer(&mut self, frame: &FrameHandle, queue: QueueKind) -> Result<vk::CommandBuffer> {
        self.commands[frame.slot][queue.index()].begin_next(&self.backend)
    }

    /// A fresh semaphore for a queue-to-queue edge of the current frame.
    pub fn edge_semaphore(&mut self) -> Result<vk::Semaphore> {
        self.scheduler.edge_semaphore(&self.backend)
    }

    pub fn frame_sync(&self, frame: &FrameHandle) -> FrameSync {
        *self.scheduler.sync(frame.slot)
    }

    /// Submits the frame's batches in order. The slot fence goes on the last one.
    pub fn submit_frame(&mut self, frame: &FrameHandle, mut batches: Vec<(QueueKind, SubmitBatch)>) -> Result<()> {
        let fence = self.scheduler.sync(frame.slot).in_flight_fence;
        match batches.last_mut() {
            Some((_, batch)) => batch.fence = Some(fence),
            None => batches.push((
                QueueKind::Graphics,
                SubmitBatch {
                    fence: Some(fence),
                    ..SubmitBatch::default()
                },
            )),
        }
        for (queue, batch) in &batches {
            self.backend.submit(*queue, batch)?;
        }
        self.scheduler.mark_submitted();
        debug!(
            "Frame {} submitted in {} batches on slot {}",
            frame.frame_number,
            batches.len(),
            frame.slot
        );
        Ok(())
    }

    /// Presents the frame's swap image and moves to the next slot.
    pub fn present(&mut self, frame: FrameHandle) -> Result<PresentStatus> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or(RenderGraphError::ResizeRequired)?;
        let wait = self.scheduler.sync(frame.slot).render_finished;
        let status = self.backend.present(swapchain.info.handle, frame.image_index, wait);
        self.scheduler.advance();
        status
    }

    /// Recreates the swapchain and every resolution-dependent image at `extent`.
    /// Returns the resources whose views changed.
    pub fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> Result<Vec<ResourceHandle>> {
        self.wait_idle()?;
        if extent.width == 0 || extent.height == 0 {
            debug!("Ignoring rebuild to a zero-sized extent");
            return Ok(Vec::new());
        }
        self.create_swapchain(extent)?;
        let rebuilt = self
            .arena
            .rebuild_relative(&self.backend, &mut self.allocator, self.extent)?;
        let mut handles = Vec::with_capacity(rebuilt.len() + 1);
        if let Some(backbuffer) = self.arena.backbuffer() {
            handles.push(backbuffer.into());
        }
        for (handle, object, last_used) in rebuilt {
            self.retired.push(object, last_used);
            handles.push(handle);
        }
        self.collect_retired();
        Ok(handles)
    }

    /// Blocks until the device is idle and destroys everything retired.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.backend.device_wait_idle()?;
        self.scheduler.mark_all_complete();
        self.collect_retired();
        Ok(())
    }

    pub fn retire(&mut self, object: RetiredObject, last_used_frame: u64) {
        self.retired.push(object, last_used_frame);
    }

    /// Destroys retired objects whose last frame has completed.
    pub fn collect_retired(&mut self) -> usize {
        self.retired.collect(
            &self.backend,
            &mut self.allocator,
            self.scheduler.last_completed_frame(),
        )
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Removes a resource; its device objects outlive the frames using them.
    pub fn destroy_resource(&mut self, resource: ResourceHandle) -> Result<()> {
        for (object, last_used) in self.arena.destroy(resource)? {
            self.retired.push(object, last_used);
        }
        Ok(())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ResourceArena {
        &mut self.arena
    }

    pub fn allocator(&self) -> &DeviceMemoryAllocator {
        &self.allocator
    }

    /// Split borrow for creating resources.
    pub fn resources_mut(&mut self) -> (&B, &mut ResourceArena, &mut DeviceMemoryAllocator) {
        (&self.backend, &mut self.arena, &mut self.allocator)
    }

    pub fn scheduler(&self) -> &FenceScheduler {
        &self.scheduler
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn has_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    pub fn swapchain_format(&self) -> Option<vk::Format> {
        self.swapchain.as_ref().map(|s| s.info.format)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.scheduler.frames_in_flight()
    }
}

impl<B: GpuBackend> Drop for DeviceContext<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.device_wait_idle() {
            error!("Device wait idle failed during teardown: {}", e);
        }
        self.retired.drain(&self.backend, &mut self.allocator);
        self.arena.destroy_all(&self.backend, &mut self.allocator);
        if let Some(swapchain) = self.swapchain.take() {
            self.destroy_swapchain(swapchain);
        }
        for rings in self.commands.drain(..) {
            for ring in rings {
                self.backend.destroy_command_pool(ring.pool);
            }
        }
        self.scheduler.destroy(&self.backend);
        self.allocator.destroy_all(&self.backend);
        debug!("Device context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimConfig, SimulatedDevice};
    use crate::resource::{ImageDesc, ImageSize};
    use pretty_assertions::assert_eq;

    fn context() -> DeviceContext<SimulatedDevice> {
        DeviceContext::new(SimulatedDevice::new(SimConfig::default()), &FrameGraphConfig::default()).unwrap()
    }

    fn present_empty_frame(ctx: &mut DeviceContext<SimulatedDevice>) -> FrameHandle {
        let frame = ctx.acquire_frame().unwrap();
        let sync = ctx.frame_sync(&frame);
        let cb = ctx.command_buffer(&frame, QueueKind::Graphics).unwrap();
        ctx.backend().end_command_buffer(cb).unwrap();
        ctx.submit_frame(
            &frame,
            vec![(
                QueueKind::Graphics,
                SubmitBatch {
                    command_buffers: vec![cb],
                    waits: vec![(sync.image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
                    signals: vec![sync.render_finished],
                    fence: None,
                },
            )],
        )
        .unwrap();
        ctx.present(frame).unwrap();
        frame
    }

    #[test]
    fn ring_cycles_through_slots() {
        let mut ctx = context();
        let slots: Vec<usize> = (0..6).map(|_| present_empty_frame(&mut ctx).slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(ctx.scheduler().frame_counter(), 6);
        assert!(ctx.backend().violations().is_empty());
    }

    #[test]
    fn retired_objects_wait_for_their_frame() {
        let mut ctx = context();
        let (backend, arena, allocator) = ctx.resources_mut();
        let handle = arena
            .create_image(
                backend,
                allocator,
                ImageDesc::new(
                    "scratch",
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ImageUsageFlags::SAMPLED,
                    ImageSize::Absolute { width: 4, height: 4 },
                ),
                vk::Extent2D { width: 4, height: 4 },
            )
            .unwrap();
        let frame = present_empty_frame(&mut ctx);
        ctx.arena_mut().mark_used(handle.into(), frame.frame_number);
        ctx.destroy_resource(handle.into()).unwrap();
        assert_eq!(ctx.collect_retired(), 0);
        assert_eq!(ctx.retired_count(), 1);
        ctx.wait_idle().unwrap();
        assert_eq!(ctx.retired_count(), 0);
        assert_eq!(ctx.backend().live_objects(ObjectKind::Image), 0);
    }

    #[test]
    fn out_of_date_swapchain_requires_rebuild() {
        let mut ctx = context();
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        ctx.backend().inject_resize(extent);
        assert!(matches!(ctx.acquire_frame(), Err(RenderGraphError::ResizeRequired)));
        ctx.rebuild_swapchain(extent).unwrap();
        assert_eq!(ctx.extent(), extent);
        present_empty_frame(&mut ctx);
        assert!(ctx.backend().violations().is_empty());
    }

    #[test]
    fn hung_fence_is_reported_as_device_loss() {
        let mut ctx = context();
        for _ in 0..3 {
            present_empty_frame(&mut ctx);
        }
        ctx.backend().hang();
        let err = ctx.acquire_frame().unwrap_err();
        assert!(matches!(err, RenderGraphError::DeviceLost(_)));
        assert!(err.is_fatal());
    }
}
