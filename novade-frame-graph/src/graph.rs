//! The frame graph: pass registration and the per-frame loop.
//!
//! A frame is planned before its swap image is acquired. Planning derives every
//! barrier from the declared accesses, so a pass that reads undefined contents
//! fails the frame without touching the GPU. Recording groups consecutive
//! passes on the same queue into one submission; submissions on different
//! queues are ordered by semaphores along the planner's dependency edges.

use crate::backend::{GpuBackend, PresentStatus, QueueKind, SubmitBatch};
use crate::barrier::{
    validate_ownership_transfers, BarrierDescriptor, BarrierManager, BarrierTarget, FramePlan, MipStep,
    PlanStep, PlannedStep, RecordedStream, ResolvedBarrier, ResourceAccess, ResourceUsage, StageAccess,
};
use crate::config::FrameGraphConfig;
use crate::descriptor::{Binding, DescriptorBinder, DescriptorSetHandle};
use crate::device::{DeviceContext, FrameHandle};
use crate::error::{RenderGraphError, Result};
use crate::pass::{PassBody, PassContext, PassDesc};
use crate::pipeline::{PipelineCache, PipelineDesc, PipelineHandle, ShaderStageDesc};
use crate::resource::{
    BufferDesc, BufferHandle, ImageDesc, ImageHandle, ResourceArena, ResourceHandle, RetiredObject,
    SubresourceRange,
};
use ash::vk;
use std::collections::BTreeSet;
use tracing::{debug, debug_span, error, info, trace, warn};

const PROLOGUE: &str = "frame-prologue";
const EPILOGUE: &str = "frame-epilogue";

/// What happened during one call to [`FrameGraph::run_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_number: u64,
    pub slot: usize,
    pub image_index: u32,
    /// Names of the passes that were recorded, in submission order.
    pub passes_executed: Vec<String>,
    pub barriers_issued: usize,
    pub batches: usize,
    /// The swapchain was rebuilt before the frame was recorded.
    pub resized: bool,
    /// Nothing was submitted because the surface has no area.
    pub skipped: bool,
}

#[derive(Debug)]
struct RegisteredPass {
    desc: PassDesc,
    enabled: bool,
}

/// One submission: consecutive plan steps on the same queue.
#[derive(Debug)]
struct Batch {
    queue: QueueKind,
    steps: Vec<usize>,
    cb: vk::CommandBuffer,
}

fn group_batches(steps: &[PlanStep]) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        match batches.last_mut() {
            Some(batch) if batch.queue == step.queue => batch.steps.push(index),
            _ => batches.push(Batch {
                queue: step.queue,
                steps: vec![index],
                cb: vk::CommandBuffer::null(),
            }),
        }
    }
    batches
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

fn mip_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
    }
}

fn emit_barriers(
    backend: &dyn GpuBackend,
    arena: &ResourceArena,
    cb: vk::CommandBuffer,
    barriers: &[BarrierDescriptor],
) -> Result<()> {
    if barriers.is_empty() {
        return Ok(());
    }
    let resolved = barriers
        .iter()
        .map(|b| b.resolve(arena))
        .collect::<Result<Vec<_>>>()?;
    backend.cmd_pipeline_barrier(cb, &resolved);
    Ok(())
}

fn record_uploads(backend: &dyn GpuBackend, arena: &ResourceArena, cb: vk::CommandBuffer) -> Result<()> {
    for upload in arena.pending_uploads() {
        match upload.target {
            ResourceHandle::Image(handle) => {
                let image = arena.image(handle)?;
                let extent = image.extent();
                backend.cmd_copy_buffer_to_image(
                    cb,
                    upload.staging.buffer,
                    image.raw(),
                    image.aspect(),
                    vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                );
            }
            ResourceHandle::Buffer(handle) => {
                let buffer = arena.buffer(handle)?;
                backend.cmd_copy_buffer(cb, upload.staging.buffer, buffer.raw(), upload.size);
            }
        }
    }
    Ok(())
}

fn record_mips(
    backend: &dyn GpuBackend,
    arena: &ResourceArena,
    cb: vk::CommandBuffer,
    handle: ImageHandle,
    mip_steps: &[MipStep],
) -> Result<()> {
    let image = arena.image(handle)?;
    let extent = image.extent();
    for step in mip_steps {
        emit_barriers(backend, arena, cb, &step.barriers)?;
        backend.cmd_blit_mip(
            cb,
            image.raw(),
            image.aspect(),
            step.src_level,
            mip_extent(extent, step.src_level),
            step.dst_level,
            mip_extent(extent, step.dst_level),
            image.array_layers(),
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn record_pass(
    backend: &dyn GpuBackend,
    arena: &ResourceArena,
    pipelines: &mut PipelineCache,
    descriptors: &DescriptorBinder,
    cb: vk::CommandBuffer,
    pass: &mut PassDesc,
    planned: &PlannedStep,
    frame: &FrameHandle,
) -> Result<()> {
    let PassDesc {
        name,
        queue,
        reads,
        writes,
        body,
        ..
    } = pass;
    let name = name.as_str();
    backend.cmd_begin_label(cb, name);
    let result = match body {
        PassBody::Record(record) => {
            let declared = reads.iter().chain(writes.iter()).copied().collect();
            let mut ctx = PassContext::new(
                backend,
                arena,
                pipelines,
                descriptors,
                cb,
                name,
                *queue,
                declared,
                frame.frame_number,
                frame.extent,
            );
            let result = record(&mut ctx);
            ctx.finish();
            result
        }
        PassBody::GenerateMips(image) => record_mips(backend, arena, cb, *image, &planned.mip_steps),
    };
    backend.cmd_end_label(cb);
    result.map_err(|e| e.in_pass(name))
}

/// Owns the device, the registered passes and everything they bind.
pub struct FrameGraph<B: GpuBackend> {
    passes: Vec<RegisteredPass>,
    pipelines: PipelineCache,
    descriptors: DescriptorBinder,
    barriers: BarrierManager,
    config: FrameGraphConfig,
    pending_resize: Option<vk::Extent2D>,
    needs_rebuild: bool,
    // Dropped last: everything above holds device objects.
    device: DeviceContext<B>,
}

impl<B: GpuBackend> FrameGraph<B> {
    pub fn new(backend: B, config: FrameGraphConfig) -> Result<Self> {
        config.validate()?;
        let device = DeviceContext::new(backend, &config)?;
        let format = device.swapchain_format().unwrap_or(vk::Format::B8G8R8A8_SRGB);
        let barriers = BarrierManager::new(device.families());
        info!(
            "Frame graph ready on '{}' with {} frames in flight",
            device.backend().name(),
            device.frames_in_flight()
        );
        Ok(Self {
            passes: Vec::new(),
            pipelines: PipelineCache::new(format),
            descriptors: DescriptorBinder::default(),
            barriers,
            config,
            pending_resize: None,
            needs_rebuild: false,
            device,
        })
    }

    /// Adds a pass at the end of the execution order.
    pub fn register_pass(&mut self, desc: PassDesc) -> Result<()> {
        desc.validate(self.device.arena())?;
        if self.passes.iter().any(|p| p.desc.name == desc.name) {
            return Err(RenderGraphError::InvalidPass {
                pass: desc.name,
                reason: "a pass with this name is already registered".to_string(),
            });
        }
        let enabled = !self.config.is_pass_disabled(&desc.name);
        if enabled {
            info!("Registered pass '{}' on the {:?} queue", desc.name, desc.queue);
        } else {
            info!("Registered pass '{}' disabled by configuration", desc.name);
        }
        self.passes.push(RegisteredPass { desc, enabled });
        Ok(())
    }

    /// Registers a pass whose setup may fail without ending the session.
    ///
    /// Returns `Ok(false)` when the pass is disabled by configuration or its
    /// setup failed with a recoverable error. Fatal errors are returned.
    pub fn register_optional_pass<F>(&mut self, name: &str, init: F) -> Result<bool>
    where
        F: FnOnce(&mut Self) -> Result<PassDesc>,
    {
        if self.config.is_pass_disabled(name) {
            info!("Optional pass '{}' disabled by configuration", name);
            return Ok(false);
        }
        let registered = init(self).and_then(|desc| self.register_pass(desc));
        match registered {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Optional pass '{}' disabled: {}", name, e);
                Ok(false)
            }
        }
    }

    pub fn set_pass_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let pass = self
            .passes
            .iter_mut()
            .find(|p| p.desc.name == name)
            .ok_or(RenderGraphError::InvalidHandle { kind: "pass" })?;
        if pass.enabled != enabled {
            debug!("Pass '{}' {}", name, if enabled { "enabled" } else { "disabled" });
        }
        pass.enabled = enabled;
        Ok(())
    }

    pub fn is_pass_enabled(&self, name: &str) -> Option<bool> {
        self.passes.iter().find(|p| p.desc.name == name).map(|p| p.enabled)
    }

    /// Registered pass names in execution order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.desc.name.as_str()).collect()
    }

    pub fn remove_pass(&mut self, name: &str) -> Result<PassDesc> {
        let index = self
            .passes
            .iter()
            .position(|p| p.desc.name == name)
            .ok_or(RenderGraphError::InvalidHandle { kind: "pass" })?;
        debug!("Removed pass '{}'", name);
        Ok(self.passes.remove(index).desc)
    }

    pub fn get_resource(&self, name: &str) -> Option<ResourceHandle> {
        self.device.arena().lookup(name)
    }

    pub fn backbuffer(&self) -> Option<ImageHandle> {
        self.device.arena().backbuffer()
    }

    pub fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle> {
        let extent = self.device.extent();
        let (backend, arena, allocator) = self.device.resources_mut();
        arena.create_image(backend, allocator, desc, extent)
    }

    pub fn create_buffer(&mut self, desc: BufferDesc) -> Result<BufferHandle> {
        let (backend, arena, allocator) = self.device.resources_mut();
        arena.create_buffer(backend, allocator, desc)
    }

    /// Destroys a resource once no pass or descriptor set refers to it. Its
    /// device objects stay alive until the frames that used them complete.
    pub fn destroy_resource(&mut self, resource: impl Into<ResourceHandle>) -> Result<()> {
        let resource = resource.into();
        if !self.device.arena().contains(resource) {
            return Err(RenderGraphError::InvalidHandle { kind: "resource" });
        }
        let name = self.device.arena().name_of(resource).to_string();
        if let Some(pass) = self.passes.iter().find(|p| p.desc.uses(resource)) {
            return Err(RenderGraphError::InvalidPass {
                pass: pass.desc.name.clone(),
                reason: format!("still uses '{}'", name),
            });
        }
        if let Some(pipeline) = self.descriptors.bound_by(resource) {
            return Err(RenderGraphError::InvalidPipelineState {
                pipeline: self.pipelines.name(pipeline)?.to_string(),
                reason: format!("a descriptor set still binds '{}'", name),
            });
        }
        self.device.destroy_resource(resource)?;
        debug!("Destroyed resource '{}'", name);
        Ok(())
    }

    /// Records a new surface size. The swapchain is rebuilt at the start of
    /// the next frame; a zero-sized surface pauses rendering.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        debug!("Resize to {}x{} requested", width, height);
        self.pending_resize = Some(vk::Extent2D { width, height });
    }

    pub fn build_pipeline(&mut self, desc: PipelineDesc) -> Result<PipelineHandle> {
        self.pipelines.get_or_build(self.device.backend(), desc)
    }

    /// Invalidates every pipeline built from the shader with `code_hash`. They
    /// are rebuilt on next use.
    pub fn invalidate_shader(&mut self, code_hash: u64) -> usize {
        let count = self.pipelines.invalidate_shader(code_hash);
        self.flush_retired_pipelines();
        count
    }

    /// Swaps a shader stage in every pipeline that uses it.
    pub fn reload_shader(&mut self, old_hash: u64, replacement: ShaderStageDesc) -> Result<usize> {
        let count = self.pipelines.reload_shader(old_hash, replacement)?;
        self.flush_retired_pipelines();
        Ok(count)
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    pub fn pipelines_mut(&mut self) -> &mut PipelineCache {
        &mut self.pipelines
    }

    pub fn build_descriptor_set(
        &mut self,
        pipeline: PipelineHandle,
        bindings: &[Binding],
    ) -> Result<DescriptorSetHandle> {
        self.descriptors.build(
            self.device.backend(),
            &self.pipelines,
            self.device.arena(),
            pipeline,
            bindings,
        )
    }

    pub fn descriptors(&self) -> &DescriptorBinder {
        &self.descriptors
    }

    pub fn device(&self) -> &DeviceContext<B> {
        &self.device
    }

    pub fn backend(&self) -> &B {
        self.device.backend()
    }

    pub fn config(&self) -> &FrameGraphConfig {
        &self.config
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        self.flush_retired_pipelines();
        self.device.wait_idle()
    }

    fn flush_retired_pipelines(&mut self) {
        for (object, last_used) in self.pipelines.take_retired() {
            self.device.retire(object, last_used);
        }
    }

    fn rebuild(&mut self, extent: vk::Extent2D) -> Result<()> {
        info!("Rebuilding swapchain at {}x{}", extent.width, extent.height);
        // Stays set until a rebuild goes through, so a failed one is retried.
        self.needs_rebuild = true;
        let changed = self.device.rebuild_swapchain(extent)?;
        if let Some(format) = self.device.swapchain_format() {
            self.pipelines.set_backbuffer_format(format);
        }
        self.descriptors
            .refresh(self.device.backend(), self.device.arena(), &changed)?;
        self.flush_retired_pipelines();
        self.needs_rebuild = false;
        Ok(())
    }

    fn skipped_report(&self) -> FrameReport {
        let scheduler = self.device.scheduler();
        FrameReport {
            frame_number: scheduler.frame_counter(),
            slot: scheduler.current(),
            image_index: 0,
            passes_executed: Vec::new(),
            barriers_issued: 0,
            batches: 0,
            resized: false,
            skipped: true,
        }
    }

    /// Plans, records, submits and presents one frame.
    ///
    /// A failing pass ends the frame with [`RenderGraphError::PassFailed`];
    /// the swap image is still presented so the next frame starts clean.
    /// [`RenderGraphError::is_fatal`] errors end the session.
    pub fn run_frame(&mut self) -> Result<FrameReport> {
        self.flush_retired_pipelines();
        let mut resized = false;
        if let Some(extent) = self.pending_resize {
            if is_zero(extent) {
                trace!("Surface has no area; skipping frame");
                return Ok(self.skipped_report());
            }
            self.pending_resize = None;
            self.rebuild(extent)?;
            resized = true;
        } else if self.needs_rebuild || !self.device.has_swapchain() {
            let extent = self.device.backend().surface_extent();
            if is_zero(extent) {
                trace!("Surface has no area; skipping frame");
                return Ok(self.skipped_report());
            }
            self.rebuild(extent)?;
            resized = true;
        }

        match self.execute_frame(resized) {
            Err(RenderGraphError::ResizeRequired) => {
                let extent = self.device.backend().surface_extent();
                if is_zero(extent) {
                    self.needs_rebuild = true;
                    return Ok(self.skipped_report());
                }
                debug!("Swapchain out of date; retrying frame after rebuild");
                self.rebuild(extent)?;
                self.execute_frame(true)
            }
            other => other,
        }
    }

    fn schedule(&self) -> Result<Vec<usize>> {
        let arena = self.device.arena();
        let mut scheduled = Vec::with_capacity(self.passes.len());
        for (index, pass) in self.passes.iter().enumerate() {
            if !pass.enabled {
                continue;
            }
            if let Some(image) = pass.desc.mip_target() {
                if arena.image(image)?.mips_generated() {
                    trace!("Skipping '{}': mip chain already generated", pass.desc.name);
                    continue;
                }
            }
            scheduled.push(index);
        }
        Ok(scheduled)
    }

    /// Prologue (staging uploads), the scheduled passes, then the epilogue
    /// that hands the backbuffer to presentation.
    fn plan_steps(&self, scheduled: &[usize], backbuffer: ImageHandle) -> Vec<PlanStep> {
        let uploads = self
            .device
            .arena()
            .pending_uploads()
            .iter()
            .map(|upload| ResourceAccess {
                resource: upload.target,
                usage: ResourceUsage::transfer_write(),
                range: upload.range(),
            })
            .collect();
        let mut steps = Vec::with_capacity(scheduled.len() + 2);
        steps.push(PlanStep::new(PROLOGUE, QueueKind::Graphics, uploads));
        for &index in scheduled {
            let desc = &self.passes[index].desc;
            let mut step = PlanStep::new(desc.name.clone(), desc.queue, desc.accesses().copied().collect());
            step.generate_mips = desc.mip_target();
            step.strict = desc.is_strict();
            steps.push(step);
        }
        let mut epilogue = PlanStep::new(
            EPILOGUE,
            QueueKind::Graphics,
            vec![ResourceAccess::new(backbuffer, ResourceUsage::present())],
        );
        epilogue.strict = false;
        steps.push(epilogue);
        steps
    }

    fn execute_frame(&mut self, resized: bool) -> Result<FrameReport> {
        let backbuffer = self
            .device
            .arena()
            .backbuffer()
            .ok_or(RenderGraphError::ResizeRequired)?;
        let scheduled = self.schedule()?;
        self.device.arena_mut().reset_backbuffer_state();
        let steps = self.plan_steps(&scheduled, backbuffer);
        let plan = self.barriers.plan(self.device.arena(), &steps)?;

        let frame = self.device.acquire_frame()?;
        let span = debug_span!("frame", number = frame.frame_number, slot = frame.slot);
        let _enter = span.enter();

        let submits = match self.record_frame(&frame, &steps, &scheduled, &plan, backbuffer) {
            Ok(submits) => submits,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.abandon_frame(frame, &e)?;
                return Err(e);
            }
        };
        let batches = submits.len();
        self.device.submit_frame(&frame, submits)?;

        let frame_number = frame.frame_number;
        let barriers_issued = plan.barrier_count();
        plan.commit(self.device.arena_mut(), frame_number);
        for upload in self.device.arena_mut().take_pending_uploads() {
            self.device.retire(RetiredObject::Buffer(upload.staging), frame_number);
        }
        let mut passes_executed = Vec::with_capacity(scheduled.len());
        for &index in &scheduled {
            let desc = &self.passes[index].desc;
            if let Some(image) = desc.mip_target() {
                self.device.arena_mut().mark_mips_generated(image)?;
            }
            passes_executed.push(desc.name.clone());
        }

        self.present(frame)?;
        trace!(
            "Frame {} done: {} passes, {} barriers, {} batches",
            frame_number,
            passes_executed.len(),
            barriers_issued,
            batches
        );
        Ok(FrameReport {
            frame_number,
            slot: frame.slot,
            image_index: frame.image_index,
            passes_executed,
            barriers_issued,
            batches,
            resized,
            skipped: false,
        })
    }

    fn record_frame(
        &mut self,
        frame: &FrameHandle,
        steps: &[PlanStep],
        scheduled: &[usize],
        plan: &FramePlan,
        backbuffer: ImageHandle,
    ) -> Result<Vec<(QueueKind, SubmitBatch)>> {
        let mut batches = group_batches(steps);
        for batch in &mut batches {
            batch.cb = self.device.command_buffer(frame, batch.queue)?;
        }
        let families = self.device.families();
        let epilogue = steps.len() - 1;

        {
            let Self {
                passes,
                pipelines,
                descriptors,
                device,
                ..
            } = self;
            let backend: &dyn GpuBackend = device.backend();
            let arena = device.arena();
            let mut streams: Vec<RecordedStream> = Vec::new();
            for batch in &batches {
                let family = families.family(batch.queue);
                let stream = match streams.iter().position(|s| s.queue_family == family) {
                    Some(i) => i,
                    None => {
                        streams.push(RecordedStream {
                            queue_family: family,
                            barriers: Vec::new(),
                        });
                        streams.len() - 1
                    }
                };
                for &index in &batch.steps {
                    let planned = &plan.steps[index];
                    emit_barriers(backend, arena, batch.cb, &planned.pre)?;
                    streams[stream].barriers.extend_from_slice(&planned.pre);
                    if index == 0 {
                        record_uploads(backend, arena, batch.cb)?;
                    } else if index < epilogue {
                        let pass = &mut passes[scheduled[index - 1]].desc;
                        record_pass(backend, arena, pipelines, descriptors, batch.cb, pass, planned, frame)?;
                    }
                    emit_barriers(backend, arena, batch.cb, &planned.post)?;
                    streams[stream].barriers.extend_from_slice(&planned.post);
                }
                backend.end_command_buffer(batch.cb)?;
            }
            validate_ownership_transfers(&streams, arena)?;
        }

        let mut batch_of = vec![0; steps.len()];
        for (i, batch) in batches.iter().enumerate() {
            for &step in &batch.steps {
                batch_of[step] = i;
            }
        }
        let mut edges = BTreeSet::new();
        for (index, planned) in plan.steps.iter().enumerate() {
            for &dep in &planned.depends_on {
                if batch_of[dep] != batch_of[index] {
                    edges.insert((batch_of[dep], batch_of[index]));
                }
            }
        }
        let last = batches.len() - 1;
        for queue in QueueKind::ALL {
            if queue == batches[last].queue {
                continue;
            }
            if let Some(i) = batches.iter().rposition(|b| b.queue == queue) {
                edges.insert((i, last));
            }
        }

        let sync = self.device.frame_sync(frame);
        let mut submits: Vec<(QueueKind, SubmitBatch)> = batches
            .iter()
            .map(|b| {
                (
                    b.queue,
                    SubmitBatch {
                        command_buffers: vec![b.cb],
                        ..SubmitBatch::default()
                    },
                )
            })
            .collect();
        for (src, dst) in edges {
            let semaphore = self.device.edge_semaphore()?;
            submits[src].1.signals.push(semaphore);
            submits[dst]
                .1
                .waits
                .push((semaphore, vk::PipelineStageFlags::ALL_COMMANDS));
        }
        let backbuffer = ResourceHandle::from(backbuffer);
        if let Some(first) = batches
            .iter()
            .position(|b| b.steps.iter().any(|&i| steps[i].accesses.iter().any(|a| a.resource == backbuffer)))
        {
            submits[first]
                .1
                .waits
                .push((sync.image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        }
        submits[last].1.signals.push(sync.render_finished);
        Ok(submits)
    }

    /// Presents the acquired swap image untouched so the slot's semaphores
    /// and fence complete their cycle.
    fn abandon_frame(&mut self, frame: FrameHandle, cause: &RenderGraphError) -> Result<()> {
        warn!("Abandoning frame {}: {}", frame.frame_number, cause);
        let cb = self.device.command_buffer(&frame, QueueKind::Graphics)?;
        let arena = self.device.arena();
        if let Some(handle) = arena.backbuffer() {
            let image = arena.image(handle)?;
            let barrier = ResolvedBarrier {
                target: BarrierTarget::Image {
                    image: image.raw(),
                    range: SubresourceRange::full(1, 1).to_vk(vk::ImageAspectFlags::COLOR),
                },
                src: StageAccess::new(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT, vk::AccessFlags::empty()),
                dst: StageAccess::new(vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            };
            self.device.backend().cmd_pipeline_barrier(cb, &[barrier]);
        }
        self.device.backend().end_command_buffer(cb)?;
        let sync = self.device.frame_sync(&frame);
        self.device.submit_frame(
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
        )?;
        self.present(frame)
    }

    fn present(&mut self, frame: FrameHandle) -> Result<()> {
        match self.device.present(frame) {
            Ok(PresentStatus::Ok) => Ok(()),
            Ok(PresentStatus::Resized) | Err(RenderGraphError::ResizeRequired) => {
                debug!("Surface changed at present; rebuilding before the next frame");
                self.needs_rebuild = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl<B: GpuBackend> Drop for FrameGraph<B> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Wait idle failed while dropping the frame graph: {}", e);
        }
        self.descriptors.destroy_all(self.device.backend());
        self.pipelines.destroy_all(self.device.backend());
    }
}
