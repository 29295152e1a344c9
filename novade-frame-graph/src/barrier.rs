//! Barrier derivation from declared accesses.
//!
//! Every pass declares how it touches each resource as a [`ResourceUsage`]
//! (pipeline stage, access mask, image layout). The [`BarrierManager`] walks a
//! frame's passes in order against the tracked [`SyncState`] of each resource
//! and emits the smallest set of barriers that orders them:
//!
//! | previous | next  | barrier                                              |
//! |----------|-------|------------------------------------------------------|
//! | read     | read  | none if the writer's data is already visible to it   |
//! | write    | read  | memory barrier, widened over following reads         |
//! | read     | write | execution barrier from the readers' stages           |
//! | write    | write | memory barrier from the last writer                  |
//! | any      | new layout | image barrier (counts as a write)               |
//!
//! An exclusively owned resource that moves to another queue family gets a
//! release barrier after its last access on the source queue and an acquire
//! barrier before its first access on the destination queue. Resources that
//! end a frame owned by a non-graphics family are handed back to the graphics
//! family, so every frame starts with a single owner per resource.
//!
//! Planning works on an overlay of the committed state. Nothing changes in the
//! arena until [`FramePlan::commit`] runs after a successful submission.

use crate::backend::{QueueFamilies, QueueKind, Sharing};
use crate::error::{RenderGraphError, Result};
use crate::resource::{ImageHandle, ResourceArena, ResourceHandle, SubresourceRange, TrackedState};
use ash::vk;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

fn write_access_mask() -> vk::AccessFlags {
    vk::AccessFlags::SHADER_WRITE
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        | vk::AccessFlags::TRANSFER_WRITE
        | vk::AccessFlags::HOST_WRITE
        | vk::AccessFlags::MEMORY_WRITE
}

fn without(flags: vk::AccessFlags, removed: vk::AccessFlags) -> vk::AccessFlags {
    vk::AccessFlags::from_raw(flags.as_raw() & !removed.as_raw())
}

/// A pipeline stage mask paired with an access mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageAccess {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl StageAccess {
    pub fn new(stages: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        Self { stages, access }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn union(self, other: StageAccess) -> Self {
        Self {
            stages: self.stages | other.stages,
            access: self.access | other.access,
        }
    }

    /// Whether an access at `other` is already covered by this visibility scope.
    pub fn covers(&self, other: &StageAccess) -> bool {
        let stages = self.stages.contains(vk::PipelineStageFlags::ALL_COMMANDS)
            || self.stages.contains(other.stages);
        if !stages {
            return false;
        }
        let mut missing = without(other.access, self.access);
        if self.access.contains(vk::AccessFlags::MEMORY_READ) {
            missing = vk::AccessFlags::from_raw(missing.as_raw() & write_access_mask().as_raw());
        }
        if self.access.contains(vk::AccessFlags::MEMORY_WRITE) {
            missing = without(missing, write_access_mask());
        }
        missing.is_empty()
    }
}

/// How a pass touches a resource.
///
/// For buffers the layout is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceUsage {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

impl ResourceUsage {
    pub fn new(
        stage: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
        }
    }

    pub fn color_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
    }

    pub fn depth_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
    }

    /// Depth test without writes.
    pub fn depth_attachment_read() -> Self {
        Self::new(
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        )
    }

    pub fn depth_sampled() -> Self {
        Self::new(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        )
    }

    pub fn fragment_sampled() -> Self {
        Self::new(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    pub fn compute_sampled() -> Self {
        Self::new(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    pub fn compute_storage_read() -> Self {
        Self::new(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::GENERAL,
        )
    }

    pub fn compute_storage_write() -> Self {
        Self::new(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
        )
    }

    pub fn compute_storage_read_write() -> Self {
        Self::new(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
        )
    }

    pub fn uniform_read(stage: vk::PipelineStageFlags) -> Self {
        Self::new(stage, vk::AccessFlags::UNIFORM_READ, vk::ImageLayout::UNDEFINED)
    }

    pub fn vertex_buffer() -> Self {
        Self::new(
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            vk::ImageLayout::UNDEFINED,
        )
    }

    pub fn index_buffer() -> Self {
        Self::new(
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::INDEX_READ,
            vk::ImageLayout::UNDEFINED,
        )
    }

    pub fn transfer_read() -> Self {
        Self::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
    }

    pub fn transfer_write() -> Self {
        Self::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
    }

    pub fn present() -> Self {
        Self::new(
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
    }

    pub fn stage_access(&self) -> StageAccess {
        StageAccess::new(self.stage, self.access)
    }

    pub fn is_write(&self) -> bool {
        self.access.intersects(write_access_mask())
    }

    /// Whether any read access bit is set.
    pub fn reads(&self) -> bool {
        !without(self.access, write_access_mask()).is_empty()
    }
}

/// Last-known synchronization state of a buffer or of one image subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    pub layout: vk::ImageLayout,
    /// Owning queue family, `QUEUE_FAMILY_IGNORED` while unowned.
    pub queue_family: u32,
    pub last_write: Option<StageAccess>,
    /// Stages that read since the last write.
    pub read_stages: vk::PipelineStageFlags,
    /// Scope the last write has been made visible to.
    pub visible: StageAccess,
    /// Whether the contents are defined.
    pub initialized: bool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
            last_write: None,
            read_stages: vk::PipelineStageFlags::empty(),
            visible: StageAccess::none(),
            initialized: false,
        }
    }
}

impl SyncState {
    /// State of memory the host has written before any submission.
    pub fn host_initialized() -> Self {
        Self {
            initialized: true,
            ..Self::default()
        }
    }

    /// State of a swap image right after acquisition. The acquire semaphore is
    /// waited at `COLOR_ATTACHMENT_OUTPUT`, so the first barrier chains there.
    pub fn acquired_swap_image() -> Self {
        Self {
            last_write: Some(StageAccess::new(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::empty(),
            )),
            ..Self::default()
        }
    }

    fn pending_src(&self) -> StageAccess {
        let mut src = StageAccess::new(self.read_stages, vk::AccessFlags::empty());
        if let Some(write) = self.last_write {
            src = src.union(write);
        }
        if src.stages.is_empty() {
            src.stages = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        src
    }
}

/// A barrier before it is bound to a resource and range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Transition {
    pub src: StageAccess,
    pub dst: StageAccess,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_family: u32,
    pub dst_family: u32,
}

pub(crate) struct Resolution {
    pub barrier: Option<Transition>,
    pub release: Option<Transition>,
    pub next: SyncState,
    pub uninitialized_read: bool,
}

/// Applies one access to one state.
///
/// `widen` extends the destination scope of a read barrier so later reads in
/// the same layout need none. `target_family` is the accessing queue family
/// for exclusively owned resources.
pub(crate) fn resolve(
    state: &SyncState,
    usage: &ResourceUsage,
    widen: StageAccess,
    is_image: bool,
    target_family: Option<u32>,
) -> Resolution {
    let write = usage.is_write();
    let uninitialized_read = !write && !state.initialized;
    let new_layout = if is_image {
        usage.layout
    } else {
        vk::ImageLayout::UNDEFINED
    };
    let old_layout = if state.initialized {
        state.layout
    } else {
        vk::ImageLayout::UNDEFINED
    };
    let dst = if write {
        usage.stage_access()
    } else {
        usage.stage_access().union(widen)
    };

    let mut next = *state;
    next.layout = new_layout;
    next.queue_family = target_family.unwrap_or(vk::QUEUE_FAMILY_IGNORED);

    let transfer_from = match target_family {
        Some(family)
            if state.initialized
                && state.queue_family != vk::QUEUE_FAMILY_IGNORED
                && state.queue_family != family =>
        {
            Some((state.queue_family, family))
        }
        _ => None,
    };

    if let Some((src_family, dst_family)) = transfer_from {
        let release = Transition {
            src: state.pending_src(),
            dst: StageAccess::new(vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
            old_layout,
            new_layout,
            src_family,
            dst_family,
        };
        let acquire = Transition {
            src: StageAccess::new(vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
            dst,
            ..release
        };
        after_barrier(&mut next, usage, dst, write);
        return Resolution {
            barrier: Some(acquire),
            release: Some(release),
            next,
            uninitialized_read,
        };
    }

    let plain = |src: StageAccess, dst: StageAccess| Transition {
        src,
        dst,
        old_layout,
        new_layout,
        src_family: vk::QUEUE_FAMILY_IGNORED,
        dst_family: vk::QUEUE_FAMILY_IGNORED,
    };

    if is_image && state.layout != new_layout {
        after_barrier(&mut next, usage, dst, write);
        return Resolution {
            barrier: Some(plain(state.pending_src(), dst)),
            release: None,
            next,
            uninitialized_read,
        };
    }

    let barrier = if write {
        let barrier = if !state.read_stages.is_empty() {
            // Readers finished with the old contents; only a read-modify-write
            // that has not seen the last write also needs its data.
            let needs_data = usage.reads()
                && state.last_write.is_some()
                && !state.visible.covers(&usage.stage_access());
            let mut src = StageAccess::new(state.read_stages, vk::AccessFlags::empty());
            let mut dst = StageAccess::new(usage.stage, vk::AccessFlags::empty());
            if let (true, Some(last)) = (needs_data, state.last_write) {
                src = src.union(last);
                dst.access = usage.access;
            }
            Some(plain(src, dst))
        } else {
            state.last_write.map(|last| plain(last, usage.stage_access()))
        };
        next.last_write = Some(usage.stage_access());
        next.read_stages = vk::PipelineStageFlags::empty();
        next.visible = StageAccess::none();
        next.initialized = true;
        barrier
    } else {
        let barrier = match state.last_write {
            Some(last) if !state.visible.covers(&usage.stage_access()) => Some(plain(last, dst)),
            _ => None,
        };
        if barrier.is_some() {
            next.visible = state.visible.union(dst);
        }
        next.read_stages |= usage.stage;
        barrier
    };

    Resolution {
        barrier,
        release: None,
        next,
        uninitialized_read,
    }
}

fn after_barrier(next: &mut SyncState, usage: &ResourceUsage, dst: StageAccess, write: bool) {
    if write {
        next.last_write = Some(usage.stage_access());
        next.read_stages = vk::PipelineStageFlags::empty();
        next.visible = StageAccess::none();
        next.initialized = true;
    } else {
        next.last_write = Some(StageAccess::new(dst.stages, vk::AccessFlags::empty()));
        next.read_stages = usage.stage;
        next.visible = dst;
    }
}

/// Hands an exclusively owned state back to `home`. Returns the release and
/// acquire halves when the contents must be preserved.
pub(crate) fn return_home(state: &mut SyncState, home: u32) -> Option<(Transition, Transition)> {
    if state.queue_family == vk::QUEUE_FAMILY_IGNORED || state.queue_family == home {
        return None;
    }
    if !state.initialized {
        state.queue_family = vk::QUEUE_FAMILY_IGNORED;
        return None;
    }
    let release = Transition {
        src: state.pending_src(),
        dst: StageAccess::new(vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
        old_layout: state.layout,
        new_layout: state.layout,
        src_family: state.queue_family,
        dst_family: home,
    };
    let everything = StageAccess::new(
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
    );
    let acquire = Transition {
        src: StageAccess::new(vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        dst: everything,
        ..release
    };
    state.queue_family = home;
    state.last_write = Some(StageAccess::new(
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::AccessFlags::empty(),
    ));
    state.read_stages = vk::PipelineStageFlags::empty();
    state.visible = everything;
    Some((release, acquire))
}

/// Merges per-subresource transitions into contiguous ranges, first along
/// mip levels within a layer, then across layers with identical mip ranges.
pub(crate) fn merge_runs(entries: &[(u32, u32, Transition)]) -> Vec<(SubresourceRange, Transition)> {
    let mut runs: Vec<(SubresourceRange, Transition)> = Vec::new();
    for &(layer, mip, transition) in entries {
        if let Some((range, last)) = runs.last_mut() {
            if *last == transition
                && range.base_array_layer == layer
                && range.layer_count == 1
                && range.base_mip_level + range.level_count == mip
            {
                range.level_count += 1;
                continue;
            }
        }
        runs.push((
            SubresourceRange {
                base_mip_level: mip,
                level_count: 1,
                base_array_layer: layer,
                layer_count: 1,
            },
            transition,
        ));
    }

    let mut merged: Vec<(SubresourceRange, Transition)> = Vec::with_capacity(runs.len());
    for (range, transition) in runs {
        let existing = merged.iter_mut().find(|(r, t)| {
            *t == transition
                && r.base_mip_level == range.base_mip_level
                && r.level_count == range.level_count
                && r.base_array_layer + r.layer_count == range.base_array_layer
        });
        match existing {
            Some((r, _)) => r.layer_count += range.layer_count,
            None => merged.push((range, transition)),
        }
    }
    merged
}

/// A barrier on one resource, before handles are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierDescriptor {
    pub resource: ResourceHandle,
    /// Subresource range for images, `None` for buffers.
    pub range: Option<SubresourceRange>,
    pub src: StageAccess,
    pub dst: StageAccess,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BarrierDescriptor {
    pub(crate) fn from_transition(
        resource: ResourceHandle,
        range: Option<SubresourceRange>,
        t: Transition,
    ) -> Self {
        Self {
            resource,
            range,
            src: t.src,
            dst: t.dst,
            old_layout: t.old_layout,
            new_layout: t.new_layout,
            src_queue_family: t.src_family,
            dst_queue_family: t.dst_family,
        }
    }

    pub fn is_ownership_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
            && self.src_queue_family != vk::QUEUE_FAMILY_IGNORED
            && self.dst_queue_family != vk::QUEUE_FAMILY_IGNORED
    }

    pub fn is_layout_transition(&self) -> bool {
        self.old_layout != self.new_layout
    }

    /// Binds the barrier to the physical handles currently behind its resource.
    pub fn resolve(&self, arena: &ResourceArena) -> Result<ResolvedBarrier> {
        let target = match self.resource {
            ResourceHandle::Image(handle) => {
                let image = arena.image(handle)?;
                let range = self
                    .range
                    .unwrap_or_else(|| SubresourceRange::full(image.mip_levels(), image.array_layers()));
                BarrierTarget::Image {
                    image: image.raw(),
                    range: range.to_vk(image.aspect()),
                }
            }
            ResourceHandle::Buffer(handle) => BarrierTarget::Buffer(arena.buffer(handle)?.raw()),
        };
        Ok(ResolvedBarrier {
            target,
            src: self.src,
            dst: self.dst,
            old_layout: self.old_layout,
            new_layout: self.new_layout,
            src_queue_family: self.src_queue_family,
            dst_queue_family: self.dst_queue_family,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BarrierTarget {
    Image {
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    },
    Buffer(vk::Buffer),
}

/// A barrier ready for `vkCmdPipelineBarrier`.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedBarrier {
    pub target: BarrierTarget,
    pub src: StageAccess,
    pub dst: StageAccess,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

/// One declared access of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAccess {
    pub resource: ResourceHandle,
    pub usage: ResourceUsage,
    /// Subresources touched; `None` means the whole image.
    pub range: Option<SubresourceRange>,
}

impl ResourceAccess {
    pub fn new(resource: impl Into<ResourceHandle>, usage: ResourceUsage) -> Self {
        Self {
            resource: resource.into(),
            usage,
            range: None,
        }
    }
}

/// A unit of work as seen by the planner.
///
/// The first step of a frame is the prologue on the graphics queue and the
/// last one the epilogue on the graphics queue.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub name: String,
    pub queue: QueueKind,
    pub accesses: Vec<ResourceAccess>,
    pub generate_mips: Option<ImageHandle>,
    /// Reads of undefined contents fail the frame.
    pub strict: bool,
}

impl PlanStep {
    pub fn new(name: impl Into<String>, queue: QueueKind, accesses: Vec<ResourceAccess>) -> Self {
        Self {
            name: name.into(),
            queue,
            accesses,
            generate_mips: None,
            strict: true,
        }
    }

    fn touches(&self, resource: ResourceHandle) -> bool {
        self.generate_mips.map(ResourceHandle::Image) == Some(resource)
            || self.accesses.iter().any(|a| a.resource == resource)
    }
}

/// Barriers around one blit of the mip chain.
#[derive(Debug, Clone)]
pub struct MipStep {
    pub barriers: Vec<BarrierDescriptor>,
    pub src_level: u32,
    pub dst_level: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PlannedStep {
    /// Recorded before the step body.
    pub pre: Vec<BarrierDescriptor>,
    /// Recorded after the step body (ownership releases).
    pub post: Vec<BarrierDescriptor>,
    pub mip_steps: Vec<MipStep>,
    /// Earlier steps on other queues whose results this step consumes.
    pub depends_on: Vec<usize>,
}

impl PlannedStep {
    pub fn barrier_count(&self) -> usize {
        self.pre.len()
            + self.post.len()
            + self.mip_steps.iter().map(|m| m.barriers.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
struct OverlayEntry {
    state: TrackedState,
    sharing: Sharing,
    committed_queue: Option<QueueKind>,
    last_step: Option<usize>,
    last_queue: Option<QueueKind>,
}

impl OverlayEntry {
    fn load(arena: &ResourceArena, resource: ResourceHandle) -> Result<Self> {
        Ok(Self {
            state: arena.tracked_state(resource)?,
            sharing: arena.sharing(resource)?,
            committed_queue: arena.last_queue(resource)?,
            last_step: None,
            last_queue: None,
        })
    }
}

pub(crate) struct AccessOutcome {
    pub barriers: Vec<BarrierDescriptor>,
    pub releases: Vec<BarrierDescriptor>,
    pub uninitialized_read: bool,
}

impl TrackedState {
    pub(crate) fn apply(
        &mut self,
        resource: ResourceHandle,
        range: Option<SubresourceRange>,
        usage: &ResourceUsage,
        widen: StageAccess,
        target_family: Option<u32>,
    ) -> AccessOutcome {
        match self {
            TrackedState::Image(tracker) => tracker.apply(resource, range, usage, widen, target_family),
            TrackedState::Buffer(state) => {
                let resolution = resolve(state, usage, widen, false, target_family);
                *state = resolution.next;
                AccessOutcome {
                    barriers: resolution
                        .barrier
                        .map(|t| BarrierDescriptor::from_transition(resource, None, t))
                        .into_iter()
                        .collect(),
                    releases: resolution
                        .release
                        .map(|t| BarrierDescriptor::from_transition(resource, None, t))
                        .into_iter()
                        .collect(),
                    uninitialized_read: resolution.uninitialized_read,
                }
            }
        }
    }

    fn return_home(
        &mut self,
        resource: ResourceHandle,
        home: u32,
    ) -> (Vec<BarrierDescriptor>, Vec<BarrierDescriptor>) {
        match self {
            TrackedState::Image(tracker) => tracker.return_home(resource, home),
            TrackedState::Buffer(state) => match return_home(state, home) {
                Some((release, acquire)) => (
                    vec![BarrierDescriptor::from_transition(resource, None, release)],
                    vec![BarrierDescriptor::from_transition(resource, None, acquire)],
                ),
                None => (Vec::new(), Vec::new()),
            },
        }
    }
}

/// The barriers and cross-queue dependencies of one frame.
#[derive(Debug)]
pub struct FramePlan {
    pub steps: Vec<PlannedStep>,
    overlay: BTreeMap<ResourceHandle, OverlayEntry>,
}

impl FramePlan {
    pub fn barrier_count(&self) -> usize {
        self.steps.iter().map(PlannedStep::barrier_count).sum()
    }

    /// Resources touched by the frame.
    pub fn touched(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.overlay.keys().copied()
    }

    /// Writes the planned end-of-frame states back into the arena.
    pub fn commit(self, arena: &mut ResourceArena, frame_number: u64) {
        for (resource, entry) in self.overlay {
            let queue = entry.last_queue.or(entry.committed_queue);
            arena.commit_state(resource, entry.state, queue, frame_number);
        }
    }
}

/// Derives barriers for a frame's steps from the tracked state.
#[derive(Debug, Clone)]
pub struct BarrierManager {
    families: QueueFamilies,
}

impl BarrierManager {
    pub fn new(families: QueueFamilies) -> Self {
        Self { families }
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    /// Plans `steps` in order. Steps 0 and `len - 1` must be the prologue and
    /// epilogue on the graphics queue.
    pub fn plan(&self, arena: &ResourceArena, steps: &[PlanStep]) -> Result<FramePlan> {
        let mut overlay = BTreeMap::new();
        let mut planned = vec![PlannedStep::default(); steps.len()];

        for (index, step) in steps.iter().enumerate() {
            if let Some(image) = step.generate_mips {
                self.plan_mips(arena, steps, index, image, &mut overlay, &mut planned)?;
                continue;
            }
            for access in &step.accesses {
                let widen = if access.usage.is_write() {
                    StageAccess::none()
                } else {
                    lookahead(steps, index, access)
                };
                let outcome = self.access(
                    arena,
                    steps,
                    index,
                    access.resource,
                    access.range,
                    &access.usage,
                    widen,
                    &mut overlay,
                    &mut planned,
                )?;
                if outcome.uninitialized_read && step.strict {
                    return Err(RenderGraphError::UninitializedRead {
                        pass: step.name.clone(),
                        resource: arena.name_of(access.resource).to_string(),
                    });
                }
                planned[index].pre.extend(outcome.barriers);
            }
        }

        if let Some(last) = steps.len().checked_sub(1) {
            let home = self.families.graphics;
            for (resource, entry) in overlay.iter_mut() {
                if entry.sharing != Sharing::Exclusive {
                    continue;
                }
                let (releases, acquires) = entry.state.return_home(*resource, home);
                if releases.is_empty() {
                    continue;
                }
                let source = entry.last_step.unwrap_or(0);
                trace!(
                    resource = arena.name_of(*resource),
                    source = %steps[source].name,
                    "Returning ownership to the graphics family"
                );
                planned[source].post.extend(releases);
                planned[last].pre.extend(acquires);
                if source != last {
                    planned[last].depends_on.push(source);
                }
                entry.last_step = Some(last);
                entry.last_queue = Some(steps[last].queue);
            }
        }

        for step in &mut planned {
            step.depends_on.sort_unstable();
            step.depends_on.dedup();
        }
        Ok(FramePlan {
            steps: planned,
            overlay,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn access(
        &self,
        arena: &ResourceArena,
        steps: &[PlanStep],
        index: usize,
        resource: ResourceHandle,
        range: Option<SubresourceRange>,
        usage: &ResourceUsage,
        widen: StageAccess,
        overlay: &mut BTreeMap<ResourceHandle, OverlayEntry>,
        planned: &mut [PlannedStep],
    ) -> Result<AccessOutcome> {
        let entry = match overlay.entry(resource) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(v) => v.insert(OverlayEntry::load(arena, resource)?),
        };
        let queue = steps[index].queue;

        match entry.last_step {
            Some(previous) if previous != index && steps[previous].queue != queue => {
                planned[index].depends_on.push(previous);
            }
            None => {
                // Work of earlier frames on other queues is ordered before the
                // prologue's signal, so consumers off the graphics queue wait on it.
                if let Some(committed) = entry.committed_queue {
                    if committed != queue && queue != QueueKind::Graphics && index != 0 {
                        planned[index].depends_on.push(0);
                    }
                }
            }
            _ => {}
        }

        let target = match entry.sharing {
            Sharing::Exclusive => Some(self.families.family(queue)),
            Sharing::Concurrent => None,
        };
        let mut outcome = entry.state.apply(resource, range, usage, widen, target);
        if !outcome.releases.is_empty() {
            let source = entry.last_step.unwrap_or(0);
            trace!(
                resource = arena.name_of(resource),
                from = %steps[source].name,
                to = %steps[index].name,
                "Queue family ownership transfer"
            );
            if source != index {
                planned[index].depends_on.push(source);
            }
            planned[source].post.append(&mut outcome.releases);
        }
        for barrier in &outcome.barriers {
            trace!(
                pass = %steps[index].name,
                resource = arena.name_of(resource),
                old_layout = ?barrier.old_layout,
                new_layout = ?barrier.new_layout,
                src = ?barrier.src,
                dst = ?barrier.dst,
                "Barrier"
            );
        }

        entry.last_step = Some(index);
        entry.last_queue = Some(queue);
        Ok(outcome)
    }

    fn plan_mips(
        &self,
        arena: &ResourceArena,
        steps: &[PlanStep],
        index: usize,
        image: ImageHandle,
        overlay: &mut BTreeMap<ResourceHandle, OverlayEntry>,
        planned: &mut [PlannedStep],
    ) -> Result<()> {
        let resource = ResourceHandle::Image(image);
        let resource_image = arena.image(image)?;
        let levels = resource_image.mip_levels();
        let layers = resource_image.array_layers();
        for level in 1..levels {
            let source = self.access(
                arena,
                steps,
                index,
                resource,
                Some(SubresourceRange::mip(level - 1, layers)),
                &ResourceUsage::transfer_read(),
                StageAccess::none(),
                overlay,
                planned,
            )?;
            if source.uninitialized_read {
                return Err(RenderGraphError::UninitializedRead {
                    pass: steps[index].name.clone(),
                    resource: arena.name_of(resource).to_string(),
                });
            }
            let destination = self.access(
                arena,
                steps,
                index,
                resource,
                Some(SubresourceRange::mip(level, layers)),
                &ResourceUsage::transfer_write(),
                StageAccess::none(),
                overlay,
                planned,
            )?;
            let mut barriers = source.barriers;
            barriers.extend(destination.barriers);
            planned[index].mip_steps.push(MipStep {
                barriers,
                src_level: level - 1,
                dst_level: level,
            });
        }
        Ok(())
    }
}

/// Union of the following same-queue reads of `access.resource` in the same
/// layout and range, up to the next write or other use.
fn lookahead(steps: &[PlanStep], index: usize, access: &ResourceAccess) -> StageAccess {
    let queue = steps[index].queue;
    let mut widen = StageAccess::none();
    for step in &steps[index + 1..] {
        if !step.touches(access.resource) {
            continue;
        }
        if step.generate_mips.is_some() || step.queue != queue {
            break;
        }
        let mut compatible = true;
        for next in step.accesses.iter().filter(|a| a.resource == access.resource) {
            if next.usage.is_write() || next.usage.layout != access.usage.layout || next.range != access.range
            {
                compatible = false;
                break;
            }
            widen = widen.union(next.usage.stage_access());
        }
        if !compatible {
            break;
        }
    }
    widen
}

/// Barriers recorded into the command buffers of one queue family.
#[derive(Debug, Clone, Default)]
pub struct RecordedStream {
    pub queue_family: u32,
    pub barriers: Vec<BarrierDescriptor>,
}

type TransferKey = (
    ResourceHandle,
    Option<SubresourceRange>,
    u32,
    u32,
    vk::ImageLayout,
    vk::ImageLayout,
);

/// Checks that every ownership transfer in `streams` has both its release on
/// the source family and its acquire on the destination family.
pub fn validate_ownership_transfers(streams: &[RecordedStream], arena: &ResourceArena) -> Result<()> {
    let mut releases: HashMap<TransferKey, usize> = HashMap::new();
    let mut acquires: HashMap<TransferKey, usize> = HashMap::new();
    for stream in streams {
        for barrier in stream.barriers.iter().filter(|b| b.is_ownership_transfer()) {
            let key = (
                barrier.resource,
                barrier.range,
                barrier.src_queue_family,
                barrier.dst_queue_family,
                barrier.old_layout,
                barrier.new_layout,
            );
            if barrier.src_queue_family == stream.queue_family {
                *releases.entry(key).or_default() += 1;
            } else if barrier.dst_queue_family == stream.queue_family {
                *acquires.entry(key).or_default() += 1;
            }
        }
    }

    let incomplete = |key: &TransferKey, missing: &'static str| RenderGraphError::IncompleteOwnershipTransfer {
        resource: arena.name_of(key.0).to_string(),
        src_family: key.2,
        dst_family: key.3,
        missing,
    };
    for (key, count) in &releases {
        if acquires.get(key).copied().unwrap_or(0) < *count {
            return Err(incomplete(key, "acquire"));
        }
    }
    for (key, count) in &acquires {
        if releases.get(key).copied().unwrap_or(0) < *count {
            return Err(incomplete(key, "release"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimulatedDevice};
    use crate::backend::GpuBackend;
    use crate::memory::DeviceMemoryAllocator;
    use crate::resource::BufferDesc;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const GRAPHICS: u32 = 0;
    const COMPUTE: u32 = 1;

    fn written_color() -> SyncState {
        resolve(
            &SyncState::default(),
            &ResourceUsage::color_attachment_write(),
            StageAccess::none(),
            true,
            Some(GRAPHICS),
        )
        .next
    }

    #[test]
    fn first_write_transitions_from_undefined() {
        let r = resolve(
            &SyncState::default(),
            &ResourceUsage::color_attachment_write(),
            StageAccess::none(),
            true,
            Some(GRAPHICS),
        );
        let barrier = r.barrier.unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.src.stages, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(r.next.initialized);
        assert!(r.release.is_none());
    }

    #[test]
    fn read_after_write_is_a_memory_barrier_and_repeat_reads_are_free() {
        let state = written_color();
        let first = resolve(
            &state,
            &ResourceUsage::fragment_sampled(),
            StageAccess::none(),
            true,
            Some(GRAPHICS),
        );
        let barrier = first.barrier.unwrap();
        assert_eq!(barrier.src.access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst.access, vk::AccessFlags::SHADER_READ);

        let second = resolve(
            &first.next,
            &ResourceUsage::fragment_sampled(),
            StageAccess::none(),
            true,
            Some(GRAPHICS),
        );
        assert!(second.barrier.is_none());
    }

    #[test]
    fn widened_read_covers_later_stage() {
        let state = written_color();
        let first = resolve(
            &state,
            &ResourceUsage::fragment_sampled(),
            ResourceUsage::compute_sampled().stage_access(),
            true,
            Some(GRAPHICS),
        );
        let second = resolve(
            &first.next,
            &ResourceUsage::compute_sampled(),
            StageAccess::none(),
            true,
            Some(GRAPHICS),
        );
        assert!(second.barrier.is_none());
    }

    #[test]
    fn write_after_read_is_execution_only() {
        let mut state = SyncState::host_initialized();
        state.queue_family = GRAPHICS;
        let after_read = resolve(
            &state,
            &ResourceUsage::uniform_read(vk::PipelineStageFlags::VERTEX_SHADER),
            StageAccess::none(),
            false,
            Some(GRAPHICS),
        );
        assert!(after_read.barrier.is_none());
        let war = resolve(
            &after_read.next,
            &ResourceUsage::transfer_write(),
            StageAccess::none(),
            false,
            Some(GRAPHICS),
        )
        .barrier
        .unwrap();
        assert_eq!(war.src.stages, vk::PipelineStageFlags::VERTEX_SHADER);
        assert_eq!(war.src.access, vk::AccessFlags::empty());
        assert_eq!(war.dst.access, vk::AccessFlags::empty());
    }

    #[test]
    fn write_after_write_orders_against_last_writer() {
        let state = resolve(
            &SyncState::default(),
            &ResourceUsage::compute_storage_write(),
            StageAccess::none(),
            false,
            Some(GRAPHICS),
        )
        .next;
        let waw = resolve(
            &state,
            &ResourceUsage::transfer_write(),
            StageAccess::none(),
            false,
            Some(GRAPHICS),
        )
        .barrier
        .unwrap();
        assert_eq!(waw.src, ResourceUsage::compute_storage_write().stage_access());
        assert_eq!(waw.dst, ResourceUsage::transfer_write().stage_access());
    }

    #[test]
    fn unwritten_read_is_flagged() {
        let r = resolve(
            &SyncState::default(),
            &ResourceUsage::fragment_sampled(),
            StageAccess::none(),
            true,
            Some(GRAPHICS),
        );
        assert!(r.uninitialized_read);
    }

    #[test]
    fn family_change_produces_matching_release_and_acquire() {
        let state = written_color();
        let r = resolve(
            &state,
            &ResourceUsage::compute_sampled(),
            StageAccess::none(),
            true,
            Some(COMPUTE),
        );
        let release = r.release.unwrap();
        let acquire = r.barrier.unwrap();
        assert_eq!((release.src_family, release.dst_family), (GRAPHICS, COMPUTE));
        assert_eq!((acquire.src_family, acquire.dst_family), (GRAPHICS, COMPUTE));
        assert_eq!(release.old_layout, acquire.old_layout);
        assert_eq!(release.new_layout, acquire.new_layout);
        assert_eq!(r.next.queue_family, COMPUTE);
    }

    #[test]
    fn uninitialized_resource_changes_family_without_transfer() {
        let mut state = SyncState::default();
        state.queue_family = GRAPHICS;
        let r = resolve(
            &state,
            &ResourceUsage::compute_storage_write(),
            StageAccess::none(),
            true,
            Some(COMPUTE),
        );
        assert!(r.release.is_none());
        assert_eq!(r.barrier.unwrap().src_family, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn returning_home_resets_visibility() {
        let mut state = resolve(
            &SyncState::default(),
            &ResourceUsage::compute_storage_write(),
            StageAccess::none(),
            false,
            Some(COMPUTE),
        )
        .next;
        let (release, acquire) = return_home(&mut state, GRAPHICS).unwrap();
        assert_eq!(release.src_family, COMPUTE);
        assert_eq!(acquire.dst_family, GRAPHICS);
        assert_eq!(state.queue_family, GRAPHICS);
        assert!(state.visible.covers(&ResourceUsage::vertex_buffer().stage_access()));
    }

    #[test]
    fn merge_runs_joins_mips_then_layers() {
        let t = Transition {
            src: StageAccess::none(),
            dst: StageAccess::none(),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_family: vk::QUEUE_FAMILY_IGNORED,
            dst_family: vk::QUEUE_FAMILY_IGNORED,
        };
        let entries = [(0, 0, t), (0, 1, t), (1, 0, t), (1, 1, t)];
        let merged = merge_runs(&entries);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0, SubresourceRange::full(2, 2));
    }

    #[test]
    fn covers_understands_memory_read() {
        let everything = StageAccess::new(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ,
        );
        assert!(everything.covers(&ResourceUsage::fragment_sampled().stage_access()));
        assert!(!everything.covers(&ResourceUsage::transfer_write().stage_access()));
    }

    fn histogram_arena() -> (ResourceArena, ResourceHandle) {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut allocator = DeviceMemoryAllocator::new(device.memory_properties(), 1024 * 1024);
        let mut arena = ResourceArena::new();
        let histogram = arena
            .create_buffer(
                &device,
                &mut allocator,
                BufferDesc::new("histogram", 1024, vk::BufferUsageFlags::STORAGE_BUFFER),
            )
            .unwrap();
        (arena, histogram.into())
    }

    /// Compute writes the histogram, graphics reads it afterwards.
    fn handoff(resource: ResourceHandle) -> BarrierDescriptor {
        BarrierDescriptor {
            resource,
            range: None,
            src: StageAccess::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE),
            dst: StageAccess::new(vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family: COMPUTE,
            dst_queue_family: GRAPHICS,
        }
    }

    #[rstest]
    #[case(true, false, Some("acquire"))]
    #[case(false, true, Some("release"))]
    #[case(true, true, None)]
    fn ownership_transfers_need_both_halves(
        #[case] release: bool,
        #[case] acquire: bool,
        #[case] missing: Option<&'static str>,
    ) {
        let (arena, histogram) = histogram_arena();
        let mut compute = RecordedStream {
            queue_family: COMPUTE,
            barriers: Vec::new(),
        };
        let mut graphics = RecordedStream {
            queue_family: GRAPHICS,
            barriers: Vec::new(),
        };
        if release {
            compute.barriers.push(handoff(histogram));
        }
        if acquire {
            graphics.barriers.push(handoff(histogram));
        }

        match (validate_ownership_transfers(&[compute, graphics], &arena), missing) {
            (Ok(()), None) => {}
            (
                Err(RenderGraphError::IncompleteOwnershipTransfer {
                    resource,
                    src_family,
                    dst_family,
                    missing: reported,
                }),
                Some(expected),
            ) => {
                assert_eq!(resource, "histogram");
                assert_eq!((src_family, dst_family), (COMPUTE, GRAPHICS));
                assert_eq!(reported, expected);
            }
            (other, expected) => panic!("expected {:?} missing, got {:?}", expected, other),
        }
    }

    #[test]
    fn same_family_barriers_are_not_transfers() {
        let (arena, histogram) = histogram_arena();
        let mut barrier = handoff(histogram);
        barrier.src_queue_family = vk::QUEUE_FAMILY_IGNORED;
        barrier.dst_queue_family = vk::QUEUE_FAMILY_IGNORED;
        let graphics = RecordedStream {
            queue_family: GRAPHICS,
            barriers: vec![barrier],
        };
        assert!(validate_ownership_transfers(&[graphics], &arena).is_ok());
    }
}
