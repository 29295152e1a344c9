//! A headless simulated GPU.
//!
//! [`SimulatedDevice`] implements [`GpuBackend`] without a driver. Objects are
//! numbered handles; command buffers record [`Command`]s; submissions and
//! presents queue up on a timeline that runs asynchronously from the CPU. The
//! timeline only advances when the host blocks (fence waits, idle waits), when
//! more than [`SimConfig::queue_depth`] operations are queued, or when a test
//! calls [`SimulatedDevice::complete_all`].
//!
//! Misuse that a real driver would turn into corruption or a validation error
//! is recorded as a violation instead: resetting a pool whose work is still
//! queued, re-recording a pending command buffer, waiting on a semaphore
//! nobody signaled, executing commands that reference destroyed objects.
//! Queue family ownership transfers are paired as they execute: an acquire
//! with no release before it, or a release left unacquired once the timeline
//! is idle, is a violation as well. Everything executed lands in one ordered
//! log ([`SimulatedDevice::executed_commands`]).
//!
//! Faults can be injected to exercise recovery paths: an out-of-date
//! swapchain, a resize reported by present, a hung queue and a lost device.

use super::{
    AcquireResult, DescriptorBindingDesc, DescriptorWrite, FenceWait, GpuBackend,
    GraphicsPipelineBuild, ImageInfo, ImageViewInfo, MemoryHeap, MemoryProperties, MemoryType,
    PresentStatus, QueueFamilies, QueueKind, RenderingInfo, SamplerInfo, ShaderModuleRef, Sharing,
    SubmitBatch, SwapchainDesc, SwapchainInfo,
};
use crate::barrier::{BarrierTarget, ResolvedBarrier};
use crate::error::{RenderGraphError, Result};
use ash::vk;
use ash::vk::Handle;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

const DEVICE_LOCAL_TYPE: u32 = 0;
const HOST_VISIBLE_TYPE: u32 = 1;
const IMAGE_ALIGNMENT: u64 = 256;
const BUFFER_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub device_heap_size: u64,
    pub host_heap_size: u64,
    /// Expose one queue family for all queue kinds.
    pub single_queue_family: bool,
    pub surface_extent: vk::Extent2D,
    pub swapchain_format: vk::Format,
    /// Operations the timeline keeps queued before it retires the oldest.
    pub queue_depth: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "simulated device".to_string(),
            device_heap_size: 256 * 1024 * 1024,
            host_heap_size: 256 * 1024 * 1024,
            single_queue_family: false,
            surface_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            swapchain_format: vk::Format::B8G8R8A8_SRGB,
            queue_depth: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Memory,
    Image,
    SwapImage,
    ImageView,
    Sampler,
    Buffer,
    Fence,
    Semaphore,
    CommandPool,
    CommandBuffer,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    DescriptorPool,
    DescriptorSet,
    Swapchain,
}

/// A recorded command.
#[derive(Debug, Clone)]
pub enum Command {
    Barrier(Vec<ResolvedBarrier>),
    BeginLabel(String),
    EndLabel,
    BeginRendering {
        extent: vk::Extent2D,
        views: Vec<vk::ImageView>,
    },
    EndRendering,
    BindPipeline(vk::Pipeline),
    BindDescriptorSet(vk::DescriptorSet),
    BindVertexBuffer(vk::Buffer),
    SetViewportScissor(vk::Extent2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
    },
    BlitMip {
        image: vk::Image,
        src_level: u32,
        dst_level: u32,
    },
}

/// A debug label reached by the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedLabel {
    pub queue: QueueKind,
    pub name: String,
}

/// A command reached by the timeline, in execution order across queues.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub queue: QueueKind,
    pub command: Command,
}

/// Target, subresources and families of one ownership transfer.
type TransferKey = (u64, u32, u32, u32, u32, u32, u32, u32);

fn transfer_key(barrier: &ResolvedBarrier) -> TransferKey {
    let (raw, range) = match barrier.target {
        BarrierTarget::Image { image, range } => (
            image.as_raw(),
            (
                range.aspect_mask.as_raw(),
                range.base_mip_level,
                range.level_count,
                range.base_array_layer,
                range.layer_count,
            ),
        ),
        BarrierTarget::Buffer(buffer) => (buffer.as_raw(), (0, 0, 0, 0, 0)),
    };
    (
        raw,
        range.0,
        range.1,
        range.2,
        range.3,
        range.4,
        barrier.src_queue_family,
        barrier.dst_queue_family,
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub submissions: usize,
    pub submissions_per_queue: [usize; 3],
    pub blocking_waits: usize,
    pub barriers_executed: usize,
    pub draws: usize,
    pub dispatches: usize,
    pub blits: usize,
    pub copies: usize,
    pub acquires: usize,
    pub presents: usize,
    pub swapchains_created: usize,
    pub pipelines_created: usize,
    pub live_memory_objects: usize,
    pub live_objects: usize,
}

#[derive(Debug)]
enum PendingOp {
    Submit { queue: QueueKind, batch: SubmitBatch },
    Present { wait: vk::Semaphore },
}

#[derive(Debug, Default)]
struct CommandBufferState {
    commands: Vec<Command>,
    recording: bool,
}

#[derive(Debug)]
struct Swapchain {
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: u64,
    objects: HashMap<u64, ObjectKind>,
    memory: HashMap<u64, (u64, u32)>,
    heap_used: [u64; 2],
    host_writes: HashMap<u64, Vec<(u64, Vec<u8>)>>,
    images: HashMap<u64, ImageInfo>,
    buffers: HashMap<u64, u64>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CommandBufferState>,
    descriptor_pools: HashMap<u64, (u32, u32)>,
    descriptor_sets: HashMap<u64, u64>,
    descriptor_writes: HashMap<u64, Vec<DescriptorWrite>>,
    swapchains: HashMap<u64, Swapchain>,
    next_image: u32,
    surface_extent: vk::Extent2D,
    pending: VecDeque<PendingOp>,
    families: QueueFamilies,
    executed: Vec<ExecutedCommand>,
    /// Releases executed whose acquire has not run yet.
    open_releases: BTreeMap<TransferKey, usize>,
    violations: Vec<String>,
    stats: SimStats,
    hung: bool,
    lost: bool,
    out_of_date: bool,
    present_resized: bool,
}

impl SimState {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.objects.insert(raw, kind);
        raw
    }

    fn violation(&mut self, message: String) {
        warn!(target: "vulkan", "Simulated device: {}", message);
        self.violations.push(message);
    }

    fn release(&mut self, raw: u64, kind: ObjectKind) {
        if raw == 0 {
            return;
        }
        match self.objects.get(&raw).copied() {
            Some(k) if k == kind => {
                self.objects.remove(&raw);
            }
            _ => self.violation(format!("destroy of unknown or destroyed {:?} {:#x}", kind, raw)),
        }
    }

    fn is_live(&self, raw: u64, kinds: &[ObjectKind]) -> bool {
        self.objects.get(&raw).is_some_and(|k| kinds.contains(k))
    }

    fn check(&mut self, raw: u64, kinds: &[ObjectKind], context: &str) {
        if raw != 0 && !self.is_live(raw, kinds) {
            self.violation(format!("{} uses destroyed {:?} {:#x}", context, kinds[0], raw));
        }
    }

    fn check_image(&mut self, raw: u64, context: &str) {
        self.check(raw, &[ObjectKind::Image, ObjectKind::SwapImage], context);
    }

    fn pending_uses_command_buffer(&self, cb: u64) -> bool {
        self.pending.iter().any(|op| match op {
            PendingOp::Submit { batch, .. } => batch.command_buffers.iter().any(|c| c.as_raw() == cb),
            PendingOp::Present { .. } => false,
        })
    }

    fn pending_uses_fence(&self, fence: u64) -> bool {
        self.pending.iter().any(|op| match op {
            PendingOp::Submit { batch, .. } => batch.fence.map(|f| f.as_raw()) == Some(fence),
            PendingOp::Present { .. } => false,
        })
    }

    fn record(&mut self, cb: vk::CommandBuffer, command: Command) {
        match self.command_buffers.get_mut(&cb.as_raw()) {
            Some(state) if state.recording => state.commands.push(command),
            Some(_) => self.violation(format!(
                "command recorded into {:#x} outside begin/end",
                cb.as_raw()
            )),
            None => self.violation(format!("command recorded into unknown buffer {:#x}", cb.as_raw())),
        }
    }

    fn wait_semaphore(&mut self, semaphore: vk::Semaphore, context: &str) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.violation(format!(
                "{} waits on unsignaled semaphore {:#x}",
                context,
                semaphore.as_raw()
            )),
            None => self.violation(format!(
                "{} waits on destroyed semaphore {:#x}",
                context,
                semaphore.as_raw()
            )),
        }
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore, context: &str) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => self.violation(format!(
                "{} signals already signaled semaphore {:#x}",
                context,
                semaphore.as_raw()
            )),
            None => self.violation(format!(
                "{} signals destroyed semaphore {:#x}",
                context,
                semaphore.as_raw()
            )),
        }
    }

    /// Pairs an ownership transfer half with its counterpart. The half on the
    /// source family must execute before the one on the destination family.
    fn track_ownership(&mut self, queue: QueueKind, barrier: &ResolvedBarrier) {
        let (src, dst) = (barrier.src_queue_family, barrier.dst_queue_family);
        if src == dst || src == vk::QUEUE_FAMILY_IGNORED || dst == vk::QUEUE_FAMILY_IGNORED {
            return;
        }
        let key = transfer_key(barrier);
        let family = self.families.family(queue);
        if family == src {
            *self.open_releases.entry(key).or_default() += 1;
        } else if family == dst {
            match self.open_releases.get_mut(&key) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.open_releases.remove(&key);
                }
                None => self.violation(format!(
                    "acquire of {:#x} from family {} to {} without a release",
                    key.0, src, dst
                )),
            }
        } else {
            self.violation(format!(
                "ownership transfer of {:#x} from family {} to {} executed on family {}",
                key.0, src, dst, family
            ));
        }
    }

    fn execute_command(&mut self, queue: QueueKind, command: Command) {
        self.executed.push(ExecutedCommand {
            queue,
            command: command.clone(),
        });
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    match barrier.target {
                        BarrierTarget::Image { image, .. } => self.check_image(image.as_raw(), "barrier"),
                        BarrierTarget::Buffer(buffer) => {
                            self.check(buffer.as_raw(), &[ObjectKind::Buffer], "barrier")
                        }
                    }
                    self.track_ownership(queue, &barrier);
                    self.stats.barriers_executed += 1;
                }
            }
            Command::BeginLabel(_) => {}
            Command::EndLabel | Command::EndRendering | Command::SetViewportScissor(_) => {}
            Command::BeginRendering { views, .. } => {
                for view in views {
                    self.check(view.as_raw(), &[ObjectKind::ImageView], "rendering");
                }
            }
            Command::BindPipeline(pipeline) => {
                self.check(pipeline.as_raw(), &[ObjectKind::Pipeline], "bind pipeline")
            }
            Command::BindDescriptorSet(set) => {
                self.check(set.as_raw(), &[ObjectKind::DescriptorSet], "bind descriptor set");
                let writes = self.descriptor_writes.get(&set.as_raw()).cloned().unwrap_or_default();
                for write in writes {
                    match write {
                        DescriptorWrite::Image { view, sampler, .. } => {
                            self.check(view.as_raw(), &[ObjectKind::ImageView], "descriptor set");
                            self.check(sampler.as_raw(), &[ObjectKind::Sampler], "descriptor set");
                        }
                        DescriptorWrite::Buffer { buffer, .. } => {
                            self.check(buffer.as_raw(), &[ObjectKind::Buffer], "descriptor set")
                        }
                    }
                }
            }
            Command::BindVertexBuffer(buffer) => {
                self.check(buffer.as_raw(), &[ObjectKind::Buffer], "vertex buffer")
            }
            Command::Draw { .. } => self.stats.draws += 1,
            Command::Dispatch { .. } => self.stats.dispatches += 1,
            Command::CopyBuffer { src, dst, .. } => {
                self.check(src.as_raw(), &[ObjectKind::Buffer], "copy");
                self.check(dst.as_raw(), &[ObjectKind::Buffer], "copy");
                self.stats.copies += 1;
            }
            Command::CopyBufferToImage { src, dst } => {
                self.check(src.as_raw(), &[ObjectKind::Buffer], "copy");
                self.check_image(dst.as_raw(), "copy");
                self.stats.copies += 1;
            }
            Command::BlitMip { image, .. } => {
                self.check_image(image.as_raw(), "blit");
                self.stats.blits += 1;
            }
        }
    }

    fn execute_one(&mut self) -> bool {
        let Some(op) = self.pending.pop_front() else {
            return false;
        };
        match op {
            PendingOp::Submit { queue, batch } => {
                let context = format!("{:?} submission", queue);
                for (semaphore, _) in &batch.waits {
                    self.wait_semaphore(*semaphore, &context);
                }
                for cb in &batch.command_buffers {
                    let commands = match self.command_buffers.get(&cb.as_raw()) {
                        Some(state) => state.commands.clone(),
                        None => {
                            self.violation(format!("{} executes destroyed command buffer", context));
                            continue;
                        }
                    };
                    for command in commands {
                        self.execute_command(queue, command);
                    }
                }
                for semaphore in &batch.signals {
                    self.signal_semaphore(*semaphore, &context);
                }
                if let Some(fence) = batch.fence {
                    match self.fences.get_mut(&fence.as_raw()) {
                        Some(signaled) => *signaled = true,
                        None => self.violation(format!("{} signals destroyed fence", context)),
                    }
                }
            }
            PendingOp::Present { wait } => self.wait_semaphore(wait, "present"),
        }
        true
    }

    fn settle(&mut self, depth: usize) {
        while !self.hung && self.pending.len() > depth {
            self.execute_one();
        }
    }

    fn run_until_idle(&mut self) {
        while !self.hung && self.execute_one() {}
    }

    fn device_lost(&self) -> Result<()> {
        if self.lost {
            return Err(RenderGraphError::DeviceLost("simulated device lost".to_string()));
        }
        Ok(())
    }
}

fn bytes_per_texel(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        vk::Format::D32_SFLOAT_S8_UINT => 8,
        _ => 4,
    }
}

fn align(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// An in-memory device with an asynchronous timeline.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimConfig,
    state: RefCell<SimState>,
}

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        let mut device = Self {
            state: RefCell::new(SimState {
                surface_extent: config.surface_extent,
                ..SimState::default()
            }),
            config,
        };
        let families = device.queue_families();
        device.state.get_mut().families = families;
        debug!("Created simulated device '{}'", device.config.name);
        device
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs every queued operation.
    pub fn complete_all(&self) {
        self.state.borrow_mut().run_until_idle();
    }

    pub fn pending_operations(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Every command executed so far, interleaved across queues.
    pub fn executed_commands(&self) -> Vec<ExecutedCommand> {
        self.state.borrow().executed.clone()
    }

    pub fn executed_labels(&self) -> Vec<ExecutedLabel> {
        self.state
            .borrow()
            .executed
            .iter()
            .filter_map(|executed| match &executed.command {
                Command::BeginLabel(name) => Some(ExecutedLabel {
                    queue: executed.queue,
                    name: name.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn executed_barriers(&self) -> Vec<(QueueKind, ResolvedBarrier)> {
        self.state
            .borrow()
            .executed
            .iter()
            .flat_map(|executed| match &executed.command {
                Command::Barrier(barriers) => barriers.iter().map(|b| (executed.queue, *b)).collect(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Drops the command log.
    pub fn clear_logs(&self) {
        self.state.borrow_mut().executed.clear();
    }

    /// Misuse recorded so far. Once the timeline is idle, releases that never
    /// met their acquire are reported too.
    pub fn violations(&self) -> Vec<String> {
        let state = self.state.borrow();
        let mut violations = state.violations.clone();
        if state.pending.is_empty() {
            for (key, count) in &state.open_releases {
                violations.push(format!(
                    "{} release(s) of {:#x} from family {} to {} never acquired",
                    count, key.0, key.6, key.7
                ));
            }
        }
        violations
    }

    pub fn stats(&self) -> SimStats {
        let state = self.state.borrow();
        let mut stats = state.stats;
        stats.live_memory_objects = state.memory.len();
        stats.live_objects = state.objects.len();
        stats
    }

    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.state.borrow().objects.values().filter(|k| **k == kind).count()
    }

    /// Bytes previously written at exactly `offset` of `memory`.
    pub fn read_memory(&self, memory: vk::DeviceMemory, offset: u64) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .host_writes
            .get(&memory.as_raw())?
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.state
            .borrow()
            .descriptor_writes
            .get(&set.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Stops the timeline. Fence waits time out from now on.
    pub fn hang(&self) {
        self.state.borrow_mut().hung = true;
    }

    pub fn inject_device_lost(&self) {
        self.state.borrow_mut().lost = true;
    }

    /// Resizes the surface; the next acquire reports an out-of-date swapchain.
    pub fn inject_resize(&self, extent: vk::Extent2D) {
        let mut state = self.state.borrow_mut();
        state.surface_extent = extent;
        state.out_of_date = true;
    }

    /// Resizes the surface; the next present reports it while the acquire
    /// before it still succeeds.
    pub fn inject_present_resize(&self, extent: vk::Extent2D) {
        let mut state = self.state.borrow_mut();
        state.surface_extent = extent;
        state.present_resized = true;
    }
}

impl GpuBackend for SimulatedDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn queue_families(&self) -> QueueFamilies {
        if self.config.single_queue_family {
            QueueFamilies::single(0)
        } else {
            QueueFamilies {
                graphics: 0,
                compute: 1,
                transfer: 2,
            }
        }
    }

    fn memory_properties(&self) -> MemoryProperties {
        MemoryProperties {
            types: vec![
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
            ],
            heaps: vec![
                MemoryHeap {
                    size: self.config.device_heap_size,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: self.config.host_heap_size,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
        }
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let mut state = self.state.borrow_mut();
        let (heap, budget, flags) = match memory_type_index {
            DEVICE_LOCAL_TYPE => (
                0,
                self.config.device_heap_size,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            HOST_VISIBLE_TYPE => (
                1,
                self.config.host_heap_size,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
            _ => return Err(RenderGraphError::Vk(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)),
        };
        if state.heap_used[heap] + size > budget {
            return Err(RenderGraphError::OutOfDeviceMemory {
                requested: size,
                flags,
            });
        }
        state.heap_used[heap] += size;
        let raw = state.create(ObjectKind::Memory);
        state.memory.insert(raw, (size, memory_type_index));
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        state.release(memory.as_raw(), ObjectKind::Memory);
        if let Some((size, memory_type)) = state.memory.remove(&memory.as_raw()) {
            state.heap_used[memory_type as usize] -= size;
            state.host_writes.remove(&memory.as_raw());
        }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.memory.get(&memory.as_raw()).copied() {
            Some((size, HOST_VISIBLE_TYPE)) if offset + data.len() as u64 <= size => {
                state
                    .host_writes
                    .entry(memory.as_raw())
                    .or_default()
                    .push((offset, data.to_vec()));
                Ok(())
            }
            _ => Err(RenderGraphError::Vk(vk::Result::ERROR_MEMORY_MAP_FAILED)),
        }
    }

    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(ObjectKind::Image);
        state.images.insert(raw, *info);
        Ok(vk::Image::from_raw(raw))
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let mut state = self.state.borrow_mut();
        let Some(info) = state.images.get(&image.as_raw()).copied() else {
            state.violation(format!("memory requirements of unknown image {:#x}", image.as_raw()));
            return vk::MemoryRequirements::default();
        };
        let texel = bytes_per_texel(info.format);
        let size: u64 = (0..info.mip_levels)
            .map(|level| {
                let w = (info.extent.width >> level).max(1) as u64;
                let h = (info.extent.height >> level).max(1) as u64;
                w * h * texel
            })
            .sum::<u64>()
            * info.array_layers as u64;
        vk::MemoryRequirements {
            size: align(size.max(1), IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: (1 << DEVICE_LOCAL_TYPE) | (1 << HOST_VISIBLE_TYPE),
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, _offset: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check(image.as_raw(), &[ObjectKind::Image], "bind image memory");
        state.check(memory.as_raw(), &[ObjectKind::Memory], "bind image memory");
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.borrow_mut();
        state.release(image.as_raw(), ObjectKind::Image);
        state.images.remove(&image.as_raw());
    }

    fn create_image_view(&self, image: vk::Image, _info: &ImageViewInfo) -> Result<vk::ImageView> {
        let mut state = self.state.borrow_mut();
        state.check_image(image.as_raw(), "create image view");
        Ok(vk::ImageView::from_raw(state.create(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.borrow_mut().release(view.as_raw(), ObjectKind::ImageView);
    }

    fn create_sampler(&self, _info: &SamplerInfo) -> Result<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state.borrow_mut().create(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.borrow_mut().release(sampler.as_raw(), ObjectKind::Sampler);
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags, _sharing: Sharing) -> Result<vk::Buffer> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(ObjectKind::Buffer);
        state.buffers.insert(raw, size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state
            .borrow()
            .buffers
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: align(size.max(1), BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: (1 << DEVICE_LOCAL_TYPE) | (1 << HOST_VISIBLE_TYPE),
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, _offset: u64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.check(buffer.as_raw(), &[ObjectKind::Buffer], "bind buffer memory");
        state.check(memory.as_raw(), &[ObjectKind::Memory], "bind buffer memory");
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.borrow_mut();
        state.release(buffer.as_raw(), ObjectKind::Buffer);
        state.buffers.remove(&buffer.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(ObjectKind::Fence);
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        state.release(fence.as_raw(), ObjectKind::Fence);
        state.fences.remove(&fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: Duration) -> Result<FenceWait> {
        let mut state = self.state.borrow_mut();
        state.device_lost()?;
        state.stats.blocking_waits += 1;
        loop {
            match state.fences.get(&fence.as_raw()).copied() {
                Some(true) => return Ok(FenceWait::Signaled),
                Some(false) => {}
                None => {
                    state.violation(format!("wait on destroyed fence {:#x}", fence.as_raw()));
                    return Ok(FenceWait::TimedOut);
                }
            }
            if state.hung {
                return Ok(FenceWait::TimedOut);
            }
            if !state.pending_uses_fence(fence.as_raw()) {
                state.violation(format!(
                    "wait on fence {:#x} that no queued work signals",
                    fence.as_raw()
                ));
                return Ok(FenceWait::TimedOut);
            }
            state.execute_one();
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        let state = self.state.borrow();
        state.device_lost()?;
        Ok(state.fences.get(&fence.as_raw()).copied().unwrap_or(false))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.pending_uses_fence(fence.as_raw()) {
            state.violation(format!("reset of fence {:#x} while its work is queued", fence.as_raw()));
        }
        if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
            *signaled = false;
        } else {
            state.violation(format!("reset of destroyed fence {:#x}", fence.as_raw()));
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(ObjectKind::Semaphore);
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        state.release(semaphore.as_raw(), ObjectKind::Semaphore);
        state.semaphores.remove(&semaphore.as_raw());
    }

    fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(ObjectKind::CommandPool);
        state.pools.insert(raw, Vec::new());
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        state.release(pool.as_raw(), ObjectKind::CommandPool);
        for cb in state.pools.remove(&pool.as_raw()).unwrap_or_default() {
            if state.pending_uses_command_buffer(cb) {
                state.violation(format!("command pool {:#x} destroyed while its work is queued", pool.as_raw()));
            }
            state.objects.remove(&cb);
            state.command_buffers.remove(&cb);
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let buffers = state.pools.get(&pool.as_raw()).cloned().unwrap_or_default();
        if buffers.iter().any(|cb| state.pending_uses_command_buffer(*cb)) {
            state.violation(format!("reset of command pool {:#x} while its work is queued", pool.as_raw()));
        }
        for cb in buffers {
            if let Some(cb_state) = state.command_buffers.get_mut(&cb) {
                cb_state.commands.clear();
                cb_state.recording = false;
            }
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        if !state.pools.contains_key(&pool.as_raw()) {
            return Err(RenderGraphError::InvalidHandle { kind: "command pool" });
        }
        let raw = state.create(ObjectKind::CommandBuffer);
        state.command_buffers.insert(raw, CommandBufferState::default());
        if let Some(buffers) = state.pools.get_mut(&pool.as_raw()) {
            buffers.push(raw);
        }
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.pending_uses_command_buffer(cb.as_raw()) {
            state.violation(format!("command buffer {:#x} re-recorded while queued", cb.as_raw()));
        }
        let cb_state = state
            .command_buffers
            .get_mut(&cb.as_raw())
            .ok_or(RenderGraphError::InvalidHandle { kind: "command buffer" })?;
        cb_state.commands.clear();
        cb_state.recording = true;
        Ok(())
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let cb_state = state
            .command_buffers
            .get_mut(&cb.as_raw())
            .ok_or(RenderGraphError::InvalidHandle { kind: "command buffer" })?;
        cb_state.recording = false;
        Ok(())
    }

    fn cmd_pipeline_barrier(&self, cb: vk::CommandBuffer, barriers: &[ResolvedBarrier]) {
        if !barriers.is_empty() {
            self.state
                .borrow_mut()
                .record(cb, Command::Barrier(barriers.to_vec()));
        }
    }

    fn cmd_begin_label(&self, cb: vk::CommandBuffer, name: &str) {
        self.state
            .borrow_mut()
            .record(cb, Command::BeginLabel(name.to_string()));
    }

    fn cmd_end_label(&self, cb: vk::CommandBuffer) {
        self.state.borrow_mut().record(cb, Command::EndLabel);
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        let views = info
            .color
            .iter()
            .chain(info.depth.iter())
            .map(|a| a.view)
            .collect();
        self.state.borrow_mut().record(
            cb,
            Command::BeginRendering {
                extent: info.extent,
                views,
            },
        );
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        self.state.borrow_mut().record(cb, Command::EndRendering);
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, _bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.state.borrow_mut().record(cb, Command::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.state.borrow_mut().record(cb, Command::BindDescriptorSet(set));
    }

    fn cmd_bind_vertex_buffer(&self, cb: vk::CommandBuffer, buffer: vk::Buffer, _offset: u64) {
        self.state.borrow_mut().record(cb, Command::BindVertexBuffer(buffer));
    }

    fn cmd_set_viewport_scissor(&self, cb: vk::CommandBuffer, extent: vk::Extent2D) {
        self.state.borrow_mut().record(cb, Command::SetViewportScissor(extent));
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.state.borrow_mut().record(
            cb,
            Command::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state.borrow_mut().record(cb, Command::Dispatch { x, y, z });
    }

    fn cmd_copy_buffer(&self, cb: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        self.state
            .borrow_mut()
            .record(cb, Command::CopyBuffer { src, dst, size });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _aspect: vk::ImageAspectFlags,
        _extent: vk::Extent3D,
    ) {
        self.state
            .borrow_mut()
            .record(cb, Command::CopyBufferToImage { src, dst });
    }

    fn cmd_blit_mip(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        _aspect: vk::ImageAspectFlags,
        src_level: u32,
        _src_extent: vk::Extent2D,
        dst_level: u32,
        _dst_extent: vk::Extent2D,
        _layer_count: u32,
    ) {
        self.state.borrow_mut().record(
            cb,
            Command::BlitMip {
                image,
                src_level,
                dst_level,
            },
        );
    }

    fn submit(&self, queue: QueueKind, batch: &SubmitBatch) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.device_lost()?;
        for cb in &batch.command_buffers {
            if state
                .command_buffers
                .get(&cb.as_raw())
                .map_or(true, |s| s.recording)
            {
                state.violation(format!(
                    "submission of unfinished or unknown command buffer {:#x}",
                    cb.as_raw()
                ));
            }
        }
        state.stats.submissions += 1;
        state.stats.submissions_per_queue[queue.index()] += 1;
        state.pending.push_back(PendingOp::Submit {
            queue,
            batch: batch.clone(),
        });
        state.settle(self.config.queue_depth);
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.device_lost()?;
        if state.hung && !state.pending.is_empty() {
            return Err(RenderGraphError::DeviceLost("simulated queue hang".to_string()));
        }
        state.stats.blocking_waits += 1;
        state.run_until_idle();
        Ok(())
    }

    fn surface_extent(&self) -> vk::Extent2D {
        self.state.borrow().surface_extent
    }

    fn create_swapchain(&self, desc: &SwapchainDesc, _old: Option<vk::SwapchainKHR>) -> Result<SwapchainInfo> {
        let mut state = self.state.borrow_mut();
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.image_count == 0 {
            return Err(RenderGraphError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let images: Vec<vk::Image> = (0..desc.image_count)
            .map(|_| vk::Image::from_raw(state.create(ObjectKind::SwapImage)))
            .collect();
        let raw = state.create(ObjectKind::Swapchain);
        state.swapchains.insert(
            raw,
            Swapchain {
                extent: desc.extent,
                images: images.clone(),
            },
        );
        state.out_of_date = false;
        state.next_image = 0;
        state.stats.swapchains_created += 1;
        Ok(SwapchainInfo {
            handle: vk::SwapchainKHR::from_raw(raw),
            format: self.config.swapchain_format,
            extent: desc.extent,
            images,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.release(swapchain.as_raw(), ObjectKind::Swapchain);
        if let Some(chain) = state.swapchains.remove(&swapchain.as_raw()) {
            for image in chain.images {
                state.release(image.as_raw(), ObjectKind::SwapImage);
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        _timeout: Duration,
    ) -> Result<AcquireResult> {
        let mut state = self.state.borrow_mut();
        state.device_lost()?;
        state.stats.acquires += 1;
        let surface = state.surface_extent;
        let (extent, count) = match state.swapchains.get(&swapchain.as_raw()) {
            Some(chain) => (chain.extent, chain.images.len() as u32),
            None => return Err(RenderGraphError::InvalidHandle { kind: "swapchain" }),
        };
        let mismatch = extent.width != surface.width || extent.height != surface.height;
        // A resize injected for present is only reported there.
        if state.out_of_date || (mismatch && !state.present_resized) {
            state.out_of_date = false;
            return Ok(AcquireResult::OutOfDate);
        }
        let index = state.next_image % count;
        state.next_image = state.next_image.wrapping_add(1);
        state.signal_semaphore(signal, "acquire");
        Ok(AcquireResult::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn present(&self, swapchain: vk::SwapchainKHR, _image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        let mut state = self.state.borrow_mut();
        state.device_lost()?;
        state.check(swapchain.as_raw(), &[ObjectKind::Swapchain], "present");
        state.stats.presents += 1;
        state.pending.push_back(PendingOp::Present { wait });
        state.settle(self.config.queue_depth);
        if state.present_resized {
            state.present_resized = false;
            return Ok(PresentStatus::Resized);
        }
        Ok(PresentStatus::Ok)
    }

    fn create_shader_module(&self, _code: &[u32]) -> Result<vk::ShaderModule> {
        Ok(vk::ShaderModule::from_raw(
            self.state.borrow_mut().create(ObjectKind::ShaderModule),
        ))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.borrow_mut().release(module.as_raw(), ObjectKind::ShaderModule);
    }

    fn create_descriptor_set_layout(&self, _bindings: &[DescriptorBindingDesc]) -> Result<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.state.borrow_mut().create(ObjectKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state
            .borrow_mut()
            .release(layout.as_raw(), ObjectKind::DescriptorSetLayout);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_bytes: u32,
    ) -> Result<vk::PipelineLayout> {
        let mut state = self.state.borrow_mut();
        for layout in set_layouts {
            state.check(layout.as_raw(), &[ObjectKind::DescriptorSetLayout], "pipeline layout");
        }
        Ok(vk::PipelineLayout::from_raw(state.create(ObjectKind::PipelineLayout)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state
            .borrow_mut()
            .release(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(&self, build: &GraphicsPipelineBuild<'_>) -> Result<vk::Pipeline> {
        let mut state = self.state.borrow_mut();
        state.check(build.layout.as_raw(), &[ObjectKind::PipelineLayout], build.name);
        for stage in build.stages {
            state.check(stage.module.as_raw(), &[ObjectKind::ShaderModule], build.name);
        }
        state.stats.pipelines_created += 1;
        Ok(vk::Pipeline::from_raw(state.create(ObjectKind::Pipeline)))
    }

    fn create_compute_pipeline(&self, layout: vk::PipelineLayout, stage: &ShaderModuleRef<'_>) -> Result<vk::Pipeline> {
        let mut state = self.state.borrow_mut();
        state.check(layout.as_raw(), &[ObjectKind::PipelineLayout], "compute pipeline");
        state.check(stage.module.as_raw(), &[ObjectKind::ShaderModule], "compute pipeline");
        state.stats.pipelines_created += 1;
        Ok(vk::Pipeline::from_raw(state.create(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.borrow_mut().release(pipeline.as_raw(), ObjectKind::Pipeline);
    }

    fn create_descriptor_pool(&self, max_sets: u32, _sizes: &[vk::DescriptorPoolSize]) -> Result<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(ObjectKind::DescriptorPool);
        state.descriptor_pools.insert(raw, (max_sets, 0));
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.borrow_mut();
        state.release(pool.as_raw(), ObjectKind::DescriptorPool);
        state.descriptor_pools.remove(&pool.as_raw());
        let sets: Vec<u64> = state
            .descriptor_sets
            .iter()
            .filter(|(_, p)| **p == pool.as_raw())
            .map(|(s, _)| *s)
            .collect();
        for set in sets {
            state.descriptor_sets.remove(&set);
            state.descriptor_writes.remove(&set);
            state.objects.remove(&set);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>> {
        let mut state = self.state.borrow_mut();
        state.check(layout.as_raw(), &[ObjectKind::DescriptorSetLayout], "allocate descriptor set");
        let (max, used) = state
            .descriptor_pools
            .get(&pool.as_raw())
            .copied()
            .ok_or(RenderGraphError::InvalidHandle { kind: "descriptor pool" })?;
        if used >= max {
            return Ok(None);
        }
        state.descriptor_pools.insert(pool.as_raw(), (max, used + 1));
        let raw = state.create(ObjectKind::DescriptorSet);
        state.descriptor_sets.insert(raw, pool.as_raw());
        Ok(Some(vk::DescriptorSet::from_raw(raw)))
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.borrow_mut();
        state.check(set.as_raw(), &[ObjectKind::DescriptorSet], "write descriptor set");
        for write in writes {
            match *write {
                DescriptorWrite::Image { view, sampler, .. } => {
                    state.check(view.as_raw(), &[ObjectKind::ImageView], "write descriptor set");
                    state.check(sampler.as_raw(), &[ObjectKind::Sampler], "write descriptor set");
                }
                DescriptorWrite::Buffer { buffer, .. } => {
                    state.check(buffer.as_raw(), &[ObjectKind::Buffer], "write descriptor set")
                }
            }
        }
        let binding_of = |w: &DescriptorWrite| match w {
            DescriptorWrite::Image { binding, .. } | DescriptorWrite::Buffer { binding, .. } => *binding,
        };
        let entry = state.descriptor_writes.entry(set.as_raw()).or_default();
        for write in writes {
            entry.retain(|existing| binding_of(existing) != binding_of(write));
            entry.push(*write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::StageAccess;
    use pretty_assertions::assert_eq;

    fn recorded_submit(device: &SimulatedDevice, label: &str) -> (vk::CommandPool, vk::Fence) {
        let pool = device.create_command_pool(0).unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cb).unwrap();
        device.cmd_begin_label(cb, label);
        device.cmd_end_label(cb);
        device.end_command_buffer(cb).unwrap();
        let fence = device.create_fence(false).unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &SubmitBatch {
                    command_buffers: vec![cb],
                    fence: Some(fence),
                    ..SubmitBatch::default()
                },
            )
            .unwrap();
        (pool, fence)
    }

    #[test]
    fn work_runs_when_the_host_waits() {
        let device = SimulatedDevice::new(SimConfig::default());
        let (_, fence) = recorded_submit(&device, "pass");
        assert!(device.executed_labels().is_empty());
        assert!(!device.fence_signaled(fence).unwrap());
        assert_eq!(
            device.wait_for_fence(fence, Duration::from_secs(1)).unwrap(),
            FenceWait::Signaled
        );
        assert_eq!(
            device.executed_labels(),
            vec![ExecutedLabel {
                queue: QueueKind::Graphics,
                name: "pass".to_string()
            }]
        );
    }

    fn histogram_handoff(device: &SimulatedDevice) -> ResolvedBarrier {
        let buffer = device
            .create_buffer(256, vk::BufferUsageFlags::STORAGE_BUFFER, Sharing::Exclusive)
            .unwrap();
        ResolvedBarrier {
            target: BarrierTarget::Buffer(buffer),
            src: StageAccess::new(vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_WRITE),
            dst: StageAccess::new(vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family: 1,
            dst_queue_family: 0,
        }
    }

    fn submit_barrier(device: &SimulatedDevice, queue: QueueKind, barrier: ResolvedBarrier) {
        let pool = device.create_command_pool(device.queue_families().family(queue)).unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cb).unwrap();
        device.cmd_pipeline_barrier(cb, &[barrier]);
        device.end_command_buffer(cb).unwrap();
        device
            .submit(
                queue,
                &SubmitBatch {
                    command_buffers: vec![cb],
                    ..SubmitBatch::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn paired_ownership_transfer_is_clean() {
        let device = SimulatedDevice::new(SimConfig::default());
        let handoff = histogram_handoff(&device);
        submit_barrier(&device, QueueKind::Compute, handoff);
        submit_barrier(&device, QueueKind::Graphics, handoff);
        device.complete_all();
        assert_eq!(device.violations(), Vec::<String>::new());
        let queues: Vec<QueueKind> = device.executed_commands().iter().map(|c| c.queue).collect();
        assert_eq!(queues, vec![QueueKind::Compute, QueueKind::Graphics]);
    }

    #[test]
    fn acquire_without_release_is_a_violation() {
        let device = SimulatedDevice::new(SimConfig::default());
        submit_barrier(&device, QueueKind::Graphics, histogram_handoff(&device));
        device.complete_all();
        let violations = device.violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("without a release"), "{}", violations[0]);
    }

    #[test]
    fn unacquired_release_is_reported_once_idle() {
        let device = SimulatedDevice::new(SimConfig::default());
        submit_barrier(&device, QueueKind::Compute, histogram_handoff(&device));
        assert!(device.violations().is_empty());
        device.complete_all();
        let violations = device.violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("never acquired"), "{}", violations[0]);
    }

    #[test]
    fn resetting_a_pool_with_queued_work_is_a_violation() {
        let device = SimulatedDevice::new(SimConfig::default());
        let (pool, _) = recorded_submit(&device, "pass");
        device.reset_command_pool(pool).unwrap();
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn destroying_referenced_objects_early_is_caught_on_execution() {
        let device = SimulatedDevice::new(SimConfig::default());
        let buffer = device
            .create_buffer(64, vk::BufferUsageFlags::VERTEX_BUFFER, Sharing::Exclusive)
            .unwrap();
        let pool = device.create_command_pool(0).unwrap();
        let cb = device.allocate_command_buffer(pool).unwrap();
        device.begin_command_buffer(cb).unwrap();
        device.cmd_bind_vertex_buffer(cb, buffer, 0);
        device.end_command_buffer(cb).unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &SubmitBatch {
                    command_buffers: vec![cb],
                    ..SubmitBatch::default()
                },
            )
            .unwrap();
        device.destroy_buffer(buffer);
        assert!(device.violations().is_empty());
        device.complete_all();
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn semaphores_must_be_signaled_before_waits() {
        let device = SimulatedDevice::new(SimConfig::default());
        let semaphore = device.create_semaphore().unwrap();
        device
            .submit(
                QueueKind::Compute,
                &SubmitBatch {
                    waits: vec![(semaphore, vk::PipelineStageFlags::ALL_COMMANDS)],
                    ..SubmitBatch::default()
                },
            )
            .unwrap();
        device.complete_all();
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn resize_makes_the_swapchain_out_of_date() {
        let device = SimulatedDevice::new(SimConfig::default());
        let info = device
            .create_swapchain(
                &SwapchainDesc {
                    extent: device.surface_extent(),
                    image_count: 3,
                    present_mode: vk::PresentModeKHR::MAILBOX,
                },
                None,
            )
            .unwrap();
        let semaphore = device.create_semaphore().unwrap();
        device.inject_resize(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert_eq!(
            device
                .acquire_next_image(info.handle, semaphore, Duration::from_secs(1))
                .unwrap(),
            AcquireResult::OutOfDate
        );
    }

    #[test]
    fn heap_budget_is_enforced() {
        let device = SimulatedDevice::new(SimConfig {
            device_heap_size: 1024,
            ..SimConfig::default()
        });
        let memory = device.allocate_memory(1024, DEVICE_LOCAL_TYPE).unwrap();
        assert!(matches!(
            device.allocate_memory(1, DEVICE_LOCAL_TYPE),
            Err(RenderGraphError::OutOfDeviceMemory { .. })
        ));
        device.free_memory(memory);
        assert!(device.allocate_memory(1, DEVICE_LOCAL_TYPE).is_ok());
    }
}
