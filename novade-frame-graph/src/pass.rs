//! Pass declarations and the context a pass records through.
//!
//! A pass declares every resource it touches up front together with how it
//! touches it. The barrier planner works from those declarations alone, so
//! [`PassContext`] refuses to hand out anything that was not declared.

use crate::backend::{AttachmentInfo, AttachmentLoad, GpuBackend, QueueKind, RenderingInfo};
use crate::barrier::{ResourceAccess, ResourceUsage};
use crate::descriptor::{DescriptorBinder, DescriptorSetHandle};
use crate::error::{RenderGraphError, Result};
use crate::pipeline::{PipelineCache, PipelineHandle};
use crate::resource::{BufferHandle, ImageHandle, ImageResource, ResourceArena, ResourceHandle, SubresourceRange};
use ash::vk;
use smallvec::SmallVec;
use tracing::warn;

/// Records a pass's commands.
pub type RecordFn = Box<dyn FnMut(&mut PassContext<'_>) -> Result<()>>;

pub enum PassBody {
    Record(RecordFn),
    /// Built-in pass that fills the mip chain of an image from level 0.
    /// It runs until it has succeeded once.
    GenerateMips(ImageHandle),
}

impl std::fmt::Debug for PassBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassBody::Record(_) => f.write_str("Record(..)"),
            PassBody::GenerateMips(image) => f.debug_tuple("GenerateMips").field(image).finish(),
        }
    }
}

/// A unit of GPU work on one queue.
#[derive(Debug)]
pub struct PassDesc {
    pub(crate) name: String,
    pub(crate) queue: QueueKind,
    pub(crate) reads: SmallVec<[ResourceAccess; 4]>,
    pub(crate) writes: SmallVec<[ResourceAccess; 4]>,
    pub(crate) body: PassBody,
    pub(crate) strict: bool,
}

impl PassDesc {
    pub fn new(name: impl Into<String>, queue: QueueKind) -> Self {
        Self {
            name: name.into(),
            queue,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            body: PassBody::Record(Box::new(|_| Ok(()))),
            strict: true,
        }
    }

    pub fn graphics(name: impl Into<String>) -> Self {
        Self::new(name, QueueKind::Graphics)
    }

    pub fn compute(name: impl Into<String>) -> Self {
        Self::new(name, QueueKind::Compute)
    }

    pub fn transfer(name: impl Into<String>) -> Self {
        Self::new(name, QueueKind::Transfer)
    }

    pub fn generate_mips(name: impl Into<String>, image: ImageHandle) -> Self {
        Self {
            body: PassBody::GenerateMips(image),
            ..Self::graphics(name)
        }
    }

    pub fn read(self, resource: impl Into<ResourceHandle>, usage: ResourceUsage) -> Self {
        self.read_range(resource, usage, None)
    }

    pub fn read_range(
        mut self,
        resource: impl Into<ResourceHandle>,
        usage: ResourceUsage,
        range: Option<SubresourceRange>,
    ) -> Self {
        self.reads.push(ResourceAccess {
            resource: resource.into(),
            usage,
            range,
        });
        self
    }

    pub fn write(self, resource: impl Into<ResourceHandle>, usage: ResourceUsage) -> Self {
        self.write_range(resource, usage, None)
    }

    pub fn write_range(
        mut self,
        resource: impl Into<ResourceHandle>,
        usage: ResourceUsage,
        range: Option<SubresourceRange>,
    ) -> Self {
        self.writes.push(ResourceAccess {
            resource: resource.into(),
            usage,
            range,
        });
        self
    }

    /// Lets the pass read contents no earlier pass has written, such as a
    /// history buffer on its first frame.
    pub fn allow_uninitialized_reads(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn record(mut self, f: impl FnMut(&mut PassContext<'_>) -> Result<()> + 'static) -> Self {
        self.body = PassBody::Record(Box::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Reads followed by writes, in declaration order.
    pub fn accesses(&self) -> impl Iterator<Item = &ResourceAccess> {
        self.reads.iter().chain(self.writes.iter())
    }

    pub fn mip_target(&self) -> Option<ImageHandle> {
        match self.body {
            PassBody::GenerateMips(image) => Some(image),
            PassBody::Record(_) => None,
        }
    }

    pub fn uses(&self, resource: ResourceHandle) -> bool {
        self.mip_target().map(ResourceHandle::from) == Some(resource)
            || self.accesses().any(|a| a.resource == resource)
    }

    fn invalid(&self, reason: impl Into<String>) -> RenderGraphError {
        RenderGraphError::InvalidPass {
            pass: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn validate(&self, arena: &ResourceArena) -> Result<()> {
        if self.name.is_empty() {
            return Err(self.invalid("pass name is empty"));
        }
        for access in &self.reads {
            if access.usage.is_write() {
                return Err(self.invalid(format!(
                    "reads '{}' with a writing usage",
                    arena.name_of(access.resource)
                )));
            }
        }
        for access in &self.writes {
            if !access.usage.is_write() {
                return Err(self.invalid(format!(
                    "write of '{}' has no write access",
                    arena.name_of(access.resource)
                )));
            }
        }

        let accesses: Vec<&ResourceAccess> = self.accesses().collect();
        for (i, access) in accesses.iter().enumerate() {
            if !arena.contains(access.resource) {
                return Err(self.invalid("refers to a destroyed or unknown resource"));
            }
            let name = arena.name_of(access.resource);
            if accesses[..i]
                .iter()
                .any(|a| a.resource == access.resource && a.range == access.range)
            {
                return Err(self.invalid(format!("declares '{}' more than once", name)));
            }
            if let ResourceHandle::Image(handle) = access.resource {
                let image = arena.image(handle)?;
                if access.usage.layout == vk::ImageLayout::UNDEFINED {
                    return Err(self.invalid(format!("image '{}' is accessed without a layout", name)));
                }
                if image.is_backbuffer() && self.queue != QueueKind::Graphics {
                    return Err(self.invalid("the backbuffer can only be used on the graphics queue"));
                }
                if let Some(range) = access.range {
                    if range.level_count == 0
                        || range.layer_count == 0
                        || range.base_mip_level + range.level_count > image.mip_levels()
                        || range.base_array_layer + range.layer_count > image.array_layers()
                    {
                        return Err(self.invalid(format!("range {:?} is outside '{}'", range, name)));
                    }
                }
            }
        }

        if let PassBody::GenerateMips(handle) = self.body {
            if !self.reads.is_empty() || !self.writes.is_empty() {
                return Err(self.invalid("a mip generation pass declares no other accesses"));
            }
            if self.queue != QueueKind::Graphics {
                return Err(self.invalid("mip generation needs the graphics queue for blits"));
            }
            let image = arena.image(handle)?;
            let needed = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
            if image.is_backbuffer() || !image.desc().usage.contains(needed) {
                return Err(self.invalid(format!(
                    "'{}' needs TRANSFER_SRC and TRANSFER_DST usage for mip generation",
                    image.name()
                )));
            }
            if image.mip_levels() < 2 {
                warn!("Pass '{}' generates mips for '{}' which has a single level", self.name, image.name());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundPipeline {
    handle: PipelineHandle,
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
}

/// Recording scope of one pass.
pub struct PassContext<'a> {
    pub(crate) backend: &'a dyn GpuBackend,
    pub(crate) arena: &'a ResourceArena,
    pub(crate) pipelines: &'a mut PipelineCache,
    pub(crate) descriptors: &'a DescriptorBinder,
    pub(crate) cb: vk::CommandBuffer,
    pub(crate) pass: &'a str,
    pub(crate) queue: QueueKind,
    pub(crate) declared: Vec<ResourceAccess>,
    pub(crate) frame_number: u64,
    pub(crate) extent: vk::Extent2D,
    bound: Option<BoundPipeline>,
    rendering: bool,
}

impl<'a> PassContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: &'a dyn GpuBackend,
        arena: &'a ResourceArena,
        pipelines: &'a mut PipelineCache,
        descriptors: &'a DescriptorBinder,
        cb: vk::CommandBuffer,
        pass: &'a str,
        queue: QueueKind,
        declared: Vec<ResourceAccess>,
        frame_number: u64,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            backend,
            arena,
            pipelines,
            descriptors,
            cb,
            pass,
            queue,
            declared,
            frame_number,
            extent,
            bound: None,
            rendering: false,
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cb
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend
    }

    pub fn pass_name(&self) -> &str {
        self.pass
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Extent of the backbuffer this frame.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn invalid(&self, reason: impl Into<String>) -> RenderGraphError {
        RenderGraphError::InvalidPass {
            pass: self.pass.to_string(),
            reason: reason.into(),
        }
    }

    fn declaration(&self, resource: ResourceHandle) -> Result<ResourceAccess> {
        self.declared
            .iter()
            .find(|a| a.resource == resource)
            .copied()
            .ok_or_else(|| {
                self.invalid(format!(
                    "touches '{}' without declaring it",
                    self.arena.name_of(resource)
                ))
            })
    }

    pub fn image(&self, handle: ImageHandle) -> Result<&'a ImageResource> {
        self.declaration(handle.into())?;
        self.arena.image(handle)
    }

    pub fn image_view(&self, handle: ImageHandle) -> Result<vk::ImageView> {
        Ok(self.image(handle)?.view())
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<vk::Buffer> {
        self.declaration(handle.into())?;
        Ok(self.arena.buffer(handle)?.raw())
    }

    fn attachment(
        &self,
        handle: ImageHandle,
        load: AttachmentLoad,
        layouts: &[vk::ImageLayout],
        kind: &str,
    ) -> Result<(AttachmentInfo, vk::Extent2D)> {
        let access = self.declaration(handle.into())?;
        let image = self.arena.image(handle)?;
        if !layouts.contains(&access.usage.layout) {
            return Err(self.invalid(format!("'{}' is not declared as a {} attachment", image.name(), kind)));
        }
        Ok((
            AttachmentInfo {
                view: image.view(),
                layout: access.usage.layout,
                load,
                store: access.usage.is_write(),
            },
            image.extent(),
        ))
    }

    /// Begins dynamic rendering into declared attachments. The render area is
    /// the extent of the first attachment.
    pub fn begin_rendering(
        &mut self,
        color: &[(ImageHandle, AttachmentLoad)],
        depth: Option<(ImageHandle, AttachmentLoad)>,
    ) -> Result<()> {
        if self.rendering {
            return Err(self.invalid("rendering has already begun"));
        }
        if self.queue != QueueKind::Graphics {
            return Err(self.invalid("rendering outside the graphics queue"));
        }
        let mut extent = None;
        let mut attachments = Vec::with_capacity(color.len());
        for &(handle, load) in color {
            let (info, size) = self.attachment(handle, load, &[vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL], "color")?;
            extent.get_or_insert(size);
            attachments.push(info);
        }
        let depth = match depth {
            Some((handle, load)) => {
                let (info, size) = self.attachment(
                    handle,
                    load,
                    &[
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                    ],
                    "depth",
                )?;
                extent.get_or_insert(size);
                Some(info)
            }
            None => None,
        };
        let extent = extent.ok_or_else(|| self.invalid("rendering without attachments"))?;
        self.backend.cmd_begin_rendering(
            self.cb,
            &RenderingInfo {
                extent,
                color: attachments,
                depth,
            },
        );
        self.backend.cmd_set_viewport_scissor(self.cb, extent);
        self.rendering = true;
        Ok(())
    }

    pub fn end_rendering(&mut self) -> Result<()> {
        if !self.rendering {
            return Err(self.invalid("end_rendering without begin_rendering"));
        }
        self.backend.cmd_end_rendering(self.cb);
        self.rendering = false;
        Ok(())
    }

    pub fn bind_pipeline(&mut self, handle: PipelineHandle) -> Result<()> {
        let bind_point = self.pipelines.bind_point(handle)?;
        if bind_point == vk::PipelineBindPoint::GRAPHICS && self.queue != QueueKind::Graphics {
            return Err(self.invalid(format!(
                "graphics pipeline '{}' bound on the {:?} queue",
                self.pipelines.name(handle)?,
                self.queue
            )));
        }
        let raw = self.pipelines.resolve(self.backend, handle, self.frame_number)?;
        let layout = self.pipelines.layout(handle)?;
        self.backend.cmd_bind_pipeline(self.cb, bind_point, raw);
        self.bound = Some(BoundPipeline {
            handle,
            bind_point,
            layout,
        });
        Ok(())
    }

    /// Binds `set` at index 0. Every resource in the set must be declared.
    pub fn bind_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<()> {
        let bound = self
            .bound
            .ok_or_else(|| self.invalid("descriptor set bound before a pipeline"))?;
        let owner = self.descriptors.pipeline_of(set)?;
        if owner != bound.handle && self.pipelines.bindings(owner)? != self.pipelines.bindings(bound.handle)? {
            return Err(self.invalid(format!(
                "descriptor set of '{}' does not match the layout of '{}'",
                self.pipelines.name(owner)?,
                self.pipelines.name(bound.handle)?
            )));
        }
        for resource in self.descriptors.resources(set)? {
            self.declaration(resource)?;
        }
        let raw = self.descriptors.set(set)?;
        self.backend
            .cmd_bind_descriptor_set(self.cb, bound.bind_point, bound.layout, 0, raw);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self.buffer(handle)?;
        self.backend.cmd_bind_vertex_buffer(self.cb, buffer, 0);
        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        match self.bound {
            Some(b) if b.bind_point == vk::PipelineBindPoint::GRAPHICS => {}
            _ => return Err(self.invalid("draw without a graphics pipeline")),
        }
        if !self.rendering {
            return Err(self.invalid("draw outside begin_rendering"));
        }
        self.backend.cmd_draw(self.cb, vertex_count, instance_count);
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        match self.bound {
            Some(b) if b.bind_point == vk::PipelineBindPoint::COMPUTE => {}
            _ => return Err(self.invalid("dispatch without a compute pipeline")),
        }
        if self.rendering {
            return Err(self.invalid("dispatch inside a rendering scope"));
        }
        self.backend.cmd_dispatch(self.cb, x, y, z);
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) -> Result<()> {
        let src_raw = self.buffer(src)?;
        let dst_raw = self.buffer(dst)?;
        let limit = self.arena.buffer(src)?.size().min(self.arena.buffer(dst)?.size());
        if size > limit {
            return Err(self.invalid(format!("copy of {} bytes exceeds the {} byte buffers", size, limit)));
        }
        self.backend.cmd_copy_buffer(self.cb, src_raw, dst_raw, size);
        Ok(())
    }

    /// Closes a rendering scope the pass left open.
    pub(crate) fn finish(&mut self) {
        if self.rendering {
            warn!("Pass '{}' left rendering open", self.pass);
            self.backend.cmd_end_rendering(self.cb);
            self.rendering = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimulatedDevice};
    use crate::memory::DeviceMemoryAllocator;
    use crate::resource::{BufferDesc, ImageDesc, ImageSize};
    use rstest::rstest;

    struct Resources {
        arena: ResourceArena,
        color: ImageHandle,
        texture: ImageHandle,
        params: BufferHandle,
    }

    fn resources() -> Resources {
        let device = SimulatedDevice::new(SimConfig::default());
        let mut allocator = DeviceMemoryAllocator::new(device.memory_properties(), 1 << 20);
        let mut arena = ResourceArena::new();
        let extent = vk::Extent2D { width: 64, height: 64 };
        let color = arena
            .create_image(
                &device,
                &mut allocator,
                ImageDesc::new(
                    "color",
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    ImageSize::SwapchainRelative { scale: 1.0 },
                ),
                extent,
            )
            .unwrap();
        let texture = arena
            .create_image(
                &device,
                &mut allocator,
                ImageDesc::new(
                    "texture",
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ImageUsageFlags::SAMPLED,
                    ImageSize::Absolute { width: 64, height: 64 },
                )
                .with_mip_levels(4),
                extent,
            )
            .unwrap();
        let params = arena
            .create_buffer(
                &device,
                &mut allocator,
                BufferDesc::new("params", 64, vk::BufferUsageFlags::UNIFORM_BUFFER),
            )
            .unwrap();
        Resources {
            arena,
            color,
            texture,
            params,
        }
    }

    #[test]
    fn well_formed_pass_validates() {
        let r = resources();
        let pass = PassDesc::graphics("lighting")
            .read(r.texture, ResourceUsage::fragment_sampled())
            .read(r.params, ResourceUsage::uniform_read(vk::PipelineStageFlags::FRAGMENT_SHADER))
            .write(r.color, ResourceUsage::color_attachment_write());
        pass.validate(&r.arena).unwrap();
        assert!(pass.uses(r.params.into()));
        assert_eq!(pass.accesses().count(), 3);
    }

    #[rstest]
    #[case::read_with_write_usage(0)]
    #[case::write_without_write_access(1)]
    #[case::duplicate(2)]
    #[case::image_without_layout(3)]
    #[case::range_out_of_bounds(4)]
    #[case::mips_without_transfer_usage(5)]
    fn malformed_passes_are_rejected(#[case] case: usize) {
        let r = resources();
        let pass = match case {
            0 => PassDesc::graphics("p").read(r.color, ResourceUsage::color_attachment_write()),
            1 => PassDesc::graphics("p").write(r.texture, ResourceUsage::fragment_sampled()),
            2 => PassDesc::graphics("p")
                .read(r.texture, ResourceUsage::fragment_sampled())
                .read(r.texture, ResourceUsage::fragment_sampled()),
            3 => PassDesc::graphics("p").read(
                r.texture,
                ResourceUsage::uniform_read(vk::PipelineStageFlags::FRAGMENT_SHADER),
            ),
            4 => PassDesc::graphics("p").read_range(
                r.texture,
                ResourceUsage::fragment_sampled(),
                Some(SubresourceRange::mip(4, 1)),
            ),
            _ => PassDesc::generate_mips("p", r.texture),
        };
        assert!(matches!(
            pass.validate(&r.arena),
            Err(RenderGraphError::InvalidPass { .. })
        ));
    }

    #[test]
    fn distinct_mip_ranges_of_one_image_are_allowed() {
        let r = resources();
        let pass = PassDesc::graphics("downsample")
            .read_range(
                r.texture,
                ResourceUsage::fragment_sampled(),
                Some(SubresourceRange::mip(0, 1)),
            )
            .write_range(
                r.texture,
                ResourceUsage::color_attachment_write(),
                Some(SubresourceRange::mip(1, 1)),
            );
        pass.validate(&r.arena).unwrap();
    }
}
