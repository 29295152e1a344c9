//! Descriptor sets bound against a pipeline's layout.
//!
//! Sets are written from resource handles, not device handles, so they can be
//! rewritten in place when a resize replaces the images behind them.

use crate::backend::{DescriptorBindingDesc, DescriptorWrite, GpuBackend};
use crate::error::{RenderGraphError, Result};
use crate::pipeline::{PipelineCache, PipelineHandle};
use crate::resource::{BufferHandle, ImageHandle, ResourceArena, ResourceHandle};
use ash::vk;
use slotmap::SlotMap;
use tracing::{debug, info};

slotmap::new_key_type! {
    /// Handle of a descriptor set built by [`DescriptorBinder`].
    pub struct DescriptorSetHandle;
}

/// What a binding slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    SampledImage(ImageHandle),
    StorageImage(ImageHandle),
    /// Uses the sampler created with the image.
    CombinedImageSampler(ImageHandle),
    UniformBuffer(BufferHandle),
    StorageBuffer(BufferHandle),
}

impl BindingResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            BindingResource::SampledImage(_) => vk::DescriptorType::SAMPLED_IMAGE,
            BindingResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            BindingResource::CombinedImageSampler(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingResource::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            BindingResource::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    pub fn resource(&self) -> ResourceHandle {
        match *self {
            BindingResource::SampledImage(h)
            | BindingResource::StorageImage(h)
            | BindingResource::CombinedImageSampler(h) => h.into(),
            BindingResource::UniformBuffer(h) | BindingResource::StorageBuffer(h) => h.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub binding: u32,
    pub resource: BindingResource,
}

impl Binding {
    pub fn new(binding: u32, resource: BindingResource) -> Self {
        Self { binding, resource }
    }
}

#[derive(Debug)]
struct BoundSet {
    pipeline: PipelineHandle,
    set: vk::DescriptorSet,
    bindings: Vec<Binding>,
}

const DEFAULT_SETS_PER_POOL: u32 = 64;

/// Allocates and writes descriptor sets. Pools grow on demand and are only
/// released at teardown.
#[derive(Debug)]
pub struct DescriptorBinder {
    pools: Vec<vk::DescriptorPool>,
    sets: SlotMap<DescriptorSetHandle, BoundSet>,
    sets_per_pool: u32,
}

impl Default for DescriptorBinder {
    fn default() -> Self {
        Self::new(DEFAULT_SETS_PER_POOL)
    }
}

impl DescriptorBinder {
    pub fn new(sets_per_pool: u32) -> Self {
        Self {
            pools: Vec::new(),
            sets: SlotMap::with_key(),
            sets_per_pool: sets_per_pool.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn grow(&mut self, backend: &dyn GpuBackend) -> Result<vk::DescriptorPool> {
        let per_type = self.sets_per_pool * 4;
        let sizes = [
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: per_type,
        });
        let pool = backend.create_descriptor_pool(self.sets_per_pool, &sizes)?;
        self.pools.push(pool);
        debug!("Created descriptor pool {} ({} sets)", self.pools.len(), self.sets_per_pool);
        Ok(pool)
    }

    fn allocate(&mut self, backend: &dyn GpuBackend, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        if let Some(&pool) = self.pools.last() {
            if let Some(set) = backend.allocate_descriptor_set(pool, layout)? {
                return Ok(set);
            }
        }
        let pool = self.grow(backend)?;
        backend
            .allocate_descriptor_set(pool, layout)?
            .ok_or(RenderGraphError::Vk(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    /// Allocates a set for `pipeline` and writes `bindings` into it.
    ///
    /// Every layout slot must be bound exactly once with a resource of the
    /// declared kind that was created with the matching usage.
    pub fn build(
        &mut self,
        backend: &dyn GpuBackend,
        pipelines: &PipelineCache,
        resources: &ResourceArena,
        pipeline: PipelineHandle,
        bindings: &[Binding],
    ) -> Result<DescriptorSetHandle> {
        let name = pipelines.name(pipeline)?;
        check_bindings(name, pipelines.bindings(pipeline)?, bindings, resources)?;
        let writes = resolve_writes(resources, bindings)?;
        let set = self.allocate(backend, pipelines.set_layout(pipeline)?)?;
        backend.write_descriptor_set(set, &writes);
        debug!("Built descriptor set for '{}' with {} bindings", name, bindings.len());
        Ok(self.sets.insert(BoundSet {
            pipeline,
            set,
            bindings: bindings.to_vec(),
        }))
    }

    /// Rewrites every set that refers to one of `changed`. Only valid while no
    /// submitted work uses the sets.
    pub fn refresh(
        &mut self,
        backend: &dyn GpuBackend,
        resources: &ResourceArena,
        changed: &[ResourceHandle],
    ) -> Result<usize> {
        let mut count = 0;
        for (_, bound) in self.sets.iter() {
            if !bound.bindings.iter().any(|b| changed.contains(&b.resource.resource())) {
                continue;
            }
            let writes = resolve_writes(resources, &bound.bindings)?;
            backend.write_descriptor_set(bound.set, &writes);
            count += 1;
        }
        if count > 0 {
            info!("Rewrote {} descriptor sets after resource rebuild", count);
        }
        Ok(count)
    }

    pub fn set(&self, handle: DescriptorSetHandle) -> Result<vk::DescriptorSet> {
        self.entry(handle).map(|b| b.set)
    }

    pub fn pipeline_of(&self, handle: DescriptorSetHandle) -> Result<PipelineHandle> {
        self.entry(handle).map(|b| b.pipeline)
    }

    pub fn resources(&self, handle: DescriptorSetHandle) -> Result<Vec<ResourceHandle>> {
        self.entry(handle)
            .map(|b| b.bindings.iter().map(|binding| binding.resource.resource()).collect())
    }

    /// The pipeline of the first live set that binds `resource`.
    pub fn bound_by(&self, resource: ResourceHandle) -> Option<PipelineHandle> {
        self.sets
            .values()
            .find(|bound| bound.bindings.iter().any(|b| b.resource.resource() == resource))
            .map(|bound| bound.pipeline)
    }

    /// Forgets a set. Its pool slot is reclaimed at teardown.
    pub fn remove(&mut self, handle: DescriptorSetHandle) -> Result<()> {
        self.sets
            .remove(handle)
            .map(|_| ())
            .ok_or(RenderGraphError::InvalidHandle { kind: "descriptor set" })
    }

    fn entry(&self, handle: DescriptorSetHandle) -> Result<&BoundSet> {
        self.sets
            .get(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "descriptor set" })
    }

    pub(crate) fn destroy_all(&mut self, backend: &dyn GpuBackend) {
        self.sets.clear();
        for pool in self.pools.drain(..) {
            backend.destroy_descriptor_pool(pool);
        }
    }
}

fn check_bindings(
    pipeline: &str,
    layout: &[DescriptorBindingDesc],
    bindings: &[Binding],
    resources: &ResourceArena,
) -> Result<()> {
    let invalid = |reason: String| RenderGraphError::InvalidPipelineState {
        pipeline: pipeline.to_string(),
        reason,
    };
    for (i, binding) in bindings.iter().enumerate() {
        if bindings[..i].iter().any(|b| b.binding == binding.binding) {
            return Err(invalid(format!("binding {} bound twice", binding.binding)));
        }
        let slot = layout
            .iter()
            .find(|slot| slot.binding == binding.binding)
            .ok_or_else(|| invalid(format!("binding {} is not in the layout", binding.binding)))?;
        let ty = binding.resource.descriptor_type();
        if slot.ty != ty {
            return Err(invalid(format!(
                "binding {} expects {:?}, got {:?}",
                binding.binding, slot.ty, ty
            )));
        }
        check_usage(binding, resources).map_err(invalid)?;
    }
    if let Some(missing) = layout
        .iter()
        .find(|slot| !bindings.iter().any(|b| b.binding == slot.binding))
    {
        return Err(invalid(format!("binding {} left unbound", missing.binding)));
    }
    Ok(())
}

fn check_usage(binding: &Binding, resources: &ResourceArena) -> std::result::Result<(), String> {
    let name = resources.name_of(binding.resource.resource()).to_string();
    let missing = |what: &str| {
        Err(format!(
            "'{}' at binding {} was not created with {}",
            name, binding.binding, what
        ))
    };
    let image_usage = |h: ImageHandle| resources.image(h).map(|i| i.desc().usage).map_err(|e| e.to_string());
    let buffer_usage = |h: BufferHandle| resources.buffer(h).map(|b| b.usage()).map_err(|e| e.to_string());
    match binding.resource {
        BindingResource::SampledImage(h) => {
            if !image_usage(h)?.contains(vk::ImageUsageFlags::SAMPLED) {
                return missing("SAMPLED usage");
            }
        }
        BindingResource::CombinedImageSampler(h) => {
            if !image_usage(h)?.contains(vk::ImageUsageFlags::SAMPLED) {
                return missing("SAMPLED usage");
            }
            if resources.image(h).map_err(|e| e.to_string())?.sampler().is_none() {
                return missing("a sampler");
            }
        }
        BindingResource::StorageImage(h) => {
            if !image_usage(h)?.contains(vk::ImageUsageFlags::STORAGE) {
                return missing("STORAGE usage");
            }
        }
        BindingResource::UniformBuffer(h) => {
            if !buffer_usage(h)?.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
                return missing("UNIFORM_BUFFER usage");
            }
        }
        BindingResource::StorageBuffer(h) => {
            if !buffer_usage(h)?.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
                return missing("STORAGE_BUFFER usage");
            }
        }
    }
    Ok(())
}

fn resolve_writes(resources: &ResourceArena, bindings: &[Binding]) -> Result<Vec<DescriptorWrite>> {
    bindings
        .iter()
        .map(|binding| {
            let ty = binding.resource.descriptor_type();
            Ok(match binding.resource {
                BindingResource::SampledImage(h) | BindingResource::CombinedImageSampler(h) => {
                    let image = resources.image(h)?;
                    let layout = if image.aspect().contains(vk::ImageAspectFlags::DEPTH) {
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    };
                    let sampler = match binding.resource {
                        BindingResource::CombinedImageSampler(_) => image.sampler().unwrap_or_default(),
                        _ => vk::Sampler::null(),
                    };
                    DescriptorWrite::Image {
                        binding: binding.binding,
                        ty,
                        view: image.view(),
                        layout,
                        sampler,
                    }
                }
                BindingResource::StorageImage(h) => DescriptorWrite::Image {
                    binding: binding.binding,
                    ty,
                    view: resources.image(h)?.view(),
                    layout: vk::ImageLayout::GENERAL,
                    sampler: vk::Sampler::null(),
                },
                BindingResource::UniformBuffer(h) | BindingResource::StorageBuffer(h) => DescriptorWrite::Buffer {
                    binding: binding.binding,
                    ty,
                    buffer: resources.buffer(h)?.raw(),
                    range: vk::WHOLE_SIZE,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimulatedDevice};
    use crate::backend::SamplerInfo;
    use crate::memory::DeviceMemoryAllocator;
    use crate::pipeline::{PipelineDesc, ShaderStageDesc, SPIRV_MAGIC};
    use crate::resource::{BufferDesc, ImageDesc, ImageSize};
    use pretty_assertions::assert_eq;

    struct Fixture {
        device: SimulatedDevice,
        allocator: DeviceMemoryAllocator,
        arena: ResourceArena,
        pipelines: PipelineCache,
        pipeline: PipelineHandle,
    }

    fn module(tag: u32) -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, tag, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    fn fixture() -> Fixture {
        let device = SimulatedDevice::new(SimConfig::default());
        let allocator = DeviceMemoryAllocator::new(device.memory_properties(), 1 << 20);
        let mut pipelines = PipelineCache::new(vk::Format::B8G8R8A8_SRGB);
        let pipeline = pipelines
            .get_or_build(
                &device,
                PipelineDesc::compute("tonemap")
                    .with_stage(ShaderStageDesc::compute(module(1)))
                    .with_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::COMPUTE)
                    .with_binding(1, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::COMPUTE),
            )
            .unwrap();
        Fixture {
            device,
            allocator,
            arena: ResourceArena::new(),
            pipelines,
            pipeline,
        }
    }

    impl Fixture {
        fn hdr(&mut self, sampler: bool) -> ImageHandle {
            let mut desc = ImageDesc::new(
                if sampler { "hdr" } else { "hdr-raw" },
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                ImageSize::SwapchainRelative { scale: 1.0 },
            );
            if sampler {
                desc = desc.with_sampler(SamplerInfo::default());
            }
            self.arena
                .create_image(&self.device, &mut self.allocator, desc, vk::Extent2D { width: 64, height: 64 })
                .unwrap()
        }

        fn params(&mut self) -> BufferHandle {
            self.arena
                .create_buffer(
                    &self.device,
                    &mut self.allocator,
                    BufferDesc::new("params", 256, vk::BufferUsageFlags::UNIFORM_BUFFER).host_visible(),
                )
                .unwrap()
        }
    }

    #[test]
    fn writes_every_binding() {
        let mut f = fixture();
        let hdr = f.hdr(true);
        let params = f.params();
        let mut binder = DescriptorBinder::default();
        let handle = binder
            .build(
                &f.device,
                &f.pipelines,
                &f.arena,
                f.pipeline,
                &[
                    Binding::new(0, BindingResource::CombinedImageSampler(hdr)),
                    Binding::new(1, BindingResource::UniformBuffer(params)),
                ],
            )
            .unwrap();
        let writes = f.device.descriptor_writes(binder.set(handle).unwrap());
        assert_eq!(writes.len(), 2);
        assert_eq!(
            binder.resources(handle).unwrap(),
            vec![ResourceHandle::from(hdr), ResourceHandle::from(params)]
        );
        assert_eq!(binder.pipeline_of(handle).unwrap(), f.pipeline);
    }

    #[test]
    fn rejects_mismatched_and_missing_bindings() {
        let mut f = fixture();
        let hdr = f.hdr(true);
        let raw = f.hdr(false);
        let params = f.params();
        let mut binder = DescriptorBinder::default();
        let cases = [
            vec![
                Binding::new(0, BindingResource::UniformBuffer(params)),
                Binding::new(1, BindingResource::UniformBuffer(params)),
            ],
            vec![Binding::new(0, BindingResource::CombinedImageSampler(hdr))],
            vec![
                Binding::new(0, BindingResource::CombinedImageSampler(raw)),
                Binding::new(1, BindingResource::UniformBuffer(params)),
            ],
            vec![
                Binding::new(0, BindingResource::CombinedImageSampler(hdr)),
                Binding::new(1, BindingResource::UniformBuffer(params)),
                Binding::new(7, BindingResource::UniformBuffer(params)),
            ],
        ];
        for bindings in cases {
            assert!(matches!(
                binder.build(&f.device, &f.pipelines, &f.arena, f.pipeline, &bindings),
                Err(RenderGraphError::InvalidPipelineState { .. })
            ));
        }
        assert!(binder.is_empty());
    }

    #[test]
    fn pools_grow_when_exhausted() {
        let mut f = fixture();
        let hdr = f.hdr(true);
        let params = f.params();
        let mut binder = DescriptorBinder::new(1);
        let bindings = [
            Binding::new(0, BindingResource::CombinedImageSampler(hdr)),
            Binding::new(1, BindingResource::UniformBuffer(params)),
        ];
        for _ in 0..3 {
            binder
                .build(&f.device, &f.pipelines, &f.arena, f.pipeline, &bindings)
                .unwrap();
        }
        assert_eq!(binder.pool_count(), 3);
        assert_eq!(binder.len(), 3);
        binder.destroy_all(&f.device);
        assert!(f.device.violations().is_empty());
    }

    #[test]
    fn refresh_rewrites_sets_after_rebuild() {
        let mut f = fixture();
        let hdr = f.hdr(true);
        let params = f.params();
        let mut binder = DescriptorBinder::default();
        let handle = binder
            .build(
                &f.device,
                &f.pipelines,
                &f.arena,
                f.pipeline,
                &[
                    Binding::new(0, BindingResource::CombinedImageSampler(hdr)),
                    Binding::new(1, BindingResource::UniformBuffer(params)),
                ],
            )
            .unwrap();
        let old_view = f.arena.image(hdr).unwrap().view();

        let retired = f
            .arena
            .rebuild_relative(&f.device, &mut f.allocator, vk::Extent2D { width: 128, height: 128 })
            .unwrap();
        assert_eq!(retired.len(), 1);
        let new_view = f.arena.image(hdr).unwrap().view();
        assert_ne!(old_view, new_view);

        assert_eq!(binder.refresh(&f.device, &f.arena, &[params.into()]).unwrap(), 1);
        assert_eq!(binder.refresh(&f.device, &f.arena, &[hdr.into()]).unwrap(), 1);
        let views: Vec<vk::ImageView> = f
            .device
            .descriptor_writes(binder.set(handle).unwrap())
            .into_iter()
            .filter_map(|w| match w {
                DescriptorWrite::Image { view, .. } => Some(view),
                DescriptorWrite::Buffer { .. } => None,
            })
            .collect();
        assert_eq!(views, vec![new_view]);
    }
}
