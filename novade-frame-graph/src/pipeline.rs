//! Pipeline cache.
//!
//! Pipelines are built once per unique combination of shader code, render
//! target formats and fixed-function state and handed out as stable
//! [`PipelineHandle`]s. A handle survives rebuilds: when a shader is reloaded
//! or the backbuffer format changes, only the device pipeline behind it is
//! replaced, lazily, the next time a pass binds it. Replaced device pipelines
//! are retired with the frame that last bound them.

use crate::backend::{DescriptorBindingDesc, GpuBackend, GraphicsPipelineBuild, RasterState, ShaderModuleRef};
use crate::error::{RenderGraphError, Result};
use crate::resource::image::is_depth_format;
use crate::resource::RetiredObject;
use ash::vk;
use slotmap::SlotMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use tracing::{debug, info, warn};

slotmap::new_key_type! {
    /// Handle of a cached pipeline.
    pub struct PipelineHandle;
}

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;
const SPIRV_HEADER_WORDS: usize = 5;

/// Decodes SPIR-V bytes into words, checking the header.
pub fn parse_spirv(stage: vk::ShaderStageFlags, code: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(code)).map_err(|e| RenderGraphError::ShaderCompile {
        stage,
        message: e.to_string(),
    })?;
    if words.len() < SPIRV_HEADER_WORDS {
        return Err(RenderGraphError::ShaderCompile {
            stage,
            message: format!("module has {} words, shorter than the SPIR-V header", words.len()),
        });
    }
    Ok(words)
}

/// A descriptor binding a shader stage expects, as reported by reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub ty: vk::DescriptorType,
}

/// One shader stage of a pipeline.
#[derive(Debug, Clone)]
pub struct ShaderStageDesc {
    pub stage: vk::ShaderStageFlags,
    /// SPIR-V bytes.
    pub code: Vec<u8>,
    pub entry: String,
    pub reflected: Vec<ReflectedBinding>,
}

impl ShaderStageDesc {
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u8>) -> Self {
        Self {
            stage,
            code,
            entry: "main".to_string(),
            reflected: Vec::new(),
        }
    }

    pub fn vertex(code: Vec<u8>) -> Self {
        Self::new(vk::ShaderStageFlags::VERTEX, code)
    }

    pub fn fragment(code: Vec<u8>) -> Self {
        Self::new(vk::ShaderStageFlags::FRAGMENT, code)
    }

    pub fn compute(code: Vec<u8>) -> Self {
        Self::new(vk::ShaderStageFlags::COMPUTE, code)
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_reflected_binding(mut self, set: u32, binding: u32, ty: vk::DescriptorType) -> Self {
        self.reflected.push(ReflectedBinding { set, binding, ty });
        self
    }

    /// Hash of the SPIR-V bytes, the key for [`PipelineCache::invalidate_shader`].
    pub fn code_hash(&self) -> u64 {
        hash_code(&self.code)
    }
}

fn hash_code(code: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    hasher.finish()
}

/// A color or depth target format. `Backbuffer` follows the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Backbuffer,
    Format(vk::Format),
}

impl TargetFormat {
    fn resolve(self, backbuffer: vk::Format) -> vk::Format {
        match self {
            TargetFormat::Backbuffer => backbuffer,
            TargetFormat::Format(format) => format,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineKind {
    Graphics {
        color_targets: Vec<TargetFormat>,
        depth_target: Option<vk::Format>,
        raster: RasterState,
    },
    Compute,
}

/// Everything needed to build a pipeline.
///
/// The layout has a single descriptor set (set 0) made of `bindings`.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub name: String,
    pub kind: PipelineKind,
    pub stages: Vec<ShaderStageDesc>,
    pub bindings: Vec<DescriptorBindingDesc>,
    pub push_constant_bytes: u32,
}

impl PipelineDesc {
    pub fn graphics(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Graphics {
                color_targets: Vec::new(),
                depth_target: None,
                raster: RasterState::default(),
            },
            stages: Vec::new(),
            bindings: Vec::new(),
            push_constant_bytes: 0,
        }
    }

    pub fn compute(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Compute,
            stages: Vec::new(),
            bindings: Vec::new(),
            push_constant_bytes: 0,
        }
    }

    pub fn with_stage(mut self, stage: ShaderStageDesc) -> Self {
        self.stages.push(stage);
        self
    }

    /// Ignored for compute pipelines.
    pub fn with_color_target(mut self, target: TargetFormat) -> Self {
        if let PipelineKind::Graphics { color_targets, .. } = &mut self.kind {
            color_targets.push(target);
        }
        self
    }

    /// Ignored for compute pipelines.
    pub fn with_depth_target(mut self, format: vk::Format) -> Self {
        if let PipelineKind::Graphics { depth_target, .. } = &mut self.kind {
            *depth_target = Some(format);
        }
        self
    }

    /// Ignored for compute pipelines.
    pub fn with_raster(mut self, state: RasterState) -> Self {
        if let PipelineKind::Graphics { raster, .. } = &mut self.kind {
            *raster = state;
        }
        self
    }

    pub fn with_binding(mut self, binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(DescriptorBindingDesc {
            binding,
            ty,
            count: 1,
            stages,
        });
        self
    }

    pub fn with_push_constants(mut self, bytes: u32) -> Self {
        self.push_constant_bytes = bytes;
        self
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics { .. } => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn targets(&self, target: TargetFormat) -> bool {
        match &self.kind {
            PipelineKind::Graphics {
                color_targets,
                depth_target,
                ..
            } => {
                color_targets.contains(&target)
                    || matches!(target, TargetFormat::Format(f) if *depth_target == Some(f))
            }
            PipelineKind::Compute => false,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> RenderGraphError {
        RenderGraphError::InvalidPipelineState {
            pipeline: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Checks shaders, stage set, targets and the reflected bindings
    /// against the declared layout.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(self.invalid("no shader stages"));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            parse_spirv(stage.stage, &stage.code)?;
            if stage.entry.is_empty() || stage.entry.contains('\0') {
                return Err(RenderGraphError::ShaderCompile {
                    stage: stage.stage,
                    message: format!("invalid entry point name {:?}", stage.entry),
                });
            }
            if self.stages[..i].iter().any(|s| s.stage == stage.stage) {
                return Err(self.invalid(format!("stage {:?} given twice", stage.stage)));
            }
        }

        match &self.kind {
            PipelineKind::Graphics {
                color_targets,
                depth_target,
                raster,
            } => {
                if !self.stages.iter().any(|s| s.stage == vk::ShaderStageFlags::VERTEX) {
                    return Err(self.invalid("graphics pipeline has no vertex stage"));
                }
                if self.stages.iter().any(|s| s.stage == vk::ShaderStageFlags::COMPUTE) {
                    return Err(self.invalid("compute stage in a graphics pipeline"));
                }
                if color_targets.is_empty() && depth_target.is_none() {
                    return Err(self.invalid("graphics pipeline has no render targets"));
                }
                match depth_target {
                    Some(format) if !is_depth_format(*format) => {
                        return Err(self.invalid(format!("{:?} is not a depth format", format)));
                    }
                    None if raster.depth_test || raster.depth_write => {
                        return Err(self.invalid("depth testing without a depth target"));
                    }
                    _ => {}
                }
            }
            PipelineKind::Compute => {
                if self.stages.len() != 1 || self.stages[0].stage != vk::ShaderStageFlags::COMPUTE {
                    return Err(self.invalid("compute pipeline needs exactly one compute stage"));
                }
            }
        }

        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.binding == binding.binding) {
                return Err(self.invalid(format!("binding {} declared twice", binding.binding)));
            }
        }
        for stage in &self.stages {
            for reflected in &stage.reflected {
                if reflected.set != 0 {
                    return Err(self.invalid(format!(
                        "{:?} stage uses descriptor set {}; only set 0 is bound",
                        stage.stage, reflected.set
                    )));
                }
                match self.bindings.iter().find(|b| b.binding == reflected.binding) {
                    None => {
                        return Err(self.invalid(format!(
                            "{:?} stage expects binding {} ({:?}) that the layout does not declare",
                            stage.stage, reflected.binding, reflected.ty
                        )))
                    }
                    Some(b) if b.ty != reflected.ty => {
                        return Err(self.invalid(format!(
                            "binding {} is {:?} in the layout but {:?} in the {:?} stage",
                            b.binding, b.ty, reflected.ty, stage.stage
                        )))
                    }
                    Some(b) if !b.stages.contains(stage.stage) => {
                        return Err(self.invalid(format!(
                            "binding {} is not visible to the {:?} stage",
                            b.binding, stage.stage
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    stages: Vec<(vk::ShaderStageFlags, u64, String)>,
    color_targets: Vec<TargetFormat>,
    depth_target: Option<vk::Format>,
    raster: Option<RasterState>,
    bindings: Vec<DescriptorBindingDesc>,
    push_constant_bytes: u32,
}

impl PipelineKey {
    fn of(desc: &PipelineDesc) -> Self {
        let (color_targets, depth_target, raster) = match &desc.kind {
            PipelineKind::Graphics {
                color_targets,
                depth_target,
                raster,
            } => (color_targets.clone(), *depth_target, Some(raster.clone())),
            PipelineKind::Compute => (Vec::new(), None, None),
        };
        Self {
            stages: desc
                .stages
                .iter()
                .map(|s| (s.stage, s.code_hash(), s.entry.clone()))
                .collect(),
            color_targets,
            depth_target,
            raster,
            bindings: desc.bindings.clone(),
            push_constant_bytes: desc.push_constant_bytes,
        }
    }

    fn uses_code(&self, code_hash: u64) -> bool {
        self.stages.iter().any(|(_, hash, _)| *hash == code_hash)
    }
}

#[derive(Debug)]
struct CachedPipeline {
    desc: PipelineDesc,
    key: PipelineKey,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    /// `None` once invalidated; rebuilt on the next bind.
    raw: Option<vk::Pipeline>,
    last_used_frame: u64,
    builds: u32,
}

fn create_layouts(
    backend: &dyn GpuBackend,
    desc: &PipelineDesc,
) -> Result<(vk::DescriptorSetLayout, vk::PipelineLayout)> {
    let set_layout = backend.create_descriptor_set_layout(&desc.bindings)?;
    match backend.create_pipeline_layout(&[set_layout], desc.push_constant_bytes) {
        Ok(layout) => Ok((set_layout, layout)),
        Err(e) => {
            backend.destroy_descriptor_set_layout(set_layout);
            Err(e)
        }
    }
}

fn build_pipeline(
    backend: &dyn GpuBackend,
    desc: &PipelineDesc,
    layout: vk::PipelineLayout,
    backbuffer_format: vk::Format,
) -> Result<vk::Pipeline> {
    let mut modules = Vec::with_capacity(desc.stages.len());
    let mut entries = Vec::with_capacity(desc.stages.len());
    let mut failure = None;
    for stage in &desc.stages {
        let words = match parse_spirv(stage.stage, &stage.code) {
            Ok(words) => words,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        let entry = match CString::new(stage.entry.as_str()) {
            Ok(entry) => entry,
            Err(_) => {
                failure = Some(RenderGraphError::ShaderCompile {
                    stage: stage.stage,
                    message: format!("invalid entry point name {:?}", stage.entry),
                });
                break;
            }
        };
        match backend.create_shader_module(&words) {
            Ok(module) => {
                modules.push((stage.stage, module));
                entries.push(entry);
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let result = match failure {
        Some(e) => Err(e),
        None => {
            let refs: Vec<ShaderModuleRef<'_>> = modules
                .iter()
                .zip(&entries)
                .map(|(&(stage, module), entry)| ShaderModuleRef {
                    stage,
                    module,
                    entry: entry.as_c_str(),
                })
                .collect();
            match &desc.kind {
                PipelineKind::Graphics {
                    color_targets,
                    depth_target,
                    raster,
                } => {
                    let color_formats: Vec<vk::Format> =
                        color_targets.iter().map(|t| t.resolve(backbuffer_format)).collect();
                    backend.create_graphics_pipeline(&GraphicsPipelineBuild {
                        name: &desc.name,
                        layout,
                        stages: &refs,
                        color_formats: &color_formats,
                        depth_format: *depth_target,
                        raster,
                    })
                }
                PipelineKind::Compute => backend.create_compute_pipeline(layout, &refs[0]),
            }
        }
    };

    // Modules are only needed while the pipeline is created.
    for (_, module) in modules {
        backend.destroy_shader_module(module);
    }
    result
}

fn retire_raw(entry: &mut CachedPipeline, retired: &mut Vec<(RetiredObject, u64)>) -> bool {
    match entry.raw.take() {
        Some(raw) => {
            retired.push((RetiredObject::Pipeline(raw), entry.last_used_frame));
            true
        }
        None => false,
    }
}

/// Deduplicating store of graphics and compute pipelines.
#[derive(Debug)]
pub struct PipelineCache {
    pipelines: SlotMap<PipelineHandle, CachedPipeline>,
    by_key: HashMap<PipelineKey, PipelineHandle>,
    backbuffer_format: vk::Format,
    retired: Vec<(RetiredObject, u64)>,
}

impl PipelineCache {
    pub fn new(backbuffer_format: vk::Format) -> Self {
        Self {
            pipelines: SlotMap::with_key(),
            by_key: HashMap::new(),
            backbuffer_format,
            retired: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn contains(&self, handle: PipelineHandle) -> bool {
        self.pipelines.contains_key(handle)
    }

    pub fn backbuffer_format(&self) -> vk::Format {
        self.backbuffer_format
    }

    fn entry(&self, handle: PipelineHandle) -> Result<&CachedPipeline> {
        self.pipelines
            .get(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "pipeline" })
    }

    /// Returns the handle of an equivalent pipeline, building one if none exists.
    pub fn get_or_build(&mut self, backend: &dyn GpuBackend, desc: PipelineDesc) -> Result<PipelineHandle> {
        let key = PipelineKey::of(&desc);
        if let Some(&handle) = self.by_key.get(&key) {
            debug!("Pipeline cache hit for '{}'", desc.name);
            return Ok(handle);
        }
        desc.validate()?;
        let (set_layout, layout) = create_layouts(backend, &desc)?;
        let raw = match build_pipeline(backend, &desc, layout, self.backbuffer_format) {
            Ok(raw) => raw,
            Err(e) => {
                backend.destroy_pipeline_layout(layout);
                backend.destroy_descriptor_set_layout(set_layout);
                return Err(e);
            }
        };
        info!("Built {:?} pipeline '{}'", desc.bind_point(), desc.name);
        let handle = self.pipelines.insert(CachedPipeline {
            desc,
            key: key.clone(),
            set_layout,
            layout,
            raw: Some(raw),
            last_used_frame: 0,
            builds: 1,
        });
        self.by_key.insert(key, handle);
        Ok(handle)
    }

    /// Returns the device pipeline behind `handle`, rebuilding it if it was
    /// invalidated, and records its use by `frame_number`.
    pub fn resolve(
        &mut self,
        backend: &dyn GpuBackend,
        handle: PipelineHandle,
        frame_number: u64,
    ) -> Result<vk::Pipeline> {
        let backbuffer_format = self.backbuffer_format;
        let entry = self
            .pipelines
            .get_mut(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "pipeline" })?;
        let raw = match entry.raw {
            Some(raw) => raw,
            None => {
                let raw = build_pipeline(backend, &entry.desc, entry.layout, backbuffer_format)?;
                entry.raw = Some(raw);
                entry.builds += 1;
                debug!("Rebuilt pipeline '{}' (build {})", entry.desc.name, entry.builds);
                raw
            }
        };
        entry.last_used_frame = entry.last_used_frame.max(frame_number);
        Ok(raw)
    }

    pub fn name(&self, handle: PipelineHandle) -> Result<&str> {
        Ok(&self.entry(handle)?.desc.name)
    }

    pub fn bind_point(&self, handle: PipelineHandle) -> Result<vk::PipelineBindPoint> {
        Ok(self.entry(handle)?.desc.bind_point())
    }

    pub fn layout(&self, handle: PipelineHandle) -> Result<vk::PipelineLayout> {
        Ok(self.entry(handle)?.layout)
    }

    pub fn set_layout(&self, handle: PipelineHandle) -> Result<vk::DescriptorSetLayout> {
        Ok(self.entry(handle)?.set_layout)
    }

    pub fn bindings(&self, handle: PipelineHandle) -> Result<&[DescriptorBindingDesc]> {
        Ok(&self.entry(handle)?.desc.bindings)
    }

    /// Number of device pipelines built for `handle` so far.
    pub fn build_count(&self, handle: PipelineHandle) -> Result<u32> {
        Ok(self.entry(handle)?.builds)
    }

    pub fn is_built(&self, handle: PipelineHandle) -> bool {
        self.pipelines.get(handle).is_some_and(|e| e.raw.is_some())
    }

    /// Marks every pipeline using the shader code with `code_hash` for rebuild.
    pub fn invalidate_shader(&mut self, code_hash: u64) -> usize {
        let mut count = 0;
        for (_, entry) in self.pipelines.iter_mut() {
            if entry.key.uses_code(code_hash) && retire_raw(entry, &mut self.retired) {
                count += 1;
            }
        }
        if count > 0 {
            info!("Invalidated {} pipelines using shader {:#018x}", count, code_hash);
        }
        count
    }

    /// Swaps the stage whose code hashes to `old_hash` for `replacement` in
    /// every pipeline that uses it. Nothing changes if any affected pipeline
    /// fails validation with the new stage.
    pub fn reload_shader(&mut self, old_hash: u64, replacement: ShaderStageDesc) -> Result<usize> {
        let mut updated = Vec::new();
        for (handle, entry) in self.pipelines.iter() {
            let Some(index) = entry
                .desc
                .stages
                .iter()
                .position(|s| s.stage == replacement.stage && s.code_hash() == old_hash)
            else {
                continue;
            };
            let mut desc = entry.desc.clone();
            desc.stages[index] = replacement.clone();
            desc.validate()?;
            updated.push((handle, desc));
        }

        let count = updated.len();
        for (handle, desc) in updated {
            let key = PipelineKey::of(&desc);
            if let Some(entry) = self.pipelines.get_mut(handle) {
                if self.by_key.get(&entry.key) == Some(&handle) {
                    self.by_key.remove(&entry.key);
                }
                retire_raw(entry, &mut self.retired);
                entry.desc = desc;
                entry.key = key.clone();
                self.by_key.entry(key).or_insert(handle);
            }
        }
        if count > 0 {
            info!("Reloaded {:?} shader in {} pipelines", replacement.stage, count);
        }
        Ok(count)
    }

    /// Marks every graphics pipeline rendering to `target` for rebuild.
    pub fn invalidate_target_format(&mut self, target: TargetFormat) -> usize {
        let mut count = 0;
        for (_, entry) in self.pipelines.iter_mut() {
            if entry.desc.targets(target) && retire_raw(entry, &mut self.retired) {
                count += 1;
            }
        }
        if count > 0 {
            debug!("Invalidated {} pipelines rendering to {:?}", count, target);
        }
        count
    }

    /// Follows a swapchain format change.
    pub fn set_backbuffer_format(&mut self, format: vk::Format) -> usize {
        if format == self.backbuffer_format {
            return 0;
        }
        info!("Backbuffer format changed from {:?} to {:?}", self.backbuffer_format, format);
        self.backbuffer_format = format;
        self.invalidate_target_format(TargetFormat::Backbuffer)
    }

    /// Drops every pipeline. Outstanding handles turn stale.
    pub fn clear(&mut self) {
        let count = self.pipelines.len();
        for (_, mut entry) in self.pipelines.drain() {
            retire_raw(&mut entry, &mut self.retired);
            self.retired.push((
                RetiredObject::PipelineLayout {
                    layout: entry.layout,
                    set_layout: entry.set_layout,
                },
                entry.last_used_frame,
            ));
        }
        self.by_key.clear();
        if count > 0 {
            warn!("Cleared {} cached pipelines", count);
        }
    }

    /// Device objects replaced since the last call, with their last use.
    pub fn take_retired(&mut self) -> Vec<(RetiredObject, u64)> {
        std::mem::take(&mut self.retired)
    }

    /// Destroys everything immediately. Only valid once the device is idle.
    pub(crate) fn destroy_all(&mut self, backend: &dyn GpuBackend) {
        for (object, _) in self.retired.drain(..) {
            match object {
                RetiredObject::Pipeline(pipeline) => backend.destroy_pipeline(pipeline),
                RetiredObject::PipelineLayout { layout, set_layout } => {
                    backend.destroy_pipeline_layout(layout);
                    backend.destroy_descriptor_set_layout(set_layout);
                }
                other => warn!("Unexpected retired object in pipeline cache: {:?}", other),
            }
        }
        for (_, entry) in self.pipelines.drain() {
            if let Some(raw) = entry.raw {
                backend.destroy_pipeline(raw);
            }
            backend.destroy_pipeline_layout(entry.layout);
            backend.destroy_descriptor_set_layout(entry.set_layout);
        }
        self.by_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimConfig, SimulatedDevice};
    use pretty_assertions::assert_eq;

    fn module(tag: u32) -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, tag, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    fn triangle(tag: u32) -> PipelineDesc {
        PipelineDesc::graphics("triangle")
            .with_stage(ShaderStageDesc::vertex(module(tag)))
            .with_stage(
                ShaderStageDesc::fragment(module(tag + 1)).with_reflected_binding(
                    0,
                    0,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                ),
            )
            .with_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_color_target(TargetFormat::Backbuffer)
    }

    fn cache() -> (SimulatedDevice, PipelineCache) {
        (
            SimulatedDevice::new(SimConfig::default()),
            PipelineCache::new(vk::Format::B8G8R8A8_SRGB),
        )
    }

    #[test]
    fn identical_descriptions_share_one_pipeline() {
        let (device, mut cache) = cache();
        let a = cache.get_or_build(&device, triangle(10)).unwrap();
        let b = cache.get_or_build(&device, triangle(10)).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.stats().pipelines_created, 1);
        assert_eq!(device.live_objects(ObjectKind::ShaderModule), 0);

        let culled = triangle(10).with_raster(RasterState {
            cull_mode: vk::CullModeFlags::NONE,
            ..RasterState::default()
        });
        let c = cache.get_or_build(&device, culled).unwrap();
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn malformed_spirv_is_a_shader_compile_error() {
        let (device, mut cache) = cache();
        let mut bytes = module(1);
        bytes[0] = 0xFF;
        let desc = PipelineDesc::compute("cull").with_stage(ShaderStageDesc::compute(bytes));
        assert!(matches!(
            cache.get_or_build(&device, desc),
            Err(RenderGraphError::ShaderCompile { .. })
        ));

        let truncated = PipelineDesc::compute("cull").with_stage(ShaderStageDesc::compute(vec![3, 2, 35]));
        assert!(matches!(
            cache.get_or_build(&device, truncated),
            Err(RenderGraphError::ShaderCompile { .. })
        ));
        assert_eq!(device.live_objects(ObjectKind::PipelineLayout), 0);
    }

    #[test]
    fn reflection_must_match_layout() {
        let (device, mut cache) = cache();
        let desc = PipelineDesc::compute("blur")
            .with_stage(ShaderStageDesc::compute(module(3)).with_reflected_binding(
                0,
                1,
                vk::DescriptorType::STORAGE_IMAGE,
            ))
            .with_binding(0, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE);
        let err = cache.get_or_build(&device, desc).unwrap_err();
        assert!(matches!(err, RenderGraphError::InvalidPipelineState { ref pipeline, .. } if pipeline == "blur"));
        assert_eq!(device.live_objects(ObjectKind::DescriptorSetLayout), 0);
    }

    #[test]
    fn stage_set_is_checked() {
        let (device, mut cache) = cache();
        let no_vertex = PipelineDesc::graphics("fullscreen")
            .with_stage(ShaderStageDesc::fragment(module(5)))
            .with_color_target(TargetFormat::Backbuffer);
        assert!(matches!(
            cache.get_or_build(&device, no_vertex),
            Err(RenderGraphError::InvalidPipelineState { .. })
        ));
        let depth_without_target = PipelineDesc::graphics("shadow")
            .with_stage(ShaderStageDesc::vertex(module(6)))
            .with_color_target(TargetFormat::Backbuffer)
            .with_raster(RasterState {
                depth_test: true,
                ..RasterState::default()
            });
        assert!(matches!(
            cache.get_or_build(&device, depth_without_target),
            Err(RenderGraphError::InvalidPipelineState { .. })
        ));
    }

    #[test]
    fn shader_invalidation_rebuilds_lazily_behind_the_same_handle() {
        let (device, mut cache) = cache();
        let desc = triangle(20);
        let vertex_hash = desc.stages[0].code_hash();
        let handle = cache.get_or_build(&device, desc).unwrap();
        let first = cache.resolve(&device, handle, 4).unwrap();

        assert_eq!(cache.invalidate_shader(vertex_hash), 1);
        assert!(!cache.is_built(handle));
        let retired = cache.take_retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].1, 4);

        let second = cache.resolve(&device, handle, 5).unwrap();
        assert_ne!(first, second);
        assert_eq!(cache.build_count(handle).unwrap(), 2);
        assert_eq!(cache.invalidate_shader(0xdead_beef), 0);
    }

    #[test]
    fn reload_keeps_previous_state_on_failure() {
        let (device, mut cache) = cache();
        let desc = triangle(30);
        let fragment_hash = desc.stages[1].code_hash();
        let handle = cache.get_or_build(&device, desc).unwrap();

        let broken = ShaderStageDesc::fragment(module(31)).with_reflected_binding(
            0,
            0,
            vk::DescriptorType::STORAGE_BUFFER,
        );
        assert!(cache.reload_shader(fragment_hash, broken).is_err());
        assert!(cache.is_built(handle));

        let fixed = ShaderStageDesc::fragment(module(32)).with_reflected_binding(
            0,
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        );
        let new_hash = fixed.code_hash();
        assert_eq!(cache.reload_shader(fragment_hash, fixed).unwrap(), 1);
        assert!(!cache.is_built(handle));
        cache.resolve(&device, handle, 1).unwrap();
        assert_eq!(cache.invalidate_shader(new_hash), 1);
    }

    #[test]
    fn backbuffer_format_change_touches_only_backbuffer_targets() {
        let (device, mut cache) = cache();
        let present = cache.get_or_build(&device, triangle(40)).unwrap();
        let offscreen = cache
            .get_or_build(
                &device,
                PipelineDesc::graphics("gbuffer")
                    .with_stage(ShaderStageDesc::vertex(module(42)))
                    .with_color_target(TargetFormat::Format(vk::Format::R16G16B16A16_SFLOAT)),
            )
            .unwrap();
        assert_eq!(cache.set_backbuffer_format(vk::Format::B8G8R8A8_SRGB), 0);
        assert_eq!(cache.set_backbuffer_format(vk::Format::R8G8B8A8_UNORM), 1);
        assert!(!cache.is_built(present));
        assert!(cache.is_built(offscreen));
    }

    #[test]
    fn clear_makes_handles_stale() {
        let (device, mut cache) = cache();
        let handle = cache.get_or_build(&device, triangle(50)).unwrap();
        cache.clear();
        assert!(matches!(
            cache.resolve(&device, handle, 1),
            Err(RenderGraphError::InvalidHandle { kind: "pipeline" })
        ));
        cache.destroy_all(&device);
        assert_eq!(device.live_objects(ObjectKind::Pipeline), 0);
        assert_eq!(device.live_objects(ObjectKind::PipelineLayout), 0);
        assert!(device.violations().is_empty());
    }
}
