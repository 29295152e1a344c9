//! Frame graph and GPU resource lifetime management for the NovaDE renderer.
//!
//! Passes declare the images and buffers they read and write. Each frame the
//! [`FrameGraph`] derives the barriers and queue ownership transfers those
//! declarations imply, records the passes into per-queue command buffers,
//! submits them against a ring of frame slots and presents the result. Device
//! objects removed while frames are in flight are retired and destroyed once
//! the last frame that used them has completed.
//!
//! The graph talks to the GPU through [`backend::GpuBackend`]. The bundled
//! [`backend::vulkan::VulkanBackend`] drives a real device; the
//! [`backend::sim::SimulatedDevice`] runs the same code without one.

pub mod backend;
pub mod barrier;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod pass;
pub mod pipeline;
pub mod resource;
pub mod sync;

pub use backend::{AttachmentLoad, GpuBackend, QueueFamilies, QueueKind, Sharing};
pub use barrier::{ResourceAccess, ResourceUsage};
pub use config::FrameGraphConfig;
pub use descriptor::{Binding, BindingResource, DescriptorSetHandle};
pub use error::{ConfigError, RenderGraphError, Result};
pub use graph::{FrameGraph, FrameReport};
pub use pass::{PassContext, PassDesc};
pub use pipeline::{PipelineDesc, PipelineHandle, ShaderStageDesc, TargetFormat};
pub use resource::{
    BufferDesc, BufferHandle, ImageDesc, ImageHandle, ImageSize, ResourceHandle, SubresourceRange,
};
