//! GPU resources tracked by the frame graph.
//!
//! Images and buffers live in the [`arena::ResourceArena`] behind generational
//! handles. A handle stays valid across physical rebuilds (resize) and turns
//! stale when the resource is destroyed.

use crate::barrier::SyncState;
use ash::vk;

pub mod arena;
pub mod buffer;
pub mod image;

pub use arena::{ResourceArena, RetiredObject};
pub use buffer::{BufferDesc, BufferResource, MemoryLocation};
pub use image::{ImageDesc, ImageResource, ImageSize, ImageStateTracker};

slotmap::new_key_type! {
    /// Handle of an image in the arena.
    pub struct ImageHandle;
    /// Handle of a buffer in the arena.
    pub struct BufferHandle;
}

/// Either kind of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceHandle {
    Image(ImageHandle),
    Buffer(BufferHandle),
}

impl From<ImageHandle> for ResourceHandle {
    fn from(handle: ImageHandle) -> Self {
        ResourceHandle::Image(handle)
    }
}

impl From<BufferHandle> for ResourceHandle {
    fn from(handle: BufferHandle) -> Self {
        ResourceHandle::Buffer(handle)
    }
}

impl ResourceHandle {
    pub fn as_image(self) -> Option<ImageHandle> {
        match self {
            ResourceHandle::Image(h) => Some(h),
            ResourceHandle::Buffer(_) => None,
        }
    }

    pub fn as_buffer(self) -> Option<BufferHandle> {
        match self {
            ResourceHandle::Buffer(h) => Some(h),
            ResourceHandle::Image(_) => None,
        }
    }
}

/// A range of mip levels and array layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn full(mip_levels: u32, array_layers: u32) -> Self {
        Self {
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: array_layers,
        }
    }

    pub fn mip(level: u32, array_layers: u32) -> Self {
        Self {
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: array_layers,
        }
    }

    pub fn to_vk(self, aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: self.base_mip_level,
            level_count: self.level_count,
            base_array_layer: self.base_array_layer,
            layer_count: self.layer_count,
        }
    }
}

/// Synchronization state as committed in the arena.
#[derive(Debug, Clone)]
pub enum TrackedState {
    Image(ImageStateTracker),
    Buffer(SyncState),
}
