//! Buffers and their placement in memory.

use crate::backend::{GpuBackend, QueueKind, Sharing};
use crate::barrier::SyncState;
use crate::error::Result;
use crate::memory::{DeviceMemoryAllocator, MemoryHandle};
use ash::vk;
use tracing::debug;

/// Where a buffer's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryLocation {
    /// Device-local, falling back to host-visible memory when the device heap is full.
    #[default]
    DeviceLocal,
    /// Host-visible and coherent, for per-frame uploads written from the CPU.
    HostVisible,
}

impl MemoryLocation {
    pub(crate) fn flags(self) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        match self {
            MemoryLocation::DeviceLocal => (vk::MemoryPropertyFlags::DEVICE_LOCAL, host),
            MemoryLocation::HostVisible => (host, host),
        }
    }
}

/// Description of a buffer to create.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub sharing: Sharing,
    /// Bytes from an asset loader. Host-visible buffers are written directly,
    /// device-local ones through a staging copy at the start of the next frame.
    pub initial_contents: Option<Vec<u8>>,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            location: MemoryLocation::DeviceLocal,
            sharing: Sharing::Exclusive,
            initial_contents: None,
        }
    }

    pub fn host_visible(mut self) -> Self {
        self.location = MemoryLocation::HostVisible;
        self
    }

    pub fn with_sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_contents(mut self, bytes: Vec<u8>) -> Self {
        self.initial_contents = Some(bytes);
        self
    }
}

/// The device objects behind a buffer.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalBuffer {
    pub buffer: vk::Buffer,
    pub memory: MemoryHandle,
    pub host_visible: bool,
}

impl PhysicalBuffer {
    pub(crate) fn create(
        backend: &dyn GpuBackend,
        allocator: &mut DeviceMemoryAllocator,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        sharing: Sharing,
    ) -> Result<Self> {
        let buffer = backend.create_buffer(size, usage, sharing)?;
        let requirements = backend.buffer_memory_requirements(buffer);
        let (preferred, fallback) = location.flags();
        let memory = match allocator.allocate_with_fallback(
            backend,
            requirements.size,
            requirements.alignment,
            preferred,
            fallback,
            requirements.memory_type_bits,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                backend.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let bound = allocator.get(memory).and_then(|a| {
            backend.bind_buffer_memory(buffer, a.memory, a.offset)?;
            Ok(a.host_visible)
        });
        match bound {
            Ok(host_visible) => {
                debug!("Created buffer '{}' of {} bytes (host visible: {})", name, size, host_visible);
                Ok(Self {
                    buffer,
                    memory,
                    host_visible,
                })
            }
            Err(e) => {
                backend.destroy_buffer(buffer);
                allocator.free(backend, memory);
                Err(e)
            }
        }
    }

    pub(crate) fn destroy(self, backend: &dyn GpuBackend, allocator: &mut DeviceMemoryAllocator) {
        backend.destroy_buffer(self.buffer);
        allocator.free(backend, self.memory);
    }
}

/// One buffer in the arena.
#[derive(Debug)]
pub struct BufferResource {
    pub(crate) desc: BufferDesc,
    pub(crate) physical: PhysicalBuffer,
    pub(crate) state: SyncState,
    pub(crate) last_used_frame: u64,
    pub(crate) last_queue: Option<QueueKind>,
}

impl BufferResource {
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn raw(&self) -> vk::Buffer {
        self.physical.buffer
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.desc.usage
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn is_host_visible(&self) -> bool {
        self.physical.host_visible
    }

    pub fn memory(&self) -> MemoryHandle {
        self.physical.memory
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }
}
