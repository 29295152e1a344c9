//! Device memory suballocation.
//!
//! Small requests are carved from per-memory-type blocks with a first-fit free
//! list; requests of at least one block get a dedicated allocation. Freed
//! ranges coalesce with their neighbours and a block that becomes empty is
//! returned to the device. There is no defragmentation.

use crate::backend::{GpuBackend, MemoryProperties};
use crate::error::{RenderGraphError, Result};
use ash::vk;
use slotmap::SlotMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

slotmap::new_key_type! {
    /// Handle of a suballocation.
    pub struct MemoryHandle;
}

/// A range of device memory owned by one image or buffer.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub memory_type: u32,
    pub host_visible: bool,
    block: Option<u64>,
}

impl Allocation {
    pub fn is_dedicated(&self) -> bool {
        self.block.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct MemoryBlock {
    id: u64,
    memory_type: u32,
    memory: vk::DeviceMemory,
    size: u64,
    /// Sorted by offset, never adjacent.
    free: Vec<FreeRange>,
    live: usize,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

impl MemoryBlock {
    fn new(id: u64, memory_type: u32, memory: vk::DeviceMemory, size: u64) -> Self {
        Self {
            id,
            memory_type,
            memory,
            size,
            free: vec![FreeRange { offset: 0, size }],
            live: 0,
        }
    }

    fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (index, aligned) = self.free.iter().enumerate().find_map(|(i, range)| {
            let aligned = align_up(range.offset, alignment);
            let padding = aligned - range.offset;
            (range.size >= padding + size).then_some((i, aligned))
        })?;
        let range = self.free[index];
        let end = range.offset + range.size;
        let mut remainder: SmallVec<[FreeRange; 2]> = SmallVec::new();
        if aligned > range.offset {
            remainder.push(FreeRange {
                offset: range.offset,
                size: aligned - range.offset,
            });
        }
        if end > aligned + size {
            remainder.push(FreeRange {
                offset: aligned + size,
                size: end - aligned - size,
            });
        }
        self.free.splice(index..=index, remainder);
        self.live += 1;
        Some(aligned)
    }

    fn release(&mut self, offset: u64, size: u64) {
        let index = self.free.partition_point(|r| r.offset < offset);
        self.free.insert(index, FreeRange { offset, size });
        if index + 1 < self.free.len() {
            let next = self.free[index + 1];
            if offset + size == next.offset {
                self.free[index].size += next.size;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let previous = self.free[index - 1];
            if previous.offset + previous.size == offset {
                self.free[index - 1].size += self.free[index].size;
                self.free.remove(index);
            }
        }
        self.live -= 1;
    }

    fn largest_free(&self) -> u64 {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }
}

/// Usage of one memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_index: u32,
    pub size: u64,
    /// Bytes of device memory allocated from the heap (blocks and dedicated).
    pub reserved: u64,
    /// Bytes handed out to resources.
    pub used: u64,
    pub blocks: usize,
    pub allocations: usize,
}

/// Allocator for device memory, shared by every image and buffer.
#[derive(Debug)]
pub struct DeviceMemoryAllocator {
    properties: MemoryProperties,
    block_size: u64,
    blocks: Vec<MemoryBlock>,
    allocations: SlotMap<MemoryHandle, Allocation>,
    next_block_id: u64,
    heap_reserved: Vec<u64>,
}

impl DeviceMemoryAllocator {
    pub fn new(properties: MemoryProperties, block_size: u64) -> Self {
        let heap_reserved = vec![0; properties.heaps.len()];
        Self {
            properties,
            block_size,
            blocks: Vec::new(),
            allocations: SlotMap::with_key(),
            next_block_id: 0,
            heap_reserved,
        }
    }

    /// First memory type allowed by `type_bits` whose properties contain `flags`.
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        self.candidate_types(type_bits, flags).next()
    }

    fn candidate_types(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> impl Iterator<Item = u32> + '_ {
        self.properties
            .types
            .iter()
            .enumerate()
            .filter(move |(i, t)| type_bits & (1 << i) != 0 && t.property_flags.contains(flags))
            .map(|(i, _)| i as u32)
    }

    /// Allocates `size` bytes aligned to `alignment` from a memory type
    /// matching `type_bits` and `flags`. Every compatible type is tried before
    /// failing with `OutOfDeviceMemory`.
    pub fn allocate(
        &mut self,
        backend: &dyn GpuBackend,
        size: u64,
        alignment: u64,
        flags: vk::MemoryPropertyFlags,
        type_bits: u32,
    ) -> Result<MemoryHandle> {
        let size = size.max(1);
        let candidates: Vec<u32> = self.candidate_types(type_bits, flags).collect();
        for memory_type in candidates {
            match self.allocate_from_type(backend, memory_type, size, alignment) {
                Ok(handle) => return Ok(handle),
                Err(RenderGraphError::OutOfDeviceMemory { .. }) => {
                    trace!("Memory type {} has no room for {} bytes", memory_type, size);
                }
                Err(e) => return Err(e),
            }
        }
        Err(RenderGraphError::OutOfDeviceMemory {
            requested: size,
            flags,
        })
    }

    /// Tries `preferred` first, then `fallback`.
    pub fn allocate_with_fallback(
        &mut self,
        backend: &dyn GpuBackend,
        size: u64,
        alignment: u64,
        preferred: vk::MemoryPropertyFlags,
        fallback: vk::MemoryPropertyFlags,
        type_bits: u32,
    ) -> Result<MemoryHandle> {
        match self.allocate(backend, size, alignment, preferred, type_bits) {
            Err(RenderGraphError::OutOfDeviceMemory { .. }) if fallback != preferred => {
                debug!(
                    "Falling back from {:?} to {:?} for {} bytes",
                    preferred, fallback, size
                );
                self.allocate(backend, size, alignment, fallback, type_bits)
            }
            result => result,
        }
    }

    fn heap_of(&self, memory_type: u32) -> usize {
        self.properties.types[memory_type as usize].heap_index as usize
    }

    fn reserve(&mut self, backend: &dyn GpuBackend, memory_type: u32, size: u64) -> Result<vk::DeviceMemory> {
        let heap = self.heap_of(memory_type);
        let budget = self.properties.heaps[heap].size;
        if self.heap_reserved[heap] + size > budget {
            return Err(RenderGraphError::OutOfDeviceMemory {
                requested: size,
                flags: self.properties.types[memory_type as usize].property_flags,
            });
        }
        let memory = backend.allocate_memory(size, memory_type)?;
        self.heap_reserved[heap] += size;
        Ok(memory)
    }

    fn allocate_from_type(
        &mut self,
        backend: &dyn GpuBackend,
        memory_type: u32,
        size: u64,
        alignment: u64,
    ) -> Result<MemoryHandle> {
        let host_visible = self.properties.types[memory_type as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        if size >= self.block_size {
            let memory = self.reserve(backend, memory_type, size)?;
            debug!("Dedicated allocation of {} bytes from type {}", size, memory_type);
            return Ok(self.allocations.insert(Allocation {
                memory,
                offset: 0,
                size,
                memory_type,
                host_visible,
                block: None,
            }));
        }

        let existing = self
            .blocks
            .iter_mut()
            .filter(|b| b.memory_type == memory_type)
            .find_map(|b| b.try_allocate(size, alignment).map(|offset| (b.id, b.memory, offset)));
        let (block, memory, offset) = match existing {
            Some(found) => found,
            None => {
                let memory = self.reserve(backend, memory_type, self.block_size)?;
                let id = self.next_block_id;
                self.next_block_id += 1;
                let mut block = MemoryBlock::new(id, memory_type, memory, self.block_size);
                let offset = block.try_allocate(size, alignment).ok_or(
                    RenderGraphError::OutOfDeviceMemory {
                        requested: size,
                        flags: self.properties.types[memory_type as usize].property_flags,
                    },
                )?;
                debug!(
                    "New memory block {} of {} bytes for type {}",
                    id, self.block_size, memory_type
                );
                self.blocks.push(block);
                (id, memory, offset)
            }
        };

        Ok(self.allocations.insert(Allocation {
            memory,
            offset,
            size,
            memory_type,
            host_visible,
            block: Some(block),
        }))
    }

    /// Returns the range to its block. Unknown handles are ignored with a warning.
    pub fn free(&mut self, backend: &dyn GpuBackend, handle: MemoryHandle) {
        let Some(allocation) = self.allocations.remove(handle) else {
            warn!("Ignoring free of stale memory handle {:?}", handle);
            return;
        };
        let heap = self.heap_of(allocation.memory_type);
        match allocation.block {
            None => {
                backend.free_memory(allocation.memory);
                self.heap_reserved[heap] -= allocation.size;
            }
            Some(id) => {
                let Some(index) = self.blocks.iter().position(|b| b.id == id) else {
                    warn!("Memory block {} vanished before its allocations", id);
                    return;
                };
                let block = &mut self.blocks[index];
                block.release(allocation.offset, allocation.size);
                if block.live == 0 {
                    let block = self.blocks.swap_remove(index);
                    backend.free_memory(block.memory);
                    self.heap_reserved[heap] -= block.size;
                    debug!("Released empty memory block {}", block.id);
                }
            }
        }
    }

    pub fn get(&self, handle: MemoryHandle) -> Result<&Allocation> {
        self.allocations
            .get(handle)
            .ok_or(RenderGraphError::InvalidHandle { kind: "memory" })
    }

    /// Copies `data` to the start of a host-visible allocation.
    pub fn write(&self, backend: &dyn GpuBackend, handle: MemoryHandle, data: &[u8]) -> Result<()> {
        let allocation = self.get(handle)?;
        if !allocation.host_visible || data.len() as u64 > allocation.size {
            return Err(RenderGraphError::Vk(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        backend.write_memory(allocation.memory, allocation.offset, data)
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Largest contiguous free range left in any block of `memory_type`.
    pub fn largest_free_range(&self, memory_type: u32) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.memory_type == memory_type)
            .map(MemoryBlock::largest_free)
            .max()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<HeapStats> {
        let mut stats: Vec<HeapStats> = self
            .properties
            .heaps
            .iter()
            .enumerate()
            .map(|(i, heap)| HeapStats {
                heap_index: i as u32,
                size: heap.size,
                reserved: self.heap_reserved[i],
                used: 0,
                blocks: 0,
                allocations: 0,
            })
            .collect();
        for block in &self.blocks {
            stats[self.heap_of(block.memory_type)].blocks += 1;
        }
        for allocation in self.allocations.values() {
            let heap = &mut stats[self.heap_of(allocation.memory_type)];
            heap.used += allocation.size;
            heap.allocations += 1;
        }
        stats
    }

    /// Frees every block and dedicated allocation. Called after the device is idle.
    pub fn destroy_all(&mut self, backend: &dyn GpuBackend) {
        for allocation in self.allocations.values().filter(|a| a.is_dedicated()) {
            backend.free_memory(allocation.memory);
        }
        for block in self.blocks.drain(..) {
            backend.free_memory(block.memory);
        }
        self.allocations.clear();
        self.heap_reserved.iter_mut().for_each(|r| *r = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimulatedDevice};
    use pretty_assertions::assert_eq;

    const KIB: u64 = 1024;

    fn setup(device_heap: u64) -> (SimulatedDevice, DeviceMemoryAllocator) {
        let device = SimulatedDevice::new(SimConfig {
            device_heap_size: device_heap,
            ..SimConfig::default()
        });
        let allocator = DeviceMemoryAllocator::new(device.memory_properties(), 64 * KIB);
        (device, allocator)
    }

    fn device_local() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    }

    #[test]
    fn chooses_first_matching_type() {
        let (_device, allocator) = setup(1024 * KIB);
        // Type 0 is device-local, type 1 host-visible.
        assert_eq!(allocator.find_memory_type(0b11, device_local()), Some(0));
        assert_eq!(
            allocator.find_memory_type(0b11, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(allocator.find_memory_type(0b10, device_local()), None);
    }

    #[test]
    fn suballocations_share_a_block_and_respect_alignment() {
        let (device, mut allocator) = setup(1024 * KIB);
        let a = allocator.allocate(&device, 100, 256, device_local(), !0).unwrap();
        let b = allocator.allocate(&device, 100, 256, device_local(), !0).unwrap();
        let (a, b) = (*allocator.get(a).unwrap(), *allocator.get(b).unwrap());
        assert_eq!(a.memory, b.memory);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(allocator.block_count(), 1);
    }

    #[test]
    fn freed_ranges_coalesce_and_empty_blocks_are_released() {
        let (device, mut allocator) = setup(1024 * KIB);
        let handles: Vec<_> = (0..4)
            .map(|_| allocator.allocate(&device, 16 * KIB, 1, device_local(), !0).unwrap())
            .collect();
        assert_eq!(allocator.largest_free_range(0), 0);
        allocator.free(&device, handles[1]);
        allocator.free(&device, handles[2]);
        assert_eq!(allocator.largest_free_range(0), 32 * KIB);
        allocator.free(&device, handles[0]);
        allocator.free(&device, handles[3]);
        assert_eq!(allocator.block_count(), 0);
        assert_eq!(device.stats().live_memory_objects, 0);
    }

    #[test]
    fn large_requests_are_dedicated() {
        let (device, mut allocator) = setup(1024 * KIB);
        let handle = allocator.allocate(&device, 128 * KIB, 1, device_local(), !0).unwrap();
        assert!(allocator.get(handle).unwrap().is_dedicated());
        assert_eq!(allocator.block_count(), 0);
    }

    #[test]
    fn exhausted_heap_reports_out_of_memory() {
        let (device, mut allocator) = setup(128 * KIB);
        allocator.allocate(&device, 128 * KIB, 1, device_local(), 0b01).unwrap();
        let err = allocator
            .allocate(&device, 16 * KIB, 1, device_local(), 0b01)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderGraphError::OutOfDeviceMemory { requested, .. } if requested == 16 * KIB
        ));
    }

    #[test]
    fn fallback_lands_in_host_visible_memory() {
        let (device, mut allocator) = setup(64 * KIB);
        allocator.allocate(&device, 64 * KIB, 1, device_local(), !0).unwrap();
        let handle = allocator
            .allocate_with_fallback(
                &device,
                8 * KIB,
                1,
                device_local(),
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                !0,
            )
            .unwrap();
        assert!(allocator.get(handle).unwrap().host_visible);
        allocator.write(&device, handle, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (device, mut allocator) = setup(1024 * KIB);
        let handle = allocator.allocate(&device, 64, 1, device_local(), !0).unwrap();
        allocator.free(&device, handle);
        assert!(matches!(
            allocator.get(handle),
            Err(RenderGraphError::InvalidHandle { kind: "memory" })
        ));
        let stats = allocator.stats();
        assert_eq!(stats[0].allocations, 0);
    }
}
