//! A single pooled memory object.
//!
//! A [`MemoryHeap`] owns one `VkDeviceMemory` of fixed size and sub-allocates it with a [`BlockList`]. Every heap has its own lock,
//! so allocations from different heaps never contend. Heaps are created and destroyed by the [`MemoryManager`](crate::MemoryManager),
//! which only keeps a heap alive while it holds at least one allocation.
//!
//! Host-visible heaps are mapped persistently while at least one of their allocations is mapped. The whole memory object is mapped once,
//! and every further [`MemoryHeap::map()`] only bumps a reference count.

use std::ffi::c_void;
use std::fmt::{Display, Formatter};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use ash::vk;

use crate::{Allocation, Error, MemoryDevice};
use crate::allocator::allocation::BlockRef;
use crate::allocator::block::BlockList;

/// Identifies a heap inside its [`MemoryManager`](crate::MemoryManager). Ids are never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub(crate) u64);

impl Display for HeapId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct MappedPointer(pub(crate) NonNull<c_void>);

// SAFETY: This points into mapped device memory, which is not tied to the thread that mapped it.
unsafe impl Send for MappedPointer {}

#[derive(Debug)]
struct HeapState {
    blocks: BlockList,
    mapping: Option<MappedPointer>,
    map_count: u32,
}

/// One fixed-size native memory allocation, partitioned into blocks.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct MemoryHeap<D: MemoryDevice> {
    #[derivative(Debug = "ignore")]
    device: D,
    id: HeapId,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    allocate_flags: vk::MemoryAllocateFlags,
    name: Option<String>,
    state: Mutex<HeapState>,
}

impl<D: MemoryDevice> MemoryHeap<D> {
    /// Allocate the native memory for a new heap. The heap starts out as one free block spanning the whole memory object.
    /// # Errors
    /// * Fails if the native allocation fails, usually because the device is out of memory.
    pub fn new(
        device: D,
        id: HeapId,
        size: vk::DeviceSize,
        memory_type_index: u32,
        allocate_flags: vk::MemoryAllocateFlags,
    ) -> Result<Self> {
        let memory = device.allocate_memory(size, memory_type_index, allocate_flags, None)?;
        info!("New MemoryHeap {id} (memory type = {memory_type_index}, size = {size} bytes, flags = {allocate_flags:?})");
        Ok(Self {
            device,
            id,
            memory,
            size,
            memory_type_index,
            allocate_flags,
            name: None,
            state: Mutex::new(HeapState {
                blocks: BlockList::new(size),
                mapping: None,
                map_count: 0,
            }),
        })
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn allocate_flags(&self) -> vk::MemoryAllocateFlags {
        self.allocate_flags
    }

    /// Debug name given with [`MemoryHeap::set_name()`].
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Get unsafe access to the underlying memory object.
    /// # Safety
    /// Do not free or map this memory directly.
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    fn lock(&self) -> Result<MutexGuard<'_, HeapState>> {
        Ok(self.state.lock().map_err(|_| Error::PoisonError)?)
    }

    /// Sub-allocate `size` bytes. Returns `Ok(None)` if no block can fit the allocation.
    /// # Errors
    /// * Fails if `size` is zero.
    /// * Fails if the heap lock is poisoned.
    pub fn allocate(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        page_granularity: vk::DeviceSize,
    ) -> Result<Option<Allocation>> {
        let mut state = self.lock()?;
        let Some(placement) = state.blocks.allocate(size, alignment, page_granularity)? else {
            return Ok(None);
        };

        Ok(Some(Allocation {
            memory: self.memory,
            offset: placement.offset,
            size,
            memory_type_index: self.memory_type_index,
            allocate_flags: self.allocate_flags,
            block: Some(BlockRef {
                heap: self.id,
                block: placement.block,
            }),
            ..Default::default()
        }))
    }

    /// Give an allocation's block back to this heap.
    /// # Errors
    /// * Fails if the allocation does not live in this heap, or was already freed.
    pub fn free(&self, allocation: &Allocation) -> Result<()> {
        let block = self.owned_block(allocation)?;
        let mut state = self.lock()?;
        state.blocks.free(block.block)
    }

    /// Map the allocation into host memory. The first mapping maps the entire heap, later calls reuse that mapping.
    /// Every call must be matched by a call to [`MemoryHeap::unmap()`].
    /// # Errors
    /// * Fails if the allocation does not live in this heap.
    /// * Fails if the heap memory is not host visible.
    pub fn map(&self, allocation: &Allocation) -> Result<NonNull<c_void>> {
        let block = self.owned_block(allocation)?;
        let mut state = self.lock()?;
        if state.blocks.get(block.block).is_none() {
            anyhow::bail!(Error::InvalidAllocation);
        }

        let existing = state.mapping;
        let base = match existing {
            Some(mapping) => mapping.0,
            None => {
                // SAFETY: The heap memory is not mapped, since the mapping count is zero.
                let pointer = unsafe { self.device.map_memory(self.memory)? };
                debug!("Mapped MemoryHeap {}", self.id);
                state.mapping = Some(MappedPointer(pointer));
                pointer
            }
        };
        state.map_count += 1;

        // SAFETY: The allocation lies within the heap, so its offset is inside the mapped range.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(allocation.offset as usize).cast()) })
    }

    /// Release one mapping reference. The heap is unmapped when the last reference is released.
    /// # Errors
    /// * Fails if the allocation does not live in this heap, or was already freed.
    /// * Fails if the heap is not mapped.
    pub fn unmap(&self, allocation: &Allocation) -> Result<()> {
        let block = self.owned_block(allocation)?;
        let mut state = self.lock()?;
        if state.blocks.get(block.block).is_none() {
            error!("Tried to unmap a freed allocation from MemoryHeap {}", self.id);
            anyhow::bail!(Error::InvalidAllocation);
        }
        if state.map_count == 0 {
            anyhow::bail!(Error::NotMapped);
        }

        state.map_count -= 1;
        if state.map_count == 0 {
            // SAFETY: The heap is mapped and nothing references the mapping anymore.
            unsafe { self.device.unmap_memory(self.memory) };
            state.mapping = None;
            debug!("Unmapped MemoryHeap {}", self.id);
        }
        Ok(())
    }

    /// Attach a debug name to the heap's memory object.
    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Err(err) = self.device.set_memory_name(self.memory, &name) {
            warn!("Could not name MemoryHeap {}: {err}", self.id);
        }
        self.name = Some(name);
    }

    /// True if no allocations live in this heap.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.blocks.is_empty())
    }

    /// Number of blocks in the heap, free blocks included.
    pub fn block_count(&self) -> Result<usize> {
        Ok(self.lock()?.blocks.len())
    }

    /// Whether the heap is currently mapped into host memory.
    pub fn is_mapped(&self) -> Result<bool> {
        Ok(self.lock()?.mapping.is_some())
    }

    /// Bytes occupied by allocations, alignment padding included.
    pub fn used_bytes(&self) -> Result<vk::DeviceSize> {
        Ok(self.lock()?.blocks.used_bytes())
    }

    /// Inspect the block list under the heap lock.
    pub fn with_blocks<R>(&self, f: impl FnOnce(&BlockList) -> R) -> Result<R> {
        Ok(f(&self.lock()?.blocks))
    }

    /// Free the native memory of this heap. Outstanding allocations and mappings are reported as leaks.
    pub fn destroy(self) {
        let state = match self.state.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !state.blocks.is_empty() {
            warn!(
                "Memory leak detected: MemoryHeap {} destroyed with {} bytes still allocated",
                self.id,
                state.blocks.used_bytes()
            );
        }

        // SAFETY: The heap is being destroyed, so nothing can use the mapping or the memory afterwards.
        unsafe {
            if state.mapping.is_some() {
                warn!("MemoryHeap {} destroyed while still mapped {} time(s)", self.id, state.map_count);
                self.device.unmap_memory(self.memory);
            }
            self.device.free_memory(self.memory);
        }
        info!("Destroyed MemoryHeap {}", self.id);
    }

    fn owned_block(&self, allocation: &Allocation) -> Result<BlockRef> {
        match allocation.block {
            Some(block) if block.heap == self.id && allocation.memory == self.memory => Ok(block),
            _ => {
                error!("Allocation at offset {} does not belong to MemoryHeap {}", allocation.offset, self.id);
                Err(Error::InvalidAllocation.into())
            }
        }
    }
}
