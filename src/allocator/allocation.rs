//! The allocation handle returned by the [`MemoryManager`](crate::MemoryManager).

use std::ffi::c_void;
use std::ptr::NonNull;

use ash::vk;

use crate::allocator::block::BlockId;
use crate::allocator::heap::HeapId;
use crate::allocator::traits;

/// Location of a pooled allocation: the heap it lives in and the block it occupies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub heap: HeapId,
    pub block: BlockId,
}

/// Device memory handed out by the [`MemoryManager`](crate::MemoryManager).
///
/// The allocation is exclusively owned by the caller until it is given back with
/// [`MemoryManager::free()`](crate::MemoryManager::free()). Dropping an allocation does **not** free its memory, since unbinding
/// the resource using it must be sequenced by the caller.
#[derive(Debug, Default)]
pub struct Allocation {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) offset: vk::DeviceSize,
    pub(crate) size: vk::DeviceSize,
    pub(crate) memory_type_index: u32,
    pub(crate) allocate_flags: vk::MemoryAllocateFlags,
    pub(crate) mapped: Option<NonNull<c_void>>,
    pub(crate) map_count: u32,
    pub(crate) device_address: Option<vk::DeviceAddress>,
    pub(crate) block: Option<BlockRef>,
    pub(crate) dedicated: bool,
}

// SAFETY: The only field that is not Send/Sync is the mapped pointer. It points to device memory
// that is not owned by this struct, and all accesses through it are unsafe.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Get unsafe access to the underlying [`VkDeviceMemory`](vk::DeviceMemory).
    /// Should always be used together with [`Allocation::offset()`].
    /// # Safety
    /// The user must not free this memory or access a range outside of `offset()..offset() + size()`.
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Offset of this allocation inside its memory object. Pooled allocations share one memory object,
    /// so this must be used when binding.
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Size in bytes that was requested for this allocation.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Index of the memory type this allocation was made from.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Allocate flags the backing memory object was allocated with.
    pub fn allocate_flags(&self) -> vk::MemoryAllocateFlags {
        self.allocate_flags
    }

    /// Host pointer to the start of this allocation. Only `Some` between
    /// [`MemoryManager::map()`](crate::MemoryManager::map()) and the matching [`MemoryManager::unmap()`](crate::MemoryManager::unmap()).
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.mapped
    }

    /// Device address of the buffer bound to this allocation, if it was bound through
    /// [`MemoryManager::bind_buffer()`](crate::MemoryManager::bind_buffer()) and allocated with [`vk::MemoryAllocateFlags::DEVICE_ADDRESS`].
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    /// Heap and block this allocation occupies. `None` for dedicated allocations.
    pub fn block(&self) -> Option<BlockRef> {
        self.block
    }

    /// Whether this allocation owns its memory object.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

impl traits::Allocation for Allocation {
    unsafe fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.mapped
    }
}
