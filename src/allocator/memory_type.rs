//! Exposes different memory types that determine where memory allocations should live.

use ash::vk;

/// The memory type of an allocation indicates where it should live.
/// Give this to an [`Allocator`](crate::Allocator) to let it decide
/// where your allocation should live.
///
/// See also: [`Allocator::allocate()`](crate::Allocator::allocate()), [`MemoryManager::allocate_for_buffer()`](crate::MemoryManager::allocate_for_buffer())
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryType {
    /// Store the allocation in GPU only accessible memory - typically this is the faster GPU resource and this should be
    /// where most of the allocations live.
    GpuOnly,
    /// Memory useful for uploading data to the GPU and potentially for constant buffers. On most implementations,
    /// this maps to the PCIe BAR if it is available.
    CpuToGpu,
    /// Memory useful for CPU readback of data.
    GpuToCpu,
}

impl MemoryType {
    /// Property flags a memory type must have to be usable for this kind of allocation.
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryType::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryType::CpuToGpu => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            MemoryType::GpuToCpu => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    /// Property flags that are tried first. If no memory type has all of these, [`MemoryType::required_flags()`] is used.
    pub fn preferred_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryType::GpuOnly => self.required_flags(),
            MemoryType::CpuToGpu => self.required_flags() | vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryType::GpuToCpu => self.required_flags() | vk::MemoryPropertyFlags::HOST_CACHED,
        }
    }
}
