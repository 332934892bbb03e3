use std::ffi::c_void;
use std::ptr::NonNull;

use anyhow::Result;
use ash::vk;

use crate::allocator::memory_type::MemoryType;

/// Generic device memory allocator. Unlike many allocators, allocations are never freed implicitly:
/// memory must be returned with [`Allocator::free()`] once the resource using it is destroyed.
pub trait Allocator: Clone + Send + Sync {
    type Allocation: Allocation;

    fn allocate(&mut self, name: &str, requirements: &vk::MemoryRequirements, ty: MemoryType) -> Result<Self::Allocation>;
    fn free(&mut self, allocation: Self::Allocation) -> Result<()>;
}

pub trait Allocation: Default {
    unsafe fn memory(&self) -> vk::DeviceMemory;
    fn offset(&self) -> vk::DeviceSize;
    fn size(&self) -> vk::DeviceSize;
    fn mapped_ptr(&self) -> Option<NonNull<c_void>>;
}
