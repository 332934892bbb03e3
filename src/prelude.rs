pub use ash::vk;

pub use crate::core::device::{DeviceLimits, MemoryDevice, MemoryRequirements, Resource, VulkanDevice};
pub use crate::core::error::Error;
pub use crate::core::settings::*;

pub use crate::allocator::traits::Allocator;
pub use crate::allocator::traits;
pub use crate::allocator::allocation::Allocation;
pub use crate::allocator::block::{BlockId, BlockList, MemoryBlock};
pub use crate::allocator::heap::{HeapId, MemoryHeap};
pub use crate::allocator::manager::{AllocationOptions, MemoryManager, MemoryStats};
pub use crate::allocator::memory_type::MemoryType;
pub use crate::allocator::upload::{UploadAllocation, UploadAllocator, UploadBuffer};
