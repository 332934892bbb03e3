//! Pooled Vulkan device memory allocation
//!
//! phobos-heap turns a small number of large `VkDeviceMemory` allocations into many small sub-allocations for buffers and images,
//! and provides a bump allocator for transient upload staging memory. Drivers limit the number of live memory objects and make
//! each allocation expensive, so resources should not allocate their own memory unless they are large or the driver asks for it.
//!
//! To get started, import everything from the prelude
//! ```
//! use phobos_heap::prelude::*;
//! ```
//!
//! # Example
//!
//! The allocators talk to the driver through the [`MemoryDevice`] trait. [`VulkanDevice`] implements it on top of an existing
//! [`ash::Device`].
//! ```
//! use phobos_heap::prelude::*;
//! # use anyhow::Result;
//! # fn example(device: ash::Device, physical_device_memory: vk::PhysicalDeviceMemoryProperties, physical_device_properties: vk::PhysicalDeviceProperties, buffer: vk::Buffer) -> Result<()> {
//! let device = VulkanDevice::new(device, physical_device_memory, &physical_device_properties, None, true);
//! let settings = AllocatorSettingsBuilder::new()
//!     .heap_size(64 * 1024 * 1024u64)
//!     .build();
//! let manager = MemoryManager::new(device, settings);
//!
//! let mut memory = manager.allocate_for_buffer("vertices", buffer, MemoryType::GpuOnly, AllocationOptions::default())?;
//! // SAFETY: The allocation was made for this buffer.
//! unsafe { manager.bind_buffer(buffer, &mut memory)? };
//! // ... use the buffer, then destroy it and give the memory back.
//! manager.free(memory)?;
//!
//! // Staging memory for uploads
//! let uploads = UploadAllocator::new(manager.clone());
//! let staging = uploads.upload(&[1.0f32, 2.0, 3.0])?;
//! # Ok(())
//! # }
//! ```
//! For further information, check out the following modules
//! - [`allocator`] for the memory manager, its heaps and the upload allocator.
//! - [`core`] for the device boundary, settings and the error type.
//! - [`util`] for alignment helpers.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod prelude;
pub use crate::prelude::*;

pub mod allocator;
pub mod core;
pub mod util;

static_assertions::assert_impl_all!(MemoryManager: Send, Sync, Clone);
static_assertions::assert_impl_all!(UploadAllocator: Send, Sync);
static_assertions::assert_impl_all!(UploadAllocation: Send, Sync);
static_assertions::assert_impl_all!(Allocation: Send, Sync);
