//! A linear allocator for staging memory that is uploaded to the GPU.
//!
//! The [`UploadAllocator`] bump-allocates from large, persistently mapped upload buffers. When the current buffer runs out of room,
//! a new one is created and becomes the current buffer. Buffers are reference counted: every [`UploadAllocation`] keeps its buffer
//! alive, so rotating to a new buffer never invalidates memory that is still waiting to be copied. Requests that are at least as large
//! as a shared buffer get a private buffer of exactly their size.
//!
//! # Example
//! ```
//! # use phobos_heap::*;
//! # use anyhow::Result;
//! fn stage_vertices(uploads: &UploadAllocator, vertices: &[f32]) -> Result<(vk::Buffer, vk::DeviceSize)> {
//!     let staging = uploads.upload(vertices)?;
//!     // Record a copy from `staging.buffer_handle()` at `staging.offset()`, and keep `staging` alive
//!     // until the copy has executed.
//!     // SAFETY: The handle is only used while `staging` is alive.
//!     Ok((unsafe { staging.buffer_handle() }, staging.offset()))
//! }
//! ```

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;

use crate::{Allocation, AllocationOptions, Error, MemoryDevice, MemoryManager, MemoryType, VulkanDevice};
use crate::util::align::align_up;

/// A persistently mapped `TRANSFER_SRC` buffer in host-visible memory. Destroyed when the last reference to it is dropped.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct UploadBuffer<D: MemoryDevice = VulkanDevice> {
    #[derivative(Debug = "ignore")]
    manager: MemoryManager<D>,
    // Always Some(_), taken in `Drop`.
    memory: Option<Allocation>,
    pointer: NonNull<c_void>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
}

// SAFETY: The unsafe part of this is the mapped pointer, but this is a pointer to GPU memory
// so its value is not dropped when sending this to a different thread.
unsafe impl<D: MemoryDevice> Send for UploadBuffer<D> {}
unsafe impl<D: MemoryDevice> Sync for UploadBuffer<D> {}

impl<D: MemoryDevice> UploadBuffer<D> {
    /// Create a new upload buffer of `size` bytes, allocate [`MemoryType::CpuToGpu`] memory for it, bind it and map it.
    /// # Errors
    /// * Fails if buffer creation or the allocation fails, usually because the device is out of memory.
    /// * Fails if the memory cannot be mapped.
    pub fn new(manager: &MemoryManager<D>, size: impl Into<vk::DeviceSize>) -> Result<Self> {
        let size = size.into();
        let device = manager.device();
        let handle = device.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC)?;

        let mut memory = match manager.allocate_for_buffer("upload_buffer", handle, MemoryType::CpuToGpu, AllocationOptions::default()) {
            Ok(memory) => memory,
            Err(err) => {
                // SAFETY: The buffer was just created and is not in use.
                unsafe { device.destroy_buffer(handle) };
                return Err(err);
            }
        };

        // SAFETY: The allocation was made for this buffer's memory requirements.
        let mapped = unsafe { manager.bind_buffer(handle, &mut memory) }.and_then(|_| manager.map(&mut memory));
        let pointer = match mapped {
            Ok(pointer) => pointer,
            Err(err) => {
                if let Err(free_err) = manager.free(memory) {
                    warn!("Could not free memory of a failed upload buffer: {free_err}");
                }
                // SAFETY: The buffer was never used.
                unsafe { device.destroy_buffer(handle) };
                return Err(err.context(Error::UnmappableBuffer));
            }
        };

        #[cfg(feature = "log-objects")]
        trace!("Created new upload buffer {handle:p} (size = {size} bytes)");

        Ok(Self {
            manager: manager.clone(),
            memory: Some(memory),
            pointer,
            handle,
            size,
        })
    }

    /// Obtain a handle to the raw vulkan buffer object.
    /// # Safety
    /// * The caller must make sure to not use this handle after `self` is dropped.
    /// * The caller must not call `vkDestroyBuffer` on this handle.
    pub unsafe fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Capacity of this buffer in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Host pointer to the first byte of the buffer.
    pub fn mapped_ptr(&self) -> NonNull<c_void> {
        self.pointer
    }
}

impl<D: MemoryDevice> Drop for UploadBuffer<D> {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying upload buffer {:p}", self.handle);
        if let Some(memory) = self.memory.take() {
            // Freeing also releases the mapping.
            if let Err(err) = self.manager.free(memory) {
                error!("Failed to free upload buffer memory: {err}");
            }
        }
        // SAFETY: This is the last reference to the buffer, so no allocation from it is alive anymore.
        unsafe { self.manager.device().destroy_buffer(self.handle) };
    }
}

/// A range of an [`UploadBuffer`] handed out by the [`UploadAllocator`]. Keeps its buffer alive.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct UploadAllocation<D: MemoryDevice = VulkanDevice> {
    buffer: Arc<UploadBuffer<D>>,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

impl<D: MemoryDevice> UploadAllocation<D> {
    /// The buffer this range lives in.
    pub fn buffer(&self) -> &Arc<UploadBuffer<D>> {
        &self.buffer
    }

    /// Obtain a handle to the raw vulkan buffer to copy from.
    /// # Safety
    /// The caller must not use this handle after `self` is dropped.
    pub unsafe fn buffer_handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Offset of this range in the buffer.
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Host pointer to the first byte of this range.
    pub fn mapped_ptr(&self) -> NonNull<u8> {
        // SAFETY: The range lies within the mapped buffer.
        unsafe { NonNull::new_unchecked(self.buffer.pointer.as_ptr().cast::<u8>().add(self.offset as usize)) }
    }

    /// View this range as a mutable slice of `T`. The length is rounded down to whole elements.
    /// # Errors
    /// * Fails if `T` is zero-sized or the range is not aligned for `T`.
    pub fn mapped_slice<T: Copy>(&mut self) -> Result<&mut [T]> {
        let pointer = self.mapped_ptr();
        if std::mem::size_of::<T>() == 0 || pointer.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            anyhow::bail!(Error::BufferViewOutOfRange);
        }
        // SAFETY: The range is mapped, aligned for T, and exclusively owned through `&mut self`.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                pointer.cast::<T>().as_ptr(),
                self.size as usize / std::mem::size_of::<T>(),
            )
        })
    }

    /// Copy `data` to the start of this range.
    /// # Errors
    /// * Fails if `data` is larger than the range.
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let bytes = std::mem::size_of_val(data);
        if bytes as vk::DeviceSize > self.size {
            anyhow::bail!(Error::BufferViewOutOfRange);
        }
        // SAFETY: The destination range is mapped, at least `bytes` long, and exclusively owned through `&mut self`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr().cast::<u8>(), self.mapped_ptr().as_ptr(), bytes);
        }
        Ok(())
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct UploadState<D: MemoryDevice> {
    current: Option<Arc<UploadBuffer<D>>>,
    offset: vk::DeviceSize,
}

/// Bump allocator for staging memory. See the [module documentation](self) for details.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct UploadAllocator<D: MemoryDevice = VulkanDevice> {
    #[derivative(Debug = "ignore")]
    manager: MemoryManager<D>,
    max_shared_allocation: vk::DeviceSize,
    default_alignment: vk::DeviceSize,
    state: Mutex<UploadState<D>>,
}

impl<D: MemoryDevice> UploadAllocator<D> {
    /// Create a new upload allocator. Buffer sizes are taken from the manager's [`AllocatorSettings`](crate::AllocatorSettings).
    /// No buffer is created until the first allocation.
    pub fn new(manager: MemoryManager<D>) -> Self {
        let settings = *manager.settings();
        Self {
            manager,
            max_shared_allocation: settings.max_shared_upload_size,
            default_alignment: settings.upload_alignment.max(1),
            state: Mutex::new(UploadState {
                current: None,
                offset: 0,
            }),
        }
    }

    /// Size of every shared upload buffer.
    pub fn max_shared_allocation(&self) -> vk::DeviceSize {
        self.max_shared_allocation
    }

    /// Allocate `size` bytes aligned to `alignment`. The returned range stays valid for as long as it is alive, even after the
    /// allocator moved on to a new buffer.
    /// # Errors
    /// * Fails if `size` is zero.
    /// * Fails if a new buffer is needed and creating it fails.
    pub fn allocate(&self, size: impl Into<vk::DeviceSize>, alignment: impl Into<vk::DeviceSize>) -> Result<UploadAllocation<D>> {
        let size = size.into();
        let alignment = alignment.into();
        if size == 0 {
            anyhow::bail!(Error::ZeroSizedAllocation);
        }

        if size >= self.max_shared_allocation {
            let buffer = Arc::new(UploadBuffer::new(&self.manager, size)?);
            debug!("Created private upload buffer of {size} bytes");
            return Ok(UploadAllocation {
                buffer,
                offset: 0,
                size,
            });
        }

        let mut state = self.state.lock().map_err(|_| Error::PoisonError)?;
        if let Some(buffer) = &state.current {
            let aligned_offset = align_up(state.offset, alignment);
            if aligned_offset + size <= buffer.size() {
                let buffer = buffer.clone();
                state.offset = aligned_offset + size;
                return Ok(UploadAllocation {
                    buffer,
                    offset: aligned_offset,
                    size,
                });
            }
        }

        // Out of room. The old buffer stays alive through the allocations that reference it.
        let buffer = Arc::new(UploadBuffer::new(&self.manager, self.max_shared_allocation)?);
        debug!("Rotated to a new upload buffer of {} bytes", self.max_shared_allocation);
        state.current = Some(buffer.clone());
        state.offset = size;
        Ok(UploadAllocation {
            buffer,
            offset: 0,
            size,
        })
    }

    /// Allocate room for `data` with the default upload alignment and copy it in.
    /// # Errors
    /// * Fails if `data` is empty.
    /// * Fails if a new buffer is needed and creating it fails.
    pub fn upload<T: Copy>(&self, data: &[T]) -> Result<UploadAllocation<D>> {
        let alignment = self.default_alignment.max(std::mem::align_of::<T>() as vk::DeviceSize);
        let mut allocation = self.allocate(std::mem::size_of_val(data) as vk::DeviceSize, alignment)?;
        allocation.write(data)?;
        Ok(allocation)
    }

    /// Drop the allocator's reference to its current buffer. Outstanding allocations keep their buffers alive,
    /// the next allocation starts a new buffer.
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::PoisonError)?;
        state.current = None;
        state.offset = 0;
        Ok(())
    }
}
