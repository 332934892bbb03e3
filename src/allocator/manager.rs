//! The pooled device memory allocator.
//!
//! The [`MemoryManager`] keeps a registry of [`MemoryHeap`]s, each keyed by memory type index and allocate flags. Small resources are
//! sub-allocated from these heaps, large resources (and resources the driver wants to own their memory) get a dedicated memory
//! object. Heaps are created on demand and destroyed as soon as their last allocation is freed.
//!
//! # Example
//! ```
//! # use phobos_heap::*;
//! # use anyhow::Result;
//! fn make_vertex_buffer_memory(manager: &MemoryManager, buffer: vk::Buffer) -> Result<Allocation> {
//!     let mut memory = manager.allocate_for_buffer("vertex_buffer", buffer, MemoryType::GpuOnly, AllocationOptions::default())?;
//!     // SAFETY: The allocation was made for this buffer's memory requirements.
//!     unsafe { manager.bind_buffer(buffer, &mut memory)? };
//!     Ok(memory)
//! }
//! ```

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::Result;
use ash::vk;

use crate::{Allocation, AllocatorSettings, DeviceLimits, Error, MemoryDevice, MemoryRequirements, MemoryType, Resource, VulkanDevice};
use crate::allocator::heap::{HeapId, MappedPointer, MemoryHeap};
use crate::allocator::traits;
use crate::util::align::align_up;

/// Per-allocation options for [`MemoryManager::allocate()`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AllocationOptions {
    /// Always give this allocation its own memory object.
    pub force_dedicated: bool,
    /// Flags for the backing memory object, for example [`vk::MemoryAllocateFlags::DEVICE_ADDRESS`].
    /// Heaps are only shared between allocations with equal flags.
    pub allocate_flags: vk::MemoryAllocateFlags,
}

impl AllocationOptions {
    /// Options for an allocation that always gets its own memory object.
    pub fn dedicated() -> Self {
        Self {
            force_dedicated: true,
            ..Default::default()
        }
    }

    /// Set the allocate flags.
    pub fn flags(mut self, flags: vk::MemoryAllocateFlags) -> Self {
        self.allocate_flags = flags;
        self
    }
}

/// Snapshot of the manager's bookkeeping, see [`MemoryManager::stats()`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of live pooled heaps.
    pub heap_count: usize,
    /// Number of live dedicated allocations.
    pub dedicated_count: u32,
    /// Number of live native memory objects, heaps and dedicated allocations together.
    pub native_allocation_count: u32,
    /// Bytes reserved by pooled heaps.
    pub reserved_bytes: vk::DeviceSize,
    /// Bytes handed out from pooled heaps, alignment padding included.
    pub used_bytes: vk::DeviceSize,
}

// A live dedicated memory object and its mapping reference count.
#[derive(Debug, Default)]
struct DedicatedMemory {
    mapping: Option<MappedPointer>,
    map_count: u32,
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct ManagerInner<D: MemoryDevice> {
    #[derivative(Debug = "ignore")]
    device: D,
    settings: AllocatorSettings,
    limits: DeviceLimits,
    heaps: RwLock<Vec<MemoryHeap<D>>>,
    next_heap_id: AtomicU64,
    num_allocations: AtomicU32,
    dedicated: Mutex<HashMap<vk::DeviceMemory, DedicatedMemory>>,
}

/// Pooled device memory allocator. It's important to note that the manager is `Clone`, `Send` and `Sync`.
/// All its internal state is shared through an `Arc`, so clones refer to the same heaps.
///
/// Allocations are never freed implicitly, give them back with [`MemoryManager::free()`].
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct MemoryManager<D: MemoryDevice = VulkanDevice> {
    inner: Arc<ManagerInner<D>>,
}

impl<D: MemoryDevice> MemoryManager<D> {
    /// Create a new memory manager. No memory is allocated until the first allocation is made.
    pub fn new(device: D, settings: AllocatorSettings) -> Self {
        let limits = device.limits();
        info!(
            "Created MemoryManager (heap size = {} bytes, max allocations = {}, buffer image granularity = {})",
            settings.heap_size, limits.max_memory_allocation_count, limits.buffer_image_granularity
        );
        Self {
            inner: Arc::new(ManagerInner {
                device,
                settings,
                limits,
                heaps: RwLock::new(Vec::new()),
                next_heap_id: AtomicU64::new(0),
                num_allocations: AtomicU32::new(0),
                dedicated: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The device this manager allocates from.
    pub fn device(&self) -> &D {
        &self.inner.device
    }

    pub fn settings(&self) -> &AllocatorSettings {
        &self.inner.settings
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.inner.limits
    }

    /// Allocate memory with the given requirements from a memory type that has all `properties`.
    ///
    /// The allocation is dedicated if `options.force_dedicated` is set, if the driver prefers or requires it, or if it would not fit
    /// in a single heap. Otherwise it is placed in the first heap of a matching memory type that has room, and a new heap is created
    /// if there is none. The name is used for debug logging and to name dedicated memory objects.
    /// # Errors
    /// * Fails if no memory type matches the requirements and properties.
    /// * Fails if the device is out of memory.
    /// * Fails if the requested size is zero.
    pub fn allocate(
        &self,
        name: &str,
        requirements: &MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        options: AllocationOptions,
    ) -> Result<Allocation> {
        let type_bits = requirements.requirements.memory_type_bits;
        let memory_type_index = self
            .inner
            .device
            .find_memory_type_index(type_bits, properties)
            .ok_or_else(|| {
                error!("No suitable memory type for allocation `{name}`");
                Error::NoSuitableMemoryType {
                    type_bits,
                    flags: properties,
                }
            })?;
        self.allocate_in_type(name, requirements, memory_type_index, options, None)
    }

    /// Allocate memory for a buffer. Its requirements and dedicated allocation hints are queried from the device.
    /// The buffer is not bound, see [`MemoryManager::bind_buffer()`].
    /// # Errors
    /// * Fails if no memory type matches the buffer's requirements.
    /// * Fails if the device is out of memory.
    pub fn allocate_for_buffer(
        &self,
        name: &str,
        buffer: vk::Buffer,
        ty: MemoryType,
        options: AllocationOptions,
    ) -> Result<Allocation> {
        self.allocate_for_resource(name, Resource::Buffer(buffer), ty, options)
    }

    /// Allocate memory for an image. Its requirements and dedicated allocation hints are queried from the device.
    /// The image is not bound, see [`MemoryManager::bind_image()`].
    /// # Errors
    /// * Fails if no memory type matches the image's requirements.
    /// * Fails if the device is out of memory.
    pub fn allocate_for_image(
        &self,
        name: &str,
        image: vk::Image,
        ty: MemoryType,
        options: AllocationOptions,
    ) -> Result<Allocation> {
        self.allocate_for_resource(name, Resource::Image(image), ty, options)
    }

    fn allocate_for_resource(
        &self,
        name: &str,
        resource: Resource,
        ty: MemoryType,
        options: AllocationOptions,
    ) -> Result<Allocation> {
        let requirements = self.inner.device.memory_requirements(resource);
        let memory_type_index = self.find_memory_type(&requirements, ty)?;
        self.allocate_in_type(name, &requirements, memory_type_index, options, Some(resource))
    }

    /// Find the memory type to use for an allocation of type `ty`, trying the preferred flags first.
    /// # Errors
    /// * Fails if not even the required flags can be satisfied.
    pub fn find_memory_type(&self, requirements: &MemoryRequirements, ty: MemoryType) -> Result<u32> {
        let type_bits = requirements.requirements.memory_type_bits;
        let device = &self.inner.device;
        device
            .find_memory_type_index(type_bits, ty.preferred_flags())
            .or_else(|| device.find_memory_type_index(type_bits, ty.required_flags()))
            .ok_or_else(|| {
                Error::NoSuitableMemoryType {
                    type_bits,
                    flags: ty.required_flags(),
                }
                .into()
            })
    }

    fn allocate_in_type(
        &self,
        name: &str,
        requirements: &MemoryRequirements,
        memory_type_index: u32,
        options: AllocationOptions,
        resource: Option<Resource>,
    ) -> Result<Allocation> {
        let vk::MemoryRequirements {
            size,
            alignment,
            ..
        } = requirements.requirements;
        if size == 0 {
            anyhow::bail!(Error::ZeroSizedAllocation);
        }

        let heap_size = self.inner.settings.heap_size;
        let dedicated = options.force_dedicated
            || requirements.prefers_dedicated
            || requirements.requires_dedicated
            || size > heap_size
            || align_up(size, alignment) >= heap_size;

        if dedicated {
            self.allocate_dedicated(name, size, memory_type_index, options.allocate_flags, resource)
        } else {
            self.allocate_pooled(size, alignment, memory_type_index, options.allocate_flags)
        }
    }

    fn allocate_dedicated(
        &self,
        name: &str,
        size: vk::DeviceSize,
        memory_type_index: u32,
        flags: vk::MemoryAllocateFlags,
        resource: Option<Resource>,
    ) -> Result<Allocation> {
        let device = &self.inner.device;
        let memory = device.allocate_memory(size, memory_type_index, flags, resource).map_err(|err| {
            error!("Failed to allocate dedicated memory for `{name}` ({size} bytes): {err}");
            err
        })?;
        match self.lock_dedicated() {
            Ok(mut dedicated) => {
                dedicated.insert(memory, DedicatedMemory::default());
            }
            Err(err) => {
                // SAFETY: The memory was just allocated and nothing refers to it.
                unsafe { device.free_memory(memory) };
                return Err(err);
            }
        }
        self.track_native_allocation(size);
        debug!("Using dedicated allocation for `{name}` ({size} bytes)");
        if let Err(err) = device.set_memory_name(memory, name) {
            warn!("Could not name dedicated allocation `{name}`: {err}");
        }

        Ok(Allocation {
            memory,
            offset: 0,
            size,
            memory_type_index,
            allocate_flags: flags,
            dedicated: true,
            ..Default::default()
        })
    }

    fn allocate_pooled(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        memory_type_index: u32,
        flags: vk::MemoryAllocateFlags,
    ) -> Result<Allocation> {
        let granularity = self.inner.limits.buffer_image_granularity;
        {
            let heaps = self.read_heaps()?;
            for heap in heaps
                .iter()
                .filter(|heap| heap.memory_type_index() == memory_type_index && heap.allocate_flags() == flags)
            {
                if let Some(allocation) = heap.allocate(size, alignment, granularity)? {
                    return Ok(allocation);
                }
            }
        }

        // Every heap of this type is full, make a new one. The heap is only published once the allocation is made,
        // so no other thread can observe it empty.
        let heap = self.create_heap(memory_type_index, flags)?;
        let allocation = match heap.allocate(size, alignment, granularity) {
            Ok(Some(allocation)) => allocation,
            Ok(None) => {
                self.destroy_heap(heap);
                anyhow::bail!(Error::Uncategorized("Allocation does not fit in a new heap"));
            }
            Err(err) => {
                self.destroy_heap(heap);
                return Err(err);
            }
        };
        self.write_heaps()?.push(heap);
        Ok(allocation)
    }

    fn create_heap(&self, memory_type_index: u32, flags: vk::MemoryAllocateFlags) -> Result<MemoryHeap<D>> {
        let id = HeapId(self.inner.next_heap_id.fetch_add(1, Ordering::Relaxed));
        let size = self.inner.settings.heap_size;
        let mut heap = MemoryHeap::new(self.inner.device.clone(), id, size, memory_type_index, flags).map_err(|err| {
            error!("Failed to allocate memory for a new MemoryHeap ({size} bytes): {err}");
            err
        })?;
        self.track_native_allocation(size);
        heap.set_name(format!("MemoryHeap[{id}] (memory type {memory_type_index})"));
        Ok(heap)
    }

    fn destroy_heap(&self, heap: MemoryHeap<D>) {
        heap.destroy();
        self.track_native_free();
    }

    /// Give memory back to the manager. Pooled allocations are returned to their heap, and the heap is destroyed if it becomes empty.
    /// Dedicated allocations free their memory object directly. Any outstanding mapping of the allocation is released.
    /// # Errors
    /// * Fails if the allocation was not made by this manager, or was already freed.
    pub fn free(&self, mut allocation: Allocation) -> Result<()> {
        if allocation.dedicated {
            return self.free_dedicated(&mut allocation);
        }

        let Some(block) = allocation.block else {
            error!("Tried to free an allocation without a heap or a memory object");
            anyhow::bail!(Error::InvalidAllocation);
        };

        let heap_empty = {
            let heaps = self.read_heaps()?;
            let heap = Self::find_heap(&heaps, block.heap)?;
            while allocation.map_count > 0 {
                heap.unmap(&allocation)?;
                allocation.map_count -= 1;
            }
            heap.free(&allocation)?;
            heap.is_empty()?
        };

        if heap_empty {
            self.remove_heap_if_empty(block.heap)?;
        }
        Ok(())
    }

    fn free_dedicated(&self, allocation: &mut Allocation) -> Result<()> {
        let Some(entry) = self.lock_dedicated()?.remove(&allocation.memory) else {
            error!("Tried to free dedicated memory {:p}, which is not owned by this manager", allocation.memory);
            anyhow::bail!(Error::InvalidAllocation);
        };

        if entry.mapping.is_some() {
            // SAFETY: The allocation owns this memory object and is being freed.
            unsafe { self.inner.device.unmap_memory(allocation.memory) };
        }
        allocation.map_count = 0;
        allocation.mapped = None;

        // SAFETY: Dedicated allocations own their memory object, and the caller gave up the allocation.
        unsafe { self.inner.device.free_memory(allocation.memory) };
        self.track_native_free();
        Ok(())
    }

    // Remove a heap from the registry if it is still empty once the registry is locked for writing.
    fn remove_heap_if_empty(&self, id: HeapId) -> Result<()> {
        let heap = {
            let mut heaps = self.write_heaps()?;
            let position = heaps.iter().position(|heap| heap.id() == id);
            match position {
                Some(index) if heaps[index].is_empty()? => heaps.remove(index),
                _ => return Ok(()),
            }
        };
        self.destroy_heap(heap);
        Ok(())
    }

    /// Map an allocation into host memory. Allocations from the same heap share one mapping, which is released once every
    /// allocation that mapped it is unmapped again. The returned pointer points to the first byte of the allocation and is also
    /// available through [`Allocation::mapped_ptr()`] until the matching [`MemoryManager::unmap()`].
    /// # Errors
    /// * Fails if the memory is not host visible.
    /// * Fails if the allocation was not made by this manager.
    pub fn map(&self, allocation: &mut Allocation) -> Result<NonNull<c_void>> {
        let pointer = if allocation.dedicated {
            self.map_dedicated(allocation)?
        } else {
            let block = allocation.block.ok_or(Error::InvalidAllocation)?;
            let heaps = self.read_heaps()?;
            Self::find_heap(&heaps, block.heap)?.map(allocation)?
        };
        allocation.map_count += 1;
        allocation.mapped = Some(pointer);
        Ok(pointer)
    }

    /// Release one mapping of an allocation.
    /// # Errors
    /// * Fails if the allocation is not mapped.
    pub fn unmap(&self, allocation: &mut Allocation) -> Result<()> {
        if allocation.map_count == 0 {
            anyhow::bail!(Error::NotMapped);
        }

        if allocation.dedicated {
            self.unmap_dedicated(allocation)?;
        } else {
            let block = allocation.block.ok_or(Error::InvalidAllocation)?;
            let heaps = self.read_heaps()?;
            Self::find_heap(&heaps, block.heap)?.unmap(allocation)?;
        }
        allocation.map_count -= 1;
        if allocation.map_count == 0 {
            allocation.mapped = None;
        }
        Ok(())
    }

    fn map_dedicated(&self, allocation: &Allocation) -> Result<NonNull<c_void>> {
        let mut dedicated = self.lock_dedicated()?;
        let entry = Self::owned_dedicated(&mut dedicated, allocation)?;
        let existing = entry.mapping;
        let pointer = match existing {
            Some(mapping) => mapping.0,
            None => {
                // SAFETY: This memory object is not mapped, since it has no cached mapping.
                let pointer = unsafe { self.inner.device.map_memory(allocation.memory)? };
                entry.mapping = Some(MappedPointer(pointer));
                pointer
            }
        };
        entry.map_count += 1;
        Ok(pointer)
    }

    fn unmap_dedicated(&self, allocation: &Allocation) -> Result<()> {
        let mut dedicated = self.lock_dedicated()?;
        let entry = Self::owned_dedicated(&mut dedicated, allocation)?;
        if entry.map_count == 0 {
            anyhow::bail!(Error::NotMapped);
        }
        entry.map_count -= 1;
        if entry.map_count == 0 {
            entry.mapping = None;
            // SAFETY: The last mapping reference was just released.
            unsafe { self.inner.device.unmap_memory(allocation.memory) };
        }
        Ok(())
    }

    fn owned_dedicated<'a>(
        dedicated: &'a mut HashMap<vk::DeviceMemory, DedicatedMemory>,
        allocation: &Allocation,
    ) -> Result<&'a mut DedicatedMemory> {
        dedicated.get_mut(&allocation.memory).ok_or_else(|| {
            error!("Dedicated memory {:p} is not owned by this manager", allocation.memory);
            Error::InvalidAllocation.into()
        })
    }

    /// Bind a buffer to an allocation. If the allocation was made with [`vk::MemoryAllocateFlags::DEVICE_ADDRESS`], the buffer's
    /// device address is queried and stored in the allocation.
    /// # Safety
    /// The allocation must have been made for this buffer's memory requirements, and the buffer must not be bound yet.
    /// # Errors
    /// * Fails if binding fails.
    /// * Fails if the device returns a null device address.
    pub unsafe fn bind_buffer(&self, buffer: vk::Buffer, allocation: &mut Allocation) -> Result<()> {
        self.inner
            .device
            .bind_buffer_memory(buffer, allocation.memory, allocation.offset)?;
        if allocation
            .allocate_flags
            .contains(vk::MemoryAllocateFlags::DEVICE_ADDRESS)
        {
            let address = self.inner.device.buffer_device_address(buffer);
            if address == 0 {
                anyhow::bail!(Error::NullDeviceAddress);
            }
            allocation.device_address = Some(address);
        }
        Ok(())
    }

    /// Bind an image to an allocation.
    /// # Safety
    /// The allocation must have been made for this image's memory requirements, and the image must not be bound yet.
    /// # Errors
    /// * Fails if binding fails.
    pub unsafe fn bind_image(&self, image: vk::Image, allocation: &Allocation) -> Result<()> {
        self.inner
            .device
            .bind_image_memory(image, allocation.memory, allocation.offset)
    }

    /// Collect statistics about live heaps and allocations.
    pub fn stats(&self) -> Result<MemoryStats> {
        let heaps = self.read_heaps()?;
        let mut stats = MemoryStats {
            heap_count: heaps.len(),
            dedicated_count: self.lock_dedicated()?.len() as u32,
            native_allocation_count: self.inner.num_allocations.load(Ordering::Relaxed),
            ..Default::default()
        };
        for heap in heaps.iter() {
            stats.reserved_bytes += heap.size();
            stats.used_bytes += heap.used_bytes()?;
        }
        Ok(stats)
    }

    /// Inspect the live heaps. The registry is locked for reading while `f` runs, so `f` must not allocate or free.
    pub fn with_heaps<R>(&self, f: impl FnOnce(&[MemoryHeap<D>]) -> R) -> Result<R> {
        Ok(f(&self.read_heaps()?))
    }

    /// Destroy every heap. Heaps that still hold allocations are reported as leaks, and their allocations become invalid.
    pub fn release_heaps(&self) -> Result<()> {
        let heaps = std::mem::take(&mut *self.write_heaps()?);
        for heap in heaps {
            self.destroy_heap(heap);
        }
        Ok(())
    }

    fn find_heap(heaps: &[MemoryHeap<D>], id: HeapId) -> Result<&MemoryHeap<D>> {
        heaps.iter().find(|heap| heap.id() == id).ok_or_else(|| {
            error!("Allocation refers to MemoryHeap {id}, which is not owned by this manager");
            Error::InvalidAllocation.into()
        })
    }

    fn read_heaps(&self) -> Result<RwLockReadGuard<'_, Vec<MemoryHeap<D>>>> {
        Ok(self.inner.heaps.read().map_err(|_| Error::PoisonError)?)
    }

    fn write_heaps(&self) -> Result<RwLockWriteGuard<'_, Vec<MemoryHeap<D>>>> {
        Ok(self.inner.heaps.write().map_err(|_| Error::PoisonError)?)
    }

    fn lock_dedicated(&self) -> Result<MutexGuard<'_, HashMap<vk::DeviceMemory, DedicatedMemory>>> {
        Ok(self.inner.dedicated.lock().map_err(|_| Error::PoisonError)?)
    }

    fn track_native_allocation(&self, size: vk::DeviceSize) {
        let count = self.inner.num_allocations.fetch_add(1, Ordering::Relaxed) + 1;
        let max = self.inner.limits.max_memory_allocation_count;
        debug!("[AllocateMemory] Allocated {size} bytes, NumAllocations = {count}/{max}");
        if count > max {
            warn!("Too many allocations: {count} live memory objects, device supports {max}");
        }
    }

    fn track_native_free(&self) {
        let count = self.inner.num_allocations.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(
            "[FreeMemory] NumAllocations = {count}/{}",
            self.inner.limits.max_memory_allocation_count
        );
    }
}

impl<D: MemoryDevice> Drop for ManagerInner<D> {
    fn drop(&mut self) {
        let heaps = match self.heaps.get_mut() {
            Ok(heaps) => std::mem::take(heaps),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for heap in heaps {
            heap.destroy();
        }

        let dedicated = match self.dedicated.get_mut() {
            Ok(dedicated) => std::mem::take(dedicated),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        if !dedicated.is_empty() {
            warn!("Memory leak detected: {} dedicated allocation(s) were never freed", dedicated.len());
        }
        for (memory, entry) in dedicated {
            // SAFETY: The manager is being destroyed, nothing can use this memory or its mapping anymore.
            unsafe {
                if entry.mapping.is_some() {
                    self.device.unmap_memory(memory);
                }
                self.device.free_memory(memory);
            }
        }
    }
}

impl<D: MemoryDevice> traits::Allocator for MemoryManager<D> {
    type Allocation = Allocation;

    /// Allocates memory of a specific memory type. The given name is used for debug logging.
    fn allocate(&mut self, name: &str, requirements: &vk::MemoryRequirements, ty: MemoryType) -> Result<Self::Allocation> {
        let requirements = MemoryRequirements::from(*requirements);
        let memory_type_index = self.find_memory_type(&requirements, ty)?;
        self.allocate_in_type(name, &requirements, memory_type_index, AllocationOptions::default(), None)
    }

    fn free(&mut self, allocation: Self::Allocation) -> Result<()> {
        MemoryManager::free(self, allocation)
    }
}
