//! The boundary between the allocators and the Vulkan driver.
//!
//! Everything the allocators need from the driver goes through the [`MemoryDevice`] trait. [`VulkanDevice`] implements it on top
//! of an [`ash::Device`]. Other implementations can be supplied, for example to run the allocators against host memory in tests.

use std::ffi::{c_void, CString};
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::Result;
use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::vk::Handle;

use crate::Error;

/// A resource that memory can be allocated for. Used to query memory requirements and to make dedicated allocations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Memory requirements of a resource, together with the driver's hints about dedicated allocations.
#[derive(Debug, Default, Copy, Clone)]
pub struct MemoryRequirements {
    /// Size, alignment and compatible memory type bits.
    pub requirements: vk::MemoryRequirements,
    /// The driver would like this resource to have its own memory object.
    pub prefers_dedicated: bool,
    /// The driver requires this resource to have its own memory object.
    pub requires_dedicated: bool,
}

impl From<vk::MemoryRequirements> for MemoryRequirements {
    fn from(requirements: vk::MemoryRequirements) -> Self {
        Self {
            requirements,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }
}

/// Device limits the allocators care about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum number of live `VkDeviceMemory` objects. Exceeding this is reported, but not enforced.
    pub max_memory_allocation_count: u32,
    /// Page size at which linear and non-linear resources may not alias.
    pub buffer_image_granularity: vk::DeviceSize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        // Minimum guarantees from the Vulkan specification.
        Self {
            max_memory_allocation_count: 4096,
            buffer_image_granularity: 1,
        }
    }
}

impl From<&vk::PhysicalDeviceLimits> for DeviceLimits {
    fn from(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_memory_allocation_count: limits.max_memory_allocation_count,
            buffer_image_granularity: limits.buffer_image_granularity,
        }
    }
}

/// Abstract device that owns the native memory objects the allocators sub-allocate.
pub trait MemoryDevice: Clone + Send + Sync {
    /// Query size, alignment, memory type bits and dedicated allocation hints for a resource.
    fn memory_requirements(&self, resource: Resource) -> MemoryRequirements;

    /// Find a memory type index that is allowed by `type_bits` and has all `flags` set.
    fn find_memory_type_index(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32>;

    /// Allocate a new native memory object. This is expensive and the number of live objects is limited,
    /// which is the reason for sub-allocation. If `dedicated` is set, the memory is allocated for that resource only.
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        flags: vk::MemoryAllocateFlags,
        dedicated: Option<Resource>,
    ) -> Result<vk::DeviceMemory>;

    /// Free a native memory object.
    /// # Safety
    /// The memory must have been allocated by this device, must not be mapped and must not be in use.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Map an entire memory object into host address space.
    /// # Safety
    /// The memory must be host visible and must not currently be mapped.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>>;

    /// Unmap a memory object.
    /// # Safety
    /// The memory must currently be mapped.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Bind memory to a buffer.
    /// # Safety
    /// The offset must satisfy the buffer's memory requirements and the range must be owned by the caller.
    unsafe fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> Result<()>;

    /// Bind memory to an image.
    /// # Safety
    /// The offset must satisfy the image's memory requirements and the range must be owned by the caller.
    unsafe fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> Result<()>;

    /// Get the device address of a buffer. The buffer must be bound to memory allocated with
    /// [`vk::MemoryAllocateFlags::DEVICE_ADDRESS`].
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    /// Create a buffer with exclusive sharing mode.
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;

    /// Destroy a buffer.
    /// # Safety
    /// The buffer must not be in use anymore.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Device limits relevant for memory allocation.
    fn limits(&self) -> DeviceLimits;

    /// Attach a debug name to a memory object. Only used for diagnostics.
    fn set_memory_name(&self, _memory: vk::DeviceMemory, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct VulkanDeviceInner {
    #[derivative(Debug = "ignore")]
    handle: ash::Device,
    #[derivative(Debug = "ignore")]
    debug_utils: Option<DebugUtils>,
    #[derivative(Debug = "ignore")]
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    dedicated_allocation: bool,
}

/// [`MemoryDevice`] implementation on top of an [`ash::Device`]. Internal state is wrapped in an `Arc`, so this is cheap
/// to clone.
///
/// The device must be created with Vulkan 1.1 or `VK_KHR_dedicated_allocation` + `VK_KHR_get_memory_requirements2` if
/// `dedicated_allocation` is set, and with the `bufferDeviceAddress` feature if device addresses are requested.
#[derive(Debug, Clone)]
pub struct VulkanDevice {
    inner: Arc<VulkanDeviceInner>,
}

impl VulkanDevice {
    /// Wrap an existing device. Memory properties and properties must come from the physical device this device was created from.
    /// Pass a debug utils loader to attach names to memory objects.
    pub fn new(
        handle: ash::Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        properties: &vk::PhysicalDeviceProperties,
        debug_utils: Option<DebugUtils>,
        dedicated_allocation: bool,
    ) -> Self {
        info!("Current device has the following memory heaps:");
        for (index, heap) in memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .enumerate()
        {
            info!(
                "    MemoryHeap[{index}] size = {:.2} MiB, flags = {:?}",
                heap.size as f64 / (1024.0 * 1024.0),
                heap.flags
            );
        }

        Self {
            inner: Arc::new(VulkanDeviceInner {
                handle,
                debug_utils,
                memory_properties,
                limits: DeviceLimits::from(&properties.limits),
                dedicated_allocation,
            }),
        }
    }

    /// Get unsafe access to the underlying `VkDevice`.
    /// # Safety
    /// Do not destroy the device or free memory owned by an allocator through this handle.
    pub unsafe fn handle(&self) -> ash::Device {
        self.inner.handle.clone()
    }

    fn requirements2(&self, resource: Resource) -> MemoryRequirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 = vk::MemoryRequirements2::builder().push_next(&mut dedicated);
        // SAFETY: Vulkan API call. The resource handle is valid per the trait contract.
        unsafe {
            match resource {
                Resource::Buffer(buffer) => {
                    let info = vk::BufferMemoryRequirementsInfo2::builder().buffer(buffer);
                    self.inner.handle.get_buffer_memory_requirements2(&info, &mut requirements2);
                }
                Resource::Image(image) => {
                    let info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
                    self.inner.handle.get_image_memory_requirements2(&info, &mut requirements2);
                }
            }
        }
        let requirements = requirements2.memory_requirements;
        MemoryRequirements {
            requirements,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }
}

impl MemoryDevice for VulkanDevice {
    fn memory_requirements(&self, resource: Resource) -> MemoryRequirements {
        if self.inner.dedicated_allocation {
            return self.requirements2(resource);
        }

        // SAFETY: Vulkan API call. The resource handle is valid per the trait contract.
        let requirements = unsafe {
            match resource {
                Resource::Buffer(buffer) => self.inner.handle.get_buffer_memory_requirements(buffer),
                Resource::Image(image) => self.inner.handle.get_image_memory_requirements(image),
            }
        };
        MemoryRequirements::from(requirements)
    }

    fn find_memory_type_index(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let properties = &self.inner.memory_properties;
        properties.memory_types[..properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|(index, ty)| (type_bits & (1u32 << *index)) != 0 && ty.property_flags.contains(flags))
            .map(|(index, _)| index as u32)
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        flags: vk::MemoryAllocateFlags,
        dedicated: Option<Resource>,
    ) -> Result<vk::DeviceMemory> {
        let mut flags_info = vk::MemoryAllocateFlagsInfo::builder().flags(flags);
        let mut dedicated_info = match dedicated {
            Some(Resource::Buffer(buffer)) => vk::MemoryDedicatedAllocateInfo::builder().buffer(buffer),
            Some(Resource::Image(image)) => vk::MemoryDedicatedAllocateInfo::builder().image(image),
            None => vk::MemoryDedicatedAllocateInfo::builder(),
        };
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if !flags.is_empty() {
            info = info.push_next(&mut flags_info);
        }
        if dedicated.is_some() && self.inner.dedicated_allocation {
            info = info.push_next(&mut dedicated_info);
        }
        // SAFETY: Vulkan API call. All structures in the pNext chain outlive this call.
        let memory = unsafe { self.inner.handle.allocate_memory(&info, None).map_err(Error::from)? };
        #[cfg(feature = "log-objects")]
        trace!("Allocated new VkDeviceMemory {memory:p} (size = {size} bytes, type = {memory_type_index})");
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        #[cfg(feature = "log-objects")]
        trace!("Freeing VkDeviceMemory {memory:p}");
        self.inner.handle.free_memory(memory, None);
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>> {
        let pointer = self
            .inner
            .handle
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .map_err(Error::from)?;
        Ok(NonNull::new(pointer).ok_or(Error::UnmappableBuffer)?)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.inner.handle.unmap_memory(memory);
    }

    unsafe fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> Result<()> {
        Ok(self.inner.handle.bind_buffer_memory(buffer, memory, offset).map_err(Error::from)?)
    }

    unsafe fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> Result<()> {
        Ok(self.inner.handle.bind_image_memory(image, memory, offset).map_err(Error::from)?)
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        // SAFETY: Vulkan API call. The buffer is bound to memory allocated with the device address flag per the trait contract.
        unsafe { self.inner.handle.get_buffer_device_address(&info) }
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: Vulkan API call with a valid create info.
        let handle = unsafe { self.inner.handle.create_buffer(&info, None).map_err(Error::from)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkBuffer {handle:p} (size = {size} bytes)");
        Ok(handle)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkBuffer {buffer:p}");
        self.inner.handle.destroy_buffer(buffer, None);
    }

    fn limits(&self) -> DeviceLimits {
        self.inner.limits
    }

    fn set_memory_name(&self, memory: vk::DeviceMemory, name: &str) -> Result<()> {
        let Some(debug_utils) = &self.inner.debug_utils else {
            return Ok(());
        };
        let object_name = CString::new(name).map_err(Error::from)?;
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(vk::ObjectType::DEVICE_MEMORY)
            .object_handle(memory.as_raw())
            .object_name(&object_name);
        // SAFETY: Vulkan API call. The memory handle is valid and the name outlives the call.
        unsafe {
            Ok(debug_utils
                .set_debug_utils_object_name(self.inner.handle.handle(), &name_info)
                .map_err(Error::from)?)
        }
    }
}
