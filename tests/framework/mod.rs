#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use ash::vk;
use ash::vk::Handle;

use phobos_heap::{
    AllocatorSettings, AllocatorSettingsBuilder, DeviceLimits, Error, MemoryDevice, MemoryManager, MemoryRequirements, Resource,
};

/// Heap size used by the test managers. Small enough to make heap exhaustion cheap.
pub const HEAP_SIZE: vk::DeviceSize = 64 * 1024;
/// Size of each shared upload buffer in the test managers.
pub const UPLOAD_SIZE: vk::DeviceSize = 4 * 1024;

/// Index of the device local memory type of the mock device.
pub const DEVICE_LOCAL_TYPE: u32 = 0;
/// Index of the host visible memory type of the mock device.
pub const HOST_VISIBLE_TYPE: u32 = 1;

#[derive(Debug)]
struct MockMemory {
    // Word sized storage so mapped pointers are aligned like real mappings.
    words: Box<[u64]>,
    memory_type_index: u32,
    flags: vk::MemoryAllocateFlags,
    dedicated: Option<Resource>,
    mapped: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    memory: HashMap<u64, MockMemory>,
    buffers: HashMap<u64, vk::DeviceSize>,
    images: HashMap<u64, vk::DeviceSize>,
    bindings: HashMap<u64, (u64, vk::DeviceSize)>,
    fail_allocations: bool,
    prefers_dedicated: bool,
    requires_dedicated: bool,
    allocation_calls: u32,
    map_calls: u32,
    unmap_calls: u32,
}

/// A [`MemoryDevice`] backed by host memory. Memory objects are plain host allocations, so mapping returns real pointers.
///
/// Memory type 0 is device local, memory type 1 is host visible and coherent.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    limits: DeviceLimits,
    alignment: vk::DeviceSize,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_handle: 1,
                ..Default::default()
            })),
            limits,
            alignment: 16,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock device lock is not poisoned")
    }

    fn next_handle(state: &mut MockState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    /// Make every following native allocation fail with `VK_ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_allocations(&self, fail: bool) {
        self.state().fail_allocations = fail;
    }

    /// Set the dedicated allocation hints reported for every resource.
    pub fn set_dedicated_hints(&self, prefers: bool, requires: bool) {
        let mut state = self.state();
        state.prefers_dedicated = prefers;
        state.requires_dedicated = requires;
    }

    /// Register an image with the given memory size.
    pub fn create_image(&self, size: vk::DeviceSize) -> vk::Image {
        let mut state = self.state();
        let handle = Self::next_handle(&mut state);
        state.images.insert(handle, size);
        vk::Image::from_raw(handle)
    }

    /// Number of live native memory objects.
    pub fn live_memory_count(&self) -> usize {
        self.state().memory.len()
    }

    /// Number of live memory objects allocated for a specific resource.
    pub fn live_dedicated_count(&self) -> usize {
        self.state()
            .memory
            .values()
            .filter(|memory| memory.dedicated.is_some())
            .count()
    }

    /// Number of live buffers.
    pub fn live_buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    /// Number of calls to `allocate_memory`, failed ones included.
    pub fn allocation_calls(&self) -> u32 {
        self.state().allocation_calls
    }

    /// Number of native map calls.
    pub fn map_calls(&self) -> u32 {
        self.state().map_calls
    }

    /// Number of native unmap calls.
    pub fn unmap_calls(&self) -> u32 {
        self.state().unmap_calls
    }

    /// Number of memory objects that are currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.state().memory.values().filter(|memory| memory.mapped).count()
    }

    /// Memory type and allocate flags of a live memory object.
    pub fn memory_info(&self, memory: vk::DeviceMemory) -> Option<(u32, vk::MemoryAllocateFlags)> {
        self.state()
            .memory
            .get(&memory.as_raw())
            .map(|memory| (memory.memory_type_index, memory.flags))
    }

    /// Memory object and offset a buffer was bound to.
    pub fn buffer_binding(&self, buffer: vk::Buffer) -> Option<(vk::DeviceMemory, vk::DeviceSize)> {
        self.state()
            .bindings
            .get(&buffer.as_raw())
            .map(|(memory, offset)| (vk::DeviceMemory::from_raw(*memory), *offset))
    }

    fn resource_size(state: &MockState, resource: Resource) -> vk::DeviceSize {
        match resource {
            Resource::Buffer(buffer) => state.buffers.get(&buffer.as_raw()).copied(),
            Resource::Image(image) => state.images.get(&image.as_raw()).copied(),
        }
        .expect("resource was created by the mock device")
    }
}

impl MemoryDevice for MockDevice {
    fn memory_requirements(&self, resource: Resource) -> MemoryRequirements {
        let state = self.state();
        MemoryRequirements {
            requirements: vk::MemoryRequirements {
                size: Self::resource_size(&state, resource),
                alignment: self.alignment,
                memory_type_bits: 0b11,
            },
            prefers_dedicated: state.prefers_dedicated,
            requires_dedicated: state.requires_dedicated,
        }
    }

    fn find_memory_type_index(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let types = [
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ];
        types
            .iter()
            .enumerate()
            .find(|(index, properties)| (type_bits & (1u32 << *index)) != 0 && properties.contains(flags))
            .map(|(index, _)| index as u32)
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        flags: vk::MemoryAllocateFlags,
        dedicated: Option<Resource>,
    ) -> Result<vk::DeviceMemory> {
        let mut state = self.state();
        state.allocation_calls += 1;
        if state.fail_allocations {
            return Err(Error::VkError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into());
        }
        let handle = Self::next_handle(&mut state);
        state.memory.insert(
            handle,
            MockMemory {
                words: vec![0u64; (size as usize + 7) / 8].into_boxed_slice(),
                memory_type_index,
                flags,
                dedicated,
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        let memory = state
            .memory
            .remove(&memory.as_raw())
            .expect("freed memory was allocated by the mock device");
        assert!(!memory.mapped, "memory freed while still mapped");
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<c_void>> {
        let mut state = self.state();
        state.map_calls += 1;
        let memory = state
            .memory
            .get_mut(&memory.as_raw())
            .expect("mapped memory was allocated by the mock device");
        if memory.memory_type_index != HOST_VISIBLE_TYPE {
            return Err(Error::VkError(vk::Result::ERROR_MEMORY_MAP_FAILED).into());
        }
        assert!(!memory.mapped, "memory mapped twice");
        memory.mapped = true;
        Ok(NonNull::new(memory.words.as_mut_ptr().cast::<c_void>()).expect("boxed slice pointer is not null"))
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state();
        state.unmap_calls += 1;
        let memory = state
            .memory
            .get_mut(&memory.as_raw())
            .expect("unmapped memory was allocated by the mock device");
        assert!(memory.mapped, "memory unmapped while not mapped");
        memory.mapped = false;
    }

    unsafe fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> Result<()> {
        let mut state = self.state();
        assert!(state.buffers.contains_key(&buffer.as_raw()), "bound buffer was created by the mock device");
        let bytes = state
            .memory
            .get(&memory.as_raw())
            .expect("bound memory was allocated by the mock device")
            .words
            .len() as vk::DeviceSize
            * 8;
        assert!(offset < bytes, "binding offset lies outside the memory object");
        state.bindings.insert(buffer.as_raw(), (memory.as_raw(), offset));
        Ok(())
    }

    unsafe fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> Result<()> {
        let state = self.state();
        assert!(state.images.contains_key(&image.as_raw()), "bound image was created by the mock device");
        assert!(state.memory.contains_key(&memory.as_raw()), "bound memory was allocated by the mock device");
        let _ = offset;
        Ok(())
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let state = self.state();
        match state.bindings.get(&buffer.as_raw()) {
            Some((memory, offset)) => (memory << 32) + offset,
            None => 0,
        }
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let mut state = self.state();
        let handle = Self::next_handle(&mut state);
        state.buffers.insert(handle, size);
        Ok(vk::Buffer::from_raw(handle))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        state
            .buffers
            .remove(&buffer.as_raw())
            .expect("destroyed buffer was created by the mock device");
        state.bindings.remove(&buffer.as_raw());
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }
}

/// Settings for the test managers: small heaps and small upload buffers.
pub fn test_settings() -> AllocatorSettings {
    AllocatorSettingsBuilder::new()
        .heap_size(HEAP_SIZE)
        .max_shared_upload_size(UPLOAD_SIZE)
        .upload_alignment(16u64)
        .build()
}

/// Creates a memory manager on top of a fresh mock device
pub fn make_manager() -> (MemoryManager<MockDevice>, MockDevice) {
    make_manager_with(MockDevice::new(), test_settings())
}

/// Creates a memory manager with custom settings
pub fn make_manager_with(device: MockDevice, settings: AllocatorSettings) -> (MemoryManager<MockDevice>, MockDevice) {
    let _ = pretty_env_logger::try_init();
    (MemoryManager::new(device.clone(), settings), device)
}

/// Requirements for a resource that may live in any memory type of the mock device.
pub fn requirements(size: vk::DeviceSize, alignment: vk::DeviceSize) -> MemoryRequirements {
    MemoryRequirements::from(vk::MemoryRequirements {
        size,
        alignment,
        memory_type_bits: 0b11,
    })
}
