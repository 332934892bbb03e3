//! Exposes the structures needed to configure the memory manager and the upload allocator.

use ash::vk;

/// Default size of each pooled memory heap: 128 MiB.
pub const DEFAULT_HEAP_SIZE: vk::DeviceSize = 128 * 1024 * 1024;
/// Default size of each shared upload buffer: 8 MiB.
pub const DEFAULT_MAX_SHARED_UPLOAD_SIZE: vk::DeviceSize = 8 * 1024 * 1024;
/// Default alignment of upload allocations when the caller does not specify one.
pub const DEFAULT_UPLOAD_ALIGNMENT: vk::DeviceSize = 256;

/// Settings for a [`MemoryManager`](crate::MemoryManager) and [`UploadAllocator`](crate::UploadAllocator).
/// Use [`AllocatorSettingsBuilder`] to construct one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocatorSettings {
    /// Size in bytes of every pooled memory heap. Resources larger than this always get a dedicated allocation.
    pub heap_size: vk::DeviceSize,
    /// Size in bytes of every shared upload buffer. Upload requests of at least this size get a private buffer.
    pub max_shared_upload_size: vk::DeviceSize,
    /// Alignment used by [`UploadAllocator::upload`](crate::UploadAllocator::upload).
    pub upload_alignment: vk::DeviceSize,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            max_shared_upload_size: DEFAULT_MAX_SHARED_UPLOAD_SIZE,
            upload_alignment: DEFAULT_UPLOAD_ALIGNMENT,
        }
    }
}

/// The settings builder is a convenience struct to easily create [`AllocatorSettings`].
///
/// For information about each of the fields, see [`AllocatorSettings`]
/// # Example
/// ```
/// # use phobos_heap::*;
/// let settings = AllocatorSettingsBuilder::new()
///     .heap_size(64 * 1024 * 1024u64)
///     .max_shared_upload_size(4 * 1024 * 1024u64)
///     .build();
/// assert_eq!(settings.heap_size, 64 * 1024 * 1024);
/// ```
#[derive(Debug, Default)]
pub struct AllocatorSettingsBuilder {
    inner: AllocatorSettings,
}

impl AllocatorSettingsBuilder {
    /// Create a new settings builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of each pooled memory heap.
    pub fn heap_size(mut self, size: impl Into<vk::DeviceSize>) -> Self {
        self.inner.heap_size = size.into();
        self
    }

    /// Size of each shared upload buffer.
    pub fn max_shared_upload_size(mut self, size: impl Into<vk::DeviceSize>) -> Self {
        self.inner.max_shared_upload_size = size.into();
        self
    }

    /// Default alignment for byte uploads.
    pub fn upload_alignment(mut self, alignment: impl Into<vk::DeviceSize>) -> Self {
        self.inner.upload_alignment = alignment.into();
        self
    }

    /// Build the resulting settings.
    pub fn build(self) -> AllocatorSettings {
        self.inner
    }
}
