//! Exposes the phobos-heap error type

use std::ffi::NulError;
use std::sync::PoisonError;

use ash;
use thiserror::Error;

/// Error type that phobos-heap can return.
#[derive(Error, Debug)]
pub enum Error {
    /// Could not convert rust string to C-String because it has null bytes
    #[error("Invalid C string")]
    InvalidString(NulError),
    /// Generic Vulkan error type. Returned when the driver refuses a native allocation or mapping.
    #[error("Vulkan error: `{0}`")]
    VkError(ash::vk::Result),
    /// No memory type matches both the resource's memory type bits and the requested property flags.
    #[error("No memory type found for type bits `{type_bits:#b}` with properties `{flags:?}`")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: ash::vk::MemoryPropertyFlags,
    },
    /// Tried to allocate zero bytes.
    #[error("Tried to allocate zero bytes")]
    ZeroSizedAllocation,
    /// The allocation does not belong to this allocator, or was already freed.
    #[error("Allocation is not owned by this allocator or was already freed")]
    InvalidAllocation,
    /// Tried to unmap memory that is not mapped.
    #[error("Tried to unmap memory that is not mapped")]
    NotMapped,
    /// Poisoned mutex
    #[error("Poisoned mutex")]
    PoisonError,
    /// Typed access to an upload allocation does not fit inside the allocation.
    #[error("Buffer view is not a valid range in the parent buffer.")]
    BufferViewOutOfRange,
    /// Mappable buffer expected
    #[error("Requested mappable buffer, but buffer does not have a memory map")]
    UnmappableBuffer,
    /// The device returned a null device address for a buffer that requested one.
    #[error("Device returned a null device address")]
    NullDeviceAddress,
    /// Uncategorized error.
    #[error("Uncategorized error: `{0}`")]
    Uncategorized(&'static str),
}

impl From<NulError> for Error {
    fn from(value: NulError) -> Self {
        Error::InvalidString(value)
    }
}

impl From<ash::vk::Result> for Error {
    fn from(value: ash::vk::Result) -> Self {
        Error::VkError(value)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}
