//! The core module holds the error type, the allocator settings and the device boundary.

pub mod device;
pub mod error;
pub mod settings;
