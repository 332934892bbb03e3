//! The allocator module exposes the pooled device memory allocator and the upload allocator.
//! <br>
//! <br>
//! # Allocator traits
//! These are defined in [`traits`], and can be implemented to supply a custom allocator type to generic code.
//! # Memory manager
//! The [`MemoryManager`](manager::MemoryManager) sub-allocates large memory heaps ([`heap`]) for buffers and images, and falls back to
//! dedicated memory objects for large resources. Block bookkeeping for a single heap lives in [`block`].
//! # Upload allocator
//! A linear allocator for short lived staging memory. For more information check the [`upload`] module documentation.

pub mod traits;
pub mod allocation;
pub mod block;
pub mod heap;
pub mod manager;
pub mod memory_type;
pub mod upload;
