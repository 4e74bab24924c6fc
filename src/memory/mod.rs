//! Byte-addressable storage: the six memory kinds, their allocators, and the
//! resource-handle façade external callers (§6) use to drive them.

pub mod allocator;
pub mod buffer;
pub mod resource;

pub use allocator::{Allocator, BumpAllocator, PoolAllocator, TrackingAllocator};
pub use buffer::{Buffer, BufferBank};
pub use resource::{ResourceHandle, ResourceManager, SystemStats};
