//! Composable low-level memory allocators: pools for uniformly-sized
//! nodes, stacks for scoped lifetimes, and collections of pools indexed
//! by size class. Every allocator amortizes a slow upstream source (the
//! process heap or raw OS pages) over large slabs that it subdivides
//! itself, so the common path is a pointer pop or a pointer bump and
//! never a heap call.
//!
//! How the pieces stack up:
//!
//! ```text
//!  NodePool / SmallNodePool     PoolCollection        MemoryStack
//!          |                         |                     |
//!     free list               free list array         top cursor
//!  (pointer-chained or      (log2 size classes)           |
//!   byte-index chunks)             |                      |
//!          +----------------------+----------------------+
//!                                 |
//!                            block list
//!                    (slab stack + free cache,
//!                      geometric growth x2)
//!                                 |
//!                          Heap  /  Pages
//!                       (upstream allocators)
//! ```
//!
//! The storage layer in [`storage`] turns any of these into a shareable
//! handle: owned, lock-guarded reference, zero-sized stateless handle or
//! type-erased reference. Failures report through the process-wide
//! handlers in [`error`] before surfacing as [`AllocationError`].
//!
//! # Example
//!
//! ```rust
//! use palloc::NodePool;
//!
//! let mut pool: NodePool = NodePool::new(48, 4096);
//!
//! let node = pool.allocate().unwrap();
//! unsafe {
//!     node.as_ptr().write_bytes(0, 48);
//!     pool.deallocate(node);
//! }
//! ```

use std::ptr::NonNull;

mod align;
mod block;
mod debug;
mod error;
mod free_list;
mod free_list_array;
mod heap;
mod platform;
mod pool;
mod pool_collection;
mod small_free_list;
mod stack;
mod storage;
mod traits;

/// Non-null pointer to `T`. Used instead of `*mut T` wherever absence is
/// a real state, so the compiler insists on handling the `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use align::{align_offset, align_up, ilog2, is_aligned, is_power_of_two, MAX_ALIGNMENT};
pub use debug::DebugMagic;
pub use error::{
    bad_allocation_size_handler, buffer_overflow_handler, invalid_pointer_handler, leak_handler,
    out_of_memory_handler, set_bad_allocation_size_handler, set_buffer_overflow_handler,
    set_invalid_pointer_handler, set_leak_handler, set_out_of_memory_handler, AllocationError,
    AllocatorInfo, BadAllocationSizeHandler, BufferOverflowHandler, InvalidPointerHandler,
    LeakHandler, OutOfMemoryHandler,
};
pub use free_list::FreeList;
pub use free_list_array::{AccessPolicy, Log2Policy};
pub use heap::{Heap, Pages};
pub use pool::{FreeListVariant, MemoryPool, NodePool, SmallNodePool};
pub use pool_collection::{
    NodePoolCollection, PoolCollection, SmallNodePoolCollection,
};
pub use small_free_list::SmallFreeList;
pub use stack::{Marker, MemoryStack};
pub use storage::{
    AllocatorAdapter, AllocatorRef, AnyAllocatorRef, DefaultLock, DynAllocator, Lock, NoLock,
    Query, StatelessRef,
};
pub use traits::{RawAllocator, StatelessAllocator};
