//! The raw allocator contract every allocator in this crate implements.
//!
//! The trait only requires the node operations; array operations and the
//! various maxima have defaults that forward to them, so a minimal
//! allocator gets the full interface for free and a richer one (like the
//! pools) overrides whatever it can do better.

use std::ptr::NonNull;

use crate::align;
use crate::error::{AllocationError, AllocatorInfo};

/// A low-level allocator. Works on raw bytes and never constructs or
/// drops anything in the memory it manages.
///
/// Each instance is a single-writer resource: all operations take
/// `&mut self`, and sharing one allocator between actors is the job of
/// the storage layer in [`crate::storage`]. Memory allocated by a
/// stateful allocator must be returned to the same instance.
pub trait RawAllocator {
    /// Whether two instances of this allocator are distinguishable. For
    /// stateless allocators any instance may free any other instance's
    /// allocations.
    const IS_STATEFUL: bool = true;

    /// Whether the allocator brings its own array handling instead of
    /// relying on the default below that treats an array as one big
    /// node. A node pool, for example, hands out runs of cells.
    const IS_ARRAY_AWARE: bool = false;

    /// Whether the allocator can serve as the upstream of another
    /// allocator: nodes come back individually, in any order, and the
    /// memory is reusable immediately. A memory stack is the
    /// counterexample, it only releases on unwind.
    const IS_COMPOSABLE: bool = true;

    /// Identification used in error reports.
    fn info(&self) -> AllocatorInfo {
        AllocatorInfo::new(
            std::any::type_name::<Self>(),
            self as *const Self as *const () as usize,
        )
    }

    /// Allocates `size` bytes aligned to `alignment` (a power of two).
    /// On failure the matching handler has already run.
    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError>;

    /// Returns a node. `ptr`, `size` and `alignment` must match a
    /// previous [`allocate_node`](Self::allocate_node) on this instance
    /// (or, for stateless allocators, on any instance). Never fails.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call and must not be returned
    /// twice.
    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, alignment: usize);

    /// Allocates `count` contiguous units of `size` bytes. The default
    /// treats the array as one node of `count * size` bytes.
    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        let total = count.checked_mul(size).unwrap_or(usize::MAX);
        self.allocate_node(total, alignment)
    }

    /// Returns an array allocated by
    /// [`allocate_array`](Self::allocate_array).
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate_node`](Self::deallocate_node).
    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        self.deallocate_node(ptr, count * size, alignment);
    }

    /// Upper bound on the size of a single node. Requests below this can
    /// still fail; requests above it always fail.
    fn max_node_size(&self) -> usize {
        usize::MAX
    }

    /// Upper bound on the total size of an array.
    fn max_array_size(&self) -> usize {
        self.max_node_size()
    }

    /// Upper bound on the supported alignment.
    fn max_alignment(&self) -> usize {
        align::MAX_ALIGNMENT
    }
}

/// Marker for allocators without instance state. Such an allocator can be
/// materialized anywhere with `Default`, which is what
/// [`crate::storage::StatelessRef`] does instead of storing a pointer.
pub trait StatelessAllocator: RawAllocator + Default + Copy {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal allocator providing only the required operations, to
    /// exercise the trait defaults. Hands out boxed buffers.
    struct Minimal;

    impl RawAllocator for Minimal {
        fn allocate_node(
            &mut self,
            size: usize,
            _alignment: usize,
        ) -> Result<NonNull<u8>, AllocationError> {
            let buffer = vec![0u8; size.max(1)].into_boxed_slice();
            let ptr = Box::into_raw(buffer) as *mut u8;
            // Freshly boxed memory is never null.
            Ok(unsafe { NonNull::new_unchecked(ptr) })
        }

        unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
            let slice = std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), size.max(1));
            drop(Box::from_raw(slice));
        }
    }

    #[test]
    fn array_defaults_forward_to_node() {
        let mut minimal = Minimal;
        let array = minimal.allocate_array(4, 8, 8).unwrap();
        unsafe { minimal.deallocate_array(array, 4, 8, 8) };

        assert_eq!(minimal.max_node_size(), usize::MAX);
        assert_eq!(minimal.max_array_size(), usize::MAX);
        assert_eq!(minimal.max_alignment(), align::MAX_ALIGNMENT);
    }

    #[test]
    fn capability_defaults() {
        // A minimal allocator is assumed stateful, forwards arrays to
        // the node path and works as an upstream.
        assert!(Minimal::IS_STATEFUL);
        assert!(!Minimal::IS_ARRAY_AWARE);
        assert!(Minimal::IS_COMPOSABLE);
    }

    #[test]
    fn default_info_names_the_type() {
        let minimal = Minimal;
        let info = minimal.info();
        assert!(info.name.contains("Minimal"));
        assert_eq!(info.address, &minimal as *const _ as usize);
    }
}
