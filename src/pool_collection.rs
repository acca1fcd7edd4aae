//! Many pools behind one interface. A pool collection dispatches each
//! request to a free list for its size class, all buckets drawing slabs
//! from one shared block list:
//!
//! ```text
//!                 +-----------+
//! size 1..=2  --> | bucket 1  | --+
//!                 +-----------+   |
//! size 3..=4  --> | bucket 2  | --+--> shared block list --> upstream
//!                 +-----------+   |
//! size 5..=8  --> | bucket 3  | --+
//!                 +-----------+
//!                    ......
//! ```
//!
//! Unlike a single pool there is no fixed node size, but deallocation
//! must repeat the size passed to allocation, that is how the bucket is
//! found again.

use std::ptr::NonNull;

use crate::block::{BlockList, IMPL_OFFSET};
use crate::debug::{self, DebugMagic};
use crate::error::{self, AllocationError, AllocatorInfo};
use crate::free_list::FreeList;
use crate::free_list_array::FreeListArray;
use crate::heap::Heap;
use crate::pool::FreeListVariant;
use crate::small_free_list::SmallFreeList;
use crate::traits::RawAllocator;

/// Collection over the pointer-chained free list.
pub type NodePoolCollection<A = Heap> = PoolCollection<FreeList, A>;

/// Collection over the chunked small free list, for node sizes down to
/// one byte. The largest power-of-two bucket must stay within the small
/// list's one-byte index encoding, capping `max_node_size` at 128.
pub type SmallNodePoolCollection<A = Heap> = PoolCollection<SmallFreeList, A>;

/// Pool allocator serving many node sizes, one power-of-two bucket per
/// size class.
pub struct PoolCollection<L: FreeListVariant = FreeList, A: RawAllocator = Heap> {
    free_lists: FreeListArray<L>,
    block_list: BlockList<A>,
}

// Owns its slabs exclusively, like a single pool; see
// [`crate::pool::MemoryPool`].
unsafe impl<L: FreeListVariant, A: RawAllocator + Send> Send for PoolCollection<L, A> {}

impl<L: FreeListVariant, A: RawAllocator + Default> PoolCollection<L, A> {
    /// Collection serving sizes `1..=max_node_size`, fetching slabs of
    /// `block_size` bytes from a default-built upstream.
    ///
    /// # Panics
    ///
    /// If `max_node_size` exceeds the flavor's limit or `block_size`
    /// cannot fit a cell of the largest bucket.
    pub fn new(max_node_size: usize, block_size: usize) -> Self {
        Self::with_allocator(max_node_size, block_size, A::default())
    }
}

impl<L: FreeListVariant, A: RawAllocator> PoolCollection<L, A> {
    /// Same as [`new`](Self::new) with an explicit upstream allocator.
    pub fn with_allocator(max_node_size: usize, block_size: usize, allocator: A) -> Self {
        // The log2 policy rounds the top bucket up to a power of two, and
        // that rounded size is what the flavor must support (the small
        // list tops out at 128 for this reason).
        assert!(
            max_node_size >= 1 && 1 << crate::align::ilog2(max_node_size) <= L::MAX_NODE_SIZE,
            "maximum node size not supported by this pool flavor"
        );
        let free_lists = FreeListArray::new(max_node_size);
        // The largest bucket must be able to carve a cell from the first
        // slab; later slabs only grow.
        assert!(
            block_size >= IMPL_OFFSET + L::min_insert_size(free_lists.max_node_size()),
            "block size cannot fit a node of the largest bucket"
        );
        Self {
            free_lists,
            block_list: BlockList::new(block_size, allocator),
        }
    }

    fn collection_info(&self) -> AllocatorInfo {
        AllocatorInfo::new("palloc::PoolCollection", self as *const Self as usize)
    }

    /// Largest supported node size.
    pub fn max_node_size(&self) -> usize {
        self.free_lists.max_node_size()
    }

    /// Free cells across all buckets.
    pub fn capacity(&self) -> usize {
        self.free_lists.total_capacity()
    }

    /// Hands out a node of at least `size` bytes from the matching
    /// bucket. On a dry bucket a fresh slab goes into that bucket only.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocationError> {
        let info = self.collection_info();
        error::check_allocation_size(size, self.free_lists.max_node_size(), info)?;
        let size = size.max(1);

        // The bound was just checked, the bucket exists.
        let dry = self
            .free_lists
            .get_mut(size)
            .is_some_and(|list| list.is_empty());
        if dry {
            let block = self.block_list.allocate()?;
            let list = self.free_lists.get_mut(size).unwrap();
            unsafe { list.insert(block.memory, block.size) };
        }

        let list = self.free_lists.get_mut(size).unwrap();
        // A fresh slab always carves at least one cell of any bucket,
        // see the constructor.
        let cell = unsafe { list.allocate().unwrap_unchecked() };
        let node_size = list.node_size();
        unsafe { debug::debug_fill(cell, node_size, DebugMagic::NewMemory) };
        Ok(cell)
    }

    /// Returns a node allocated with the same `size`. Passing a different
    /// size routes the cell into the wrong bucket; that contract is the
    /// caller's and release builds do not verify it.
    ///
    /// # Safety
    ///
    /// `node` must come from [`allocate`](Self::allocate) on this
    /// collection with the same `size`, and not be returned twice.
    pub unsafe fn deallocate(&mut self, node: NonNull<u8>, size: usize) {
        let Some(list) = self.free_lists.get_mut(size.max(1)) else {
            let info = self.collection_info();
            error::invalid_pointer_handler()(&info, node.as_ptr());
            return;
        };
        debug_assert!(
            size <= list.node_size(),
            "deallocation size does not match its bucket"
        );
        debug::debug_fill(node, list.node_size(), DebugMagic::FreedMemory);
        list.deallocate(node);
    }

    /// Makes sure the bucket for `node_size` holds at least `capacity`
    /// free cells, pulling slabs from the block list as needed.
    pub fn reserve(&mut self, node_size: usize, capacity: usize) -> Result<(), AllocationError> {
        let info = self.collection_info();
        error::check_allocation_size(node_size, self.free_lists.max_node_size(), info)?;

        loop {
            let Some(list) = self.free_lists.get_mut(node_size.max(1)) else {
                return Ok(());
            };
            if list.capacity() >= capacity {
                return Ok(());
            }
            let block = self.block_list.allocate()?;
            let list = self.free_lists.get_mut(node_size.max(1)).unwrap();
            unsafe { list.insert(block.memory, block.size) };
        }
    }
}

impl<L: FreeListVariant, A: RawAllocator> RawAllocator for PoolCollection<L, A> {
    // Arrays ride on the buckets: any total up to the largest node size
    // is served whole.
    const IS_ARRAY_AWARE: bool = true;

    fn info(&self) -> AllocatorInfo {
        self.collection_info()
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        let info = self.collection_info();
        error::check_allocation_size(size, self.max_node_size(), info)?;
        if let Some(list) = self.free_lists.get_mut(size.max(1)) {
            error::check_allocation_size(alignment, list.alignment(), info)?;
        }
        self.allocate(size)
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        self.deallocate(ptr, size);
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        // Buckets round up to a power of two anyway, so an array is just
        // a node of the total size.
        let total = count.checked_mul(size).unwrap_or(usize::MAX);
        self.allocate_node(total, alignment)
    }

    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        alignment: usize,
    ) {
        self.deallocate_node(ptr, count * size, alignment);
    }

    fn max_node_size(&self) -> usize {
        self.free_lists.max_node_size()
    }

    fn max_alignment(&self) -> usize {
        crate::align::alignment_for(self.free_lists.max_node_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_by_size_class() {
        let mut collection: NodePoolCollection = NodePoolCollection::new(32, 1024);
        assert_eq!(collection.max_node_size(), 32);

        // 5 and 8 share the 8-byte bucket; 9 goes to the 16-byte bucket.
        let a = collection.allocate(5).unwrap();
        let b = collection.allocate(8).unwrap();
        let c = collection.allocate(9).unwrap();

        // Nodes from the same bucket are node_size apart when they come
        // from the same fresh slab carve.
        let distance = (b.as_ptr() as usize).abs_diff(a.as_ptr() as usize);
        assert_eq!(distance, 8);

        unsafe {
            collection.deallocate(a, 5);
            collection.deallocate(b, 8);
            collection.deallocate(c, 9);
        }

        // Deallocating with the original sizes restored both buckets:
        // the 8-byte bucket hands the same cells out again.
        let again = collection.allocate(7).unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn buckets_grow_independently() {
        let mut collection: NodePoolCollection = NodePoolCollection::new(64, 512);

        // Draining one bucket pulls a slab for it alone; the others stay
        // empty until asked.
        let node = collection.allocate(64).unwrap();
        assert!(collection.capacity() > 0);
        let after_first = collection.block_list.size();
        assert_eq!(after_first, 1);

        let _ = collection.allocate(8).unwrap();
        assert_eq!(collection.block_list.size(), 2);

        unsafe { collection.deallocate(node, 64) };
    }

    #[test]
    fn reserve_tops_up_one_bucket() {
        let mut collection: NodePoolCollection = NodePoolCollection::new(32, 1024);
        collection.reserve(16, 50).unwrap();
        assert!(collection.capacity() >= 50);

        // The reserved bucket serves 50 allocations without another
        // upstream call.
        let blocks = collection.block_list.size();
        let mut nodes = Vec::new();
        for _ in 0..50 {
            nodes.push(collection.allocate(16).unwrap());
        }
        assert_eq!(collection.block_list.size(), blocks);

        for node in nodes {
            unsafe { collection.deallocate(node, 16) };
        }
    }

    #[test]
    fn oversized_requests_fail() {
        let mut collection: NodePoolCollection = NodePoolCollection::new(32, 1024);
        assert!(matches!(
            collection.allocate(33),
            Err(AllocationError::BadAllocationSize { .. })
        ));
        assert!(collection.reserve(64, 1).is_err());
    }

    #[test]
    fn small_collection_serves_tiny_nodes() {
        let mut collection: SmallNodePoolCollection = SmallNodePoolCollection::new(16, 512);

        let mut nodes = Vec::new();
        for size in [1usize, 2, 3, 4, 7, 8, 15, 16] {
            let node = collection.allocate(size).unwrap();
            assert!(!nodes.contains(&node));
            nodes.push(node);
        }
        for (node, size) in nodes.into_iter().zip([1usize, 2, 3, 4, 7, 8, 15, 16]) {
            unsafe { collection.deallocate(node, size) };
        }
    }

    #[test]
    fn arrays_ride_on_buckets() {
        let mut collection: NodePoolCollection = NodePoolCollection::new(64, 1024);
        // 4 * 8 = 32 bytes lands in the 32-byte bucket.
        let array = collection.allocate_array(4, 8, 8).unwrap();
        unsafe { array.as_ptr().write_bytes(0x42, 32) };
        unsafe { collection.deallocate_array(array, 4, 8, 8) };
    }
}
