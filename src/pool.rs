//! The pool allocator: one node size, O(1) allocate and deallocate. A
//! free list hands out ready cells; when it runs dry the pool carves a
//! new slab from its block list and tries again. Slabs only go back
//! upstream at drop.
//!
//! ```text
//!                   allocate()
//!                       |
//!                 +-----v------+   empty   +------------+   miss   +----------+
//!                 | free list  | --------> | block list | -------> | upstream |
//!                 +-----^------+   carve   +------------+   slab   +----------+
//!                       |
//!                  deallocate()
//! ```

use std::ptr::NonNull;

use crate::block::{BlockList, IMPL_OFFSET};
use crate::debug::{self, DebugMagic};
use crate::error::{self, AllocationError, AllocatorInfo};
use crate::free_list::FreeList;
use crate::heap::Heap;
use crate::small_free_list::SmallFreeList;
use crate::traits::RawAllocator;

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::free_list::FreeList {}
    impl Sealed for crate::small_free_list::SmallFreeList {}
}

/// Common surface of the two free-list flavors, so pools and pool
/// collections can be generic over them. Sealed; the two implementations
/// in this crate are the whole story.
pub trait FreeListVariant: sealed::Sealed {
    /// Largest node size the encoding supports.
    const MAX_NODE_SIZE: usize;

    fn with_node_size(node_size: usize) -> Self;

    /// Effective node size after the variant's rounding.
    fn node_size(&self) -> usize;

    /// Number of free cells.
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool;

    /// Alignment every returned cell satisfies.
    fn alignment(&self) -> usize;

    /// Smallest buffer `insert` can carve at least one cell from.
    fn min_insert_size(node_size: usize) -> usize;

    /// Carves `size` bytes at `memory` into cells.
    ///
    /// # Safety
    ///
    /// `memory` must be valid for writes of `size` bytes, aligned to
    /// [`crate::align::MAX_ALIGNMENT`], and outlive the list.
    unsafe fn insert(&mut self, memory: NonNull<u8>, size: usize);

    fn allocate(&mut self) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `cell` must come from an allocation on this list and not already
    /// be free.
    unsafe fn deallocate(&mut self, cell: NonNull<u8>);

    /// `count` cells adjacent in memory, for array allocation. The
    /// default says "unsupported".
    fn allocate_contiguous(&mut self, count: usize) -> Option<NonNull<u8>> {
        let _ = count;
        None
    }

    /// Whether [`allocate_contiguous`](Self::allocate_contiguous) can
    /// ever succeed.
    const SUPPORTS_ARRAYS: bool = false;
}

impl FreeListVariant for FreeList {
    const MAX_NODE_SIZE: usize = usize::MAX;
    const SUPPORTS_ARRAYS: bool = true;

    fn with_node_size(node_size: usize) -> Self {
        Self::new(node_size)
    }

    fn node_size(&self) -> usize {
        self.node_size()
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn alignment(&self) -> usize {
        self.alignment()
    }

    fn min_insert_size(node_size: usize) -> usize {
        // The list rounds the node size up itself; one cell is enough.
        FreeList::new(node_size).node_size()
    }

    unsafe fn insert(&mut self, memory: NonNull<u8>, size: usize) {
        self.insert(memory, size)
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        self.allocate()
    }

    unsafe fn deallocate(&mut self, cell: NonNull<u8>) {
        self.deallocate(cell)
    }

    fn allocate_contiguous(&mut self, count: usize) -> Option<NonNull<u8>> {
        self.allocate_contiguous(count)
    }
}

impl FreeListVariant for SmallFreeList {
    const MAX_NODE_SIZE: usize = 255;

    fn with_node_size(node_size: usize) -> Self {
        Self::new(node_size)
    }

    fn node_size(&self) -> usize {
        self.node_size()
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn alignment(&self) -> usize {
        self.alignment()
    }

    fn min_insert_size(node_size: usize) -> usize {
        SmallFreeList::min_insert_size(node_size)
    }

    unsafe fn insert(&mut self, memory: NonNull<u8>, size: usize) {
        self.insert(memory, size)
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        self.allocate()
    }

    unsafe fn deallocate(&mut self, cell: NonNull<u8>) {
        self.deallocate(cell)
    }
}

/// Pool over the pointer-chained free list: node sizes from pointer size
/// up, array allocation supported.
pub type NodePool<A = Heap> = MemoryPool<FreeList, A>;

/// Pool over the chunked small free list: node sizes down to one byte,
/// one byte of free-cell overhead, no arrays.
pub type SmallNodePool<A = Heap> = MemoryPool<SmallFreeList, A>;

/// A memory pool for nodes of one fixed size. `L` selects the free-list
/// flavor, `A` the upstream allocator feeding the slabs.
pub struct MemoryPool<L: FreeListVariant = FreeList, A: RawAllocator = Heap> {
    free_list: L,
    block_list: BlockList<A>,
}

// The raw pointers inside only ever point into slabs the pool owns
// exclusively, so the pool moves between threads as a unit. Cells the
// user has shared across threads are the user's problem, as with any raw
// allocator.
unsafe impl<L: FreeListVariant, A: RawAllocator + Send> Send for MemoryPool<L, A> {}

impl<L: FreeListVariant, A: RawAllocator + Default> MemoryPool<L, A> {
    /// Pool for nodes of `node_size` bytes, fetching slabs of
    /// `block_size` bytes (doubling from there) from a default-built
    /// upstream.
    ///
    /// # Panics
    ///
    /// If `node_size` is outside the variant's range or `block_size`
    /// cannot fit a single cell.
    pub fn new(node_size: usize, block_size: usize) -> Self {
        Self::with_allocator(node_size, block_size, A::default())
    }
}

impl<L: FreeListVariant, A: RawAllocator> MemoryPool<L, A> {
    /// Same as [`new`](Self::new) with an explicit upstream allocator.
    pub fn with_allocator(node_size: usize, block_size: usize, allocator: A) -> Self {
        assert!(
            node_size >= 1 && node_size <= L::MAX_NODE_SIZE,
            "node size not supported by this pool flavor"
        );
        assert!(
            block_size >= IMPL_OFFSET + L::min_insert_size(node_size),
            "block size cannot fit a single node"
        );
        Self {
            free_list: L::with_node_size(node_size),
            block_list: BlockList::new(block_size, allocator),
        }
    }

    fn pool_info(&self) -> AllocatorInfo {
        AllocatorInfo::new("palloc::MemoryPool", self as *const Self as usize)
    }

    /// Effective node size; requests through [`RawAllocator`] may not
    /// exceed it.
    pub fn node_size(&self) -> usize {
        self.free_list.node_size()
    }

    /// Free cells currently ready, across all slabs.
    pub fn capacity(&self) -> usize {
        self.free_list.capacity()
    }

    /// Upper bound on the cells the next fresh slab will add; the small
    /// flavor loses a few bytes to chunk headers.
    pub fn next_capacity(&self) -> usize {
        self.block_list.next_block_size() / self.node_size()
    }

    /// Hands out one node of [`node_size`](Self::node_size) bytes.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, AllocationError> {
        let cell = match self.free_list.allocate() {
            Some(cell) => cell,
            None => {
                self.grow()?;
                // A fresh slab always carves at least one cell, the
                // constructor guarantees the first block fits one and
                // blocks only grow.
                unsafe { self.free_list.allocate().unwrap_unchecked() }
            }
        };
        unsafe { debug::debug_fill(cell, self.node_size(), DebugMagic::NewMemory) };
        Ok(cell)
    }

    /// Returns a node to the pool.
    ///
    /// # Safety
    ///
    /// `node` must come from [`allocate`](Self::allocate) (or the array
    /// operations) on this pool and not be returned twice.
    pub unsafe fn deallocate(&mut self, node: NonNull<u8>) {
        debug::debug_fill(node, self.node_size(), DebugMagic::FreedMemory);
        self.free_list.deallocate(node);
    }

    fn grow(&mut self) -> Result<(), AllocationError> {
        let block = self.block_list.allocate()?;
        unsafe { self.free_list.insert(block.memory, block.size) };
        Ok(())
    }
}

impl<A: RawAllocator> MemoryPool<FreeList, A> {
    /// Allocates `count` nodes adjacent in memory. Satisfied from a
    /// contiguous run in the free list; if none exists a fresh slab
    /// provides one. Fails with a bad-size error when `count` nodes
    /// cannot fit in the next slab.
    pub fn allocate_array(&mut self, count: usize) -> Result<NonNull<u8>, AllocationError> {
        if let Some(run) = self.free_list.allocate_contiguous(count) {
            unsafe { debug::debug_fill(run, count * self.node_size(), DebugMagic::NewMemory) };
            return Ok(run);
        }

        let total = count.checked_mul(self.node_size()).unwrap_or(usize::MAX);
        error::check_allocation_size(total, self.block_list.next_block_size(), self.pool_info())?;

        self.grow()?;
        // The slab just inserted is one ascending run at the head of the
        // list, large enough by the check above.
        let run = unsafe { self.free_list.allocate_contiguous(count).unwrap_unchecked() };
        unsafe { debug::debug_fill(run, count * self.node_size(), DebugMagic::NewMemory) };
        Ok(run)
    }

    /// Returns an array of `count` nodes.
    ///
    /// # Safety
    ///
    /// `array` must come from [`allocate_array`](Self::allocate_array)
    /// with the same `count` and not be returned twice.
    pub unsafe fn deallocate_array(&mut self, array: NonNull<u8>, count: usize) {
        let total = count * self.node_size();
        debug::debug_fill(array, total, DebugMagic::FreedMemory);
        self.free_list.insert(array, total);
    }
}

impl<L: FreeListVariant, A: RawAllocator> RawAllocator for MemoryPool<L, A> {
    // Runs of cells only exist on the pointer-chained flavor.
    const IS_ARRAY_AWARE: bool = L::SUPPORTS_ARRAYS;

    fn info(&self) -> AllocatorInfo {
        self.pool_info()
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        error::check_allocation_size(size, self.node_size(), self.pool_info())?;
        error::check_allocation_size(alignment, self.max_alignment(), self.pool_info())?;
        self.allocate()
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        debug_assert!(size <= self.node_size());
        self.deallocate(ptr);
    }

    fn allocate_array(
        &mut self,
        count: usize,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        let info = self.pool_info();
        error::check_allocation_size(alignment, self.max_alignment(), info)?;
        let total = count.checked_mul(size).unwrap_or(usize::MAX);

        // An array that fits in one node is just a node; beyond that the
        // flavor must support contiguous runs.
        if total <= self.node_size() {
            return self.allocate();
        }
        if !L::SUPPORTS_ARRAYS {
            error::bad_allocation_size_handler()(&info, total, self.node_size());
            return Err(AllocationError::BadAllocationSize {
                info,
                passed: total,
                supported: self.node_size(),
            });
        }

        let cells = total.div_ceil(self.node_size());
        if let Some(run) = self.free_list.allocate_contiguous(cells) {
            unsafe { debug::debug_fill(run, total, DebugMagic::NewMemory) };
            return Ok(run);
        }
        error::check_allocation_size(
            cells * self.node_size(),
            self.block_list.next_block_size(),
            info,
        )?;
        let block = self.block_list.allocate()?;
        unsafe { self.free_list.insert(block.memory, block.size) };
        let run = unsafe { self.free_list.allocate_contiguous(cells).unwrap_unchecked() };
        unsafe { debug::debug_fill(run, total, DebugMagic::NewMemory) };
        Ok(run)
    }

    unsafe fn deallocate_array(
        &mut self,
        ptr: NonNull<u8>,
        count: usize,
        size: usize,
        _alignment: usize,
    ) {
        let total = count * size;
        if total <= self.node_size() {
            self.deallocate(ptr);
            return;
        }
        let cells = total.div_ceil(self.node_size());
        debug::debug_fill(ptr, cells * self.node_size(), DebugMagic::FreedMemory);
        self.free_list.insert(ptr, cells * self.node_size());
    }

    fn max_node_size(&self) -> usize {
        self.node_size()
    }

    fn max_array_size(&self) -> usize {
        if L::SUPPORTS_ARRAYS {
            self.block_list.next_block_size()
        } else {
            self.node_size()
        }
    }

    fn max_alignment(&self) -> usize {
        self.free_list.alignment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_round_trip() {
        let mut pool: NodePool = NodePool::new(16, 2048);
        assert_eq!(pool.node_size(), 16);
        assert_eq!(pool.max_node_size(), 16);

        // The first slab holds over 100 nodes of 16 bytes, so a single
        // upstream allocation serves all of them.
        let mut nodes = Vec::new();
        for i in 0..100u8 {
            let node = pool.allocate().unwrap();
            unsafe { node.as_ptr().write_bytes(i, 16) };
            nodes.push(node);
        }
        assert_eq!(pool.block_list.size(), 1);

        // Contents survive the other 99 allocations.
        for (i, node) in nodes.iter().enumerate() {
            unsafe { assert_eq!(*node.as_ptr(), i as u8) };
        }

        for node in nodes.into_iter().rev() {
            unsafe { pool.deallocate(node) };
        }
        assert!(pool.capacity() >= 100);
    }

    #[test]
    fn pool_reuses_freed_nodes() {
        let mut pool: NodePool = NodePool::new(32, 512);
        let first = pool.allocate().unwrap();
        unsafe { pool.deallocate(first) };
        let second = pool.allocate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn pool_grows_on_exhaustion() {
        let mut pool: NodePool = NodePool::new(64, 256);
        let per_slab = pool.next_capacity();

        let mut nodes = Vec::new();
        for _ in 0..per_slab + 1 {
            nodes.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.block_list.size(), 2);

        // Pairwise disjoint although they now span two slabs.
        nodes.sort();
        for pair in nodes.windows(2) {
            assert!(pair[1].as_ptr() as usize - pair[0].as_ptr() as usize >= 64);
        }
    }

    #[test]
    fn small_pool_one_byte_nodes() {
        let mut pool: SmallNodePool = SmallNodePool::new(1, 1024);
        assert_eq!(pool.node_size(), 1);

        // 300 single-byte nodes force at least two chunks (255 max per
        // chunk); all pointers distinct.
        let mut nodes = Vec::new();
        for _ in 0..300 {
            let node = pool.allocate().unwrap();
            assert!(!nodes.contains(&node));
            nodes.push(node);
        }

        for node in nodes {
            unsafe { pool.deallocate(node) };
        }
        assert!(pool.capacity() >= 300);
    }

    #[test]
    fn raw_allocator_checks_bounds() {
        let mut pool: NodePool = NodePool::new(16, 512);

        assert!(pool.allocate_node(16, 8).is_ok());
        assert!(matches!(
            pool.allocate_node(17, 8),
            Err(AllocationError::BadAllocationSize { .. })
        ));
        assert!(matches!(
            pool.allocate_node(16, pool.max_alignment() * 2),
            Err(AllocationError::BadAllocationSize { .. })
        ));
    }

    #[test]
    fn node_pool_arrays() {
        let mut pool: NodePool = NodePool::new(16, 1024);

        let array = pool.allocate_array(8).unwrap();
        unsafe { array.as_ptr().write_bytes(0x21, 8 * 16) };

        // The run really is 8 distinct cells: freeing it and allocating
        // single nodes walks through the same memory.
        unsafe { pool.deallocate_array(array, 8) };
        let node = pool.allocate().unwrap();
        assert_eq!(node.as_ptr(), array.as_ptr());
    }

    #[test]
    fn small_pool_rejects_arrays() {
        let mut pool: SmallNodePool = SmallNodePool::new(4, 512);
        // Within one node it degrades to a node allocation.
        assert!(pool.allocate_array(2, 2, 1).is_ok());
        // Beyond one node the flavor cannot help.
        assert!(matches!(
            pool.allocate_array(4, 4, 1),
            Err(AllocationError::BadAllocationSize { .. })
        ));
    }

    /// Upstream that refuses every request, to exercise the failure
    /// path end to end.
    #[derive(Debug, Default, Clone, Copy)]
    struct Exhausted;

    impl RawAllocator for Exhausted {
        fn allocate_node(
            &mut self,
            size: usize,
            _alignment: usize,
        ) -> Result<NonNull<u8>, AllocationError> {
            error::try_allocate(|_| None, size, self.info())
        }

        unsafe fn deallocate_node(&mut self, _ptr: NonNull<u8>, _size: usize, _alignment: usize) {}
    }

    #[test]
    fn upstream_failure_propagates() {
        let mut pool: MemoryPool<FreeList, Exhausted> = MemoryPool::new(16, 512);
        assert!(matches!(
            pool.allocate(),
            Err(AllocationError::OutOfMemory { .. })
        ));

        // The pool stays usable; every request fails the same way
        // instead of corrupting state.
        assert!(pool.allocate().is_err());
        assert_eq!(pool.capacity(), 0);
    }

    #[test]
    fn returned_nodes_are_aligned() {
        let mut pool: NodePool = NodePool::new(48, 4096);
        let alignment = pool.max_alignment();
        for _ in 0..20 {
            let node = pool.allocate().unwrap();
            assert_eq!(node.as_ptr() as usize % alignment, 0);
        }
    }
}
