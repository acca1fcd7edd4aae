//! Upstream allocators: the slow, general sources the block list
//! amortizes. Both are stateless, so any instance may free any other
//! instance's memory.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::align;
use crate::debug::{self, FENCE_SIZE};
use crate::error::{self, AllocationError, AllocatorInfo};
use crate::platform;
use crate::traits::{RawAllocator, StatelessAllocator};

#[cfg(feature = "debug-leak-check")]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outstanding bytes allocated through [`Heap`], for the leak check.
#[cfg(feature = "debug-leak-check")]
static HEAP_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

const HEAP_INFO: AllocatorInfo = AllocatorInfo::new("palloc::Heap", 0);
const PAGES_INFO: AllocatorInfo = AllocatorInfo::new("palloc::Pages", 0);

/// The default upstream allocator, a thin wrapper over the process heap.
/// Adds the debug fences and, under `debug-leak-check`, a global count of
/// outstanding bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Heap;

impl Heap {
    /// Reports outstanding bytes through the leak handler. Returns `true`
    /// when nothing is leaked. Call it when the last allocator backed by
    /// [`Heap`] is gone; there is no static destructor to do it for us.
    #[cfg(feature = "debug-leak-check")]
    pub fn check_leaks() -> bool {
        let leaked = HEAP_ALLOCATED.load(Ordering::Acquire);
        if leaked != 0 {
            error::leak_handler()(&HEAP_INFO, leaked);
        }
        leaked == 0
    }

    fn layout_for(size: usize, alignment: usize) -> Result<Layout, AllocationError> {
        let total = size.saturating_add(2 * FENCE_SIZE);
        Layout::from_size_align(total, alignment.max(align::MAX_ALIGNMENT)).map_err(|_| {
            error::bad_allocation_size_handler()(&HEAP_INFO, size, isize::MAX as usize);
            AllocationError::BadAllocationSize {
                info: HEAP_INFO,
                passed: size,
                supported: isize::MAX as usize,
            }
        })
    }
}

impl RawAllocator for Heap {
    const IS_STATEFUL: bool = false;

    fn info(&self) -> AllocatorInfo {
        HEAP_INFO
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        let size = size.max(1);
        // Fences sit between the allocation start and the returned node,
        // so they cap the honored alignment at MAX_ALIGNMENT.
        debug_assert!(FENCE_SIZE == 0 || alignment <= align::MAX_ALIGNMENT);
        let layout = Self::layout_for(size, alignment)?;

        let memory = error::try_allocate(
            |_| NonNull::new(unsafe { alloc::alloc(layout) }),
            size,
            HEAP_INFO,
        )?;

        #[cfg(feature = "debug-leak-check")]
        HEAP_ALLOCATED.fetch_add(size, Ordering::AcqRel);

        // The raw allocation is fence + node + fence; the caller sees the
        // node only.
        Ok(unsafe { debug::debug_fill_new(memory, size) })
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let size = size.max(1);
        // Reconstructing the layout cannot fail for a pointer we handed
        // out, the same parameters passed the check on allocation.
        let Ok(layout) = Self::layout_for(size, alignment) else {
            return;
        };

        let memory = debug::debug_fill_free(ptr, size);
        alloc::dealloc(memory.as_ptr(), layout);

        #[cfg(feature = "debug-leak-check")]
        HEAP_ALLOCATED.fetch_sub(size, Ordering::AcqRel);
    }

    fn max_node_size(&self) -> usize {
        isize::MAX as usize
    }
}

impl StatelessAllocator for Heap {}

/// Upstream allocator that skips the process heap entirely and requests
/// whole pages from the kernel. Worth it for pool block sizes in the page
/// range and beyond; every allocation costs a syscall, which is exactly
/// what the block list is there to amortize.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pages;

impl Pages {
    fn region_length(size: usize) -> usize {
        align::align_up(size.max(1), platform::page_size())
    }
}

impl RawAllocator for Pages {
    const IS_STATEFUL: bool = false;

    fn info(&self) -> AllocatorInfo {
        PAGES_INFO
    }

    fn allocate_node(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocationError> {
        // Pages come back page-aligned, which covers every fundamental
        // alignment; stricter requests are out of contract.
        error::check_allocation_size(alignment, self.max_alignment(), PAGES_INFO)?;
        error::check_allocation_size(size, self.max_node_size(), PAGES_INFO)?;

        let length = Self::region_length(size);
        error::try_allocate(|_| unsafe { platform::request_pages(length) }, size, PAGES_INFO)
    }

    unsafe fn deallocate_node(&mut self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        platform::release_pages(ptr, Self::region_length(size));
    }

    fn max_node_size(&self) -> usize {
        isize::MAX as usize
    }

    fn max_alignment(&self) -> usize {
        platform::page_size()
    }
}

impl StatelessAllocator for Pages {}
