//! The small-node free list. The pointer-chained list needs cells of at
//! least pointer size; this variant chains cells by one-byte indices
//! instead, which supports node sizes all the way down to a single byte.
//!
//! Cells live in *chunks* of at most 255 cells. Each chunk starts with a
//! small header and its free cells form a chain of cell indices:
//!
//! ```text
//! +-----------------------------------------+
//! | next chunk | first_free | free | cap    |  ChunkHeader
//! |-----------------------------------------|
//! | cell 0: [next index][...node bytes...]  |
//! | cell 1: [next index][...node bytes...]  |
//! |   ...                                   |
//! | cell cap-1                              |
//! +-----------------------------------------+
//! ```
//!
//! One byte of overhead per free cell instead of one pointer, paid for
//! with a chunk search on every operation. The search starts at a cursor
//! pointing to the last chunk touched, so sequential allocate/free
//! patterns stay cheap.

use std::mem;
use std::ptr::{self, NonNull};

use crate::align;
use crate::error::{self, AllocatorInfo};

/// Index value marking the end of a chunk's free chain. Capacities stay
/// at or below 255, so no real cell ever has this index.
const END_OF_CHAIN: u8 = u8::MAX;

/// Upper bound on cells per chunk; the index encoding allows no more.
pub(crate) const MAX_CHUNK_CELLS: usize = 255;

#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    /// Index of the first free cell, or [`END_OF_CHAIN`].
    first_free: u8,
    /// Number of free cells in this chunk.
    free: u8,
    /// Total cells in this chunk.
    capacity: u8,
}

const CHUNK_HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();
const CHUNK_ALIGNMENT: usize = mem::align_of::<ChunkHeader>();

/// Where a chunk's cells begin.
#[inline]
unsafe fn cells_of(chunk: NonNull<ChunkHeader>) -> *mut u8 {
    chunk.as_ptr().cast::<u8>().add(CHUNK_HEADER_SIZE)
}

/// Free list for cells of 1 to 255 bytes, chained by in-chunk indices.
pub struct SmallFreeList {
    chunks: *mut ChunkHeader,
    /// Last chunk an operation touched; searches start here.
    cursor: *mut ChunkHeader,
    node_size: usize,
    capacity: usize,
}

impl SmallFreeList {
    /// An empty list for cells of `node_size` bytes, `1..=255`.
    pub(crate) fn new(node_size: usize) -> Self {
        debug_assert!((1..=MAX_CHUNK_CELLS).contains(&node_size));
        Self {
            chunks: ptr::null_mut(),
            cursor: ptr::null_mut(),
            node_size,
            capacity: 0,
        }
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Number of free cells across all chunks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.capacity == 0
    }

    /// Alignment every returned cell satisfies. Cells are packed at
    /// `node_size` strides from an aligned chunk base, nothing more.
    pub fn alignment(&self) -> usize {
        align::alignment_for(self.node_size)
    }

    /// Smallest buffer [`insert`](Self::insert) can make use of.
    pub(crate) fn min_insert_size(node_size: usize) -> usize {
        CHUNK_HEADER_SIZE + node_size
    }

    /// Partitions `memory` into as many chunks as fit (each capped at
    /// [`MAX_CHUNK_CELLS`] cells) and prepends them to the chunk list.
    ///
    /// # Safety
    ///
    /// `memory` must be valid for writes of `size` bytes, aligned to the
    /// chunk header alignment, and stay valid for the lifetime of the
    /// list.
    pub(crate) unsafe fn insert(&mut self, memory: NonNull<u8>, size: usize) {
        debug_assert!(align::is_aligned(memory.as_ptr(), CHUNK_ALIGNMENT));

        let mut offset = 0;
        while offset + Self::min_insert_size(self.node_size) <= size {
            let available = size - offset - CHUNK_HEADER_SIZE;
            let cells = (available / self.node_size).min(MAX_CHUNK_CELLS);

            let chunk = memory.as_ptr().add(offset).cast::<ChunkHeader>();
            chunk.write(ChunkHeader {
                next: self.chunks,
                first_free: 0,
                free: cells as u8,
                capacity: cells as u8,
            });
            self.chunks = chunk;
            if self.cursor.is_null() {
                self.cursor = chunk;
            }

            // Thread the chain: each free cell's first byte holds the
            // index of the next free cell.
            let base = cells_of(NonNull::new_unchecked(chunk));
            for index in 0..cells {
                let next = if index + 1 == cells {
                    END_OF_CHAIN
                } else {
                    (index + 1) as u8
                };
                base.add(index * self.node_size).write(next);
            }

            self.capacity += cells;

            // The next chunk header needs its own alignment.
            offset = align::align_up(
                offset + CHUNK_HEADER_SIZE + cells * self.node_size,
                CHUNK_ALIGNMENT,
            );
        }
    }

    /// Pops a cell from the first chunk with free cells, starting the
    /// search at the cursor.
    pub(crate) fn allocate(&mut self) -> Option<NonNull<u8>> {
        let chunk = self.find_free_chunk()?;
        self.cursor = chunk.as_ptr();

        unsafe {
            let header = &mut *chunk.as_ptr();
            let index = header.first_free;
            let cell = cells_of(chunk).add(index as usize * self.node_size);

            header.first_free = cell.read();
            header.free -= 1;
            self.capacity -= 1;

            Some(NonNull::new_unchecked(cell))
        }
    }

    /// Returns a cell to its owning chunk, found by scanning the chunk
    /// list. Linear in the number of chunks, which is small because
    /// chunks are large relative to nodes. A pointer belonging to no
    /// chunk goes to the invalid-pointer handler.
    ///
    /// # Safety
    ///
    /// `cell` must have been returned by an allocation from this list and
    /// not already be free.
    pub(crate) unsafe fn deallocate(&mut self, cell: NonNull<u8>) {
        let Some(chunk) = self.chunk_containing(cell) else {
            let info = AllocatorInfo::new("palloc::SmallFreeList", self as *const Self as usize);
            error::invalid_pointer_handler()(&info, cell.as_ptr());
            return;
        };
        self.cursor = chunk.as_ptr();

        let base = cells_of(chunk);
        let offset = cell.as_ptr() as usize - base as usize;
        debug_assert!(offset % self.node_size == 0, "pointer not on a cell boundary");
        let index = (offset / self.node_size) as u8;

        #[cfg(debug_assertions)]
        self.assert_not_free(chunk, index);

        let header = &mut *chunk.as_ptr();
        cell.as_ptr().write(header.first_free);
        header.first_free = index;
        header.free += 1;
        self.capacity += 1;
    }

    /// First chunk with a free cell: cursor to end of list, then head to
    /// cursor.
    fn find_free_chunk(&self) -> Option<NonNull<ChunkHeader>> {
        unsafe {
            let mut chunk = self.cursor;
            while !chunk.is_null() {
                if (*chunk).free > 0 {
                    return Some(NonNull::new_unchecked(chunk));
                }
                chunk = (*chunk).next;
            }

            let mut chunk = self.chunks;
            while !chunk.is_null() && chunk != self.cursor {
                if (*chunk).free > 0 {
                    return Some(NonNull::new_unchecked(chunk));
                }
                chunk = (*chunk).next;
            }
        }
        None
    }

    /// The chunk whose cell range contains `cell`, cursor first.
    fn chunk_containing(&self, cell: NonNull<u8>) -> Option<NonNull<ChunkHeader>> {
        let owns = |chunk: *mut ChunkHeader| unsafe {
            let base = cells_of(NonNull::new_unchecked(chunk)) as usize;
            let end = base + (*chunk).capacity as usize * self.node_size;
            (base..end).contains(&(cell.as_ptr() as usize))
        };

        unsafe {
            let mut chunk = self.cursor;
            while !chunk.is_null() {
                if owns(chunk) {
                    return Some(NonNull::new_unchecked(chunk));
                }
                chunk = (*chunk).next;
            }

            let mut chunk = self.chunks;
            while !chunk.is_null() && chunk != self.cursor {
                if owns(chunk) {
                    return Some(NonNull::new_unchecked(chunk));
                }
                chunk = (*chunk).next;
            }
        }
        None
    }

    /// Walks the chunk's free chain to catch a double free. Bounded by
    /// 255 steps, debug builds only.
    #[cfg(debug_assertions)]
    unsafe fn assert_not_free(&self, chunk: NonNull<ChunkHeader>, index: u8) {
        let base = cells_of(chunk);
        let mut current = chunk.as_ref().first_free;
        while current != END_OF_CHAIN {
            debug_assert!(current != index, "double free of small-list cell");
            current = base.add(current as usize * self.node_size).read();
        }
    }
}
