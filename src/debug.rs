//! Debug instrumentation hooks: pattern fills and fence bytes. Everything
//! here compiles away unless the `debug-fill` / `debug-fence` features are
//! enabled, so release allocators pay nothing for it.

use std::ptr::NonNull;

use crate::align;
use crate::error;

/// Magic byte written over memory to make its state visible in a
/// debugger. Reading one of these patterns out of "live" memory usually
/// points at a use-after-free or an overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugMagic {
    /// Memory just handed to the caller.
    NewMemory = 0xCD,
    /// Memory the caller has returned.
    FreedMemory = 0xDD,
    /// Memory owned by an allocator for its own bookkeeping.
    InternalMemory = 0xAB,
    /// Fence bytes surrounding a node.
    FenceMemory = 0xFD,
}

/// Bytes placed on both sides of each node when `debug-fence` is on. One
/// full [`align::MAX_ALIGNMENT`] unit so the returned pointer keeps its
/// alignment guarantee.
pub const FENCE_SIZE: usize = if cfg!(feature = "debug-fence") {
    align::MAX_ALIGNMENT
} else {
    0
};

/// Fills `size` bytes at `memory` with the given pattern.
///
/// # Safety
///
/// `memory` must be valid for writes of `size` bytes.
#[inline]
pub(crate) unsafe fn debug_fill(memory: NonNull<u8>, size: usize, magic: DebugMagic) {
    if cfg!(feature = "debug-fill") {
        memory.as_ptr().write_bytes(magic as u8, size);
    }
}

/// Prepares a freshly allocated node: writes the fences around it, fills
/// the interior with [`DebugMagic::NewMemory`] and returns the address the
/// caller gets to use. `memory` points at the raw allocation, which must
/// be `node_size + 2 * FENCE_SIZE` bytes.
///
/// # Safety
///
/// `memory` must be valid for writes of `node_size + 2 * FENCE_SIZE`
/// bytes.
#[inline]
pub(crate) unsafe fn debug_fill_new(memory: NonNull<u8>, node_size: usize) -> NonNull<u8> {
    debug_fill(memory, FENCE_SIZE, DebugMagic::FenceMemory);
    let node = NonNull::new_unchecked(memory.as_ptr().add(FENCE_SIZE));
    debug_fill(node, node_size, DebugMagic::NewMemory);
    debug_fill(
        NonNull::new_unchecked(node.as_ptr().add(node_size)),
        FENCE_SIZE,
        DebugMagic::FenceMemory,
    );
    node
}

/// The inverse of [`debug_fill_new`]: verifies the fences, fills the node
/// with [`DebugMagic::FreedMemory`] and returns the start of the raw
/// allocation. A disturbed fence goes to the buffer-overflow handler,
/// which aborts by default.
///
/// # Safety
///
/// `node` must have been returned by [`debug_fill_new`] with the same
/// `node_size`.
#[inline]
pub(crate) unsafe fn debug_fill_free(node: NonNull<u8>, node_size: usize) -> NonNull<u8> {
    if cfg!(feature = "debug-fence") {
        let front = node.as_ptr().sub(FENCE_SIZE);
        let back = node.as_ptr().add(node_size);
        for offset in 0..FENCE_SIZE {
            let front_byte = front.add(offset);
            if *front_byte != DebugMagic::FenceMemory as u8 {
                error::buffer_overflow_handler()(node.as_ptr(), node_size, front_byte);
            }
            let back_byte = back.add(offset);
            if *back_byte != DebugMagic::FenceMemory as u8 {
                error::buffer_overflow_handler()(node.as_ptr(), node_size, back_byte);
            }
        }
    }
    debug_fill(node, node_size, DebugMagic::FreedMemory);
    NonNull::new_unchecked(node.as_ptr().sub(FENCE_SIZE))
}
