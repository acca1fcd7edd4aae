//! Error types and the process-wide handler registry.
//!
//! Every failure in this crate is reported twice: first through a global
//! handler (a plain function pointer that can log, abort or set a flag),
//! then as an [`AllocationError`] returned to the caller. If the handler
//! returns, the library continues; handlers on the deallocation path
//! default to aborting because carrying on would corrupt the allocator.

use std::fmt;
use std::mem;
use std::process;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use thiserror::Error;

/// Identifies an allocator in error reports. The address is only a token:
/// two infos compare equal when they refer to the same allocator object,
/// and stateless allocators use zero.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorInfo {
    /// Static name of the allocator type, e.g. `"palloc::NodePool"`.
    pub name: &'static str,
    /// Address of the allocator object, or 0 for stateless allocators.
    /// Never cast this back to an allocator type.
    pub address: usize,
}

impl AllocatorInfo {
    pub const fn new(name: &'static str, address: usize) -> Self {
        Self { name, address }
    }
}

impl PartialEq for AllocatorInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for AllocatorInfo {}

impl fmt::Display for AllocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {:#x})", self.name, self.address)
    }
}

/// Failure of an allocation request. Deallocation never fails; its error
/// conditions (invalid pointer, overrun fences) go straight to the
/// handlers below because there is no caller to return to.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// The upstream allocator refused to provide memory.
    #[error("{info}: out of memory allocating {requested} bytes")]
    OutOfMemory {
        info: AllocatorInfo,
        requested: usize,
    },

    /// A size or alignment parameter exceeds what the allocator supports.
    /// `supported` is an upper bound; values below it can still fail.
    #[error("{info}: allocation size {passed} exceeds supported maximum {supported}")]
    BadAllocationSize {
        info: AllocatorInfo,
        passed: usize,
        supported: usize,
    },
}

impl AllocationError {
    /// The [`AllocatorInfo`] of the allocator that reported the error.
    pub fn allocator(&self) -> &AllocatorInfo {
        match self {
            Self::OutOfMemory { info, .. } => info,
            Self::BadAllocationSize { info, .. } => info,
        }
    }
}

/// Called when a low-level allocator runs out of memory, before the
/// [`AllocationError`] is returned. May log, abort, or just return.
pub type OutOfMemoryHandler = fn(info: &AllocatorInfo, requested: usize);

/// Called when a size or alignment parameter exceeds the supported bound.
pub type BadAllocationSizeHandler = fn(info: &AllocatorInfo, passed: usize, supported: usize);

/// Called when an allocator detects leaked memory at shutdown.
pub type LeakHandler = fn(info: &AllocatorInfo, leaked: usize);

/// Called when a deallocation function receives a pointer that was not
/// allocated by this allocator. If it returns, the pointer is dropped on
/// the floor; the default handler aborts instead.
pub type InvalidPointerHandler = fn(info: &AllocatorInfo, pointer: *const u8);

/// Called when fence bytes around a node were overwritten. `block` is the
/// start of the node, `node_size` its usable size and `pointer` the first
/// disturbed byte. The default handler aborts.
pub type BufferOverflowHandler = fn(block: *const u8, node_size: usize, pointer: *const u8);

/// Declares one atomic handler slot plus its set/get pair. A null in the
/// slot means "use the default", so the getter never returns null and
/// `set(None)` restores the default.
macro_rules! handler_slot {
    ($slot:ident, $ty:ty, $default:ident, $set:ident, $get:ident) => {
        static $slot: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

        /// Atomically installs `handler`, returning the previous one.
        /// `None` restores the default handler.
        pub fn $set(handler: Option<$ty>) -> $ty {
            let raw = handler.map_or(ptr::null_mut(), |f| f as *mut ());
            let previous = $slot.swap(raw, Ordering::AcqRel);
            if previous.is_null() {
                $default
            } else {
                // A non-null slot value was stored by this setter and
                // therefore has the slot's function pointer type.
                unsafe { mem::transmute::<*mut (), $ty>(previous) }
            }
        }

        /// The currently installed handler. Never null.
        pub fn $get() -> $ty {
            let raw = $slot.load(Ordering::Acquire);
            if raw.is_null() {
                $default
            } else {
                unsafe { mem::transmute::<*mut (), $ty>(raw) }
            }
        }
    };
}

fn default_out_of_memory(info: &AllocatorInfo, requested: usize) {
    log::error!("{info}: out of memory allocating {requested} bytes");
}

fn default_bad_allocation_size(info: &AllocatorInfo, passed: usize, supported: usize) {
    log::error!("{info}: allocation size {passed} exceeds supported maximum {supported}");
}

fn default_leak(info: &AllocatorInfo, leaked: usize) {
    log::error!("{info}: leaked {leaked} bytes");
}

fn default_invalid_pointer(info: &AllocatorInfo, pointer: *const u8) {
    log::error!("{info}: deallocation received invalid pointer {pointer:p}");
    process::abort();
}

fn default_buffer_overflow(block: *const u8, node_size: usize, pointer: *const u8) {
    log::error!(
        "buffer overflow at {pointer:p} detected, node {block:p} has only {node_size} bytes"
    );
    process::abort();
}

handler_slot!(
    OUT_OF_MEMORY,
    OutOfMemoryHandler,
    default_out_of_memory,
    set_out_of_memory_handler,
    out_of_memory_handler
);

handler_slot!(
    BAD_ALLOCATION_SIZE,
    BadAllocationSizeHandler,
    default_bad_allocation_size,
    set_bad_allocation_size_handler,
    bad_allocation_size_handler
);

handler_slot!(LEAK, LeakHandler, default_leak, set_leak_handler, leak_handler);

handler_slot!(
    INVALID_POINTER,
    InvalidPointerHandler,
    default_invalid_pointer,
    set_invalid_pointer_handler,
    invalid_pointer_handler
);

handler_slot!(
    BUFFER_OVERFLOW,
    BufferOverflowHandler,
    default_buffer_overflow,
    set_buffer_overflow_handler,
    buffer_overflow_handler
);

/// Runs a low-level allocation function, invoking the out-of-memory
/// handler exactly once on failure before surfacing the error. There is
/// no retry loop: Rust has no counterpart to the platform new-handler the
/// original C library cooperated with.
pub(crate) fn try_allocate(
    allocate: impl FnOnce(usize) -> Option<NonNull<u8>>,
    size: usize,
    info: AllocatorInfo,
) -> Result<NonNull<u8>, AllocationError> {
    match allocate(size) {
        Some(memory) => Ok(memory),
        None => {
            out_of_memory_handler()(&info, size);
            Err(AllocationError::OutOfMemory {
                info,
                requested: size,
            })
        }
    }
}

/// Rejects a request exceeding `supported`, reporting through the
/// bad-allocation-size handler first.
pub(crate) fn check_allocation_size(
    passed: usize,
    supported: usize,
    info: AllocatorInfo,
) -> Result<(), AllocationError> {
    if passed > supported {
        bad_allocation_size_handler()(&info, passed, supported);
        Err(AllocationError::BadAllocationSize {
            info,
            passed,
            supported,
        })
    } else {
        Ok(())
    }
}

// Function pointers and data pointers have the same size on every target
// this crate supports; the handler slots rely on it.
const _: () = assert!(mem::size_of::<OutOfMemoryHandler>() == mem::size_of::<*mut ()>());

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_oom(_: &AllocatorInfo, _: usize) {
        FLAG.fetch_add(1, Ordering::SeqCst);
    }

    static FLAG: AtomicUsize = AtomicUsize::new(0);

    // Handler slots are process-wide, so everything touching them lives
    // in one test to avoid cross-test races.
    #[test]
    fn handler_replacement_and_invocation() {
        let previous = set_out_of_memory_handler(Some(counting_oom));
        assert_eq!(out_of_memory_handler() as usize, counting_oom as usize);

        // A failing low-level allocation invokes the handler exactly once
        // per request and then produces the error.
        let info = AllocatorInfo::new("palloc::test", 0x1000);
        let result = try_allocate(|_| None, 64, info);
        assert_eq!(
            result,
            Err(AllocationError::OutOfMemory {
                info,
                requested: 64
            })
        );
        assert_eq!(FLAG.load(Ordering::SeqCst), 1);

        let result = try_allocate(|_| None, 128, info);
        assert!(result.is_err());
        assert_eq!(FLAG.load(Ordering::SeqCst), 2);

        // A successful allocation does not touch the handler.
        let mut byte = 0u8;
        let ptr = NonNull::from(&mut byte).cast();
        assert_eq!(try_allocate(|_| Some(ptr), 1, info), Ok(ptr));
        assert_eq!(FLAG.load(Ordering::SeqCst), 2);

        // Restoring the default: the getter must never return null.
        assert_eq!(set_out_of_memory_handler(None) as usize, counting_oom as usize);
        assert_eq!(
            out_of_memory_handler() as usize,
            default_out_of_memory as usize
        );
        let _ = set_out_of_memory_handler(Some(previous));
    }

    #[test]
    fn size_check() {
        let info = AllocatorInfo::new("palloc::test", 0);
        assert!(check_allocation_size(16, 16, info).is_ok());
        assert_eq!(
            check_allocation_size(17, 16, info),
            Err(AllocationError::BadAllocationSize {
                info,
                passed: 17,
                supported: 16
            })
        );
    }

    #[test]
    fn info_compares_by_address() {
        let a = AllocatorInfo::new("a", 1);
        let b = AllocatorInfo::new("b", 1);
        let c = AllocatorInfo::new("a", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{a}"), "a (at 0x1)");
    }
}
