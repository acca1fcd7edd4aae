//! Platform-specific page acquisition. The allocators above only ever ask
//! for whole pages and give them back; which kernel API that maps to is
//! decided here, once, behind a tiny trait.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Pointer;

/// What the crate needs from the operating system: big aligned regions in,
/// big aligned regions out, and the page size.
trait VirtualMemory {
    /// Requests a region of at least `length` bytes from the kernel.
    /// Returns `None` on failure. The region is page-aligned.
    unsafe fn request_pages(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the kernel. The
    /// arguments must describe a region obtained from
    /// [`request_pages`](Self::request_pages).
    unsafe fn release_pages(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type implementing [`VirtualMemory`] for the current OS.
struct Os;

/// Cached page size, 4096 bytes on most machines. Zero until the first
/// query, we only learn the real value at runtime.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub(crate) fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { Os::page_size() };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// See [`VirtualMemory::request_pages`].
#[inline]
pub(crate) unsafe fn request_pages(length: usize) -> Pointer<u8> {
    Os::request_pages(length)
}

/// See [`VirtualMemory::release_pages`].
#[inline]
pub(crate) unsafe fn release_pages(address: NonNull<u8>, length: usize) {
    Os::release_pages(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Os, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Os {
        unsafe fn request_pages(length: usize) -> Pointer<u8> {
            // Private anonymous read-write mapping, the plain way to get
            // zeroed pages that belong to no file.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn release_pages(address: NonNull<u8>, length: usize) {
            // munmap only fails on bad arguments, and ours come straight
            // from a successful mmap.
            libc::munmap(address.cast().as_ptr(), length);
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Os, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Os {
        unsafe fn request_pages(length: usize) -> Pointer<u8> {
            // Reserve and commit in one call; decommitting separately is
            // of no use to us.
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn release_pages(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE requires a length of zero and frees the whole
            // original reservation.
            Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE);
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so page requests are mocked through the global
    //! allocator. This doubles as leak detection for our own slabs: a
    //! region we never release shows up in Miri's leak report.

    use std::alloc;
    use std::ptr::NonNull;

    use super::{page_size, Os, VirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).expect("page request too large")
    }

    impl VirtualMemory for Os {
        unsafe fn request_pages(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn release_pages(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_round_trip() {
        let length = page_size() * 2;
        unsafe {
            let pages = request_pages(length).unwrap();
            // The region must be writable end to end.
            pages.as_ptr().write_bytes(0x5A, length);
            assert_eq!(*pages.as_ptr().add(length - 1), 0x5A);
            release_pages(pages, length);
        }
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(crate::align::is_power_of_two(page_size()));
    }
}
