//! Root allocator backed by operating-system virtual memory.
//!
//! Every allocation is its own mapping: the page-rounded region is reserved,
//! committed, and prefixed with a [`MIN_ALIGN`]-byte header recording the
//! mapping length so [`free`](Allocator::free) can hand it back. This is
//! meant as the parent of block-based allocators, not for small objects.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::io;
use std::ptr::{self, NonNull};

use quarry_core::{checked_align_up, AllocError, Allocator, ClearFlag, MIN_ALIGN};

const HEADER: usize = MIN_ALIGN;

/// Allocator that maps fresh pages from the OS for every request.
///
/// Committed pages are zero-filled by the OS, so [`ClearFlag`] costs
/// nothing here.
#[derive(Debug)]
pub struct OsAllocator {
    page_size: usize,
    live: Cell<usize>,
}

impl OsAllocator {
    /// Create a provider, querying the system page size.
    pub fn new() -> Self {
        Self {
            page_size: sys::page_size(),
            live: Cell::new(0),
        }
    }

    /// System page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of mappings created by `allocate` and not yet freed.
    pub fn live_mappings(&self) -> usize {
        self.live.get()
    }

    /// Reserve `size` bytes of address space without backing it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the reservation fails.
    pub fn reserve(&self, size: usize) -> io::Result<NonNull<u8>> {
        sys::reserve(size)
    }

    /// Back `size` bytes at `ptr` with readable, writable memory.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must lie inside a region returned by
    /// [`reserve`](Self::reserve) and `ptr` must be page-aligned.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the commit fails.
    pub unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { sys::commit(ptr, size) }
    }

    /// Drop the backing of `size` bytes at `ptr`, keeping the reservation.
    ///
    /// # Safety
    ///
    /// As for [`commit`](Self::commit); the range must not be accessed
    /// until committed again.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the decommit fails.
    pub unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { sys::decommit(ptr, size) }
    }

    /// Give a whole reservation back to the OS.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must exactly describe one region returned by
    /// [`reserve`](Self::reserve), and no pointer into it may be used
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the release fails.
    pub unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { sys::release(ptr, size) }
    }
}

impl Default for OsAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for OsAllocator {
    fn allocate(&self, size: usize, _clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        let total = size
            .checked_add(HEADER)
            .and_then(|n| checked_align_up(n, self.page_size))
            .ok_or(AllocError::Overflow)?;
        let oom = |err: io::Error| {
            tracing::debug!(size, %err, "os mapping failed");
            AllocError::OutOfMemory { requested: size }
        };

        let base = self.reserve(total).map_err(oom)?;
        // SAFETY: `base..base + total` was just reserved and is page-aligned.
        if let Err(err) = unsafe { self.commit(base, total) } {
            // SAFETY: releasing the reservation made above, untouched.
            if let Err(release_err) = unsafe { self.release(base, total) } {
                tracing::debug!(%release_err, "release after failed commit failed");
            }
            return Err(oom(err));
        }
        // SAFETY: the mapping is committed and at least HEADER bytes long;
        // page alignment satisfies `usize` alignment.
        unsafe {
            base.cast::<usize>().as_ptr().write(total);
            self.live.set(self.live.get() + 1);
            Ok(NonNull::new_unchecked(base.as_ptr().add(HEADER)))
        }
    }

    unsafe fn free(&self, memory: NonNull<u8>) {
        // SAFETY: `memory` came from `allocate`, so the mapping starts
        // HEADER bytes earlier and begins with its total length.
        unsafe {
            let base = NonNull::new_unchecked(memory.as_ptr().sub(HEADER));
            let total = base.cast::<usize>().as_ptr().read();
            if let Err(err) = self.decommit(base, total) {
                tracing::debug!(%err, "decommit failed");
            }
            if let Err(err) = self.release(base, total) {
                tracing::debug!(%err, "release failed");
            }
        }
        self.live.set(self.live.get().saturating_sub(1));
    }
}

#[cfg(unix)]
mod sys {
    use super::*;

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }

    pub(super) fn reserve(size: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping with no fixed address; the
        // kernel validates `size` and reports MAP_FAILED on error.
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(p.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    pub(super) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside a reservation.
        let rc = unsafe {
            libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE)
        };
        check(rc)
    }

    pub(super) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside a reservation and
        // no longer accessed.
        unsafe {
            check(libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED))?;
            check(libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE))
        }
    }

    pub(super) unsafe fn release(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: caller guarantees `ptr`/`size` describe one mapping.
        check(unsafe { libc::munmap(ptr.as_ptr().cast(), size) })
    }

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use winapi::ctypes::c_void;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    pub(super) fn page_size() -> usize {
        // SAFETY: GetSystemInfo fills the zeroed struct it is given.
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    pub(super) fn reserve(size: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: reservation at an OS-chosen address.
        let p = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
        NonNull::new(p.cast()).ok_or_else(io::Error::last_os_error)
    }

    pub(super) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside a reservation.
        let p = unsafe { VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_COMMIT, PAGE_READWRITE) };
        if p.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub(super) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside a reservation.
        check(unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), size, MEM_DECOMMIT) })
    }

    pub(super) unsafe fn release(ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
        // SAFETY: caller guarantees `ptr` is the base of a reservation.
        check(unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) })
    }

    fn check(ok: i32) -> io::Result<()> {
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use super::*;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "no virtual memory API on this target")
    }

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn reserve(_size: usize) -> io::Result<NonNull<u8>> {
        Err(unsupported())
    }

    pub(super) unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) unsafe fn release(_ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
        Err(unsupported())
    }
}
