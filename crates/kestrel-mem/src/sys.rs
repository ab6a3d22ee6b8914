//! Thin wrappers over the host virtual-memory syscalls.
//!
//! Every raw `mmap`/`mprotect`/`munmap` call in the crate goes through this module so the
//! remaining code only deals in `NonNull<u8>` + lengths.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use bitflags::bitflags;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

bitflags! {
    /// Host page protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXEC = Self::READ.bits() | Self::EXEC.bits();
    }
}

impl Protection {
    fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & PAGE_MASK == 0
}

#[inline]
pub const fn align_up(value: usize) -> usize {
    (value + PAGE_MASK) & !PAGE_MASK
}

/// Reserves `len` bytes of address space with the given protection and no file backing.
///
/// `Protection::empty()` produces a pure reservation: no physical pages are committed and any
/// access faults.
pub fn map_anonymous(len: usize, prot: Protection) -> io::Result<NonNull<u8>> {
    // Safety: a fresh anonymous mapping with a null hint never aliases existing memory.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            prot.to_native(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}

/// Replaces `[addr, addr + len)` with an inaccessible anonymous mapping, dropping whatever was
/// mapped there before.
///
/// # Safety
/// The range must lie inside a reservation owned by the caller, and no live Rust reference may
/// point into it.
pub unsafe fn reset_fixed(addr: NonNull<u8>, len: usize) -> io::Result<()> {
    let ret = libc::mmap(
        addr.as_ptr().cast(),
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
        -1,
        0,
    );
    check_fixed(ret, addr)
}

/// Maps `len` bytes of `fd` starting at `offset` over `[addr, addr + len)`.
///
/// # Safety
/// Same contract as [`reset_fixed`]; additionally `offset + len` must not exceed the file size.
pub unsafe fn map_shared_fixed(
    addr: NonNull<u8>,
    len: usize,
    prot: Protection,
    fd: &OwnedFd,
    offset: usize,
) -> io::Result<()> {
    let offset: libc::off_t = offset
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file offset overflow"))?;
    let ret = libc::mmap(
        addr.as_ptr().cast(),
        len,
        prot.to_native(),
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd.as_raw_fd(),
        offset,
    );
    check_fixed(ret, addr)
}

/// # Safety
/// The range must lie inside a mapping owned by the caller.
pub unsafe fn protect(addr: NonNull<u8>, len: usize, prot: Protection) -> io::Result<()> {
    if libc::mprotect(addr.as_ptr().cast(), len, prot.to_native()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// # Safety
/// The range must be a whole mapping previously returned by [`map_anonymous`] and must not be
/// used afterwards.
pub unsafe fn unmap(addr: NonNull<u8>, len: usize) -> io::Result<()> {
    if libc::munmap(addr.as_ptr().cast(), len) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Creates an anonymous shared-memory file of `len` bytes. The file is sparse: no pages are
/// allocated until they are first touched.
pub fn create_backing(name: &str, len: usize) -> io::Result<OwnedFd> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))?;
    // Safety: `c_name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `fd` was just returned by `memfd_create` and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    resize_backing(&fd, len)?;
    Ok(fd)
}

/// Truncates the backing file to `len` bytes. Shrinking releases the dropped pages.
pub fn resize_backing(fd: &OwnedFd, len: usize) -> io::Result<()> {
    let len: libc::off_t = len
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "backing size overflow"))?;
    // Safety: plain syscall on an owned descriptor.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check_fixed(ret: *mut libc::c_void, expected: NonNull<u8>) -> io::Result<()> {
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    if ret.cast::<u8>() != expected.as_ptr() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "MAP_FIXED mapping landed at an unexpected address",
        ));
    }
    Ok(())
}
