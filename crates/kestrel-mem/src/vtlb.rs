//! Virtual translation table (VTLB).
//!
//! One entry per 4 KiB guest virtual page. An entry is either a direct host mapping, stored as a
//! signed delta so the hot path is `host = vaddr + delta`, or a reference to a device handler.
//! Unmapped entries fault deterministically with a guest-visible [`BusFault`].

use std::ptr;

use crate::fatal;
use crate::fault::{AccessWidth, BusFault};
use crate::handler::{HandlerId, HandlerRegistry, MemoryHandler};

pub const VTLB_PAGE_BITS: u32 = 12;
pub const VTLB_PAGE_SIZE: u32 = 1 << VTLB_PAGE_BITS;
pub const VTLB_PAGE_MASK: u32 = VTLB_PAGE_SIZE - 1;
/// Number of entries covering the full 32-bit guest virtual space.
pub const VTLB_ENTRIES: usize = 1 << (32 - VTLB_PAGE_BITS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VtlbEntry {
    #[default]
    Unmapped,
    /// Host memory at `vaddr + delta`.
    Direct { delta: isize, writable: bool },
    /// Device handler; the handler sees `paddr | (vaddr & VTLB_PAGE_MASK)`.
    Handler { id: HandlerId, paddr: u32 },
}

impl VtlbEntry {
    /// Host address backing `vaddr` for direct entries.
    #[inline]
    pub fn host_ptr(self, vaddr: u32) -> Option<*mut u8> {
        match self {
            VtlbEntry::Direct { delta, .. } => {
                Some((vaddr as isize).wrapping_add(delta) as usize as *mut u8)
            }
            _ => None,
        }
    }

    pub fn is_direct(self) -> bool {
        matches!(self, VtlbEntry::Direct { .. })
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Integer types a guest can load or store in one access.
pub trait GuestWord: Copy + Default + sealed::Sealed {
    const WIDTH: AccessWidth;

    fn from_le(self) -> Self;
    fn to_le(self) -> Self;
    fn handler_read(handler: &mut dyn MemoryHandler, paddr: u32) -> Self;
    fn handler_write(self, handler: &mut dyn MemoryHandler, paddr: u32);
}

macro_rules! guest_word {
    ($ty:ty, $width:ident, $read:ident, $write:ident) => {
        impl sealed::Sealed for $ty {}

        impl GuestWord for $ty {
            const WIDTH: AccessWidth = AccessWidth::$width;

            #[inline]
            fn from_le(self) -> Self {
                <$ty>::from_le(self)
            }

            #[inline]
            fn to_le(self) -> Self {
                <$ty>::to_le(self)
            }

            #[inline]
            fn handler_read(handler: &mut dyn MemoryHandler, paddr: u32) -> Self {
                handler.$read(paddr)
            }

            #[inline]
            fn handler_write(self, handler: &mut dyn MemoryHandler, paddr: u32) {
                handler.$write(paddr, self)
            }
        }
    };
}

guest_word!(u8, Byte, read8, write8);
guest_word!(u16, Half, read16, write16);
guest_word!(u32, Word, read32, write32);
guest_word!(u64, Double, read64, write64);
guest_word!(u128, Quad, read128, write128);

pub struct Vtlb {
    entries: Box<[VtlbEntry]>,
}

impl Default for Vtlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Vtlb {
    pub fn new() -> Self {
        Self {
            entries: vec![VtlbEntry::Unmapped; VTLB_ENTRIES].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn entry(&self, vaddr: u32) -> VtlbEntry {
        self.entries[(vaddr >> VTLB_PAGE_BITS) as usize]
    }

    /// Maps `[vaddr, vaddr + size)` onto contiguous host memory starting at `host`.
    ///
    /// # Safety
    /// `host..host + size` must stay valid for reads (and writes, if `writable`) until the range
    /// is unmapped or remapped.
    pub unsafe fn map_host(&mut self, vaddr: u32, host: *mut u8, size: u32, writable: bool) {
        check_range(vaddr, size);
        let delta = (host as isize).wrapping_sub(vaddr as isize);
        self.fill(vaddr, size, |_| VtlbEntry::Direct { delta, writable });
    }

    /// Routes `[vaddr, vaddr + size)` to handler `id`; the handler observes addresses relative to
    /// `paddr`.
    pub fn map_handler(&mut self, vaddr: u32, id: HandlerId, paddr: u32, size: u32) {
        check_range(vaddr, size);
        if paddr & VTLB_PAGE_MASK != 0 {
            fatal!("misaligned handler mapping: paddr={paddr:#010x}");
        }
        self.fill(vaddr, size, |page| VtlbEntry::Handler {
            id,
            paddr: paddr.wrapping_add(page * VTLB_PAGE_SIZE),
        });
    }

    pub fn unmap(&mut self, vaddr: u32, size: u32) {
        check_range(vaddr, size);
        self.fill(vaddr, size, |_| VtlbEntry::Unmapped);
    }

    /// Installs a single page entry. `vaddr` must be page aligned.
    pub(crate) fn set_page(&mut self, vaddr: u32, entry: VtlbEntry) {
        check_range(vaddr, VTLB_PAGE_SIZE);
        self.entries[(vaddr >> VTLB_PAGE_BITS) as usize] = entry;
    }

    pub fn clear(&mut self) {
        self.entries.fill(VtlbEntry::Unmapped);
    }

    #[inline]
    pub fn read<T: GuestWord>(
        &self,
        handlers: &mut HandlerRegistry,
        vaddr: u32,
    ) -> Result<T, BusFault> {
        check_alignment::<T>(vaddr, false)?;
        match self.entry(vaddr) {
            VtlbEntry::Direct { delta, .. } => {
                let host = (vaddr as isize).wrapping_add(delta) as usize as *const T;
                // Safety: direct entries only point into live host memory (contract of
                // `map_host`), and the access is naturally aligned within one page.
                Ok(unsafe { ptr::read(host) }.from_le())
            }
            VtlbEntry::Handler { id, paddr } => Ok(T::handler_read(
                handlers.get_mut(id),
                paddr | (vaddr & VTLB_PAGE_MASK),
            )),
            VtlbEntry::Unmapped => Err(BusFault::Unmapped {
                vaddr,
                width: T::WIDTH,
                write: false,
            }),
        }
    }

    #[inline]
    pub fn write<T: GuestWord>(
        &mut self,
        handlers: &mut HandlerRegistry,
        vaddr: u32,
        value: T,
    ) -> Result<(), BusFault> {
        check_alignment::<T>(vaddr, true)?;
        match self.entry(vaddr) {
            VtlbEntry::Direct {
                delta,
                writable: true,
            } => {
                let host = (vaddr as isize).wrapping_add(delta) as usize as *mut T;
                // Safety: see `read`; writable entries point at writable host memory.
                unsafe { ptr::write(host, value.to_le()) };
                Ok(())
            }
            VtlbEntry::Direct {
                writable: false, ..
            } => {
                tracing::trace!(vaddr = format_args!("{vaddr:#010x}"), "dropped write to ROM");
                Ok(())
            }
            VtlbEntry::Handler { id, paddr } => {
                value.handler_write(handlers.get_mut(id), paddr | (vaddr & VTLB_PAGE_MASK));
                Ok(())
            }
            VtlbEntry::Unmapped => Err(BusFault::Unmapped {
                vaddr,
                width: T::WIDTH,
                write: true,
            }),
        }
    }

    fn fill(&mut self, vaddr: u32, size: u32, mut entry: impl FnMut(u32) -> VtlbEntry) {
        let first = (vaddr >> VTLB_PAGE_BITS) as usize;
        for page in 0..size / VTLB_PAGE_SIZE {
            self.entries[first + page as usize] = entry(page);
        }
    }
}

impl std::fmt::Debug for Vtlb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapped = self
            .entries
            .iter()
            .filter(|e| !matches!(e, VtlbEntry::Unmapped))
            .count();
        f.debug_struct("Vtlb").field("mapped_pages", &mapped).finish()
    }
}

#[inline]
fn check_alignment<T: GuestWord>(vaddr: u32, write: bool) -> Result<(), BusFault> {
    if vaddr & (T::WIDTH.bytes() - 1) != 0 {
        return Err(BusFault::Misaligned {
            vaddr,
            width: T::WIDTH,
            write,
        });
    }
    Ok(())
}

pub(crate) fn check_range(vaddr: u32, size: u32) {
    if vaddr & VTLB_PAGE_MASK != 0 || size & VTLB_PAGE_MASK != 0 || size == 0 {
        fatal!("misaligned virtual mapping: vaddr={vaddr:#010x} size={size:#x}");
    }
    if u64::from(vaddr) + u64::from(size) > 1 << 32 {
        fatal!("virtual mapping {vaddr:#010x}+{size:#x} wraps the address space");
    }
}
