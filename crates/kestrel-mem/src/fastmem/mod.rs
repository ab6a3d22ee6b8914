//! Fastmem: a host view of the whole 32-bit guest virtual space.
//!
//! JIT-compiled loads and stores address `arena_base + vaddr` directly. The arena starts fully
//! inaccessible; the first access to a page faults, and the fault is resolved either by aliasing
//! the page's backing into the arena ([`FastmemArena::map_page`]) or by backpatching the
//! faulting code site to the handler slow path (see [`patch`]).

pub mod patch;

use std::ptr::NonNull;

use crate::error::{RegionError, Result};
use crate::region::ReservedRegion;
use crate::sys::{self, Protection};
use crate::vtlb::{VTLB_ENTRIES, VTLB_PAGE_BITS, VTLB_PAGE_SIZE};

/// Size of the arena: the full 32-bit guest virtual space.
pub const FASTMEM_ARENA_SIZE: usize = 1 << 32;

pub struct FastmemArena {
    base: NonNull<u8>,
    /// One bit per guest page currently aliased into the arena.
    mapped: Box<[u64]>,
    mapped_count: usize,
}

// Safety: the arena exclusively owns its reservation.
unsafe impl Send for FastmemArena {}
unsafe impl Sync for FastmemArena {}

impl FastmemArena {
    pub fn reserve() -> Result<Self> {
        let base = sys::map_anonymous(FASTMEM_ARENA_SIZE, Protection::empty()).map_err(
            |source| RegionError::Os {
                op: "reserve",
                region: "fastmem".to_string(),
                source,
            },
        )?;
        tracing::debug!(base = ?base, "reserved fastmem arena");
        Ok(Self {
            base,
            mapped: vec![0u64; VTLB_ENTRIES / 64].into_boxed_slice(),
            mapped_count: 0,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Guest virtual address corresponding to a host address, if it lies inside the arena.
    pub fn guest_address(&self, host: usize) -> Option<u32> {
        let base = self.base.as_ptr() as usize;
        let offset = host.checked_sub(base)?;
        (offset < FASTMEM_ARENA_SIZE).then_some(offset as u32)
    }

    pub fn is_mapped(&self, vaddr: u32) -> bool {
        let page = (vaddr >> VTLB_PAGE_BITS) as usize;
        self.mapped[page / 64] & (1 << (page % 64)) != 0
    }

    pub fn mapped_pages(&self) -> usize {
        self.mapped_count
    }

    /// Aliases one page of `region`'s backing (at window offset `offset`) into the arena at the
    /// page containing `vaddr`.
    pub fn map_page(
        &mut self,
        vaddr: u32,
        region: &ReservedRegion,
        offset: usize,
        writable: bool,
    ) -> Result<()> {
        let page_addr = vaddr & !(VTLB_PAGE_SIZE - 1);
        let prot = if writable {
            Protection::READ_WRITE
        } else {
            Protection::READ
        };
        // Safety: the destination page lies inside our reservation, and arena memory is never
        // referenced by Rust references.
        unsafe { region.alias_into(self.page_ptr(page_addr), offset, VTLB_PAGE_SIZE as usize, prot)? };
        self.set_mapped(page_addr, true);
        Ok(())
    }

    /// Makes the page containing `vaddr` inaccessible again, so the next access faults.
    pub fn unmap_page(&mut self, vaddr: u32) -> Result<()> {
        if !self.is_mapped(vaddr) {
            return Ok(());
        }
        let page_addr = vaddr & !(VTLB_PAGE_SIZE - 1);
        // Safety: as in `map_page`.
        unsafe { sys::reset_fixed(self.page_ptr(page_addr), VTLB_PAGE_SIZE as usize) }.map_err(
            |source| RegionError::Os {
                op: "evict page from",
                region: "fastmem".to_string(),
                source,
            },
        )?;
        self.set_mapped(page_addr, false);
        Ok(())
    }

    /// Evicts every page in `[vaddr, vaddr + size)`.
    pub fn unmap_range(&mut self, vaddr: u32, size: u32) -> Result<()> {
        let pages = size / VTLB_PAGE_SIZE;
        for page in 0..pages {
            self.unmap_page(vaddr.wrapping_add(page * VTLB_PAGE_SIZE))?;
        }
        Ok(())
    }

    /// Evicts every page. Must run before the backing region is decommitted.
    pub fn unmap_all(&mut self) -> Result<()> {
        if self.mapped_count == 0 {
            return Ok(());
        }
        // Safety: the whole arena is ours.
        unsafe { sys::reset_fixed(self.base, FASTMEM_ARENA_SIZE) }.map_err(|source| {
            RegionError::Os {
                op: "reset",
                region: "fastmem".to_string(),
                source,
            }
        })?;
        self.mapped.fill(0);
        self.mapped_count = 0;
        Ok(())
    }

    fn page_ptr(&self, page_addr: u32) -> NonNull<u8> {
        // Safety: `page_addr < 2^32 == FASTMEM_ARENA_SIZE`, so the result stays inside the
        // reservation and is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(page_addr as usize)) }
    }

    fn set_mapped(&mut self, page_addr: u32, mapped: bool) {
        let page = (page_addr >> VTLB_PAGE_BITS) as usize;
        let (word, bit) = (page / 64, 1u64 << (page % 64));
        let was = self.mapped[word] & bit != 0;
        if mapped {
            self.mapped[word] |= bit;
        } else {
            self.mapped[word] &= !bit;
        }
        match (was, mapped) {
            (false, true) => self.mapped_count += 1,
            (true, false) => self.mapped_count -= 1,
            _ => {}
        }
    }
}

impl Drop for FastmemArena {
    fn drop(&mut self) {
        // Safety: exactly the reservation created in `reserve`.
        if let Err(err) = unsafe { sys::unmap(self.base, FASTMEM_ARENA_SIZE) } {
            tracing::warn!("failed to release fastmem arena: {err}");
        }
    }
}

impl std::fmt::Debug for FastmemArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastmemArena")
            .field("base", &self.base)
            .field("mapped_pages", &self.mapped_count)
            .finish()
    }
}
