//! Up-front host address-space reservations for guest memory.
//!
//! A [`ReservedRegion`] is one large `PROT_NONE` window reserved at process start. Fixed-offset
//! sub-regions (RAM, ROM, scratchpad, ...) are carved out of it with [`ReservedRegion::assign`]
//! and committed or decommitted together, so a VM restart always sees the same host addresses and
//! zeroed contents.
//!
//! The window is backed by a sparse shared-memory file rather than anonymous memory so pages can
//! be aliased into other views (see [`crate::fastmem::FastmemArena`]).

use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{RegionError, Result};
use crate::sys::{self, Protection, PAGE_SIZE};

/// A named, page-aligned slice of a [`ReservedRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRegion {
    name: &'static str,
    offset: usize,
    size: usize,
}

impl SubRegion {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    fn overlaps(&self, other: &SubRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

pub struct ReservedRegion {
    name: String,
    base: NonNull<u8>,
    size: usize,
    backing: OwnedFd,
    sub_regions: Vec<SubRegion>,
    committed: bool,
}

// Safety: the region exclusively owns its mapping; raw pointers handed out by `host_ptr` are only
// dereferenced under the crate's commit/decommit discipline.
unsafe impl Send for ReservedRegion {}
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    /// Reserves `size` bytes (rounded up to a page) of address space without committing any
    /// physical backing.
    pub fn reserve(name: &str, size: usize) -> Result<Self> {
        let size = sys::align_up(size.max(PAGE_SIZE));
        let os_err = |op, source| RegionError::Os {
            op,
            region: name.to_string(),
            source,
        };

        let backing = sys::create_backing(name, size).map_err(|e| os_err("create backing for", e))?;
        let base = sys::map_anonymous(size, Protection::empty()).map_err(|e| os_err("reserve", e))?;

        debug!(region = name, base = ?base, size = format_args!("{size:#x}"), "reserved host region");
        Ok(Self {
            name: name.to_string(),
            base,
            size,
            backing,
            sub_regions: Vec::new(),
            committed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn sub_regions(&self) -> &[SubRegion] {
        &self.sub_regions
    }

    /// Carves a named sub-reservation at a fixed offset.
    ///
    /// Sub-regions are never freed individually; they live as long as the region.
    pub fn assign(&mut self, name: &'static str, offset: usize, size: usize) -> Result<SubRegion> {
        if size == 0 || !sys::is_page_aligned(offset) || !sys::is_page_aligned(size) {
            return Err(RegionError::Misaligned { name, offset, size });
        }
        let in_range = offset
            .checked_add(size)
            .is_some_and(|end| end <= self.size);
        if !in_range {
            return Err(RegionError::OutOfRange {
                name,
                offset,
                size,
                region_size: self.size,
            });
        }
        if self.sub_regions.iter().any(|r| r.name == name) {
            return Err(RegionError::Duplicate(name));
        }
        let sub = SubRegion { name, offset, size };
        if let Some(other) = self.sub_regions.iter().find(|r| r.overlaps(&sub)) {
            return Err(RegionError::Overlap {
                name,
                other: other.name,
            });
        }

        // Assigning into an already-committed window commits the new slice immediately.
        if self.committed {
            self.commit_sub_region(&sub)?;
        }
        self.sub_regions.push(sub);
        Ok(sub)
    }

    pub fn sub_region(&self, name: &str) -> Option<SubRegion> {
        self.sub_regions.iter().copied().find(|r| r.name == name)
    }

    /// Commits physical backing for every assigned sub-region. Unassigned gaps stay inaccessible.
    ///
    /// On failure everything committed so far is rolled back.
    pub fn commit_all(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        for idx in 0..self.sub_regions.len() {
            let sub = self.sub_regions[idx];
            if let Err(err) = self.commit_sub_region(&sub) {
                // Best effort: the window is left fully reserved again.
                let _ = self.reset_window();
                return Err(err);
            }
        }
        self.committed = true;
        debug!(region = %self.name, "committed host region");
        Ok(())
    }

    /// Drops all physical backing. The address range stays reserved and the next
    /// [`commit_all`](Self::commit_all) observes zero-filled memory.
    pub fn decommit_all(&mut self) -> Result<()> {
        if !self.committed {
            return Ok(());
        }
        self.reset_window()?;
        self.committed = false;
        debug!(region = %self.name, "decommitted host region");
        Ok(())
    }

    /// Host address of `offset` within the window.
    ///
    /// The pointer is only dereferenceable while the region is committed and `offset` lies inside
    /// an assigned sub-region.
    #[inline]
    pub fn host_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        self.base.as_ptr().wrapping_add(offset)
    }

    /// Returns the window offset of `ptr` if it points into this region.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        (addr >= base && addr < base + self.size).then(|| addr - base)
    }

    pub fn bytes(&self, sub: &SubRegion) -> Option<&[u8]> {
        self.check_sub(sub)?;
        // Safety: `sub` is assigned and committed, so the whole range is mapped read/write and
        // owned by this region.
        Some(unsafe { std::slice::from_raw_parts(self.host_ptr(sub.offset), sub.size) })
    }

    pub fn bytes_mut(&mut self, sub: &SubRegion) -> Option<&mut [u8]> {
        self.check_sub(sub)?;
        // Safety: as in `bytes`, and `&mut self` guarantees exclusivity for Rust references.
        Some(unsafe { std::slice::from_raw_parts_mut(self.host_ptr(sub.offset), sub.size) })
    }

    /// Maps `len` bytes of the backing starting at window offset `offset` at `dest`, which must
    /// lie inside a reservation owned by the caller.
    ///
    /// # Safety
    /// `dest..dest + len` must be page aligned, inside a caller-owned reservation, and not
    /// referenced by any live Rust reference.
    pub(crate) unsafe fn alias_into(
        &self,
        dest: NonNull<u8>,
        offset: usize,
        len: usize,
        prot: Protection,
    ) -> Result<()> {
        if !self.committed {
            return Err(RegionError::NotCommitted(self.name.clone()));
        }
        sys::map_shared_fixed(dest, len, prot, &self.backing, offset).map_err(|source| {
            RegionError::Os {
                op: "alias",
                region: self.name.clone(),
                source,
            }
        })
    }

    fn check_sub(&self, sub: &SubRegion) -> Option<()> {
        (self.committed && self.sub_regions.contains(sub)).then_some(())
    }

    fn commit_sub_region(&self, sub: &SubRegion) -> Result<()> {
        let addr = NonNull::new(self.host_ptr(sub.offset)).ok_or_else(|| RegionError::Os {
            op: "commit",
            region: self.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "null host address"),
        })?;
        // Safety: `sub` was validated to lie inside our reservation.
        unsafe {
            sys::map_shared_fixed(addr, sub.size, Protection::READ_WRITE, &self.backing, sub.offset)
        }
        .map_err(|source| RegionError::Os {
            op: "commit",
            region: self.name.clone(),
            source,
        })
    }

    fn reset_window(&self) -> Result<()> {
        let os_err = |op, source| RegionError::Os {
            op,
            region: self.name.clone(),
            source,
        };
        // Safety: the whole window is ours; callers hold `&mut self` (or are rolling back a
        // commit that never handed out references).
        unsafe { sys::reset_fixed(self.base, self.size) }.map_err(|e| os_err("decommit", e))?;
        sys::resize_backing(&self.backing, 0).map_err(|e| os_err("release backing of", e))?;
        sys::resize_backing(&self.backing, self.size).map_err(|e| os_err("resize backing of", e))
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // Safety: `base`/`size` is exactly the reservation created in `reserve`.
        if let Err(err) = unsafe { sys::unmap(self.base, self.size) } {
            tracing::warn!(region = %self.name, "failed to release host region: {err}");
        }
    }
}

impl std::fmt::Debug for ReservedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedRegion")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("sub_regions", &self.sub_regions)
            .field("committed", &self.committed)
            .finish()
    }
}
