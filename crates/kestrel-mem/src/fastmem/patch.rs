//! JIT code buffer and load/store site backpatching.
//!
//! Recompiled blocks emit guest loads and stores as a single host access through the fastmem
//! arena. Each such site is registered together with the address of an out-of-line slow path that
//! performs the same access through the VTLB. When an arena access faults on a page that can never
//! be aliased (device registers, unmapped holes), the site is rewritten in place into an x86-64
//! `jmp rel32` to its slow path, padded with `nop`s.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::error::{FastmemError, RegionError};
use crate::fault::AccessWidth;
use crate::sys::{self, Protection, PAGE_SIZE};

const JMP_REL32: u8 = 0xE9;
const NOP: u8 = 0x90;
const INT3: u8 = 0xCC;
/// Length of `jmp rel32`.
pub const MIN_SITE_LEN: usize = 5;

pub struct CodeBuffer {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    executable: bool,
}

// Safety: the buffer exclusively owns its mapping.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Result<Self, RegionError> {
        let capacity = sys::align_up(capacity.max(PAGE_SIZE));
        let base = sys::map_anonymous(capacity, Protection::READ_WRITE).map_err(|source| {
            RegionError::Os {
                op: "reserve",
                region: "code buffer".to_string(),
                source,
            }
        })?;
        let mut buffer = Self {
            base,
            capacity,
            used: 0,
            executable: false,
        };
        buffer.as_mut_slice().fill(INT3);
        Ok(buffer)
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base()
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.base() + self.used)
    }

    /// Appends `code` and returns its host address.
    pub fn emit(&mut self, code: &[u8]) -> Result<usize, FastmemError> {
        if self.capacity - self.used < code.len() {
            return Err(FastmemError::CodeBufferFull {
                capacity: self.capacity,
            });
        }
        let addr = self.base() + self.used;
        self.used += code.len();
        self.write_at(addr, code)?;
        Ok(addr)
    }

    /// Toggles between writable (RW) and executable (RX) protection.
    pub fn set_executable(&mut self, executable: bool) -> Result<(), FastmemError> {
        if self.executable == executable {
            return Ok(());
        }
        let prot = if executable {
            Protection::READ_EXEC
        } else {
            Protection::READ_WRITE
        };
        self.protect_range(self.base(), self.capacity, prot)?;
        self.executable = executable;
        Ok(())
    }

    /// Overwrites emitted code. An executable buffer is made writable for the duration of the
    /// write and restored afterwards.
    pub fn write_at(&mut self, addr: usize, code: &[u8]) -> Result<(), FastmemError> {
        if !self.contains(addr, code.len()) {
            return Err(FastmemError::OutsideCodeBuffer {
                code_addr: addr,
                len: code.len(),
            });
        }
        let page_start = addr & !(PAGE_SIZE - 1);
        let page_len = sys::align_up(addr + code.len()) - page_start;
        if self.executable {
            self.protect_range(page_start, page_len, Protection::READ_WRITE)?;
        }
        let offset = addr - self.base();
        self.as_mut_slice()[offset..offset + code.len()].copy_from_slice(code);
        if self.executable {
            self.protect_range(page_start, page_len, Protection::READ_EXEC)?;
        }
        Ok(())
    }

    pub fn read_at(&self, addr: usize, len: usize) -> Option<&[u8]> {
        self.contains(addr, len).then(|| {
            let offset = addr - self.base();
            &self.as_slice()[offset..offset + len]
        })
    }

    /// Discards all emitted code.
    pub fn clear(&mut self) -> Result<(), FastmemError> {
        self.set_executable(false)?;
        self.as_mut_slice().fill(INT3);
        self.used = 0;
        Ok(())
    }

    fn protect_range(&self, addr: usize, len: usize, prot: Protection) -> Result<(), FastmemError> {
        let ptr = NonNull::new(addr as *mut u8).ok_or(FastmemError::OutsideCodeBuffer {
            code_addr: addr,
            len,
        })?;
        // Safety: callers only pass page-aligned ranges inside our mapping.
        unsafe { sys::protect(ptr, len, prot) }.map_err(|source| {
            RegionError::Os {
                op: "protect",
                region: "code buffer".to_string(),
                source,
            }
            .into()
        })
    }

    fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is always readable (RW or RX).
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.capacity) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: only called while the buffer (or the touched pages) are writable.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.capacity) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // Safety: exactly the mapping created in `new`.
        if let Err(err) = unsafe { sys::unmap(self.base, self.capacity) } {
            tracing::warn!("failed to release code buffer: {err}");
        }
    }
}

impl std::fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("executable", &self.executable)
            .finish()
    }
}

/// A JIT-emitted guest load or store that goes through the fastmem arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStoreSite {
    pub code_addr: usize,
    pub code_len: usize,
    /// Out-of-line code performing the same access through the VTLB.
    pub slow_path: usize,
    pub width: AccessWidth,
    pub is_store: bool,
}

impl LoadStoreSite {
    fn end(&self) -> usize {
        self.code_addr + self.code_len
    }

    fn jump_displacement(&self) -> Option<i32> {
        let next = self.code_addr as i128 + MIN_SITE_LEN as i128;
        i32::try_from(self.slow_path as i128 - next).ok()
    }
}

#[derive(Debug, Default)]
pub struct Backpatcher {
    sites: BTreeMap<usize, LoadStoreSite>,
    patched: usize,
}

impl Backpatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_site(
        &mut self,
        buffer: &CodeBuffer,
        site: LoadStoreSite,
    ) -> Result<(), FastmemError> {
        if site.code_len < MIN_SITE_LEN {
            return Err(FastmemError::SiteTooShort {
                code_addr: site.code_addr,
                len: site.code_len,
                min: MIN_SITE_LEN,
            });
        }
        if !buffer.contains(site.code_addr, site.code_len) {
            return Err(FastmemError::OutsideCodeBuffer {
                code_addr: site.code_addr,
                len: site.code_len,
            });
        }
        if site.jump_displacement().is_none() {
            return Err(FastmemError::SlowPathOutOfRange {
                code_addr: site.code_addr,
                slow_path: site.slow_path,
            });
        }
        let overlaps_prev = self
            .sites
            .range(..=site.code_addr)
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > site.code_addr);
        let overlaps_next = self
            .sites
            .range(site.code_addr..)
            .next()
            .is_some_and(|(&start, _)| start < site.end());
        if overlaps_prev || overlaps_next {
            return Err(FastmemError::Overlap(site.code_addr));
        }
        self.sites.insert(site.code_addr, site);
        Ok(())
    }

    /// Site whose code range contains `addr`.
    pub fn site_for(&self, addr: usize) -> Option<&LoadStoreSite> {
        self.sites
            .range(..=addr)
            .next_back()
            .map(|(_, site)| site)
            .filter(|site| addr < site.end())
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn patched_count(&self) -> usize {
        self.patched
    }

    /// Rewrites the site starting at `code_addr` into a jump to its slow path. The site is
    /// unregistered afterwards; a faulting access can no longer originate from it.
    pub fn patch(
        &mut self,
        buffer: &mut CodeBuffer,
        code_addr: usize,
    ) -> Result<LoadStoreSite, FastmemError> {
        let site = *self
            .sites
            .get(&code_addr)
            .ok_or(FastmemError::UnknownSite(code_addr))?;
        let rel = site
            .jump_displacement()
            .ok_or(FastmemError::SlowPathOutOfRange {
                code_addr,
                slow_path: site.slow_path,
            })?;

        let mut code = vec![NOP; site.code_len];
        code[0] = JMP_REL32;
        code[1..MIN_SITE_LEN].copy_from_slice(&rel.to_le_bytes());
        buffer.write_at(code_addr, &code)?;

        if !Self::verify(buffer, &site) {
            return Err(FastmemError::PatchVerification(code_addr));
        }
        self.sites.remove(&code_addr);
        self.patched += 1;
        tracing::debug!(
            code_addr = format_args!("{code_addr:#x}"),
            slow_path = format_args!("{:#x}", site.slow_path),
            width = site.width.bits(),
            store = site.is_store,
            "backpatched fastmem site"
        );
        Ok(site)
    }

    /// Whether the code at `site` decodes to `jmp slow_path` followed by `nop` padding.
    pub fn verify(buffer: &CodeBuffer, site: &LoadStoreSite) -> bool {
        let Some(code) = buffer.read_at(site.code_addr, site.code_len) else {
            return false;
        };
        if code[0] != JMP_REL32 || code[MIN_SITE_LEN..].iter().any(|&b| b != NOP) {
            return false;
        }
        let mut rel = [0u8; 4];
        rel.copy_from_slice(&code[1..MIN_SITE_LEN]);
        let target = (site.code_addr as i128 + MIN_SITE_LEN as i128) + i32::from_le_bytes(rel) as i128;
        target == site.slow_path as i128
    }

    /// Forgets every site, e.g. after the code cache was flushed.
    pub fn clear(&mut self) {
        self.sites.clear();
    }
}
