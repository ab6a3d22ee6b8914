//! The guest memory system: one reserved host window, the physical map, the VTLB, the handler
//! registry and (optionally) the fastmem arena, wired together.

use std::ptr::NonNull;

use tracing::{debug, info};

use crate::error::{FastmemError, RegionError, Result};
use crate::fastmem::patch::{Backpatcher, CodeBuffer, LoadStoreSite};
use crate::fastmem::FastmemArena;
use crate::fatal;
use crate::fault::BusFault;
use crate::handler::{HandlerId, HandlerRegistry, MemoryHandler};
use crate::phys::{PhysicalMap, PhysicalPage};
use crate::region::{ReservedRegion, SubRegion};
use crate::vtlb::{self, Vtlb, VtlbEntry, VTLB_PAGE_MASK, VTLB_PAGE_SIZE};

/// Fixed placement of guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub ram_paddr: u32,
    pub ram_size: u32,
    pub rom_paddr: u32,
    pub rom_size: u32,
    /// Processor-local memory with no physical address, mapped by virtual address only.
    pub scratchpad_vaddr: u32,
    pub scratchpad_size: u32,
    /// Size of the guest physical address space.
    pub physical_size: u32,
    /// Virtual bases at which the whole physical space is mirrored by the standard layout.
    pub mirrors: Vec<u32>,
    pub code_cache_size: usize,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            ram_paddr: 0,
            ram_size: 32 << 20,
            rom_paddr: 0x1FC0_0000,
            rom_size: 4 << 20,
            scratchpad_vaddr: 0x7000_0000,
            scratchpad_size: 16 << 10,
            physical_size: 0x2000_0000,
            mirrors: vec![0x0000_0000, 0x8000_0000, 0xA000_0000],
            code_cache_size: 16 << 20,
        }
    }
}

impl MemoryLayout {
    fn window_size(&self) -> usize {
        self.ram_size as usize + self.rom_size as usize + self.scratchpad_size as usize
    }
}

/// How a fastmem fault was resolved. In both cases the faulting instruction can be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page was aliased into the arena; the access now succeeds on the fast path.
    PageCommitted { vaddr: u32 },
    /// The site at `code_addr` now jumps to its slow path.
    Backpatched { code_addr: usize },
}

struct Fastmem {
    arena: FastmemArena,
    code: CodeBuffer,
    patcher: Backpatcher,
}

pub struct MemoryManager {
    layout: MemoryLayout,
    region: ReservedRegion,
    ram: SubRegion,
    rom: SubRegion,
    scratchpad: SubRegion,
    phys: PhysicalMap,
    vtlb: Vtlb,
    handlers: HandlerRegistry,
    fastmem: Option<Fastmem>,
    rom_image: Vec<u8>,
}

macro_rules! accessors {
    ($($read:ident, $write:ident: $ty:ty;)*) => {
        $(
            #[inline]
            pub fn $read(&mut self, vaddr: u32) -> std::result::Result<$ty, BusFault> {
                self.vtlb.read::<$ty>(&mut self.handlers, vaddr)
            }

            #[inline]
            pub fn $write(&mut self, vaddr: u32, value: $ty) -> std::result::Result<(), BusFault> {
                self.vtlb.write::<$ty>(&mut self.handlers, vaddr, value)
            }
        )*
    };
}

impl MemoryManager {
    /// Reserves (but does not commit) host memory for `layout`.
    pub fn new(layout: MemoryLayout, enable_fastmem: bool) -> Result<Self> {
        let mut region = ReservedRegion::reserve("kestrel-guest", layout.window_size())?;
        let ram = region.assign("ram", 0, layout.ram_size as usize)?;
        let rom = region.assign("rom", ram.end(), layout.rom_size as usize)?;
        let scratchpad = region.assign("scratchpad", rom.end(), layout.scratchpad_size as usize)?;

        let mut phys = PhysicalMap::new(layout.physical_size);
        phys.map_ram(layout.ram_paddr, ram.offset(), layout.ram_size);
        phys.map_rom(layout.rom_paddr, rom.offset(), layout.rom_size);

        let fastmem = if enable_fastmem {
            Some(Fastmem {
                arena: FastmemArena::reserve()?,
                code: CodeBuffer::new(layout.code_cache_size)?,
                patcher: Backpatcher::new(),
            })
        } else {
            None
        };

        debug!(
            ram = format_args!("{:#x}", layout.ram_size),
            rom = format_args!("{:#x}", layout.rom_size),
            fastmem = enable_fastmem,
            "created memory manager"
        );
        Ok(Self {
            layout,
            region,
            ram,
            rom,
            scratchpad,
            phys,
            vtlb: Vtlb::new(),
            handlers: HandlerRegistry::new(),
            fastmem,
            rom_image: Vec::new(),
        })
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn is_committed(&self) -> bool {
        self.region.is_committed()
    }

    /// Commits the host window, copies the firmware image into ROM and installs the standard
    /// virtual layout.
    pub fn commit(&mut self) -> Result<()> {
        if self.region.is_committed() {
            return Ok(());
        }
        self.region.commit_all()?;
        self.copy_rom_image();
        self.install_default_layout();
        info!("guest memory committed");
        Ok(())
    }

    /// Drops all translations and physical backing. The reservation (and therefore every host
    /// address) is kept for the next [`commit`](Self::commit).
    pub fn decommit(&mut self) -> Result<()> {
        if !self.region.is_committed() {
            return Ok(());
        }
        if let Some(fm) = self.fastmem.as_mut() {
            fm.arena.unmap_all()?;
        }
        self.vtlb.clear();
        self.region.decommit_all()?;
        info!("guest memory decommitted");
        Ok(())
    }

    /// Zeroes RAM and scratchpad, reloads ROM and reinstalls the standard layout. Handler
    /// registrations and physical device mappings survive.
    pub fn reset(&mut self) -> Result<()> {
        self.decommit()?;
        self.commit()
    }

    /// Rebuilds the virtual table: every mirror maps the physical space, and the scratchpad is
    /// mapped at its fixed virtual address.
    pub fn install_default_layout(&mut self) {
        self.require_committed("install the default layout");
        self.vtlb.clear();
        if let Some(fm) = self.fastmem.as_mut() {
            if let Err(err) = fm.arena.unmap_all() {
                fatal!("failed to reset fastmem arena: {err}");
            }
        }
        for base in self.layout.mirrors.clone() {
            self.map_physical(base, 0, self.layout.physical_size);
        }
        self.map_buffer(
            self.layout.scratchpad_vaddr,
            "scratchpad",
            0,
            self.layout.scratchpad_size,
        );
        debug!(mirrors = self.layout.mirrors.len(), "installed default virtual layout");
    }

    /// Maps guest virtual `[vaddr, vaddr + size)` directly onto the RAM/ROM backing physical
    /// `[paddr, paddr + size)`. Mapping over anything but RAM or ROM is fatal.
    pub fn map_direct(&mut self, vaddr: u32, paddr: u32, size: u32) {
        vtlb::check_range(vaddr, size);
        if paddr & VTLB_PAGE_MASK != 0 {
            fatal!("misaligned direct mapping: paddr={paddr:#010x}");
        }
        self.require_committed("map_direct");
        for page in 0..size / VTLB_PAGE_SIZE {
            let page_paddr = paddr.wrapping_add(page * VTLB_PAGE_SIZE);
            let entry = match self.phys.page(page_paddr) {
                PhysicalPage::Ram { offset } => self.direct_entry(vaddr, page, offset, true),
                PhysicalPage::Rom { offset } => self.direct_entry(vaddr, page, offset, false),
                other => fatal!("direct mapping onto {other:?} at paddr={page_paddr:#010x}"),
            };
            self.vtlb.set_page(vaddr + page * VTLB_PAGE_SIZE, entry);
        }
        self.evict(vaddr, size);
    }

    /// Maps guest virtual `[vaddr, vaddr + size)` onto physical `[paddr, paddr + size)`, following
    /// whatever the physical map holds for each page (RAM, ROM, device or hole).
    pub fn map_physical(&mut self, vaddr: u32, paddr: u32, size: u32) {
        vtlb::check_range(vaddr, size);
        if paddr & VTLB_PAGE_MASK != 0 {
            fatal!("misaligned physical mapping: paddr={paddr:#010x}");
        }
        self.require_committed("map_physical");
        for page in 0..size / VTLB_PAGE_SIZE {
            let page_paddr = paddr.wrapping_add(page * VTLB_PAGE_SIZE);
            let entry = match self.phys.page(page_paddr) {
                PhysicalPage::Ram { offset } => self.direct_entry(vaddr, page, offset, true),
                PhysicalPage::Rom { offset } => self.direct_entry(vaddr, page, offset, false),
                PhysicalPage::Handler(id) => VtlbEntry::Handler {
                    id,
                    paddr: page_paddr,
                },
                PhysicalPage::Unmapped => VtlbEntry::Unmapped,
            };
            self.vtlb.set_page(vaddr + page * VTLB_PAGE_SIZE, entry);
        }
        self.evict(vaddr, size);
    }

    /// Routes guest virtual `[vaddr, vaddr + size)` to handler `id`. The handler observes the
    /// virtual address of each access.
    pub fn map_handler(&mut self, vaddr: u32, id: HandlerId, size: u32) {
        if !self.handlers.is_registered(id) {
            fatal!("mapping unregistered memory handler {id} at {vaddr:#010x}");
        }
        self.vtlb.map_handler(vaddr, id, vaddr, size);
        self.evict(vaddr, size);
    }

    /// Maps `size` bytes of the named sub-region starting at `offset` into the virtual table. Used
    /// for memory that has no physical address, such as the scratchpad.
    pub fn map_buffer(&mut self, vaddr: u32, sub_region: &str, offset: usize, size: u32) {
        let Some(sub) = self.region.sub_region(sub_region) else {
            fatal!("mapping unknown sub-region `{sub_region}`");
        };
        if offset & VTLB_PAGE_MASK as usize != 0 {
            fatal!("misaligned buffer mapping: `{sub_region}` offset={offset:#x}");
        }
        if offset + size as usize > sub.size() {
            fatal!(
                "buffer mapping {offset:#x}+{size:#x} exceeds sub-region `{sub_region}` ({:#x})",
                sub.size()
            );
        }
        self.require_committed("map_buffer");
        let host = self.region.host_ptr(sub.offset() + offset);
        // Safety: the range lies inside a committed sub-region of our window; `decommit` clears
        // the table before the backing goes away.
        unsafe { self.vtlb.map_host(vaddr, host, size, true) };
        self.evict(vaddr, size);
    }

    pub fn unmap(&mut self, vaddr: u32, size: u32) {
        self.vtlb.unmap(vaddr, size);
        self.evict(vaddr, size);
    }

    pub fn register_handler(&mut self, name: &'static str, handler: Box<dyn MemoryHandler>) -> HandlerId {
        self.handlers.register(name, handler)
    }

    pub fn reassign_handler(&mut self, id: HandlerId, handler: Box<dyn MemoryHandler>) {
        self.handlers.reassign(id, handler);
    }

    pub fn handler_name(&self, id: HandlerId) -> Option<&'static str> {
        self.handlers.name(id)
    }

    /// Marks physical `[paddr, paddr + size)` as belonging to handler `id`. Virtual mirrors pick
    /// this up on the next [`map_physical`](Self::map_physical) or layout install.
    pub fn map_physical_handler(&mut self, paddr: u32, id: HandlerId, size: u32) {
        if !self.handlers.is_registered(id) {
            fatal!("mapping unregistered memory handler {id} at paddr={paddr:#010x}");
        }
        self.phys.map_handler(paddr, id, size);
    }

    pub fn physical_map(&self) -> &PhysicalMap {
        &self.phys
    }

    pub fn vtlb(&self) -> &Vtlb {
        &self.vtlb
    }

    accessors! {
        read8, write8: u8;
        read16, write16: u16;
        read32, write32: u32;
        read64, write64: u64;
        read128, write128: u128;
    }

    /// Sets the firmware image copied into ROM on every commit. Shorter images are zero padded.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<()> {
        if image.len() > self.rom.size() {
            return Err(RegionError::RomTooLarge {
                len: image.len(),
                capacity: self.rom.size(),
            });
        }
        self.rom_image = image.to_vec();
        if self.region.is_committed() {
            self.copy_rom_image();
        }
        Ok(())
    }

    pub fn ram(&self) -> Option<&[u8]> {
        self.region.bytes(&self.ram)
    }

    pub fn ram_mut(&mut self) -> Option<&mut [u8]> {
        self.region.bytes_mut(&self.ram)
    }

    pub fn rom(&self) -> Option<&[u8]> {
        self.region.bytes(&self.rom)
    }

    pub fn scratchpad(&self) -> Option<&[u8]> {
        self.region.bytes(&self.scratchpad)
    }

    pub fn scratchpad_mut(&mut self) -> Option<&mut [u8]> {
        self.region.bytes_mut(&self.scratchpad)
    }

    pub fn fastmem_enabled(&self) -> bool {
        self.fastmem.is_some()
    }

    /// Host address of guest virtual address 0 in the fastmem arena.
    pub fn fastmem_base(&self) -> Option<NonNull<u8>> {
        self.fastmem.as_ref().map(|fm| fm.arena.base())
    }

    pub fn fastmem_mapped_pages(&self) -> usize {
        self.fastmem.as_ref().map_or(0, |fm| fm.arena.mapped_pages())
    }

    pub fn emit_code(&mut self, code: &[u8]) -> std::result::Result<usize, FastmemError> {
        self.fastmem_mut()?.code.emit(code)
    }

    pub fn code_buffer(&self) -> Option<&CodeBuffer> {
        self.fastmem.as_ref().map(|fm| &fm.code)
    }

    pub fn register_fastmem_site(&mut self, site: LoadStoreSite) -> std::result::Result<(), FastmemError> {
        let fm = self.fastmem_mut()?;
        fm.patcher.register_site(&fm.code, site)
    }

    /// Discards all emitted code and load/store records.
    pub fn clear_code_cache(&mut self) -> std::result::Result<(), FastmemError> {
        let fm = self.fastmem_mut()?;
        fm.code.clear()?;
        fm.patcher.clear();
        debug!("cleared JIT code cache");
        Ok(())
    }

    /// Resolves a host access fault raised by JIT code at `code_addr` touching `fault_addr`.
    ///
    /// Pages backed by RAM, ROM (loads only) or a mapped buffer are aliased into the arena; any
    /// other access from that site is permanently redirected to its slow path. A fault that does
    /// not fall inside the arena, or whose code address matches no registered site, is fatal.
    pub fn handle_fastmem_fault(
        &mut self,
        fault_addr: usize,
        code_addr: usize,
    ) -> std::result::Result<FaultResolution, FastmemError> {
        let Some(fm) = self.fastmem.as_mut() else {
            return Err(FastmemError::Disabled);
        };
        let Some(vaddr) = fm.arena.guest_address(fault_addr) else {
            fatal!("fastmem fault at {fault_addr:#x} lies outside the arena (code {code_addr:#x})");
        };
        let Some(site) = fm.patcher.site_for(code_addr).copied() else {
            fatal!("fastmem fault at {fault_addr:#x} from unknown code address {code_addr:#x}");
        };

        let page_vaddr = vaddr & !VTLB_PAGE_MASK;
        let alias = match self.vtlb.entry(vaddr) {
            VtlbEntry::Direct { writable, .. } if writable || !site.is_store => self
                .vtlb
                .entry(vaddr)
                .host_ptr(page_vaddr)
                .and_then(|host| self.region.offset_of(host))
                .filter(|_| !fm.arena.is_mapped(vaddr))
                .map(|offset| (offset, writable)),
            _ => None,
        };

        match alias {
            Some((offset, writable)) => {
                fm.arena.map_page(page_vaddr, &self.region, offset, writable)?;
                tracing::trace!(vaddr = format_args!("{page_vaddr:#010x}"), "fastmem page committed");
                Ok(FaultResolution::PageCommitted { vaddr: page_vaddr })
            }
            None => {
                let site = fm.patcher.patch(&mut fm.code, site.code_addr)?;
                Ok(FaultResolution::Backpatched {
                    code_addr: site.code_addr,
                })
            }
        }
    }

    fn fastmem_mut(&mut self) -> std::result::Result<&mut Fastmem, FastmemError> {
        self.fastmem.as_mut().ok_or(FastmemError::Disabled)
    }

    fn direct_entry(&self, vaddr: u32, page: u32, offset: usize, writable: bool) -> VtlbEntry {
        let host = self.region.host_ptr(offset) as isize;
        let page_vaddr = vaddr.wrapping_add(page * VTLB_PAGE_SIZE) as isize;
        VtlbEntry::Direct {
            delta: host.wrapping_sub(page_vaddr),
            writable,
        }
    }

    fn evict(&mut self, vaddr: u32, size: u32) {
        if let Some(fm) = self.fastmem.as_mut() {
            if let Err(err) = fm.arena.unmap_range(vaddr, size) {
                fatal!("failed to evict fastmem pages at {vaddr:#010x}: {err}");
            }
        }
    }

    fn require_committed(&self, op: &str) {
        if !self.region.is_committed() {
            fatal!("{op} while guest memory is not committed");
        }
    }

    fn copy_rom_image(&mut self) {
        let image = std::mem::take(&mut self.rom_image);
        if let Some(rom) = self.region.bytes_mut(&self.rom) {
            rom[..image.len()].copy_from_slice(&image);
            rom[image.len()..].fill(0);
        }
        self.rom_image = image;
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("layout", &self.layout)
            .field("region", &self.region)
            .field("handlers", &self.handlers)
            .field("fastmem", &self.fastmem_enabled())
            .finish()
    }
}
