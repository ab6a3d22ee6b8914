//! Guest physical address map.
//!
//! A flat table with one entry per 4 KiB physical page, tagging it as RAM, ROM or a device
//! handler. Pages are assigned during bring-up and only remapped explicitly (e.g. hot-swappable
//! media windows).

use crate::fatal;
use crate::handler::HandlerId;
use crate::vtlb::{VTLB_PAGE_MASK, VTLB_PAGE_SIZE};

/// Backing of one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhysicalPage {
    #[default]
    Unmapped,
    /// Guest RAM at `offset` bytes into the reserved host region.
    Ram { offset: usize },
    /// Guest ROM at `offset` bytes into the reserved host region. Guest writes are dropped.
    Rom { offset: usize },
    /// Memory-mapped device.
    Handler(HandlerId),
}

#[derive(Debug, Clone)]
pub struct PhysicalMap {
    pages: Box<[PhysicalPage]>,
    size: u32,
}

impl PhysicalMap {
    /// Creates an empty map covering `[0, size)`. `size` must be page aligned.
    pub fn new(size: u32) -> Self {
        if size & VTLB_PAGE_MASK != 0 {
            fatal!("physical address space size {size:#x} is not page aligned");
        }
        let pages = (size / VTLB_PAGE_SIZE) as usize;
        Self {
            pages: vec![PhysicalPage::Unmapped; pages].into_boxed_slice(),
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn map_ram(&mut self, paddr: u32, host_offset: usize, size: u32) {
        self.fill(paddr, size, |page| PhysicalPage::Ram {
            offset: host_offset + page as usize * VTLB_PAGE_SIZE as usize,
        });
    }

    pub fn map_rom(&mut self, paddr: u32, host_offset: usize, size: u32) {
        self.fill(paddr, size, |page| PhysicalPage::Rom {
            offset: host_offset + page as usize * VTLB_PAGE_SIZE as usize,
        });
    }

    pub fn map_handler(&mut self, paddr: u32, id: HandlerId, size: u32) {
        self.fill(paddr, size, |_| PhysicalPage::Handler(id));
    }

    pub fn unmap(&mut self, paddr: u32, size: u32) {
        self.fill(paddr, size, |_| PhysicalPage::Unmapped);
    }

    /// Returns the backing of the page containing `paddr`. Addresses past the end of the map are
    /// unmapped.
    #[inline]
    pub fn page(&self, paddr: u32) -> PhysicalPage {
        self.pages
            .get((paddr / VTLB_PAGE_SIZE) as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.pages.fill(PhysicalPage::Unmapped);
    }

    fn fill(&mut self, paddr: u32, size: u32, mut backing: impl FnMut(u32) -> PhysicalPage) {
        if paddr & VTLB_PAGE_MASK != 0 || size & VTLB_PAGE_MASK != 0 || size == 0 {
            fatal!("misaligned physical mapping: paddr={paddr:#010x} size={size:#x}");
        }
        let end = u64::from(paddr) + u64::from(size);
        if end > u64::from(self.size) {
            fatal!(
                "physical mapping {paddr:#010x}+{size:#x} exceeds physical space {:#x}",
                self.size
            );
        }
        let first = (paddr / VTLB_PAGE_SIZE) as usize;
        let count = size / VTLB_PAGE_SIZE;
        for page in 0..count {
            self.pages[first + page as usize] = backing(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_pages_carry_consecutive_host_offsets() {
        let mut map = PhysicalMap::new(0x10_0000);
        map.map_ram(0x2000, 0x8000, 0x3000);
        assert_eq!(map.page(0x2000), PhysicalPage::Ram { offset: 0x8000 });
        assert_eq!(map.page(0x3FFF), PhysicalPage::Ram { offset: 0x9000 });
        assert_eq!(map.page(0x4010), PhysicalPage::Ram { offset: 0xA000 });
        assert_eq!(map.page(0x5000), PhysicalPage::Unmapped);
    }

    #[test]
    fn remap_replaces_previous_backing() {
        let mut map = PhysicalMap::new(0x10_0000);
        map.map_rom(0, 0, 0x1000);
        map.map_handler(0, HandlerId::new(3), 0x1000);
        assert_eq!(map.page(0x10), PhysicalPage::Handler(HandlerId::new(3)));
        map.unmap(0, 0x1000);
        assert_eq!(map.page(0x10), PhysicalPage::Unmapped);
    }

    #[test]
    fn addresses_beyond_the_map_are_unmapped() {
        let map = PhysicalMap::new(0x1000);
        assert_eq!(map.page(0xFFFF_F000), PhysicalPage::Unmapped);
    }

    #[test]
    #[should_panic(expected = "misaligned physical mapping")]
    fn misaligned_mapping_is_fatal() {
        let mut map = PhysicalMap::new(0x10_0000);
        map.map_ram(0x800, 0, 0x1000);
    }
}
