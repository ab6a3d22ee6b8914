use std::sync::{Arc, Mutex};

use kestrel_mem::{
    AccessWidth, BusFault, MemoryHandler, MemoryLayout, MemoryManager, VTLB_PAGE_SIZE,
};
use proptest::prelude::*;

type Log = Arc<Mutex<Vec<(usize, AccessWidth, bool)>>>;

fn layout() -> MemoryLayout {
    MemoryLayout {
        ram_paddr: 0,
        ram_size: 0x4_0000,
        rom_paddr: 0x8_0000,
        rom_size: 0x1000,
        scratchpad_vaddr: 0x7000_0000,
        scratchpad_size: 0x1000,
        physical_size: 0x10_0000,
        mirrors: Vec::new(),
        code_cache_size: 0x1000,
    }
}

/// Records every access together with the tag it was registered under.
struct Tagged {
    tag: usize,
    log: Log,
}

impl Tagged {
    fn record(&self, width: AccessWidth, write: bool) {
        self.log.lock().unwrap().push((self.tag, width, write));
    }
}

impl MemoryHandler for Tagged {
    fn read8(&mut self, _paddr: u32) -> u8 {
        self.record(AccessWidth::Byte, false);
        0
    }
    fn read16(&mut self, _paddr: u32) -> u16 {
        self.record(AccessWidth::Half, false);
        0
    }
    fn read32(&mut self, _paddr: u32) -> u32 {
        self.record(AccessWidth::Word, false);
        0
    }
    fn read64(&mut self, _paddr: u32) -> u64 {
        self.record(AccessWidth::Double, false);
        0
    }
    fn read128(&mut self, _paddr: u32) -> u128 {
        self.record(AccessWidth::Quad, false);
        0
    }
    fn write8(&mut self, _paddr: u32, _value: u8) {
        self.record(AccessWidth::Byte, true);
    }
    fn write16(&mut self, _paddr: u32, _value: u16) {
        self.record(AccessWidth::Half, true);
    }
    fn write32(&mut self, _paddr: u32, _value: u32) {
        self.record(AccessWidth::Word, true);
    }
    fn write64(&mut self, _paddr: u32, _value: u64) {
        self.record(AccessWidth::Double, true);
    }
    fn write128(&mut self, _paddr: u32, _value: u128) {
        self.record(AccessWidth::Quad, true);
    }
}

fn access(
    mem: &mut MemoryManager,
    vaddr: u32,
    width: AccessWidth,
    write: bool,
) -> Result<(), BusFault> {
    match (width, write) {
        (AccessWidth::Byte, false) => mem.read8(vaddr).map(drop),
        (AccessWidth::Half, false) => mem.read16(vaddr).map(drop),
        (AccessWidth::Word, false) => mem.read32(vaddr).map(drop),
        (AccessWidth::Double, false) => mem.read64(vaddr).map(drop),
        (AccessWidth::Quad, false) => mem.read128(vaddr).map(drop),
        (AccessWidth::Byte, true) => mem.write8(vaddr, 0x11),
        (AccessWidth::Half, true) => mem.write16(vaddr, 0x2222),
        (AccessWidth::Word, true) => mem.write32(vaddr, 0x3333_3333),
        (AccessWidth::Double, true) => mem.write64(vaddr, 0x4444_4444_4444_4444),
        (AccessWidth::Quad, true) => mem.write128(vaddr, 0x5555),
    }
}

fn width() -> impl Strategy<Value = AccessWidth> {
    prop::sample::select(AccessWidth::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn direct_mappings_never_reach_a_handler(
        vpage in 0u32..0xF_0000,
        pages in 1u32..16,
        addr in any::<u32>(),
        width in width(),
        write in any::<bool>(),
    ) {
        let log = Log::default();
        let mut mem = MemoryManager::new(layout(), false).unwrap();
        let id = mem.register_handler("tagged", Box::new(Tagged { tag: 0, log: log.clone() }));
        mem.commit().unwrap();

        let vaddr = vpage * VTLB_PAGE_SIZE;
        let size = pages * VTLB_PAGE_SIZE;
        // Surround the mapping with device pages so a stray lookup would be observed.
        if vpage > 0 {
            mem.map_handler(vaddr - VTLB_PAGE_SIZE, id, VTLB_PAGE_SIZE);
        }
        mem.map_handler(vaddr + size, id, VTLB_PAGE_SIZE);
        mem.map_direct(vaddr, 0, size);

        let offset = (addr % size) & !(width.bytes() - 1);
        prop_assert_eq!(access(&mut mem, vaddr + offset, width, write), Ok(()));
        prop_assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn every_entry_point_reaches_only_its_handler(count in 2usize..8, target in any::<prop::sample::Index>()) {
        let log = Log::default();
        let mut mem = MemoryManager::new(layout(), false).unwrap();
        let ids: Vec<_> = (0..count)
            .map(|tag| mem.register_handler("tagged", Box::new(Tagged { tag, log: log.clone() })))
            .collect();
        mem.commit().unwrap();
        for (tag, id) in ids.iter().enumerate() {
            mem.map_handler(0xB000_0000 + tag as u32 * VTLB_PAGE_SIZE, *id, VTLB_PAGE_SIZE);
        }

        let tag = target.index(count);
        let vaddr = 0xB000_0000 + tag as u32 * VTLB_PAGE_SIZE;
        for width in AccessWidth::ALL {
            for write in [false, true] {
                log.lock().unwrap().clear();
                prop_assert_eq!(access(&mut mem, vaddr, width, write), Ok(()));
                let logged = log.lock().unwrap();
                prop_assert_eq!(logged.as_slice(), &[(tag, width, write)]);
                drop(logged);
            }
        }
    }

    #[test]
    fn unmapped_accesses_are_guest_faults(vaddr in any::<u32>(), width in width(), write in any::<bool>()) {
        let mut mem = MemoryManager::new(layout(), false).unwrap();
        mem.commit().unwrap();
        mem.unmap(0x7000_0000, VTLB_PAGE_SIZE);

        let result = access(&mut mem, vaddr, width, write);
        let expected = if vaddr % width.bytes() != 0 {
            BusFault::Misaligned { vaddr, width, write }
        } else {
            BusFault::Unmapped { vaddr, width, write }
        };
        prop_assert_eq!(result, Err(expected));
    }
}

#[test]
fn mapped_buffer_is_backed_by_the_scratchpad() {
    let mut mem = MemoryManager::new(layout(), false).unwrap();
    mem.commit().unwrap();
    mem.map_buffer(0x1000_0000, "scratchpad", 0, VTLB_PAGE_SIZE);

    mem.write64(0x1000_0008, 0x0102_0304_0506_0708).unwrap();
    assert_eq!(mem.read64(0x7000_0008), Ok(0x0102_0304_0506_0708));
    assert_eq!(mem.scratchpad().unwrap()[8], 0x08);
}
