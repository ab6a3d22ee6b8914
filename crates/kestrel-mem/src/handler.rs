//! Memory-mapped device handler registry.

use std::fmt;

use crate::fatal;

/// Maximum number of handler slots.
pub const MAX_HANDLERS: usize = 128;

/// Index of a registered [`MemoryHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u8);

impl HandlerId {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read/write entry points of a memory-mapped device, one per access width.
///
/// `paddr` is the guest physical address of the access (for handler pages installed with a
/// virtual-only mapping it is the guest virtual address). Reads take `&mut self` because device
/// registers commonly have read side effects.
///
/// 64- and 128-bit accesses default to little-endian pairs of the next narrower width; devices
/// with native wide registers override them.
pub trait MemoryHandler: Send {
    fn read8(&mut self, paddr: u32) -> u8;
    fn read16(&mut self, paddr: u32) -> u16;
    fn read32(&mut self, paddr: u32) -> u32;

    fn read64(&mut self, paddr: u32) -> u64 {
        let lo = self.read32(paddr);
        let hi = self.read32(paddr.wrapping_add(4));
        u64::from(lo) | (u64::from(hi) << 32)
    }

    fn read128(&mut self, paddr: u32) -> u128 {
        let lo = self.read64(paddr);
        let hi = self.read64(paddr.wrapping_add(8));
        u128::from(lo) | (u128::from(hi) << 64)
    }

    fn write8(&mut self, paddr: u32, value: u8);
    fn write16(&mut self, paddr: u32, value: u16);
    fn write32(&mut self, paddr: u32, value: u32);

    fn write64(&mut self, paddr: u32, value: u64) {
        self.write32(paddr, value as u32);
        self.write32(paddr.wrapping_add(4), (value >> 32) as u32);
    }

    fn write128(&mut self, paddr: u32, value: u128) {
        self.write64(paddr, value as u64);
        self.write64(paddr.wrapping_add(8), (value >> 64) as u64);
    }
}

struct HandlerRecord {
    name: &'static str,
    handler: Box<dyn MemoryHandler>,
}

/// Fixed-size table of device handlers.
///
/// The registry is fully populated during device bring-up. Dispatching to an id that was never
/// registered is an engine defect and aborts.
pub struct HandlerRegistry {
    slots: Vec<Option<HandlerRecord>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_HANDLERS);
        slots.resize_with(MAX_HANDLERS, || None);
        Self { slots }
    }

    /// Registers `handler` in the first free slot.
    pub fn register(&mut self, name: &'static str, handler: Box<dyn MemoryHandler>) -> HandlerId {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            fatal!("handler registry full ({MAX_HANDLERS} slots) registering `{name}`");
        };
        self.slots[index] = Some(HandlerRecord { name, handler });
        tracing::debug!(handler = name, id = index, "registered memory handler");
        HandlerId(index as u8)
    }

    /// Replaces the handler behind an existing id. Translation entries referring to `id` pick up
    /// the new handler without being remapped.
    pub fn reassign(&mut self, id: HandlerId, handler: Box<dyn MemoryHandler>) {
        match self.slots.get_mut(id.index()) {
            Some(Some(record)) => {
                tracing::debug!(handler = record.name, id = id.index(), "reassigned memory handler");
                record.handler = handler;
            }
            _ => fatal!("reassigning unregistered memory handler {id}"),
        }
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    pub fn name(&self, id: HandlerId) -> Option<&'static str> {
        self.slots.get(id.index())?.as_ref().map(|r| r.name)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registration.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    #[inline]
    pub fn get_mut(&mut self, id: HandlerId) -> &mut dyn MemoryHandler {
        match self.slots.get_mut(id.index()) {
            Some(Some(record)) => record.handler.as_mut(),
            _ => fatal!("dispatch to unregistered memory handler {id}"),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.slots
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, slot)| slot.as_ref().map(|r| (idx, r.name))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(u32);

    impl MemoryHandler for Constant {
        fn read8(&mut self, _paddr: u32) -> u8 {
            self.0 as u8
        }
        fn read16(&mut self, _paddr: u32) -> u16 {
            self.0 as u16
        }
        fn read32(&mut self, _paddr: u32) -> u32 {
            self.0
        }
        fn write8(&mut self, _paddr: u32, value: u8) {
            self.0 = value.into();
        }
        fn write16(&mut self, _paddr: u32, value: u16) {
            self.0 = value.into();
        }
        fn write32(&mut self, _paddr: u32, value: u32) {
            self.0 = value;
        }
    }

    #[test]
    fn wide_accesses_default_to_little_endian_pairs() {
        let mut handler = Constant(0x1122_3344);
        assert_eq!(handler.read64(0), 0x1122_3344_1122_3344);
        assert_eq!(
            handler.read128(0),
            0x1122_3344_1122_3344_1122_3344_1122_3344
        );
        handler.write64(0, 0xAAAA_BBBB_CCCC_DDDD);
        // The high half is written last.
        assert_eq!(handler.read32(0), 0xAAAA_BBBB);
    }

    #[test]
    fn register_and_reassign() {
        let mut registry = HandlerRegistry::new();
        let a = registry.register("a", Box::new(Constant(1)));
        let b = registry.register("b", Box::new(Constant(2)));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(b).read32(0), 2);

        registry.reassign(b, Box::new(Constant(9)));
        assert_eq!(registry.get_mut(b).read32(0), 9);
        assert_eq!(registry.name(b), Some("b"));
    }

    #[test]
    #[should_panic(expected = "unregistered memory handler 5")]
    fn dispatch_to_unregistered_handler_is_fatal() {
        let mut registry = HandlerRegistry::new();
        registry.get_mut(HandlerId::new(5));
    }

    #[test]
    #[should_panic(expected = "handler registry full")]
    fn registering_past_capacity_is_fatal() {
        let mut registry = HandlerRegistry::new();
        for _ in 0..=MAX_HANDLERS {
            registry.register("dev", Box::new(Constant(0)));
        }
    }
}
