use thiserror::Error;

/// Width of a single guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessWidth {
    Byte = 1,
    Half = 2,
    Word = 4,
    Double = 8,
    Quad = 16,
}

impl AccessWidth {
    pub const ALL: [AccessWidth; 5] = [
        AccessWidth::Byte,
        AccessWidth::Half,
        AccessWidth::Word,
        AccessWidth::Double,
        AccessWidth::Quad,
    ];

    #[inline]
    pub const fn bytes(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

/// A guest-visible memory fault.
///
/// These are reported to the CPU core, which turns them into guest bus/address errors. They are
/// never host crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("bus error: {}-bit {} at unmapped address {vaddr:#010x}", .width.bits(), direction(.write))]
    Unmapped {
        vaddr: u32,
        width: AccessWidth,
        write: bool,
    },

    #[error("address error: {}-bit {} at misaligned address {vaddr:#010x}", .width.bits(), direction(.write))]
    Misaligned {
        vaddr: u32,
        width: AccessWidth,
        write: bool,
    },
}

fn direction(write: &bool) -> &'static str {
    if *write {
        "write"
    } else {
        "read"
    }
}

impl BusFault {
    pub fn vaddr(&self) -> u32 {
        match *self {
            BusFault::Unmapped { vaddr, .. } | BusFault::Misaligned { vaddr, .. } => vaddr,
        }
    }
}

/// Logs an engine invariant violation and aborts the current thread.
///
/// Used for translation-table and handler-registry defects (misaligned maps, unregistered
/// handlers, uncorrelated fastmem faults). These are core bugs, not recoverable conditions.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = ::std::format!($($arg)*);
        $crate::__tracing::error!(target: "kestrel::fatal", "{message}");
        ::std::panic!("fatal engine error: {message}");
    }};
}
