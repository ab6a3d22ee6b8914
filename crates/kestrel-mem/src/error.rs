use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegionError>;

/// Errors from reserving, carving or (de)committing host memory regions.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to {op} region `{region}`: {source}")]
    Os {
        op: &'static str,
        region: String,
        #[source]
        source: io::Error,
    },

    #[error("sub-region `{name}` is not page aligned (offset={offset:#x} size={size:#x})")]
    Misaligned {
        name: &'static str,
        offset: usize,
        size: usize,
    },

    #[error("sub-region `{name}` (offset={offset:#x} size={size:#x}) exceeds region size {region_size:#x}")]
    OutOfRange {
        name: &'static str,
        offset: usize,
        size: usize,
        region_size: usize,
    },

    #[error("sub-region `{name}` overlaps `{other}`")]
    Overlap {
        name: &'static str,
        other: &'static str,
    },

    #[error("sub-region `{0}` is already assigned")]
    Duplicate(&'static str),

    #[error("region `{0}` is not committed")]
    NotCommitted(String),

    #[error("firmware image is {len} bytes but the ROM window holds {capacity}")]
    RomTooLarge { len: usize, capacity: usize },
}

/// Errors from fastmem site registration and code patching.
///
/// An access fault that cannot be correlated with a registered site is not represented here:
/// that indicates a corrupted code cache and is handled as a fatal engine error.
#[derive(Debug, Error)]
pub enum FastmemError {
    #[error("fastmem is not enabled for this memory manager")]
    Disabled,

    #[error("site at {code_addr:#x} is {len} bytes; a backpatch needs at least {min}")]
    SiteTooShort { code_addr: usize, len: usize, min: usize },

    #[error("slow path {slow_path:#x} is out of rel32 range of site {code_addr:#x}")]
    SlowPathOutOfRange { code_addr: usize, slow_path: usize },

    #[error("no fastmem site is registered at {0:#x}")]
    UnknownSite(usize),

    #[error("site at {0:#x} overlaps an already registered site")]
    Overlap(usize),

    #[error("site at {code_addr:#x} (len {len}) lies outside the code buffer")]
    OutsideCodeBuffer { code_addr: usize, len: usize },

    #[error("code buffer is full ({capacity} bytes)")]
    CodeBufferFull { capacity: usize },

    #[error("patched site at {0:#x} does not decode to a jump to its slow path")]
    PatchVerification(usize),

    #[error(transparent)]
    Region(#[from] RegionError),
}
