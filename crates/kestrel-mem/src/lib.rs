//! Guest memory virtualization.
//!
//! Guest accesses resolve through a per-page virtual translation table ([`Vtlb`]) either to host
//! memory carved out of one up-front reservation ([`ReservedRegion`]) or to a memory-mapped device
//! ([`MemoryHandler`]). JIT code can bypass the table entirely through the fastmem arena; faults
//! raised there are resolved by [`MemoryManager::handle_fastmem_fault`].
//!
//! The host backing relies on Linux `memfd_create`.

mod error;
pub mod fastmem;
mod fault;
mod handler;
mod manager;
mod phys;
mod region;
pub mod sys;
mod vtlb;

pub use error::{FastmemError, RegionError, Result};
pub use fastmem::patch::{Backpatcher, CodeBuffer, LoadStoreSite};
pub use fastmem::FastmemArena;
pub use fault::{AccessWidth, BusFault};
pub use handler::{HandlerId, HandlerRegistry, MemoryHandler, MAX_HANDLERS};
pub use manager::{FaultResolution, MemoryLayout, MemoryManager};
pub use phys::{PhysicalMap, PhysicalPage};
pub use region::{ReservedRegion, SubRegion};
pub use vtlb::{GuestWord, Vtlb, VtlbEntry, VTLB_ENTRIES, VTLB_PAGE_BITS, VTLB_PAGE_MASK, VTLB_PAGE_SIZE};

#[doc(hidden)]
pub use tracing as __tracing;
