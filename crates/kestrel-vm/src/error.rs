use std::path::PathBuf;

use kestrel_mem::{FastmemError, RegionError};
use kestrel_savestate::SaveStateError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::coordinator::ThreadExited;
use crate::state::VmState;

pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("cannot {op} while the VM is {state}")]
    InvalidState { op: &'static str, state: VmState },

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: VmState, to: VmState },

    #[error("firmware image {path} is unavailable: {source}")]
    MissingFirmware {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("boot media {0} is unavailable")]
    MissingMedia(PathBuf),

    #[error("boot parameters name no media file")]
    NoMediaFile,

    #[error("failed to open {subsystem}: {source}")]
    Open {
        subsystem: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("{subsystem}: {source}")]
    Backend {
        subsystem: &'static str,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Memory(#[from] RegionError),

    #[error(transparent)]
    Fastmem(#[from] FastmemError),

    #[error("save slot {0} does not exist")]
    InvalidSlot(u8),

    #[error(transparent)]
    SaveState(#[from] SaveStateError),

    #[error(transparent)]
    Thread(#[from] ThreadExited),

    #[error("failed to start thread: {0}")]
    Spawn(#[from] std::io::Error),
}
