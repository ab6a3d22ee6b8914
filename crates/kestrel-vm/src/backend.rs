//! Contracts between the VM core and its collaborators: device backends, the guest CPU and
//! co-processor cores, the host application and the patch database.

use kestrel_mem::MemoryManager;
use thiserror::Error;

use crate::boot::BootParameters;
use crate::config::EmuConfig;
use crate::state::VmState;

/// An error reported by a collaborator. The core only surfaces the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError(message.into())
    }
}

/// What a backend sees when it is opened.
#[derive(Debug, Clone, Copy)]
pub struct OpenContext<'a> {
    pub config: &'a EmuConfig,
    pub boot: &'a BootParameters,
}

/// Identity of the running title, used for save-state names, per-title settings and patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleInfo {
    pub serial: String,
    pub crc: u32,
    pub name: String,
}

impl Default for TitleInfo {
    fn default() -> Self {
        Self {
            serial: "BIOS".to_string(),
            crc: 0,
            name: "Firmware".to_string(),
        }
    }
}

/// A device backend (media, display, audio, pad, network, expansion bus).
///
/// Backends are opened in a fixed order during initialization and closed in reverse order. Only
/// `open` may fail; `close` must always succeed.
pub trait DeviceBackend: Send {
    fn name(&self) -> &str;
    fn open(&mut self, ctx: &OpenContext<'_>) -> Result<(), BackendError>;
    fn close(&mut self);

    /// Applies a configuration change that does not require reopening.
    fn apply_settings(&mut self, _old: &EmuConfig, _new: &EmuConfig) -> Result<(), BackendError> {
        Ok(())
    }

    fn has_hardware_surface(&self) -> bool {
        false
    }

    fn reset(&mut self) {}

    /// Called once per emulated frame.
    fn vsync(&mut self) {}

    fn capture_frame(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Only meaningful for the media backend.
    fn title(&self) -> Option<TitleInfo> {
        None
    }

    fn state_version(&self) -> u32 {
        1
    }

    fn save_state(&mut self, _out: &mut Vec<u8>) -> Result<(), BackendError> {
        Ok(())
    }

    fn load_state(&mut self, _payload: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }
}

/// The main guest CPU core.
pub trait GuestCpu: Send {
    fn reset(&mut self, memory: &mut MemoryManager);

    /// Executes about `cycles` guest cycles and returns how many actually ran.
    fn execute(&mut self, memory: &mut MemoryManager, cycles: u64) -> u64;

    /// Switches between the interpreter and the recompiler. Only called between slices.
    fn set_recompiler(&mut self, enabled: bool);

    fn state_version(&self) -> u32 {
        1
    }

    fn save_state(&self, out: &mut Vec<u8>);
    fn load_state(&mut self, payload: &[u8]) -> Result<(), BackendError>;
}

/// A secondary processor that can run on its own thread.
pub trait Coprocessor: Send {
    fn reset(&mut self);
    fn run(&mut self, cycles: u64);

    fn state_version(&self) -> u32 {
        1
    }

    fn save_state(&self, out: &mut Vec<u8>);
    fn load_state(&mut self, payload: &[u8]) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Callbacks into the host application. Every method may be called from any thread.
pub trait HostInterface: Send + Sync {
    fn on_state_changed(&self, _old: VmState, _new: VmState) {}

    /// A user-visible message (on-screen display or error dialog).
    fn report_message(&self, _level: MessageLevel, _message: &str) {}

    /// Asks the host to stop background work (game list scans, downloads) that could hold
    /// resources the VM is about to open.
    fn cancel_background_operations(&self) {}

    fn set_timer_boost(&self, _enabled: bool) {}

    fn on_frame_captured(&self, _frame: Vec<u8>) {}
}

/// A host that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

impl HostInterface for NullHost {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTrigger {
    /// Applied once after boot, reset and state load.
    OnLoad,
    /// Applied at every frame boundary.
    Continuous,
    Both,
}

impl PatchTrigger {
    pub fn on_load(self) -> bool {
        matches!(self, PatchTrigger::OnLoad | PatchTrigger::Both)
    }

    pub fn continuous(self) -> bool {
        matches!(self, PatchTrigger::Continuous | PatchTrigger::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchValue {
    Byte(u8),
    Half(u16),
    Word(u32),
    Double(u64),
}

/// One parsed patch or cheat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub trigger: PatchTrigger,
    pub address: u32,
    pub value: PatchValue,
    /// Cheats are gated separately from compatibility patches.
    pub cheat: bool,
    pub description: String,
}

impl PatchRecord {
    pub fn apply(&self, memory: &mut MemoryManager) -> Result<(), kestrel_mem::BusFault> {
        match self.value {
            PatchValue::Byte(v) => memory.write8(self.address, v),
            PatchValue::Half(v) => memory.write16(self.address, v),
            PatchValue::Word(v) => memory.write32(self.address, v),
            PatchValue::Double(v) => memory.write64(self.address, v),
        }
    }
}

/// Patch database keyed by title serial and content CRC. Records are returned in application
/// order.
pub trait PatchSource: Send {
    fn patches(&self, serial: &str, crc: u32) -> Vec<PatchRecord>;
}
