//! Machine lifecycle: boot, pause/resume, settings reload, save/load state and shutdown across
//! the CPU, co-processor and graphics threads.

mod backend;
mod boot;
mod config;
mod coordinator;
mod cpu_thread;
mod diff;
mod error;
mod freeze;
mod perf;
mod session;
mod settings;
mod state;

pub use backend::{
    BackendError, Coprocessor, DeviceBackend, GuestCpu, HostInterface, MessageLevel, NullHost,
    OpenContext, PatchRecord, PatchSource, PatchTrigger, PatchValue, TitleInfo,
};
pub use boot::{BootParameters, BootSource};
pub use config::{
    AudioConfig, CpuConfig, EmuConfig, EmulationConfig, ExpansionConfig, FirmwareConfig,
    GraphicsConfig, InputConfig, NetworkConfig, SpeedhackConfig,
};
pub use coordinator::{ExecutionThread, ThreadExited, ThreadStats, Worker};
pub use cpu_thread::{CpuThread, VmRequest};
pub use error::{Result, VmError};
pub use perf::{PacingClock, PerfCounters};
pub use session::{Subsystem, VmComponents, VmSession, VmSessionBuilder};
pub use settings::{LayerKind, LayeredSettings, SettingValue, SettingsLayer, SettingsSource};
pub use state::VmState;
