//! Typed configuration snapshot.
//!
//! [`EmuConfig::load`] reads every section from a [`SettingsSource`] in one pass, so subsystems
//! always observe a single consistent snapshot.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::SettingsSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    pub recompiler: bool,
    pub fastmem: bool,
    pub cycles_per_frame: u64,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            recompiler: true,
            fastmem: true,
            cycles_per_frame: 294_912_000 / 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicsConfig {
    pub renderer: String,
    pub vsync: bool,
    pub upscale: u32,
    pub show_fps: bool,
    pub osd_scale: f64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            renderer: "auto".to_string(),
            vsync: false,
            upscale: 1,
            show_fps: false,
            osd_scale: 1.0,
        }
    }
}

impl GraphicsConfig {
    /// Changes that require the render context to be recreated.
    pub fn requires_reopen(&self, other: &Self) -> bool {
        self.renderer != other.renderer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub backend: String,
    pub volume: u32,
    pub latency_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: "cubeb".to_string(),
            volume: 100,
            latency_ms: 100,
        }
    }
}

impl AudioConfig {
    /// Changes that require the output stream to be recreated.
    pub fn requires_reopen(&self, other: &Self) -> bool {
        self.backend != other.backend
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InputConfig {
    pub profile: String,
    pub multitap: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExpansionConfig {
    pub enabled: bool,
    pub hdd_image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SpeedhackConfig {
    /// Run the co-processor on its own thread.
    pub threaded_coprocessor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FirmwareConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulationConfig {
    pub frame_limit: bool,
    pub target_fps: f64,
    pub enable_patches: bool,
    pub enable_cheats: bool,
    pub savestate_dir: PathBuf,
    pub compress_savestates: bool,
    pub backup_savestates: bool,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            frame_limit: true,
            target_fps: 59.94,
            enable_patches: true,
            enable_cheats: false,
            savestate_dir: PathBuf::from("sstates"),
            compress_savestates: true,
            backup_savestates: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EmuConfig {
    pub cpu: CpuConfig,
    pub graphics: GraphicsConfig,
    pub audio: AudioConfig,
    pub input: InputConfig,
    pub network: NetworkConfig,
    pub expansion: ExpansionConfig,
    pub speedhacks: SpeedhackConfig,
    pub firmware: FirmwareConfig,
    pub emulation: EmulationConfig,
}

fn get_u32(src: &dyn SettingsSource, section: &str, key: &str, default: u32) -> u32 {
    src.get_int_or(section, key, default.into())
        .clamp(0, u32::MAX.into()) as u32
}

fn get_path(src: &dyn SettingsSource, section: &str, key: &str, default: &std::path::Path) -> PathBuf {
    PathBuf::from(src.get_string_or(section, key, &default.to_string_lossy()))
}

impl EmuConfig {
    pub fn load(src: &dyn SettingsSource) -> Self {
        let d = EmuConfig::default();
        let hdd_image = src.get_string_or("Expansion", "HddImage", "");
        EmuConfig {
            cpu: CpuConfig {
                recompiler: src.get_bool_or("CPU", "Recompiler", d.cpu.recompiler),
                fastmem: src.get_bool_or("CPU", "Fastmem", d.cpu.fastmem),
                cycles_per_frame: src
                    .get_int_or("CPU", "CyclesPerFrame", d.cpu.cycles_per_frame as i64)
                    .max(1) as u64,
            },
            graphics: GraphicsConfig {
                renderer: src.get_string_or("Graphics", "Renderer", &d.graphics.renderer),
                vsync: src.get_bool_or("Graphics", "VSync", d.graphics.vsync),
                upscale: get_u32(src, "Graphics", "Upscale", d.graphics.upscale).max(1),
                show_fps: src.get_bool_or("Graphics", "ShowFPS", d.graphics.show_fps),
                osd_scale: src.get_float_or("Graphics", "OsdScale", d.graphics.osd_scale),
            },
            audio: AudioConfig {
                backend: src.get_string_or("Audio", "Backend", &d.audio.backend),
                volume: get_u32(src, "Audio", "Volume", d.audio.volume).min(200),
                latency_ms: get_u32(src, "Audio", "Latency", d.audio.latency_ms),
            },
            input: InputConfig {
                profile: src.get_string_or("Input", "Profile", &d.input.profile),
                multitap: src.get_bool_or("Input", "Multitap", d.input.multitap),
            },
            network: NetworkConfig {
                enabled: src.get_bool_or("Network", "Enabled", d.network.enabled),
                interface: src.get_string_or("Network", "Interface", &d.network.interface),
            },
            expansion: ExpansionConfig {
                enabled: src.get_bool_or("Expansion", "Enabled", d.expansion.enabled),
                hdd_image: (!hdd_image.is_empty()).then(|| PathBuf::from(hdd_image)),
            },
            speedhacks: SpeedhackConfig {
                threaded_coprocessor: src.get_bool_or(
                    "Speedhacks",
                    "ThreadedCoprocessor",
                    d.speedhacks.threaded_coprocessor,
                ),
            },
            firmware: FirmwareConfig {
                path: get_path(src, "Firmware", "Path", &d.firmware.path),
            },
            emulation: EmulationConfig {
                frame_limit: src.get_bool_or("Emulation", "FrameLimit", d.emulation.frame_limit),
                target_fps: src
                    .get_float_or("Emulation", "TargetFPS", d.emulation.target_fps)
                    .max(1.0),
                enable_patches: src.get_bool_or("Emulation", "EnablePatches", d.emulation.enable_patches),
                enable_cheats: src.get_bool_or("Emulation", "EnableCheats", d.emulation.enable_cheats),
                savestate_dir: get_path(src, "Folders", "Savestates", &d.emulation.savestate_dir),
                compress_savestates: src.get_bool_or(
                    "Emulation",
                    "CompressSavestates",
                    d.emulation.compress_savestates,
                ),
                backup_savestates: src.get_bool_or(
                    "Emulation",
                    "BackupSavestates",
                    d.emulation.backup_savestates,
                ),
            },
        }
    }
}
