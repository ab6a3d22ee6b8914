//! Declarative table of configuration sections and how a change to each one is applied to a
//! live VM.
//!
//! A section triggers when its struct compares unequal. The action then decides how heavy the
//! response is: graphics and audio only reopen their backend when the renderer or output backend
//! changed, and otherwise pass the new values through `apply_settings`.

use tracing::info;

use crate::backend::MessageLevel;
use crate::config::EmuConfig;
use crate::error::Result;
use crate::session::{Subsystem, VmSession};

pub(crate) struct SettingsDiff {
    pub section: &'static str,
    pub changed: fn(&EmuConfig, &EmuConfig) -> bool,
    pub apply: fn(&mut VmSession, &EmuConfig, &EmuConfig) -> Result<()>,
}

pub(crate) static SETTINGS_DIFFS: &[SettingsDiff] = &[
    SettingsDiff {
        section: "CPU",
        changed: cpu_changed,
        apply: apply_cpu,
    },
    SettingsDiff {
        section: "Graphics",
        changed: graphics_changed,
        apply: apply_graphics,
    },
    SettingsDiff {
        section: "Audio",
        changed: audio_changed,
        apply: apply_audio,
    },
    SettingsDiff {
        section: "Input",
        changed: input_changed,
        apply: apply_input,
    },
    SettingsDiff {
        section: "Network",
        changed: network_changed,
        apply: reopen_network,
    },
    SettingsDiff {
        section: "Expansion",
        changed: expansion_changed,
        apply: reopen_expansion,
    },
    SettingsDiff {
        section: "Speedhacks",
        changed: speedhacks_changed,
        apply: apply_speedhacks,
    },
    SettingsDiff {
        section: "Firmware",
        changed: firmware_changed,
        apply: apply_firmware,
    },
    SettingsDiff {
        section: "Emulation",
        changed: emulation_changed,
        apply: apply_emulation,
    },
];

fn cpu_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.cpu != new.cpu
}

fn graphics_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.graphics != new.graphics
}

fn audio_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.audio != new.audio
}

fn input_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.input != new.input
}

fn network_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.network != new.network
}

fn expansion_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.expansion != new.expansion
}

fn speedhacks_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.speedhacks != new.speedhacks
}

fn firmware_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.firmware != new.firmware
}

fn emulation_changed(old: &EmuConfig, new: &EmuConfig) -> bool {
    old.emulation != new.emulation
}

fn apply_cpu(vm: &mut VmSession, old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    if old.cpu.recompiler != new.cpu.recompiler {
        vm.defer_recompiler_switch(new.cpu.recompiler);
    }
    if old.cpu.fastmem != new.cpu.fastmem {
        vm.notify(
            MessageLevel::Info,
            "Fastmem changes take effect after the emulator is restarted.",
        );
    }
    Ok(())
}

fn apply_graphics(vm: &mut VmSession, old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    if new.graphics.requires_reopen(&old.graphics) {
        vm.reopen(Subsystem::Graphics)
    } else {
        vm.apply_backend_settings(Subsystem::Graphics, old, new)
    }
}

fn apply_audio(vm: &mut VmSession, old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    if new.audio.requires_reopen(&old.audio) {
        vm.reopen(Subsystem::Audio)
    } else {
        vm.apply_backend_settings(Subsystem::Audio, old, new)
    }
}

fn apply_input(vm: &mut VmSession, old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    vm.apply_backend_settings(Subsystem::Input, old, new)
}

fn reopen_network(vm: &mut VmSession, _old: &EmuConfig, _new: &EmuConfig) -> Result<()> {
    vm.reopen(Subsystem::Network)
}

fn reopen_expansion(vm: &mut VmSession, _old: &EmuConfig, _new: &EmuConfig) -> Result<()> {
    vm.reopen(Subsystem::Expansion)
}

fn apply_speedhacks(vm: &mut VmSession, _old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    vm.set_coprocessor_threaded(new.speedhacks.threaded_coprocessor)
}

fn apply_firmware(vm: &mut VmSession, _old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    info!(path = %new.firmware.path.display(), "firmware change applies on next boot");
    vm.notify(MessageLevel::Info, "The new firmware image is used from the next boot.");
    Ok(())
}

fn apply_emulation(vm: &mut VmSession, old: &EmuConfig, new: &EmuConfig) -> Result<()> {
    vm.reset_pacing();
    if old.emulation.enable_patches != new.emulation.enable_patches
        || old.emulation.enable_cheats != new.emulation.enable_cheats
    {
        vm.reload_patches();
    }
    Ok(())
}
