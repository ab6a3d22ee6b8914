//! The VM lifecycle controller.
//!
//! [`VmSession`] owns guest memory, the CPU core and every device backend for one emulated
//! machine. It drives the state machine
//!
//! ```text
//! Shutdown -> Initializing -> Paused <-> Running
//!                  |             |          |
//!                  v             v          v
//!              Shutdown <---- Stopping <----
//! ```
//!
//! and is the only code that commits or decommits guest memory. All methods are meant to be called
//! from the CPU thread; see [`CpuThread`](crate::CpuThread) for a host that does this.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kestrel_mem::{MemoryLayout, MemoryManager};
use kestrel_savestate::{
    freeze_sections, load_from_file, slot_path, thaw_sections, validate_sections, Compression,
    Freeze, SaveQueue, SaveRequest, SectionTag, NUM_SAVE_SLOTS, RESUME_SLOT,
};
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendError, Coprocessor, DeviceBackend, GuestCpu, HostInterface, MessageLevel, NullHost,
    OpenContext, PatchRecord, PatchSource, PatchTrigger, TitleInfo,
};
use crate::boot::{BootParameters, BootSource};
use crate::config::EmuConfig;
use crate::coordinator::{ThreadStats, Worker};
use crate::diff::SETTINGS_DIFFS;
use crate::error::{Result, VmError};
use crate::freeze::{HookSection, MemorySection, ThreadSection};
use crate::perf::{PacingClock, PerfCounters};
use crate::settings::{LayeredSettings, SettingsSource};
use crate::state::VmState;

/// Subsystems in the order they are acquired. They are released in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Memory,
    Media,
    Graphics,
    Audio,
    Input,
    Network,
    Expansion,
}

impl Subsystem {
    pub const OPEN_ORDER: [Subsystem; 7] = [
        Subsystem::Memory,
        Subsystem::Media,
        Subsystem::Graphics,
        Subsystem::Audio,
        Subsystem::Input,
        Subsystem::Network,
        Subsystem::Expansion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Subsystem::Memory => "memory",
            Subsystem::Media => "media",
            Subsystem::Graphics => "graphics",
            Subsystem::Audio => "audio",
            Subsystem::Input => "input",
            Subsystem::Network => "network",
            Subsystem::Expansion => "expansion bus",
        }
    }
}

/// The collaborators a session drives.
pub struct VmComponents {
    pub cpu: Box<dyn GuestCpu>,
    pub coprocessor: Box<dyn Coprocessor>,
    pub media: Box<dyn DeviceBackend>,
    pub graphics: Box<dyn DeviceBackend>,
    pub audio: Box<dyn DeviceBackend>,
    pub input: Box<dyn DeviceBackend>,
    pub network: Box<dyn DeviceBackend>,
    pub expansion: Box<dyn DeviceBackend>,
}

/// Builder for a [`VmSession`].
pub struct VmSessionBuilder {
    components: VmComponents,
    settings: Option<Box<dyn SettingsSource>>,
    host: Option<Arc<dyn HostInterface>>,
    patches: Option<Box<dyn PatchSource>>,
    layout: MemoryLayout,
}

impl VmSessionBuilder {
    pub fn settings(mut self, settings: impl SettingsSource + 'static) -> Self {
        self.settings = Some(Box::new(settings));
        self
    }

    pub fn host(mut self, host: Arc<dyn HostInterface>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn patch_source(mut self, patches: impl PatchSource + 'static) -> Self {
        self.patches = Some(Box::new(patches));
        self
    }

    /// Default: [`MemoryLayout::default`].
    pub fn memory_layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Reserves guest memory and starts the graphics thread. Nothing is opened yet.
    pub fn build(self) -> Result<VmSession> {
        let settings = self
            .settings
            .unwrap_or_else(|| Box::new(LayeredSettings::new()));
        let host = self.host.unwrap_or_else(|| Arc::new(NullHost));
        let config = EmuConfig::load(settings.as_ref());
        let memory = MemoryManager::new(self.layout, config.cpu.fastmem)?;

        let queue_host = host.clone();
        let save_queue = SaveQueue::new(move |outcome| match &outcome.result {
            Ok(()) => queue_host.report_message(
                MessageLevel::Info,
                &format!("State saved to {}.", outcome.path.display()),
            ),
            Err(err) => queue_host.report_message(
                MessageLevel::Error,
                &format!("Failed to save state to {}: {err}", outcome.path.display()),
            ),
        })?;

        let c = self.components;
        Ok(VmSession {
            state: VmState::Shutdown,
            pacing: PacingClock::new(config.emulation.target_fps),
            config,
            settings,
            host,
            patch_source: self.patches,
            memory,
            cpu: c.cpu,
            coprocessor: Worker::inline("coprocessor", c.coprocessor),
            graphics: Worker::threaded("graphics", c.graphics)?,
            media: c.media,
            audio: c.audio,
            input: c.input,
            network: c.network,
            expansion: c.expansion,
            opened: Vec::new(),
            boot: None,
            title: TitleInfo::default(),
            patches: Vec::new(),
            pending_recompiler: None,
            save_queue,
            perf: PerfCounters::new(),
        })
    }
}

pub struct VmSession {
    state: VmState,
    config: EmuConfig,
    settings: Box<dyn SettingsSource>,
    host: Arc<dyn HostInterface>,
    patch_source: Option<Box<dyn PatchSource>>,

    memory: MemoryManager,
    cpu: Box<dyn GuestCpu>,
    coprocessor: Worker<Box<dyn Coprocessor>>,
    graphics: Worker<Box<dyn DeviceBackend>>,
    media: Box<dyn DeviceBackend>,
    audio: Box<dyn DeviceBackend>,
    input: Box<dyn DeviceBackend>,
    network: Box<dyn DeviceBackend>,
    expansion: Box<dyn DeviceBackend>,
    /// Acquired subsystems, in acquisition order.
    opened: Vec<Subsystem>,

    boot: Option<BootParameters>,
    title: TitleInfo,
    patches: Vec<PatchRecord>,
    pending_recompiler: Option<bool>,
    save_queue: SaveQueue,
    perf: PerfCounters,
    pacing: PacingClock,
}

impl VmSession {
    pub fn builder(components: VmComponents) -> VmSessionBuilder {
        VmSessionBuilder {
            components,
            settings: None,
            host: None,
            patches: None,
            layout: MemoryLayout::default(),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn config(&self) -> &EmuConfig {
        &self.config
    }

    pub fn settings(&self) -> &dyn SettingsSource {
        self.settings.as_ref()
    }

    /// Changes made here are picked up by the next [`apply_settings`](Self::apply_settings).
    pub fn settings_mut(&mut self) -> &mut dyn SettingsSource {
        self.settings.as_mut()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Memory bring-up for devices (handler registration, mapping). Only valid on the CPU thread.
    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    pub fn title(&self) -> &TitleInfo {
        &self.title
    }

    pub fn boot_parameters(&self) -> Option<&BootParameters> {
        self.boot.as_ref()
    }

    pub fn perf(&self) -> &PerfCounters {
        &self.perf
    }

    pub fn coprocessor_threaded(&self) -> bool {
        self.coprocessor.is_threaded()
    }

    pub fn coprocessor_stats(&self) -> ThreadStats {
        self.coprocessor.stats()
    }

    pub fn graphics_stats(&self) -> ThreadStats {
        self.graphics.stats()
    }

    pub fn has_hardware_surface(&mut self) -> bool {
        self.graphics
            .run_sync(|gs| gs.has_hardware_surface())
            .unwrap_or(false)
    }

    /// Boots a guest. On success the VM is Paused. On failure everything acquired so far is
    /// released in reverse order, the VM is back in Shutdown and the host has been told why.
    pub fn initialize(&mut self, boot: BootParameters) -> Result<()> {
        if self.state != VmState::Shutdown {
            return Err(VmError::InvalidState {
                op: "initialize",
                state: self.state,
            });
        }
        self.host.cancel_background_operations();
        self.config = EmuConfig::load(self.settings.as_ref());
        self.transition(VmState::Initializing);

        match self.bring_up(&boot) {
            Ok(()) => {
                info!(source = ?boot.source, title = %self.title.serial, "VM initialized");
                self.boot = Some(boot);
                self.transition(VmState::Paused);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "initialization failed, rolling back");
                self.release_all();
                self.transition(VmState::Shutdown);
                self.host.report_message(
                    MessageLevel::Error,
                    &format!("Failed to start the virtual machine: {err}"),
                );
                Err(err)
            }
        }
    }

    fn bring_up(&mut self, boot: &BootParameters) -> Result<()> {
        let firmware_path = self.config.firmware.path.clone();
        let firmware = std::fs::read(&firmware_path).map_err(|source| VmError::MissingFirmware {
            path: firmware_path,
            source,
        })?;
        match boot.source {
            BootSource::Firmware => {}
            BootSource::Disc | BootSource::Executable => {
                let path = boot.filename.as_ref().ok_or(VmError::NoMediaFile)?;
                if !path.is_file() {
                    return Err(VmError::MissingMedia(path.clone()));
                }
            }
        }
        if let Some(elf) = &boot.elf_override {
            if !elf.is_file() {
                return Err(VmError::MissingMedia(elf.clone()));
            }
        }

        self.memory.load_rom(&firmware)?;
        for subsystem in Subsystem::OPEN_ORDER {
            self.acquire(subsystem, boot)?;
        }

        self.title = self.media.title().unwrap_or_default();
        self.coprocessor
            .set_threaded(self.config.speedhacks.threaded_coprocessor)?;
        self.reset_cores()?;
        self.reload_patches();
        self.apply_patches(PatchTrigger::on_load);

        if let Some(path) = &boot.save_state {
            let blob = load_from_file(path)?;
            self.thaw_blob(&blob)?;
        }
        Ok(())
    }

    fn acquire(&mut self, subsystem: Subsystem, boot: &BootParameters) -> Result<()> {
        let open_err = |source: BackendError| VmError::Open {
            subsystem: subsystem.name(),
            source,
        };
        let ctx = OpenContext {
            config: &self.config,
            boot,
        };
        match subsystem {
            Subsystem::Memory => self.memory.commit()?,
            Subsystem::Media => self.media.open(&ctx).map_err(open_err)?,
            Subsystem::Graphics => {
                let config = self.config.clone();
                let boot = boot.clone();
                self.graphics
                    .run_sync(move |gs| {
                        gs.open(&OpenContext {
                            config: &config,
                            boot: &boot,
                        })
                    })?
                    .map_err(open_err)?
            }
            Subsystem::Audio => self.audio.open(&ctx).map_err(open_err)?,
            Subsystem::Input => self.input.open(&ctx).map_err(open_err)?,
            Subsystem::Network => self.network.open(&ctx).map_err(open_err)?,
            Subsystem::Expansion => self.expansion.open(&ctx).map_err(open_err)?,
        }
        debug!(subsystem = subsystem.name(), "opened subsystem");
        self.opened.push(subsystem);
        Ok(())
    }

    fn release(&mut self, subsystem: Subsystem) {
        match subsystem {
            Subsystem::Memory => {
                if let Err(err) = self.memory.decommit() {
                    error!(error = %err, "failed to decommit guest memory");
                }
            }
            Subsystem::Media => self.media.close(),
            Subsystem::Graphics => {
                if let Err(err) = self.graphics.run_sync(|gs| gs.close()) {
                    error!(error = %err, "failed to close graphics backend");
                }
            }
            Subsystem::Audio => self.audio.close(),
            Subsystem::Input => self.input.close(),
            Subsystem::Network => self.network.close(),
            Subsystem::Expansion => self.expansion.close(),
        }
        self.opened.retain(|&s| s != subsystem);
        debug!(subsystem = subsystem.name(), "closed subsystem");
    }

    fn release_all(&mut self) {
        while let Some(&subsystem) = self.opened.last() {
            self.release(subsystem);
        }
        self.boot = None;
        self.patches.clear();
        self.pending_recompiler = None;
    }

    /// Paused <-> Running. Requesting the current state is a no-op.
    pub fn set_state(&mut self, target: VmState) -> Result<()> {
        match (self.state, target) {
            (from, to) if from == to && from.is_valid() => Ok(()),
            (VmState::Paused, VmState::Running) => {
                self.host.set_timer_boost(true);
                self.perf.reset();
                self.pacing.set_target_fps(self.config.emulation.target_fps);
                self.transition(VmState::Running);
                Ok(())
            }
            (VmState::Running, VmState::Paused) => {
                self.quiesce();
                self.host.set_timer_boost(false);
                self.transition(VmState::Paused);
                Ok(())
            }
            (from, to) => Err(VmError::InvalidTransition { from, to }),
        }
    }

    /// Stops the guest and releases every subsystem. Guest memory is decommitted but stays
    /// reserved. Calling this while already shut down does nothing.
    ///
    /// A failed resume save is reported but does not stop the shutdown.
    pub fn shutdown(&mut self, save_resume_state: bool) -> Result<()> {
        match self.state {
            VmState::Shutdown => return Ok(()),
            state if !state.is_valid() => {
                return Err(VmError::InvalidState {
                    op: "shut down",
                    state,
                })
            }
            _ => {}
        }
        self.transition(VmState::Stopping);
        self.host.set_timer_boost(false);
        self.quiesce();

        let mut result = Ok(());
        if save_resume_state {
            let path = self.slot_path(RESUME_SLOT);
            if let Err(err) = self.capture_and_queue(path) {
                warn!(error = %err, "failed to save resume state");
                result = Err(err);
            }
        }
        self.save_queue.flush();
        self.release_all();
        self.transition(VmState::Shutdown);
        info!("VM shut down");
        result
    }

    /// Reloads configuration and reinitializes only the subsystems whose section changed.
    ///
    /// Outside Paused/Running the new snapshot is just stored. If a subsystem cannot be
    /// reinitialized, the VM is shut down rather than left running without it.
    pub fn apply_settings(&mut self) -> Result<()> {
        let old = self.config.clone();
        let new = EmuConfig::load(self.settings.as_ref());
        if !self.state.is_valid() {
            self.config = new;
            return Ok(());
        }

        self.quiesce();
        self.config = new.clone();
        for diff in SETTINGS_DIFFS {
            if !(diff.changed)(&old, &new) {
                continue;
            }
            debug!(section = diff.section, "applying settings change");
            if let Err(err) = (diff.apply)(self, &old, &new) {
                error!(section = diff.section, error = %err, "failed to apply settings");
                self.host.report_message(
                    MessageLevel::Error,
                    &format!("Failed to apply {} settings: {err}", diff.section),
                );
                if let Err(shutdown_err) = self.shutdown(false) {
                    error!(error = %shutdown_err, "shutdown after failed settings change failed");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Restarts the guest from the firmware entry point without reopening any backend.
    pub fn reset(&mut self) -> Result<()> {
        self.require_valid("reset")?;
        self.quiesce();
        self.memory.reset()?;
        self.reset_cores()?;
        for backend in [
            &mut self.media,
            &mut self.audio,
            &mut self.input,
            &mut self.network,
            &mut self.expansion,
        ] {
            backend.reset();
        }
        self.graphics.submit(|gs| gs.reset());
        self.apply_patches(PatchTrigger::on_load);
        info!("VM reset");
        Ok(())
    }

    fn reset_cores(&mut self) -> Result<()> {
        if self.memory.fastmem_enabled() {
            self.memory.clear_code_cache()?;
        }
        self.pending_recompiler = None;
        self.cpu.set_recompiler(self.config.cpu.recompiler);
        self.cpu.reset(&mut self.memory);
        self.coprocessor.submit(|cop| cop.reset());
        Ok(())
    }

    /// Executes one frame's worth of guest cycles. Only valid while Running.
    pub fn run_frame(&mut self) -> Result<u64> {
        if self.state != VmState::Running {
            return Err(VmError::InvalidState {
                op: "run a frame",
                state: self.state,
            });
        }
        if let Some(enabled) = self.pending_recompiler.take() {
            if self.memory.fastmem_enabled() {
                self.memory.clear_code_cache()?;
            }
            self.cpu.set_recompiler(enabled);
            info!(recompiler = enabled, "switched CPU execution mode");
        }

        let cycles = self
            .cpu
            .execute(&mut self.memory, self.config.cpu.cycles_per_frame);
        self.coprocessor.submit(move |cop| cop.run(cycles));
        self.graphics.submit(|gs| gs.vsync());
        self.audio.vsync();
        self.input.vsync();
        self.apply_patches(PatchTrigger::continuous);
        self.perf.record_frame(cycles);
        if self.config.emulation.frame_limit {
            self.pacing.wait();
        }
        Ok(cycles)
    }

    /// Queues a frame capture on the graphics thread. Returns `false` if one is already pending.
    pub fn request_frame_capture(&mut self) -> Result<bool> {
        self.require_valid("capture a frame")?;
        let host = self.host.clone();
        Ok(self.graphics.submit_once("frame-capture", move |gs| {
            if let Some(frame) = gs.capture_frame() {
                host.on_frame_captured(frame);
            }
        }))
    }

    /// Path of `slot` for the running title.
    pub fn slot_path(&self, slot: u8) -> PathBuf {
        slot_path(
            &self.config.emulation.savestate_dir,
            &self.title.serial,
            self.title.crc,
            slot,
        )
    }

    /// Captures the machine state now and queues it for writing. Returns once capture is done;
    /// use [`wait_for_save_state_flush`](Self::wait_for_save_state_flush) to wait for the file.
    pub fn save_state(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.require_valid("save state")?;
        let path = path.into();
        self.capture_and_queue(path).map_err(|err| {
            self.host
                .report_message(MessageLevel::Error, &format!("Failed to save state: {err}"));
            err
        })
    }

    pub fn save_state_to_slot(&mut self, slot: u8) -> Result<()> {
        check_slot(slot)?;
        self.save_state(self.slot_path(slot))
    }

    fn capture_and_queue(&mut self, path: PathBuf) -> Result<()> {
        self.quiesce();
        let blob = self.freeze_blob()?;
        let compression = if self.config.emulation.compress_savestates {
            Compression::Lz4
        } else {
            Compression::None
        };
        info!(path = %path.display(), bytes = blob.len(), "captured save state");
        self.save_queue.submit(SaveRequest {
            path,
            blob,
            compression,
            backup: self.config.emulation.backup_savestates,
        })?;
        Ok(())
    }

    /// Replaces the machine state with the one stored at `path`.
    ///
    /// Queued saves are flushed first. If the file is unreadable, malformed or does not match
    /// this machine, nothing is changed and the host is told why.
    pub fn load_state(&mut self, path: &Path) -> Result<()> {
        self.require_valid("load state")?;
        self.save_queue.flush();
        self.quiesce();
        let result = load_from_file(path)
            .map_err(VmError::from)
            .and_then(|blob| self.thaw_blob(&blob));
        match result {
            Ok(()) => {
                self.apply_patches(PatchTrigger::on_load);
                info!(path = %path.display(), "loaded save state");
                Ok(())
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rejected save state");
                self.host
                    .report_message(MessageLevel::Error, &format!("Failed to load state: {err}"));
                Err(err)
            }
        }
    }

    pub fn load_state_from_slot(&mut self, slot: u8) -> Result<()> {
        check_slot(slot)?;
        let path = self.slot_path(slot);
        self.load_state(&path)
    }

    /// Blocks until every queued save has been written.
    pub fn wait_for_save_state_flush(&self) {
        self.save_queue.flush();
    }

    fn with_sections<R>(
        &mut self,
        f: impl FnOnce(&mut [&mut dyn Freeze]) -> kestrel_savestate::Result<R>,
    ) -> Result<R> {
        let mut cpu = HookSection::new(SectionTag::CPU, &mut self.cpu);
        let mut memory = MemorySection(&mut self.memory);
        let mut coprocessor = ThreadSection::new(SectionTag::COPROC, &mut self.coprocessor)?;
        let mut graphics = ThreadSection::new(SectionTag::GRAPHICS, &mut self.graphics)?;
        let mut audio = HookSection::new(SectionTag::AUDIO, &mut self.audio);
        let mut input = HookSection::new(SectionTag::INPUT, &mut self.input);
        let mut network = HookSection::new(SectionTag::NETWORK, &mut self.network);
        let mut expansion = HookSection::new(SectionTag::EXPANSION, &mut self.expansion);
        let mut media = HookSection::new(SectionTag::MEDIA, &mut self.media);
        let mut hooks: [&mut dyn Freeze; 9] = [
            &mut cpu,
            &mut memory,
            &mut coprocessor,
            &mut graphics,
            &mut audio,
            &mut input,
            &mut network,
            &mut expansion,
            &mut media,
        ];
        Ok(f(&mut hooks)?)
    }

    fn freeze_blob(&mut self) -> Result<Vec<u8>> {
        self.with_sections(|hooks| freeze_sections(hooks))
    }

    /// Validates `blob` completely, then thaws it. If a hook fails part way, the state captured
    /// just before is thawed back so the running VM is left as it was.
    fn thaw_blob(&mut self, blob: &[u8]) -> Result<()> {
        self.with_sections(|hooks| validate_sections(blob, hooks).map(drop))?;
        let backup = self.freeze_blob()?;
        let Err(err) = self.with_sections(|hooks| thaw_sections(blob, hooks)) else {
            return Ok(());
        };
        if let Err(restore_err) = self.with_sections(|hooks| thaw_sections(&backup, hooks)) {
            kestrel_mem::fatal!(
                "failed to restore machine state after a rejected load ({err}): {restore_err}"
            );
        }
        Err(err)
    }

    pub(crate) fn defer_recompiler_switch(&mut self, enabled: bool) {
        debug!(recompiler = enabled, "deferring CPU execution mode switch");
        self.pending_recompiler = Some(enabled);
    }

    pub(crate) fn notify(&self, level: MessageLevel, message: &str) {
        self.host.report_message(level, message);
    }

    pub(crate) fn reopen(&mut self, subsystem: Subsystem) -> Result<()> {
        let boot = self.boot.clone().ok_or(VmError::InvalidState {
            op: "reopen a subsystem",
            state: self.state,
        })?;
        info!(subsystem = subsystem.name(), "reopening subsystem");
        self.release(subsystem);
        self.acquire(subsystem, &boot)?;
        // Keep acquisition order so rollback and shutdown stay in reverse order.
        self.opened
            .sort_by_key(|s| Subsystem::OPEN_ORDER.iter().position(|o| o == s));
        Ok(())
    }

    pub(crate) fn apply_backend_settings(
        &mut self,
        subsystem: Subsystem,
        old: &EmuConfig,
        new: &EmuConfig,
    ) -> Result<()> {
        let backend_err = |source: BackendError| VmError::Backend {
            subsystem: subsystem.name(),
            source,
        };
        let backend = match subsystem {
            Subsystem::Memory => return Ok(()),
            Subsystem::Graphics => {
                let (old, new) = (old.clone(), new.clone());
                return self
                    .graphics
                    .run_sync(move |gs| gs.apply_settings(&old, &new))?
                    .map_err(backend_err);
            }
            Subsystem::Media => &mut self.media,
            Subsystem::Audio => &mut self.audio,
            Subsystem::Input => &mut self.input,
            Subsystem::Network => &mut self.network,
            Subsystem::Expansion => &mut self.expansion,
        };
        backend.apply_settings(old, new).map_err(backend_err)
    }

    pub(crate) fn set_coprocessor_threaded(&mut self, threaded: bool) -> Result<()> {
        self.coprocessor.set_threaded(threaded)
    }

    pub(crate) fn reset_pacing(&mut self) {
        self.pacing.set_target_fps(self.config.emulation.target_fps);
    }

    pub(crate) fn reload_patches(&mut self) {
        let emu = &self.config.emulation;
        self.patches = match &self.patch_source {
            Some(source) if emu.enable_patches || emu.enable_cheats => source
                .patches(&self.title.serial, self.title.crc)
                .into_iter()
                .filter(|p| if p.cheat { emu.enable_cheats } else { emu.enable_patches })
                .collect(),
            _ => Vec::new(),
        };
        debug!(count = self.patches.len(), "loaded patches");
    }

    fn apply_patches(&mut self, applies: fn(PatchTrigger) -> bool) {
        for patch in self.patches.iter().filter(|p| applies(p.trigger)) {
            if let Err(fault) = patch.apply(&mut self.memory) {
                warn!(patch = %patch.description, error = %fault, "patch write faulted");
            }
        }
    }

    fn quiesce(&self) {
        self.coprocessor.wait_for_quiescence();
        self.graphics.wait_for_quiescence();
    }

    fn require_valid(&self, op: &'static str) -> Result<()> {
        if self.state.is_valid() {
            Ok(())
        } else {
            Err(VmError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, new: VmState) {
        let old = std::mem::replace(&mut self.state, new);
        info!(from = %old, to = %new, "VM state changed");
        self.host.on_state_changed(old, new);
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if self.state.is_valid() {
            if let Err(err) = self.shutdown(false) {
                error!(error = %err, "shutdown on drop failed");
            }
        }
    }
}

fn check_slot(slot: u8) -> Result<()> {
    if slot < NUM_SAVE_SLOTS {
        Ok(())
    } else {
        Err(VmError::InvalidSlot(slot))
    }
}
