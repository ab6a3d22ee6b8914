#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_mem::{MemoryLayout, MemoryManager};
use kestrel_vm::{
    BackendError, BootParameters, Coprocessor, DeviceBackend, EmuConfig, GuestCpu, HostInterface,
    LayeredSettings, MessageLevel, OpenContext, PatchRecord, PatchSource, SettingsSource,
    TitleInfo, VmComponents, VmSession, VmState,
};
use tempfile::TempDir;

pub const SERIAL: &str = "SLUS-20002";
pub const CRC: u32 = 0x1234_ABCD;

/// Guest RAM address the mock CPU writes its frame counter to.
pub const COUNTER_ADDR: u32 = 0x8000_1000;

pub fn small_layout() -> MemoryLayout {
    MemoryLayout {
        ram_paddr: 0,
        ram_size: 0x10_0000,
        rom_paddr: 0x1F_0000,
        rom_size: 0x1_0000,
        scratchpad_vaddr: 0x7000_0000,
        scratchpad_size: 0x4000,
        physical_size: 0x20_0000,
        mirrors: vec![0x8000_0000],
        code_cache_size: 0x1000,
    }
}

/// Names the backend whose next `open` fails, if any.
pub type FailSwitch = Arc<Mutex<Option<&'static str>>>;

/// Ordered record of every backend call, e.g. `open:graphics`.
#[derive(Default)]
pub struct Journal {
    events: Mutex<Vec<String>>,
}

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

pub struct MockBackend {
    name: &'static str,
    journal: Arc<Journal>,
    fail_open: FailSwitch,
    vsync_delay: Duration,
    vsyncs: Arc<AtomicU64>,
    /// Stands in for device registers.
    regs: Vec<u8>,
}

impl MockBackend {
    pub fn new(name: &'static str, journal: Arc<Journal>, fail_open: FailSwitch) -> Self {
        Self {
            name,
            journal,
            fail_open,
            vsync_delay: Duration::ZERO,
            vsyncs: Arc::new(AtomicU64::new(0)),
            regs: name.as_bytes().to_vec(),
        }
    }
}

impl DeviceBackend for MockBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn open(&mut self, ctx: &OpenContext<'_>) -> Result<(), BackendError> {
        if *self.fail_open.lock().unwrap() == Some(self.name) {
            self.journal.push(format!("fail:{}", self.name));
            return Err(BackendError::new(format!("{} device is unplugged", self.name)));
        }
        if self.name == "audio" {
            self.journal.push(format!("audio-backend:{}", ctx.config.audio.backend));
        }
        self.journal.push(format!("open:{}", self.name));
        Ok(())
    }

    fn close(&mut self) {
        self.journal.push(format!("close:{}", self.name));
    }

    fn apply_settings(&mut self, _old: &EmuConfig, _new: &EmuConfig) -> Result<(), BackendError> {
        self.journal.push(format!("apply:{}", self.name));
        Ok(())
    }

    fn reset(&mut self) {
        self.journal.push(format!("reset:{}", self.name));
    }

    fn vsync(&mut self) {
        if !self.vsync_delay.is_zero() {
            std::thread::sleep(self.vsync_delay);
        }
        self.vsyncs.fetch_add(1, Ordering::SeqCst);
        let n = self.regs.len();
        self.regs[n - 1] = self.regs[n - 1].wrapping_add(1);
    }

    fn capture_frame(&mut self) -> Option<Vec<u8>> {
        self.journal.push(format!("capture:{}", self.name));
        Some(vec![0xAB; 16])
    }

    fn title(&self) -> Option<TitleInfo> {
        (self.name == "media").then(|| TitleInfo {
            serial: SERIAL.to_string(),
            crc: CRC,
            name: "Test Title".to_string(),
        })
    }

    fn save_state(&mut self, out: &mut Vec<u8>) -> Result<(), BackendError> {
        out.extend_from_slice(&self.regs);
        Ok(())
    }

    fn load_state(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        self.regs = payload.to_vec();
        Ok(())
    }
}

/// Shared view of the mock CPU's registers.
#[derive(Default)]
pub struct CpuCounters {
    pub pc: AtomicU64,
    pub frames: AtomicU64,
    pub recompiler: AtomicBool,
    pub mode_switches: AtomicUsize,
    /// Guest stores that hit an unmapped address.
    pub bus_faults: AtomicUsize,
}

pub struct MockCpu {
    counters: Arc<CpuCounters>,
    pc: u32,
    gpr: [u32; 8],
}

impl MockCpu {
    fn publish(&self) {
        self.counters.pc.store(self.pc as u64, Ordering::SeqCst);
        self.counters.frames.store(self.gpr[0] as u64, Ordering::SeqCst);
    }
}

impl GuestCpu for MockCpu {
    fn reset(&mut self, _memory: &mut MemoryManager) {
        self.pc = 0xBFC0_0000;
        self.gpr = [0; 8];
        self.publish();
    }

    fn execute(&mut self, memory: &mut MemoryManager, cycles: u64) -> u64 {
        self.gpr[0] = self.gpr[0].wrapping_add(1);
        self.gpr[1] = self.gpr[1].wrapping_mul(31).wrapping_add(self.gpr[0]);
        self.pc = self.pc.wrapping_add(4);
        let stores = [
            memory.write32(COUNTER_ADDR, self.gpr[0]),
            memory.write32(COUNTER_ADDR + 4 * (self.gpr[0] % 64), self.gpr[1]),
        ];
        let faults = stores.iter().filter(|store| store.is_err()).count();
        if faults > 0 {
            self.counters.bus_faults.fetch_add(faults, Ordering::SeqCst);
        }
        self.publish();
        cycles
    }

    fn set_recompiler(&mut self, enabled: bool) {
        self.counters.recompiler.store(enabled, Ordering::SeqCst);
        self.counters.mode_switches.fetch_add(1, Ordering::SeqCst);
    }

    fn save_state(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pc.to_le_bytes());
        for r in self.gpr {
            out.extend_from_slice(&r.to_le_bytes());
        }
    }

    fn load_state(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        if payload.len() != 4 * 9 {
            return Err(BackendError::new("bad CPU register block"));
        }
        let word = |i: usize| u32::from_le_bytes(payload[i * 4..i * 4 + 4].try_into().unwrap());
        self.pc = word(0);
        for (i, r) in self.gpr.iter_mut().enumerate() {
            *r = word(i + 1);
        }
        self.publish();
        Ok(())
    }
}

pub struct MockCoprocessor {
    cycles: Arc<AtomicU64>,
    delay: Duration,
}

impl Coprocessor for MockCoprocessor {
    fn reset(&mut self) {
        self.cycles.store(0, Ordering::SeqCst);
    }

    fn run(&mut self, cycles: u64) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.cycles.fetch_add(cycles, Ordering::SeqCst);
    }

    fn save_state(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cycles.load(Ordering::SeqCst).to_le_bytes());
    }

    fn load_state(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        let bytes: [u8; 8] = payload
            .try_into()
            .map_err(|_| BackendError::new("bad co-processor state"))?;
        self.cycles.store(u64::from_le_bytes(bytes), Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHost {
    pub transitions: Mutex<Vec<(VmState, VmState)>>,
    pub messages: Mutex<Vec<(MessageLevel, String)>>,
    pub timer_boost: AtomicBool,
    pub cancels: AtomicUsize,
    pub frames: AtomicUsize,
}

impl RecordingHost {
    pub fn errors(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == MessageLevel::Error)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn last_transition(&self) -> Option<(VmState, VmState)> {
        self.transitions.lock().unwrap().last().copied()
    }
}

impl HostInterface for RecordingHost {
    fn on_state_changed(&self, old: VmState, new: VmState) {
        self.transitions.lock().unwrap().push((old, new));
    }

    fn report_message(&self, level: MessageLevel, message: &str) {
        self.messages.lock().unwrap().push((level, message.to_string()));
    }

    fn cancel_background_operations(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn set_timer_boost(&self, enabled: bool) {
        self.timer_boost.store(enabled, Ordering::SeqCst);
    }

    fn on_frame_captured(&self, frame: Vec<u8>) {
        assert!(!frame.is_empty());
        self.frames.fetch_add(1, Ordering::SeqCst);
    }
}

/// Knobs for building a test VM.
#[derive(Default)]
pub struct Options {
    pub fail_open: Option<&'static str>,
    pub graphics_vsync_delay: Duration,
    pub coprocessor_delay: Duration,
    pub threaded_coprocessor: bool,
    pub skip_firmware: bool,
    pub raw_savestates: bool,
    pub patches: Vec<PatchRecord>,
}

/// Serves the same records for every title that matches [`SERIAL`].
pub struct StaticPatches(pub Vec<PatchRecord>);

impl PatchSource for StaticPatches {
    fn patches(&self, serial: &str, crc: u32) -> Vec<PatchRecord> {
        if serial == SERIAL && crc == CRC {
            self.0.clone()
        } else {
            Vec::new()
        }
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub journal: Arc<Journal>,
    pub fail_open: FailSwitch,
    pub host: Arc<RecordingHost>,
    pub cpu: Arc<CpuCounters>,
    pub graphics_vsyncs: Arc<AtomicU64>,
    pub coprocessor_cycles: Arc<AtomicU64>,
}

impl Fixture {
    pub fn firmware_path(&self) -> PathBuf {
        self.dir.path().join("firmware.bin")
    }

    pub fn savestate_dir(&self) -> PathBuf {
        self.dir.path().join("sstates")
    }

    pub fn media_path(&self) -> PathBuf {
        self.dir.path().join("game.iso")
    }
}

pub fn base_settings(dir: &Path) -> LayeredSettings {
    let mut settings = LayeredSettings::new();
    settings.set(
        "Firmware",
        "Path",
        dir.join("firmware.bin").to_string_lossy().into_owned().into(),
    );
    settings.set(
        "Folders",
        "Savestates",
        dir.join("sstates").to_string_lossy().into_owned().into(),
    );
    settings.set("Emulation", "FrameLimit", false.into());
    settings.set("CPU", "Fastmem", false.into());
    settings.set("CPU", "CyclesPerFrame", 1000i64.into());
    settings
}

pub fn build(options: Options) -> (Fixture, VmSession) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    if !options.skip_firmware {
        std::fs::write(dir.path().join("firmware.bin"), b"KESTREL-FIRMWARE").unwrap();
    }
    std::fs::write(dir.path().join("game.iso"), [0u8; 2048]).unwrap();

    let journal = Arc::new(Journal::default());
    let fail_open: FailSwitch = Arc::new(Mutex::new(options.fail_open));
    let host = Arc::new(RecordingHost::default());
    let cpu_counters = Arc::new(CpuCounters::default());
    let coprocessor_cycles = Arc::new(AtomicU64::new(0));

    let backend = |name: &'static str| MockBackend::new(name, journal.clone(), fail_open.clone());
    let mut graphics = backend("graphics");
    graphics.vsync_delay = options.graphics_vsync_delay;
    let graphics_vsyncs = graphics.vsyncs.clone();

    let components = VmComponents {
        cpu: Box::new(MockCpu {
            counters: cpu_counters.clone(),
            pc: 0,
            gpr: [0; 8],
        }),
        coprocessor: Box::new(MockCoprocessor {
            cycles: coprocessor_cycles.clone(),
            delay: options.coprocessor_delay,
        }),
        media: Box::new(backend("media")),
        graphics: Box::new(graphics),
        audio: Box::new(backend("audio")),
        input: Box::new(backend("input")),
        network: Box::new(backend("network")),
        expansion: Box::new(backend("expansion")),
    };

    let mut settings = base_settings(dir.path());
    if options.threaded_coprocessor {
        settings.set("Speedhacks", "ThreadedCoprocessor", true.into());
    }
    if options.raw_savestates {
        settings.set("Emulation", "CompressSavestates", false.into());
    }

    let mut builder = VmSession::builder(components)
        .settings(settings)
        .host(host.clone())
        .memory_layout(small_layout());
    if !options.patches.is_empty() {
        builder = builder.patch_source(StaticPatches(options.patches.clone()));
    }
    let session = builder.build().unwrap();

    (
        Fixture {
            dir,
            journal,
            fail_open,
            host,
            cpu: cpu_counters,
            graphics_vsyncs,
            coprocessor_cycles,
        },
        session,
    )
}

/// A VM that has been booted from firmware and is Paused.
pub fn booted(options: Options) -> (Fixture, VmSession) {
    let (fx, mut vm) = build(options);
    vm.initialize(BootParameters::firmware()).unwrap();
    assert_eq!(vm.state(), VmState::Paused);
    (fx, vm)
}

pub fn guest_ram(vm: &VmSession) -> Vec<u8> {
    vm.memory().ram().expect("memory is committed").to_vec()
}

pub fn set_setting(vm: &mut VmSession, section: &str, key: &str, value: impl Into<kestrel_vm::SettingValue>) {
    vm.settings_mut().set(section, key, value.into());
}
