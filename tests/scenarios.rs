//! End-to-end flows across the CPU, co-processor and graphics threads.

mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{booted, guest_ram, set_setting, Options, COUNTER_ADDR};
use kestrel_savestate::backup_path;
use kestrel_vm::{CpuThread, MessageLevel, VmError, VmState};

fn slow_threads() -> Options {
    Options {
        graphics_vsync_delay: Duration::from_millis(15),
        coprocessor_delay: Duration::from_millis(10),
        threaded_coprocessor: true,
        ..Options::default()
    }
}

#[test]
fn pause_waits_for_every_thread_to_drain() {
    let (fx, mut vm) = booted(slow_threads());
    assert!(vm.coprocessor_threaded());
    vm.set_state(VmState::Running).unwrap();
    for _ in 0..6 {
        vm.run_frame().unwrap();
    }
    vm.set_state(VmState::Paused).unwrap();

    let gs = vm.graphics_stats();
    let cop = vm.coprocessor_stats();
    assert_eq!(gs.submitted, gs.completed);
    assert_eq!(cop.submitted, cop.completed);
    assert_eq!(fx.graphics_vsyncs.load(Ordering::SeqCst), 6);
    assert_eq!(fx.coprocessor_cycles.load(Ordering::SeqCst), 6 * 1000);
    assert_eq!(fx.host.last_transition(), Some((VmState::Running, VmState::Paused)));
    assert_eq!(fx.cpu.bus_faults.load(Ordering::SeqCst), 0);
}

#[test]
fn cpu_thread_pauses_between_frames() {
    let (fx, mut vm) = booted(Options {
        graphics_vsync_delay: Duration::from_millis(2),
        coprocessor_delay: Duration::from_millis(1),
        threaded_coprocessor: true,
        ..Options::default()
    });
    set_setting(&mut vm, "Emulation", "FrameLimit", true);
    vm.apply_settings().unwrap();
    let cpu = CpuThread::spawn(vm).unwrap();
    cpu.set_state(VmState::Running).unwrap();
    assert_eq!(cpu.state(), VmState::Running);
    std::thread::sleep(Duration::from_millis(100));
    cpu.set_state(VmState::Paused).unwrap();
    assert_eq!(cpu.state(), VmState::Paused);

    let (frames, gs, cop) = cpu
        .run_sync(|vm| (vm.perf().frames(), vm.graphics_stats(), vm.coprocessor_stats()))
        .unwrap();
    assert!(frames > 0);
    assert_eq!(gs.submitted, gs.completed);
    assert_eq!(cop.submitted, cop.completed);
    assert_eq!(fx.graphics_vsyncs.load(Ordering::SeqCst), frames);
    assert_eq!(fx.coprocessor_cycles.load(Ordering::SeqCst), frames * 1000);

    // Nothing runs while paused.
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(fx.graphics_vsyncs.load(Ordering::SeqCst), frames);

    let vm = cpu.join().unwrap();
    assert_eq!(vm.state(), VmState::Shutdown);
    assert_eq!(fx.cpu.bus_faults.load(Ordering::SeqCst), 0);
    assert_eq!(fx.journal.count("close:graphics"), 1);
}

#[test]
fn slot_round_trip_restores_memory_and_cpu() {
    let (fx, mut vm) = booted(slow_threads());
    vm.set_state(VmState::Running).unwrap();
    for _ in 0..5 {
        vm.run_frame().unwrap();
    }
    vm.save_state_to_slot(1).unwrap();
    let saved_ram = guest_ram(&vm);
    let saved_pc = fx.cpu.pc.load(Ordering::SeqCst);
    let saved_cycles = fx.coprocessor_cycles.load(Ordering::SeqCst);
    assert_eq!(saved_cycles, 5 * 1000);

    for _ in 0..7 {
        vm.run_frame().unwrap();
    }
    assert_ne!(guest_ram(&vm), saved_ram);

    vm.load_state_from_slot(1).unwrap();
    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(guest_ram(&vm), saved_ram);
    assert_eq!(fx.cpu.pc.load(Ordering::SeqCst), saved_pc);
    assert_eq!(fx.cpu.frames.load(Ordering::SeqCst), 5);
    assert_eq!(fx.coprocessor_cycles.load(Ordering::SeqCst), saved_cycles);
    assert_eq!(vm.memory_mut().read32(COUNTER_ADDR).unwrap(), 5);

    // Execution continues from the restored point.
    vm.run_frame().unwrap();
    assert_eq!(vm.memory_mut().read32(COUNTER_ADDR).unwrap(), 6);
    assert_eq!(fx.cpu.bus_faults.load(Ordering::SeqCst), 0);
}

#[test]
fn settings_changes_only_touch_affected_subsystems() {
    let (fx, mut vm) = booted(Options::default());
    vm.set_state(VmState::Running).unwrap();
    vm.run_frame().unwrap();
    fx.journal.clear();

    set_setting(&mut vm, "Audio", "Volume", 40i64);
    vm.apply_settings().unwrap();
    assert_eq!(fx.journal.events(), vec!["apply:audio"]);
    assert_eq!(vm.config().audio.volume, 40);
    assert_eq!(vm.state(), VmState::Running);

    fx.journal.clear();
    set_setting(&mut vm, "Graphics", "Renderer", "vulkan");
    vm.apply_settings().unwrap();
    assert_eq!(fx.journal.events(), vec!["close:graphics", "open:graphics"]);

    fx.journal.clear();
    set_setting(&mut vm, "Audio", "Backend", "cubeb");
    vm.apply_settings().unwrap();
    assert_eq!(
        fx.journal.events(),
        vec!["close:audio", "audio-backend:cubeb", "open:audio"]
    );

    // Reopened subsystems keep their place in the release order.
    fx.journal.clear();
    vm.shutdown(false).unwrap();
    assert_eq!(
        fx.journal.events(),
        vec![
            "close:expansion",
            "close:network",
            "close:input",
            "close:audio",
            "close:graphics",
            "close:media",
        ]
    );
}

#[test]
fn firmware_change_waits_for_the_next_boot() {
    let (fx, mut vm) = booted(Options::default());
    fx.journal.clear();
    set_setting(&mut vm, "Firmware", "Path", "/nonexistent/firmware.bin");
    vm.apply_settings().unwrap();
    assert!(fx.journal.events().is_empty());
    assert_eq!(vm.state(), VmState::Paused);
    assert!(fx
        .host
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|(level, m)| *level == MessageLevel::Info && m.contains("next boot")));
}

#[test]
fn failed_reopen_shuts_the_vm_down() {
    let (fx, mut vm) = booted(Options::default());
    vm.set_state(VmState::Running).unwrap();
    vm.run_frame().unwrap();

    fx.journal.clear();
    *fx.fail_open.lock().unwrap() = Some("network");
    set_setting(&mut vm, "Network", "Enabled", true);
    let err = vm.apply_settings().unwrap_err();
    assert!(matches!(err, VmError::Open { subsystem: "network", .. }), "{err}");
    assert_eq!(vm.state(), VmState::Shutdown);
    assert!(!vm.memory().is_committed());
    assert_eq!(
        fx.journal.events(),
        vec![
            "close:network",
            "fail:network",
            "close:expansion",
            "close:input",
            "close:audio",
            "close:graphics",
            "close:media",
        ]
    );
    assert!(fx.host.errors()[0].starts_with("Failed to apply Network settings"));
}

#[test]
fn queued_saves_all_land_before_flush_returns() {
    let (fx, mut vm) = booted(Options::default());
    vm.set_state(VmState::Running).unwrap();
    vm.run_frame().unwrap();
    vm.save_state_to_slot(1).unwrap();
    vm.run_frame().unwrap();
    vm.save_state_to_slot(2).unwrap();
    vm.run_frame().unwrap();
    vm.save_state_to_slot(2).unwrap();
    vm.wait_for_save_state_flush();

    let slot1 = vm.slot_path(1);
    let slot2 = vm.slot_path(2);
    assert!(slot1.is_file());
    assert!(slot2.is_file());
    assert!(backup_path(&slot2).is_file());
    assert!(!backup_path(&slot1).exists());

    let saved: Vec<String> = fx
        .host
        .messages
        .lock()
        .unwrap()
        .iter()
        .filter(|(level, m)| *level == MessageLevel::Info && m.starts_with("State saved to"))
        .map(|(_, m)| m.clone())
        .collect();
    assert_eq!(saved.len(), 3);
    assert!(saved[0].contains(".01.kss"));
    assert!(saved[2].contains(".02.kss"));

    // The newest write wins; the backup holds the one before it.
    vm.load_state_from_slot(2).unwrap();
    assert_eq!(vm.memory_mut().read32(COUNTER_ADDR).unwrap(), 3);
    vm.load_state(&backup_path(&slot2)).unwrap();
    assert_eq!(vm.memory_mut().read32(COUNTER_ADDR).unwrap(), 2);
}
