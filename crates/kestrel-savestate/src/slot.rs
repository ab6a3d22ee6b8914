use std::path::{Path, PathBuf};

/// Slot written by a shutdown that saves a resume state.
pub const RESUME_SLOT: u8 = 0;
pub const NUM_SAVE_SLOTS: u8 = 10;
pub const SAVE_STATE_EXTENSION: &str = "kss";

/// `"{serial} ({crc:08X}).{slot:02}.kss"`
pub fn slot_file_name(serial: &str, crc: u32, slot: u8) -> String {
    format!("{serial} ({crc:08X}).{slot:02}.{SAVE_STATE_EXTENSION}")
}

pub fn slot_path(dir: &Path, serial: &str, crc: u32, slot: u8) -> PathBuf {
    dir.join(slot_file_name(serial, crc, slot))
}
