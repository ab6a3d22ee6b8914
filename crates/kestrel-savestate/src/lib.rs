//! Save-state container format, freeze/thaw driver and asynchronous writer.

mod archive;
mod error;
mod format;
pub mod io;
mod section;
mod slot;
mod worker;

pub use archive::{
    backup_path, inspect, load_from_file, read_archive, save_to_file, write_archive, Compression,
    SaveStateInfo, SectionInfo,
};
pub use error::{Result, SaveStateError};
pub use format::{
    SectionTag, ARCHIVE_HEADER_LEN, ARCHIVE_MAGIC, ARCHIVE_VERSION, BLOB_MAGIC, BLOB_VERSION,
    SECTION_HEADER_LEN,
};
pub use section::{freeze_sections, parse_blob, thaw_sections, validate_sections, Freeze, Section};
pub use slot::{slot_file_name, slot_path, NUM_SAVE_SLOTS, RESUME_SLOT, SAVE_STATE_EXTENSION};
pub use worker::{SaveOutcome, SaveQueue, SaveRequest};
