use std::io;

use thiserror::Error;

use crate::format::SectionTag;

pub type Result<T> = std::result::Result<T, SaveStateError>;

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid save state magic")]
    InvalidMagic,

    #[error("unsupported save state version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt save state: {0}")]
    Corrupt(&'static str),

    #[error("save state section {index} is `{found}`, expected `{expected}`")]
    UnexpectedSection {
        index: usize,
        expected: SectionTag,
        found: SectionTag,
    },

    #[error("save state section `{tag}` has version {found}, expected {expected}")]
    SectionVersion {
        tag: SectionTag,
        expected: u32,
        found: u32,
    },

    #[error("save state is missing section `{0}`")]
    MissingSection(SectionTag),

    #[error("save state has {0} unexpected trailing section(s)")]
    ExtraSections(usize),

    #[error("section `{tag}` payload of {len} bytes does not fit in a section")]
    SectionTooLarge { tag: SectionTag, len: usize },

    #[error("section `{tag}`: {message}")]
    Hook { tag: SectionTag, message: String },

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("save queue is shut down")]
    QueueClosed,
}

impl SaveStateError {
    /// Error raised by a freeze/thaw hook for its own section.
    pub fn hook(tag: SectionTag, message: impl Into<String>) -> Self {
        SaveStateError::Hook {
            tag,
            message: message.into(),
        }
    }
}
