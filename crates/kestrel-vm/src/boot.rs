use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BootSource {
    /// Boot the firmware shell with no media.
    #[default]
    Firmware,
    /// Boot a disc image.
    Disc,
    /// Boot an executable directly.
    Executable,
}

/// Everything needed to start one guest. Consumed by [`VmSession::initialize`].
///
/// [`VmSession::initialize`]: crate::VmSession::initialize
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootParameters {
    pub source: BootSource,
    /// Media or executable path; unused for [`BootSource::Firmware`].
    pub filename: Option<PathBuf>,
    /// Executable to run instead of the one on the boot media.
    pub elf_override: Option<PathBuf>,
    /// Save state to restore once every subsystem is open.
    pub save_state: Option<PathBuf>,
    /// Skip the firmware splash and jump straight into the title.
    pub fast_boot: bool,
}

impl BootParameters {
    pub fn firmware() -> Self {
        Self::default()
    }

    pub fn disc(path: impl Into<PathBuf>) -> Self {
        Self {
            source: BootSource::Disc,
            filename: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn executable(path: impl Into<PathBuf>) -> Self {
        Self {
            source: BootSource::Executable,
            filename: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_save_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_state = Some(path.into());
        self
    }

    pub fn with_elf_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.elf_override = Some(path.into());
        self
    }

    pub fn with_fast_boot(mut self, fast_boot: bool) -> Self {
        self.fast_boot = fast_boot;
        self
    }
}
