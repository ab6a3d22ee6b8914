use std::fmt;

/// Lifecycle state of a [`VmSession`](crate::VmSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VmState {
    /// No guest is loaded and guest memory is decommitted.
    #[default]
    Shutdown,
    /// Subsystems are being opened.
    Initializing,
    Paused,
    Running,
    /// Subsystems are being released.
    Stopping,
}

impl VmState {
    /// A guest is loaded and every subsystem is open.
    pub fn is_valid(self) -> bool {
        matches!(self, VmState::Paused | VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Shutdown => write!(f, "shutdown"),
            VmState::Initializing => write!(f, "initializing"),
            VmState::Paused => write!(f, "paused"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
        }
    }
}
