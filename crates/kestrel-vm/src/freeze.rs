//! Adapters that expose the session's subsystems as save-state sections.

use kestrel_mem::MemoryManager;
use kestrel_savestate::io::{Fields, PutLe};
use kestrel_savestate::{Freeze, SaveStateError, SectionTag};

use crate::backend::{BackendError, Coprocessor, DeviceBackend, GuestCpu};
use crate::coordinator::{ThreadExited, Worker};

const MEMORY_STATE_VERSION: u32 = 1;

/// Uniform save/load access to the collaborator traits.
pub(crate) trait StateHooks {
    fn hooks_version(&self) -> u32;
    fn save_section(&mut self, out: &mut Vec<u8>) -> Result<(), BackendError>;
    fn load_section(&mut self, payload: &[u8]) -> Result<(), BackendError>;
}

impl StateHooks for Box<dyn GuestCpu> {
    fn hooks_version(&self) -> u32 {
        self.state_version()
    }

    fn save_section(&mut self, out: &mut Vec<u8>) -> Result<(), BackendError> {
        self.save_state(out);
        Ok(())
    }

    fn load_section(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        self.load_state(payload)
    }
}

impl StateHooks for Box<dyn Coprocessor> {
    fn hooks_version(&self) -> u32 {
        self.state_version()
    }

    fn save_section(&mut self, out: &mut Vec<u8>) -> Result<(), BackendError> {
        self.save_state(out);
        Ok(())
    }

    fn load_section(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        self.load_state(payload)
    }
}

impl StateHooks for Box<dyn DeviceBackend> {
    fn hooks_version(&self) -> u32 {
        self.state_version()
    }

    fn save_section(&mut self, out: &mut Vec<u8>) -> Result<(), BackendError> {
        self.save_state(out)
    }

    fn load_section(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        self.load_state(payload)
    }
}

/// A subsystem owned by the CPU thread.
pub(crate) struct HookSection<'a, S> {
    tag: SectionTag,
    state: &'a mut S,
}

impl<'a, S: StateHooks> HookSection<'a, S> {
    pub(crate) fn new(tag: SectionTag, state: &'a mut S) -> Self {
        Self { tag, state }
    }
}

impl<S: StateHooks> Freeze for HookSection<'_, S> {
    fn tag(&self) -> SectionTag {
        self.tag
    }

    fn version(&self) -> u32 {
        self.state.hooks_version()
    }

    fn freeze(&mut self, out: &mut Vec<u8>) -> kestrel_savestate::Result<()> {
        self.state
            .save_section(out)
            .map_err(|err| SaveStateError::hook(self.tag, err.0))
    }

    fn thaw(&mut self, payload: &[u8]) -> kestrel_savestate::Result<()> {
        self.state
            .load_section(payload)
            .map_err(|err| SaveStateError::hook(self.tag, err.0))
    }
}

/// A subsystem that may live on its own thread. Its hooks run on that thread.
pub(crate) struct ThreadSection<'a, S: Send + 'static> {
    tag: SectionTag,
    version: u32,
    worker: &'a mut Worker<S>,
}

impl<'a, S: StateHooks + Send + 'static> ThreadSection<'a, S> {
    pub(crate) fn new(tag: SectionTag, worker: &'a mut Worker<S>) -> Result<Self, ThreadExited> {
        let version = worker.run_sync(|state| state.hooks_version())?;
        Ok(Self { tag, version, worker })
    }
}

impl<S: StateHooks + Send + 'static> Freeze for ThreadSection<'_, S> {
    fn tag(&self) -> SectionTag {
        self.tag
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn freeze(&mut self, out: &mut Vec<u8>) -> kestrel_savestate::Result<()> {
        let tag = self.tag;
        let payload = self
            .worker
            .run_sync(|state| {
                let mut buf = Vec::new();
                state.save_section(&mut buf).map(|()| buf)
            })
            .map_err(|err| SaveStateError::hook(tag, err.to_string()))?
            .map_err(|err| SaveStateError::hook(tag, err.0))?;
        out.extend_from_slice(&payload);
        Ok(())
    }

    fn thaw(&mut self, payload: &[u8]) -> kestrel_savestate::Result<()> {
        let tag = self.tag;
        let payload = payload.to_vec();
        self.worker
            .run_sync(move |state| state.load_section(&payload))
            .map_err(|err| SaveStateError::hook(tag, err.to_string()))?
            .map_err(|err| SaveStateError::hook(tag, err.0))
    }
}

/// Guest RAM followed by the scratchpad, each prefixed with its length.
pub(crate) struct MemorySection<'a>(pub &'a mut MemoryManager);

fn not_committed() -> SaveStateError {
    SaveStateError::hook(SectionTag::MEMORY, "guest memory is not committed")
}

fn check_len(name: &str, guest: Option<&[u8]>, state: &[u8]) -> kestrel_savestate::Result<()> {
    let guest = guest.ok_or_else(not_committed)?;
    if guest.len() != state.len() {
        return Err(SaveStateError::hook(
            SectionTag::MEMORY,
            format!(
                "{name} size mismatch: state holds {:#x} bytes, guest has {:#x}",
                state.len(),
                guest.len()
            ),
        ));
    }
    Ok(())
}

impl Freeze for MemorySection<'_> {
    fn tag(&self) -> SectionTag {
        SectionTag::MEMORY
    }

    fn version(&self) -> u32 {
        MEMORY_STATE_VERSION
    }

    fn freeze(&mut self, out: &mut Vec<u8>) -> kestrel_savestate::Result<()> {
        out.put_prefixed(self.0.ram().ok_or_else(not_committed)?)?;
        out.put_prefixed(self.0.scratchpad().ok_or_else(not_committed)?)?;
        Ok(())
    }

    fn thaw(&mut self, payload: &[u8]) -> kestrel_savestate::Result<()> {
        let mut fields = Fields::new(payload, "truncated memory section");
        let ram = fields.prefixed()?;
        let scratchpad = fields.prefixed()?;
        fields.finish("trailing bytes in memory section")?;
        // Both sizes are checked before either buffer is written.
        check_len("RAM", self.0.ram(), ram)?;
        check_len("scratchpad", self.0.scratchpad(), scratchpad)?;
        self.0.ram_mut().ok_or_else(not_committed)?.copy_from_slice(ram);
        self.0
            .scratchpad_mut()
            .ok_or_else(not_committed)?
            .copy_from_slice(scratchpad);
        Ok(())
    }
}
