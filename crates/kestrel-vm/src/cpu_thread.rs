//! Hosts a [`VmSession`] on its own OS thread.
//!
//! Lifecycle requests are sent over a channel and answered once the session has handled them.
//! While the VM is Running the thread executes frames between requests; otherwise it blocks on
//! the channel.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::boot::BootParameters;
use crate::coordinator::ThreadExited;
use crate::error::Result;
use crate::session::VmSession;
use crate::state::VmState;

const THREAD_NAME: &str = "cpu";

#[derive(Debug, Clone)]
pub enum VmRequest {
    Initialize(BootParameters),
    SetState(VmState),
    ApplySettings,
    Reset,
    SaveState(PathBuf),
    SaveStateToSlot(u8),
    LoadState(PathBuf),
    LoadStateFromSlot(u8),
    WaitForSaveStateFlush,
    Shutdown { save_resume_state: bool },
}

type Call = Box<dyn FnOnce(&mut VmSession) + Send + 'static>;

enum Command {
    Request(VmRequest, mpsc::SyncSender<Result<()>>),
    Call(Call),
}

pub struct CpuThread {
    sender: Option<Sender<Command>>,
    state: Arc<Mutex<VmState>>,
    handle: Option<JoinHandle<VmSession>>,
}

impl CpuThread {
    pub fn spawn(session: VmSession) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let state = Arc::new(Mutex::new(session.state()));
        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name("kestrel-cpu".to_string())
            .spawn(move || run(session, receiver, thread_state))?;
        Ok(Self {
            sender: Some(sender),
            state,
            handle: Some(handle),
        })
    }

    /// The state as of the last handled request.
    pub fn state(&self) -> VmState {
        *lock(&self.state)
    }

    /// Sends `request` and waits for the session to handle it.
    pub fn request(&self, request: VmRequest) -> Result<()> {
        let (reply, response) = mpsc::sync_channel(1);
        self.send(Command::Request(request, reply))?;
        response.recv().map_err(|_| ThreadExited(THREAD_NAME))?
    }

    /// Runs `f` against the session on the CPU thread, between frames.
    pub fn run_sync<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut VmSession) -> R + Send + 'static,
    ) -> Result<R> {
        let (reply, response) = mpsc::sync_channel(1);
        self.send(Command::Call(Box::new(move |session| {
            let _ = reply.send(f(session));
        })))?;
        Ok(response.recv().map_err(|_| ThreadExited(THREAD_NAME))?)
    }

    pub fn initialize(&self, boot: BootParameters) -> Result<()> {
        self.request(VmRequest::Initialize(boot))
    }

    pub fn set_state(&self, state: VmState) -> Result<()> {
        self.request(VmRequest::SetState(state))
    }

    pub fn apply_settings(&self) -> Result<()> {
        self.request(VmRequest::ApplySettings)
    }

    pub fn reset(&self) -> Result<()> {
        self.request(VmRequest::Reset)
    }

    pub fn save_state_to_slot(&self, slot: u8) -> Result<()> {
        self.request(VmRequest::SaveStateToSlot(slot))
    }

    pub fn load_state_from_slot(&self, slot: u8) -> Result<()> {
        self.request(VmRequest::LoadStateFromSlot(slot))
    }

    pub fn wait_for_save_state_flush(&self) -> Result<()> {
        self.request(VmRequest::WaitForSaveStateFlush)
    }

    pub fn shutdown(&self, save_resume_state: bool) -> Result<()> {
        self.request(VmRequest::Shutdown { save_resume_state })
    }

    /// Shuts the VM down, stops the thread and returns the session.
    pub fn join(mut self) -> Result<VmSession> {
        self.stop().ok_or_else(|| ThreadExited(THREAD_NAME).into())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or(ThreadExited(THREAD_NAME))?
            .send(command)
            .map_err(|_| ThreadExited(THREAD_NAME).into())
    }

    fn stop(&mut self) -> Option<VmSession> {
        self.sender.take();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(session) => Some(session),
            Err(_) => {
                error!("CPU thread panicked");
                None
            }
        }
    }
}

impl Drop for CpuThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(state: &Mutex<VmState>) -> MutexGuard<'_, VmState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dispatch(session: &mut VmSession, request: VmRequest) -> Result<()> {
    debug!(?request, "handling VM request");
    match request {
        VmRequest::Initialize(boot) => session.initialize(boot),
        VmRequest::SetState(state) => session.set_state(state),
        VmRequest::ApplySettings => session.apply_settings(),
        VmRequest::Reset => session.reset(),
        VmRequest::SaveState(path) => session.save_state(path),
        VmRequest::SaveStateToSlot(slot) => session.save_state_to_slot(slot),
        VmRequest::LoadState(path) => session.load_state(&path),
        VmRequest::LoadStateFromSlot(slot) => session.load_state_from_slot(slot),
        VmRequest::WaitForSaveStateFlush => {
            session.wait_for_save_state_flush();
            Ok(())
        }
        VmRequest::Shutdown { save_resume_state } => session.shutdown(save_resume_state),
    }
}

fn run(mut session: VmSession, receiver: Receiver<Command>, state: Arc<Mutex<VmState>>) -> VmSession {
    loop {
        let command = if session.state() == VmState::Running {
            match receiver.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match command {
            Some(Command::Request(request, reply)) => {
                let result = dispatch(&mut session, request);
                *lock(&state) = session.state();
                let _ = reply.send(result);
            }
            Some(Command::Call(call)) => {
                call(&mut session);
                *lock(&state) = session.state();
            }
            None => {
                if let Err(err) = session.run_frame() {
                    error!(error = %err, "frame failed, pausing");
                    if let Err(err) = session.set_state(VmState::Paused) {
                        error!(error = %err, "failed to pause after a frame error");
                    }
                    *lock(&state) = session.state();
                }
            }
        }
    }

    if let Err(err) = session.shutdown(false) {
        error!(error = %err, "shutdown on CPU thread exit failed");
    }
    *lock(&state) = session.state();
    session
}
