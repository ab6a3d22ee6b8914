//! Background save writer.
//!
//! Content capture (freezing every subsystem into a blob) happens synchronously on the caller's
//! thread. Compression and the file write are handed to a single worker thread so requests
//! complete in submission order. [`SaveQueue::flush`] blocks until everything queued so far has
//! been written.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::archive::{save_to_file, Compression};
use crate::error::{Result, SaveStateError};

#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub path: PathBuf,
    pub blob: Vec<u8>,
    pub compression: Compression,
    pub backup: bool,
}

/// Result of one queued save, passed to the completion callback on the worker thread.
#[derive(Debug)]
pub struct SaveOutcome {
    pub path: PathBuf,
    pub result: Result<()>,
}

type CompletionCallback = Box<dyn Fn(&SaveOutcome) + Send + 'static>;

#[derive(Default)]
struct Progress {
    pending: usize,
    completed: u64,
    failed: u64,
}

#[derive(Default)]
struct Shared {
    progress: Mutex<Progress>,
    idle: Condvar,
}

pub struct SaveQueue {
    sender: Option<mpsc::Sender<SaveRequest>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SaveQueue {
    pub fn new(on_complete: impl Fn(&SaveOutcome) + Send + 'static) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<SaveRequest>();
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let on_complete: CompletionCallback = Box::new(on_complete);
        let worker = thread::Builder::new()
            .name("kestrel-save".to_string())
            .spawn(move || run_worker(receiver, worker_shared, on_complete))?;
        Ok(Self {
            sender: Some(sender),
            shared,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, request: SaveRequest) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(SaveStateError::QueueClosed)?;
        self.lock().pending += 1;
        if sender.send(request).is_err() {
            self.finish(false);
            return Err(SaveStateError::QueueClosed);
        }
        Ok(())
    }

    /// Blocks until every save submitted before this call has been written (or has failed).
    pub fn flush(&self) {
        let mut progress = self.lock();
        while progress.pending > 0 {
            progress = self
                .shared
                .idle
                .wait(progress)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// `(completed, failed)` totals since creation.
    pub fn totals(&self) -> (u64, u64) {
        let progress = self.lock();
        (progress.completed, progress.failed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        lock_progress(&self.shared)
    }

    fn finish(&self, ok: bool) {
        finish(&self.shared, ok);
    }
}

impl Drop for SaveQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("save worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for SaveQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_worker(receiver: mpsc::Receiver<SaveRequest>, shared: Arc<Shared>, on_complete: CompletionCallback) {
    for request in receiver {
        let result = save_to_file(&request.path, &request.blob, request.compression, request.backup);
        let ok = result.is_ok();
        if let Err(err) = &result {
            tracing::warn!(path = %request.path.display(), "failed to write save state: {err}");
        }
        let outcome = SaveOutcome {
            path: request.path,
            result,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| on_complete(&outcome))).is_err() {
            tracing::error!(path = %outcome.path.display(), "save completion callback panicked");
        }
        finish(&shared, ok);
    }
}

fn lock_progress(shared: &Shared) -> std::sync::MutexGuard<'_, Progress> {
    shared
        .progress
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn finish(shared: &Shared, ok: bool) {
    let mut progress = lock_progress(shared);
    progress.pending -= 1;
    if ok {
        progress.completed += 1;
    } else {
        progress.failed += 1;
    }
    if progress.pending == 0 {
        shared.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::load_from_file;

    #[test]
    fn flush_waits_for_every_queued_save() {
        let dir = tempfile::tempdir().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        let queue = SaveQueue::new(move |outcome| {
            assert!(outcome.result.is_ok());
            sink.lock().unwrap().push(outcome.path.clone());
        })
        .unwrap();

        let paths: Vec<_> = (0..4).map(|i| dir.path().join(format!("{i}.kss"))).collect();
        for (i, path) in paths.iter().enumerate() {
            queue
                .submit(SaveRequest {
                    path: path.clone(),
                    blob: vec![i as u8; 64 * 1024],
                    compression: Compression::Lz4,
                    backup: false,
                })
                .unwrap();
        }
        queue.flush();

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.totals(), (4, 0));
        assert_eq!(*order.lock().unwrap(), paths);
        assert_eq!(load_from_file(&paths[3]).unwrap(), vec![3u8; 64 * 1024]);
    }

    #[test]
    fn failures_are_reported_and_still_flush() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected makes the write fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let failures = Arc::new(Mutex::new(0));
        let sink = failures.clone();
        let queue = SaveQueue::new(move |outcome| {
            if outcome.result.is_err() {
                *sink.lock().unwrap() += 1;
            }
        })
        .unwrap();
        queue
            .submit(SaveRequest {
                path: blocker.join("slot.kss"),
                blob: vec![1, 2, 3],
                compression: Compression::None,
                backup: false,
            })
            .unwrap();
        queue.flush();
        assert_eq!(*failures.lock().unwrap(), 1);
        assert_eq!(queue.totals(), (0, 1));
    }

    #[test]
    fn panicking_callback_does_not_stall_flush() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SaveQueue::new(|_| panic!("callback failed")).unwrap();
        let paths: Vec<_> = (0..2).map(|i| dir.path().join(format!("{i}.kss"))).collect();
        for path in &paths {
            queue
                .submit(SaveRequest {
                    path: path.clone(),
                    blob: vec![7; 32],
                    compression: Compression::None,
                    backup: false,
                })
                .unwrap();
        }

        queue.flush();
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.totals(), (2, 0));
        for path in &paths {
            assert_eq!(load_from_file(path).unwrap(), vec![7; 32]);
        }
    }
}
