//! Cross-thread coordination for the co-processor and graphics threads.
//!
//! An [`ExecutionThread`] owns a context value on a dedicated OS thread and runs jobs against it
//! in submission order. Callers can block until the thread is quiescent (queue empty and no job
//! running), run a job synchronously, or queue a keyed one-shot job that is dropped while an
//! identical request is still pending.
//!
//! [`Worker`] wraps the same interface around a context that may instead run inline on the
//! caller's thread, so a subsystem can be moved on and off its thread at runtime.

use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution thread `{0}` has exited")]
pub struct ThreadExited(pub &'static str);

type JobFn<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

struct Job<C> {
    token: Option<&'static str>,
    run: JobFn<C>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadStats {
    pub submitted: u64,
    pub completed: u64,
}

struct Queue<C> {
    jobs: VecDeque<Job<C>>,
    tokens: HashSet<&'static str>,
    busy: bool,
    shutdown: bool,
    stats: ThreadStats,
}

struct Shared<C> {
    queue: Mutex<Queue<C>>,
    work: Condvar,
    idle: Condvar,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Queue<C>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ExecutionThread<C: Send + 'static> {
    name: &'static str,
    shared: Arc<Shared<C>>,
    handle: Option<JoinHandle<C>>,
}

impl<C: Send + 'static> ExecutionThread<C> {
    pub fn spawn(name: &'static str, ctx: C) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                tokens: HashSet::new(),
                busy: false,
                shutdown: false,
                stats: ThreadStats::default(),
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("kestrel-{name}"))
            .spawn(move || run_loop(name, thread_shared, ctx))?;
        tracing::debug!(thread = name, "started execution thread");
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn submit(&self, job: impl FnOnce(&mut C) + Send + 'static) {
        self.push(None, Box::new(job));
    }

    /// Queues `job` unless a job with the same `token` is still waiting to run. Returns whether it
    /// was queued.
    pub fn submit_once(&self, token: &'static str, job: impl FnOnce(&mut C) + Send + 'static) -> bool {
        self.push(Some(token), Box::new(job))
    }

    /// Runs `f` on the thread and waits for its result.
    pub fn run_sync<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut C) -> R + Send + 'static,
    ) -> Result<R, ThreadExited> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(move |ctx| {
            let _ = tx.send(f(ctx));
        });
        rx.recv().map_err(|_| ThreadExited(self.name))
    }

    /// Blocks until the queue is empty and no job is running.
    pub fn wait_for_quiescence(&self) {
        let mut queue = self.shared.lock();
        while queue.busy || !queue.jobs.is_empty() {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn is_quiescent(&self) -> bool {
        let queue = self.shared.lock();
        !queue.busy && queue.jobs.is_empty()
    }

    pub fn stats(&self) -> ThreadStats {
        self.shared.lock().stats
    }

    /// Drains the queue, stops the thread and hands the context back.
    pub fn join(mut self) -> Result<C, ThreadExited> {
        self.stop().ok_or(ThreadExited(self.name))
    }

    fn push(&self, token: Option<&'static str>, run: JobFn<C>) -> bool {
        let mut queue = self.shared.lock();
        if let Some(token) = token {
            if !queue.tokens.insert(token) {
                return false;
            }
        }
        queue.jobs.push_back(Job { token, run });
        queue.stats.submitted += 1;
        self.shared.work.notify_one();
        true
    }

    fn stop(&mut self) -> Option<C> {
        let handle = self.handle.take()?;
        self.shared.lock().shutdown = true;
        self.shared.work.notify_one();
        match handle.join() {
            Ok(ctx) => Some(ctx),
            Err(_) => {
                tracing::error!(thread = self.name, "execution thread panicked");
                None
            }
        }
    }
}

impl<C: Send + 'static> Drop for ExecutionThread<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<C>(name: &'static str, shared: Arc<Shared<C>>, mut ctx: C) -> C {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    if let Some(token) = job.token {
                        queue.tokens.remove(token);
                    }
                    queue.busy = true;
                    break job;
                }
                if queue.shutdown {
                    return ctx;
                }
                queue = shared
                    .work
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        if catch_unwind(AssertUnwindSafe(|| (job.run)(&mut ctx))).is_err() {
            tracing::error!(thread = name, "job panicked");
        }

        let mut queue = shared.lock();
        queue.busy = false;
        queue.stats.completed += 1;
        if queue.jobs.is_empty() {
            shared.idle.notify_all();
        }
    }
}

enum Mode<C: Send + 'static> {
    Inline { ctx: C, stats: ThreadStats },
    Threaded(ExecutionThread<C>),
    /// Only observable if moving the context between modes failed.
    Lost,
}

/// A context that runs either inline on the caller's thread or on its own [`ExecutionThread`].
pub struct Worker<C: Send + 'static> {
    name: &'static str,
    mode: Mode<C>,
}

impl<C: Send + 'static> Worker<C> {
    pub fn inline(name: &'static str, ctx: C) -> Self {
        Self {
            name,
            mode: Mode::Inline {
                ctx,
                stats: ThreadStats::default(),
            },
        }
    }

    pub fn threaded(name: &'static str, ctx: C) -> std::io::Result<Self> {
        Ok(Self {
            name,
            mode: Mode::Threaded(ExecutionThread::spawn(name, ctx)?),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self.mode, Mode::Threaded(_))
    }

    /// Moves the context onto (or off) its own thread. Pending work is drained first.
    pub fn set_threaded(&mut self, threaded: bool) -> Result<(), crate::VmError> {
        if self.is_threaded() == threaded {
            return Ok(());
        }
        let ctx = match std::mem::replace(&mut self.mode, Mode::Lost) {
            Mode::Inline { ctx, .. } => ctx,
            Mode::Threaded(thread) => thread.join()?,
            Mode::Lost => return Err(ThreadExited(self.name).into()),
        };
        self.mode = if threaded {
            Mode::Threaded(ExecutionThread::spawn(self.name, ctx)?)
        } else {
            Mode::Inline {
                ctx,
                stats: ThreadStats::default(),
            }
        };
        tracing::info!(worker = self.name, threaded, "moved worker");
        Ok(())
    }

    pub fn submit(&mut self, job: impl FnOnce(&mut C) + Send + 'static) {
        match &mut self.mode {
            Mode::Inline { ctx, stats } => {
                stats.submitted += 1;
                job(ctx);
                stats.completed += 1;
            }
            Mode::Threaded(thread) => thread.submit(job),
            Mode::Lost => tracing::warn!(worker = self.name, "dropped job for lost worker"),
        }
    }

    /// See [`ExecutionThread::submit_once`]. Inline workers run the job immediately.
    pub fn submit_once(&mut self, token: &'static str, job: impl FnOnce(&mut C) + Send + 'static) -> bool {
        if let Mode::Threaded(thread) = &self.mode {
            return thread.submit_once(token, job);
        }
        self.submit(job);
        true
    }

    pub fn run_sync<R: Send + 'static>(
        &mut self,
        f: impl FnOnce(&mut C) -> R + Send + 'static,
    ) -> Result<R, ThreadExited> {
        match &mut self.mode {
            Mode::Inline { ctx, stats } => {
                stats.submitted += 1;
                let result = f(ctx);
                stats.completed += 1;
                Ok(result)
            }
            Mode::Threaded(thread) => thread.run_sync(f),
            Mode::Lost => Err(ThreadExited(self.name)),
        }
    }

    pub fn wait_for_quiescence(&self) {
        if let Mode::Threaded(thread) = &self.mode {
            thread.wait_for_quiescence();
        }
    }

    pub fn stats(&self) -> ThreadStats {
        match &self.mode {
            Mode::Inline { stats, .. } => *stats,
            Mode::Threaded(thread) => thread.stats(),
            Mode::Lost => ThreadStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order_and_quiesce() {
        let thread = ExecutionThread::spawn("order", Vec::new()).unwrap();
        for i in 0..100 {
            thread.submit(move |log: &mut Vec<i32>| log.push(i));
        }
        thread.wait_for_quiescence();
        assert!(thread.is_quiescent());
        assert_eq!(
            thread.stats(),
            ThreadStats {
                submitted: 100,
                completed: 100
            }
        );
        let log = thread.join().unwrap();
        assert_eq!(log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn quiescence_waits_for_the_running_job() {
        let thread = ExecutionThread::spawn("slow", 0u32).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        thread.submit(move |_| {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        thread.wait_for_quiescence();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn one_shot_jobs_are_not_duplicated_while_pending() {
        let thread = ExecutionThread::spawn("once", 0u32).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        // Hold the thread so the one-shot jobs stay queued.
        thread.submit(move |_| {
            let _ = release_rx.recv();
        });
        assert!(thread.submit_once("capture", |n| *n += 1));
        assert!(!thread.submit_once("capture", |n| *n += 1));
        release_tx.send(()).unwrap();
        thread.wait_for_quiescence();
        assert!(thread.submit_once("capture", |n| *n += 1));
        assert_eq!(thread.run_sync(|n| *n), Ok(2));
    }

    #[test]
    fn panicking_job_does_not_wedge_the_thread() {
        let thread = ExecutionThread::spawn("panic", 1u32).unwrap();
        thread.submit(|_| panic!("boom"));
        thread.wait_for_quiescence();
        assert_eq!(thread.run_sync(|n| *n + 1), Ok(2));
    }

    #[test]
    fn worker_moves_between_modes_keeping_its_context() {
        let mut worker = Worker::inline("coproc", 0u64);
        worker.submit(|n| *n += 5);
        assert_eq!(worker.stats().completed, 1);

        worker.set_threaded(true).unwrap();
        assert!(worker.is_threaded());
        worker.submit(|n| *n *= 2);
        worker.wait_for_quiescence();
        assert_eq!(worker.run_sync(|n| *n).unwrap(), 10);

        worker.set_threaded(false).unwrap();
        assert_eq!(worker.run_sync(|n| *n).unwrap(), 10);
    }
}
