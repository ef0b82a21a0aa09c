//! Dedicated-thread FIFO task runner
//!
//! Tasks run one at a time in submission order. A task that panics is
//! logged and the worker moves on to the next one. [`Worker::stop`] raises
//! the stopping flag and enqueues a poison job; tasks still queued when the
//! flag is up are skipped, and long waits inside a task should go through
//! [`WorkerHandle::wait_up`] so they notice the stop.

use crate::flag::{Flag, WaitOutcome};
use crate::panic::describe;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    Stop,
}

struct Shared {
    name: String,
    jobs: Sender<Job>,
    stopping: Flag,
    thread_id: Mutex<Option<ThreadId>>,
}

/// A thread whose exit can be awaited with a deadline
pub(crate) struct TrackedThread {
    name: String,
    handle: JoinHandle<()>,
    done: Arc<Flag>,
}

struct DoneGuard(Arc<Flag>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.raise();
    }
}

impl TrackedThread {
    pub(crate) fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let done = Arc::new(Flag::new(false));
        let guard = DoneGuard(done.clone());
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            body();
        })?;
        Ok(Self { name, handle, done })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.done.is_up()
    }

    /// Join if the thread exits before `deadline`; otherwise abandon it
    pub(crate) fn join_until(self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.done.wait_up(Some(remaining)) {
            if self.handle.join().is_err() {
                warn!("Thread {} exited by panic", self.name);
            }
            true
        } else {
            warn!("Thread {} did not exit in time; abandoning it", self.name);
            false
        }
    }
}

/// Owner of a worker thread
pub struct Worker {
    handle: WorkerHandle,
    thread: Mutex<Option<TrackedThread>>,
}

/// Cloneable submission handle, usable from inside the worker's own tasks
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl Worker {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            name: name.into(),
            jobs,
            stopping: Flag::new(false),
            thread_id: Mutex::new(None),
        });
        let runner = shared.clone();
        let thread = TrackedThread::spawn(shared.name.clone(), move || run(runner, queue))?;
        Ok(Self {
            handle: WorkerHandle { shared },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.submit(task);
    }

    pub fn is_current(&self) -> bool {
        self.handle.is_current()
    }

    /// Ask the worker to exit after the task it is running
    pub fn stop(&self) {
        let shared = &self.handle.shared;
        if shared.stopping.is_up() {
            return;
        }
        debug!("Worker {}: stopping", shared.name);
        shared.stopping.raise();
        // The receiver only goes away once the thread has exited.
        let _ = shared.jobs.send(Job::Stop);
    }

    /// Wait up to `timeout` for the thread to exit. Returns `false` if abandoned.
    pub fn join(&self, timeout: Duration) -> bool {
        self.join_until(Instant::now() + timeout)
    }

    pub fn join_until(&self, deadline: Instant) -> bool {
        match self.thread.lock().take() {
            Some(thread) => thread.join_until(deadline),
            None => true,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stopping.is_up() {
            warn!("Worker {}: stopping, dropping submitted task", self.shared.name);
            return;
        }
        if self.shared.jobs.send(Job::Run(Box::new(task))).is_err() {
            warn!("Worker {}: thread has exited, dropping submitted task", self.shared.name);
        }
    }

    /// True when called from the worker's own thread
    pub fn is_current(&self) -> bool {
        *self.shared.thread_id.lock() == Some(thread::current().id())
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.is_up()
    }

    /// Raised once the worker has been told to stop
    pub fn stop_flag(&self) -> &Flag {
        &self.shared.stopping
    }

    /// Wait for `flag` to go up, giving up if this worker is told to stop
    pub fn wait_up(&self, flag: &Flag, timeout: Option<Duration>) -> WaitOutcome {
        flag.wait_up_unless(&self.shared.stopping, timeout)
    }
}

fn run(shared: Arc<Shared>, queue: Receiver<Job>) {
    *shared.thread_id.lock() = Some(thread::current().id());
    debug!("Worker {}: started", shared.name);
    // `recv` cannot fail while `shared` still owns the sender.
    while let Ok(job) = queue.recv() {
        match job {
            Job::Stop => break,
            Job::Run(_) if shared.stopping.is_up() => {
                debug!("Worker {}: skipping queued task after stop", shared.name);
            }
            Job::Run(task) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    error!(
                        "Worker {}: task failed: {}; continuing with next task",
                        shared.name,
                        describe(payload.as_ref())
                    );
                }
            }
        }
    }
    // Queued tasks may hold references back to the worker's owner.
    let dropped = queue.try_iter().count();
    if dropped > 0 {
        debug!("Worker {}: dropped {} queued tasks", shared.name, dropped);
    }
    debug!("Worker {}: exited", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_in_order() {
        let worker = Worker::spawn("order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            worker.submit(move || log.lock().push(i));
        }
        let done = Arc::new(Flag::new(false));
        let d = done.clone();
        worker.submit(move || d.raise());
        assert!(done.wait_up(Some(Duration::from_secs(5))));
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        worker.stop();
        assert!(worker.join(Duration::from_secs(5)));
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let worker = Worker::spawn("panicky").unwrap();
        worker.submit(|| panic!("task bug"));
        let done = Arc::new(Flag::new(false));
        let d = done.clone();
        worker.submit(move || d.raise());
        assert!(done.wait_up(Some(Duration::from_secs(5))));
        worker.stop();
        assert!(worker.join(Duration::from_secs(5)));
    }

    #[test]
    fn test_task_can_submit_to_own_worker() {
        let worker = Worker::spawn("reentrant").unwrap();
        let handle = worker.handle();
        let done = Arc::new(Flag::new(false));
        let d = done.clone();
        worker.submit(move || {
            assert!(handle.is_current());
            handle.submit(move || d.raise());
        });
        assert!(done.wait_up(Some(Duration::from_secs(5))));
        assert!(!worker.is_current());
    }

    #[test]
    fn test_stop_interrupts_long_wait_and_skips_queue() {
        let worker = Worker::spawn("stoppable").unwrap();
        let handle = worker.handle();
        let never = Arc::new(Flag::new(false));
        let outcome = Arc::new(Mutex::new(None));
        let ran_after = Arc::new(Flag::new(false));
        {
            let never = never.clone();
            let outcome = outcome.clone();
            worker.submit(move || {
                *outcome.lock() = Some(handle.wait_up(&never, None));
            });
        }
        {
            let ran_after = ran_after.clone();
            worker.submit(move || ran_after.raise());
        }
        thread::sleep(Duration::from_millis(20));
        worker.stop();
        assert!(worker.join(Duration::from_secs(5)));
        assert_eq!(*outcome.lock(), Some(WaitOutcome::Cancelled));
        assert!(!ran_after.is_up());
    }

    #[test]
    fn test_join_abandons_stuck_thread() {
        let worker = Worker::spawn("stuck").unwrap();
        let release = Arc::new(Flag::new(false));
        let r = release.clone();
        worker.submit(move || {
            r.wait_up(Some(Duration::from_secs(5)));
        });
        worker.stop();
        assert!(!worker.join(Duration::from_millis(50)));
        release.raise();
    }

    #[test]
    fn test_queued_tasks_released_on_exit() {
        let worker = Worker::spawn("release").unwrap();
        let gate = Arc::new(Flag::new(false));
        let held = Arc::new(());
        {
            let gate = gate.clone();
            worker.submit(move || {
                gate.wait_up(Some(Duration::from_secs(5)));
            });
        }
        {
            let held = held.clone();
            worker.submit(move || drop(held));
        }
        worker.stop();
        gate.raise();
        assert!(worker.join(Duration::from_secs(5)));
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
