//! Futures-based task chaining and the fixed worker-thread pool that
//! drains them.
//!
//! A [`Task`] wraps a thunk plus a fulfil-once completion signal. Binding
//! a task behind others (`bind_front`) builds the same DAG-executor shape
//! the engine needs to chain pre-processing → inference → post-processing
//! without a central scheduler making that ordering decision explicitly —
//! each task just waits on its own prerequisites before running.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// The cloneable completion signal of a [`Task`]. Many downstream tasks
/// may hold a clone and await it; the thunk behind it runs exactly once.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<(Mutex<Option<i32>>, Condvar)>,
}

impl TaskHandle {
    fn new() -> Self {
        TaskHandle {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn fulfil(&self, status: i32) {
        let (lock, cond) = &*self.inner;
        let mut slot = lock.lock();
        debug_assert!(slot.is_none(), "task handle fulfilled twice");
        *slot = Some(status);
        cond.notify_all();
    }

    /// Blocks until the task behind this handle has run.
    pub fn wait(&self) -> i32 {
        let (lock, cond) = &*self.inner;
        let mut slot = lock.lock();
        while slot.is_none() {
            cond.wait(&mut slot);
        }
        slot.unwrap()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let (lock, cond) = &*self.inner;
        let mut slot = lock.lock();
        if slot.is_none() {
            let result = cond.wait_for(&mut slot, timeout);
            if result.timed_out() && slot.is_none() {
                return None;
            }
        }
        *slot
    }

    pub fn is_ready(&self) -> bool {
        self.inner.0.lock().is_some()
    }
}

type Thunk = Box<dyn FnOnce() -> i32 + Send>;

/// A deferred computation: constructed, optionally bound behind other
/// tasks' completion, executed exactly once by a worker, its handle
/// fulfilled with the thunk's return status.
pub struct Task {
    thunk: Option<Thunk>,
    prerequisites: Vec<TaskHandle>,
    handle: TaskHandle,
}

impl Task {
    pub fn new<F>(thunk: F) -> Self
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        Task {
            thunk: Some(Box::new(thunk)),
            prerequisites: Vec::new(),
            handle: TaskHandle::new(),
        }
    }

    /// Adds `front`'s completion to this task's prerequisites.
    pub fn bind_front(&mut self, front: TaskHandle) {
        self.prerequisites.push(front);
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn wait_for_front_tasks_complete(&self) {
        for front in &self.prerequisites {
            front.wait();
        }
    }

    /// Waits for prerequisites, runs the thunk exactly once, fulfils the
    /// handle, and returns the status.
    #[tracing::instrument(skip_all)]
    pub fn execute(mut self) -> i32 {
        self.wait_for_front_tasks_complete();
        let thunk = self.thunk.take().expect("task executed twice");
        let status = thunk();
        self.handle.fulfil(status);
        status
    }
}

/// Fixed-size pool of worker threads draining a FIFO queue of tasks.
/// Workers never share a task instance with each other; the submitting
/// thread places the task on the queue and the first idle worker waits on
/// its prerequisites, then executes it.
pub struct TaskPool {
    sender: crossbeam_channel::Sender<Task>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let receiver = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("streamforge-worker-{id}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            let status = task.execute();
                            tracing::debug!(worker = id, status, "task completed");
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        TaskPool { sender, workers }
    }

    /// Submits a task to the queue, returning its completion handle.
    pub fn submit(&self, task: Task) -> TaskHandle {
        let handle = task.handle();
        self.sender
            .send(task)
            .expect("task pool workers disconnected");
        handle
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Dropping `sender` closes the channel; `recv` in each worker
        // returns `Err` once the queue drains, ending its loop.
        let (dummy, _rx) = crossbeam_channel::unbounded();
        let old_sender = std::mem::replace(&mut self.sender, dummy);
        drop(old_sender);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
