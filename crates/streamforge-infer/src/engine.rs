//! `InferEngine` — the orchestration core.
//!
//! Turns a strictly ordered stream of frames into a strictly ordered
//! stream of fulfilled [`ResultWaitingCard`]s, chaining pre-processing,
//! inference, and post-processing through the task dependency graph and
//! bounding the latency of any single frame by the batching timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use streamforge_core::frame::Frame;
use streamforge_core::module::EventBus;

use crate::batching::{BatchingStage, BatchingStrategy};
use crate::error::{EngineError, TransientDeviceError};
use crate::resource::{IoResValue, InferResource};
use crate::task::{Task, TaskHandle, TaskPool};

/// A shared future that becomes ready once the corresponding frame's
/// post-processing has committed its results into the frame's object
/// list. Cards for EOS or dropped frames are pre-fulfilled at submission
/// time.
#[derive(Clone)]
pub struct ResultWaitingCard {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ResultWaitingCard {
    pub fn new() -> Self {
        ResultWaitingCard {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn pre_fulfilled() -> Self {
        let card = Self::new();
        card.fulfil();
        card
    }

    pub fn fulfil(&self) {
        let (lock, cond) = &*self.inner;
        let mut ready = lock.lock();
        *ready = true;
        cond.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cond) = &*self.inner;
        let mut ready = lock.lock();
        while !*ready {
            cond.wait(&mut ready);
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.0.lock()
    }
}

impl Default for ResultWaitingCard {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame shared between the slot the engine mutates during
/// post-processing and the copy `TransDataHelper` holds for downstream
/// delivery — the Rust analogue of the original's `shared_ptr<CNFrameInfo>`
/// flowing unchanged through both paths.
pub type SharedFrame = Arc<Mutex<Frame>>;

/// Runs the loaded model over one filled batch.
pub trait InferenceBackend: Send + Sync {
    fn run_batch(
        &self,
        input: &IoResValue,
        output: &mut IoResValue,
        filled: usize,
    ) -> Result<(), EngineError>;
}

/// Decodes one sample's worth of a batch's output tensors into a frame's
/// detected-object list.
pub trait PostProcessor: Send + Sync {
    fn decode(&self, output: &IoResValue, batch_idx: usize, frame: &mut Frame) -> Result<(), EngineError>;
}

struct SlotRecord {
    frame: SharedFrame,
    card: ResultWaitingCard,
}

struct OpenBatch {
    slots: Vec<Option<SlotRecord>>,
    filled: usize,
    deadline: Option<Instant>,
    preproc_handles: Vec<TaskHandle>,
    filled_input: Option<(Arc<InferResource<IoResValue>>, usize)>,
}

impl OpenBatch {
    fn empty(batchsize: usize) -> Self {
        let mut slots = Vec::with_capacity(batchsize);
        slots.resize_with(batchsize, || None);
        OpenBatch {
            slots,
            filled: 0,
            deadline: None,
            preproc_handles: Vec::new(),
            filled_input: None,
        }
    }
}

pub struct EngineConfig {
    pub batchsize: usize,
    pub batching_timeout: Duration,
}

/// Orchestrates preproc → infer → postproc for one producer's stream of
/// frames. One `InferEngine` belongs to exactly one `InferContext`.
pub struct InferEngine {
    config: EngineConfig,
    batching_stage: Mutex<BatchingStrategy>,
    output_resource: Arc<InferResource<IoResValue>>,
    backend: Arc<dyn InferenceBackend>,
    postproc: Arc<dyn PostProcessor>,
    task_pool: Arc<TaskPool>,
    error_callback: Arc<dyn Fn(&str) + Send + Sync>,
    event_bus: Arc<dyn EventBus>,
    open: Mutex<OpenBatch>,
    watchdog_cond: Condvar,
    closing: AtomicBool,
    watchdog: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl InferEngine {
    pub fn new(
        config: EngineConfig,
        batching_stage: BatchingStrategy,
        output_resource: Arc<InferResource<IoResValue>>,
        backend: Arc<dyn InferenceBackend>,
        postproc: Arc<dyn PostProcessor>,
        task_pool: Arc<TaskPool>,
        error_callback: Arc<dyn Fn(&str) + Send + Sync>,
        event_bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let batchsize = config.batchsize;
        let engine = Arc::new(InferEngine {
            config,
            batching_stage: Mutex::new(batching_stage),
            output_resource,
            backend,
            postproc,
            task_pool,
            error_callback,
            event_bus,
            open: Mutex::new(OpenBatch::empty(batchsize)),
            watchdog_cond: Condvar::new(),
            closing: AtomicBool::new(false),
            watchdog: Mutex::new(None),
        });

        let watchdog_engine = Arc::clone(&engine);
        let handle = std::thread::Builder::new()
            .name("streamforge-watchdog".into())
            .spawn(move || watchdog_engine.watchdog_loop())
            .expect("failed to spawn watchdog thread");
        *engine.watchdog.lock() = Some(handle);
        engine
    }

    fn watchdog_loop(self: Arc<Self>) {
        loop {
            let mut open = self.open.lock();
            if self.closing.load(Ordering::Acquire) {
                return;
            }
            match open.deadline {
                None => {
                    self.watchdog_cond.wait(&mut open);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let batch = std::mem::replace(&mut *open, OpenBatch::empty(self.config.batchsize));
                        drop(open);
                        self.batching_stage.lock().reset();
                        tracing::debug!("batching timeout elapsed, forcing partial commit");
                        self.commit(batch);
                    } else {
                        self.watchdog_cond.wait_for(&mut open, deadline - now);
                    }
                }
            }
        }
    }

    /// Synchronous, called on the producer thread. Mints a card, records
    /// the frame into the current batch, runs the configured
    /// pre-processing batching stage, and commits the batch once it
    /// fills or an EOS frame forces it.
    #[tracing::instrument(skip(self, frame), fields(frame_id = frame.frame_id))]
    pub fn feed_data(&self, frame: Frame) -> (ResultWaitingCard, SharedFrame) {
        if self.closing.load(Ordering::Acquire) {
            self.fail(&EngineError::ShuttingDown.to_string());
            return (ResultWaitingCard::pre_fulfilled(), Arc::new(Mutex::new(frame)));
        }
        if frame.is_eos() {
            return self.feed_eos(frame);
        }

        let card = ResultWaitingCard::new();
        let shared_frame: SharedFrame = Arc::new(Mutex::new(frame));
        let mut open = self.open.lock();
        if open.deadline.is_none() {
            open.deadline = Some(Instant::now() + self.config.batching_timeout);
            self.watchdog_cond.notify_all();
        }

        let idx = {
            let mut stage = self.batching_stage.lock();
            let idx = stage.batch_idx();
            let locked = shared_frame.lock();
            match stage.batching(&locked) {
                Ok(task) => {
                    drop(locked);
                    if let Some(mut task) = task {
                        if let Some(prev) = open.preproc_handles.get(idx).cloned() {
                            task.bind_front(prev);
                        }
                        let handle = self.task_pool.submit(task);
                        if idx < open.preproc_handles.len() {
                            open.preproc_handles[idx] = handle;
                        } else {
                            open.preproc_handles.push(handle);
                        }
                    }
                    idx
                }
                Err(e) => {
                    drop(locked);
                    self.fail(&e.to_string());
                    idx
                }
            }
        };
        let (is_full, filled_input) = {
            let stage = self.batching_stage.lock();
            (stage.is_batch_full(), stage.filled_input())
        };

        open.slots[idx] = Some(SlotRecord {
            frame: Arc::clone(&shared_frame),
            card: card.clone(),
        });
        open.filled += 1;
        if filled_input.is_some() {
            open.filled_input = filled_input;
        }

        if is_full {
            let batch = std::mem::replace(&mut *open, OpenBatch::empty(self.config.batchsize));
            drop(open);
            self.commit(batch);
        }

        (card, shared_frame)
    }

    fn feed_eos(&self, frame: Frame) -> (ResultWaitingCard, SharedFrame) {
        let mut open = self.open.lock();
        if open.filled > 0 {
            let batch = std::mem::replace(&mut *open, OpenBatch::empty(self.config.batchsize));
            drop(open);
            self.batching_stage.lock().reset();
            self.commit(batch);
        }
        (ResultWaitingCard::pre_fulfilled(), Arc::new(Mutex::new(frame)))
    }

    fn fail(&self, message: &str) {
        tracing::error!(message, "inference engine fatal error");
        self.event_bus.post_event(
            streamforge_core::module::EventKind::Error,
            message.to_string(),
        );
        (self.error_callback)(message);
    }

    /// Chains the inference task (waits on all pre-processing tasks of
    /// this batch, runs the model, writes the output resource) and one
    /// post-processing task per filled frame (waits on inference, decodes
    /// results into the frame's object list, fulfils the card).
    fn commit(&self, batch: OpenBatch) {
        let filled = batch.filled;
        if filled == 0 {
            return;
        }

        let output_ticket = self.output_resource.pick_up_ticket(false);
        let output_resource = Arc::clone(&self.output_resource);
        let backend = Arc::clone(&self.backend);

        let filled_input = batch.filled_input;
        let infer_ticket = output_ticket;
        let infer_event_bus = Arc::clone(&self.event_bus);
        let infer_error_callback = Arc::clone(&self.error_callback);
        let mut infer_task = Task::new(move || {
            // The last pre-processing task for this batch already
            // released the input ticket once it finished writing; the
            // bound prerequisites below guarantee that write happened
            // before this closure runs, so a raw peek is safe.
            //
            // `ResizeConvert` drives the accelerator directly and never
            // records a filled input slot; the operator has already
            // written the batch's tensor in device memory by the time
            // this task runs, so there's nothing here for this task to
            // read on that path.
            let input_guard = filled_input.as_ref().map(|(res, slot)| res.peek(*slot));
            let placeholder;
            let input: &IoResValue = match &input_guard {
                Some(guard) => &**guard,
                None => {
                    placeholder = IoResValue::new(1, Vec::new());
                    &placeholder
                }
            };
            let mut guard = output_resource.wait_resource_by_ticket(&infer_ticket);
            match backend.run_batch(input, &mut guard, filled) {
                Ok(()) => 0,
                Err(e) => {
                    let fatal = TransientDeviceError::DispatchFailed(e.to_string()).into_invariant();
                    infer_event_bus.post_event(
                        streamforge_core::module::EventKind::Error,
                        fatal.to_string(),
                    );
                    (infer_error_callback)(&fatal.to_string());
                    -1
                }
            }
        });
        for handle in &batch.preproc_handles {
            infer_task.bind_front(handle.clone());
        }
        let infer_handle = self.task_pool.submit(infer_task);

        let mut post_handles = Vec::with_capacity(filled);
        for (idx, slot) in batch.slots.into_iter().enumerate() {
            let Some(SlotRecord { frame, card }) = slot else {
                continue;
            };
            let output_resource = Arc::clone(&self.output_resource);
            let postproc = Arc::clone(&self.postproc);
            let error_callback = Arc::clone(&self.error_callback);
            let event_bus = Arc::clone(&self.event_bus);
            let ticket = infer_ticket;
            let mut post_task = Task::new(move || {
                let guard = output_resource.wait_resource_by_ticket(&ticket);
                let status = {
                    let mut locked_frame = frame.lock();
                    match postproc.decode(&guard, idx, &mut locked_frame) {
                        Ok(()) => 0,
                        Err(e) => {
                            tracing::error!(error = %e, "post-processing failed");
                            event_bus.post_event(
                                streamforge_core::module::EventKind::Error,
                                e.to_string(),
                            );
                            (error_callback)(&e.to_string());
                            -1
                        }
                    }
                };
                card.fulfil();
                status
            });
            post_task.bind_front(infer_handle.clone());
            post_handles.push(self.task_pool.submit(post_task));
        }

        // Releases the output slot only once every post-processing task
        // for this batch has read it.
        let output_resource = Arc::clone(&self.output_resource);
        let mut release_task = Task::new(move || {
            output_resource.dealing_done(infer_ticket);
            0
        });
        for handle in &post_handles {
            release_task.bind_front(handle.clone());
        }
        self.task_pool.submit(release_task);
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.watchdog_cond.notify_all();
        if let Some(handle) = self.watchdog.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InferEngine {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.watchdog_cond.notify_all();
        if let Some(handle) = self.watchdog.lock().take() {
            let _ = handle.join();
        }
    }
}
