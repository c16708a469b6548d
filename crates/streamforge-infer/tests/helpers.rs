//! Fixtures shared across the property/scenario tests: a counting fake
//! backend, a tagging fake post-processor, a recording event bus, and a
//! recording downstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use streamforge_core::frame::{DetectedObject, Frame};
use streamforge_core::module::{Downstream, EventBus, EventKind};
use streamforge_infer::{
    new_accelerator_resource, new_cpu_resource, EngineError, InferResource, InferenceBackend,
    IoResValue, PostProcessor, SharedFrame,
};

pub fn new_cpu_input_ring(batchsize: usize) -> Arc<InferResource<IoResValue>> {
    Arc::new(new_cpu_resource(2, batchsize, vec![(0, 4)]).expect("host ring allocation"))
}

pub fn new_output_ring(batchsize: usize) -> Arc<InferResource<IoResValue>> {
    Arc::new(new_accelerator_resource(2, batchsize, vec![(0, 4)]).expect("device ring allocation"))
}

/// A backend that just counts how many batches it ran.
#[derive(Default)]
pub struct CountingBackend {
    calls: AtomicUsize,
}

impl CountingBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceBackend for CountingBackend {
    fn run_batch(&self, _input: &IoResValue, _output: &mut IoResValue, _filled: usize) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A post-processor that tags every frame with one object, so tests can
/// tell a decoded frame apart from one that was dropped/skipped.
pub struct TaggingPost;

impl PostProcessor for TaggingPost {
    fn decode(&self, _output: &IoResValue, _batch_idx: usize, frame: &mut Frame) -> Result<(), EngineError> {
        frame.objects.push(DetectedObject { label: "ok".into(), ..Default::default() });
        Ok(())
    }
}

/// An `EventBus` that counts posted events by kind.
#[derive(Default)]
pub struct RecordingBus {
    errors: AtomicUsize,
}

impl RecordingBus {
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl EventBus for RecordingBus {
    fn post_event(&self, kind: EventKind, _msg: String) {
        if kind == EventKind::Error {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Records `(frame_id, has_objects)` pairs in the order they were
/// delivered — the thing in-order-delivery and interval-correctness tests
/// both need to inspect.
#[derive(Default)]
pub struct RecordingDownstream {
    entries: Mutex<Vec<(u64, bool)>>,
}

impl RecordingDownstream {
    /// Used by tests that drive `InferEngine` directly (bypassing
    /// `TransDataHelper`), mirroring what the helper would do once a
    /// card's fulfilled.
    pub fn transmit_shared(&self, frame: SharedFrame) {
        let locked = frame.lock();
        self.entries.lock().push((locked.frame_id, !locked.objects.is_empty()));
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn objects_nonempty(&self) -> Vec<bool> {
        self.entries.lock().iter().map(|(_, has)| *has).collect()
    }
}

impl Downstream for RecordingDownstream {
    fn transmit(&self, frame: Frame) {
        self.entries.lock().push((frame.frame_id, !frame.objects.is_empty()));
    }
}
