//! Streaming video-analytics inference core.
//!
//! Re-exports the two workspace crates under one name: `streamforge_core`
//! for the frame data model and the minimal pipeline-module surface, and
//! `streamforge_infer` for the batching/ticketing/task/engine machinery
//! that turns a per-thread frame stream into in-order inference results.

pub use streamforge_core as core;
pub use streamforge_infer as infer;

pub use streamforge_core::frame::{
    Attribute, BoundingBox, Device, DetectedObject, Frame, FrameFlags, PixelFormat, Plane,
    MAX_PLANES,
};
pub use streamforge_core::module::{
    param_set_from_json, resolved_model_path, Downstream, EventBus, EventKind, Module,
    ModuleParamSet, ParamRegister, ParamSpec, TracingEventBus,
};
pub use streamforge_core::{OpenError, OpenResult};

pub use streamforge_infer::{
    BatchingStage, BatchingStrategy, CpuPreprocessing, EngineConfig, EngineError, InferEngine,
    InferenceBackend, InferenceModule, ModelDescriptor, ModelLoader, PostProcessor,
    ProcessorRegistries, ResizeConvert, ResultWaitingCard, SharedFrame, TransDataHelper,
    YuvPacked, YuvSplit,
};
