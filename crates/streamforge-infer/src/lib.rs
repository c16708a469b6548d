//! Batched accelerator inference: ticketed double-buffered resource rings,
//! batching strategies, and the task-graph engine that turns a frame stream
//! into in-order, fulfilled results.

pub mod batching;
pub mod engine;
pub mod error;
pub mod model;
pub mod module;
pub mod resource;
pub mod task;
pub mod trans_data;

pub use batching::{BatchingStage, BatchingStrategy, CpuPreprocessing, ResizeConvert, YuvPacked, YuvSplit};
pub use engine::{EngineConfig, InferEngine, InferenceBackend, PostProcessor, ResultWaitingCard, SharedFrame};
pub use error::EngineError;
pub use model::{ModelDescriptor, TensorLayout, TensorShape};
pub use module::{InferenceModule, ModelLoader, ProcessorRegistries};
pub use resource::{
    new_accelerator_resource, new_cpu_resource, AcceleratorInputResource,
    AcceleratorOutputResource, AllocateError, CpuInputResource, CpuOutputResource, InferResource,
    IoResValue, RcOpAttributes, RcOpResource, Ticket,
};
pub use task::{Task, TaskHandle, TaskPool};
pub use trans_data::TransDataHelper;
