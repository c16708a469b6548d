//! Frame data model and minimal pipeline-module surface shared by the
//! inference engine.
//!
//! This crate has no opinion about how frames are decoded, transported
//! between modules, or how a pipeline is assembled from a configuration
//! file — it only fixes the shapes that cross the module boundary so that
//! `streamforge-infer` can be built and tested without a real pipeline
//! runtime behind it.

pub mod error;
pub mod frame;
pub mod module;
pub mod registry;

pub use error::{OpenError, OpenResult};
pub use frame::{
    Attribute, BoundingBox, Device, DetectedObject, Frame, FrameFlags, PixelFormat, Plane,
    MAX_PLANES,
};
pub use module::{
    param_set_from_json, resolved_model_path, Downstream, EventBus, EventKind, Module,
    ModuleParamSet, ParamRegister, ParamSpec, TracingEventBus,
};
pub use registry::{Constructor, Registry, RegistryError};
