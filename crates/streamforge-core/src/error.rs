//! Error types surfaced across the pipeline-module boundary.

use thiserror::Error;

/// Errors that can fail a module's `open`.
///
/// This is deliberately coarser than the inference engine's own error
/// enum (see `streamforge-infer::EngineError`) — `Open` either succeeds or
/// it doesn't, and the pipeline only needs a human-readable reason plus a
/// coarse kind to decide whether to abort startup.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("missing or invalid parameter: {0}")]
    Config(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("resource allocation failed: {0}")]
    ResourceExhausted(String),
}

pub type OpenResult<T> = Result<T, OpenError>;
