//! Errors surfaced by the batching/inference engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// An isolated failure dispatching one batch to the accelerator (a launch
/// or copy failure reported by the backend).
///
/// Never retried: every place that produces one logs it at `ERROR`
/// severity and re-raises it as [`EngineError::InvariantViolation`],
/// because from the caller's side "the accelerator glitched" and "the
/// accelerator is wired up wrong" look the same, and nothing in this
/// engine resubmits a batch once dispatch has failed.
#[derive(Debug, Error)]
pub(crate) enum TransientDeviceError {
    #[error("accelerator dispatch failed: {0}")]
    DispatchFailed(String),
}

impl TransientDeviceError {
    pub(crate) fn into_invariant(self) -> EngineError {
        tracing::error!(error = %self, "transient device error, not retrying");
        EngineError::InvariantViolation(self.to_string())
    }
}

/// Errors the engine can return to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    ConfigError(String),

    /// Bad model path, bad entry-point symbol, or layout init failure.
    /// Constructed by `ModelLoader` implementations, not by this crate —
    /// the model loader itself is an external collaborator.
    #[error("failed to load model: {0}")]
    ModelLoadError(String),

    #[error("resource pool exhausted: {0}")]
    ResourceExhausted(String),

    /// Something the engine's own state machine guarantees was violated —
    /// always a bug, never a caller mistake. Carries enough detail for a
    /// bug report, not for programmatic matching.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}
