//! The pipeline-module surface.
//!
//! This crate treats the surrounding pipeline (module lifecycle, parameter
//! parsing, event bus, transmission to the next module) as an external
//! collaborator — out of scope per the core's own spec — and gives it only
//! the minimal concrete shape the inference module needs to compile and be
//! tested in isolation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{OpenError, OpenResult};
use crate::frame::Frame;

/// String-keyed parameters passed to `Module::open`, as parsed out of a
/// pipeline configuration file.
pub type ModuleParamSet = HashMap<String, String>;

/// Builds a [`ModuleParamSet`] from a JSON object, resolving any key whose
/// name is in `path_keys` relative to `base_dir` — mirrors a pipeline
/// config where `model_path` is written relative to the config file
/// itself rather than the process's current directory.
pub fn param_set_from_json(
    value: &serde_json::Value,
    base_dir: &Path,
    path_keys: &[&str],
) -> OpenResult<ModuleParamSet> {
    let obj = value
        .as_object()
        .ok_or_else(|| OpenError::Config("module parameters must be a JSON object".into()))?;

    let mut params = ModuleParamSet::new();
    for (key, v) in obj {
        let s = match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let s = if path_keys.contains(&key.as_str()) {
            resolve_relative(&s, base_dir)
        } else {
            s
        };
        params.insert(key.clone(), s);
    }
    Ok(params)
}

fn resolve_relative(path: &str, base_dir: &Path) -> String {
    let p = Path::new(path);
    if p.is_absolute() {
        path.to_string()
    } else {
        base_dir.join(p).to_string_lossy().into_owned()
    }
}

/// Path to an offline model, already resolved relative to its pipeline
/// configuration file.
pub fn resolved_model_path(params: &ModuleParamSet, base_dir: &Path) -> Option<PathBuf> {
    params
        .get("model_path")
        .map(|p| PathBuf::from(resolve_relative(p, base_dir)))
}

/// One accepted parameter key: whether it's required and a one-line
/// description, used to build `Open`'s validation and to warn on unknown
/// keys.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub description: String,
    pub required: bool,
}

/// Tracks which parameter keys a module accepts, so `Open` can fail with a
/// descriptive message on missing required parameters and warn (without
/// failing) on unrecognised ones.
#[derive(Debug, Default)]
pub struct ParamRegister {
    specs: HashMap<String, ParamSpec>,
}

impl ParamRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, description: impl Into<String>, required: bool) {
        self.specs.insert(
            key.into(),
            ParamSpec {
                description: description.into(),
                required,
            },
        );
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.specs.contains_key(key)
    }

    /// Warn (via `tracing`) on any key in `params` this register doesn't
    /// know about, then fail if a required key is missing.
    pub fn validate(&self, params: &ModuleParamSet) -> OpenResult<()> {
        for key in params.keys() {
            if !self.is_registered(key) {
                tracing::warn!(param = %key, "unknown parameter");
            }
        }
        let missing: Vec<&str> = self
            .specs
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(k, _)| k.as_str())
            .filter(|k| !params.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(OpenError::Config(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// Severity/kind of an event posted to the pipeline's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    Warning,
    Error,
    Eos,
}

/// The pipeline's event bus, as seen by a module.
pub trait EventBus: Send + Sync {
    fn post_event(&self, kind: EventKind, msg: String);
}

/// An `EventBus` that only logs through `tracing` — used by tests and by
/// modules not wired into a real pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn post_event(&self, kind: EventKind, msg: String) {
        match kind {
            EventKind::Info => tracing::info!("{msg}"),
            EventKind::Warning => tracing::warn!("{msg}"),
            EventKind::Error => tracing::error!("{msg}"),
            EventKind::Eos => tracing::info!(eos = true, "{msg}"),
        }
    }
}

/// The next stage downstream of this module, as seen by a module that
/// self-transmits (see [`Module::process`]'s return value).
pub trait Downstream: Send + Sync {
    fn transmit(&self, frame: Frame);
}

/// Lifecycle a pipeline module implements: `Open` once, `Process` per
/// frame, `Close` once.
///
/// `open` and `close` are exclusive calls made by the pipeline during
/// startup/teardown. `process` takes `&self` because an arbitrary number
/// of producer threads call it concurrently once the pipeline is running
/// — a module that needs per-call mutable state reaches for interior
/// mutability (e.g. a per-thread context map) rather than serialising on
/// one lock, which is the whole point of per-thread contexts.
///
/// `process` returns a pipeline sentinel: modules that transmit frames to
/// `Downstream` themselves (rather than letting the pipeline forward the
/// input frame automatically) return a nonzero value, signalling
/// "self-transmit, do not also forward".
pub trait Module: Send + Sync {
    fn open(&mut self, params: &ModuleParamSet) -> OpenResult<()>;
    fn process(&self, frame: Frame) -> i32;
    fn close(&mut self);
}
