//! A generic registry-by-name for pluggable processors.
//!
//! Pre-processors (pack raw decoded frames into a model's input layout) and
//! post-processors (turn a model's raw output tensors into
//! [`DetectedObject`](crate::frame::DetectedObject)s) are both looked up by
//! a string name out of a pipeline configuration, not by compile-time type.
//! `Registry<T>` is the same by-name constructor table either one needs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Function that constructs a `T` from no arguments — the pre/post-proc
/// constructors this registry holds take their configuration through the
/// owning module's `ModuleParamSet` instead, so a name alone is enough to
/// pick one.
pub type Constructor<T> = Arc<dyn Fn() -> Box<T> + Send + Sync>;

/// A by-name table of constructors for some pluggable trait object `T`.
pub struct Registry<T: ?Sized> {
    constructors: Arc<RwLock<HashMap<String, Constructor<T>>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            constructors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<T> + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str) -> Result<Box<T>, RegistryError> {
        let constructors = self.constructors.read().unwrap();
        let constructor = constructors
            .get(name)
            .ok_or_else(|| RegistryError::UnknownType(name.to_string()))?;
        Ok(constructor())
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.constructors.read().unwrap().contains_key(name)
    }

    pub fn list_types(&self) -> Vec<String> {
        self.constructors.read().unwrap().keys().cloned().collect()
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.constructors.write().unwrap().remove(name).is_some()
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            constructors: Arc::clone(&self.constructors),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown type: {0}")]
    UnknownType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send {
        fn greet(&self) -> String;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    #[test]
    fn register_and_create() {
        let reg: Registry<dyn Greeter> = Registry::new();
        reg.register("hello", || Box::new(Hello));
        assert!(reg.has_type("hello"));
        let g = reg.create("hello").unwrap();
        assert_eq!(g.greet(), "hello");
    }

    #[test]
    fn unknown_type_errors() {
        let reg: Registry<dyn Greeter> = Registry::new();
        let err = reg.create("nope").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType(_)));
    }

    #[test]
    fn clone_shares_table() {
        let reg: Registry<dyn Greeter> = Registry::new();
        let reg2 = reg.clone();
        reg.register("hello", || Box::new(Hello));
        assert!(reg2.has_type("hello"));
    }
}
