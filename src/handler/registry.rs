//! Handler registry: name lookup tables and the class-instance cache.
//!
//! Functions and handler classes are registered under names at startup,
//! before configuration is resolved; a configuration entry then refers to
//! them by name. This replaces dynamic symbol resolution with an explicit
//! table the embedding binary controls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::config::{EventSpec, SpecAction, SpecActionError};

use super::{ClassHandler, EventContext, HandlerAction, HandlerError, HandlerHandle, SourceKind};

/// A registered named function.
pub type HandlerFn = Rc<dyn Fn(&EventContext) -> Result<(), HandlerError>>;

/// Constructs one instance of a registered handler class.
pub type ClassFactory = Rc<dyn Fn() -> Result<Box<dyn ClassHandler>, HandlerError>>;

/// The cached singleton instance of a handler class.
pub type SharedInstance = Rc<RefCell<Box<dyn ClassHandler>>>;

/// Errors raised while resolving a configuration entry into a handler.
///
/// All of these are fatal configuration errors that abort startup.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("event '{key}' must define one of command, function, class or method")]
    MissingAction { key: String },

    #[error("event '{key}' defines more than one handler action")]
    AmbiguousAction { key: String },

    #[error("no function named '{name}' is registered")]
    UnknownFunction { name: String },

    #[error("no handler class named '{name}' is registered")]
    UnknownClass { name: String },

    #[error("constructing handler class '{class}' failed: {reason}")]
    Instantiation { class: String, reason: String },

    #[error("handler class '{class}' has no method '{method}'")]
    MissingMethod { class: String, method: String },
}

/// Resolves configuration entries into invokable handles.
///
/// Owns the function and class tables and the per-class singleton cache.
/// Instances live for the process lifetime; every entry naming the same
/// class shares one instance.
#[derive(Default)]
pub struct HandlerRegistry {
    functions: HashMap<String, HandlerFn>,
    classes: HashMap<String, ClassFactory>,
    instances: HashMap<String, SharedInstance>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named function for `function` specs.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register_function<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&EventContext) -> Result<(), HandlerError> + 'static,
    {
        self.functions.insert(name.into(), Rc::new(func));
    }

    /// Register a handler class factory for `class` and `method` specs.
    pub fn register_class<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn ClassHandler>, HandlerError> + 'static,
    {
        self.classes.insert(name.into(), Rc::new(factory));
    }

    /// Resolve one configuration entry into an invokable handle.
    ///
    /// For `class` specs the method name is the event key itself; for
    /// `method` specs it is the configured name. Method existence is checked
    /// here so a bad entry fails at startup, not at dispatch time.
    pub fn resolve(
        &mut self,
        key: &str,
        spec: &EventSpec,
        kind: SourceKind,
    ) -> Result<HandlerHandle, ResolveError> {
        let action = match spec.action().map_err(|err| match err {
            SpecActionError::Missing => ResolveError::MissingAction {
                key: key.to_string(),
            },
            SpecActionError::Ambiguous => ResolveError::AmbiguousAction {
                key: key.to_string(),
            },
        })? {
            SpecAction::Command(command) => HandlerAction::Command(command.to_string()),
            SpecAction::Function(name) => HandlerAction::Function {
                name: name.to_string(),
                func: self.functions.get(name).cloned().ok_or_else(|| {
                    ResolveError::UnknownFunction {
                        name: name.to_string(),
                    }
                })?,
            },
            SpecAction::Method { class, method } => self.method_action(class, method)?,
            SpecAction::Class(class) => self.method_action(class, key)?,
        };

        Ok(HandlerHandle {
            context: format!("{kind}: {key}"),
            key: key.to_string(),
            spec: spec.clone(),
            action,
        })
    }

    fn method_action(&mut self, class: &str, method: &str) -> Result<HandlerAction, ResolveError> {
        let instance = self.instance(class)?;
        if !instance.borrow().has_method(method) {
            return Err(ResolveError::MissingMethod {
                class: class.to_string(),
                method: method.to_string(),
            });
        }
        Ok(HandlerAction::Method {
            class: class.to_string(),
            method: method.to_string(),
            instance,
        })
    }

    /// The cached singleton for a class name, constructing it on first use.
    pub fn instance(&mut self, class: &str) -> Result<SharedInstance, ResolveError> {
        if let Some(instance) = self.instances.get(class) {
            return Ok(Rc::clone(instance));
        }

        let factory = self
            .classes
            .get(class)
            .ok_or_else(|| ResolveError::UnknownClass {
                name: class.to_string(),
            })?;
        let constructed = factory().map_err(|err| ResolveError::Instantiation {
            class: class.to_string(),
            reason: err.to_string(),
        })?;

        let shared: SharedInstance = Rc::new(RefCell::new(constructed));
        self.instances.insert(class.to_string(), Rc::clone(&shared));
        Ok(shared)
    }
}
