//! Handler resolution and invocation.
//!
//! A configuration entry names one of three handler actions: a shell
//! command, a registered named function, or a method on a registered handler
//! class. [`HandlerRegistry`] resolves entries into [`HandlerHandle`]s at
//! startup; a handle is invoked once per matching event and never raises,
//! so one misbehaving handler cannot halt the dispatch loop.

mod command;
mod registry;

pub use registry::{ClassFactory, HandlerFn, HandlerRegistry, ResolveError, SharedInstance};

use std::fmt;
use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::EventSpec;

/// Which event source a handler was configured under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Workspace,
    Store,
    Fs,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Workspace => "workspace",
            SourceKind::Store => "store",
            SourceKind::Fs => "fs",
        })
    }
}

/// Error returned by a function or class-method handler.
///
/// Runtime handler errors are logged and swallowed by [`HandlerHandle::invoke`].
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source-specific data delivered with one event.
#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    #[default]
    None,
    Workspace {
        user_info: Option<Map<String, Value>>,
    },
    Store {
        info: Option<Map<String, Value>>,
    },
    Fs {
        root: PathBuf,
        path: PathBuf,
        recursive: bool,
    },
}

/// Everything a fired handler learns about its event.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Human-readable label locating the configuration entry.
    pub context: String,
    /// The event-identifying string the handler was registered under.
    pub key: String,
    /// The originating configuration entry.
    pub spec: EventSpec,
    pub payload: EventPayload,
}

/// A stateful handler whose methods are invoked by name.
///
/// One instance per class name is constructed lazily and cached for the
/// process lifetime; every configuration entry naming the class shares it.
pub trait ClassHandler {
    /// Whether this handler exposes the named method. Checked once, at
    /// resolution time, so a misconfigured method aborts startup.
    fn has_method(&self, method: &str) -> bool;

    /// Invoke the named method with the delivered event context.
    fn call(&mut self, method: &str, ctx: &EventContext) -> Result<(), HandlerError>;
}

pub(crate) enum HandlerAction {
    Command(String),
    Function { name: String, func: HandlerFn },
    Method {
        class: String,
        method: String,
        instance: SharedInstance,
    },
}

/// A resolved, invokable handler closed over its static context.
///
/// Created once per configuration entry at startup and reused for every
/// matching event.
pub struct HandlerHandle {
    pub(crate) context: String,
    pub(crate) key: String,
    pub(crate) spec: EventSpec,
    pub(crate) action: HandlerAction,
}

impl HandlerHandle {
    /// The handle's context label.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Fire the handler for one delivered event.
    ///
    /// Logs start and outcome. Any failure of the underlying action is
    /// caught and logged here; nothing propagates to the dispatch loop.
    pub fn invoke(&self, payload: EventPayload) {
        let ctx = EventContext {
            context: self.context.clone(),
            key: self.key.clone(),
            spec: self.spec.clone(),
            payload,
        };

        match &self.action {
            HandlerAction::Command(cmd) => command::run(cmd, &ctx),
            HandlerAction::Function { name, func } => {
                crate::debug_event!("dispatch", "function", "{} for '{}'", name, ctx.key);
                if let Err(err) = func(&ctx) {
                    tracing::error!(
                        "[dispatch] function '{name}' failed for '{}' ({}): {err}",
                        ctx.key,
                        ctx.context
                    );
                }
            }
            HandlerAction::Method {
                class,
                method,
                instance,
            } => {
                crate::debug_event!("dispatch", "method", "{}.{} for '{}'", class, method, ctx.key);
                let result = instance.borrow_mut().call(method, &ctx);
                if let Err(err) = result {
                    tracing::error!(
                        "[dispatch] method {class}.{method} failed for '{}' ({}): {err}",
                        ctx.key,
                        ctx.context
                    );
                }
            }
        }
    }
}

impl fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match &self.action {
            HandlerAction::Command(cmd) => format!("command `{cmd}`"),
            HandlerAction::Function { name, .. } => format!("function {name}"),
            HandlerAction::Method { class, method, .. } => format!("method {class}.{method}"),
        };
        f.debug_struct("HandlerHandle")
            .field("key", &self.key)
            .field("action", &action)
            .finish()
    }
}

/// Register the handlers that ship with the daemon binary.
///
/// `builtin.log` logs the delivered context at info level, which makes a
/// fresh configuration observable before any real handlers exist.
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register_function("builtin.log", |ctx: &EventContext| {
        tracing::info!("[builtin.log] '{}' fired ({})", ctx.key, ctx.context);
        Ok(())
    });
}
