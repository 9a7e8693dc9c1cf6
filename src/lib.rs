//! Event dispatch daemon for heterogeneous OS event sources.
//!
//! vigild observes workstation notifications, dynamic configuration-store
//! key changes and filesystem change streams, and dispatches each observed
//! event to a user-configured handler: an external command, a registered
//! named function, or a method on a cached handler class instance.
//!
//! # Architecture
//!
//! ```text
//! EventSource (notify / channel-fed)
//!       |
//!       v
//! Daemon run loop ---- RestartSupervisor (baseline mtimes)
//!       |                     |
//!       v                     v
//! WatchIndex / key maps   pending restart
//!       |
//!       v
//! HandlerRegistry -> command | function | class method
//! ```
//!
//! The run loop is single-threaded and cooperative: every handler invocation
//! runs to completion on the loop thread before the next event is processed.

pub mod config;
pub mod daemon;
pub mod handler;
pub mod logging;
pub mod restart;
pub mod source;
pub mod watch;

pub use config::{EventSpec, Settings};
pub use daemon::{ControlHandle, Daemon, DaemonBuilder, DaemonState, RunOutcome, StartError};
pub use handler::{
    ClassHandler, EventContext, EventPayload, HandlerError, HandlerHandle, HandlerRegistry,
    ResolveError, SourceKind, register_builtins,
};
pub use restart::RestartSupervisor;
pub use source::{ChannelSource, EventSource, NotifyFsSource, RawEvent, SourceError, SourceHandle};
pub use watch::{Coalescer, FsChange, FsEvent, FsEventBatch, FsEventFlags, WatchError, WatchIndex};
