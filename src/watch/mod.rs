//! Filesystem watch index and event types.
//!
//! This module maps directory roots to lists of interested callbacks and
//! dispatches directory-level change notifications to every watcher whose
//! root is a path-prefix of the changed directory.
//!
//! # Architecture
//!
//! ```text
//! FsEventBatch (from an event source)
//!      |
//!   Coalescer  - per-path quiet window, flag or-merge
//!      |
//!   WatchIndex - root -> [callback], prefix dispatch
//!      |
//!   FsChange(root, path, recursive) per callback
//! ```

mod coalesce;
mod error;
mod event;
mod index;

pub use coalesce::Coalescer;
pub use error::WatchError;
pub use event::{FsChange, FsEvent, FsEventBatch, FsEventFlags};
pub use index::{WatchCallback, WatchIndex};
