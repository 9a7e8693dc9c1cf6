//! Self-restart supervision.
//!
//! The supervisor records a modification-time baseline for the files whose
//! change should recycle the daemon (the configuration file, the running
//! executable) and registers watch-index callbacks that re-stat on every
//! filesystem event under the tracked file's directory. Divergence from the
//! baseline, or a failed stat, requests a restart.
//!
//! Restart itself is owned by the caller: the run loop returns
//! [`crate::daemon::RunOutcome::Restart`] and the process supervisor in
//! `main` rebuilds a fresh worker from scratch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use thiserror::Error;

use crate::watch::{WatchError, WatchIndex};

/// Errors from capturing the restart baseline. Fatal at startup.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("cannot record a baseline for {path}: {source}")]
    Baseline {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Tracks baseline mtimes and the pending restart request.
#[derive(Debug, Default)]
pub struct RestartSupervisor {
    /// Tracked path -> mtime at capture. Never mutated after capture.
    baseline: HashMap<PathBuf, SystemTime>,
    /// First restart reason wins; later requests are ignored.
    pending: Rc<RefCell<Option<String>>>,
}

impl RestartSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline `path` and register a watch that requests a restart with
    /// `reason` when its modification time drifts.
    ///
    /// If the literal path no longer exists its nearest existing ancestor is
    /// tracked instead, so a deleted-and-recreated file still triggers.
    pub fn watch(
        &mut self,
        index: &mut WatchIndex,
        path: &Path,
        reason: impl Into<String>,
    ) -> Result<(), RestartError> {
        let reason = reason.into();
        let tracked = existing_ancestor(path);
        let tracked = tracked
            .canonicalize()
            .map_err(|source| RestartError::Baseline {
                path: tracked.clone(),
                source,
            })?;

        let recorded = modified_time(&tracked).map_err(|source| RestartError::Baseline {
            path: tracked.clone(),
            source,
        })?;
        self.baseline.insert(tracked.clone(), recorded);

        let pending = Rc::clone(&self.pending);
        let stat_path = tracked.clone();
        index.add_watch(
            &tracked,
            Rc::new(move |_change| match modified_time(&stat_path) {
                Ok(current) if current == recorded => {}
                Ok(_) => request(&pending, &reason),
                Err(err) => request(
                    &pending,
                    &format!("cannot stat {}: {err}", stat_path.display()),
                ),
            }),
        )?;

        crate::debug_event!("restart", "tracking", "{}", tracked.display());
        Ok(())
    }

    /// Request a restart. Idempotent: only the first reason is kept.
    pub fn request_restart(&self, reason: &str) {
        request(&self.pending, reason);
    }

    /// Consume the pending restart reason, if any.
    pub fn take_pending(&self) -> Option<String> {
        self.pending.borrow_mut().take()
    }

    /// Number of baseline-tracked paths.
    pub fn tracked_count(&self) -> usize {
        self.baseline.len()
    }
}

fn request(pending: &RefCell<Option<String>>, reason: &str) {
    let mut slot = pending.borrow_mut();
    if slot.is_none() {
        tracing::info!("[restart] requested: {reason}");
        *slot = Some(reason.to_string());
    }
}

fn modified_time(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

/// Walk up from `path` to the nearest component that exists.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => break,
        }
    }
    current.to_path_buf()
}
