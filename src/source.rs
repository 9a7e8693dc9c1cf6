//! Event sources: the adapter-facing delivery contract.
//!
//! Every source pushes [`RawEvent`]s into the daemon's channel; the run loop
//! is the only consumer. The concrete workstation and configuration-store
//! bindings live outside this crate and deliver through a [`ChannelSource`];
//! the filesystem source is [`NotifyFsSource`], built on `notify`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::watch::{FsEvent, FsEventBatch, FsEventFlags};

/// One delivery from an event source.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// A workstation notification with an optional free-form payload.
    Workspace {
        name: String,
        user_info: Option<Map<String, Value>>,
    },
    /// A batch of changed configuration-store keys.
    StoreKeys {
        keys: Vec<String>,
        info: Option<Map<String, Value>>,
    },
    /// A batch of filesystem changes.
    Fs(FsEventBatch),
}

/// Errors from starting an event source. Fatal at startup.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to start filesystem event stream: {0}")]
    Stream(#[from] notify::Error),
}

/// An asynchronous event producer feeding the run loop.
///
/// Sources deliver on whatever thread the OS gives them; the daemon
/// serializes everything onto its single loop thread.
pub trait EventSource {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Begin delivering events into `tx`. Called once, during startup.
    fn start(&mut self, tx: Sender<RawEvent>) -> Result<(), SourceError>;
}

/// Filesystem event source over `notify`.
///
/// Watches each registered root recursively, so prefix dispatch sees
/// changes anywhere beneath a root. Watcher errors become conservative
/// kernel-drop events for the affected paths.
pub struct NotifyFsSource {
    roots: Vec<PathBuf>,
    watcher: Option<RecommendedWatcher>,
}

impl NotifyFsSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            watcher: None,
        }
    }
}

impl EventSource for NotifyFsSource {
    fn name(&self) -> &str {
        "fs"
    }

    fn start(&mut self, tx: Sender<RawEvent>) -> Result<(), SourceError> {
        let roots = self.roots.clone();
        let seq = AtomicU64::new(0);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let batch = match res {
                Ok(event) => convert_event(event, &seq),
                Err(err) => convert_error(err, &roots, &seq),
            };
            if !batch.is_empty() {
                let _ = tx.send(RawEvent::Fs(batch));
            }
        })?;

        for root in &self.roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }
        crate::debug_event!("fs", "stream started", "{} root(s)", self.roots.len());

        self.watcher = Some(watcher);
        Ok(())
    }
}

fn convert_event(event: Event, seq: &AtomicU64) -> FsEventBatch {
    let mut flags = FsEventFlags::empty();
    if event.need_rescan() {
        flags |= FsEventFlags::MUST_SCAN_SUBDIRS;
    }

    event
        .paths
        .into_iter()
        .map(|path| FsEvent {
            path,
            flags,
            seq: seq.fetch_add(1, Ordering::Relaxed),
        })
        .collect::<Vec<_>>()
        .into()
}

fn convert_error(err: notify::Error, roots: &[PathBuf], seq: &AtomicU64) -> FsEventBatch {
    tracing::error!("[fs] watch stream error: {err}");

    // Without paths the whole watched set is suspect.
    let paths = if err.paths.is_empty() {
        roots.to_vec()
    } else {
        err.paths
    };

    paths
        .into_iter()
        .map(|path| FsEvent {
            path,
            flags: FsEventFlags::KERNEL_DROPPED,
            seq: seq.fetch_add(1, Ordering::Relaxed),
        })
        .collect::<Vec<_>>()
        .into()
}

/// A source fed from outside the daemon.
///
/// Platform bindings for workstation and configuration-store notifications
/// hold a [`SourceHandle`] and deliver through it; tests use the same
/// mechanism as a fake adapter.
pub struct ChannelSource {
    name: String,
    slot: Arc<Mutex<Option<Sender<RawEvent>>>>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle that can deliver events once the daemon has started.
    pub fn handle(&self) -> SourceHandle {
        SourceHandle {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, tx: Sender<RawEvent>) -> Result<(), SourceError> {
        *self.slot.lock() = Some(tx);
        Ok(())
    }
}

/// Delivery handle for a [`ChannelSource`]. Cloneable and usable from any
/// thread.
#[derive(Clone)]
pub struct SourceHandle {
    slot: Arc<Mutex<Option<Sender<RawEvent>>>>,
}

impl SourceHandle {
    /// Deliver one event. Returns false if the source has not started or
    /// the daemon is gone.
    pub fn deliver(&self, event: RawEvent) -> bool {
        match &*self.slot.lock() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}
