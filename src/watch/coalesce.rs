//! Per-path coalescing of filesystem events.
//!
//! Rapid rewrites of the same path (editor save loops, log appends) collapse
//! into one dispatch once the path has been quiet for the configured window.
//! Flags accumulate across merged events so an overflow bit is never lost.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::event::{FsEvent, FsEventFlags};

#[derive(Debug, Clone, Copy)]
struct Pending {
    flags: FsEventFlags,
    seq: u64,
    last_change: Instant,
}

/// Coalesces filesystem events by path.
#[derive(Debug)]
pub struct Coalescer {
    pending: HashMap<PathBuf, Pending>,
    window: Duration,
}

impl Coalescer {
    /// Create a coalescer with the given quiet window in milliseconds.
    pub fn new(window_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            window: Duration::from_millis(window_ms),
        }
    }

    /// Record one event, merging it into any pending change for its path.
    ///
    /// Flags are or-merged and the newest sequence id kept; the quiet-window
    /// timer resets.
    pub fn record(&mut self, event: FsEvent) {
        let now = Instant::now();
        let entry = self.pending.entry(event.path).or_insert(Pending {
            flags: FsEventFlags::empty(),
            seq: event.seq,
            last_change: now,
        });
        entry.flags |= event.flags;
        entry.seq = entry.seq.max(event.seq);
        entry.last_change = now;
    }

    /// Take all events whose path has been quiet for the window.
    pub fn take_ready(&mut self) -> Vec<FsEvent> {
        let now = Instant::now();
        let mut ready = Vec::new();

        self.pending.retain(|path, pending| {
            if now.duration_since(pending.last_change) >= self.window {
                ready.push(FsEvent {
                    path: path.clone(),
                    flags: pending.flags,
                    seq: pending.seq,
                });
                false
            } else {
                true
            }
        });

        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
