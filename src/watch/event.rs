//! Filesystem event data types.

use std::path::PathBuf;

use bitflags::bitflags;

bitflags! {
    /// Flag bits carried by one filesystem event.
    ///
    /// The two drop flags mark queue overflow on either side of the kernel
    /// boundary; both force conservative recursive dispatch so a handler
    /// that cares about completeness can do a full rescan.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsEventFlags: u32 {
        /// The adapter signals that subdirectories must be rescanned.
        const MUST_SCAN_SUBDIRS = 1 << 0;
        /// Events were dropped because we consumed the queue too slowly.
        const USER_DROPPED = 1 << 1;
        /// Events were dropped before delivery, inside the kernel.
        const KERNEL_DROPPED = 1 << 2;
    }
}

impl FsEventFlags {
    /// Whether this event must be treated as affecting an entire subtree.
    pub fn forces_recursive(self) -> bool {
        self.intersects(Self::MUST_SCAN_SUBDIRS | Self::USER_DROPPED | Self::KERNEL_DROPPED)
    }

    /// Whether either overflow flag is set.
    pub fn dropped(self) -> bool {
        self.intersects(Self::USER_DROPPED | Self::KERNEL_DROPPED)
    }
}

/// One changed path as delivered by a filesystem event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub flags: FsEventFlags,
    /// Source-assigned sequence id, monotonically increasing per source.
    pub seq: u64,
}

/// One delivery from a filesystem event source. Consumed synchronously.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsEventBatch {
    pub events: Vec<FsEvent>,
}

impl FsEventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<Vec<FsEvent>> for FsEventBatch {
    fn from(events: Vec<FsEvent>) -> Self {
        Self { events }
    }
}

/// A directory-level change as delivered to each watch callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    /// The registered root whose prefix matched.
    pub root: PathBuf,
    /// The directory containing the change.
    pub path: PathBuf,
    /// Whether the change may affect the whole subtree.
    pub recursive: bool,
}
