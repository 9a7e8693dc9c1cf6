//! Error types for the watch index.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watch registration.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("cannot watch {path}: path does not exist")]
    PathNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot watch {path}: it has no parent directory")]
    NoParent { path: PathBuf },
}
