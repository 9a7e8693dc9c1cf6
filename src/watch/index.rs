//! Watch index with root resolution and prefix dispatch.
//!
//! Maps canonicalized directory roots to ordered lists of callbacks. A
//! change fires every root that is a path-prefix of the changed directory,
//! so a watch on `/a` sees changes under `/a/b/c`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::error::WatchError;
use super::event::{FsChange, FsEventFlags};

/// Callback invoked for each matching directory-level change.
pub type WatchCallback = Rc<dyn Fn(&FsChange)>;

/// Registry of watch roots and their interested callbacks.
///
/// Roots are created lazily on first registration beneath them and never
/// removed; a process restart is the only teardown.
#[derive(Default)]
pub struct WatchIndex {
    /// Root directory -> callbacks in registration order.
    roots: BTreeMap<PathBuf, Vec<WatchCallback>>,
}

impl WatchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for changes under `path`.
    ///
    /// The path is resolved to an absolute, symlink-free form. A file
    /// resolves to its parent directory, since the underlying OS primitive
    /// only reports directory-level changes. Registration appends; earlier
    /// callbacks on the same root are kept.
    ///
    /// Returns the root the callback was registered under.
    pub fn add_watch(&mut self, path: &Path, callback: WatchCallback) -> Result<PathBuf, WatchError> {
        let resolved = path
            .canonicalize()
            .map_err(|source| WatchError::PathNotFound {
                path: path.to_path_buf(),
                source,
            })?;

        let root = if resolved.is_dir() {
            resolved
        } else {
            match resolved.parent() {
                Some(parent) => parent.to_path_buf(),
                None => return Err(WatchError::NoParent { path: resolved }),
            }
        };

        self.roots.entry(root.clone()).or_default().push(callback);
        Ok(root)
    }

    /// Dispatch one changed path to every interested callback.
    ///
    /// The changed path is reduced to its containing directory; every root
    /// that is a component-wise prefix of that directory fires all of its
    /// callbacks. `recursive` is computed from this event's flags alone.
    /// Returns the number of callbacks fired.
    pub fn dispatch(&self, changed: &Path, flags: FsEventFlags) -> usize {
        if flags.contains(FsEventFlags::USER_DROPPED) {
            tracing::error!(
                "[watch] we were too slow processing filesystem events and some were dropped"
            );
        }
        if flags.contains(FsEventFlags::KERNEL_DROPPED) {
            tracing::error!("[watch] the kernel dropped filesystem events before delivery");
        }

        let dir = changed
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(changed);
        let recursive = flags.forces_recursive();

        let mut fired = 0;
        for (root, callbacks) in &self.roots {
            if !dir.starts_with(root) {
                continue;
            }
            crate::debug_event!(
                "watch",
                "dispatch",
                "{} callback(s) on {} for {}",
                callbacks.len(),
                root.display(),
                dir.display()
            );
            for callback in callbacks {
                callback(&FsChange {
                    root: root.clone(),
                    path: dir.to_path_buf(),
                    recursive,
                });
                fired += 1;
            }
        }
        fired
    }

    /// All registered roots, in sorted order.
    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.roots.keys().map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Total number of registered callbacks across all roots.
    pub fn callback_count(&self) -> usize {
        self.roots.values().map(Vec::len).sum()
    }
}

impl fmt::Debug for WatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (root, callbacks) in &self.roots {
            map.entry(&root.display().to_string(), &callbacks.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;

    /// Records every change a callback receives.
    fn recorder(log: &Rc<RefCell<Vec<FsChange>>>) -> WatchCallback {
        let log = Rc::clone(log);
        Rc::new(move |change: &FsChange| log.borrow_mut().push(change.clone()))
    }

    #[test]
    fn watch_on_file_resolves_to_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let file = base.join("config.toml");
        fs::write(&file, "x").unwrap();

        let mut index = WatchIndex::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = index.add_watch(&file, recorder(&log)).unwrap();

        assert_eq!(root, base);
        assert_eq!(index.root_count(), 1);
    }

    #[test]
    fn missing_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = WatchIndex::new();
        let err = index
            .add_watch(&dir.path().join("nope"), Rc::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, WatchError::PathNotFound { .. }));
    }

    #[test]
    fn prefix_dispatch_fires_nested_roots() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("a/b")).unwrap();

        let mut index = WatchIndex::new();
        let outer = Rc::new(RefCell::new(Vec::new()));
        let inner = Rc::new(RefCell::new(Vec::new()));
        index.add_watch(&base.join("a"), recorder(&outer)).unwrap();
        index.add_watch(&base.join("a/b"), recorder(&inner)).unwrap();

        let fired = index.dispatch(&base.join("a/b/c.txt"), FsEventFlags::empty());

        assert_eq!(fired, 2);
        assert_eq!(outer.borrow().len(), 1);
        assert_eq!(inner.borrow().len(), 1);
        let change = &outer.borrow()[0];
        assert_eq!(change.root, base.join("a"));
        assert_eq!(change.path, base.join("a/b"));
        assert!(!change.recursive);
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        fs::create_dir_all(base.join("a")).unwrap();
        fs::create_dir_all(base.join("ab")).unwrap();

        let mut index = WatchIndex::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        index.add_watch(&base.join("a"), recorder(&log)).unwrap();

        // A sibling whose name shares a string prefix must not match.
        let fired = index.dispatch(&base.join("ab/file.txt"), FsEventFlags::empty());
        assert_eq!(fired, 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn registration_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();

        let mut index = WatchIndex::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Rc::clone(&order);
            index
                .add_watch(&base, Rc::new(move |_| order.borrow_mut().push(tag)))
                .unwrap();
        }

        index.dispatch(&base.join("x"), FsEventFlags::empty());
        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert_eq!(index.callback_count(), 2);
    }

    #[test]
    fn drop_flags_dispatch_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();

        let mut index = WatchIndex::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        index.add_watch(&base, recorder(&log)).unwrap();

        index.dispatch(&base.join("x"), FsEventFlags::USER_DROPPED);
        index.dispatch(&base.join("x"), FsEventFlags::KERNEL_DROPPED);
        index.dispatch(
            &base.join("x"),
            FsEventFlags::KERNEL_DROPPED | FsEventFlags::MUST_SCAN_SUBDIRS,
        );

        assert!(log.borrow().iter().all(|change| change.recursive));
    }

    #[test]
    fn recursive_is_fresh_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();

        let mut index = WatchIndex::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        index.add_watch(&base, recorder(&log)).unwrap();

        // A flagged event must not leak its recursive bit into the next one.
        index.dispatch(&base.join("x"), FsEventFlags::MUST_SCAN_SUBDIRS);
        index.dispatch(&base.join("y"), FsEventFlags::empty());

        let log = log.borrow();
        assert!(log[0].recursive);
        assert!(!log[1].recursive);
    }
}
