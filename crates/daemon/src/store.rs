//! Store seam: the persistence contract the daemon dispatches against.
//!
//! The daemon never talks to a concrete database; everything goes through
//! [`Store`], serialized by one shared lock (see [`SharedStore`]). The
//! bundled [`MemoryStore`] keeps tracked files, watched directories and
//! per-path history in memory.

use fsentry_protocol::FileInfo;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The one store lock shared by the change processor and the dispatcher.
/// Held for the duration of a single store call, never across an IPC
/// round trip.
pub type SharedStore = Arc<Mutex<dyn Store + Send>>;

/// CRUD and query surface of the history/metadata store.
pub trait Store: Send {
    /// Directories whose watches should be restored at startup.
    fn all_dirs(&self) -> Vec<PathBuf>;

    /// Start tracking a file.
    fn insert_file(&mut self, info: FileInfo);

    /// Start tracking a directory.
    fn insert_dir(&mut self, path: &Path);

    /// Stop tracking a path (file or directory); drops its history.
    fn remove(&mut self, path: &Path);

    /// Whether a change event for `path` should be recorded.
    fn is_file_tracked(&self, path: &Path) -> bool;

    /// Append one change record to the path's history.
    fn add_to_history(&mut self, info: FileInfo);

    /// Change history of one path, oldest first.
    fn history(&self, path: &Path) -> Vec<FileInfo>;

    /// Look up one tracked file by exact path.
    fn search_by_path(&self, path: &Path) -> Option<FileInfo>;

    /// All tracked files whose file name matches `name`.
    fn search_by_name(&self, name: &str) -> Vec<FileInfo>;

    /// Drop all history for every path.
    fn clear_all_history(&mut self);

    /// Drop the history of one path.
    fn clear_history(&mut self, path: &Path);

    /// All tracked files located under `dir`.
    fn files_from_dir(&self, dir: &Path) -> Vec<FileInfo>;

    /// Every tracked file.
    fn all_files(&self) -> Vec<FileInfo>;
}

/// In-memory [`Store`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: BTreeMap<PathBuf, FileInfo>,
    dirs: BTreeSet<PathBuf>,
    history: BTreeMap<PathBuf, Vec<FileInfo>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn all_dirs(&self) -> Vec<PathBuf> {
        self.dirs.iter().cloned().collect()
    }

    fn insert_file(&mut self, info: FileInfo) {
        self.files.insert(info.path.clone(), info);
    }

    fn insert_dir(&mut self, path: &Path) {
        self.dirs.insert(path.to_path_buf());
    }

    fn remove(&mut self, path: &Path) {
        self.files.remove(path);
        self.dirs.remove(path);
        self.history.remove(path);
    }

    fn is_file_tracked(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn add_to_history(&mut self, info: FileInfo) {
        self.history
            .entry(info.path.clone())
            .or_default()
            .push(info);
    }

    fn history(&self, path: &Path) -> Vec<FileInfo> {
        self.history.get(path).cloned().unwrap_or_default()
    }

    fn search_by_path(&self, path: &Path) -> Option<FileInfo> {
        self.files.get(path).cloned()
    }

    fn search_by_name(&self, name: &str) -> Vec<FileInfo> {
        self.files
            .values()
            .filter(|info| {
                info.path
                    .file_name()
                    .is_some_and(|file_name| file_name == name)
            })
            .cloned()
            .collect()
    }

    fn clear_all_history(&mut self) {
        self.history.clear();
    }

    fn clear_history(&mut self, path: &Path) {
        self.history.remove(path);
    }

    fn files_from_dir(&self, dir: &Path) -> Vec<FileInfo> {
        self.files
            .values()
            .filter(|info| info.path.starts_with(dir) && info.path != dir)
            .cloned()
            .collect()
    }

    fn all_files(&self) -> Vec<FileInfo> {
        self.files.values().cloned().collect()
    }
}

/// Wrap a store behind the shared lock.
pub fn shared(store: impl Store + 'static) -> SharedStore {
    Arc::new(Mutex::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_for(path: &str) -> FileInfo {
        let mut info = FileInfo::empty();
        info.path = PathBuf::from(path);
        info
    }

    #[test]
    fn test_insert_and_search_by_path() {
        let mut store = MemoryStore::new();
        store.insert_file(info_for("/data/a.txt"));
        assert!(store.is_file_tracked(Path::new("/data/a.txt")));
        assert!(!store.is_file_tracked(Path::new("/data/b.txt")));
        let found = store.search_by_path(Path::new("/data/a.txt")).unwrap();
        assert_eq!(found.path, PathBuf::from("/data/a.txt"));
    }

    #[test]
    fn test_search_by_name_matches_file_name_component() {
        let mut store = MemoryStore::new();
        store.insert_file(info_for("/data/a/report.txt"));
        store.insert_file(info_for("/data/b/report.txt"));
        store.insert_file(info_for("/data/b/other.txt"));
        let hits = store.search_by_name("report.txt");
        assert_eq!(hits.len(), 2);
        assert!(store.search_by_name("missing.txt").is_empty());
    }

    #[test]
    fn test_history_is_per_path_and_ordered() {
        let mut store = MemoryStore::new();
        for size in [1u64, 2, 3] {
            let mut info = info_for("/data/a.txt");
            info.size = size;
            store.add_to_history(info);
        }
        store.add_to_history(info_for("/data/b.txt"));
        let a = store.history(Path::new("/data/a.txt"));
        assert_eq!(a.iter().map(|i| i.size).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.history(Path::new("/data/b.txt")).len(), 1);
    }

    #[test]
    fn test_clear_history_selective() {
        let mut store = MemoryStore::new();
        store.add_to_history(info_for("/a"));
        store.add_to_history(info_for("/b"));
        store.clear_history(Path::new("/a"));
        assert!(store.history(Path::new("/a")).is_empty());
        assert_eq!(store.history(Path::new("/b")).len(), 1);
        store.add_to_history(info_for("/a"));
        store.clear_all_history();
        assert!(store.history(Path::new("/a")).is_empty());
        assert!(store.history(Path::new("/b")).is_empty());
    }

    #[test]
    fn test_files_from_dir_excludes_outsiders() {
        let mut store = MemoryStore::new();
        store.insert_file(info_for("/watched/one.txt"));
        store.insert_file(info_for("/watched/sub/two.txt"));
        store.insert_file(info_for("/elsewhere/three.txt"));
        let hits = store.files_from_dir(Path::new("/watched"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_remove_drops_file_dir_and_history() {
        let mut store = MemoryStore::new();
        store.insert_file(info_for("/data/a.txt"));
        store.insert_dir(Path::new("/data"));
        store.add_to_history(info_for("/data/a.txt"));
        store.remove(Path::new("/data/a.txt"));
        assert!(!store.is_file_tracked(Path::new("/data/a.txt")));
        assert!(store.history(Path::new("/data/a.txt")).is_empty());
        store.remove(Path::new("/data"));
        assert!(store.all_dirs().is_empty());
    }

    #[test]
    fn test_all_dirs_seeds_watches() {
        let mut store = MemoryStore::new();
        store.insert_dir(Path::new("/srv/b"));
        store.insert_dir(Path::new("/srv/a"));
        store.insert_dir(Path::new("/srv/a"));
        assert_eq!(
            store.all_dirs(),
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
    }
}
