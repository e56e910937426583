//! In-memory segment store
//!
//! Keeps a flat map of paths to shared byte buffers plus the set of known
//! directories, so that it fails the same way the filesystem does when a
//! segment folder is missing.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

type FileData = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
struct Tree {
    dirs: HashSet<PathBuf>,
    files: HashMap<PathBuf, FileData>,
}

/// Segment store kept in RAM
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

/// An open in-memory file
#[derive(Debug)]
pub struct MemoryFile {
    data: FileData,
}

impl MemoryFile {
    pub(super) fn write(&mut self, data: &[u8]) {
        lock(&self.data).extend_from_slice(data);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned lock only means another thread panicked mid-copy; the
    // byte buffers stay structurally valid.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored
    pub fn file_count(&self) -> usize {
        lock(&self.tree).files.len()
    }

    pub(super) fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        let mut tree = lock(&self.tree);
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            tree.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    pub(super) fn create(&self, path: &Path) -> io::Result<MemoryFile> {
        let mut tree = lock(&self.tree);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !tree.dirs.contains(parent) {
                return Err(not_found(parent));
            }
        }
        let data = FileData::default();
        tree.files.insert(path.to_path_buf(), Arc::clone(&data));
        Ok(MemoryFile { data })
    }

    pub(super) fn read(&self, path: &Path) -> io::Result<Bytes> {
        let tree = lock(&self.tree);
        let data = tree.files.get(path).ok_or_else(|| not_found(path))?;
        let bytes = Bytes::copy_from_slice(&lock(data));
        Ok(bytes)
    }

    pub(super) fn exists(&self, path: &Path) -> bool {
        let tree = lock(&self.tree);
        tree.files.contains_key(path) || tree.dirs.contains(path)
    }

    pub(super) fn remove(&self, path: &Path) -> io::Result<()> {
        lock(&self.tree)
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    pub(super) fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        let mut tree = lock(&self.tree);
        tree.files.retain(|path, _| !path.starts_with(dir));
        tree.dirs.retain(|path| !path.starts_with(dir));
        Ok(())
    }
}
