//! Segment store
//!
//! Transient media segments are written by an upstream worker and read back by
//! late joiners. The store is either the real filesystem or an in-memory tree,
//! selected once from configuration.
//!
//! Both variants share the same semantics: creating a file requires its parent
//! directory to exist, and each segment has its own file name, so concurrent
//! creation and removal by the worker never races with readers of other
//! segments.

pub mod disk;
pub mod memory;

use std::io;
use std::path::Path;

use bytes::Bytes;

pub use disk::DiskStore;
pub use memory::{MemoryFile, MemoryStore};

/// Storage backend for segment files
#[derive(Debug, Clone)]
pub enum SegmentStore {
    /// Files on the local filesystem
    Disk(DiskStore),
    /// Files kept in RAM
    Memory(MemoryStore),
}

impl SegmentStore {
    /// Select the store variant
    pub fn new(in_memory: bool) -> Self {
        if in_memory {
            SegmentStore::Memory(MemoryStore::new())
        } else {
            SegmentStore::Disk(DiskStore)
        }
    }

    /// Whether segments live in RAM
    pub fn is_memory(&self) -> bool {
        matches!(self, SegmentStore::Memory(_))
    }

    /// Create a directory and all missing parents
    pub async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        match self {
            SegmentStore::Disk(store) => store.create_dir_all(dir).await,
            SegmentStore::Memory(store) => store.create_dir_all(dir),
        }
    }

    /// Create (or truncate) a file for writing
    pub async fn create(&self, path: &Path) -> io::Result<SegmentFile> {
        match self {
            SegmentStore::Disk(store) => store.create(path).await.map(SegmentFile::Disk),
            SegmentStore::Memory(store) => store.create(path).map(SegmentFile::Memory),
        }
    }

    /// Read a whole file
    pub async fn read(&self, path: &Path) -> io::Result<Bytes> {
        match self {
            SegmentStore::Disk(store) => store.read(path).await,
            SegmentStore::Memory(store) => store.read(path),
        }
    }

    /// Check whether a file or directory exists
    pub async fn exists(&self, path: &Path) -> bool {
        match self {
            SegmentStore::Disk(store) => store.exists(path).await,
            SegmentStore::Memory(store) => store.exists(path),
        }
    }

    /// Remove a single file
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        match self {
            SegmentStore::Disk(store) => store.remove(path).await,
            SegmentStore::Memory(store) => store.remove(path),
        }
    }

    /// Remove a directory and everything below it
    ///
    /// Removing a directory that does not exist is not an error.
    pub async fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        match self {
            SegmentStore::Disk(store) => store.remove_dir_all(dir).await,
            SegmentStore::Memory(store) => store.remove_dir_all(dir),
        }
    }
}

/// An open segment file
#[derive(Debug)]
pub enum SegmentFile {
    Disk(tokio::fs::File),
    Memory(MemoryFile),
}

impl SegmentFile {
    /// Append data to the file
    ///
    /// Data is visible to readers once this returns.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            SegmentFile::Disk(file) => disk::write(file, data).await,
            SegmentFile::Memory(file) => {
                file.write(data);
                Ok(())
            }
        }
    }

    /// Flush and close the file
    pub async fn close(self) -> io::Result<()> {
        match self {
            SegmentFile::Disk(file) => disk::close(file).await,
            SegmentFile::Memory(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: SegmentStore, root: &Path) {
        let dir = root.join("M1").join("101");
        let file_path = dir.join("1.ts");

        // Parent must exist
        assert!(store.create(&file_path).await.is_err());

        store.create_dir_all(&dir).await.unwrap();
        let mut file = store.create(&file_path).await.unwrap();
        file.write(b"hello ").await.unwrap();

        // Readable while still open
        assert_eq!(&store.read(&file_path).await.unwrap()[..], b"hello ");

        file.write(b"world").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(&store.read(&file_path).await.unwrap()[..], b"hello world");

        store.remove(&file_path).await.unwrap();
        assert!(!store.exists(&file_path).await);

        let mut other = store.create(&dir.join("2.ts")).await.unwrap();
        other.write(b"x").await.unwrap();
        other.close().await.unwrap();

        store.remove_dir_all(&root.join("M1")).await.unwrap();
        assert!(!store.exists(&dir).await);
        assert!(!store.exists(&dir.join("2.ts")).await);

        // Removing twice is fine
        store.remove_dir_all(&root.join("M1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_semantics() {
        let store = SegmentStore::new(true);
        assert!(store.is_memory());
        exercise(store, Path::new("/relay")).await;
    }

    #[tokio::test]
    async fn test_disk_store_semantics() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(false);
        assert!(!store.is_memory());
        exercise(store, tmp.path()).await;
    }
}
