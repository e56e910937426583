//! Filesystem-backed segment store

use std::io;
use std::path::Path;

use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Segment store on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStore;

impl DiskStore {
    pub(super) async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir).await
    }

    pub(super) async fn create(&self, path: &Path) -> io::Result<fs::File> {
        fs::File::create(path).await
    }

    pub(super) async fn read(&self, path: &Path) -> io::Result<Bytes> {
        fs::read(path).await.map(Bytes::from)
    }

    pub(super) async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub(super) async fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }

    pub(super) async fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

// tokio buffers file writes in a background operation; flushing makes the
// bytes visible to late-join readers.
pub(super) async fn write(file: &mut fs::File, data: &[u8]) -> io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

pub(super) async fn close(mut file: fs::File) -> io::Result<()> {
    file.flush().await
}
