//! Rotating segment files
//!
//! Upstream bytes are written to `<folder>/<seq>.ts`, starting at `1.ts`.
//! Once the current segment holds `segment_size` bytes, the next write closes
//! it and opens the following sequence number. Only the newest
//! `retention` segments are kept.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use crate::relay::ErrorCause;
use crate::store::{SegmentFile, SegmentStore};

/// Writes upstream data into rotating segment files
#[derive(Debug)]
pub struct SegmentWriter {
    store: SegmentStore,
    folder: PathBuf,
    segment_size: usize,
    retention: usize,
    /// Sequence number of the current segment
    sequence: u64,
    /// Bytes written to the current segment
    written: usize,
    file: Option<SegmentFile>,
    /// Segments on the store, oldest first (includes the current one)
    window: VecDeque<PathBuf>,
}

impl SegmentWriter {
    pub fn new(
        store: SegmentStore,
        folder: PathBuf,
        segment_size: usize,
        retention: usize,
    ) -> Self {
        Self {
            store,
            folder,
            segment_size: segment_size.max(1),
            retention: retention.max(1),
            sequence: 0,
            written: 0,
            file: None,
            window: VecDeque::new(),
        }
    }

    /// Store the segments live on
    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    /// Folder holding the segments
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Sequence number of the current segment (0 before the first write)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Path of the segment currently being written
    pub fn current_path(&self) -> Option<&Path> {
        self.window.back().map(PathBuf::as_path)
    }

    /// Retained segment paths, oldest first
    pub fn retained(&self) -> impl Iterator<Item = &Path> {
        self.window.iter().map(PathBuf::as_path)
    }

    fn segment_path(&self, sequence: u64) -> PathBuf {
        self.folder.join(format!("{}.ts", sequence))
    }

    /// Make sure the segment folder exists
    pub async fn prepare(&self) -> Result<(), ErrorCause> {
        self.store
            .create_dir_all(&self.folder)
            .await
            .map_err(|e| {
                ErrorCause::BufferFolderMissing(format!("{}: {}", self.folder.display(), e))
            })
    }

    /// Append a chunk, rolling over to a new segment when the current one is full
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ErrorCause> {
        if self.file.is_none() || self.written >= self.segment_size {
            self.rotate().await?;
        }

        let Some(file) = self.file.as_mut() else {
            return Err(ErrorCause::SegmentCreate("no open segment".into()));
        };
        file.write(chunk)
            .await
            .map_err(|e| ErrorCause::WriteFailed(e.to_string()))?;
        self.written += chunk.len();
        Ok(())
    }

    /// Close the current segment (the next write opens a new one)
    pub async fn finish(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close().await {
                tracing::warn!(
                    folder = %self.folder.display(),
                    error = %e,
                    "Failed to close segment"
                );
            }
        }
    }

    async fn rotate(&mut self) -> Result<(), ErrorCause> {
        self.finish().await;

        let next = self.sequence + 1;
        let path = self.segment_path(next);
        let file = self.store.create(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ErrorCause::BufferFolderMissing(format!("{}: {}", self.folder.display(), e))
            }
            _ => ErrorCause::SegmentCreate(format!("{}: {}", path.display(), e)),
        })?;

        self.file = Some(file);
        self.sequence = next;
        self.written = 0;
        self.window.push_back(path);

        tracing::trace!(folder = %self.folder.display(), sequence = next, "Segment opened");

        self.prune().await;
        Ok(())
    }

    async fn prune(&mut self) {
        while self.window.len() > self.retention {
            let Some(oldest) = self.window.pop_front() else {
                break;
            };
            if let Err(e) = self.store.remove(&oldest).await {
                tracing::warn!(
                    path = %oldest.display(),
                    error = %e,
                    "Old segment could not be deleted"
                );
            }
        }
    }
}
