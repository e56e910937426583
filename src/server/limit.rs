//! Tuner-limit substitute content
//!
//! When a provider has no free tuner the client still gets a valid MPEG-TS
//! response: an operator-supplied clip, a clip rendered from an operator
//! image, or a run of null packets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::worker::process;

use super::config::ServerConfig;

const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;
const NULL_PID: u16 = 0x1FFF;
const FILLER_PACKETS: usize = 7;

/// File name of the clip rendered from an image
pub const RENDERED_CLIP: &str = "stream-limit.ts";

/// Content served instead of a stream when the tuner limit is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitContent {
    payload: Bytes,
}

impl LimitContent {
    /// Built-in filler: MPEG-TS null packets
    pub fn filler() -> Self {
        let mut payload = BytesMut::with_capacity(TS_PACKET_SIZE * FILLER_PACKETS);
        for _ in 0..FILLER_PACKETS {
            payload.put_u8(TS_SYNC_BYTE);
            payload.put_u16(NULL_PID);
            payload.put_u8(0x10); // payload only, continuity counter 0
            payload.put_bytes(0xFF, TS_PACKET_SIZE - 4);
        }
        Self {
            payload: payload.freeze(),
        }
    }

    /// Load a clip from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await.map_err(Error::Io)?;
        if data.is_empty() {
            return Ok(Self::filler());
        }
        Ok(Self {
            payload: Bytes::from(data),
        })
    }

    /// Load `path` if given, falling back to the filler on any problem
    pub async fn load_or_filler(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::filler();
        };
        match Self::load(path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Tuner-limit content unavailable, using filler"
                );
                Self::filler()
            }
        }
    }

    /// Resolve the content configured for the server
    ///
    /// A clip path wins over the image folders; anything unusable falls back
    /// to the filler.
    pub async fn prepare(config: &ServerConfig, transcoder: &Path) -> Self {
        if let Some(path) = config.limit_content_path.as_deref() {
            return Self::load_or_filler(Some(path)).await;
        }

        let (Some(image_dir), Some(video_dir)) = (&config.limit_image_dir, &config.limit_video_dir)
        else {
            return Self::filler();
        };

        match Self::from_folders(transcoder, image_dir, video_dir).await {
            Ok(Some(content)) => content,
            Ok(None) => Self::filler(),
            Err(e) => {
                tracing::warn!(
                    image_dir = %image_dir.display(),
                    video_dir = %video_dir.display(),
                    error = %e,
                    "Tuner-limit clip unavailable, using filler"
                );
                Self::filler()
            }
        }
    }

    /// Load the clip kept in `video_dir`, rendering it from the first image
    /// in `image_dir` when needed
    ///
    /// The video folder is expected to hold exactly one clip. An empty folder
    /// or one with several files is (re)filled from the image; without an
    /// image the clip, if any, is used as is.
    pub async fn from_folders(
        transcoder: &Path,
        image_dir: &Path,
        video_dir: &Path,
    ) -> Result<Option<Self>> {
        tokio::fs::create_dir_all(video_dir).await?;

        let videos = files_in(video_dir).await?;
        let render = match videos.len() {
            0 => true,
            1 => false,
            _ => {
                for video in &videos {
                    tokio::fs::remove_file(video).await?;
                }
                true
            }
        };

        if render {
            let image = match files_in(image_dir).await {
                Ok(images) => images.into_iter().next(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            if let Some(image) = image {
                let output = video_dir.join(RENDERED_CLIP);
                let args = process::still_clip_args(transcoder, &image, &output).ok_or_else(|| {
                    Error::Transcoder {
                        path: transcoder.to_path_buf(),
                        message: "cannot render images with this transcoder".into(),
                    }
                })?;

                tracing::info!(
                    image = %image.display(),
                    clip = %output.display(),
                    "Rendering tuner-limit clip"
                );
                process::run_to_completion(transcoder, &args).await?;
            }
        }

        match files_in(video_dir).await?.first() {
            Some(clip) => Ok(Some(Self::load(clip).await?)),
            None => Ok(None),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Write the payload `repeat` times, pausing `interval` in between
    ///
    /// Stops early when the client goes away.
    pub async fn serve<W>(
        &self,
        writer: &mut W,
        repeat: u32,
        interval: Duration,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for i in 0..repeat {
            writer.write_all(&self.payload).await?;
            writer.flush().await?;
            if i + 1 < repeat {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(())
    }
}

/// Regular files in `dir`, sorted by name
async fn files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
