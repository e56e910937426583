//! Process-backed backend
//!
//! Spawns the configured transcoder with the channel URL substituted into
//! its option template and reads MPEG-TS from its stdout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorCode};
use crate::relay::config::URL_PLACEHOLDER;
use crate::relay::ErrorCause;

use super::{Forwarded, WorkerShared};

/// Build the transcoder arguments for one URL
///
/// The template is split on single spaces; the URL replaces the placeholder
/// inside each argument. ffmpeg additionally receives the user agent (except
/// for RTP sources) and the provider's HTTP proxy ahead of the template.
pub fn build_args(
    transcoder: &Path,
    template: &str,
    url: &str,
    user_agent: Option<&str>,
    http_proxy: Option<&str>,
) -> Vec<String> {
    let mut args = Vec::new();

    if is_ffmpeg(transcoder) {
        if let Some(agent) = user_agent.filter(|a| !a.is_empty()) {
            if !url.starts_with("rtp://") {
                args.push("-user_agent".to_string());
                args.push(agent.to_string());
            }
        }
        if let Some(proxy) = http_proxy.filter(|p| !p.is_empty()) {
            args.push("-http_proxy".to_string());
            args.push(proxy.to_string());
        }
    }

    args.extend(
        template
            .split(' ')
            .filter(|arg| !arg.is_empty())
            .map(|arg| arg.replacen(URL_PLACEHOLDER, url, 1)),
    );
    args
}

fn is_ffmpeg(transcoder: &Path) -> bool {
    stem_is(transcoder, &["ffmpeg"])
}

fn is_vlc(transcoder: &Path) -> bool {
    stem_is(transcoder, &["vlc", "cvlc"])
}

fn stem_is(transcoder: &Path, names: &[&str]) -> bool {
    transcoder
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| names.iter().any(|name| stem.eq_ignore_ascii_case(name)))
}

/// Upper bound for a one-off conversion
const CONVERT_TIMEOUT: Duration = Duration::from_secs(60);

/// Arguments rendering `image` into a one second 1080p MPEG-TS clip
///
/// Only ffmpeg and VLC are known; any other transcoder yields `None`.
pub fn still_clip_args(transcoder: &Path, image: &Path, output: &Path) -> Option<Vec<String>> {
    let image = image.display().to_string();
    let output = output.display().to_string();

    if is_ffmpeg(transcoder) {
        let args: &[&str] = &[
            "-y", "-loop", "1", "-i", &image, "-c:v", "libx264", "-t", "1", "-pix_fmt", "yuv420p",
            "-vf", "scale=1920:1080", "-f", "mpegts", &output,
        ];
        return Some(args.iter().map(|a| a.to_string()).collect());
    }

    if is_vlc(transcoder) {
        let sout = format!(
            "#transcode{{vcodec=h264,vb=1024,scale=1,width=1920,height=1080,acodec=none,\
             venc=x264{{preset=ultrafast}}}}:standard{{access=file,mux=ts,dst={}}}",
            output
        );
        let args: &[&str] = &[
            "-I", "dummy", "--no-audio", "--image-duration=1", "--sout", &sout, &image,
            "vlc://quit",
        ];
        return Some(args.iter().map(|a| a.to_string()).collect());
    }

    None
}

/// Run the transcoder once and wait for it to exit successfully
///
/// Used for conversions outside any stream; the PID is not recorded because
/// the call does not outlive the process.
pub async fn run_to_completion(transcoder: &Path, args: &[String]) -> crate::Result<()> {
    let failed = |message: String| Error::Transcoder {
        path: transcoder.to_path_buf(),
        message,
    };

    tracing::debug!(transcoder = %transcoder.display(), args = ?args, "Running transcoder");

    let child = Command::new(transcoder)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    let output = tokio::time::timeout(CONVERT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| failed(format!("no exit within {}s", CONVERT_TIMEOUT.as_secs())))?
        .map_err(|e| failed(e.to_string()))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
        tracing::debug!("transcoder: {}", line);
    }

    if !output.status.success() {
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or_default();
        return Err(failed(format!("{} {}", output.status, last.trim())));
    }
    Ok(())
}

/// Run the transcoder for `url` until it exits or the run is stopped
pub(crate) async fn run(
    shared: &WorkerShared,
    url: &str,
    pipe: &mpsc::Sender<bytes::Bytes>,
    stop: &CancellationToken,
) -> Result<(), ErrorCause> {
    let transcoder = &shared.config.transcoder;
    let args = build_args(
        &transcoder.path,
        &transcoder.options,
        url,
        shared.config.user_agent.as_deref(),
        shared.provider.http_proxy.as_deref(),
    );

    tracing::debug!(
        stream = %shared.key,
        transcoder = %transcoder.path.display(),
        args = ?args,
        "Spawning transcoder"
    );

    let mut child = Command::new(&transcoder.path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ErrorCause::ProcessStart(format!("{}: {}", transcoder.path.display(), e)))?;

    let pid = child.id();
    if let Some(pid) = pid {
        if let Err(e) = shared.pids.record(pid).await {
            tracing::warn!(
                stream = %shared.key,
                pid,
                code = ErrorCode::PidLedgerFailed.as_u16(),
                error = %e,
                "Could not record transcoder PID"
            );
        }
    }

    if let Some(stderr) = child.stderr.take() {
        let key = shared.key.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    tracing::debug!(stream = %key, "transcoder: {}", line);
                }
            }
        });
    }

    let result = pump(shared, &mut child, pipe, stop).await;

    reap(shared, &mut child, pid).await;
    result
}

async fn pump(
    shared: &WorkerShared,
    child: &mut Child,
    pipe: &mpsc::Sender<bytes::Bytes>,
    stop: &CancellationToken,
) -> Result<(), ErrorCause> {
    let Some(mut stdout) = child.stdout.take() else {
        return Err(ErrorCause::ProcessStart("stdout not captured".into()));
    };

    let chunk_size = shared.config.chunk_size;
    let mut buf = BytesMut::with_capacity(chunk_size);

    loop {
        buf.reserve(chunk_size);
        let mut limited = (&mut stdout).take(chunk_size as u64);
        let read = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            read = limited.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => return Err(ErrorCause::EndOfStream),
            Ok(_) => {
                let chunk = buf.split().freeze();
                if shared.forward(chunk, pipe, stop).await? == Forwarded::Stopped {
                    return Ok(());
                }
            }
            Err(e) => return Err(ErrorCause::ReadFailed(e.to_string())),
        }
    }
}

async fn reap(shared: &WorkerShared, child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        tracing::trace!(stream = %shared.key, error = %e, "Transcoder already exited");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(stream = %shared.key, %status, "Transcoder exited"),
        Err(e) => tracing::warn!(stream = %shared.key, error = %e, "Could not wait for transcoder"),
    }

    if let Some(pid) = pid {
        if let Err(e) = shared.pids.remove(pid).await {
            tracing::warn!(
                stream = %shared.key,
                pid,
                code = ErrorCode::PidLedgerFailed.as_u16(),
                error = %e,
                "Could not update PID ledger"
            );
        }
    }
}
