//! Passthrough backend
//!
//! Downloads the upstream over HTTP and relays the bytes unchanged. A plain
//! media playlist is relayed once as text; a master playlist referring to
//! other playlists is rejected.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::relay::ErrorCause;

use super::{manifest, Forwarded, WorkerShared};

/// HTTP client for one stream: user agent and provider proxy applied
pub fn client(user_agent: Option<&str>, http_proxy: Option<&str>) -> Result<Client, ErrorCause> {
    let mut builder = Client::builder();
    if let Some(agent) = user_agent.filter(|a| !a.is_empty()) {
        builder = builder.user_agent(agent);
    }
    if let Some(proxy) = http_proxy.filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| ErrorCause::ReadFailed(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| ErrorCause::ReadFailed(e.to_string()))
}

/// Relay `url` until the body ends or the run is stopped
pub(crate) async fn run(
    shared: &WorkerShared,
    url: &str,
    pipe: &mpsc::Sender<Bytes>,
    stop: &CancellationToken,
) -> Result<(), ErrorCause> {
    let http = client(
        shared.config.user_agent.as_deref(),
        shared.provider.http_proxy.as_deref(),
    )?;

    let response = tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        response = http.get(url).send() => response,
    }
    .map_err(|e| ErrorCause::ReadFailed(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ErrorCause::ReadFailed(format!("HTTP {}", status)));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    tracing::debug!(
        stream = %shared.key,
        %status,
        content_type = %content_type,
        "Upstream response"
    );

    if manifest::is_playlist(&content_type) {
        return relay_playlist(shared, response, pipe, stop).await;
    }

    let chunk_size = shared.config.chunk_size;
    let mut body = response.bytes_stream();
    let mut pending = BytesMut::with_capacity(chunk_size);

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                pending.extend_from_slice(&bytes);
                while pending.len() >= chunk_size {
                    let chunk = pending.split_to(chunk_size).freeze();
                    if shared.forward(chunk, pipe, stop).await? == Forwarded::Stopped {
                        return Ok(());
                    }
                }
            }
            Some(Err(e)) => return Err(ErrorCause::ReadFailed(e.to_string())),
            None => {
                if !pending.is_empty() {
                    let rest = pending.split().freeze();
                    if shared.forward(rest, pipe, stop).await? == Forwarded::Stopped {
                        return Ok(());
                    }
                }
                return Err(ErrorCause::EndOfStream);
            }
        }
    }
}

async fn relay_playlist(
    shared: &WorkerShared,
    response: reqwest::Response,
    pipe: &mpsc::Sender<Bytes>,
    stop: &CancellationToken,
) -> Result<(), ErrorCause> {
    let text = tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        text = response.text() => text,
    }
    .map_err(|e| ErrorCause::ReadFailed(e.to_string()))?;

    let refs = manifest::parse(&text);
    if !refs.is_empty() {
        tracing::warn!(
            stream = %shared.key,
            variants = refs.variants.len(),
            audio = refs.audio.len(),
            "Upstream is a master playlist"
        );
        return Err(ErrorCause::ManifestUnsupported);
    }

    if shared.forward(Bytes::from(text), pipe, stop).await? == Forwarded::Stopped {
        return Ok(());
    }
    Err(ErrorCause::EndOfStream)
}
