//! Pooled HTTP client for the upstream chat-completions API.
//!
//! [`UpstreamClient`] is created once at startup and shared by every request.
//! Each call opens a streaming POST and hands back the response body as a lazy
//! stream of text lines. Dropping that stream tears the connection down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::types::ChatPayload;
use crate::config::{ApiKey, UpstreamConfig};
use crate::error::{Error, Result};

/// Shared upstream client: keep-alive pool plus a bound on open streams.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    url: Arc<str>,
    api_key: ApiKey,
    slots: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl UpstreamClient {
    /// Build the client from configuration.
    ///
    /// Only the connect phase is bounded; body reads have no timeout because
    /// generation time is unbounded.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_connections)
            .build()
            .map_err(Error::ClientBuild)?;

        Ok(Self {
            http,
            url: Arc::from(config.url.as_str()),
            api_key: config.api_key.clone(),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a streaming completion and return its body as lines.
    ///
    /// A non-success status fails here, before any line is produced.
    pub async fn stream_chat(&self, payload: &ChatPayload) -> Result<UpstreamLines> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ClientClosed)?;

        let response = self
            .http
            .post(&*self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %self.url, "Failed to reach upstream");
                Error::UpstreamUnreachable(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, url = %self.url, "Upstream returned error status");
            return Err(Error::UpstreamStatus { status });
        }

        Ok(UpstreamLines::new(response.bytes_stream().boxed(), permit))
    }

    /// Close the client. Later calls to [`stream_chat`](Self::stream_chat)
    /// fail with [`Error::ClientClosed`]. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.slots.close();
            tracing::info!("Upstream client closed");
        }
    }
}

/// Longest line [`LineBuffer`] will hold. Longer lines are dropped whole.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles text lines from arbitrarily split byte chunks.
///
/// Lines end at `\n`; a trailing `\r` is removed. Invalid UTF-8 is decoded
/// lossily. Only newly pushed bytes are scanned for newlines. A line that
/// grows past [`MAX_LINE_BYTES`] is discarded up to its terminating newline.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = (&rest[..pos], &rest[pos + 1..]);
            if self.discarding {
                self.discarding = false;
            } else if self.buffer.len() + head.len() > MAX_LINE_BYTES {
                // the newline ends the oversized line, nothing left to discard
                self.drop_oversized(self.buffer.len() + head.len());
                self.discarding = false;
            } else if self.buffer.is_empty() {
                lines.push(decode_line(head));
            } else {
                self.buffer.extend_from_slice(head);
                lines.push(decode_line(&self.buffer));
                self.buffer.clear();
            }
            rest = tail;
        }

        if !self.discarding && !rest.is_empty() {
            if self.buffer.len() + rest.len() > MAX_LINE_BYTES {
                self.drop_oversized(self.buffer.len() + rest.len());
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }
        lines
    }

    /// Flush whatever is left as a final, unterminated line.
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }

    fn drop_oversized(&mut self, seen: usize) {
        tracing::warn!(
            bytes = seen,
            limit = MAX_LINE_BYTES,
            reason = "oversized",
            "Dropped upstream line"
        );
        self.buffer.clear();
        self.discarding = true;
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Lazy stream of lines from one upstream response body.
///
/// Holds the connection and its pool slot; both are released on drop,
/// whether the body was exhausted or not.
pub struct UpstreamLines {
    inner: BoxStream<'static, Result<String>>,
}

struct LineState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: LineBuffer,
    pending: VecDeque<String>,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl UpstreamLines {
    fn new(body: BoxStream<'static, reqwest::Result<Bytes>>, permit: OwnedSemaphorePermit) -> Self {
        let state = LineState {
            body,
            buffer: LineBuffer::new(),
            pending: VecDeque::new(),
            finished: false,
            _permit: permit,
        };

        let inner = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(line) = st.pending.pop_front() {
                    return Some((Ok(line), st));
                }
                if st.finished {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(chunk)) => {
                        let lines = st.buffer.push(&chunk);
                        st.pending.extend(lines);
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(Error::Stream(e)), st));
                    }
                    None => {
                        st.finished = true;
                        st.pending.extend(st.buffer.finish());
                    }
                }
            }
        })
        .boxed();

        Self { inner }
    }
}

impl Stream for UpstreamLines {
    type Item = Result<String>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
