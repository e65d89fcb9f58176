//! Upstream SSE reframing.
//!
//! [`reframe`] decides, line by line, what reaches the client. [`relay`] drives
//! it over an upstream line stream, stopping at the `[DONE]` sentinel.

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

use crate::error::Result;

/// Prefix stripped from upstream lines and prepended to forwarded frames.
const DATA_PREFIX: &str = "data: ";

/// Sentinel marking the end of a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Terminator frame sent to the client.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// What to do with one upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reframed {
    /// Send this frame and keep reading.
    Forward(Bytes),
    /// Send this frame and stop reading.
    Done(Bytes),
    /// Drop the line.
    Skip(SkipReason),
}

/// Why a line was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    Malformed,
    NoChoices,
    NoContent,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::Empty => "empty",
            SkipReason::Malformed => "malformed",
            SkipReason::NoChoices => "no_choices",
            SkipReason::NoContent => "no_content",
        };
        f.write_str(s)
    }
}

/// Reframe a single upstream line.
///
/// Forwarded frames carry the upstream text verbatim (after the `data: `
/// prefix) so the client sees the provider's exact bytes.
pub fn reframe(line: &str) -> Reframed {
    if line.is_empty() {
        return Reframed::Skip(SkipReason::Empty);
    }

    let content = line.strip_prefix(DATA_PREFIX).unwrap_or(line);
    if content.trim() == DONE_SENTINEL {
        return Reframed::Done(Bytes::from_static(DONE_FRAME));
    }

    let chunk: Value = match serde_json::from_str(content) {
        Ok(chunk) => chunk,
        Err(_) => return Reframed::Skip(SkipReason::Malformed),
    };

    let first_choice = match chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        Some(choice) => choice,
        None => return Reframed::Skip(SkipReason::NoChoices),
    };

    let has_content = first_choice
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .is_some_and(|text| !text.trim().is_empty());

    if !has_content {
        return Reframed::Skip(SkipReason::NoContent);
    }

    Reframed::Forward(Bytes::from(format!("{DATA_PREFIX}{content}\n\n")))
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayOutcome {
    Streaming,
    Completed,
    Exhausted,
    Failed,
}

struct RelayState {
    lines: BoxStream<'static, Result<String>>,
    request_id: String,
    forwarded: usize,
    skipped: usize,
    outcome: RelayOutcome,
}

impl Drop for RelayState {
    fn drop(&mut self) {
        let request_id = self.request_id.as_str();
        match self.outcome {
            RelayOutcome::Completed => tracing::info!(
                request_id,
                forwarded = self.forwarded,
                skipped = self.skipped,
                "Relay completed"
            ),
            RelayOutcome::Exhausted => tracing::warn!(
                request_id,
                forwarded = self.forwarded,
                skipped = self.skipped,
                "Upstream ended without [DONE]"
            ),
            RelayOutcome::Failed => tracing::warn!(
                request_id,
                forwarded = self.forwarded,
                skipped = self.skipped,
                "Relay aborted by upstream error"
            ),
            RelayOutcome::Streaming => tracing::warn!(
                request_id,
                forwarded = self.forwarded,
                skipped = self.skipped,
                "Client went away mid-stream, closing upstream"
            ),
        }
    }
}

/// Relay upstream lines to the client as SSE frames, in arrival order.
///
/// The returned stream ends after the terminator frame, or when the upstream
/// runs dry. A mid-stream upstream error is yielded once, then the stream
/// ends. Dropping the returned stream drops `lines` with it.
pub fn relay<S>(lines: S, request_id: String) -> impl Stream<Item = Result<Bytes>> + Send + 'static
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    let state = RelayState {
        lines: lines.boxed(),
        request_id,
        forwarded: 0,
        skipped: 0,
        outcome: RelayOutcome::Streaming,
    };

    stream::unfold(state, |mut st| async move {
        if st.outcome != RelayOutcome::Streaming {
            return None;
        }

        loop {
            match st.lines.next().await {
                Some(Ok(line)) => match reframe(&line) {
                    Reframed::Forward(frame) => {
                        st.forwarded += 1;
                        return Some((Ok(frame), st));
                    }
                    Reframed::Done(frame) => {
                        st.outcome = RelayOutcome::Completed;
                        return Some((Ok(frame), st));
                    }
                    Reframed::Skip(reason) => {
                        st.skipped += 1;
                        tracing::debug!(
                            request_id = %st.request_id,
                            reason = %reason,
                            "Dropped upstream line"
                        );
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(request_id = %st.request_id, error = %e, "Upstream stream failed");
                    st.outcome = RelayOutcome::Failed;
                    return Some((Err(e), st));
                }
                None => {
                    st.outcome = RelayOutcome::Exhausted;
                    return None;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn forwarded(line: &str) -> Reframed {
        Reframed::Forward(Bytes::from(format!("data: {}\n\n", line)))
    }

    async fn run(lines: Vec<&str>) -> Vec<String> {
        let items: Vec<Result<String>> = lines.into_iter().map(|l| Ok(l.to_string())).collect();
        relay(tokio_stream::iter(items), "test".to_string())
            .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[test]
    fn test_content_delta_forwarded_verbatim() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(
            reframe(line),
            Reframed::Forward(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n"
            ))
        );
    }

    #[test]
    fn test_line_without_prefix_is_accepted() {
        let line = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(reframe(line), forwarded(line));
    }

    #[test]
    fn test_original_bytes_are_preserved() {
        // Key order, spacing and float formatting must survive untouched
        let body = r#"{ "z": 1.50, "choices": [ {"delta": {"content": "x"}, "a": 1e3} ] }"#;
        let line = format!("data: {}", body);
        assert_eq!(reframe(&line), forwarded(body));
    }

    #[test]
    fn test_done_sentinel() {
        assert_eq!(
            reframe("data: [DONE]"),
            Reframed::Done(Bytes::from_static(b"data: [DONE]\n\n"))
        );
        assert!(matches!(reframe("data:  [DONE]  "), Reframed::Done(_)));
        assert!(matches!(reframe("[DONE]"), Reframed::Done(_)));
    }

    #[test]
    fn test_empty_line_skipped() {
        assert_eq!(reframe(""), Reframed::Skip(SkipReason::Empty));
    }

    #[test]
    fn test_malformed_json_skipped() {
        assert_eq!(
            reframe("data: {not json"),
            Reframed::Skip(SkipReason::Malformed)
        );
        assert_eq!(reframe(": keep-alive"), Reframed::Skip(SkipReason::Malformed));
        assert_eq!(reframe("event: message"), Reframed::Skip(SkipReason::Malformed));
        // no space after the colon means the prefix is not stripped
        assert_eq!(
            reframe(r#"data:{"choices":[{"delta":{"content":"Hi"}}]}"#),
            Reframed::Skip(SkipReason::Malformed)
        );
    }

    #[test]
    fn test_missing_or_empty_choices_skipped() {
        assert_eq!(
            reframe(r#"data: {"choices":[]}"#),
            Reframed::Skip(SkipReason::NoChoices)
        );
        assert_eq!(
            reframe(r#"data: {"id":"x"}"#),
            Reframed::Skip(SkipReason::NoChoices)
        );
        assert_eq!(
            reframe(r#"data: {"choices":null}"#),
            Reframed::Skip(SkipReason::NoChoices)
        );
        assert_eq!(
            reframe(r#"data: {"choices":{"0":{}}}"#),
            Reframed::Skip(SkipReason::NoChoices)
        );
        assert_eq!(reframe("data: 42"), Reframed::Skip(SkipReason::NoChoices));
    }

    #[test]
    fn test_missing_or_blank_content_skipped() {
        for line in [
            r#"data: {"choices":[{"index":0}]}"#,
            r#"data: {"choices":[{"delta":{}}]}"#,
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":""}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"  \n\t"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":null}}]}"#,
            r#"data: {"choices":[{"delta":{"content":7}}]}"#,
        ] {
            assert_eq!(reframe(line), Reframed::Skip(SkipReason::NoContent), "{}", line);
        }
    }

    #[test]
    fn test_only_first_choice_is_inspected() {
        let line = r#"data: {"choices":[{"delta":{}},{"delta":{"content":"second"}}]}"#;
        assert_eq!(reframe(line), Reframed::Skip(SkipReason::NoContent));
    }

    #[test]
    fn test_content_with_surrounding_whitespace_forwarded() {
        let body = r#"{"choices":[{"delta":{"content":" world"}}]}"#;
        assert_eq!(reframe(&format!("data: {}", body)), forwarded(body));
    }

    #[tokio::test]
    async fn test_relay_filters_and_preserves_order() {
        let frames = run(vec![
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            "data: {broken",
            r#"data: {"choices":[]}"#,
            r#"data: {"choices":[{"delta":{"content":" world"}}]}"#,
            "data: [DONE]",
        ])
        .await;

        assert_eq!(
            frames,
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
                "data: [DONE]\n\n",
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_stops_at_done() {
        let frames = run(vec![
            "data: [DONE]",
            r#"data: {"choices":[{"delta":{"content":"late"}}]}"#,
            "data: [DONE]",
        ])
        .await;
        assert_eq!(frames, vec!["data: [DONE]\n\n"]);
    }

    #[tokio::test]
    async fn test_relay_does_not_pull_past_done() {
        let pulled_late = Arc::new(AtomicBool::new(false));
        let flag = pulled_late.clone();
        let lines = tokio_stream::iter(vec![
            "data: [DONE]".to_string(),
            "after".to_string(),
        ])
        .map(move |line| {
            if line == "after" {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(line)
        });

        let frames: Vec<_> = relay(lines, "test".to_string()).collect().await;
        assert_eq!(frames.len(), 1);
        assert!(!pulled_late.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropping_relay_mid_stream_releases_upstream() {
        let slots = Arc::new(Semaphore::new(1));
        let permit = slots.clone().acquire_owned().await.unwrap();

        // An upstream that never finishes, holding a slot like UpstreamLines does
        let lines = stream::iter(vec![
            r#"data: {"choices":[{"delta":{"content":"first"}}]}"#.to_string(),
        ])
        .chain(stream::pending())
        .map(move |line| {
            let _slot = &permit;
            Ok(line)
        });

        let mut frames = Box::pin(relay(lines, "test".to_string()));
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n\n")
        );
        assert_eq!(slots.available_permits(), 0, "upstream still open mid-stream");

        drop(frames);
        assert_eq!(slots.available_permits(), 1, "upstream released on client drop");
    }

    #[tokio::test]
    async fn test_relay_ends_when_upstream_runs_dry() {
        let frames = run(vec![r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#]).await;
        assert_eq!(
            frames,
            vec!["data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n"]
        );
    }

    #[tokio::test]
    async fn test_relay_empty_upstream() {
        assert!(run(vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_yields_error_once_then_ends() {
        let items: Vec<Result<String>> = vec![
            Ok(r#"data: {"choices":[{"delta":{"content":"a"}}]}"#.to_string()),
            Err(Error::ClientClosed),
            Ok(r#"data: {"choices":[{"delta":{"content":"b"}}]}"#.to_string()),
        ];
        let out: Vec<Result<Bytes>> = relay(tokio_stream::iter(items), "test".to_string())
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(Error::ClientClosed)));
    }
}
