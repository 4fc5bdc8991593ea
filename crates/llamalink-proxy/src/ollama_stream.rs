//! NDJSON → SSE streaming transcoder.
//!
//! Ollama streams newline-delimited JSON objects; OpenAI clients expect a
//! Server-Sent-Events delta stream. This module converts one into the other
//! chunk-for-chunk: events are emitted in upstream order, with no batching
//! and no buffering beyond the chunk in flight — the stream is pulled by the
//! response body, so a slow client throttles the upstream read.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};

use crate::error::ProxyError;
use crate::models::{
    ChatCompletionChunk, ChatChunkChoice, ChatDelta, CompletionChoice, CompletionResponse,
};
use crate::upstream::{StreamChunk, StreamKind};

/// Build the SSE response for a chunk stream.
pub(crate) fn sse_response<S>(
    chunks: S,
    kind: StreamKind,
    id: String,
    created: i64,
    model: String,
) -> Response
where
    S: Stream<Item = Result<StreamChunk, ProxyError>> + Send + 'static,
{
    let events = transcode(chunks, kind, id, created, model);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(events))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Where the transcoder is in the event sequence.
enum Phase {
    /// Forwarding content events.
    Streaming,
    /// Content is exhausted; the finish event is next.
    Finish { finish_reason: Option<String> },
    /// Finish event sent; the `[DONE]` sentinel is next.
    Sentinel,
    /// Stream over (after the sentinel, or after an error event).
    Done,
}

/// State threaded through the `unfold` event stream.
struct SseState {
    stream: BoxStream<'static, Result<StreamChunk, ProxyError>>,
    kind: StreamKind,
    id: String,
    created: i64,
    model: String,
    phase: Phase,
    first: bool,
}

/// Convert a chunk stream into SSE frames.
///
/// One content event per non-empty chunk, in order. The terminal chunk
/// produces a finish event (content first, if it carried any) and then the
/// `[DONE]` sentinel. A chunk-level error produces a single error event and
/// ends the stream with no sentinel — the client must never see a false
/// terminal marker after a truncated stream.
fn transcode<S>(
    chunks: S,
    kind: StreamKind,
    id: String,
    created: i64,
    model: String,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<StreamChunk, ProxyError>> + Send + 'static,
{
    let state = SseState {
        stream: chunks.boxed(),
        kind,
        id,
        created,
        model,
        phase: Phase::Streaming,
        first: true,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            match std::mem::replace(&mut st.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Sentinel => {
                    return Some((Ok(Bytes::from_static(b"data: [DONE]\n\n")), st));
                }
                Phase::Finish { finish_reason } => {
                    st.phase = Phase::Sentinel;
                    let event = st.finish_event(finish_reason);
                    return Some((Ok(event), st));
                }
                Phase::Streaming => match st.stream.next().await {
                    Some(Ok(chunk)) if chunk.done => {
                        st.phase = Phase::Finish {
                            finish_reason: chunk.finish_reason,
                        };
                        // A terminal chunk may still carry text; emit it
                        // before the finish event so nothing is lost.
                        if !chunk.content.is_empty() {
                            let event = st.content_event(&chunk.content);
                            return Some((Ok(event), st));
                        }
                    }
                    Some(Ok(chunk)) => {
                        st.phase = Phase::Streaming;
                        if chunk.content.is_empty() {
                            continue;
                        }
                        let event = st.content_event(&chunk.content);
                        return Some((Ok(event), st));
                    }
                    Some(Err(e)) => {
                        // Headers are already sent; the error travels as a
                        // data event and the stream ends without [DONE].
                        return Some((Ok(error_event(&e)), st));
                    }
                    None => {
                        return Some((Ok(error_event(&ProxyError::StreamTruncated)), st));
                    }
                },
            }
        }
    })
}

impl SseState {
    fn content_event(&mut self, content: &str) -> Bytes {
        let role = if self.first && self.kind == StreamKind::Chat {
            Some("assistant".to_string())
        } else {
            None
        };
        self.first = false;
        match self.kind {
            StreamKind::Chat => frame(&ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChatChunkChoice {
                    index: 0,
                    delta: ChatDelta {
                        role,
                        content: Some(content.to_string()),
                    },
                    finish_reason: None,
                }],
            }),
            StreamKind::Generate => frame(&CompletionResponse {
                id: self.id.clone(),
                object: "text_completion".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![CompletionChoice {
                    index: 0,
                    text: content.to_string(),
                    finish_reason: None,
                }],
                usage: None,
            }),
        }
    }

    fn finish_event(&self, finish_reason: Option<String>) -> Bytes {
        match self.kind {
            StreamKind::Chat => frame(&ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChatChunkChoice {
                    index: 0,
                    delta: ChatDelta::default(),
                    finish_reason,
                }],
            }),
            StreamKind::Generate => frame(&CompletionResponse {
                id: self.id.clone(),
                object: "text_completion".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![CompletionChoice {
                    index: 0,
                    text: String::new(),
                    finish_reason,
                }],
                usage: None,
            }),
        }
    }
}

/// Frame a serializable payload as one SSE data event.
fn frame(payload: &impl serde::Serialize) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_default();
    Bytes::from(format!("data: {json}\n\n"))
}

/// Frame a proxy error as an SSE data event carrying the OpenAI envelope.
fn error_event(e: &ProxyError) -> Bytes {
    frame(&e.envelope())
}
