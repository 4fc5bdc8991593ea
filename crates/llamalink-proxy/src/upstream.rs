//! HTTP client for the upstream Ollama server.
//!
//! Buffered calls are bounded by the configured timeout as a whole; the
//! streaming mode bounds each read from the upstream socket instead, so a
//! stalled stream surfaces as [`ProxyError::UpstreamTimeout`] rather than
//! hanging. Dropping a chunk stream drops the underlying response, which
//! closes the upstream connection — that is the cancellation path when a
//! client disconnects mid-stream.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use llamalink_core::Config;

use crate::error::ProxyError;
use crate::translate;

/// Which native endpoint a stream came from; decides where the text lives
/// in each chunk (`message.content` vs `response`) and how the transcoder
/// frames the SSE events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Chat,
    Generate,
}

/// One unit of an Ollama NDJSON stream, already reduced to what the
/// transcoder needs.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Text fragment carried by this chunk (may be empty).
    pub content: String,
    /// Whether this is the terminal chunk of the stream.
    pub done: bool,
    /// OpenAI finish reason, mapped from `done_reason` on the terminal chunk.
    pub finish_reason: Option<String>,
}

/// Client for the Ollama server named by the active [`Config`].
///
/// Cheap to clone — wraps a shared `reqwest::Client` connection pool.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl UpstreamClient {
    /// Build a client from the active configuration.
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.ollama_base_url.clone(),
            timeout: config.timeout_duration(),
        })
    }

    /// GET a JSON payload from the upstream, bounded by the timeout.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProxyError> {
        let url = self.endpoint(path);
        debug!("GET {url}");
        let fut = async {
            let response = self.client.get(&url).send().await.map_err(map_reqwest_err)?;
            Self::read_json(response).await
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
    }

    /// POST a JSON body and read a JSON response, bounded by the timeout.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ProxyError> {
        let url = self.endpoint(path);
        debug!("POST {url}");
        let fut = async {
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(map_reqwest_err)?;
            Self::read_json(response).await
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
    }

    /// POST a JSON body and expose the NDJSON response as a lazy chunk
    /// stream.
    ///
    /// The request itself (connect + status line) is bounded by the
    /// timeout; afterwards each read is bounded individually. A close
    /// without a `done` chunk yields [`ProxyError::StreamTruncated`] as the
    /// final item.
    pub async fn post_stream(
        &self,
        path: &str,
        body: &impl Serialize,
        kind: StreamKind,
    ) -> Result<impl Stream<Item = Result<StreamChunk, ProxyError>> + Send + 'static, ProxyError>
    {
        let url = self.endpoint(path);
        debug!("POST {url} (streaming)");
        let send_fut = async {
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(map_reqwest_err)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProxyError::UpstreamStatus {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response)
        };
        let response = tokio::time::timeout(self.timeout, send_fut)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)??;

        Ok(chunk_stream(response.bytes_stream().boxed(), self.timeout, kind))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProxyError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(format!("Invalid upstream response: {e}")))
    }
}

/// Map a reqwest transport error onto the proxy taxonomy.
fn map_reqwest_err(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTimeout
    } else {
        ProxyError::UpstreamUnavailable(e.to_string())
    }
}

/// State threaded through the NDJSON chunk stream.
struct ChunkState {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: BytesMut,
    timeout: Duration,
    kind: StreamKind,
    /// Byte stream exhausted; only buffered data remains.
    eof: bool,
    /// Terminal item yielded; the stream is over.
    finished: bool,
}

/// Turn the raw byte stream into parsed [`StreamChunk`]s, one per NDJSON
/// line, bounding each upstream read by `timeout`.
fn chunk_stream(
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    timeout: Duration,
    kind: StreamKind,
) -> impl Stream<Item = Result<StreamChunk, ProxyError>> + Send + 'static {
    let state = ChunkState {
        stream,
        buf: BytesMut::new(),
        timeout,
        kind,
        eof: false,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }

        loop {
            // Drain complete lines (plus the trailing partial line at EOF).
            if let Some(line) = next_line(&mut st.buf, st.eof) {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<serde_json::Value>(&line) {
                    Ok(value) => {
                        let chunk = parse_chunk(st.kind, &value);
                        if chunk.done {
                            st.finished = true;
                        }
                        return Some((Ok(chunk), st));
                    }
                    Err(e) => {
                        // Skip unparsable lines, matching the lenient
                        // treatment of keep-alives and partial writes.
                        warn!("Skipping malformed upstream chunk: {e}");
                        continue;
                    }
                }
            }

            if st.eof {
                st.finished = true;
                return Some((Err(ProxyError::StreamTruncated), st));
            }

            match tokio::time::timeout(st.timeout, st.stream.next()).await {
                Err(_) => {
                    st.finished = true;
                    return Some((Err(ProxyError::UpstreamTimeout), st));
                }
                Ok(Some(Ok(bytes))) => st.buf.extend_from_slice(&bytes),
                Ok(Some(Err(e))) => {
                    st.finished = true;
                    return Some((Err(map_reqwest_err(e)), st));
                }
                Ok(None) => st.eof = true,
            }
        }
    })
}

/// Extract the next newline-terminated line, or the trailing partial line
/// once the byte stream has ended.
fn next_line(buf: &mut BytesMut, eof: bool) -> Option<BytesMut> {
    if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        return Some(buf.split_to(pos + 1));
    }
    if eof && !buf.is_empty() {
        let len = buf.len();
        return Some(buf.split_to(len));
    }
    None
}

/// Reduce one parsed NDJSON object to a [`StreamChunk`].
fn parse_chunk(kind: StreamKind, value: &serde_json::Value) -> StreamChunk {
    let content = match kind {
        StreamKind::Chat => value["message"]["content"].as_str().unwrap_or(""),
        StreamKind::Generate => value["response"].as_str().unwrap_or(""),
    };
    let done = value["done"].as_bool().unwrap_or(false);
    StreamChunk {
        content: content.to_string(),
        done,
        finish_reason: translate::finish_reason(done, value["done_reason"].as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(parts: Vec<&'static [u8]>) -> BoxStream<'static, reqwest::Result<Bytes>> {
        futures_util::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p)))).boxed()
    }

    async fn collect(
        stream: impl Stream<Item = Result<StreamChunk, ProxyError>>,
    ) -> Vec<Result<StreamChunk, ProxyError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_chunks_split_on_newlines_across_reads() {
        // A line split across two reads must still parse as one chunk.
        let stream = byte_stream(vec![
            b"{\"message\":{\"content\":\"Hi\"},\"do",
            b"ne\":false}\n{\"message\":{\"content\":\"\"},\"done\":true}\n",
        ]);
        let chunks = collect(chunk_stream(stream, Duration::from_secs(1), StreamKind::Chat)).await;

        assert_eq!(chunks.len(), 2);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.content, "Hi");
        assert!(!first.done);
        let last = chunks[1].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_generate_chunks_read_response_field() {
        let stream = byte_stream(vec![
            b"{\"response\":\"fn \",\"done\":false}\n",
            b"{\"response\":\"main\",\"done\":true,\"done_reason\":\"length\"}\n",
        ]);
        let chunks =
            collect(chunk_stream(stream, Duration::from_secs(1), StreamKind::Generate)).await;

        assert_eq!(chunks[0].as_ref().unwrap().content, "fn ");
        let last = chunks[1].as_ref().unwrap();
        assert_eq!(last.content, "main");
        assert_eq!(last.finish_reason.as_deref(), Some("length"));
    }

    #[tokio::test]
    async fn test_truncated_stream_yields_error_not_done() {
        let stream = byte_stream(vec![b"{\"message\":{\"content\":\"Hi\"},\"done\":false}\n"]);
        let chunks = collect(chunk_stream(stream, Duration::from_secs(1), StreamKind::Chat)).await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(matches!(chunks[1], Err(ProxyError::StreamTruncated)));
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline_is_parsed() {
        let stream = byte_stream(vec![b"{\"message\":{\"content\":\"end\"},\"done\":true}"]);
        let chunks = collect(chunk_stream(stream, Duration::from_secs(1), StreamKind::Chat)).await;

        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.content, "end");
        assert!(chunk.done);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let stream = byte_stream(vec![
            b"not json\n",
            b"{\"message\":{\"content\":\"ok\"},\"done\":true}\n",
        ]);
        let chunks = collect(chunk_stream(stream, Duration::from_secs(1), StreamKind::Chat)).await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().content, "ok");
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        // A pending stream never yields; the per-read bound must fire.
        let stream = futures_util::stream::pending::<reqwest::Result<Bytes>>().boxed();
        let chunks = collect(chunk_stream(stream, Duration::from_millis(50), StreamKind::Chat)).await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(ProxyError::UpstreamTimeout)));
    }
}
