//! Byte-stream plumbing shared by the streaming adapters: upstream body
//! chunks are split into lines (SSE `data:` frames for openai/anthropic,
//! JSONL for ollama) without assuming chunk boundaries align with either
//! lines or UTF-8 sequences.

use crate::{ChatDelta, ProviderError};
use futures::future::ready;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;

/// Accumulates raw bytes and yields complete lines. Splitting happens on
/// `\n` bytes, which can never occur inside a UTF-8 multi-byte sequence,
/// so chunk boundaries are safe. A trailing unterminated line is dropped
/// with the connection.
#[derive(Default)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            out.push(String::from_utf8_lossy(&line).into_owned());
        }
        out
    }
}

/// Turn a chunked upstream body into a line stream.
pub(crate) fn line_stream<S, B>(
    body: S,
) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    body.scan(LineDecoder::new(), |decoder, chunk| {
        let items: Vec<Result<String, ProviderError>> = match chunk {
            Ok(bytes) => decoder.push(bytes.as_ref()).into_iter().map(Ok).collect(),
            Err(e) => vec![Err(ProviderError::Http(e))],
        };
        ready(Some(stream::iter(items)))
    })
    .flatten()
}

/// Payload of an SSE `data:` line, if the line is one.
pub(crate) fn sse_data(line: &str) -> Option<String> {
    line.strip_prefix("data:").map(|rest| rest.trim_start().to_string())
}

/// Wrap a delta stream so the provider's in-flight permit is released
/// only when the consumer drops the stream.
pub(crate) fn hold_permit<S>(
    inner: S,
    permit: OwnedSemaphorePermit,
) -> impl Stream<Item = Result<ChatDelta, ProviderError>> + Send
where
    S: Stream<Item = Result<ChatDelta, ProviderError>> + Send,
{
    inner.map(move |item| {
        let _held = &permit;
        item
    })
}

/// Send a request, retrying exactly once on immediate connect failure.
/// Anything past connection establishment is the caller's problem.
pub(crate) async fn send_with_connect_retry(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    let retry = request.try_clone();
    match request.send().await {
        Ok(resp) => Ok(resp),
        Err(e) if e.is_connect() => match retry {
            Some(second) => {
                tracing::debug!("retrying upstream connect once");
                Ok(second.send().await?)
            }
            None => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_lines() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(b"data: {\"a\"").is_empty());
        let lines = dec.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(
            lines,
            vec![
                "data: {\"a\":1}".to_string(),
                String::new(),
                "data: [DONE]".to_string()
            ]
        );
    }

    #[test]
    fn decoder_strips_crlf() {
        let mut dec = LineDecoder::new();
        let lines = dec.push(b"one\r\ntwo\n");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn decoder_preserves_utf8_across_chunks() {
        let text = "data: héllo\n".as_bytes();
        let (a, b) = text.split_at(8); // splits inside the two-byte é
        let mut dec = LineDecoder::new();
        assert!(dec.push(a).is_empty());
        assert_eq!(dec.push(b), vec!["data: héllo".to_string()]);
    }

    #[test]
    fn sse_data_extraction() {
        assert_eq!(sse_data("data: {\"x\":1}").as_deref(), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:[DONE]").as_deref(), Some("[DONE]"));
        assert_eq!(sse_data("event: ping"), None);
        assert_eq!(sse_data(""), None);
    }
}
