//! `text/event-stream` decoding for vendor streaming responses.
//!
//! Only `data:` fields matter to the adapters. Each data line is parsed
//! as one JSON payload; `[DONE]` ends the stream early.

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;

use crate::llm::traits::{ProviderError, ProviderKind};

/// Decode the body of a streaming HTTP response
pub fn from_response(provider: ProviderKind, response: reqwest::Response) -> BoxStream<'static, Result<Value, ProviderError>> {
    let bytes = response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| ProviderError::from_reqwest(provider, &e)));
    decode(provider, bytes)
}

/// Split a byte stream into SSE lines and yield the JSON payload of each
/// `data:` line. A transport error or an unparsable payload is yielded
/// once and ends the stream.
pub fn decode<S>(provider: ProviderKind, bytes: S) -> BoxStream<'static, Result<Value, ProviderError>>
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        // Raw bytes so multi-byte characters split across chunks survive
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(provider = %provider, error = %e, "SSE transport error");
                    yield Err(e);
                    finished = true;
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_line(provider, &line) {
                    Line::Skip => {}
                    Line::Done => {
                        finished = true;
                        break 'read;
                    }
                    Line::Data(payload) => {
                        let failed = payload.is_err();
                        yield payload;
                        if failed {
                            finished = true;
                            break 'read;
                        }
                    }
                }
            }
        }

        // Last line without a trailing newline
        if !finished && !buffer.is_empty() {
            if let Line::Data(payload) = parse_line(provider, &buffer) {
                yield payload;
            }
        }
    };
    stream.boxed()
}

enum Line {
    Skip,
    Done,
    Data(Result<Value, ProviderError>),
}

fn parse_line(provider: ProviderKind, raw: &[u8]) -> Line {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);

    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        // comments, event/id/retry fields and blank separators
        None => return Line::Skip,
    };

    if data.is_empty() {
        return Line::Skip;
    }
    if data == "[DONE]" {
        return Line::Done;
    }

    tracing::trace!(provider = %provider, data = %data, "SSE data");
    Line::Data(serde_json::from_str(data).map_err(|e| {
        ProviderError::protocol(
            provider,
            format!("invalid stream payload: {} ({})", e, crate::utils::logging::truncate_string(data, 200)),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, ProviderError>> + Send + 'static {
        let owned: Vec<_> = parts.iter().map(|p| Ok(Bytes::from(p.to_string()))).collect();
        stream::iter(owned)
    }

    async fn collect(parts: &[&str]) -> Vec<Result<Value, ProviderError>> {
        decode(ProviderKind::DeepSeek, chunks(parts)).collect().await
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let events = collect(&[
            ": keep-alive\n",
            "data: {\"n\":",
            "1}\n\nevent: message\ndata:{\"n\":2}\r\n\n",
            "data: [DONE]\n\ndata: {\"n\":3}\n",
        ])
        .await;

        let values: Vec<_> = events.into_iter().map(|e| e.unwrap()["n"].as_i64().unwrap()).collect();
        assert_eq!(values, [1, 2]);
    }

    #[tokio::test]
    async fn test_multibyte_split_and_trailing_line() {
        let text = "data: {\"t\":\"héllo\"}";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        let cut = text.find('é').unwrap() + 1;
        let parts = vec![
            Ok(Bytes::copy_from_slice(&bytes[..cut])),
            Ok(Bytes::copy_from_slice(&bytes[cut..])),
        ];
        let events: Vec<_> = decode(ProviderKind::Qwen, stream::iter(parts)).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap()["t"], "héllo");
    }

    #[tokio::test]
    async fn test_invalid_payload_ends_stream() {
        let events = collect(&["data: {\"n\":1}\n", "data: {broken\n", "data: {\"n\":2}\n"]).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        let err = events[1].as_ref().unwrap_err();
        assert!(matches!(err, ProviderError::Protocol { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_transport_error_is_yielded() {
        let parts = vec![
            Ok(Bytes::from_static(b"data: {\"n\":1}\n")),
            Err(ProviderError::connection(ProviderKind::DeepSeek, "reset")),
            Ok(Bytes::from_static(b"data: {\"n\":2}\n")),
        ];
        let events: Vec<_> = decode(ProviderKind::DeepSeek, stream::iter(parts)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(ProviderError::Connection { .. })));
    }
}
