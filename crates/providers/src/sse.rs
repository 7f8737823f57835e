//! Upstream SSE decoding shared by every provider adapter.
//!
//! Each provider answers a streaming request with an SSE body. The body is
//! buffered, split into events on blank lines, and the `data:` payload of
//! every event is handed to a provider-specific parser that returns zero or
//! more [`StreamEvent`]s.

use crate::util::from_reqwest;
use cs_domain::error::Result;
use cs_domain::stream::{BoxStream, StreamEvent};

/// OpenAI-style end-of-stream sentinel.
pub(crate) const DONE_SENTINEL: &str = "[DONE]";

/// Pull every complete `data:` payload out of `buffer`.
///
/// Events are separated by a blank line. `\r\n` line endings (Gemini) are
/// normalized first. Multiple `data:` lines inside one event are joined with
/// `\n`. A trailing partial event stays in the buffer.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();

        let data = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
        if !data.trim().is_empty() {
            payloads.push(data);
        }
    }
    payloads
}

/// Append `bytes` to `buffer`, carrying an incomplete trailing UTF-8
/// sequence over in `pending` instead of replacing it with U+FFFD.
pub(crate) fn push_utf8(buffer: &mut String, pending: &mut Vec<u8>, bytes: &[u8]) {
    pending.extend_from_slice(bytes);
    match std::str::from_utf8(pending) {
        Ok(s) => {
            buffer.push_str(s);
            pending.clear();
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            // Safe: the prefix was just validated.
            buffer.push_str(std::str::from_utf8(&pending[..valid]).unwrap_or_default());
            pending.drain(..valid);
        }
        Err(_) => {
            buffer.push_str(&String::from_utf8_lossy(pending));
            pending.clear();
        }
    }
}

/// Build a [`BoxStream`] from an SSE `reqwest::Response` and a provider
/// parser.
///
/// The parser is `FnMut` so adapters can keep state between payloads
/// (usage from a start frame, open content blocks). The stream ends at
/// the `[DONE]` sentinel, at an `Error` event, or when the body closes.
/// A `Done` event is synthesized if the parser never produced one.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut pending = Vec::new();
        let mut finished = false;

        'read: loop {
            let payloads = match response.chunk().await {
                Ok(Some(bytes)) => {
                    push_utf8(&mut buffer, &mut pending, &bytes);
                    drain_data_lines(&mut buffer)
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                    }
                    let rest = drain_data_lines(&mut buffer);
                    for data in rest {
                        if data == DONE_SENTINEL {
                            break;
                        }
                        for event in parse_data(&data) {
                            finished |= matches!(event, Ok(StreamEvent::Done { .. }) | Ok(StreamEvent::Error { .. }) | Err(_));
                            yield event;
                        }
                    }
                    break 'read;
                }
                Err(e) => {
                    finished = true;
                    yield Err(from_reqwest(e));
                    break 'read;
                }
            };

            for data in payloads {
                if data == DONE_SENTINEL {
                    break 'read;
                }
                for event in parse_data(&data) {
                    let terminal = matches!(event, Ok(StreamEvent::Error { .. }) | Err(_));
                    finished |= terminal || matches!(event, Ok(StreamEvent::Done { .. }));
                    yield event;
                    if terminal {
                        break 'read;
                    }
                }
            }
        }

        if !finished {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_multiple_events() {
        let mut buf = String::from("event: message\ndata: first\n\ndata: second\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["first", "second"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        assert_eq!(drain_data_lines(&mut buf), vec!["complete"]);
        assert_eq!(buf, "data: partial");

        buf.push_str("\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["partial"]);
    }

    #[test]
    fn crlf_delimiters_are_normalized() {
        let mut buf = String::from("data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\r\n\r\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut buf = String::from("data: line one\ndata: line two\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["line one\nline two"]);
    }

    #[test]
    fn comments_and_empty_data_are_skipped() {
        let mut buf = String::from(": keep-alive\n\ndata: \n\nid: 4\ndata: payload\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["payload"]);
    }

    #[test]
    fn utf8_split_across_chunks_survives() {
        let text = "héllo";
        let bytes = text.as_bytes();
        // 'é' is two bytes starting at index 1; split in the middle of it.
        let mut buf = String::new();
        let mut pending = Vec::new();
        push_utf8(&mut buf, &mut pending, &bytes[..2]);
        assert_eq!(buf, "h");
        push_utf8(&mut buf, &mut pending, &bytes[2..]);
        assert_eq!(buf, "héllo");
        assert!(pending.is_empty());
    }
}
