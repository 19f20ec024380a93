//! Shared SSE plumbing for the OpenAI and Anthropic adapters.
//!
//! Both speak server-sent events: buffer chunks, split on `\n\n`, pull
//! `data:` payloads, and hand each payload to a provider-specific parser
//! that returns zero or more stream chunks.

use kronk_domain::stream::{BoxStream, StreamChunk};
use kronk_domain::Result;

use crate::util::from_reqwest;

/// Extract complete `data:` payloads from an SSE buffer.
///
/// The buffer is drained in place; a trailing partial event stays for
/// the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a [`BoxStream`] from an SSE response and a parser closure.
///
/// The closure is `FnMut` because both adapters keep mutable state
/// across events to assemble streamed tool calls. A fallback `Done` is
/// emitted if the parser never produced one.
pub(crate) fn sse_chunk_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamChunk>>
where
    F: FnMut(&str) -> Vec<Result<StreamChunk>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for chunk in parse_data(&data) {
                            if matches!(&chunk, Ok(StreamChunk::Done { .. })) {
                                done_emitted = true;
                            }
                            yield chunk;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for chunk in parse_data(&data) {
                                if matches!(&chunk, Ok(StreamChunk::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield chunk;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamChunk::Done { tokens_used: None });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"x\":1}\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"x\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_buffered() {
        let mut buf = String::from("data: done\n\ndata: part");
        assert_eq!(drain_data_lines(&mut buf), vec!["done"]);
        assert_eq!(buf, "data: part");
    }

    #[test]
    fn drain_ignores_non_data_lines() {
        let mut buf = String::from("event: ping\nid: 7\ndata: payload\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["payload"]);
    }

    #[test]
    fn drain_keeps_done_sentinel() {
        let mut buf = String::from("data: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["[DONE]"]);
    }
}
