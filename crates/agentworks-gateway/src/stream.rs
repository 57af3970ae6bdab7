//! Streaming completion contract
//!
//! Adapters expose streaming completions as a `TokenStream` of tagged
//! `StreamToken`s. Within one stream, token and tool-call events
//! preserve vendor emission order; exactly one `Done` or `Error`
//! terminates the stream and nothing follows it. The adapter owns the
//! underlying vendor connection: dropping the stream drops the HTTP
//! response, so an abandoned consumer releases the connection without
//! an explicit close call.

use crate::completion::TokenUsage;
use crate::tools::ToolCall;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// One event in a streaming completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamToken {
    /// A fragment of generated text
    Token {
        /// Text fragment
        content: String,
    },
    /// A completed tool call (arguments fully assembled)
    ToolCall {
        /// The tool call
        tool_call: ToolCall,
    },
    /// Successful termination with final usage
    Done {
        /// Token usage for the whole stream
        usage: TokenUsage,
    },
    /// Failed termination
    Error {
        /// Sanitized vendor error message
        message: String,
    },
}

/// A stream of completion tokens
pub type TokenStream = Pin<Box<dyn Stream<Item = StreamToken> + Send>>;

/// Build a stream that yields a single terminal error token
///
/// Used when a streaming request fails before the vendor stream opens,
/// so consumers always observe a well-formed termination.
#[must_use]
pub fn error_stream(message: impl Into<String>) -> TokenStream {
    let message = message.into();
    Box::pin(futures::stream::once(async move {
        StreamToken::Error { message }
    }))
}

/// Reassembles SSE lines from a chunked byte transport
///
/// Vendor chunk boundaries are arbitrary: one chunk may carry several
/// events, or an event split mid-line (even mid-UTF-8-sequence). Bytes
/// are buffered until a newline completes a line.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain all completed lines
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }
}

/// Extract the payload of an SSE `data:` line
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}
