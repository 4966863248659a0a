//! Line-framed stream decoding for both response dialects.
//!
//! The generate dialect streams newline-delimited JSON (one object per line).
//! The chat-completions dialect streams server-sent events, `data: {...}`
//! lines terminated by `data: [DONE]`. Both arrive in arbitrary TCP chunks,
//! so [`FrameDecoder`] buffers raw bytes and only parses complete lines.
//! Buffering bytes rather than text keeps multi-byte characters intact when
//! a chunk boundary splits them.

use serde_json::Value;

/// Wire framing of a token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// One JSON object per line.
    Ndjson,
    /// `data: <json>` lines, `[DONE]` sentinel, blank keep-alives.
    Sse,
}

/// Buffered decoder yielding one JSON value per complete frame.
///
/// # Example
///
/// ```
/// use llm_relay::backend::frames::FrameDecoder;
///
/// let mut decoder = FrameDecoder::ndjson();
/// assert!(decoder.decode(b"{\"response\":").is_empty());
/// let values = decoder.decode(b"\"hi\"}\n");
/// assert_eq!(values[0]["response"], "hi");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    format: FrameFormat,
    buffer: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            buffer: Vec::new(),
            finished: false,
        }
    }

    pub fn ndjson() -> Self {
        Self::new(FrameFormat::Ndjson)
    }

    pub fn sse() -> Self {
        Self::new(FrameFormat::Sse)
    }

    /// Whether an SSE `[DONE]` sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a raw chunk and return every complete frame it finished.
    ///
    /// Lines that are not valid JSON are skipped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(v) = self.parse_line(&String::from_utf8_lossy(&line)) {
                values.push(v);
            }
        }
        values
    }

    /// Parse whatever is left once the byte stream has ended.
    pub fn flush(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        text.lines().filter_map(|l| self.parse_line(l)).collect()
    }

    fn parse_line(&mut self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() || self.finished {
            return None;
        }
        let payload = match self.format {
            FrameFormat::Ndjson => line,
            FrameFormat::Sse => {
                // event:, id:, retry: and comment lines carry no payload
                let data = line
                    .strip_prefix("data:")
                    .map(str::trim)?;
                if data == "[DONE]" {
                    self.finished = true;
                    return None;
                }
                data
            }
        };
        serde_json::from_str(payload).ok()
    }
}
