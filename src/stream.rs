//! Newline-buffered SSE frame decoder shared by every streaming provider.
//!
//! Providers disagree on JSON shape but agree on the wire framing: each
//! event is a `data: <json>\n\n` line, and the stream ends with either a
//! `data: [DONE]` sentinel or the connection simply closing. Malformed
//! frames are dropped and logged rather than failing the whole stream,
//! up to a tolerance threshold.

use serde_json::Value;
use tracing::warn;

use crate::error::ResponseShapeError;

/// Consecutive malformed frames tolerated before a stream is given up on.
pub const MALFORMED_FRAME_THRESHOLD: usize = 16;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// A `data: <json>` line, parsed.
    Data(Value),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Buffers raw bytes across chunk boundaries and yields whole SSE frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    consecutive_malformed: usize,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the transport, returning every whole frame newly
    /// completed by this chunk. Returns
    /// [`ResponseShapeError::TooManyMalformedFrames`] once the run of
    /// consecutive malformed `data:` lines exceeds [`MALFORMED_FRAME_THRESHOLD`].
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, ResponseShapeError> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_pos);

            if line.is_empty() {
                continue;
            }

            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                // Non-data SSE fields (event:, id:, retry:, comments) carry no
                // payload this decoder extracts.
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                frames.push(SseFrame::Done);
                self.consecutive_malformed = 0;
                continue;
            }

            match serde_json::from_str::<Value>(data) {
                Ok(value) => {
                    frames.push(SseFrame::Data(value));
                    self.consecutive_malformed = 0;
                }
                Err(source) => {
                    self.consecutive_malformed += 1;
                    warn!(
                        "dropped malformed SSE frame ({} consecutive): {source}",
                        self.consecutive_malformed
                    );
                    if self.consecutive_malformed > MALFORMED_FRAME_THRESHOLD {
                        return Err(ResponseShapeError::TooManyMalformedFrames(
                            self.consecutive_malformed,
                        ));
                    }
                }
            }
        }

        Ok(frames)
    }
}
