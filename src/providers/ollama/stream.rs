use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::models::OllamaStreamLine;
use crate::providers::types::{PullProgress, StreamRecord, TransportError};

/// Splits an NDJSON byte stream into complete lines.
///
/// Holds back both an unterminated trailing line and any incomplete UTF-8
/// sequence at the end of a chunk until more bytes arrive.
#[derive(Debug, Default)]
pub struct LineFrameDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl LineFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(bytes);
        self.decode_available();
        self.drain_lines()
    }

    /// End of stream: returns whatever is left as a final line, if non-empty.
    pub fn finish(&mut self) -> Option<String> {
        if !self.byte_buf.is_empty() {
            let tail = String::from_utf8_lossy(&self.byte_buf).into_owned();
            self.buffer.push_str(&tail);
            self.byte_buf.clear();
        }

        let mut rest = std::mem::take(&mut self.buffer);
        if rest.ends_with('\r') {
            rest.pop();
        }
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    fn decode_available(&mut self) {
        loop {
            match std::str::from_utf8(&self.byte_buf) {
                Ok(s) => {
                    self.buffer.push_str(s);
                    self.byte_buf.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    let valid = String::from_utf8_lossy(&self.byte_buf[..valid_up_to]);
                    self.buffer.push_str(&valid);
                    match e.error_len() {
                        Some(bad_len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.byte_buf.drain(..valid_up_to + bad_len);
                        }
                        None => {
                            // Incomplete sequence; wait for the next chunk.
                            self.byte_buf.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

/// Decode one line into zero or more records.
///
/// Blank lines produce nothing. A final chat line may carry both content and
/// the completion flag, in which case the delta comes before `Done`.
pub fn parse_record(line: &str) -> Vec<StreamRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let parsed: OllamaStreamLine = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Skipping malformed stream line: {}", e);
            return vec![StreamRecord::Malformed];
        }
    };

    if let Some(error) = parsed.error {
        return vec![StreamRecord::ServerError(error)];
    }

    let mut records = Vec::new();

    if let Some(message) = &parsed.message {
        if !message.content.is_empty() {
            records.push(StreamRecord::ContentDelta {
                text: message.content.clone(),
            });
        }
    } else if let Some(status) = parsed.status {
        records.push(StreamRecord::PullProgress(PullProgress {
            status,
            digest: parsed.digest,
            total: parsed.total,
            completed: parsed.completed,
        }));
    }

    if parsed.done == Some(true) {
        records.push(StreamRecord::Done);
    }

    if records.is_empty() && parsed.message.is_none() && parsed.done.is_none() {
        records.push(StreamRecord::Malformed);
    }

    records
}

/// How a body pump ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PumpEnd {
    /// `Done` record or clean end of body.
    Finished,
    Aborted,
    Failed(TransportError),
    /// The consumer hung up.
    Closed,
}

/// Drive a response body through the decoder and parser, forwarding the
/// records `pick` selects to `tx` in arrival order.
///
/// `cancel` is checked every time the pump waits for the next chunk.
pub async fn pump_records<S, E, T, F>(
    body: S,
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    mut pick: F,
) -> PumpEnd
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(StreamRecord) -> Option<T>,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = LineFrameDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpEnd::Aborted,
            next = body.next() => next,
        };

        let (lines, at_end) = match next {
            Some(Ok(bytes)) => (decoder.feed(&bytes), false),
            Some(Err(e)) => return PumpEnd::Failed(TransportError::Stream(e.to_string())),
            None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in &lines {
            for record in parse_record(line) {
                match record {
                    StreamRecord::Done => return PumpEnd::Finished,
                    StreamRecord::Malformed => continue,
                    StreamRecord::ServerError(message) => {
                        return PumpEnd::Failed(TransportError::Stream(message));
                    }
                    other => {
                        if let Some(item) = pick(other) {
                            if tx.send(item).await.is_err() {
                                return PumpEnd::Closed;
                            }
                        }
                    }
                }
            }
        }

        if at_end {
            return PumpEnd::Finished;
        }
    }
}
