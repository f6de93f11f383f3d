use crate::models::ChatMessage;
use crate::providers::{StreamEvent, TransportError};

pub const ERROR_PREFIX: &str = "Error: ";

/// How one streamed reply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Cancelled by the caller. Not an error; partial output is kept.
    Aborted,
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerStep {
    Started,
    /// The whole reply so far, to replace the previous snapshot in place.
    Snapshot(ChatMessage),
    Finished(StreamOutcome),
}

/// Accumulates the deltas of one assistant reply.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    accumulated: String,
    received: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.accumulated
    }

    pub fn apply(&mut self, event: StreamEvent) -> AssemblerStep {
        match event {
            StreamEvent::Started => AssemblerStep::Started,
            StreamEvent::Delta(text) => {
                self.accumulated.push_str(&text);
                self.received = true;
                AssemblerStep::Snapshot(ChatMessage::assistant(self.accumulated.clone()))
            }
            StreamEvent::Done => AssemblerStep::Finished(StreamOutcome::Completed),
            StreamEvent::Aborted => AssemblerStep::Finished(StreamOutcome::Aborted),
            StreamEvent::Error(e) => AssemblerStep::Finished(StreamOutcome::Failed(e)),
        }
    }

    /// Messages to append after the prompt once the stream is over: the reply
    /// (if any delta arrived), then a separate error notice on failure.
    pub fn final_messages(&self, outcome: &StreamOutcome) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if self.received {
            messages.push(ChatMessage::assistant(self.accumulated.clone()));
        }
        if let StreamOutcome::Failed(e) = outcome {
            messages.push(error_notice(e));
        }
        messages
    }
}

pub fn error_notice(error: &TransportError) -> ChatMessage {
    ChatMessage::assistant(format!("{}{}", ERROR_PREFIX, error))
}
