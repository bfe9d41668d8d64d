use crate::errors::DecodeError;
use protobuf::CompletionMessage;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::trace;

/// How a process ended, as reported on its control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Exited(u32),
    Failed(String),
}

/// Reads newline-delimited JSON `CompletionMessage` records.
pub struct CompletionDecoder<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> CompletionDecoder<R> {
    pub fn new(source: R) -> Self {
        Self {
            lines: source.lines(),
        }
    }

    /// The next record, or `None` at end of input. Blank lines are skipped.
    pub async fn next_message(&mut self) -> Result<Option<CompletionMessage>, DecodeError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }

    /// Read until a record says how the process ended.
    pub async fn completion(&mut self) -> Result<Completion, DecodeError> {
        loop {
            let message = self
                .next_message()
                .await?
                .ok_or(DecodeError::UnexpectedEof)?;
            // error text wins if a sender ever fills in both
            if let Some(text) = message.error_text {
                return Ok(Completion::Failed(text));
            }
            if let Some(status) = message.exit_status {
                return Ok(Completion::Exited(status));
            }
            trace!("discarding informational record");
        }
    }
}
