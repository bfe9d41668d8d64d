use serde::{Deserialize, Serialize};

/// One record on a process's control channel.
///
/// At most one field is set. Records with neither are informational and carry nothing a
/// waiter needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl CompletionMessage {
    pub fn exited(exit_status: u32) -> Self {
        Self {
            exit_status: Some(exit_status),
            ..Self::default()
        }
    }

    pub fn failed(error_text: impl Into<String>) -> Self {
        Self {
            error_text: Some(error_text.into()),
            ..Self::default()
        }
    }

    /// Encode as a single newline-terminated JSON record.
    pub fn to_record(&self) -> serde_json::Result<Vec<u8>> {
        let mut record = serde_json::to_vec(self)?;
        record.push(b'\n');
        Ok(record)
    }
}
