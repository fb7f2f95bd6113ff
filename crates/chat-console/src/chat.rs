//! Chat payload carried on the channel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub process: String,
    pub status: String,
}

impl ChatMessage {
    /// Split an input line: the first word is the process, the rest the status.
    /// Returns `None` for a blank line.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (process, status) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        Some(Self {
            process: process.to_string(),
            status: status.trim().to_string(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Fails unless `data` is a JSON object; missing fields decode as empty.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
