//! Terminal wire protocol
//!
//! Frames are raw terminal bytes in both directions. The one exception is a
//! client frame whose first byte is `{`: it is tried as a JSON control message
//! (`{"type":"resize","cols":80,"rows":24}`). A frame that starts with `{` but
//! does not parse is forwarded to the shell unchanged, so terminal input that
//! happens to begin with a brace and looks like JSON can be misread.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Control messages accepted from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// A decoded client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Resize { cols: u16, rows: u16 },
    Data(Bytes),
}

/// Split control messages from terminal input
pub fn classify(payload: Bytes) -> ClientInput {
    if payload.first() != Some(&b'{') {
        return ClientInput::Data(payload);
    }

    match serde_json::from_slice::<ControlMessage>(&payload) {
        Ok(ControlMessage::Resize { cols, rows }) => ClientInput::Resize { cols, rows },
        Err(e) => {
            debug!("Brace-prefixed frame is not a control message ({}), forwarding", e);
            ClientInput::Data(payload)
        }
    }
}

/// How output bytes are framed toward the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Text frames; chunks that are not valid UTF-8 go out as binary frames
    #[default]
    Text,
    /// Every chunk as a binary frame
    Binary,
}

/// Frames remote output, carrying split UTF-8 sequences across chunks
pub struct OutputEncoder {
    mode: OutputMode,
    pending: Vec<u8>,
}

impl OutputEncoder {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
        }
    }

    /// Frame one chunk. Returns `None` when the whole chunk is held back as
    /// the start of a multi-byte character.
    pub fn encode(&mut self, chunk: &[u8]) -> Option<Message> {
        if self.mode == OutputMode::Binary {
            return Some(Message::Binary(chunk.to_vec()));
        }

        self.pending.extend_from_slice(chunk);
        let data = std::mem::take(&mut self.pending);

        match String::from_utf8(data) {
            Ok(text) if text.is_empty() => None,
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                let utf8 = e.utf8_error();
                let mut bytes = e.into_bytes();
                if utf8.error_len().is_some() {
                    // Genuinely invalid, not just truncated
                    return Some(Message::Binary(bytes));
                }
                self.pending = bytes.split_off(utf8.valid_up_to());
                if bytes.is_empty() {
                    return None;
                }
                String::from_utf8(bytes).ok().map(Message::Text)
            }
        }
    }

    /// Whatever is still held back, as a binary frame
    pub fn flush(&mut self) -> Option<Message> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Message::Binary(std::mem::take(&mut self.pending)))
        }
    }
}

/// Human-readable error line (red) sent before closing a failed session
pub fn error_frame(message: &str) -> Message {
    Message::Text(format!("\r\n\x1b[31m{}\x1b[0m\r\n", message))
}

/// Banner for container shells, sent once attached
pub fn container_banner() -> String {
    "Connected to container terminal...\r\n".to_string()
}

/// Banner for pod shells (green), sent before dialing the controller
pub fn pod_banner(namespace: &str, pod: &str, shell: &str) -> String {
    format!(
        "\x1b[32mConnecting to pod {}/{} (shell: {})...\x1b[0m\r\n",
        namespace, pod, shell
    )
}
