//! Outbound request objects handed to the transport
//!
//! Every request carries the correlation key its response will answer. The
//! transport treats the payload as opaque and only needs it to serialize.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::asset::SizeTier;
use crate::key::CorrelationKey;

/// A logical chat message sent together with an attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Conversation the message belongs to
    pub conversation_id: String,

    /// Optional caption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Message being replied to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Binary payload of an upload, already resident locally
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name presented to recipients
    pub file_name: String,

    /// MIME type, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// File contents
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &format_args!("{} bytes", self.bytes.len()))
            .finish()
    }
}

/// What an outbound request asks the server to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    /// Download a plain file by content hash
    FetchFile { hash: String },

    /// Download an image variant
    FetchImage {
        hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        tier: SizeTier,
    },

    /// Download a low-resolution preview of an image
    FetchPreview {
        hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Encoder quality between 0.0 and 1.0
        quality: f32,
        /// Longest edge in pixels
        size: u32,
    },

    /// Send a message and its attachment as one correlated operation
    SendWithAttachment {
        message: MessageDraft,
        attachment: Attachment,
    },
}

/// One outbound operation awaiting an asynchronous response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Key the response will carry
    pub key: CorrelationKey,

    /// The operation itself
    #[serde(flatten)]
    pub kind: RequestKind,
}

impl OutboundRequest {
    /// Create a request under `key`
    pub fn new(key: CorrelationKey, kind: RequestKind) -> Self {
        Self { key, kind }
    }

    /// The caller-generated unique id, without namespace
    pub fn correlation_id(&self) -> &str {
        self.key.id()
    }
}

/// Control signal addressed to an outstanding transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferCommand {
    /// Stop sending data but keep the transfer resumable
    Suspend,
    /// Continue a suspended transfer
    Resume,
    /// Abort and discard the transfer
    Cancel,
}
