//! Control-message protocol.
//!
//! Every signaling and control exchange between clients is a
//! [`ControlMessage`] carried by the relay as JSON:
//!
//! ```json
//! {"type": "CONNECTION_REQUEST", "clientId": "…", "authentication": "7K4X", "data": {"name": "alice"}}
//! ```
//!
//! On the way out `clientId` names the recipient; the relay rewrites it to
//! the authenticated sender before delivery.

use crate::error::{ClientError, Result};
use linkdrop_registry::PublicId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every file-transfer data channel label
pub const CHANNEL_LABEL_PREFIX: &str = "file-transfer:";

/// Data channel label for a file
pub fn channel_label(file_name: &str) -> String {
    format!("{CHANNEL_LABEL_PREFIX}{file_name}")
}

/// File name carried by a data channel label, if it is a transfer channel
pub fn file_name_from_label(label: &str) -> Option<&str> {
    label.strip_prefix(CHANNEL_LABEL_PREFIX)
}

/// Control message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Handshake request carrying a link code
    ConnectionRequest,
    /// Handshake reply carrying the responder's name
    ConnectionResponse,
    /// Request that the recipient forget the sender
    Disconnect,
    /// Ask for the recipient's display name
    IdentityRequest,
    /// Display name reply
    IdentityResponse,
    /// Ask for the recipient's offered files
    ListRequest,
    /// Offered files reply
    ListResponse,
    /// Push announcement of offered files
    SendRequest,
    /// Names of the files the sender of this message wants to receive
    ReceiveRequest,
    /// Connection descriptor from the negotiating side
    #[serde(rename = "RTC_OFFER")]
    Offer,
    /// Connection descriptor reply
    #[serde(rename = "RTC_ANSWER")]
    Answer,
    /// Out-of-band address candidate
    #[serde(rename = "RTC_ICE_CANDIDATE")]
    IceCandidate,
}

impl MessageType {
    /// Whether messages of this type pass through the authentication gate
    ///
    /// Descriptor and candidate exchange is deliberately ungated; replies
    /// are only ever consumed by correlated waits.
    pub fn is_gated(self) -> bool {
        matches!(
            self,
            MessageType::ConnectionRequest
                | MessageType::Disconnect
                | MessageType::IdentityRequest
                | MessageType::ListRequest
                | MessageType::SendRequest
                | MessageType::ReceiveRequest
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&tag)
    }
}

/// A control message in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Type tag
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Recipient on send, authenticated sender on delivery
    pub client_id: PublicId,
    /// Optional one-time token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    /// Optional typed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ControlMessage {
    /// Create a message without token or payload
    pub fn new(kind: MessageType, client_id: PublicId) -> Self {
        Self {
            kind,
            client_id,
            authentication: None,
            data: None,
        }
    }

    /// Attach an authentication token
    #[must_use]
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.authentication = Some(token.into());
        self
    }

    /// Attach an optional authentication token
    #[must_use]
    pub fn with_optional_auth(mut self, token: Option<String>) -> Self {
        self.authentication = token;
        self
    }

    /// Attach a payload.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Serialization`] if the payload cannot be encoded.
    pub fn with_data<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.data = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Decode the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if the payload is missing or has the
    /// wrong shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or(ClientError::protocol("missing message payload"))?;
        serde_json::from_value(data).map_err(|e| {
            ClientError::Protocol(format!("malformed {} payload: {}", self.kind, e).into())
        })
    }

    /// Encode for the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the wire
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Display name payload (handshake and identity messages)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePayload {
    /// Self-reported display name
    pub name: String,
}

/// A file as announced to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    /// File name, also the channel identity
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
}

impl From<&linkdrop_files::LocalFile> for FileOffer {
    fn from(file: &linkdrop_files::LocalFile) -> Self {
        Self {
            name: file.name().to_string(),
            size: file.size(),
            mime_type: file.mime_type().to_string(),
        }
    }
}

/// Offered file set (send-request and list-response payload)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    /// Offered files
    pub files: Vec<FileOffer>,
}

/// Receive-request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveRequest {
    /// Names of the accepted files
    pub files: Vec<String>,
    /// Discard the existing peer connection before renegotiating
    #[serde(default)]
    pub refresh_connection: bool,
}

/// Connection descriptor payload (offer and answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Opaque descriptor produced by the link capability
    pub sdp: String,
}

/// Address candidate payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Opaque candidate produced by the link capability
    pub candidate: String,
}
