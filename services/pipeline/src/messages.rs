//! Versioned wire payloads for the ingestion channels.
//!
//! Everything travels as JSON. Binary payloads are base64 encoded so the
//! body stays text-safe on any broker.

use crate::channel::IncomingMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Current schema version of every payload in this module
pub const SCHEMA_VERSION: u16 = 1;

/// Message type header value for ingest requests
pub const INGEST_REQUEST_TYPE: &str = "ingest_request";
/// Message type header value for ingest-completed events
pub const INGEST_COMPLETED_TYPE: &str = "ingest_completed";

/// Reasons a payload cannot be decoded
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unsupported schema version {0}")]
    UnsupportedVersion(u16),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

fn default_version() -> u16 {
    SCHEMA_VERSION
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// One pending upload awaiting durable storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRequest {
    #[serde(default = "default_version")]
    pub version: u16,
    /// Correlation identifier, unique per upload attempt; the idempotency key
    pub request_id: Uuid,
    pub nickname: String,
    /// Already resolved by the producer; never re-sniffed downstream
    pub mime_type: String,
    #[serde(with = "base64_serde")]
    pub payload: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
}

impl IngestRequest {
    pub fn new(nickname: impl Into<String>, mime_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            request_id: Uuid::new_v4(),
            nickname: nickname.into(),
            mime_type: mime_type.into(),
            payload,
            submitted_at: Utc::now(),
        }
    }

    /// Decode and validate a request body.
    ///
    /// The nickname is trimmed. Empty nickname, mime type or payload make
    /// the message malformed, as does any version other than the current one.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut request: IngestRequest =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed(e.to_string()))?;

        if request.version != SCHEMA_VERSION {
            return Err(MessageError::UnsupportedVersion(request.version));
        }

        request.nickname = request.nickname.trim().to_string();
        if request.nickname.is_empty() {
            return Err(MessageError::MissingField("nickname"));
        }
        if request.mime_type.trim().is_empty() {
            return Err(MessageError::MissingField("mime_type"));
        }
        if request.payload.is_empty() {
            return Err(MessageError::MissingField("payload"));
        }

        Ok(request)
    }
}

/// Announces that an upload has been durably stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestCompleted {
    #[serde(default = "default_version")]
    pub version: u16,
    pub image_id: Uuid,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub stored_at: Option<DateTime<Utc>>,
}

impl IngestCompleted {
    pub fn new(image_id: Uuid, request_id: Uuid, nickname: &str, mime_type: &str) -> Self {
        Self {
            version: SCHEMA_VERSION,
            image_id,
            request_id: Some(request_id),
            nickname: Some(nickname.to_string()),
            mime_type: Some(mime_type.to_string()),
            stored_at: Some(Utc::now()),
        }
    }

    /// Decode either the JSON envelope or a bare image id token
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MessageError::Malformed(e.to_string()))?
            .trim();

        if let Ok(image_id) = Uuid::parse_str(text) {
            return Ok(Self {
                version: SCHEMA_VERSION,
                image_id,
                request_id: None,
                nickname: None,
                mime_type: None,
                stored_at: None,
            });
        }

        let event: IngestCompleted =
            serde_json::from_str(text).map_err(|e| MessageError::Malformed(e.to_string()))?;
        if event.version > SCHEMA_VERSION {
            return Err(MessageError::UnsupportedVersion(event.version));
        }
        Ok(event)
    }
}

/// Envelope written to the dead letter topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub original_key: Option<String>,
    #[serde(rename = "original_message_base64", with = "base64_serde")]
    pub original_message: Vec<u8>,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_incoming(message: &IncomingMessage, error: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_topic: message.metadata.topic.clone(),
            original_partition: message.metadata.partition,
            original_offset: message.metadata.offset,
            original_key: message.key_str(),
            original_message: message.payload.clone(),
            error: error.to_string(),
            attempts: message.metadata.attempt,
            timestamp: Utc::now(),
        }
    }
}
