use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope type that peers send purely as a liveness signal.
pub const KEEP_ALIVE_TYPE: &str = "ping";

/// Signaling message exchanged between peers through the relay.
///
/// Only `sender_id` and `target_user_id` are inspected; `kind` and `data`
/// pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Free-form tag such as `offer`, `answer`, `ice` or `ping`; peers may
    /// omit it or send `null`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "senderId", default)]
    pub sender_id: String,
    #[serde(rename = "targetUserId", default)]
    pub target_user_id: Option<String>,
    /// Opaque payload (SDP, ICE candidate, ...)
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SignalEnvelope {
    pub fn new(
        kind: impl Into<String>,
        sender_id: impl Into<String>,
        target_user_id: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: Some(kind.into()),
            sender_id: sender_id.into(),
            target_user_id,
            data,
        }
    }

    /// Tag for logging; empty when the peer sent none.
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("")
    }

    pub fn is_keep_alive(&self) -> bool {
        self.kind.as_deref() == Some(KEEP_ALIVE_TYPE)
    }

    /// Target identifier, treating an empty string the same as absent.
    pub fn target(&self) -> Option<&str> {
        self.target_user_id
            .as_deref()
            .filter(|target| !target.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("empty message")]
    Empty,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no senderId")]
    MissingSender,
}

impl EnvelopeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EnvelopeError::Empty => "empty",
            EnvelopeError::Malformed(_) => "malformed",
            EnvelopeError::MissingSender => "missing_sender",
        }
    }
}

/// Decode one complete text message into an envelope.
pub fn decode(raw: &str) -> Result<SignalEnvelope, EnvelopeError> {
    if raw.trim().is_empty() {
        return Err(EnvelopeError::Empty);
    }

    let envelope: SignalEnvelope = serde_json::from_str(raw)?;
    if envelope.sender_id.is_empty() {
        return Err(EnvelopeError::MissingSender);
    }

    Ok(envelope)
}

pub fn encode(envelope: &SignalEnvelope) -> Result<String, EnvelopeError> {
    Ok(serde_json::to_string(envelope)?)
}
