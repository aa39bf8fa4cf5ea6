//! Session error taxonomy
//!
//! Signaling and negotiation failures are terminal for the session.
//! Channel, transfer and input errors are scoped to the operation that
//! raised them and never touch connection state.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel send failed: {0}")]
    ChannelSend(String),
    #[error("transfer {file_id} failed: {reason}")]
    Transfer { file_id: String, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Terminal errors move the session to `failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::Signaling(_) | SessionError::Negotiation(_))
    }

    pub(crate) fn transfer(file_id: &str, reason: impl Into<String>) -> Self {
        SessionError::Transfer {
            file_id: file_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::InvalidInput(e.to_string())
    }
}

/// Map a substrate failure raised while creating or applying descriptions
pub(crate) fn negotiation_error(e: TransportError) -> SessionError {
    match e {
        TransportError::InvalidInput(msg) => SessionError::InvalidInput(msg),
        other => SessionError::Negotiation(other.to_string()),
    }
}
