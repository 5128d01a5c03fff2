use thiserror::Error;

use crate::nabo::storage::StorageError;
use crate::transport::TransportError;
use crate::types::{ConversationId, MessageId};

pub type Result<T> = core::result::Result<T, NaboError>;

#[derive(Error, Debug)]
pub enum NaboError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Outbound storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session ended, re-authentication required")]
    SessionEnded,

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for NaboError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        NaboError::Other(anyhow::anyhow!(err.to_string()))
    }
}
