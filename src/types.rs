use serde::{Deserialize, Serialize};

use crate::transport::ChatEvent;

/// Stable identifier of a conversation (group or private).
pub type ConversationId = String;

/// Identifier of a message. Server-issued once confirmed; before that a
/// locally issued temporary id carrying the [`TEMP_ID_PREFIX`].
pub type MessageId = String;

/// Identifier of a user.
pub type UserId = String;

/// Prefix for locally issued message ids that have not been confirmed
/// by the server yet.
pub const TEMP_ID_PREFIX: &str = "local-";

/// Returns true if the id was issued locally and is awaiting
/// reconciliation with a server id.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Allocate a fresh temporary message id.
pub fn new_temp_id() -> MessageId {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Allocate a correlation token attached to an outbound send and echoed
/// back by the server, used to match server records to local ones.
pub fn new_correlation_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Retry envelope for failed dispatch attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryInfo {
    /// Number of times this operation has been retried
    pub attempt: u32,
    /// Maximum number of retry attempts allowed
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
}

/// Retry delays never exceed this, regardless of attempt count.
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

impl RetryInfo {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms: 500,
        }
    }

    pub fn next_attempt(&self) -> Option<Self> {
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(Self {
                attempt: self.attempt + 1,
                max_attempts: self.max_attempts,
                base_delay_ms: self.base_delay_ms,
            })
        }
    }

    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Exponential delay capped at [`MAX_RETRY_DELAY_MS`], without jitter.
    pub fn delay_ms(&self) -> u64 {
        let exp = self.attempt.min(16);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        raw.min(MAX_RETRY_DELAY_MS)
    }

    /// Delay with +/-20% jitter applied, to avoid thundering herds after
    /// a reconnect.
    pub fn delay_with_jitter(&self) -> std::time::Duration {
        use rand::Rng;
        let base = self.delay_ms() as f64;
        let factor = rand::rng().random_range(0.8..=1.2);
        std::time::Duration::from_millis((base * factor) as u64)
    }
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Work items consumed by the core's event processing loop.
#[derive(Debug)]
pub enum ProcessableEvent {
    /// A typed event pushed by the transport's event stream
    Chat(ChatEvent),
    /// A scheduled retry for a conversation's outbound queue
    RetryDispatch(ConversationId),
}
