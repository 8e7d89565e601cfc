use std::fmt;

use thiserror::Error;

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("subscription to room {room} broken: {reason}")]
    SubscriptionBroken { room: String, reason: BrokenReason },

    #[error("append task interrupted: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

impl LogError {
    /// Whether the caller can expect the same request to succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidArgument(_) => false,
            Self::Storage(_) => true,
            Self::SubscriptionBroken { .. } => true,
            Self::Interrupted(_) => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokenReason {
    /// The mailbox filled up under the drop-subscriber policy.
    Lagged { capacity: usize },
    /// The hub went away, or the session already failed.
    Closed,
}

impl fmt::Display for BrokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lagged { capacity } => write!(f, "subscriber lagged past {capacity} queued messages"),
            Self::Closed => f.write_str("subscription closed"),
        }
    }
}

pub(crate) fn validate_room(room_id: &str) -> LogResult<()> {
    if room_id.trim().is_empty() {
        return Err(LogError::InvalidArgument("room_id must not be empty"));
    }
    Ok(())
}
