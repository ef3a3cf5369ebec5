use thiserror::Error;
use uuid::Uuid;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("{user_id} is not a participant of room {room_id}")]
    NotAParticipant { room_id: Uuid, user_id: String },

    #[error("message text is empty")]
    EmptyMessage,

    #[error("room {0} not found")]
    RoomNotFound(Uuid),

    #[error("projection update for room {room_id} failed: {reason}")]
    ProjectionUpdateFailed { room_id: Uuid, reason: String },

    #[error("notification to {recipient_id} failed: {reason}")]
    NotificationDeliveryFailed { recipient_id: String, reason: String },

    #[error("lookup of user {user_id} failed: {reason}")]
    RecipientLookupFailed { user_id: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl ChatError {
    /// Rejections happen before any write and leave no state behind.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChatError::InvalidToken
                | ChatError::InvalidParticipants(_)
                | ChatError::NotAParticipant { .. }
                | ChatError::EmptyMessage
                | ChatError::RoomNotFound(_)
        )
    }
}

impl From<uuid::Error> for ChatError {
    fn from(err: uuid::Error) -> Self {
        ChatError::CorruptRow(err.to_string())
    }
}

impl From<time::error::ComponentRange> for ChatError {
    fn from(err: time::error::ComponentRange) -> Self {
        ChatError::CorruptRow(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_told_apart_from_failures() {
        assert!(ChatError::EmptyMessage.is_rejection());
        assert!(ChatError::RoomNotFound(Uuid::nil()).is_rejection());
        assert!(
            ChatError::NotAParticipant { room_id: Uuid::nil(), user_id: "x".to_owned() }.is_rejection()
        );
        assert!(!ChatError::Store(sqlx::Error::PoolTimedOut).is_rejection());
        assert!(!ChatError::CorruptRow("bad uuid".to_owned()).is_rejection());
    }
}
