use std::{sync::Arc, time::Duration};

use rand::Rng;
use tracing::{error, info, warn};

use crate::{
    db::{Message, Room},
    error::ChatError,
    store::ChatStore,
};

const BACKOFF_BASE_MS: u64 = 25;
const BACKOFF_MAX_MS: u64 = 2_000;

/// Keeps each room's last-message fields in step with its log.
///
/// The write is conditional on sequence, so the newest entry wins no matter
/// which append finishes first. A room whose write kept failing is caught up on
/// its next read, where the stored projection is compared with the log tail.
#[derive(Clone)]
pub struct ProjectionKeeper {
    store: Arc<dyn ChatStore>,
    retries: u32,
}

impl ProjectionKeeper {
    pub fn new(store: Arc<dyn ChatStore>, retries: u32) -> Self {
        Self {
            store,
            retries: retries.max(1),
        }
    }

    /// Returns true when the room now shows `message`.
    pub async fn apply(&self, message: &Message) -> bool {
        let room_id = message.room_id;

        for attempt in 1..=self.retries {
            match self
                .store
                .update_projection(room_id, message.seq, &message.text, message.sent_at)
                .await
            {
                Ok(moved) => return moved,
                Err(e) => {
                    let err = ChatError::ProjectionUpdateFailed {
                        room_id,
                        reason: e.to_string(),
                    };
                    warn!(%room_id, attempt, error = %err, "projection write failed");

                    if attempt < self.retries {
                        let jitter = rand::rng().random_range(0..BACKOFF_BASE_MS);
                        tokio::time::sleep(Duration::from_millis(backoff_ms(attempt) + jitter)).await;
                    }
                }
            }
        }

        error!(%room_id, seq = message.seq, "projection behind the log until next read");
        false
    }

    /// Moves the projection of `room` up to its last log entry if it lags.
    pub async fn repair(&self, mut room: Room) -> Room {
        let last = match self.store.last_message(room.id).await {
            Ok(Some(last)) => last,
            Ok(None) => return room,
            Err(e) => {
                warn!(room_id = %room.id, error = %e, "projection check deferred");
                return room;
            }
        };

        if room.last_message_seq.is_some_and(|seq| seq >= last.seq) {
            return room;
        }

        if let Err(e) = self
            .store
            .update_projection(room.id, last.seq, &last.text, last.sent_at)
            .await
        {
            warn!(room_id = %room.id, error = %e, "projection repair deferred");
            return room;
        }
        info!(room_id = %room.id, seq = last.seq, "projection repaired");

        room.last_message_text = Some(last.text);
        room.last_message_at = Some(last.sent_at);
        room.last_message_seq = Some(last.seq);
        room
    }
}

/// Delay before retry `attempt + 1`, doubling per attempt up to a ceiling.
fn backoff_ms(attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| BACKOFF_BASE_MS.checked_mul(factor))
        .map_or(BACKOFF_MAX_MS, |delay| delay.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_stays_capped() {
        assert_eq!(backoff_ms(1), 25);
        assert_eq!(backoff_ms(2), 50);
        assert_eq!(backoff_ms(4), 200);
        assert_eq!(backoff_ms(10), BACKOFF_MAX_MS);
        assert_eq!(backoff_ms(64), BACKOFF_MAX_MS);
        assert_eq!(backoff_ms(u32::MAX), BACKOFF_MAX_MS);
    }
}
