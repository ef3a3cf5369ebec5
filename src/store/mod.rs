//! Persistence seam for rooms and their message logs.
//!
//! Services hold an `Arc<dyn ChatStore>` so tests and alternative backends can
//! stand in for the SQLite implementation.

mod sqlite;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

pub use sqlite::SqliteChatStore;

use crate::{
    db::{Message, NewMessage, Room},
    error::ChatResult,
};

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn room_by_pair(&self, pair_key: &str) -> ChatResult<Option<Room>>;

    /// Inserts `room` unless its pair already has one; returns the canonical
    /// room and whether this call created it.
    async fn insert_room(&self, room: &Room) -> ChatResult<(Room, bool)>;

    async fn room(&self, room_id: Uuid) -> ChatResult<Option<Room>>;

    async fn rooms_for_user(&self, user_id: &str) -> ChatResult<Vec<Room>>;

    /// Appends to the room log, assigning id, seq and a `sent_at` that never
    /// goes below the previous entry of the same room.
    async fn append_message(&self, message: NewMessage) -> ChatResult<Message>;

    /// Messages with `seq > after_seq`, in commit order.
    async fn messages_after(&self, room_id: Uuid, after_seq: i64) -> ChatResult<Vec<Message>>;

    async fn last_message(&self, room_id: Uuid) -> ChatResult<Option<Message>>;

    /// Moves the room projection forward to this entry. Returns false when the
    /// room already shows a later entry.
    async fn update_projection(
        &self,
        room_id: Uuid,
        seq: i64,
        text: &str,
        at: OffsetDateTime,
    ) -> ChatResult<bool>;
}
