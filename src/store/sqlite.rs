use async_trait::async_trait;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    db::{self, Message, NewMessage, Room, RoleAssignment},
    error::{ChatError, ChatResult},
};

use super::ChatStore;

const ROOM_COLUMNS: &str =
    "id,doctor_id,patient_id,created_at,last_message_text,last_message_at,last_message_seq";
const MESSAGE_COLUMNS: &str = "id,room_id,seq,sender_id,sender_name,text,sent_at";

#[derive(sqlx::FromRow)]
struct RoomRow {
    id: String,
    doctor_id: String,
    patient_id: String,
    created_at: i64,
    last_message_text: Option<String>,
    last_message_at: Option<i64>,
    last_message_seq: Option<i64>,
}

impl TryFrom<RoomRow> for Room {
    type Error = ChatError;

    fn try_from(row: RoomRow) -> ChatResult<Room> {
        let mut participants = [row.doctor_id.clone(), row.patient_id.clone()];
        participants.sort();

        Ok(Room {
            id: Uuid::parse_str(&row.id)?,
            participants,
            role_assignment: RoleAssignment {
                doctor: row.doctor_id,
                patient: row.patient_id,
            },
            last_message_text: row.last_message_text,
            last_message_at: row.last_message_at.map(db::from_millis).transpose()?,
            last_message_seq: row.last_message_seq,
            created_at: db::from_millis(row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    room_id: String,
    seq: i64,
    sender_id: String,
    sender_name: String,
    text: String,
    sent_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = ChatError;

    fn try_from(row: MessageRow) -> ChatResult<Message> {
        Ok(Message {
            id: Uuid::parse_str(&row.id)?,
            room_id: Uuid::parse_str(&row.room_id)?,
            seq: row.seq,
            sender_id: row.sender_id,
            sender_display_name: row.sender_name,
            text: row.text,
            sent_at: db::from_millis(row.sent_at)?,
        })
    }
}

pub struct SqliteChatStore {
    db_pool: SqlitePool,
    // sqlite has one writer; taking the gate before writing avoids
    // SHARED -> RESERVED upgrade failures between pooled connections
    write_gate: Mutex<()>,
}

impl SqliteChatStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self {
            db_pool,
            write_gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn room_by_pair(&self, pair_key: &str) -> ChatResult<Option<Room>> {
        sqlx::query_as::<_, RoomRow>(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE pair_key=?"))
            .bind(pair_key)
            .fetch_optional(&self.db_pool)
            .await?
            .map(Room::try_from)
            .transpose()
    }

    #[instrument(skip(self, room), fields(room_id = %room.id))]
    async fn insert_room(&self, room: &Room) -> ChatResult<(Room, bool)> {
        let pair_key = room.pair_key();

        let inserted = {
            let _gate = self.write_gate.lock().await;
            sqlx::query(
                "INSERT INTO rooms (id,pair_key,doctor_id,patient_id,created_at) VALUES (?,?,?,?,?) \
                 ON CONFLICT(pair_key) DO NOTHING",
            )
            .bind(room.id.to_string())
            .bind(&pair_key)
            .bind(&room.role_assignment.doctor)
            .bind(&room.role_assignment.patient)
            .bind(db::to_millis(room.created_at))
            .execute(&self.db_pool)
            .await?
            .rows_affected()
                == 1
        };

        debug!(pair_key = %pair_key, inserted, "room insert");

        let canonical = self
            .room_by_pair(&pair_key)
            .await?
            .ok_or_else(|| ChatError::CorruptRow(format!("room for {pair_key} vanished")))?;

        Ok((canonical, inserted))
    }

    async fn room(&self, room_id: Uuid) -> ChatResult<Option<Room>> {
        sqlx::query_as::<_, RoomRow>(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id=?"))
            .bind(room_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?
            .map(Room::try_from)
            .transpose()
    }

    async fn rooms_for_user(&self, user_id: &str) -> ChatResult<Vec<Room>> {
        sqlx::query_as::<_, RoomRow>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE doctor_id=? OR patient_id=? ORDER BY created_at"
        ))
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .map(Room::try_from)
        .collect()
    }

    #[instrument(skip(self, message), fields(room_id = %message.room_id))]
    async fn append_message(&self, message: NewMessage) -> ChatResult<Message> {
        let id = Uuid::now_v7();
        let now = db::to_millis(OffsetDateTime::now_utc());

        // seq and sent_at are derived from the room tail inside the insert itself
        let (seq, sent_at): (i64, i64) = {
            let _gate = self.write_gate.lock().await;
            sqlx::query_as(
                "INSERT INTO messages (id,room_id,seq,sender_id,sender_name,text,sent_at) \
                 SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, MAX(?, COALESCE(MAX(sent_at), 0)) \
                 FROM messages WHERE room_id=? \
                 RETURNING seq, sent_at",
            )
            .bind(id.to_string())
            .bind(message.room_id.to_string())
            .bind(&message.sender_id)
            .bind(&message.sender_display_name)
            .bind(&message.text)
            .bind(now)
            .bind(message.room_id.to_string())
            .fetch_one(&self.db_pool)
            .await?
        };

        Ok(Message {
            id,
            room_id: message.room_id,
            seq,
            sender_id: message.sender_id,
            sender_display_name: message.sender_display_name,
            text: message.text,
            sent_at: db::from_millis(sent_at)?,
        })
    }

    async fn messages_after(&self, room_id: Uuid, after_seq: i64) -> ChatResult<Vec<Message>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? AND seq>? ORDER BY seq"
        ))
        .bind(room_id.to_string())
        .bind(after_seq)
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .map(Message::try_from)
        .collect()
    }

    async fn last_message(&self, room_id: Uuid) -> ChatResult<Option<Message>> {
        sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? ORDER BY seq DESC LIMIT 1"
        ))
        .bind(room_id.to_string())
        .fetch_optional(&self.db_pool)
        .await?
        .map(Message::try_from)
        .transpose()
    }

    async fn update_projection(
        &self,
        room_id: Uuid,
        seq: i64,
        text: &str,
        at: OffsetDateTime,
    ) -> ChatResult<bool> {
        let _gate = self.write_gate.lock().await;
        let result = sqlx::query(
            "UPDATE rooms SET last_message_text=?, last_message_at=?, last_message_seq=? \
             WHERE id=? AND (last_message_seq IS NULL OR last_message_seq<?)",
        )
        .bind(text)
        .bind(db::to_millis(at))
        .bind(seq)
        .bind(room_id.to_string())
        .bind(seq)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
