use axum::{
    Json, debug_handler,
    extract::{Path, State},
};
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    auth::AuthUser,
    db::{Message, Room, RoomSummary},
};

use super::{MessageStore, RoomDirectory, msg::SendMessageRequest};

#[debug_handler(state = AppState)]
pub(crate) async fn list_rooms(
    State(rooms): State<RoomDirectory>,
    AuthUser(identity): AuthUser,
) -> AppResult<Json<Vec<RoomSummary>>> {
    Ok(Json(rooms.rooms_for_user(&identity.user_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn room(
    State(rooms): State<RoomDirectory>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<Room>> {
    Ok(Json(rooms.room_for_participant(room_id, &identity.user_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    State(messages): State<MessageStore>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(messages.history(room_id, &identity.user_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn send_message(
    State(messages): State<MessageStore>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<Uuid>,

    Json(SendMessageRequest { text }): Json<SendMessageRequest>,
) -> AppResult<Json<Message>> {
    Ok(Json(messages.append_message(room_id, &identity.user_id, &text).await?))
}
