use axum::{
    debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    auth::{AuthUser, Identity},
    broker::Subscription,
    db::{Message, RoomSummary},
    error::ChatResult,
    gateway::send_json,
};

use super::{MessageStore, RoomDirectory, msg::SendMessageRequest};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum RoomFrame {
    Message { message: Message },
    Rooms { rooms: Vec<RoomSummary> },
    Error { message: String },
}

/// Room socket: pushes the room log in order, appends `{"text": ...}` frames.
#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<Uuid>,
    State(rooms): State<RoomDirectory>,
    State(messages): State<MessageStore>,
    AuthUser(identity): AuthUser,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    rooms.room_for_participant(room_id, &identity.user_id).await?;
    let feed = messages.subscribe_messages(room_id).await?;

    Ok(ws
        .on_upgrade(move |socket| run_room(socket, feed, messages, room_id, identity))
        .into_response())
}

async fn run_room(
    socket: WebSocket,
    mut feed: Subscription<ChatResult<Message>>,
    messages: MessageStore,
    room_id: Uuid,
    identity: Identity,
) {
    info!(%room_id, user_id = %identity.user_id, "room socket open");
    let (mut sender, mut receiver) = socket.split();
    let (reject_tx, mut reject_rx) = mpsc::unbounded_channel::<String>();

    let mut broadcast_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                item = feed.next() => match item {
                    Some(Ok(message)) => RoomFrame::Message { message },
                    Some(Err(e)) => RoomFrame::Error { message: e.to_string() },
                    None => break,
                },
                Some(reason) = reject_rx.recv() => RoomFrame::Error { message: reason },
            };

            if !send_json(&mut sender, &frame).await {
                break;
            }
        }
        feed.unsubscribe();
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(SendMessageRequest { text }) = serde_json::from_str(text.as_str()) else {
            let _ = reject_tx.send("expected {\"text\": ...}".to_owned());
            continue;
        };

        if let Err(e) = messages.append_message(room_id, &identity.user_id, &text).await {
            if e.is_rejection() {
                debug!(%room_id, error = %e, "append rejected");
            } else {
                warn!(%room_id, error = %e, "append failed");
            }
            let _ = reject_tx.send(e.to_string());
        }
    }

    broadcast_task.abort();
    let _ = (&mut broadcast_task).await;
    info!(%room_id, user_id = %identity.user_id, "room socket closed");
}

/// Pushes a fresh room list snapshot whenever one of the caller's rooms changes.
#[debug_handler(state = AppState)]
pub(crate) async fn rooms_live(
    State(rooms): State<RoomDirectory>,
    AuthUser(identity): AuthUser,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let mut live = rooms.list_rooms_for_user(&identity.user_id);

    ws.on_upgrade(move |socket| async move {
        let (mut sender, mut receiver) = socket.split();

        loop {
            tokio::select! {
                snapshot = live.next() => {
                    let frame = match snapshot {
                        Some(Ok(rooms)) => RoomFrame::Rooms { rooms },
                        Some(Err(e)) => RoomFrame::Error { message: e.to_string() },
                        None => break,
                    };
                    if !send_json(&mut sender, &frame).await {
                        break;
                    }
                }
                msg = receiver.next() => match msg {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        live.unsubscribe();
        debug!(user_id = %identity.user_id, "room list socket closed");
    })
}
