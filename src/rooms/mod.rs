mod directory;
mod msg;
mod new;
mod projection;
mod room;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use directory::RoomDirectory;
pub use msg::MessageStore;
pub use projection::ProjectionKeeper;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(room::list_rooms).post(new::new_room))
        .route("/live", get(ws::rooms_live))
        .route("/{room_id}", get(room::room))
        .route("/{room_id}/messages", get(room::messages).post(room::send_message))
        .route("/{room_id}/ws", get(ws::room_ws))
}
