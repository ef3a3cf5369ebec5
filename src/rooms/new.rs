use axum::{Json, debug_handler, extract::State};
use serde::Deserialize;

use crate::{
    AppResult, AppState,
    auth::AuthUser,
    db::{Participant, Role, Room},
    error::ChatError,
    profiles::{ProfileDirectory, ProfileLookup},
};

use super::RoomDirectory;

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomRequest {
    with: String,
    role: Option<Role>,
}

/// Opens (or reopens) the caller's room with `with`. A known profile decides
/// the counterpart's role; the body role only fills in for unknown users.
#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(rooms): State<RoomDirectory>,
    State(profiles): State<ProfileDirectory>,
    AuthUser(identity): AuthUser,

    Json(NewRoomRequest { with, role }): Json<NewRoomRequest>,
) -> AppResult<Json<Room>> {
    let role = match (profiles.get_user_by_id(&with).await, role) {
        (Ok(profile), Some(claimed)) if profile.role != claimed => {
            return Err(ChatError::InvalidParticipants(format!(
                "{with} is a {}, not a {claimed}",
                profile.role
            ))
            .into());
        }
        (Ok(profile), _) => profile.role,
        (Err(_), Some(claimed)) => claimed,
        (Err(_), None) => {
            return Err(ChatError::InvalidParticipants(format!("role of {with} is unknown")).into());
        }
    };

    let room = rooms
        .resolve_or_create_room(&identity.participant(), &Participant::new(with, role))
        .await?;

    Ok(Json(room))
}
