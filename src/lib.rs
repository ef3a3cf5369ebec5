pub mod auth;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod profiles;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::FromRef,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use auth::TokenKeys;
use broker::SubscriptionBroker;
use error::ChatError;
use notify::{NotificationDispatcher, PushSink};
use profiles::{ProfileDirectory, ProfileLookup};
use rooms::{MessageStore, ProjectionKeeper, RoomDirectory};
use store::ChatStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub rooms: RoomDirectory,
    pub messages: MessageStore,
    pub broker: SubscriptionBroker,
    pub tokens: TokenKeys,
    pub profiles: ProfileDirectory,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ChatStore>,
        tokens: TokenKeys,
        profiles: ProfileDirectory,
        push: Arc<dyn PushSink>,
        projection_retries: u32,
    ) -> Self {
        let lookup: Arc<dyn ProfileLookup> = Arc::new(profiles.clone());
        let broker = SubscriptionBroker::new(store.clone());
        let projection = ProjectionKeeper::new(store.clone(), projection_retries);
        let rooms = RoomDirectory::new(store.clone(), broker.clone(), projection.clone(), lookup.clone());
        let notifier = NotificationDispatcher::new(lookup.clone(), push);
        let messages = MessageStore::new(store, rooms.clone(), broker.clone(), projection, notifier, lookup);

        Self {
            rooms,
            messages,
            broker,
            tokens,
            profiles,
        }
    }
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(gateway::gateway_ws))
        .nest("/rooms", rooms::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> AppResult<String>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> AppResult<String> {
        Ok(
            self.get(field)
            .ok_or(format!("expected {field} in {self}"))?
            .as_str()
            .ok_or(format!("expected {field} in {self} to be string"))?
            .to_owned()
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        use ChatError::*;
        match self.0.downcast_ref::<ChatError>() {
            Some(InvalidToken) => StatusCode::UNAUTHORIZED,
            Some(InvalidParticipants(_) | EmptyMessage) => StatusCode::BAD_REQUEST,
            Some(NotAParticipant { .. }) => StatusCode::FORBIDDEN,
            Some(RoomNotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, backtrace = %self.0.backtrace(), "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(ChatError);
apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(axum::Error);
apperr_impl!(anyhow::Error);

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn chat_errors_map_to_statuses() {
        assert_eq!(AppError::from(ChatError::InvalidToken).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::from(ChatError::EmptyMessage).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::from(ChatError::NotAParticipant { room_id: Uuid::nil(), user_id: "x".to_owned() }).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::from(ChatError::RoomNotFound(Uuid::nil())).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::from("boom").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn get_field_reads_strings() {
        let body = json!({"displayName": "Pat", "nested": {"a": 1}, "n": 3});
        assert_eq!(body.get_str_field("displayName").unwrap(), "Pat");
        assert!(body.get_str_field("n").is_err());
        assert!(body.get_str_field("missing").is_err());
    }
}
