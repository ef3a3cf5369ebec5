//! Token-authenticated WebSocket endpoint.
//!
//! A connection moves `Connecting -> Authenticated -> Open -> Closed`. The
//! token comes in the `token` query parameter of the upgrade request; a good
//! one gets a `WELCOME` frame and every later payload is echoed back, a bad
//! one gets an `ERROR` frame and the socket is closed.

use axum::{
    debug_handler,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    auth::{Identity, TokenKeys},
    profiles::ProfileDirectory,
};

pub const INVALID_TOKEN: &str = "Invalid token";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Welcome { message: String },
    Error { message: String },
    Echo { message: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Authenticated(Identity),
    Open(Identity),
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            ConnectionState::Authenticated(identity) | ConnectionState::Open(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Only meaningful while `Connecting`; returns the frame to send.
    pub fn handshake(&mut self, token: Option<&str>, keys: &TokenKeys) -> Option<Frame> {
        if self.state != ConnectionState::Connecting {
            return None;
        }

        let verified = token.ok_or(()).and_then(|token| keys.verify(token).map_err(|_| ()));
        let Ok(identity) = verified else {
            self.state = ConnectionState::Closed;
            return Some(Frame::Error {
                message: INVALID_TOKEN.to_owned(),
            });
        };

        self.state = ConnectionState::Authenticated(identity.clone());
        let welcome = Frame::Welcome {
            message: identity.greeting(),
        };
        self.state = ConnectionState::Open(identity);
        Some(welcome)
    }

    /// Echoes `payload` while open. JSON payloads are echoed as JSON, anything
    /// else as a string.
    pub fn receive(&mut self, payload: &str) -> Option<Frame> {
        let ConnectionState::Open(_) = self.state else {
            return None;
        };

        let message = serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_owned()));
        Some(Frame::Echo { message })
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

/// Serializes `frame` onto the socket; false once the peer is gone.
pub(crate) async fn send_json<S, T>(sender: &mut S, frame: &T) -> bool
where
    S: Sink<Message> + Unpin,
    T: Serialize,
{
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "unserializable frame");
            return false;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

#[derive(Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

#[debug_handler(state = crate::AppState)]
pub async fn gateway_ws(
    Query(HandshakeQuery { token }): Query<HandshakeQuery>,
    State(tokens): State<TokenKeys>,
    State(profiles): State<ProfileDirectory>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, token, tokens, profiles))
}

async fn run_connection(socket: WebSocket, token: Option<String>, tokens: TokenKeys, profiles: ProfileDirectory) {
    let mut connection = Connection::new();
    let (mut sender, mut receiver) = socket.split();

    let Some(frame) = connection.handshake(token.as_deref(), &tokens) else {
        return;
    };

    if connection.is_closed() {
        warn!("gateway handshake rejected");
        send_json(&mut sender, &frame).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    if let Some(identity) = connection.identity() {
        profiles.remember(identity);
        info!(user_id = %identity.user_id, "gateway connection open");
    }

    if !send_json(&mut sender, &frame).await {
        connection.close();
        return;
    }

    while let Some(msg) = receiver.next().await {
        let payload = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "gateway socket error");
                break;
            }
        };

        let Some(frame) = connection.receive(&payload) else {
            break;
        };
        if !send_json(&mut sender, &frame).await {
            break;
        }
    }

    connection.close();
    debug!("gateway connection closed");
}
