#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use careline::{
    AppState,
    auth::{Identity, TokenKeys},
    db::{self, Role},
    error::{ChatError, ChatResult},
    notify::{Notification, PushSink},
    profiles::ProfileDirectory,
    store::SqliteChatStore,
};
use tokio::net::TcpListener;

pub const SECRET: &[u8] = b"integration-secret";

/// Keeps every notification handed to it; can be told to fail instead.
#[derive(Default)]
pub struct RecordingPush {
    pub sent: Mutex<Vec<Notification>>,
    pub fail: bool,
}

impl RecordingPush {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Notifications go out on their own task; give them a moment.
    pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
        for _ in 0..100 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl PushSink for RecordingPush {
    async fn send_notification(&self, recipient_id: &str, payload: &Notification) -> ChatResult<()> {
        if self.fail {
            return Err(ChatError::NotificationDeliveryFailed {
                recipient_id: recipient_id.to_owned(),
                reason: "push gateway down".to_owned(),
            });
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub tokens: TokenKeys,
    pub push: Arc<RecordingPush>,
    pub http: reqwest::Client,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_push(RecordingPush::default()).await
    }

    pub async fn with_push(push: RecordingPush) -> Self {
        let db_pool = db::connect("sqlite::memory:", 1).await.unwrap();
        let tokens = TokenKeys::new(SECRET);
        let push = Arc::new(push);

        let state = AppState::new(
            Arc::new(SqliteChatStore::new(db_pool)),
            tokens.clone(),
            ProfileDirectory::new(None),
            push.clone(),
            3,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = careline::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            tokens,
            push,
            http: reqwest::Client::new(),
        }
    }

    pub fn token(&self, user_id: &str, name: &str, role: Role) -> String {
        self.tokens
            .issue(&Identity::new(user_id, name, role), time::Duration::minutes(5))
            .unwrap()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self, path: &str, token: &str) -> String {
        format!("ws://{}{path}?token={token}", self.addr)
    }
}
