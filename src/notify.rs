//! Out-of-band push notifications for new messages.
//!
//! Dispatch runs on its own task after the message is committed. Nothing that
//! goes wrong here reaches the sender.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    db::{Message, Role, Room},
    error::{ChatError, ChatResult},
    profiles::{self, ProfileLookup},
};

const BODY_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(rename = "type")]
    pub kind: String,
    pub room_id: Uuid,
    pub sender_id: String,
    pub sender_role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub recipient_id: String,
    pub data: NotificationData,
}

impl Notification {
    /// Payload for the participant who did not send `message`.
    pub fn for_message(room: &Room, message: &Message) -> ChatResult<Self> {
        let not_member = || ChatError::NotAParticipant {
            room_id: room.id,
            user_id: message.sender_id.clone(),
        };
        let sender_role = room.role_of(&message.sender_id).ok_or_else(not_member)?;
        let recipient = room.counterpart(&message.sender_id).ok_or_else(not_member)?;

        let mut body: String = message.text.chars().take(BODY_MAX_CHARS).collect();
        if message.text.chars().count() > BODY_MAX_CHARS {
            body.push_str("...");
        }

        Ok(Self {
            title: format!("New message from {}", message.sender_display_name),
            body,
            recipient_id: recipient.id,
            data: NotificationData {
                kind: "chat_message".to_owned(),
                room_id: room.id,
                sender_id: message.sender_id.clone(),
                sender_role,
            },
        })
    }
}

#[async_trait]
pub trait PushSink: Send + Sync {
    async fn send_notification(&self, recipient_id: &str, payload: &Notification) -> ChatResult<()>;
}

/// Posts `{recipientId, payload}` to a push gateway.
pub struct WebhookPush {
    client: reqwest::Client,
    url: String,
}

impl WebhookPush {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushSink for WebhookPush {
    async fn send_notification(&self, recipient_id: &str, payload: &Notification) -> ChatResult<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "recipientId": recipient_id, "payload": payload }))
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|e| ChatError::NotificationDeliveryFailed {
                recipient_id: recipient_id.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Used when no push gateway is configured.
pub struct LogPush;

#[async_trait]
impl PushSink for LogPush {
    async fn send_notification(&self, recipient_id: &str, payload: &Notification) -> ChatResult<()> {
        info!(recipient_id, title = %payload.title, "notifications not available, logged only");
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    profiles: Arc<dyn ProfileLookup>,
    push: Arc<dyn PushSink>,
}

impl NotificationDispatcher {
    pub fn new(profiles: Arc<dyn ProfileLookup>, push: Arc<dyn PushSink>) -> Self {
        Self { profiles, push }
    }

    pub async fn dispatch(&self, room: &Room, message: &Message) -> ChatResult<Notification> {
        let notification = Notification::for_message(room, message)?;

        let recipient_name = profiles::display_name_or_id(self.profiles.as_ref(), &notification.recipient_id).await;
        self.push
            .send_notification(&notification.recipient_id, &notification)
            .await?;

        info!(
            room_id = %room.id,
            recipient_id = %notification.recipient_id,
            recipient = %recipient_name,
            "notification sent"
        );
        Ok(notification)
    }

    /// Fire-and-forget [`dispatch`](Self::dispatch); failures are only logged.
    pub fn spawn_dispatch(&self, room: Room, message: Message) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(&room, &message).await {
                warn!(room_id = %room.id, message_id = %message.id, error = %e, "notification dropped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::{
        db::RoleAssignment,
        profiles::ProfileDirectory,
    };

    fn room() -> Room {
        Room::new(RoleAssignment {
            doctor: "d1".to_owned(),
            patient: "p1".to_owned(),
        })
    }

    fn message(room: &Room, sender: &str, text: &str) -> Message {
        Message {
            id: Uuid::now_v7(),
            room_id: room.id,
            seq: 1,
            sender_id: sender.to_owned(),
            sender_display_name: "Pat".to_owned(),
            text: text.to_owned(),
            sent_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn payload_targets_counterpart() {
        let room = room();
        let n = Notification::for_message(&room, &message(&room, "p1", "hi doc")).unwrap();

        assert_eq!(n.recipient_id, "d1");
        assert_eq!(n.title, "New message from Pat");
        assert_eq!(n.body, "hi doc");
        assert_eq!(n.data.sender_role, Role::Patient);

        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["data"]["type"], "chat_message");
        assert_eq!(value["recipientId"], "d1");
        assert_eq!(value["data"]["senderRole"], "PATIENT");
    }

    #[test]
    fn long_bodies_are_cut() {
        let room = room();
        let n = Notification::for_message(&room, &message(&room, "d1", &"a".repeat(500))).unwrap();
        assert_eq!(n.body.chars().count(), BODY_MAX_CHARS + 3);
        assert_eq!(n.recipient_id, "p1");
    }

    struct Unreachable;

    #[async_trait]
    impl PushSink for Unreachable {
        async fn send_notification(&self, recipient_id: &str, _: &Notification) -> ChatResult<()> {
            Err(ChatError::NotificationDeliveryFailed {
                recipient_id: recipient_id.to_owned(),
                reason: "connection refused".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn delivery_failure_stays_inside_the_task() {
        let room = room();
        let dispatcher = NotificationDispatcher::new(Arc::new(ProfileDirectory::new(None)), Arc::new(Unreachable));

        assert!(matches!(
            dispatcher.dispatch(&room, &message(&room, "p1", "hi")).await,
            Err(ChatError::NotificationDeliveryFailed { .. })
        ));
        // spawned form swallows it
        dispatcher.spawn_dispatch(room.clone(), message(&room, "p1", "hi")).await.unwrap();
    }
}
