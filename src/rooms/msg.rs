use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    broker::{Subscription, SubscriptionBroker},
    db::{Message, NewMessage},
    error::{ChatError, ChatResult},
    notify::NotificationDispatcher,
    profiles::{self, ProfileLookup},
    store::ChatStore,
};

use super::{ProjectionKeeper, RoomDirectory};

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageRequest {
    pub(crate) text: String,
}

/// Appends to room logs and hands committed messages to everything downstream.
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn ChatStore>,
    rooms: RoomDirectory,
    broker: SubscriptionBroker,
    projection: ProjectionKeeper,
    notifier: NotificationDispatcher,
    profiles: Arc<dyn ProfileLookup>,
}

impl MessageStore {
    pub fn new(
        store: Arc<dyn ChatStore>,
        rooms: RoomDirectory,
        broker: SubscriptionBroker,
        projection: ProjectionKeeper,
        notifier: NotificationDispatcher,
        profiles: Arc<dyn ProfileLookup>,
    ) -> Self {
        Self {
            store,
            rooms,
            broker,
            projection,
            notifier,
            profiles,
        }
    }

    /// Rejections happen before the write. Once the message is in the log,
    /// projection and notification trouble is logged, never returned.
    #[instrument(skip(self, text))]
    pub async fn append_message(&self, room_id: Uuid, sender_id: &str, text: &str) -> ChatResult<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let room = self.rooms.room_for_participant(room_id, sender_id).await?;
        let sender_display_name = profiles::display_name_or_id(self.profiles.as_ref(), sender_id).await;

        let message = self
            .store
            .append_message(NewMessage {
                room_id,
                sender_id: sender_id.to_owned(),
                sender_display_name,
                text: text.to_owned(),
            })
            .await?;
        info!(%room_id, seq = message.seq, message_id = %message.id, "message committed");

        self.broker.publish_message(&message);

        if self.projection.apply(&message).await {
            for user_id in &room.participants {
                self.broker.publish_room_change(user_id, room_id);
            }
        }

        self.notifier.spawn_dispatch(room, message.clone());

        Ok(message)
    }

    /// The full ordered log, for participants only.
    pub async fn history(&self, room_id: Uuid, viewer_id: &str) -> ChatResult<Vec<Message>> {
        self.rooms.room_for_participant(room_id, viewer_id).await?;
        self.store.messages_after(room_id, 0).await
    }

    /// Ordered feed of the room: everything stored so far, then live appends.
    /// Subscribing again replays from the start.
    pub async fn subscribe_messages(&self, room_id: Uuid) -> ChatResult<Subscription<ChatResult<Message>>> {
        self.rooms.get_room(room_id).await?;
        Ok(self.broker.subscribe_messages(room_id))
    }
}
