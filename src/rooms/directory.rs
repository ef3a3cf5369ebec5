use std::{cmp::Reverse, sync::Arc};

use futures_util::{StreamExt, stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    broker::{Subscription, SubscriptionBroker},
    db::{self, Counterpart, Participant, RoleAssignment, Room, RoomSummary},
    error::{ChatError, ChatResult},
    profiles::ProfileLookup,
    store::ChatStore,
};

use super::ProjectionKeeper;

/// One room per doctor/patient pair, plus each user's live room list.
#[derive(Clone)]
pub struct RoomDirectory {
    store: Arc<dyn ChatStore>,
    broker: SubscriptionBroker,
    projection: ProjectionKeeper,
    profiles: Arc<dyn ProfileLookup>,
}

impl RoomDirectory {
    pub fn new(
        store: Arc<dyn ChatStore>,
        broker: SubscriptionBroker,
        projection: ProjectionKeeper,
        profiles: Arc<dyn ProfileLookup>,
    ) -> Self {
        Self {
            store,
            broker,
            projection,
            profiles,
        }
    }

    /// Returns the pair's room, creating it on first use. Concurrent callers
    /// for the same pair, in either order, all get the same room back.
    #[instrument(skip(self), fields(a = %a.id, b = %b.id))]
    pub async fn resolve_or_create_room(&self, a: &Participant, b: &Participant) -> ChatResult<Room> {
        let roles = RoleAssignment::from_pair(a, b)?;

        if let Some(room) = self.store.room_by_pair(&db::pair_key(&a.id, &b.id)).await? {
            return Ok(self.projection.repair(room).await);
        }

        let (room, created) = self.store.insert_room(&Room::new(roles)).await?;
        if created {
            info!(room_id = %room.id, doctor = %room.role_assignment.doctor, patient = %room.role_assignment.patient, "room created");
            for user_id in &room.participants {
                self.broker.publish_room_change(user_id, room.id);
            }
        }

        Ok(room)
    }

    pub async fn get_room(&self, room_id: Uuid) -> ChatResult<Room> {
        let room = self
            .store
            .room(room_id)
            .await?
            .ok_or(ChatError::RoomNotFound(room_id))?;

        Ok(self.projection.repair(room).await)
    }

    /// Like [`get_room`](Self::get_room) but only for one of the two participants.
    pub async fn room_for_participant(&self, room_id: Uuid, user_id: &str) -> ChatResult<Room> {
        let room = self.get_room(room_id).await?;
        if !room.has_participant(user_id) {
            return Err(ChatError::NotAParticipant {
                room_id,
                user_id: user_id.to_owned(),
            });
        }
        Ok(room)
    }

    /// Current rooms of `user_id`, most recently active first.
    pub async fn rooms_for_user(&self, user_id: &str) -> ChatResult<Vec<RoomSummary>> {
        let mut summaries = Vec::new();

        for room in self.store.rooms_for_user(user_id).await? {
            let room = self.projection.repair(room).await;
            let Some(counterpart) = room.counterpart(user_id) else {
                continue;
            };

            let display_name = self
                .profiles
                .get_user_by_id(&counterpart.id)
                .await
                .ok()
                .map(|profile| profile.display_name);

            summaries.push(RoomSummary {
                room_id: room.id,
                counterpart: Counterpart {
                    id: counterpart.id,
                    role: counterpart.role,
                    display_name,
                },
                last_message_text: room.last_message_text,
                last_message_at: room.last_message_at,
                created_at: room.created_at,
            });
        }

        summaries.sort_by_key(|s| Reverse((s.last_message_at, s.created_at)));
        Ok(summaries)
    }

    /// Live view of [`rooms_for_user`](Self::rooms_for_user): a fresh snapshot
    /// now and after every change to one of the user's rooms. Call again to
    /// restart.
    pub fn list_rooms_for_user(&self, user_id: &str) -> Subscription<ChatResult<Vec<RoomSummary>>> {
        struct Watch {
            rooms: RoomDirectory,
            user_id: String,
            rx: broadcast::Receiver<Uuid>,
            started: bool,
        }

        let watch = Watch {
            rooms: self.clone(),
            user_id: user_id.to_owned(),
            rx: self.broker.watch_user(user_id),
            started: false,
        };

        let broker = self.broker.clone();
        let user_id = user_id.to_owned();
        Subscription::with_release(
            stream::unfold(watch, |mut watch| async move {
                if watch.started {
                    match watch.rx.recv().await {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return None,
                    }
                    // coalesce bursts into one snapshot
                    while watch.rx.try_recv().is_ok() {}
                }
                watch.started = true;

                let snapshot = watch.rooms.rooms_for_user(&watch.user_id).await;
                Some((snapshot, watch))
            })
            .boxed(),
            move || broker.release_user(&user_id),
        )
    }
}
