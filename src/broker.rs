//! Fan-out of committed messages and room-list changes to live subscribers.
//!
//! Each room and each user gets a lazily created broadcast channel. Room
//! subscribers replay the stored log first and then follow the channel,
//! skipping entries they already have and backfilling from the store whenever
//! a sequence gap or lag shows up, so every subscriber sees the full log in
//! commit order. A channel is dropped once its last subscriber leaves.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use dashmap::DashMap;
use futures_util::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use uuid::Uuid;

use crate::{
    db::Message,
    error::ChatResult,
    store::ChatStore,
};

const CHANNEL_CAPACITY: usize = 256;

type Release = Box<dyn FnOnce() + Send>;

/// A live feed that ends when unsubscribed. Dropping it also unsubscribes.
pub struct Subscription<T> {
    inner: Option<BoxStream<'static, T>>,
    release: Option<Release>,
}

impl<T> Subscription<T> {
    /// Runs `release` once the feed has been torn down.
    pub fn with_release(inner: BoxStream<'static, T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Some(inner),
            release: Some(Box::new(release)),
        }
    }

    /// Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        self.inner = None;
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.get_mut().inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionBroker {
    store: Arc<dyn ChatStore>,
    rooms: Arc<DashMap<Uuid, broadcast::Sender<Message>>>,
    users: Arc<DashMap<String, broadcast::Sender<Uuid>>>,
}

struct RoomFeed {
    store: Arc<dyn ChatStore>,
    room_id: Uuid,
    rx: broadcast::Receiver<Message>,
    last_seq: i64,
    pending: VecDeque<Message>,
    replayed: bool,
}

impl RoomFeed {
    async fn backfill(&mut self) -> ChatResult<()> {
        let missing = self.store.messages_after(self.room_id, self.last_seq).await?;
        debug!(room_id = %self.room_id, after = self.last_seq, count = missing.len(), "backfill");
        self.pending.extend(missing);
        Ok(())
    }

    async fn next(&mut self) -> Option<ChatResult<Message>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                if message.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = message.seq;
                return Some(Ok(message));
            }

            if !self.replayed {
                self.replayed = true;
                if let Err(e) = self.backfill().await {
                    return Some(Err(e));
                }
                continue;
            }

            match self.rx.recv().await {
                Ok(message) if message.seq <= self.last_seq => continue,
                Ok(message) if message.seq == self.last_seq + 1 => {
                    self.last_seq = message.seq;
                    return Some(Ok(message));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if let Err(e) = self.backfill().await {
                        return Some(Err(e));
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl SubscriptionBroker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            rooms: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
        }
    }

    /// The whole room log in commit order, then every later append.
    pub fn subscribe_messages(&self, room_id: Uuid) -> Subscription<ChatResult<Message>> {
        // subscribe before the replay query so nothing committed in between is lost
        let rx = self
            .rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let feed = RoomFeed {
            store: self.store.clone(),
            room_id,
            rx,
            last_seq: 0,
            pending: VecDeque::new(),
            replayed: false,
        };

        let broker = self.clone();
        Subscription::with_release(
            stream::unfold(feed, |mut feed| async move {
                let item = feed.next().await?;
                Some((item, feed))
            })
            .boxed(),
            move || broker.release_room(room_id),
        )
    }

    /// Signals that `user_id`'s room list changed, carrying the room id.
    pub fn watch_user(&self, user_id: &str) -> broadcast::Receiver<Uuid> {
        self.users
            .entry(user_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drops the room channel once nobody listens to it.
    pub fn release_room(&self, room_id: Uuid) {
        if self.rooms.remove_if(&room_id, |_, tx| tx.receiver_count() == 0).is_some() {
            debug!(%room_id, "dropped idle room channel");
        }
    }

    pub fn release_user(&self, user_id: &str) {
        if self.users.remove_if(user_id, |_, tx| tx.receiver_count() == 0).is_some() {
            debug!(user_id, "dropped idle room-list channel");
        }
    }

    pub fn publish_message(&self, message: &Message) {
        let room_id = message.room_id;
        if let Some(tx) = self.rooms.get(&room_id) {
            if tx.send(message.clone()).is_ok() {
                return;
            }
        }
        self.release_room(room_id);
    }

    pub fn publish_room_change(&self, user_id: &str, room_id: Uuid) {
        if let Some(tx) = self.users.get(user_id) {
            if tx.send(room_id).is_ok() {
                return;
            }
        }
        self.release_user(user_id);
    }

    pub fn room_subscriber_count(&self, room_id: Uuid) -> usize {
        self.rooms.get(&room_id).map_or(0, |tx| tx.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{self, NewMessage, Participant, Role, RoleAssignment, Room},
        store::SqliteChatStore,
    };

    async fn setup() -> (Arc<dyn ChatStore>, SubscriptionBroker, Uuid) {
        let store: Arc<dyn ChatStore> =
            Arc::new(SqliteChatStore::new(db::connect("sqlite::memory:", 1).await.unwrap()));
        let roles = RoleAssignment::from_pair(
            &Participant::new("d1", Role::Doctor),
            &Participant::new("p1", Role::Patient),
        )
        .unwrap();
        let (room, _) = store.insert_room(&Room::new(roles)).await.unwrap();
        let broker = SubscriptionBroker::new(store.clone());
        (store, broker, room.id)
    }

    async fn append(store: &Arc<dyn ChatStore>, room_id: Uuid, text: &str) -> Message {
        store
            .append_message(NewMessage {
                room_id,
                sender_id: "p1".to_owned(),
                sender_display_name: "Pat".to_owned(),
                text: text.to_owned(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replays_log_then_follows_live() {
        let (store, broker, room_id) = setup().await;
        append(&store, room_id, "one").await;

        let mut sub = broker.subscribe_messages(room_id);
        assert_eq!(sub.next().await.unwrap().unwrap().text, "one");

        let two = append(&store, room_id, "two").await;
        broker.publish_message(&two);
        assert_eq!(sub.next().await.unwrap().unwrap().text, "two");
    }

    #[tokio::test]
    async fn out_of_order_publish_is_backfilled_and_deduplicated() {
        let (store, broker, room_id) = setup().await;
        let mut sub = broker.subscribe_messages(room_id);

        let a = append(&store, room_id, "a").await;
        let b = append(&store, room_id, "b").await;
        let c = append(&store, room_id, "c").await;

        // replay already covers a..c; later publishes arrive shuffled
        broker.publish_message(&c);
        broker.publish_message(&a);
        broker.publish_message(&b);
        let d = append(&store, room_id, "d").await;
        broker.publish_message(&d);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(sub.next().await.unwrap().unwrap().text);
        }
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn gap_in_live_feed_is_filled_from_store() {
        let (store, broker, room_id) = setup().await;
        let mut sub = broker.subscribe_messages(room_id);

        // nothing stored yet: replay is empty, next item comes from the live feed
        let first = tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..3 {
                got.push(sub.next().await.unwrap().unwrap().seq);
            }
            got
        });

        tokio::task::yield_now().await;
        let m1 = append(&store, room_id, "1").await;
        let _m2 = append(&store, room_id, "2").await;
        let m3 = append(&store, room_id, "3").await;
        broker.publish_message(&m1);
        broker.publish_message(&m3);

        assert_eq!(first.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_isolated() {
        let (store, broker, room_id) = setup().await;
        let mut leaving = broker.subscribe_messages(room_id);
        let mut staying = broker.subscribe_messages(room_id);
        assert_eq!(broker.room_subscriber_count(room_id), 2);

        leaving.unsubscribe();
        leaving.unsubscribe();
        assert!(!leaving.is_active());
        assert!(leaving.next().await.is_none());
        assert_eq!(broker.room_subscriber_count(room_id), 1);

        let m = append(&store, room_id, "still here").await;
        broker.publish_message(&m);
        assert_eq!(staying.next().await.unwrap().unwrap().text, "still here");
    }

    #[tokio::test]
    async fn last_subscriber_leaving_drops_the_channel() {
        let (_store, broker, room_id) = setup().await;
        let mut first = broker.subscribe_messages(room_id);
        let second = broker.subscribe_messages(room_id);

        first.unsubscribe();
        assert!(broker.rooms.contains_key(&room_id));

        drop(second);
        assert!(!broker.rooms.contains_key(&room_id));
        assert_eq!(broker.room_subscriber_count(room_id), 0);

        // a fresh subscriber gets a fresh channel
        let _third = broker.subscribe_messages(room_id);
        assert_eq!(broker.room_subscriber_count(room_id), 1);
    }

    #[tokio::test]
    async fn room_changes_reach_user_watchers() {
        let (_store, broker, room_id) = setup().await;
        let mut rx = broker.watch_user("p1");
        broker.publish_room_change("p1", room_id);
        broker.publish_room_change("nobody", room_id);
        assert_eq!(rx.recv().await.unwrap(), room_id);
    }
}
