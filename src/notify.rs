use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::dispatch::{DeliveryError, NotificationSink};
use crate::model::Notification;

const CHANNEL_CAPACITY: usize = 256;
/// Newest notifications kept per user.
const INBOX_CAPACITY: usize = 200;

/// In-app notification hub: a retained inbox plus a live broadcast per user.
pub struct InboxHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    inboxes: DashMap<Ulid, VecDeque<Notification>>,
}

impl Default for InboxHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            inboxes: DashMap::new(),
        }
    }

    /// Subscribe to live notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Retain and broadcast. Broadcasting is a no-op if nobody is listening, and a
    /// channel whose receivers are all gone is dropped.
    pub fn publish(&self, notification: Notification) {
        let user_id = notification.user_id;
        {
            let mut inbox = self.inboxes.entry(user_id).or_default();
            if inbox.len() == INBOX_CAPACITY {
                inbox.pop_front();
            }
            inbox.push_back(notification.clone());
        }
        let Some(sender) = self.channels.get(&user_id) else {
            return;
        };
        let _ = sender.send(notification);
        drop(sender);
        // `subscribe` holds the entry while subscribing, so this cannot race a new receiver.
        self.channels
            .remove_if(&user_id, |_, sender| sender.receiver_count() == 0);
    }

    /// Users with a live broadcast channel.
    pub fn live_channels(&self) -> usize {
        self.channels.len()
    }

    /// Retained notifications for a user, oldest first.
    pub fn inbox(&self, user_id: &Ulid) -> Vec<Notification> {
        self.inboxes
            .get(user_id)
            .map(|e| e.value().iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InboxHub {
    async fn create(&self, notification: Notification) -> Result<(), DeliveryError> {
        self.publish(notification);
        Ok(())
    }
}
