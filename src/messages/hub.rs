//! In-memory fanout of committed messages to live subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::Stream;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

use crate::db::Message;
use crate::error::{BrokenReason, LogError, LogResult, validate_room};

/// What `publish` does when a subscriber's mailbox is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// Remove the lagging subscriber; it sees `SubscriptionBroken` after draining.
    #[default]
    DropSubscriber,
    /// Wait for mailbox space. Stalls further appends to the same room.
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubLimits {
    pub mailbox_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            overflow_policy: OverflowPolicy::DropSubscriber,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubscriptionHub {
    shared: Arc<HubShared>,
}

#[derive(Debug)]
struct HubShared {
    limits: HubLimits,
    state: Mutex<HubState>,
}

#[derive(Debug, Default)]
struct HubState {
    rooms: HashMap<String, HashMap<u64, Mailbox>>,
    next_subscriber_id: u64,
}

#[derive(Debug)]
struct Mailbox {
    sender: mpsc::Sender<Message>,
    broken: Arc<Mutex<Option<BrokenReason>>>,
}

impl SubscriptionHub {
    pub fn new(limits: HubLimits) -> Self {
        let limits = HubLimits {
            mailbox_capacity: limits.mailbox_capacity.max(1),
            ..limits
        };
        Self {
            shared: Arc::new(HubShared {
                limits,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    pub fn limits(&self) -> HubLimits {
        self.shared.limits
    }

    pub fn subscribe(&self, room_id: &str) -> LogResult<Subscription> {
        validate_room(room_id)?;

        let (sender, receiver) = mpsc::channel(self.shared.limits.mailbox_capacity);
        let broken = Arc::new(Mutex::new(None));

        let mut state = self.shared.lock_state();
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.wrapping_add(1);
        state.rooms.entry(room_id.to_owned()).or_default().insert(
            id,
            Mailbox {
                sender,
                broken: Arc::clone(&broken),
            },
        );
        debug!(room_id, subscriber = id, "subscribed");

        Ok(Subscription {
            id,
            room_id: room_id.to_owned(),
            receiver,
            broken,
            hub: Arc::downgrade(&self.shared),
        })
    }

    /// Deregisters `subscription`. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Delivers `message` to every current subscriber of `room_id`, in call order.
    ///
    /// Callers must serialize publishes per room; the store does so by
    /// publishing while it still holds the room's append lock.
    pub async fn publish(&self, room_id: &str, message: &Message) {
        match self.shared.limits.overflow_policy {
            OverflowPolicy::DropSubscriber => self.publish_or_drop(room_id, message),
            OverflowPolicy::Block => self.publish_blocking(room_id, message).await,
        }
    }

    fn publish_or_drop(&self, room_id: &str, message: &Message) {
        let capacity = self.shared.limits.mailbox_capacity;
        let mut state = self.shared.lock_state();
        let Some(mailboxes) = state.rooms.get_mut(room_id) else {
            return;
        };

        mailboxes.retain(|id, mailbox| match mailbox.sender.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(room_id, subscriber = id, capacity, "dropping lagging subscriber");
                *lock(&mailbox.broken) = Some(BrokenReason::Lagged { capacity });
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if mailboxes.is_empty() {
            state.rooms.remove(room_id);
        }
    }

    async fn publish_blocking(&self, room_id: &str, message: &Message) {
        let senders: Vec<(u64, mpsc::Sender<Message>)> = {
            let state = self.shared.lock_state();
            let Some(mailboxes) = state.rooms.get(room_id) else {
                return;
            };
            mailboxes
                .iter()
                .map(|(id, mailbox)| (*id, mailbox.sender.clone()))
                .collect()
        };

        for (id, sender) in senders {
            if sender.send(message.clone()).await.is_err() {
                self.shared.remove(room_id, id);
            }
        }
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.shared
            .lock_state()
            .rooms
            .get(room_id)
            .map_or(0, HashMap::len)
    }
}

impl HubShared {
    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }

    fn remove(&self, room_id: &str, id: u64) {
        let mut state = self.lock_state();
        if let Some(mailboxes) = state.rooms.get_mut(room_id) {
            mailboxes.remove(&id);
            if mailboxes.is_empty() {
                state.rooms.remove(room_id);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live feed of one room. Deregisters itself when dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    room_id: String,
    receiver: mpsc::Receiver<Message>,
    broken: Arc<Mutex<Option<BrokenReason>>>,
    hub: Weak<HubShared>,
}

impl Subscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Waits for the next message. Cancel-safe.
    pub async fn recv(&mut self) -> LogResult<Message> {
        match self.receiver.recv().await {
            Some(message) => Ok(message),
            None => Err(self.broken_error()),
        }
    }

    pub fn try_recv(&mut self) -> LogResult<Option<Message>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.broken_error()),
        }
    }

    /// Yields messages until the subscription breaks, then the error, then ends.
    pub fn into_stream(self) -> impl Stream<Item = LogResult<Message>> + Send {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.recv().await {
                Ok(message) => Some((Ok(message), Some(subscription))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    fn broken_error(&self) -> LogError {
        LogError::SubscriptionBroken {
            room: self.room_id.clone(),
            reason: lock(&self.broken).unwrap_or(BrokenReason::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.room_id, self.id);
            debug!(room_id = %self.room_id, subscriber = self.id, "unsubscribed");
        }
    }
}
