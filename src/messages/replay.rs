//! Replay history, then tail the live feed, without gaps or duplicates.

use std::collections::VecDeque;

use futures_util::Stream;
use tracing::debug;

use crate::db::Message;
use crate::error::{BrokenReason, LogError, LogResult, validate_room};

use super::hub::Subscription;
use super::store::MessageStore;

#[derive(Clone, Debug)]
pub struct ReplayCoordinator {
    store: MessageStore,
}

impl ReplayCoordinator {
    pub fn new(store: MessageStore) -> Self {
        Self { store }
    }

    /// Starts a session that emits every message after `last_seen_offset`
    /// (0 for the whole room), then every message committed afterwards.
    ///
    /// Nothing touches storage until the first `next`.
    pub fn start(&self, room_id: &str, last_seen_offset: i64) -> LogResult<ReplaySession> {
        validate_room(room_id)?;
        Ok(ReplaySession {
            store: self.store.clone(),
            room_id: room_id.to_owned(),
            last_emitted: last_seen_offset.max(0),
            pending: VecDeque::new(),
            phase: Phase::Replay,
        })
    }
}

#[derive(Debug)]
enum Phase {
    /// Paging through history; not yet subscribed.
    Replay,
    /// Subscribed; re-reading history to cover commits that raced the
    /// subscribe or that the live feed skipped.
    CatchUp(Subscription),
    Live(Subscription),
    Failed,
}

#[derive(Debug)]
pub struct ReplaySession {
    store: MessageStore,
    room_id: String,
    last_emitted: i64,
    pending: VecDeque<Message>,
    phase: Phase,
}

impl ReplaySession {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Offset of the last message this session handed out, or the starting
    /// `last_seen_offset`. Callers reconnect from here after a failure.
    pub fn last_emitted(&self) -> i64 {
        self.last_emitted
    }

    /// Next message in offset order.
    ///
    /// Cancel-safe: state only changes after each await completes, so a
    /// dropped call loses nothing.
    pub async fn next(&mut self) -> LogResult<Message> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                if let Some(message) = self.admit(message) {
                    return Ok(message);
                }
                continue;
            }

            match &mut self.phase {
                Phase::Replay => {
                    let page = self.read_page().await?;
                    if page.is_empty() {
                        let subscription = self.store.subscribe(&self.room_id)?;
                        debug!(room_id = %self.room_id, last_emitted = self.last_emitted, "replay drained, subscribed");
                        self.phase = Phase::CatchUp(subscription);
                    } else {
                        self.pending.extend(page);
                    }
                }
                Phase::CatchUp(_) => {
                    let page = self.read_page().await.inspect_err(|_| self.phase = Phase::Failed)?;
                    if page.is_empty() {
                        if let Phase::CatchUp(subscription) =
                            std::mem::replace(&mut self.phase, Phase::Failed)
                        {
                            debug!(room_id = %self.room_id, last_emitted = self.last_emitted, "live");
                            self.phase = Phase::Live(subscription);
                        }
                    } else {
                        self.pending.extend(page);
                    }
                }
                Phase::Live(subscription) => match subscription.recv().await {
                    // Committed rows the feed skipped; storage has them.
                    Ok(message) if message.offset > self.last_emitted + 1 => {
                        debug!(
                            room_id = %self.room_id,
                            last_emitted = self.last_emitted,
                            offset = message.offset,
                            "gap in live feed, catching up"
                        );
                        if let Phase::Live(subscription) =
                            std::mem::replace(&mut self.phase, Phase::Failed)
                        {
                            self.phase = Phase::CatchUp(subscription);
                        }
                    }
                    Ok(message) => self.pending.push_back(message),
                    Err(err) => {
                        self.phase = Phase::Failed;
                        return Err(err);
                    }
                },
                Phase::Failed => {
                    return Err(LogError::SubscriptionBroken {
                        room: self.room_id.clone(),
                        reason: BrokenReason::Closed,
                    });
                }
            }
        }
    }

    /// Yields messages until the first error, which is yielded before the end.
    pub fn into_stream(self) -> impl Stream<Item = LogResult<Message>> + Send {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut session = state?;
            match session.next().await {
                Ok(message) => Some((Ok(message), Some(session))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Drops anything at or below the high-water mark of what was emitted.
    fn admit(&mut self, message: Message) -> Option<Message> {
        if message.offset <= self.last_emitted {
            return None;
        }
        self.last_emitted = message.offset;
        Some(message)
    }

    async fn read_page(&self) -> LogResult<Vec<Message>> {
        let from_offset = if self.last_emitted > 0 { self.last_emitted + 1 } else { 0 };
        self.store
            .list(&self.room_id, from_offset, self.store.list_default_limit())
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;
    use crate::messages::StoreOptions;
    use crate::messages::store::testing::{append_req, reopen, temp_store};

    async fn seeded(count: i64, options: StoreOptions) -> (tempfile::TempDir, MessageStore) {
        let (dir, store) = temp_store(options).await;
        for i in 1..=count {
            store.append(append_req("lobby", &format!("m{i}"), None)).await.unwrap();
        }
        (dir, store)
    }

    async fn take_offsets(session: &mut ReplaySession, n: usize) -> Vec<i64> {
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            offsets.push(session.next().await.unwrap().offset);
        }
        offsets
    }

    #[tokio::test]
    async fn replays_history_then_goes_live() {
        let (_dir, store) = seeded(3, StoreOptions::default()).await;
        let coordinator = ReplayCoordinator::new(store.clone());
        let mut session = coordinator.start("lobby", 0).unwrap();

        assert_eq!(take_offsets(&mut session, 3).await, vec![1, 2, 3]);

        let live = tokio::spawn({
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.append(append_req("lobby", "live", None)).await.unwrap()
            }
        });
        let message = session.next().await.unwrap();
        assert_eq!(message.offset, 4);
        assert_eq!(message.text, "live");
        live.await.unwrap();
    }

    #[tokio::test]
    async fn resumes_after_last_seen_offset() {
        let (_dir, store) = seeded(5, StoreOptions::default()).await;
        let mut session = ReplayCoordinator::new(store.clone()).start("lobby", 3).unwrap();

        assert_eq!(take_offsets(&mut session, 2).await, vec![4, 5]);
        store.append(append_req("lobby", "m6", None)).await.unwrap();
        assert_eq!(session.next().await.unwrap().offset, 6);
        assert_eq!(session.last_emitted(), 6);
    }

    #[tokio::test]
    async fn replay_pages_past_the_list_cap() {
        let options = StoreOptions {
            list_default_limit: 2,
            ..StoreOptions::default()
        };
        let (_dir, store) = seeded(7, options).await;
        let mut session = ReplayCoordinator::new(store).start("lobby", 0).unwrap();

        assert_eq!(take_offsets(&mut session, 7).await, (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drops_offsets_already_emitted() {
        let (_dir, store) = temp_store(StoreOptions::default()).await;
        let mut session = ReplayCoordinator::new(store).start("lobby", 4).unwrap();
        let at = |offset| Message {
            room_id: "lobby".to_owned(),
            user_id: "alice".to_owned(),
            text: String::new(),
            offset,
            ts_ms: 0,
            idempotency_key: None,
        };

        assert_eq!(session.admit(at(3)), None);
        assert_eq!(session.admit(at(4)), None);
        assert_eq!(session.admit(at(5)).map(|m| m.offset), Some(5));
        assert_eq!(session.admit(at(5)), None);
        assert_eq!(session.last_emitted(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_delivered_exactly_once() {
        const TOTAL: i64 = 150;
        let options = StoreOptions {
            list_default_limit: 16,
            ..StoreOptions::default()
        };
        let (_dir, store) = seeded(10, options).await;

        let writer = tokio::spawn({
            let store = store.clone();
            async move {
                for i in 11..=TOTAL {
                    store.append(append_req("lobby", &format!("m{i}"), None)).await.unwrap();
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }
        });

        let session = ReplayCoordinator::new(store.clone()).start("lobby", 0).unwrap();
        let offsets: Vec<i64> = session
            .into_stream()
            .take(TOTAL as usize)
            .map(|item| item.unwrap().offset)
            .collect()
            .await;

        writer.await.unwrap();
        assert_eq!(offsets, (1..=TOTAL).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn message_racing_the_reconnect_arrives_once() {
        for round in 0..20 {
            let (_dir, store) = seeded(4, StoreOptions::default()).await;
            let coordinator = ReplayCoordinator::new(store.clone());

            let writer = tokio::spawn({
                let store = store.clone();
                async move { store.append(append_req("lobby", "n", None)).await.unwrap() }
            });
            let mut session = coordinator.start("lobby", 4).unwrap();

            let first = session.next().await.unwrap();
            assert_eq!(first.offset, 5, "round {round}");
            assert_eq!(writer.await.unwrap().offset, 5);

            store.append(append_req("lobby", "after", None)).await.unwrap();
            assert_eq!(session.next().await.unwrap().offset, 6, "round {round}");
        }
    }

    #[tokio::test]
    async fn dropping_the_session_unsubscribes() {
        let (_dir, store) = seeded(1, StoreOptions::default()).await;
        let mut session = ReplayCoordinator::new(store.clone()).start("lobby", 0).unwrap();
        assert_eq!(session.next().await.unwrap().offset, 1);

        let pending = tokio::time::timeout(Duration::from_millis(250), session.next()).await;
        assert!(pending.is_err());
        assert_eq!(store.hub().subscriber_count("lobby"), 1);

        drop(session);
        assert_eq!(store.hub().subscriber_count("lobby"), 0);
    }

    #[tokio::test]
    async fn broken_live_feed_fails_the_session() {
        let options = StoreOptions {
            hub: crate::messages::HubLimits {
                mailbox_capacity: 1,
                ..Default::default()
            },
            ..StoreOptions::default()
        };
        let (_dir, store) = temp_store(options).await;
        let mut session = ReplayCoordinator::new(store.clone()).start("lobby", 0).unwrap();

        let idle = tokio::time::timeout(Duration::from_millis(250), session.next()).await;
        assert!(idle.is_err());

        store.append(append_req("lobby", "a", None)).await.unwrap();
        store.append(append_req("lobby", "b", None)).await.unwrap();

        assert_eq!(session.next().await.unwrap().offset, 1);
        let err = session.next().await.unwrap_err();
        assert!(matches!(
            err,
            LogError::SubscriptionBroken { reason: BrokenReason::Lagged { capacity: 1 }, .. }
        ));
        assert!(matches!(
            session.next().await,
            Err(LogError::SubscriptionBroken { reason: BrokenReason::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn gap_in_live_feed_is_filled_from_storage() {
        let (dir, store) = seeded(1, StoreOptions::default()).await;
        let unpublished = reopen(&dir, StoreOptions::default()).await;
        let mut session = ReplayCoordinator::new(store.clone()).start("lobby", 0).unwrap();

        assert_eq!(session.next().await.unwrap().offset, 1);
        let idle = tokio::time::timeout(Duration::from_millis(250), session.next()).await;
        assert!(idle.is_err());

        unpublished.append(append_req("lobby", "m2", None)).await.unwrap();
        store.append(append_req("lobby", "m3", None)).await.unwrap();

        let second = session.next().await.unwrap();
        assert_eq!((second.offset, second.text.as_str()), (2, "m2"));
        assert_eq!(session.next().await.unwrap().offset, 3);

        store.append(append_req("lobby", "m4", None)).await.unwrap();
        assert_eq!(session.next().await.unwrap().offset, 4);
        assert_eq!(store.hub().subscriber_count("lobby"), 1);
    }

    #[tokio::test]
    async fn empty_room_is_rejected() {
        let (_dir, store) = temp_store(StoreOptions::default()).await;
        let coordinator = ReplayCoordinator::new(store);
        assert!(matches!(coordinator.start("", 0), Err(LogError::InvalidArgument(_))));
    }
}
