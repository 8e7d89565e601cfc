//! Durable per-room append-only log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::db::{self, Message, MessageRow};
use crate::error::{LogError, LogResult, validate_room};

use super::hub::{HubLimits, Subscription, SubscriptionHub};

#[derive(Clone, Debug, Default)]
pub struct AppendRequest {
    pub room_id: String,
    pub user_id: String,
    pub text: String,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Appended {
    pub offset: i64,
    pub is_new: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOptions {
    pub max_connections: u32,
    /// Cap applied to `list` when the caller passes `limit <= 0`.
    pub list_default_limit: i64,
    pub hub: HubLimits,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 16,
            list_default_limit: 100,
            hub: HubLimits::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessageStore {
    db_pool: SqlitePool,
    hub: SubscriptionHub,
    room_locks: Arc<RoomLocks>,
    list_default_limit: i64,
}

/// One async mutex per room; appends to different rooms never share one.
/// Entries live only while someone holds or waits on them.
#[derive(Debug, Default)]
struct RoomLocks(Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>);

impl RoomLocks {
    async fn acquire(self: &Arc<Self>, room_id: &str) -> RoomGuard {
        let room_lock = Arc::clone(self.entries().entry(room_id.to_owned()).or_default());
        RoomGuard {
            guard: Some(room_lock.lock_owned().await),
            locks: Arc::clone(self),
            room_id: room_id.to_owned(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clones are only handed out under the map lock, so a count of one
    /// here means nobody else holds or waits on the room.
    fn prune(&self, room_id: &str) {
        let mut entries = self.entries();
        if entries.get(room_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            entries.remove(room_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries().len()
    }
}

struct RoomGuard {
    locks: Arc<RoomLocks>,
    room_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.room_id);
    }
}

const SELECT_MESSAGE: &str =
    "SELECT room_id,user_id,text,room_offset,ts_ms,idempotency_key FROM messages";

impl MessageStore {
    pub async fn open(database_url: &str, options: StoreOptions) -> LogResult<Self> {
        let db_pool = db::connect(database_url, options.max_connections).await?;
        Self::from_pool(db_pool, options).await
    }

    pub async fn from_pool(db_pool: SqlitePool, options: StoreOptions) -> LogResult<Self> {
        db::migrate(&db_pool).await?;
        Ok(Self {
            db_pool,
            hub: SubscriptionHub::new(options.hub),
            room_locks: Arc::default(),
            list_default_limit: options.list_default_limit.max(1),
        })
    }

    /// Closes the connection pool. Later storage calls fail with a retryable
    /// `Storage` error; live subscriptions are unaffected.
    pub async fn close(&self) {
        self.db_pool.close().await;
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn list_default_limit(&self) -> i64 {
        self.list_default_limit
    }

    /// Appends a message, or returns the existing offset for a repeated
    /// idempotency key.
    ///
    /// The dedup check, offset assignment, insert and publish all run under
    /// the room's lock, so subscribers see rooms in commit order. They run on
    /// a detached task: dropping this future cannot leave a committed row
    /// unpublished.
    pub async fn append(&self, req: AppendRequest) -> LogResult<Appended> {
        validate_room(&req.room_id)?;
        let store = self.clone();
        match tokio::spawn(async move { store.commit_and_publish(req).await }).await {
            Ok(appended) => appended,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(err.into()),
        }
    }

    async fn commit_and_publish(&self, req: AppendRequest) -> LogResult<Appended> {
        let AppendRequest {
            room_id,
            user_id,
            text,
            idempotency_key,
        } = req;
        let idempotency_key = idempotency_key.filter(|key| !key.is_empty());

        let _guard = self.room_locks.acquire(&room_id).await;

        if let Some(key) = &idempotency_key {
            if let Some(offset) = self.find_by_key(&room_id, key).await? {
                debug!(room_id = %room_id, offset, "duplicate append");
                return Ok(Appended { offset, is_new: false });
            }
        }

        let ts_ms = now_ms();
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO messages (room_id,room_offset,user_id,text,ts_ms,idempotency_key) \
             SELECT ?, COALESCE(MAX(room_offset),0)+1, ?, ?, ?, ? FROM messages WHERE room_id=? \
             ON CONFLICT (room_id,idempotency_key) DO NOTHING \
             RETURNING room_offset",
        )
        .bind(&room_id)
        .bind(&user_id)
        .bind(&text)
        .bind(ts_ms)
        .bind(&idempotency_key)
        .bind(&room_id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some((offset,)) = inserted else {
            // Only reachable when another process sharing the file won the key.
            let existing = match &idempotency_key {
                Some(key) => self.find_by_key(&room_id, key).await?,
                None => None,
            };
            return lost_key_race(&room_id, existing);
        };

        let message = Message {
            room_id,
            user_id,
            text,
            offset,
            ts_ms,
            idempotency_key,
        };
        debug!(room_id = %message.room_id, offset, "appended");
        self.hub.publish(&message.room_id, &message).await;

        Ok(Appended { offset, is_new: true })
    }

    /// Messages with `offset >= from_offset`, ascending, at most `limit`.
    pub async fn list(&self, room_id: &str, from_offset: i64, limit: i64) -> LogResult<Vec<Message>> {
        validate_room(room_id)?;
        let limit = if limit <= 0 { self.list_default_limit } else { limit };

        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{SELECT_MESSAGE} WHERE room_id=? AND room_offset>=? ORDER BY room_offset ASC LIMIT ?"
        ))
        .bind(room_id)
        .bind(from_offset)
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    /// The high-water mark: the offset the next append to `room_id` would get.
    pub async fn next_offset(&self, room_id: &str) -> LogResult<i64> {
        validate_room(room_id)?;
        let (max,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(room_offset),0) FROM messages WHERE room_id=?")
                .bind(room_id)
                .fetch_one(&self.db_pool)
                .await?;
        Ok(max + 1)
    }

    pub fn subscribe(&self, room_id: &str) -> LogResult<Subscription> {
        self.hub.subscribe(room_id)
    }

    async fn find_by_key(&self, room_id: &str, key: &str) -> LogResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT room_offset FROM messages WHERE room_id=? AND idempotency_key=?",
        )
        .bind(room_id)
        .bind(key)
        .fetch_optional(&self.db_pool)
        .await?;
        Ok(row.map(|(offset,)| offset))
    }
}

/// The insert was skipped on a key conflict, so the winning row must exist.
fn lost_key_race(room_id: &str, existing: Option<i64>) -> LogResult<Appended> {
    let Some(offset) = existing else {
        return Err(LogError::Storage(sqlx::Error::RowNotFound));
    };
    debug!(room_id, offset, "duplicate append");
    Ok(Appended { offset, is_new: false })
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
