use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

/// A committed chat message. Never mutated once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub room_id: String,
    pub user_id: String,
    pub text: String,
    pub offset: i64,
    pub ts_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

pub(crate) type MessageRow = (String, String, String, i64, i64, Option<String>);

impl From<MessageRow> for Message {
    fn from((room_id, user_id, text, offset, ts_ms, idempotency_key): MessageRow) -> Self {
        Self {
            room_id,
            user_id,
            text,
            offset,
            ts_ms,
            idempotency_key,
        }
    }
}

// unique: room_id, room_offset
// unique: room_id, idempotency_key (NULL keys never collide)
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        room_id TEXT NOT NULL,
        room_offset INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        text TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        idempotency_key TEXT,
        PRIMARY KEY (room_id, room_offset),
        UNIQUE (room_id, idempotency_key)
    )",
];

pub(crate) async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
}

pub(crate) async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    Ok(())
}
