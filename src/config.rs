use std::net::SocketAddr;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::messages::{HubLimits, OverflowPolicy, StoreOptions};

/// Runtime configuration. Every flag falls back to an environment variable,
/// and `.env` is loaded before parsing.
#[derive(Clone, Debug, Parser)]
#[command(name = "roomlog", about = "Per-room chat message log with live fanout and replay")]
pub struct Config {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://roomlog.db")]
    pub database_url: String,

    #[arg(long, env = "ROOMLOG_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    #[arg(long, env = "ROOMLOG_MAX_CONNECTIONS", default_value_t = 16)]
    pub max_connections: u32,

    /// Messages buffered per live subscriber before the overflow policy applies.
    #[arg(long, env = "ROOMLOG_MAILBOX_CAPACITY", default_value_t = 256)]
    pub mailbox_capacity: usize,

    #[arg(long, env = "ROOMLOG_OVERFLOW_POLICY", value_enum, default_value_t = OverflowPolicy::DropSubscriber)]
    pub overflow_policy: OverflowPolicy,

    /// Page size used when a list request passes `limit <= 0`.
    #[arg(long, env = "ROOMLOG_LIST_DEFAULT_LIMIT", default_value_t = 100)]
    pub list_default_limit: i64,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, env = "ROOMLOG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn env_filter(&self) -> EnvFilter {
        let default_level = self.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);

        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy()
        })
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            list_default_limit: config.list_default_limit,
            hub: HubLimits {
                mailbox_capacity: config.mailbox_capacity,
                overflow_policy: config.overflow_policy,
            },
        }
    }
}
