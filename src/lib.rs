pub mod appresult;
pub mod config;
pub mod db;
pub mod error;
pub mod messages;
pub mod rooms;

use axum::{Router, extract::FromRef};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use db::Message;
pub use error::{BrokenReason, LogError, LogResult};
pub use messages::{MessageStore, ReplayCoordinator, StoreOptions};

#[derive(Clone, Debug, FromRef)]
pub struct AppState {
    pub store: MessageStore,
    pub replay: ReplayCoordinator,
}

impl AppState {
    pub fn new(store: MessageStore) -> Self {
        Self {
            replay: ReplayCoordinator::new(store.clone()),
            store,
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .nest("/r", rooms::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
