mod msg;
mod ws;

use axum::{Router, routing::{get, post}};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{room_id}/append", post(msg::append))
        .route("/{room_id}/messages", get(msg::list))
        .route("/{room_id}/next_offset", get(msg::next_offset))
        .route("/{room_id}/subscribe", get(ws::subscribe_ws))
        .route("/{room_id}/replay", get(ws::replay_ws))
}
