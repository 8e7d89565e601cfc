use axum::{Json, debug_handler, extract::{Path, Query, State}};
use serde::{Deserialize, Serialize};

use crate::{
    AppResult,
    db::Message,
    messages::{AppendRequest, MessageStore},
};

#[derive(Deserialize)]
pub(crate) struct AppendBody {
    user_id: String,
    text: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct AppendResponse {
    success: bool,
    offset: i64,
    is_new: bool,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn append(
    Path(room_id): Path<String>,
    State(store): State<MessageStore>,
    Json(AppendBody { user_id, text, idempotency_key }): Json<AppendBody>,
) -> AppResult<Json<AppendResponse>> {
    let appended = store
        .append(AppendRequest {
            room_id,
            user_id,
            text,
            idempotency_key,
        })
        .await?;

    Ok(Json(AppendResponse {
        success: true,
        offset: appended.offset,
        is_new: appended.is_new,
    }))
}

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    from_offset: i64,
    #[serde(default)]
    limit: i64,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list(
    Path(room_id): Path<String>,
    State(store): State<MessageStore>,
    Query(ListQuery { from_offset, limit }): Query<ListQuery>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(store.list(&room_id, from_offset, limit).await?))
}

#[derive(Serialize)]
pub(crate) struct NextOffsetResponse {
    value: i64,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn next_offset(
    Path(room_id): Path<String>,
    State(store): State<MessageStore>,
) -> AppResult<Json<NextOffsetResponse>> {
    Ok(Json(NextOffsetResponse {
        value: store.next_offset(&room_id).await?,
    }))
}
