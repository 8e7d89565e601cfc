use std::pin::pin;

use axum::{
    debug_handler,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, WebSocket, close_code},
    },
    response::Response,
};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::{
    AppResult,
    db::Message,
    error::{LogError, LogResult},
    messages::{MessageStore, ReplayCoordinator},
};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn subscribe_ws(
    Path(room_id): Path<String>,
    State(store): State<MessageStore>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let subscription = store.subscribe(&room_id)?;
    let span = info_span!("subscribe_ws", conn_id = %Uuid::now_v7(), room_id = %room_id);

    Ok(ws.on_upgrade(move |socket| forward(socket, subscription.into_stream()).instrument(span)))
}

#[derive(Deserialize)]
pub(crate) struct ReplayQuery {
    #[serde(default)]
    last_seen_offset: i64,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn replay_ws(
    Path(room_id): Path<String>,
    State(replay): State<ReplayCoordinator>,
    Query(ReplayQuery { last_seen_offset }): Query<ReplayQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let session = replay.start(&room_id, last_seen_offset)?;
    let span = info_span!("replay_ws", conn_id = %Uuid::now_v7(), room_id = %room_id, last_seen_offset);

    Ok(ws.on_upgrade(move |socket| forward(socket, session.into_stream()).instrument(span)))
}

/// Writes each message as a JSON text frame until the feed fails or the
/// client goes away. Returning drops the feed, which deregisters it.
async fn forward(socket: WebSocket, feed: impl Stream<Item = LogResult<Message>>) {
    let (mut sender, mut receiver) = socket.split();
    let mut feed = pin!(feed);
    debug!("connected");

    loop {
        tokio::select! {
            item = feed.next() => {
                let message = match item {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!(error = %err, "feed terminated");
                        let _ = sender
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: close_code::AGAIN,
                                reason: close_reason(&err).into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                };

                let Ok(frame) = serde_json::to_string(&message) else {
                    break;
                };
                if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("disconnected");
}

/// Close reasons must fit in 123 bytes, so the room id never goes in.
fn close_reason(err: &LogError) -> &'static str {
    match err {
        LogError::InvalidArgument(_) => "invalid argument",
        LogError::Storage(_) => "storage unavailable",
        LogError::SubscriptionBroken { .. } => "subscription broken",
        LogError::Interrupted(_) => "append interrupted",
    }
}
