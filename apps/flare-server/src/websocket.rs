use std::borrow::Cow;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use crate::protocol::{CloseReason, Frame};
use crate::AppState;

/// Close frame reasons are capped at 123 bytes by RFC 6455.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// How long a finished connection waits for its writer to flush a queued
/// close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, mut outbound) = ConnectionHandle::new(ConnectionId::next());
    let connection_id = handle.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    debug!(connection_id = %connection_id, "websocket connected");

    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let (message, last) = match item {
                Outbound::Frame(Frame::Text(text)) => (Message::Text(text), false),
                Outbound::Frame(Frame::Binary(bytes)) => (Message::Binary(bytes), false),
                Outbound::Close(reason) => {
                    debug!(connection_id = %connection_id, reason = %reason, "sending close frame");
                    (Message::Close(Some(close_frame(&reason))), true)
                }
            };
            if ws_tx.send(message).await.is_err() || last {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let writer_finished = loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let Some(incoming) = incoming else {
                    break false;
                };
                let frame = match incoming {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
                    Ok(Message::Close(frame)) => {
                        debug!(
                            connection_id = %connection_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break false;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(connection_id = %connection_id, error = %err, "error receiving message");
                        break false;
                    }
                };
                if state.router.handle_frame(&handle, frame).is_err() {
                    break false;
                }
            }
            _ = &mut writer => break true,
        }
    };

    state.reconciler.on_disconnect(connection_id);
    drop(handle);

    if !writer_finished && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }

    debug!(connection_id = %connection_id, "websocket disconnected");
}

fn close_frame(reason: &CloseReason) -> CloseFrame<'static> {
    CloseFrame {
        code: reason.code,
        reason: Cow::Owned(truncate_reason(&reason.detail).to_string()),
    }
}

fn truncate_reason(detail: &str) -> &str {
    if detail.len() <= MAX_CLOSE_REASON_BYTES {
        return detail;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    &detail[..end]
}
