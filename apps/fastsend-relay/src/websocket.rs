use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::actor::RelayHandle;
use crate::peer::{generate_peer_id, Outbound};
use crate::server::AppState;

/// Upgrades `/api/connect` into a signaling socket.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Bridges one websocket to the relay task: frames go in as commands, and
/// the writer drains whatever the relay queues for this peer.
async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let peer_id = generate_peer_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    relay.open(peer_id, tx);
    info!(peer_id = %peer_id, "websocket connected");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }
        debug!(peer_id = %peer_id, "writer task finished");
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => relay.text(peer_id, text),
                    Some(Ok(Message::Binary(data))) => relay.binary(peer_id, data),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            peer_id = %peer_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(peer_id = %peer_id, error = %err, "error receiving message");
                        relay.error(peer_id, err.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    relay.close(peer_id);
    writer.abort();
    info!(peer_id = %peer_id, "websocket disconnected");
}
