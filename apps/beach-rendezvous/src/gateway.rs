use std::{borrow::Cow, net::SocketAddr, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitStream, Sink, SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, Outbound},
    router::{MessageRouter, RouteOutcome},
    state::RelayState,
};

/// How long cleanup waits for the writer to flush a queued close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    PeerClosed,
    EndOfStream,
    /// Receive failed, e.g. an over-limit message; the write half may still work.
    ReceiveError,
    Shutdown,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    ws.max_message_size(state.config().max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, Some(remote_addr)))
}

/// Run one relayed connection from upgrade to cleanup.
pub async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: Option<SocketAddr>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (connection, outbound) = Connection::open(remote_addr);
    let connection_id = connection.id();

    counter!("rendezvous_connections_total", 1);
    let _active = state.track_connection();
    info!(
        connection_id = %connection_id,
        remote_addr = ?remote_addr,
        "websocket connection established"
    );

    let mut writer = tokio::spawn(run_writer(ws_tx, outbound, connection.clone()));
    let mut router = MessageRouter::new(state.registry().clone(), connection);

    let exit = receive_loop(&mut ws_rx, &mut router, &state).await;
    if matches!(exit, LoopExit::PeerClosed | LoopExit::EndOfStream) {
        // the socket is already finished on the peer's side
        router.connection().begin_close();
    }

    let peer_id = router.identity().map(str::to_owned);
    let close_queued = router.close();
    if close_queued {
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await;
    }
    writer.abort();
    drop(router);

    info!(
        connection_id = %connection_id,
        peer_id = ?peer_id,
        reason = ?exit,
        "websocket connection closed"
    );
}

async fn receive_loop(
    ws_rx: &mut SplitStream<WebSocket>,
    router: &mut MessageRouter,
    state: &RelayState,
) -> LoopExit {
    let mut shutdown = state.shutdown_signal();
    let connection_id = router.connection().id();
    if *shutdown.borrow() {
        return LoopExit::Shutdown;
    }

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return LoopExit::Shutdown,
            frame = ws_rx.next() => frame,
        };

        let message = match frame {
            None => return LoopExit::EndOfStream,
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "websocket receive error"
                );
                return LoopExit::ReceiveError;
            }
        };

        let outcome = match message {
            Message::Text(text) => router.handle_text(&text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => router.handle_text(&text),
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                return LoopExit::PeerClosed;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        record_outcome(&outcome);
    }
}

fn record_outcome(outcome: &RouteOutcome) {
    counter!(
        "rendezvous_messages_total",
        1,
        "outcome" => outcome.metric_label()
    );
}

/// Sole owner of the socket's write half; drains the outbound queue so
/// frames to one peer are written strictly one after another.
async fn run_writer<S>(
    mut ws_tx: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connection: Connection,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(err) = ws_tx.send(Message::Text(text)).await {
                    warn!(
                        connection_id = %connection.id(),
                        error = %err,
                        "failed to write to websocket"
                    );
                    connection.begin_close();
                    break;
                }
            }
            Outbound::Close => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Cow::Borrowed("Closing"),
                }));
                if let Err(err) = ws_tx.send(close).await {
                    debug!(
                        connection_id = %connection.id(),
                        error = %err,
                        "failed to send close frame"
                    );
                }
                break;
            }
        }
    }
    debug!(connection_id = %connection.id(), "writer task finished");
}
