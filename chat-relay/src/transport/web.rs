use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{select, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    codec,
    message::ServerEvent,
    relay::{Connection, Flow, Inbound, Relay},
    session::{CloseSignal, Session, TransportKind, with_idle_timeout},
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Routes accepting the browser client's web-socket upgrade. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

async fn ws_handler(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_socket(socket, relay, peer).await {
            warn!(peer = %peer, error = ?err, "web-socket session closed with error");
        }
    })
}

/// Drives one browser connection from upgrade to close.
pub async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, peer: SocketAddr) -> Result<()> {
    let (sink, mut stream) = socket.split();

    let Connection {
        mut session,
        outbound,
    } = relay.on_connect(TransportKind::WebFrame, Some(peer)).await;
    let writer_task = tokio::spawn(write_loop(sink, outbound, session.close_signal()));

    let result = read_loop(&relay, &mut session, &mut stream).await;
    relay.on_disconnect(&mut session).await;
    writer_task
        .await
        .context("web-socket writer task panicked")?;

    result
}

async fn read_loop(
    relay: &Relay,
    session: &mut Session,
    stream: &mut SplitStream<WebSocket>,
) -> Result<()> {
    let close = session.close_signal();
    let idle = relay.config().idle_timeout;

    loop {
        let next = select! {
            _ = close.triggered() => return Ok(()),
            next = with_idle_timeout(idle, stream.next()) => next,
        };

        let message = match next {
            Some(Some(message)) => message.context("web-socket read failed")?,
            Some(None) => return Ok(()),
            None => {
                info!(session = session.id(), "closing idle session");
                return Ok(());
            }
        };

        match message {
            Message::Text(text) => {
                if relay.on_inbound(session, Inbound::Web(&text)).await == Flow::Close {
                    return Ok(());
                }
            }
            Message::Close(_) => return Ok(()),
            // Pings are answered by axum itself.
            _ => debug!(session = session.id(), "ignoring non-text frame"),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerEvent>,
    close: CloseSignal,
) {
    loop {
        let event = select! {
            biased;
            event = outbound.recv() => event,
            _ = close.triggered() => None,
        };
        let Some(event) = event else {
            break;
        };

        let payload = match codec::encode_web(&event) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(err) => {
                warn!(?err, "failed to encode frame");
                continue;
            }
        };
        let sent = select! {
            biased;
            sent = sink.send(Message::Text(payload.into())) => sent,
            _ = close.triggered() => break,
        };
        if let Err(err) = sent {
            debug!(?err, "failed to deliver message to client");
            close.trigger();
            break;
        }
    }

    match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
        Ok(Err(err)) => debug!(?err, "failed to close web-socket cleanly"),
        Err(_) => debug!("timed out closing web-socket"),
        Ok(Ok(())) => {}
    }
}
