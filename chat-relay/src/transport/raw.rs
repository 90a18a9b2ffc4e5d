use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info};

use crate::{
    codec,
    message::ServerEvent,
    relay::{Connection, Flow, Inbound, Relay},
    session::{CloseSignal, Session, TransportKind, with_idle_timeout},
};

/// Drives one terminal-client connection from accept to close.
pub async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();

    let Connection {
        mut session,
        outbound,
    } = relay.on_connect(TransportKind::RawStream, peer).await;
    let writer_task = tokio::spawn(write_loop(writer, outbound, session.close_signal()));

    let result = read_loop(&relay, &mut session, &mut reader).await;
    relay.on_disconnect(&mut session).await;
    writer_task
        .await
        .context("raw-stream writer task panicked")?;

    result
}

async fn read_loop(relay: &Relay, session: &mut Session, reader: &mut OwnedReadHalf) -> Result<()> {
    let close = session.close_signal();
    let idle = relay.config().idle_timeout;
    // Whatever one read returns is one unit; there is no delimiter to split on.
    let mut buffer = vec![0u8; relay.config().read_buffer_len()];

    loop {
        let read = select! {
            _ = close.triggered() => return Ok(()),
            read = with_idle_timeout(idle, reader.read(&mut buffer)) => read,
        };

        let bytes = match read {
            Some(result) => result.context("raw-stream read failed")?,
            None => {
                info!(session = session.id(), "closing idle session");
                return Ok(());
            }
        };
        if bytes == 0 {
            return Ok(());
        }

        if relay.on_inbound(session, Inbound::Raw(&buffer[..bytes])).await == Flow::Close {
            return Ok(());
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
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

        let payload = codec::encode_raw(&event);
        let written = select! {
            biased;
            written = writer.write_all(payload.as_bytes()) => written,
            _ = close.triggered() => break,
        };
        if let Err(err) = written {
            debug!(?err, "failed to deliver message to client");
            close.trigger();
            break;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(?err, "failed to shut down raw-stream writer");
    }
}
