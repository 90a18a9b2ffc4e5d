use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
};
use tracing::{info, warn};

use crate::{
    relay::{Relay, RelayConfig},
    transport::{raw, web},
};

/// Both listeners plus the relay they feed. Raw-stream and web-socket
/// sessions share one registry, so chat crosses between the two.
pub struct Server {
    raw_listener: TcpListener,
    web_listener: TcpListener,
    relay: Arc<Relay>,
}

impl Server {
    pub fn new(raw_listener: TcpListener, web_listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            raw_listener,
            web_listener,
            relay: Arc::new(Relay::new(config)),
        }
    }

    pub async fn bind(raw_addr: SocketAddr, web_addr: SocketAddr, config: RelayConfig) -> Result<Self> {
        let raw_listener = TcpListener::bind(raw_addr)
            .await
            .with_context(|| format!("failed to bind raw-stream listener on {raw_addr}"))?;
        let web_listener = TcpListener::bind(web_addr)
            .await
            .with_context(|| format!("failed to bind web-socket listener on {web_addr}"))?;
        Ok(Self::new(raw_listener, web_listener, config))
    }

    pub fn raw_addr(&self) -> std::io::Result<SocketAddr> {
        self.raw_listener.local_addr()
    }

    pub fn web_addr(&self) -> std::io::Result<SocketAddr> {
        self.web_listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            raw_listener,
            web_listener,
            relay,
        } = self;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let app = web::router(Arc::clone(&relay)).into_make_service_with_connect_info::<SocketAddr>();
        let mut web_server = tokio::spawn(async move {
            axum::serve(web_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                })
                .await
        });
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = raw_listener.accept() => {
                    handle_accept_result(accept_result, &relay);
                }
                joined = &mut web_server => {
                    relay.shutdown().await;
                    joined
                        .context("web-socket server task panicked")?
                        .context("web-socket server stopped")?;
                    return Ok(());
                }
            }
        }

        relay.shutdown().await;
        let _ = stop_tx.send(true);
        web_server
            .await
            .context("web-socket server task panicked")?
            .context("web-socket server failed")?;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, relay: &Arc<Relay>) {
    match result {
        Ok((stream, peer)) => spawn_raw_handler(stream, peer, relay),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_raw_handler(stream: TcpStream, peer: SocketAddr, relay: &Arc<Relay>) {
    let relay = Arc::clone(relay);
    tokio::spawn(async move {
        info!(peer = %peer, "raw-stream client connected");
        if let Err(err) = raw::handle_connection(stream, relay).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
