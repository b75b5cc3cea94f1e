//! Leader Server
//!
//! TCP server answering sync requests from followers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, LeaderService};
use crate::error::{Error, Result};

/// TCP front end of a [`LeaderService`]
pub struct LeaderServer {
    listener: TcpListener,
    service: Arc<LeaderService>,
    /// Compress large responses
    compress: bool,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl LeaderServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str, service: Arc<LeaderService>, compress: bool) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            service,
            compress,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until [`LeaderServer::stop`] is called
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "Leader {} listening on {}",
            self.service.server_id(),
            self.local_addr()?
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let service = Arc::clone(&self.service);
                            let compress = self.compress;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, service, compress).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Leader server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve requests on one connection until the peer hangs up
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    service: Arc<LeaderService>,
    compress: bool,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        tracing::trace!("Received {} from {}", request.type_name(), peer_addr);

        let service = Arc::clone(&service);
        let response = tokio::task::spawn_blocking(move || service.handle(request))
            .await
            .map_err(|e| Error::Internal(format!("request handler failed: {}", e)))?;

        write_message(&mut writer, &response, compress).await?;
    }

    Ok(())
}
