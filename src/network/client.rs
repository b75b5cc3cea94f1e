//! Leader Client
//!
//! TCP transport from a follower to its leader. Keeps a small pool of idle
//! connections so concurrent workers each get their own stream, and drops
//! any connection whose exchange failed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};
use crate::sync::remote::LeaderTransport;

/// Idle connections kept per transport
const DEFAULT_MAX_IDLE: usize = 16;

/// Request/response transport over pooled TCP connections
pub struct TcpLeaderTransport {
    address: String,
    idle: Mutex<Vec<TcpStream>>,
    max_idle: usize,
    connect_timeout: Duration,
    compress: bool,
}

impl TcpLeaderTransport {
    pub fn new(address: impl Into<String>, connect_timeout: Duration, compress: bool) -> Self {
        Self {
            address: address.into(),
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
            connect_timeout,
            compress,
        }
    }

    /// Cap the number of idle connections kept between requests
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the leader
    async fn connect(&self) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!("Connected to leader at {}", self.address);
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout(format!("connecting to {}", self.address))),
        }
    }

    /// Take an idle connection, or open a new one
    async fn checkout(&self) -> Result<TcpStream> {
        let pooled = self.idle.lock().await.pop();
        match pooled {
            Some(stream) => Ok(stream),
            None => self.connect().await,
        }
    }

    async fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(stream);
        }
    }

    /// Number of idle pooled connections
    pub async fn idle_connections(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.idle.lock().await.clear();
    }
}

#[async_trait]
impl LeaderTransport for TcpLeaderTransport {
    async fn request(&self, message: Message) -> Result<Message> {
        let mut stream = self.checkout().await?;

        let (mut reader, mut writer) = stream.split();
        write_message(&mut writer, &message, self.compress).await?;
        let response = read_message(&mut reader).await?;

        // Only a connection that completed a full exchange goes back to the pool
        self.checkin(stream).await;
        Ok(response)
    }
}
