//! Remote Inventory Client
//!
//! Typed access to the leader's inventory and data protocol. Every call is
//! bounded by the request timeout and retried per the retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::cancel::{ensure_active, CancellationToken};
use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::inventory::{
    DatabaseInventory, Document, KeyRange, KeyRevision, LeaderInfo, RangeSummary, TransferChunk,
    PROTOCOL_VERSION,
};
use crate::network::{ErrorCode, LeaderService, Message};

/// One request, one response
#[async_trait]
pub trait LeaderTransport: Send + Sync {
    async fn request(&self, message: Message) -> Result<Message>;
}

/// Transport calling a [`LeaderService`] in the same process
pub struct LocalTransport {
    service: Arc<LeaderService>,
}

impl LocalTransport {
    pub fn new(service: Arc<LeaderService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl LeaderTransport for LocalTransport {
    async fn request(&self, message: Message) -> Result<Message> {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || service.handle(message))
            .await
            .map_err(|e| Error::Internal(format!("leader service failed: {}", e)))
    }
}

/// Client for the leader's inventory and data protocol
#[derive(Clone)]
pub struct RemoteInventoryClient {
    transport: Arc<dyn LeaderTransport>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl RemoteInventoryClient {
    pub fn new(transport: Arc<dyn LeaderTransport>, retry: RetryPolicy, request_timeout: Duration) -> Self {
        Self {
            transport,
            retry,
            request_timeout,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Send one request with timeout and retries
    async fn call(&self, token: &CancellationToken, request: Message) -> Result<Message> {
        let what = request.type_name();
        self.retry
            .run(token, what, || {
                let request = request.clone();
                async move {
                    ensure_active(token)?;
                    let response = tokio::time::timeout(self.request_timeout, self.transport.request(request))
                        .await
                        .map_err(|_| Error::Timeout(format!("{} after {:?}", what, self.request_timeout)))??;
                    match response {
                        Message::Error { code, message } => Err(remote_error(code, message)),
                        other => Ok(other),
                    }
                }
            })
            .await
    }

    /// Handshake: identify the leader and check its protocol version
    pub async fn server_info(&self, token: &CancellationToken) -> Result<LeaderInfo> {
        match self
            .call(token, Message::ServerInfoRequest { protocol_version: PROTOCOL_VERSION })
            .await?
        {
            Message::ServerInfo(info) if info.protocol_version != PROTOCOL_VERSION => {
                Err(Error::IncompatibleLeader {
                    expected: PROTOCOL_VERSION,
                    actual: info.protocol_version,
                })
            }
            Message::ServerInfo(info) => Ok(info),
            other => Err(unexpected("ServerInfo", &other)),
        }
    }

    pub async fn list_databases(&self, token: &CancellationToken) -> Result<Vec<String>> {
        match self.call(token, Message::ListDatabasesRequest).await? {
            Message::Databases(databases) => Ok(databases),
            other => Err(unexpected("Databases", &other)),
        }
    }

    /// Schema snapshot of one database
    pub async fn inventory(&self, token: &CancellationToken, database: &str) -> Result<DatabaseInventory> {
        let request = Message::InventoryRequest {
            database: database.to_string(),
        };
        match self.call(token, request).await? {
            Message::Inventory(collections) => {
                Ok(DatabaseInventory::from_collections(database, collections))
            }
            other => Err(unexpected("Inventory", &other)),
        }
    }

    /// Next chunk of a collection after `after`
    pub async fn fetch_chunk(
        &self,
        token: &CancellationToken,
        database: &str,
        collection: &str,
        after: Option<&str>,
        max_records: usize,
    ) -> Result<TransferChunk> {
        let request = Message::ChunkRequest {
            database: database.to_string(),
            collection: collection.to_string(),
            after: after.map(String::from),
            max_records: max_records.min(u32::MAX as usize) as u32,
        };
        match self.call(token, request).await? {
            Message::Chunk(chunk) => Ok(chunk),
            other => Err(unexpected("Chunk", &other)),
        }
    }

    /// Checksums over sub-ranges of `range`
    pub async fn range_checksums(
        &self,
        token: &CancellationToken,
        database: &str,
        collection: &str,
        range: &KeyRange,
        granularity: usize,
    ) -> Result<Vec<RangeSummary>> {
        let request = Message::RangeChecksumRequest {
            database: database.to_string(),
            collection: collection.to_string(),
            range: range.clone(),
            granularity: granularity.min(u32::MAX as usize) as u32,
        };
        match self.call(token, request).await? {
            Message::RangeChecksums(summaries) => Ok(summaries),
            other => Err(unexpected("RangeChecksums", &other)),
        }
    }

    pub async fn range_keys(
        &self,
        token: &CancellationToken,
        database: &str,
        collection: &str,
        range: &KeyRange,
    ) -> Result<Vec<KeyRevision>> {
        let request = Message::RangeKeysRequest {
            database: database.to_string(),
            collection: collection.to_string(),
            range: range.clone(),
        };
        match self.call(token, request).await? {
            Message::RangeKeys(keys) => Ok(keys),
            other => Err(unexpected("RangeKeys", &other)),
        }
    }

    pub async fn fetch_documents(
        &self,
        token: &CancellationToken,
        database: &str,
        collection: &str,
        keys: Vec<String>,
    ) -> Result<Vec<Document>> {
        let request = Message::DocumentsRequest {
            database: database.to_string(),
            collection: collection.to_string(),
            keys,
        };
        match self.call(token, request).await? {
            Message::Documents(docs) => Ok(docs),
            other => Err(unexpected("Documents", &other)),
        }
    }
}

fn remote_error(code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::NotFound => Error::NotFound(message),
        ErrorCode::Unavailable => Error::LeaderUnavailable(message),
        ErrorCode::Unauthorized => Error::AuthenticationRejected(message),
        ErrorCode::IncompatibleVersion => Error::Protocol(format!("incompatible version: {}", message)),
        ErrorCode::Internal => Error::Remote(message),
    }
}

fn unexpected(expected: &str, got: &Message) -> Error {
    Error::Protocol(format!("expected {}, leader sent {}", expected, got.type_name()))
}
