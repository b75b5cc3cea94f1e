//! Test fixtures: populated leader stores, an instrumented transport, and
//! sync contexts wired to temporary checkpoint directories.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::inventory::CollectionDescriptor;
use crate::network::{LeaderService, Message};
use crate::state::CheckpointStore;
use crate::storage::{LocalStorage, MemoryStore, SharedStorage};
use crate::sync::{
    CancellationToken, LeaderTransport, LocalTransport, RemoteInventoryClient, RetryPolicy,
    SyncContext,
};

/// Key of the `i`-th generated record
pub fn key(i: usize) -> String {
    format!("k{:05}", i)
}

/// Leader store holding `(database, collection, records)` collections
pub fn leader_with(collections: &[(&str, &str, usize)]) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for (database, collection, records) in collections {
        store.create_database(database).unwrap();
        store
            .create_collection(
                database,
                &CollectionDescriptor::new(*collection, format!("{}-{}", database, collection)),
            )
            .unwrap();
        for i in 0..*records {
            let body = format!("{{\"n\":{}}}", i);
            store
                .insert(database, collection, &key(i), body.as_bytes())
                .unwrap();
        }
    }
    Arc::new(store)
}

/// Create every collection of `database` from `leader` on `follower`, empty
pub fn mirror_schema(leader: &MemoryStore, follower: &MemoryStore, database: &str) {
    follower.create_database(database).unwrap();
    for mut descriptor in leader.list_collections(database).unwrap() {
        descriptor.revision = None;
        follower.create_collection(database, &descriptor).unwrap();
    }
}

/// Retry policy with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        multiplier: 2.0,
        jitter: false,
    }
}

/// Sync settings with a given chunk size and fixed concurrency
pub fn settings(chunk_size: usize) -> SyncConfig {
    SyncConfig {
        chunk_size,
        checksum_granularity: 4,
        checksum_leaf_size: 8,
        collection_concurrency: 2,
        ..SyncConfig::default()
    }
}

/// In-process transport that records requests and can inject failures
pub struct InstrumentedTransport {
    inner: LocalTransport,
    requests: Mutex<Vec<Message>>,
    /// Fail this many upcoming requests with a transient error
    fail_next: AtomicU32,
    /// Chunk request attempts (0-based) that fail once with a transient error
    fail_chunk_attempts: Mutex<HashSet<usize>>,
    chunk_attempts: AtomicUsize,
    chunks_served: AtomicUsize,
    /// Cancel the token once this many chunks have been served
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    /// Rewrite the handshake to report this protocol version
    version_override: Mutex<Option<u32>>,
    /// Hold the next request this long before answering
    stall_next: Mutex<Option<Duration>>,
}

impl InstrumentedTransport {
    pub fn new(leader: SharedStorage) -> Self {
        let service = Arc::new(LeaderService::new("leader-test", leader));
        Self {
            inner: LocalTransport::new(service),
            requests: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            fail_chunk_attempts: Mutex::new(HashSet::new()),
            chunk_attempts: AtomicUsize::new(0),
            chunks_served: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
            version_override: Mutex::new(None),
            stall_next: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_chunk_attempt(&self, attempt: usize) {
        self.fail_chunk_attempts.lock().unwrap().insert(attempt);
    }

    pub fn cancel_after_chunks(&self, chunks: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((chunks, token));
    }

    pub fn stall_next(&self, delay: Duration) {
        *self.stall_next.lock().unwrap() = Some(delay);
    }

    pub fn report_version(&self, version: u32) {
        *self.version_override.lock().unwrap() = Some(version);
    }

    /// Number of recorded requests of the given type
    pub fn count(&self, type_name: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.type_name() == type_name)
            .count()
    }

    /// `after` markers of every chunk request, including failed attempts
    pub fn chunk_afters(&self, collection: &str) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::ChunkRequest {
                    collection: c,
                    after,
                    ..
                } if c == collection => Some(after.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LeaderTransport for InstrumentedTransport {
    async fn request(&self, message: Message) -> Result<Message> {
        let is_chunk = matches!(message, Message::ChunkRequest { .. });
        self.requests.lock().unwrap().push(message.clone());

        let stall = self.stall_next.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Network("injected connection reset".into()));
        }

        if is_chunk {
            let attempt = self.chunk_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_chunk_attempts.lock().unwrap().remove(&attempt) {
                return Err(Error::Network("injected connection reset".into()));
            }
        }

        let mut response = self.inner.request(message).await?;

        if let Message::ServerInfo(info) = &mut response {
            if let Some(version) = *self.version_override.lock().unwrap() {
                info.protocol_version = version;
            }
        }

        if is_chunk {
            let served = self.chunks_served.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((n, token)) = &*self.cancel_after.lock().unwrap() {
                if served == *n {
                    token.cancel();
                }
            }
        }

        Ok(response)
    }
}

/// Sync context over an instrumented transport, checkpoints under `dir`
pub fn context(
    dir: &Path,
    transport: Arc<InstrumentedTransport>,
    follower: SharedStorage,
    settings: SyncConfig,
) -> SyncContext {
    let client = RemoteInventoryClient::new(transport, fast_retry(), Duration::from_secs(5));
    let checkpoints = Arc::new(CheckpointStore::open(dir).unwrap());
    SyncContext::new(client, follower, checkpoints, settings)
}
