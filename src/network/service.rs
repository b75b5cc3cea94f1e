//! Leader Service
//!
//! Answers sync requests from a local storage engine. Shared by the TCP
//! server and the in-process transport.

use crate::error::{Error, Result};
use crate::inventory::{split_range, ChunkMarker, LeaderInfo, TransferChunk, PROTOCOL_VERSION};
use crate::storage::SharedStorage;

use super::protocol::{ErrorCode, Message};

/// Request handler for the leader side of a sync
pub struct LeaderService {
    server_id: String,
    storage: SharedStorage,
}

impl LeaderService {
    pub fn new(server_id: impl Into<String>, storage: SharedStorage) -> Self {
        Self {
            server_id: server_id.into(),
            storage,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Handle one request. Blocks on storage.
    pub fn handle(&self, request: Message) -> Message {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Request failed: {}", e);
                Message::error(&e)
            }
        }
    }

    fn dispatch(&self, request: Message) -> Result<Message> {
        match request {
            Message::ServerInfoRequest { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Ok(Message::Error {
                        code: ErrorCode::IncompatibleVersion,
                        message: format!(
                            "leader speaks protocol {}, follower sent {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    });
                }
                Ok(Message::ServerInfo(LeaderInfo {
                    server_id: self.server_id.clone(),
                    protocol_version: PROTOCOL_VERSION,
                }))
            }

            Message::ListDatabasesRequest => Ok(Message::Databases(self.storage.list_databases()?)),

            Message::InventoryRequest { database } => {
                Ok(Message::Inventory(self.storage.list_collections(&database)?))
            }

            Message::ChunkRequest {
                database,
                collection,
                after,
                max_records,
            } => {
                let max = max_records.max(1) as usize;
                // One extra record tells us whether anything follows
                let mut records =
                    self.storage
                        .read_after(&database, &collection, after.as_deref(), max + 1)?;
                let end_of_collection = records.len() <= max;
                records.truncate(max);

                let marker = match records.last() {
                    Some(doc) => Some(ChunkMarker {
                        key: doc.key.clone(),
                        revision: doc.revision,
                    }),
                    None => after.map(|key| ChunkMarker { key, revision: 0 }),
                };
                Ok(Message::Chunk(TransferChunk {
                    records,
                    marker,
                    end_of_collection,
                }))
            }

            Message::RangeChecksumRequest {
                database,
                collection,
                range,
                granularity,
            } => {
                let entries = self.storage.key_revisions(&database, &collection, &range)?;
                Ok(Message::RangeChecksums(split_range(
                    &entries,
                    &range,
                    granularity.max(2) as usize,
                )))
            }

            Message::RangeKeysRequest {
                database,
                collection,
                range,
            } => Ok(Message::RangeKeys(
                self.storage.key_revisions(&database, &collection, &range)?,
            )),

            Message::DocumentsRequest {
                database,
                collection,
                keys,
            } => Ok(Message::Documents(
                self.storage.read_documents(&database, &collection, &keys)?,
            )),

            other => Err(Error::Protocol(format!(
                "{} is not a request",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{CollectionDescriptor, KeyRange};
    use crate::storage::{LocalStorage, MemoryStore};
    use std::sync::Arc;

    fn service(records: usize) -> LeaderService {
        let store = MemoryStore::new();
        store
            .create_collection("shop", &CollectionDescriptor::new("items", "c1"))
            .unwrap();
        for i in 0..records {
            store
                .insert("shop", "items", &format!("k{:03}", i), b"{}")
                .unwrap();
        }
        LeaderService::new("leader-1", Arc::new(store))
    }

    fn chunk(service: &LeaderService, after: Option<&str>, max: u32) -> TransferChunk {
        match service.handle(Message::ChunkRequest {
            database: "shop".into(),
            collection: "items".into(),
            after: after.map(String::from),
            max_records: max,
        }) {
            Message::Chunk(chunk) => chunk,
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_chunks_walk_the_collection() {
        let service = service(25);

        let first = chunk(&service, None, 10);
        assert_eq!(first.records.len(), 10);
        assert!(!first.end_of_collection);
        assert_eq!(first.marker.as_ref().unwrap().key, "k009");

        let last = chunk(&service, Some("k019"), 10);
        assert_eq!(last.records.len(), 5);
        assert!(last.end_of_collection);

        // Exactly divisible: the final full chunk already reports the end
        let exact = chunk(&service, Some("k014"), 10);
        assert_eq!(exact.records.len(), 10);
        assert!(exact.end_of_collection);
    }

    #[test]
    fn test_empty_chunk_echoes_marker() {
        let service = service(3);
        let past_end = chunk(&service, Some("k002"), 10);
        assert!(past_end.records.is_empty());
        assert!(past_end.end_of_collection);
        assert_eq!(past_end.marker.unwrap().key, "k002");
    }

    #[test]
    fn test_handshake_checks_version() {
        let service = service(0);
        assert!(matches!(
            service.handle(Message::ServerInfoRequest {
                protocol_version: PROTOCOL_VERSION
            }),
            Message::ServerInfo(_)
        ));
        assert!(matches!(
            service.handle(Message::ServerInfoRequest {
                protocol_version: PROTOCOL_VERSION + 1
            }),
            Message::Error {
                code: ErrorCode::IncompatibleVersion,
                ..
            }
        ));
    }

    #[test]
    fn test_range_checksums_and_missing_collection() {
        let service = service(40);
        match service.handle(Message::RangeChecksumRequest {
            database: "shop".into(),
            collection: "items".into(),
            range: KeyRange::full(),
            granularity: 4,
        }) {
            Message::RangeChecksums(summaries) => {
                assert_eq!(summaries.len(), 4);
                assert_eq!(summaries.iter().map(|s| s.count).sum::<u64>(), 40);
            }
            other => panic!("unexpected {}", other.type_name()),
        }

        assert!(matches!(
            service.handle(Message::InventoryRequest {
                database: "nope".into()
            }),
            Message::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }
}
