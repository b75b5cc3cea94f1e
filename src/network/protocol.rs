//! Sync Protocol
//!
//! Defines the wire protocol spoken between a follower and the leader it
//! synchronizes from. Every request gets exactly one response.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::inventory::{
    CollectionDescriptor, Document, KeyRange, KeyRevision, LeaderInfo, RangeSummary,
    TransferChunk,
};

/// Bodies at or above this size are LZ4 compressed when compression is on
pub const COMPRESSION_THRESHOLD: usize = 4096;

/// Largest frame body accepted from the wire
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const CODEC_RAW: u8 = 0;
const CODEC_LZ4: u8 = 1;

/// Protocol messages for follower/leader communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Handshake ==========
    /// Identify the leader and its protocol version
    ServerInfoRequest { protocol_version: u32 },

    ServerInfo(LeaderInfo),

    // ========== Inventory ==========
    ListDatabasesRequest,

    Databases(Vec<String>),

    /// Collections and indexes of one database
    InventoryRequest { database: String },

    Inventory(Vec<CollectionDescriptor>),

    // ========== Bulk transfer ==========
    /// Records with keys strictly after `after`, in key order
    ChunkRequest {
        database: String,
        collection: String,
        after: Option<String>,
        max_records: u32,
    },

    Chunk(TransferChunk),

    // ========== Range comparison ==========
    /// Checksums over at most `granularity` sub-ranges partitioning `range`
    RangeChecksumRequest {
        database: String,
        collection: String,
        range: KeyRange,
        granularity: u32,
    },

    RangeChecksums(Vec<RangeSummary>),

    /// Every `(key, revision)` inside `range`
    RangeKeysRequest {
        database: String,
        collection: String,
        range: KeyRange,
    },

    RangeKeys(Vec<KeyRevision>),

    /// Full records for the given keys; missing keys are omitted
    DocumentsRequest {
        database: String,
        collection: String,
        keys: Vec<String>,
    },

    Documents(Vec<Document>),

    // ========== Errors ==========
    Error { code: ErrorCode, message: String },
}

/// Error codes carried by `Message::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    /// Leader cannot serve right now, try again later
    Unavailable,
    Unauthorized,
    IncompatibleVersion,
    Internal,
}

impl Message {
    /// Build an error response from a local error
    pub fn error(err: &Error) -> Self {
        let code = match err {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::IncompatibleLeader { .. } => ErrorCode::IncompatibleVersion,
            Error::AuthenticationRejected(_) => ErrorCode::Unauthorized,
            e if e.is_retryable() => ErrorCode::Unavailable,
            _ => ErrorCode::Internal,
        };
        Message::Error {
            code,
            message: err.to_string(),
        }
    }

    /// Encode to a frame body: one codec byte followed by the bincode payload
    pub fn encode(&self, compress: bool) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut body = Vec::with_capacity(payload.len() + 1);
        if compress && payload.len() >= COMPRESSION_THRESHOLD {
            body.push(CODEC_LZ4);
            body.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));
        } else {
            body.push(CODEC_RAW);
            body.extend_from_slice(&payload);
        }
        Ok(body)
    }

    /// Decode a frame body produced by [`Message::encode`]
    pub fn decode(body: &[u8]) -> Result<Self> {
        let (codec, payload) = body
            .split_first()
            .ok_or_else(|| Error::Protocol("empty frame".into()))?;
        match *codec {
            CODEC_RAW => Ok(bincode::deserialize(payload)?),
            CODEC_LZ4 => {
                let raw = lz4_flex::decompress_size_prepended(payload)
                    .map_err(|e| Error::Protocol(format!("LZ4 decompression failed: {}", e)))?;
                Ok(bincode::deserialize(&raw)?)
            }
            other => Err(Error::Protocol(format!("unknown frame codec {}", other))),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ServerInfoRequest { .. } => "ServerInfoRequest",
            Message::ServerInfo(_) => "ServerInfo",
            Message::ListDatabasesRequest => "ListDatabasesRequest",
            Message::Databases(_) => "Databases",
            Message::InventoryRequest { .. } => "InventoryRequest",
            Message::Inventory(_) => "Inventory",
            Message::ChunkRequest { .. } => "ChunkRequest",
            Message::Chunk(_) => "Chunk",
            Message::RangeChecksumRequest { .. } => "RangeChecksumRequest",
            Message::RangeChecksums(_) => "RangeChecksums",
            Message::RangeKeysRequest { .. } => "RangeKeysRequest",
            Message::RangeKeys(_) => "RangeKeys",
            Message::DocumentsRequest { .. } => "DocumentsRequest",
            Message::Documents(_) => "Documents",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for network messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// CRC32 of the body
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_chunk() -> Message {
        let records = (0..200)
            .map(|i| Document::new(format!("k{:05}", i), i as u64, vec![b'x'; 64]))
            .collect();
        Message::Chunk(TransferChunk {
            records,
            marker: None,
            end_of_collection: true,
        })
    }

    #[test]
    fn test_compressed_frames_are_smaller() {
        let msg = big_chunk();
        let raw = msg.encode(false).unwrap();
        let packed = msg.encode(true).unwrap();

        assert_eq!(raw[0], CODEC_RAW);
        assert_eq!(packed[0], CODEC_LZ4);
        assert!(packed.len() < raw.len());

        match Message::decode(&packed).unwrap() {
            Message::Chunk(chunk) => assert_eq!(chunk.records.len(), 200),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_small_messages_stay_raw() {
        let body = Message::ListDatabasesRequest.encode(true).unwrap();
        assert_eq!(body[0], CODEC_RAW);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode(&[]), Err(Error::Protocol(_))));
        assert!(matches!(Message::decode(&[9, 1, 2]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_error_codes() {
        let not_found = Message::error(&Error::NotFound("collection shop/x".into()));
        assert!(matches!(not_found, Message::Error { code: ErrorCode::NotFound, .. }));

        let busy = Message::error(&Error::Timeout("storage".into()));
        assert!(matches!(busy, Message::Error { code: ErrorCode::Unavailable, .. }));
    }

    #[test]
    fn test_frame_header() {
        let header = FrameHeader::new(b"hello");
        let restored = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(restored.length, 5);
        assert_eq!(restored.checksum, header.checksum);
    }
}
