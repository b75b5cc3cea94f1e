//! State Management Module
//!
//! Handles persistent sync state: per-collection checkpoints and the
//! history of finished runs.

mod checkpoint;

pub use checkpoint::{Checkpoint, CheckpointStore, CollectionPhase, RunRecord};
